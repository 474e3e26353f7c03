use core::fmt;

/// Errors returned by the mesh stack.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A frame was shorter than its fixed header.
    ///
    /// Such frames are dropped and counted; they carry no usable information.
    TooShort,

    /// A frame advertised a protocol version this crate does not implement.
    UnsupportedVersion,

    /// The packet type nibble did not name a known frame type.
    UnknownType,

    /// The `payload_length` header field disagreed with the actual frame length.
    PayloadLengthMismatch,

    /// Unexpectedly reached the end of a buffer while reading or writing data.
    ///
    /// This is returned when a payload does not fit into a frame or other fixed-size buffer, and
    /// also when reaching the end of input prematurely while decoding.
    Eof,

    /// Invalid value supplied for a field.
    InvalidValue,

    /// A fixed-capacity table or queue could not take another entry.
    CapacityExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::TooShort => "frame shorter than header",
            Error::UnsupportedVersion => "unsupported protocol version",
            Error::UnknownType => "unknown packet type",
            Error::PayloadLengthMismatch => "payload length field mismatch",
            Error::Eof => "end of buffer",
            Error::InvalidValue => "invalid value for field",
            Error::CapacityExceeded => "fixed-capacity storage exhausted",
        })
    }
}
