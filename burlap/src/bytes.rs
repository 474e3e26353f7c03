//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines zero-copy (de)serialization traits, [`ToBytes`] and [`FromBytes`], as well
//! as the helper structs [`ByteWriter`] and [`ByteReader`], which wrap a `&mut [u8]` or `&[u8]`
//! and offer useful utilities to read and write values.
//!
//! All types that end up getting transmitted over the air implement [`ToBytes`] and [`FromBytes`]:
//! the mesh packet header, and the sub-headers the link, group, bundle, emergency and geographic
//! layers embed in packet payloads. Everything on the wire is little-endian and unpadded.
//!
//! [`ToBytes`]: trait.ToBytes.html
//! [`FromBytes`]: trait.FromBytes.html
//! [`ByteWriter`]: struct.ByteWriter.html
//! [`ByteReader`]: struct.ByteReader.html

use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use core::mem;

/// Wrapper around a byte slice that can be used to encode data into bytes.
///
/// All `write_*` methods on this type will return `Error::Eof` when the underlying buffer slice is
/// full.
pub struct ByteWriter<'a>(&'a mut [u8]);

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter(buf)
    }

    /// Consumes `self` and returns the part of the contained buffer that has not yet been written
    /// to.
    pub fn into_rest(self) -> &'a mut [u8] {
        self.0
    }

    /// Returns the number of bytes that can be written to `self` until it is full.
    pub fn space_left(&self) -> usize {
        self.0.len()
    }

    /// Skips the given number of bytes in the output data without writing anything there.
    ///
    /// If the skipped bytes are not filled in by other code they will contain whatever data the
    /// buffer held before.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.space_left() < bytes {
            Err(Error::Eof)
        } else {
            let this = mem::take(&mut self.0);
            self.0 = &mut this[bytes..];
            Ok(())
        }
    }

    /// Writes all bytes from `other` to `self`.
    ///
    /// Returns `Error::Eof` when `self` does not have enough space left to fit `other`. In that
    /// case, `self` will not be modified.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            Err(Error::Eof)
        } else {
            self.0[..other.len()].copy_from_slice(other);
            let this = mem::take(&mut self.0);
            self.0 = &mut this[other.len()..];
            Ok(())
        }
    }

    /// Writes a single byte to `self`.
    ///
    /// Returns `Error::Eof` when no space is left.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.write_slice(&[byte])
    }

    /// Writes an `i8` to `self`.
    pub fn write_i8(&mut self, value: i8) -> Result<(), Error> {
        self.write_u8(value as u8)
    }

    /// Writes a `u16` to `self`, using Little Endian byte order.
    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        let mut bytes = [0; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.write_slice(&bytes)
    }

    /// Writes an `i16` to `self`, using Little Endian byte order.
    pub fn write_i16_le(&mut self, value: i16) -> Result<(), Error> {
        self.write_u16_le(value as u16)
    }

    /// Writes a `u32` to `self`, using Little Endian byte order.
    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        let mut bytes = [0; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.write_slice(&bytes)
    }

    /// Writes an `i32` to `self`, using Little Endian byte order.
    pub fn write_i32_le(&mut self, value: i32) -> Result<(), Error> {
        self.write_u32_le(value as u32)
    }
}

/// Allows reading values from a borrowed byte slice.
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Returns a reference to the raw bytes in `self`, without advancing `self` or reading any
    /// data.
    pub fn as_raw_bytes(&self) -> &'a [u8] {
        self.0
    }

    /// Consumes `self` and returns the part of the contained buffer that has not yet been read
    /// from.
    pub fn into_rest(self) -> &'a [u8] {
        self.0
    }

    /// Skips the given number of bytes in the input data without inspecting them.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.bytes_left() < bytes {
            Err(Error::Eof)
        } else {
            self.0 = &self.0[bytes..];
            Ok(())
        }
    }

    /// Returns the number of bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    /// Returns whether `self` is at the end of the underlying buffer (EOF).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads a byte slice of length `len` from `self`.
    ///
    /// If `self` contains less than `len` bytes, `Error::Eof` will be returned and `self` will not
    /// be modified.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let slice = &self.0[..len];
            self.0 = &self.0[len..];
            Ok(slice)
        }
    }

    /// Reads a byte-array-like type `S` from `self`.
    ///
    /// `S` must implement `Default` and `AsMut<[u8]>`, which allows using arrays up to 32 bytes.
    pub fn read_array<S>(&mut self) -> Result<S, Error>
    where
        S: Default + AsMut<[u8]>,
    {
        let mut buf = S::default();
        let slice = buf.as_mut();
        if self.bytes_left() < slice.len() {
            return Err(Error::Eof);
        }

        slice.copy_from_slice(&self.0[..slice.len()]);
        self.0 = &self.0[slice.len()..];
        Ok(buf)
    }

    /// Reads the remaining bytes from `self`.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    /// Reads a single byte from `self`.
    ///
    /// Returns `Error::Eof` when `self` is empty.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<[u8; 1]>()?[0])
    }

    /// Reads an `i8` from `self`.
    pub fn read_i8(&mut self) -> Result<i8, Error> {
        Ok(self.read_u8()? as i8)
    }

    /// Reads a `u16` from `self`, using Little Endian byte order.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(LittleEndian::read_u16(self.read_slice(2)?))
    }

    /// Reads an `i16` from `self`, using Little Endian byte order.
    pub fn read_i16_le(&mut self) -> Result<i16, Error> {
        Ok(self.read_u16_le()? as i16)
    }

    /// Reads a `u32` from `self`, using Little Endian byte order.
    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.read_slice(4)?))
    }

    /// Reads an `i32` from `self`, using Little Endian byte order.
    pub fn read_i32_le(&mut self) -> Result<i32, Error> {
        Ok(self.read_u32_le()? as i32)
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing `writer` to point past
    /// the encoded value.
    ///
    /// If `writer` does not contain enough space, an error will be returned and the state of the
    /// buffer is unspecified (eg. `self` may be partially written into `writer`).
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decode a `Self` from a byte slice, advancing `bytes` to point past the data that was read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an insufficient number
    /// of bytes, an error will be returned and the state of `bytes` is unspecified (it can point
    /// to arbitrary data).
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

impl<'a> ToBytes for &'a [u8] {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(self)
    }
}

impl<'a> FromBytes<'a> for &'a [u8] {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(bytes.read_rest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_eof_leaves_buffer_untouched() {
        let mut buf = [0xAA; 4];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u16_le(0x1234).unwrap();
        assert_eq!(w.write_slice(&[1, 2, 3]), Err(Error::Eof));
        assert_eq!(w.space_left(), 2);
        w.write_u16_le(0x5678).unwrap();
        assert_eq!(buf, [0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn reader_round_trip() {
        let mut buf = [0; 13];
        {
            let mut w = ByteWriter::new(&mut buf);
            w.write_u8(0xFE).unwrap();
            w.write_u32_le(0xDEAD_BEEF).unwrap();
            w.write_i32_le(-123_456_789).unwrap();
            w.write_i16_le(-42).unwrap();
            w.write_i8(-1).unwrap();
            w.write_u8(7).unwrap();
            assert_eq!(w.space_left(), 0);
        }

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 0xFE);
        assert_eq!(r.read_u32_le().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_i32_le().unwrap(), -123_456_789);
        assert_eq!(r.read_i16_le().unwrap(), -42);
        assert_eq!(r.read_i8().unwrap(), -1);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.is_empty());
        assert_eq!(r.read_u8(), Err(Error::Eof));
    }
}
