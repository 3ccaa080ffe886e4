use std::{convert::TryInto, mem::size_of};

use bit_vec::BitVec;

use crate::{error::Error, types::Result};

/// Read exactly `bytes_count` bytes from the reader.
pub(crate) fn read_exact<R: std::io::Read>(
    reader: &mut R,
    bytes_count: usize,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; bytes_count];
    reader.read_exact(&mut buffer).map_err(Error::Io)?;
    Ok(buffer)
}

pub(crate) fn read_into<T: Decodeable, R: std::io::Read>(reader: &mut R) -> Result<T> {
    T::decode_from(reader)
}

/// An accumulating little-endian byte writer. All persistent structures are
/// serialized through this to keep the on-disk byte order in one place.
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        obj.encode_to(&mut self.buf);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) trait Encodeable {
    fn encode_to(&self, buf: &mut Vec<u8>);
}

pub(crate) trait Decodeable: Sized {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self>;
}

/// # Format
///
/// - 4 bytes: length of the bit vector payload in bytes
/// - n bytes: bit vector
impl Encodeable for BitVec {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        let payload = self.to_bytes();
        (payload.len() as u32).encode_to(buf);
        buf.extend_from_slice(&payload);
    }
}

impl Decodeable for BitVec {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        let size: u32 = read_into(reader)?;
        let payload = read_exact(reader, size as usize)?;
        Ok(BitVec::from_bytes(&payload))
    }
}

/// # Format
///
/// - 4 bytes: byte length
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode_to(buf);
        buf.extend_from_slice(self);
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        let size: u32 = read_into(reader)?;
        read_exact(reader, size as usize)
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode_to(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i8, i16, i32, i64);

/// Fixed-offset little-endian accessors for in-place page editing.
pub(crate) fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub(crate) fn set_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn set_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub(crate) fn set_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
