//! Byte buffer primitives used by the wire codec.
//!
//! Writers append fixed-width big-endian integers, varints, and
//! varint-prefixed blobs. Readers perform the mirror-image reads with bounds
//! checking; a truncated or corrupt buffer surfaces as a `ReadError`, never a
//! panic, since these bytes arrive straight off the network.

use std::fmt;

use integer_encoding::VarInt;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ReadError {
    Truncated,
    BadVarint,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadError::Truncated => write!(f, "Truncated"),
            ReadError::BadVarint => write!(f, "BadVarint"),
        }
    }
}

/// Growable write buffer.
#[derive(Debug)]
pub struct DataMut {
    v: Vec<u8>,
}

impl DataMut {
    pub fn new() -> DataMut {
        DataMut { v: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> DataMut {
        DataMut { v: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.v[..]
    }

    pub fn finalize(self) -> Vec<u8> {
        self.v
    }

    pub fn put_u8(&mut self, value: u8) {
        self.v.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.v.push(if value { 1u8 } else { 0u8 });
    }

    pub fn put_u32_be(&mut self, value: u32) {
        self.v.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64_be(&mut self, value: u64) {
        self.v.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_varint(&mut self, value: usize) {
        let mut buf: [u8; 10] = [0; 10];
        let nbytes = value.encode_var(&mut buf);
        self.v.extend_from_slice(&buf[..nbytes]);
    }

    pub fn put_varint_prefixed_slice(&mut self, slice: &[u8]) {
        self.put_varint(slice.len());
        self.v.extend_from_slice(slice);
    }
}

/// Bounds-checked read cursor over a borrowed buffer.
#[derive(Debug)]
pub struct DataReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> DataReader<'a> {
    pub fn new(buffer: &'a [u8]) -> DataReader<'a> {
        DataReader { buffer, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    fn get_slice(&mut self, nbytes: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < nbytes {
            return Err(ReadError::Truncated);
        }
        let s = &self.buffer[self.offset..self.offset + nbytes];
        self.offset += nbytes;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8, ReadError> {
        let s = self.get_slice(1)?;
        Ok(s[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, ReadError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32_be(&mut self) -> Result<u32, ReadError> {
        let s = self.get_slice(4)?;
        let mut b: [u8; 4] = [0; 4];
        b.copy_from_slice(s);
        Ok(u32::from_be_bytes(b))
    }

    pub fn get_u64_be(&mut self) -> Result<u64, ReadError> {
        let s = self.get_slice(8)?;
        let mut b: [u8; 8] = [0; 8];
        b.copy_from_slice(s);
        Ok(u64::from_be_bytes(b))
    }

    pub fn get_varint(&mut self) -> Result<usize, ReadError> {
        // Locate the terminating byte ourselves. decode_var() would accept a
        // buffer that ends mid-varint.
        let avail = &self.buffer[self.offset..];
        let limit = std::cmp::min(avail.len(), 10);
        let mut end = None;
        for (i, b) in avail[..limit].iter().enumerate() {
            if b & 0x80 == 0 {
                end = Some(i + 1);
                break;
            }
        }
        let nbytes = match end {
            Some(n) => n,
            None if avail.len() < 10 => return Err(ReadError::Truncated),
            None => return Err(ReadError::BadVarint),
        };
        let (value, decoded) = usize::decode_var(&avail[..nbytes]);
        if decoded != nbytes {
            return Err(ReadError::BadVarint);
        }
        self.offset += nbytes;
        Ok(value)
    }

    pub fn get_varint_prefixed_slice(&mut self) -> Result<&'a [u8], ReadError> {
        let nbytes = self.get_varint()?;
        self.get_slice(nbytes)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn round_trip_integers() {
        let mut w = DataMut::new();
        w.put_u8(7);
        w.put_u32_be(0xdeadbeef);
        w.put_u64_be(0x0123456789abcdef);
        w.put_bool(true);
        let v = w.finalize();

        let mut r = DataReader::new(&v);
        assert_eq!(r.get_u8(), Ok(7));
        assert_eq!(r.get_u32_be(), Ok(0xdeadbeef));
        assert_eq!(r.get_u64_be(), Ok(0x0123456789abcdef));
        assert_eq!(r.get_bool(), Ok(true));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn round_trip_prefixed_slice() {
        let mut w = DataMut::new();
        w.put_varint_prefixed_slice(b"hello there");
        w.put_varint_prefixed_slice(b"");
        let v = w.finalize();

        let mut r = DataReader::new(&v);
        assert_eq!(r.get_varint_prefixed_slice(), Ok(&b"hello there"[..]));
        assert_eq!(r.get_varint_prefixed_slice(), Ok(&b""[..]));
    }

    #[test]
    fn truncated_reads_fail() {
        let mut w = DataMut::new();
        w.put_u32_be(99);
        let v = w.finalize();

        let mut r = DataReader::new(&v[..2]);
        assert_eq!(r.get_u32_be(), Err(ReadError::Truncated));

        let mut r = DataReader::new(&v);
        assert_eq!(r.get_u32_be(), Ok(99));
        assert_eq!(r.get_u8(), Err(ReadError::Truncated));
    }

    #[test]
    fn truncated_varint_fails() {
        let mut w = DataMut::new();
        w.put_varint(300);
        let v = w.finalize();
        assert!(v.len() >= 2);

        let mut r = DataReader::new(&v[..1]);
        assert_eq!(r.get_varint(), Err(ReadError::Truncated));
    }

    #[test]
    fn prefixed_slice_with_lying_length_fails() {
        let mut w = DataMut::new();
        w.put_varint(1000);
        w.put_u8(1);
        let v = w.finalize();

        let mut r = DataReader::new(&v);
        assert_eq!(r.get_varint_prefixed_slice(), Err(ReadError::Truncated));
    }

    #[test]
    fn large_varint_round_trip() {
        let mut w = DataMut::new();
        w.put_varint(usize::max_value());
        let v = w.finalize();

        let mut r = DataReader::new(&v);
        assert_eq!(r.get_varint(), Ok(usize::max_value()));
    }
}
