//! Little-endian byte codec.
//!
//! Every wire structure is a fixed header of scalar fields followed by a
//! variable-length tail: matrices carry a rows·cols prefix and row-major
//! f64 elements, collections a u32 count prefix. Ids travel as u64 with
//! [`NULL_ID`] as the null sentinel, booleans as one byte.

use nalgebra::Matrix4;

use crate::error::{Error, Result};

/// Sentinel encoding "no id" in optional id fields.
pub const NULL_ID: u64 = u64::MAX;

/// Growable little-endian writer.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// UTF-8 string with a u32 length prefix.
    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn put_optional_id(&mut self, id: Option<u64>) {
        self.put_u64(id.unwrap_or(NULL_ID));
    }

    /// Row-major matrix with a rows/cols prefix.
    pub fn put_matrix4(&mut self, m: &Matrix4<f64>) {
        self.put_u32(4);
        self.put_u32(4);
        for row in 0..4 {
            for col in 0..4 {
                self.put_f64(m[(row, col)]);
            }
        }
    }
}

/// Bounds-checked little-endian reader.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Decode(format!(
                "buffer underrun: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_bool(&mut self) -> Result<bool> {
        Ok(self.take_u8()? != 0)
    }

    pub fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn take_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn take_string(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Decode("invalid UTF-8 in string field".into()))
    }

    pub fn take_optional_id(&mut self) -> Result<Option<u64>> {
        let raw = self.take_u64()?;
        Ok(if raw == NULL_ID { None } else { Some(raw) })
    }

    pub fn take_matrix4(&mut self) -> Result<Matrix4<f64>> {
        let rows = self.take_u32()?;
        let cols = self.take_u32()?;
        if rows != 4 || cols != 4 {
            return Err(Error::Decode(format!(
                "expected a 4x4 matrix, got {}x{}",
                rows, cols
            )));
        }
        let mut m = Matrix4::zeros();
        for row in 0..4 {
            for col in 0..4 {
                m[(row, col)] = self.take_f64()?;
            }
        }
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_scalar_roundtrip() {
        let mut w = ByteWriter::new();
        w.put_u8(7);
        w.put_bool(true);
        w.put_u16(0xBEEF);
        w.put_u32(0xDEAD_BEEF);
        w.put_i32(-42);
        w.put_u64(u64::MAX - 1);
        w.put_f64(std::f64::consts::PI);
        w.put_string("hello");
        w.put_optional_id(None);
        w.put_optional_id(Some(99));

        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.take_u8().unwrap(), 7);
        assert!(r.take_bool().unwrap());
        assert_eq!(r.take_u16().unwrap(), 0xBEEF);
        assert_eq!(r.take_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.take_i32().unwrap(), -42);
        assert_eq!(r.take_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.take_f64().unwrap(), std::f64::consts::PI);
        assert_eq!(r.take_string().unwrap(), "hello");
        assert_eq!(r.take_optional_id().unwrap(), None);
        assert_eq!(r.take_optional_id().unwrap(), Some(99));
        assert!(r.is_empty());
    }

    #[test]
    fn test_layout_is_little_endian() {
        let mut w = ByteWriter::new();
        w.put_u32(1);
        assert_eq!(w.into_bytes(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let m = Matrix4::from_fn(|r, c| (r * 4 + c) as f64 * 0.25);
        let mut w = ByteWriter::new();
        w.put_matrix4(&m);
        let bytes = w.into_bytes();
        // rows/cols prefix + 16 elements.
        assert_eq!(bytes.len(), 4 + 4 + 16 * 8);

        let mut r = ByteReader::new(&bytes);
        let back = r.take_matrix4().unwrap();
        assert_relative_eq!(m, back, epsilon = 0.0);
    }

    #[test]
    fn test_underrun_is_an_error() {
        let bytes = vec![1, 2];
        let mut r = ByteReader::new(&bytes);
        assert!(r.take_u32().is_err());
    }
}
