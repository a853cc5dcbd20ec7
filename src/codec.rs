//! Binary wire primitives.
//!
//! | Type            | Encoding                               |
//! |-----------------|----------------------------------------|
//! | integers, `f32` | little-endian, fixed width             |
//! | `bool`          | one byte, non-zero = true              |
//! | string          | `u16` byte length + UTF-8              |
//! | blob            | `u32` byte length + bytes              |
//! | `Option<T>`     | presence byte, then `T` if present     |
//! | array           | `u16` item count, then items           |
//!
//! [`FrameReader`] never panics on short input: every read checks the
//! remaining length first and returns [`ProtocolError::Truncated`].

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    /// Start a method frame with its opcode byte.
    pub fn with_opcode(opcode: u8) -> Self {
        let mut w = Self::new();
        w.put_u8(opcode);
        w
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    /// Strings longer than `u16::MAX` bytes are truncated at a char boundary.
    pub fn put_str(&mut self, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        if end < s.len() {
            log::warn!("Truncating {} byte string field to {} bytes", s.len(), end);
        }
        self.buf.put_u16_le(end as u16);
        self.buf.put_slice(&s.as_bytes()[..end]);
    }

    pub fn put_blob(&mut self, data: &[u8]) {
        self.buf.put_u32_le(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn put_opt<T>(&mut self, v: Option<T>, mut put: impl FnMut(&mut Self, T)) {
        match v {
            Some(v) => {
                self.put_bool(true);
                put(self, v);
            }
            None => self.put_bool(false),
        }
    }

    pub fn put_array<T>(&mut self, items: &[T], mut put: impl FnMut(&mut Self, &T)) {
        let count = items.len().min(u16::MAX as usize);
        self.put_u16(count as u16);
        for item in &items[..count] {
            put(self, item);
        }
    }

    pub fn put_json(&mut self, v: &serde_json::Value) {
        self.put_str(&v.to_string());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_slice(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u32()? as usize;
        Ok(self.read_slice(len)?.to_vec())
    }

    pub fn read_opt<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<Option<T>, ProtocolError> {
        if self.read_bool()? {
            read(self).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read_array<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<Vec<T>, ProtocolError> {
        let count = self.read_u16()? as usize;
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(read(self)?);
        }
        Ok(items)
    }

    pub fn read_json(&mut self, field: &'static str) -> Result<serde_json::Value, ProtocolError> {
        let text = self.read_str()?;
        serde_json::from_str(&text).map_err(|e| ProtocolError::InvalidJson {
            field,
            reason: e.to_string(),
        })
    }

    /// Fail if any bytes remain after `method` was fully decoded.
    pub fn expect_end(&self, method: &'static str) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes {
                method,
                len: self.buf.len(),
            })
        }
    }
}
