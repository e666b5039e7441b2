//! Byte-level primitives shared by the segment, page and file-header layouts.
//!
//! Everything on disk is big-endian and bounds-checked: a short read never
//! panics, it surfaces [`PmtError::Corrupt`].

use crate::error::{PmtError, Result};

/// A cursor over an immutable byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Reader { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(PmtError::corrupt(format!(
                "expected {} bytes at offset {}, only {} remain",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Length-prefixed UTF-8 string. The prefix is a signed `i32`; a
    /// negative value means "absent" and yields `None` rather than an error.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|e| PmtError::corrupt(format!("invalid utf8 in string field: {e}")))?;
        Ok(Some(s))
    }
}

/// A cursor over a mutable byte slice.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, pos: 0 }
    }

    pub fn at(buf: &'a mut [u8], pos: usize) -> Self {
        Writer { buf, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(PmtError::corrupt(format!(
                "writer has {} bytes left, needs {}",
                self.buf.len() - self.pos,
                n
            )));
        }
        let slice = &mut self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.reserve(2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.reserve(2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.reserve(4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.reserve(4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.reserve(8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.reserve(8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_string(&mut self, s: Option<&str>) -> Result<()> {
        match s {
            None => self.write_i32(-1),
            Some(s) => {
                self.write_i32(s.len() as i32)?;
                self.write_bytes(s.as_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fixed_width_ints() {
        let mut buf = [0u8; 32];
        {
            let mut w = Writer::new(&mut buf);
            w.write_u8(7).unwrap();
            w.write_i16(-3).unwrap();
            w.write_u16(40_000).unwrap();
            w.write_i32(-70_000).unwrap();
            w.write_u32(3_000_000_000).unwrap();
            w.write_i64(-9_000_000_000_000).unwrap();
        }
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_i16().unwrap(), -3);
        assert_eq!(r.read_u16().unwrap(), 40_000);
        assert_eq!(r.read_i32().unwrap(), -70_000);
        assert_eq!(r.read_u32().unwrap(), 3_000_000_000);
        assert_eq!(r.read_i64().unwrap(), -9_000_000_000_000);
    }

    #[test]
    fn string_round_trip_and_absence() {
        let mut buf = [0u8; 64];
        {
            let mut w = Writer::new(&mut buf);
            w.write_string(Some("root")).unwrap();
            w.write_string(None).unwrap();
        }
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), Some("root".to_string()));
        assert_eq!(r.read_string().unwrap(), None);
    }

    #[test]
    fn short_read_is_corrupt_not_panic() {
        let buf = [0u8; 1];
        let mut r = Reader::new(&buf);
        assert!(matches!(r.read_u32(), Err(PmtError::Corrupt { .. })));
    }
}
