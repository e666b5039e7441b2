//! A segment is a contiguous byte span inside a page holding an ordered
//! key -> record map (spec.md 4.B). The offset table is sorted by key;
//! records are packed back-to-front from the high end of the buffer as they
//! arrive.
//!
//! Records are stored bit-exact to spec.md 3/6: `[u32 key_len][key][payload]`,
//! no extra length field of its own. A record's extent is recovered by
//! reading `key_len`, then asking `ChildRecord::peek_len` how many bytes of
//! payload follow: the payload is self-describing by its kind tag, per
//! spec.md 3 ("payload length is derived from the record kind"). This stays
//! safe even once `delete` has punched a hole earlier in the record area,
//! since `peek_len` only reads as many bytes as the record's own kind tag
//! and length-prefixed fields declare, never past them.

use crate::error::{PmtError, Result};
use crate::node::ChildRecord;

pub const HEADER_SIZE: usize = 25;
const OFFSET_ENTRY_SIZE: usize = 2;
const KEY_LEN_PREFIX: usize = 4;

const FLAG_DELETED: u8 = 0b1000_0000;
const FLAG_HAS_ALIAS: u8 = 0b0100_0000;

/// Size classes a segment may occupy. Growth walks this list in order;
/// beyond `Max` (16320 B) growth is by chaining, not further escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeClass {
    S1024,
    S2048,
    S4096,
    S8192,
    Max,
}

impl SizeClass {
    pub const ALL: [SizeClass; 5] = [
        SizeClass::S1024,
        SizeClass::S2048,
        SizeClass::S4096,
        SizeClass::S8192,
        SizeClass::Max,
    ];

    pub fn bytes(self) -> usize {
        match self {
            SizeClass::S1024 => 1024,
            SizeClass::S2048 => 2048,
            SizeClass::S4096 => 4096,
            SizeClass::S8192 => 8192,
            SizeClass::Max => 16320,
        }
    }

    pub fn next(self) -> Option<SizeClass> {
        match self {
            SizeClass::S1024 => Some(SizeClass::S2048),
            SizeClass::S2048 => Some(SizeClass::S4096),
            SizeClass::S4096 => Some(SizeClass::S8192),
            SizeClass::S8192 => Some(SizeClass::Max),
            SizeClass::Max => None,
        }
    }

    pub fn is_max(self) -> bool {
        matches!(self, SizeClass::Max)
    }

    /// Smallest size class whose capacity is >= `n` bytes, if any fits.
    pub fn smallest_fitting(n: usize) -> Option<SizeClass> {
        SizeClass::ALL.into_iter().find(|c| c.bytes() >= n)
    }
}

/// Hints the caller (normally `SchemaFile`, mid-append) supplies so `split`
/// can bias its pivot towards the growing side (spec.md 4.B).
#[derive(Debug, Clone)]
pub struct InclineHint {
    pub penultimate_key: Vec<u8>,
    pub last_key: Vec<u8>,
}

/// A view over a byte buffer exactly `size_class.bytes()` long.
pub struct SegmentView<'a> {
    buf: &'a mut [u8],
}

fn cmp_keys(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl<'a> SegmentView<'a> {
    /// Wrap an existing, already-initialized buffer.
    pub fn attach(buf: &'a mut [u8]) -> Self {
        SegmentView { buf }
    }

    /// Initialize a fresh, empty segment over `buf` (whose length must equal
    /// a size class's byte count).
    pub fn init(buf: &'a mut [u8]) -> Result<Self> {
        let len = buf.len();
        if len < HEADER_SIZE {
            return Err(PmtError::corrupt("segment buffer smaller than header"));
        }
        let mut seg = SegmentView { buf };
        seg.write_length(len as i16)?;
        seg.write_free_addr(len as i16)?;
        seg.write_record_count(0)?;
        seg.write_offset_table_bytes(0)?;
        seg.set_prev_addr(-1)?;
        seg.set_next_addr(-1)?;
        seg.set_flags(0)?;
        Ok(seg)
    }

    // --- header accessors -------------------------------------------------

    fn read_i16(&self, off: usize) -> i16 {
        i16::from_be_bytes(self.buf[off..off + 2].try_into().unwrap())
    }

    fn write_i16_at(&mut self, off: usize, v: i16) -> Result<()> {
        self.buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.read_i16(0) as usize
    }

    fn write_length(&mut self, v: i16) -> Result<()> {
        self.write_i16_at(0, v)
    }

    pub fn free_addr(&self) -> usize {
        self.read_i16(2) as usize
    }

    fn write_free_addr(&mut self, v: i16) -> Result<()> {
        self.write_i16_at(2, v)
    }

    pub fn record_count(&self) -> usize {
        self.read_i16(4) as usize
    }

    fn write_record_count(&mut self, v: i16) -> Result<()> {
        self.write_i16_at(4, v)
    }

    pub fn offset_table_bytes(&self) -> usize {
        self.read_i16(6) as usize
    }

    fn write_offset_table_bytes(&mut self, v: i16) -> Result<()> {
        self.write_i16_at(6, v)
    }

    pub fn prev_addr(&self) -> i64 {
        i64::from_be_bytes(self.buf[8..16].try_into().unwrap())
    }

    pub fn set_prev_addr(&mut self, v: i64) -> Result<()> {
        self.buf[8..16].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn next_addr(&self) -> i64 {
        i64::from_be_bytes(self.buf[16..24].try_into().unwrap())
    }

    pub fn set_next_addr(&mut self, v: i64) -> Result<()> {
        self.buf[16..24].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    fn flags(&self) -> u8 {
        self.buf[24]
    }

    fn set_flags(&mut self, v: u8) -> Result<()> {
        self.buf[24] = v;
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.flags() & FLAG_DELETED != 0
    }

    /// Monotonic: once set, stays set (spec.md 3 invariants).
    pub fn mark_deleted(&mut self) -> Result<()> {
        let f = self.flags() | FLAG_DELETED;
        self.set_flags(f)
    }

    pub fn has_alias(&self) -> bool {
        self.flags() & FLAG_HAS_ALIAS != 0
    }

    pub fn set_has_alias(&mut self, value: bool) -> Result<()> {
        let f = if value {
            self.flags() | FLAG_HAS_ALIAS
        } else {
            self.flags() & !FLAG_HAS_ALIAS
        };
        self.set_flags(f)
    }

    pub fn is_full_class_max(&self) -> bool {
        self.length() == SizeClass::Max.bytes()
    }

    // --- offset table -------------------------------------------------

    fn offset_table_start(&self) -> usize {
        HEADER_SIZE
    }

    fn offset_at(&self, index: usize) -> usize {
        let pos = self.offset_table_start() + index * OFFSET_ENTRY_SIZE;
        u16::from_be_bytes(self.buf[pos..pos + 2].try_into().unwrap()) as usize
    }

    fn set_offset_at(&mut self, index: usize, value: u16) {
        let pos = self.offset_table_start() + index * OFFSET_ENTRY_SIZE;
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn record_key_at(&self, record_offset: usize) -> Result<&[u8]> {
        let key_len_pos = record_offset;
        let key_len = u32::from_be_bytes(
            self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
                .try_into()
                .unwrap(),
        ) as usize;
        let key_start = key_len_pos + KEY_LEN_PREFIX;
        self.buf
            .get(key_start..key_start + key_len)
            .ok_or_else(|| PmtError::corrupt("record key runs past segment buffer"))
    }

    fn record_key_and_payload(&self, record_offset: usize) -> Result<(&[u8], &[u8])> {
        let key_len_pos = record_offset;
        let key_len = u32::from_be_bytes(
            self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
                .try_into()
                .unwrap(),
        ) as usize;
        let key_start = key_len_pos + KEY_LEN_PREFIX;
        let key = self
            .buf
            .get(key_start..key_start + key_len)
            .ok_or_else(|| PmtError::corrupt("record key runs past segment buffer"))?;
        let payload_start = key_start + key_len;
        let payload_bytes = self
            .buf
            .get(payload_start..)
            .ok_or_else(|| PmtError::corrupt("record payload runs past segment buffer"))?;
        let payload_len = ChildRecord::peek_len(payload_bytes)?;
        let payload = &payload_bytes[..payload_len];
        Ok((key, payload))
    }

    /// Total bytes the record at `record_offset` occupies, including its
    /// `key_len` prefix — used by `update` to decide whether a new value
    /// fits in the old record's span without reallocating.
    fn record_span_at(&self, record_offset: usize) -> Result<usize> {
        let (key, payload) = self.record_key_and_payload(record_offset)?;
        Ok(KEY_LEN_PREFIX + key.len() + payload.len())
    }

    /// Binary search the offset table by key. `Ok(idx)` on an exact match,
    /// `Err(idx)` with the insertion point otherwise (spec.md 9: a miss is
    /// an ordinary negative answer, never an error).
    fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let n = self.record_count();
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let off = self.offset_at(mid);
            let candidate = self.record_key_at(off)?;
            match cmp_keys(candidate, key) {
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(Err(lo))
    }

    fn shift_offsets_right(&mut self, from_index: usize) {
        let n = self.record_count();
        for i in (from_index..n).rev() {
            let v = self.offset_at(i);
            self.set_offset_at(i + 1, v as u16);
        }
    }

    fn shift_offsets_left(&mut self, removed_index: usize) {
        let n = self.record_count();
        for i in removed_index..n - 1 {
            let v = self.offset_at(i + 1);
            self.set_offset_at(i, v as u16);
        }
    }

    /// Bytes available for a new record (including its offset-table entry)
    /// before the record area and the offset table would collide.
    pub fn spare(&self) -> isize {
        self.free_addr() as isize - (HEADER_SIZE + self.offset_table_bytes()) as isize
    }

    /// Insert a new key/payload pair. Returns the byte offset the record was
    /// stored at.
    pub fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<usize> {
        let slot = match self.search(key)? {
            Ok(_) => return Err(PmtError::Duplicate),
            Err(slot) => slot,
        };

        let s = KEY_LEN_PREFIX + key.len() + payload.len();
        let needed = s as isize + OFFSET_ENTRY_SIZE as isize;
        if self.spare() < needed {
            return Err(PmtError::Overflow);
        }

        let new_free_addr = self.free_addr() - s;
        let record_offset = new_free_addr;

        let key_len_pos = record_offset;
        self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
            .copy_from_slice(&(key.len() as u32).to_be_bytes());
        let key_start = key_len_pos + KEY_LEN_PREFIX;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        let payload_start = key_start + key.len();
        self.buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);

        self.shift_offsets_right(slot);
        self.set_offset_at(slot, record_offset as u16);

        self.write_free_addr(new_free_addr as i16)?;
        self.write_record_count((self.record_count() + 1) as i16)?;
        self.write_offset_table_bytes((self.offset_table_bytes() + OFFSET_ENTRY_SIZE) as i16)?;

        Ok(record_offset)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        match self.search(key)? {
            Ok(idx) => {
                let off = self.offset_at(idx);
                let (_, payload) = self.record_key_and_payload(off)?;
                Ok(Some(payload))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn get_key_at(&self, index: usize) -> Result<&[u8]> {
        let off = self.offset_at(index);
        self.record_key_at(off)
    }

    /// Direct indexed access into the offset table. Used by callers (the
    /// schema file's lazy children iterator) that must walk a chain
    /// index-by-index across page-cache lock boundaries, where holding a
    /// continuous `children()` iterator isn't possible.
    pub fn record_at(&self, index: usize) -> Result<(&[u8], &[u8])> {
        if index >= self.record_count() {
            return Err(PmtError::corrupt("segment record index out of range"));
        }
        let off = self.offset_at(index);
        self.record_key_and_payload(off)
    }

    /// Overwrite in place if the new payload fits in the old record's span;
    /// otherwise tries to allocate fresh space. `Overflow` if neither works.
    pub fn update(&mut self, key: &[u8], payload: &[u8]) -> Result<usize> {
        let idx = match self.search(key)? {
            Ok(idx) => idx,
            Err(_) => return Err(PmtError::NotFound),
        };
        let off = self.offset_at(idx);
        let old_span = self.record_span_at(off)?;
        let new_s = KEY_LEN_PREFIX + key.len() + payload.len();

        if new_s <= old_span {
            let key_len_pos = off;
            self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
                .copy_from_slice(&(key.len() as u32).to_be_bytes());
            let key_start = key_len_pos + KEY_LEN_PREFIX;
            self.buf[key_start..key_start + key.len()].copy_from_slice(key);
            let payload_start = key_start + key.len();
            self.buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);
            return Ok(off);
        }

        let needed = new_s as isize;
        if self.spare() < needed {
            return Err(PmtError::Overflow);
        }
        let new_free_addr = self.free_addr() - new_s;
        let new_off = new_free_addr;
        let key_len_pos = new_off;
        self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
            .copy_from_slice(&(key.len() as u32).to_be_bytes());
        let key_start = key_len_pos + KEY_LEN_PREFIX;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        let payload_start = key_start + key.len();
        self.buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);

        self.set_offset_at(idx, new_off as u16);
        self.write_free_addr(new_free_addr as i16)?;
        Ok(new_off)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let idx = match self.search(key)? {
            Ok(idx) => idx,
            Err(_) => return Err(PmtError::NotFound),
        };
        self.shift_offsets_left(idx);
        self.write_record_count((self.record_count() - 1) as i16)?;
        self.write_offset_table_bytes((self.offset_table_bytes() - OFFSET_ENTRY_SIZE) as i16)?;
        Ok(())
    }

    /// Iterate live records in ascending key order.
    pub fn children(&self) -> SegmentChildren<'_> {
        SegmentChildren { seg: self, next: 0 }
    }

    /// Rewrite all live records contiguously from the top of the buffer
    /// downward in key order, reclaiming holes left by `delete`/`update`.
    pub fn compact(&mut self) -> Result<()> {
        let n = self.record_count();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(n);
        for i in 0..n {
            let off = self.offset_at(i);
            let (k, p) = self.record_key_and_payload(off)?;
            entries.push((k.to_vec(), p.to_vec()));
        }

        let total_len = self.length();
        let mut cursor = total_len;
        for (i, (k, p)) in entries.iter().enumerate() {
            let s = KEY_LEN_PREFIX + k.len() + p.len();
            cursor -= s;
            let key_len_pos = cursor;
            self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
                .copy_from_slice(&(k.len() as u32).to_be_bytes());
            let key_start = key_len_pos + KEY_LEN_PREFIX;
            self.buf[key_start..key_start + k.len()].copy_from_slice(k);
            let payload_start = key_start + k.len();
            self.buf[payload_start..payload_start + p.len()].copy_from_slice(p);
            self.set_offset_at(i, cursor as u16);
        }
        self.write_free_addr(cursor as i16)?;
        Ok(())
    }

    /// Partition records between `self` and `target`, folding in an optional
    /// incoming insert. Returns the smallest key that moved to `target`.
    /// `target` must be an empty, freshly-initialized segment buffer of the
    /// same size class. Both segments keep the `prev`/`next` chain
    /// consistent: `target` becomes `self.next`, and the old `self.next`
    /// becomes `target.next`.
    pub fn split(
        &mut self,
        new_record: Option<(&[u8], &[u8])>,
        target: &mut SegmentView<'_>,
        incline: Option<&InclineHint>,
    ) -> Result<Vec<u8>> {
        let n = self.record_count();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(n + 1);
        for i in 0..n {
            let off = self.offset_at(i);
            let (k, p) = self.record_key_and_payload(off)?;
            entries.push((k.to_vec(), p.to_vec()));
        }

        let mut insert_pos = entries.len();
        if let Some((key, payload)) = new_record {
            insert_pos = entries
                .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                .unwrap_or_else(|e| e);
            if key.len() as u64 + payload.len() as u64 + KEY_LEN_PREFIX as u64
                > (SizeClass::Max.bytes() - HEADER_SIZE) as u64
            {
                return Err(PmtError::Colossal);
            }
            entries.insert(insert_pos, (key.to_vec(), payload.to_vec()));
        }

        let total = entries.len();
        let mut sp = total / 2;
        if let Some(hint) = incline {
            let monotonic_up = hint.last_key.as_slice() > hint.penultimate_key.as_slice();
            let monotonic_down = hint.last_key.as_slice() < hint.penultimate_key.as_slice();
            if let Some((new_key, _)) = new_record {
                if monotonic_up && new_key > hint.last_key.as_slice() {
                    sp = (insert_pos + 1).max(total / 2);
                } else if monotonic_down && new_key < hint.last_key.as_slice() {
                    sp = (insert_pos + 2).min(total / 2);
                }
            }
        }
        sp = sp.max(1).min(total.saturating_sub(1).max(1));

        let (left, right) = entries.split_at(sp);
        let moved_first_key = right
            .first()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(Vec::new);

        // Rewrite `self` with the left half.
        let len = self.length();
        self.write_record_count(0)?;
        self.write_offset_table_bytes(0)?;
        self.write_free_addr(len as i16)?;
        for (k, p) in left {
            self.raw_append_sorted(k, p)?;
        }

        for (k, p) in right {
            target.raw_append_sorted(k, p)?;
        }

        // `self`/`target` don't know their own global SegmentAddress (only
        // the Page/SchemaFile layer tracking page_index does); the caller is
        // responsible for calling `set_prev_addr`/`set_next_addr` with the
        // real addresses once it has allocated `target`'s slot.
        target.set_next_addr(self.next_addr())?;
        // Per spec.md 9's open question on the source's split: copy the
        // alias flag unchanged, never the delete flag (target starts clean).
        target.set_has_alias(self.has_alias())?;

        Ok(moved_first_key)
    }

    /// Append at the end of the (already sorted) offset table without a
    /// binary search — used internally by `compact`/`split` where entries
    /// are fed in ascending key order.
    fn raw_append_sorted(&mut self, key: &[u8], payload: &[u8]) -> Result<usize> {
        let s = KEY_LEN_PREFIX + key.len() + payload.len();
        let needed = s as isize + OFFSET_ENTRY_SIZE as isize;
        if self.spare() < needed {
            return Err(PmtError::Overflow);
        }
        let new_free_addr = self.free_addr() - s;
        let key_len_pos = new_free_addr;
        self.buf[key_len_pos..key_len_pos + KEY_LEN_PREFIX]
            .copy_from_slice(&(key.len() as u32).to_be_bytes());
        let key_start = key_len_pos + KEY_LEN_PREFIX;
        self.buf[key_start..key_start + key.len()].copy_from_slice(key);
        let payload_start = key_start + key.len();
        self.buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);

        let idx = self.record_count();
        self.set_offset_at(idx, new_free_addr as u16);
        self.write_free_addr(new_free_addr as i16)?;
        self.write_record_count((idx + 1) as i16)?;
        self.write_offset_table_bytes(((idx + 1) * OFFSET_ENTRY_SIZE) as i16)?;
        Ok(new_free_addr)
    }

    /// Copy this segment's contents into a larger, freshly-initialized
    /// buffer of a higher size class.
    pub fn extend_to(&self, larger: &mut SegmentView<'_>) -> Result<()> {
        if larger.length() < self.length() {
            return Err(PmtError::corrupt("extend_to target buffer is smaller"));
        }
        let n = self.record_count();
        larger.write_record_count(0)?;
        larger.write_offset_table_bytes(0)?;
        larger.write_free_addr(larger.length() as i16)?;
        for i in 0..n {
            let off = self.offset_at(i);
            let (k, p) = self.record_key_and_payload(off)?;
            let (k, p) = (k.to_vec(), p.to_vec());
            larger.raw_append_sorted(&k, &p)?;
        }
        larger.set_prev_addr(self.prev_addr())?;
        larger.set_next_addr(self.next_addr())?;
        larger.set_has_alias(self.has_alias())?;
        Ok(())
    }
}

pub struct SegmentChildren<'a> {
    seg: &'a SegmentView<'a>,
    next: usize,
}

impl<'a> Iterator for SegmentChildren<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.seg.record_count() {
            return None;
        }
        let off = self.seg.offset_at(self.next);
        self.next += 1;
        Some(self.seg.record_key_and_payload(off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_record_payload;

    fn new_buf(class: SizeClass) -> Vec<u8> {
        vec![0u8; class.bytes()]
    }

    #[test]
    fn insert_lookup_round_trip_any_order() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        let pairs: &[(&[u8], &[u8])] = &[
            (b"c03", b"three"),
            (b"c01", b"one"),
            (b"c02", b"two"),
            (b"c00", b"zero"),
        ];
        let payloads: Vec<(&[u8], Vec<u8>)> =
            pairs.iter().map(|(k, v)| (*k, test_record_payload(v))).collect();
        for (k, v) in &payloads {
            seg.insert(k, v).unwrap();
        }
        for (k, v) in &payloads {
            assert_eq!(seg.lookup(k).unwrap(), Some(v.as_slice()));
        }
        assert_eq!(seg.record_count(), 4);
        // offset table sorted by key
        let mut prev: Option<&[u8]> = None;
        for i in 0..seg.record_count() {
            let k = seg.get_key_at(i).unwrap();
            if let Some(p) = prev {
                assert!(p < k);
            }
            prev = Some(k);
        }
    }

    #[test]
    fn duplicate_rejected() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        seg.insert(b"a", &test_record_payload(b"1")).unwrap();
        assert!(matches!(
            seg.insert(b"a", &test_record_payload(b"2")),
            Err(PmtError::Duplicate)
        ));
    }

    #[test]
    fn delete_then_miss() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        seg.insert(b"a", &test_record_payload(b"1")).unwrap();
        seg.delete(b"a").unwrap();
        assert_eq!(seg.lookup(b"a").unwrap(), None);
        assert!(matches!(seg.delete(b"a"), Err(PmtError::NotFound)));
    }

    #[test]
    fn update_in_place_and_grow() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        let short = test_record_payload(b"short");
        seg.insert(b"a", &short).unwrap();
        let shorter = test_record_payload(b"s");
        seg.update(b"a", &shorter).unwrap();
        assert_eq!(seg.lookup(b"a").unwrap(), Some(shorter.as_slice()));
        let longer = test_record_payload(b"a much longer value than before");
        seg.update(b"a", &longer).unwrap();
        assert_eq!(seg.lookup(b"a").unwrap(), Some(longer.as_slice()));
    }

    #[test]
    fn overflow_when_full() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        let payload = test_record_payload(&[0u8; 200]);
        let mut i = 0;
        loop {
            let key = format!("k{i:04}");
            match seg.insert(key.as_bytes(), &payload) {
                Ok(_) => i += 1,
                Err(PmtError::Overflow) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert!(i > 0);
    }

    #[test]
    fn compact_reclaims_deleted_space() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        let payload = test_record_payload(b"0123456789");
        for i in 0..5 {
            seg.insert(format!("k{i}").as_bytes(), &payload).unwrap();
        }
        seg.delete(b"k2").unwrap();
        let spare_before = seg.spare();
        seg.compact().unwrap();
        let spare_after = seg.spare();
        assert!(spare_after > spare_before);
        assert_eq!(seg.lookup(b"k2").unwrap(), None);
        assert_eq!(seg.lookup(b"k3").unwrap(), Some(payload.as_slice()));
    }

    #[test]
    fn split_conserves_contents() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut target_buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        let payload = test_record_payload(b"value");
        for i in 0..10 {
            seg.insert(format!("k{i:02}").as_bytes(), &payload).unwrap();
        }
        let mut target = SegmentView::init(&mut target_buf).unwrap();
        let new_payload = test_record_payload(b"new");
        let moved_key = seg
            .split(Some((b"k99", &new_payload)), &mut target, None)
            .unwrap();

        let mut left: Vec<Vec<u8>> = seg.children().map(|r| r.unwrap().0.to_vec()).collect();
        let mut right: Vec<Vec<u8>> = target.children().map(|r| r.unwrap().0.to_vec()).collect();
        assert_eq!(left.len() + right.len(), 11);
        left.sort();
        right.sort();
        assert!(left.iter().max() <= right.iter().min().unwrap_or(&vec![0xff]));
        assert_eq!(right[0], moved_key);
    }

    #[test]
    fn split_with_incline_hint_biases_pivot_toward_more_free_space_on_growing_side() {
        let mut buf = new_buf(SizeClass::S1024);
        let mut seg = SegmentView::init(&mut buf).unwrap();
        let payload = test_record_payload(b"0123456789");
        let mut i = 0u32;
        loop {
            let key = format!("k{i:04}");
            match seg.insert(key.as_bytes(), &payload) {
                Ok(_) => i += 1,
                Err(PmtError::Overflow) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert!(i > 4, "need enough records to exercise the bias");

        let hint = InclineHint {
            penultimate_key: format!("k{:04}", i - 2).into_bytes(),
            last_key: format!("k{:04}", i - 1).into_bytes(),
        };
        let new_key = format!("k{i:04}").into_bytes();

        let mut target_buf = new_buf(SizeClass::S1024);
        let mut target = SegmentView::init(&mut target_buf).unwrap();
        seg.split(Some((&new_key, &payload)), &mut target, Some(&hint))
            .unwrap();

        let left_spare = seg.spare().max(0) as f64;
        let right_spare = target.spare().max(0) as f64;
        assert!(
            right_spare >= left_spare * 1.25,
            "expected the growing (right) side to retain at least 25% more free \
             space than the shrinking side: left={left_spare} right={right_spare}"
        );
    }
}
