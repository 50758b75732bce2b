//! Append-only data page
//!
//! A page is a fixed-length byte region with three zones:
//!
//! - a typed header at offset 0 (fixed 72-byte prefix),
//! - an index of 4-byte entry offsets growing from the end of the header
//!   toward the entries,
//! - entries packed from the page tail, growing downward.
//!
//! The header carries a 2-D bounding box over (series id, timestamp)
//! which summarizes the page for query pruning. A prefix of the index
//! (`sync_index` slots) is kept sorted by (series id, timestamp); the
//! remaining tail reflects insertion order until the next [`Page::sort`].
//!
//! All header and entry fields use host byte order. Pages are not
//! portable across endianness.

mod entry;
mod file;
mod search;

pub use entry::{decode_entry, entry_size, EntryRef, ENTRY_ALIGN, ENTRY_PREFIX_SIZE};
pub use file::PageFile;
pub use search::{PageCursor, ProbeStats, SearchStats, SearchStatsSnapshot};

use crate::{Error, ParamId, Result, SearchQuery, Timestamp, TIMESTAMP_MAX, TIMESTAMP_MIN};
use bytes::Buf;

/// Fixed header size in bytes; the index starts here
pub const HEADER_SIZE: usize = 72;

/// Size of one index slot in bytes
pub const INDEX_SLOT_SIZE: usize = 4;

/// Maximum page size; all entry offsets must fit in 32 bits
pub const MAX_PAGE_SIZE: u64 = 1 << 32;

/// Header field offsets
mod offsets {
    pub const TYPE: usize = 0;
    pub const COUNT: usize = 4;
    pub const SYNC_INDEX: usize = 8;
    pub const OPEN_COUNT: usize = 12;
    pub const CLOSE_COUNT: usize = 16;
    pub const PAGE_ID: usize = 20;
    pub const LENGTH: usize = 24;
    pub const LAST_OFFSET: usize = 32;
    pub const BBOX_MIN_ID: usize = 40;
    pub const BBOX_MAX_ID: usize = 48;
    pub const BBOX_MIN_TS: usize = 56;
    pub const BBOX_MAX_TS: usize = 64;
    pub const INDEX: usize = 72;
}

/// Page types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    /// Page with metadata used by the volume manager
    Metadata = 0,
    /// Data page holding indexed entries
    Index = 1,
}

impl TryFrom<u32> for PageType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(PageType::Metadata),
            1 => Ok(PageType::Index),
            _ => Err(Error::Corruption(format!("invalid page type: {}", value))),
        }
    }
}

/// Page bounding box over the two data dimensions, series id and
/// timestamp. Inclusive on both ends; an empty box has `min > max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_id: ParamId,
    pub max_id: ParamId,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

impl BoundingBox {
    /// Box containing no points
    pub fn empty() -> Self {
        Self {
            min_id: ParamId::MAX,
            max_id: 0,
            min_timestamp: TIMESTAMP_MAX,
            max_timestamp: TIMESTAMP_MIN,
        }
    }

    /// Check whether the box contains no points
    pub fn is_empty(&self) -> bool {
        self.min_id > self.max_id
    }

    /// Check whether (param, time) lies within the box
    pub fn contains(&self, param: ParamId, time: Timestamp) -> bool {
        param >= self.min_id
            && param <= self.max_id
            && time >= self.min_timestamp
            && time <= self.max_timestamp
    }

    /// Widen the box to cover (param, time)
    pub fn widen(&mut self, param: ParamId, time: Timestamp) {
        self.min_id = self.min_id.min(param);
        self.max_id = self.max_id.max(param);
        self.min_timestamp = self.min_timestamp.min(time);
        self.max_timestamp = self.max_timestamp.max(time);
    }
}

/// Typed view of a page over a raw byte buffer.
///
/// The view does not own the backing memory format decisions: the buffer
/// may be a heap allocation, a borrowed slice, or a file mapping. Read
/// operations are available whenever the buffer is readable; mutation
/// requires a writable buffer.
///
/// While a writer is appending no concurrent writer is permitted.
/// Readers snapshot `count` and `sync_index` through [`Page::search`]
/// and stay within that prefix.
pub struct Page<B> {
    data: B,
}

impl<B: AsRef<[u8]>> Page<B> {
    /// Construct a view over an existing page image, validating the
    /// header invariants. Fails with [`Error::Corruption`] if the image
    /// is not a well-formed page.
    pub fn from_buffer(data: B) -> Result<Self> {
        let page = Page { data };
        page.validate()?;
        Ok(page)
    }

    /// Construct a view without validation. The caller must know the
    /// buffer holds a well-formed page.
    pub(crate) fn view(data: B) -> Self {
        Page { data }
    }

    /// Consume the view and return the backing buffer
    pub fn into_inner(self) -> B {
        self.data
    }

    fn buf(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn read_u32(&self, off: usize) -> u32 {
        (&self.buf()[off..off + 4]).get_u32_ne()
    }

    fn read_u64(&self, off: usize) -> u64 {
        (&self.buf()[off..off + 8]).get_u64_ne()
    }

    fn read_i64(&self, off: usize) -> i64 {
        (&self.buf()[off..off + 8]).get_i64_ne()
    }

    /// Page type tag
    pub fn page_type(&self) -> Result<PageType> {
        PageType::try_from(self.read_u32(offsets::TYPE))
    }

    /// Number of entries stored in the page
    pub fn count(&self) -> u32 {
        self.read_u32(offsets::COUNT)
    }

    /// Number of leading index slots guaranteed to be sorted
    pub fn sync_index(&self) -> u32 {
        self.read_u32(offsets::SYNC_INDEX)
    }

    /// Number of write sessions opened on this page
    pub fn open_count(&self) -> u32 {
        self.read_u32(offsets::OPEN_COUNT)
    }

    /// Number of write sessions closed on this page
    pub fn close_count(&self) -> u32 {
        self.read_u32(offsets::CLOSE_COUNT)
    }

    /// Page index within the volume
    pub fn page_id(&self) -> u32 {
        self.read_u32(offsets::PAGE_ID)
    }

    /// Total page size in bytes
    pub fn length(&self) -> u64 {
        self.read_u64(offsets::LENGTH)
    }

    /// Byte offset of the most recently written entry; entries occupy
    /// `[last_offset, length)`
    pub fn last_offset(&self) -> u64 {
        self.read_u64(offsets::LAST_OFFSET)
    }

    /// Current bounding box
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox {
            min_id: self.read_u64(offsets::BBOX_MIN_ID),
            max_id: self.read_u64(offsets::BBOX_MAX_ID),
            min_timestamp: self.read_i64(offsets::BBOX_MIN_TS),
            max_timestamp: self.read_i64(offsets::BBOX_MAX_TS),
        }
    }

    /// Check whether (param, time) lies within the page bounding box.
    ///
    /// Inclusive on both dimensions: a series absent from the page can
    /// still pass if another series shares the id range. The search
    /// filters by exact id, so this is purely an admission test.
    pub fn inside_bbox(&self, param: ParamId, time: Timestamp) -> bool {
        self.bbox().contains(param, time)
    }

    /// Bytes available for one more entry plus its index slot
    pub fn free_space(&self) -> u64 {
        let reserved = (HEADER_SIZE + self.count() as usize * INDEX_SLOT_SIZE) as u64;
        self.last_offset().saturating_sub(reserved)
    }

    /// A page is quiescent when every opened write session was closed
    pub fn is_quiescent(&self) -> bool {
        self.open_count() == self.close_count()
    }

    /// Convert an entry index to its byte offset
    pub fn index_offset(&self, index: u32) -> Option<u32> {
        if index >= self.count() {
            return None;
        }
        Some(self.read_u32(offsets::INDEX + index as usize * INDEX_SLOT_SIZE))
    }

    /// Zero-copy view of the entry at `index`, or `None` if the index is
    /// out of range
    pub fn read_entry_at(&self, index: u32) -> Option<EntryRef<'_>> {
        let offset = self.index_offset(index)?;
        decode_entry(self.buf(), offset).ok()
    }

    /// Zero-copy view of the entry at a byte offset
    pub fn read_entry(&self, offset: u32) -> Result<EntryRef<'_>> {
        decode_entry(self.buf(), offset)
    }

    /// Copy the payload of the entry at `index` into `buf`.
    ///
    /// Size negotiation: returns the payload length on success, the
    /// negated payload length if `buf` is too small (so the caller can
    /// resize and retry), and 0 if the index is out of range.
    pub fn copy_entry_at(&self, index: u32, buf: &mut [u8]) -> isize {
        let entry = match self.read_entry_at(index) {
            Some(entry) => entry,
            None => return 0,
        };
        let len = entry.payload.len();
        if buf.len() < len {
            return -(len as isize);
        }
        buf[..len].copy_from_slice(entry.payload);
        len as isize
    }

    /// Bounds-checked view of payload bytes referenced by a blob
    /// descriptor. The range must lie past the header.
    pub fn payload_at(&self, offset: u32, len: u32) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| Error::BadArg("payload range overflows".into()))?;
        if start < HEADER_SIZE || end > self.buf().len() {
            return Err(Error::BadArg(format!(
                "payload range {}..{} outside the entry region",
                start, end
            )));
        }
        Ok(&self.buf()[start..end])
    }

    /// Search the page for one series over a time window. The cursor
    /// snapshots `count` and `sync_index` at creation and yields entries
    /// lazily; see [`PageCursor`].
    pub fn search(&self, query: SearchQuery) -> PageCursor<'_> {
        PageCursor::new(self.buf(), self.count(), self.sync_index(), self.bbox(), query)
    }

    fn validate(&self) -> Result<()> {
        let byte_len = self.buf().len();
        if byte_len < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "page of {} bytes is shorter than the header",
                byte_len
            )));
        }
        let len = byte_len as u64;
        if len > MAX_PAGE_SIZE {
            return Err(Error::Corruption(format!("page of {} bytes exceeds maximum", len)));
        }
        self.page_type()?;
        if self.length() != len {
            return Err(Error::Corruption(format!(
                "length field {} does not match mapping of {} bytes",
                self.length(),
                len
            )));
        }

        let count = self.count() as u64;
        let last_offset = self.last_offset();
        if last_offset > len {
            return Err(Error::Corruption("last_offset beyond page end".into()));
        }
        if last_offset < HEADER_SIZE as u64 + count * INDEX_SLOT_SIZE as u64 {
            return Err(Error::Corruption("index overlaps entry region".into()));
        }
        if self.sync_index() > self.count() {
            return Err(Error::Corruption("sync_index exceeds entry count".into()));
        }
        if self.close_count() > self.open_count() {
            return Err(Error::Corruption("close_count exceeds open_count".into()));
        }
        for i in 0..self.count() {
            let offset = self.read_u32(offsets::INDEX + i as usize * INDEX_SLOT_SIZE) as u64;
            if offset < last_offset || offset >= len {
                return Err(Error::Corruption(format!(
                    "index slot {} points outside the entry region",
                    i
                )));
            }
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Page<B> {
    /// Format a raw buffer as an empty page
    pub fn format(data: B, page_type: PageType, page_id: u32) -> Result<Self> {
        let byte_len = data.as_ref().len();
        if byte_len < HEADER_SIZE {
            return Err(Error::BadArg(format!(
                "page buffer of {} bytes is shorter than the header",
                byte_len
            )));
        }
        if byte_len as u64 > MAX_PAGE_SIZE {
            return Err(Error::BadArg(format!(
                "page buffer of {} bytes exceeds maximum",
                byte_len
            )));
        }

        let mut page = Page { data };
        page.write_u32(offsets::TYPE, page_type as u32);
        page.write_u32(offsets::COUNT, 0);
        page.write_u32(offsets::SYNC_INDEX, 0);
        page.write_u32(offsets::OPEN_COUNT, 0);
        page.write_u32(offsets::CLOSE_COUNT, 0);
        page.write_u32(offsets::PAGE_ID, page_id);
        page.write_u64(offsets::LENGTH, byte_len as u64);
        page.write_u64(offsets::LAST_OFFSET, byte_len as u64);
        page.write_bbox(BoundingBox::empty());
        Ok(page)
    }

    fn write_u32(&mut self, off: usize, value: u32) {
        self.data.as_mut()[off..off + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_u64(&mut self, off: usize, value: u64) {
        self.data.as_mut()[off..off + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_i64(&mut self, off: usize, value: i64) {
        self.data.as_mut()[off..off + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_bbox(&mut self, bbox: BoundingBox) {
        self.write_u64(offsets::BBOX_MIN_ID, bbox.min_id);
        self.write_u64(offsets::BBOX_MAX_ID, bbox.max_id);
        self.write_i64(offsets::BBOX_MIN_TS, bbox.min_timestamp);
        self.write_i64(offsets::BBOX_MAX_TS, bbox.max_timestamp);
    }

    /// Append an entry to the page.
    ///
    /// Writes the entry blob just below `last_offset`, records its
    /// offset in the next index slot, and widens the bounding box.
    /// Fails with [`Error::Overflow`] when the remaining free space
    /// cannot hold the entry plus its index slot.
    pub fn add_entry(&mut self, param_id: ParamId, timestamp: Timestamp, payload: &[u8]) -> Result<()> {
        let size = entry_size(payload.len()) as u64;
        if self.free_space() < size + INDEX_SLOT_SIZE as u64 {
            return Err(Error::Overflow);
        }

        let count = self.count();
        let new_offset = self.last_offset() - size;
        let start = new_offset as usize;
        entry::encode_entry(
            &mut self.data.as_mut()[start..start + size as usize],
            param_id,
            timestamp,
            payload,
        );

        self.write_u32(
            offsets::INDEX + count as usize * INDEX_SLOT_SIZE,
            new_offset as u32,
        );
        self.write_u32(offsets::COUNT, count + 1);
        self.write_u64(offsets::LAST_OFFSET, new_offset);

        let mut bbox = self.bbox();
        bbox.widen(param_id, timestamp);
        self.write_bbox(bbox);
        Ok(())
    }

    /// Reset the page for a new write session. Clears the count, index
    /// and bounding box and bumps `open_count`. Stale payload bytes are
    /// not zeroed.
    pub fn reuse(&mut self) {
        let length = self.length();
        self.write_u32(offsets::COUNT, 0);
        self.write_u32(offsets::SYNC_INDEX, 0);
        self.write_u64(offsets::LAST_OFFSET, length);
        self.write_bbox(BoundingBox::empty());
        let open = self.open_count();
        self.write_u32(offsets::OPEN_COUNT, open + 1);
    }

    /// Close the current write session. No further writes are permitted
    /// until [`Page::reuse`].
    pub fn close(&mut self) {
        let close = self.close_count();
        self.write_u32(offsets::CLOSE_COUNT, close + 1);
    }

    /// Stable-sort the whole index by (param id, timestamp) and mark it
    /// fully synchronized. Idempotent.
    pub fn sort(&mut self) {
        let count = self.count();
        let mut keys: Vec<(ParamId, Timestamp, u32)> = Vec::with_capacity(count as usize);
        for i in 0..count {
            let offset = self.read_u32(offsets::INDEX + i as usize * INDEX_SLOT_SIZE);
            if let Some((param, time)) = entry::decode_key(self.buf(), offset) {
                keys.push((param, time, offset));
            }
        }
        keys.sort_by_key(|&(param, time, _)| (param, time));
        for (i, &(_, _, offset)) in keys.iter().enumerate() {
            self.write_u32(offsets::INDEX + i * INDEX_SLOT_SIZE, offset);
        }
        self.write_u32(offsets::SYNC_INDEX, keys.len() as u32);
    }

    /// Replace the index prefix with a caller-supplied pre-sorted
    /// permutation of entry offsets and mark that prefix synchronized.
    /// Used when ordering is computed off-page, e.g. during compaction.
    pub fn sync_indexes(&mut self, ordered_offsets: &[u32]) -> Result<()> {
        if ordered_offsets.len() > self.count() as usize {
            return Err(Error::BadArg(format!(
                "{} offsets supplied for a page holding {} entries",
                ordered_offsets.len(),
                self.count()
            )));
        }
        for (i, &offset) in ordered_offsets.iter().enumerate() {
            self.write_u32(offsets::INDEX + i * INDEX_SLOT_SIZE, offset);
        }
        self.write_u32(offsets::SYNC_INDEX, ordered_offsets.len() as u32);
        Ok(())
    }
}
