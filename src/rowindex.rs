//! Paginated row-offset index: row id -> heap offset.
//!
//! ```text
//! +---------------------------------------------------------------+
//! | u32 version=3 | u32 pages present | u32 total rows | u32 width |
//! +---------------------------------------------------------------+
//! | page 0    1024 slots * width bytes                             |
//! | page 1                                                         |
//! | ...                                                            |
//! +---------------------------------------------------------------+
//! | trailer (sparse only)                                          |
//! |  u32 bitmap words | u32 blocks total | u32 pages present       |
//! |  u32 leading non-zero words | bitmap bytes                     |
//! +---------------------------------------------------------------+
//! ```
//!
//! Row `id` lives in logical block `(id - 1) / 1024`, slot `(id - 1) % 1024`.
//! Dense files store every block up to the last one. Sparse files store only
//! the blocks whose bit is set in the trailer bitmap; the physical page of a
//! block is the number of set bits below it. A zero slot means no row.

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::constant::{BITMAP_WORD_BITS, INDEX_HEADER_SIZE, INDEX_VERSION, ROWS_PER_PAGE, TRAILER_FIXED_SIZE};
use crate::dberror::DbError;
use crate::storage::FileHandle;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexState {
    pub pages_present: u32,
    pub total_rows: u32,
    /// One bit per logical block; `None` while the file is dense.
    pub bitmap: Option<Vec<u8>>,
    pub header_dirty: bool,
    pub trailer_dirty: bool,
}

/// Bytes saved before pages are inserted, to put the file back on failure.
struct InsertUndo {
    at: u64,
    tail: Vec<u8>,
    old_len: u64,
    old_state: IndexState,
}

#[derive(Debug)]
pub struct RowIndex {
    fh: FileHandle,
    width: u32,
    pub(crate) st: IndexState,
}

fn block_of(id: u32) -> u32 {
    (id - 1) / ROWS_PER_PAGE
}

fn slot_of(id: u32) -> u32 {
    (id - 1) % ROWS_PER_PAGE
}

fn blocks_for(rows: u32) -> u32 {
    rows.div_ceil(ROWS_PER_PAGE)
}

fn bit_set(bitmap: &[u8], block: u32) -> bool {
    bitmap.get((block / 8) as usize).map(|b| b & (1 << (block % 8)) != 0).unwrap_or(false)
}

fn set_bit(bitmap: &mut Vec<u8>, block: u32) {
    let byte = (block / 8) as usize;
    if bitmap.len() <= byte {
        bitmap.resize(byte + 1, 0);
    }
    bitmap[byte] |= 1 << (block % 8);
}

fn bits_below(bitmap: &[u8], block: u32) -> u32 {
    let full = (block / 8) as usize;
    let mut n: u32 = bitmap.iter().take(full).map(|b| b.count_ones()).sum();
    if let Some(b) = bitmap.get(full) {
        n += (b & ((1u16 << (block % 8)) - 1) as u8).count_ones();
    }
    n
}

pub(crate) fn encode_header(st: &IndexState, width: u32) -> Result<Vec<u8>, DbError> {
    let mut out = Vec::with_capacity(INDEX_HEADER_SIZE as usize);
    out.write_u32::<LittleEndian>(INDEX_VERSION)?;
    out.write_u32::<LittleEndian>(st.pages_present)?;
    out.write_u32::<LittleEndian>(st.total_rows)?;
    out.write_u32::<LittleEndian>(width)?;
    Ok(out)
}

/// Trailer bytes for a sparse index. The bitmap is padded to a multiple of
/// 32 words.
pub(crate) fn encode_trailer(st: &IndexState) -> Result<Option<Vec<u8>>, DbError> {
    let Some(bitmap) = &st.bitmap else {
        return Ok(None);
    };
    let words = (bitmap.len() as u32).div_ceil(4).div_ceil(BITMAP_WORD_BITS) * BITMAP_WORD_BITS;
    let mut bytes = bitmap.clone();
    bytes.resize(words as usize * 4, 0);
    let trailing_zero_words = bytes.chunks(4).rev().take_while(|w| w.iter().all(|b| *b == 0)).count() as u32;

    let mut out = Vec::with_capacity(TRAILER_FIXED_SIZE as usize + bytes.len());
    out.write_u32::<LittleEndian>(words)?;
    out.write_u32::<LittleEndian>(blocks_for(st.total_rows))?;
    out.write_u32::<LittleEndian>(st.pages_present)?;
    out.write_u32::<LittleEndian>(words - trailing_zero_words)?;
    out.extend_from_slice(&bytes);
    Ok(Some(out))
}

impl RowIndex {
    pub fn create(path: &Path, width: u32) -> Result<Self, DbError> {
        let st = IndexState { pages_present: 0, total_rows: 0, bitmap: None, header_dirty: false, trailer_dirty: false };
        let mut fh = FileHandle::create(path)?;
        fh.write_at(0, &encode_header(&st, width)?)?;
        fh.flush()?;
        Ok(RowIndex { fh, width, st })
    }

    pub fn open(path: &Path) -> Result<Self, DbError> {
        let mut fh = FileHandle::open(path)?;
        let header = fh.read_vec_at(0, INDEX_HEADER_SIZE as usize)?;
        let mut cur = Cursor::new(&header[..]);
        let version = cur.read_u32::<LittleEndian>()?;
        let pages_present = cur.read_u32::<LittleEndian>()?;
        let total_rows = cur.read_u32::<LittleEndian>()?;
        let width = cur.read_u32::<LittleEndian>()?;
        if version != INDEX_VERSION {
            return Err(DbError::corrupt(format!("{}: unsupported index version {}", path.display(), version)));
        }
        if width != 4 && width != 8 {
            return Err(DbError::corrupt(format!("{}: unsupported offset width {}", path.display(), width)));
        }

        let pages_end = INDEX_HEADER_SIZE + pages_present as u64 * ROWS_PER_PAGE as u64 * width as u64;
        let file_len = fh.file_len()?;
        if file_len < pages_end {
            return Err(DbError::corrupt(format!(
                "{}: {} pages announced but file holds {} bytes",
                path.display(),
                pages_present,
                file_len
            )));
        }

        let mut bitmap = None;
        if file_len > pages_end {
            let fixed = fh.read_vec_at(pages_end, TRAILER_FIXED_SIZE as usize)?;
            let mut cur = Cursor::new(&fixed[..]);
            let words = cur.read_u32::<LittleEndian>()?;
            let _blocks_total = cur.read_u32::<LittleEndian>()?;
            let trailer_pages = cur.read_u32::<LittleEndian>()?;
            let _leading = cur.read_u32::<LittleEndian>()?;
            if words > 0 {
                let bytes = fh.read_vec_at(pages_end + TRAILER_FIXED_SIZE, words as usize * 4)?;
                let set: u32 = bytes.iter().map(|b| b.count_ones()).sum();
                if set != pages_present || trailer_pages != pages_present {
                    return Err(DbError::corrupt(format!(
                        "{}: bitmap marks {} blocks, header says {} pages",
                        path.display(),
                        set,
                        pages_present
                    )));
                }
                bitmap = Some(bytes);
            }
        } else if pages_present < blocks_for(total_rows) {
            return Err(DbError::corrupt(format!(
                "{}: dense index with {} pages cannot hold {} rows",
                path.display(),
                pages_present,
                total_rows
            )));
        }

        let st = IndexState { pages_present, total_rows, bitmap, header_dirty: false, trailer_dirty: false };
        Ok(RowIndex { fh, width, st })
    }

    pub fn path(&self) -> &Path {
        self.fh.path()
    }

    pub fn offset_width(&self) -> u32 {
        self.width
    }

    pub fn total_rows(&self) -> u32 {
        self.st.total_rows
    }

    pub fn pages_present(&self) -> u32 {
        self.st.pages_present
    }

    pub fn is_sparse(&self) -> bool {
        self.st.bitmap.is_some()
    }

    pub fn page_size(&self) -> u64 {
        ROWS_PER_PAGE as u64 * self.width as u64
    }

    pub fn page_pos(&self, phys: u32) -> u64 {
        INDEX_HEADER_SIZE + phys as u64 * self.page_size()
    }

    fn pages_end(&self) -> u64 {
        self.page_pos(self.st.pages_present)
    }

    pub(crate) fn fh_mut(&mut self) -> &mut FileHandle {
        &mut self.fh
    }

    pub(crate) fn reopen(&mut self) -> Result<(), DbError> {
        let path = self.fh.path().to_path_buf();
        self.fh = FileHandle::open(&path)?;
        Ok(())
    }

    /// Physical page holding logical `block`, if it is stored.
    pub fn physical_page(&self, block: u32) -> Option<u32> {
        match &self.st.bitmap {
            None => (block < self.st.pages_present).then_some(block),
            Some(bm) => bit_set(bm, block).then(|| bits_below(bm, block)),
        }
    }

    /// Logical block stored at physical page `phys`.
    pub fn block_of_page(&self, phys: u32) -> Option<u32> {
        match &self.st.bitmap {
            None => (phys < self.st.pages_present).then_some(phys),
            Some(bm) => (0..(bm.len() as u32 * 8)).filter(|b| bit_set(bm, *b)).nth(phys as usize),
        }
    }

    fn decode_slot(&self, bytes: &[u8]) -> u64 {
        let mut b = [0u8; 8];
        b[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(b)
    }

    fn encode_slot(&self, offset: u64) -> Result<Vec<u8>, DbError> {
        if self.width < 8 && offset >> (8 * self.width) != 0 {
            return Err(DbError::RecordTooLarge(format!(
                "offset {} does not fit in {} bytes",
                offset, self.width
            )));
        }
        Ok(offset.to_le_bytes()[..self.width as usize].to_vec())
    }

    // ══════════════════════════════════════ LOOKUP ══════════════════════════════════════

    /// Heap offset of row `id`, 0 when the row does not exist.
    pub fn offset_for_row(&mut self, id: u32) -> Result<u64, DbError> {
        if id == 0 || id > self.st.total_rows {
            return Ok(0);
        }
        let Some(phys) = self.physical_page(block_of(id)) else {
            return Ok(0);
        };
        let pos = self.page_pos(phys) + slot_of(id) as u64 * self.width as u64;
        let bytes = self.fh.read_vec_at(pos, self.width as usize)?;
        Ok(self.decode_slot(&bytes))
    }

    pub fn read_page(&mut self, phys: u32) -> Result<Vec<u8>, DbError> {
        let pos = self.page_pos(phys);
        self.fh.read_vec_at(pos, self.page_size() as usize)
    }

    /// Slots of a raw page as offsets.
    pub fn page_slots(&self, page: &[u8]) -> Vec<u64> {
        page.chunks(self.width as usize).map(|c| self.decode_slot(c)).collect()
    }

    /// Raw page bytes for a list of offsets.
    pub fn encode_page(&self, slots: &[u64]) -> Result<Vec<u8>, DbError> {
        let mut out = Vec::with_capacity(self.page_size() as usize);
        for s in slots {
            out.extend(self.encode_slot(*s)?);
        }
        Ok(out)
    }

    /// Every `(row id, offset)` with a non-zero slot, in row id order.
    pub fn live_rows(&mut self) -> Result<Vec<(u32, u64)>, DbError> {
        let mut rows = Vec::new();
        for phys in 0..self.st.pages_present {
            let Some(block) = self.block_of_page(phys) else {
                return Err(DbError::corrupt(format!("page {} has no block in the bitmap", phys)));
            };
            let page = self.read_page(phys)?;
            for (slot, off) in self.page_slots(&page).into_iter().enumerate() {
                if off == 0 {
                    continue;
                }
                let id = block as u64 * ROWS_PER_PAGE as u64 + slot as u64 + 1;
                if id > self.st.total_rows as u64 {
                    return Err(DbError::corrupt(format!("slot for row {} beyond total rows {}", id, self.st.total_rows)));
                }
                rows.push((id as u32, off));
            }
        }
        Ok(rows)
    }

    // ══════════════════════════════════════ UPDATE ══════════════════════════════════════

    /// Points row `id` at `offset`, storing the block's page first if needed.
    /// Either everything changes or nothing does.
    pub fn assign_offset(&mut self, id: u32, offset: u64) -> Result<(), DbError> {
        if id == 0 {
            return Err(DbError::InvalidOperation("row ids start at 1".to_string()));
        }
        let slot = self.encode_slot(offset)?;
        let undo = self.ensure_page(block_of(id))?;
        let phys = self
            .physical_page(block_of(id))
            .ok_or_else(|| DbError::FatalInconsistency(format!("page for row {} missing after insert", id)))?;
        let pos = self.page_pos(phys) + slot_of(id) as u64 * self.width as u64;
        if let Err(e) = self.fh.write_at(pos, &slot) {
            if let Some(u) = undo {
                self.undo_insert(u);
            }
            return Err(e);
        }
        if id > self.st.total_rows {
            self.st.total_rows = id;
            if self.st.bitmap.is_some() {
                self.st.trailer_dirty = true;
            }
        }
        self.st.header_dirty = true;
        Ok(())
    }

    /// Zeroes the slot of row `id`. Pages are never released.
    pub fn clear_offset(&mut self, id: u32) -> Result<(), DbError> {
        if id == 0 || id > self.st.total_rows {
            return Ok(());
        }
        if let Some(phys) = self.physical_page(block_of(id)) {
            let pos = self.page_pos(phys) + slot_of(id) as u64 * self.width as u64;
            self.fh.write_at(pos, &vec![0u8; self.width as usize])?;
        }
        Ok(())
    }

    fn ensure_page(&mut self, block: u32) -> Result<Option<InsertUndo>, DbError> {
        if self.physical_page(block).is_some() {
            return Ok(None);
        }
        let old_state = self.st.clone();
        let present = self.st.pages_present;

        let (at, bitmap) = match &self.st.bitmap {
            // next block of a dense file: grow by one page
            None if block == present && present >= blocks_for(self.st.total_rows) => (present, None),
            None => {
                let mut bm = Vec::new();
                for b in 0..present {
                    set_bit(&mut bm, b);
                }
                set_bit(&mut bm, block);
                debug!(block, pages = present, "row index becomes sparse");
                (present, Some(bm))
            }
            Some(bm) => {
                let mut bm = bm.clone();
                set_bit(&mut bm, block);
                (bits_below(&bm, block), Some(bm))
            }
        };

        let undo = self.insert_zero_pages(at, 1, old_state)?;
        self.st.pages_present = present + 1;
        if bitmap.is_some() {
            self.st.bitmap = bitmap;
            self.st.trailer_dirty = true;
        }
        self.st.header_dirty = true;
        Ok(Some(undo))
    }

    /// Shifts pages `at..` up by `n` pages and zeroes the gap.
    fn insert_zero_pages(&mut self, at: u32, n: u32, old_state: IndexState) -> Result<InsertUndo, DbError> {
        let start = self.page_pos(at);
        let old_len = self.fh.file_len()?;
        let moved_len = self.pages_end().saturating_sub(start);
        let tail = if old_len > start { self.fh.read_vec_at(start, (old_len - start) as usize)? } else { Vec::new() };
        let undo = InsertUndo { at: start, tail, old_len, old_state };

        let gap = n as u64 * self.page_size();
        let mut buf = vec![0u8; gap as usize];
        buf.extend_from_slice(&undo.tail[..(moved_len as usize).min(undo.tail.len())]);
        if let Err(e) = self.fh.write_at(start, &buf) {
            self.undo_insert(undo);
            return Err(e);
        }
        Ok(undo)
    }

    fn undo_insert(&mut self, undo: InsertUndo) {
        let restored = self.fh.write_at(undo.at, &undo.tail).and_then(|_| self.fh.set_len(undo.old_len));
        if let Err(e) = restored {
            warn!(file = %self.fh.path().display(), error = %e, "could not restore index pages after failed insert");
        }
        self.st = undo.old_state;
    }

    pub fn sync(&mut self) -> Result<(), DbError> {
        if self.st.trailer_dirty {
            if let Some(trailer) = encode_trailer(&self.st)? {
                let end = self.pages_end();
                self.fh.write_at(end, &trailer)?;
                self.fh.set_len(end + trailer.len() as u64)?;
            }
            self.st.trailer_dirty = false;
        }
        if self.st.header_dirty {
            let mut counts = Vec::with_capacity(8);
            counts.write_u32::<LittleEndian>(self.st.pages_present)?;
            counts.write_u32::<LittleEndian>(self.st.total_rows)?;
            self.fh.write_at(4, &counts)?;
            self.st.header_dirty = false;
        }
        self.fh.flush()?;
        self.fh.sync_all()
    }
}

#[cfg(test)]
mod rowindex_test {
    use super::*;
    use crate::storage::failpoint;
    use tempfile::tempdir;

    fn new_index(dir: &Path, width: u32) -> RowIndex {
        RowIndex::create(&dir.join("t.tucotablx"), width).unwrap()
    }

    #[test]
    fn dense_growth() {
        let dir = tempdir().unwrap();
        let mut ix = new_index(dir.path(), 4);
        for id in 1..=1025u32 {
            ix.assign_offset(id, 1000 + id as u64).unwrap();
        }
        assert_eq!(ix.pages_present(), 2);
        assert!(!ix.is_sparse());
        assert_eq!(ix.offset_for_row(1025).unwrap(), 2025);
        assert_eq!(ix.offset_for_row(1026).unwrap(), 0);
        ix.sync().unwrap();
        assert_eq!(ix.fh.file_len().unwrap(), 16 + 2 * 4096);
    }

    #[test]
    fn far_id_goes_sparse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tucotablx");
        {
            let mut ix = new_index(dir.path(), 4);
            ix.assign_offset(1, 40).unwrap();
            ix.assign_offset(5000, 80).unwrap();
            assert!(ix.is_sparse());
            assert_eq!(ix.pages_present(), 2);
            assert_eq!(ix.physical_page(4), Some(1));
            assert_eq!(ix.physical_page(2), None);
            ix.sync().unwrap();
        }
        let mut ix = RowIndex::open(&path).unwrap();
        assert_eq!(ix.total_rows(), 5000);
        assert_eq!(ix.offset_for_row(5000).unwrap(), 80);
        assert_eq!(ix.offset_for_row(2048).unwrap(), 0);

        // trailer: 32 words of bitmap, 5 blocks, 2 pages, 1 leading word
        let end = 16 + 2 * 4096;
        let t = ix.fh.read_vec_at(end, 16).unwrap();
        assert_eq!(&t[0..4], &32u32.to_le_bytes());
        assert_eq!(&t[4..8], &5u32.to_le_bytes());
        assert_eq!(&t[8..12], &2u32.to_le_bytes());
        assert_eq!(&t[12..16], &1u32.to_le_bytes());
        assert_eq!(ix.fh.file_len().unwrap(), end + 16 + 128);
    }

    #[test]
    fn sparse_insert_shifts_later_pages() {
        let dir = tempdir().unwrap();
        let mut ix = new_index(dir.path(), 4);
        ix.assign_offset(10, 100).unwrap();
        ix.assign_offset(4000, 400).unwrap();
        ix.assign_offset(9000, 900).unwrap();
        // block 2 lands between blocks 0 and 3
        ix.assign_offset(2100, 210).unwrap();
        assert_eq!(ix.pages_present(), 4);
        assert_eq!(ix.physical_page(2), Some(1));
        assert_eq!(ix.physical_page(3), Some(2));
        let rows = ix.live_rows().unwrap();
        assert_eq!(rows, vec![(10, 100), (2100, 210), (4000, 400), (9000, 900)]);
    }

    #[test]
    fn clear_keeps_pages() {
        let dir = tempdir().unwrap();
        let mut ix = new_index(dir.path(), 8);
        ix.assign_offset(3, 1 << 40).unwrap();
        assert_eq!(ix.offset_for_row(3).unwrap(), 1 << 40);
        ix.clear_offset(3).unwrap();
        assert_eq!(ix.offset_for_row(3).unwrap(), 0);
        assert_eq!(ix.pages_present(), 1);
        assert_eq!(ix.total_rows(), 3);
    }

    #[test]
    fn offset_must_fit_width() {
        let dir = tempdir().unwrap();
        let mut ix = new_index(dir.path(), 4);
        assert!(matches!(ix.assign_offset(1, 1 << 33), Err(DbError::RecordTooLarge(_))));
        assert_eq!(ix.pages_present(), 0);
    }

    #[test]
    fn failed_slot_write_undoes_page_insert() {
        let dir = tempdir().unwrap();
        let mut ix = new_index(dir.path(), 4);
        ix.assign_offset(1, 40).unwrap();
        ix.assign_offset(5000, 80).unwrap();
        ix.sync().unwrap();
        let before_len = ix.fh.file_len().unwrap();
        let before = ix.st.clone();

        // page insert passes, slot write fails
        failpoint::arm("write_at", 1);
        assert!(ix.assign_offset(3000, 60).is_err());
        failpoint::disarm_all();

        assert_eq!(ix.st, before);
        assert_eq!(ix.fh.file_len().unwrap(), before_len);
        assert_eq!(ix.offset_for_row(5000).unwrap(), 80);
        assert_eq!(ix.offset_for_row(3000).unwrap(), 0);
    }
}
