//! Heap file: the variable-length record store of a table.
//!
//! ```text
//! +--------------------------------------------------------------------------+
//! | header (40 bytes)                                                        |
//! |  u32 version=3 | u32 valid rows | u32 max buffer | u32 5 | u32 0 | u32 0 |
//! |  u64 file size | u64 field descriptor offset                             |
//! +--------------------------------------------------------------------------+
//! | creator block (optional)   u32 len | bytes                               |
//! +--------------------------------------------------------------------------+
//! | field descriptors          u32 len | body            <- descriptor offset|
//! +--------------------------------------------------------------------------+
//! | record    i32 len | payload                          <- data start       |
//! | record    i32 len | payload                                              |
//! | tombstone i32 -len| zeros                                                |
//! | ...                                                                      |
//! +--------------------------------------------------------------------------+
//! ```
//!
//! A negative length marks a deleted record of `abs(len)` bytes. Every byte
//! between data start and file size belongs either to a live record or to a
//! free list entry.

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::constant::{FREELIST_EXT, HEAP_HEADER_SIZE, HEAP_MAGIC, HEAP_VERSION, RECORD_PREFIX_SIZE};
use crate::dberror::DbError;
use crate::freelist::{FreeEntry, FreeList};
use crate::storage::FileHandle;

/// In-memory copy of everything the heap header and descriptor block say,
/// plus the free list. Cloned as a snapshot before a repack.
#[derive(Debug, Clone)]
pub(crate) struct HeapState {
    pub valid_count: u32,
    /// Largest of the descriptor block and of any record.
    pub max_buffer: u32,
    pub row_buffer_max: u32,
    pub file_size: u64,
    pub fd_offset: u64,
    pub creator: Option<Vec<u8>>,
    pub fd_body: Vec<u8>,
    pub extent_offset: Option<usize>,
    pub freelist: FreeList,
    pub header_dirty: bool,
    pub fd_dirty: bool,
    pub extent_dirty: bool,
}

impl HeapState {
    pub fn fd_len(&self) -> u64 {
        self.fd_body.len() as u64
    }

    pub fn data_start(&self) -> u64 {
        self.fd_offset + RECORD_PREFIX_SIZE + self.fd_len()
    }

    pub fn creator_block_len(creator: Option<&[u8]>) -> u64 {
        creator.map(|c| RECORD_PREFIX_SIZE + c.len() as u64).unwrap_or(0)
    }
}

/// Where a new record goes.
/// Heap state before an `append`, consumed by `undo_append`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppendMark {
    file_size: u64,
    max_buffer: u32,
    row_buffer_max: u32,
    header_dirty: bool,
    freelist_dirty: bool,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    offset: u64,
    /// Length written in the prefix; at least the payload length.
    slot_len: u32,
    from_free: Option<FreeEntry>,
    remainder: Option<FreeEntry>,
}

#[derive(Debug)]
pub struct HeapFile {
    fh: FileHandle,
    freelist_path: PathBuf,
    offset_width: u32,
    pub(crate) st: HeapState,
}

pub(crate) fn encode_header(st: &HeapState) -> Result<Vec<u8>, DbError> {
    let mut out = Vec::with_capacity(HEAP_HEADER_SIZE as usize);
    out.write_u32::<LittleEndian>(HEAP_VERSION)?;
    out.write_u32::<LittleEndian>(st.valid_count)?;
    out.write_u32::<LittleEndian>(st.max_buffer)?;
    out.write_u32::<LittleEndian>(HEAP_MAGIC)?;
    out.write_u32::<LittleEndian>(0)?;
    out.write_u32::<LittleEndian>(0)?;
    out.write_u64::<LittleEndian>(st.file_size)?;
    out.write_u64::<LittleEndian>(st.fd_offset)?;
    Ok(out)
}

/// Header, creator block and descriptor block, as they sit at offset 0.
pub(crate) fn encode_prefix(st: &HeapState) -> Result<Vec<u8>, DbError> {
    let mut out = encode_header(st)?;
    if let Some(c) = &st.creator {
        out.write_u32::<LittleEndian>(c.len() as u32)?;
        out.write_all(c)?;
    }
    out.write_u32::<LittleEndian>(st.fd_body.len() as u32)?;
    out.write_all(&st.fd_body)?;
    Ok(out)
}

impl HeapFile {
    pub fn create(
        path: &Path,
        creator: Option<&str>,
        fd_body: Vec<u8>,
        extent_offset: Option<usize>,
        offset_width: u32,
    ) -> Result<Self, DbError> {
        let creator = creator.map(|c| c.as_bytes().to_vec());
        let fd_offset = HEAP_HEADER_SIZE + HeapState::creator_block_len(creator.as_deref());
        let fd_len = u32::try_from(fd_body.len()).map_err(|_| DbError::RecordTooLarge("field descriptors".to_string()))?;
        let mut st = HeapState {
            valid_count: 0,
            max_buffer: fd_len,
            row_buffer_max: 0,
            file_size: 0,
            fd_offset,
            creator,
            fd_body,
            extent_offset,
            freelist: FreeList::new(),
            header_dirty: false,
            fd_dirty: false,
            extent_dirty: false,
        };
        st.file_size = st.data_start();

        let mut fh = FileHandle::create(path)?;
        fh.write_at(0, &encode_prefix(&st)?)?;
        fh.flush()?;
        let freelist_path = path.with_extension(FREELIST_EXT);
        FreeList::delete(&freelist_path)?;
        Ok(HeapFile { fh, freelist_path, offset_width, st })
    }

    /// Opens an existing heap. The flag is false when the free list sidecar
    /// is unreadable or out of range, so the caller can rebuild it.
    pub fn open(path: &Path, offset_width: u32) -> Result<(Self, bool), DbError> {
        let mut fh = FileHandle::open(path)?;
        let header = fh.read_vec_at(0, HEAP_HEADER_SIZE as usize)?;
        let mut cur = Cursor::new(&header[..]);
        let version = cur.read_u32::<LittleEndian>()?;
        let valid_count = cur.read_u32::<LittleEndian>()?;
        let max_buffer = cur.read_u32::<LittleEndian>()?;
        let magic = cur.read_u32::<LittleEndian>()?;
        let _ = cur.read_u32::<LittleEndian>()?;
        let _ = cur.read_u32::<LittleEndian>()?;
        let file_size = cur.read_u64::<LittleEndian>()?;
        let fd_offset = cur.read_u64::<LittleEndian>()?;
        if version != HEAP_VERSION || magic != HEAP_MAGIC {
            return Err(DbError::corrupt(format!(
                "{}: not a heap file (version {}, magic {})",
                path.display(),
                version,
                magic
            )));
        }
        let physical = fh.file_len()?;
        if file_size > physical || fd_offset < HEAP_HEADER_SIZE || fd_offset >= file_size {
            return Err(DbError::corrupt(format!(
                "{}: header says size {} / descriptors at {}, file has {} bytes",
                path.display(),
                file_size,
                fd_offset,
                physical
            )));
        }

        let mut creator = None;
        if fd_offset > HEAP_HEADER_SIZE {
            let len = u32::from_le_bytes(read4(&mut fh, HEAP_HEADER_SIZE)?) as u64;
            if HEAP_HEADER_SIZE + RECORD_PREFIX_SIZE + len == fd_offset {
                creator = Some(fh.read_vec_at(HEAP_HEADER_SIZE + RECORD_PREFIX_SIZE, len as usize)?);
            } else {
                debug!(file = %path.display(), "unrecognized bytes between header and field descriptors");
                creator = Some(Vec::new());
            }
        }

        let fd_len = u32::from_le_bytes(read4(&mut fh, fd_offset)?) as u64;
        if fd_offset + RECORD_PREFIX_SIZE + fd_len > file_size {
            return Err(DbError::corrupt(format!("{}: field descriptors run past end of data", path.display())));
        }
        let fd_body = fh.read_vec_at(fd_offset + RECORD_PREFIX_SIZE, fd_len as usize)?;

        let freelist_path = path.with_extension(FREELIST_EXT);
        let (freelist, freelist_valid) = match FreeList::load(&freelist_path) {
            Ok(Some(fl)) => {
                let data_start = fd_offset + RECORD_PREFIX_SIZE + fd_len;
                let in_range = fl.entries().iter().all(|e| e.offset >= data_start && e.end() <= file_size);
                (fl, in_range)
            }
            Ok(None) => (FreeList::new(), true),
            Err(e) => {
                warn!(file = %freelist_path.display(), error = %e, "free list unreadable");
                (FreeList::new(), false)
            }
        };

        let st = HeapState {
            valid_count,
            max_buffer,
            row_buffer_max: 0,
            file_size,
            fd_offset,
            creator,
            fd_body,
            extent_offset: None,
            freelist,
            header_dirty: false,
            fd_dirty: false,
            extent_dirty: false,
        };
        Ok((HeapFile { fh, freelist_path, offset_width, st }, freelist_valid))
    }

    pub fn path(&self) -> &Path {
        self.fh.path()
    }

    pub fn freelist_path(&self) -> &Path {
        &self.freelist_path
    }

    pub fn file_size(&self) -> u64 {
        self.st.file_size
    }

    pub fn data_start(&self) -> u64 {
        self.st.data_start()
    }

    pub fn valid_count(&self) -> u32 {
        self.st.valid_count
    }

    pub fn set_valid_count(&mut self, n: u32) {
        self.st.valid_count = n;
        self.st.header_dirty = true;
    }

    pub fn freelist(&self) -> &FreeList {
        &self.st.freelist
    }

    pub fn fd_body(&self) -> &[u8] {
        &self.st.fd_body
    }

    pub fn set_extent_offset(&mut self, offset: Option<usize>) {
        self.st.extent_offset = offset;
    }

    /// Patches the encoded extent inside the cached descriptor block.
    pub fn set_extent_bytes(&mut self, bytes: &[u8]) -> Result<(), DbError> {
        let off = self
            .st
            .extent_offset
            .ok_or_else(|| DbError::InvalidOperation("table has no geometry field".to_string()))?;
        let end = off + bytes.len();
        if end > self.st.fd_body.len() {
            return Err(DbError::corrupt("extent outside the field descriptor block"));
        }
        if self.st.fd_body[off..end] != *bytes {
            self.st.fd_body[off..end].copy_from_slice(bytes);
            self.st.extent_dirty = true;
        }
        Ok(())
    }

    pub(crate) fn fh_mut(&mut self) -> &mut FileHandle {
        &mut self.fh
    }

    pub(crate) fn reopen(&mut self) -> Result<(), DbError> {
        let path = self.fh.path().to_path_buf();
        self.fh = FileHandle::open(&path)?;
        Ok(())
    }

    // ══════════════════════════════════════ RECORDS ══════════════════════════════════════

    /// Raw length prefix at `offset`.
    pub fn record_len(&mut self, offset: u64) -> Result<i32, DbError> {
        let prefix_end = offset
            .checked_add(RECORD_PREFIX_SIZE)
            .ok_or_else(|| DbError::corrupt(format!("record offset {} overflows", offset)))?;
        if offset < self.data_start() || prefix_end > self.st.file_size {
            return Err(DbError::corrupt(format!("record offset {} outside the data area", offset)));
        }
        Ok(i32::from_le_bytes(read4(&mut self.fh, offset)?))
    }

    /// Payload of the live record at `offset`.
    pub fn read_record(&mut self, offset: u64) -> Result<Vec<u8>, DbError> {
        let len = self.record_len(offset)?;
        if len < 0 {
            return Err(DbError::corrupt(format!("offset {} points at a deleted record", offset)));
        }
        let end = offset + RECORD_PREFIX_SIZE + len as u64;
        if end > self.st.file_size {
            return Err(DbError::corrupt(format!(
                "record at {} of {} bytes runs past end of data ({})",
                offset, len, self.st.file_size
            )));
        }
        self.fh.read_vec_at(offset + RECORD_PREFIX_SIZE, len as usize)
    }

    fn place(&mut self, payload_len: u32) -> Result<Placement, DbError> {
        let needed = payload_len
            .checked_add(RECORD_PREFIX_SIZE as u32)
            .ok_or_else(|| DbError::RecordTooLarge(format!("record of {} bytes", payload_len)))?;

        if let Some(hole) = self.st.freelist.take_first_fit(needed) {
            let spare = hole.len - needed;
            // a remainder too small for a tombstone header becomes padding
            if (spare as u64) >= RECORD_PREFIX_SIZE {
                return Ok(Placement {
                    offset: hole.offset,
                    slot_len: payload_len,
                    from_free: Some(hole),
                    remainder: Some(FreeEntry { offset: hole.offset + needed as u64, len: spare }),
                });
            }
            return Ok(Placement {
                offset: hole.offset,
                slot_len: hole.len - RECORD_PREFIX_SIZE as u32,
                from_free: Some(hole),
                remainder: None,
            });
        }

        let end = self.st.file_size + needed as u64;
        if self.offset_width < 8 && end >> (8 * self.offset_width) != 0 {
            return Err(DbError::RecordTooLarge(format!(
                "heap would reach {} bytes, beyond what {}-byte offsets address",
                end, self.offset_width
            )));
        }
        Ok(Placement { offset: self.st.file_size, slot_len: payload_len, from_free: None, remainder: None })
    }

    fn write_slot(&mut self, offset: u64, slot_len: u32, payload: &[u8]) -> Result<(), DbError> {
        let mut buf = Vec::with_capacity(RECORD_PREFIX_SIZE as usize + slot_len as usize);
        buf.extend_from_slice(&slot_len.to_le_bytes());
        buf.extend_from_slice(payload);
        buf.resize(RECORD_PREFIX_SIZE as usize + slot_len as usize, 0);
        self.fh.write_at(offset, &buf)
    }

    fn write_tombstone_header(&mut self, entry: &FreeEntry) -> Result<(), DbError> {
        let body = entry.len as i64 - RECORD_PREFIX_SIZE as i64;
        self.fh.write_at(entry.offset, &(-(body as i32)).to_le_bytes())
    }

    fn note_record_len(&mut self, len: u32) {
        self.st.row_buffer_max = self.st.row_buffer_max.max(len);
        if len > self.st.max_buffer {
            self.st.max_buffer = len;
            self.st.header_dirty = true;
        }
    }

    /// Writes a new record, reusing free space first. Returns its offset and
    /// the length stored in its prefix.
    pub fn append(&mut self, payload: &[u8]) -> Result<(u64, u32), DbError> {
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|l| *l <= i32::MAX as u32)
            .ok_or_else(|| DbError::RecordTooLarge(format!("record of {} bytes", payload.len())))?;
        let pl = self.place(payload_len)?;

        let written = self.write_slot(pl.offset, pl.slot_len, payload).and_then(|_| match &pl.remainder {
            Some(rem) => self.write_tombstone_header(rem),
            None => Ok(()),
        });
        if let Err(e) = written {
            self.abort_placement(&pl);
            return Err(e);
        }

        if let Some(rem) = pl.remainder {
            self.st.freelist.insert(rem.offset, rem.len)?;
        }
        if pl.from_free.is_none() {
            self.st.file_size += RECORD_PREFIX_SIZE + pl.slot_len as u64;
        }
        self.note_record_len(pl.slot_len);
        self.st.header_dirty = true;
        Ok((pl.offset, pl.slot_len))
    }

    fn abort_placement(&mut self, pl: &Placement) {
        match pl.from_free {
            Some(hole) => {
                if let Err(e) = self.write_tombstone_header(&hole) {
                    warn!(offset = hole.offset, error = %e, "could not restore tombstone after failed write");
                }
                if let Err(e) = self.st.freelist.restore(hole) {
                    warn!(offset = hole.offset, error = %e, "could not restore free range after failed write");
                }
            }
            None => {
                if let Err(e) = self.fh.set_len(self.st.file_size) {
                    warn!(error = %e, "could not trim partial record after failed write");
                }
            }
        }
    }

    /// Header fields an `append` may change, taken before it runs.
    pub fn mark(&self) -> AppendMark {
        AppendMark {
            file_size: self.st.file_size,
            max_buffer: self.st.max_buffer,
            row_buffer_max: self.st.row_buffer_max,
            header_dirty: self.st.header_dirty,
            freelist_dirty: self.st.freelist.is_dirty(),
        }
    }

    /// Gives back the space of a record written by `append` whose index
    /// update then failed. A record that grew the file is cut off, one placed
    /// in a hole frees that hole again. Once the heap is back to its size at
    /// `mark`, the header fields and dirty flags are put back too.
    pub fn undo_append(&mut self, offset: u64, slot_len: u32, mark: &AppendMark) -> Result<(), DbError> {
        let end = offset + RECORD_PREFIX_SIZE + slot_len as u64;
        if end == self.st.file_size && offset == mark.file_size {
            self.fh.set_len(offset)?;
            self.st.file_size = offset;
        } else {
            self.tombstone(offset, slot_len)?;
        }

        if self.st.file_size != mark.file_size {
            self.st.header_dirty = true;
            return Ok(());
        }
        self.st.max_buffer = mark.max_buffer;
        self.st.row_buffer_max = mark.row_buffer_max;
        self.st.header_dirty = mark.header_dirty;
        if mark.freelist_dirty {
            self.st.freelist.mark_dirty();
        } else {
            self.st.freelist.mark_clean();
        }
        Ok(())
    }

    /// Rewrites the record at `offset` (currently `old_len` bytes) with a
    /// payload no longer than it. A leftover of at least 4 bytes becomes a
    /// free range, a smaller one stays as padding. Returns the new stored length.
    pub fn overwrite_at(&mut self, offset: u64, old_len: u32, payload: &[u8]) -> Result<u32, DbError> {
        let new_len = payload.len() as u32;
        if payload.len() > old_len as usize {
            return Err(DbError::InvalidOperation(format!(
                "payload of {} bytes does not fit the {} byte slot at {}",
                payload.len(),
                old_len,
                offset
            )));
        }
        let spare = old_len - new_len;
        if (spare as u64) >= RECORD_PREFIX_SIZE {
            let rem = FreeEntry { offset: offset + RECORD_PREFIX_SIZE + new_len as u64, len: spare };
            let mut buf = Vec::with_capacity(RECORD_PREFIX_SIZE as usize + old_len as usize);
            buf.extend_from_slice(&new_len.to_le_bytes());
            buf.extend_from_slice(payload);
            let body = spare as i64 - RECORD_PREFIX_SIZE as i64;
            buf.extend_from_slice(&(-(body as i32)).to_le_bytes());
            buf.resize(RECORD_PREFIX_SIZE as usize + old_len as usize, 0);
            self.fh.write_at(offset, &buf)?;
            self.st.freelist.insert(rem.offset, rem.len)?;
            self.note_record_len(new_len);
            Ok(new_len)
        } else {
            self.write_slot(offset, old_len, payload)?;
            self.note_record_len(old_len);
            Ok(old_len)
        }
    }

    /// Marks the record at `offset` deleted, zeroes its bytes and frees them.
    pub fn tombstone(&mut self, offset: u64, old_len: u32) -> Result<(), DbError> {
        let entry = FreeEntry { offset, len: old_len + RECORD_PREFIX_SIZE as u32 };
        self.write_tombstone_header(&entry)?;
        if old_len > 0 {
            if let Err(e) = self.fh.write_at(offset + RECORD_PREFIX_SIZE, &vec![0u8; old_len as usize]) {
                warn!(offset, error = %e, "could not blank deleted record");
            }
        }
        self.st.freelist.insert(entry.offset, entry.len)
    }

    // ══════════════════════════════════════ MAINTENANCE ══════════════════════════════════════

    /// Cuts the data area at `new_size` and forgets all free space.
    pub fn truncate_to(&mut self, new_size: u64) -> Result<(), DbError> {
        self.fh.set_len(new_size)?;
        self.st.file_size = new_size;
        self.st.freelist.clear();
        self.st.header_dirty = true;
        Ok(())
    }

    /// Rebuilds the free list from the records between data start and file
    /// size: tombstones and records no live row points at are free.
    pub fn rebuild_freelist(&mut self, live: &HashSet<u64>) -> Result<(), DbError> {
        let mut fl = FreeList::new();
        let mut pos = self.data_start();
        let end = self.st.file_size;
        while pos + RECORD_PREFIX_SIZE <= end {
            let len = i32::from_le_bytes(read4(&mut self.fh, pos)?);
            let body = len.unsigned_abs() as u64;
            let next = pos + RECORD_PREFIX_SIZE + body;
            if next > end {
                return Err(DbError::corrupt(format!("record at {} runs past end of data", pos)));
            }
            if len >= 0 && live.contains(&pos) {
                self.st.row_buffer_max = self.st.row_buffer_max.max(len as u32);
            } else {
                fl.insert(pos, (RECORD_PREFIX_SIZE + body) as u32)?;
            }
            pos = next;
        }
        if pos != end {
            return Err(DbError::corrupt(format!("{} stray bytes at end of data", end - pos)));
        }
        debug!(entries = fl.len(), bytes = fl.total_bytes(), "free list rebuilt from heap");
        fl.mark_dirty();
        self.st.freelist = fl;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), DbError> {
        if self.st.fd_dirty {
            let mut block = Vec::with_capacity(self.st.fd_body.len() + 4);
            block.write_u32::<LittleEndian>(self.st.fd_body.len() as u32)?;
            block.write_all(&self.st.fd_body)?;
            self.fh.write_at(self.st.fd_offset, &block)?;
            self.st.fd_dirty = false;
            self.st.extent_dirty = false;
        } else if self.st.extent_dirty {
            if let Some(off) = self.st.extent_offset {
                let start = self.st.fd_offset + RECORD_PREFIX_SIZE + off as u64;
                let bytes = self
                    .st
                    .fd_body
                    .get(off..off + 64)
                    .map(|b| b.to_vec())
                    .ok_or_else(|| DbError::corrupt("extent outside the field descriptor block"))?;
                self.fh.write_at(start, &bytes)?;
            }
            self.st.extent_dirty = false;
        }
        if self.st.header_dirty {
            self.fh.write_at(0, &encode_header(&self.st)?)?;
            self.st.header_dirty = false;
        }
        if self.st.freelist.is_dirty() {
            let path = self.freelist_path.clone();
            self.st.freelist.save(&path)?;
        }
        self.fh.flush()?;
        self.fh.sync_all()
    }
}

fn read4(fh: &mut FileHandle, pos: u64) -> Result<[u8; 4], DbError> {
    let mut b = [0u8; 4];
    fh.read_at(pos, &mut b)?;
    Ok(b)
}

#[cfg(test)]
mod heap_test {
    use super::*;
    use tempfile::tempdir;

    fn new_heap(dir: &Path) -> HeapFile {
        HeapFile::create(&dir.join("t.tucotable"), Some("test"), vec![1, 2, 3, 4], None, 4).unwrap()
    }

    fn live_bytes(live: &[(u64, u32)]) -> u64 {
        live.iter().map(|(_, l)| 4 + *l as u64).sum()
    }

    #[test]
    fn layout_after_create() {
        let dir = tempdir().unwrap();
        let h = new_heap(dir.path());
        // header 40, creator 4 + 4, descriptors 4 + 4
        assert_eq!(h.st.fd_offset, 48);
        assert_eq!(h.data_start(), 56);
        assert_eq!(h.file_size(), 56);
        assert_eq!(h.st.max_buffer, 4);
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let (a, la) = h.append(b"hello").unwrap();
        let (b, _) = h.append(b"world!!").unwrap();
        assert_eq!(a, 56);
        assert_eq!(la, 5);
        assert_eq!(b, 56 + 9);
        assert_eq!(h.read_record(b).unwrap(), b"world!!");
        assert_eq!(h.file_size(), 56 + 9 + 11);
        assert_eq!(h.st.max_buffer, 7);
    }

    #[test]
    fn tombstone_and_reuse_with_split() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let (a, la) = h.append(&[7u8; 20]).unwrap();
        let (b, lb) = h.append(&[8u8; 3]).unwrap();
        h.tombstone(a, la).unwrap();
        assert_eq!(h.record_len(a).unwrap(), -20);
        assert_eq!(h.freelist().total_bytes(), 24);
        assert!(h.read_record(a).is_err());

        // 4 + 10 from a 24 byte hole leaves 10 free bytes
        let (c, lc) = h.append(&[9u8; 10]).unwrap();
        assert_eq!(c, a);
        assert_eq!(lc, 10);
        assert_eq!(h.freelist().entries(), &[FreeEntry { offset: a + 14, len: 10 }]);
        assert_eq!(h.record_len(a + 14).unwrap(), -6);

        let used = live_bytes(&[(b, lb), (c, lc)]) + h.freelist().total_bytes();
        assert_eq!(used, h.file_size() - h.data_start());
    }

    #[test]
    fn small_leftover_becomes_padding() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let (a, la) = h.append(&[1u8; 10]).unwrap();
        h.append(&[2u8; 1]).unwrap();
        h.tombstone(a, la).unwrap();
        let (c, lc) = h.append(&[3u8; 8]).unwrap();
        assert_eq!(c, a);
        assert_eq!(lc, 10);
        assert!(h.freelist().is_empty());
        assert_eq!(h.read_record(c).unwrap(), vec![3, 3, 3, 3, 3, 3, 3, 3, 0, 0]);
    }

    #[test]
    fn overwrite_shrink_frees_the_tail() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let (a, la) = h.append(&[1u8; 30]).unwrap();
        let new_len = h.overwrite_at(a, la, &[5u8; 10]).unwrap();
        assert_eq!(new_len, 10);
        assert_eq!(h.read_record(a).unwrap(), vec![5u8; 10]);
        assert_eq!(h.freelist().entries(), &[FreeEntry { offset: a + 14, len: 20 }]);
        assert!(h.overwrite_at(a, new_len, &[0u8; 11]).is_err());
    }

    #[test]
    fn undo_append_at_end_truncates() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let before = h.file_size();
        h.sync().unwrap();
        let mark = h.mark();
        let (a, la) = h.append(&[3u8; 300]).unwrap();
        assert!(h.st.header_dirty);
        h.undo_append(a, la, &mark).unwrap();
        assert_eq!(h.file_size(), before);
        assert!(h.freelist().is_empty());
        assert_eq!(h.mark(), mark);
        assert!(!h.st.header_dirty);
        assert_eq!(h.st.max_buffer, 4);
    }

    #[test]
    fn undo_append_in_a_hole_frees_it_again() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let (a, la) = h.append(&[1u8; 40]).unwrap();
        h.append(&[2u8; 8]).unwrap();
        h.tombstone(a, la).unwrap();
        h.sync().unwrap();
        let mark = h.mark();

        let (c, lc) = h.append(&[3u8; 12]).unwrap();
        assert_eq!(c, a);
        h.undo_append(c, lc, &mark).unwrap();
        assert_eq!(h.freelist().entries(), &[FreeEntry { offset: a, len: 44 }]);
        assert_eq!(h.mark(), mark);
        assert_eq!(h.record_len(a).unwrap(), -12);
    }

    #[test]
    fn offset_near_the_top_of_the_range_is_corrupt() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        h.append(b"abc").unwrap();
        let err = h.record_len(u64::MAX - 1).unwrap_err();
        assert!(matches!(err, DbError::CorruptData(_)));
    }

    #[test]
    fn offset_width_limits_file_size() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        h.st.file_size = u32::MAX as u64 - 8;
        let err = h.append(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, DbError::RecordTooLarge(_)));
    }

    #[test]
    fn reopen_reads_header_and_freelist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tucotable");
        {
            let mut h = new_heap(dir.path());
            let (a, la) = h.append(&[1u8; 12]).unwrap();
            h.append(&[2u8; 12]).unwrap();
            h.tombstone(a, la).unwrap();
            h.set_valid_count(1);
            h.sync().unwrap();
        }
        let (h, fl_ok) = HeapFile::open(&path, 4).unwrap();
        assert!(fl_ok);
        assert_eq!(h.valid_count(), 1);
        assert_eq!(h.st.creator.as_deref(), Some(&b"test"[..]));
        assert_eq!(h.fd_body(), &[1, 2, 3, 4]);
        assert_eq!(h.freelist().total_bytes(), 16);
    }

    #[test]
    fn rebuild_freelist_from_records() {
        let dir = tempdir().unwrap();
        let mut h = new_heap(dir.path());
        let (a, la) = h.append(&[1u8; 12]).unwrap();
        let (b, _) = h.append(&[2u8; 12]).unwrap();
        let (c, _) = h.append(&[3u8; 12]).unwrap();
        h.tombstone(a, la).unwrap();
        let live: HashSet<u64> = [c].into_iter().collect();
        h.rebuild_freelist(&live).unwrap();
        // a is a tombstone, b is orphaned; both are adjacent and merge
        assert_eq!(h.freelist().entries(), &[FreeEntry { offset: a, len: 32 }]);
        assert_eq!(b, a + 16);
    }
}
