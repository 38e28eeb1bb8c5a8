//! Free list of reclaimed heap ranges.
//!
//! Entries are kept sorted by offset and never overlap; adjacent entries
//! are merged on insert. Each range starts with a tombstone header, so the
//! list can always be rebuilt by walking the heap.
//!
//! Sidecar file layout (`<table>.tucofree`):
//!
//! ```text
//! +------------+---------+-----------+------------------------------+
//! | "TUCOFREE" | u32 ver | u32 count | (u64 offset, u32 len) * count|
//! +------------+---------+-----------+------------------------------+
//! ```

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::constant::{FREELIST_MAGIC, FREELIST_VERSION, RECORD_PREFIX_SIZE};
use crate::dberror::DbError;

/// A reclaimed range, length prefix included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub offset: u64,
    pub len: u32,
}

impl FreeEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

#[derive(Debug, Default, Clone)]
pub struct FreeList {
    entries: Vec<FreeEntry>,
    dirty: bool,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList::default()
    }

    pub fn entries(&self) -> &[FreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.len as u64).sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Registers a range, merging it with touching neighbours.
    pub fn insert(&mut self, offset: u64, len: u32) -> Result<(), DbError> {
        if (len as u64) < RECORD_PREFIX_SIZE {
            return Err(DbError::corrupt(format!("free range of {} bytes at {} is too small", len, offset)));
        }
        let new = FreeEntry { offset, len };
        let pos = self.entries.partition_point(|e| e.offset < offset);
        if let Some(prev) = pos.checked_sub(1).map(|i| self.entries[i]) {
            if prev.end() > offset {
                return Err(DbError::corrupt(format!("free range at {} overlaps the one at {}", offset, prev.offset)));
            }
        }
        if let Some(next) = self.entries.get(pos) {
            if new.end() > next.offset {
                return Err(DbError::corrupt(format!("free range at {} overlaps the one at {}", offset, next.offset)));
            }
        }
        self.entries.insert(pos, new);
        self.dirty = true;

        // merge with next, then with previous
        if pos + 1 < self.entries.len() && self.entries[pos].end() == self.entries[pos + 1].offset {
            if let Some(merged) = self.merged_len(pos, pos + 1) {
                self.entries[pos].len = merged;
                self.entries.remove(pos + 1);
            }
        }
        if pos > 0 && self.entries[pos - 1].end() == self.entries[pos].offset {
            if let Some(merged) = self.merged_len(pos - 1, pos) {
                self.entries[pos - 1].len = merged;
                self.entries.remove(pos);
            }
        }
        Ok(())
    }

    fn merged_len(&self, a: usize, b: usize) -> Option<u32> {
        self.entries[a].len.checked_add(self.entries[b].len)
    }

    /// First range (by offset) of at least `needed` bytes, removed from the list.
    pub fn take_first_fit(&mut self, needed: u32) -> Option<FreeEntry> {
        let pos = self.entries.iter().position(|e| e.len >= needed)?;
        self.dirty = true;
        Some(self.entries.remove(pos))
    }

    /// Puts back an entry returned by `take_first_fit` that ended up unused.
    pub fn restore(&mut self, entry: FreeEntry) -> Result<(), DbError> {
        self.insert(entry.offset, entry.len)
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.dirty = true;
        }
        self.entries.clear();
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    // ══════════════════════════════════════ PERSISTENCE ══════════════════════════════════════

    pub fn to_bytes(&self) -> Result<Vec<u8>, DbError> {
        let mut out = Vec::with_capacity(16 + self.entries.len() * 12);
        out.write_all(FREELIST_MAGIC)?;
        out.write_u32::<LittleEndian>(FREELIST_VERSION)?;
        out.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for e in &self.entries {
            out.write_u64::<LittleEndian>(e.offset)?;
            out.write_u32::<LittleEndian>(e.len)?;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<FreeList, DbError> {
        let mut cur = Cursor::new(bytes);
        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic).map_err(|_| DbError::corrupt("free list too short"))?;
        if &magic != FREELIST_MAGIC {
            return Err(DbError::corrupt("bad free list magic"));
        }
        let version = cur.read_u32::<LittleEndian>().map_err(|_| DbError::corrupt("free list too short"))?;
        if version != FREELIST_VERSION {
            return Err(DbError::corrupt(format!("unsupported free list version {}", version)));
        }
        let count = cur.read_u32::<LittleEndian>().map_err(|_| DbError::corrupt("free list too short"))?;
        let mut list = FreeList::new();
        for _ in 0..count {
            let offset = cur.read_u64::<LittleEndian>().map_err(|_| DbError::corrupt("free list truncated"))?;
            let len = cur.read_u32::<LittleEndian>().map_err(|_| DbError::corrupt("free list truncated"))?;
            list.insert(offset, len)?;
        }
        list.dirty = false;
        Ok(list)
    }

    /// `Ok(None)` when the sidecar does not exist.
    pub fn load(path: &Path) -> Result<Option<FreeList>, DbError> {
        match fs::read(path) {
            Ok(bytes) => FreeList::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the sidecar, or removes it when the list is empty.
    pub fn save(&mut self, path: &Path) -> Result<(), DbError> {
        if self.entries.is_empty() {
            FreeList::delete(path)?;
        } else {
            fs::write(path, self.to_bytes()?)?;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn delete(path: &Path) -> Result<(), DbError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod freelist_test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_merges_adjacent_ranges() {
        let mut fl = FreeList::new();
        fl.insert(100, 20).unwrap();
        fl.insert(140, 10).unwrap();
        fl.insert(120, 20).unwrap();
        assert_eq!(fl.entries(), &[FreeEntry { offset: 100, len: 50 }]);
        fl.insert(200, 8).unwrap();
        assert_eq!(fl.len(), 2);
        assert_eq!(fl.total_bytes(), 58);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut fl = FreeList::new();
        fl.insert(100, 20).unwrap();
        assert!(fl.insert(110, 20).is_err());
        assert!(fl.insert(90, 20).is_err());
        assert!(fl.insert(50, 2).is_err());
    }

    #[test]
    fn first_fit_by_offset() {
        let mut fl = FreeList::new();
        fl.insert(300, 64).unwrap();
        fl.insert(100, 16).unwrap();
        fl.insert(200, 40).unwrap();
        assert_eq!(fl.take_first_fit(30), Some(FreeEntry { offset: 200, len: 40 }));
        assert_eq!(fl.take_first_fit(100), None);
        assert_eq!(fl.take_first_fit(8), Some(FreeEntry { offset: 100, len: 16 }));
        assert_eq!(fl.len(), 1);
    }

    #[test]
    fn sidecar_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tucofree");
        assert!(FreeList::load(&path).unwrap().is_none());

        let mut fl = FreeList::new();
        fl.insert(64, 12).unwrap();
        fl.insert(500, 100).unwrap();
        fl.save(&path).unwrap();
        assert!(!fl.is_dirty());

        let back = FreeList::load(&path).unwrap().unwrap();
        assert_eq!(back.entries(), fl.entries());

        fl.clear();
        fl.save(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn garbage_sidecar_is_corrupt() {
        assert!(matches!(FreeList::from_bytes(b"NOTAFREELIST"), Err(DbError::CorruptData(_))));
    }
}
