//! Repack: rewrites the heap so that live records sit back to back in row
//! id order, and the index points at their new offsets.
//!
//! Two strategies share one protocol:
//!
//! ```text
//!            begin                       copy                 commit
//! InPlace    copy files to *_backup      read *_backup        sync, drop marker,
//!            write .backup_valid         write live files     delete backups
//!
//! TempFiles  create *_compress           read live files      sync, rename
//!                                        write *_compress     *_compress over live
//! ```
//!
//! Any failure before commit puts the files and the in-memory state back
//! as they were. The only window that cannot be undone is a failed second
//! rename in `TempFiles` mode, reported as `FatalInconsistency`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::RepackStrategy;
use crate::constant::{BACKUP_MARKER_SUFFIX, BACKUP_SUFFIX, COMPRESS_SUFFIX, HEAP_HEADER_SIZE, RECORD_PREFIX_SIZE};
use crate::dberror::DbError;
use crate::freelist::FreeList;
use crate::heap::{encode_prefix, HeapFile, HeapState};
use crate::rowindex::{encode_header, encode_trailer, IndexState, RowIndex};
use crate::storage::{copy_file, remove_if_exists, replace_files, sidecar_path, FileHandle};

const COPY_CHUNK: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepackOutcome {
    /// Nothing to reclaim.
    AlreadyCompact,
    /// Records were already in order; only trailing free space was cut.
    Truncated { freed: u64 },
    /// The heap was rewritten.
    Rewritten { old_size: u64, new_size: u64 },
}

pub fn backup_marker_path(heap_path: &Path) -> PathBuf {
    sidecar_path(heap_path, BACKUP_MARKER_SUFFIX)
}

/// Restores both files from their backups when a previous in-place repack
/// died before committing. Returns whether anything was restored.
pub fn recover_from_backup(heap_path: &Path, index_path: &Path) -> Result<bool, DbError> {
    let marker = backup_marker_path(heap_path);
    if !marker.exists() {
        return Ok(false);
    }
    let heap_backup = sidecar_path(heap_path, BACKUP_SUFFIX);
    let index_backup = sidecar_path(index_path, BACKUP_SUFFIX);
    if !heap_backup.exists() || !index_backup.exists() {
        warn!(marker = %marker.display(), "backup marker without backups, ignoring it");
        remove_if_exists(&marker)?;
        return Ok(false);
    }
    info!(table = %heap_path.display(), "unfinished repack found, restoring from backup");
    copy_file(&heap_backup, heap_path)?;
    copy_file(&index_backup, index_path)?;
    remove_if_exists(&marker)?;
    remove_if_exists(&heap_backup)?;
    remove_if_exists(&index_backup)?;
    Ok(true)
}

/// Compacts the heap behind `index`. Both are synced first.
pub fn repack(heap: &mut HeapFile, index: &mut RowIndex, strategy: RepackStrategy) -> Result<RepackOutcome, DbError> {
    heap.sync()?;
    index.sync()?;

    let rows = index.live_rows()?;
    let packed_fd_offset = HEAP_HEADER_SIZE + HeapState::creator_block_len(heap.st.creator.as_deref());
    let mut needed = heap.st.fd_offset != packed_fd_offset;
    let mut expected = packed_fd_offset + RECORD_PREFIX_SIZE + heap.st.fd_len();
    let mut seen = HashSet::with_capacity(rows.len());
    for (id, off) in &rows {
        if !seen.insert(*off) {
            return Err(DbError::corrupt(format!("row {} shares heap offset {} with another row", id, off)));
        }
        let len = heap.record_len(*off)?;
        if len < 0 {
            return Err(DbError::corrupt(format!("row {} points at a deleted record at {}", id, off)));
        }
        if *off != expected {
            needed = true;
        }
        expected += RECORD_PREFIX_SIZE + len as u64;
    }

    if !needed {
        let old_size = heap.file_size();
        let had_free = !heap.freelist().is_empty();
        if old_size > expected {
            heap.truncate_to(expected)?;
        } else {
            heap.st.freelist.clear();
        }
        heap.sync()?;
        if old_size == expected && !had_free {
            debug!(table = %heap.path().display(), "already compacted");
            return Ok(RepackOutcome::AlreadyCompact);
        }
        debug!(table = %heap.path().display(), freed = old_size - expected, "truncated trailing free space");
        return Ok(RepackOutcome::Truncated { freed: old_size - expected });
    }

    debug!(table = %heap.path().display(), rows = rows.len(), ?strategy, "rewriting heap");
    let old_size = heap.file_size();
    let mut rw = WholeFileRewriter::begin(heap, index, strategy)?;
    match rw.copy(heap, index, &rows) {
        Ok((new_heap, new_index)) => {
            let new_size = new_heap.file_size;
            rw.commit(heap, index, new_heap, new_index)?;
            Ok(RepackOutcome::Rewritten { old_size, new_size })
        }
        Err(e) => Err(rw.rollback(heap, index, e)),
    }
}

/// One in-flight repack: where records are read from, where they go, and
/// what to put back if it fails.
pub struct WholeFileRewriter {
    strategy: RepackStrategy,
    heap_path: PathBuf,
    index_path: PathBuf,
    heap_src: FileHandle,
    heap_tmp: Option<FileHandle>,
    index_tmp: Option<FileHandle>,
    heap_snapshot: HeapState,
    index_snapshot: IndexState,
}

impl WholeFileRewriter {
    pub fn begin(heap: &mut HeapFile, index: &mut RowIndex, strategy: RepackStrategy) -> Result<Self, DbError> {
        let heap_path = heap.path().to_path_buf();
        let index_path = index.path().to_path_buf();
        let heap_snapshot = heap.st.clone();
        let index_snapshot = index.st.clone();

        let (heap_src, heap_tmp, index_tmp) = match strategy {
            RepackStrategy::InPlace => {
                let heap_backup = sidecar_path(&heap_path, BACKUP_SUFFIX);
                let index_backup = sidecar_path(&index_path, BACKUP_SUFFIX);
                for b in [&heap_backup, &index_backup] {
                    if b.exists() {
                        return Err(DbError::InvalidOperation(format!("{} already exists", b.display())));
                    }
                }
                let made = copy_file(&heap_path, &heap_backup)
                    .and_then(|_| copy_file(&index_path, &index_backup))
                    .and_then(|_| {
                        fs::write(backup_marker_path(&heap_path), b"")?;
                        Ok(())
                    })
                    .and_then(|_| FileHandle::open_read(&heap_backup));
                match made {
                    Ok(src) => (src, None, None),
                    Err(e) => {
                        discard(&[backup_marker_path(&heap_path), heap_backup, index_backup]);
                        return Err(e);
                    }
                }
            }
            RepackStrategy::TempFiles => {
                let heap_tmp_path = sidecar_path(&heap_path, COMPRESS_SUFFIX);
                let index_tmp_path = sidecar_path(&index_path, COMPRESS_SUFFIX);
                let made = FileHandle::create(&heap_tmp_path).and_then(|h| {
                    let i = FileHandle::create(&index_tmp_path)?;
                    let src = FileHandle::open_read(&heap_path)?;
                    Ok((src, Some(h), Some(i)))
                });
                match made {
                    Ok(handles) => handles,
                    Err(e) => {
                        discard(&[heap_tmp_path, index_tmp_path]);
                        return Err(e);
                    }
                }
            }
        };

        Ok(WholeFileRewriter {
            strategy,
            heap_path,
            index_path,
            heap_src,
            heap_tmp,
            index_tmp,
            heap_snapshot,
            index_snapshot,
        })
    }

    /// Streams live records in row id order and rewrites index pages.
    /// Returns the state both files will have once committed.
    pub fn copy(
        &mut self,
        heap: &mut HeapFile,
        index: &mut RowIndex,
        rows: &[(u32, u64)],
    ) -> Result<(HeapState, IndexState), DbError> {
        let src_size = self.heap_snapshot.file_size;
        let mut new_heap = self.heap_snapshot.clone();
        new_heap.fd_offset = HEAP_HEADER_SIZE + HeapState::creator_block_len(new_heap.creator.as_deref());
        new_heap.freelist = FreeList::new();
        new_heap.valid_count = rows.len() as u32;
        new_heap.row_buffer_max = 0;
        new_heap.header_dirty = false;
        new_heap.fd_dirty = false;
        new_heap.extent_dirty = false;

        // records first, header last once sizes are known
        let mut pos = new_heap.data_start();
        let mut new_offsets = Vec::with_capacity(rows.len());
        let mut chunk: Vec<u8> = Vec::with_capacity(COPY_CHUNK);
        let mut chunk_start = pos;
        for (id, off) in rows {
            let prefix = self.heap_src.read_vec_at(*off, RECORD_PREFIX_SIZE as usize)?;
            let len = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
            if len < 0 || *off + RECORD_PREFIX_SIZE + len as u64 > src_size {
                return Err(DbError::corrupt(format!("row {} has a bad record at {}", id, off)));
            }
            let body = self.heap_src.read_vec_at(*off + RECORD_PREFIX_SIZE, len as usize)?;
            new_heap.row_buffer_max = new_heap.row_buffer_max.max(len as u32);
            new_offsets.push(pos);
            chunk.extend_from_slice(&prefix);
            chunk.extend_from_slice(&body);
            pos += RECORD_PREFIX_SIZE + len as u64;
            if chunk.len() >= COPY_CHUNK {
                self.heap_dst(heap).write_at(chunk_start, &chunk)?;
                chunk_start = pos;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            self.heap_dst(heap).write_at(chunk_start, &chunk)?;
        }
        new_heap.file_size = pos;
        new_heap.max_buffer = (new_heap.fd_len() as u32).max(new_heap.row_buffer_max);
        let prefix = encode_prefix(&new_heap)?;
        let dst = self.heap_dst(heap);
        dst.write_at(0, &prefix)?;
        dst.set_len(new_heap.file_size)?;

        let mut new_index = self.index_snapshot.clone();
        new_index.header_dirty = false;
        new_index.trailer_dirty = false;
        let mut next = new_offsets.into_iter();
        for phys in 0..new_index.pages_present {
            let page = index.read_page(phys)?;
            let slots: Vec<u64> = index
                .page_slots(&page)
                .into_iter()
                .map(|s| if s == 0 { 0 } else { next.next().unwrap_or(0) })
                .collect();
            let bytes = index.encode_page(&slots)?;
            let page_pos = index.page_pos(phys);
            self.index_dst(index).write_at(page_pos, &bytes)?;
        }
        if next.next().is_some() {
            return Err(DbError::FatalInconsistency("index pages changed during repack".to_string()));
        }
        let width = index.offset_width();
        let header = encode_header(&new_index, width)?;
        let trailer = encode_trailer(&new_index)?;
        let end = index.page_pos(new_index.pages_present);
        let dst = self.index_dst(index);
        dst.write_at(0, &header)?;
        if let Some(t) = trailer {
            dst.write_at(end, &t)?;
            dst.set_len(end + t.len() as u64)?;
        } else {
            dst.set_len(end)?;
        }
        Ok((new_heap, new_index))
    }

    fn heap_dst<'a>(&'a mut self, heap: &'a mut HeapFile) -> &'a mut FileHandle {
        match self.heap_tmp.as_mut() {
            Some(fh) => fh,
            None => heap.fh_mut(),
        }
    }

    fn index_dst<'a>(&'a mut self, index: &'a mut RowIndex) -> &'a mut FileHandle {
        match self.index_tmp.as_mut() {
            Some(fh) => fh,
            None => index.fh_mut(),
        }
    }

    fn flush_all(&mut self, heap: &mut HeapFile, index: &mut RowIndex) -> Result<(), DbError> {
        let h = self.heap_dst(heap);
        h.flush()?;
        h.sync_all()?;
        let i = self.index_dst(index);
        i.flush()?;
        i.sync_all()
    }

    pub fn commit(
        mut self,
        heap: &mut HeapFile,
        index: &mut RowIndex,
        new_heap: HeapState,
        new_index: IndexState,
    ) -> Result<(), DbError> {
        if let Err(e) = self.flush_all(heap, index) {
            return Err(self.rollback(heap, index, e));
        }

        match self.strategy {
            RepackStrategy::InPlace => {
                let marker = backup_marker_path(&self.heap_path);
                match remove_if_exists(&marker) {
                    Ok(()) => discard(&[
                        sidecar_path(&self.heap_path, BACKUP_SUFFIX),
                        sidecar_path(&self.index_path, BACKUP_SUFFIX),
                    ]),
                    Err(e) => warn!(marker = %marker.display(), error = %e, "could not remove backup marker"),
                }
            }
            RepackStrategy::TempFiles => {
                // close the temp handles before renaming them
                self.heap_tmp = None;
                self.index_tmp = None;
                let pairs = [
                    (sidecar_path(&self.heap_path, COMPRESS_SUFFIX), self.heap_path.clone()),
                    (sidecar_path(&self.index_path, COMPRESS_SUFFIX), self.index_path.clone()),
                ];
                match replace_files(&pairs) {
                    Ok(()) => {}
                    Err(e @ DbError::FatalInconsistency(_)) => return Err(e),
                    Err(e) => return Err(self.rollback(heap, index, e)),
                }
                heap.reopen()?;
                index.reopen()?;
            }
        }

        heap.st = new_heap;
        index.st = new_index;
        FreeList::delete(heap.freelist_path())?;
        Ok(())
    }

    /// Undoes everything since `begin` and hands back `cause`.
    pub fn rollback(mut self, heap: &mut HeapFile, index: &mut RowIndex, cause: DbError) -> DbError {
        warn!(table = %self.heap_path.display(), error = %cause, "repack failed, rolling back");
        match self.strategy {
            RepackStrategy::InPlace => {
                let heap_backup = sidecar_path(&self.heap_path, BACKUP_SUFFIX);
                let index_backup = sidecar_path(&self.index_path, BACKUP_SUFFIX);
                let restored = copy_file(&heap_backup, &self.heap_path).and_then(|_| copy_file(&index_backup, &self.index_path));
                match restored {
                    Ok(()) => discard(&[backup_marker_path(&self.heap_path), heap_backup, index_backup]),
                    // the marker stays so the next open retries the restore
                    Err(e) => warn!(error = %e, "could not restore originals from backup"),
                }
            }
            RepackStrategy::TempFiles => {
                self.heap_tmp = None;
                self.index_tmp = None;
                discard(&[
                    sidecar_path(&self.heap_path, COMPRESS_SUFFIX),
                    sidecar_path(&self.index_path, COMPRESS_SUFFIX),
                ]);
            }
        }
        heap.st = self.heap_snapshot;
        index.st = self.index_snapshot;
        cause
    }
}

fn discard(paths: &[PathBuf]) {
    for p in paths {
        if let Err(e) = remove_if_exists(p) {
            warn!(file = %p.display(), error = %e, "could not delete");
        }
    }
}
