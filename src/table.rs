//! A table: one heap file and one row index file, kept in step.
//!
//! ```text
//!   create_feature ──> encode ──> HeapFile::append ──> RowIndex::assign_offset
//!                                        ^                     │ fails
//!                                        └── undo_append <─────┘
//! ```
//!
//! Every mutation either lands in both files or in neither. Counters, the
//! extent and the dirty flags only change once both writes succeeded.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{TableOptions, TextEncoding};
use crate::constant::{HEAP_EXT, INDEX_EXT};
use crate::dberror::DbError;
use crate::geometry::Geometry;
use crate::heap::HeapFile;
use crate::record::{decode_feature, encode_feature};
use crate::rewriter::{self, RepackOutcome};
use crate::rowindex::RowIndex;
use crate::schema::{decode_descriptors, encode_descriptors, Extent, FieldValue, TableSchema};

/// Told when rows changed so that secondary indexes can be rebuilt.
pub trait IndexRefresher {
    fn refresh(&mut self, heap_path: &Path, row_count: u32) -> Result<(), DbError>;
}

/// A decoded row. The object id slot of `values` holds the row id.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: u32,
    pub values: Vec<Option<FieldValue>>,
    pub geometry: Option<Geometry>,
}

pub struct Table {
    heap: HeapFile,
    index: RowIndex,
    schema: TableSchema,
    text: TextEncoding,
    extent: Extent,
    options: TableOptions,
    indexes_dirty: bool,
    refresher: Option<Box<dyn IndexRefresher>>,
}

/// `dir/name` -> (`dir/name.tucotable`, `dir/name.tucotablx`)
pub fn table_paths(base: &Path) -> (PathBuf, PathBuf) {
    (base.with_extension(HEAP_EXT), base.with_extension(INDEX_EXT))
}

impl Table {
    pub fn create(base: &Path, schema: TableSchema, options: TableOptions) -> Result<Self, DbError> {
        options.validate()?;
        let (heap_path, index_path) = table_paths(base);
        let extent = Extent::empty();
        let desc = encode_descriptors(&schema, options.text_encoding, &extent)?;
        let heap = HeapFile::create(
            &heap_path,
            options.creator.as_deref(),
            desc.body,
            desc.extent_offset,
            options.offset_width,
        )?;
        let index = RowIndex::create(&index_path, options.offset_width)?;
        debug!(table = %heap_path.display(), fields = schema.len(), "table created");
        Ok(Table {
            heap,
            index,
            schema,
            text: options.text_encoding,
            extent,
            options,
            indexes_dirty: false,
            refresher: None,
        })
    }

    pub fn open(base: &Path) -> Result<Self, DbError> {
        Table::open_with_options(base, TableOptions::default())
    }

    /// Offset width, text encoding and creator come from the files; only the
    /// repack strategy of `options` applies.
    pub fn open_with_options(base: &Path, mut options: TableOptions) -> Result<Self, DbError> {
        let (heap_path, index_path) = table_paths(base);
        rewriter::recover_from_backup(&heap_path, &index_path)?;

        let index = RowIndex::open(&index_path)?;
        let (mut heap, freelist_valid) = HeapFile::open(&heap_path, index.offset_width())?;
        let decoded = decode_descriptors(heap.fd_body())?;
        heap.set_extent_offset(decoded.extent_offset);

        options.offset_width = index.offset_width();
        options.text_encoding = decoded.text;
        options.creator = heap.st.creator.as_ref().map(|c| String::from_utf8_lossy(c).into_owned());

        let mut table = Table {
            heap,
            index,
            schema: decoded.schema,
            text: decoded.text,
            extent: decoded.extent,
            options,
            indexes_dirty: false,
            refresher: None,
        };
        if !freelist_valid {
            warn!(table = %heap_path.display(), "free list does not match the heap, rebuilding it");
            table.rebuild_freelist()?;
        }
        Ok(table)
    }

    fn rebuild_freelist(&mut self) -> Result<(), DbError> {
        let live: HashSet<u64> = self.index.live_rows()?.into_iter().map(|(_, off)| off).collect();
        self.heap.rebuild_freelist(&live)?;
        self.heap.sync()
    }

    pub fn set_index_refresher(&mut self, refresher: Box<dyn IndexRefresher>) {
        self.refresher = Some(refresher);
    }

    // ══════════════════════════════════════ ACCESSORS ══════════════════════════════════════

    pub fn field_schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Live rows.
    pub fn row_count(&self) -> u32 {
        self.heap.valid_count()
    }

    /// Highest row id ever assigned.
    pub fn total_record_count(&self) -> u32 {
        self.index.total_rows()
    }

    pub fn geometry_bounds(&self) -> Option<Extent> {
        if self.extent.is_empty() {
            None
        } else {
            Some(self.extent)
        }
    }

    pub fn text_encoding(&self) -> TextEncoding {
        self.text
    }

    pub fn offset_width(&self) -> u32 {
        self.index.offset_width()
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub fn heap_path(&self) -> &Path {
        self.heap.path()
    }

    pub fn index_path(&self) -> &Path {
        self.index.path()
    }

    pub fn file_size(&self) -> u64 {
        self.heap.file_size()
    }

    pub fn data_start(&self) -> u64 {
        self.heap.data_start()
    }

    /// Bytes on the free list.
    pub fn free_space(&self) -> u64 {
        self.heap.freelist().total_bytes()
    }

    pub fn indexes_dirty(&self) -> bool {
        self.indexes_dirty
    }

    /// Heap offset of a row, 0 if it does not exist.
    pub fn row_offset(&mut self, id: u32) -> Result<u64, DbError> {
        self.index.offset_for_row(id)
    }

    /// Stored length of a live row's record, padding included.
    pub fn record_size(&mut self, id: u32) -> Result<Option<u32>, DbError> {
        match self.index.offset_for_row(id)? {
            0 => Ok(None),
            off => self.live_len(id, off).map(Some),
        }
    }

    /// Ids of live rows, ascending.
    pub fn row_ids(&mut self) -> Result<Vec<u32>, DbError> {
        Ok(self.index.live_rows()?.into_iter().map(|(id, _)| id).collect())
    }

    fn live_len(&mut self, id: u32, off: u64) -> Result<u32, DbError> {
        let len = self.heap.record_len(off)?;
        u32::try_from(len).map_err(|_| DbError::corrupt(format!("row {} points at a deleted record at {}", id, off)))
    }

    pub fn get_feature(&mut self, id: u32) -> Result<Option<Feature>, DbError> {
        let off = self.index.offset_for_row(id)?;
        if off == 0 {
            return Ok(None);
        }
        let payload = self.heap.read_record(off)?;
        let mut rec = decode_feature(&self.schema, self.text, &payload)?;
        if let Some(i) = self.schema.object_id_index() {
            rec.values[i] = Some(FieldValue::Int32(id as i32));
        }
        Ok(Some(Feature { id, values: rec.values, geometry: rec.geometry }))
    }

    // ══════════════════════════════════════ MUTATIONS ══════════════════════════════════════

    /// Appends a row with the next id.
    pub fn create_feature(&mut self, values: &[Option<FieldValue>], geometry: Option<&Geometry>) -> Result<u32, DbError> {
        let id = self
            .index
            .total_rows()
            .checked_add(1)
            .ok_or_else(|| DbError::InvalidOperation("row ids exhausted".to_string()))?;
        self.insert_at(id, values, geometry)?;
        Ok(id)
    }

    /// Inserts a row under an explicit id (import, restore).
    pub fn create_feature_with_id(
        &mut self,
        id: u32,
        values: &[Option<FieldValue>],
        geometry: Option<&Geometry>,
    ) -> Result<(), DbError> {
        if id == 0 {
            return Err(DbError::InvalidOperation("row ids start at 1".to_string()));
        }
        if self.index.offset_for_row(id)? != 0 {
            return Err(DbError::RowExists(id));
        }
        self.insert_at(id, values, geometry)
    }

    fn insert_at(&mut self, id: u32, values: &[Option<FieldValue>], geometry: Option<&Geometry>) -> Result<(), DbError> {
        let rec = encode_feature(&self.schema, self.text, values, geometry)?;
        let mark = self.heap.mark();
        let (off, slot_len) = self.heap.append(&rec.bytes)?;
        if let Err(e) = self.index.assign_offset(id, off) {
            if let Err(undo) = self.heap.undo_append(off, slot_len, &mark) {
                warn!(row = id, offset = off, error = %undo, "could not release record after index failure");
            }
            return Err(e);
        }
        self.heap.set_valid_count(self.heap.valid_count() + 1);
        self.after_write(rec.extent)
    }

    /// Replaces a row. A record that no longer fits moves; its old space is freed.
    pub fn update_feature(&mut self, id: u32, values: &[Option<FieldValue>], geometry: Option<&Geometry>) -> Result<(), DbError> {
        let old_off = self.index.offset_for_row(id)?;
        if old_off == 0 {
            return Err(DbError::RowNotFound(id));
        }
        let old_len = self.live_len(id, old_off)?;
        let rec = encode_feature(&self.schema, self.text, values, geometry)?;

        if rec.bytes.len() <= old_len as usize {
            self.heap.overwrite_at(old_off, old_len, &rec.bytes)?;
            return self.after_write(rec.extent);
        }

        let mark = self.heap.mark();
        let (new_off, slot_len) = self.heap.append(&rec.bytes)?;
        if let Err(e) = self.index.assign_offset(id, new_off) {
            if let Err(undo) = self.heap.undo_append(new_off, slot_len, &mark) {
                warn!(row = id, offset = new_off, error = %undo, "could not release record after index failure");
            }
            return Err(e);
        }
        if let Err(e) = self.heap.tombstone(old_off, old_len) {
            // point back at the old record before giving up the new one
            let back = self.index.assign_offset(id, old_off).and_then(|_| self.heap.undo_append(new_off, slot_len, &mark));
            if let Err(undo) = back {
                warn!(row = id, error = %undo, "could not revert moved record");
            }
            return Err(e);
        }
        debug!(row = id, from = old_off, to = new_off, "record moved");
        self.after_write(rec.extent)
    }

    pub fn delete_feature(&mut self, id: u32) -> Result<(), DbError> {
        let off = self.index.offset_for_row(id)?;
        if off == 0 {
            return Err(DbError::RowNotFound(id));
        }
        let len = self.live_len(id, off)?;
        self.index.clear_offset(id)?;
        if let Err(e) = self.heap.tombstone(off, len) {
            if let Err(undo) = self.index.assign_offset(id, off) {
                warn!(row = id, error = %undo, "could not restore index slot after failed delete");
            }
            return Err(e);
        }
        self.heap.set_valid_count(self.heap.valid_count().saturating_sub(1));
        self.indexes_dirty = true;
        Ok(())
    }

    fn after_write(&mut self, extent: Option<Extent>) -> Result<(), DbError> {
        if let Some(e) = extent {
            let mut merged = self.extent;
            merged.merge(&e);
            if merged != self.extent {
                self.store_extent(merged)?;
            }
        }
        self.indexes_dirty = true;
        Ok(())
    }

    fn store_extent(&mut self, extent: Extent) -> Result<(), DbError> {
        let mut bytes = Vec::with_capacity(64);
        extent.encode(&mut bytes);
        self.heap.set_extent_bytes(&bytes)?;
        self.extent = extent;
        Ok(())
    }

    // ══════════════════════════════════════ MAINTENANCE ══════════════════════════════════════

    /// Flushes both files, then tells the refresher if rows changed.
    pub fn sync(&mut self) -> Result<(), DbError> {
        self.heap.sync()?;
        self.index.sync()?;
        if self.indexes_dirty {
            if let Some(r) = self.refresher.as_mut() {
                r.refresh(self.heap.path(), self.heap.valid_count())?;
            }
            self.indexes_dirty = false;
        }
        Ok(())
    }

    pub fn repack(&mut self) -> Result<RepackOutcome, DbError> {
        let was_dirty = self.indexes_dirty;
        self.indexes_dirty = false;
        let out = rewriter::repack(&mut self.heap, &mut self.index, self.options.repack_strategy);
        self.indexes_dirty = was_dirty;
        out
    }

    /// Recomputes the extent from the live rows, shrinking it after deletes.
    pub fn recompute_extent(&mut self) -> Result<Option<Extent>, DbError> {
        if self.schema.geometry_index().is_none() {
            return Ok(None);
        }
        let mut extent = Extent::empty();
        for (id, off) in self.index.live_rows()? {
            let payload = self.heap.read_record(off)?;
            let rec = decode_feature(&self.schema, self.text, &payload)
                .map_err(|e| DbError::corrupt(format!("row {}: {}", id, e)))?;
            if let Some(e) = rec.geometry.as_ref().and_then(Extent::of_geometry) {
                extent.merge(&e);
            }
        }
        self.store_extent(extent)?;
        Ok(self.geometry_bounds())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(table = %self.heap.path().display(), error = %e, "sync on close failed");
        }
    }
}
