//! Minimal cell store behind each table.
//!
//! Models just enough of the storage engine for the control plane to have
//! observable effects:
//!
//! - an in-memory write buffer (memtable), lost to clones taken without flush
//! - immutable data files, shared by `Arc` between a table and its clones so
//!   disk usage can be attributed to groups of tables
//! - split points, carried through clone and export
//!
//! Flush runs the MINC pipeline, compaction the MAJC pipeline and scans the
//! SCAN pipeline. There is no internal locking; the catalog's lock
//! serializes access.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::iterators::{self, IteratorSetting};
use crate::names::TableId;

/// A single versioned value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub row: String,
    pub column: String,
    pub timestamp: u64,
    pub value: String,
}

impl Cell {
    pub fn new(
        row: impl Into<String>,
        column: impl Into<String>,
        timestamp: u64,
        value: impl Into<String>,
    ) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
            timestamp,
            value: value.into(),
        }
    }

    /// Bytes this cell occupies in a data file.
    fn encoded_len(&self) -> u64 {
        (self.row.len() + self.column.len() + self.value.len() + 8) as u64
    }
}

/// Immutable flushed or compacted file.
#[derive(Debug)]
pub struct DataFile {
    pub id: String,
    pub size_bytes: u64,
    /// Scan order: (row, column) ascending, newest first.
    cells: Vec<Cell>,
}

impl DataFile {
    /// Build a file; the id is derived from the owning table, a per-table
    /// file sequence and the content, so it is unique and deterministic.
    fn build(table: TableId, seq: u64, cells: Vec<Cell>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&table.0.to_be_bytes());
        hasher.update(&seq.to_be_bytes());
        let mut size_bytes = 0u64;
        for cell in &cells {
            hasher.update(cell.row.as_bytes());
            hasher.update(cell.column.as_bytes());
            hasher.update(&cell.timestamp.to_be_bytes());
            hasher.update(cell.value.as_bytes());
            size_bytes += cell.encoded_len();
        }
        let hex = hasher.finalize().to_hex();
        Self {
            id: format!("F{}.rf", &hex.as_str()[..16]),
            size_bytes,
            cells,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

/// Outcome of a minor or major compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult {
    pub file_id: Option<String>,
    pub cells_written: usize,
}

/// Cell storage for one table.
#[derive(Debug, Default)]
pub struct TabletData {
    /// Write order.
    memtable: Vec<Cell>,
    /// Oldest first.
    files: Vec<Arc<DataFile>>,
    splits: BTreeSet<String>,
    next_file_seq: u64,
}

impl TabletData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty storage with pre-defined split points (import).
    pub fn with_splits(splits: BTreeSet<String>) -> Self {
        Self {
            splits,
            ..Self::default()
        }
    }

    // -- Write Operations -----------------------------------------------------

    pub fn write(&mut self, cell: Cell) {
        self.memtable.push(cell);
    }

    pub fn has_unflushed(&self) -> bool {
        !self.memtable.is_empty()
    }

    /// Minor compaction: run the MINC pipeline over the memtable and write
    /// the survivors to a new file.
    pub fn flush(&mut self, table: TableId, minc: &[IteratorSetting]) -> FlushResult {
        if self.memtable.is_empty() {
            return FlushResult { file_id: None, cells_written: 0 };
        }
        let cells = iterators::apply(minc, std::mem::take(&mut self.memtable));
        let cells_written = cells.len();
        let file = self.new_file(table, cells);
        let file_id = file.id.clone();
        self.files.push(file);
        FlushResult { file_id: Some(file_id), cells_written }
    }

    /// Major compaction: merge every file through the MAJC pipeline into one.
    /// The memtable is untouched.
    pub fn compact(&mut self, table: TableId, majc: &[IteratorSetting]) -> FlushResult {
        if self.files.is_empty() {
            return FlushResult { file_id: None, cells_written: 0 };
        }
        let cells = iterators::apply(majc, self.file_cells_in_write_order());
        let cells_written = cells.len();
        self.files.clear();
        if cells.is_empty() {
            return FlushResult { file_id: None, cells_written };
        }
        let file = self.new_file(table, cells);
        let file_id = file.id.clone();
        self.files.push(file);
        FlushResult { file_id: Some(file_id), cells_written }
    }

    // -- Read Operations ------------------------------------------------------

    /// Read every cell through the SCAN pipeline.
    pub fn scan(&self, scan: &[IteratorSetting]) -> Vec<Cell> {
        let mut cells = self.file_cells_in_write_order();
        cells.extend(self.memtable.iter().cloned());
        iterators::apply(scan, cells)
    }

    pub fn files(&self) -> &[Arc<DataFile>] {
        &self.files
    }

    // -- Splits ---------------------------------------------------------------

    /// Add split points. Returns how many were new.
    pub fn add_splits(&mut self, splits: impl IntoIterator<Item = String>) -> usize {
        splits.into_iter().filter(|s| self.splits.insert(s.clone())).count()
    }

    pub fn splits(&self) -> &BTreeSet<String> {
        &self.splits
    }

    /// Number of tablets (key ranges) the splits define.
    pub fn tablet_count(&self) -> usize {
        self.splits.len() + 1
    }

    // -- Clone ----------------------------------------------------------------

    /// Point-in-time copy sharing this table's files. The memtable is NOT
    /// copied: unflushed writes are absent from the snapshot.
    pub fn snapshot_flushed(&self) -> TabletData {
        TabletData {
            memtable: Vec::new(),
            files: self.files.clone(),
            splits: self.splits.clone(),
            next_file_seq: 0,
        }
    }

    // -- Internals ------------------------------------------------------------

    fn new_file(&mut self, table: TableId, cells: Vec<Cell>) -> Arc<DataFile> {
        let seq = self.next_file_seq;
        self.next_file_seq += 1;
        Arc::new(DataFile::build(table, seq, cells))
    }

    /// Files hold scan order (newest first per key); reversing each file and
    /// walking files oldest-first restores relative write order for ties.
    fn file_cells_in_write_order(&self) -> Vec<Cell> {
        self.files
            .iter()
            .flat_map(|f| f.cells.iter().rev().cloned())
            .collect()
    }
}
