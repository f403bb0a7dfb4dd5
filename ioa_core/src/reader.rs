use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::format::{Layout, Row, Table, TableEntry, HEADER_SIZE, TABLE_ENTRY_SIZE};

/// Random-access reader for trace datasets.
///
/// # Open sequence
/// 1. Read the 24-byte header (magic check, table count).
/// 2. Read the table directory that follows and verify the checksum over
///    header and directory.
/// 3. Check the file is long enough to hold every table it declares.
///
/// # Access pattern
/// [`DatasetReader::read_rows`] seeks to a table's first row and decodes
/// the requested range only.
pub struct DatasetReader {
    file: File,
    layout: Layout,
}

impl DatasetReader {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut file = File::open(path)?;

        // ── Header ──────────────────────────────────────────────────────────
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let (_, table_count) = Layout::parse_header(&header)?;

        // ── Directory ───────────────────────────────────────────────────────
        let mut prefix = header.to_vec();
        prefix.resize((HEADER_SIZE + TABLE_ENTRY_SIZE * table_count as u64) as usize, 0);
        file.read_exact(&mut prefix[HEADER_SIZE as usize..])?;
        let layout = Layout::from_bytes(&prefix)?;

        let actual = file.metadata()?.len();
        if actual < layout.file_len() {
            anyhow::bail!(
                "dataset truncated: {} bytes on disk, directory declares {}",
                actual,
                layout.file_len()
            );
        }

        Ok(Self { file, layout })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn entry(&self, table: Table) -> &TableEntry {
        self.layout.entry(table)
    }

    #[inline]
    pub fn record_count(&self, table: Table) -> u64 {
        self.entry(table).record_count
    }

    /// Decode every row of `R`'s table.
    pub fn read_rows<R: Row>(&mut self) -> anyhow::Result<Vec<R>> {
        let count = self.record_count(R::TABLE);
        self.read_range(0, count)
    }

    /// Decode rows `start..start + len` of `R`'s table.
    pub fn read_range<R: Row>(&mut self, start: u64, len: u64) -> anyhow::Result<Vec<R>> {
        let entry = self.layout.entry(R::TABLE);
        if start + len > entry.record_count {
            anyhow::bail!(
                "rows {}..{} out of range ({} has {})",
                start,
                start + len,
                entry.name,
                entry.record_count
            );
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        self.file.seek(SeekFrom::Start(entry.row_offset(start)))?;
        let mut buf = vec![0u8; len as usize * R::SIZE];
        self.file.read_exact(&mut buf)?;
        buf.chunks_exact(R::SIZE).map(R::decode).collect()
    }
}
