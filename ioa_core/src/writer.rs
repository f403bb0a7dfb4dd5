use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::collective::Communicator;
use crate::format::{Layout, Row};

/// Collective writer for the trace dataset.
///
/// # Write contract
/// 1. Every rank calls [`DatasetWriter::create`] with the same global counts.
///    Rank 0 creates the file, writes header and directory and sizes the
///    file. The outcome is shared, so either every rank gets a writer or
///    every rank gets the error.
/// 2. Each rank writes its own slab of each table with
///    [`DatasetWriter::write_slab`]. Slabs never overlap, so these writes
///    are independent.
/// 3. Every rank calls [`DatasetWriter::finish`].
///
/// # Format layout written
/// ```text
/// [HEADER: 24 bytes]
/// [DIRECTORY: 48 bytes × 3]
/// [IO-Trace rows] [Compression-Trace rows] [Evaluation rows]
/// ```
pub struct DatasetWriter {
    file: File,
    layout: Layout,
}

impl DatasetWriter {
    pub fn create<C: Communicator + ?Sized>(
        comm: &C,
        path: impl AsRef<Path>,
        counts: [u64; 3],
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let layout = Layout::new(counts);

        let created = if comm.rank() == 0 {
            Self::create_root(path, &layout)
                .map_err(|e| e.context(format!("creating dataset {:?}", path)))
        } else {
            Ok(())
        };

        let status = comm.all_gather(&[created.is_ok() as u64]);
        created?;
        if status.first().and_then(|s| s.first()) != Some(&1) {
            anyhow::bail!("rank 0 failed to create dataset {:?}", path);
        }

        let file = OpenOptions::new().write(true).open(path)?;
        debug!(
            "rank {} opened dataset {:?} ({} bytes)",
            comm.rank(),
            path,
            layout.file_len()
        );
        Ok(Self { file, layout })
    }

    fn create_root(path: &Path, layout: &Layout) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&layout.to_bytes())?;
        file.set_len(layout.file_len())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Write `rows` starting at row `offset` of the row type's table.
    pub fn write_slab<R: Row>(&mut self, offset: u64, rows: &[R]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let entry = self.layout.entry(R::TABLE);
        let end = offset + rows.len() as u64;
        if end > entry.record_count {
            anyhow::bail!(
                "slab {}..{} exceeds {} table of {} rows",
                offset,
                end,
                entry.name,
                entry.record_count
            );
        }

        let mut buf = Vec::with_capacity(rows.len() * R::SIZE);
        for row in rows {
            row.encode(&mut buf);
        }
        self.file.seek(SeekFrom::Start(entry.row_offset(offset)))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Flush this rank's writes and wait for the rest of the group.
    pub fn finish<C: Communicator + ?Sized>(mut self, comm: &C) -> anyhow::Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        comm.barrier();
        Ok(())
    }
}
