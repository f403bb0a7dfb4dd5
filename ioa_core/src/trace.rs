//! Per-rank trace buffers and the collective flush into one dataset.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use crate::collective::Communicator;
use crate::format::{CompressionTraceRow, EvaluationRow, IoTraceRow, Table};
use crate::io::FileHandle;
use crate::record::{EvaluationRecord, IoObject, TraceRecord};
use crate::writer::DatasetWriter;

/// This rank's contiguous range of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slab {
    /// First row owned by the rank.
    pub offset: u64,
    pub len: u64,
    /// Rows in the table across all ranks.
    pub total: u64,
}

/// Slab of `rank` given every rank's row count: offset is the sum of the
/// counts of lower ranks.
pub fn slab(counts: &[u64], rank: usize) -> Slab {
    Slab {
        offset: counts[..rank].iter().sum(),
        len: counts[rank],
        total: counts.iter().sum(),
    }
}

/// Row counts of one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub io: u64,
    pub compression: u64,
    pub evaluation: u64,
}

/// Records collected on one rank, in insertion order.
#[derive(Debug, Default)]
pub struct TraceLog {
    objects: HashMap<FileHandle, IoObject>,
    records: Vec<TraceRecord>,
    evaluations: Vec<EvaluationRecord>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`. An already tracked handle keeps its first name.
    pub fn register_object(&mut self, handle: FileHandle, filename: &str) {
        self.objects.entry(handle).or_insert_with(|| IoObject {
            handle,
            filename: filename.to_string(),
        });
    }

    pub fn object(&self, handle: FileHandle) -> Option<&IoObject> {
        self.objects.get(&handle)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn push(&mut self, record: TraceRecord) {
        self.records.push(record);
    }

    pub fn push_evaluation(&mut self, record: EvaluationRecord) {
        self.evaluations.push(record);
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn evaluations(&self) -> &[EvaluationRecord] {
        &self.evaluations
    }

    pub fn counts(&self) -> Counts {
        let compression = self.records.iter().filter(|r| r.is_compression()).count() as u64;
        Counts {
            io: self.records.len() as u64 - compression,
            compression,
            evaluation: self.evaluations.len() as u64,
        }
    }

    /// Write every rank's records into the dataset at `path`.
    ///
    /// Collective: every rank of `comm` must call this, even with nothing
    /// recorded. The buffers are drained whether or not the write succeeds.
    pub fn flush<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();
        let records = std::mem::take(&mut self.records);
        let evaluations = std::mem::take(&mut self.evaluations);

        let mut io_rows = Vec::new();
        let mut compression_rows = Vec::new();
        for record in &records {
            match record {
                TraceRecord::Io(io) => io_rows.push(IoTraceRow::from(io)),
                TraceRecord::Compression { io, run } => {
                    compression_rows.push(CompressionTraceRow::from_run(io, run))
                }
            }
        }
        let eval_rows: Vec<EvaluationRow> = evaluations.iter().map(EvaluationRow::from).collect();
        let local = [io_rows.len() as u64, compression_rows.len() as u64, eval_rows.len() as u64];

        comm.barrier();

        let gathered = comm.all_gather(&local);
        if gathered.len() != comm.size() || gathered.iter().any(|c| c.len() != local.len()) {
            anyhow::bail!(
                "count exchange returned {} entries for {} ranks",
                gathered.len(),
                comm.size()
            );
        }
        let slabs: Vec<Slab> = (0..Table::ALL.len())
            .map(|t| {
                let per_rank: Vec<u64> = gathered.iter().map(|c| c[t]).collect();
                slab(&per_rank, comm.rank())
            })
            .collect();
        for (table, s) in Table::ALL.iter().zip(&slabs) {
            debug!(
                "rank {} {}: rows {}..{} of {}",
                comm.rank(),
                table.name(),
                s.offset,
                s.offset + s.len,
                s.total
            );
        }

        let totals = [slabs[0].total, slabs[1].total, slabs[2].total];
        let mut writer = DatasetWriter::create(comm, path, totals)?;
        writer.write_slab(slabs[0].offset, &io_rows)?;
        writer.write_slab(slabs[1].offset, &compression_rows)?;
        writer.write_slab(slabs[2].offset, &eval_rows)?;
        writer.finish(comm)?;
        Ok(())
    }
}
