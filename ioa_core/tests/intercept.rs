/// Integration tests for the interception dispatcher, run against a
/// recording fake of the I/O layer and, for the multi-rank case, against
/// `LocalFiles` on thread-ranks.
use std::sync::Arc;

use ioa_codecs::{ZlibCodec, ZstdCodec};
use ioa_core::codec::{CodecId, Registry};
use ioa_core::collective::{Communicator, LocalGroup, SingleProcess};
use ioa_core::engine::{CompressionEngine, EngineOptions};
use ioa_core::error::ConfigError;
use ioa_core::format::{CompressionTraceRow, EvaluationRow, IoTraceRow, Table};
use ioa_core::inference::{Classifier, LabelTable, LinearClassifier, Predictor};
use ioa_core::intercept::{Interceptor, Runtime};
use ioa_core::io::{Datatype, FileHandle, IoLayer, LocalFiles, WriteCall, WriteOp};
use ioa_core::metric::Metric;
use ioa_core::reader::DatasetReader;
use ioa_core::record::TraceRecord;
use ioa_core::settings::{Modes, Settings};

/// Generate `len` highly compressible bytes (repeating pattern).
fn compressible_bytes(len: usize) -> Vec<u8> {
    let pattern = b"the quick brown fox jumps over the lazy dog. ";
    (0..len).map(|i| pattern[i % pattern.len()]).collect()
}

/// Fake I/O layer that records every call it receives.
#[derive(Default)]
struct Recorder {
    opens: Vec<String>,
    writes: Vec<(WriteOp, Option<i64>, Vec<u8>)>,
    pointer: i64,
    finalized: u32,
}

impl IoLayer for Recorder {
    type Completion = usize;
    type Error = String;

    fn open(&mut self, path: &str) -> Result<FileHandle, String> {
        self.opens.push(path.to_string());
        Ok(FileHandle(path.len() as u64))
    }

    fn write(&mut self, call: &WriteCall<'_>) -> Result<usize, String> {
        if call.handle == FileHandle(0) {
            return Err("invalid file handle".to_string());
        }
        self.writes.push((call.op, call.offset, call.payload().to_vec()));
        if call.offset.is_none() {
            self.pointer += call.byte_size() as i64;
        }
        Ok(call.byte_size())
    }

    fn position(&mut self, _: FileHandle) -> i64 {
        self.pointer
    }

    fn finalize(&mut self) -> Result<(), String> {
        self.finalized += 1;
        Ok(())
    }
}

// ── helpers ───────────────────────────────────────────────────────────────

fn two_by_two() -> Registry {
    Registry::new(vec![
        Arc::new(ZstdCodec::with_levels(vec![1, 19])),
        Arc::new(ZlibCodec::with_levels(vec![1, 9])),
    ])
}

fn engine(measure_decompression: bool) -> CompressionEngine {
    CompressionEngine::new(
        two_by_two(),
        EngineOptions {
            repeat: 1,
            measure_decompression,
        },
    )
}

fn trace_and_bench() -> Modes {
    Modes {
        tracing: true,
        benchmark: true,
        inference: false,
    }
}

const LABELS: &str = "Compression Rate\n4\nZSTD:1\n\nZLIB:9\n";

/// Always picks class 1 (ZLIB:9).
fn predictor() -> Predictor {
    let table = LabelTable::parse(LABELS).unwrap();
    let model = LinearClassifier::new(vec![vec![0.0; 4], vec![0.0; 4]], vec![0.0, 1.0]).unwrap();
    Predictor::new(table, Box::new(model))
}

/// Classifier whose scoring always fails.
struct Broken;

impl Classifier for Broken {
    fn classify(&self, _: &[f32]) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("model unavailable")
    }
}

fn write_call(buf: &[u8]) -> WriteCall<'_> {
    WriteCall::new(WriteOp::Write, FileHandle(8), buf, buf.len() as i32, Datatype::BYTE)
}

// ── tests ──────────────────────────────────────────────────────────────────

#[test]
fn test_no_modes_is_pure_pass_through() {
    let runtime = Runtime::new(engine(false), Modes::default());
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();
    let data = compressible_bytes(4096);

    let h = ic.open("data.bin").unwrap();
    assert_eq!(ic.write(&write_call(&data)).unwrap(), 4096);
    ic.finalize().unwrap();

    assert_eq!(h, FileHandle(8));
    assert_eq!(ic.io().writes.len(), 1);
    assert_eq!(ic.io().writes[0].2, data);
    assert_eq!(ic.io().finalized, 1);
    assert!(ic.trace_log().records().is_empty());
    assert_eq!(ic.trace_log().object_count(), 0);
}

#[test]
fn test_single_write_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.ioa");
    let runtime = Runtime::new(engine(false), trace_and_bench()).with_dataset_path(&path);
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    let data = compressible_bytes(4096);
    ic.io_mut().pointer = 100;
    assert_eq!(ic.write(&write_call(&data)).unwrap(), 4096);

    let records = ic.trace_log().records();
    assert_eq!(records.len(), 12 + 1);
    let counts = ic.trace_log().counts();
    assert_eq!((counts.io, counts.compression, counts.evaluation), (1, 12, 0));

    let chunks: Vec<String> = records
        .iter()
        .filter_map(|r| match r {
            TraceRecord::Compression { run, .. } => Some(run.chunk_id.clone()),
            TraceRecord::Io(_) => None,
        })
        .collect();
    assert!(chunks.windows(2).all(|w| w[0] == w[1]));
    assert!(records
        .iter()
        .all(|r| r.io().rank == 0 && r.io().offset == 100 && r.io().size == 4096));
    // the timed write comes last
    assert!(matches!(records.last(), Some(TraceRecord::Io(_))));

    ic.finalize().unwrap();
    let mut reader = DatasetReader::open(&path).unwrap();
    assert_eq!(reader.record_count(Table::IoTrace), 1);
    assert_eq!(reader.record_count(Table::CompressionTrace), 12);
    assert_eq!(reader.record_count(Table::Evaluation), 0);

    let io: Vec<IoTraceRow> = reader.read_rows().unwrap();
    assert_eq!(io[0].operation, "MPI_File_write");
    assert_eq!(io[0].datatype, "MPI_BYTE");
    assert_eq!((io[0].count, io[0].size, io[0].offset), (4096, 4096, 100));

    let comp: Vec<CompressionTraceRow> = reader.read_rows().unwrap();
    assert!(comp.iter().all(|row| row.chunk == chunks[0]));
    assert_eq!(comp.iter().filter(|row| row.codec == "ZSTD").count(), 6);
}

#[test]
fn test_decompression_adds_a_fourth_metric() {
    let dir = tempfile::tempdir().unwrap();
    let runtime =
        Runtime::new(engine(true), trace_and_bench()).with_dataset_path(dir.path().join("t.ioa"));
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    ic.write(&write_call(&compressible_bytes(4096))).unwrap();
    let counts = ic.trace_log().counts();
    assert_eq!((counts.io, counts.compression), (1, 16));
}

#[test]
fn test_min_size_filters_benchmarking_but_not_tracing() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::new(engine(false), trace_and_bench())
        .with_dataset_path(dir.path().join("t.ioa"))
        .with_min_size(4096);
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    ic.write(&write_call(&compressible_bytes(4095))).unwrap();
    assert_eq!(ic.trace_log().counts().compression, 0);
    assert_eq!(ic.trace_log().counts().io, 1);

    // the boundary is inclusive
    ic.write(&write_call(&compressible_bytes(4096))).unwrap();
    assert_eq!(ic.trace_log().counts().compression, 12);
}

#[test]
fn test_explicit_offset_and_datatype_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let modes = Modes {
        tracing: true,
        ..Modes::default()
    };
    let runtime = Runtime::new(engine(false), modes).with_dataset_path(dir.path().join("t.ioa"));
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    let data = compressible_bytes(64);
    let call =
        WriteCall::new(WriteOp::IWriteAtAll, FileHandle(3), &data, 16, Datatype::INT).at(4096);
    ic.write(&call).unwrap();

    let io = ic.trace_log().records()[0].io().clone();
    assert_eq!(io.operation, "MPI_File_iwrite_at_all");
    assert_eq!(io.datatype, "MPI_INT");
    assert_eq!((io.offset, io.count, io.size), (4096, 16, 64));
    assert_eq!(ic.io().writes[0].1, Some(4096));

    let anon = WriteCall::new(WriteOp::Write, FileHandle(3), &data, 2, Datatype::unnamed(32));
    ic.write(&anon).unwrap();
    assert_eq!(ic.trace_log().records()[1].io().datatype, "NA");
}

#[test]
fn test_inner_errors_are_returned_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let runtime =
        Runtime::new(engine(false), trace_and_bench()).with_dataset_path(dir.path().join("t.ioa"));
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    let data = compressible_bytes(128);
    let call = WriteCall::new(WriteOp::WriteAll, FileHandle(0), &data, 128, Datatype::BYTE);
    assert_eq!(ic.write(&call), Err("invalid file handle".to_string()));
}

#[test]
fn test_inference_records_one_evaluation_per_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eval.ioa");
    let modes = Modes {
        inference: true,
        ..Modes::default()
    };
    let runtime = Runtime::new(engine(false), modes)
        .with_dataset_path(&path)
        .with_predictor(predictor());
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    let data = compressible_bytes(8192);
    assert_eq!(ic.write(&write_call(&data)).unwrap(), 8192);
    assert_eq!(ic.io().writes.len(), 1);
    assert!(ic.trace_log().records().is_empty());

    let eval = ic.trace_log().evaluations()[0].clone();
    assert_eq!(eval.metric, Metric::CompressionRatio);
    assert_eq!((eval.predicted.codec, eval.predicted.level), (CodecId::Zlib, 9));
    assert_eq!(eval.size, 8192);
    if let Some(tested) = eval.tested {
        assert!(tested.value > eval.predicted.value);
        assert_ne!((tested.codec, tested.level), (CodecId::Zlib, 9));
    }

    ic.finalize().unwrap();
    let mut reader = DatasetReader::open(&path).unwrap();
    let rows: Vec<EvaluationRow> = reader.read_rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].predicted_codec, "ZLIB");
    assert_eq!(rows[0].metric, "Compression Rate");
    assert_eq!(reader.record_count(Table::IoTrace), 0);
}

#[test]
fn test_inference_below_min_size_is_traced_and_benchmarked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.ioa");
    let modes = Modes {
        tracing: true,
        benchmark: true,
        inference: true,
    };
    let runtime = Runtime::new(engine(false), modes)
        .with_dataset_path(&path)
        .with_min_size(4096)
        .with_predictor(predictor());
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    // below the filter: the bench/trace branch applies, minus the filtered benchmark
    assert_eq!(ic.write(&write_call(&compressible_bytes(100))).unwrap(), 100);
    let counts = ic.trace_log().counts();
    assert_eq!((counts.io, counts.compression, counts.evaluation), (1, 0, 0));

    // admitted: inference only, nothing traced
    ic.write(&write_call(&compressible_bytes(4096))).unwrap();
    let counts = ic.trace_log().counts();
    assert_eq!((counts.io, counts.compression, counts.evaluation), (1, 0, 1));
    assert_eq!(ic.io().writes.len(), 2);

    ic.finalize().unwrap();
    let mut reader = DatasetReader::open(&path).unwrap();
    let io: Vec<IoTraceRow> = reader.read_rows().unwrap();
    assert_eq!(io.len(), 1);
    assert_eq!(io[0].size, 100);
    assert_eq!(reader.record_count(Table::Evaluation), 1);
}

#[test]
fn test_classifier_failure_aborts_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aborted.ioa");

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        LocalGroup::run(2, |comm| {
            let modes = Modes {
                tracing: true,
                inference: true,
                ..Modes::default()
            };
            let predictor = if comm.rank() == 1 {
                Predictor::new(LabelTable::parse(LABELS).unwrap(), Box::new(Broken))
            } else {
                predictor()
            };
            let runtime = Runtime::new(engine(false), modes)
                .with_dataset_path(&path)
                .with_predictor(predictor);
            let mut ic = Interceptor::new(Recorder::default(), comm, runtime).unwrap();
            ic.write(&write_call(&compressible_bytes(512))).unwrap();
            ic.finalize().unwrap();
        })
    }));

    assert!(outcome.is_err());
    assert!(!path.exists());
}

#[test]
fn test_finalize_flushes_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("once.ioa");
    let runtime = Runtime::new(engine(false), trace_and_bench()).with_dataset_path(&path);
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    ic.write(&write_call(&compressible_bytes(256))).unwrap();
    ic.finalize().unwrap();
    assert!(ic.is_stopped());
    assert!(path.exists());

    std::fs::remove_file(&path).unwrap();
    ic.write(&write_call(&compressible_bytes(256))).unwrap();
    ic.finalize().unwrap();

    assert!(!path.exists(), "second finalize must not flush again");
    assert_eq!(ic.io().finalized, 2);
    assert_eq!(ic.io().writes.len(), 2);
    assert!(ic.trace_log().records().is_empty());
}

#[test]
fn test_open_registers_each_handle_once() {
    let dir = tempfile::tempdir().unwrap();
    let runtime =
        Runtime::new(engine(false), trace_and_bench()).with_dataset_path(dir.path().join("t.ioa"));
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    let a = ic.open("abc").unwrap();
    let b = ic.open("xyz").unwrap(); // same length, same handle value
    assert_eq!(a, b);
    assert_eq!(ic.io().opens.len(), 2);
    assert_eq!(ic.trace_log().object_count(), 1);
    assert_eq!(ic.trace_log().object(a).unwrap().filename, "abc");
}

#[test]
fn test_inconsistent_runtime_is_rejected() {
    let no_path = Runtime::new(engine(false), trace_and_bench());
    assert!(matches!(
        Interceptor::new(Recorder::default(), SingleProcess, no_path),
        Err(ConfigError::MissingMetaPath)
    ));

    let modes = Modes {
        inference: true,
        ..Modes::default()
    };
    let no_model = Runtime::new(engine(false), modes).with_dataset_path("unused.ioa");
    assert!(matches!(
        Interceptor::new(Recorder::default(), SingleProcess, no_model),
        Err(ConfigError::InferenceWithoutModel)
    ));
}

#[test]
fn test_runtime_from_settings_loads_classifier() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.json");
    let labels = dir.path().join("labels.txt");
    let path = dir.path().join("trace.ioa");
    let weights = r#"{"weights": [[1, 0, 0, 0], [0, 0, 0, 0]], "bias": [0, 0.5]}"#;
    std::fs::write(&model, weights).unwrap();
    std::fs::write(&labels, LABELS).unwrap();

    let settings = Settings::parse_options(&format!(
        "-i -p {} -x {} -o {}",
        path.display(),
        model.display(),
        labels.display()
    ))
    .unwrap();
    let runtime = Runtime::from_settings(&settings, two_by_two()).unwrap();
    let mut ic = Interceptor::new(Recorder::default(), SingleProcess, runtime).unwrap();

    // first feature 2.0 beats the 0.5 bias of class 1
    let mut data = 2.0f32.to_le_bytes().to_vec();
    data.extend(compressible_bytes(1020));
    ic.write(&write_call(&data)).unwrap();
    let eval = &ic.trace_log().evaluations()[0];
    assert_eq!((eval.predicted.codec, eval.predicted.level), (CodecId::Zstd, 1));
}

#[test]
fn test_labels_outside_the_registry_fail_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.json");
    let labels = dir.path().join("labels.txt");
    std::fs::write(&model, r#"{"weights": [[0, 0, 0, 0], [0, 0, 0, 0]], "bias": [0, 0]}"#).unwrap();
    std::fs::write(&labels, "Compression Rate\n4\nZSTD:1\nLZ4:9\n").unwrap();

    let settings = Settings::parse_options(&format!(
        "-i -p {} -x {} -o {}",
        dir.path().join("trace.ioa").display(),
        model.display(),
        labels.display()
    ))
    .unwrap();
    let err = Runtime::from_settings(&settings, two_by_two()).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::UnregisteredLabel {
            codec: CodecId::Lz4,
            level: 9
        })
    ));
}

#[test]
fn test_ranks_trace_local_files_into_one_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("group.ioa");
    let ranks = 3;
    let writes = 4;
    let size = 1024;

    LocalGroup::run(ranks, |comm| {
        let rank = comm.rank();
        let modes = Modes {
            tracing: true,
            ..Modes::default()
        };
        let runtime = Runtime::new(engine(false), modes).with_dataset_path(&path);
        let mut ic = Interceptor::new(LocalFiles::rooted(dir.path()), comm, runtime).unwrap();

        let h = ic.open("shared.bin").unwrap();
        let data = compressible_bytes(size);
        for i in 0..writes {
            let offset = ((rank * writes + i) * size) as i64;
            let call =
                WriteCall::new(WriteOp::WriteAt, h, &data, size as i32, Datatype::BYTE).at(offset);
            assert_eq!(ic.write(&call).unwrap(), size);
        }
        ic.finalize().unwrap();
    });

    let mut reader = DatasetReader::open(&path).unwrap();
    let io: Vec<IoTraceRow> = reader.read_rows().unwrap();
    assert_eq!(io.len(), ranks * writes);
    let offsets: Vec<i64> = io.iter().map(|row| row.offset).collect();
    let expected: Vec<i64> = (0..ranks * writes).map(|i| (i * size) as i64).collect();
    assert_eq!(offsets, expected);
    assert_eq!(
        std::fs::metadata(dir.path().join("shared.bin")).unwrap().len(),
        (ranks * writes * size) as u64
    );
}
