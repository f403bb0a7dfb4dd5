use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};

use ioa_core::collective::{Communicator, LocalGroup};
use ioa_core::engine::{CompressionEngine, EngineOptions};
use ioa_core::format::{CompressionTraceRow, EvaluationRow, IoTraceRow, Row, Table};
use ioa_core::intercept::{Interceptor, Runtime};
use ioa_core::io::{Datatype, IoLayer, LocalFiles, WriteCall, WriteOp};
use ioa_core::metric::Metric;
use ioa_core::reader::DatasetReader;
use ioa_core::settings::Settings;

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "ioa",
    about = "Benchmark codecs on write buffers, simulate traced writes, inspect trace datasets",
    version
)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every codec and level over a file's bytes
    Bench {
        /// Input file
        file: PathBuf,
        /// Timed repetitions averaged per measurement
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
        /// Also measure decompression speed
        #[arg(short, long)]
        decompression: bool,
        /// Only use the first BYTES bytes of the file
        #[arg(short, long)]
        limit: Option<usize>,
        /// Also report the best codec and level for this metric
        #[arg(short, long)]
        metric: Option<Metric>,
    },
    /// Print the table directory and leading rows of a trace dataset
    Inspect {
        /// Trace dataset
        dataset: PathBuf,
        /// Rows printed per table
        #[arg(short, long, default_value_t = 5)]
        rows: u64,
        /// Count, per chunk, which CODEC:LEVEL scored best on this metric
        #[arg(short, long)]
        winners: Option<Metric>,
    },
    /// Run thread-ranks that write through the interceptor, then flush
    ///
    /// Each rank writes to its own file under --dir, cycling through every
    /// write-family operation.
    Simulate {
        /// Number of ranks
        #[arg(long, default_value_t = 4)]
        ranks: usize,
        /// Write calls per rank
        #[arg(long, default_value_t = 8)]
        writes: usize,
        /// Bytes per write call
        #[arg(long, default_value_t = 64 * 1024)]
        size: usize,
        /// Directory for the written files and, by default, the dataset
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Read the interceptor options from IOA_OPTIONS instead
        #[arg(long)]
        env: bool,
        #[command(flatten)]
        settings: Settings,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Deterministic write payload: text runs mixed with LCG noise, so codecs
/// and levels actually differ.
fn payload(len: usize, seed: u64) -> Vec<u8> {
    let pattern = b"rank-local checkpoint field, timestep ";
    let mut rng = seed;
    (0..len)
        .map(|i| {
            if (i / 512) % 3 == 2 {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (rng >> 56) as u8
            } else {
                pattern[i % pattern.len()]
            }
        })
        .collect()
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_bench(
    file: PathBuf,
    repeat: u32,
    decompression: bool,
    limit: Option<usize>,
    metric: Option<Metric>,
) -> anyhow::Result<()> {
    let mut data =
        std::fs::read(&file).with_context(|| format!("reading input file {:?}", file))?;
    if let Some(limit) = limit {
        data.truncate(limit);
    }
    if data.is_empty() {
        anyhow::bail!("nothing to benchmark: {:?} is empty", file);
    }
    if repeat == 0 {
        anyhow::bail!("--repeat must be at least 1");
    }

    let engine = CompressionEngine::new(
        ioa_codecs::registry(),
        EngineOptions {
            repeat,
            measure_decompression: decompression,
        },
    );

    let t0 = Instant::now();
    let bench = engine.benchmark_all(&data);
    let elapsed = t0.elapsed();

    println!(
        "  {:<10} {:>6}  {:<26} {:>16}  {:>10}",
        "codec", "level", "metric", "value", "time"
    );
    println!("  {}", "-".repeat(74));
    for run in &bench.runs {
        println!(
            "  {:<10} {:>6}  {:<26} {:>16.4}  {:>7} µs",
            run.codec.name(),
            run.level,
            run.metric.name(),
            run.value,
            run.duration.as_micros()
        );
    }

    if let Some(metric) = metric {
        match engine.select_best(&data, metric, None) {
            Some(best) => println!(
                "\n  best for {}: {}:{} ({:.4}, {})",
                metric,
                best.codec,
                best.level,
                best.value,
                human_bytes(best.compressed_size as u64)
            ),
            None => println!("\n  no codec accepted the input"),
        }
    }

    eprintln!();
    eprintln!("  input       : {}", human_bytes(data.len() as u64));
    eprintln!("  candidates  : {}", engine.registry().candidate_count());
    eprintln!("  runs        : {}", bench.runs.len());
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn print_rows<R: Row>(
    reader: &mut DatasetReader,
    rows: u64,
    show: impl Fn(&R) -> String,
) -> anyhow::Result<()> {
    let count = reader.record_count(R::TABLE).min(rows);
    for (i, row) in reader.read_range::<R>(0, count)?.iter().enumerate() {
        println!("  {:>6}  {}", i, show(row));
    }
    Ok(())
}

fn run_inspect(dataset: PathBuf, rows: u64, winners: Option<Metric>) -> anyhow::Result<()> {
    let mut reader = DatasetReader::open(&dataset)
        .with_context(|| format!("opening dataset {:?}", dataset))?;
    let file_size = std::fs::metadata(&dataset)?.len();

    println!("=== IOA trace dataset: {:?} ===", dataset);
    println!();
    println!("  format version : {}", reader.layout().version);
    println!("  file on disk   : {}", human_bytes(file_size));
    println!();
    println!("  {:<20} {:>10} {:>12} {:>14}", "table", "rows", "row size", "data offset");
    println!("  {}", "-".repeat(59));
    for table in Table::ALL {
        let e = reader.entry(table);
        println!(
            "  {:<20} {:>10} {:>12} {:>14}",
            e.name, e.record_count, e.record_size, e.data_offset
        );
    }

    println!("\n--- {} ---", Table::IoTrace.name());
    print_rows::<IoTraceRow>(&mut reader, rows, |r| {
        format!(
            "rank {:>3}  {:<24} {:>10} B @ {:<12} {:>8} µs  {}",
            r.rank, r.operation, r.size, r.offset, r.duration_us, r.datatype
        )
    })?;

    println!("\n--- {} ---", Table::CompressionTrace.name());
    print_rows::<CompressionTraceRow>(&mut reader, rows, |r| {
        format!(
            "rank {:>3}  {:<9}{:>3}  {:<26} {:>14.4}  {}",
            r.rank, r.codec, r.level, r.metric, r.value, r.chunk
        )
    })?;

    println!("\n--- {} ---", Table::Evaluation.name());
    print_rows::<EvaluationRow>(&mut reader, rows, |r| {
        let tested = if r.tested_codec.is_empty() {
            "held".to_string()
        } else {
            format!("beaten by {}:{} ({:.4})", r.tested_codec, r.tested_level, r.tested_value)
        };
        format!(
            "rank {:>3}  {} B  predicted {}:{} ({:.4})  {}",
            r.rank, r.size, r.predicted_codec, r.predicted_level, r.predicted_value, tested
        )
    })?;

    if let Some(metric) = winners {
        let comp: Vec<CompressionTraceRow> = reader.read_rows()?;
        let dist = winner_distribution(&comp, metric);
        println!("\n--- winners by {} ---", metric);
        if dist.is_empty() {
            println!("  no {} runs recorded", metric);
        }
        for (label, n) in dist {
            println!("  {:<14} {:>8}", label, n);
        }
    }

    Ok(())
}

/// Per chunk, the first highest-scoring `CODEC:LEVEL` on `metric`, counted.
fn winner_distribution(rows: &[CompressionTraceRow], metric: Metric) -> BTreeMap<String, u64> {
    let mut best: HashMap<&str, &CompressionTraceRow> = HashMap::new();
    for row in rows.iter().filter(|r| r.metric == metric.name()) {
        best.entry(row.chunk.as_str())
            .and_modify(|b| {
                if row.value > b.value {
                    *b = row;
                }
            })
            .or_insert(row);
    }
    let mut dist = BTreeMap::new();
    for row in best.values() {
        *dist.entry(format!("{}:{}", row.codec, row.level)).or_insert(0) += 1;
    }
    dist
}

fn run_simulate(
    ranks: usize,
    writes: usize,
    size: usize,
    dir: Option<PathBuf>,
    env: bool,
    settings: Settings,
) -> anyhow::Result<()> {
    if ranks == 0 {
        anyhow::bail!("--ranks must be at least 1");
    }
    let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("ioa-simulate"));
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;

    let mut settings = if env { Settings::from_env()? } else { settings };
    if settings.meta_path.is_none() {
        settings.meta_path = Some(dir.join("trace.ioa"));
    }
    settings.validate()?;
    if !settings.modes().any() {
        warn!("no tracing, benchmark or inference mode enabled; nothing will be recorded");
    }
    let dataset = settings.meta_path.clone().unwrap_or_default();

    let t0 = Instant::now();
    let results = LocalGroup::run(ranks, |comm| simulate_rank(comm, &dir, writes, size, &settings));
    for (rank, result) in results.into_iter().enumerate() {
        result.with_context(|| format!("rank {}", rank))?;
    }
    let elapsed = t0.elapsed();

    eprintln!("  ranks       : {}", ranks);
    eprintln!("  writes      : {} x {}", ranks * writes, human_bytes(size as u64));
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());

    if settings.modes().any() {
        let reader = DatasetReader::open(&dataset)?;
        eprintln!("  dataset     : {:?}", dataset);
        for table in Table::ALL {
            eprintln!("    {:<18}: {} rows", table.name(), reader.record_count(table));
        }
    }
    Ok(())
}

fn simulate_rank(
    comm: LocalGroup,
    dir: &Path,
    writes: usize,
    size: usize,
    settings: &Settings,
) -> anyhow::Result<()> {
    let rank = comm.rank();
    let runtime = Runtime::from_settings(settings, ioa_codecs::registry())?;
    let mut ic = Interceptor::new(LocalFiles::rooted(dir), comm, runtime)?;

    let handle = ic.open(&format!("rank-{}.bin", rank))?;
    for i in 0..writes {
        let data = payload(size, (rank * writes + i) as u64);
        let op = WriteOp::ALL[i % WriteOp::ALL.len()];
        let mut call = WriteCall::new(op, handle, &data, size as i32, Datatype::BYTE);
        if op.has_explicit_offset() {
            call = call.at((i * size) as i64);
        }
        ic.write(&call)?;
    }
    info!("rank {} issued {} writes", rank, writes);
    ic.finalize()?;
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose
        || matches!(&cli.command, Commands::Simulate { settings, .. } if settings.verbose);
    init_logging(verbose);

    match cli.command {
        Commands::Bench {
            file,
            repeat,
            decompression,
            limit,
            metric,
        } => run_bench(file, repeat, decompression, limit, metric),
        Commands::Inspect {
            dataset,
            rows,
            winners,
        } => run_inspect(dataset, rows, winners),
        Commands::Simulate {
            ranks,
            writes,
            size,
            dir,
            env,
            settings,
        } => run_simulate(ranks, writes, size, dir, env, settings),
    }
}
