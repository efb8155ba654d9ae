use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use statehist::backend::InMemoryBackend;
use statehist::event::TraceEvent;
use statehist::mipmap;
use statehist::pipeline::{HistoryBuilder, DEFAULT_QUEUE_CAPACITY};
use statehist::provider::{
    CounterStateProvider, KernelStateProvider, StateProvider, IGNORE_PROVIDER_VERSION,
};
use statehist::snapshot;
use statehist::system::StateSystem;

#[derive(Debug, Parser)]
#[command(name = "statehist", about = "Build and query trace state histories")]
struct Command {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Replay a JSONL event file into a history snapshot.
    Build {
        /// Input events, one JSON object per line, time-ordered.
        #[arg(long)]
        events: PathBuf,
        /// Where to write the history snapshot.
        #[arg(long)]
        out: PathBuf,
        /// State provider: "kernel" or "counters".
        #[arg(long, default_value = "kernel")]
        provider: String,
        /// Mipmap resolution for the counters provider.
        #[arg(long, default_value_t = mipmap::DEFAULT_RESOLUTION)]
        resolution: u64,
        /// Bounded event queue capacity.
        #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,
    },
    /// Query a history snapshot.
    Query {
        #[arg(long)]
        history: PathBuf,
        /// Attribute path, e.g. Threads/42/Status. Omit with --at to dump
        /// the full state.
        #[arg(long)]
        attr: Option<String>,
        /// Point-in-time query timestamp.
        #[arg(long)]
        at: Option<i64>,
        /// Range query as T1:T2.
        #[arg(long)]
        range: Option<String>,
        /// Aggregate a range instead of listing intervals: min, max or avg.
        #[arg(long)]
        agg: Option<String>,
        /// Required provider version; omit to accept any snapshot.
        #[arg(long)]
        expect_version: Option<i32>,
    },
}

fn make_provider(name: &str, resolution: u64) -> Result<Box<dyn StateProvider>> {
    match name {
        "kernel" => Ok(Box::new(KernelStateProvider::new())),
        "counters" => Ok(Box::new(CounterStateProvider::new(resolution))),
        other => bail!("unknown provider {other:?} (expected kernel or counters)"),
    }
}

fn build(
    events: PathBuf,
    out: PathBuf,
    provider_name: String,
    resolution: u64,
    queue_capacity: usize,
) -> Result<()> {
    let file = File::open(&events).with_context(|| format!("failed to open {events:?}"))?;
    let mut lines = BufReader::new(file).lines();

    // The trace start time is the first event's timestamp, so the first
    // line has to be read before the system exists.
    let first: Option<TraceEvent> = match lines.next() {
        Some(line) => Some(serde_json::from_str(&line?).context("malformed event on line 1")?),
        None => None,
    };
    let start_time = first.as_ref().map(|ev| ev.ts).unwrap_or(0);

    let provider = make_provider(&provider_name, resolution)?;
    let version = provider.version();
    let system = Arc::new(StateSystem::new(
        Box::new(InMemoryBackend::new()),
        start_time,
    ));
    let builder = HistoryBuilder::spawn_with_capacity(provider, Arc::clone(&system), queue_capacity);

    // Ctrl-C cancels: the writer drains what is already queued, then
    // disposes the partial history instead of closing it.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        let _ = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Release);
        });
    }

    let mut fed: u64 = 0;
    if let Some(ev) = first {
        builder.feed(ev)?;
        fed += 1;
    }
    for (lineno, line) in lines.enumerate() {
        if interrupted.load(Ordering::Acquire) {
            builder.cancel();
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let ev: TraceEvent = serde_json::from_str(&line)
            .with_context(|| format!("malformed event on line {}", lineno + 2))?;
        builder.feed(ev)?;
        fed += 1;
    }
    builder.finish()?;
    let stats = builder.join();

    eprintln!(
        "fed {fed} events: {} processed, {} skipped",
        stats.processed, stats.skipped
    );
    if !stats.closed {
        bail!("history build did not complete (canceled or fatal error); no snapshot written");
    }
    snapshot::save(&system, version, &out)
        .with_context(|| format!("failed to write snapshot to {out:?}"))?;
    eprintln!(
        "wrote {out:?}: {} attributes, {} intervals, time range [{}, {}]",
        system.attributes().num_attributes(),
        system.interval_count(),
        system.start_time(),
        system.current_end_time()
    );
    Ok(())
}

fn parse_range(range: &str) -> Result<(i64, i64)> {
    let Some((t1, t2)) = range.split_once(':') else {
        bail!("range must be T1:T2, got {range:?}");
    };
    Ok((t1.trim().parse()?, t2.trim().parse()?))
}

fn query(
    history: PathBuf,
    attr: Option<String>,
    at: Option<i64>,
    range: Option<String>,
    agg: Option<String>,
    expect_version: Option<i32>,
) -> Result<()> {
    let ss = snapshot::load(&history, expect_version.unwrap_or(IGNORE_PROVIDER_VERSION))
        .with_context(|| format!("failed to load {history:?}"))?;

    let quark = attr
        .as_deref()
        .map(|path| {
            let segments: Vec<&str> = path.split('/').collect();
            ss.attributes().quark_for(&segments)
        })
        .transpose()?;

    match (at, range) {
        (Some(ts), None) => match quark {
            Some(q) => {
                let iv = ss.query_single_state(ts, q)?;
                println!("[{}, {}] {}", iv.start, iv.end, iv.value);
            }
            None => {
                for iv in ss.query_full_state(ts)? {
                    println!(
                        "{}: [{}, {}] {}",
                        ss.attributes().full_path(iv.attribute),
                        iv.start,
                        iv.end,
                        iv.value
                    );
                }
            }
        },
        (None, Some(range)) => {
            let (t1, t2) = parse_range(&range)?;
            let Some(q) = quark else {
                bail!("--range requires --attr");
            };
            match agg.as_deref() {
                None => {
                    for iv in ss.query_history_range(q, t1, t2)? {
                        println!("[{}, {}] {}", iv.start, iv.end, iv.value);
                    }
                }
                Some("min") => println!("{}", mipmap::query_range_min(&ss, q, t1, t2)?),
                Some("max") => println!("{}", mipmap::query_range_max(&ss, q, t1, t2)?),
                Some("avg") => println!("{}", mipmap::query_range_average(&ss, q, t1, t2)?),
                Some(other) => bail!("unknown aggregation {other:?} (expected min, max or avg)"),
            }
        }
        (None, None) => bail!("one of --at or --range is required"),
        (Some(_), Some(_)) => bail!("--at and --range are mutually exclusive"),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = Command::parse();
    match opts.cmd {
        Cmd::Build {
            events,
            out,
            provider,
            resolution,
            queue_capacity,
        } => build(events, out, provider, resolution, queue_capacity),
        Cmd::Query {
            history,
            attr,
            at,
            range,
            agg,
            expect_version,
        } => query(history, attr, at, range, agg, expect_version),
    }
}
