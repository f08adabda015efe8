use clap::Parser;
use eyre::{Context, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use flametrace::action::{pretty_time, Time};
use flametrace::calltree::FunctionSink;
use flametrace::config::Config;
use flametrace::merge::Merger;
use flametrace::parallel::ParallelReplay;
use flametrace::reader::{ActionSource, BasicReader, FileReader, ParallelReader, StreamReader};
use flametrace::replay::Replay;
use ftf_format::FtfStreamWriter;

#[derive(Parser)]
#[command(name = "flametrace")]
#[command(about = "replay branch traces into flame graphs")]
struct Args {
    #[arg(help = "trace files with no cpu ordering; reads stdin when absent")]
    traces: Vec<String>,

    #[arg(
        short,
        long,
        help = "toml config mapping cpus to ordered trace files; overrides positional traces"
    )]
    config: Option<String>,

    #[arg(
        short = 'j',
        long,
        default_value_t = 0,
        help = "parser worker threads, spread over input streams; 0 parses serially"
    )]
    parallel: usize,

    #[arg(
        short = 's',
        long,
        default_value_t = 10000,
        help = "actions per parsed segment"
    )]
    read_step: usize,

    #[arg(
        short = 'l',
        long,
        default_value_t = 0,
        help = "stop after this many actions; 0 means no limit"
    )]
    limit: u64,

    #[arg(
        long,
        default_value_t = 0,
        help = "shard replay across worker threads by tid; 0 replays serially"
    )]
    shards: usize,

    #[arg(
        short = 'P',
        long,
        help = "write fuchsia trace format output to this file for use with perfetto"
    )]
    ftf: Option<String>,

    #[arg(
        short = 'S',
        long,
        help = "print stack snapshots to files named <prefix><seq>, overwriting"
    )]
    stack_prefix: Option<String>,

    #[arg(
        long,
        default_value = "2ms",
        value_parser = humantime::parse_duration,
        help = "trace time to wait before the first stack snapshot"
    )]
    stack_warmup: Duration,

    #[arg(
        long,
        default_value = "1ms",
        value_parser = humantime::parse_duration,
        help = "trace time between stack snapshots"
    )]
    stack_interval: Duration,

    #[arg(long, default_value_t = 1, help = "number of stack snapshots to print")]
    stack_count: usize,

    #[arg(long, help = "print one stack snapshot to this file at the end of replay")]
    stack_at_end: Option<String>,

    #[arg(
        short = 'O',
        long,
        help = "stop once the requested snapshots are printed and skip the flame graph"
    )]
    stack_only: bool,
}

fn per_stream_workers(parallel: usize, streams: usize) -> usize {
    if parallel == 0 || streams == 0 {
        return 1;
    }
    let per_stream = (parallel / streams).max(1);
    if per_stream * streams > parallel {
        warn!(
            requested = parallel,
            spawning = per_stream * streams,
            "spawning at least one parser worker per stream"
        );
    }
    per_stream
}

fn build_sources(args: &Args) -> Result<Vec<Box<dyn ActionSource>>> {
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config path={path}"))?,
        None => Config::default(),
    };

    let mut sources: Vec<Box<dyn ActionSource>> = Vec::new();
    if !config.cpu.is_empty() {
        if !args.traces.is_empty() {
            warn!("config provides per-cpu traces, ignoring trace files on the command line");
        }
        let per_stream = per_stream_workers(args.parallel, config.cpu.len());
        for cpu in &config.cpu {
            if args.parallel > 0 {
                sources.push(Box::new(StreamReader::from_files(
                    &cpu.traces,
                    per_stream,
                    args.read_step,
                )?));
            } else {
                sources.push(Box::new(FileReader::open(&cpu.traces)?));
            }
        }
    } else if !args.traces.is_empty() {
        let per_stream = per_stream_workers(args.parallel, args.traces.len());
        for path in &args.traces {
            if args.parallel > 0 {
                // large standalone files chunk well; segments are measured
                // in bytes rather than actions
                sources.push(Box::new(ParallelReader::open(
                    path,
                    per_stream,
                    (args.read_step * 200) as u64,
                )?));
            } else {
                sources.push(Box::new(FileReader::open(&[path.as_str()])?));
            }
        }
    } else if args.parallel > 0 {
        sources.push(Box::new(StreamReader::from_stdin(args.read_step)?));
    } else {
        sources.push(Box::new(BasicReader::new(BufReader::new(std::io::stdin()))));
    }
    Ok(sources)
}

fn build_sink(args: &Args) -> Result<Option<FunctionSink>> {
    let Some(path) = &args.ftf else {
        return Ok(None);
    };
    if args.shards > 0 {
        warn!("ftf output is not supported with sharded replay, skipping");
        return Ok(None);
    }
    let file =
        File::create(path).with_context(|| format!("failed to create ftf output {path}"))?;
    let writer: Box<dyn Write + Send> = Box::new(BufWriter::new(file));
    let mut writer = FtfStreamWriter::new(writer);
    writer.write_magic()?;
    Ok(Some(Arc::new(Mutex::new(writer))))
}

struct StackPrinter {
    prefix: String,
    warmup_ns: u64,
    interval_ns: u64,
    count: usize,
    printed: usize,
    last_ts: Time,
}

impl StackPrinter {
    fn new(args: &Args) -> Option<Self> {
        args.stack_prefix.as_ref().map(|prefix| Self {
            prefix: prefix.clone(),
            warmup_ns: args.stack_warmup.as_nanos() as u64,
            interval_ns: args.stack_interval.as_nanos() as u64,
            count: args.stack_count,
            printed: 0,
            last_ts: 0,
        })
    }

    fn quota_reached(&self) -> bool {
        self.printed >= self.count
    }

    fn tick(&mut self, replay: &Replay, ts: Time) -> Result<()> {
        if self.quota_reached() {
            return Ok(());
        }
        if self.last_ts == 0 {
            self.last_ts = ts;
            return Ok(());
        }
        // block merge can hand us a burst slightly behind the last print
        let elapsed = ts.saturating_sub(self.last_ts);
        let due = if self.printed == 0 {
            elapsed > self.warmup_ns
        } else {
            elapsed > self.interval_ns
        };
        if !due {
            return Ok(());
        }
        let name = format!("{}{}", self.prefix, self.printed);
        let mut out = BufWriter::new(
            File::create(&name).with_context(|| format!("failed to create stack file {name}"))?,
        );
        replay.snapshot(&mut out, ts)?;
        out.flush()?;
        info!(file = %name, "printed stack snapshot");
        self.printed += 1;
        self.last_ts = ts;
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, finishing replay early");
        r.store(false, Ordering::SeqCst);
    })?;

    let sink = build_sink(&args)?;
    let sources = build_sources(&args)?;
    let mut merger = Merger::new(sources);

    // status thread pokes an atomic every 5 s, the replay loop reports
    let stop_status = Arc::new(AtomicBool::new(false));
    let status_due = Arc::new(AtomicBool::new(false));
    let status = {
        let stop = stop_status.clone();
        let due = status_due.clone();
        std::thread::Builder::new().name("status".into()).spawn(move || {
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_secs(5));
                due.store(true, Ordering::Release);
            }
        })?
    };

    let parallel_replay = match args.shards {
        0 => None,
        shards => Some(ParallelReplay::new(shards)?),
    };
    let mut replay = Replay::new(sink);
    let mut stacks = StackPrinter::new(&args);
    if stacks.is_some() && parallel_replay.is_some() {
        warn!("stack snapshots are not supported with sharded replay, skipping");
        stacks = None;
    }

    let mut counter: u64 = 0;
    let mut last_ts: Time = 0;
    while running.load(Ordering::SeqCst) {
        let action = merger.next_action_by_block();
        if action.is_end() {
            break;
        }
        last_ts = action.ts;

        match &parallel_replay {
            Some(parallel) => parallel.deliver_action(action.clone()),
            None => replay.replay(&action),
        }

        if let Some(stacks) = &mut stacks {
            stacks.tick(&replay, action.ts)?;
            if stacks.quota_reached() && args.stack_only {
                break;
            }
        }

        if status_due.swap(false, Ordering::AcqRel) {
            info!(counter, ts = %pretty_time(action.ts), "replay progress");
        }

        counter += 1;
        if args.limit != 0 && counter >= args.limit {
            break;
        }
    }
    info!(counter, ts = %pretty_time(last_ts), "replay finished");
    stop_status.store(true, Ordering::Release);

    if let Some(path) = &args.stack_at_end {
        if parallel_replay.is_some() {
            warn!("stack snapshots are not supported with sharded replay, skipping");
        } else {
            let mut out = BufWriter::new(
                File::create(path)
                    .with_context(|| format!("failed to create stack file {path}"))?,
            );
            replay.snapshot(&mut out, last_ts)?;
            out.flush()?;
        }
    }

    let root = match parallel_replay {
        Some(parallel) => parallel.merge_all()?,
        None => {
            replay.cleanup();
            replay.destructive_merge_all()
        }
    };

    if !(args.stack_only && stacks.is_some()) {
        if let Some(root) = root {
            let stdout = std::io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            root.flame_graph(&mut out)?;
            out.flush()?;
        }
    }

    let _ = status.join();
    info!("done");
    Ok(())
}
