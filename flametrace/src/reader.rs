//! Action sources: serial and threaded readers over trace text.
//!
//! All readers share one contract: `next_action` yields actions in file
//! order and returns the `End` sentinel once the input is exhausted.
//! Unparseable lines are warned about and skipped; redundant jumps and
//! tid-0 records are filtered before anything downstream sees them.

use eyre::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

use crate::action::{Action, Inst};
use crate::parse::parse_line;

pub trait ActionSource {
    fn next_action(&mut self) -> Action;
}

/// Record filter applied by every reader: jumps within one function are
/// noise, and tid 0 is the idle task.
fn accept_action(action: &Action) -> bool {
    if (action.inst == Inst::Jmp || action.inst == Inst::Jcc)
        && (action.from.base() == action.to.base() || action.from.name == action.to.name)
    {
        return false;
    }
    action.tid != 0
}

/// Reads, parses, and filters lines until one action comes out.
fn next_action_from<R: BufRead>(input: &mut R) -> Action {
    let mut line = String::new();
    loop {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => return Action::end(),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to read trace line");
                return Action::end();
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(action) => {
                if accept_action(&action) {
                    return action;
                }
            }
            Err(e) => warn!(error = %e, line = line.trim(), "skipping unparseable trace line"),
        }
    }
}

/// Line-at-a-time reader over any buffered stream; the stdin path.
pub struct BasicReader<R: BufRead> {
    input: R,
}

impl<R: BufRead> BasicReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead> ActionSource for BasicReader<R> {
    fn next_action(&mut self) -> Action {
        next_action_from(&mut self.input)
    }
}

/// Reads an ordered list of files to EOF, in sequence.
pub struct FileReader {
    inputs: VecDeque<BufReader<File>>,
}

impl FileReader {
    pub fn open<P: AsRef<str>>(paths: &[P]) -> Result<Self> {
        let mut inputs = VecDeque::new();
        for path in paths {
            let file = File::open(path.as_ref())
                .with_context(|| format!("failed to open trace file {}", path.as_ref()))?;
            inputs.push_back(BufReader::new(file));
        }
        Ok(Self { inputs })
    }
}

impl ActionSource for FileReader {
    fn next_action(&mut self) -> Action {
        while let Some(input) = self.inputs.front_mut() {
            let action = next_action_from(input);
            if !action.is_end() {
                return action;
            }
            self.inputs.pop_front();
        }
        Action::end()
    }
}

type Segment = VecDeque<Action>;

#[derive(Default)]
struct StreamState {
    segments: Mutex<VecDeque<Segment>>,
    ready: Condvar,
    finished: AtomicBool,
}

/// Parses whole streams on worker threads, handing segments of up to
/// `step` actions to the consumer. Streams are drained in order, so the
/// output matches a sequential read of the file list.
pub struct StreamReader {
    streams: Vec<Arc<StreamState>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    current_segment: Segment,
    current_stream: usize,
}

impl StreamReader {
    pub fn from_files<P: AsRef<str>>(paths: &[P], workers: usize, step: usize) -> Result<Self> {
        let mut inputs: Vec<Box<dyn BufRead + Send>> = Vec::new();
        for path in paths {
            let file = File::open(path.as_ref())
                .with_context(|| format!("failed to open trace file {}", path.as_ref()))?;
            inputs.push(Box::new(BufReader::new(file)));
        }
        Self::spawn(inputs, workers, step)
    }

    pub fn from_stdin(step: usize) -> Result<Self> {
        Self::spawn(vec![Box::new(BufReader::new(std::io::stdin()))], 1, step)
    }

    fn spawn(
        inputs: Vec<Box<dyn BufRead + Send>>,
        workers: usize,
        step: usize,
    ) -> Result<Self> {
        let step = step.max(1);
        let streams: Vec<Arc<StreamState>> = (0..inputs.len())
            .map(|_| Arc::new(StreamState::default()))
            .collect();
        let stop = Arc::new(AtomicBool::new(false));

        // deal streams round-robin so every worker owns a disjoint subset
        let workers = workers.clamp(1, inputs.len().max(1));
        let mut assignments: Vec<Vec<(Arc<StreamState>, Box<dyn BufRead + Send>)>> =
            (0..workers).map(|_| Vec::new()).collect();
        for (i, input) in inputs.into_iter().enumerate() {
            assignments[i % workers].push((streams[i].clone(), input));
        }

        let mut handles = Vec::new();
        for (i, assigned) in assignments.into_iter().enumerate() {
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("reader-{i}"))
                .spawn(move || stream_worker(assigned, step, stop))?;
            handles.push(handle);
        }

        Ok(Self {
            streams,
            handles,
            stop,
            current_segment: Segment::new(),
            current_stream: 0,
        })
    }
}

fn stream_worker(
    assigned: Vec<(Arc<StreamState>, Box<dyn BufRead + Send>)>,
    step: usize,
    stop: Arc<AtomicBool>,
) {
    for (state, mut input) in assigned {
        let mut finished = false;
        while !finished && !stop.load(Ordering::Acquire) {
            let mut segment = Segment::new();
            while segment.len() < step && !stop.load(Ordering::Acquire) {
                let action = next_action_from(&mut input);
                if action.is_end() {
                    finished = true;
                    break;
                }
                segment.push_back(action);
            }
            if !segment.is_empty() {
                state.segments.lock().push_back(segment);
                state.ready.notify_one();
            }
        }
        state.finished.store(true, Ordering::Release);
        state.ready.notify_one();
    }
}

impl ActionSource for StreamReader {
    fn next_action(&mut self) -> Action {
        while self.current_segment.is_empty() && self.current_stream < self.streams.len() {
            let state = &self.streams[self.current_stream];
            let mut segments = state.segments.lock();
            while segments.is_empty() && !state.finished.load(Ordering::Acquire) {
                state.ready.wait(&mut segments);
            }
            match segments.pop_front() {
                Some(segment) => {
                    drop(segments);
                    self.current_segment = segment;
                }
                None => {
                    drop(segments);
                    self.current_stream += 1;
                }
            }
        }
        self.current_segment.pop_front().unwrap_or_default()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Clone, Copy)]
struct Chunk {
    pos: u64,
    end_pos: u64,
}

#[derive(Default)]
struct ChunkQueues {
    jobs: VecDeque<Chunk>,
    segments: VecDeque<Segment>,
}

#[derive(Default)]
struct ChunkWorkerState {
    queues: Mutex<ChunkQueues>,
    job_ready: Condvar,
    segment_ready: Condvar,
}

/// Parses one large seekable file in parallel. The file is split into
/// newline-aligned chunks dealt round-robin to workers; the consumer
/// reassembles segments in chunk order, so the output matches a serial
/// read.
pub struct ParallelReader {
    workers: Vec<Arc<ChunkWorkerState>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    current_segment: Segment,
    total_chunks: usize,
    next_chunk: usize,
}

impl ParallelReader {
    pub fn open(path: &str, workers: usize, seek_step: u64) -> Result<Self> {
        let workers = workers.max(1);
        let states: Vec<Arc<ChunkWorkerState>> = (0..workers)
            .map(|_| Arc::new(ChunkWorkerState::default()))
            .collect();
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for (i, state) in states.iter().enumerate() {
            let file = File::open(path)
                .with_context(|| format!("failed to open trace file {path}"))?;
            let state = state.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("reader-{i}"))
                .spawn(move || chunk_worker(state, file, stop))?;
            handles.push(handle);
        }

        // chunk the file, aligning every boundary to the next newline
        let file =
            File::open(path).with_context(|| format!("failed to open trace file {path}"))?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut pos = 0u64;
        let mut total_chunks = 0;
        while pos < len {
            let mut end = pos + seek_step.max(1);
            if end >= len {
                end = len;
            } else {
                reader.seek(SeekFrom::Start(end))?;
                let mut rest_of_line = Vec::new();
                end += reader.read_until(b'\n', &mut rest_of_line)? as u64;
                if end > len {
                    end = len;
                }
            }
            let state = &states[total_chunks % workers];
            state.queues.lock().jobs.push_back(Chunk { pos, end_pos: end });
            state.job_ready.notify_one();
            total_chunks += 1;
            pos = end;
        }

        Ok(Self {
            workers: states,
            handles,
            stop,
            current_segment: Segment::new(),
            total_chunks,
            next_chunk: 0,
        })
    }
}

fn chunk_worker(state: Arc<ChunkWorkerState>, file: File, stop: Arc<AtomicBool>) {
    let mut reader = BufReader::new(file);
    loop {
        let chunk = {
            let mut queues = state.queues.lock();
            while queues.jobs.is_empty() && !stop.load(Ordering::Acquire) {
                state.job_ready.wait(&mut queues);
            }
            match queues.jobs.pop_front() {
                Some(chunk) => chunk,
                None => return,
            }
        };

        // a segment is pushed for every job, empty or not, so the consumer
        // can count on chunk-ordered delivery
        let mut segment = Segment::new();
        if let Err(e) = reader.seek(SeekFrom::Start(chunk.pos)) {
            warn!(error = %e, pos = chunk.pos, "failed to seek trace chunk");
        } else {
            let mut consumed = chunk.pos;
            let mut line = String::new();
            while consumed < chunk.end_pos {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(n) => consumed += n as u64,
                    Err(e) => {
                        warn!(error = %e, "failed to read trace line");
                        break;
                    }
                }
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(action) => {
                        if accept_action(&action) {
                            segment.push_back(action);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, line = line.trim(), "skipping unparseable trace line")
                    }
                }
            }
        }

        state.queues.lock().segments.push_back(segment);
        state.segment_ready.notify_one();
    }
}

impl ActionSource for ParallelReader {
    fn next_action(&mut self) -> Action {
        while self.current_segment.is_empty() && self.next_chunk < self.total_chunks {
            let state = self.workers[self.next_chunk % self.workers.len()].clone();
            self.next_chunk += 1;
            let mut queues = state.queues.lock();
            while queues.segments.is_empty() {
                state.segment_ready.wait(&mut queues);
            }
            self.current_segment = queues.segments.pop_front().unwrap_or_default();
        }
        self.current_segment.pop_front().unwrap_or_default()
    }
}

impl Drop for ParallelReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for state in &self.workers {
            state.job_ready.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
