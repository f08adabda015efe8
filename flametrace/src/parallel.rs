//! Sharded replay across worker threads.
//!
//! Threads are sharded by `tid`, so each worker's replay sees its threads'
//! actions in delivery order and histories never cross shards. Useful when
//! one core cannot keep up with the merged action stream.

use eyre::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::action::Action;
use crate::calltree::CallTree;
use crate::replay::Replay;

#[derive(Default)]
struct Shard {
    queue: Mutex<VecDeque<Action>>,
    ready: Condvar,
}

pub struct ParallelReplay {
    shards: Vec<Arc<Shard>>,
    handles: Vec<JoinHandle<Replay>>,
    stop: Arc<AtomicBool>,
}

impl ParallelReplay {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let shards: Vec<Arc<Shard>> = (0..workers).map(|_| Arc::new(Shard::default())).collect();
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for (i, shard) in shards.iter().enumerate() {
            let shard = shard.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("replay-{i}"))
                .spawn(move || replay_worker(shard, stop))?;
            handles.push(handle);
        }

        Ok(Self {
            shards,
            handles,
            stop,
        })
    }

    pub fn deliver_action(&self, action: Action) {
        let idx = (action.tid % self.shards.len() as u64) as usize;
        let shard = &self.shards[idx];
        shard.queue.lock().push_back(action);
        shard.ready.notify_one();
    }

    /// Blocks until every shard's queue has drained.
    pub fn wait_all(&self) {
        for shard in &self.shards {
            loop {
                if shard.queue.lock().is_empty() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Drains the shards, then finalizes each shard's archive on its own
    /// merge thread before folding the per-shard trees serially.
    pub fn merge_all(mut self) -> Result<Option<CallTree>> {
        self.wait_all();
        self.stop.store(true, Ordering::Release);
        for shard in &self.shards {
            shard.ready.notify_all();
        }

        let replays: Vec<Replay> = self
            .handles
            .drain(..)
            .map(|handle| handle.join().expect("replay worker panicked"))
            .collect();

        let mut merges = Vec::new();
        for (i, mut replay) in replays.into_iter().enumerate() {
            let handle = std::thread::Builder::new()
                .name(format!("merge-{i}"))
                .spawn(move || {
                    replay.cleanup();
                    replay.destructive_merge_all()
                })?;
            merges.push(handle);
        }

        let roots: Vec<CallTree> = merges
            .into_iter()
            .filter_map(|handle| handle.join().expect("merge worker panicked"))
            .collect();
        Ok(CallTree::merge_trees(roots))
    }
}

fn replay_worker(shard: Arc<Shard>, stop: Arc<AtomicBool>) -> Replay {
    // ftf output is not wired through shards; the sink stays serial
    let mut replay = Replay::new(None);
    loop {
        let action = {
            let mut queue = shard.queue.lock();
            while queue.is_empty() && !stop.load(Ordering::Acquire) {
                shard.ready.wait(&mut queue);
            }
            if stop.load(Ordering::Acquire) {
                return replay;
            }
            match queue.pop_front() {
                Some(action) => action,
                None => return replay,
            }
        };
        replay.replay(&action);
    }
}

impl Drop for ParallelReplay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for shard in &self.shards {
            shard.ready.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
