//! Replay coordinator: routes actions to per-thread histories.

use std::collections::BTreeMap;
use std::io::Write;

use crate::action::{pretty_time, Action, Time};
use crate::calltree::{CallTree, FunctionSink};
use crate::history::History;

/// Owns one [`History`] per live thread and an archive of terminated call
/// trees. A history that rejects an action is archived and restarted; at
/// end of input everything is archived and merge-reduced into one tree.
#[derive(Default)]
pub struct Replay {
    threads: BTreeMap<u64, History>,
    last_seen: BTreeMap<u64, Time>,
    archive: Vec<CallTree>,
    sink: Option<FunctionSink>,
}

impl Replay {
    pub fn new(sink: Option<FunctionSink>) -> Self {
        Self {
            sink,
            ..Self::default()
        }
    }

    fn stop_and_archive(&mut self, tid: u64) {
        if let Some(history) = self.threads.remove(&tid) {
            self.archive.push(history.terminate());
        }
    }

    pub fn replay(&mut self, action: &Action) {
        match self.threads.get_mut(&action.tid) {
            None => {
                // a thread first seen heading into an unknown symbol gives
                // us nothing to anchor a stack on
                if action.to.is_unknown() {
                    return;
                }
                self.threads
                    .insert(action.tid, History::from_action(action, self.sink.clone()));
            }
            Some(history) => {
                if !history.replay(action) {
                    // broken trace: archive this thread and start over,
                    // seeded by the action that broke it
                    self.stop_and_archive(action.tid);
                    self.threads
                        .insert(action.tid, History::from_action(action, self.sink.clone()));
                }
            }
        }
        self.last_seen.insert(action.tid, action.ts);
    }

    /// Terminates and archives every remaining history.
    pub fn cleanup(&mut self) {
        while let Some(tid) = self.threads.keys().next().copied() {
            self.stop_and_archive(tid);
        }
    }

    pub fn live_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn archived(&self) -> usize {
        self.archive.len()
    }

    /// Folds the archive into a single aggregation tree.
    pub fn destructive_merge_all(&mut self) -> Option<CallTree> {
        CallTree::merge_trees(std::mem::take(&mut self.archive))
    }

    /// Prints every live thread's stack with last-seen timing.
    pub fn snapshot<W: Write>(&self, out: &mut W, ts: Time) -> std::io::Result<()> {
        writeln!(out, "timestamp {}", pretty_time(ts))?;
        for (tid, history) in &self.threads {
            let seen = self.last_seen.get(tid).copied().unwrap_or(0);
            writeln!(
                out,
                "{} last seen {} Δ {}",
                tid,
                pretty_time(seen),
                pretty_time(ts.saturating_sub(seen))
            )?;
            history.snapshot(out)?;
            writeln!(out)?;
        }
        Ok(())
    }
}
