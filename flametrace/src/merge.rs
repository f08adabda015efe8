//! K-way timestamp merge over action sources.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use crate::action::Action;
use crate::reader::ActionSource;

struct HeadAction {
    action: Action,
    source: Box<dyn ActionSource>,
}

impl PartialEq for HeadAction {
    fn eq(&self, other: &Self) -> bool {
        self.action.ts == other.action.ts
    }
}

impl Eq for HeadAction {}

impl PartialOrd for HeadAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadAction {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we pop the smallest timestamp
        other.action.ts.cmp(&self.action.ts)
    }
}

/// Interleaves N sources in non-decreasing timestamp order. With a single
/// source the heap is bypassed entirely.
pub struct Merger {
    single: Option<Box<dyn ActionSource>>,
    heap: BinaryHeap<HeadAction>,
    block: VecDeque<Action>,
}

impl Merger {
    pub fn new(sources: Vec<Box<dyn ActionSource>>) -> Self {
        let mut single = None;
        let mut heap = BinaryHeap::new();
        if sources.len() == 1 {
            single = sources.into_iter().next();
        } else {
            // one read per source primes the heap
            for mut source in sources {
                let action = source.next_action();
                if !action.is_end() {
                    heap.push(HeadAction { action, source });
                }
            }
        }
        Self {
            single,
            heap,
            block: VecDeque::new(),
        }
    }

    pub fn next_action(&mut self) -> Action {
        if let Some(source) = &mut self.single {
            return source.next_action();
        }
        if let Some(HeadAction { action, mut source }) = self.heap.pop() {
            let next = source.next_action();
            if !next.is_end() {
                self.heap.push(HeadAction {
                    action: next,
                    source,
                });
            }
            return action;
        }
        Action::end()
    }

    /// Like [`next_action`](Self::next_action), but drains a run of
    /// consecutive same-thread actions from the winning source into an
    /// internal queue, so callers see them as a contiguous burst. Ordering
    /// within each source is preserved, and so is per-thread ordering
    /// overall.
    pub fn next_action_by_block(&mut self) -> Action {
        if let Some(source) = &mut self.single {
            return source.next_action();
        }
        if let Some(action) = self.block.pop_front() {
            return action;
        }
        if let Some(HeadAction { action, mut source }) = self.heap.pop() {
            let mut next = source.next_action();
            while !next.is_end() && next.tid == action.tid {
                self.block.push_back(next);
                next = source.next_action();
            }
            if !next.is_end() {
                self.heap.push(HeadAction {
                    action: next,
                    source,
                });
            }
            return action;
        }
        Action::end()
    }
}
