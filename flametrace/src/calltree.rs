//! The reconstructed call tree.
//!
//! Every thread history grows one of these; terminated trees are merged
//! destructively into a single aggregation tree and serialized as
//! folded-stack flame-graph input. Nodes live in an [`indextree::Arena`],
//! so parent links are back-indices and subtree ownership transfers are
//! re-parenting operations rather than pointer surgery.

use indextree::{Arena, NodeId};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

use crate::action::{Symbol, Time, NOT_STARTED};
use ftf_format::FtfStreamWriter;

/// Shared Fuchsia Trace Format sink; serializes writes internally so trees
/// can be held by shard workers.
pub type FunctionSink = Arc<Mutex<FtfStreamWriter<Box<dyn Write + Send>>>>;

pub const FTF_CATEGORY: &str = "Function Call";

pub const GLOBAL_ROOT_NAME: &str = "/global_root/";
pub const SUSPENDED_NAME: &str = "/suspended/";

/// Fake root frame with an impossible non-zero address, installed above
/// every per-thread root so all histories merge at the same top level.
pub fn global_root_symbol() -> Symbol {
    Symbol::new(GLOBAL_ROOT_NAME, 0x10, 0)
}

/// Synthetic child pushed while tracing is paused.
pub fn suspended_symbol() -> Symbol {
    Symbol::new(SUSPENDED_NAME, 0x20, 0)
}

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Total duration over all samples, inferred ones included.
    pub sum_inferred: Time,
    /// Total duration over measured samples only.
    pub sum: Time,
    /// Completed activations.
    pub invoked: u64,
    /// Activations whose start or end had to be synthesized.
    pub inferred: u64,
}

impl Statistics {
    pub fn n(&self) -> u64 {
        self.invoked.saturating_sub(self.inferred)
    }

    pub fn average(&self) -> f64 {
        if self.n() == 0 {
            return 0.0;
        }
        self.sum as f64 / self.n() as f64
    }

    pub fn add_sample(&mut self, t: Time, inferred_sample: bool) {
        self.invoked += 1;
        self.sum_inferred += t;
        if inferred_sample {
            self.inferred += 1;
        } else {
            self.sum += t;
        }
    }

    pub fn merge(&mut self, other: &Statistics) {
        self.sum_inferred += other.sum_inferred;
        self.sum += other.sum;
        self.invoked += other.invoked;
        self.inferred += other.inferred;
    }

    pub fn stat_string(&self) -> String {
        let mut s = self.invoked.to_string();
        if self.inferred > 0 {
            s.push_str(&format!("({})", self.inferred));
        }
        if self.n() > 1 {
            s.push_str(&format!(",avg:{:.0}", self.average()));
        }
        s
    }
}

/// One function frame in the call tree.
#[derive(Debug, Clone)]
pub struct Func {
    pub sym: Symbol,
    /// Address of the call instruction that entered the active child; used
    /// to match return targets.
    pub call_address: u64,
    pub tid: u64,
    pub first_start: Time,
    /// Start of the current activation; [`NOT_STARTED`] when inactive.
    pub start: Time,
    /// Last observed return time.
    pub end: Time,
    pub start_is_inferred: bool,
    pub end_is_inferred: bool,
    pub stats: Statistics,
}

impl Func {
    fn new(sym: Symbol, ts: Time, tid: u64) -> Self {
        // rebase so base == address; frames represent whole functions
        let base = sym.base();
        let sym = Symbol::new(sym.name, base, 0);
        Self {
            sym,
            call_address: 0,
            tid,
            first_start: ts,
            start: ts,
            end: 0,
            start_is_inferred: false,
            end_is_inferred: false,
            stats: Statistics::default(),
        }
    }

    pub fn active(&self) -> bool {
        self.start != NOT_STARTED
    }
}

/// Ancestor-lookup predicate used by the history's gap repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerMatch {
    Name,
    Base,
    /// `call_address` falls in the 10-byte window at or below the return
    /// target, accommodating variable-length x86 CALL encodings.
    RetAddr,
}

fn func_matches(f: &Func, sym: &Symbol, pred: CallerMatch) -> bool {
    match pred {
        CallerMatch::Name => f.sym.name == sym.name,
        CallerMatch::Base => f.sym.base() == sym.base(),
        CallerMatch::RetAddr => {
            f.call_address != 0
                && f.call_address <= sym.address
                && f.call_address + 10 > sym.address
        }
    }
}

pub struct CallTree {
    arena: Arena<Func>,
    root: NodeId,
    sink: Option<FunctionSink>,
}

impl CallTree {
    pub fn new(sym: &Symbol, ts: Time, tid: u64, sink: Option<FunctionSink>) -> Self {
        let mut arena = Arena::new();
        let root = arena.new_node(Func::new(sym.clone(), ts, tid));
        Self { arena, root, sink }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn func(&self, id: NodeId) -> &Func {
        self.arena[id].get()
    }

    pub fn func_mut(&mut self, id: NodeId) -> &mut Func {
        self.arena[id].get_mut()
    }

    pub fn caller(&self, id: NodeId) -> Option<NodeId> {
        self.arena[id].parent()
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.children(&self.arena)
    }

    pub fn matches(&self, id: NodeId, sym: &Symbol, pred: CallerMatch) -> bool {
        func_matches(self.func(id), sym, pred)
    }

    /// Walks the ancestor chain starting at `from` (inclusive) for a frame
    /// matching `sym` under `pred`.
    pub fn find_caller(&self, from: NodeId, sym: &Symbol, pred: CallerMatch) -> Option<NodeId> {
        from.ancestors(&self.arena)
            .find(|&id| func_matches(self.func(id), sym, pred))
    }

    /// First child matching by base address, else first matching by name.
    pub fn find_callee(&self, at: NodeId, sym: &Symbol) -> Option<NodeId> {
        at.children(&self.arena)
            .find(|&c| self.func(c).sym.base() == sym.base())
            .or_else(|| {
                at.children(&self.arena)
                    .find(|&c| func_matches(self.func(c), sym, CallerMatch::Name))
            })
    }

    /// Enters `to` as the active child of `at`. An existing child is
    /// re-activated, otherwise a fresh frame is appended.
    pub fn call(&mut self, at: NodeId, from: &Symbol, to: &Symbol, ts: Time) -> NodeId {
        self.func_mut(at).call_address = from.address;
        let child = match self.find_callee(at, to) {
            Some(existing) => {
                let f = self.func_mut(existing);
                f.start = ts;
                f.end = 0;
                f.start_is_inferred = false;
                existing
            }
            None => {
                let tid = self.func(at).tid;
                let node = self.arena.new_node(Func::new(to.clone(), ts, tid));
                at.append(node, &mut self.arena);
                node
            }
        };

        if let Some(sink) = &self.sink {
            let f = self.func(child);
            if let Err(e) =
                sink.lock()
                    .write_duration_begin(f.tid, f.tid, FTF_CATEGORY, &f.sym.name, ts)
            {
                warn!(error = %e, "failed to write ftf begin event");
            }
        }
        child
    }

    /// Completes the activation at `id`, recording one timing sample, and
    /// returns the caller.
    pub fn ret(&mut self, id: NodeId, ts: Time) -> Option<NodeId> {
        let caller = self.caller(id);
        let f = self.func_mut(id);
        let started = f.start;
        if started > ts {
            warn!(
                function = %f.sym.name,
                start = started,
                ret = ts,
                "function returns before it starts"
            );
            f.stats.add_sample(0, true);
        } else {
            let inferred = f.start_is_inferred || f.end_is_inferred;
            f.stats.add_sample(ts - started, inferred);
        }
        f.end = ts;
        f.start = NOT_STARTED;
        let begin_inferred = f.start_is_inferred;
        if let Some(c) = caller {
            self.func_mut(c).call_address = 0;
        }

        if let Some(sink) = &self.sink {
            let f = self.func(id);
            let mut sink = sink.lock();
            let result = if begin_inferred {
                sink.write_duration_complete(f.tid, f.tid, FTF_CATEGORY, &f.sym.name, started, ts)
            } else {
                sink.write_duration_end(f.tid, f.tid, FTF_CATEGORY, &f.sym.name, ts)
            };
            if let Err(e) = result {
                warn!(error = %e, "failed to write ftf end event");
            }
        }
        caller
    }

    /// Approximate return time of a frame that never returned.
    pub fn last_time(&self, id: NodeId) -> Time {
        let mut t = self.func(id).start;
        for c in id.children(&self.arena) {
            t = t.max(self.func(c).end);
        }
        t
    }

    /// Duration spent in this frame itself, excluding its children.
    pub fn self_time(&self, id: NodeId) -> Time {
        let f = self.func(id);
        let children: Time = id
            .children(&self.arena)
            .map(|c| self.func(c).stats.sum_inferred)
            .sum();
        if f.stats.sum_inferred < children {
            warn!(
                function = %f.sym.name,
                total = f.stats.sum_inferred,
                children,
                "total time less than children time"
            );
            return 0;
        }
        f.stats.sum_inferred - children
    }

    /// Installs a synthesized frame above the current root. The call time
    /// of the new root is unavailable; the old root's first start minus one
    /// nanosecond keeps the two activations distinct downstream.
    pub fn make_new_root(&mut self, sym: &Symbol) {
        let old = self.func(self.root);
        let (first_start, tid) = (old.first_start, old.tid);
        let mut f = Func::new(sym.clone(), first_start.saturating_sub(1), tid);
        f.start_is_inferred = true;
        let new_root = self.arena.new_node(f);
        new_root.append(self.root, &mut self.arena);
        self.root = new_root;
    }

    /// Folds `other` into this tree: statistics of matching frames are
    /// summed, unmatched subtrees are adopted wholesale. `other` is
    /// consumed.
    pub fn destructive_merge(&mut self, other: CallTree) {
        let CallTree { arena, root, .. } = other;
        self.merge_node(self.root, &arena, root);
    }

    fn merge_node(&mut self, into: NodeId, other: &Arena<Func>, from: NodeId) {
        let stats = other[from].get().stats.clone();
        self.func_mut(into).stats.merge(&stats);
        let children: Vec<NodeId> = from.children(other).collect();
        for child in children {
            // merged siblings stay distinct by base address; name aliasing
            // across binaries must not collapse different functions
            let base = other[child].get().sym.base();
            let existing = into
                .children(&self.arena)
                .find(|&c| self.func(c).sym.base() == base);
            match existing {
                Some(existing) => self.merge_node(existing, other, child),
                None => self.adopt_subtree(into, other, child),
            }
        }
    }

    fn adopt_subtree(&mut self, under: NodeId, other: &Arena<Func>, from: NodeId) {
        let node = self.arena.new_node(other[from].get().clone());
        under.append(node, &mut self.arena);
        for child in from.children(other).collect::<Vec<_>>() {
            self.adopt_subtree(node, other, child);
        }
    }

    /// Reduces terminated trees into one aggregation tree.
    pub fn merge_trees(trees: Vec<CallTree>) -> Option<CallTree> {
        let mut iter = trees.into_iter();
        let mut first = iter.next()?;
        for tree in iter {
            first.destructive_merge(tree);
        }
        Some(first)
    }

    /// Emits folded-stack lines, one per frame with non-zero time. The
    /// synthetic global root is the aggregation point, not a frame.
    pub fn flame_graph<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for child in self.root.children(&self.arena) {
            self.flame_graph_node(out, child, "")?;
        }
        Ok(())
    }

    fn flame_graph_node<W: Write>(
        &self,
        out: &mut W,
        id: NodeId,
        prefix: &str,
    ) -> std::io::Result<()> {
        let f = self.func(id);
        if f.stats.sum_inferred == 0 {
            return Ok(());
        }
        let display = format!("{}:{}", f.sym.name, f.stats.stat_string());
        writeln!(out, "{}{} {}", prefix, display, self.self_time(id))?;
        let child_prefix = format!("{prefix}{display};");
        for child in id.children(&self.arena) {
            self.flame_graph_node(out, child, &child_prefix)?;
        }
        Ok(())
    }

    /// Ancestor chain from `from` up to the root, one symbol per line.
    pub fn write_stack<W: Write>(&self, from: NodeId, out: &mut W) -> std::io::Result<()> {
        for id in from.ancestors(&self.arena) {
            writeln!(out, "{}", self.func(id).sym.name)?;
        }
        Ok(())
    }
}
