//! Per-thread call history.
//!
//! Consumes a thread's actions in timestamp order and keeps `current`
//! pointed at the function believed to be executing. Hardware branch
//! traces pause, resume, and lose records; the history tolerates gaps by
//! snapping to the nearest plausible ancestor frame and refuses to invent
//! frames when nothing matches. `replay` returning `false` means the
//! action cannot be reconciled with the stack at all; the coordinator
//! treats that as a broken trace.

use indextree::NodeId;
use tracing::debug;

use crate::action::{Action, Inst, Symbol, Time};
use crate::calltree::{
    global_root_symbol, suspended_symbol, CallTree, CallerMatch, FunctionSink,
};

const PERF_EVENT_SWITCH_SYMBOL: &str = "perf_event_switch_output";

/// What kind of trace discontinuity we are currently riding out. The
/// recovery heuristics come from limited testing against 5.10 kernel
/// traces; each variant is armed by one pattern and disarmed by its
/// expected continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Normal,
    /// Trace stopped at a syscall; the next trace start is its completion.
    InSyscall,
    /// Trace stopped at `address`; a trace start back at it pops the
    /// synthetic suspension frame.
    Paused { address: u64, time: Time },
    /// A syscall entered; the next call crosses the entry gate where the
    /// symbol names are known not to line up.
    AfterSyscall,
    /// Stopped inside kprobe_flush_task / prepare_task_switch; the kernel
    /// is about to switch tasks and we lost a stack level or two.
    TaskSwitchFlushTask,
    /// Stopped inside enter_lazy_tlb; the trace breaks repeatedly until
    /// the scheduler settles (stage 1 waits for schedule, stage 2 for its
    /// return).
    EnterLazyTlb(u8),
    /// Perf flushed its own buffers; expect the matching return next.
    PerfEventSwitchOutput,
}

pub struct History {
    tree: CallTree,
    current: NodeId,
    tid: u64,
    cpu: u64,
    mode: Recovery,
}

impl History {
    pub fn new(sym: &Symbol, ts: Time, cpu: u64, tid: u64, sink: Option<FunctionSink>) -> Self {
        let tree = CallTree::new(sym, ts, tid, sink);
        let current = tree.root();
        debug!(tid, cpu, start = %sym.name, "thread history started");
        Self {
            tree,
            current,
            tid,
            cpu,
            mode: Recovery::Normal,
        }
    }

    pub fn from_action(action: &Action, sink: Option<FunctionSink>) -> Self {
        Self::new(&action.to, action.ts, action.cpu, action.tid, sink)
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn cpu(&self) -> u64 {
        self.cpu
    }

    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    pub fn current(&self) -> NodeId {
        self.current
    }

    /// Unwinds frames below `target`, then enters `to` from it.
    fn unwind_to(&mut self, target: NodeId, ts: Time) {
        while self.current != target {
            match self.tree.ret(self.current, ts) {
                Some(caller) => self.current = caller,
                None => break,
            }
        }
    }

    /// Enters `to` from the nearest ancestor matching `from`. The elided
    /// returns on the way down share the call's timestamp and are not
    /// inferred: the trace merely compressed them away.
    fn call(&mut self, from: &Symbol, to: &Symbol, ts: Time) -> bool {
        let matched = self
            .tree
            .find_caller(self.current, from, CallerMatch::Base)
            .or_else(|| self.tree.find_caller(self.current, from, CallerMatch::Name));
        let Some(matched) = matched else {
            return false;
        };
        self.unwind_to(matched, ts);
        self.current = self.tree.call(self.current, from, to, ts);
        true
    }

    /// Returns to the frame whose call site matches the return target.
    /// `from` is only descriptive; the target address is what anchors the
    /// search.
    fn ret(&mut self, _from: &Symbol, to: &Symbol, ts: Time) -> bool {
        // at the bottom of the stack, infer the caller from the target
        let Some(caller) = self.tree.caller(self.current) else {
            self.tree.ret(self.current, ts);
            self.tree.make_new_root(to);
            self.current = self.tree.root();
            return true;
        };

        // current itself is deprioritized: returning into the frame that
        // issued the call means an untracked callee just finished
        let mut matched = self.tree.find_caller(caller, to, CallerMatch::RetAddr);
        if matched.is_none() && self.tree.matches(self.current, to, CallerMatch::RetAddr) {
            matched = Some(self.current);
        }
        if matched.is_none() {
            matched = self.tree.find_caller(caller, to, CallerMatch::Name);
        }
        if matched.is_none() && self.tree.matches(self.current, to, CallerMatch::Name) {
            matched = Some(self.current);
        }
        let Some(matched) = matched else {
            return false;
        };
        self.unwind_to(matched, ts);
        true
    }

    pub fn replay(&mut self, action: &Action) -> bool {
        // tracing was stopped and never restarted
        if matches!(self.mode, Recovery::InSyscall | Recovery::Paused { .. })
            && action.inst != Inst::TrStart
        {
            return false;
        }

        match self.mode {
            Recovery::TaskSwitchFlushTask => return self.replay_task_switch(action),
            Recovery::EnterLazyTlb(stage) => return self.replay_lazy_tlb(stage, action),
            Recovery::PerfEventSwitchOutput => {
                self.mode = Recovery::Normal;
                if action.inst != Inst::Ret || action.from.name != PERF_EVENT_SWITCH_SYMBOL {
                    return false;
                }
                // from won't match current; ret's ancestor search absorbs it
                return self.ret(&action.from, &action.to, action.ts);
            }
            Recovery::AfterSyscall => {
                // trace around a syscall looks like
                //   syscall __libc_recv+0x79 => __entry_text_start+0x0
                //   call    entry_SYSCALL_64_after_hwframe+0x3f => do_syscall_64+0x0
                // insert a call to bridge the known symbol mismatch
                if action.inst != Inst::Call {
                    return false;
                }
                if self.tree.func(self.current).sym != action.from {
                    let bridge = self.tree.func(self.current).sym.clone();
                    if !self.call(&bridge, &action.from, action.ts) {
                        return false;
                    }
                }
                self.mode = Recovery::Normal;
            }
            _ => {}
        }

        match action.inst {
            Inst::TrEndSyscall => {
                self.mode = Recovery::InSyscall;
                self.call(&action.from, &action.to, action.ts)
            }
            Inst::Syscall => {
                self.mode = Recovery::AfterSyscall;
                self.call(&action.from, &action.to, action.ts)
            }
            // a jump whose site and target bases differ is a tail call or
            // PLT transfer worth a frame; redundant jumps never get here
            Inst::Jmp | Inst::Jcc | Inst::Int | Inst::Call => {
                self.call(&action.from, &action.to, action.ts)
            }
            Inst::Ret | Inst::Iret | Inst::Sysret => self.ret(&action.from, &action.to, action.ts),
            Inst::TrEnd => {
                self.mode = Recovery::Paused {
                    address: action.from.address,
                    time: action.ts,
                };
                self.call(&action.from, &suspended_symbol(), action.ts)
            }
            Inst::TrStart => self.replay_tr_start(action),
            Inst::End => false,
        }
    }

    fn replay_tr_start(&mut self, action: &Action) -> bool {
        match self.mode {
            Recovery::InSyscall => {
                // resuming from a syscall
                self.mode = Recovery::Normal;
                return self.ret(&action.from, &action.to, action.ts);
            }
            Recovery::Paused { address, .. } if address == action.to.address => {
                // resumed exactly where the trace stopped
                self.mode = Recovery::Normal;
                return self.ret(&suspended_symbol(), &action.to, action.ts);
            }
            _ => {}
        }

        let current_name = self.tree.func(self.current).sym.name.as_str();
        if current_name == "kprobe_flush_task" || current_name == "prepare_task_switch" {
            self.mode = Recovery::TaskSwitchFlushTask;
            return true;
        }
        if current_name == "enter_lazy_tlb" {
            self.mode = Recovery::EnterLazyTlb(1);
            return true;
        }
        if action.from.is_unknown() && action.to.name == PERF_EVENT_SWITCH_SYMBOL {
            self.mode = Recovery::PerfEventSwitchOutput;
            return true;
        }
        if action.from.base() == 0 && action.to.is_unknown() {
            // vDSO entry decoded as unknown:
            //   call     clock_gettime@GLIBC_2.2.5 => __vdso_clock_gettime
            //   tr strt  0 [unknown] => 7fff56f8ca49 [unknown]
            // fake a call from the current frame into the unknown
            let from = self.tree.func(self.current).sym.clone();
            return self.call(&from, &action.to, action.ts);
        }
        false
    }

    /// Kernel task-switch callback hooks run with tracing briefly disabled
    /// and cost a stack level or two. Perf's own bookkeeping is not worth
    /// reconstructing; consume everything until the switch returns.
    fn replay_task_switch(&mut self, action: &Action) -> bool {
        if action.inst != Inst::Ret {
            return true;
        }
        if action.to.name == "finish_task_switch" {
            // stack: * > __schedule > finish_task_switch > kprobe_flush_task
            self.mode = Recovery::Normal;
            return self.ret(&action.from, &action.to, action.ts);
        } else if action.to.name == "prepare_task_switch" {
            // stack: * > __schedule > prepare_task_switch
            self.mode = Recovery::Normal;
        }
        true
    }

    /// After enter_lazy_tlb the trace breaks repeatedly until the kernel
    /// reschedules; wait for
    ///   tr strt  [unknown] -> schedule
    ///   return   schedule  -> <some symbol in the stack>
    /// before trusting actions again.
    fn replay_lazy_tlb(&mut self, stage: u8, action: &Action) -> bool {
        if stage == 1 {
            if action.inst != Inst::TrStart {
                return true;
            }
            if !action.from.is_unknown() {
                // data loss
                self.mode = Recovery::Normal;
                return false;
            }
            if action.to.name != "schedule" {
                return true;
            }
            self.mode = Recovery::EnterLazyTlb(2);
            return true;
        }

        self.mode = Recovery::Normal;
        match action.inst {
            Inst::Call => {
                self.mode = Recovery::EnterLazyTlb(1);
                true
            }
            Inst::Ret => {
                if action.from.name != "schedule" {
                    return false;
                }
                self.ret(&action.from, &action.to, action.ts)
            }
            _ => false,
        }
    }

    /// Ends every open activation, accumulating latencies against a low
    /// bound of the return time, and installs the synthetic global root so
    /// the tree merges with every other history.
    pub fn terminate(mut self) -> CallTree {
        let ts = match self.mode {
            Recovery::Paused { time, .. } => time,
            _ => self.tree.last_time(self.current),
        };
        while self.current != self.tree.root() {
            self.tree.func_mut(self.current).end_is_inferred = true;
            match self.tree.ret(self.current, ts) {
                Some(caller) => self.current = caller,
                None => break,
            }
        }
        let root_sym = self.tree.func(self.tree.root()).sym.clone();
        self.ret(&root_sym, &global_root_symbol(), ts);
        let root = self.tree.root();
        self.tree.ret(root, ts);
        self.tree
    }

    /// Current ancestor chain, one symbol per line.
    pub fn snapshot<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        self.tree.write_stack(self.current, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calltree::{GLOBAL_ROOT_NAME, SUSPENDED_NAME};

    fn sym(name: &str, address: u64, offset: u64) -> Symbol {
        Symbol::new(name, address, offset)
    }

    fn act(inst: Inst, from: Symbol, to: Symbol, ts: Time) -> Action {
        Action {
            inst,
            from,
            to,
            ts,
            tid: 42,
            cpu: 0,
        }
    }

    fn history(root: &str, address: u64, ts: Time) -> History {
        History::new(&sym(root, address, 0), ts, 0, 42, None)
    }

    fn child_named(tree: &CallTree, at: indextree::NodeId, name: &str) -> indextree::NodeId {
        tree.children(at)
            .find(|&c| tree.func(c).sym.name == name)
            .unwrap_or_else(|| panic!("no child named {name}"))
    }

    #[test]
    fn test_simple_call_return_pair() {
        // seeded the way the coordinator seeds: first action's target
        let seed = act(Inst::Call, sym("main", 0x1000, 0), sym("foo", 0x2000, 0), 1000);
        let mut h = History::from_action(&seed, None);
        assert!(h.replay(&act(
            Inst::Ret,
            sym("foo", 0x2042, 0x42),
            sym("main", 0x1005, 0x5),
            2000
        )));

        let tree = h.terminate();
        let root = tree.root();
        assert_eq!(tree.func(root).sym.name, GLOBAL_ROOT_NAME);
        let main = child_named(&tree, root, "main");
        assert_eq!(tree.func(main).stats.invoked, 1);
        let foo = child_named(&tree, main, "foo");
        assert_eq!(tree.func(foo).stats.invoked, 1);
        assert_eq!(tree.func(foo).stats.sum, 1000);
        assert_eq!(tree.func(foo).stats.inferred, 0);
    }

    #[test]
    fn test_missed_return_gap_unwinds_whole_chain() {
        let mut h = history("main", 0x1000, 100);
        assert!(h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("a", 0x2000, 0), 100)));
        assert!(h.replay(&act(Inst::Call, sym("a", 0x2008, 8), sym("b", 0x3000, 0), 110)));
        // the returns of b and a were lost; one RET lands back in main
        assert!(h.replay(&act(
            Inst::Ret,
            sym("b", 0x3004, 4),
            sym("main", 0x1009, 9),
            200
        )));

        let tree = h.tree();
        assert_eq!(tree.func(h.current()).sym.name, "main");
        let a = child_named(tree, h.current(), "a");
        let b = child_named(tree, a, "b");
        assert_eq!(tree.func(a).stats.invoked, 1);
        assert_eq!(tree.func(a).end, 200);
        assert_eq!(tree.func(b).stats.invoked, 1);
        assert_eq!(tree.func(b).end, 200);
    }

    #[test]
    fn test_trace_pause_and_resume() {
        let mut h = history("main", 0x1000, 50);
        assert!(h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("foo", 0x2000, 0), 100)));
        assert!(h.replay(&act(
            Inst::TrEnd,
            sym("foo", 0x2042, 0x42),
            Symbol::default(),
            200
        )));
        let suspended = h.current();
        assert_eq!(h.tree().func(suspended).sym.name, SUSPENDED_NAME);

        // nothing but a trace start is acceptable while paused
        assert!(!h.replay(&act(Inst::Call, sym("x", 0x8000, 0), sym("y", 0x9000, 0), 300)));

        let mut h = history("main", 0x1000, 50);
        h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("foo", 0x2000, 0), 100));
        h.replay(&act(Inst::TrEnd, sym("foo", 0x2042, 0x42), Symbol::default(), 200));
        assert!(h.replay(&act(
            Inst::TrStart,
            Symbol::default(),
            sym("foo", 0x2042, 0x42),
            500
        )));
        assert_eq!(h.tree().func(h.current()).sym.name, "foo");
        let suspended = child_named(h.tree(), h.current(), SUSPENDED_NAME);
        assert_eq!(h.tree().func(suspended).stats.invoked, 1);
        assert_eq!(h.tree().func(suspended).stats.sum_inferred, 300);

        assert!(h.replay(&act(
            Inst::Ret,
            sym("foo", 0x2050, 0x50),
            sym("main", 0x1009, 9),
            600
        )));
        let foo = child_named(h.tree(), h.current(), "foo");
        let stats = &h.tree().func(foo).stats;
        assert_eq!(stats.invoked, 1);
        assert_eq!(stats.sum, 500);
        assert_eq!(stats.inferred, 0);
    }

    #[test]
    fn test_orphan_return_promotes_new_root() {
        let seed = act(Inst::Call, sym("x", 0x1000, 0), sym("y", 0x2000, 0), 100);
        let mut h = History::from_action(&seed, None);
        assert!(h.replay(&act(
            Inst::Ret,
            sym("y", 0x2004, 4),
            sym("z", 0x5005, 5),
            200
        )));

        let tree = h.tree();
        assert_eq!(h.current(), tree.root());
        let root = tree.func(tree.root());
        assert_eq!(root.sym.name, "z");
        assert_eq!(root.sym.address, 0x5000);
        assert_eq!(root.first_start, 99);
        assert!(root.start_is_inferred);
        let y = child_named(tree, tree.root(), "y");
        assert_eq!(tree.func(y).stats.invoked, 1);
        assert_eq!(tree.func(y).stats.sum, 100);
    }

    #[test]
    fn test_noop_call_ret_pair_is_idempotent() {
        let mut h = history("main", 0x1000, 100);
        for i in 1..=3u64 {
            assert!(h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("foo", 0x2000, 0), 500)));
            assert!(h.replay(&act(
                Inst::Ret,
                sym("foo", 0x2004, 4),
                sym("main", 0x1009, 9),
                500
            )));
            assert_eq!(h.tree().func(h.current()).sym.name, "main");
            let foo = child_named(h.tree(), h.current(), "foo");
            assert_eq!(h.tree().func(foo).stats.invoked, i);
            assert_eq!(h.tree().func(foo).stats.sum, 0);
        }
    }

    #[test]
    fn test_unmatched_call_is_rejected() {
        let mut h = history("main", 0x1000, 100);
        assert!(!h.replay(&act(
            Inst::Call,
            sym("stranger", 0x9000, 0),
            sym("foo", 0x2000, 0),
            200
        )));
    }

    #[test]
    fn test_unmatched_return_is_rejected() {
        let mut h = history("main", 0x1000, 100);
        assert!(h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("a", 0x2000, 0), 110)));
        assert!(!h.replay(&act(
            Inst::Ret,
            sym("a", 0x2004, 4),
            sym("stranger", 0x9009, 9),
            300
        )));
    }

    #[test]
    fn test_return_into_current_pops_nothing() {
        let mut h = history("main", 0x1000, 100);
        h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("a", 0x2000, 0), 110));
        h.replay(&act(Inst::Call, sym("a", 0x2008, 8), sym("b", 0x3000, 0), 120));
        let b = h.current();
        // an untracked callee of b returns into b's call site
        assert!(h.replay(&act(
            Inst::Ret,
            sym("helper", 0x7000, 0),
            sym("b", 0x300c, 0xc),
            130
        )));
        assert_eq!(h.current(), b);
        assert_eq!(h.tree().func(b).stats.invoked, 0);
    }

    #[test]
    fn test_syscall_bridge_inserts_missing_frame() {
        let mut h = history("libc_recv", 0x7000, 100);
        assert!(h.replay(&act(
            Inst::Syscall,
            sym("libc_recv", 0x7079, 0x79),
            sym("entry_text_start", 0xffff_ffff_8100_0000, 0),
            200
        )));
        assert!(h.replay(&act(
            Inst::Call,
            sym("entry_hwframe", 0xffff_ffff_8200_003f, 0x3f),
            sym("do_syscall_64", 0xffff_ffff_8300_0000, 0),
            210
        )));

        let tree = h.tree();
        assert_eq!(tree.func(h.current()).sym.name, "do_syscall_64");
        let names: Vec<String> = {
            let mut out = Vec::new();
            tree.write_stack(h.current(), &mut out).unwrap();
            String::from_utf8(out)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        };
        assert_eq!(
            names,
            ["do_syscall_64", "entry_hwframe", "entry_text_start", "libc_recv"]
        );
    }

    #[test]
    fn test_syscall_trace_stop_and_resume() {
        let mut h = history("libc_recv", 0x7000, 100);
        assert!(h.replay(&act(
            Inst::TrEndSyscall,
            sym("libc_recv", 0x7079, 0x79),
            sym("entry_text_start", 0xffff_ffff_8100_0000, 0),
            200
        )));
        // stopped inside the kernel: everything but a restart is broken
        assert!(!h.replay(&act(Inst::Call, sym("a", 0x2000, 0), sym("b", 0x3000, 0), 250)));

        let mut h = history("libc_recv", 0x7000, 100);
        h.replay(&act(
            Inst::TrEndSyscall,
            sym("libc_recv", 0x7079, 0x79),
            sym("entry_text_start", 0xffff_ffff_8100_0000, 0),
            200,
        ));
        assert!(h.replay(&act(
            Inst::TrStart,
            Symbol::default(),
            sym("libc_recv", 0x7079, 0x79),
            900
        )));
        assert_eq!(h.tree().func(h.current()).sym.name, "libc_recv");
    }

    #[test]
    fn test_task_switch_consumes_until_finish() {
        let mut h = history("kprobe_flush_task", 0x4000, 100);
        assert!(h.replay(&act(
            Inst::TrStart,
            Symbol::default(),
            sym("x", 0x9000, 0),
            200
        )));
        // arbitrary perf bookkeeping is silently consumed
        assert!(h.replay(&act(Inst::Call, sym("p", 0x5000, 0), sym("q", 0x6000, 0), 210)));
        assert!(h.replay(&act(Inst::Jmp, sym("q", 0x6000, 0), sym("r", 0x6800, 0), 215)));
        // the switch completes
        assert!(h.replay(&act(
            Inst::Ret,
            sym("__schedule", 0x8000, 0),
            sym("finish_task_switch", 0x8805, 5),
            300
        )));
        assert_eq!(h.tree().func(h.current()).sym.name, "finish_task_switch");
        // and the mode is disarmed: a normal unmatched call is rejected again
        assert!(!h.replay(&act(
            Inst::Call,
            sym("stranger", 0x9900, 0),
            sym("s", 0x9a00, 0),
            310
        )));
    }

    #[test]
    fn test_task_switch_prepare_disarms_silently() {
        let mut h = history("prepare_task_switch", 0x4000, 100);
        assert!(h.replay(&act(
            Inst::TrStart,
            Symbol::default(),
            sym("x", 0x9000, 0),
            200
        )));
        assert!(h.replay(&act(
            Inst::Ret,
            sym("__schedule", 0x8000, 0),
            sym("prepare_task_switch", 0x4005, 5),
            300
        )));
        // disarmed without consuming the stack
        assert_eq!(h.tree().func(h.current()).sym.name, "prepare_task_switch");
        assert!(h.replay(&act(
            Inst::Call,
            sym("prepare_task_switch", 0x4008, 8),
            sym("next", 0xa000, 0),
            310
        )));
        assert_eq!(h.tree().func(h.current()).sym.name, "next");
    }

    #[test]
    fn test_enter_lazy_tlb_waits_for_schedule() {
        let mut h = history("enter_lazy_tlb", 0x4000, 100);
        assert!(h.replay(&act(
            Inst::TrStart,
            Symbol::default(),
            sym("x", 0x9000, 0),
            200
        )));
        // stage 1 ignores everything that is not a trace start
        assert!(h.replay(&act(Inst::Call, sym("p", 0x5000, 0), sym("q", 0x6000, 0), 210)));
        // a trace start somewhere else keeps waiting
        assert!(h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0x7f00, 0),
            sym("other", 0x7000, 0),
            220
        )));
        // the awaited pattern arrives
        assert!(h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0x7f00, 0),
            sym("schedule", 0x8000, 0),
            230
        )));
        // stage 2: the schedule return is processed for real
        assert!(h.replay(&act(
            Inst::Ret,
            sym("schedule", 0x8004, 4),
            sym("enter_lazy_tlb", 0x4005, 5),
            240
        )));
        assert_eq!(h.tree().func(h.current()).sym.name, "enter_lazy_tlb");
    }

    #[test]
    fn test_enter_lazy_tlb_known_from_is_data_loss() {
        let mut h = history("enter_lazy_tlb", 0x4000, 100);
        h.replay(&act(Inst::TrStart, Symbol::default(), sym("x", 0x9000, 0), 200));
        assert!(!h.replay(&act(
            Inst::TrStart,
            sym("known", 0x7000, 0),
            sym("schedule", 0x8000, 0),
            210
        )));
    }

    #[test]
    fn test_enter_lazy_tlb_stage_two_call_rearms() {
        let mut h = history("enter_lazy_tlb", 0x4000, 100);
        h.replay(&act(Inst::TrStart, Symbol::default(), sym("x", 0x9000, 0), 200));
        h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0x7f00, 0),
            sym("schedule", 0x8000, 0),
            210,
        ));
        // a call in stage 2 means the break repeats; back to waiting
        assert!(h.replay(&act(Inst::Call, sym("p", 0x5000, 0), sym("q", 0x6000, 0), 220)));
        assert!(h.replay(&act(Inst::Iret, sym("p", 0x5000, 0), sym("q", 0x6000, 0), 225)));
        assert!(h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0x7f00, 0),
            sym("schedule", 0x8000, 0),
            230
        )));
        assert!(!h.replay(&act(
            Inst::Ret,
            sym("not_schedule", 0x8800, 0),
            sym("enter_lazy_tlb", 0x4005, 5),
            240
        )));
    }

    #[test]
    fn test_perf_event_switch_output_expects_its_return() {
        let mut h = history("main", 0x1000, 100);
        h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("work", 0x2000, 0), 110));
        assert!(h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0x7f00, 0),
            sym(PERF_EVENT_SWITCH_SYMBOL, 0xffff_ffff_8400_0000, 0),
            200
        )));
        assert!(h.replay(&act(
            Inst::Ret,
            sym(PERF_EVENT_SWITCH_SYMBOL, 0xffff_ffff_8400_0010, 0x10),
            sym("work", 0x2009, 9),
            210
        )));
        assert_eq!(h.tree().func(h.current()).sym.name, "work");
    }

    #[test]
    fn test_perf_event_switch_output_rejects_anything_else() {
        let mut h = history("main", 0x1000, 100);
        h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0x7f00, 0),
            sym(PERF_EVENT_SWITCH_SYMBOL, 0xffff_ffff_8400_0000, 0),
            200,
        ));
        assert!(!h.replay(&act(
            Inst::Call,
            sym("main", 0x1004, 4),
            sym("work", 0x2000, 0),
            210
        )));
    }

    #[test]
    fn test_vdso_unknown_entry_becomes_call() {
        let mut h = history("main", 0x1000, 100);
        h.replay(&act(
            Inst::Call,
            sym("main", 0x1004, 4),
            sym("clock_gettime", 0x2000, 0),
            110,
        ));
        assert!(h.replay(&act(
            Inst::TrStart,
            sym(crate::action::UNKNOWN_SYMBOL, 0, 0),
            sym(crate::action::UNKNOWN_SYMBOL, 0x7fff_56f8_ca49, 0),
            120
        )));
        assert!(h.tree().func(h.current()).sym.is_unknown());
        assert_eq!(
            h.tree().caller(h.current()).map(|c| h.tree().func(c).sym.name.clone()),
            Some("clock_gettime".to_string())
        );
    }

    #[test]
    fn test_unrelated_tr_start_is_rejected() {
        let mut h = history("main", 0x1000, 100);
        assert!(!h.replay(&act(
            Inst::TrStart,
            sym("somewhere", 0x9000, 0),
            sym("elsewhere", 0xa000, 0),
            200
        )));
    }

    #[test]
    fn test_end_action_is_rejected() {
        let mut h = history("main", 0x1000, 100);
        assert!(!h.replay(&Action::end()));
    }

    #[test]
    fn test_terminate_uses_pause_time_and_infers_ends() {
        let mut h = history("main", 0x1000, 100);
        h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("foo", 0x2000, 0), 150));
        h.replay(&act(Inst::TrEnd, sym("foo", 0x2042, 0x42), Symbol::default(), 700));

        let tree = h.terminate();
        let root = tree.root();
        assert_eq!(tree.func(root).sym.name, GLOBAL_ROOT_NAME);
        assert_eq!(tree.func(root).stats.invoked, 1);
        let main = child_named(&tree, root, "main");
        let foo = child_named(&tree, main, "foo");
        // open activations were closed at the pause time with inferred ends
        assert_eq!(tree.func(foo).end, 700);
        assert_eq!(tree.func(foo).stats.invoked, 1);
        assert_eq!(tree.func(foo).stats.inferred, 1);
        assert_eq!(tree.func(foo).stats.sum_inferred, 550);
        // the seed root itself closes with a measured sample
        assert_eq!(tree.func(main).stats.invoked, 1);
        assert_eq!(tree.func(main).stats.inferred, 0);
    }

    #[test]
    fn test_statistics_invariant_invoked_ge_inferred() {
        let mut h = history("main", 0x1000, 100);
        for ts in [110, 120, 130] {
            h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("foo", 0x2000, 0), ts));
            h.replay(&act(
                Inst::Ret,
                sym("foo", 0x2004, 4),
                sym("main", 0x1009, 9),
                ts + 5,
            ));
        }
        h.replay(&act(Inst::Call, sym("main", 0x1004, 4), sym("bar", 0x3000, 0), 140));
        let tree = h.terminate();
        let root = tree.root();
        fn walk(tree: &CallTree, id: indextree::NodeId) {
            let stats = &tree.func(id).stats;
            assert!(stats.invoked >= stats.inferred);
            for c in tree.children(id).collect::<Vec<_>>() {
                walk(tree, c);
            }
        }
        walk(&tree, root);
    }
}
