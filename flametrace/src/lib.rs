//! Replay engine for hardware-assisted branch traces.
//!
//! Consumes the textual rendering of a processor branch trace (one action
//! per line: calls, returns, jumps, syscall boundaries, trace stops and
//! resumptions), reconstructs per-thread call stacks with gap repair, and
//! aggregates the result into flame-graph input, optional Fuchsia Trace
//! Format output, and periodic stack snapshots.
//!
//! Data flow: [`reader`] sources produce [`action::Action`]s, the
//! [`merge`] layer interleaves them in timestamp order, the [`replay`]
//! coordinator routes each action to its thread's [`history::History`],
//! which mutates a [`calltree::CallTree`]. Terminated histories are
//! archived and destructively merged into one aggregation tree at the end.

pub mod action;
pub mod calltree;
pub mod config;
pub mod history;
pub mod merge;
pub mod parallel;
pub mod parse;
pub mod reader;
pub mod replay;
