//! Parser for the textual rendering of branch-trace records.
//!
//! One line per record, as printed by
//! `perf script --itrace=cr --ns -F-event,-period,+addr,-comm,+flags`:
//!
//! ```text
//! TID [CPU] SEC.NSEC: MNEMONIC ADDR SYM+OFF (DSO) => ADDR SYM+OFF (DSO)
//! ```
//!
//! `+OFF` is omitted for `[unknown]` symbols, `(DSO)` with `-F-dso`.

use thiserror::Error;
use tracing::warn;

use crate::action::{Action, Inst, Symbol, NS_IN_SEC, UNKNOWN_SYMBOL};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {what}: {source}")]
    Number {
        what: &'static str,
        source: std::num::ParseIntError,
    },

    #[error("unrecognized branch mnemonic")]
    UnknownMnemonic,
}

/// Mnemonics are matched by prefix in order, so `tr end  syscall` must come
/// before `tr end`.
const MNEMONICS: &[(&str, Inst)] = &[
    ("call", Inst::Call),
    ("return", Inst::Ret),
    ("jmp", Inst::Jmp),
    ("jcc", Inst::Jcc),
    ("tr strt", Inst::TrStart),
    ("tr end  syscall", Inst::TrEndSyscall),
    ("tr end", Inst::TrEnd),
    ("syscall", Inst::Syscall),
    ("sysret", Inst::Sysret),
    ("hw int", Inst::Int),
    ("iret", Inst::Iret),
];

fn decimal(s: &str, what: &'static str) -> Result<u64, ParseError> {
    s.trim()
        .parse()
        .map_err(|source| ParseError::Number { what, source })
}

fn hex(s: &str, what: &'static str) -> Result<u64, ParseError> {
    u64::from_str_radix(s, 16).map_err(|source| ParseError::Number { what, source })
}

/// Parses `ADDR SYM+OFF` or `ADDR [unknown]`, returning the symbol and the
/// remainder of the line.
fn parse_symbol(s: &str) -> Result<(Symbol, &str), ParseError> {
    let s = s.trim_start();
    let end = s.find(' ').ok_or(ParseError::Missing("symbol name"))?;
    let address = hex(&s[..end], "symbol address")?;
    let rest = s[end..].trim_start();

    if let Some(rest) = rest.strip_prefix(UNKNOWN_SYMBOL) {
        return Ok((Symbol::new(UNKNOWN_SYMBOL, address, 0), rest));
    }

    let plus = rest.find("+0x").ok_or(ParseError::Missing("symbol offset"))?;
    let after = &rest[plus + 3..];
    let off_end = after
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(after.len());
    let offset = hex(&after[..off_end], "symbol offset")?;
    Ok((
        Symbol::new(&rest[..plus], address, offset),
        &after[off_end..],
    ))
}

pub fn parse_line(line: &str) -> Result<Action, ParseError> {
    let (tid_part, rest) = line.split_once('[').ok_or(ParseError::Missing("cpu"))?;
    let tid = decimal(tid_part, "tid")?;
    let (cpu_part, rest) = rest.split_once(']').ok_or(ParseError::Missing("cpu"))?;
    let cpu = decimal(cpu_part, "cpu")?;

    let (sec_part, rest) = rest
        .split_once('.')
        .ok_or(ParseError::Missing("timestamp"))?;
    let secs = decimal(sec_part, "timestamp seconds")?;
    let (ns_part, rest) = rest
        .split_once(':')
        .ok_or(ParseError::Missing("timestamp"))?;
    let nanos = decimal(ns_part, "timestamp nanoseconds")?;
    let ts = secs * NS_IN_SEC + nanos;

    let rest = rest.trim_start();
    let (mnemonic, inst) = MNEMONICS
        .iter()
        .find(|(m, _)| rest.starts_with(m))
        .ok_or(ParseError::UnknownMnemonic)?;
    let mut rest = rest[mnemonic.len()..].trim_start();

    if *inst == Inst::TrEnd {
        // a subkind word (e.g. "tr end  return") may precede the address;
        // degrade it to a plain trace end
        let token_end = rest.find(' ').unwrap_or(rest.len());
        if hex(&rest[..token_end], "address").is_err() {
            warn!(line = line.trim(), "unknown tr end subkind");
            rest = rest[token_end..].trim_start();
        }
    }

    let (from, rest) = parse_symbol(rest)?;
    let arrow = rest.find("=>").ok_or(ParseError::Missing("branch target"))?;
    let (to, _) = parse_symbol(rest[arrow + 2..].trim_start())?;

    Ok(Action {
        inst: *inst,
        from,
        to,
        ts,
        tid,
        cpu,
    })
}
