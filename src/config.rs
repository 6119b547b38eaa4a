//! Protocol parameters: the variable table a protocol file's top-level
//! assignments fill in (spec.md §3 "Protocol parameters", §6.1).

use derive_more::Display;

/// Policy for bytes left over after a template has matched, spec.md §6.1
/// `extrainput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
pub enum ExtraInput {
    #[default]
    Error,
    Ignore,
}

/// The full set of optional protocol-file variables (spec.md §3, §6.1).
/// Defaults mirror `StreamCore.cc`'s `initVarFromProtocol` chain; in
/// particular `poll_period` inherits `reply_timeout` when unset, per
/// spec.md §6.1's "also default `pollperiod`" note.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolVars {
    pub lock_timeout: u32,
    pub write_timeout: u32,
    pub reply_timeout: u32,
    pub read_timeout: u32,
    pub poll_period: Option<u32>,
    /// 0 = unlimited.
    pub max_input: usize,
    pub in_terminator: Vec<u8>,
    pub out_terminator: Vec<u8>,
    pub separator: Vec<u8>,
    pub extra_input: ExtraInput,
}

impl Default for ProtocolVars {
    fn default() -> Self {
        Self {
            lock_timeout: 0,
            write_timeout: 0,
            reply_timeout: 1000,
            read_timeout: 100,
            poll_period: None,
            max_input: 0,
            in_terminator: Vec::new(),
            out_terminator: Vec::new(),
            separator: Vec::new(),
            extra_input: ExtraInput::default(),
        }
    }
}

impl ProtocolVars {
    /// Resolves `poll_period`'s default-from-`reply_timeout` chain
    /// (spec.md §6.1). Call once after all assignments in a block have
    /// been applied.
    pub fn finalize(&mut self) {
        if self.poll_period.is_none() {
            self.poll_period = Some(self.reply_timeout);
        }
    }

    pub fn poll_period(&self) -> u32 {
        self.poll_period.unwrap_or(self.reply_timeout)
    }
}
