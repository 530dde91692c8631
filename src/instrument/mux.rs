//! Cytec-style multiplexer addressing.
//!
//! Only the auto-unlatching select command (`X`) is used: selecting a new
//! module/switch releases the previous one, halving the traffic compared with
//! explicit latch/unlatch pairs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unlatch every switch.
pub const CLEAR: &str = "C";

/// Physical multiplexer address of one jig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MuxChannel {
    /// Multiplexer module, `0` on single-module rigs
    #[serde(default)]
    pub module: u16,
    /// Switch within the module
    pub switch: u16,
}

impl MuxChannel {
    /// Address `module`, `switch`.
    pub fn new(module: u16, switch: u16) -> Self {
        Self { module, switch }
    }

    /// Select command for this address.
    pub fn select_command(&self) -> String {
        format!("X{},{}", self.module, self.switch)
    }
}

impl fmt::Display for MuxChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.module, self.switch)
    }
}
