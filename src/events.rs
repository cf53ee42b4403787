//! Event definitions for the shell's event loop.
//!
//! State transitions, console commands and OS signals all arrive on one
//! channel and are handled in order by `main`.

use crate::process::GatewayState;

/// OS signal that asked the shell to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

/// Represents an event in the shell's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// The gateway state changed.
    State(GatewayState),
    /// A line typed on the console.
    Command(String),
    /// Standard input reached EOF.
    InputClosed,
    /// The shell received a termination signal.
    Shutdown { signal: ProcessSignal },
}
