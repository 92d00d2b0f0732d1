//! Sub-session nesting across the debugged process.
//!
//! [`ProcessGroup`] counts how deep the process is in sub-sessions. It does
//! not exclude anything: there is one debugged process per engine, and
//! arbitration between forked processes is not provided.

use std::sync::Mutex;

use crate::sync::lock;

#[derive(Debug, Default)]
pub struct ProcessGroup {
    depth: Mutex<usize>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// One level deeper. Returns `true` for the outermost entry.
    pub fn enter(&self) -> bool {
        let mut depth = lock(&self.depth);
        *depth += 1;
        tracing::debug!(depth = *depth, "process group entered");
        *depth == 1
    }

    /// One level out. Returns `true` once back at the top.
    pub fn leave(&self) -> bool {
        let mut depth = lock(&self.depth);
        if *depth == 0 {
            tracing::warn!("process group left without being entered");
            return true;
        }
        *depth -= 1;
        *depth == 0
    }

    pub fn depth(&self) -> usize {
        *lock(&self.depth)
    }
}
