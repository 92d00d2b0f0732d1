//! The breakpoint registry.
//!
//! Owned by the coordinator: only it adds or deletes entries. Debuggee
//! threads read it to decide whether a step should yield to a breakpoint.

use std::sync::Arc;

use crate::breakpoint::{path_matches, Breakpoint, BreakpointKey, BreakpointKind};
use crate::error::BreakpointError;

/// Breakpoints in insertion order, numbered from `#0`.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    entries: Vec<(BreakpointKey, Arc<Breakpoint>)>,
    next_number: usize,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self) {
        self.entries.retain(|(_, bp)| !bp.is_deleted());
    }

    /// Register `bp` and assign its number.
    ///
    /// A live breakpoint with the same key rejects the new one unless the
    /// new one is oneshot.
    pub fn add(&mut self, bp: Arc<Breakpoint>) -> Result<Arc<Breakpoint>, BreakpointError> {
        self.prune();
        let key = bp.key();
        if !bp.is_oneshot() && self.entries.iter().any(|(k, _)| *k == key) {
            return Err(BreakpointError::Duplicated(bp.label()));
        }
        bp.set_number(self.next_number);
        self.next_number += 1;
        self.entries.push((key, Arc::clone(&bp)));
        Ok(bp)
    }

    /// Live breakpoints in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Breakpoint>> {
        self.entries
            .iter()
            .map(|(_, bp)| bp)
            .filter(|bp| !bp.is_deleted())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, number: usize) -> Option<Arc<Breakpoint>> {
        self.iter().find(|bp| bp.number() == Some(number)).cloned()
    }

    pub fn find(&self, key: &BreakpointKey) -> Option<Arc<Breakpoint>> {
        self.entries
            .iter()
            .find(|(k, bp)| k == key && !bp.is_deleted())
            .map(|(_, bp)| Arc::clone(bp))
    }

    /// Remove the breakpoint numbered `number`. The caller detaches it.
    pub fn remove(&mut self, number: usize) -> Option<Arc<Breakpoint>> {
        self.prune();
        let pos = self
            .entries
            .iter()
            .position(|(_, bp)| bp.number() == Some(number))?;
        Some(self.entries.remove(pos).1)
    }

    pub fn remove_all(&mut self) -> Vec<Arc<Breakpoint>> {
        self.entries.drain(..).map(|(_, bp)| bp).collect()
    }

    /// Whether an active line breakpoint binds to `path:line`.
    pub fn has_line_at(&self, path: &str, line: u32) -> bool {
        self.iter().any(|bp| {
            matches!(bp.kind(), BreakpointKind::Line { .. })
                && bp
                    .resolved()
                    .is_some_and(|loc| loc.path == path && loc.line == line)
        })
    }

    /// Pending line breakpoints naming `path`.
    pub fn pending_lines(&self, path: &str) -> Vec<Arc<Breakpoint>> {
        self.iter()
            .filter(|bp| bp.is_pending())
            .filter(|bp| matches!(bp.kind(), BreakpointKind::Line { path: p, .. } if path_matches(p, path)))
            .cloned()
            .collect()
    }

    /// Active line breakpoints bound in `path`.
    pub fn active_lines(&self, path: &str) -> Vec<Arc<Breakpoint>> {
        self.iter()
            .filter(|bp| matches!(bp.kind(), BreakpointKind::Line { .. }))
            .filter(|bp| bp.resolved().is_some_and(|loc| loc.path == path))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_sequential_and_stable() {
        let mut reg = BreakpointRegistry::new();
        let a = reg.add(Arc::new(Breakpoint::line("a.rb", 1))).unwrap();
        let b = reg.add(Arc::new(Breakpoint::line("a.rb", 2))).unwrap();
        assert_eq!((a.number(), b.number()), (Some(0), Some(1)));
        reg.remove(0);
        let c = reg.add(Arc::new(Breakpoint::catch("RuntimeError"))).unwrap();
        assert_eq!(c.number(), Some(2));
        assert_eq!(reg.len(), 2);
        assert!(reg.get(1).is_some());
        assert!(reg.get(0).is_none());
    }

    #[test]
    fn duplicates_are_rejected_unless_oneshot() {
        let mut reg = BreakpointRegistry::new();
        reg.add(Arc::new(Breakpoint::line("a.rb", 3))).unwrap();
        let err = reg.add(Arc::new(Breakpoint::line("a.rb", 3))).unwrap_err();
        assert!(err.to_string().starts_with("duplicated breakpoint"), "{err}");
        assert!(reg.add(Arc::new(Breakpoint::line("a.rb", 3).oneshot())).is_ok());
    }

    #[test]
    fn pending_lines_match_by_path_suffix() {
        let mut reg = BreakpointRegistry::new();
        reg.add(Arc::new(Breakpoint::line("app.rb", 10))).unwrap();
        reg.add(Arc::new(Breakpoint::line("lib.rb", 1))).unwrap();
        assert_eq!(reg.pending_lines("/src/app.rb").len(), 1);
        assert!(reg.active_lines("/src/app.rb").is_empty());
        assert!(!reg.has_line_at("/src/app.rb", 10));
    }
}
