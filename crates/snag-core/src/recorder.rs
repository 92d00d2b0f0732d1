//! Step-back log for one thread.

use std::collections::VecDeque;

use crate::frame::Frame;
use crate::instrument::HookId;

/// Entries kept before the oldest ones are dropped.
pub const RECORD_LIMIT: usize = 10_000;

/// Frame snapshots taken at every line event while recording.
///
/// Replay walks the log from the end: position 0 is the live stop, position
/// `n` is `n` snapshots back.
#[derive(Debug, Default)]
pub struct Recorder {
    log: VecDeque<Vec<Frame>>,
    index: usize,
    /// Live frames saved when replay started.
    backup: Option<Vec<Frame>>,
    pub(crate) hook: Option<HookId>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn is_recording(&self) -> bool {
        self.hook.is_some()
    }

    pub fn is_replaying(&self) -> bool {
        self.index > 0
    }

    /// Replay position, counted back from the live stop.
    pub fn position(&self) -> usize {
        self.index
    }

    pub fn record(&mut self, frames: Vec<Frame>) {
        if self.log.len() == RECORD_LIMIT {
            self.log.pop_front();
        }
        self.log.push_back(frames);
    }

    pub fn can_step_back(&self) -> bool {
        self.index < self.log.len()
    }

    /// Move `n` snapshots back. `live` is saved when replay starts.
    pub fn step_back(&mut self, n: usize, live: &[Frame]) {
        if self.index == 0 {
            self.backup = Some(live.to_vec());
        }
        self.index = (self.index + n.max(1)).min(self.log.len());
    }

    /// Move `n` snapshots forward, ending at the live stop.
    pub fn step_forward(&mut self, n: usize) {
        self.index = self.index.saturating_sub(n.max(1));
    }

    pub fn step_reset(&mut self) {
        self.index = 0;
    }

    /// Frames at the current replay position.
    pub fn current(&self) -> Option<Vec<Frame>> {
        if self.index == 0 {
            return self.backup.clone();
        }
        self.log.get(self.log.len() - self.index).cloned()
    }

    pub fn clear(&mut self) {
        self.log.clear();
        self.index = 0;
        self.backup = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, Location};
    use crate::value::Value;

    fn at(line: u32) -> Vec<Frame> {
        vec![Frame::new(Location::new("a.rb", line, "<main>"), FrameKind::Top, Value::Nil, 1)]
    }

    #[test]
    fn back_forward_and_reset() {
        let mut rec = Recorder::new();
        for line in 1..=3 {
            rec.record(at(line));
        }
        let live = at(4);
        assert!(rec.can_step_back());
        rec.step_back(1, &live);
        assert_eq!(rec.current().unwrap()[0].line(), 3);
        rec.step_back(5, &live);
        assert_eq!(rec.current().unwrap()[0].line(), 1);
        assert!(!rec.can_step_back());
        rec.step_forward(1);
        assert_eq!(rec.current().unwrap()[0].line(), 2);
        rec.step_reset();
        assert!(!rec.is_replaying());
        assert_eq!(rec.current().unwrap()[0].line(), 4);
    }

    #[test]
    fn log_is_bounded() {
        let mut rec = Recorder::new();
        for _ in 0..RECORD_LIMIT + 5 {
            rec.record(Vec::new());
        }
        assert_eq!(rec.len(), RECORD_LIMIT);
    }
}
