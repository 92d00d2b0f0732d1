//! Stepping predicates.
//!
//! A [`StepPlan`] is created from the frame the operator stepped from and
//! decides, event by event, whether the step is complete. Depth always
//! means the number of frames on the stack when the event fired.

use regex::Regex;

use crate::frame::Frame;
use crate::instrument::{EventKind, ExecEvent};

/// Where `until` should stop.
#[derive(Debug, Clone)]
pub enum UntilTarget {
    /// No argument: the next line below the current one.
    Next,
    Line { file: Option<String>, line: u32 },
    Name(String),
    Pattern(Regex),
}

impl UntilTarget {
    pub fn parse(arg: Option<&str>) -> Result<Self, regex::Error> {
        let Some(arg) = arg.map(str::trim).filter(|a| !a.is_empty()) else {
            return Ok(UntilTarget::Next);
        };
        if let Ok(line) = arg.parse::<u32>() {
            return Ok(UntilTarget::Line { file: None, line });
        }
        if let Some((file, line)) = arg.rsplit_once(':') {
            if let Ok(line) = line.parse::<u32>() {
                return Ok(UntilTarget::Line {
                    file: Some(file.to_string()),
                    line,
                });
            }
        }
        if let Some(re) = arg.strip_prefix('/').and_then(|a| a.strip_suffix('/')) {
            return Regex::new(re).map(UntilTarget::Pattern);
        }
        Ok(UntilTarget::Name(arg.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum StepKind {
    In,
    Next,
    Finish,
    Until(UntilTarget),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::In => "step",
            StepKind::Next => "next",
            StepKind::Finish => "finish",
            StepKind::Until(_) => "until",
        }
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    In,
    Next {
        depth: usize,
        path: String,
        line: u32,
        next_line: Option<u32>,
    },
    Finish {
        goal: usize,
    },
    UntilLine {
        file: String,
        line: u32,
        /// Set when no location was given: stay in this frame or above.
        max_depth: Option<usize>,
        depth: usize,
        label: String,
    },
    UntilCall(Matcher),
}

#[derive(Debug, Clone)]
enum Matcher {
    Name(String),
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, callee: &str) -> bool {
        match self {
            Matcher::Name(n) => n == callee,
            Matcher::Pattern(re) => re.is_match(callee),
        }
    }
}

/// An in-flight step.
#[derive(Debug, Clone)]
pub struct StepPlan {
    predicate: Predicate,
    /// Matches still to skip before stopping.
    remaining: usize,
}

impl StepPlan {
    /// Plan a step of `kind` from `frame`, repeated `count` times.
    pub fn new(kind: StepKind, count: usize, frame: &Frame) -> Self {
        let count = count.max(1);
        let mut remaining = count;
        let predicate = match kind {
            StepKind::In => Predicate::In,
            StepKind::Next => Predicate::Next {
                depth: frame.depth,
                path: frame.path().to_string(),
                line: frame.line(),
                next_line: frame.unit.as_ref().and_then(|u| u.next_line(frame.line())),
            },
            StepKind::Finish => {
                remaining = 1;
                let has_return = usize::from(frame.return_value.is_some());
                Predicate::Finish {
                    goal: frame.depth.saturating_sub(count - 1).saturating_sub(has_return),
                }
            }
            StepKind::Until(target) => {
                remaining = 1;
                match target {
                    UntilTarget::Next => Predicate::UntilLine {
                        file: frame.path().to_string(),
                        line: frame.line() + 1,
                        max_depth: Some(frame.depth),
                        depth: frame.depth,
                        label: frame.label().to_string(),
                    },
                    UntilTarget::Line { file, line } => Predicate::UntilLine {
                        file: file.unwrap_or_else(|| frame.path().to_string()),
                        line,
                        max_depth: None,
                        depth: frame.depth,
                        label: frame.label().to_string(),
                    },
                    UntilTarget::Name(n) => Predicate::UntilCall(Matcher::Name(n)),
                    UntilTarget::Pattern(re) => Predicate::UntilCall(Matcher::Pattern(re)),
                }
            }
        };
        Self {
            predicate,
            remaining,
        }
    }

    /// Event kinds the step needs to observe.
    pub fn kinds(&self) -> &'static [EventKind] {
        match self.predicate {
            Predicate::In | Predicate::Next { .. } => {
                &[EventKind::Line, EventKind::Return, EventKind::BlockReturn]
            }
            Predicate::Finish { .. } => &[EventKind::Return, EventKind::BlockReturn],
            Predicate::UntilLine { .. } => &[EventKind::Line, EventKind::Return],
            Predicate::UntilCall(_) => &[
                EventKind::Call,
                EventKind::NativeCall,
                EventKind::Return,
                EventKind::NativeReturn,
            ],
        }
    }

    /// Whether `ev` satisfies the step predicate, ignoring the count.
    pub fn accepts(&self, ev: &ExecEvent) -> bool {
        match &self.predicate {
            Predicate::In => true,
            Predicate::Next {
                depth,
                path,
                line,
                next_line,
            } => {
                ev.depth <= *depth
                    || next_line.is_some_and(|next| {
                        ev.location.path == *path
                            && ev.location.line > *line
                            && ev.location.line <= next
                    })
            }
            Predicate::Finish { goal } => ev.kind.is_return() && ev.depth <= *goal,
            Predicate::UntilLine {
                file,
                line,
                max_depth,
                depth,
                label,
            } => match ev.kind {
                EventKind::Line => {
                    max_depth.map_or(true, |max| ev.depth <= max)
                        && ev.location.path.ends_with(file.as_str())
                        && ev.location.line >= *line
                }
                _ => ev.depth <= *depth && ev.location.label == *label,
            },
            Predicate::UntilCall(m) => ev.callee.as_deref().is_some_and(|c| m.matches(c)),
        }
    }

    /// Count a matching event. Returns `true` when the step is complete.
    pub fn count_down(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, Location};
    use crate::source::CodeUnit;
    use crate::value::Value;

    fn frame_at(path: &str, line: u32, label: &str, depth: usize) -> Frame {
        Frame::new(Location::new(path, line, label), FrameKind::Method, Value::Nil, depth)
    }

    fn ev(kind: EventKind, path: &str, line: u32, label: &str, depth: usize) -> ExecEvent {
        ExecEvent::new(kind, Location::new(path, line, label), depth)
    }

    #[test]
    fn finish_two_from_depth_five_stops_when_depth_four_returns() {
        let plan = StepPlan::new(StepKind::Finish, 2, &frame_at("a.rb", 3, "m", 5));
        assert!(!plan.accepts(&ev(EventKind::Return, "a.rb", 3, "m", 5)));
        assert!(plan.accepts(&ev(EventKind::Return, "a.rb", 8, "n", 4)));
        assert!(!plan.accepts(&ev(EventKind::Line, "a.rb", 9, "n", 3)));
    }

    #[test]
    fn finish_with_return_value_goes_one_further() {
        let mut frame = frame_at("a.rb", 3, "m", 3);
        frame.return_value = Some(Value::Int(1));
        let plan = StepPlan::new(StepKind::Finish, 1, &frame);
        assert!(!plan.accepts(&ev(EventKind::Return, "a.rb", 3, "m", 3)));
        assert!(plan.accepts(&ev(EventKind::Return, "a.rb", 9, "k", 2)));
    }

    #[test]
    fn next_does_not_descend() {
        let unit = CodeUnit::script("a.rb", 1, 9).lines([2, 3, 7]).build();
        let frame = frame_at("a.rb", 3, "<main>", 1).with_unit(unit);
        let plan = StepPlan::new(StepKind::Next, 1, &frame);
        assert!(!plan.accepts(&ev(EventKind::Line, "a.rb", 12, "Calc#add", 2)));
        assert!(plan.accepts(&ev(EventKind::Line, "a.rb", 7, "<main>", 1)));
        assert!(plan.accepts(&ev(EventKind::Line, "a.rb", 7, "block", 2)), "within next line range");
    }

    #[test]
    fn step_in_counts_only_matches() {
        let mut plan = StepPlan::new(StepKind::In, 2, &frame_at("a.rb", 3, "m", 1));
        assert!(!plan.count_down());
        assert!(plan.count_down());
    }

    #[test]
    fn until_line_and_name() {
        let frame = frame_at("lib/a.rb", 3, "loop", 2);
        let plan = StepPlan::new(StepKind::Until(UntilTarget::Next), 1, &frame);
        assert!(!plan.accepts(&ev(EventKind::Line, "lib/a.rb", 2, "loop", 2)));
        assert!(!plan.accepts(&ev(EventKind::Line, "lib/a.rb", 9, "inner", 3)));
        assert!(plan.accepts(&ev(EventKind::Line, "lib/a.rb", 4, "loop", 2)));
        assert!(plan.accepts(&ev(EventKind::Return, "lib/a.rb", 2, "loop", 2)));

        let plan = StepPlan::new(
            StepKind::Until(UntilTarget::parse(Some("a.rb:20")).unwrap()),
            1,
            &frame,
        );
        assert!(plan.accepts(&ev(EventKind::Line, "lib/a.rb", 21, "inner", 4)));

        let plan = StepPlan::new(StepKind::Until(UntilTarget::parse(Some("/^ad/")).unwrap()), 1, &frame);
        let mut call = ev(EventKind::Call, "lib/a.rb", 5, "Calc#add", 3);
        call.callee = Some("add".into());
        assert!(plan.accepts(&call));
        assert_eq!(plan.kinds().len(), 4);
    }
}
