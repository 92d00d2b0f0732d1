//! Text shown at stops: source windows, frame lines, variable tables.

use regex::Regex;

use crate::frame::Frame;
use crate::render::{Renderer, Style};
use crate::value::Value;

/// Which part of a file `list` shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRange {
    /// Centered on the frame line.
    Around,
    /// The chunk after the one shown last.
    Next,
    /// The chunk before the one shown last.
    Prev,
    From(u32),
    Span(u32, u32),
}

impl SourceRange {
    /// `list` arguments: nothing, `-`, `start` or `start-end`.
    pub fn parse(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Some(SourceRange::Next);
        }
        if arg == "-" {
            return Some(SourceRange::Prev);
        }
        if let Some((a, b)) = arg.split_once('-') {
            let a = a.trim().parse().ok()?;
            let b = b.trim().parse().ok()?;
            return Some(SourceRange::Span(a, b));
        }
        arg.parse().ok().map(SourceRange::From)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListingOptions {
    pub max_lines: usize,
    pub no_lineno: bool,
}

/// Zero-based `[start, end)` window of a `total`-line file.
fn window(
    total: usize,
    line: u32,
    shown: Option<u32>,
    max: usize,
    range: SourceRange,
) -> (usize, usize) {
    let around = (line as usize).saturating_sub(1).saturating_sub(max / 2);
    let (start, end) = match range {
        SourceRange::Around => (around, around + max),
        SourceRange::Next => {
            let start = shown.map(|s| s as usize).unwrap_or(around);
            (start, start + max)
        }
        SourceRange::Prev => {
            let end = shown
                .map(|s| s as usize)
                .unwrap_or(around + max)
                .saturating_sub(max);
            (end.saturating_sub(max), end)
        }
        SourceRange::From(n) => {
            let start = (n as usize).saturating_sub(1);
            (start, start + max)
        }
        SourceRange::Span(a, b) => ((a as usize).saturating_sub(1), b as usize),
    };
    (start.min(total), end.min(total))
}

/// Render a source window for `frame`. Returns the lines and the new
/// listing cursor.
pub fn source_window(
    src: &[String],
    frame: &Frame,
    range: SourceRange,
    opts: ListingOptions,
    renderer: &dyn Renderer,
) -> (Vec<String>, Option<u32>) {
    let (start, end) = window(src.len(), frame.line(), frame.show_line, opts.max_lines, range);
    if start >= end {
        return (Vec::new(), frame.show_line);
    }
    let mut out = Vec::with_capacity(end - start + 1);
    if opts.max_lines != 1 {
        out.push(renderer.paint(
            &format!("[{}, {}] in {}", start + 1, end, frame.path()),
            Style::Header,
        ));
    }
    for (i, text) in src[start..end].iter().enumerate() {
        let lineno = start + i + 1;
        let current = lineno == frame.line() as usize;
        let marker = if current { "=>" } else { "  " };
        let line = if opts.no_lineno {
            format!("{marker} {text}")
        } else {
            format!("{marker}{}| {text}", renderer.paint(&format!("{lineno:>4}"), Style::LineNumber))
        };
        out.push(if current {
            renderer.paint(&line, Style::CurrentLine)
        } else {
            line
        });
    }
    (out, Some(end as u32))
}

/// `=>#0\tCalc#add at app.rb:4`
pub fn frame_line(frame: &Frame, index: usize, current: bool, renderer: &dyn Renderer) -> String {
    let marker = if current { "=>" } else { "  " };
    let mut desc = format!(
        "{} at {}",
        renderer.paint(frame.label(), Style::FrameLabel),
        renderer.paint(&frame.location.to_string(), Style::Location)
    );
    if let Some(v) = &frame.return_value {
        desc.push_str(&format!(" #=> {}", v.inspect()));
    }
    if let Some(e) = &frame.raised {
        desc.push_str(&format!(" #=> raised {}", e.inspect()));
    }
    format!("{marker}#{index}\t{desc}")
}

/// The first `max` frames, with a note about the rest.
pub fn frames_summary(frames: &[Frame], cursor: usize, max: usize, renderer: &dyn Renderer) -> Vec<String> {
    let mut out: Vec<String> = frames
        .iter()
        .enumerate()
        .take(max)
        .map(|(i, f)| frame_line(f, i, i == cursor, renderer))
        .collect();
    if frames.len() > max {
        out.push(format!(
            "  # and {} frames (use `bt' command for all frames)",
            frames.len() - max
        ));
    }
    out
}

/// Full backtrace, optionally limited and filtered.
pub fn backtrace(
    frames: &[Frame],
    cursor: usize,
    max: Option<usize>,
    pattern: Option<&Regex>,
    renderer: &dyn Renderer,
) -> Vec<String> {
    frames
        .iter()
        .enumerate()
        .filter(|(_, f)| pattern.map_or(true, |re| re.is_match(&f.describe())))
        .take(max.unwrap_or(usize::MAX))
        .map(|(i, f)| frame_line(f, i, i == cursor, renderer))
        .collect()
}

/// `name = value` lines, filtered by name.
pub fn variables(entries: &[(String, Value)], pattern: Option<&Regex>) -> Vec<String> {
    entries
        .iter()
        .filter(|(name, _)| pattern.map_or(true, |re| re.is_match(name)))
        .map(|(name, value)| format!("{name} = {}", value.inspect()))
        .collect()
}

/// `title: a  b  c`, or nothing when `names` is empty.
pub fn name_list(title: &str, names: &[String]) -> Option<String> {
    if names.is_empty() {
        None
    } else {
        Some(format!("{title}: {}", names.join("  ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, Location};
    use crate::render::PlainRenderer;

    fn src(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("line {i}")).collect()
    }

    fn frame(line: u32) -> Frame {
        Frame::new(Location::new("app.rb", line, "Calc#add"), FrameKind::Method, Value::Nil, 2)
    }

    const OPTS: ListingOptions = ListingOptions {
        max_lines: 10,
        no_lineno: false,
    };

    #[test]
    fn window_centers_on_the_stop_line() {
        let (lines, shown) = source_window(&src(30), &frame(12), SourceRange::Around, OPTS, &PlainRenderer);
        assert_eq!(lines[0], "[7, 16] in app.rb");
        assert_eq!(lines[6], "=>  12| line 12");
        assert_eq!(lines[1], "     7| line 7");
        assert_eq!(shown, Some(16));
    }

    #[test]
    fn list_continues_and_goes_back() {
        let mut f = frame(12);
        f.show_line = Some(16);
        let (lines, shown) = source_window(&src(30), &f, SourceRange::Next, OPTS, &PlainRenderer);
        assert_eq!(lines[0], "[17, 26] in app.rb");
        assert_eq!(shown, Some(26));
        f.show_line = shown;
        let (lines, _) = source_window(&src(30), &f, SourceRange::Prev, OPTS, &PlainRenderer);
        assert_eq!(lines[0], "[7, 16] in app.rb");
    }

    #[test]
    fn window_is_clamped_to_the_file() {
        let (lines, _) = source_window(&src(3), &frame(2), SourceRange::Around, OPTS, &PlainRenderer);
        assert_eq!(lines.len(), 4);
        let (lines, _) = source_window(&src(3), &frame(2), SourceRange::From(9), OPTS, &PlainRenderer);
        assert!(lines.is_empty());
    }

    #[test]
    fn range_arguments() {
        assert_eq!(SourceRange::parse(""), Some(SourceRange::Next));
        assert_eq!(SourceRange::parse("-"), Some(SourceRange::Prev));
        assert_eq!(SourceRange::parse("5"), Some(SourceRange::From(5)));
        assert_eq!(SourceRange::parse("5-9"), Some(SourceRange::Span(5, 9)));
        assert_eq!(SourceRange::parse("x"), None);
    }

    #[test]
    fn frames_summary_notes_hidden_frames() {
        let frames = vec![frame(4), frame(11), frame(20)];
        let out = frames_summary(&frames, 0, 2, &PlainRenderer);
        assert_eq!(out[0], "=>#0\tCalc#add at app.rb:4");
        assert_eq!(out[1], "  #1\tCalc#add at app.rb:11");
        assert_eq!(out[2], "  # and 1 frames (use `bt' command for all frames)");
    }

    #[test]
    fn backtrace_filters_by_pattern() {
        let mut top = frame(4);
        top.location.label = "<main>".into();
        let frames = vec![frame(4), top];
        let re = Regex::new("main").unwrap();
        let out = backtrace(&frames, 0, None, Some(&re), &PlainRenderer);
        assert_eq!(out, vec!["  #1\t<main> at app.rb:4"]);
    }
}
