//! Output styling contract.
//!
//! The engine tags the parts of its output it wants highlighted; a
//! transport decides how they look.

/// What a piece of output is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// `[1, 10] in app.rb`
    Header,
    /// The stop line in a source listing.
    CurrentLine,
    LineNumber,
    FrameLabel,
    Location,
    Value,
    Notice,
    Error,
}

pub trait Renderer: Send + Sync {
    fn paint(&self, text: &str, style: Style) -> String;
}

/// Leaves text untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn paint(&self, text: &str, _style: Style) -> String {
        text.to_string()
    }
}
