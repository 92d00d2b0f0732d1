//! The local console front end.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crossterm::style::{Color, Stylize};
use snag_core::{EngineEvent, Input, ProtocolReply, Renderer, Style, Transport, TransportError};

/// Width used when the terminal size is unknown.
const DEFAULT_WIDTH: usize = 80;

/// Colors output with ANSI escapes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnsiRenderer;

impl Renderer for AnsiRenderer {
    fn paint(&self, text: &str, style: Style) -> String {
        let styled = match style {
            Style::Header => text.bold(),
            Style::CurrentLine => text.with(Color::Yellow).bold(),
            Style::LineNumber => text.with(Color::DarkGrey),
            Style::FrameLabel => text.with(Color::Cyan),
            Style::Location => text.with(Color::Green),
            Style::Value => text.with(Color::Magenta),
            Style::Notice => text.with(Color::Blue),
            Style::Error => text.with(Color::Red),
        };
        styled.to_string()
    }
}

/// Reads commands from a line-oriented input and prints to an output.
pub struct ConsoleTransport<R, W> {
    input: R,
    output: W,
    width: Option<usize>,
    color: bool,
}

impl ConsoleTransport<io::BufReader<io::Stdin>, io::Stdout> {
    /// The process's stdin and stdout.
    pub fn stdio() -> Self {
        Self {
            input: io::BufReader::new(io::stdin()),
            output: io::stdout(),
            width: None,
            color: true,
        }
    }
}

impl<R, W> ConsoleTransport<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    /// A console over arbitrary streams with a fixed width and no colors.
    pub fn new(input: R, output: W, width: usize) -> Self {
        Self {
            input,
            output,
            width: Some(width),
            color: false,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn write(&mut self, text: &str) {
        if let Err(e) = self.output.write_all(text.as_bytes()).and_then(|_| self.output.flush()) {
            tracing::warn!("console write failed: {}", e);
        }
    }

    /// `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(TransportError::Interrupted),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl<R, W> Transport for ConsoleTransport<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn name(&self) -> &str {
        "console"
    }

    fn puts(&mut self, text: &str) {
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.write(&text);
    }

    fn readline(&mut self, prompt: &str) -> Result<Input, TransportError> {
        self.write(prompt);
        match self.read_line()? {
            Some(line) => Ok(Input::Line(line)),
            None => {
                self.write("\n");
                Ok(Input::Line("q!".to_string()))
            }
        }
    }

    fn ask(&mut self, prompt: &str, default: &str) -> Result<String, TransportError> {
        self.write(prompt);
        match self.read_line()? {
            Some(answer) if !answer.trim().is_empty() => Ok(answer.trim().to_string()),
            _ => Ok(default.to_string()),
        }
    }

    fn event(&mut self, event: EngineEvent) {
        tracing::trace!(?event, "console event");
    }

    fn respond(&mut self, id: u64, _reply: Result<ProtocolReply, String>) {
        tracing::debug!(id, "console dropped a protocol reply");
    }

    fn width(&self) -> usize {
        self.width.unwrap_or_else(|| {
            crossterm::terminal::size()
                .map(|(cols, _)| cols as usize)
                .unwrap_or(DEFAULT_WIDTH)
        })
    }

    fn quit(&mut self, code: i32) {
        tracing::info!(code, "console quit");
        let _ = self.output.flush();
    }

    fn renderer(&self) -> Arc<dyn Renderer> {
        if self.color {
            Arc::new(AnsiRenderer)
        } else {
            Arc::new(snag_core::PlainRenderer)
        }
    }
}
