//! The contract between the coordinator and its front ends.
//!
//! A transport reads operator input, prints output and forwards engine
//! events. It never touches engine state directly: protocol adapters submit
//! [`ProtocolRequest`]s and receive replies through [`Transport::respond`].

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use snag_config::Config;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::context::EngineHandle;
use crate::error::TransportError;
use crate::frame::Location;
use crate::render::{PlainRenderer, Renderer};
use crate::session::protocol::{ProtocolReply, ProtocolRequest};

/// One unit of operator input.
#[derive(Debug, Clone)]
pub enum Input {
    Line(String),
    Request { id: u64, request: ProtocolRequest },
}

/// Why a thread stopped, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Entry,
    Breakpoint,
    Exception,
    Step,
    Pause,
    Load,
    Postmortem,
}

impl StopReason {
    /// The reason string used by debug adapters.
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Entry | StopReason::Load => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Exception | StopReason::Postmortem => "exception",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
        }
    }
}

/// Engine state changes a transport may forward.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Suspended {
        thread: usize,
        reason: StopReason,
        location: Location,
        /// Breakpoint numbers that caused the stop.
        breakpoints: Vec<usize>,
        /// Human-readable description of the stop.
        description: String,
    },
    Resumed {
        thread: Option<usize>,
    },
    Loaded {
        path: String,
    },
    Terminated,
}

pub trait Transport: Send {
    /// Short name shown by `open` and in logs.
    fn name(&self) -> &str;

    fn puts(&mut self, text: &str);

    /// Wait for the next operator line or protocol request.
    fn readline(&mut self, prompt: &str) -> Result<Input, TransportError>;

    /// Ask a question; an empty answer yields `default`.
    fn ask(&mut self, prompt: &str, default: &str) -> Result<String, TransportError>;

    fn event(&mut self, event: EngineEvent);

    /// Answer a protocol request.
    fn respond(&mut self, id: u64, reply: Result<ProtocolReply, String>);

    fn width(&self) -> usize;

    fn quit(&mut self, code: i32);

    /// Called once the engine is running.
    fn activate(&mut self, _handle: EngineHandle) {}

    fn renderer(&self) -> Arc<dyn Renderer> {
        Arc::new(PlainRenderer)
    }
}

/// Opens transports for the `open` command.
pub trait TransportFactory: Send {
    /// `spec` is empty, `tcp`, `vscode`, `chrome`, `host:port` or a port.
    fn open(&self, spec: &str, config: &Config) -> Result<Box<dyn Transport>, TransportError>;
}

/// Everything a [`ScriptedTransport`] produced.
#[derive(Debug, Clone)]
pub enum Scripted {
    Out(String),
    Prompt(String),
    Ask(String),
    Event(EngineEvent),
    Reply(u64, Result<ProtocolReply, String>),
    Quit(i32),
}

/// An in-memory transport driven by a [`ScriptHandle`].
pub struct ScriptedTransport {
    input: UnboundedReceiver<Input>,
    output: Sender<Scripted>,
    width: usize,
}

impl ScriptedTransport {
    pub fn new(width: usize) -> (Self, ScriptHandle) {
        let (in_tx, in_rx) = unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel();
        (
            Self {
                input: in_rx,
                output: out_tx,
                width,
            },
            ScriptHandle {
                input: in_tx,
                output: out_rx,
                timeout: Duration::from_secs(10),
            },
        )
    }

    fn emit(&self, item: Scripted) {
        let _ = self.output.send(item);
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "script"
    }

    fn puts(&mut self, text: &str) {
        for line in text.lines() {
            self.emit(Scripted::Out(line.to_string()));
        }
    }

    fn readline(&mut self, prompt: &str) -> Result<Input, TransportError> {
        self.emit(Scripted::Prompt(prompt.to_string()));
        self.input.blocking_recv().ok_or(TransportError::Closed)
    }

    fn ask(&mut self, prompt: &str, default: &str) -> Result<String, TransportError> {
        self.emit(Scripted::Ask(prompt.to_string()));
        match self.input.blocking_recv() {
            Some(Input::Line(l)) if !l.trim().is_empty() => Ok(l.trim().to_string()),
            Some(_) => Ok(default.to_string()),
            None => Err(TransportError::Closed),
        }
    }

    fn event(&mut self, event: EngineEvent) {
        self.emit(Scripted::Event(event));
    }

    fn respond(&mut self, id: u64, reply: Result<ProtocolReply, String>) {
        self.emit(Scripted::Reply(id, reply));
    }

    fn width(&self) -> usize {
        self.width
    }

    fn quit(&mut self, code: i32) {
        self.emit(Scripted::Quit(code));
    }
}

/// Output gathered up to a prompt.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub items: Vec<Scripted>,
    pub prompt: Option<String>,
}

impl Transcript {
    /// Printed lines, one per entry.
    pub fn lines(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|i| match i {
                Scripted::Out(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.items
            .iter()
            .filter_map(|i| match i {
                Scripted::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn replies(&self) -> Vec<(u64, Result<ProtocolReply, String>)> {
        self.items
            .iter()
            .filter_map(|i| match i {
                Scripted::Reply(id, r) => Some((*id, r.clone())),
                _ => None,
            })
            .collect()
    }
}

/// The operator side of a [`ScriptedTransport`].
pub struct ScriptHandle {
    input: UnboundedSender<Input>,
    output: Receiver<Scripted>,
    timeout: Duration,
}

impl ScriptHandle {
    pub fn send(&self, line: &str) {
        let _ = self.input.send(Input::Line(line.to_string()));
    }

    pub fn request(&self, id: u64, request: ProtocolRequest) {
        let _ = self.input.send(Input::Request { id, request });
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Collect output until `stop` accepts an item, which is included.
    pub fn until<F>(&self, mut stop: F) -> Result<Transcript, RecvTimeoutError>
    where
        F: FnMut(&Scripted) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut transcript = Transcript::default();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let item = self.output.recv_timeout(left)?;
            let done = stop(&item);
            if let Scripted::Prompt(p) = &item {
                transcript.prompt = Some(p.clone());
            }
            transcript.items.push(item);
            if done {
                return Ok(transcript);
            }
        }
    }

    /// Collect output until the engine prompts for input.
    pub fn until_prompt(&self) -> Result<Transcript, RecvTimeoutError> {
        self.until(|i| matches!(i, Scripted::Prompt(_)))
    }

    /// Send `line` and collect output up to the next prompt.
    pub fn command(&self, line: &str) -> Result<Transcript, RecvTimeoutError> {
        self.send(line);
        self.until_prompt()
    }
}
