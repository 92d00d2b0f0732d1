//! State shared by the remote transport and its connection tasks.
//!
//! The session thread talks to a [`Link`] synchronously; whichever protocol
//! adapter currently holds the connection drains [`Outgoing`] messages and
//! feeds operator input back. Output produced while no controller is
//! attached is kept and replayed to the next one, together with the stop
//! and prompt it has not seen.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use snag_core::{EngineEvent, EngineHandle, Input, ProtocolReply, ProtocolRequest};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Lines kept for a controller that has not connected yet.
const BACKLOG_LIMIT: usize = 1_000;

/// Session to connection.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Out(String),
    /// The session waits for a command line.
    Prompt { turn: u64, prompt: String },
    /// The session waits for an answer to a question.
    Ask { turn: u64, prompt: String },
    Event(EngineEvent),
    Reply {
        id: u64,
        reply: Result<ProtocolReply, String>,
    },
    Quit(i32),
    /// Acknowledged once everything queued before it is written.
    Flush(oneshot::Sender<()>),
}

/// Connection to session.
#[derive(Debug)]
pub(crate) enum Incoming {
    Input(Input),
    Answer(String),
    Interrupt,
}

#[derive(Debug, Clone)]
struct Turn {
    turn: u64,
    prompt: String,
    ask: bool,
}

#[derive(Debug, Default)]
struct LinkState {
    sink: Option<UnboundedSender<Outgoing>>,
    backlog: Vec<String>,
    turn: Option<Turn>,
    suspended: Option<EngineEvent>,
}

#[derive(Debug)]
pub(crate) struct Link {
    handle: Mutex<Option<EngineHandle>>,
    state: Mutex<LinkState>,
    incoming: UnboundedSender<Incoming>,
    reading: AtomicBool,
    width: AtomicUsize,
    next_turn: AtomicU64,
    next_request: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Link {
    pub(crate) fn new(width: usize) -> (Self, UnboundedReceiver<Incoming>) {
        let (tx, rx) = unbounded_channel();
        let link = Self {
            handle: Mutex::new(None),
            state: Mutex::new(LinkState::default()),
            incoming: tx,
            reading: AtomicBool::new(false),
            width: AtomicUsize::new(width),
            next_turn: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        };
        (link, rx)
    }

    // --- session side -----------------------------------------------------

    pub(crate) fn activate(&self, handle: EngineHandle) {
        *lock(&self.handle) = Some(handle);
    }

    pub(crate) fn send(&self, msg: Outgoing) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        match &msg {
            Outgoing::Event(event @ EngineEvent::Suspended { .. }) => {
                state.suspended = Some(event.clone());
            }
            Outgoing::Event(EngineEvent::Resumed { .. } | EngineEvent::Terminated) => {
                state.suspended = None;
            }
            _ => {}
        }
        let Some(sink) = &state.sink else {
            if let Outgoing::Out(line) = msg {
                if state.backlog.len() >= BACKLOG_LIMIT {
                    state.backlog.remove(0);
                }
                state.backlog.push(line);
            }
            return;
        };
        if let Err(unsent) = sink.send(msg) {
            state.sink = None;
            if let Outgoing::Out(line) = unsent.0 {
                state.backlog.push(line);
            }
        }
    }

    /// Announce a prompt and mark the session as reading.
    pub(crate) fn begin_turn(&self, prompt: &str, ask: bool) -> u64 {
        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        lock(&self.state).turn = Some(Turn {
            turn,
            prompt: prompt.to_string(),
            ask,
        });
        self.reading.store(true, Ordering::SeqCst);
        let prompt = prompt.to_string();
        self.send(if ask {
            Outgoing::Ask { turn, prompt }
        } else {
            Outgoing::Prompt { turn, prompt }
        });
        turn
    }

    pub(crate) fn end_turn(&self) {
        self.reading.store(false, Ordering::SeqCst);
        lock(&self.state).turn = None;
    }

    pub(crate) fn width(&self) -> usize {
        self.width.load(Ordering::Relaxed)
    }

    // --- connection side --------------------------------------------------

    /// Attach a controller. The returned receiver starts with the backlog,
    /// the current stop and the open prompt.
    pub(crate) fn connect(&self) -> UnboundedReceiver<Outgoing> {
        let (tx, rx) = unbounded_channel();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        for line in state.backlog.drain(..) {
            let _ = tx.send(Outgoing::Out(line));
        }
        if let Some(event) = &state.suspended {
            let _ = tx.send(Outgoing::Event(event.clone()));
        }
        if let Some(turn) = &state.turn {
            let Turn { turn, prompt, ask } = turn.clone();
            let _ = tx.send(if ask {
                Outgoing::Ask { turn, prompt }
            } else {
                Outgoing::Prompt { turn, prompt }
            });
        }
        state.sink = Some(tx);
        rx
    }

    pub(crate) fn disconnect(&self) {
        lock(&self.state).sink = None;
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub(crate) fn set_width(&self, width: usize) {
        if width > 0 {
            self.width.store(width, Ordering::Relaxed);
        }
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn line(&self, text: String) {
        let _ = self.incoming.send(Incoming::Input(Input::Line(text)));
    }

    pub(crate) fn answer(&self, text: String) {
        let _ = self.incoming.send(Incoming::Answer(text));
    }

    /// Hand a request to the session: through `readline` when it is
    /// prompting, through its event queue otherwise.
    pub(crate) fn submit(&self, id: u64, request: ProtocolRequest) {
        if self.is_reading() {
            let _ = self.incoming.send(Incoming::Input(Input::Request { id, request }));
            return;
        }
        match lock(&self.handle).as_ref() {
            Some(handle) => handle.request(id, request),
            None => self.send(Outgoing::Reply {
                id,
                reply: Err("debugger is not running".to_string()),
            }),
        }
    }

    /// Ctrl-C or a `pause` from the client.
    pub(crate) fn interrupt(&self) {
        if self.is_reading() {
            let _ = self.incoming.send(Incoming::Interrupt);
        } else if let Some(handle) = lock(&self.handle).as_ref() {
            tracing::debug!("pause requested");
            handle.pause();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_without_controller_is_replayed_on_connect() {
        let (link, _incoming) = Link::new(80);
        link.send(Outgoing::Out("hello".into()));
        link.begin_turn("(snag) ", false);
        let mut rx = link.connect();
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Out(l)) if l == "hello"));
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Prompt { prompt, .. }) if prompt == "(snag) "));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn input_reaches_the_session_only_while_reading() {
        let (link, mut incoming) = Link::new(80);
        link.submit(7, ProtocolRequest::Threads);
        assert!(incoming.try_recv().is_err());

        link.begin_turn("(snag) ", false);
        link.submit(8, ProtocolRequest::Threads);
        assert!(matches!(
            incoming.try_recv(),
            Ok(Incoming::Input(Input::Request { id: 8, .. }))
        ));
        link.interrupt();
        assert!(matches!(incoming.try_recv(), Ok(Incoming::Interrupt)));
        link.end_turn();
        assert!(!link.is_reading());
    }

    #[test]
    fn requests_before_activation_are_refused() {
        let (link, _incoming) = Link::new(80);
        let mut rx = link.connect();
        link.submit(3, ProtocolRequest::Threads);
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Reply { id: 3, reply: Err(_) })));
    }

    #[test]
    fn width_ignores_zero() {
        let (link, _incoming) = Link::new(80);
        link.set_width(0);
        assert_eq!(link.width(), 80);
        link.set_width(120);
        assert_eq!(link.width(), 120);
    }
}
