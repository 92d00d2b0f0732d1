//! The instrumentation capability.
//!
//! A runtime reports execution events to a [`HookRegistry`]. The engine
//! subscribes hooks through the [`Instrumentation`] trait; a hook inspects
//! the event and answers with a [`HookAction`]. Stops are carried out by the
//! attached [`StopSink`] on the thread that produced the event.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::thread::ThreadId;

use crate::breakpoint::Breakpoint;
use crate::debuggee::Debuggee;
use crate::frame::Location;
use crate::source::CodeUnit;
use crate::sync::{read, write};
use crate::value::Value;

/// Execution events a runtime can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Line,
    Call,
    Return,
    BlockReturn,
    NativeCall,
    NativeReturn,
    Raise,
    ScriptCompiled,
    MethodDefined,
    ThreadBegin,
    ThreadEnd,
}

impl EventKind {
    /// Events at which a thread may be suspended.
    pub const BREAKABLE: &'static [EventKind] = &[
        EventKind::Line,
        EventKind::Call,
        EventKind::Return,
        EventKind::BlockReturn,
        EventKind::NativeCall,
        EventKind::NativeReturn,
        EventKind::Raise,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Line => "line",
            EventKind::Call => "call",
            EventKind::Return => "return",
            EventKind::BlockReturn => "b_return",
            EventKind::NativeCall => "c_call",
            EventKind::NativeReturn => "c_return",
            EventKind::Raise => "raise",
            EventKind::ScriptCompiled => "script_compiled",
            EventKind::MethodDefined => "method_added",
            EventKind::ThreadBegin => "thread_begin",
            EventKind::ThreadEnd => "thread_end",
        }
    }

    pub fn is_return(self) -> bool {
        matches!(
            self,
            EventKind::Return | EventKind::BlockReturn | EventKind::NativeReturn
        )
    }
}

/// One execution event.
#[derive(Debug, Clone)]
pub struct ExecEvent {
    pub kind: EventKind,
    pub location: Location,
    /// Frames on the stack when the event fires. Call events count the new
    /// frame; return events still count the returning one.
    pub depth: usize,
    /// Method name for call, return and method-defined events.
    pub callee: Option<String>,
    /// Class defining `callee`.
    pub class: Option<String>,
    pub receiver: Option<Value>,
    pub args: Vec<Value>,
    pub return_value: Option<Value>,
    pub exception: Option<Value>,
    /// The loaded unit for script-compiled events.
    pub unit: Option<Arc<CodeUnit>>,
    /// Source text accompanying a script-compiled event.
    pub source: Option<Arc<str>>,
}

impl ExecEvent {
    pub fn new(kind: EventKind, location: Location, depth: usize) -> Self {
        Self {
            kind,
            location,
            depth,
            callee: None,
            class: None,
            receiver: None,
            args: Vec::new(),
            return_value: None,
            exception: None,
            unit: None,
            source: None,
        }
    }

    /// `Class#name` of the callee, when known.
    pub fn method_label(&self) -> Option<String> {
        match (&self.class, &self.callee) {
            (Some(c), Some(m)) => Some(format!("{c}#{m}")),
            (None, Some(m)) => Some(m.clone()),
            _ => None,
        }
    }
}

/// Why a thread stops and reports to the coordinator.
#[derive(Debug, Clone)]
pub enum SuspendCause {
    Breakpoint(Arc<Breakpoint>),
    Step,
    /// Operator pause request.
    Pause,
    /// First stop of the program.
    Init,
    /// Stop at a code load.
    Load,
    /// The thread ended with this unhandled exception.
    Postmortem(Value),
}

/// What a hook wants done with the current event.
#[derive(Debug, Clone)]
pub enum HookAction {
    Pass,
    /// Freeze the thread silently until the sub-session ends.
    Park,
    /// Stop and report.
    Suspend(SuspendCause),
}

/// Handle of a subscribed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

/// Which events a hook wants.
#[derive(Debug, Clone)]
pub struct HookSpec {
    pub kinds: Vec<EventKind>,
    /// Restrict to one thread.
    pub thread: Option<ThreadId>,
    /// Urgent hooks run before all others for the same event.
    pub urgent: bool,
}

impl HookSpec {
    pub fn new(kinds: &[EventKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            thread: None,
            urgent: false,
        }
    }

    pub fn on_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    fn wants(&self, kind: EventKind, thread: ThreadId) -> bool {
        self.kinds.contains(&kind) && self.thread.map_or(true, |t| t == thread)
    }
}

/// Everything a hook can look at.
pub struct HookContext<'a> {
    pub event: &'a ExecEvent,
    pub debuggee: &'a dyn Debuggee,
}

pub type HookFn = Arc<dyn Fn(&HookContext<'_>) -> HookAction + Send + Sync>;

/// Box a closure as a [`HookFn`].
pub fn hook<F>(f: F) -> HookFn
where
    F: Fn(&HookContext<'_>) -> HookAction + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Receives park and stop requests produced by hooks.
pub trait StopSink: Send + Sync {
    fn park(&self, ctx: &HookContext<'_>);
    fn stop(&self, ctx: &HookContext<'_>, cause: SuspendCause);
}

/// Subscribe/unsubscribe access to a runtime's execution events.
pub trait Instrumentation: Send + Sync {
    fn subscribe(&self, spec: HookSpec, hook: HookFn) -> HookId;
    /// Returns `false` when the hook was not subscribed.
    fn unsubscribe(&self, id: HookId) -> bool;
    fn attach(&self, sink: Weak<dyn StopSink>);
}

thread_local! {
    static SUPPRESSED: Cell<usize> = const { Cell::new(0) };
}

/// Run `f` with hook dispatch disabled on the current thread.
///
/// Used for guard conditions and watch expressions, which must not stop.
pub fn without_hooks<R>(f: impl FnOnce() -> R) -> R {
    struct Restore;
    impl Drop for Restore {
        fn drop(&mut self) {
            SUPPRESSED.with(|s| s.set(s.get().saturating_sub(1)));
        }
    }
    SUPPRESSED.with(|s| s.set(s.get() + 1));
    let _restore = Restore;
    f()
}

fn suppressed() -> bool {
    SUPPRESSED.with(|s| s.get() > 0)
}

struct Entry {
    id: HookId,
    spec: HookSpec,
    hook: HookFn,
}

/// Default [`Instrumentation`] implementation used by runtimes.
#[derive(Default)]
pub struct HookRegistry {
    next_id: AtomicU64,
    hooks: RwLock<Vec<Entry>>,
    sink: RwLock<Option<Weak<dyn StopSink>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read(&self.hooks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_live(&self, id: HookId) -> bool {
        read(&self.hooks).iter().any(|e| e.id == id)
    }

    /// Deliver `event` to every interested hook.
    ///
    /// Hooks run against a snapshot taken before the first one is called,
    /// urgent hooks first. A hook unsubscribed by an earlier hook is
    /// skipped. After a stop the remaining hooks are not consulted.
    pub fn dispatch(&self, event: &ExecEvent, debuggee: &dyn Debuggee) {
        if suppressed() {
            return;
        }
        let thread = std::thread::current().id();
        let mut snapshot: Vec<(HookId, bool, HookFn)> = read(&self.hooks)
            .iter()
            .filter(|e| e.spec.wants(event.kind, thread))
            .map(|e| (e.id, e.spec.urgent, Arc::clone(&e.hook)))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        snapshot.sort_by_key(|(_, urgent, _)| !*urgent);

        let sink = read(&self.sink).as_ref().and_then(Weak::upgrade);
        let ctx = HookContext { event, debuggee };
        for (id, _, hook) in snapshot {
            if !self.is_live(id) {
                continue;
            }
            match hook(&ctx) {
                HookAction::Pass => {}
                HookAction::Park => {
                    if let Some(sink) = &sink {
                        sink.park(&ctx);
                    }
                }
                HookAction::Suspend(cause) => {
                    if let Some(sink) = &sink {
                        sink.stop(&ctx, cause);
                    }
                    break;
                }
            }
        }
    }
}

impl Instrumentation for HookRegistry {
    fn subscribe(&self, spec: HookSpec, hook: HookFn) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write(&self.hooks).push(Entry { id, spec, hook });
        id
    }

    fn unsubscribe(&self, id: HookId) -> bool {
        let mut hooks = write(&self.hooks);
        let before = hooks.len();
        hooks.retain(|e| e.id != id);
        hooks.len() != before
    }

    fn attach(&self, sink: Weak<dyn StopSink>) {
        *write(&self.sink) = Some(sink);
    }
}
