//! Per-thread suspend/resume state machine.
//!
//! A [`ThreadClient`] runs on the debuggee thread it represents. When a hook
//! stops the thread, [`ThreadClient::suspend`] reports to the coordinator and
//! then blocks in a command loop until a command resumes execution. Nothing
//! returns to the instrumented program while the loop runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use regex::Regex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::breakpoint::{BreakArgs, Breakpoint, MethodOp};
use crate::context::EngineContext;
use crate::debuggee::Debuggee;
use crate::error::{EvalError, SessionError};
use crate::expr;
use crate::frame::{Frame, Location};
use crate::instrument::{hook, EventKind, ExecEvent, HookAction, HookId, HookSpec, SuspendCause};
use crate::listing::{self, ListingOptions, SourceRange};
use crate::recorder::Recorder;
use crate::render::Style;
use crate::session::protocol::{ProtocolAnswer, ProtocolQuery, VarScope};
use crate::session::{SessionEvent, StopInfo};
use crate::stepping::{StepKind, StepPlan};
use crate::sync::lock;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Running,
    /// Blocked on the command queue.
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMove {
    Up,
    Down,
    Set(usize),
}

#[derive(Debug, Clone)]
pub enum InfoKind {
    /// Locals followed by instance variables.
    Default,
    Locals,
    Ivars(Option<String>),
    Globals,
}

#[derive(Debug, Clone)]
pub enum ShowTarget {
    Backtrace {
        max: Option<usize>,
        pattern: Option<Regex>,
    },
    List(SourceRange),
    Whereami,
    Info {
        kind: InfoKind,
        pattern: Option<Regex>,
    },
    Outline(Option<String>),
}

#[derive(Debug, Clone)]
pub enum EvalKind {
    P(String),
    Pp { src: String, width: usize },
    /// Evaluate without printing.
    Call(String),
    Display(Vec<(usize, String)>),
    /// Like `Display`, reporting failures instead of printing them.
    TryDisplay(Vec<(usize, String)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    On,
    Off,
    Status,
}

/// Commands a stopped thread executes.
#[derive(Debug)]
pub enum ThreadCommand {
    Continue,
    Step { kind: StepKind, count: usize },
    StepBack(usize),
    StepForward(usize),
    StepReset,
    Eval(EvalKind),
    Frame(FrameMove),
    Show(ShowTarget),
    MethodBreakpoint {
        receiver: String,
        op: MethodOp,
        name: String,
        args: BreakArgs,
    },
    WatchBreakpoint {
        ivar: String,
        args: BreakArgs,
    },
    TraceObject {
        expr: String,
        pattern: Option<Regex>,
        into: Option<PathBuf>,
    },
    Record(RecordOp),
    Protocol {
        id: u64,
        query: ProtocolQuery,
    },
    Quit(i32),
}

impl ThreadCommand {
    fn name(&self) -> &'static str {
        match self {
            ThreadCommand::Continue => "continue",
            ThreadCommand::Step { kind, .. } => kind.name(),
            ThreadCommand::StepBack(_) => "step back",
            ThreadCommand::StepForward(_) => "step forward",
            ThreadCommand::StepReset => "step reset",
            ThreadCommand::Eval(_) => "eval",
            ThreadCommand::Frame(_) => "frame",
            ThreadCommand::Show(_) => "show",
            ThreadCommand::MethodBreakpoint { .. } => "method breakpoint",
            ThreadCommand::WatchBreakpoint { .. } => "watch breakpoint",
            ThreadCommand::TraceObject { .. } => "trace object",
            ThreadCommand::Record(_) => "record",
            ThreadCommand::Protocol { .. } => "protocol",
            ThreadCommand::Quit(_) => "quit",
        }
    }
}

/// What a thread reports back after a command that does not resume it.
#[derive(Debug)]
pub enum CommandResult {
    None,
    MethodBreakpoint(Result<Arc<Breakpoint>, SessionError>),
    WatchBreakpoint(Result<Arc<Breakpoint>, SessionError>),
    TraceObject {
        value: Result<Value, EvalError>,
        pattern: Option<Regex>,
        into: Option<PathBuf>,
    },
    TryDisplay {
        failed: Vec<usize>,
    },
    Protocol {
        id: u64,
        answer: ProtocolAnswer,
    },
}

enum Flow {
    Wait,
    Resume,
}

#[derive(Default)]
struct ClientState {
    frames: Vec<Frame>,
    cursor: usize,
    output: Vec<String>,
    recorder: Recorder,
    step: Option<HookId>,
    /// Frames captured at the most recent raise.
    postmortem: Option<Vec<Frame>>,
}

pub struct ThreadClient {
    id: usize,
    name: String,
    os_id: ThreadId,
    management: bool,
    ctx: Weak<EngineContext>,
    mode: AtomicU8,
    /// A suspend event is queued and not yet taken by the coordinator.
    stop_pending: AtomicBool,
    tx: UnboundedSender<ThreadCommand>,
    rx: Mutex<UnboundedReceiver<ThreadCommand>>,
    state: Mutex<ClientState>,
}

impl std::fmt::Debug for ThreadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadClient")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

impl ThreadClient {
    pub(crate) fn new(
        id: usize,
        name: String,
        os_id: ThreadId,
        management: bool,
        ctx: Weak<EngineContext>,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            id,
            name,
            os_id,
            management,
            ctx,
            mode: AtomicU8::new(Mode::Running as u8),
            stop_pending: AtomicBool::new(false),
            tx,
            rx: Mutex::new(rx),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn os_id(&self) -> ThreadId {
        self.os_id
    }

    /// Engine-owned threads are never debugged.
    pub fn is_management(&self) -> bool {
        self.management
    }

    pub fn mode(&self) -> Mode {
        if self.mode.load(Ordering::SeqCst) == Mode::Waiting as u8 {
            Mode::Waiting
        } else {
            Mode::Running
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.mode() == Mode::Waiting
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_stop_pending(&self) -> bool {
        self.stop_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_stop_pending(&self) {
        self.stop_pending.store(false, Ordering::SeqCst);
    }

    /// Queue a command. Returns `false` when the thread is gone.
    pub(crate) fn send(&self, cmd: ThreadCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn stop_pending_for_tests(&self) {
        self.stop_pending.store(true, Ordering::SeqCst);
    }

    /// Drain the command queue, counting what was queued.
    #[cfg(test)]
    pub(crate) fn pending_commands(&self) -> usize {
        let mut rx = lock(&self.rx);
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    /// Location of the selected frame while stopped.
    pub fn location(&self) -> Option<Location> {
        let st = lock(&self.state);
        st.frames.get(st.cursor).map(|f| f.location.clone())
    }

    pub fn is_replaying(&self) -> bool {
        lock(&self.state).recorder.is_replaying()
    }

    pub(crate) fn remember_raise(&self, frames: Vec<Frame>) {
        lock(&self.state).postmortem = Some(frames);
    }

    fn out(&self, line: impl Into<String>) {
        lock(&self.state).output.push(line.into());
    }

    fn out_all(&self, lines: Vec<String>) {
        lock(&self.state).output.extend(lines);
    }

    fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut lock(&self.state).output)
    }

    /// Selected frame, cloned so no lock is held while the debuggee runs.
    fn current_frame(&self) -> Option<Frame> {
        let st = lock(&self.state);
        st.frames.get(st.cursor).cloned()
    }

    fn reply(&self, ctx: &EngineContext, result: CommandResult) {
        let output = self.take_output();
        self.set_mode(Mode::Waiting);
        ctx.emit(SessionEvent::Result {
            thread: self.id,
            result,
            output,
        });
    }

    /// Stop this thread and report it.
    ///
    /// Frames of an enclosing stop are restored when the nested stop ends.
    pub(crate) fn suspend(&self, dbg: &dyn Debuggee, ev: &ExecEvent, cause: SuspendCause) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        self.cancel_step(&ctx);
        let mut frames = match &cause {
            SuspendCause::Postmortem(_) => lock(&self.state)
                .postmortem
                .take()
                .unwrap_or_else(|| dbg.capture_frames()),
            _ => dbg.capture_frames(),
        };
        if let Some(top) = frames.first_mut() {
            if ev.kind.is_return() {
                top.return_value = ev.return_value.clone();
            }
            if ev.kind == EventKind::Raise {
                top.raised = ev.exception.clone();
            }
            if let SuspendCause::Postmortem(exc) = &cause {
                top.raised = Some(exc.clone());
            }
        }
        let location = frames
            .first()
            .map(|f| f.location.clone())
            .unwrap_or_else(|| ev.location.clone());
        let saved = self.swap_frames(frames);

        match &cause {
            SuspendCause::Breakpoint(bp) => {
                self.out(format!("Stop by #{}  {}", bp.number().unwrap_or(0), bp.label()));
            }
            SuspendCause::Postmortem(exc) => {
                let msg = exc
                    .as_object()
                    .and_then(|o| o.ivar("@message"))
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                self.out(format!("Enter postmortem mode with {}: {msg}", exc.class_name()));
            }
            _ => {}
        }
        let quiet = matches!(&cause, SuspendCause::Breakpoint(bp) if !bp.command().run.is_empty());
        if !quiet {
            self.show_stop(&ctx);
        }
        tracing::debug!(thread = self.id, "suspended at {}", location);

        self.stop_pending.store(true, Ordering::SeqCst);
        let output = self.take_output();
        self.set_mode(Mode::Waiting);
        ctx.emit(SessionEvent::Suspend {
            thread: self.id,
            stop: StopInfo {
                cause,
                event: ev.kind,
                location,
                output,
                replay: false,
            },
        });
        self.wait_next_action(&ctx, dbg);
        self.restore_frames(saved);
        self.set_mode(Mode::Running);
    }

    /// Freeze this thread silently until the sub-session ends.
    pub(crate) fn park(&self, dbg: &dyn Debuggee) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let saved = self.swap_frames(dbg.capture_frames());
        {
            let freeze = ctx.freeze_state();
            if !freeze.frozen {
                drop(freeze);
                self.restore_frames(saved);
                return;
            }
            self.set_mode(Mode::Waiting);
        }
        tracing::debug!(thread = self.id, "parked");
        self.wait_next_action(&ctx, dbg);
        self.restore_frames(saved);
        self.set_mode(Mode::Running);
    }

    fn swap_frames(&self, frames: Vec<Frame>) -> (Vec<Frame>, usize) {
        let mut st = lock(&self.state);
        let cursor = std::mem::replace(&mut st.cursor, 0);
        (std::mem::replace(&mut st.frames, frames), cursor)
    }

    fn restore_frames(&self, (frames, cursor): (Vec<Frame>, usize)) {
        let mut st = lock(&self.state);
        st.frames = frames;
        st.cursor = cursor;
    }

    /// Pop commands until one resumes the thread.
    fn wait_next_action(&self, ctx: &Arc<EngineContext>, dbg: &dyn Debuggee) {
        loop {
            let cmd = lock(&self.rx).blocking_recv();
            let Some(cmd) = cmd else {
                tracing::debug!(thread = self.id, "command queue closed");
                return;
            };
            self.set_mode(Mode::Running);
            tracing::debug!(thread = self.id, "command {}", cmd.name());
            match self.dispatch(ctx, dbg, cmd) {
                Flow::Wait => {}
                Flow::Resume => return,
            }
        }
    }

    fn dispatch(&self, ctx: &Arc<EngineContext>, dbg: &dyn Debuggee, cmd: ThreadCommand) -> Flow {
        match cmd {
            ThreadCommand::Continue => {
                lock(&self.state).recorder.step_reset();
                return Flow::Resume;
            }
            ThreadCommand::Step { kind, count } => {
                let Some(frame) = self.current_frame() else {
                    return Flow::Resume;
                };
                self.install_step(ctx, StepPlan::new(kind, count, &frame));
                return Flow::Resume;
            }
            ThreadCommand::StepBack(n) => return self.replay(ctx, |rec, live| {
                if !rec.can_step_back() {
                    return false;
                }
                rec.step_back(n, live);
                true
            }),
            ThreadCommand::StepForward(n) => return self.replay(ctx, |rec, _| {
                if !rec.is_replaying() {
                    return false;
                }
                rec.step_forward(n);
                true
            }),
            ThreadCommand::StepReset => return self.replay(ctx, |rec, _| {
                rec.step_reset();
                true
            }),
            ThreadCommand::Eval(kind) => {
                let result = self.eval(dbg, kind);
                self.reply(ctx, result);
            }
            ThreadCommand::Frame(mv) => {
                self.move_frame(ctx, mv);
                self.reply(ctx, CommandResult::None);
            }
            ThreadCommand::Show(target) => {
                self.show(ctx, dbg, target);
                self.reply(ctx, CommandResult::None);
            }
            ThreadCommand::MethodBreakpoint {
                receiver,
                op,
                name,
                args,
            } => {
                let result = self.method_breakpoint(ctx, dbg, &receiver, op, &name, args);
                self.reply(ctx, CommandResult::MethodBreakpoint(result));
            }
            ThreadCommand::WatchBreakpoint { ivar, args } => {
                let result = self.watch_breakpoint(&ivar, args);
                self.reply(ctx, CommandResult::WatchBreakpoint(result));
            }
            ThreadCommand::TraceObject {
                expr,
                pattern,
                into,
            } => {
                let frame = self.current_frame();
                let value = dbg.evaluate(frame.as_ref(), &expr);
                self.reply(
                    ctx,
                    CommandResult::TraceObject {
                        value,
                        pattern,
                        into,
                    },
                );
            }
            ThreadCommand::Record(op) => {
                self.record_command(ctx, op);
                self.reply(ctx, CommandResult::None);
            }
            ThreadCommand::Protocol { id, query } => {
                let answer = self.answer(dbg, query);
                self.reply(ctx, CommandResult::Protocol { id, answer });
            }
            ThreadCommand::Quit(code) => {
                self.cancel_step(ctx);
                self.stop_recording(ctx);
                ctx.exit(code);
                return Flow::Resume;
            }
        }
        Flow::Wait
    }

    // --- stepping ---------------------------------------------------------

    fn install_step(&self, ctx: &Arc<EngineContext>, plan: StepPlan) {
        self.cancel_step(ctx);
        let sid = ctx.subsession_id();
        let kinds = plan.kinds();
        let plan = Mutex::new(plan);
        let weak = Arc::downgrade(ctx);
        let id = ctx.instrumentation().subscribe(
            HookSpec::new(kinds).on_thread(self.os_id),
            hook(move |h| {
                let Some(ctx) = weak.upgrade() else {
                    return HookAction::Pass;
                };
                let ev = h.event;
                let Some(tc) = ctx.current_client(h.debuggee) else {
                    return HookAction::Pass;
                };
                if ctx.stop_stepping(&ev.location.path, ev.location.line, sid) {
                    tc.cancel_step(&ctx);
                    return HookAction::Pass;
                }
                let mut plan = lock(&plan);
                if !plan.accepts(ev) || skip_location(&ctx, &ev.location.path) {
                    return HookAction::Pass;
                }
                if plan.count_down() {
                    drop(plan);
                    tc.cancel_step(&ctx);
                    return HookAction::Suspend(SuspendCause::Step);
                }
                HookAction::Pass
            }),
        );
        lock(&self.state).step = Some(id);
    }

    fn cancel_step(&self, ctx: &EngineContext) {
        if let Some(id) = lock(&self.state).step.take() {
            ctx.instrumentation().unsubscribe(id);
        }
    }

    // --- record and replay ------------------------------------------------

    fn replay<F>(&self, ctx: &Arc<EngineContext>, mv: F) -> Flow
    where
        F: FnOnce(&mut Recorder, &[Frame]) -> bool,
    {
        let moved = {
            let mut st = lock(&self.state);
            let live = st.frames.clone();
            let st = &mut *st;
            if mv(&mut st.recorder, &live) {
                match st.recorder.current() {
                    Some(frames) => {
                        st.frames = frames;
                        st.cursor = 0;
                        true
                    }
                    None => false,
                }
            } else {
                false
            }
        };
        if !moved {
            self.out("Can not step back more.");
            self.reply(ctx, CommandResult::None);
            return Flow::Wait;
        }
        self.show_stop(ctx);
        let location = self.location().unwrap_or_else(|| Location::new("", 0, ""));
        let output = self.take_output();
        self.set_mode(Mode::Waiting);
        ctx.emit(SessionEvent::Suspend {
            thread: self.id,
            stop: StopInfo {
                cause: SuspendCause::Step,
                event: EventKind::Line,
                location,
                output,
                replay: true,
            },
        });
        Flow::Wait
    }

    fn record_command(&self, ctx: &Arc<EngineContext>, op: RecordOp) {
        match op {
            RecordOp::On => {
                if !lock(&self.state).recorder.is_recording() {
                    let weak = Arc::downgrade(ctx);
                    let id = ctx.instrumentation().subscribe(
                        HookSpec::new(&[EventKind::Line]).on_thread(self.os_id),
                        hook(move |h| {
                            if let Some(tc) = weak.upgrade().and_then(|ctx| ctx.current_client(h.debuggee)) {
                                let frames = h.debuggee.capture_frames().iter().map(Frame::snapshot).collect();
                                lock(&tc.state).recorder.record(frames);
                            }
                            HookAction::Pass
                        }),
                    );
                    lock(&self.state).recorder.hook = Some(id);
                }
                self.out(format!("Recorder for #{} is started", self.id));
            }
            RecordOp::Off => {
                self.stop_recording(ctx);
                self.out(format!("Recorder for #{} is stopped", self.id));
            }
            RecordOp::Status => {
                let st = lock(&self.state);
                let line = if st.recorder.is_recording() {
                    format!("Recorder for #{}: on ({} records)", self.id, st.recorder.len())
                } else {
                    format!("Recorder for #{}: off", self.id)
                };
                drop(st);
                self.out(line);
            }
        }
    }

    fn stop_recording(&self, ctx: &EngineContext) {
        let id = {
            let mut st = lock(&self.state);
            st.recorder.clear();
            st.recorder.hook.take()
        };
        if let Some(id) = id {
            ctx.instrumentation().unsubscribe(id);
        }
    }

    // --- output -----------------------------------------------------------

    fn listing_options(ctx: &EngineContext) -> (ListingOptions, usize) {
        let ui = ctx.ui_config();
        (
            ListingOptions {
                max_lines: ui.show_src_lines,
                no_lineno: ui.no_lineno,
            },
            ui.show_frames,
        )
    }

    fn show_source(&self, ctx: &EngineContext, range: SourceRange) {
        let (opts, _) = Self::listing_options(ctx);
        let Some(frame) = self.current_frame() else {
            self.out("No frames");
            return;
        };
        let Some(src) = ctx.sources().lines(frame.path()) else {
            self.out(format!("# No sourcefile available for {}", frame.path()));
            return;
        };
        let renderer = ctx.renderer();
        let (lines, shown) = listing::source_window(&src, &frame, range, opts, renderer.as_ref());
        self.out_all(lines);
        let mut st = lock(&self.state);
        let cursor = st.cursor;
        if let Some(f) = st.frames.get_mut(cursor) {
            f.show_line = shown;
        }
    }

    fn show_frames(&self, ctx: &EngineContext) {
        let (_, max) = Self::listing_options(ctx);
        let renderer = ctx.renderer();
        let st = lock(&self.state);
        let lines = listing::frames_summary(&st.frames, st.cursor, max, renderer.as_ref());
        drop(st);
        self.out_all(lines);
    }

    fn show_stop(&self, ctx: &EngineContext) {
        self.show_source(ctx, SourceRange::Around);
        self.show_frames(ctx);
    }

    fn move_frame(&self, ctx: &EngineContext, mv: FrameMove) {
        let moved = {
            let mut st = lock(&self.state);
            let last = st.frames.len().saturating_sub(1);
            let target = match mv {
                FrameMove::Up => st.cursor + 1,
                FrameMove::Down => st.cursor.wrapping_sub(1),
                FrameMove::Set(n) => n,
            };
            if target <= last && !st.frames.is_empty() {
                st.cursor = target;
                Ok(())
            } else {
                Err(match mv {
                    FrameMove::Up => "Not found upper frame".to_string(),
                    FrameMove::Down => "Not found lower frame".to_string(),
                    FrameMove::Set(n) => format!("out of frame index: {n}"),
                })
            }
        };
        match moved {
            Ok(()) => {
                self.show_source(ctx, SourceRange::Around);
                let renderer = ctx.renderer();
                let st = lock(&self.state);
                let line = st
                    .frames
                    .get(st.cursor)
                    .map(|f| listing::frame_line(f, st.cursor, true, renderer.as_ref()));
                drop(st);
                if let Some(line) = line {
                    self.out(line);
                }
            }
            Err(msg) => self.out(msg),
        }
    }

    fn show(&self, ctx: &EngineContext, dbg: &dyn Debuggee, target: ShowTarget) {
        let renderer = ctx.renderer();
        match target {
            ShowTarget::Backtrace { max, pattern } => {
                let st = lock(&self.state);
                let lines =
                    listing::backtrace(&st.frames, st.cursor, max, pattern.as_ref(), renderer.as_ref());
                drop(st);
                self.out_all(lines);
            }
            ShowTarget::List(range) => self.show_source(ctx, range),
            ShowTarget::Whereami => {
                self.show_source(ctx, SourceRange::Around);
                self.show_frames(ctx);
            }
            ShowTarget::Info { kind, pattern } => {
                let Some(frame) = self.current_frame() else {
                    self.out("No frames");
                    return;
                };
                let pattern = pattern.as_ref();
                match kind {
                    InfoKind::Default => {
                        self.out_all(listing::variables(&frame_locals(&frame), pattern));
                        self.out_all(listing::variables(&ivars_of(&frame.receiver), pattern));
                    }
                    InfoKind::Locals => self.out_all(listing::variables(&frame_locals(&frame), pattern)),
                    InfoKind::Ivars(expr) => {
                        let target = match expr {
                            Some(src) => match dbg.evaluate(Some(&frame), &src) {
                                Ok(v) => v,
                                Err(e) => {
                                    self.out(renderer.paint(&format!("[REPL ERROR] {e}"), Style::Error));
                                    return;
                                }
                            },
                            None => frame.receiver.clone(),
                        };
                        self.out_all(listing::variables(&ivars_of(&target), pattern));
                    }
                    InfoKind::Globals => self.out_all(listing::variables(&dbg.globals(), pattern)),
                }
            }
            ShowTarget::Outline(expr) => {
                let frame = self.current_frame();
                let target = match &expr {
                    Some(src) => match dbg.evaluate(frame.as_ref(), src) {
                        Ok(v) => v,
                        Err(e) => {
                            self.out(renderer.paint(&format!("[REPL ERROR] {e}"), Style::Error));
                            return;
                        }
                    },
                    None => frame.as_ref().map(|f| f.receiver.clone()).unwrap_or(Value::Nil),
                };
                if expr.is_none() {
                    self.out_all(listing::name_list("constants", &dbg.constants()).into_iter().collect());
                }
                for (title, names) in dbg.methods_of(&target) {
                    self.out_all(listing::name_list(&title, &names).into_iter().collect());
                }
                let ivars: Vec<String> = ivars_of(&target).into_iter().map(|(k, _)| k).collect();
                self.out_all(listing::name_list("instance variables", &ivars).into_iter().collect());
                if expr.is_none() {
                    let locals: Vec<String> = frame
                        .map(|f| f.local_variables().into_iter().map(|(k, _)| k).collect())
                        .unwrap_or_default();
                    self.out_all(listing::name_list("locals", &locals).into_iter().collect());
                }
            }
        }
    }

    // --- evaluation -------------------------------------------------------

    fn eval(&self, dbg: &dyn Debuggee, kind: EvalKind) -> CommandResult {
        let frame = self.current_frame();
        let frame = frame.as_ref();
        let error = |e: EvalError| format!("[REPL ERROR] {e}");
        match kind {
            EvalKind::P(src) => match dbg.evaluate(frame, &src) {
                Ok(v) => self.out(format!("=> {}", v.inspect())),
                Err(e) => self.out(error(e)),
            },
            EvalKind::Pp { src, width } => match dbg.evaluate(frame, &src) {
                Ok(v) => {
                    let text = v.pretty(width.saturating_sub(3));
                    let mut lines = text.lines();
                    if let Some(first) = lines.next() {
                        self.out(format!("=> {first}"));
                    }
                    self.out_all(lines.map(|l| format!("   {l}")).collect());
                }
                Err(e) => self.out(error(e)),
            },
            EvalKind::Call(src) => {
                if let Err(e) = dbg.evaluate(frame, &src) {
                    self.out(error(e));
                }
            }
            EvalKind::Display(entries) => {
                for (n, src) in entries {
                    match dbg.evaluate(frame, &src) {
                        Ok(v) => self.out(format!("{n}: {src} = {}", v.inspect())),
                        Err(e) => self.out(format!("{n}: {src} = {}", error(e))),
                    }
                }
            }
            EvalKind::TryDisplay(entries) => {
                let mut failed = Vec::new();
                for (n, src) in entries {
                    match dbg.evaluate(frame, &src) {
                        Ok(v) => self.out(format!("{n}: {src} = {}", v.inspect())),
                        Err(_) => failed.push(n),
                    }
                }
                return CommandResult::TryDisplay { failed };
            }
        }
        CommandResult::None
    }

    fn method_breakpoint(
        &self,
        ctx: &Arc<EngineContext>,
        dbg: &dyn Debuggee,
        receiver: &str,
        op: MethodOp,
        name: &str,
        args: BreakArgs,
    ) -> Result<Arc<Breakpoint>, SessionError> {
        let constant = receiver.chars().next().is_some_and(char::is_uppercase);
        let (class, op) = if constant {
            (receiver.to_string(), op)
        } else {
            let frame = self.current_frame();
            match dbg.evaluate(frame.as_ref(), receiver)? {
                Value::Class(c) => (c, MethodOp::Singleton),
                other => (other.class_name(), MethodOp::Instance),
            }
        };
        let bp = Arc::new(
            Breakpoint::method(class, op, name)
                .with_cond(args.cond)
                .with_command(args.command)
                .with_path(args.path),
        );
        bp.resolve(ctx, dbg)?;
        Ok(bp)
    }

    fn watch_breakpoint(&self, ivar: &str, args: BreakArgs) -> Result<Arc<Breakpoint>, SessionError> {
        if !ivar.starts_with('@') {
            return Err(SessionError::Usage(format!("watch needs an instance variable, got {ivar}")));
        }
        let frame = self.current_frame().ok_or(EvalError::NoFrame)?;
        let Some(obj) = frame.receiver.as_object() else {
            return Err(SessionError::Usage(format!(
                "{} has no instance variables",
                frame.receiver.inspect()
            )));
        };
        let current = obj.ivar(ivar).unwrap_or(Value::Nil);
        Ok(Arc::new(
            Breakpoint::watch(ivar, frame.receiver.clone(), current)
                .with_cond(args.cond)
                .with_command(args.command)
                .with_path(args.path),
        ))
    }

    // --- protocol queries ---------------------------------------------------

    fn answer(&self, dbg: &dyn Debuggee, query: ProtocolQuery) -> ProtocolAnswer {
        let frames = lock(&self.state).frames.clone();
        match query {
            ProtocolQuery::StackTrace => {
                ProtocolAnswer::StackTrace(frames.iter().map(|f| f.location.clone()).collect())
            }
            ProtocolQuery::Variables(VarScope::Locals { frame }) => ProtocolAnswer::Variables(
                frames.get(frame).map(frame_locals).unwrap_or_default(),
            ),
            ProtocolQuery::Variables(VarScope::Globals) => ProtocolAnswer::Variables(dbg.globals()),
            ProtocolQuery::Evaluate { frame, expression } => {
                let frame = frame.and_then(|i| frames.get(i)).or(frames.first());
                ProtocolAnswer::Evaluate(dbg.evaluate(frame, &expression).map_err(|e| e.to_string()))
            }
            ProtocolQuery::Completions { frame, text } => {
                let prefix = expr::completion_prefix(&text);
                let frame = frame.and_then(|i| frames.get(i)).or(frames.first());
                let mut names: Vec<String> = Vec::new();
                if let Some(f) = frame {
                    names.extend(f.local_variables().into_iter().map(|(k, _)| k));
                    names.extend(ivars_of(&f.receiver).into_iter().map(|(k, _)| k));
                    for (_, methods) in dbg.methods_of(&f.receiver) {
                        names.extend(methods);
                    }
                }
                names.extend(dbg.globals().into_iter().map(|(k, _)| k));
                names.extend(dbg.constants());
                names.retain(|n| n.starts_with(prefix));
                names.sort();
                names.dedup();
                ProtocolAnswer::Completions(names)
            }
        }
    }
}

/// Pseudo-variables followed by the frame's locals.
fn frame_locals(frame: &Frame) -> Vec<(String, Value)> {
    let mut out = vec![("%self".to_string(), frame.receiver.clone())];
    if let Some(v) = &frame.return_value {
        out.push(("%return".to_string(), v.clone()));
    }
    if let Some(e) = &frame.raised {
        out.push(("%raised".to_string(), e.clone()));
    }
    out.extend(frame.local_variables());
    out
}

fn ivars_of(value: &Value) -> Vec<(String, Value)> {
    value.as_object().map(|o| o.ivars()).unwrap_or_default()
}

/// Locations a step never stops at.
fn skip_location(ctx: &EngineContext, path: &str) -> bool {
    ctx.is_internal(path) || ctx.skips_path(path) || (ctx.skip_nosrc() && !ctx.sources().has_source(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, Scope};
    use crate::value::Object;
    use std::collections::BTreeMap;

    #[test]
    fn frame_locals_lead_with_pseudo_variables() {
        let mut locals = BTreeMap::new();
        locals.insert("a".to_string(), Value::Int(1));
        let mut frame = Frame::new(Location::new("a.rb", 3, "m"), FrameKind::Method, Value::Nil, 1)
            .with_scope(Arc::new(Scope::detached(locals)));
        frame.return_value = Some(Value::Int(9));
        let names: Vec<String> = frame_locals(&frame).into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["%self", "%return", "a"]);
    }

    #[test]
    fn ivars_of_non_objects_are_empty() {
        assert!(ivars_of(&Value::Int(1)).is_empty());
        let obj = Object::new("Point");
        obj.set_ivar("@x", Value::Int(1));
        assert_eq!(ivars_of(&Value::Object(obj)).len(), 1);
    }

    #[test]
    fn mode_round_trips_through_the_atomic() {
        let tc = ThreadClient::new(1, "main".into(), std::thread::current().id(), false, Weak::new());
        assert_eq!(tc.mode(), Mode::Running);
        tc.set_mode(Mode::Waiting);
        assert!(tc.is_waiting());
        assert!(tc.send(ThreadCommand::Continue));
        assert!(tc.location().is_none());
    }
}
