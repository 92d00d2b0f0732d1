//! The coordinator.
//!
//! One [`Session`] runs per engine on its own thread. It is the only reader
//! of operator input and the only writer of the breakpoint registry and the
//! thread map. Thread clients report to it through [`SessionEvent`]s; it
//! answers by sending [`ThreadCommand`]s to the client in control.

pub mod command;
mod handlers;
pub mod protocol;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::breakpoint::{path_matches, Breakpoint, BreakpointKind};
use crate::context::{EngineContext, EngineHandle};
use crate::error::{EngineError, SessionError, TransportError};
use crate::frame::Location;
use crate::instrument::{EventKind, SuspendCause};
use crate::render::PlainRenderer;
use crate::source::{CodeUnit, LoadKind};
use crate::stepping::StepKind;
use crate::thread_client::{CommandResult, EvalKind, ThreadClient, ThreadCommand};
use crate::tracer::{Tracer, TracerKind};
use crate::transport::{EngineEvent, Input, StopReason, Transport, TransportFactory};

use self::protocol::{
    BreakpointInfo, FrameInfo, IdTable, ProtocolAnswer, ProtocolQuery, ProtocolReply,
    ProtocolRequest, ScopeInfo, VarRef, VarScope,
};

/// A stop as reported by a thread client.
#[derive(Debug)]
pub struct StopInfo {
    pub cause: SuspendCause,
    pub event: EventKind,
    pub location: Location,
    /// Lines the client produced while stopping.
    pub output: Vec<String>,
    /// A replayed position rather than a live stop.
    pub replay: bool,
}

/// Messages to the coordinator.
#[derive(Debug)]
pub enum SessionEvent {
    /// A thread was registered with the context.
    ThreadBegin {
        id: usize,
        name: String,
    },
    ThreadEnd {
        id: usize,
    },
    /// A code unit was compiled. The loading thread waits for `reply`.
    Load {
        unit: Arc<CodeUnit>,
        source: Option<Arc<str>>,
        reply: oneshot::Sender<()>,
    },
    /// Tracer output.
    Trace(String),
    Suspend {
        thread: usize,
        stop: StopInfo,
    },
    /// A stopped thread finished a command without resuming.
    Result {
        thread: usize,
        result: CommandResult,
        output: Vec<String>,
    },
    /// A protocol request submitted while the program runs.
    Request {
        id: u64,
        request: ProtocolRequest,
    },
    Pause,
    Shutdown,
}

/// What the command loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    /// Prompt again.
    Retry,
    /// A thread has the next move.
    Done,
    /// End the session.
    Exit,
}

/// A queued command line.
#[derive(Debug, Clone)]
struct Preset {
    line: String,
    /// From a breakpoint's `pre:` or `do:` list.
    restricted: bool,
}

pub struct Session {
    ctx: Arc<EngineContext>,
    rx: UnboundedReceiver<SessionEvent>,
    transport: Box<dyn Transport>,
    factory: Option<Box<dyn TransportFactory>>,
    /// The thread in control.
    tc: Option<Arc<ThreadClient>>,
    depth: usize,
    presets: VecDeque<Preset>,
    auto_continue: bool,
    displays: Vec<String>,
    tracers: Vec<Arc<Tracer>>,
    next_tracer: usize,
    last_command: Option<String>,
    ids: IdTable,
    postmortem: bool,
    /// Stops of other threads held until the current sub-session ends.
    deferred: VecDeque<SessionEvent>,
    exit: bool,
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        text.push_str(": ");
        text.push_str(&e.to_string());
        source = e.source();
    }
    text
}

fn stop_reason(cause: &SuspendCause) -> StopReason {
    match cause {
        SuspendCause::Breakpoint(bp) => match bp.kind() {
            BreakpointKind::Catch { .. } => StopReason::Exception,
            _ => StopReason::Breakpoint,
        },
        SuspendCause::Step => StopReason::Step,
        SuspendCause::Pause => StopReason::Pause,
        SuspendCause::Init => StopReason::Entry,
        SuspendCause::Load => StopReason::Load,
        SuspendCause::Postmortem(_) => StopReason::Postmortem,
    }
}

impl Session {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        rx: UnboundedReceiver<SessionEvent>,
        transport: Box<dyn Transport>,
        factory: Option<Box<dyn TransportFactory>>,
        presets: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            rx,
            transport,
            factory,
            tc: None,
            depth: 0,
            presets: presets
                .into_iter()
                .map(|line| Preset {
                    line,
                    restricted: false,
                })
                .collect(),
            auto_continue: false,
            displays: Vec::new(),
            tracers: Vec::new(),
            next_tracer: 1,
            last_command: None,
            ids: IdTable::new(),
            postmortem: false,
            deferred: VecDeque::new(),
            exit: false,
        }
    }

    /// Process events until shutdown or `quit`.
    pub fn run(mut self) -> Result<(), EngineError> {
        self.sync_renderer();
        let result = self.event_loop();
        if let Err(e) = &result {
            tracing::error!("coordinator failed: {}", error_chain(e));
        }
        for tracer in &self.tracers {
            tracer.disable(&self.ctx);
        }
        self.ctx.deactivate();
        if self.depth > 0 {
            self.ctx.process_group().leave();
        }
        self.transport.event(EngineEvent::Terminated);
        tracing::info!("session ended");
        result
    }

    fn event_loop(&mut self) -> Result<(), EngineError> {
        while !self.exit {
            let Some(event) = self.next_event() else {
                break;
            };
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn next_event(&mut self) -> Option<SessionEvent> {
        if self.depth == 0 {
            if let Some(event) = self.deferred.pop_front() {
                return Some(event);
            }
        }
        self.rx.blocking_recv()
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<(), EngineError> {
        match event {
            SessionEvent::ThreadBegin { id, name } => {
                tracing::debug!(thread = id, %name, "thread client added");
            }
            SessionEvent::ThreadEnd { id } => {
                self.ctx.remove_client(id);
                tracing::debug!(thread = id, "thread client removed");
            }
            SessionEvent::Load {
                unit,
                source,
                reply,
            } => {
                self.handle_load(&unit, source.as_deref());
                let _ = reply.send(());
            }
            SessionEvent::Trace(text) => self.transport.puts(&text),
            SessionEvent::Suspend { thread, stop } => self.handle_suspend(thread, stop)?,
            SessionEvent::Result {
                thread,
                result,
                output,
            } => self.handle_result(thread, result, output)?,
            SessionEvent::Request { id, request } => {
                if self.depth == 0 {
                    self.process_running_request(id, request);
                } else {
                    self.transport.respond(id, Err("busy".to_string()));
                }
            }
            SessionEvent::Pause => {
                if self.depth == 0 {
                    self.ctx.arm_pause();
                }
            }
            SessionEvent::Shutdown => {
                if let Some(tc) = self.tc.take() {
                    self.ctx.release_control();
                    tc.send(ThreadCommand::Continue);
                }
                self.exit = true;
            }
        }
        Ok(())
    }

    fn handle_load(&mut self, unit: &Arc<CodeUnit>, source: Option<&str>) {
        let kind = self.ctx.sources().add(unit, source);
        if kind == LoadKind::Snippet {
            return;
        }
        if kind == LoadKind::Reload {
            let active = self.ctx.breakpoints().active_lines(unit.path());
            for bp in active {
                bp.reset_for_reload(&self.ctx);
            }
        }
        let pending = self.ctx.breakpoints().pending_lines(unit.path());
        for bp in pending {
            if let Err(e) = bp.activate(&self.ctx, unit) {
                if bp.report_failure_once() {
                    tracing::warn!("breakpoint {} not activated: {}", bp.key(), e);
                    self.transport.puts(&e.to_string());
                }
            }
        }
        tracing::info!("loaded {} ({:?})", unit.path(), kind);
        self.transport.event(EngineEvent::Loaded {
            path: unit.path().to_string(),
        });
    }

    // --- sub-sessions -------------------------------------------------------

    fn handle_suspend(&mut self, thread: usize, stop: StopInfo) -> Result<(), EngineError> {
        let Some(tc) = self.ctx.client(thread) else {
            tracing::warn!(thread, "suspend from an unknown thread");
            return Ok(());
        };
        if stop.replay {
            self.print(&stop.output);
            self.announce(&tc, &stop);
            return self.wait_command();
        }
        if self.depth > 0 && self.ctx.controlling() != Some(thread) {
            tracing::debug!(thread, "suspend deferred");
            self.deferred
                .push_back(SessionEvent::Suspend { thread, stop });
            return Ok(());
        }
        self.enter_subsession(tc.clone());
        if matches!(stop.cause, SuspendCause::Postmortem(_)) {
            self.postmortem = true;
        }
        self.print(&stop.output);
        self.announce(&tc, &stop);

        match &stop.cause {
            SuspendCause::Breakpoint(bp) => {
                let command = bp.command();
                for line in command.pre.iter().rev() {
                    self.presets.push_front(Preset {
                        line: line.clone(),
                        restricted: true,
                    });
                }
                if !command.run.is_empty() {
                    self.presets.extend(command.run.iter().map(|line| Preset {
                        line: line.clone(),
                        restricted: true,
                    }));
                    self.auto_continue = true;
                }
            }
            SuspendCause::Init if self.ctx.config().boot.nonstop => self.auto_continue = true,
            _ => {}
        }

        if !self.displays.is_empty() {
            let entries = self.display_entries();
            self.send(ThreadCommand::Eval(EvalKind::TryDisplay(entries)));
            return Ok(());
        }
        self.wait_command()
    }

    fn enter_subsession(&mut self, tc: Arc<ThreadClient>) {
        let sid = self.ctx.begin_subsession();
        if self.depth == 0 {
            self.ctx.process_group().enter();
            self.ctx.freeze(tc.id());
        } else {
            self.ctx.set_controlling(tc.id());
        }
        self.depth += 1;
        tc.clear_stop_pending();
        tracing::debug!(thread = tc.id(), depth = self.depth, sid, "enter sub-session");
        self.tc = Some(tc);
    }

    /// Resume the thread in control with `cmd`.
    pub(crate) fn leave_subsession(&mut self, cmd: ThreadCommand) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.ctx.unfreeze();
        }
        let thread = self.tc.as_ref().map(|tc| tc.id());
        if let Some(tc) = &self.tc {
            tc.send(cmd);
        }
        if self.depth == 0 {
            self.ctx.release_control();
            self.ctx.process_group().leave();
            self.tc = None;
            self.postmortem = false;
        }
        tracing::debug!(depth = self.depth, "leave sub-session");
        self.ids.clear();
        self.transport.event(EngineEvent::Resumed { thread });
    }

    /// Send a command that keeps the thread stopped.
    pub(crate) fn send(&mut self, cmd: ThreadCommand) {
        if let Some(tc) = &self.tc {
            tc.send(cmd);
        }
    }

    fn announce(&mut self, tc: &ThreadClient, stop: &StopInfo) {
        let (breakpoints, description) = match &stop.cause {
            SuspendCause::Breakpoint(bp) => (bp.number().into_iter().collect(), bp.label()),
            SuspendCause::Postmortem(exc) => (Vec::new(), format!("postmortem: {}", exc.inspect())),
            SuspendCause::Step => (Vec::new(), "step".to_string()),
            SuspendCause::Pause => (Vec::new(), "pause".to_string()),
            SuspendCause::Init => (Vec::new(), "entry".to_string()),
            SuspendCause::Load => (Vec::new(), format!("load {}", stop.location.path)),
        };
        self.transport.event(EngineEvent::Suspended {
            thread: tc.id(),
            reason: stop_reason(&stop.cause),
            location: stop.location.clone(),
            breakpoints,
            description,
        });
    }

    fn handle_result(
        &mut self,
        thread: usize,
        result: CommandResult,
        output: Vec<String>,
    ) -> Result<(), EngineError> {
        self.print(&output);
        match result {
            CommandResult::None => {}
            CommandResult::MethodBreakpoint(bp) | CommandResult::WatchBreakpoint(bp) => match bp {
                Ok(bp) => {
                    self.register_breakpoint(bp);
                }
                Err(e) => self.report(&e),
            },
            CommandResult::TraceObject {
                value,
                pattern,
                into,
            } => match value {
                Ok(value) => self.add_tracer(Tracer::new(TracerKind::Object(value), pattern, into)),
                Err(e) => self.report(&SessionError::Eval(e)),
            },
            CommandResult::TryDisplay { failed } => {
                for n in failed.into_iter().rev() {
                    if n < self.displays.len() {
                        let expr = self.displays.remove(n);
                        self.transport.puts(&format!("canceled: {expr}"));
                    }
                }
            }
            CommandResult::Protocol { id, answer } => self.process_protocol_result(thread, id, answer),
        }
        if self.exit {
            return Ok(());
        }
        self.wait_command()
    }

    // --- command loop ---------------------------------------------------------

    fn prompt(&self) -> &'static str {
        if self.postmortem {
            "(snag:postmortem) "
        } else if self.tc.as_ref().is_some_and(|tc| tc.is_replaying()) {
            "(snag:replay) "
        } else {
            "(snag) "
        }
    }

    /// Read commands until one hands control to a thread.
    fn wait_command(&mut self) -> Result<(), EngineError> {
        loop {
            let (line, restricted) = if let Some(preset) = self.presets.pop_front() {
                self.transport.puts(&format!("{}{}", self.prompt(), preset.line));
                (preset.line, preset.restricted)
            } else if self.auto_continue {
                self.auto_continue = false;
                ("continue".to_string(), false)
            } else {
                match self.transport.readline(self.prompt()) {
                    Ok(Input::Line(line)) => (line, false),
                    Ok(Input::Request { id, request }) => {
                        match self.process_protocol_request(id, request) {
                            Next::Retry => continue,
                            Next::Done => return Ok(()),
                            Next::Exit => {
                                self.exit = true;
                                return Ok(());
                            }
                        }
                    }
                    Err(TransportError::Interrupted) => continue,
                    Err(e) => return Err(EngineError::Transport(e)),
                }
            };
            match self.process_command(&line, restricted) {
                Next::Retry => continue,
                Next::Done => return Ok(()),
                Next::Exit => {
                    self.exit = true;
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn print(&mut self, lines: &[String]) {
        for line in lines {
            self.transport.puts(line);
        }
    }

    pub(crate) fn report(&mut self, err: &SessionError) {
        let text = match err {
            SessionError::Eval(e) => format!("[REPL ERROR] {e}"),
            other => other.to_string(),
        };
        self.transport.puts(&text);
    }

    pub(crate) fn sync_renderer(&mut self) {
        if self.ctx.ui_config().no_color {
            self.ctx.set_renderer(Arc::new(PlainRenderer));
        } else {
            self.ctx.set_renderer(self.transport.renderer());
        }
    }

    fn display_entries(&self) -> Vec<(usize, String)> {
        self.displays.iter().cloned().enumerate().collect()
    }

    pub(crate) fn handle(&self) -> EngineHandle {
        EngineHandle::new(Arc::clone(&self.ctx))
    }

    // --- breakpoints and tracers ----------------------------------------------

    /// Number and enable `bp`. Returns `None` when it is a duplicate.
    pub(crate) fn register_breakpoint(&mut self, bp: Arc<Breakpoint>) -> Option<Arc<Breakpoint>> {
        let added = self.ctx.breakpoints_mut().add(Arc::clone(&bp));
        match added {
            Ok(bp) => {
                bp.enable(&self.ctx);
                self.transport
                    .puts(&format!("#{}  {}", bp.number().unwrap_or(0), bp.label()));
                Some(bp)
            }
            Err(e) => {
                bp.delete(&self.ctx);
                self.report(&SessionError::Breakpoint(e));
                None
            }
        }
    }

    /// Add a line breakpoint, binding it at once when `path` is loaded.
    pub(crate) fn add_line_breakpoint(
        &mut self,
        bp: Breakpoint,
    ) -> Result<Option<Arc<Breakpoint>>, SessionError> {
        let BreakpointKind::Line { path, .. } = bp.kind() else {
            return Ok(None);
        };
        let roots: Vec<Arc<CodeUnit>> = self
            .ctx
            .sources()
            .paths()
            .into_iter()
            .filter(|p| path_matches(path, p))
            .flat_map(|p| self.ctx.sources().roots(&p))
            .collect();
        let Some(bp) = self.register_breakpoint(Arc::new(bp)) else {
            return Ok(None);
        };
        for root in roots {
            match bp.activate(&self.ctx, &root) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    if let Some(n) = bp.number() {
                        self.ctx.breakpoints_mut().remove(n);
                    }
                    bp.delete(&self.ctx);
                    return Err(e.into());
                }
            }
        }
        Ok(Some(bp))
    }

    pub(crate) fn delete_breakpoint(&mut self, number: usize) -> Option<Arc<Breakpoint>> {
        let bp = self.ctx.breakpoints_mut().remove(number)?;
        bp.delete(&self.ctx);
        Some(bp)
    }

    pub(crate) fn delete_all_breakpoints(&mut self) -> usize {
        let removed = self.ctx.breakpoints_mut().remove_all();
        for bp in &removed {
            bp.delete(&self.ctx);
        }
        removed.len()
    }

    pub(crate) fn add_tracer(&mut self, tracer: Tracer) {
        let tracer = Arc::new(tracer);
        tracer.set_number(self.next_tracer);
        self.next_tracer += 1;
        tracer.enable(&self.ctx);
        self.transport.puts(&format!("Enable {}", tracer.label()));
        self.tracers.push(tracer);
    }

    // --- protocol funnel --------------------------------------------------------

    fn breakpoint_info(bp: &Breakpoint) -> Option<BreakpointInfo> {
        let BreakpointKind::Line { path, line } = bp.kind() else {
            return None;
        };
        let resolved = bp.resolved();
        Some(BreakpointInfo {
            number: bp.number().unwrap_or(0),
            verified: resolved.is_some(),
            path: resolved.as_ref().map_or_else(|| path.clone(), |l| l.path.clone()),
            line: resolved.as_ref().map_or(*line, |l| l.line),
            message: bp.is_pending().then(|| "pending".to_string()),
        })
    }

    /// Requests that never need a stopped thread.
    fn process_breakpoint_request(&mut self, request: ProtocolRequest) -> Result<ProtocolReply, String> {
        match request {
            ProtocolRequest::SetBreakpoints { path, lines } => {
                let existing: Vec<usize> = self
                    .ctx
                    .breakpoints()
                    .iter()
                    .filter(|bp| matches!(bp.kind(), BreakpointKind::Line { path: p, .. } if path_matches(p, &path) || path_matches(&path, p)))
                    .filter_map(|bp| bp.number())
                    .collect();
                for n in existing {
                    self.delete_breakpoint(n);
                }
                let mut infos = Vec::new();
                for (line, cond) in lines {
                    let bp = Breakpoint::line(path.clone(), line).with_cond(cond);
                    match self.add_line_breakpoint(bp) {
                        Ok(Some(bp)) => infos.extend(Self::breakpoint_info(&bp)),
                        Ok(None) => {}
                        Err(e) => infos.push(BreakpointInfo {
                            number: 0,
                            verified: false,
                            path: path.clone(),
                            line,
                            message: Some(e.to_string()),
                        }),
                    }
                }
                Ok(ProtocolReply::Breakpoints(infos))
            }
            ProtocolRequest::SetBreakpoint { path, line, cond } => {
                let bp = Breakpoint::line(path, line).with_cond(cond);
                match self.add_line_breakpoint(bp) {
                    Ok(Some(bp)) => Ok(ProtocolReply::Breakpoints(
                        Self::breakpoint_info(&bp).into_iter().collect(),
                    )),
                    Ok(None) => Err("duplicated breakpoint".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            ProtocolRequest::RemoveBreakpoint { number } => match self.delete_breakpoint(number) {
                Some(_) => Ok(ProtocolReply::Ack),
                None => Err(format!("no breakpoint #{number}")),
            },
            ProtocolRequest::SetExceptionBreakpoints { filters } => {
                let catches: Vec<usize> = self
                    .ctx
                    .breakpoints()
                    .iter()
                    .filter(|bp| matches!(bp.kind(), BreakpointKind::Catch { .. }))
                    .filter_map(|bp| bp.number())
                    .collect();
                for n in catches {
                    self.delete_breakpoint(n);
                }
                for filter in filters {
                    self.register_breakpoint(Arc::new(Breakpoint::catch(filter)));
                }
                Ok(ProtocolReply::Ack)
            }
            ProtocolRequest::Threads => Ok(ProtocolReply::Threads(self.handle().threads())),
            ProtocolRequest::Source { path } => self
                .ctx
                .sources()
                .lines(&path)
                .map(|lines| ProtocolReply::Source(lines.join("\n")))
                .ok_or_else(|| format!("no source for {path}")),
            other => Err(format!("{} needs a stopped thread", other.name())),
        }
    }

    /// Answer a request submitted while no thread is stopped.
    fn process_running_request(&mut self, id: u64, request: ProtocolRequest) {
        let reply = match request {
            ProtocolRequest::Pause => {
                self.ctx.arm_pause();
                Ok(ProtocolReply::Ack)
            }
            ProtocolRequest::Disconnect => {
                self.delete_all_breakpoints();
                Ok(ProtocolReply::Ack)
            }
            request @ (ProtocolRequest::Threads
            | ProtocolRequest::Source { .. }
            | ProtocolRequest::SetBreakpoints { .. }
            | ProtocolRequest::SetBreakpoint { .. }
            | ProtocolRequest::RemoveBreakpoint { .. }
            | ProtocolRequest::SetExceptionBreakpoints { .. }) => {
                self.process_breakpoint_request(request)
            }
            _ => Err("not stopped".to_string()),
        };
        self.transport.respond(id, reply);
    }

    fn query(&mut self, thread: usize, id: u64, query: ProtocolQuery) -> Next {
        match self.ctx.client(thread).filter(|tc| tc.is_waiting()) {
            Some(tc) => {
                tc.send(ThreadCommand::Protocol { id, query });
                Next::Done
            }
            None => {
                self.transport.respond(id, Err(format!("thread #{thread} is not stopped")));
                Next::Retry
            }
        }
    }

    fn control(&mut self, id: u64, cmd: ThreadCommand, resumes: bool) -> Next {
        if self.postmortem && !matches!(cmd, ThreadCommand::Continue) {
            self.transport.respond(id, Err("postmortem mode".to_string()));
            return Next::Retry;
        }
        self.transport.respond(id, Ok(ProtocolReply::Ack));
        if resumes {
            self.leave_subsession(cmd);
        } else {
            self.send(cmd);
        }
        Next::Done
    }

    /// Handle a protocol request while a thread is stopped.
    pub(crate) fn process_protocol_request(&mut self, id: u64, request: ProtocolRequest) -> Next {
        tracing::debug!(id, "protocol request {}", request.name());
        let current = self.tc.as_ref().map(|tc| tc.id()).unwrap_or(0);
        match request {
            ProtocolRequest::Continue => self.control(id, ThreadCommand::Continue, true),
            ProtocolRequest::ContinueTo { path, line } => {
                match self.add_line_breakpoint(Breakpoint::line(path, line).oneshot()) {
                    Ok(Some(_)) => self.control(id, ThreadCommand::Continue, true),
                    Ok(None) => {
                        self.transport.respond(id, Err("invalid location".to_string()));
                        Next::Retry
                    }
                    Err(e) => {
                        self.transport.respond(id, Err(e.to_string()));
                        Next::Retry
                    }
                }
            }
            ProtocolRequest::Next => self.control(id, step(StepKind::Next), true),
            ProtocolRequest::StepIn => self.control(id, step(StepKind::In), true),
            ProtocolRequest::StepOut => self.control(id, step(StepKind::Finish), true),
            ProtocolRequest::StepBack => self.control(id, ThreadCommand::StepBack(1), false),
            ProtocolRequest::Pause => {
                self.transport.respond(id, Ok(ProtocolReply::Ack));
                Next::Retry
            }
            ProtocolRequest::StackTrace { thread } => {
                self.query(thread.unwrap_or(current), id, ProtocolQuery::StackTrace)
            }
            ProtocolRequest::Scopes { frame } => {
                let reply = self.ids.resolve_frame(frame).map(|(thread, index)| {
                    ProtocolReply::Scopes(vec![
                        ScopeInfo {
                            name: "Local variables".to_string(),
                            variables_reference: self.ids.var_ref(VarRef::Locals {
                                thread,
                                frame: index,
                            }),
                        },
                        ScopeInfo {
                            name: "Global variables".to_string(),
                            variables_reference: self.ids.var_ref(VarRef::Globals { thread }),
                        },
                    ])
                });
                self.transport.respond(id, reply);
                Next::Retry
            }
            ProtocolRequest::Variables { reference } => match self.ids.resolve_var(reference) {
                Ok(VarRef::Locals { thread, frame }) => self.query(
                    thread,
                    id,
                    ProtocolQuery::Variables(VarScope::Locals { frame }),
                ),
                Ok(VarRef::Globals { thread }) => {
                    self.query(thread, id, ProtocolQuery::Variables(VarScope::Globals))
                }
                Ok(VarRef::Value(value)) => {
                    let vars = value
                        .children()
                        .into_iter()
                        .map(|(name, v)| self.ids.variable(&name, v))
                        .collect();
                    self.transport.respond(id, Ok(ProtocolReply::Variables(vars)));
                    Next::Retry
                }
                Err(e) => {
                    self.transport.respond(id, Err(e));
                    Next::Retry
                }
            },
            ProtocolRequest::Evaluate { frame, expression } => {
                if let Some(command) = expression.strip_prefix(',') {
                    let next = self.process_command(command, false);
                    self.transport.respond(id, Ok(ProtocolReply::Ack));
                    return next;
                }
                let (thread, frame) = match frame.map(|f| self.ids.resolve_frame(f)) {
                    Some(Ok((thread, index))) => (thread, Some(index)),
                    Some(Err(e)) => {
                        self.transport.respond(id, Err(e));
                        return Next::Retry;
                    }
                    None => (current, None),
                };
                self.query(thread, id, ProtocolQuery::Evaluate { frame, expression })
            }
            ProtocolRequest::Completions { frame, text } => {
                let (thread, frame) = match frame.map(|f| self.ids.resolve_frame(f)) {
                    Some(Ok((thread, index))) => (thread, Some(index)),
                    Some(Err(e)) => {
                        self.transport.respond(id, Err(e));
                        return Next::Retry;
                    }
                    None => (current, None),
                };
                self.query(thread, id, ProtocolQuery::Completions { frame, text })
            }
            ProtocolRequest::Command(line) => {
                let next = self.process_command(&line, false);
                self.transport.respond(id, Ok(ProtocolReply::Ack));
                next
            }
            ProtocolRequest::Disconnect => {
                self.delete_all_breakpoints();
                self.transport.respond(id, Ok(ProtocolReply::Ack));
                self.leave_subsession(ThreadCommand::Continue);
                Next::Done
            }
            request => {
                let reply = self.process_breakpoint_request(request);
                self.transport.respond(id, reply);
                Next::Retry
            }
        }
    }

    /// Turn a thread's answer into ids and reply.
    pub(crate) fn process_protocol_result(&mut self, thread: usize, id: u64, answer: ProtocolAnswer) {
        let reply = match answer {
            ProtocolAnswer::StackTrace(locations) => Ok(ProtocolReply::StackTrace(
                locations
                    .into_iter()
                    .enumerate()
                    .map(|(index, loc)| FrameInfo {
                        id: self.ids.frame_id(thread, index),
                        name: loc.label,
                        path: loc.path,
                        line: loc.line,
                    })
                    .collect(),
            )),
            ProtocolAnswer::Variables(vars) => Ok(ProtocolReply::Variables(
                vars.into_iter()
                    .map(|(name, value)| self.ids.variable(&name, value))
                    .collect(),
            )),
            ProtocolAnswer::Evaluate(result) => {
                result.map(|value| ProtocolReply::Evaluate(self.ids.variable("result", value)))
            }
            ProtocolAnswer::Completions(names) => Ok(ProtocolReply::Completions(names)),
        };
        self.transport.respond(id, reply);
    }
}

fn step(kind: StepKind) -> ThreadCommand {
    ThreadCommand::Step { kind, count: 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn error_chain_joins_sources() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
        assert_eq!(error_chain(&err), "outer: inner");
    }

    #[test]
    fn stop_reasons_follow_the_cause() {
        let catch = Arc::new(Breakpoint::catch("RuntimeError"));
        assert_eq!(stop_reason(&SuspendCause::Breakpoint(catch)), StopReason::Exception);
        let line = Arc::new(Breakpoint::line("a.rb", 3));
        assert_eq!(stop_reason(&SuspendCause::Breakpoint(line)), StopReason::Breakpoint);
        assert_eq!(stop_reason(&SuspendCause::Init), StopReason::Entry);
    }
}
