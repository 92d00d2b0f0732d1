//! The breakpoint model.
//!
//! A [`Breakpoint`] describes where and when to stop. Enabling it subscribes
//! an instrumentation hook; the hook answers [`HookAction::Suspend`] when the
//! breakpoint fires. Line and method breakpoints start out pending until
//! their target is loaded or defined.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use regex::Regex;

use crate::context::EngineContext;
use crate::debuggee::Debuggee;
use crate::error::BreakpointError;
use crate::frame::{Frame, Location};
use crate::instrument::{
    hook, without_hooks, EventKind, ExecEvent, HookAction, HookContext, HookId, HookSpec,
    SuspendCause,
};
use crate::source::CodeUnit;
use crate::sync::lock;
use crate::value::Value;

/// `#` for instance methods, `.` for class methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodOp {
    Instance,
    Singleton,
}

impl MethodOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MethodOp::Instance => "#",
            MethodOp::Singleton => ".",
        }
    }
}

#[derive(Debug, Clone)]
pub enum BreakpointKind {
    Line { path: String, line: u32 },
    Method { class: String, op: MethodOp, name: String },
    Catch { pattern: String },
    Watch { ivar: String, owner: Value },
    Check { predicate: String },
}

/// Restricts where a breakpoint may fire.
#[derive(Debug, Clone)]
pub enum PathFilter {
    /// Path contains the string.
    Include(String),
    Pattern(Regex),
}

impl PathFilter {
    /// `/re/` compiles to a pattern, anything else is a substring.
    pub fn parse(src: &str) -> Result<Self, BreakpointError> {
        match src.strip_prefix('/').and_then(|s| s.strip_suffix('/')) {
            Some(re) => Regex::new(re)
                .map(PathFilter::Pattern)
                .map_err(|e| BreakpointError::InvalidPattern {
                    pattern: src.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(PathFilter::Include(src.to_string())),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::Include(s) => path.contains(s.as_str()),
            PathFilter::Pattern(re) => re.is_match(path),
        }
    }
}

impl fmt::Display for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathFilter::Include(s) => f.write_str(s),
            PathFilter::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Debugger commands attached to a breakpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakpointCommand {
    /// Run before the prompt.
    pub pre: Vec<String>,
    /// Run on hit, then continue automatically.
    pub run: Vec<String>,
}

impl BreakpointCommand {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.run.is_empty()
    }
}

/// Registry key. Two breakpoints with the same key may not coexist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakpointKey {
    Line(String, u32),
    Method(String),
    Catch(String),
    Watch(String, u64),
    Check(String),
}

impl fmt::Display for BreakpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointKey::Line(p, l) => write!(f, "{p}:{l}"),
            BreakpointKey::Method(m) => f.write_str(m),
            BreakpointKey::Catch(c) => write!(f, "catch {c}"),
            BreakpointKey::Watch(i, o) => write!(f, "watch {i} of #{o}"),
            BreakpointKey::Check(p) => write!(f, "check {p}"),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    number: Option<usize>,
    enabled: bool,
    deleted: bool,
    pending: bool,
    hook: Option<HookId>,
    /// Where a line or method breakpoint actually binds.
    resolved: Option<Location>,
    owner: Option<String>,
    native: bool,
    watch_prev: Option<Value>,
    watch_current: Option<Value>,
    checks: HashMap<ThreadId, bool>,
    failure_reported: bool,
}

#[derive(Debug)]
pub struct Breakpoint {
    kind: BreakpointKind,
    cond: Option<String>,
    command: BreakpointCommand,
    path: Option<PathFilter>,
    oneshot: bool,
    state: Mutex<State>,
}

impl Breakpoint {
    fn with_kind(kind: BreakpointKind, pending: bool) -> Self {
        Self {
            kind,
            cond: None,
            command: BreakpointCommand::default(),
            path: None,
            oneshot: false,
            state: Mutex::new(State {
                pending,
                ..State::default()
            }),
        }
    }

    pub fn line(path: impl Into<String>, line: u32) -> Self {
        Self::with_kind(
            BreakpointKind::Line {
                path: path.into(),
                line,
            },
            true,
        )
    }

    pub fn method(class: impl Into<String>, op: MethodOp, name: impl Into<String>) -> Self {
        Self::with_kind(
            BreakpointKind::Method {
                class: class.into(),
                op,
                name: name.into(),
            },
            true,
        )
    }

    pub fn catch(pattern: impl Into<String>) -> Self {
        Self::with_kind(
            BreakpointKind::Catch {
                pattern: pattern.into(),
            },
            false,
        )
    }

    /// Watch `ivar` of `owner`, starting from `current`.
    pub fn watch(ivar: impl Into<String>, owner: Value, current: Value) -> Self {
        let bp = Self::with_kind(
            BreakpointKind::Watch {
                ivar: ivar.into(),
                owner,
            },
            false,
        );
        lock(&bp.state).watch_current = Some(current);
        bp
    }

    pub fn check(predicate: impl Into<String>) -> Self {
        Self::with_kind(
            BreakpointKind::Check {
                predicate: predicate.into(),
            },
            false,
        )
    }

    pub fn with_cond(mut self, cond: Option<String>) -> Self {
        self.cond = cond.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_command(mut self, command: BreakpointCommand) -> Self {
        self.command = command;
        self
    }

    pub fn with_path(mut self, path: Option<PathFilter>) -> Self {
        self.path = path;
        self
    }

    /// Delete the breakpoint after its first hit.
    pub fn oneshot(mut self) -> Self {
        self.oneshot = true;
        self
    }

    pub fn kind(&self) -> &BreakpointKind {
        &self.kind
    }

    pub fn cond(&self) -> Option<&str> {
        self.cond.as_deref()
    }

    pub fn command(&self) -> &BreakpointCommand {
        &self.command
    }

    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    pub fn key(&self) -> BreakpointKey {
        match &self.kind {
            BreakpointKind::Line { path, line } => BreakpointKey::Line(path.clone(), *line),
            BreakpointKind::Method { class, op, name } => {
                BreakpointKey::Method(format!("{class}{}{name}", op.as_str()))
            }
            BreakpointKind::Catch { pattern } => BreakpointKey::Catch(pattern.clone()),
            BreakpointKind::Watch { ivar, owner } => BreakpointKey::Watch(
                ivar.clone(),
                owner.as_object().map(|o| o.id()).unwrap_or(0),
            ),
            BreakpointKind::Check { predicate } => BreakpointKey::Check(predicate.clone()),
        }
    }

    pub fn number(&self) -> Option<usize> {
        lock(&self.state).number
    }

    pub(crate) fn set_number(&self, n: usize) {
        lock(&self.state).number = Some(n);
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending
    }

    pub fn is_enabled(&self) -> bool {
        let st = lock(&self.state);
        st.enabled && !st.pending && st.hook.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }

    /// Where the breakpoint binds once active.
    pub fn resolved(&self) -> Option<Location> {
        lock(&self.state).resolved.clone()
    }

    /// Record an activation failure. Returns `true` the first time only.
    pub(crate) fn report_failure_once(&self) -> bool {
        let mut st = lock(&self.state);
        !std::mem::replace(&mut st.failure_reported, true)
    }

    fn hook_kinds(&self, native: bool) -> &'static [EventKind] {
        match &self.kind {
            BreakpointKind::Line { .. } => &[EventKind::Line],
            BreakpointKind::Method { .. } if native => &[EventKind::NativeCall],
            BreakpointKind::Method { .. } => &[EventKind::Call],
            BreakpointKind::Catch { .. } => &[EventKind::Raise],
            BreakpointKind::Watch { .. } => {
                &[EventKind::Line, EventKind::Return, EventKind::BlockReturn]
            }
            BreakpointKind::Check { .. } => &[EventKind::Line],
        }
    }

    /// Attach the instrumentation hook. Pending and deleted breakpoints
    /// stay detached.
    pub fn enable(self: &Arc<Self>, ctx: &Arc<EngineContext>) {
        let native = {
            let mut st = lock(&self.state);
            st.enabled = true;
            if st.deleted || st.pending || st.hook.is_some() {
                return;
            }
            st.native
        };
        let bp = Arc::downgrade(self);
        let weak = Arc::downgrade(ctx);
        let id = ctx.instrumentation().subscribe(
            HookSpec::new(self.hook_kinds(native)),
            hook(move |h| match (bp.upgrade(), weak.upgrade()) {
                (Some(bp), Some(ctx)) => bp.on_event(&ctx, h),
                _ => HookAction::Pass,
            }),
        );
        lock(&self.state).hook = Some(id);
        tracing::debug!(bp = %self.key(), "breakpoint enabled");
    }

    /// Detach the instrumentation hook.
    pub fn disable(&self, ctx: &EngineContext) {
        let id = {
            let mut st = lock(&self.state);
            st.enabled = false;
            st.hook.take()
        };
        if let Some(id) = id {
            ctx.instrumentation().unsubscribe(id);
        }
    }

    /// Detach and mark deleted. The registry prunes it lazily.
    pub fn delete(&self, ctx: &EngineContext) {
        self.disable(ctx);
        lock(&self.state).deleted = true;
    }

    /// Whether the guard condition and path filter hold in `frame`.
    ///
    /// Never fails: evaluation errors are logged and count as no match.
    pub fn matches(&self, debuggee: &dyn Debuggee, frame: &Frame) -> bool {
        if let Some(filter) = &self.path {
            if !filter.matches(frame.path()) {
                return false;
            }
        }
        self.cond_holds(debuggee, Some(frame))
    }

    fn cond_holds(&self, debuggee: &dyn Debuggee, frame: Option<&Frame>) -> bool {
        let Some(cond) = &self.cond else {
            return true;
        };
        match without_hooks(|| debuggee.evaluate(frame, cond)) {
            Ok(v) => v.truthy(),
            Err(e) => {
                tracing::warn!("breakpoint condition `{}` failed: {}", cond, e);
                false
            }
        }
    }

    /// Whether the breakpoint must not fire at `path`.
    ///
    /// An explicit path filter decides on its own. Line breakpoints name
    /// their location, so skip paths never hide them.
    fn skips(&self, ctx: &EngineContext, path: &str) -> bool {
        match (&self.path, &self.kind) {
            (Some(filter), _) => !filter.matches(path),
            (None, BreakpointKind::Line { .. }) => false,
            (None, _) => ctx.skips_path(path),
        }
    }

    fn on_event(self: &Arc<Self>, ctx: &Arc<EngineContext>, h: &HookContext<'_>) -> HookAction {
        let ev = h.event;
        let hit = match &self.kind {
            BreakpointKind::Line { .. } => lock(&self.state)
                .resolved
                .as_ref()
                .is_some_and(|r| r.path == ev.location.path && r.line == ev.location.line),
            BreakpointKind::Method { op, name, .. } => self.method_hit(ev, *op, name),
            BreakpointKind::Catch { pattern } => ev.exception.as_ref().is_some_and(|exc| {
                h.debuggee
                    .ancestors(&exc.class_name())
                    .iter()
                    .any(|c| c == pattern)
            }),
            BreakpointKind::Watch { ivar, owner } => self.watch_changed(ivar, owner),
            BreakpointKind::Check { predicate } => self.check_transition(h.debuggee, predicate),
        };
        if !hit || self.skips(ctx, &ev.location.path) || !self.cond_holds(h.debuggee, None) {
            return HookAction::Pass;
        }
        if self.oneshot {
            self.delete(ctx);
        }
        tracing::debug!(bp = %self.key(), "breakpoint hit at {}", ev.location);
        HookAction::Suspend(SuspendCause::Breakpoint(Arc::clone(self)))
    }

    fn method_hit(&self, ev: &ExecEvent, op: MethodOp, name: &str) -> bool {
        if ev.callee.as_deref() != Some(name) {
            return false;
        }
        let singleton_call = matches!(ev.receiver, Some(Value::Class(_)));
        if singleton_call != (op == MethodOp::Singleton) {
            return false;
        }
        let st = lock(&self.state);
        st.owner.is_some() && ev.class == st.owner
    }

    fn watch_changed(&self, ivar: &str, owner: &Value) -> bool {
        let Some(obj) = owner.as_object() else {
            return false;
        };
        let now = obj.ivar(ivar).unwrap_or(Value::Nil);
        let mut st = lock(&self.state);
        if st.watch_current.as_ref().is_some_and(|cur| *cur == now) {
            return false;
        }
        st.watch_prev = st.watch_current.replace(now);
        true
    }

    fn check_transition(&self, debuggee: &dyn Debuggee, predicate: &str) -> bool {
        let now = match without_hooks(|| debuggee.evaluate(None, predicate)) {
            Ok(v) => v.truthy(),
            Err(e) => {
                tracing::debug!("check `{}` failed: {}", predicate, e);
                false
            }
        };
        let thread = std::thread::current().id();
        let before = lock(&self.state).checks.insert(thread, now).unwrap_or(false);
        !before && now
    }

    /// Bind a pending line breakpoint to a freshly loaded unit tree.
    ///
    /// Returns `Ok(false)` when the unit does not cover the requested line.
    pub fn activate(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        root: &Arc<CodeUnit>,
    ) -> Result<bool, BreakpointError> {
        let BreakpointKind::Line { path, line } = &self.kind else {
            return Ok(false);
        };
        if !path_matches(path, root.path()) || !root.covers(*line) {
            return Ok(false);
        }
        let (unit, found) =
            CodeUnit::find_line(root, *line).ok_or_else(|| BreakpointError::NoTraceableLine {
                path: path.clone(),
                line: *line,
            })?;
        {
            let mut st = lock(&self.state);
            st.resolved = Some(Location::new(root.path(), found, unit.label()));
            st.pending = false;
        }
        tracing::info!("breakpoint {} activated at {}:{}", self.key(), root.path(), found);
        let enabled = lock(&self.state).enabled;
        if enabled {
            self.enable(ctx);
        }
        Ok(true)
    }

    /// Detach a line breakpoint so it can be bound to a reloaded unit.
    pub(crate) fn reset_for_reload(&self, ctx: &EngineContext) {
        let id = {
            let mut st = lock(&self.state);
            st.pending = true;
            st.resolved = None;
            st.hook.take()
        };
        if let Some(id) = id {
            ctx.instrumentation().unsubscribe(id);
        }
    }

    /// Resolve a method breakpoint on a debuggee thread.
    ///
    /// An unknown class or method leaves the breakpoint pending and returns
    /// `Ok(false)`; a retry hook on method definitions is attached.
    pub fn resolve(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        debuggee: &dyn Debuggee,
    ) -> Result<bool, BreakpointError> {
        let BreakpointKind::Method { class, op, name } = &self.kind else {
            return Ok(false);
        };
        match debuggee.resolve_method(class, name, *op == MethodOp::Singleton) {
            Ok(info) => {
                if info.native {
                    debuggee.enable_native_probe(&info.owner, &info.name);
                }
                let retry = {
                    let mut st = lock(&self.state);
                    st.owner = Some(info.owner.clone());
                    st.native = info.native;
                    st.resolved = info.location;
                    st.pending = false;
                    st.hook.take()
                };
                if let Some(id) = retry {
                    ctx.instrumentation().unsubscribe(id);
                }
                tracing::info!("breakpoint {} activated", self.key());
                let enabled = lock(&self.state).enabled;
                if enabled {
                    self.enable(ctx);
                }
                Ok(true)
            }
            Err(BreakpointError::UnknownClass(_)) | Err(BreakpointError::UnknownMethod { .. }) => {
                self.retry_on_definition(ctx);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn retry_on_definition(self: &Arc<Self>, ctx: &Arc<EngineContext>) {
        let BreakpointKind::Method { name, .. } = &self.kind else {
            return;
        };
        if lock(&self.state).hook.is_some() {
            return;
        }
        let name = name.clone();
        let bp: Weak<Breakpoint> = Arc::downgrade(self);
        let weak = Arc::downgrade(ctx);
        let id = ctx.instrumentation().subscribe(
            HookSpec::new(&[EventKind::MethodDefined]),
            hook(move |h| {
                if h.event.callee.as_deref() != Some(name.as_str()) {
                    return HookAction::Pass;
                }
                if let (Some(bp), Some(ctx)) = (bp.upgrade(), weak.upgrade()) {
                    if let Err(e) = bp.resolve(&ctx, h.debuggee) {
                        tracing::warn!("breakpoint {} failed to activate: {}", bp.key(), e);
                    }
                }
                HookAction::Pass
            }),
        );
        lock(&self.state).hook = Some(id);
    }

    /// Short description, as shown by `break` and on stops.
    pub fn label(&self) -> String {
        let st = lock(&self.state);
        let mut s = match &self.kind {
            BreakpointKind::Line { path, line } => match &st.resolved {
                Some(loc) if !st.pending => format!("BP - Line  {}:{} (line)", loc.path, loc.line),
                _ => format!("BP - Line (pending)  {path}:{line}"),
            },
            BreakpointKind::Method { class, op, name } => {
                let sig = format!("{class}{}{name}", op.as_str());
                match (&st.resolved, st.pending) {
                    (_, true) => format!("BP - Method (pending)  {sig}"),
                    (Some(loc), false) => format!("BP - Method  {sig} at {loc}"),
                    (None, false) => format!("BP - Method  {sig}"),
                }
            }
            BreakpointKind::Catch { pattern } => format!("BP - Catch  \"{pattern}\""),
            BreakpointKind::Watch { ivar, owner } => {
                let cur = st.watch_current.as_ref().map(Value::inspect).unwrap_or_default();
                match &st.watch_prev {
                    Some(prev) => format!(
                        "BP - Watch  {} {ivar} = {} -> {cur}",
                        owner.inspect(),
                        prev.inspect()
                    ),
                    None => format!("BP - Watch  {} {ivar} = {cur}", owner.inspect()),
                }
            }
            BreakpointKind::Check { predicate } => format!("BP - Check  {predicate}"),
        };
        if let Some(cond) = &self.cond {
            s.push_str(&format!(" if: {cond}"));
        }
        if !self.command.pre.is_empty() {
            s.push_str(&format!(" pre: {}", self.command.pre.join(";; ")));
        }
        if !self.command.run.is_empty() {
            s.push_str(&format!(" do: {}", self.command.run.join(";; ")));
        }
        if let Some(path) = &self.path {
            s.push_str(&format!(" path: {path}"));
        }
        s
    }
}

/// Whether a requested breakpoint path names `actual`.
pub fn path_matches(requested: &str, actual: &str) -> bool {
    actual == requested
        || actual
            .strip_suffix(requested)
            .is_some_and(|head| head.ends_with('/'))
}

/// Keyword arguments shared by `break`, `catch` and `watch`.
#[derive(Debug, Default, Clone)]
pub struct BreakArgs {
    /// Everything before the first keyword.
    pub sig: Option<String>,
    pub cond: Option<String>,
    pub command: BreakpointCommand,
    pub path: Option<PathFilter>,
}

impl BreakArgs {
    /// Split `args` at the `if:`, `pre:`, `do:` and `path:` keywords.
    ///
    /// Command lists use `;;` to separate commands.
    pub fn parse(args: &str) -> Result<Self, BreakpointError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mode {
            Sig,
            If,
            Pre,
            Do,
            Path,
        }
        let mut parts: Vec<(Mode, Vec<&str>)> = Vec::new();
        let mut mode = Mode::Sig;
        let mut words = Vec::new();
        for w in args.split_whitespace() {
            let next = match w {
                "if:" => Some(Mode::If),
                "pre:" => Some(Mode::Pre),
                "do:" => Some(Mode::Do),
                "path:" => Some(Mode::Path),
                _ => None,
            };
            match next {
                Some(m) => {
                    parts.push((mode, std::mem::take(&mut words)));
                    mode = m;
                }
                None => words.push(w),
            }
        }
        parts.push((mode, words));

        let mut out = BreakArgs::default();
        for (mode, words) in parts {
            if words.is_empty() && mode == Mode::Sig {
                continue;
            }
            let text = words.join(" ");
            match mode {
                Mode::Sig => out.sig = Some(text),
                Mode::If => out.cond = Some(text),
                Mode::Pre => out.command.pre = split_commands(&text),
                Mode::Do => out.command.run = split_commands(&text),
                Mode::Path => out.path = Some(PathFilter::parse(&text)?),
            }
        }
        Ok(out)
    }
}

fn split_commands(text: &str) -> Vec<String> {
    text.split(";;")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// What a `break` signature designates.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakTarget {
    /// `line`, `file:line` or `file line`.
    Line { file: Option<String>, line: u32 },
    /// `Class#name`, `Class.name` or `expr.name`.
    Method { receiver: String, op: MethodOp, name: String },
    /// No signature: a check breakpoint on the `if:` predicate.
    Check,
}

impl BreakTarget {
    pub fn parse(sig: Option<&str>) -> Result<Self, BreakpointError> {
        let Some(sig) = sig.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(BreakTarget::Check);
        };
        if let Ok(line) = sig.parse::<u32>() {
            return Ok(BreakTarget::Line { file: None, line });
        }
        if let Some((file, line)) = sig.rsplit_once([':', ' ']) {
            if let Ok(line) = line.trim().parse::<u32>() {
                let file = file.trim();
                if !file.is_empty() {
                    return Ok(BreakTarget::Line {
                        file: Some(file.to_string()),
                        line,
                    });
                }
            }
        }
        if let Some(pos) = sig.rfind(['#', '.']) {
            let (receiver, rest) = sig.split_at(pos);
            let name = &rest[1..];
            if !receiver.is_empty() && !name.is_empty() {
                let op = if rest.starts_with('#') {
                    MethodOp::Instance
                } else {
                    MethodOp::Singleton
                };
                return Ok(BreakTarget::Method {
                    receiver: receiver.to_string(),
                    op,
                    name: name.to_string(),
                });
            }
        }
        Err(BreakpointError::Usage(format!(
            "Unknown breakpoint format: {sig}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    struct RaisingDebuggee;

    impl Debuggee for RaisingDebuggee {
        fn thread_name(&self) -> String {
            "t".into()
        }
        fn depth(&self) -> usize {
            1
        }
        fn capture_frames(&self) -> Vec<Frame> {
            Vec::new()
        }
        fn evaluate(&self, _: Option<&Frame>, src: &str) -> Result<Value, crate::error::EvalError> {
            match src {
                "ok" => Ok(Value::Bool(true)),
                _ => Err(crate::error::EvalError::Raised {
                    class: "RuntimeError".into(),
                    message: "boom".into(),
                }),
            }
        }
        fn resolve_method(
            &self,
            class: &str,
            _: &str,
            _: bool,
        ) -> Result<crate::debuggee::MethodInfo, BreakpointError> {
            Err(BreakpointError::UnknownClass(class.into()))
        }
        fn enable_native_probe(&self, _: &str, _: &str) {}
        fn ancestors(&self, class: &str) -> Vec<String> {
            vec![class.into()]
        }
        fn globals(&self) -> Vec<(String, Value)> {
            Vec::new()
        }
        fn methods_of(&self, _: &Value) -> Vec<(String, Vec<String>)> {
            Vec::new()
        }
        fn constants(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn frame(path: &str) -> Frame {
        Frame::new(Location::new(path, 3, "<main>"), FrameKind::Top, Value::Nil, 1)
    }

    #[test]
    fn matches_never_fails_when_condition_raises() {
        let bp = Breakpoint::line("a.rb", 3).with_cond(Some("raise 'x'".into()));
        assert!(!bp.matches(&RaisingDebuggee, &frame("a.rb")));
        let bp = Breakpoint::line("a.rb", 3).with_cond(Some("ok".into()));
        assert!(bp.matches(&RaisingDebuggee, &frame("a.rb")));
    }

    #[test]
    fn path_filter_restricts_matches() {
        let bp = Breakpoint::check("ok").with_path(Some(PathFilter::parse("/lib\\//").unwrap()));
        assert!(bp.matches(&RaisingDebuggee, &frame("app/lib/x.rb")));
        assert!(!bp.matches(&RaisingDebuggee, &frame("app/x.rb")));
        assert!(PathFilter::parse("/(/").is_err());
    }

    #[test]
    fn break_args_split_keywords() {
        let args = BreakArgs::parse("app.rb:10 if: x > 1 pre: p x;; bt do: p y path: /app/").unwrap();
        assert_eq!(args.sig.as_deref(), Some("app.rb:10"));
        assert_eq!(args.cond.as_deref(), Some("x > 1"));
        assert_eq!(args.command.pre, vec!["p x", "bt"]);
        assert_eq!(args.command.run, vec!["p y"]);
        assert!(matches!(args.path, Some(PathFilter::Pattern(_))));

        let args = BreakArgs::parse("if: ready").unwrap();
        assert!(args.sig.is_none());
        assert_eq!(args.cond.as_deref(), Some("ready"));
    }

    #[test]
    fn break_targets() {
        assert_eq!(
            BreakTarget::parse(Some("10")).unwrap(),
            BreakTarget::Line { file: None, line: 10 }
        );
        assert_eq!(
            BreakTarget::parse(Some("app.rb:10")).unwrap(),
            BreakTarget::Line { file: Some("app.rb".into()), line: 10 }
        );
        assert_eq!(
            BreakTarget::parse(Some("app.rb 12")).unwrap(),
            BreakTarget::Line { file: Some("app.rb".into()), line: 12 }
        );
        assert_eq!(
            BreakTarget::parse(Some("Calc#add")).unwrap(),
            BreakTarget::Method { receiver: "Calc".into(), op: MethodOp::Instance, name: "add".into() }
        );
        assert_eq!(
            BreakTarget::parse(Some("calc.add")).unwrap(),
            BreakTarget::Method { receiver: "calc".into(), op: MethodOp::Singleton, name: "add".into() }
        );
        assert_eq!(BreakTarget::parse(None).unwrap(), BreakTarget::Check);
        assert!(BreakTarget::parse(Some("???")).is_err());
    }

    #[test]
    fn path_matching_respects_components() {
        assert!(path_matches("app.rb", "app.rb"));
        assert!(path_matches("app.rb", "/src/app.rb"));
        assert!(!path_matches("app.rb", "/src/myapp.rb"));
    }

    #[test]
    fn labels_and_keys() {
        let bp = Breakpoint::line("app.rb", 10).with_cond(Some("x".into()));
        assert_eq!(bp.label(), "BP - Line (pending)  app.rb:10 if: x");
        assert_eq!(bp.key(), BreakpointKey::Line("app.rb".into(), 10));
        let bp = Breakpoint::method("Calc", MethodOp::Singleton, "make");
        assert_eq!(bp.key().to_string(), "Calc.make");
        assert!(bp.is_pending());
        assert!(!Breakpoint::catch("RuntimeError").is_pending());
    }

    #[test]
    fn watch_fires_only_on_change() {
        let obj = crate::value::Object::new("Point");
        obj.set_ivar("@x", Value::Int(1));
        let owner = Value::Object(obj.clone());
        let bp = Breakpoint::watch("@x", owner.clone(), Value::Int(1));
        assert!(!bp.watch_changed("@x", &owner));
        obj.set_ivar("@x", Value::Int(2));
        assert!(bp.watch_changed("@x", &owner));
        assert!(!bp.watch_changed("@x", &owner));
        assert!(bp.label().ends_with("@x = 1 -> 2"), "{}", bp.label());
    }

    #[test]
    fn check_fires_on_rising_edge_only() {
        let bp = Breakpoint::check("ok");
        assert!(bp.check_transition(&RaisingDebuggee, "ok"));
        assert!(!bp.check_transition(&RaisingDebuggee, "ok"));
        assert!(!bp.check_transition(&RaisingDebuggee, "bad"));
        assert!(bp.check_transition(&RaisingDebuggee, "ok"));
    }
}
