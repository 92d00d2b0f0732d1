//! Shared engine state and the engine entry point.
//!
//! [`EngineContext`] is built once per debugged process and handed by `Arc`
//! to thread clients, hooks and the coordinator. Nothing here is global.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{JoinHandle, ThreadId};

use regex::Regex;
use snag_config::config::UiConfig;
use snag_config::Config;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;

use crate::debuggee::Debuggee;
use crate::error::EngineError;
use crate::instrument::{
    hook, EventKind, HookAction, HookContext, HookId, HookSpec, Instrumentation, StopSink,
    SuspendCause,
};
use crate::process_group::ProcessGroup;
use crate::registry::BreakpointRegistry;
use crate::render::{PlainRenderer, Renderer};
use crate::session::protocol::{ProtocolRequest, ThreadInfo};
use crate::session::{Session, SessionEvent};
use crate::source::{SourceRepository, UnitKind};
use crate::sync::{lock, read, write};
use crate::thread_client::{ThreadClient, ThreadCommand};
use crate::transport::{Transport, TransportFactory};

/// Prefix of engine-owned thread names. Such threads are never debugged.
pub const MANAGEMENT_PREFIX: &str = "snag-";

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Client of the current thread, per context.
    static CURRENT: RefCell<Vec<(u64, Weak<ThreadClient>)>> = const { RefCell::new(Vec::new()) };
}

pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Debug, Default)]
pub(crate) struct FreezeState {
    pub(crate) frozen: bool,
    pub(crate) controlling: Option<usize>,
}

pub struct EngineContext {
    id: u64,
    this: Weak<EngineContext>,
    config: RwLock<Config>,
    skip: RwLock<Vec<Regex>>,
    instrument: Arc<dyn Instrumentation>,
    sources: SourceRepository,
    breakpoints: RwLock<BreakpointRegistry>,
    renderer: RwLock<Arc<dyn Renderer>>,
    events: UnboundedSender<SessionEvent>,
    freeze: Mutex<FreezeState>,
    subsession: AtomicU64,
    clients: RwLock<BTreeMap<usize, Arc<ThreadClient>>>,
    next_client: AtomicUsize,
    stopper: Mutex<Option<HookId>>,
    init: Mutex<Option<HookId>>,
    pause: Mutex<Option<HookId>>,
    hooks: Mutex<Vec<HookId>>,
    process_group: ProcessGroup,
    on_exit: ExitFn,
    active: AtomicBool,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

fn compile_skips(paths: &[String]) -> Vec<Regex> {
    paths
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("ignoring skip_path `{}`: {}", p, e);
                None
            }
        })
        .collect()
}

impl EngineContext {
    pub(crate) fn new(
        config: Config,
        instrument: Arc<dyn Instrumentation>,
        events: UnboundedSender<SessionEvent>,
        on_exit: ExitFn,
    ) -> Arc<Self> {
        let skip = compile_skips(&config.control.skip_path);
        Arc::new_cyclic(|this| Self {
            id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            config: RwLock::new(config),
            skip: RwLock::new(skip),
            instrument,
            sources: SourceRepository::new(),
            breakpoints: RwLock::new(BreakpointRegistry::new()),
            renderer: RwLock::new(Arc::new(PlainRenderer)),
            events,
            freeze: Mutex::new(FreezeState::default()),
            subsession: AtomicU64::new(0),
            clients: RwLock::new(BTreeMap::new()),
            next_client: AtomicUsize::new(1),
            stopper: Mutex::new(None),
            init: Mutex::new(None),
            pause: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
            process_group: ProcessGroup::new(),
            on_exit,
            active: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> Config {
        read(&self.config).clone()
    }

    pub fn ui_config(&self) -> UiConfig {
        read(&self.config).ui.clone()
    }

    /// Replace the configuration, recompiling skip paths.
    pub fn update_config(&self, config: Config) {
        *write(&self.skip) = compile_skips(&config.control.skip_path);
        *write(&self.config) = config;
    }

    pub fn instrumentation(&self) -> &Arc<dyn Instrumentation> {
        &self.instrument
    }

    pub fn sources(&self) -> &SourceRepository {
        &self.sources
    }

    pub fn breakpoints(&self) -> RwLockReadGuard<'_, BreakpointRegistry> {
        read(&self.breakpoints)
    }

    pub(crate) fn breakpoints_mut(&self) -> RwLockWriteGuard<'_, BreakpointRegistry> {
        write(&self.breakpoints)
    }

    pub fn renderer(&self) -> Arc<dyn Renderer> {
        Arc::clone(&read(&self.renderer))
    }

    pub fn set_renderer(&self, renderer: Arc<dyn Renderer>) {
        *write(&self.renderer) = renderer;
    }

    pub fn process_group(&self) -> &ProcessGroup {
        &self.process_group
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("session is gone, event dropped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Engine-internal code locations.
    pub fn is_internal(&self, path: &str) -> bool {
        path.starts_with("<internal:")
    }

    pub fn skips_path(&self, path: &str) -> bool {
        read(&self.skip).iter().any(|re| re.is_match(path))
    }

    pub fn skip_nosrc(&self) -> bool {
        read(&self.config).control.skip_nosrc
    }

    pub fn subsession_id(&self) -> u64 {
        self.subsession.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_subsession(&self) -> u64 {
        self.subsession.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether a step issued in sub-session `sid` must give up at `path:line`.
    pub(crate) fn stop_stepping(&self, path: &str, line: u32, sid: u64) -> bool {
        sid != self.subsession_id() || self.breakpoints().has_line_at(path, line)
    }

    // --- thread clients ---------------------------------------------------

    fn cached_client(&self) -> Option<Arc<ThreadClient>> {
        CURRENT.with(|c| {
            c.borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .and_then(|(_, tc)| tc.upgrade())
        })
    }

    /// The client of the calling thread, registering it on first sight.
    ///
    /// The thread table is updated before the coordinator hears of it, so
    /// a thread started during a stop is listed right away. Returns `None`
    /// once the engine is shut down.
    pub(crate) fn current_client(&self, dbg: &dyn Debuggee) -> Option<Arc<ThreadClient>> {
        if let Some(tc) = self.cached_client() {
            return Some(tc);
        }
        if !self.is_active() {
            return None;
        }
        let name = dbg.thread_name();
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let management = name.starts_with(MANAGEMENT_PREFIX);
        let tc = self.new_client(id, name.clone(), std::thread::current().id(), management);
        self.emit(SessionEvent::ThreadBegin { id, name });
        CURRENT.with(|c| {
            let mut c = c.borrow_mut();
            c.retain(|(id, tc)| *id != self.id && tc.strong_count() > 0);
            c.push((self.id, Arc::downgrade(&tc)));
        });
        Some(tc)
    }

    fn forget_current(&self) {
        CURRENT.with(|c| c.borrow_mut().retain(|(id, _)| *id != self.id));
    }

    pub(crate) fn new_client(
        &self,
        id: usize,
        name: String,
        os_id: ThreadId,
        management: bool,
    ) -> Arc<ThreadClient> {
        let tc = Arc::new(ThreadClient::new(
            id,
            name,
            os_id,
            management,
            self.this.clone(),
        ));
        write(&self.clients).insert(id, Arc::clone(&tc));
        tracing::debug!(thread = id, "thread client registered");
        tc
    }

    pub(crate) fn remove_client(&self, id: usize) -> Option<Arc<ThreadClient>> {
        write(&self.clients).remove(&id)
    }

    pub fn client(&self, id: usize) -> Option<Arc<ThreadClient>> {
        read(&self.clients).get(&id).cloned()
    }

    /// Debuggable threads, by id.
    pub fn clients(&self) -> Vec<Arc<ThreadClient>> {
        read(&self.clients)
            .values()
            .filter(|c| !c.is_management())
            .cloned()
            .collect()
    }

    // --- freezing -----------------------------------------------------------

    pub(crate) fn freeze_state(&self) -> MutexGuard<'_, FreezeState> {
        lock(&self.freeze)
    }

    /// Park every thread except `controlling` at its next breakable event.
    pub(crate) fn freeze(self: &Arc<Self>, controlling: usize) {
        {
            let mut st = lock(&self.freeze);
            st.frozen = true;
            st.controlling = Some(controlling);
        }
        let mut stopper = lock(&self.stopper);
        if stopper.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *stopper = Some(self.instrument.subscribe(
            HookSpec::new(EventKind::BREAKABLE).urgent(),
            hook(move |h| {
                let Some(ctx) = weak.upgrade() else {
                    return HookAction::Pass;
                };
                let Some(tc) = ctx.current_client(h.debuggee) else {
                    return HookAction::Pass;
                };
                let st = lock(&ctx.freeze);
                if st.frozen && !tc.is_management() && st.controlling != Some(tc.id()) {
                    HookAction::Park
                } else {
                    HookAction::Pass
                }
            }),
        ));
        tracing::debug!(controlling, "threads frozen");
    }

    /// Release parked threads.
    ///
    /// Threads whose own stop is still queued keep waiting for it.
    pub(crate) fn unfreeze(&self) {
        if let Some(id) = lock(&self.stopper).take() {
            self.instrument.unsubscribe(id);
        }
        let parked: Vec<Arc<ThreadClient>> = {
            let mut st = lock(&self.freeze);
            st.frozen = false;
            let controlling = st.controlling;
            read(&self.clients)
                .values()
                .filter(|c| c.is_waiting() && Some(c.id()) != controlling && !c.is_stop_pending())
                .cloned()
                .collect()
        };
        for tc in parked {
            tracing::debug!(thread = tc.id(), "released");
            tc.send(ThreadCommand::Continue);
        }
    }

    pub(crate) fn set_controlling(&self, id: usize) {
        lock(&self.freeze).controlling = Some(id);
    }

    pub(crate) fn release_control(&self) {
        lock(&self.freeze).controlling = None;
    }

    pub(crate) fn controlling(&self) -> Option<usize> {
        lock(&self.freeze).controlling
    }

    // --- engine hooks -------------------------------------------------------

    fn install(
        self: &Arc<Self>,
        kinds: &[EventKind],
        f: fn(&Arc<EngineContext>, &HookContext<'_>) -> HookAction,
    ) -> HookId {
        let weak = Arc::downgrade(self);
        let id = self.instrument.subscribe(
            HookSpec::new(kinds),
            hook(move |h| match weak.upgrade() {
                Some(ctx) => f(&ctx, h),
                None => HookAction::Pass,
            }),
        );
        lock(&self.hooks).push(id);
        id
    }

    fn install_hooks(self: &Arc<Self>) {
        self.install(&[EventKind::ThreadBegin], |ctx, h| {
            let _ = ctx.current_client(h.debuggee);
            HookAction::Pass
        });
        self.install(&[EventKind::ThreadEnd], on_thread_end);
        self.install(&[EventKind::Raise], |ctx, h| {
            if read(&ctx.config).control.postmortem {
                if let Some(tc) = ctx.current_client(h.debuggee) {
                    tc.remember_raise(h.debuggee.capture_frames());
                }
            }
            HookAction::Pass
        });
        self.install(&[EventKind::ScriptCompiled], on_script_compiled);
        let init = self.install(&[EventKind::Line], |ctx, h| {
            let debuggable = ctx
                .current_client(h.debuggee)
                .is_some_and(|tc| !tc.is_management());
            if !debuggable {
                return HookAction::Pass;
            }
            let Some(id) = lock(&ctx.init).take() else {
                return HookAction::Pass;
            };
            ctx.instrument.unsubscribe(id);
            let boot = read(&ctx.config).boot.clone();
            let presets = boot.commands.is_some() || boot.init_script.is_some();
            if presets || !boot.nonstop {
                HookAction::Suspend(SuspendCause::Init)
            } else {
                HookAction::Pass
            }
        });
        *lock(&self.init) = Some(init);
    }

    /// Stop the next thread that reaches a breakable event.
    pub(crate) fn arm_pause(self: &Arc<Self>) {
        let mut pause = lock(&self.pause);
        if pause.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *pause = Some(self.instrument.subscribe(
            HookSpec::new(EventKind::BREAKABLE),
            hook(move |h| {
                let Some(ctx) = weak.upgrade() else {
                    return HookAction::Pass;
                };
                if !ctx.current_client(h.debuggee).is_some_and(|tc| !tc.is_management()) {
                    return HookAction::Pass;
                }
                let taken = lock(&ctx.pause).take();
                match taken {
                    Some(id) => {
                        ctx.instrument.unsubscribe(id);
                        HookAction::Suspend(SuspendCause::Pause)
                    }
                    None => HookAction::Pass,
                }
            }),
        ));
    }

    /// Detach every hook and let all threads run freely.
    pub(crate) fn deactivate(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut ids: Vec<HookId> = lock(&self.hooks).drain(..).collect();
        ids.extend(lock(&self.stopper).take());
        ids.extend(lock(&self.init).take());
        ids.extend(lock(&self.pause).take());
        for id in ids {
            self.instrument.unsubscribe(id);
        }
        for bp in self.breakpoints().iter() {
            bp.disable(self);
        }
        let waiting: Vec<Arc<ThreadClient>> = {
            let mut st = lock(&self.freeze);
            st.frozen = false;
            let controlling = st.controlling;
            read(&self.clients)
                .values()
                .filter(|c| c.is_waiting() && Some(c.id()) != controlling)
                .cloned()
                .collect()
        };
        for tc in waiting {
            tc.send(ThreadCommand::Continue);
        }
        tracing::info!("engine deactivated");
    }

    pub(crate) fn exit(&self, code: i32) {
        tracing::info!(code, "exiting debuggee");
        (self.on_exit)(code);
    }
}

fn on_thread_end(ctx: &Arc<EngineContext>, h: &HookContext<'_>) -> HookAction {
    let Some(tc) = ctx.cached_client() else {
        return HookAction::Pass;
    };
    if let Some(exc) = &h.event.exception {
        if !tc.is_management() && ctx.is_active() && read(&ctx.config).control.postmortem {
            tc.suspend(h.debuggee, h.event, SuspendCause::Postmortem(exc.clone()));
        }
    }
    ctx.emit(SessionEvent::ThreadEnd { id: tc.id() });
    ctx.forget_current();
    HookAction::Pass
}

fn on_script_compiled(ctx: &Arc<EngineContext>, h: &HookContext<'_>) -> HookAction {
    let Some(unit) = h.event.unit.clone() else {
        return HookAction::Pass;
    };
    let snippet = unit.kind() == UnitKind::Eval;
    let (reply, rx) = oneshot::channel();
    ctx.emit(SessionEvent::Load {
        unit,
        source: h.event.source.clone(),
        reply,
    });
    // Breakpoints are bound once the coordinator answers.
    let _ = rx.blocking_recv();
    let debuggable = ctx
        .current_client(h.debuggee)
        .is_some_and(|tc| !tc.is_management());
    if debuggable && !snippet && read(&ctx.config).boot.stop_at_load {
        HookAction::Suspend(SuspendCause::Load)
    } else {
        HookAction::Pass
    }
}

impl StopSink for EngineContext {
    fn park(&self, h: &HookContext<'_>) {
        if let Some(tc) = self.current_client(h.debuggee) {
            if !tc.is_management() {
                tc.park(h.debuggee);
            }
        }
    }

    fn stop(&self, h: &HookContext<'_>, cause: SuspendCause) {
        if let Some(tc) = self.current_client(h.debuggee) {
            if !tc.is_management() {
                tc.suspend(h.debuggee, h.event, cause);
            }
        }
    }
}

/// Options for [`Engine::start`].
#[derive(Default)]
pub struct EngineOptions {
    /// Used by the `open` command.
    pub factory: Option<Box<dyn TransportFactory>>,
    /// Called by `quit` and `kill`. Defaults to terminating the process.
    pub on_exit: Option<ExitFn>,
}

/// A cloneable handle for transports and embedders.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    ctx: Arc<EngineContext>,
}

impl EngineHandle {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.ctx
            .clients()
            .iter()
            .map(|tc| ThreadInfo {
                id: tc.id(),
                name: tc.name().to_string(),
                waiting: tc.is_waiting(),
            })
            .collect()
    }

    /// Stop the next thread that reaches a breakable event.
    pub fn pause(&self) {
        self.ctx.emit(SessionEvent::Pause);
    }

    /// Submit a protocol request while the program runs.
    pub fn request(&self, id: u64, request: ProtocolRequest) {
        self.ctx.emit(SessionEvent::Request { id, request });
    }

    pub fn shutdown(&self) {
        self.ctx.emit(SessionEvent::Shutdown);
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }
}

/// A running engine: the shared context plus the coordinator thread.
pub struct Engine {
    handle: EngineHandle,
    session: Option<JoinHandle<Result<(), EngineError>>>,
}

impl Engine {
    /// Attach to `instrument` and start the coordinator on its own thread.
    pub fn start(
        config: Config,
        instrument: Arc<dyn Instrumentation>,
        mut transport: Box<dyn Transport>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = unbounded_channel();
        let on_exit = options
            .on_exit
            .unwrap_or_else(|| Arc::new(|code| std::process::exit(code)));
        let presets = boot_presets(&config);
        let ctx = EngineContext::new(config, Arc::clone(&instrument), tx, on_exit);
        let sink: Weak<dyn StopSink> = Arc::downgrade(&ctx) as Weak<dyn StopSink>;
        instrument.attach(sink);
        ctx.install_hooks();

        let handle = EngineHandle {
            ctx: Arc::clone(&ctx),
        };
        transport.activate(handle.clone());
        let session = Session::new(Arc::clone(&ctx), rx, transport, options.factory, presets);
        let thread = std::thread::Builder::new()
            .name(format!("{MANAGEMENT_PREFIX}session"))
            .spawn(move || session.run())
            .map_err(EngineError::Spawn)?;
        tracing::info!("engine started");
        Ok(Self {
            handle,
            session: Some(thread),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.handle.ctx
    }

    /// Wait for the coordinator to finish.
    pub fn join(mut self) -> Result<(), EngineError> {
        match self.session.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| EngineError::Corrupted("coordinator panicked".into()))?,
            None => Ok(()),
        }
    }

    /// Stop the coordinator and release every thread.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.handle.shutdown();
        self.join()
    }
}

/// `commands` followed by the lines of `init_script`.
fn boot_presets(config: &Config) -> Vec<String> {
    let mut presets = config.boot_commands();
    if let Some(path) = &config.boot.init_script {
        match std::fs::read_to_string(path) {
            Ok(text) => presets.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            ),
            Err(e) => tracing::warn!("cannot read init script {}: {}", path.display(), e),
        }
    }
    presets
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::instrument::HookRegistry;

    /// A context with no coordinator behind it.
    pub(crate) fn detached_context(config: Config) -> Arc<EngineContext> {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        EngineContext::new(config, Arc::new(HookRegistry::new()), tx, Arc::new(|_| {}))
    }

    #[test]
    fn skip_paths_are_recompiled_on_update() {
        let ctx = detached_context(Config::default());
        assert!(!ctx.skips_path("/gems/lib.rb"));
        let mut config = ctx.config();
        config.control.skip_path = vec!["/gems/".into(), "(".into()];
        ctx.update_config(config);
        assert!(ctx.skips_path("/gems/lib.rb"));
        assert!(ctx.is_internal("<internal:native>"));
    }

    #[test]
    fn threads_are_listed_before_the_coordinator_answers() {
        let ctx = detached_context(Config::default());
        let dbg = crate::debuggee::tests::NullDebuggee;
        let tc = ctx.current_client(&dbg).unwrap();
        assert_eq!(tc.name(), "null");
        assert_eq!(ctx.clients().len(), 1);
        assert_eq!(ctx.current_client(&dbg).unwrap().id(), tc.id());

        ctx.deactivate();
        let other = std::thread::spawn(move || ctx.current_client(&dbg).is_none());
        assert!(other.join().unwrap());
    }

    #[test]
    fn unfreeze_releases_parked_clients_only() {
        let ctx = detached_context(Config::default());
        let me = std::thread::current().id();
        let parked = ctx.new_client(1, "a".into(), me, false);
        let controlling = ctx.new_client(2, "b".into(), me, false);
        let pending = ctx.new_client(3, "c".into(), me, false);
        for tc in [&parked, &controlling, &pending] {
            tc.set_mode(crate::thread_client::Mode::Waiting);
        }
        pending.stop_pending_for_tests();
        ctx.freeze(2);
        assert!(ctx.freeze_state().frozen);
        ctx.unfreeze();
        assert!(!ctx.freeze_state().frozen);
        assert_eq!(parked.pending_commands(), 1);
        assert_eq!(controlling.pending_commands(), 0);
        assert_eq!(pending.pending_commands(), 0);
    }

    #[test]
    fn init_script_lines_follow_commands() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("init");
        std::fs::write(&script, "# comment\nbreak 3\n\ninfo\n").unwrap();
        let mut config = Config::default();
        config.boot.commands = Some("p 1;;p 2".into());
        config.boot.init_script = Some(script);
        let presets = boot_presets(&config);
        assert_eq!(presets.last().map(String::as_str), Some("info"));
        assert!(presets.contains(&"break 3".to_string()));
    }
}
