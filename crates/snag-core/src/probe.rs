//! The probe runtime: an instrumented object runtime driven from Rust.
//!
//! Program code calls probes on a [`ProbeThread`] (`line`, `call`, `raise`,
//! ...) and every probe reports an [`ExecEvent`] to the runtime's
//! [`HookRegistry`]. Method bodies are Rust closures, so evaluating an
//! expression from the debugger can run program code and stop again.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::debuggee::{Debuggee, MethodInfo};
use crate::error::{BreakpointError, EvalError};
use crate::expr::{self, Env};
use crate::frame::{Frame, FrameKind, Location, Scope};
use crate::instrument::{EventKind, ExecEvent, HookRegistry, Instrumentation};
use crate::source::CodeUnit;
use crate::sync::{lock, read, write};
use crate::value::{Object, Value};

/// Path reported for frames of opaque methods.
pub const NATIVE_PATH: &str = "<internal:native>";

/// Body of a program method. Arguments are bound as locals of the new frame.
pub type MethodBody = Arc<dyn Fn(&ProbeThread) -> Result<Value, EvalError> + Send + Sync>;

struct MethodDef {
    owner: String,
    name: String,
    params: Vec<String>,
    unit: Option<Arc<CodeUnit>>,
    body: MethodBody,
    native: bool,
}

#[derive(Default)]
struct ClassDef {
    superclass: Option<String>,
    methods: BTreeMap<String, Arc<MethodDef>>,
    singleton_methods: BTreeMap<String, Arc<MethodDef>>,
}

const BUILTIN_CLASSES: &[(&str, Option<&str>)] = &[
    ("Object", None),
    ("Exception", Some("Object")),
    ("StandardError", Some("Exception")),
    ("RuntimeError", Some("StandardError")),
    ("ArgumentError", Some("StandardError")),
    ("TypeError", Some("StandardError")),
    ("ZeroDivisionError", Some("StandardError")),
    ("NameError", Some("StandardError")),
    ("NoMethodError", Some("NameError")),
];

/// Shared state of the probe runtime.
pub struct Runtime {
    hooks: Arc<HookRegistry>,
    classes: RwLock<BTreeMap<String, ClassDef>>,
    globals: Mutex<BTreeMap<String, Value>>,
    native_probes: RwLock<HashSet<(String, String)>>,
    main: Value,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        let classes = BUILTIN_CLASSES
            .iter()
            .map(|(name, sup)| {
                (
                    name.to_string(),
                    ClassDef {
                        superclass: sup.map(str::to_string),
                        ..ClassDef::default()
                    },
                )
            })
            .collect();
        Arc::new(Self {
            hooks: Arc::new(HookRegistry::new()),
            classes: RwLock::new(classes),
            globals: Mutex::new(BTreeMap::new()),
            native_probes: RwLock::new(HashSet::new()),
            main: Value::Object(Object::new("Object")),
        })
    }

    /// The instrumentation capability the engine subscribes to.
    pub fn instrumentation(&self) -> Arc<dyn Instrumentation> {
        Arc::clone(&self.hooks) as Arc<dyn Instrumentation>
    }

    pub fn define_class(&self, name: &str, superclass: Option<&str>) {
        write(&self.classes)
            .entry(name.to_string())
            .or_default()
            .superclass = Some(superclass.unwrap_or("Object").to_string());
    }

    pub fn has_class(&self, name: &str) -> bool {
        read(&self.classes).contains_key(name)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        lock(&self.globals).get(name).cloned()
    }

    pub fn set_global(&self, name: &str, value: Value) {
        lock(&self.globals).insert(name.to_string(), value);
    }

    /// Run `f` as a program thread on the current OS thread.
    pub fn run<F>(self: &Arc<Self>, name: &str, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&ProbeThread) -> Result<Value, EvalError>,
    {
        let thread = ProbeThread::new(Arc::clone(self), name);
        thread.emit(ExecEvent::new(
            EventKind::ThreadBegin,
            Location::new("", 0, name),
            0,
        ));
        let result = f(&thread);
        let mut end = ExecEvent::new(EventKind::ThreadEnd, Location::new("", 0, name), 0);
        if let Err(e) = &result {
            end.exception = Some(Value::exception(e.class_name(), &message_of(e)));
        }
        thread.emit(end);
        result
    }

    /// Run `f` as a program thread on a new OS thread.
    pub fn spawn<F>(
        self: &Arc<Self>,
        name: &str,
        f: F,
    ) -> std::io::Result<JoinHandle<Result<Value, EvalError>>>
    where
        F: FnOnce(&ProbeThread) -> Result<Value, EvalError> + Send + 'static,
    {
        let rt = Arc::clone(self);
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || rt.run(&thread_name, f))
    }

    fn ancestors(&self, class: &str) -> Vec<String> {
        let classes = read(&self.classes);
        let mut out = Vec::new();
        let mut cur = Some(class.to_string());
        while let Some(name) = cur {
            if out.contains(&name) {
                break;
            }
            cur = classes.get(&name).and_then(|c| c.superclass.clone());
            out.push(name);
        }
        out
    }

    fn find_method(&self, class: &str, name: &str, singleton: bool) -> Option<Arc<MethodDef>> {
        let classes = read(&self.classes);
        for c in self.ancestors(class) {
            let def = classes.get(&c)?;
            let table = if singleton {
                &def.singleton_methods
            } else {
                &def.methods
            };
            if let Some(m) = table.get(name) {
                return Some(Arc::clone(m));
            }
        }
        None
    }

    fn native_probe_enabled(&self, class: &str, name: &str) -> bool {
        read(&self.native_probes).contains(&(class.to_string(), name.to_string()))
    }
}

fn message_of(e: &EvalError) -> String {
    match e {
        EvalError::Raised { message, .. } => message.clone(),
        other => {
            let text = other.to_string();
            let prefix = format!("{}: ", other.class_name());
            text.strip_prefix(&prefix).map(str::to_string).unwrap_or(text)
        }
    }
}

struct LiveFrame {
    kind: FrameKind,
    label: String,
    path: String,
    line: u32,
    receiver: Value,
    locals: Arc<Mutex<BTreeMap<String, Value>>>,
    unit: Option<Arc<CodeUnit>>,
}

/// One program thread of the probe runtime.
///
/// Lives on the OS thread that runs the program code.
pub struct ProbeThread {
    rt: Arc<Runtime>,
    name: String,
    stack: RefCell<Vec<LiveFrame>>,
}

impl ProbeThread {
    fn new(rt: Arc<Runtime>, name: &str) -> Self {
        Self {
            rt,
            name: name.to_string(),
            stack: RefCell::new(Vec::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    fn emit(&self, event: ExecEvent) {
        self.rt.hooks.dispatch(&event, self);
    }

    fn top_location(&self) -> Location {
        self.stack
            .borrow()
            .last()
            .map(|f| Location::new(f.path.clone(), f.line, f.label.clone()))
            .unwrap_or_else(|| Location::new("", 0, "<main>"))
    }

    fn event(&self, kind: EventKind) -> ExecEvent {
        ExecEvent::new(kind, self.top_location(), self.stack.borrow().len())
    }

    /// Report that `unit` was compiled from `source`.
    pub fn load(&self, unit: &Arc<CodeUnit>, source: &str) {
        let mut ev = ExecEvent::new(
            EventKind::ScriptCompiled,
            Location::new(unit.path(), unit.first_line(), unit.label()),
            self.stack.borrow().len(),
        );
        ev.unit = Some(Arc::clone(unit));
        ev.source = Some(Arc::from(source));
        self.emit(ev);
    }

    /// Run top-level code of `unit`.
    pub fn run_script<F>(&self, unit: &Arc<CodeUnit>, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&ProbeThread) -> Result<Value, EvalError>,
    {
        self.stack.borrow_mut().push(LiveFrame {
            kind: FrameKind::Top,
            label: unit.label().to_string(),
            path: unit.path().to_string(),
            line: unit.first_line(),
            receiver: self.rt.main.clone(),
            locals: Arc::new(Mutex::new(BTreeMap::new())),
            unit: Some(Arc::clone(unit)),
        });
        let result = f(self);
        self.stack.borrow_mut().pop();
        result
    }

    /// Define an instance method of `class` with code in `unit`.
    pub fn define_method(
        &self,
        class: &str,
        name: &str,
        params: &[&str],
        unit: &Arc<CodeUnit>,
        body: MethodBody,
    ) {
        self.define(class, name, params, Some(Arc::clone(unit)), body, false, false);
    }

    /// Define a class method (`Class.name`).
    pub fn define_singleton_method(
        &self,
        class: &str,
        name: &str,
        params: &[&str],
        unit: &Arc<CodeUnit>,
        body: MethodBody,
    ) {
        self.define(class, name, params, Some(Arc::clone(unit)), body, false, true);
    }

    /// Define an opaque method. It reports no events until a native probe
    /// is enabled for it.
    pub fn define_native(&self, class: &str, name: &str, params: &[&str], body: MethodBody) {
        self.define(class, name, params, None, body, true, false);
    }

    #[allow(clippy::too_many_arguments)]
    fn define(
        &self,
        class: &str,
        name: &str,
        params: &[&str],
        unit: Option<Arc<CodeUnit>>,
        body: MethodBody,
        native: bool,
        singleton: bool,
    ) {
        let def = Arc::new(MethodDef {
            owner: class.to_string(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            unit: unit.clone(),
            body,
            native,
        });
        {
            let mut classes = write(&self.rt.classes);
            let entry = classes.entry(class.to_string()).or_insert_with(|| ClassDef {
                superclass: Some("Object".into()),
                ..ClassDef::default()
            });
            let table = if singleton {
                &mut entry.singleton_methods
            } else {
                &mut entry.methods
            };
            table.insert(name.to_string(), def);
        }
        let location = match &unit {
            Some(u) => Location::new(u.path(), u.first_line(), u.label()),
            None => self.top_location(),
        };
        let mut ev = ExecEvent::new(EventKind::MethodDefined, location, self.stack.borrow().len());
        ev.callee = Some(name.to_string());
        ev.class = Some(class.to_string());
        self.emit(ev);
    }

    /// Report reaching `line` in the current frame.
    pub fn line(&self, line: u32) {
        if let Some(top) = self.stack.borrow_mut().last_mut() {
            top.line = line;
        }
        let ev = self.event(EventKind::Line);
        self.emit(ev);
    }

    /// Read a local of the current frame (`nil` when unset).
    pub fn get(&self, name: &str) -> Value {
        self.stack
            .borrow()
            .last()
            .and_then(|f| lock(&f.locals).get(name).cloned())
            .unwrap_or(Value::Nil)
    }

    pub fn set(&self, name: &str, value: Value) {
        if let Some(top) = self.stack.borrow().last() {
            lock(&top.locals).insert(name.to_string(), value);
        }
    }

    /// `self` of the current frame.
    pub fn receiver(&self) -> Value {
        self.stack
            .borrow()
            .last()
            .map(|f| f.receiver.clone())
            .unwrap_or_else(|| self.rt.main.clone())
    }

    /// Evaluate program code in the current frame. Errors are raised as
    /// program exceptions.
    pub fn eval(&self, src: &str) -> Result<Value, EvalError> {
        let env = self.top_env(true);
        expr::evaluate(src, &env).map_err(|e| self.raise_error(e))
    }

    /// Raise an exception of `class` from the current location.
    pub fn raise(&self, class: &str, message: &str) -> EvalError {
        self.raise_error(EvalError::Raised {
            class: class.to_string(),
            message: message.to_string(),
        })
    }

    fn raise_error(&self, err: EvalError) -> EvalError {
        let err = match err {
            e @ EvalError::Raised { .. } => e,
            other => EvalError::Raised {
                class: other.class_name().to_string(),
                message: message_of(&other),
            },
        };
        let mut ev = self.event(EventKind::Raise);
        ev.exception = Some(Value::exception(err.class_name(), &message_of(&err)));
        self.emit(ev);
        err
    }

    /// Run a block body in a new block frame.
    pub fn block<F>(&self, unit: &Arc<CodeUnit>, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&ProbeThread) -> Result<Value, EvalError>,
    {
        let receiver = self.receiver();
        self.stack.borrow_mut().push(LiveFrame {
            kind: FrameKind::Block,
            label: unit.label().to_string(),
            path: unit.path().to_string(),
            line: unit.first_line(),
            receiver,
            locals: Arc::new(Mutex::new(BTreeMap::new())),
            unit: Some(Arc::clone(unit)),
        });
        let result = f(self);
        if let Ok(v) = &result {
            let mut ev = self.event(EventKind::BlockReturn);
            ev.return_value = Some(v.clone());
            self.emit(ev);
        }
        self.stack.borrow_mut().pop();
        result
    }

    /// Call `name` on `recv`.
    pub fn call(&self, recv: &Value, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let (class, singleton) = match recv {
            Value::Class(c) => (c.clone(), true),
            other => (other.class_name(), false),
        };
        let method = match self.rt.find_method(&class, name, singleton) {
            Some(m) => m,
            None if singleton && name == "new" => return self.instantiate(&class, args),
            None => {
                return Err(EvalError::NoMethod {
                    name: name.to_string(),
                    receiver: recv.inspect(),
                })
            }
        };
        if args.len() != method.params.len() {
            return Err(self.raise(
                "ArgumentError",
                &format!(
                    "wrong number of arguments (given {}, expected {})",
                    args.len(),
                    method.params.len()
                ),
            ));
        }
        if method.native {
            self.invoke_native(&method, recv, args)
        } else {
            self.invoke(&method, recv, args)
        }
    }

    fn instantiate(&self, class: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let obj = Value::Object(Object::new(class));
        if self.rt.find_method(class, "initialize", false).is_some() {
            self.call(&obj, "initialize", args)?;
        }
        Ok(obj)
    }

    fn bind_params(method: &MethodDef, args: Vec<Value>) -> BTreeMap<String, Value> {
        method.params.iter().cloned().zip(args).collect()
    }

    fn invoke(&self, method: &MethodDef, recv: &Value, args: Vec<Value>) -> Result<Value, EvalError> {
        let (path, line, label) = match &method.unit {
            Some(u) => (u.path().to_string(), u.first_line(), u.label().to_string()),
            None => (String::new(), 0, format!("{}#{}", method.owner, method.name)),
        };
        self.stack.borrow_mut().push(LiveFrame {
            kind: FrameKind::Method,
            label,
            path,
            line,
            receiver: recv.clone(),
            locals: Arc::new(Mutex::new(Self::bind_params(method, args.clone()))),
            unit: method.unit.clone(),
        });

        let mut call = self.event(EventKind::Call);
        call.callee = Some(method.name.clone());
        call.class = Some(method.owner.clone());
        call.receiver = Some(recv.clone());
        call.args = args;
        self.emit(call);

        let result = (method.body)(self);

        if let Ok(v) = &result {
            let mut ret = self.event(EventKind::Return);
            ret.callee = Some(method.name.clone());
            ret.class = Some(method.owner.clone());
            ret.receiver = Some(recv.clone());
            ret.return_value = Some(v.clone());
            self.emit(ret);
        }
        self.stack.borrow_mut().pop();
        result
    }

    fn invoke_native(
        &self,
        method: &MethodDef,
        recv: &Value,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        let caller = self.top_location();
        self.stack.borrow_mut().push(LiveFrame {
            kind: FrameKind::Native,
            label: format!("{}#{}", method.owner, method.name),
            path: NATIVE_PATH.to_string(),
            line: 0,
            receiver: recv.clone(),
            locals: Arc::new(Mutex::new(Self::bind_params(method, args.clone()))),
            unit: None,
        });
        let probed = self.rt.native_probe_enabled(&method.owner, &method.name);
        let depth = self.stack.borrow().len();
        if probed {
            let mut ev = ExecEvent::new(EventKind::NativeCall, caller.clone(), depth);
            ev.callee = Some(method.name.clone());
            ev.class = Some(method.owner.clone());
            ev.receiver = Some(recv.clone());
            ev.args = args;
            self.emit(ev);
        }
        let result = (method.body)(self);
        if probed {
            if let Ok(v) = &result {
                let mut ev = ExecEvent::new(EventKind::NativeReturn, caller, depth);
                ev.callee = Some(method.name.clone());
                ev.class = Some(method.owner.clone());
                ev.return_value = Some(v.clone());
                self.emit(ev);
            }
        }
        self.stack.borrow_mut().pop();
        result
    }

    fn top_env(&self, define_locals: bool) -> FrameEnv<'_> {
        let top = self
            .stack
            .borrow()
            .last()
            .map(|f| (Arc::clone(&f.locals), f.receiver.clone()));
        let (scope, receiver) = match top {
            Some((locals, receiver)) => (Scope::new(locals), receiver),
            None => (Scope::detached(BTreeMap::new()), self.rt.main.clone()),
        };
        FrameEnv {
            thread: self,
            scope: Arc::new(scope),
            receiver,
            define_locals,
        }
    }
}

struct FrameEnv<'a> {
    thread: &'a ProbeThread,
    scope: Arc<Scope>,
    receiver: Value,
    /// Program code creates real locals; debugger code uses the overlay.
    define_locals: bool,
}

impl Env for FrameEnv<'_> {
    fn local(&self, name: &str) -> Option<Value> {
        self.scope.get(name)
    }

    fn set_local(&self, name: &str, value: Value) {
        if self.define_locals {
            self.scope.define(name, value);
        } else {
            self.scope.set(name, value);
        }
    }

    fn receiver(&self) -> Value {
        self.receiver.clone()
    }

    fn global(&self, name: &str) -> Option<Value> {
        self.thread.rt.global(name)
    }

    fn set_global(&self, name: &str, value: Value) {
        self.thread.rt.set_global(name, value);
    }

    fn has_class(&self, name: &str) -> bool {
        self.thread.rt.has_class(name)
    }

    fn call(&self, recv: &Value, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        self.thread.call(recv, name, args)
    }
}

impl Debuggee for ProbeThread {
    fn thread_name(&self) -> String {
        self.name.clone()
    }

    fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    fn capture_frames(&self) -> Vec<Frame> {
        let stack = self.stack.borrow();
        stack
            .iter()
            .enumerate()
            .rev()
            .map(|(i, f)| {
                let mut frame = Frame::new(
                    Location::new(f.path.clone(), f.line, f.label.clone()),
                    f.kind,
                    f.receiver.clone(),
                    i + 1,
                );
                if f.kind != FrameKind::Native {
                    frame.scope = Some(Arc::new(Scope::new(Arc::clone(&f.locals))));
                }
                frame.unit = f.unit.as_ref().map(|u| {
                    CodeUnit::unit_at(u, f.line).unwrap_or_else(|| Arc::clone(u))
                });
                frame
            })
            .collect()
    }

    fn evaluate(&self, frame: Option<&Frame>, src: &str) -> Result<Value, EvalError> {
        let env = match frame {
            Some(f) => FrameEnv {
                thread: self,
                scope: match &f.scope {
                    Some(s) => Arc::clone(s),
                    None => Arc::new(Scope::detached(BTreeMap::new())),
                },
                receiver: f.receiver.clone(),
                define_locals: false,
            },
            None => self.top_env(false),
        };
        expr::evaluate(src, &env)
    }

    fn resolve_method(
        &self,
        class: &str,
        name: &str,
        singleton: bool,
    ) -> Result<MethodInfo, BreakpointError> {
        if !self.rt.has_class(class) {
            return Err(BreakpointError::UnknownClass(class.to_string()));
        }
        let def = self
            .rt
            .find_method(class, name, singleton)
            .ok_or_else(|| BreakpointError::UnknownMethod {
                class: class.to_string(),
                name: name.to_string(),
            })?;
        Ok(MethodInfo {
            owner: def.owner.clone(),
            name: def.name.clone(),
            native: def.native,
            location: def
                .unit
                .as_ref()
                .map(|u| Location::new(u.path(), u.first_line(), u.label())),
        })
    }

    fn enable_native_probe(&self, class: &str, name: &str) {
        write(&self.rt.native_probes).insert((class.to_string(), name.to_string()));
    }

    fn ancestors(&self, class: &str) -> Vec<String> {
        self.rt.ancestors(class)
    }

    fn globals(&self) -> Vec<(String, Value)> {
        lock(&self.rt.globals)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn methods_of(&self, value: &Value) -> Vec<(String, Vec<String>)> {
        let (class, singleton) = match value {
            Value::Class(c) => (c.clone(), true),
            other => (other.class_name(), false),
        };
        let classes = read(&self.rt.classes);
        self.rt
            .ancestors(&class)
            .into_iter()
            .filter_map(|c| {
                let def = classes.get(&c)?;
                let table = if singleton {
                    &def.singleton_methods
                } else {
                    &def.methods
                };
                let names: Vec<String> = table.keys().cloned().collect();
                if names.is_empty() {
                    None
                } else {
                    let label = if singleton { format!("{c}.methods") } else { format!("{c}#methods") };
                    Some((label, names))
                }
            })
            .collect()
    }

    fn constants(&self) -> Vec<String> {
        read(&self.rt.classes).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{hook, HookAction, HookSpec};

    fn calc_unit() -> Arc<CodeUnit> {
        CodeUnit::script("calc.rb", 1, 12)
            .lines([10, 11])
            .child(CodeUnit::method("Calc#add", 2, 5).lines([3, 4]))
            .build()
    }

    fn define_calc(t: &ProbeThread, unit: &Arc<CodeUnit>) {
        let add = Arc::clone(&unit.children()[0]);
        t.define_method(
            "Calc",
            "add",
            &["a", "b"],
            &add,
            Arc::new(|t: &ProbeThread| {
                t.line(3);
                t.eval("sum = a + b")?;
                t.line(4);
                Ok(t.get("sum"))
            }),
        );
    }

    fn record(rt: &Arc<Runtime>) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        rt.instrumentation().subscribe(
            HookSpec::new(&[
                EventKind::Line,
                EventKind::Call,
                EventKind::Return,
                EventKind::NativeCall,
                EventKind::Raise,
                EventKind::ScriptCompiled,
                EventKind::MethodDefined,
            ]),
            hook(move |ctx| {
                sink.lock().unwrap().push(format!(
                    "{} {}:{} d{}",
                    ctx.event.kind.as_str(),
                    ctx.event.location.path,
                    ctx.event.location.line,
                    ctx.event.depth
                ));
                HookAction::Pass
            }),
        );
        log
    }

    #[test]
    fn events_follow_program_structure() {
        let rt = Runtime::new();
        let log = record(&rt);
        let unit = calc_unit();
        let result = rt
            .run("main", |t| {
                t.load(&unit, "src");
                define_calc(t, &unit);
                t.run_script(&unit, |t| {
                    t.line(10);
                    let calc = t.call(&Value::Class("Calc".into()), "new", vec![])?;
                    t.line(11);
                    t.call(&calc, "add", vec![Value::Int(1), Value::Int(2)])
                })
            })
            .unwrap();
        assert_eq!(result, Value::Int(3));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "script_compiled calc.rb:1 d0",
                "method_added calc.rb:2 d0",
                "line calc.rb:10 d1",
                "line calc.rb:11 d1",
                "call calc.rb:2 d2",
                "line calc.rb:3 d2",
                "line calc.rb:4 d2",
                "return calc.rb:4 d2",
            ]
        );
    }

    #[test]
    fn capture_frames_innermost_first_with_live_scope() {
        let rt = Runtime::new();
        let unit = calc_unit();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&frames);
        rt.instrumentation().subscribe(
            HookSpec::new(&[EventKind::Line]),
            hook(move |ctx| {
                if ctx.event.location.line == 4 {
                    let captured = ctx.debuggee.capture_frames();
                    let v = ctx.debuggee.evaluate(captured.first(), "sum * 10").unwrap();
                    ctx.debuggee.evaluate(captured.first(), "sum = 100").unwrap();
                    out.lock().unwrap().push((captured, v));
                }
                HookAction::Pass
            }),
        );
        let result = rt
            .run("main", |t| {
                define_calc(t, &unit);
                t.run_script(&unit, |t| {
                    t.line(10);
                    let calc = t.call(&Value::Class("Calc".into()), "new", vec![])?;
                    t.call(&calc, "add", vec![Value::Int(2), Value::Int(5)])
                })
            })
            .unwrap();
        assert_eq!(result, Value::Int(100), "assignment from a hook mutates live state");
        let frames = frames.lock().unwrap();
        let (captured, v) = &frames[0];
        assert_eq!(*v, Value::Int(70));
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].label(), "Calc#add");
        assert_eq!(captured[0].depth, 2);
        assert_eq!(captured[1].label(), "<main>");
        assert_eq!(captured[1].depth, 1);
    }

    #[test]
    fn native_methods_report_only_when_probed() {
        let rt = Runtime::new();
        let log = record(&rt);
        rt.run("main", |t| {
            t.define_native("Math", "twice", &["x"], Arc::new(|t: &ProbeThread| t.eval("x * 2")));
            let unit = CodeUnit::script("n.rb", 1, 3).lines([1, 2]).build();
            t.run_script(&unit, |t| {
                t.line(1);
                t.call(&Value::Class("Math".into()), "new", vec![])?;
                let m = Value::Object(Object::new("Math"));
                t.call(&m, "twice", vec![Value::Int(2)])?;
                t.enable_native_probe("Math", "twice");
                t.line(2);
                t.call(&m, "twice", vec![Value::Int(2)])
            })
        })
        .unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| l.starts_with("c_call")).count(), 1);
        assert!(log.iter().any(|l| l == "c_call n.rb:2 d2"), "{log:?}");
    }

    #[test]
    fn raise_reports_and_thread_end_carries_exception() {
        let rt = Runtime::new();
        let ends = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&ends);
        rt.instrumentation().subscribe(
            HookSpec::new(&[EventKind::ThreadEnd, EventKind::Raise]),
            hook(move |ctx| {
                out.lock().unwrap().push((
                    ctx.event.kind,
                    ctx.event.exception.as_ref().map(|e| e.class_name()),
                ));
                HookAction::Pass
            }),
        );
        let err = rt
            .run("main", |t| {
                let unit = CodeUnit::script("e.rb", 1, 2).lines([1]).build();
                t.run_script(&unit, |t| {
                    t.line(1);
                    t.eval("1 / 0")
                })
            })
            .unwrap_err();
        assert_eq!(err.class_name(), "ZeroDivisionError");
        assert_eq!(
            *ends.lock().unwrap(),
            vec![
                (EventKind::Raise, Some("ZeroDivisionError".to_string())),
                (EventKind::ThreadEnd, Some("ZeroDivisionError".to_string())),
            ]
        );
    }

    #[test]
    fn resolve_method_and_ancestors() {
        let rt = Runtime::new();
        rt.define_class("Calc", None);
        rt.run("main", |t| {
            define_calc(t, &calc_unit());
            let info = t.resolve_method("Calc", "add", false).unwrap();
            assert_eq!(info.owner, "Calc");
            assert!(!info.native);
            assert_eq!(info.location.unwrap().line, 2);
            assert!(matches!(
                t.resolve_method("Nope", "add", false),
                Err(BreakpointError::UnknownClass(_))
            ));
            assert!(matches!(
                t.resolve_method("Calc", "mul", false),
                Err(BreakpointError::UnknownMethod { .. })
            ));
            assert_eq!(t.ancestors("NoMethodError"), vec!["NoMethodError", "NameError", "StandardError", "Exception", "Object"]);
            Ok(Value::Nil)
        })
        .unwrap();
    }

    #[test]
    fn arity_mismatch_raises_argument_error() {
        let rt = Runtime::new();
        let err = rt
            .run("main", |t| {
                define_calc(t, &calc_unit());
                let calc = t.call(&Value::Class("Calc".into()), "new", vec![])?;
                t.call(&calc, "add", vec![Value::Int(1)])
            })
            .unwrap_err();
        assert_eq!(err.class_name(), "ArgumentError");
    }
}
