//! Tracers log execution events without suspending.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::context::EngineContext;
use crate::instrument::{hook, EventKind, ExecEvent, HookAction, HookId, HookSpec};
use crate::session::SessionEvent;
use crate::sync::lock;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum TracerKind {
    Line,
    Call,
    Exception,
    /// Calls that receive or pass the object.
    Object(Value),
}

impl TracerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TracerKind::Line => "line",
            TracerKind::Call => "call",
            TracerKind::Exception => "exception",
            TracerKind::Object(_) => "object",
        }
    }

    fn kinds(&self) -> &'static [EventKind] {
        match self {
            TracerKind::Line => &[EventKind::Line],
            TracerKind::Call => &[
                EventKind::Call,
                EventKind::Return,
                EventKind::BlockReturn,
                EventKind::NativeCall,
                EventKind::NativeReturn,
            ],
            TracerKind::Exception => &[EventKind::Raise],
            TracerKind::Object(_) => &[EventKind::Call, EventKind::NativeCall],
        }
    }
}

#[derive(Debug)]
pub struct Tracer {
    kind: TracerKind,
    pattern: Option<Regex>,
    into: Option<PathBuf>,
    number: Mutex<Option<usize>>,
    hook: Mutex<Option<HookId>>,
}

impl Tracer {
    pub fn new(kind: TracerKind, pattern: Option<Regex>, into: Option<PathBuf>) -> Self {
        Self {
            kind,
            pattern,
            into,
            number: Mutex::new(None),
            hook: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> &TracerKind {
        &self.kind
    }

    pub fn number(&self) -> Option<usize> {
        *lock(&self.number)
    }

    pub(crate) fn set_number(&self, n: usize) {
        *lock(&self.number) = Some(n);
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.hook).is_some()
    }

    pub fn enable(self: &Arc<Self>, ctx: &Arc<EngineContext>) {
        if self.is_enabled() {
            return;
        }
        let tracer = Arc::downgrade(self);
        let weak = Arc::downgrade(ctx);
        let id = ctx.instrumentation().subscribe(
            HookSpec::new(self.kind.kinds()),
            hook(move |h| {
                if let (Some(tracer), Some(ctx)) = (tracer.upgrade(), weak.upgrade()) {
                    if let Some(client) = ctx.current_client(h.debuggee) {
                        if !client.is_management() {
                            tracer.trace(&ctx, h.event, client.id());
                        }
                    }
                }
                HookAction::Pass
            }),
        );
        *lock(&self.hook) = Some(id);
    }

    pub fn disable(&self, ctx: &EngineContext) {
        if let Some(id) = lock(&self.hook).take() {
            ctx.instrumentation().unsubscribe(id);
        }
    }

    fn skip(&self, ctx: &EngineContext, ev: &ExecEvent) -> bool {
        if ctx.is_internal(&ev.location.path) {
            return true;
        }
        match &self.pattern {
            Some(re) => {
                !re.is_match(&ev.location.path)
                    && !ev.callee.as_deref().is_some_and(|c| re.is_match(c))
            }
            None => false,
        }
    }

    fn trace(&self, ctx: &EngineContext, ev: &ExecEvent, thread: usize) {
        if self.skip(ctx, ev) {
            return;
        }
        if let Some(msg) = self.message(ev) {
            let text = format!(
                "DEBUGGER (trace/{}) #th:{} #depth:{:<2}{} at {}",
                self.kind.name(),
                thread,
                ev.depth,
                msg,
                ev.location
            );
            self.out(ctx, text);
        }
    }

    /// The event-specific part of a trace line.
    fn message(&self, ev: &ExecEvent) -> Option<String> {
        let method = ev.method_label().unwrap_or_default();
        let indent = " ".repeat(ev.depth);
        match &self.kind {
            TracerKind::Line => Some(String::new()),
            TracerKind::Call => match ev.kind {
                EventKind::Call | EventKind::NativeCall => Some(format!(">{indent}{method}")),
                EventKind::BlockReturn => Some(format!(
                    "<{indent}block #=> {}",
                    ev.return_value.as_ref().map(Value::inspect).unwrap_or_default()
                )),
                _ => Some(format!(
                    "<{indent}{method} #=> {}",
                    ev.return_value.as_ref().map(Value::inspect).unwrap_or_default()
                )),
            },
            TracerKind::Exception => ev.exception.as_ref().map(|exc| {
                let msg = exc
                    .as_object()
                    .and_then(|o| o.ivar("@message"))
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                format!(" {}: {msg}", exc.class_name())
            }),
            TracerKind::Object(target) => {
                if ev.receiver.as_ref().is_some_and(|r| r.same(target)) {
                    Some(format!(" {} receives {method}", target.inspect()))
                } else if ev.args.iter().any(|a| a.same(target)) {
                    Some(format!(" {} is used as a parameter of {method}", target.inspect()))
                } else {
                    None
                }
            }
        }
    }

    fn out(&self, ctx: &EngineContext, text: String) {
        match &self.into {
            Some(path) => {
                let written = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut f| writeln!(f, "{text}"));
                if let Err(e) = written {
                    tracing::warn!("trace output to {} failed: {}", path.display(), e);
                }
            }
            None => ctx.emit(SessionEvent::Trace(text)),
        }
    }

    /// One line for `trace` listings.
    pub fn label(&self) -> String {
        let mut s = format!(
            "#{} {}Tracer ({})",
            self.number().unwrap_or(0),
            capitalize(self.kind.name()),
            if self.is_enabled() { "enabled" } else { "disabled" }
        );
        if let TracerKind::Object(v) = &self.kind {
            s.push_str(&format!(" for {}", v.inspect()));
        }
        if let Some(re) = &self.pattern {
            s.push_str(&format!(" with pattern /{}/", re.as_str()));
        }
        if let Some(into) = &self.into {
            s.push_str(&format!(" into: {}", into.display()));
        }
        s
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Location;
    use crate::value::Object;

    fn call(depth: usize) -> ExecEvent {
        let mut ev = ExecEvent::new(EventKind::Call, Location::new("a.rb", 3, "Calc#add"), depth);
        ev.class = Some("Calc".into());
        ev.callee = Some("add".into());
        ev
    }

    #[test]
    fn call_and_return_messages_are_indented() {
        let t = Tracer::new(TracerKind::Call, None, None);
        assert_eq!(t.message(&call(2)).unwrap(), ">  Calc#add");
        let mut ret = call(2);
        ret.kind = EventKind::Return;
        ret.return_value = Some(Value::Int(3));
        assert_eq!(t.message(&ret).unwrap(), "<  Calc#add #=> 3");
    }

    #[test]
    fn object_tracer_reports_receiver_and_argument_use() {
        let obj = Value::Object(Object::new("Point"));
        let t = Tracer::new(TracerKind::Object(obj.clone()), None, None);
        let mut ev = call(1);
        assert!(t.message(&ev).is_none());
        ev.args = vec![obj.clone()];
        assert!(t.message(&ev).unwrap().contains("is used as a parameter of Calc#add"));
        ev.receiver = Some(obj);
        assert!(t.message(&ev).unwrap().contains("receives Calc#add"));
    }

    #[test]
    fn exception_message_includes_class() {
        let t = Tracer::new(TracerKind::Exception, None, None);
        let mut ev = ExecEvent::new(EventKind::Raise, Location::new("a.rb", 3, "m"), 1);
        ev.exception = Some(Value::exception("RuntimeError", "boom"));
        assert_eq!(t.message(&ev).unwrap(), " RuntimeError: boom");
    }

    #[test]
    fn label_lists_options() {
        let t = Tracer::new(
            TracerKind::Line,
            Some(Regex::new("app").unwrap()),
            Some(PathBuf::from("/tmp/t.log")),
        );
        t.set_number(1);
        assert_eq!(
            t.label(),
            "#1 LineTracer (disabled) with pattern /app/ into: /tmp/t.log"
        );
    }
}
