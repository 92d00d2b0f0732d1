//! Captured call-stack entries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::source::CodeUnit;
use crate::sync::lock;
use crate::value::Value;

/// A source position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub path: String,
    pub line: u32,
    /// Method or block label, `<main>` for top-level code.
    pub label: String,
}

impl Location {
    pub fn new(path: impl Into<String>, line: u32, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line,
            label: label.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

/// What kind of code a frame executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Top,
    Method,
    Block,
    /// Opaque code with no lexical scope.
    Native,
    Eval,
}

/// The lexical scope of a frame.
///
/// Existing locals are shared with the live frame, so assignments from the
/// debugger mutate program state. Locals first introduced by the debugger
/// land in an overlay that is created on first use and stays with the
/// captured frame.
#[derive(Debug)]
pub struct Scope {
    shared: Arc<Mutex<BTreeMap<String, Value>>>,
    overlay: Mutex<Option<BTreeMap<String, Value>>>,
}

impl Scope {
    /// Wrap the live locals of a frame.
    pub fn new(shared: Arc<Mutex<BTreeMap<String, Value>>>) -> Self {
        Self {
            shared,
            overlay: Mutex::new(None),
        }
    }

    /// A scope holding a private copy of `locals`.
    pub fn detached(locals: BTreeMap<String, Value>) -> Self {
        Self::new(Arc::new(Mutex::new(locals)))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = lock(&self.overlay).as_ref().and_then(|o| o.get(name)) {
            return Some(v.clone());
        }
        lock(&self.shared).get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        {
            let mut shared = lock(&self.shared);
            if let Some(slot) = shared.get_mut(name) {
                *slot = value;
                return;
            }
        }
        lock(&self.overlay)
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), value);
    }

    /// Create or overwrite a local of the live frame.
    pub fn define(&self, name: &str, value: Value) {
        lock(&self.shared).insert(name.to_string(), value);
    }

    /// All visible locals, sorted by name.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let mut all = lock(&self.shared).clone();
        if let Some(overlay) = lock(&self.overlay).as_ref() {
            all.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all.into_iter().collect()
    }

    /// Whether the debugger introduced any locals.
    pub fn has_overlay(&self) -> bool {
        lock(&self.overlay).is_some()
    }

    fn snapshot(&self) -> Scope {
        Scope::detached(self.entries().into_iter().collect())
    }
}

/// One call-stack entry captured at a suspend point.
#[derive(Debug, Clone)]
pub struct Frame {
    pub location: Location,
    pub kind: FrameKind,
    /// `self` of the frame.
    pub receiver: Value,
    /// Absent for native frames.
    pub scope: Option<Arc<Scope>>,
    /// Number of frames on the stack, this one included.
    pub depth: usize,
    pub return_value: Option<Value>,
    pub raised: Option<Value>,
    pub unit: Option<Arc<CodeUnit>>,
    /// Last line shown by incremental `list`.
    pub show_line: Option<u32>,
}

impl Frame {
    pub fn new(location: Location, kind: FrameKind, receiver: Value, depth: usize) -> Self {
        Self {
            location,
            kind,
            receiver,
            scope: None,
            depth,
            return_value: None,
            raised: None,
            unit: None,
            show_line: None,
        }
    }

    pub fn with_scope(mut self, scope: Arc<Scope>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_unit(mut self, unit: Arc<CodeUnit>) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn path(&self) -> &str {
        &self.location.path
    }

    pub fn line(&self) -> u32 {
        self.location.line
    }

    pub fn label(&self) -> &str {
        &self.location.label
    }

    pub fn local_variables(&self) -> Vec<(String, Value)> {
        self.scope.as_ref().map(|s| s.entries()).unwrap_or_default()
    }

    /// A copy whose scope no longer aliases the live frame.
    pub fn snapshot(&self) -> Frame {
        let mut f = self.clone();
        f.scope = self.scope.as_ref().map(|s| Arc::new(s.snapshot()));
        f
    }

    /// One-line description used by backtraces.
    pub fn describe(&self) -> String {
        let mut s = format!("{} at {}", self.location.label, self.location);
        if let Some(v) = &self.return_value {
            s.push_str(&format!(" #=> {}", v.inspect()));
        }
        if let Some(e) = &self.raised {
            s.push_str(&format!(" #=> raised {}", e.inspect()));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live() -> Arc<Mutex<BTreeMap<String, Value>>> {
        let mut m = BTreeMap::new();
        m.insert("x".to_string(), Value::Int(1));
        Arc::new(Mutex::new(m))
    }

    #[test]
    fn existing_locals_write_through() {
        let shared = live();
        let scope = Scope::new(Arc::clone(&shared));
        scope.set("x", Value::Int(5));
        assert_eq!(lock(&shared).get("x"), Some(&Value::Int(5)));
        assert!(!scope.has_overlay());
    }

    #[test]
    fn new_locals_go_to_overlay() {
        let shared = live();
        let scope = Scope::new(Arc::clone(&shared));
        scope.set("y", Value::Int(2));
        assert!(lock(&shared).get("y").is_none());
        assert_eq!(scope.get("y"), Some(Value::Int(2)));
        assert_eq!(scope.entries().len(), 2);
        assert!(scope.has_overlay());
    }

    #[test]
    fn snapshot_detaches_scope() {
        let shared = live();
        let frame = Frame::new(Location::new("a.rb", 3, "<main>"), FrameKind::Top, Value::Nil, 1)
            .with_scope(Arc::new(Scope::new(Arc::clone(&shared))));
        let snap = frame.snapshot();
        lock(&shared).insert("x".into(), Value::Int(9));
        assert_eq!(snap.local_variables(), vec![("x".to_string(), Value::Int(1))]);
        assert_eq!(frame.local_variables(), vec![("x".to_string(), Value::Int(9))]);
    }

    #[test]
    fn describe_includes_return_value() {
        let mut frame = Frame::new(Location::new("a.rb", 7, "Calc#add"), FrameKind::Method, Value::Nil, 2);
        assert_eq!(frame.describe(), "Calc#add at a.rb:7");
        frame.return_value = Some(Value::Int(3));
        assert_eq!(frame.describe(), "Calc#add at a.rb:7 #=> 3");
    }
}
