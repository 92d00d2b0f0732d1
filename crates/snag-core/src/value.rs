//! Runtime values observed and produced by the debugger.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A heap object with instance variables.
#[derive(Debug)]
pub struct Object {
    id: u64,
    class: String,
    ivars: Mutex<BTreeMap<String, Value>>,
}

impl Object {
    /// Allocate a new, empty instance of `class`.
    pub fn new(class: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            class: class.into(),
            ivars: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Read an instance variable. Names include the leading `@`.
    pub fn ivar(&self, name: &str) -> Option<Value> {
        lock(&self.ivars).get(name).cloned()
    }

    pub fn set_ivar(&self, name: impl Into<String>, value: Value) {
        lock(&self.ivars).insert(name.into(), value);
    }

    /// Snapshot of all instance variables, sorted by name.
    pub fn ivars(&self) -> Vec<(String, Value)> {
        lock(&self.ivars)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// A class used as a value, e.g. the receiver of `Calc.new`.
    Class(String),
    Object(Arc<Object>),
}

impl Value {
    /// Build an exception object carrying `message`.
    pub fn exception(class: &str, message: &str) -> Value {
        let obj = Object::new(class);
        obj.set_ivar("@message", Value::Str(message.to_string()));
        Value::Object(obj)
    }

    /// Everything except `nil` and `false` is truthy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn class_name(&self) -> String {
        match self {
            Value::Nil => "NilClass".into(),
            Value::Bool(true) => "TrueClass".into(),
            Value::Bool(false) => "FalseClass".into(),
            Value::Int(_) => "Integer".into(),
            Value::Float(_) => "Float".into(),
            Value::Str(_) => "String".into(),
            Value::List(_) => "Array".into(),
            Value::Class(_) => "Class".into(),
            Value::Object(o) => o.class().to_string(),
        }
    }

    /// Identity comparison: objects compare by id, everything else by value.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.id() == b.id(),
            _ => self == other,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Whether the value has children worth expanding in a variables view.
    pub fn is_container(&self) -> bool {
        match self {
            Value::List(items) => !items.is_empty(),
            Value::Object(o) => !o.ivars().is_empty(),
            _ => false,
        }
    }

    /// Named children: list indices or instance variables.
    pub fn children(&self) -> Vec<(String, Value)> {
        match self {
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
            Value::Object(o) => o.ivars(),
            _ => Vec::new(),
        }
    }

    /// Debug representation (`p`).
    pub fn inspect(&self) -> String {
        match self {
            Value::Nil => "nil".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("{s:?}"),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::inspect).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Class(name) => name.clone(),
            Value::Object(o) => {
                let ivars = o.ivars();
                if ivars.is_empty() {
                    format!("#<{}:{}>", o.class(), o.id())
                } else {
                    let fields: Vec<String> = ivars
                        .iter()
                        .map(|(k, v)| format!("{k}={}", v.inspect()))
                        .collect();
                    format!("#<{}:{} {}>", o.class(), o.id(), fields.join(", "))
                }
            }
        }
    }

    /// Width-aware representation (`pp`): containers that do not fit are
    /// broken one element per line.
    pub fn pretty(&self, width: usize) -> String {
        let flat = self.inspect();
        if flat.len() <= width {
            return flat;
        }
        match self {
            Value::List(items) if !items.is_empty() => {
                let inner: Vec<String> = items
                    .iter()
                    .map(|v| format!(" {}", v.pretty(width.saturating_sub(1))))
                    .collect();
                format!("[{}]", inner.join(",\n").trim_start())
            }
            Value::Object(o) if !o.ivars().is_empty() => {
                let fields: Vec<String> = o
                    .ivars()
                    .iter()
                    .map(|(k, v)| format!("  {k}={}", v.pretty(width.saturating_sub(2))))
                    .collect();
                format!("#<{}:{}\n{}>", o.class(), o.id(), fields.join(",\n"))
            }
            _ => flat,
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

/// `to_s` representation: strings are shown without quotes.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Str(s) => f.write_str(s),
            other => f.write_str(&other.inspect()),
        }
    }
}
