//! Requests from protocol adapters and the id tables that answer them.
//!
//! Frame ids and variable references handed to a client are valid for one
//! suspend cycle. The table is cleared on resume and ids are never reused,
//! so a stale id is rejected instead of resolving to a different object.

use std::collections::HashMap;

use serde::Serialize;

use crate::frame::Location;
use crate::value::Value;

/// A request submitted by a protocol adapter.
#[derive(Debug, Clone)]
pub enum ProtocolRequest {
    Threads,
    /// Replace every line breakpoint in `path`.
    SetBreakpoints {
        path: String,
        lines: Vec<(u32, Option<String>)>,
    },
    /// Add one line breakpoint.
    SetBreakpoint {
        path: String,
        line: u32,
        cond: Option<String>,
    },
    RemoveBreakpoint {
        number: usize,
    },
    /// Replace every catch breakpoint. `filters` are exception class names.
    SetExceptionBreakpoints {
        filters: Vec<String>,
    },
    Continue,
    /// Run until `path:line` through a oneshot breakpoint.
    ContinueTo {
        path: String,
        line: u32,
    },
    Next,
    StepIn,
    StepOut,
    StepBack,
    Pause,
    StackTrace {
        thread: Option<usize>,
    },
    Scopes {
        frame: u64,
    },
    Variables {
        reference: u64,
    },
    Evaluate {
        frame: Option<u64>,
        expression: String,
    },
    Completions {
        frame: Option<u64>,
        text: String,
    },
    Source {
        path: String,
    },
    /// A debugger command line.
    Command(String),
    Disconnect,
}

impl ProtocolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolRequest::Threads => "threads",
            ProtocolRequest::SetBreakpoints { .. } => "setBreakpoints",
            ProtocolRequest::SetBreakpoint { .. } => "setBreakpoint",
            ProtocolRequest::RemoveBreakpoint { .. } => "removeBreakpoint",
            ProtocolRequest::SetExceptionBreakpoints { .. } => "setExceptionBreakpoints",
            ProtocolRequest::Continue => "continue",
            ProtocolRequest::ContinueTo { .. } => "continueTo",
            ProtocolRequest::Next => "next",
            ProtocolRequest::StepIn => "stepIn",
            ProtocolRequest::StepOut => "stepOut",
            ProtocolRequest::StepBack => "stepBack",
            ProtocolRequest::Pause => "pause",
            ProtocolRequest::StackTrace { .. } => "stackTrace",
            ProtocolRequest::Scopes { .. } => "scopes",
            ProtocolRequest::Variables { .. } => "variables",
            ProtocolRequest::Evaluate { .. } => "evaluate",
            ProtocolRequest::Completions { .. } => "completions",
            ProtocolRequest::Source { .. } => "source",
            ProtocolRequest::Command(_) => "command",
            ProtocolRequest::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub id: usize,
    pub name: String,
    pub waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointInfo {
    pub number: usize,
    pub verified: bool,
    pub path: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    pub name: String,
    pub variables_reference: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Non-zero when the value has children.
    pub variables_reference: u64,
}

/// The answer to a [`ProtocolRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolReply {
    Threads(Vec<ThreadInfo>),
    Breakpoints(Vec<BreakpointInfo>),
    Ack,
    StackTrace(Vec<FrameInfo>),
    Scopes(Vec<ScopeInfo>),
    Variables(Vec<VariableInfo>),
    Evaluate(VariableInfo),
    Completions(Vec<String>),
    Source(String),
}

/// Whose variables a `Variables` query lists.
#[derive(Debug, Clone, PartialEq)]
pub enum VarScope {
    Locals { frame: usize },
    Globals,
}

/// A query that needs the stopped thread.
#[derive(Debug, Clone)]
pub enum ProtocolQuery {
    StackTrace,
    Variables(VarScope),
    Evaluate {
        frame: Option<usize>,
        expression: String,
    },
    Completions {
        frame: Option<usize>,
        text: String,
    },
}

/// A thread's answer to a [`ProtocolQuery`].
#[derive(Debug, Clone)]
pub enum ProtocolAnswer {
    StackTrace(Vec<Location>),
    Variables(Vec<(String, Value)>),
    Evaluate(Result<Value, String>),
    Completions(Vec<String>),
}

/// What a variable reference designates.
#[derive(Debug, Clone)]
pub enum VarRef {
    Locals { thread: usize, frame: usize },
    Globals { thread: usize },
    Value(Value),
}

pub const INVALID_FRAME: &str = "invalid frame id";
pub const INVALID_VARIABLE: &str = "invalid variable reference";

/// Frame ids and variable references of the current suspend cycle.
#[derive(Debug)]
pub struct IdTable {
    next: u64,
    frames: HashMap<u64, (usize, usize)>,
    frame_ids: HashMap<(usize, usize), u64>,
    vars: HashMap<u64, VarRef>,
}

impl Default for IdTable {
    fn default() -> Self {
        Self {
            next: 1,
            frames: HashMap::new(),
            frame_ids: HashMap::new(),
            vars: HashMap::new(),
        }
    }
}

impl IdTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Id of frame `index` of `thread`. Stable within one cycle.
    pub fn frame_id(&mut self, thread: usize, index: usize) -> u64 {
        if let Some(id) = self.frame_ids.get(&(thread, index)) {
            return *id;
        }
        let id = self.alloc();
        self.frames.insert(id, (thread, index));
        self.frame_ids.insert((thread, index), id);
        id
    }

    pub fn resolve_frame(&self, id: u64) -> Result<(usize, usize), String> {
        self.frames.get(&id).copied().ok_or_else(|| INVALID_FRAME.to_string())
    }

    pub fn var_ref(&mut self, var: VarRef) -> u64 {
        let id = self.alloc();
        self.vars.insert(id, var);
        id
    }

    pub fn resolve_var(&self, id: u64) -> Result<VarRef, String> {
        self.vars.get(&id).cloned().ok_or_else(|| INVALID_VARIABLE.to_string())
    }

    /// Describe `value` for a client, allocating a reference for containers.
    pub fn variable(&mut self, name: &str, value: Value) -> VariableInfo {
        let type_name = value.class_name();
        let text = value.inspect();
        let variables_reference = if value.is_container() {
            self.var_ref(VarRef::Value(value))
        } else {
            0
        };
        VariableInfo {
            name: name.to_string(),
            value: text,
            type_name,
            variables_reference,
        }
    }

    /// Forget every id. Later ids keep counting up.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.frame_ids.clear();
        self.vars.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Object;

    #[test]
    fn frame_ids_are_stable_within_a_cycle() {
        let mut ids = IdTable::new();
        let a = ids.frame_id(1, 0);
        let b = ids.frame_id(1, 1);
        assert_ne!(a, b);
        assert_eq!(ids.frame_id(1, 0), a);
        assert_eq!(ids.resolve_frame(b), Ok((1, 1)));
    }

    #[test]
    fn stale_ids_are_rejected_after_clear() {
        let mut ids = IdTable::new();
        let frame = ids.frame_id(1, 0);
        let var = ids.var_ref(VarRef::Globals { thread: 1 });
        ids.clear();
        assert_eq!(ids.resolve_frame(frame), Err(INVALID_FRAME.to_string()));
        assert_eq!(ids.resolve_var(var).unwrap_err(), INVALID_VARIABLE);
        let fresh = ids.frame_id(1, 0);
        assert!(fresh > var, "ids must not be reused");
    }

    #[test]
    fn containers_get_references() {
        let mut ids = IdTable::new();
        let scalar = ids.variable("x", Value::Int(1));
        assert_eq!(scalar.variables_reference, 0);
        assert_eq!(scalar.type_name, "Integer");

        let obj = Object::new("Point");
        obj.set_ivar("@x", Value::Int(1));
        let info = ids.variable("pt", Value::Object(obj.clone()));
        assert_ne!(info.variables_reference, 0);
        match ids.resolve_var(info.variables_reference).unwrap() {
            VarRef::Value(v) => assert!(v.same(&Value::Object(obj))),
            other => panic!("unexpected {other:?}"),
        }
    }
}
