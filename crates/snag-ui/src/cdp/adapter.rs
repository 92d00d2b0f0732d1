//! Translation between Chrome DevTools Protocol messages and engine
//! requests and events.
//!
//! DevTools wants a complete call stack with every `Debugger.paused`, so a
//! stop triggers an internal stack-trace request and the event goes out
//! when it is answered.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::{json, Value};
use snag_core::session::protocol::{BreakpointInfo, FrameInfo, VariableInfo};
use snag_core::{EngineEvent, ProtocolReply, ProtocolRequest};

use crate::link::{Link, Outgoing};

/// JSON-RPC "invalid params".
const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC "server error".
const SERVER_ERROR: i64 = -32000;

/// A message from DevTools.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    /// Reply with an empty result.
    Empty(i64),
    ScriptSource(i64),
    Breakpoint { id: i64, line: u32, url: String },
    RemoveBreakpoint { id: i64, key: String },
    Evaluate(i64),
    /// First half of a scope lookup: pick the scope, then its variables.
    Scope { id: i64, global: bool },
    Properties(i64),
    /// The stack for a `Debugger.paused` being built.
    Paused { reason: &'static str, breakpoints: Vec<usize> },
}

/// Per-connection CDP state.
#[derive(Debug, Default)]
pub(crate) struct CdpAdapter {
    pending: HashMap<u64, Pending>,
    /// callFrameId -> session frame id.
    frames: HashMap<String, u64>,
    /// objectId -> session variable reference.
    objects: HashMap<String, u64>,
    /// `"<n>:<line>:<url>"` -> breakpoint number.
    breakpoints: HashMap<String, usize>,
    scripts: HashSet<String>,
    enabled: bool,
    held: Option<EngineEvent>,
}

fn path_of(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

fn url_of(path: &str) -> String {
    if path.contains("://") {
        path.to_string()
    } else {
        format!("file://{path}")
    }
}

/// DevTools reasons: `exception`, `other`, ...
fn paused_reason(reason: snag_core::StopReason) -> &'static str {
    match reason.as_str() {
        "exception" => "exception",
        _ => "other",
    }
}

fn timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

impl CdpAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn forward(&mut self, link: &Link, request: ProtocolRequest, pending: Pending) {
        let id = link.next_request_id();
        self.pending.insert(id, pending);
        link.submit(id, request);
    }

    fn object_id(&mut self, reference: u64) -> Option<String> {
        (reference != 0).then(|| {
            let object_id = format!("var:{reference}");
            self.objects.insert(object_id.clone(), reference);
            object_id
        })
    }

    fn remote_object(&mut self, var: &VariableInfo) -> Value {
        let (kind, subtype) = match var.type_name.as_str() {
            "Integer" | "Float" => ("number", None),
            "String" => ("string", None),
            "TrueClass" | "FalseClass" => ("boolean", None),
            "NilClass" => ("object", Some("null")),
            "Array" => ("object", Some("array")),
            _ => ("object", None),
        };
        let mut object = json!({
            "type": kind,
            "className": var.type_name,
            "description": var.value,
        });
        if kind != "object" {
            object["value"] = match kind {
                "number" => var
                    .value
                    .parse::<f64>()
                    .map(|n| json!(n))
                    .unwrap_or_else(|_| json!(var.value)),
                "boolean" => json!(var.value == "true"),
                _ => json!(var.value.trim_matches('"')),
            };
        }
        if let Some(subtype) = subtype {
            object["subtype"] = json!(subtype);
        }
        if let Some(object_id) = self.object_id(var.variables_reference) {
            object["objectId"] = json!(object_id);
        }
        object
    }

    /// Handle one DevTools command; returns the messages to send right away.
    pub(crate) fn on_command(&mut self, cmd: Command, link: &Link) -> Vec<Value> {
        tracing::debug!(id = cmd.id, "CDP command {}", cmd.method);
        let params = &cmd.params;
        let str_param = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_string);
        match cmd.method.as_str() {
            "Debugger.enable" => {
                self.enabled = true;
                let mut out = vec![result(cmd.id, json!({ "debuggerId": "snag" }))];
                if let Some(event) = self.held.take() {
                    out.extend(self.on_event(event, link));
                }
                out
            }
            "Runtime.enable" => vec![
                result(cmd.id, json!({})),
                event(
                    "Runtime.executionContextCreated",
                    json!({ "context": { "id": 1, "origin": "", "name": "snag" } }),
                ),
            ],
            "Page.getResourceTree" => vec![result(
                cmd.id,
                json!({
                    "frameTree": {
                        "frame": {
                            "id": "snag",
                            "loaderId": "snag",
                            "url": "http://debuggee/",
                            "securityOrigin": "http://debuggee",
                            "mimeType": "text/plain",
                        },
                        "resources": [],
                    }
                }),
            )],
            "Runtime.runIfWaitingForDebugger"
            | "Runtime.getIsolateId"
            | "Debugger.setAsyncCallStackDepth"
            | "Debugger.setBlackboxPatterns"
            | "Debugger.setPauseOnExceptions"
            | "Runtime.releaseObjectGroup"
            | "Log.clear" => vec![result(cmd.id, json!({}))],
            "Debugger.getScriptSource" => match str_param("scriptId") {
                Some(path) => {
                    self.forward(link, ProtocolRequest::Source { path }, Pending::ScriptSource(cmd.id));
                    Vec::new()
                }
                None => vec![error(cmd.id, INVALID_PARAMS, "scriptId is required")],
            },
            "Debugger.setBreakpointByUrl" => {
                let line = params.get("lineNumber").and_then(Value::as_u64);
                let (Some(line), Some(url)) = (line, str_param("url")) else {
                    return vec![error(cmd.id, INVALID_PARAMS, "lineNumber and url are required")];
                };
                let line = line as u32;
                let cond = str_param("condition").filter(|c| !c.is_empty());
                let request = ProtocolRequest::SetBreakpoint {
                    path: path_of(&url).to_string(),
                    line: line + 1,
                    cond,
                };
                self.forward(link, request, Pending::Breakpoint { id: cmd.id, line, url });
                Vec::new()
            }
            "Debugger.removeBreakpoint" => {
                let key = str_param("breakpointId").unwrap_or_default();
                match self.breakpoints.get(&key) {
                    Some(&number) => {
                        let pending = Pending::RemoveBreakpoint { id: cmd.id, key };
                        self.forward(link, ProtocolRequest::RemoveBreakpoint { number }, pending);
                        Vec::new()
                    }
                    None => vec![error(cmd.id, INVALID_PARAMS, "unknown breakpoint id")],
                }
            }
            "Debugger.resume" => self.control(link, cmd.id, ProtocolRequest::Continue),
            "Debugger.continueToLocation" => {
                let location = params.get("location");
                let path = location.and_then(|l| l.get("scriptId")).and_then(Value::as_str);
                let line = location.and_then(|l| l.get("lineNumber")).and_then(Value::as_u64);
                let (Some(path), Some(line)) = (path, line) else {
                    return vec![error(cmd.id, INVALID_PARAMS, "location is required")];
                };
                let request = ProtocolRequest::ContinueTo {
                    path: path.to_string(),
                    line: line as u32 + 1,
                };
                self.control(link, cmd.id, request)
            }
            "Debugger.stepOver" => self.control(link, cmd.id, ProtocolRequest::Next),
            "Debugger.stepInto" => self.control(link, cmd.id, ProtocolRequest::StepIn),
            "Debugger.stepOut" => self.control(link, cmd.id, ProtocolRequest::StepOut),
            "Debugger.pause" => self.control(link, cmd.id, ProtocolRequest::Pause),
            "Debugger.evaluateOnCallFrame" => {
                let frame = str_param("callFrameId").and_then(|f| self.frames.get(&f).copied());
                let (Some(frame), Some(expression)) = (frame, str_param("expression")) else {
                    return vec![error(cmd.id, INVALID_PARAMS, "invalid call frame")];
                };
                let request = ProtocolRequest::Evaluate {
                    frame: Some(frame),
                    expression,
                };
                self.forward(link, request, Pending::Evaluate(cmd.id));
                Vec::new()
            }
            "Runtime.evaluate" => match str_param("expression") {
                Some(expression) => {
                    let request = ProtocolRequest::Evaluate {
                        frame: None,
                        expression,
                    };
                    self.forward(link, request, Pending::Evaluate(cmd.id));
                    Vec::new()
                }
                None => vec![error(cmd.id, INVALID_PARAMS, "expression is required")],
            },
            "Runtime.getProperties" => {
                let object_id = str_param("objectId").unwrap_or_default();
                if let Some(scope) = object_id.strip_prefix("scope:") {
                    let (frame, kind) = scope.split_once(':').unwrap_or((scope, "local"));
                    let Some(&frame) = self.frames.get(&format!("frame:{frame}")) else {
                        return vec![error(cmd.id, INVALID_PARAMS, "invalid scope")];
                    };
                    let pending = Pending::Scope {
                        id: cmd.id,
                        global: kind == "global",
                    };
                    self.forward(link, ProtocolRequest::Scopes { frame }, pending);
                    return Vec::new();
                }
                match self.objects.get(&object_id) {
                    Some(&reference) => {
                        let request = ProtocolRequest::Variables { reference };
                        self.forward(link, request, Pending::Properties(cmd.id));
                        Vec::new()
                    }
                    None => vec![error(cmd.id, INVALID_PARAMS, "invalid object id")],
                }
            }
            other => {
                tracing::debug!("unsupported CDP method {}", other);
                vec![result(cmd.id, json!({}))]
            }
        }
    }

    fn control(&mut self, link: &Link, id: i64, request: ProtocolRequest) -> Vec<Value> {
        self.forward(link, request, Pending::Empty(id));
        Vec::new()
    }

    /// Translate session output; `Flush` is handled by the caller.
    pub(crate) fn on_outgoing(&mut self, out: Outgoing, link: &Link) -> Vec<Value> {
        match out {
            Outgoing::Out(line) => vec![event(
                "Runtime.consoleAPICalled",
                json!({
                    "type": "log",
                    "args": [{ "type": "string", "value": line }],
                    "executionContextId": 1,
                    "timestamp": timestamp(),
                }),
            )],
            Outgoing::Prompt { .. } | Outgoing::Quit(_) | Outgoing::Flush(_) => Vec::new(),
            Outgoing::Ask { .. } => {
                link.answer(String::new());
                Vec::new()
            }
            Outgoing::Event(e) => self.on_event(e, link),
            Outgoing::Reply { id, reply } => match self.pending.remove(&id) {
                Some(pending) => self.on_reply(pending, reply, link),
                None => Vec::new(),
            },
        }
    }

    fn on_event(&mut self, engine_event: EngineEvent, link: &Link) -> Vec<Value> {
        match engine_event {
            stop @ EngineEvent::Suspended { .. } if !self.enabled => {
                self.held = Some(stop);
                Vec::new()
            }
            EngineEvent::Suspended {
                thread,
                reason,
                breakpoints,
                ..
            } => {
                let pending = Pending::Paused {
                    reason: paused_reason(reason),
                    breakpoints,
                };
                self.forward(link, ProtocolRequest::StackTrace { thread: Some(thread) }, pending);
                Vec::new()
            }
            EngineEvent::Resumed { .. } => {
                self.held = None;
                self.frames.clear();
                self.objects.clear();
                vec![event("Debugger.resumed", json!({}))]
            }
            EngineEvent::Loaded { path } => self.script_parsed(&path).into_iter().collect(),
            EngineEvent::Terminated => Vec::new(),
        }
    }

    fn script_parsed(&mut self, path: &str) -> Option<Value> {
        if path.is_empty() || !self.scripts.insert(path.to_string()) {
            return None;
        }
        Some(event(
            "Debugger.scriptParsed",
            json!({
                "scriptId": path,
                "url": url_of(path),
                "startLine": 0,
                "startColumn": 0,
                "endLine": 0,
                "endColumn": 0,
                "executionContextId": 1,
                "hash": "",
            }),
        ))
    }

    fn on_reply(&mut self, pending: Pending, reply: Result<ProtocolReply, String>, link: &Link) -> Vec<Value> {
        let reply = match reply {
            Ok(reply) => reply,
            Err(message) => {
                return match pending.request_id() {
                    Some(id) => vec![error(id, SERVER_ERROR, &message)],
                    None => {
                        tracing::warn!("CDP stack request failed: {}", message);
                        Vec::new()
                    }
                };
            }
        };
        match (pending, reply) {
            (Pending::Empty(id), _) => vec![result(id, json!({}))],
            (Pending::ScriptSource(id), ProtocolReply::Source(text)) => {
                vec![result(id, json!({ "scriptSource": text }))]
            }
            (Pending::Breakpoint { id, line, url }, ProtocolReply::Breakpoints(bps)) => {
                self.breakpoint_set(id, line, &url, bps)
            }
            (Pending::RemoveBreakpoint { id, key }, _) => {
                self.breakpoints.remove(&key);
                vec![result(id, json!({}))]
            }
            (Pending::Evaluate(id), ProtocolReply::Evaluate(var)) => {
                vec![result(id, json!({ "result": self.remote_object(&var) }))]
            }
            (Pending::Scope { id, global }, ProtocolReply::Scopes(scopes)) => {
                match scopes.get(usize::from(global)) {
                    Some(scope) => {
                        let reference = scope.variables_reference;
                        self.forward(link, ProtocolRequest::Variables { reference }, Pending::Properties(id));
                        Vec::new()
                    }
                    None => vec![result(id, json!({ "result": [] }))],
                }
            }
            (Pending::Properties(id), ProtocolReply::Variables(vars)) => {
                let properties: Vec<Value> = vars
                    .iter()
                    .map(|v| {
                        json!({
                            "name": v.name,
                            "value": self.remote_object(v),
                            "configurable": true,
                            "enumerable": true,
                        })
                    })
                    .collect();
                vec![result(id, json!({ "result": properties }))]
            }
            (Pending::Paused { reason, breakpoints }, ProtocolReply::StackTrace(frames)) => {
                self.paused(reason, &breakpoints, frames)
            }
            (pending, reply) => {
                tracing::warn!("unexpected reply {:?} for {:?}", reply, pending);
                match pending.request_id() {
                    Some(id) => vec![error(id, SERVER_ERROR, "unexpected reply")],
                    None => Vec::new(),
                }
            }
        }
    }

    fn breakpoint_set(&mut self, id: i64, line: u32, url: &str, bps: Vec<BreakpointInfo>) -> Vec<Value> {
        let Some(bp) = bps.into_iter().next() else {
            return vec![error(id, SERVER_ERROR, "breakpoint was not created")];
        };
        let key = format!("{}:{}:{}", bp.number, line, url);
        self.breakpoints.insert(key.clone(), bp.number);
        let locations = if bp.verified {
            json!([{ "scriptId": path_of(url), "lineNumber": bp.line.saturating_sub(1), "columnNumber": 0 }])
        } else {
            json!([])
        };
        vec![result(id, json!({ "breakpointId": key, "locations": locations }))]
    }

    fn paused(&mut self, reason: &str, breakpoints: &[usize], frames: Vec<FrameInfo>) -> Vec<Value> {
        let mut out = Vec::new();
        let mut call_frames = Vec::with_capacity(frames.len());
        for frame in frames {
            out.extend(self.script_parsed(&frame.path));
            let call_frame_id = format!("frame:{}", frame.id);
            self.frames.insert(call_frame_id.clone(), frame.id);
            let location = json!({
                "scriptId": frame.path,
                "lineNumber": frame.line.saturating_sub(1),
                "columnNumber": 0,
            });
            call_frames.push(json!({
                "callFrameId": call_frame_id,
                "functionName": frame.name,
                "functionLocation": location,
                "location": location,
                "url": url_of(&frame.path),
                "scopeChain": [
                    {
                        "type": "local",
                        "object": { "type": "object", "objectId": format!("scope:{}:local", frame.id) },
                    },
                    {
                        "type": "global",
                        "object": { "type": "object", "objectId": format!("scope:{}:global", frame.id) },
                    },
                ],
                "this": { "type": "object", "description": "self" },
            }));
        }
        let hit: Vec<String> = self
            .breakpoints
            .iter()
            .filter(|(_, n)| breakpoints.contains(n))
            .map(|(key, _)| key.clone())
            .collect();
        out.push(event(
            "Debugger.paused",
            json!({ "callFrames": call_frames, "reason": reason, "hitBreakpoints": hit }),
        ));
        out
    }
}

impl Pending {
    /// The DevTools command id waiting for this reply.
    fn request_id(&self) -> Option<i64> {
        match self {
            Pending::Empty(id)
            | Pending::ScriptSource(id)
            | Pending::Evaluate(id)
            | Pending::Properties(id)
            | Pending::Breakpoint { id, .. }
            | Pending::RemoveBreakpoint { id, .. }
            | Pending::Scope { id, .. } => Some(*id),
            Pending::Paused { .. } => None,
        }
    }
}

fn result(id: i64, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

fn error(id: i64, code: i64, message: &str) -> Value {
    json!({ "id": id, "error": { "code": code, "message": message } })
}

fn event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}
