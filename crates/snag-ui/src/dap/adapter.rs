//! Translation between DAP messages and engine requests and events.

use std::collections::HashMap;

use serde_json::{json, Value};
use snag_core::{EngineEvent, ProtocolReply, ProtocolRequest};

use super::protocol::{
    Breakpoint, Capabilities, CompletionsArguments, EvaluateArguments, Event, Request, Response,
    Scope, ScopesArguments, SetBreakpointsArguments, SetExceptionBreakpointsArguments, Source,
    SourceArguments, StackFrame, StackTraceArguments, StoppedEventBody, Thread, Variable,
    VariablesArguments,
};
use crate::link::{Link, Outgoing};

/// How a reply is turned into a response body.
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Reply,
    Continue,
    /// An `evaluate` that ran a debugger command.
    Command(String),
    ExceptionBreakpoints(usize),
}

#[derive(Debug)]
struct Pending {
    seq: i64,
    command: String,
    shape: Shape,
}

/// Per-connection DAP state.
#[derive(Debug, Default)]
pub(crate) struct DapAdapter {
    seq: i64,
    pending: HashMap<u64, Pending>,
    configured: bool,
    held: Option<StoppedEventBody>,
}

/// Map a DAP exception filter to the class it catches.
fn exception_class(filter: &str) -> Option<&'static str> {
    match filter {
        "any" => Some("Exception"),
        "RuntimeError" => Some("RuntimeError"),
        _ => None,
    }
}

impl DapAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn response(&mut self, request_seq: i64, command: &str, body: Result<Option<Value>, String>) -> Value {
        let (success, message, body) = match body {
            Ok(body) => (true, None, body),
            Err(message) => (false, Some(message), None),
        };
        let response = Response {
            seq: self.next_seq(),
            message_type: "response".into(),
            request_seq,
            success,
            command: command.to_string(),
            message,
            body,
        };
        serde_json::to_value(response).unwrap_or(Value::Null)
    }

    fn event(&mut self, event: &str, body: Option<Value>) -> Value {
        let event = Event {
            seq: self.next_seq(),
            message_type: "event".into(),
            event: event.to_string(),
            body,
        };
        serde_json::to_value(event).unwrap_or(Value::Null)
    }

    fn forward(&mut self, link: &Link, req: &Request, request: ProtocolRequest, shape: Shape) -> Vec<Value> {
        let id = link.next_request_id();
        self.pending.insert(
            id,
            Pending {
                seq: req.seq,
                command: req.command.clone(),
                shape,
            },
        );
        link.submit(id, request);
        Vec::new()
    }

    /// Handle one client request; returns the messages to send right away.
    pub(crate) fn on_request(&mut self, req: Request, link: &Link) -> Vec<Value> {
        tracing::debug!(seq = req.seq, "DAP request {}", req.command);
        match self.translate(&req, link) {
            Ok(messages) => messages,
            Err(message) => vec![self.response(req.seq, &req.command, Err(message))],
        }
    }

    fn translate(&mut self, req: &Request, link: &Link) -> Result<Vec<Value>, String> {
        let invalid = |e: serde_json::Error| format!("invalid arguments: {e}");
        let out = match req.command.as_str() {
            "initialize" => {
                let caps = serde_json::to_value(Capabilities::adapter()).map_err(|e| e.to_string())?;
                vec![
                    self.response(req.seq, &req.command, Ok(Some(caps))),
                    self.event("initialized", None),
                ]
            }
            "launch" | "attach" => vec![self.response(req.seq, &req.command, Ok(None))],
            "configurationDone" => {
                self.configured = true;
                let mut out = vec![self.response(req.seq, &req.command, Ok(None))];
                if let Some(body) = self.held.take() {
                    let body = serde_json::to_value(body).ok();
                    out.push(self.event("stopped", body));
                }
                out
            }
            "setBreakpoints" => {
                let args: SetBreakpointsArguments = req.args().map_err(invalid)?;
                let path = args.source.path.ok_or("source has no path")?;
                let lines = args.breakpoints.into_iter().map(|b| (b.line, b.condition)).collect();
                self.forward(link, req, ProtocolRequest::SetBreakpoints { path, lines }, Shape::Reply)
            }
            "setExceptionBreakpoints" => {
                let args: SetExceptionBreakpointsArguments = req.args().map_err(invalid)?;
                let mut filters: Vec<String> = args
                    .filters
                    .iter()
                    .map(String::as_str)
                    .chain(args.filter_options.iter().map(|o| o.filter_id.as_str()))
                    .filter_map(exception_class)
                    .map(str::to_string)
                    .collect();
                let count = filters.len();
                filters.dedup();
                self.forward(
                    link,
                    req,
                    ProtocolRequest::SetExceptionBreakpoints { filters },
                    Shape::ExceptionBreakpoints(count),
                )
            }
            "disconnect" => self.forward(link, req, ProtocolRequest::Disconnect, Shape::Reply),
            "continue" => self.forward(link, req, ProtocolRequest::Continue, Shape::Continue),
            "next" => self.forward(link, req, ProtocolRequest::Next, Shape::Reply),
            "stepIn" => self.forward(link, req, ProtocolRequest::StepIn, Shape::Reply),
            "stepOut" => self.forward(link, req, ProtocolRequest::StepOut, Shape::Reply),
            "stepBack" => self.forward(link, req, ProtocolRequest::StepBack, Shape::Reply),
            "pause" => self.forward(link, req, ProtocolRequest::Pause, Shape::Reply),
            "threads" => self.forward(link, req, ProtocolRequest::Threads, Shape::Reply),
            "stackTrace" => {
                let args: StackTraceArguments = req.args().map_err(invalid)?;
                let request = ProtocolRequest::StackTrace {
                    thread: args.thread_id,
                };
                self.forward(link, req, request, Shape::Reply)
            }
            "scopes" => {
                let args: ScopesArguments = req.args().map_err(invalid)?;
                self.forward(link, req, ProtocolRequest::Scopes { frame: args.frame_id }, Shape::Reply)
            }
            "variables" => {
                let args: VariablesArguments = req.args().map_err(invalid)?;
                let request = ProtocolRequest::Variables {
                    reference: args.variables_reference,
                };
                self.forward(link, req, request, Shape::Reply)
            }
            "evaluate" => {
                let args: EvaluateArguments = req.args().map_err(invalid)?;
                let shape = match args.expression.trim_start().strip_prefix(',') {
                    Some(command) => Shape::Command(command.trim().to_string()),
                    None => Shape::Reply,
                };
                let request = ProtocolRequest::Evaluate {
                    frame: args.frame_id,
                    expression: args.expression.trim_start().to_string(),
                };
                self.forward(link, req, request, shape)
            }
            "completions" => {
                let args: CompletionsArguments = req.args().map_err(invalid)?;
                let request = ProtocolRequest::Completions {
                    frame: args.frame_id,
                    text: args.text,
                };
                self.forward(link, req, request, Shape::Reply)
            }
            "source" => {
                let args: SourceArguments = req.args().map_err(invalid)?;
                let path = args.source.and_then(|s| s.path).ok_or("source has no path")?;
                self.forward(link, req, ProtocolRequest::Source { path }, Shape::Reply)
            }
            other => return Err(format!("unsupported request: {other}")),
        };
        Ok(out)
    }

    /// Translate session output; `Flush` is handled by the caller.
    pub(crate) fn on_outgoing(&mut self, out: Outgoing, link: &Link) -> Vec<Value> {
        match out {
            Outgoing::Out(line) => {
                let body = json!({ "category": "console", "output": format!("{line}\n") });
                vec![self.event("output", Some(body))]
            }
            Outgoing::Prompt { .. } | Outgoing::Flush(_) => Vec::new(),
            Outgoing::Ask { prompt, .. } => {
                tracing::debug!("DAP client takes the default for {:?}", prompt);
                link.answer(String::new());
                Vec::new()
            }
            Outgoing::Event(event) => self.on_event(event),
            Outgoing::Reply { id, reply } => {
                let Some(pending) = self.pending.remove(&id) else {
                    tracing::debug!(id, "reply for a request of another client");
                    return Vec::new();
                };
                let body = reply.and_then(|reply| body(&pending.shape, reply));
                vec![self.response(pending.seq, &pending.command, body)]
            }
            Outgoing::Quit(_) => vec![self.event("terminated", None)],
        }
    }

    fn on_event(&mut self, event: EngineEvent) -> Vec<Value> {
        match event {
            EngineEvent::Suspended {
                thread,
                reason,
                breakpoints,
                description,
                ..
            } => {
                let body = StoppedEventBody {
                    reason: reason.as_str().to_string(),
                    description: Some(description.clone()),
                    thread_id: thread,
                    all_threads_stopped: true,
                    text: Some(description),
                    hit_breakpoint_ids: breakpoints,
                };
                if !self.configured {
                    self.held = Some(body);
                    return Vec::new();
                }
                let body = serde_json::to_value(body).ok();
                vec![self.event("stopped", body)]
            }
            EngineEvent::Resumed { thread } => {
                self.held = None;
                if !self.configured {
                    return Vec::new();
                }
                let mut body = json!({ "allThreadsContinued": true });
                if let Some(thread) = thread {
                    body["threadId"] = json!(thread);
                }
                vec![self.event("continued", Some(body))]
            }
            EngineEvent::Loaded { path } => {
                let body = json!({ "reason": "new", "source": Source::from_path(&path) });
                vec![self.event("loadedSource", Some(body))]
            }
            EngineEvent::Terminated => vec![self.event("terminated", None)],
        }
    }
}

/// The response body for a successful reply.
fn body(shape: &Shape, reply: ProtocolReply) -> Result<Option<Value>, String> {
    let value = match (shape, reply) {
        (Shape::Continue, _) => json!({ "allThreadsContinued": true }),
        (Shape::Command(command), _) => {
            json!({ "result": format!("(snag:command) {command}"), "variablesReference": 0 })
        }
        (Shape::ExceptionBreakpoints(count), _) => {
            let breakpoints = vec![json!({ "verified": true }); *count];
            json!({ "breakpoints": breakpoints })
        }
        (Shape::Reply, ProtocolReply::Ack) => return Ok(None),
        (Shape::Reply, ProtocolReply::Threads(threads)) => {
            let threads: Vec<Thread> = threads
                .into_iter()
                .map(|t| Thread { id: t.id, name: t.name })
                .collect();
            json!({ "threads": threads })
        }
        (Shape::Reply, ProtocolReply::Breakpoints(bps)) => {
            let breakpoints: Vec<Breakpoint> = bps
                .into_iter()
                .map(|bp| Breakpoint {
                    id: Some(bp.number),
                    verified: bp.verified,
                    message: bp.message,
                    source: Some(Source::from_path(&bp.path)),
                    line: Some(bp.line),
                })
                .collect();
            json!({ "breakpoints": breakpoints })
        }
        (Shape::Reply, ProtocolReply::StackTrace(frames)) => {
            let total = frames.len();
            let frames: Vec<StackFrame> = frames
                .into_iter()
                .map(|f| StackFrame {
                    id: f.id,
                    name: f.name,
                    source: Some(Source::from_path(&f.path)),
                    line: f.line,
                    column: 1,
                })
                .collect();
            json!({ "stackFrames": frames, "totalFrames": total })
        }
        (Shape::Reply, ProtocolReply::Scopes(scopes)) => {
            let scopes: Vec<Scope> = scopes
                .into_iter()
                .map(|s| Scope {
                    name: s.name,
                    variables_reference: s.variables_reference,
                    expensive: false,
                })
                .collect();
            json!({ "scopes": scopes })
        }
        (Shape::Reply, ProtocolReply::Variables(vars)) => {
            let variables: Vec<Variable> = vars
                .into_iter()
                .map(|v| Variable {
                    name: v.name,
                    value: v.value,
                    variable_type: v.type_name,
                    variables_reference: v.variables_reference,
                })
                .collect();
            json!({ "variables": variables })
        }
        (Shape::Reply, ProtocolReply::Evaluate(v)) => json!({
            "result": v.value,
            "type": v.type_name,
            "variablesReference": v.variables_reference,
        }),
        (Shape::Reply, ProtocolReply::Completions(names)) => {
            let targets: Vec<Value> = names.into_iter().map(|n| json!({ "label": n })).collect();
            json!({ "targets": targets })
        }
        (Shape::Reply, ProtocolReply::Source(content)) => json!({ "content": content }),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Incoming;
    use snag_core::session::protocol::{FrameInfo, VariableInfo};
    use snag_core::{Input, Location, StopReason};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn request(seq: i64, command: &str, arguments: Value) -> Request {
        serde_json::from_value(json!({
            "seq": seq, "type": "request", "command": command, "arguments": arguments
        }))
        .unwrap()
    }

    /// A link that hands requests to `incoming` as if the session were
    /// prompting.
    fn reading_link() -> (Link, UnboundedReceiver<Incoming>) {
        let (link, incoming) = Link::new(80);
        link.begin_turn("(snag) ", false);
        (link, incoming)
    }

    fn submitted(incoming: &mut UnboundedReceiver<Incoming>) -> (u64, ProtocolRequest) {
        match incoming.try_recv() {
            Ok(Incoming::Input(Input::Request { id, request })) => (id, request),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[test]
    fn initialize_answers_locally() {
        let (link, mut incoming) = reading_link();
        let mut dap = DapAdapter::new();
        let out = dap.on_request(request(1, "initialize", json!({"adapterID": "snag"})), &link);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["body"]["supportsStepBack"], true);
        assert_eq!(out[1]["event"], "initialized");
        assert!(incoming.try_recv().is_err());
    }

    #[test]
    fn stack_trace_round_trip() {
        let (link, mut incoming) = reading_link();
        let mut dap = DapAdapter::new();
        assert!(dap.on_request(request(5, "stackTrace", json!({"threadId": 2})), &link).is_empty());
        let (id, req) = submitted(&mut incoming);
        assert!(matches!(req, ProtocolRequest::StackTrace { thread: Some(2) }));

        let reply = ProtocolReply::StackTrace(vec![FrameInfo {
            id: 11,
            name: "Calc#add".into(),
            path: "/src/calc.rb".into(),
            line: 4,
        }]);
        let out = dap.on_outgoing(Outgoing::Reply { id, reply: Ok(reply) }, &link);
        assert_eq!(out[0]["request_seq"], 5);
        assert_eq!(out[0]["command"], "stackTrace");
        assert_eq!(out[0]["body"]["stackFrames"][0]["id"], 11);
        assert_eq!(out[0]["body"]["stackFrames"][0]["source"]["name"], "calc.rb");
        assert_eq!(out[0]["body"]["totalFrames"], 1);
    }

    #[test]
    fn errors_become_failed_responses() {
        let (link, mut incoming) = reading_link();
        let mut dap = DapAdapter::new();
        dap.on_request(request(7, "next", json!({"threadId": 1})), &link);
        let (id, _) = submitted(&mut incoming);
        let out = dap.on_outgoing(
            Outgoing::Reply {
                id,
                reply: Err("postmortem mode".into()),
            },
            &link,
        );
        assert_eq!(out[0]["success"], false);
        assert_eq!(out[0]["message"], "postmortem mode");

        let out = dap.on_request(request(8, "gotoTargets", json!({})), &link);
        assert_eq!(out[0]["success"], false);
        let out = dap.on_request(request(9, "scopes", json!({})), &link);
        assert!(out[0]["message"].as_str().unwrap().starts_with("invalid arguments"));
    }

    #[test]
    fn comma_expressions_run_commands() {
        let (link, mut incoming) = reading_link();
        let mut dap = DapAdapter::new();
        dap.on_request(request(3, "evaluate", json!({"expression": ",bt", "context": "repl"})), &link);
        let (id, req) = submitted(&mut incoming);
        assert!(matches!(req, ProtocolRequest::Evaluate { ref expression, .. } if expression == ",bt"));
        let out = dap.on_outgoing(Outgoing::Reply { id, reply: Ok(ProtocolReply::Ack) }, &link);
        assert_eq!(out[0]["body"]["result"], "(snag:command) bt");

        dap.on_request(request(4, "evaluate", json!({"expression": "a + 1", "frameId": 2})), &link);
        let (id, _) = submitted(&mut incoming);
        let reply = ProtocolReply::Evaluate(VariableInfo {
            name: "result".into(),
            value: "2".into(),
            type_name: "Integer".into(),
            variables_reference: 0,
        });
        let out = dap.on_outgoing(Outgoing::Reply { id, reply: Ok(reply) }, &link);
        assert_eq!(out[0]["body"]["result"], "2");
        assert_eq!(out[0]["body"]["type"], "Integer");
    }

    #[test]
    fn exception_filters_map_to_classes() {
        let (link, mut incoming) = reading_link();
        let mut dap = DapAdapter::new();
        let args = json!({"filters": ["any"], "filterOptions": [{"filterId": "RuntimeError"}, {"filterId": "bogus"}]});
        dap.on_request(request(2, "setExceptionBreakpoints", args), &link);
        let (id, req) = submitted(&mut incoming);
        match req {
            ProtocolRequest::SetExceptionBreakpoints { filters } => {
                assert_eq!(filters, vec!["Exception", "RuntimeError"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let out = dap.on_outgoing(Outgoing::Reply { id, reply: Ok(ProtocolReply::Ack) }, &link);
        assert_eq!(out[0]["body"]["breakpoints"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn stops_wait_for_configuration_done() {
        let (link, _incoming) = reading_link();
        let mut dap = DapAdapter::new();
        let stop = EngineEvent::Suspended {
            thread: 1,
            reason: StopReason::Breakpoint,
            location: Location::new("calc.rb", 4, "Calc#add"),
            breakpoints: vec![1],
            description: "BP - Line  calc.rb:4 (line)".into(),
        };
        assert!(dap.on_outgoing(Outgoing::Event(stop.clone()), &link).is_empty());
        let out = dap.on_request(request(1, "configurationDone", json!({})), &link);
        assert_eq!(out[1]["event"], "stopped");
        assert_eq!(out[1]["body"]["reason"], "breakpoint");
        assert_eq!(out[1]["body"]["hitBreakpointIds"][0], 1);

        let out = dap.on_outgoing(Outgoing::Event(EngineEvent::Resumed { thread: Some(1) }), &link);
        assert_eq!(out[0]["event"], "continued");
        let out = dap.on_outgoing(Outgoing::Out("hello".into()), &link);
        assert_eq!(out[0]["body"]["output"], "hello\n");
    }

    #[test]
    fn replies_for_unknown_ids_are_dropped() {
        let (link, _incoming) = reading_link();
        let mut dap = DapAdapter::new();
        assert!(dap
            .on_outgoing(Outgoing::Reply { id: 99, reply: Ok(ProtocolReply::Ack) }, &link)
            .is_empty());
    }
}
