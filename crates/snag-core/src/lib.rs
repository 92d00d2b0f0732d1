//! snag-core: the debugger engine.
//!
//! The engine attaches to an [`Instrumentation`] provider, keeps one
//! [`thread_client::ThreadClient`] per program thread and runs a single
//! coordinator ([`session::Session`]) that reads commands from a
//! [`Transport`]. The [`probe`] module provides a small interpreted runtime
//! that implements the instrumentation seam, used by the demo binary and
//! the tests.

mod sync;

pub mod breakpoint;
pub mod context;
pub mod debuggee;
pub mod error;
pub mod expr;
pub mod frame;
pub mod instrument;
pub mod listing;
pub mod probe;
pub mod process_group;
pub mod recorder;
pub mod registry;
pub mod render;
pub mod session;
pub mod source;
pub mod stepping;
pub mod thread_client;
pub mod tracer;
pub mod transport;
pub mod value;

// Re-export key types for convenience.
pub use context::{Engine, EngineContext, EngineHandle, EngineOptions, ExitFn};
pub use debuggee::Debuggee;
pub use error::{BreakpointError, EngineError, EvalError, SessionError, TransportError};
pub use frame::{Frame, Location};
pub use instrument::{EventKind, ExecEvent, HookRegistry, Instrumentation};
pub use render::{PlainRenderer, Renderer, Style};
pub use session::protocol::{ProtocolReply, ProtocolRequest};
pub use snag_config::Config;
pub use transport::{EngineEvent, Input, StopReason, Transport, TransportFactory};
pub use value::Value;
