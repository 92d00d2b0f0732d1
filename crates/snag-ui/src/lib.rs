//! snag-ui: front ends for the snag engine.
//!
//! [`console::ConsoleTransport`] drives a session from a terminal.
//! [`server::RemoteTransport`] listens on a TCP port and speaks the line
//! protocol, the Debug Adapter Protocol or the Chrome DevTools Protocol,
//! whichever the connecting client opens with.

pub mod cdp;
pub mod console;
pub mod dap;
pub mod error;
pub mod line;
mod link;
pub mod server;

pub use console::{AnsiRenderer, ConsoleTransport};
pub use error::UiError;
pub use line::Greeting;
pub use server::{OpenTarget, RemoteFactory, RemoteTransport, VERSION};
