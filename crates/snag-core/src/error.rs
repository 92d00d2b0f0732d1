//! Engine error types.

use thiserror::Error;

/// Errors raised while evaluating an expression in a frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// Reference to an unknown local, constant, or zero-arity method.
    #[error("NameError: undefined local variable or method `{0}'")]
    Name(String),

    /// An operator was applied to values it does not support.
    #[error("TypeError: {0}")]
    Type(String),

    /// Method lookup failed on the receiver.
    #[error("NoMethodError: undefined method `{name}' for {receiver}")]
    NoMethod {
        /// Method name.
        name: String,
        /// Inspected receiver.
        receiver: String,
    },

    /// The source text could not be parsed.
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// Program code raised an exception.
    #[error("{class}: {message}")]
    Raised {
        /// Exception class name.
        class: String,
        /// Exception message.
        message: String,
    },

    /// No frame is available to evaluate in.
    #[error("no frame to evaluate in")]
    NoFrame,
}

impl EvalError {
    /// Class name of the error as the program would see it.
    pub fn class_name(&self) -> &str {
        match self {
            EvalError::Name(_) => "NameError",
            EvalError::Type(_) => "TypeError",
            EvalError::NoMethod { .. } => "NoMethodError",
            EvalError::Syntax(_) => "SyntaxError",
            EvalError::Raised { class, .. } => class,
            EvalError::NoFrame => "RuntimeError",
        }
    }
}

/// Errors raised while creating or activating a breakpoint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BreakpointError {
    /// The class named by a method breakpoint is not defined yet.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// The class exists but does not define the method.
    #[error("undefined method `{name}' for {class}")]
    UnknownMethod {
        /// Class that was searched.
        class: String,
        /// Method name.
        name: String,
    },

    /// The requested line has no traceable line at or after it.
    #[error("no traceable line at or after {path}:{line}")]
    NoTraceableLine {
        /// Source path.
        path: String,
        /// Requested line.
        line: u32,
    },

    /// A `/regex/` argument failed to compile.
    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern {
        /// The pattern source.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// Another breakpoint already has the same key.
    #[error("duplicated breakpoint: {0}")]
    Duplicated(String),

    /// The argument text does not describe a breakpoint.
    #[error("{0}")]
    Usage(String),

    /// Resolving an expression failed.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the input stream went away.
    #[error("connection closed")]
    Closed,

    /// Ctrl-C arrived while waiting for input.
    #[error("interrupted")]
    Interrupted,

    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something the transport does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors produced while handling one operator command.
///
/// All of these are recoverable: the coordinator reports them and prompts
/// again.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The command is not allowed after the stack unwound.
    #[error("{0} is not supported in the postmortem mode")]
    Postmortem(String),

    /// The command is not allowed in a restricted context.
    #[error("{0} is not allowed in this context")]
    Unsafe(String),

    /// Wrong arguments.
    #[error("{0}")]
    Usage(String),

    /// Expression evaluation failed.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Breakpoint creation failed.
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),

    /// Configuration command failed.
    #[error(transparent)]
    Config(#[from] snag_config::ConfigError),

    /// The transport failed while the command was running.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Fatal coordinator errors. The engine cannot continue after one.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The active transport failed in a way that cannot be retried.
    #[error("transport failed")]
    Transport(#[source] TransportError),

    /// Engine state is inconsistent.
    #[error("engine state corrupted: {0}")]
    Corrupted(String),

    /// The coordinator thread could not be started.
    #[error("failed to start coordinator: {0}")]
    Spawn(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn eval_error_display_and_class() {
        let err = EvalError::NoMethod {
            name: "frob".into(),
            receiver: "1".into(),
        };
        assert_eq!(err.to_string(), "NoMethodError: undefined method `frob' for 1");
        assert_eq!(err.class_name(), "NoMethodError");

        let raised = EvalError::Raised {
            class: "ArgumentError".into(),
            message: "bad".into(),
        };
        assert_eq!(raised.to_string(), "ArgumentError: bad");
        assert_eq!(raised.class_name(), "ArgumentError");
    }

    #[test]
    fn postmortem_error_names_the_command() {
        let err = SessionError::Postmortem("step".into());
        assert_eq!(err.to_string(), "step is not supported in the postmortem mode");
    }

    #[test]
    fn session_error_wraps_breakpoint_error() {
        let err: SessionError = BreakpointError::Duplicated("app.rb:3".into()).into();
        assert_eq!(err.to_string(), "duplicated breakpoint: app.rb:3");
    }

    #[test]
    fn engine_error_keeps_source() {
        let err = EngineError::Transport(TransportError::Protocol("bad frame".into()));
        assert_eq!(err.to_string(), "transport failed");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("protocol error: bad frame"));
    }
}
