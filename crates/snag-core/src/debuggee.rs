//! The per-thread view of the debugged program.

use crate::error::{BreakpointError, EvalError};
use crate::frame::{Frame, Location};
use crate::value::Value;

/// A resolved method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    /// Class that defines the method.
    pub owner: String,
    pub name: String,
    /// Opaque method without source.
    pub native: bool,
    pub location: Option<Location>,
}

/// Runtime access for the thread an event was reported on.
///
/// Implementations are handed to hooks together with each event and are
/// only used on that thread.
pub trait Debuggee {
    fn thread_name(&self) -> String;

    /// Frames on the stack right now.
    fn depth(&self) -> usize;

    /// Capture the current call stack, innermost frame first.
    fn capture_frames(&self) -> Vec<Frame>;

    /// Evaluate `src` in `frame`, or at top level when `frame` is `None`.
    ///
    /// Method calls made by the expression run program code on this
    /// thread and may report events of their own.
    fn evaluate(&self, frame: Option<&Frame>, src: &str) -> Result<Value, EvalError>;

    /// Look up `class#name` (or `class.name` when `singleton`).
    fn resolve_method(
        &self,
        class: &str,
        name: &str,
        singleton: bool,
    ) -> Result<MethodInfo, BreakpointError>;

    /// Make an opaque method report native call/return events.
    fn enable_native_probe(&self, class: &str, name: &str);

    /// `class` followed by its superclasses.
    fn ancestors(&self, class: &str) -> Vec<String>;

    fn globals(&self) -> Vec<(String, Value)>;

    /// Method names available on `value`, grouped by defining class.
    fn methods_of(&self, value: &Value) -> Vec<(String, Vec<String>)>;

    /// Names of defined classes.
    fn constants(&self) -> Vec<String>;
}
