//! The debugger command table.

/// Every command the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Step,
    Next,
    Finish,
    Until,
    Continue,
    Quit,
    QuitNow,
    Kill,
    KillNow,
    Break,
    Catch,
    Watch,
    Delete,
    Backtrace,
    List,
    Whereami,
    Info,
    Outline,
    Display,
    Undisplay,
    Frame,
    Up,
    Down,
    P,
    Pp,
    Eval,
    Trace,
    Record,
    Thread,
    Config,
    Source,
    Open,
    Help,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub kind: CommandKind,
    /// Accepted spellings, shortest first.
    pub names: &'static [&'static str],
    /// An empty line repeats it.
    pub repeat: bool,
    /// May run from a breakpoint's `pre:`/`do:` list.
    pub unsafe_allowed: bool,
    /// Cancels a pending automatic `continue`.
    pub cancel_auto_continue: bool,
    pub postmortem_allowed: bool,
    pub usage: &'static str,
    pub help: &'static str,
}

const fn spec(
    kind: CommandKind,
    names: &'static [&'static str],
    usage: &'static str,
    help: &'static str,
) -> CommandSpec {
    CommandSpec {
        kind,
        names,
        repeat: false,
        unsafe_allowed: true,
        cancel_auto_continue: false,
        postmortem_allowed: true,
        usage,
        help,
    }
}

impl CommandSpec {
    const fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }

    const fn restricted(mut self) -> Self {
        self.unsafe_allowed = false;
        self
    }

    const fn cancels(mut self) -> Self {
        self.cancel_auto_continue = true;
        self
    }

    const fn live_only(mut self) -> Self {
        self.postmortem_allowed = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.names.last().copied().unwrap_or("")
    }
}

use CommandKind as K;

pub const COMMANDS: &[CommandSpec] = &[
    spec(K::Step, &["s", "step"], "s[tep] [n|back [n]|reset]", "Step in. `back` and `reset` move through the recorded log.")
        .repeat()
        .cancels()
        .live_only(),
    spec(K::Next, &["n", "next"], "n[ext] [n]", "Step over.")
        .repeat()
        .cancels()
        .live_only(),
    spec(K::Finish, &["fin", "finish"], "fin[ish] [n]", "Run until the current frame (or n frames) returns.")
        .repeat()
        .cancels()
        .live_only(),
    spec(K::Until, &["u", "until"], "u[ntil] [[file:]line|name|/re/]", "Run until a deeper line, a location or a call.")
        .repeat()
        .cancels()
        .live_only(),
    spec(K::Continue, &["c", "cont", "continue"], "c[ont[inue]]", "Resume the program.").cancels(),
    spec(K::Quit, &["q", "quit"], "q[uit] [code]", "Detach and exit, after confirmation.")
        .restricted()
        .cancels(),
    spec(K::QuitNow, &["q!", "quit!"], "q!", "Detach and exit without confirmation.")
        .restricted()
        .cancels(),
    spec(K::Kill, &["kill"], "kill [code]", "Terminate the program, after confirmation.")
        .restricted()
        .cancels(),
    spec(K::KillNow, &["kill!"], "kill!", "Terminate the program without confirmation.")
        .restricted()
        .cancels(),
    spec(K::Break, &["b", "break"], "b[reak] [line|file:line|Class#method|expr.method] [if: expr] [pre: cmd] [do: cmd] [path: re]", "Set or list breakpoints."),
    spec(K::Catch, &["catch"], "catch <Error> [if: expr] [pre: cmd] [do: cmd] [path: re]", "Stop when an exception is raised."),
    spec(K::Watch, &["wat", "watch"], "wat[ch] @ivar [if: expr] [pre: cmd] [do: cmd] [path: re]", "Stop when an instance variable changes.")
        .live_only(),
    spec(K::Delete, &["del", "delete"], "del[ete] [n]", "Delete one or all breakpoints."),
    spec(K::Backtrace, &["bt", "backtrace"], "bt [n] [/re/]", "Show the backtrace.").repeat(),
    spec(K::List, &["l", "list"], "l[ist] [-|start|start-end]", "Show source around the current line.").repeat(),
    spec(K::Whereami, &["whereami"], "whereami", "Show the current location."),
    spec(K::Info, &["i", "info"], "i[nfo] [l[ocals]|i[vars] [expr]|g[lobals]|th[reads]|b[reakpoints]] [/re/]", "Show variables, threads or breakpoints."),
    spec(K::Outline, &["o", "outline", "ls"], "o[utline] [expr]", "Show methods, constants and variables."),
    spec(K::Display, &["display"], "display [expr]", "Evaluate an expression at every stop."),
    spec(K::Undisplay, &["undisplay"], "undisplay [n]", "Remove display expressions."),
    spec(K::Frame, &["f", "frame"], "f[rame] [n]", "Select a frame."),
    spec(K::Up, &["up"], "up", "Select the caller's frame.").repeat(),
    spec(K::Down, &["down"], "down", "Select the callee's frame.").repeat(),
    spec(K::P, &["p"], "p <expr>", "Evaluate and print."),
    spec(K::Pp, &["pp"], "pp <expr>", "Evaluate and pretty-print."),
    spec(K::Eval, &["eval", "call"], "eval <expr>", "Evaluate without printing."),
    spec(K::Trace, &["trace"], "trace [line|call|exception|object <expr>|off [n]] [/re/] [into: file]", "Log events without stopping."),
    spec(K::Record, &["record"], "record [on|off]", "Record execution for `step back`.").live_only(),
    spec(K::Thread, &["th", "thread"], "th[read] [n]", "List threads or switch to one."),
    spec(K::Config, &["config"], "config [name|set name value|name = value|append name value|name << value|unset name]", "Show or change settings.")
        .restricted(),
    spec(K::Source, &["source"], "source <file>", "Run commands from a file.").restricted(),
    spec(K::Open, &["open"], "open [tcp|host:port|port|vscode|chrome]", "Switch to a remote front end.").restricted(),
    spec(K::Help, &["h", "help"], "h[elp] [command]", "Show help."),
];

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.names.contains(&name))
}

/// Split a command line into its name and the rest.
pub fn split(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    }
}

/// A trailing `/re/` argument, and what precedes it.
pub fn trailing_pattern(arg: &str) -> (&str, Option<&str>) {
    let arg = arg.trim();
    if arg.len() >= 2 && arg.ends_with('/') {
        if let Some(start) = arg[..arg.len() - 1].rfind(" /").map(|i| i + 1).or_else(|| arg.starts_with('/').then_some(0)) {
            return (arg[..start].trim(), Some(&arg[start + 1..arg.len() - 1]));
        }
    }
    (arg, None)
}
