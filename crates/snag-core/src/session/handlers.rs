//! Command handlers.

use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use snag_config::CONFIG_KEYS;

use super::command::{self, CommandKind, CommandSpec, COMMANDS};
use super::{Next, Preset, Session};
use crate::breakpoint::{BreakArgs, BreakTarget, Breakpoint};
use crate::error::SessionError;
use crate::listing::SourceRange;
use crate::stepping::{StepKind, UntilTarget};
use crate::thread_client::{
    EvalKind, FrameMove, InfoKind, RecordOp, ShowTarget, ThreadClient, ThreadCommand,
};
use crate::tracer::{Tracer, TracerKind};

type Handled = Result<Next, SessionError>;

fn count(arg: &str) -> Result<usize, SessionError> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Ok(1);
    }
    match arg.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SessionError::Usage(format!("{arg} is not a positive number"))),
    }
}

fn exit_code(arg: &str, default: i32) -> Result<i32, SessionError> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Ok(default);
    }
    arg.parse()
        .map_err(|_| SessionError::Usage(format!("{arg} is not an exit code")))
}

fn pattern(src: Option<&str>) -> Result<Option<Regex>, SessionError> {
    src.map(|re| {
        Regex::new(re).map_err(|e| SessionError::Usage(format!("invalid pattern /{re}/: {e}")))
    })
    .transpose()
}

fn optional(arg: &str) -> Option<String> {
    let arg = arg.trim();
    (!arg.is_empty()).then(|| arg.to_string())
}

fn is_yes(answer: &str) -> bool {
    answer.trim().to_ascii_lowercase().starts_with('y')
}

impl Session {
    /// Run one command line. Errors are reported here; the caller only
    /// learns whether to prompt again.
    pub(crate) fn process_command(&mut self, line: &str, restricted: bool) -> Next {
        let line = line.trim();
        let line = if line.is_empty() {
            match &self.last_command {
                Some(last) => last.clone(),
                None => return Next::Retry,
            }
        } else {
            line.to_string()
        };
        let (name, arg) = command::split(&line);
        let result = match command::lookup(name) {
            Some(spec) => {
                self.last_command = spec.repeat.then(|| line.clone());
                if spec.cancel_auto_continue {
                    self.auto_continue = false;
                }
                self.check(spec, arg, restricted)
                    .and_then(|()| self.run_command(spec, arg))
            }
            None => {
                self.last_command = None;
                self.eval_command(CommandKind::Pp, &line)
            }
        };
        match result {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!("command `{}` failed: {}", line, e);
                self.report(&e);
                Next::Retry
            }
        }
    }

    fn check(&self, spec: &CommandSpec, arg: &str, restricted: bool) -> Result<(), SessionError> {
        if restricted {
            if !spec.unsafe_allowed {
                return Err(SessionError::Unsafe(spec.name().to_string()));
            }
            if let Some(kw) = arg.split_whitespace().find(|w| *w == "do:" || *w == "pre:") {
                return Err(SessionError::Unsafe(kw.to_string()));
            }
        }
        if self.postmortem && !spec.postmortem_allowed {
            return Err(SessionError::Postmortem(spec.name().to_string()));
        }
        Ok(())
    }

    fn stopped(&self) -> Result<Arc<ThreadClient>, SessionError> {
        self.tc
            .clone()
            .ok_or_else(|| SessionError::Usage("no thread is stopped".to_string()))
    }

    fn show(&mut self, target: ShowTarget) -> Handled {
        self.stopped()?;
        self.send(ThreadCommand::Show(target));
        Ok(Next::Done)
    }

    fn resume(&mut self, cmd: ThreadCommand) -> Handled {
        self.stopped()?;
        self.leave_subsession(cmd);
        Ok(Next::Done)
    }

    fn run_command(&mut self, spec: &CommandSpec, arg: &str) -> Handled {
        match spec.kind {
            CommandKind::Step => self.step_command(arg),
            CommandKind::Next => self.resume(ThreadCommand::Step {
                kind: StepKind::Next,
                count: count(arg)?,
            }),
            CommandKind::Finish => self.resume(ThreadCommand::Step {
                kind: StepKind::Finish,
                count: count(arg)?,
            }),
            CommandKind::Until => {
                let target = UntilTarget::parse(Some(arg))
                    .map_err(|e| SessionError::Usage(format!("invalid pattern: {e}")))?;
                self.resume(ThreadCommand::Step {
                    kind: StepKind::Until(target),
                    count: 1,
                })
            }
            CommandKind::Continue => self.resume(ThreadCommand::Continue),
            CommandKind::Quit => {
                let code = exit_code(arg, 0)?;
                if is_yes(&self.transport.ask("Really quit? [Y/n] ", "y")?) {
                    Ok(self.quit(code))
                } else {
                    Ok(Next::Retry)
                }
            }
            CommandKind::QuitNow => Ok(self.quit(0)),
            CommandKind::Kill => {
                let code = exit_code(arg, 1)?;
                if is_yes(&self.transport.ask("Really kill? [Y/n] ", "y")?) {
                    Ok(self.quit(code))
                } else {
                    Ok(Next::Retry)
                }
            }
            CommandKind::KillNow => Ok(self.quit(1)),
            CommandKind::Break => self.break_command(arg),
            CommandKind::Catch => {
                let args = BreakArgs::parse(arg)?;
                let Some(pattern) = args.sig.clone() else {
                    return Err(SessionError::Usage(spec.usage.to_string()));
                };
                let bp = Breakpoint::catch(pattern)
                    .with_cond(args.cond)
                    .with_command(args.command)
                    .with_path(args.path);
                self.register_breakpoint(Arc::new(bp));
                Ok(Next::Retry)
            }
            CommandKind::Watch => {
                let args = BreakArgs::parse(arg)?;
                let Some(ivar) = args.sig.clone() else {
                    return Err(SessionError::Usage(spec.usage.to_string()));
                };
                self.stopped()?;
                self.send(ThreadCommand::WatchBreakpoint { ivar, args });
                Ok(Next::Done)
            }
            CommandKind::Delete => self.delete_command(arg),
            CommandKind::Backtrace => {
                let (rest, re) = command::trailing_pattern(arg);
                let max = match rest {
                    "" => None,
                    n => Some(count(n)?),
                };
                self.show(ShowTarget::Backtrace {
                    max,
                    pattern: pattern(re)?,
                })
            }
            CommandKind::List => {
                let range = SourceRange::parse(arg)
                    .ok_or_else(|| SessionError::Usage(spec.usage.to_string()))?;
                self.show(ShowTarget::List(range))
            }
            CommandKind::Whereami => self.show(ShowTarget::Whereami),
            CommandKind::Info => self.info_command(arg),
            CommandKind::Outline => self.show(ShowTarget::Outline(optional(arg))),
            CommandKind::Display => {
                self.stopped()?;
                let entries = match optional(arg) {
                    None if self.displays.is_empty() => return Ok(Next::Retry),
                    None => self.displays.iter().cloned().enumerate().collect(),
                    Some(expr) => {
                        self.displays.push(expr.clone());
                        vec![(self.displays.len() - 1, expr)]
                    }
                };
                self.send(ThreadCommand::Eval(EvalKind::Display(entries)));
                Ok(Next::Done)
            }
            CommandKind::Undisplay => {
                match optional(arg) {
                    None => self.displays.clear(),
                    Some(n) => match n.parse::<usize>() {
                        Ok(n) if n < self.displays.len() => {
                            self.displays.remove(n);
                        }
                        _ => return Err(SessionError::Usage(format!("no display #{n}"))),
                    },
                }
                Ok(Next::Retry)
            }
            CommandKind::Frame => match optional(arg) {
                None => self.show(ShowTarget::Whereami),
                Some(n) => {
                    let n = n
                        .parse()
                        .map_err(|_| SessionError::Usage(format!("{n} is not a frame index")))?;
                    self.stopped()?;
                    self.send(ThreadCommand::Frame(FrameMove::Set(n)));
                    Ok(Next::Done)
                }
            },
            CommandKind::Up | CommandKind::Down => {
                self.stopped()?;
                let mv = if spec.kind == CommandKind::Up {
                    FrameMove::Up
                } else {
                    FrameMove::Down
                };
                self.send(ThreadCommand::Frame(mv));
                Ok(Next::Done)
            }
            CommandKind::P | CommandKind::Pp | CommandKind::Eval => {
                if arg.is_empty() {
                    return Err(SessionError::Usage(spec.usage.to_string()));
                }
                self.eval_command(spec.kind, arg)
            }
            CommandKind::Trace => self.trace_command(arg),
            CommandKind::Record => {
                let op = match arg {
                    "" | "status" => RecordOp::Status,
                    "on" => RecordOp::On,
                    "off" => RecordOp::Off,
                    _ => return Err(SessionError::Usage(spec.usage.to_string())),
                };
                self.stopped()?;
                self.send(ThreadCommand::Record(op));
                Ok(Next::Done)
            }
            CommandKind::Thread => self.thread_command(arg),
            CommandKind::Config => self.config_command(arg),
            CommandKind::Source => {
                let text = std::fs::read_to_string(arg)
                    .map_err(|e| SessionError::Usage(format!("cannot read {arg}: {e}")))?;
                let lines: Vec<&str> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .collect();
                for line in lines.into_iter().rev() {
                    self.presets.push_front(Preset {
                        line: line.to_string(),
                        restricted: false,
                    });
                }
                Ok(Next::Retry)
            }
            CommandKind::Open => self.open_command(arg),
            CommandKind::Help => {
                match optional(arg) {
                    None => {
                        for spec in COMMANDS {
                            self.transport.puts(&format!("{}\n    {}", spec.usage, spec.help));
                        }
                    }
                    Some(name) => {
                        let spec = command::lookup(&name)
                            .ok_or_else(|| SessionError::Usage(format!("unknown command: {name}")))?;
                        self.transport.puts(&format!("{}\n    {}", spec.usage, spec.help));
                    }
                }
                Ok(Next::Retry)
            }
        }
    }

    fn eval_command(&mut self, kind: CommandKind, src: &str) -> Handled {
        self.stopped()?;
        let src = src.to_string();
        let eval = match kind {
            CommandKind::P => EvalKind::P(src),
            CommandKind::Eval => EvalKind::Call(src),
            _ => EvalKind::Pp {
                src,
                width: self.transport.width(),
            },
        };
        self.send(ThreadCommand::Eval(eval));
        Ok(Next::Done)
    }

    fn step_command(&mut self, arg: &str) -> Handled {
        let tc = self.stopped()?;
        let (sub, rest) = command::split(arg);
        match sub {
            "back" => {
                self.send(ThreadCommand::StepBack(count(rest)?));
                Ok(Next::Done)
            }
            "reset" => {
                self.send(ThreadCommand::StepReset);
                Ok(Next::Done)
            }
            _ if tc.is_replaying() => {
                self.send(ThreadCommand::StepForward(count(arg)?));
                Ok(Next::Done)
            }
            _ => self.resume(ThreadCommand::Step {
                kind: StepKind::In,
                count: count(arg)?,
            }),
        }
    }

    fn break_command(&mut self, arg: &str) -> Handled {
        if arg.is_empty() {
            self.list_breakpoints();
            return Ok(Next::Retry);
        }
        let args = BreakArgs::parse(arg)?;
        match BreakTarget::parse(args.sig.as_deref())? {
            BreakTarget::Line { file, line } => {
                let path = match file {
                    Some(file) => file,
                    None => self
                        .stopped()?
                        .location()
                        .map(|loc| loc.path)
                        .ok_or_else(|| SessionError::Usage("no current file".to_string()))?,
                };
                let bp = Breakpoint::line(path, line)
                    .with_cond(args.cond)
                    .with_command(args.command)
                    .with_path(args.path);
                self.add_line_breakpoint(bp)?;
                Ok(Next::Retry)
            }
            BreakTarget::Method {
                receiver,
                op,
                name,
            } => {
                self.stopped()?;
                self.send(ThreadCommand::MethodBreakpoint {
                    receiver,
                    op,
                    name,
                    args,
                });
                Ok(Next::Done)
            }
            BreakTarget::Check => {
                let Some(predicate) = args.cond else {
                    return Err(SessionError::Usage(format!(
                        "Unknown breakpoint format: {arg}"
                    )));
                };
                let bp = Breakpoint::check(predicate)
                    .with_command(args.command)
                    .with_path(args.path);
                self.register_breakpoint(Arc::new(bp));
                Ok(Next::Retry)
            }
        }
    }

    fn delete_command(&mut self, arg: &str) -> Handled {
        match optional(arg) {
            None => {
                if self.ctx.breakpoints().is_empty() {
                    return Ok(Next::Retry);
                }
                if is_yes(&self.transport.ask("Remove all breakpoints? [y/N] ", "n")?) {
                    let n = self.delete_all_breakpoints();
                    self.transport.puts(&format!("{n} breakpoints deleted"));
                }
            }
            Some(n) => {
                let number = n
                    .parse::<usize>()
                    .map_err(|_| SessionError::Usage(format!("{n} is not a breakpoint number")))?;
                let bp = self
                    .delete_breakpoint(number)
                    .ok_or_else(|| SessionError::Usage(format!("Unknown breakpoint #{number}")))?;
                self.transport
                    .puts(&format!("deleted: #{number}  {}", bp.label()));
            }
        }
        Ok(Next::Retry)
    }

    fn list_breakpoints(&mut self) {
        let lines: Vec<String> = self
            .ctx
            .breakpoints()
            .iter()
            .map(|bp| format!("#{}  {}", bp.number().unwrap_or(0), bp.label()))
            .collect();
        self.print(&lines);
    }

    fn list_threads(&mut self) {
        let current = self.tc.as_ref().map(|tc| tc.id());
        let lines: Vec<String> = self
            .ctx
            .clients()
            .iter()
            .map(|tc| {
                let marker = if Some(tc.id()) == current { "--> " } else { "    " };
                let state = if tc.is_waiting() { "waiting" } else { "running" };
                let mut line = format!("{marker}#{} {} ({state})", tc.id(), tc.name());
                if let Some(loc) = tc.location() {
                    line.push_str(&format!(" @ {loc}"));
                }
                line
            })
            .collect();
        self.print(&lines);
    }

    fn info_command(&mut self, arg: &str) -> Handled {
        let (rest, re) = command::trailing_pattern(arg);
        let pattern = pattern(re)?;
        let (sub, sub_arg) = command::split(rest);
        let kind = match sub {
            "" => InfoKind::Default,
            "l" | "local" | "locals" | "local_variables" => InfoKind::Locals,
            "i" | "ivar" | "ivars" | "instance_variables" => InfoKind::Ivars(optional(sub_arg)),
            "g" | "global" | "globals" | "global_variables" => InfoKind::Globals,
            "th" | "thread" | "threads" => {
                self.list_threads();
                return Ok(Next::Retry);
            }
            "b" | "break" | "breakpoints" => {
                self.list_breakpoints();
                return Ok(Next::Retry);
            }
            other => return Err(SessionError::Usage(format!("unknown info target: {other}"))),
        };
        self.show(ShowTarget::Info { kind, pattern })
    }

    fn trace_command(&mut self, arg: &str) -> Handled {
        let (head, into) = match arg.split_once("into:") {
            Some((head, file)) => (head.trim(), optional(file).map(PathBuf::from)),
            None => (arg, None),
        };
        let (rest, re) = command::trailing_pattern(head);
        let pattern = pattern(re)?;
        let (sub, sub_arg) = command::split(rest);
        let kind = match sub {
            "" => {
                if self.tracers.is_empty() {
                    self.transport.puts("No tracers");
                }
                let labels: Vec<String> = self.tracers.iter().map(|t| t.label()).collect();
                self.print(&labels);
                return Ok(Next::Retry);
            }
            "line" => TracerKind::Line,
            "call" => TracerKind::Call,
            "exception" | "raise" => TracerKind::Exception,
            "object" => {
                let expr = optional(sub_arg)
                    .ok_or_else(|| SessionError::Usage("trace object <expr>".to_string()))?;
                self.stopped()?;
                self.send(ThreadCommand::TraceObject {
                    expr,
                    pattern,
                    into,
                });
                return Ok(Next::Done);
            }
            "off" => {
                let target = optional(sub_arg);
                let (off, keep): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut self.tracers).into_iter().partition(|t| {
                        match &target {
                            None => true,
                            Some(t_arg) => {
                                t.number().map(|n| n.to_string()).as_deref() == Some(t_arg.as_str())
                                    || t.kind().name() == t_arg
                            }
                        }
                    });
                self.tracers = keep;
                for tracer in off {
                    tracer.disable(&self.ctx);
                    self.transport.puts(&format!("Disable {}", tracer.label()));
                }
                return Ok(Next::Retry);
            }
            other => return Err(SessionError::Usage(format!("unknown tracer: {other}"))),
        };
        self.add_tracer(Tracer::new(kind, pattern, into));
        Ok(Next::Retry)
    }

    fn thread_command(&mut self, arg: &str) -> Handled {
        let Some(n) = optional(arg) else {
            self.list_threads();
            return Ok(Next::Retry);
        };
        let id = n
            .parse::<usize>()
            .map_err(|_| SessionError::Usage(format!("{n} is not a thread id")))?;
        match self.ctx.client(id) {
            Some(tc) if tc.is_waiting() && !tc.is_management() => {
                self.ctx.set_controlling(id);
                self.tc = Some(tc);
                self.send(ThreadCommand::Show(ShowTarget::Whereami));
                Ok(Next::Done)
            }
            _ => Err(SessionError::Usage(format!("#{id} is not controllable yet."))),
        }
    }

    fn config_command(&mut self, arg: &str) -> Handled {
        let mut config = self.ctx.config();
        let words: Vec<&str> = arg.split_whitespace().collect();
        let name = match words.as_slice() {
            [] => {
                let lines = CONFIG_KEYS
                    .iter()
                    .map(|key| {
                        let value = config.get(key.name)?.unwrap_or_default();
                        Ok(format!("{} = {}  # {}", key.name, value, key.description))
                    })
                    .collect::<Result<Vec<String>, SessionError>>()?;
                self.print(&lines);
                return Ok(Next::Retry);
            }
            ["set", name, rest @ ..] | [name, "=", rest @ ..] => {
                config.set(name, &rest.join(" "))?;
                *name
            }
            ["append", name, rest @ ..] | [name, "<<", rest @ ..] => {
                config.append(name, &rest.join(" "))?;
                *name
            }
            ["unset", name] => {
                config.unset(name)?;
                *name
            }
            [name] => {
                let value = config.get(name)?.unwrap_or_default();
                self.transport.puts(&format!("{name} = {value}"));
                return Ok(Next::Retry);
            }
            _ => {
                return Err(SessionError::Usage(
                    "config [name|set name value|append name value|unset name]".to_string(),
                ))
            }
        };
        let value = config.get(name)?.unwrap_or_default();
        self.ctx.update_config(config);
        self.sync_renderer();
        tracing::info!("config {} = {}", name, value);
        self.transport.puts(&format!("{name} = {value}"));
        Ok(Next::Retry)
    }

    fn open_command(&mut self, arg: &str) -> Handled {
        let Some(factory) = &self.factory else {
            return Err(SessionError::Usage("open is not available".to_string()));
        };
        let transport = factory.open(arg, &self.ctx.config())?;
        self.transport
            .puts(&format!("Switching to {}", transport.name()));
        self.transport = transport;
        let handle = self.handle();
        self.transport.activate(handle);
        self.sync_renderer();
        tracing::info!("transport switched to {}", self.transport.name());
        Ok(Next::Retry)
    }

    /// Detach and end the debuggee with `code`.
    fn quit(&mut self, code: i32) -> Next {
        for tracer in std::mem::take(&mut self.tracers) {
            tracer.disable(&self.ctx);
        }
        self.ctx.deactivate();
        self.transport.quit(code);
        match self.tc.take() {
            Some(tc) => {
                tc.send(ThreadCommand::Quit(code));
            }
            None => self.ctx.exit(code),
        }
        if self.depth > 0 {
            self.depth = 0;
            self.ctx.process_group().leave();
        }
        Next::Exit
    }
}
