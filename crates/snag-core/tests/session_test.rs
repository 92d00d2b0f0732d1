//! End-to-end scenarios: a probe program driven through a scripted console.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use snag_core::probe::{ProbeThread, Runtime};
use snag_core::session::protocol::{ProtocolReply, ProtocolRequest};
use snag_core::source::CodeUnit;
use snag_core::transport::{ScriptHandle, Scripted, ScriptedTransport};
use snag_core::{Config, Engine, EngineOptions, EvalError, Value};

const MAIN_SRC: &str = "require_relative 'calc'\ncalc = Calc.new\np calc.add(1, 2)\n";
const CALC_SRC: &str = "class Calc\n  def add(a, b)\n    sum = a + b\n    sum\n  end\nend\n";

struct Harness {
    engine: Engine,
    script: ScriptHandle,
    exits: Arc<Mutex<Vec<i32>>>,
}

fn start(rt: &Arc<Runtime>, config: Config) -> Harness {
    let (transport, script) = ScriptedTransport::new(80);
    let exits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exits);
    let engine = Engine::start(
        config,
        rt.instrumentation(),
        Box::new(transport),
        EngineOptions {
            factory: None,
            on_exit: Some(Arc::new(move |code| sink.lock().unwrap().push(code))),
        },
    )
    .unwrap();
    Harness {
        engine,
        script,
        exits,
    }
}

fn main_unit() -> Arc<CodeUnit> {
    CodeUnit::script("main.rb", 1, 3).lines([1, 2, 3]).build()
}

fn calc_unit() -> Arc<CodeUnit> {
    CodeUnit::script("calc.rb", 1, 6)
        .lines([1, 2])
        .child(CodeUnit::method("Calc#add", 2, 5).lines([3, 4]))
        .build()
}

/// `main.rb` loads `calc.rb` at line 1 and calls `Calc#add` at line 3.
fn calc_program(t: &ProbeThread) -> Result<Value, EvalError> {
    let main = main_unit();
    t.load(&main, MAIN_SRC);
    t.run_script(&main, |t| {
        t.line(1);
        let calc = calc_unit();
        t.load(&calc, CALC_SRC);
        let add = Arc::clone(&calc.children()[0]);
        t.define_method(
            "Calc",
            "add",
            &["a", "b"],
            &add,
            Arc::new(|t: &ProbeThread| {
                t.line(3);
                t.eval("sum = a + b")?;
                t.line(4);
                Ok(t.get("sum"))
            }),
        );
        t.line(2);
        let obj = t.call(&Value::Class("Calc".into()), "new", vec![])?;
        t.set("calc", obj.clone());
        t.line(3);
        t.call(&obj, "add", vec![Value::Int(1), Value::Int(2)])
    })
}

fn spawn_calc(rt: &Arc<Runtime>) -> JoinHandle<Result<Value, EvalError>> {
    rt.spawn("main", calc_program).unwrap()
}

#[test]
fn pending_line_breakpoint_binds_on_load_and_stops() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);

    let entry = h.script.until_prompt().unwrap();
    assert!(entry.text().contains("main.rb:1"), "{}", entry.text());

    let out = h.script.command("break calc.rb:4").unwrap();
    assert!(out.text().contains("#1  BP - Line (pending)  calc.rb:4"), "{}", out.text());

    let stop = h.script.command("c").unwrap();
    assert!(stop.text().contains("Stop by #1  BP - Line  calc.rb:4 (line)"), "{}", stop.text());
    assert!(stop.text().contains("=>#0\tCalc#add at calc.rb:4"), "{}", stop.text());

    let out = h.script.command("p sum").unwrap();
    assert_eq!(out.lines(), vec!["=> 3"]);

    h.script.send("c");
    assert_eq!(program.join().unwrap(), Ok(Value::Int(3)));
    h.engine.shutdown().unwrap();
}

#[test]
fn duplicate_breakpoints_are_rejected() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();

    h.script.command("break main.rb:3").unwrap();
    let out = h.script.command("break main.rb:3").unwrap();
    assert!(out.text().contains("duplicated breakpoint"), "{}", out.text());
    let out = h.script.command("break").unwrap();
    assert_eq!(out.lines().len(), 1);

    h.script.command("c").unwrap();
    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}

#[test]
fn next_stops_at_a_breakpoint_inside_the_call() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();

    h.script.command("break main.rb:3").unwrap();
    h.script.command("break calc.rb:4").unwrap();
    let stop = h.script.command("c").unwrap();
    assert!(stop.text().contains("Stop by #1"), "{}", stop.text());

    let stop = h.script.command("next").unwrap();
    assert!(stop.text().contains("Stop by #2"), "{}", stop.text());

    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}

fn rec_unit() -> Arc<CodeUnit> {
    CodeUnit::script("rec.rb", 1, 10)
        .lines([8])
        .child(CodeUnit::method("Rec#down", 2, 6).lines([3, 4, 5]))
        .build()
}

fn rec_program(t: &ProbeThread) -> Result<Value, EvalError> {
    let unit = rec_unit();
    t.load(&unit, &"#\n".repeat(10));
    let down = Arc::clone(&unit.children()[0]);
    t.define_method(
        "Rec",
        "down",
        &["n"],
        &down,
        Arc::new(|t: &ProbeThread| {
            t.line(3);
            let Value::Int(n) = t.get("n") else {
                return Err(t.raise("TypeError", "n"));
            };
            if n == 0 {
                t.line(4);
                return Ok(Value::Int(0));
            }
            t.line(5);
            match t.call(&t.receiver(), "down", vec![Value::Int(n - 1)])? {
                Value::Int(r) => Ok(Value::Int(r + 1)),
                other => Ok(other),
            }
        }),
    );
    t.run_script(&unit, |t| {
        t.line(8);
        let rec = t.call(&Value::Class("Rec".into()), "new", vec![])?;
        t.call(&rec, "down", vec![Value::Int(3)])
    })
}

#[test]
fn finish_two_returns_from_two_frames() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = rt.spawn("main", rec_program).unwrap();
    h.script.until_prompt().unwrap();

    h.script.command("break rec.rb:4").unwrap();
    let stop = h.script.command("c").unwrap();
    assert!(stop.text().contains("Stop by #1"), "{}", stop.text());
    let bt = h.script.command("bt").unwrap();
    assert_eq!(bt.lines().len(), 5, "{}", bt.text());

    let stop = h.script.command("finish 2").unwrap();
    assert!(stop.text().contains("=>#0\tRec#down at rec.rb:5 #=> 1"), "{}", stop.text());
    let bt = h.script.command("bt").unwrap();
    assert_eq!(bt.lines().len(), 4, "{}", bt.text());

    h.script.send("c");
    assert_eq!(program.join().unwrap(), Ok(Value::Int(3)));
    h.engine.shutdown().unwrap();
}

#[test]
fn other_threads_freeze_while_one_is_stopped() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let ticks = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let (main_ticks, worker_done) = (Arc::clone(&ticks), Arc::clone(&done));
    let program = rt
        .spawn("main", move |t| {
            let main = main_unit();
            t.load(&main, MAIN_SRC);
            t.run_script(&main, move |t| {
                t.line(1);
                let worker_ticks = Arc::clone(&main_ticks);
                let worker = t
                    .runtime()
                    .spawn("worker", move |t| {
                        let unit = CodeUnit::script("work.rb", 1, 3).lines([2]).build();
                        t.load(&unit, "loop do\n  tick\nend\n");
                        t.run_script(&unit, |t| {
                            while !worker_done.load(Ordering::SeqCst) {
                                t.line(2);
                                worker_ticks.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_millis(1));
                            }
                            Ok(Value::Nil)
                        })
                    })
                    .map_err(|e| EvalError::Raised {
                        class: "ThreadError".into(),
                        message: e.to_string(),
                    })?;
                while main_ticks.load(Ordering::SeqCst) == 0 {
                    std::thread::yield_now();
                }
                t.line(2);
                t.line(3);
                worker.join().unwrap_or(Ok(Value::Nil))
            })
        })
        .unwrap();

    h.script.until_prompt().unwrap();
    h.script.command("break main.rb:2").unwrap();
    let stop = h.script.command("c").unwrap();
    assert!(stop.text().contains("Stop by #1"), "{}", stop.text());

    std::thread::sleep(Duration::from_millis(50));
    let frozen = ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), frozen);

    let threads = h.script.command("info threads").unwrap();
    assert!(threads.text().contains("--> #1 main (waiting)"), "{}", threads.text());
    assert!(threads.text().contains("#2 worker (waiting)"), "{}", threads.text());

    h.script.send("c");
    std::thread::sleep(Duration::from_millis(50));
    assert!(ticks.load(Ordering::SeqCst) > frozen);
    done.store(true, Ordering::SeqCst);
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}

#[test]
fn stale_frame_ids_are_rejected_after_resume() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();
    h.script.command("break calc.rb:3").unwrap();
    h.script.command("break calc.rb:4").unwrap();
    h.script.command("c").unwrap();

    h.script.request(1, ProtocolRequest::StackTrace { thread: None });
    let out = h.script.until_prompt().unwrap();
    let Some((1, Ok(ProtocolReply::StackTrace(frames)))) = out.replies().into_iter().next() else {
        panic!("no stack trace: {out:?}");
    };
    assert_eq!(frames[0].name, "Calc#add");
    let stale = frames[0].id;

    h.script.request(2, ProtocolRequest::Scopes { frame: stale });
    let out = h.script.until_prompt().unwrap();
    assert!(matches!(out.replies()[0], (2, Ok(ProtocolReply::Scopes(_)))));

    h.script.request(3, ProtocolRequest::Next);
    let out = h.script.until_prompt().unwrap();
    assert!(matches!(out.replies()[0], (3, Ok(ProtocolReply::Ack))));

    h.script.request(4, ProtocolRequest::Scopes { frame: stale });
    let out = h.script.until_prompt().unwrap();
    assert!(matches!(&out.replies()[0], (4, Err(_))), "{out:?}");

    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}

#[test]
fn postmortem_allows_inspection_only() {
    let rt = Runtime::new();
    let mut config = Config::default();
    config.boot.nonstop = true;
    config.control.postmortem = true;
    let h = start(&rt, config);
    let program = rt
        .spawn("main", |t| {
            let unit = CodeUnit::script("boom.rb", 1, 3).lines([1, 2]).build();
            t.load(&unit, "x = 5\nx / 0\n");
            t.run_script(&unit, |t| {
                t.line(1);
                t.eval("x = 5")?;
                t.line(2);
                t.eval("x / 0")
            })
        })
        .unwrap();

    let stop = h.script.until_prompt().unwrap();
    assert!(
        stop.text().contains("Enter postmortem mode with ZeroDivisionError"),
        "{}",
        stop.text()
    );
    assert_eq!(stop.prompt.as_deref(), Some("(snag:postmortem) "));

    let out = h.script.command("step").unwrap();
    assert_eq!(out.lines(), vec!["step is not supported in the postmortem mode"]);
    let out = h.script.command("p x").unwrap();
    assert_eq!(out.lines(), vec!["=> 5"]);

    h.script.send("c");
    assert!(program.join().unwrap().is_err());
    h.engine.shutdown().unwrap();
}

#[test]
fn evaluation_can_stop_in_a_nested_session() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();

    h.script.command("break main.rb:3").unwrap();
    h.script.command("c").unwrap();
    h.script.command("break calc.rb:4").unwrap();

    let nested = h.script.command("p calc.add(5, 6)").unwrap();
    assert!(nested.text().contains("Stop by #2"), "{}", nested.text());
    let out = h.script.command("p sum").unwrap();
    assert_eq!(out.lines(), vec!["=> 11"]);

    let back = h.script.command("c").unwrap();
    assert!(back.lines().contains(&"=> 11".to_string()), "{}", back.text());

    h.script.command("c").unwrap();
    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}

#[test]
fn quit_detaches_and_reports_the_exit_code() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();
    h.script.command("break calc.rb:4").unwrap();

    h.script.send("quit 3");
    let asked = h.script.until(|i| matches!(i, Scripted::Ask(_))).unwrap();
    assert!(asked.items.iter().any(|i| matches!(i, Scripted::Ask(p) if p == "Really quit? [Y/n] ")));
    h.script.send("");
    h.script.until(|i| matches!(i, Scripted::Quit(3))).unwrap();

    assert_eq!(program.join().unwrap(), Ok(Value::Int(3)));
    h.engine.join().unwrap();
    assert_eq!(*h.exits.lock().unwrap(), vec![3]);
}

#[test]
fn another_threads_breakpoint_is_reported_after_continue() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let reached = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&reached);
    let program = rt
        .spawn("main", move |t| {
            let main = main_unit();
            t.load(&main, MAIN_SRC);
            t.run_script(&main, move |t| {
                t.line(1);
                let seen = Arc::clone(&flag);
                let worker = t
                    .runtime()
                    .spawn("worker", move |t| {
                        let unit = CodeUnit::script("work.rb", 1, 2).lines([2]).build();
                        t.load(&unit, "wait\nwork\n");
                        t.run_script(&unit, |t| {
                            while !seen.load(Ordering::SeqCst) {
                                std::thread::yield_now();
                            }
                            std::thread::sleep(Duration::from_millis(20));
                            t.line(2);
                            Ok(Value::Nil)
                        })
                    })
                    .map_err(|e| EvalError::Raised {
                        class: "ThreadError".into(),
                        message: e.to_string(),
                    })?;
                flag.store(true, Ordering::SeqCst);
                t.line(2);
                t.line(3);
                worker.join().unwrap_or(Ok(Value::Nil))
            })
        })
        .unwrap();

    h.script.until_prompt().unwrap();
    h.script.command("break main.rb:2").unwrap();
    h.script.command("break work.rb:2").unwrap();
    let stop = h.script.command("c").unwrap();
    assert!(stop.text().contains("BP - Line  main.rb:2"), "{}", stop.text());

    std::thread::sleep(Duration::from_millis(100));
    let threads = h.script.command("info threads").unwrap();
    assert!(!threads.text().contains("Stop by"), "{}", threads.text());
    assert!(threads.text().contains("--> #1 main (waiting)"), "{}", threads.text());

    let stop = h.script.command("c").unwrap();
    assert!(stop.text().contains("BP - Line  work.rb:2"), "{}", stop.text());
    assert!(!stop.text().contains("main.rb:2"), "{}", stop.text());

    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}

const LIB_SRC: &str = "x = 1\ny = x + 1\n";

/// `main.rb` loads `lib.rb` on line 1 and again on line 2.
fn reload_program(t: &ProbeThread) -> Result<Value, EvalError> {
    let main = main_unit();
    t.load(&main, "load 'lib.rb'\nload 'lib.rb'\ndone\n");
    t.run_script(&main, |t| {
        for line in [1, 2] {
            t.line(line);
            let lib = CodeUnit::script("lib.rb", 1, 2).lines([1, 2]).build();
            t.load(&lib, LIB_SRC);
            t.run_script(&lib, |t| {
                t.line(1);
                t.line(2);
                Ok(Value::Nil)
            })?;
        }
        t.line(3);
        Ok(Value::Int(2))
    })
}

#[test]
fn line_breakpoint_rebinds_after_reload() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = rt.spawn("main", reload_program).unwrap();
    h.script.until_prompt().unwrap();

    let out = h.script.command("break lib.rb:2").unwrap();
    assert!(out.text().contains("(pending)  lib.rb:2"), "{}", out.text());

    let first = h.script.command("c").unwrap();
    assert!(first.text().contains("BP - Line  lib.rb:2"), "{}", first.text());
    let second = h.script.command("c").unwrap();
    assert!(second.text().contains("BP - Line  lib.rb:2"), "{}", second.text());

    let list = h.script.command("break").unwrap();
    assert_eq!(list.lines().len(), 1, "{}", list.text());
    assert!(list.text().contains("lib.rb:2"), "{}", list.text());

    h.script.send("c");
    assert_eq!(program.join().unwrap(), Ok(Value::Int(2)));
    h.engine.shutdown().unwrap();
}

#[test]
fn threads_started_during_a_stop_are_listed() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();

    h.script.command("break calc.rb:4").unwrap();
    h.script.command("c").unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let (gate, mark) = (Arc::clone(&release), Arc::clone(&started));
    let late = rt
        .spawn("late", move |_| {
            mark.store(true, Ordering::SeqCst);
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(Value::Nil)
        })
        .unwrap();
    while !started.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let threads = h.script.command("info threads").unwrap();
    assert!(threads.text().contains("--> #1 main (waiting)"), "{}", threads.text());
    assert!(threads.text().contains("#2 late"), "{}", threads.text());

    release.store(true, Ordering::SeqCst);
    h.script.send("c");
    late.join().unwrap().unwrap();
    assert_eq!(program.join().unwrap(), Ok(Value::Int(3)));
    h.engine.shutdown().unwrap();
}

#[test]
fn process_group_depth_tracks_the_stop() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let ctx = Arc::clone(h.engine.context());
    let program = spawn_calc(&rt);

    h.script.until_prompt().unwrap();
    assert_eq!(ctx.process_group().depth(), 1);
    h.script.command("p 1 + 1").unwrap();
    assert_eq!(ctx.process_group().depth(), 1);

    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
    assert_eq!(ctx.process_group().depth(), 0);
}

#[test]
fn continue_to_stops_once_and_forgets_the_location() {
    let rt = Runtime::new();
    let h = start(&rt, Config::default());
    let program = spawn_calc(&rt);
    h.script.until_prompt().unwrap();

    h.script.request(1, ProtocolRequest::ContinueTo {
        path: "calc.rb".into(),
        line: 4,
    });
    let out = h.script.until_prompt().unwrap();
    assert!(matches!(out.replies()[0], (1, Ok(ProtocolReply::Ack))), "{out:?}");
    assert!(out.text().contains("BP - Line  calc.rb:4 (line)"), "{}", out.text());

    let list = h.script.command("break").unwrap();
    assert!(list.lines().is_empty(), "{}", list.text());

    h.script.send("c");
    assert_eq!(program.join().unwrap(), Ok(Value::Int(3)));
    h.engine.shutdown().unwrap();
}

#[test]
fn pause_stops_a_running_thread_once() {
    let rt = Runtime::new();
    let mut config = Config::default();
    config.boot.nonstop = true;
    let h = start(&rt, config);
    let done = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&done);
    let program = rt
        .spawn("main", move |t| {
            let unit = CodeUnit::script("spin.rb", 1, 3).lines([2]).build();
            t.load(&unit, "loop do\n  spin\nend\n");
            t.run_script(&unit, |t| {
                while !flag.load(Ordering::SeqCst) {
                    t.line(2);
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(Value::Nil)
            })
        })
        .unwrap();

    h.engine.handle().pause();
    let stop = h.script.until_prompt().unwrap();
    let paused = stop.events().into_iter().any(|e| {
        matches!(e, snag_core::EngineEvent::Suspended { reason: snag_core::StopReason::Pause, .. })
    });
    assert!(paused, "{stop:?}");
    assert!(stop.text().contains("spin.rb:2"), "{}", stop.text());

    done.store(true, Ordering::SeqCst);
    h.script.send("c");
    program.join().unwrap().unwrap();
    h.engine.shutdown().unwrap();
}
