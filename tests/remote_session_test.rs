//! Runs the `snag` binary with a TCP front end and debugs the demo program
//! over the line protocol.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use snag_ui::{Greeting, VERSION};

struct Debuggee(Child);

impl Drop for Debuggee {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    pid: String,
}

impl Client {
    /// Read `out` lines up to the next prompt.
    fn until_prompt(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            let mut line = String::new();
            assert_ne!(self.reader.read_line(&mut line).unwrap(), 0, "closed after {out:?}");
            let line = line.trim_end();
            if let Some(pid) = line.strip_prefix("input ") {
                self.pid = pid.to_string();
                return out;
            }
            if let Some(text) = line.strip_prefix("out ") {
                out.push(text.to_string());
            } else if line == "out" {
                out.push(String::new());
            }
        }
    }

    fn send(&mut self, command: &str) {
        writeln!(self.writer, "command {} 80 {}", self.pid, command).unwrap();
    }

    fn command(&mut self, command: &str) -> String {
        self.send(command);
        self.until_prompt().join("\n")
    }
}

fn start(home: &std::path::Path) -> (Debuggee, Client) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_snag"))
        .env("HOME", home)
        .env("SNAG_OPEN", "tcp")
        .env_remove("SNAG_PORT")
        .env_remove("SNAG_COOKIE")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let stderr = child.stderr.take().unwrap();
    let child = Debuggee(child);

    let mut banner = String::new();
    BufReader::new(stderr).read_line(&mut banner).unwrap();
    let addr = banner
        .split_whitespace()
        .find(|word| word.starts_with("127.0.0.1:"))
        .unwrap_or_else(|| panic!("no address in {banner:?}"))
        .to_string();

    let stream = TcpStream::connect(&addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    writeln!(writer, "{}", Greeting::new(80, None).format()).unwrap();
    let client = Client {
        reader: BufReader::new(stream),
        writer,
        pid: String::new(),
    };
    (child, client)
}

#[test]
fn demo_program_is_debugged_over_the_line_protocol() {
    let home = tempfile::TempDir::new().unwrap();
    let (mut debuggee, mut client) = start(home.path());
    assert!(VERSION.contains('.'));

    let entry = client.until_prompt().join("\n");
    assert!(entry.contains("shop.rb:1"), "{entry}");

    let out = client.command("break cart.rb:9");
    assert!(out.contains("#1  BP - Line"), "{out}");

    let stop = client.command("c");
    assert!(stop.contains("Stop by #1"), "{stop}");
    assert!(stop.contains("Cart#total"), "{stop}");

    assert_eq!(client.command("p @count"), "=> 10");

    client.send("c");
    let mut rest = String::new();
    let _ = client.reader.read_to_string(&mut rest);

    let status = debuggee.0.wait().unwrap();
    assert!(status.success(), "{status:?}");
    let mut stdout = String::new();
    if let Some(mut out) = debuggee.0.stdout.take() {
        out.read_to_string(&mut stdout).unwrap();
    }
    assert!(stdout.contains("total: 20"), "{stdout}");
}
