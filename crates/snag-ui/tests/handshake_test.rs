//! Socket-level scenarios against a live `RemoteTransport`, driven by a
//! plain blocking client.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use snag_core::{Config, Input, Transport};
use snag_ui::dap::codec::encode_message;
use snag_ui::{Greeting, RemoteTransport, VERSION};

fn listener(cookie: Option<&str>) -> RemoteTransport {
    let mut config = Config::default();
    config.remote.cookie = cookie.map(str::to_string);
    RemoteTransport::bind(&config).unwrap()
}

fn connect(addr: SocketAddr) -> (BufReader<TcpStream>, TcpStream) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    (BufReader::new(stream.try_clone().unwrap()), stream)
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

fn read_dap(reader: &mut BufReader<TcpStream>) -> Value {
    let header = read_line(reader);
    let len: usize = header
        .strip_prefix("Content-Length: ")
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("bad header {header:?}"));
    assert_eq!(read_line(reader), "");
    let mut body = vec![0; len];
    reader.read_exact(&mut body).unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[test]
fn wrong_version_is_rejected_and_the_listener_keeps_accepting() {
    let mut transport = listener(None);
    let addr = transport.local_addr();

    let (mut reader, mut writer) = connect(addr);
    writeln!(writer, "version: 0.0.0 width: 80 cookie: - nonstop: false").unwrap();
    let reply = read_line(&mut reader);
    assert_eq!(
        reply,
        format!("out DEBUGGER: Incompatible version (server:{VERSION} and client:0.0.0)")
    );
    assert_eq!(read_line(&mut reader), "");

    let session = thread::spawn(move || {
        transport.puts("hello again");
        let input = transport.readline("(snag) ");
        transport.quit(0);
        input
    });

    let (mut reader, mut writer) = connect(addr);
    writeln!(writer, "{}", Greeting::new(80, None).format()).unwrap();
    assert_eq!(read_line(&mut reader), "out hello again");
    let prompt = read_line(&mut reader);
    let pid = prompt.strip_prefix("input ").expect("input prompt");
    writeln!(writer, "command {pid} 80 c").unwrap();
    assert_eq!(read_line(&mut reader), "quit");

    let input = session.join().unwrap();
    assert!(matches!(input, Ok(Input::Line(line)) if line == "c"));
}

#[test]
fn cookie_mismatch_is_rejected_and_the_listener_keeps_accepting() {
    let mut transport = listener(Some("s3cret"));
    let addr = transport.local_addr();

    let (mut reader, mut writer) = connect(addr);
    writeln!(writer, "{}", Greeting::new(80, Some("guess".into())).format()).unwrap();
    assert!(read_line(&mut reader).starts_with("out DEBUGGER: Cookie mismatch"));

    let session = thread::spawn(move || {
        transport.puts("hello from snag");
        let input = transport.readline("(snag) ");
        transport.quit(0);
        (transport, input)
    });

    let (mut reader, mut writer) = connect(addr);
    writeln!(writer, "{}", Greeting::new(100, Some("s3cret".into())).format()).unwrap();
    assert_eq!(read_line(&mut reader), "out hello from snag");
    let prompt = read_line(&mut reader);
    let pid = prompt.strip_prefix("input ").expect("input prompt");
    writeln!(writer, "command {pid} 120 bt").unwrap();
    assert_eq!(read_line(&mut reader), "quit");

    let (transport, input) = session.join().unwrap();
    assert!(matches!(input, Ok(Input::Line(line)) if line == "bt"));
    assert_eq!(transport.width(), 120);
}

#[test]
fn dap_client_is_initialized_and_refused_before_the_engine_runs() {
    let transport = listener(None);
    let (mut reader, mut writer) = connect(transport.local_addr());

    let init = json!({"seq": 1, "type": "request", "command": "initialize", "arguments": {"adapterID": "snag"}});
    writer.write_all(&encode_message(&init)).unwrap();
    let response = read_dap(&mut reader);
    assert_eq!(response["type"], "response");
    assert_eq!(response["command"], "initialize");
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);
    let event = read_dap(&mut reader);
    assert_eq!(event["event"], "initialized");

    let threads = json!({"seq": 2, "type": "request", "command": "threads"});
    writer.write_all(&encode_message(&threads)).unwrap();
    let response = read_dap(&mut reader);
    assert_eq!(response["request_seq"], 2);
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "debugger is not running");
}

#[test]
fn cdp_discovery_reports_version_and_target() {
    let transport = listener(None);
    let addr = transport.local_addr();

    let (mut reader, mut writer) = connect(addr);
    write!(writer, "GET /json/version HTTP/1.1\r\nHost: {addr}\r\n\r\n").unwrap();
    let mut response = String::new();
    reader.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains(&format!("snag/v{VERSION}")), "{response}");

    let (mut reader, mut writer) = connect(addr);
    write!(writer, "GET /json/list HTTP/1.1\r\nHost: {addr}\r\n\r\n").unwrap();
    let mut response = String::new();
    reader.read_to_string(&mut response).unwrap();
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let targets: Value = serde_json::from_str(body).unwrap();
    let ws = targets[0]["webSocketDebuggerUrl"].as_str().unwrap();
    assert!(ws.starts_with(&format!("ws://{addr}/")), "{ws}");
}
