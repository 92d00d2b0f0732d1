//! The plain line protocol.
//!
//! A client opens with `version: V width: W cookie: C nonstop: B`. After
//! that the server sends `out <text>`, `input <pid>`, `ask <pid> <prompt>`
//! and `quit`; the client sends `command <pid> <width> <text>`,
//! `answer <pid> <text>` and `pause`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::error::UiError;
use crate::link::{Link, Outgoing};
use crate::server::{Settings, VERSION};

/// The opening line of a line-protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: String,
    pub width: usize,
    /// `None` is sent as `-`.
    pub cookie: Option<String>,
    pub nonstop: bool,
}

impl Greeting {
    pub fn new(width: usize, cookie: Option<String>) -> Self {
        Self {
            version: VERSION.to_string(),
            width,
            cookie,
            nonstop: false,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut version = None;
        let mut width = None;
        let mut cookie = None;
        let mut nonstop = None;
        let mut tokens = line.split_whitespace();
        while let Some(key) = tokens.next() {
            let value = tokens.next()?;
            match key {
                "version:" => version = Some(value.to_string()),
                "width:" => width = value.parse().ok(),
                "cookie:" => cookie = Some((value != "-").then(|| value.to_string())),
                "nonstop:" => nonstop = value.parse().ok(),
                _ => return None,
            }
        }
        Some(Self {
            version: version?,
            width: width?,
            cookie: cookie?,
            nonstop: nonstop?,
        })
    }

    pub fn format(&self) -> String {
        format!(
            "version: {} width: {} cookie: {} nonstop: {}",
            self.version,
            self.width,
            self.cookie.as_deref().unwrap_or("-"),
            self.nonstop
        )
    }
}

/// Accept or reject a greeting. A rejection carries the text sent back.
fn check(line: &str, settings: &Settings) -> Result<Greeting, String> {
    let greeting = Greeting::parse(line.trim())
        .ok_or_else(|| format!("Invalid greeting ({})", line.trim()))?;
    if greeting.version != VERSION {
        return Err(format!(
            "Incompatible version (server:{} and client:{})",
            VERSION, greeting.version
        ));
    }
    if let Some(expected) = &settings.cookie {
        if greeting.cookie.as_deref() != Some(expected.as_str()) {
            return Err(format!(
                "Cookie mismatch ({:?} was sent)",
                greeting.cookie.as_deref().unwrap_or("-")
            ));
        }
    }
    Ok(greeting)
}

/// A line sent by the client after the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientMessage {
    Command { width: usize, text: String },
    Answer(String),
    Pause,
}

impl ClientMessage {
    fn parse(line: &str) -> Result<Self, UiError> {
        let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));
        match kind {
            "pause" => Ok(ClientMessage::Pause),
            "command" => {
                let mut parts = rest.splitn(3, ' ');
                let _pid = parts.next();
                let width = parts
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| UiError::Protocol(format!("bad command line {line:?}")))?;
                let text = parts.next().unwrap_or("").to_string();
                Ok(ClientMessage::Command { width, text })
            }
            "answer" => {
                let text = rest.split_once(' ').map(|(_, text)| text).unwrap_or("");
                Ok(ClientMessage::Answer(text.to_string()))
            }
            _ => Err(UiError::Protocol(format!("unknown message {line:?}"))),
        }
    }
}

pub(crate) async fn serve(
    first: &str,
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    link: &Arc<Link>,
    settings: &Settings,
) -> Result<(), UiError> {
    let greeting = match check(first, settings) {
        Ok(greeting) => greeting,
        Err(reason) => {
            writer
                .write_all(format!("out DEBUGGER: {reason}\n").as_bytes())
                .await?;
            writer.shutdown().await?;
            return Err(UiError::Handshake(reason));
        }
    };
    tracing::debug!(width = greeting.width, nonstop = greeting.nonstop, "line client");
    link.set_width(greeting.width);

    let (tx, mut lines) = unbounded_channel();
    let reading = tokio::spawn(read_lines(reader, tx));
    let mut outgoing = link.connect();
    let pid = std::process::id();
    let result = loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => match ClientMessage::parse(&line) {
                    Ok(ClientMessage::Command { width, text }) => {
                        link.set_width(width);
                        link.line(text);
                    }
                    Ok(ClientMessage::Answer(text)) => link.answer(text),
                    Ok(ClientMessage::Pause) => link.interrupt(),
                    Err(e) => tracing::warn!("{}", e),
                },
                None => break Ok(()),
            },
            out = outgoing.recv() => match out {
                Some(out) => {
                    if let Err(e) = write(&mut writer, out, pid).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
        }
    };
    reading.abort();
    result
}

async fn read_lines(mut reader: BufReader<OwnedReadHalf>, tx: UnboundedSender<String>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                if tx.send(line.trim_end_matches(['\r', '\n']).to_string()).is_err() {
                    return;
                }
            }
        }
    }
}

async fn write(writer: &mut OwnedWriteHalf, out: Outgoing, pid: u32) -> Result<(), UiError> {
    let text = match out {
        Outgoing::Out(line) => format!("out {line}\n"),
        Outgoing::Prompt { .. } => format!("input {pid}\n"),
        Outgoing::Ask { prompt, .. } => format!("ask {pid} {prompt}\n"),
        Outgoing::Quit(_) => "quit\n".to_string(),
        Outgoing::Flush(done) => {
            writer.flush().await?;
            let _ = done.send(());
            return Ok(());
        }
        Outgoing::Event(_) | Outgoing::Reply { .. } => return Ok(()),
    };
    writer.write_all(text.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(cookie: Option<&str>) -> Settings {
        Settings {
            cookie: cookie.map(str::to_string),
            addr: ([127, 0, 0, 1], 0).into(),
            session_name: "test".into(),
        }
    }

    #[test]
    fn greeting_round_trip() {
        let g = Greeting::new(120, None);
        assert_eq!(Greeting::parse(&g.format()), Some(g.clone()));
        assert!(g.format().contains("cookie: -"));
        assert_eq!(Greeting::parse("version: 1 width: x cookie: - nonstop: false"), None);
        assert_eq!(Greeting::parse("version: 1 width: 80"), None);
    }

    #[test]
    fn greetings_are_checked() {
        let ok = Greeting::new(80, Some("c1".into())).format();
        assert!(check(&ok, &settings(Some("c1"))).is_ok());
        assert!(check(&ok, &settings(None)).is_ok());

        let err = check(&Greeting::new(80, None).format(), &settings(Some("c1"))).unwrap_err();
        assert!(err.starts_with("Cookie mismatch"), "{err}");

        let old = "version: 0.0.0-old width: 80 cookie: - nonstop: false";
        let err = check(old, &settings(None)).unwrap_err();
        assert_eq!(
            err,
            format!("Incompatible version (server:{VERSION} and client:0.0.0-old)")
        );
        assert!(check("version: what", &settings(None)).unwrap_err().starts_with("Invalid greeting"));
    }

    #[test]
    fn client_messages() {
        assert_eq!(
            ClientMessage::parse("command 42 100 break app.rb:3").unwrap(),
            ClientMessage::Command {
                width: 100,
                text: "break app.rb:3".into()
            }
        );
        assert_eq!(
            ClientMessage::parse("command 42 100").unwrap(),
            ClientMessage::Command {
                width: 100,
                text: String::new()
            }
        );
        assert_eq!(ClientMessage::parse("answer 42 y").unwrap(), ClientMessage::Answer("y".into()));
        assert_eq!(ClientMessage::parse("pause").unwrap(), ClientMessage::Pause);
        assert!(ClientMessage::parse("command 42 wide x").is_err());
        assert!(ClientMessage::parse("hello").is_err());
    }
}
