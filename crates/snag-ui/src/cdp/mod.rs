//! Chrome DevTools Protocol front end: HTTP discovery, then a WebSocket
//! session.

mod adapter;
pub mod websocket;

use std::sync::Arc;

use serde_json::json;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::unbounded_channel;

use crate::error::UiError;
use crate::link::{Link, Outgoing};
use crate::server::{Settings, VERSION};
use adapter::{CdpAdapter, Command};
use websocket::{OPCODE_CLOSE, OPCODE_PING, OPCODE_PONG, OPCODE_TEXT};

/// A stable UUID-shaped id for this debuggee.
pub(crate) fn target_id(settings: &Settings) -> String {
    let digest = Sha1::digest(format!("{}@{}", settings.session_name, settings.addr).as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub(crate) fn devtools_url(settings: &Settings) -> String {
    format!(
        "devtools://devtools/bundled/inspector.html?v8only=true&ws={}/{}",
        settings.addr,
        target_id(settings)
    )
}

/// Serve an HTTP request whose request line was `first`.
pub(crate) async fn serve(
    first: &str,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    link: &Arc<Link>,
    settings: &Settings,
) -> Result<(), UiError> {
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        headers.push(line.to_string());
    }

    let id = target_id(settings);
    let path = first.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/json/version" => {
            let body = json!({ "Browser": format!("snag/v{VERSION}"), "Protocol-Version": "1.3" });
            http_json(&mut writer, &body).await
        }
        "/json" | "/json/list" => {
            let ws = format!("{}/{}", settings.addr, id);
            let body = json!([{
                "description": "snag debuggee",
                "devtoolsFrontendUrl": format!("devtools://devtools/bundled/inspector.html?v8only=true&ws={ws}"),
                "id": id,
                "title": settings.session_name,
                "type": "node",
                "url": "file://",
                "webSocketDebuggerUrl": format!("ws://{ws}"),
            }]);
            http_json(&mut writer, &body).await
        }
        p if p.trim_start_matches('/') == id => {
            let key = websocket::upgrade_key(headers.iter().map(String::as_str))?;
            writer
                .write_all(websocket::upgrade_response(&key).as_bytes())
                .await?;
            tracing::info!("devtools attached");
            session(reader, writer, link).await
        }
        other => {
            writer
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            Err(UiError::Handshake(format!("unknown path {other}")))
        }
    }
}

async fn http_json(writer: &mut OwnedWriteHalf, body: &serde_json::Value) -> Result<(), UiError> {
    let body = serde_json::to_string(body)?;
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn session(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    link: &Arc<Link>,
) -> Result<(), UiError> {
    let (tx, mut frames) = unbounded_channel();
    let reading = tokio::spawn(async move {
        loop {
            match websocket::read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("WebSocket read failed: {}", e);
                    return;
                }
            }
        }
    });

    let mut adapter = CdpAdapter::new();
    let mut outgoing = link.connect();
    let result = loop {
        let messages = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => match frame.opcode {
                    OPCODE_TEXT => match serde_json::from_slice::<Command>(&frame.payload) {
                        Ok(cmd) => adapter.on_command(cmd, link),
                        Err(e) => {
                            tracing::warn!("ignoring malformed CDP message: {}", e);
                            continue;
                        }
                    },
                    OPCODE_PING => {
                        let pong = websocket::encode_frame(OPCODE_PONG, &frame.payload, None);
                        if let Err(e) = writer.write_all(&pong).await {
                            break Err(e.into());
                        }
                        continue;
                    }
                    OPCODE_CLOSE => {
                        let _ = writer.write_all(&websocket::close_frame()).await;
                        break Ok(());
                    }
                    _ => continue,
                },
                None => break Ok(()),
            },
            out = outgoing.recv() => match out {
                Some(Outgoing::Flush(done)) => {
                    if let Err(e) = writer.flush().await {
                        break Err(e.into());
                    }
                    let _ = done.send(());
                    continue;
                }
                Some(out) => adapter.on_outgoing(out, link),
                None => break Ok(()),
            },
        };
        if let Err(e) = write(&mut writer, &messages).await {
            break Err(e);
        }
    };
    reading.abort();
    result
}

async fn write(writer: &mut OwnedWriteHalf, messages: &[serde_json::Value]) -> Result<(), UiError> {
    for message in messages {
        let text = serde_json::to_string(message)?;
        writer.write_all(&websocket::text_frame(&text)).await?;
    }
    Ok(())
}
