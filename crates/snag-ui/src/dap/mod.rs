//! Debug Adapter Protocol front end.

pub mod codec;
pub mod protocol;

mod adapter;

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::unbounded_channel;

use crate::error::UiError;
use crate::link::{Link, Outgoing};
use adapter::DapAdapter;
use protocol::Request;

/// Serve a DAP client whose first header line was `first`.
pub(crate) async fn serve(
    first: &str,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    link: &Arc<Link>,
) -> Result<(), UiError> {
    let (tx, mut requests) = unbounded_channel();
    let header = first.to_string();
    let reading = tokio::spawn(async move {
        let mut header = Some(header);
        loop {
            match codec::read_message(&mut reader, header.take().as_deref()).await {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("DAP read failed: {}", e);
                    return;
                }
            }
        }
    });

    let mut adapter = DapAdapter::new();
    let mut outgoing = link.connect();
    let result = loop {
        let messages = tokio::select! {
            message = requests.recv() => match message {
                Some(value) => match serde_json::from_value::<Request>(value) {
                    Ok(req) => adapter.on_request(req, link),
                    Err(e) => {
                        tracing::warn!("ignoring malformed DAP message: {}", e);
                        continue;
                    }
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
        writer.write_all(&codec::encode_message(message)).await?;
    }
    Ok(())
}
