//! DAP message framing with a Content-Length header.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::UiError;

/// Encode a JSON value into a DAP wire-format message with Content-Length header.
pub fn encode_message(value: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_string(value).unwrap_or_default();
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut buf = Vec::with_capacity(header.len() + body.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf
}

/// Decode one message from the front of `data`.
///
/// Returns the parsed JSON value and the number of bytes consumed.
pub fn decode_message(data: &[u8]) -> Result<(serde_json::Value, usize), UiError> {
    let separator = b"\r\n\r\n";
    let sep_pos = data
        .windows(separator.len())
        .position(|w| w == separator)
        .ok_or_else(|| UiError::Protocol("incomplete header: missing \\r\\n\\r\\n".into()))?;
    let header = std::str::from_utf8(&data[..sep_pos])
        .map_err(|e| UiError::Protocol(format!("invalid UTF-8 in header: {e}")))?;
    let body_start = sep_pos + separator.len();
    let content_length = parse_content_length(header)?;

    let total_consumed = body_start + content_length;
    if data.len() < total_consumed {
        return Err(UiError::Protocol(format!(
            "incomplete body: expected {content_length} bytes, have {}",
            data.len() - body_start
        )));
    }
    let value = serde_json::from_slice(&data[body_start..total_consumed])?;
    Ok((value, total_consumed))
}

/// Parse the Content-Length value from the header section.
pub(crate) fn parse_content_length(header: &str) -> Result<usize, UiError> {
    for line in header.split("\r\n") {
        if let Some(value) = line.trim().strip_prefix("Content-Length:") {
            let value = value.trim();
            return value.parse::<usize>().map_err(|e| {
                UiError::Protocol(format!("invalid Content-Length value '{value}': {e}"))
            });
        }
    }
    Err(UiError::Protocol("missing Content-Length header".into()))
}

/// Read the next message from a stream.
///
/// `header` is a header line the caller already consumed. Returns `None` at
/// end of stream.
pub(crate) async fn read_message<R>(
    reader: &mut R,
    header: Option<&str>,
) -> Result<Option<serde_json::Value>, UiError>
where
    R: AsyncBufRead + Unpin,
{
    let mut length = header.map(parse_content_length).transpose()?;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim();
        if line.is_empty() {
            if length.is_some() {
                break;
            }
            continue;
        }
        if line.starts_with("Content-Length:") {
            length = Some(parse_content_length(line)?);
        }
    }
    let mut body = vec![0u8; length.unwrap_or(0)];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
