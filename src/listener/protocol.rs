//! Framing of the supervisord event listener protocol.
//!
//! The listener announces `READY`, receives one header line of
//! space-separated `key:value` tokens whose `len` gives the size of the
//! payload that follows, and answers `RESULT 2\nOK` before asking for the
//! next notification.

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const READY: &[u8] = b"READY\n";
pub const ACK: &[u8] = b"RESULT 2\nOK";

pub type Headers = HashMap<String, String>;

pub fn parse_headers(line: &str) -> Result<Headers> {
    line.split_whitespace()
        .map(|token| {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| eyre!("Malformed header token {token:?}"))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub headers: Headers,
    pub payload: String,
}

impl Notification {
    pub fn event_name(&self) -> &str {
        self.headers
            .get("eventname")
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Splits the payload into its header line and the remaining body.
    pub fn payload_headers(&self) -> Result<(Headers, &str)> {
        let (line, body) = self
            .payload
            .split_once('\n')
            .unwrap_or((self.payload.as_str(), ""));
        let headers = parse_headers(line).wrap_err("Malformed payload headers")?;
        Ok((headers, body))
    }
}

/// Request/acknowledge channel to supervisord, normally stdin and stdout.
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Channel<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Signals readiness and waits for the next notification.
    /// Returns `None` when the supervisor closes the channel between notifications.
    pub async fn next(&mut self) -> Result<Option<Notification>> {
        self.send(READY).await?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .wrap_err("Failed to read notification header")?;
        if read == 0 {
            return Ok(None);
        }
        trace!("Header: {line:?}");

        let headers = parse_headers(line.trim_end()).wrap_err("Malformed notification header")?;
        if !headers.contains_key("eventname") {
            bail!("Notification header has no eventname: {line:?}");
        }
        let len: usize = headers
            .get("len")
            .ok_or_else(|| eyre!("Notification header has no len: {line:?}"))?
            .parse()
            .wrap_err("Invalid payload length")?;

        let mut payload = Vec::new();
        (&mut self.reader)
            .take(len as u64)
            .read_to_end(&mut payload)
            .await
            .wrap_err("Failed to read notification payload")?;
        if payload.len() != len {
            bail!("Truncated notification payload: {} of {len} bytes", payload.len());
        }
        let payload = String::from_utf8(payload).wrap_err("Payload is not valid UTF-8")?;
        trace!("Payload: {payload:?}");

        Ok(Some(Notification { headers, payload }))
    }

    /// Tells the supervisor the last notification was handled.
    pub async fn ack(&mut self) -> Result<()> {
        self.send(ACK).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .wrap_err("Failed to write to supervisor")?;
        self.writer
            .flush()
            .await
            .wrap_err("Failed to flush supervisor channel")
    }

    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}
