// src/ingest/sources.rs
//! Event sources producing newline-delimited JSON messages.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader, Stdin};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::decode_line;
use super::types::{Event, EventSource};
use crate::metrics::EVENTS_SKIPPED_TOTAL;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(5);
/// Longest accepted message line, excluding the newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Per-stream tallies, logged when a stream ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub skipped: u64,
}

/// Read messages line by line from `reader` and forward decoded events.
///
/// Stops at EOF or once the receiving side is gone. Lines that are not valid
/// UTF-8 or JSON are skipped like any other malformed message, and so are
/// lines longer than [`MAX_LINE_BYTES`], which are discarded without being buffered.
pub async fn forward_lines<R>(mut reader: R, tx: &mpsc::Sender<Event>) -> Result<ForwardStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ForwardStats::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await
            .context("reading event stream")?;
        if n == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        } else if line.len() > MAX_LINE_BYTES {
            skip_rest_of_line(&mut reader).await?;
            tracing::debug!(target: "ingest", limit = MAX_LINE_BYTES, "oversized event line");
            counter!(EVENTS_SKIPPED_TOTAL).increment(1);
            stats.skipped += 1;
            continue;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match decode_line(&line) {
            Some(ev) => {
                if tx.send(ev).await.is_err() {
                    break;
                }
                stats.forwarded += 1;
            }
            None => stats.skipped += 1,
        }
    }
    Ok(stats)
}

/// Consume input up to and including the next newline, or to EOF.
async fn skip_rest_of_line<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await.context("reading event stream")?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Newline-delimited JSON from any buffered reader.
pub struct LineSource<R> {
    name: &'static str,
    reader: R,
}

impl<R> LineSource<R> {
    pub fn new(name: &'static str, reader: R) -> Self {
        Self { name, reader }
    }
}

impl LineSource<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new("stdin", BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait::async_trait]
impl<R> EventSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<Event>) -> Result<()> {
        let LineSource { name, reader } = *self;
        let stats = forward_lines(reader, &tx).await?;
        tracing::info!(
            target: "ingest",
            source = name,
            forwarded = stats.forwarded,
            skipped = stats.skipped,
            "line source exhausted"
        );
        Ok(())
    }
}

/// Accepts TCP connections and reads newline-delimited JSON from each.
pub struct TcpSource {
    listener: TcpListener,
}

impl TcpSource {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding event listener on {addr}"))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait::async_trait]
impl EventSource for TcpSource {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<Event>) -> Result<()> {
        tracing::info!(target: "ingest", addr = ?self.listener.local_addr().ok(), "tcp source listening");
        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            tokio::select! {
                _ = tx.closed() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = ACCEPT_BACKOFF_START;
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            match forward_lines(BufReader::new(stream), &tx).await {
                                Ok(stats) => tracing::debug!(
                                    target: "ingest",
                                    %peer,
                                    forwarded = stats.forwarded,
                                    skipped = stats.skipped,
                                    "connection closed"
                                ),
                                Err(e) => tracing::warn!(target: "ingest", %peer, error = ?e, "connection failed"),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "ingest", error = %e, ?backoff, "accept failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_valid_lines_and_skips_the_rest() {
        let input: &[u8] = b"{\"emoji_type\":\"a\",\"timestamp\":\"2024-05-01T10:00:00Z\"}\n\
            \n\
            garbage\n\
            {\"emoji_type\":\"b\"}\n\
            \xff\xfe\n\
            {\"category\":\"c\",\"timestamp\":\"2024-05-01T10:00:30Z\"}";
        let (tx, mut rx) = mpsc::channel(16);

        let stats = forward_lines(input, &tx).await.unwrap();
        drop(tx);

        assert_eq!(stats, ForwardStats { forwarded: 2, skipped: 3 });
        let mut got = Vec::new();
        while let Some(ev) = rx.recv().await {
            got.push(ev.category);
        }
        assert_eq!(got, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_and_the_next_one_kept() {
        let mut input = vec![b'x'; 100 * 1024];
        input.push(b'\n');
        input.extend_from_slice(b"{\"emoji_type\":\"a\",\"timestamp\":\"2024-05-01T10:00:00Z\"}\n");
        let (tx, mut rx) = mpsc::channel(4);

        let stats = forward_lines(input.as_slice(), &tx).await.unwrap();
        drop(tx);

        assert_eq!(stats, ForwardStats { forwarded: 1, skipped: 1 });
        assert_eq!(rx.recv().await.unwrap().category, "a");
    }

    #[tokio::test]
    async fn line_at_the_limit_is_still_read() {
        let mut input = b"{\"emoji_type\":\"a\",\"timestamp\":\"x\"}".to_vec();
        input.resize(MAX_LINE_BYTES, b' ');
        input.push(b'\n');
        let (tx, _rx) = mpsc::channel(4);

        let stats = forward_lines(input.as_slice(), &tx).await.unwrap();
        assert_eq!(stats, ForwardStats { forwarded: 1, skipped: 0 });
    }

    #[tokio::test]
    async fn stops_when_receiver_is_gone() {
        let input: &[u8] = b"{\"emoji_type\":\"a\",\"timestamp\":\"x\"}\n{\"emoji_type\":\"a\",\"timestamp\":\"x\"}\n";
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let stats = forward_lines(input, &tx).await.unwrap();
        assert_eq!(stats.forwarded, 0);
    }
}
