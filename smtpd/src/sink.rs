//! The DATA sink adapter: exposes the framed DATA payload to the consumer
//! as a paused-by-default, backpressured byte stream, through a narrow
//! `onData(stream, session, done)` contract. The consumer drains (or
//! doesn't) an [`AsyncRead`], and may call `done()` before end-of-stream,
//! in which case the adapter drains and discards the remainder itself
//! before acknowledging the client.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// A chunk of DATA payload, or the end-of-stream marker, fed from the
/// session's receive loop to the sink's [`DataStream`]. The channel's
/// bounded capacity is what gives `DATA` backpressure:
/// the producer's `send` awaits until the consumer reads.
enum Chunk {
    Bytes(Vec<u8>),
}

/// The consumer-facing half of the DATA adapter: a paused-by-default
/// `AsyncRead` over the framed, dot-unstuffed payload. Dropping this
/// before reaching EOF is the "early `done()`" case; the producer side
/// detects the closed channel and drains/discards the rest of the payload
/// itself.
pub struct DataStream {
    rx: mpsc::Receiver<Chunk>,
    leftover: Vec<u8>,
    leftover_pos: usize,
}

impl DataStream {
    pub(crate) fn new(rx: mpsc::Receiver<Chunk>) -> Self {
        Self {
            rx,
            leftover: Vec::new(),
            leftover_pos: 0,
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.leftover_pos < self.leftover.len() {
            let available = &self.leftover[self.leftover_pos..];
            let to_copy = available.len().min(buf.remaining());
            buf.put_slice(&available[..to_copy]);
            self.leftover_pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Chunk::Bytes(bytes))) => {
                let to_copy = bytes.len().min(buf.remaining());
                buf.put_slice(&bytes[..to_copy]);
                if to_copy < bytes.len() {
                    self.leftover = bytes;
                    self.leftover_pos = to_copy;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The producer-facing half, owned by the session's receive loop. Feeds
/// unstuffed payload chunks to the consumer; once the channel's receiver
/// is gone (the consumer finished early), [`DataSource::feed`] reports
/// that so the session can switch to discarding remaining bytes straight
/// off the wire without attempting further sends.
pub struct DataSource {
    tx: Option<mpsc::Sender<Chunk>>,
}

impl DataSource {
    /// Builds a connected producer/consumer pair. The bounded channel
    /// capacity (a handful of chunks) is the backpressure knob: a slow
    /// consumer stalls the producer's `send`, which stalls the session's
    /// socket reads, without ever buffering the whole message.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, DataStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, DataStream::new(rx))
    }

    /// Feeds one chunk of payload. Returns `true` if the consumer is
    /// still receiving, `false` once it has finished early and the
    /// caller should switch to discard mode.
    pub async fn feed(&mut self, bytes: Vec<u8>) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        if tx.send(Chunk::Bytes(bytes)).await.is_err() {
            self.tx = None;
            return false;
        }
        true
    }

    /// Signals end-of-stream by dropping the sender half.
    pub fn finish(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stream_yields_fed_bytes_in_order() {
        let (mut source, mut stream) = DataSource::channel(4);
        source.feed(b"hello ".to_vec()).await;
        source.feed(b"world".to_vec()).await;
        source.finish();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn backpressure_blocks_feed_until_drained() {
        let (mut source, mut stream) = DataSource::channel(1);
        assert!(source.feed(b"a".to_vec()).await);
        // Second feed would block on an unbuffered/zero-capacity channel
        // until the consumer reads; spawn the consumer concurrently.
        let consumer = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let mut total = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                total.extend_from_slice(&buf[..n]);
            }
            total
        });
        assert!(source.feed(b"b".to_vec()).await);
        source.finish();
        let received = consumer.await.unwrap();
        assert_eq!(received, b"ab");
    }

    #[tokio::test]
    async fn early_completion_reports_consumer_gone() {
        let (mut source, stream) = DataSource::channel(4);
        drop(stream); // consumer finished without reading anything
        // Consumer dropped the stream without reading; further feeds
        // must report the consumer is gone rather than hang.
        assert!(!source.feed(b"late".to_vec()).await);
    }

    #[tokio::test]
    async fn consumer_reads_full_payload_to_eof() {
        let (mut source, mut stream) = DataSource::channel(4);
        source.feed(b"payload".to_vec()).await;
        source.finish();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");
    }
}
