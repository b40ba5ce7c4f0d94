//! Bridges an async chunk producer to a blocking `std::io::Read` consumer
//! over a bounded channel. The consumer side must run off the async runtime
//! (e.g. inside `spawn_blocking`), since reads block the thread.

use bytes::Bytes;
use std::io::{self, Read};
use tokio::sync::mpsc;

/// Capacity of the chunk channel; bounds how far the producer can run ahead
/// of the parser.
const CHANNEL_DEPTH: usize = 16;

pub fn channel() -> (ChunkSender, ChannelReader) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        ChunkSender { tx },
        ChannelReader {
            rx,
            current: Bytes::new(),
            done: false,
        },
    )
}

/// The async producer half. Send chunks with [`ChunkSender::send`]; dropping
/// the sender signals a clean end-of-stream, [`ChunkSender::fail`] signals an
/// error that the reader will surface as `io::Error`.
pub struct ChunkSender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChunkSender {
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    pub async fn fail(self, error: String) {
        let _ = self
            .tx
            .send(Err(io::Error::new(io::ErrorKind::Other, error)))
            .await;
    }
}

/// The blocking consumer half.
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
    done: bool,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            if self.done {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                None => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }

        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = self.current.slice(n..);
        Ok(n)
    }
}
