//! Build output broadcaster: one append-only file plus live subscribers

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::EngineError;

/// Messages a subscriber may fall behind by before output is dropped for it
pub const SUBSCRIBER_BUFFER: usize = 256;

/// A live view of a sink's output. The channel ends when the sink closes.
#[derive(Debug)]
pub struct LogSubscription {
    id: u64,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl LogSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Fans every write out to an optional file and to each subscriber.
///
/// Writing never waits: file output is queued for a writer task and a full
/// subscriber channel loses that chunk.
#[derive(Debug)]
pub struct LogSink {
    file_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<Vec<u8>>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    buffer: usize,
}

impl LogSink {
    /// Sink without a backing file
    pub fn detached() -> Self {
        Self::with_writer(None, None)
    }

    /// Sink appending to `path`, creating parent directories as needed.
    /// Must be called inside a runtime: the file is owned by a writer task.
    pub async fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_file(file, rx));
        Ok(Self::with_writer(Some(tx), Some(writer)))
    }

    fn with_writer(
        file_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        writer: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            file_tx: Mutex::new(file_tx),
            writer: Mutex::new(writer),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            buffer: SUBSCRIBER_BUFFER,
        }
    }

    /// Override the per-subscriber buffer
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Register a live reader. Subscribing to a closed sink yields an ended channel.
    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.closed.load(Ordering::Acquire) {
            if let Ok(mut subs) = self.subscribers.lock() {
                subs.push((id, tx));
            }
        }
        LogSubscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Write `bytes` to the file and offer a copy to every subscriber
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }

        if let Ok(file_tx) = self.file_tx.lock() {
            if let Some(tx) = file_tx.as_ref() {
                if tx.send(bytes.to_vec()).is_err() {
                    warn!("Build log writer stopped, output not persisted");
                }
            }
        }

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|(_, tx)| match tx.try_send(bytes.to_vec()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Write one line, appending the newline
    pub fn line(&self, message: impl AsRef<str>) {
        let mut bytes = message.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(&bytes);
    }

    /// Stop accepting output and end every subscriber's channel.
    /// Queued file output is still written; see `finish`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut file_tx) = self.file_tx.lock() {
            file_tx.take();
        }
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.clear();
        }
    }

    /// Close the sink and wait until everything written has reached the file
    pub async fn finish(&self) {
        self.close();
        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!("Build log writer failed: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn write_file(mut file: fs::File, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = file.write_all(&chunk).await {
            warn!("Failed to write build log: {}", e);
        }
    }
    if let Err(e) = file.flush().await {
        warn!("Failed to flush build log: {}", e);
    }
}
