//! Flow-controlled result sink
//!
//! Records are handed to a bounded channel drained by a writer task. When the
//! channel is full the sink switches to buffering: every later record goes to
//! an ordered local buffer until capacity frees up, and the buffer is then
//! replayed one record at a time, re-checking capacity after each. Records are
//! never reordered or dropped while the writer is alive.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tracing::{debug, warn};

/// Default number of records the channel holds before the sink buffers
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
struct SinkState {
    tx: Option<mpsc::Sender<String>>,
    buffer: VecDeque<String>,
    buffering: bool,
    closing: bool,
}

/// Writing half of the result stream
#[derive(Clone, Debug)]
pub struct ResultSink {
    state: Arc<Mutex<SinkState>>,
}

/// Reading half, drained into the output by [`SinkReceiver::pump`]
#[derive(Debug)]
pub struct SinkReceiver {
    rx: mpsc::Receiver<String>,
}

/// Create a sink whose channel holds `capacity` records
pub fn channel(capacity: usize) -> (ResultSink, SinkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = ResultSink {
        state: Arc::new(Mutex::new(SinkState {
            tx: Some(tx),
            buffer: VecDeque::new(),
            buffering: false,
            closing: false,
        })),
    };
    (sink, SinkReceiver { rx })
}

impl ResultSink {
    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a record, or buffer it if the writer cannot take it yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn write(&self, record: impl Into<String>) {
        let record = record.into();
        let mut state = self.lock();

        if state.closing {
            warn!("result sink is closed, dropping record {:?}", record.trim_end());
            return;
        }

        if state.buffering {
            state.buffer.push_back(record);
            return;
        }

        let Some(tx) = state.tx.clone() else {
            return;
        };

        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                debug!("result sink is full, buffering");
                state.buffering = true;
                state.buffer.push_back(record);
                self.wait_for_drain(tx);
            }
            Err(TrySendError::Closed(record)) => {
                warn!("result writer is gone, dropping record {:?}", record.trim_end());
            }
        }
    }

    /// No more records will be accepted. The writer finishes once the
    /// buffer has drained.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closing = true;
        if !state.buffering {
            state.tx = None;
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.lock().buffering
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    fn wait_for_drain(&self, tx: mpsc::Sender<String>) {
        let sink = self.clone();
        tokio::spawn(async move {
            match tx.reserve_owned().await {
                Ok(permit) => sink.on_drain(permit),
                Err(_) => sink.abandon(),
            }
        });
    }

    fn on_drain(&self, permit: OwnedPermit<String>) {
        let mut state = self.lock();

        let Some(first) = state.buffer.pop_front() else {
            state.buffering = false;
            return;
        };
        let tx = permit.send(first);

        while let Some(record) = state.buffer.pop_front() {
            match tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(record)) => {
                    state.buffer.push_front(record);
                    drop(state);
                    self.wait_for_drain(tx);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    drop(state);
                    self.abandon();
                    return;
                }
            }
        }

        state.buffering = false;
        if state.closing {
            state.tx = None;
        }
    }

    fn abandon(&self) {
        let mut state = self.lock();
        if !state.buffer.is_empty() {
            warn!(
                "result writer is gone, dropping {} buffered records",
                state.buffer.len()
            );
        }
        state.buffer.clear();
        state.buffering = false;
        state.tx = None;
    }
}

impl SinkReceiver {
    /// Write every record to `writer` until the sink is closed and drained,
    /// then hand the writer back.
    pub async fn pump<W>(mut self, mut writer: W) -> io::Result<W>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(record) = self.rx.recv().await {
            writer.write_all(record.as_bytes()).await?;
        }
        writer.flush().await?;
        Ok(writer)
    }
}
