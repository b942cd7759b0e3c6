//! Named live inputs and the stream-join notification handler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::streaming::buffer::StreamEvent;
use crate::streaming::join::{MatchHandler, StreamMatch};
use crate::types::{ExecError, Result, Row};

/// Producer handle for one stream. Sending never blocks; overload is
/// absorbed by the consuming query's buffers.
#[derive(Clone)]
pub struct StreamSender {
    stream: String,
    tx: UnboundedSender<StreamEvent>,
}

impl StreamSender {
    /// Stream this sender feeds.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Publishes one event. Fails once the consuming query has stopped.
    pub fn send(&self, timestamp_ms: i64, row: Row) -> Result<()> {
        self.tx
            .send(StreamEvent::new(self.stream.clone(), timestamp_ms, row))
            .map_err(|_| ExecError::Cancelled)
    }
}

struct StreamSlot {
    // Held until `close`, so a stream stays open while it has no producers.
    sender: Option<UnboundedSender<StreamEvent>>,
    receiver: Option<UnboundedReceiver<StreamEvent>>,
}

impl StreamSlot {
    fn open() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Some(tx),
            receiver: Some(rx),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<String, StreamSlot>,
    match_handler: Option<MatchHandler>,
}

/// Live stream inputs available to streaming queries.
///
/// A stream ends when [`StreamRegistry::close`] has been called and every
/// [`StreamSender`] for it has been dropped. Each stream is consumed by at
/// most one query.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a producer for `stream`, creating the stream if needed. A
    /// closed stream is reopened as a new, empty stream.
    pub fn open(&self, stream: impl Into<String>) -> StreamSender {
        let stream = stream.into();
        let mut inner = self.inner.lock();
        let slot = inner
            .streams
            .entry(stream.clone())
            .or_insert_with(StreamSlot::open);
        let tx = match slot.sender.clone() {
            Some(tx) => tx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                *slot = StreamSlot {
                    sender: Some(tx.clone()),
                    receiver: Some(rx),
                };
                tx
            }
        };
        StreamSender { stream, tx }
    }

    /// Marks the end of `stream` once its outstanding senders are dropped.
    pub fn close(&self, stream: &str) {
        if let Some(slot) = self.inner.lock().streams.get_mut(stream) {
            slot.sender = None;
        }
    }

    /// Registers the handler receiving stream-join matches.
    pub fn on_match<F>(&self, handler: F)
    where
        F: Fn(&StreamMatch) + Send + Sync + 'static,
    {
        self.inner.lock().match_handler = Some(Arc::new(handler));
    }

    pub(crate) fn match_handler(&self) -> Option<MatchHandler> {
        self.inner.lock().match_handler.clone()
    }

    /// Hands the consuming end of `stream` to a query.
    pub(crate) fn take_receiver(&self, stream: &str) -> Result<UnboundedReceiver<StreamEvent>> {
        let mut inner = self.inner.lock();
        let slot = inner
            .streams
            .entry(stream.to_owned())
            .or_insert_with(StreamSlot::open);
        slot.receiver
            .take()
            .ok_or_else(|| ExecError::config(format!("stream {stream} is already consumed")))
    }
}
