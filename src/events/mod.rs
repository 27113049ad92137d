//! Impression and tracking events, sent either one by one or in batches.
mod batch_queue;
mod dispatcher;
mod payload;

pub use batch_queue::{BatchEventData, FlushCallback};

pub(crate) use batch_queue::BatchEventQueue;
pub(crate) use dispatcher::{EventDispatcher, EventTransport, HttpEventTransport};
pub(crate) use payload::{EventBuilder, EventPayload};

#[cfg(test)]
pub(crate) use dispatcher::tests::RecordingTransport;

use std::sync::Arc;

use crate::{Error, Result};

/// Where events go once they are built.
pub(crate) enum EventSink {
    Batch(BatchEventQueue),
    Direct(EventDispatcher),
}

impl EventSink {
    /// Batch when `batch` is given, otherwise send each event from a background thread.
    pub(crate) fn start(
        batch: Option<BatchEventData>,
        transport: Arc<dyn EventTransport>,
    ) -> Result<EventSink> {
        Ok(match batch {
            Some(data) => EventSink::Batch(BatchEventQueue::start(data, transport)?),
            None => EventSink::Direct(EventDispatcher::start(transport)?),
        })
    }

    pub(crate) fn send(&self, event: EventPayload) {
        match self {
            EventSink::Batch(queue) => queue.enqueue(event),
            EventSink::Direct(dispatcher) => dispatcher.dispatch(event),
        }
    }

    /// Send queued events now and stop the timer. Only batching has anything to flush.
    pub(crate) fn flush(&self) -> Result<()> {
        match self {
            EventSink::Batch(queue) => queue.flush_and_stop(),
            EventSink::Direct(_) => Err(Error::BatchingNotEnabled),
        }
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        match self {
            EventSink::Batch(queue) => queue.flush_and_stop(),
            EventSink::Direct(dispatcher) => dispatcher.shutdown(),
        }
    }
}
