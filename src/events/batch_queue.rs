use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;

use super::dispatcher::EventTransport;
use super::payload::EventPayload;
use crate::{Error, Result};

/// Called after every batch request with the error (if any) and the events of that request.
///
/// Implemented for any `Fn(Option<&Error>, &[serde_json::Value])`.
pub trait FlushCallback {
    /// Receive the outcome of one batch request.
    fn on_flush(&self, error: Option<&Error>, events: &[Value]);
}

impl<T: Fn(Option<&Error>, &[Value])> FlushCallback for T {
    fn on_flush(&self, error: Option<&Error>, events: &[Value]) {
        self(error, events)
    }
}

/// Enables event batching. Events are queued and sent together when the queue reaches
/// `events_per_request` or every `request_time_interval`, whichever comes first.
#[derive(Clone)]
pub struct BatchEventData {
    pub(crate) events_per_request: usize,
    pub(crate) request_time_interval: Duration,
    pub(crate) flush_callback: Option<Arc<dyn FlushCallback + Send + Sync>>,
}

impl BatchEventData {
    /// Default value for the number of events sent in one request.
    pub const DEFAULT_EVENTS_PER_REQUEST: usize = 100;
    /// Upper bound for the number of events sent in one request.
    pub const MAX_EVENTS_PER_REQUEST: usize = 5000;
    /// Default time between two timed flushes.
    pub const DEFAULT_REQUEST_TIME_INTERVAL: Duration = Duration::from_secs(600);

    /// Create batch settings with default values.
    pub fn new() -> BatchEventData {
        BatchEventData::default()
    }

    /// Update the number of events that triggers a flush and bounds one request.
    ///
    /// Values outside `1..=5000` are ignored and the default is kept.
    pub fn with_events_per_request(mut self, events_per_request: usize) -> BatchEventData {
        if (1..=BatchEventData::MAX_EVENTS_PER_REQUEST).contains(&events_per_request) {
            self.events_per_request = events_per_request;
        } else {
            log::warn!(target: "vwo",
                       events_per_request;
                       "events_per_request must be between 1 and {}, using {}",
                       BatchEventData::MAX_EVENTS_PER_REQUEST,
                       BatchEventData::DEFAULT_EVENTS_PER_REQUEST);
            self.events_per_request = BatchEventData::DEFAULT_EVENTS_PER_REQUEST;
        }
        self
    }

    /// Update the time between timed flushes. Zero is ignored and the default is kept.
    pub fn with_request_time_interval(mut self, interval: Duration) -> BatchEventData {
        if interval.is_zero() {
            log::warn!(target: "vwo", "request_time_interval must be positive, using the default");
            self.request_time_interval = BatchEventData::DEFAULT_REQUEST_TIME_INTERVAL;
        } else {
            self.request_time_interval = interval;
        }
        self
    }

    /// Set a callback invoked after every batch request.
    pub fn with_flush_callback(
        mut self,
        callback: impl FlushCallback + Send + Sync + 'static,
    ) -> BatchEventData {
        self.flush_callback = Some(Arc::new(callback));
        self
    }
}

impl Default for BatchEventData {
    fn default() -> BatchEventData {
        BatchEventData {
            events_per_request: BatchEventData::DEFAULT_EVENTS_PER_REQUEST,
            request_time_interval: BatchEventData::DEFAULT_REQUEST_TIME_INTERVAL,
            flush_callback: None,
        }
    }
}

impl std::fmt::Debug for BatchEventData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEventData")
            .field("events_per_request", &self.events_per_request)
            .field("request_time_interval", &self.request_time_interval)
            .field("flush_callback", &self.flush_callback.is_some())
            .finish()
    }
}

enum TimerCommand {
    Flush,
    Stop,
}

struct Timer {
    commands: SyncSender<TimerCommand>,
    join_handle: JoinHandle<()>,
}

struct Queue {
    events: Mutex<VecDeque<EventPayload>>,
    events_per_request: usize,
    flush_callback: Option<Arc<dyn FlushCallback + Send + Sync>>,
    transport: Arc<dyn EventTransport>,
}

impl Queue {
    /// Send everything queued so far in requests of at most `events_per_request` events.
    ///
    /// On failure the unsent events go back to the front of the queue in their original order.
    fn flush(&self) -> Result<()> {
        let pending: Vec<EventPayload> = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.drain(..).collect()
        };
        if pending.is_empty() {
            return Ok(());
        }
        log::debug!(target: "vwo", count = pending.len(); "flushing events");

        let mut sent = 0;
        let mut failure = None;
        for chunk in pending.chunks(self.events_per_request) {
            let result = self.transport.send_batch(chunk);
            if let Some(callback) = &self.flush_callback {
                let bodies: Vec<Value> = chunk.iter().map(|event| event.body.clone()).collect();
                callback.on_flush(result.as_ref().err(), &bodies);
            }
            if let Err(err) = result {
                failure = Some(err);
                break;
            }
            sent += chunk.len();
        }

        let Some(err) = failure else {
            return Ok(());
        };
        log::warn!(target: "vwo", count = pending.len() - sent; "failed to send events, requeueing: {err:?}");
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        for event in pending.into_iter().skip(sent).rev() {
            events.push_front(event);
        }
        Err(err)
    }
}

/// Queues events and sends them in batches from a timer thread.
pub(crate) struct BatchEventQueue {
    queue: Arc<Queue>,
    timer: Mutex<Option<Timer>>,
}

impl BatchEventQueue {
    pub(crate) fn start(
        data: BatchEventData,
        transport: Arc<dyn EventTransport>,
    ) -> Result<BatchEventQueue> {
        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::new()),
            events_per_request: data.events_per_request,
            flush_callback: data.flush_callback,
            transport,
        });

        // A single slot is enough: a pending flush covers every later request.
        let (commands, receiver) = sync_channel::<TimerCommand>(1);
        let interval = data.request_time_interval;
        let join_handle = {
            let queue = Arc::clone(&queue);
            std::thread::Builder::new()
                .name("vwo-batch-flush".to_owned())
                .spawn(move || loop {
                    match receiver.recv_timeout(interval) {
                        Ok(TimerCommand::Flush) | Err(RecvTimeoutError::Timeout) => {
                            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                                || queue.flush(),
                            ));
                            match result {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => {
                                    log::debug!(target: "vwo", "timed flush failed: {err:?}");
                                }
                                Err(_) => {
                                    log::warn!(target: "vwo", "batch flush panicked");
                                }
                            }
                        }
                        Ok(TimerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "vwo", "batch flush thread stopped");
                            return;
                        }
                    }
                })?
        };

        Ok(BatchEventQueue {
            queue,
            timer: Mutex::new(Some(Timer {
                commands,
                join_handle,
            })),
        })
    }

    /// Queue `event` and wake the timer thread once a full batch is waiting.
    ///
    /// Never sends on the caller's thread. Once the timer is stopped at most one batch is held
    /// for the next [`BatchEventQueue::flush_and_stop`] and later events are dropped.
    pub(crate) fn enqueue(&self, event: EventPayload) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let len = {
            let mut events = self
                .queue
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if timer.is_none() && events.len() >= self.queue.events_per_request {
                log::warn!(target: "vwo",
                           event = event.name.as_str();
                           "batch queue is stopped and full, dropping event");
                return;
            }
            events.push_back(event);
            events.len()
        };
        if len < self.queue.events_per_request {
            return;
        }

        if let Some(timer) = timer.as_ref() {
            match timer.commands.try_send(TimerCommand::Flush) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    log::warn!(target: "vwo", "batch flush thread exited");
                }
            }
        }
    }

    /// Stop the timer thread, then send whatever is still queued.
    pub(crate) fn flush_and_stop(&self) -> Result<()> {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            // Fails only if the thread is already gone.
            let _ = timer.commands.send(TimerCommand::Stop);
            timer.join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        }
        self.queue.flush()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
