//! Per-job publish/subscribe channel with replay.
//!
//! A [`JobChannel`] buffers output (when created buffered) and remembers the
//! terminal result, so a subscriber that arrives late still sees everything:
//! the accumulated output as one prefix event, then live output in production
//! order, then exactly one `completed` event. Subscribing and publishing share
//! one lock, so no event can fall between the replay and live delivery.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

/// One event delivered to a job observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    Output { text: String },
    Completed { success: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    InProgress,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        self != JobState::InProgress
    }
}

struct Inner {
    /// `None` for channels that never retain output
    log: Option<String>,
    state: JobState,
    listeners: HashMap<u64, mpsc::UnboundedSender<JobEvent>>,
    next_listener: u64,
}

pub struct JobChannel {
    inner: Mutex<Inner>,
}

impl JobChannel {
    /// A channel that keeps every output chunk for replay.
    pub fn buffered() -> Arc<Self> {
        Self::with_log(Some(String::new()))
    }

    /// A channel that only carries the completion event.
    pub fn unbuffered() -> Arc<Self> {
        Self::with_log(None)
    }

    fn with_log(log: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                log,
                state: JobState::InProgress,
                listeners: HashMap::new(),
                next_listener: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new observer. Buffered output and, if reached, the terminal
    /// result are queued on the subscription before this returns.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if let Some(log) = inner.log.as_ref().filter(|log| !log.is_empty()) {
            let _ = tx.send(JobEvent::Output { text: log.clone() });
        }

        let id = match inner.state {
            JobState::InProgress => {
                let id = inner.next_listener;
                inner.next_listener += 1;
                inner.listeners.insert(id, tx);
                Some(id)
            }
            state => {
                // Dropping `tx` after this send ends the subscription stream.
                let _ = tx.send(JobEvent::Completed {
                    success: state == JobState::Succeeded,
                });
                None
            }
        };

        Subscription {
            id,
            channel: Arc::downgrade(self),
            rx,
        }
    }

    /// Append output and forward it to every attached observer. Output is
    /// retained even with no observers attached.
    pub fn publish(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        if let Some(log) = inner.log.as_mut() {
            log.push_str(&text);
        }
        inner.listeners.retain(|_, tx| tx.send(JobEvent::Output { text: text.clone() }).is_ok());
    }

    /// Record the terminal result, deliver it to every observer and detach
    /// them all. Returns `false` if the channel was already closed.
    pub fn close(&self, success: bool) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = if success {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        for (_, tx) in inner.listeners.drain() {
            let _ = tx.send(JobEvent::Completed { success });
        }
        true
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    /// Everything published so far, for buffered channels.
    pub fn output(&self) -> Option<String> {
        self.lock().log.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().listeners.remove(&id);
    }
}

/// Receiving end of a [`JobChannel`] subscription.
///
/// The stream ends after the `completed` event. Dropping it (for example when
/// an SSE client disconnects) removes the listener; the job keeps running.
pub struct Subscription {
    id: Option<u64>,
    channel: Weak<JobChannel>,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let (Some(id), Some(channel)) = (self.id, self.channel.upgrade()) {
            channel.unsubscribe(id);
        }
    }
}
