//! Reactor
//!
//! Single-threaded event multiplexer owned by the network thread. Readable
//! sources are keyed streams; one poll sweeps every source once and returns
//! what became ready, or nothing when the timeout elapsed first.

use core::fmt::Debug;
use core::task::Poll;
use std::time::Duration;

use futures::future::poll_fn;
use futures::stream::{BoxStream, StreamExt};

/// Outcome of one source during a poll sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent<K, T> {
    /// The source produced an item
    Readable(K, T),
    /// The source is exhausted and has been unregistered
    Closed(K),
}

/// Keyed set of readable sources
pub struct Reactor<K, T> {
    sources: Vec<(K, BoxStream<'static, T>)>,
}

impl<K, T> Default for Reactor<K, T> {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
        }
    }
}

impl<K: Clone + PartialEq + Debug, T> Reactor<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any source under the same key
    pub fn add(&mut self, key: K, source: BoxStream<'static, T>) {
        match self.sources.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => {
                tracing::trace!(?key, "Replacing reactor source");
                entry.1 = source;
            }
            None => {
                tracing::trace!(?key, "Adding reactor source");
                self.sources.push((key, source));
            }
        }
    }

    /// Unregister a source; returns whether it was present
    pub fn remove(&mut self, key: &K) -> bool {
        let before = self.sources.len();
        self.sources.retain(|(k, _)| k != key);
        before != self.sources.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.sources.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    /// Wait up to `timeout` for readiness
    ///
    /// Each source contributes at most one item per call, in registration
    /// order. An empty result means the timeout elapsed with nothing ready.
    pub async fn poll(&mut self, timeout: Duration) -> Vec<ReactorEvent<K, T>> {
        let sources = &mut self.sources;
        let sweep = poll_fn(|cx| {
            let mut events = Vec::new();
            let mut index = 0;
            while index < sources.len() {
                match sources[index].1.poll_next_unpin(cx) {
                    Poll::Ready(Some(item)) => {
                        events.push(ReactorEvent::Readable(sources[index].0.clone(), item));
                        index += 1;
                    }
                    Poll::Ready(None) => {
                        let (key, _) = sources.remove(index);
                        events.push(ReactorEvent::Closed(key));
                    }
                    Poll::Pending => index += 1,
                }
            }
            if events.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(events)
            }
        });

        tokio::time::timeout(timeout, sweep).await.unwrap_or_default()
    }
}
