//! Background prefetch handles and the observers that receive them.
//!
//! Every adjacency prefetch started by the read cache runs as its own Tokio task. The
//! task's completion is exposed as a [`BufferingHandle`]: a cloneable, awaitable view
//! of the prefetch that any number of observers can hold. Observers are plain
//! callbacks registered with [`BufferingRegistry::register`] and are invoked once per
//! prefetch, synchronously, from the `read` call that started it.
//!
//! Awaiting a handle never influences the prefetch itself; dropping every handle does
//! not cancel it either.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a background prefetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferingOutcome {
    /// The page was fetched and inserted into the read cache.
    Loaded {
        /// Aligned read-page index
        page: u64,
        /// Bytes fetched
        bytes: usize,
    },
    /// The page was fetched after the session was released and was dropped.
    Discarded {
        /// Aligned read-page index
        page: u64,
    },
    /// The fetch failed. The error is logged, never surfaced to a `read`.
    Failed {
        /// Aligned read-page index
        page: u64,
        /// Display form of the underlying error
        reason: String,
    },
}

impl BufferingOutcome {
    /// Page index this outcome refers to.
    #[must_use]
    pub fn page(&self) -> u64 {
        match self {
            Self::Loaded { page, .. } | Self::Discarded { page } | Self::Failed { page, .. } => {
                *page
            }
        }
    }

    /// Whether the page landed in the cache.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }
}

type Completion = Shared<BoxFuture<'static, BufferingOutcome>>;

/// One outstanding or completed background prefetch.
#[derive(Clone)]
pub struct BufferingHandle {
    page: u64,
    completion: Completion,
}

impl BufferingHandle {
    pub(crate) fn new(page: u64, completion: BoxFuture<'static, BufferingOutcome>) -> Self {
        Self {
            page,
            completion: completion.shared(),
        }
    }

    /// Aligned read-page index being prefetched.
    #[must_use]
    pub fn page_index(&self) -> u64 {
        self.page
    }

    /// Wait for the prefetch to finish.
    pub async fn wait(&self) -> BufferingOutcome {
        self.completion.clone().await
    }

    /// Outcome, if the prefetch has already been observed to finish.
    #[must_use]
    pub fn outcome(&self) -> Option<BufferingOutcome> {
        self.completion.peek().cloned()
    }

    /// Whether a completed outcome is available without waiting.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.peek().is_some()
    }
}

impl fmt::Debug for BufferingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingHandle")
            .field("page", &self.page)
            .field("outcome", &self.completion.peek())
            .finish()
    }
}

/// Identifier returned when registering a buffering observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(BufferingHandle) + Send + Sync>;

/// Registry of buffering observers.
#[derive(Default)]
pub struct BufferingRegistry {
    observers: RwLock<HashMap<ObserverId, Observer>>,
    next_id: AtomicU64,
}

impl BufferingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It is called once for every prefetch started afterwards.
    pub fn register<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(BufferingHandle) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().insert(id, Arc::new(observer));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        self.observers.write().remove(&id).is_some()
    }

    /// Hand `handle` to every registered observer.
    pub fn notify_all(&self, handle: &BufferingHandle) {
        // Snapshot so observers may (un)register from inside the callback
        let observers: Vec<Observer> = self.observers.read().values().cloned().collect();
        for observer in observers {
            observer(handle.clone());
        }
    }

    /// Number of registered observers.
    pub fn count(&self) -> usize {
        self.observers.read().len()
    }
}

impl fmt::Debug for BufferingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingRegistry")
            .field("observers", &self.count())
            .finish()
    }
}
