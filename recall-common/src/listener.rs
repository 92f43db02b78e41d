// Copyright 2026 recall Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, sync::Arc};

use parking_lot::RwLock;

use crate::error::Error;

/// Listener of load failures.
pub trait ErrorListener: Send + Sync + 'static {
    /// Called for every failed fetch and every identity mismatch, regardless of which operation triggered the load.
    fn on_error(&self, error: &Error);
}

impl<F> ErrorListener for F
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    fn on_error(&self, error: &Error) {
        self(error)
    }
}

/// Listener of entities leaving the entity cache.
///
/// Called after the cache state is updated and outside of the cache lock.
pub trait EvictionListener: Send + Sync + 'static {
    /// Associated id type.
    type Id;

    /// Called when the id is evicted, including evictions issued by a reload.
    fn on_evict(&self, id: &Self::Id);

    /// Called when the whole cache is reset.
    fn on_reset(&self);
}

/// Handle returned on registration, used to unregister the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Inner {
    listeners: Vec<(ListenerId, Arc<dyn ErrorListener>)>,
    next: u64,
}

/// Registry of error listeners.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct ErrorListeners {
    inner: Arc<RwLock<Inner>>,
}

impl Debug for ErrorListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorListeners").field("len", &self.len()).finish()
    }
}

impl ErrorListeners {
    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn ErrorListener>) -> ListenerId {
        let mut inner = self.inner.write();
        let id = ListenerId(inner.next);
        inner.next += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Unregister a listener. Returns `false` if the listener was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.write();
        let len = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != len
    }

    /// Deliver the error to all listeners in registration order.
    ///
    /// Listeners are invoked outside the registry lock, so a listener may register or unregister listeners.
    pub fn notify(&self, error: &Error) {
        let listeners = self
            .inner
            .read()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener.on_error(error);
        }
    }

    /// Count of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.read().listeners.len()
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_add_notify_remove() {
        let listeners = ErrorListeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let id = listeners.add(Arc::new(move |e: &Error| {
            assert!(e.is_evicted());
            c.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(listeners.len(), 1);

        listeners.notify(&Error::Evicted);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert!(listeners.is_empty());

        listeners.notify(&Error::Evicted);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let listeners = ErrorListeners::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(parking_lot::Mutex::new(None::<ListenerId>));

        let (l, c, s) = (listeners.clone(), calls.clone(), slot.clone());
        let id = listeners.add(Arc::new(move |_: &Error| {
            c.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = s.lock().take() {
                l.remove(id);
            }
        }));
        *slot.lock() = Some(id);

        listeners.notify(&Error::Closed);
        listeners.notify(&Error::Closed);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
