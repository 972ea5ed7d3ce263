use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::{JdwpError, Result};

/// A resource that needs an async shutdown step.
pub trait AsyncClose: Send + Sync + 'static {
    fn close(&self) -> BoxFuture<'_, ()>;
}

type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct State<T> {
    count: usize,
    value: Option<Arc<T>>,
    closed: bool,
}

/// Lazily creates a `T` on the first [`retain`](Self::retain) and closes it
/// when the last [`Retained`] guard is released.
///
/// A later `retain` after the count dropped to zero creates a fresh value.
/// Each value is closed at most once, whatever the order of releases.
pub struct ReferenceCountedResource<T: AsyncClose> {
    factory: Factory<T>,
    create_lock: tokio::sync::Mutex<()>,
    state: Mutex<State<T>>,
}

impl<T: AsyncClose> ReferenceCountedResource<T> {
    pub fn new<F, Fut>(factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Arc::new(Self {
            factory: Box::new(move || Box::pin(factory())),
            create_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                count: 0,
                value: None,
                closed: false,
            }),
        })
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn retain_existing(self: &Arc<Self>) -> Result<Option<Retained<T>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(JdwpError::Closed);
        }
        let Some(value) = state.value.clone() else {
            return Ok(None);
        };
        state.count += 1;
        Ok(Some(Retained {
            owner: self.clone(),
            value,
            released: false,
        }))
    }

    pub async fn retain(self: &Arc<Self>) -> Result<Retained<T>> {
        if let Some(retained) = self.retain_existing()? {
            return Ok(retained);
        }

        let _gate = self.create_lock.lock().await;
        if let Some(retained) = self.retain_existing()? {
            return Ok(retained);
        }

        let value = Arc::new((self.factory)().await?);
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.value = Some(value.clone());
                state.count = 1;
                return Ok(Retained {
                    owner: self.clone(),
                    value,
                    released: false,
                });
            }
        }

        // Closed while the factory was running.
        value.close().await;
        Err(JdwpError::Closed)
    }

    /// Decrements the count; returns the value when this was the last
    /// reference so the caller can close it.
    fn release_one(&self) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            state.value.take()
        } else {
            None
        }
    }

    /// Closes the current value (if any) and refuses further retains.
    pub async fn close(&self) {
        let value = {
            let mut state = self.state.lock();
            state.closed = true;
            state.count = 0;
            state.value.take()
        };
        if let Some(value) = value {
            value.close().await;
        }
    }
}

/// A live reference to a [`ReferenceCountedResource`] value.
///
/// Prefer [`Retained::release`]; dropping the guard releases too, but the
/// close then runs on a spawned task.
pub struct Retained<T: AsyncClose> {
    owner: Arc<ReferenceCountedResource<T>>,
    value: Arc<T>,
    released: bool,
}

impl<T: AsyncClose> Retained<T> {
    pub async fn release(mut self) {
        self.released = true;
        if let Some(last) = self.owner.release_one() {
            last.close().await;
        }
    }
}

impl<T: AsyncClose> Deref for Retained<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: AsyncClose> Drop for Retained<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let Some(last) = self.owner.release_one() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { last.close().await });
            }
            Err(_) => {
                tracing::warn!(
                    target: "ddmux.jdwp",
                    "last reference released outside a tokio runtime; resource not closed"
                );
            }
        }
    }
}
