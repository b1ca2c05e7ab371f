use std::{
    collections::VecDeque,
    future::Future,
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("lock acquisition was cancelled")]
pub struct LockCancelled;

pub struct ExecutionLock<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ExecutionLock<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    // `Some` while nobody holds the lock.
    resource: Option<T>,
    waiters: WaitQueue<oneshot::Sender<T>>,
}

impl<T> ExecutionLock<T> {
    pub fn new(resource: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    resource: Some(resource),
                    waiters: WaitQueue::new(),
                }),
            }),
        }
    }

    /// Takes a place in the queue right away; the returned future resolves
    /// once every earlier acquirer has released the lock.
    pub fn acquire(&self) -> Acquire<T> {
        let step = self.inner.enqueue();
        Acquire {
            inner: self.inner.clone(),
            step,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state().resource.is_none()
    }

    /// Number of queued acquirers, including ones that gave up but have not
    /// been skipped yet.
    pub fn queued(&self) -> usize {
        self.inner.state().waiters.size()
    }
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self) -> Step<T> {
        let mut state = self.state();
        match state.resource.take() {
            Some(resource) => Step::Granted(resource),
            None => {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push(sender);
                Step::Queued(receiver)
            }
        }
    }

    fn release(&self, mut resource: T) {
        let mut state = self.state();
        while let Some(waiter) = state.waiters.pop() {
            match waiter.send(resource) {
                Ok(()) => return,
                // The waiter is gone, try the next one.
                Err(returned) => resource = returned,
            }
        }
        state.resource = Some(resource);
    }
}

enum Step<T> {
    Granted(T),
    Queued(oneshot::Receiver<T>),
    Finished,
}

/// Future returned by [`ExecutionLock::acquire`].
///
/// Dropping it gives up the place in the queue. If the lock was already
/// handed over, it is passed on to the next waiter.
pub struct Acquire<T> {
    inner: Arc<Inner<T>>,
    step: Step<T>,
}

// The resource is never pinned, only moved between owners.
impl<T> Unpin for Acquire<T> {}

impl<T> Acquire<T> {
    pub async fn cancellable(
        self,
        cancel: &CancellationToken,
    ) -> Result<ExecutionGuard<T>, LockCancelled> {
        tokio::select! {
            biased;

            guard = self => Ok(guard),
            _ = cancel.cancelled() => Err(LockCancelled),
        }
    }

    fn guard(&self, resource: T) -> ExecutionGuard<T> {
        ExecutionGuard {
            resource: ManuallyDrop::new(resource),
            inner: self.inner.clone(),
        }
    }
}

impl<T> Future for Acquire<T> {
    type Output = ExecutionGuard<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match mem::replace(&mut this.step, Step::Finished) {
                Step::Granted(resource) => return Poll::Ready(this.guard(resource)),
                Step::Queued(mut receiver) => match Pin::new(&mut receiver).poll(cx) {
                    Poll::Ready(Ok(resource)) => return Poll::Ready(this.guard(resource)),
                    // Our sender vanished without a hand-off; queue up again.
                    Poll::Ready(Err(_)) => this.step = this.inner.enqueue(),
                    Poll::Pending => {
                        this.step = Step::Queued(receiver);
                        return Poll::Pending;
                    }
                },
                Step::Finished => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for Acquire<T> {
    fn drop(&mut self) {
        match mem::replace(&mut self.step, Step::Finished) {
            Step::Granted(resource) => self.inner.release(resource),
            Step::Queued(mut receiver) => {
                receiver.close();
                if let Ok(resource) = receiver.try_recv() {
                    self.inner.release(resource);
                }
            }
            Step::Finished => {}
        }
    }
}

/// Exclusive access to the guarded resource. Dropping it releases the lock.
pub struct ExecutionGuard<T> {
    resource: ManuallyDrop<T>,
    inner: Arc<Inner<T>>,
}

impl<T> ExecutionGuard<T> {
    pub fn release(self) {}
}

impl<T> Deref for ExecutionGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> DerefMut for ExecutionGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.resource
    }
}

impl<T> Drop for ExecutionGuard<T> {
    fn drop(&mut self) {
        // SAFETY: `resource` is taken exactly once, here, and never read again.
        let resource = unsafe { ManuallyDrop::take(&mut self.resource) };
        self.inner.release(resource);
    }
}

struct WaitQueue<W> {
    queue: VecDeque<W>,
}

impl<W> WaitQueue<W> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    fn push(&mut self, waiter: W) {
        self.queue.push_back(waiter);
    }

    fn pop(&mut self) -> Option<W> {
        self.queue.pop_front()
    }
}
