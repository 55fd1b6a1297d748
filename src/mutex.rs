//! A FIFO-fair, reentrant async mutex.
//!
//! The same owner may lock it any number of times; each nested `lock()`
//! returns immediately and must be matched by an `unlock()`. A distinct
//! owner that contends for the lock parks on a oneshot channel and is woken,
//! in arrival order, by whichever unlock call drives the hold count to zero.
//!
//! Because the same owner can hold several outstanding guards at once, the
//! guard cannot safely hand out `&mut T` — two nested guards would alias a
//! mutable reference. Guards therefore deref to `&T` only; protected state
//! that needs mutation wraps its fields in `RefCell` (see
//! [`crate::queue::TaskQueue`], [`crate::pool::WorkerPool`]), the same way a
//! `parking_lot::ReentrantMutex` pushes interior mutability onto its payload.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Mutex as StdMutex;
use tokio::sync::oneshot;

/// Identifies the logical holder of a [`ReentrantMutex`].
///
/// Deliberately opaque and caller-supplied rather than derived from
/// `tokio::task::id()`: nested calls within the same logical operation need
/// to share an owner even when they cross `tokio::spawn` boundaries, and
/// tests need to simulate contention deterministically without spinning up
/// real tasks.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn from_raw(id: u64) -> Self {
        OwnerId(id)
    }
}

struct Waiter<O> {
    owner: O,
    wake: oneshot::Sender<()>,
}

struct RawState<O> {
    holder: Option<(O, u32)>,
    waiters: VecDeque<Waiter<O>>,
}

/// A reentrant, FIFO-fair async mutex guarding `T`.
pub struct ReentrantMutex<T> {
    state: StdMutex<RawState<OwnerId>>,
    data: T,
}

/// Proof that `owner` currently holds the lock. Does not release on drop;
/// callers must balance `lock()` with an explicit [`ReentrantMutex::unlock`],
/// matching the lock/unlock contract of the worker pool and transaction
/// manager that sit on top of it.
pub struct ReentrantGuard<'a, T> {
    mutex: &'a ReentrantMutex<T>,
}

impl<T> ReentrantMutex<T> {
    pub fn new(data: T) -> Self {
        ReentrantMutex {
            state: StdMutex::new(RawState { holder: None, waiters: VecDeque::new() }),
            data,
        }
    }

    /// Acquires the lock for `owner`. Resolves immediately if `owner`
    /// already holds it (incrementing the reentrancy count) or if the lock
    /// is free; otherwise parks until handed off.
    pub async fn lock(&self, owner: OwnerId) -> ReentrantGuard<'_, T> {
        let wait = {
            let mut state = self.state.lock().expect("mutex state poisoned");
            match state.holder {
                None => {
                    state.holder = Some((owner, 1));
                    None
                }
                Some((h, c)) if h == owner => {
                    state.holder = Some((h, c + 1));
                    None
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter { owner, wake: tx });
                    Some(rx)
                }
            }
        };
        if let Some(rx) = wait {
            // The releaser sets `holder` to us before sending; by the time
            // this resolves we already own the lock, granted with no
            // further bookkeeping on our end.
            let _ = rx.await;
        }
        ReentrantGuard { mutex: self }
    }

    /// Releases one level of `owner`'s hold. Errors with
    /// [`crate::error::OctopusError::NotOwner`] if `owner` does not
    /// currently hold the lock.
    pub fn unlock(&self, owner: OwnerId) -> Result<(), crate::error::OctopusError> {
        let mut state = self.state.lock().expect("mutex state poisoned");
        match state.holder {
            Some((h, c)) if h == owner => {
                if c > 1 {
                    state.holder = Some((h, c - 1));
                    return Ok(());
                }
                loop {
                    match state.waiters.pop_front() {
                        Some(Waiter { owner: next, wake }) => {
                            state.holder = Some((next, 1));
                            if wake.send(()).is_ok() {
                                break;
                            }
                            // The waiter gave up (its future was dropped);
                            // try handing off to whoever is next in line.
                        }
                        None => {
                            state.holder = None;
                            break;
                        }
                    }
                }
                Ok(())
            }
            _ => Err(crate::error::OctopusError::NotOwner),
        }
    }

    /// The owner currently holding the lock, if any.
    pub fn current_holder(&self) -> Option<OwnerId> {
        self.state.lock().expect("mutex state poisoned").holder.map(|(o, _)| o)
    }
}

impl<'a, T> Deref for ReentrantGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.mutex.data
    }
}
