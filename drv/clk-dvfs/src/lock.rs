// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A depth-counted lock keyed by execution context.
//!
//! A rate change on a DVFS clock holds the vote lock while it asks for a
//! voltage change, and the voltage change takes the same lock again. With an
//! ordinary mutex that is a self-deadlock. Here, a context that already owns
//! the lock just bumps a depth counter; the lock is released when the
//! outermost guard drops.
//!
//! Because two guards for the same data can be alive at once on one call
//! stack, guards only hand out `&T`. Anything that must change under the
//! lock lives in a `Cell`.

use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

const UNOWNED: usize = 0;

pub struct ReentrantLock<T> {
    owner: AtomicUsize,
    depth: AtomicUsize,
    data: T,
}

// Only the owning context can reach `data`, and it only ever gets `&T`.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            depth: AtomicUsize::new(0),
            data,
        }
    }

    /// Acquires the lock for context `ctx`, spinning while another context
    /// holds it.
    pub fn lock(&self, ctx: NonZeroUsize) -> ReentrantGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock(ctx) {
                return guard;
            }
            core::hint::spin_loop();
        }
    }

    pub fn try_lock(&self, ctx: NonZeroUsize) -> Option<ReentrantGuard<'_, T>> {
        let id = ctx.get();
        // Only `ctx` itself can have stored `id`, so a relaxed read is enough
        // to tell whether we are re-entering.
        if self.owner.load(Ordering::Relaxed) != id {
            self.owner
                .compare_exchange(UNOWNED, id, Ordering::Acquire, Ordering::Relaxed)
                .ok()?;
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        Some(ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Nesting depth held by the current owner; 0 when free.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Exclusive access without locking, for setup while the lock cannot be
    /// shared yet.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    // Ownership is per context; a guard must be dropped where it was taken.
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ctx(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn same_context_reenters() {
        let lock = ReentrantLock::new(Cell::new(0u32));
        let outer = lock.lock(ctx(1));
        outer.set(1);
        {
            let inner = lock.lock(ctx(1));
            assert_eq!(lock.depth(), 2);
            inner.set(inner.get() + 1);
        }
        assert_eq!(lock.depth(), 1);
        assert_eq!(outer.get(), 2);
    }

    #[test]
    fn other_context_is_excluded_until_outermost_release() {
        let lock = ReentrantLock::new(());
        let a = lock.lock(ctx(1));
        let b = lock.lock(ctx(1));
        assert!(lock.try_lock(ctx(2)).is_none());
        drop(b);
        assert!(lock.try_lock(ctx(2)).is_none());
        drop(a);
        assert_eq!(lock.depth(), 0);
        assert!(lock.try_lock(ctx(2)).is_some());
    }

    #[test]
    fn contended_across_threads() {
        let lock = std::sync::Arc::new(ReentrantLock::new(
            std::sync::atomic::AtomicU32::new(0),
        ));
        let handles: Vec<_> = (1..=4)
            .map(|n| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let g = lock.lock(ctx(n));
                        let _nested = lock.lock(ctx(n));
                        let v = g.load(Ordering::Relaxed);
                        g.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.lock(ctx(9)).load(Ordering::Relaxed), 4000);
    }
}
