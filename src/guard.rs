use std::{
    cell::Cell,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::record::ThreadKey;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // How many tracking frames are active on this thread.
    //
    // Any acquire or release observed while this is non-zero came from the tracker's own bookkeeping (or from a
    // thread that opted out) and is passed through untracked. Both slots are const-initialized and have no
    // destructor, so they stay readable while other thread-locals are being torn down.
    static TRACKING_DEPTH: Cell<usize> = const { Cell::new(0) };

    static THREAD_KEY: Cell<u64> = const { Cell::new(0) };
}

/// Marker that makes a type `!Send` and `!Sync`.
#[derive(Default)]
pub(crate) struct PhantomNotSend(PhantomData<*mut ()>);

/// Guard marking the current thread as inside the tracker.
///
/// While a guard is alive, every acquire and release made by the current thread bypasses the tracker. This is how
/// the tracker's own allocations (growing an accumulator, capturing a stack, emitting a log line) avoid recursing
/// back into it.
///
/// ## Moving across threads
///
/// The guard tracks per-thread state and is therefore `!Send`.
///
/// ```compile_fail
/// use leak_tracker::ReentrancyGuard;
/// trait AssertSend: Send {}
///
/// impl AssertSend for ReentrancyGuard {}
/// ```
pub struct ReentrancyGuard {
    _ns: PhantomNotSend,
}

impl ReentrancyGuard {
    /// Enters the tracker on this thread, unless it is already inside it.
    ///
    /// Returns `None` when the thread is already inside the tracker, in which case the caller must skip tracking.
    #[inline]
    pub fn enter() -> Option<ReentrancyGuard> {
        TRACKING_DEPTH
            .try_with(|depth| {
                if depth.get() == 0 {
                    depth.set(1);
                    true
                } else {
                    false
                }
            })
            .ok()
            .filter(|entered| *entered)
            .map(|_| ReentrancyGuard {
                _ns: PhantomNotSend::default(),
            })
    }

    /// Marks this thread as inside the tracker regardless of its current state.
    ///
    /// Used by threads that must never be tracked, such as the merge worker or a thread producing a dump.
    pub fn hold() -> ReentrancyGuard {
        let _ = TRACKING_DEPTH.try_with(|depth| depth.set(depth.get() + 1));
        ReentrancyGuard {
            _ns: PhantomNotSend::default(),
        }
    }

    /// Whether the current thread is inside the tracker.
    pub fn is_held() -> bool {
        TRACKING_DEPTH
            .try_with(|depth| depth.get() > 0)
            .unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = TRACKING_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Runs `f` with tracking suppressed on the current thread.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ReentrancyGuard::hold();
    f()
}

/// Identifier of the calling thread, assigned on first use.
pub(crate) fn current_thread_key() -> ThreadKey {
    let key = THREAD_KEY
        .try_with(|slot| {
            let mut key = slot.get();
            if key == 0 {
                key = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
                slot.set(key);
            }
            key
        })
        .unwrap_or(0);
    ThreadKey(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn nested_enter_is_refused() {
        let outer = ReentrancyGuard::enter();
        assert!(outer.is_some());
        assert!(ReentrancyGuard::is_held());
        assert!(ReentrancyGuard::enter().is_none());

        drop(outer);
        assert!(!ReentrancyGuard::is_held());
        assert!(ReentrancyGuard::enter().is_some());
    }

    #[test]
    fn hold_stacks_and_unwinds() {
        let first = ReentrancyGuard::hold();
        let second = ReentrancyGuard::hold();
        assert!(ReentrancyGuard::enter().is_none());

        drop(second);
        assert!(ReentrancyGuard::is_held());
        drop(first);
        assert!(!ReentrancyGuard::is_held());
    }

    #[test]
    fn untracked_suppresses_only_inside_closure() {
        let inside = untracked(ReentrancyGuard::is_held);
        assert!(inside);
        assert!(!ReentrancyGuard::is_held());
    }

    #[test]
    fn thread_keys_are_stable_and_distinct() {
        let here = current_thread_key();
        assert_eq!(here, current_thread_key());

        let there = thread::spawn(current_thread_key)
            .join()
            .expect("thread panicked");
        assert_ne!(here, there);
    }
}
