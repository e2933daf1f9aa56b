use core::fmt::{self, Debug, Display, Formatter};

use crate::inner::raw as inner;
use crate::relax::Relax;

#[cfg(all(not(loom), test))]
use crate::test::{CombineThen, LockData, LockNew, LockThen};

/// A mutual exclusion primitive that executes closures on behalf of waiting
/// threads, useful for protecting shared data under high contention.
///
/// Rather than having every thread acquire the lock, mutate, and release,
/// this lock batches pending operations: one thread, the combiner, drains
/// the waiting queue and runs queued closures back to back while the data is
/// hot in its cache. Waiting threads spin on their own completion word until
/// their closure has run (or until they are drafted to combine themselves).
///
/// The combiner can be created via a [`new`] constructor. Each combiner has
/// a type parameter which represents the data that it is protecting. The
/// data can be accessed by submitting closures through [`combine`] and
/// [`submit`], or through the RAII guard returned by the [`lock`] method.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use std::sync::mpsc::channel;
///
/// use fclock::raw;
/// use fclock::relax::Spin;
///
/// type Combiner<T> = raw::Combiner<T, Spin>;
///
/// const N: usize = 10;
///
/// // Spawn a few threads to increment a shared variable (non-atomically),
/// // and let the main thread know once all increments are done.
/// //
/// // Here we're using an Arc to share memory among threads, and the data
/// // inside the Arc is protected with a flat-combining lock.
/// let data = Arc::new(Combiner::new(0));
///
/// let (tx, rx) = channel();
/// for _ in 0..N {
///     let (data, tx) = (data.clone(), tx.clone());
///     thread::spawn(move || {
///         // The operation runs exactly once, on whichever thread currently
///         // combines; the increment is not atomic, yet it never races.
///         let value = data.combine(|value| {
///             *value += 1;
///             *value
///         });
///         if value == N {
///             tx.send(()).unwrap();
///         }
///     });
/// }
///
/// rx.recv().unwrap();
/// ```
/// [`new`]: Combiner::new
/// [`combine`]: Combiner::combine
/// [`submit`]: Combiner::submit
/// [`lock`]: Combiner::lock
pub struct Combiner<T: ?Sized, R> {
    inner: inner::Combiner<T, R>,
}

// Same unsafe impls as `crate::inner::raw::Combiner`.
// SAFETY: The inner combiner type upholds these.
unsafe impl<T: ?Sized + Send, R> Send for Combiner<T, R> {}
// SAFETY: See above.
unsafe impl<T: ?Sized + Send, R> Sync for Combiner<T, R> {}

impl<T, R> Combiner<T, R> {
    /// Creates a new combiner in an idle state ready for use.
    ///
    /// # Examples
    ///
    /// ```
    /// use fclock::raw;
    /// use fclock::relax::Spin;
    ///
    /// type Combiner<T> = raw::Combiner<T, Spin>;
    ///
    /// let combiner = Combiner::new(0);
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        Self { inner: inner::Combiner::new(value) }
    }
}

impl<T: ?Sized, R: Relax> Combiner<T, R> {
    /// Submits `f` to run against the protected data, blocking the current
    /// thread until it has executed, and returns its result.
    ///
    /// The closure runs exactly once, but not necessarily on this thread:
    /// whichever thread currently combines executes it on this thread's
    /// behalf. Because of that, the closure and its return value must both
    /// be [`Send`].
    ///
    /// The closure must not call back into the same combiner (through
    /// [`combine`], [`submit`], [`lock`] or waiting on a [`Submission`]):
    /// the executing thread already holds the lock, so any such attempt
    /// deadlocks. It should also not block on outside events, since every
    /// other submitter is stalled behind it.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use fclock::raw;
    /// use fclock::relax::Spin;
    ///
    /// type Combiner<T> = raw::Combiner<T, Spin>;
    ///
    /// let combiner = Arc::new(Combiner::new(0));
    /// let c_combiner = Arc::clone(&combiner);
    ///
    /// thread::spawn(move || {
    ///     c_combiner.combine(|value| *value = 10);
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(combiner.combine(|value| *value), 10);
    /// ```
    /// [`combine`]: Combiner::combine
    /// [`submit`]: Combiner::submit
    /// [`lock`]: Combiner::lock
    #[inline]
    pub fn combine<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        self.inner.combine(f)
    }

    /// Submits `f` to run against the protected data without waiting for it,
    /// and returns a [`Submission`] handle tracking its completion.
    ///
    /// The calling thread does not block: it may keep working and consume
    /// the handle later through [`complete`], or poll it with
    /// [`is_complete`]. The same restrictions on the closure apply as for
    /// [`combine`].
    ///
    /// Note that an asynchronous submission does not wake any sleeping
    /// thread: it executes once some thread combines. When this thread is
    /// elected combiner the round runs before `submit` returns, so the
    /// handle may already be complete.
    ///
    /// # Examples
    ///
    /// ```
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Combiner::new(0);
    ///
    /// let submission = combiner.submit(|value| {
    ///     *value += 1;
    ///     *value
    /// });
    /// assert_eq!(submission.complete(), 1);
    /// ```
    /// [`complete`]: Submission::complete
    /// [`is_complete`]: Submission::is_complete
    /// [`combine`]: Combiner::combine
    #[inline]
    pub fn submit<F, Ret>(&self, f: F) -> Submission<'_, T, R, F, Ret>
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        self.inner.submit(f).into()
    }

    /// Acquires this lock, blocking the current thread until it is able to
    /// do so.
    ///
    /// Unlike [`combine`], no operation is submitted: the calling thread
    /// itself gains exclusive access to the data through the returned RAII
    /// guard, for as long as the guard is in scope. Pending operations
    /// submitted before this acquisition are combined first; operations
    /// submitted after it wait until the guard is dropped.
    ///
    /// This function will block if the lock is unavailable.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Arc::new(Combiner::new(0));
    /// let c_combiner = Arc::clone(&combiner);
    ///
    /// thread::spawn(move || {
    ///     *c_combiner.lock() = 10;
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(*combiner.lock(), 10);
    /// ```
    /// [`combine`]: Combiner::combine
    #[inline]
    pub fn lock(&self) -> CombinerGuard<'_, T, R> {
        self.inner.lock().into()
    }

    /// Acquires this lock and then runs the closure against its guard.
    ///
    /// This function will block the local thread until it is available to
    /// acquire the lock. Upon acquiring the lock, the user provided closure
    /// will be executed against the guard. Once the guard goes out of scope,
    /// it will unlock the lock.
    ///
    /// Unlike a [`combine`] closure, this closure runs on the calling thread
    /// and so carries no [`Send`] requirement.
    ///
    /// This function will block if the lock is unavailable.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Arc::new(Combiner::new(0));
    /// let c_combiner = Arc::clone(&combiner);
    ///
    /// thread::spawn(move || {
    ///     c_combiner.lock_then(|mut guard| *guard = 10);
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(combiner.lock_then(|guard| *guard), 10);
    /// ```
    ///
    /// Compile fail: borrows of the guard or its data cannot escape the
    /// given closure:
    ///
    /// ```compile_fail,E0515
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Combiner::new(1);
    /// let data = combiner.lock_then(|guard| &*guard);
    /// ```
    /// [`combine`]: Combiner::combine
    #[inline]
    pub fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(CombinerGuard<'_, T, R>) -> Ret,
    {
        f(self.lock())
    }
}

impl<T: ?Sized, R> Combiner<T, R> {
    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Combiner` mutably, no actual locking
    /// needs to take place - the mutable borrow statically guarantees no
    /// submissions exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use fclock::raw;
    /// use fclock::relax::Spin;
    ///
    /// type Combiner<T> = raw::Combiner<T, Spin>;
    ///
    /// let mut combiner = Combiner::new(0);
    /// *combiner.get_mut() = 10;
    ///
    /// assert_eq!(combiner.combine(|value| *value), 10);
    /// ```
    #[cfg(not(all(loom, test)))]
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Whether the waiting queue and the takeover slot are both empty.
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }
}

impl<T: Default, R> Default for Combiner<T, R> {
    /// Creates a `Combiner<T, R>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T, R> From<T> for Combiner<T, R> {
    /// Creates a `Combiner<T, R>` from a instance of `T`.
    #[inline]
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug, R: Relax> Debug for Combiner<T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(all(not(loom), test))]
impl<T: ?Sized, R> LockNew for Combiner<T, R> {
    type Target = T;

    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized,
    {
        Self::new(value)
    }
}

#[cfg(all(not(loom), test))]
impl<T: ?Sized, R: Relax> LockThen for Combiner<T, R> {
    type Guard<'a>
        = CombinerGuard<'a, Self::Target, R>
    where
        Self: 'a,
        Self::Target: 'a;

    fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(CombinerGuard<'_, T, R>) -> Ret,
    {
        self.lock_then(f)
    }
}

#[cfg(all(not(loom), test))]
impl<T: ?Sized, R: Relax> CombineThen for Combiner<T, R> {
    fn combine_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Self::Target) -> Ret + Send,
        Ret: Send,
    {
        self.combine(f)
    }
}

#[cfg(all(not(loom), test))]
impl<T: ?Sized, R> LockData for Combiner<T, R> {
    fn get_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

/// A handle to an operation submitted through [`submit`], tracking its
/// completion.
///
/// The handle can be polled without blocking through [`is_complete`], and
/// consumed through [`complete`], which blocks until the operation has run
/// and returns its value. Dropping the handle without consuming it also
/// blocks until the operation has run, then discards the value: the
/// operation is guaranteed to execute exactly once either way.
///
/// A thread blocked on its submission may be drafted to combine: if the
/// current combiner hands the backlog over (or parks it) while this thread
/// waits, this thread runs the pending operations itself, its own included.
///
/// [`submit`]: Combiner::submit
/// [`is_complete`]: Submission::is_complete
/// [`complete`]: Submission::complete
#[must_use = "the operation only runs once some thread combines; completing or dropping the handle guarantees that"]
pub struct Submission<'a, T: ?Sized, R: Relax, F, Ret> {
    inner: inner::Submission<'a, T, R, F, Ret>,
}

impl<'a, T: ?Sized, R: Relax, F, Ret> Submission<'a, T, R, F, Ret> {
    /// Whether the operation has already executed.
    ///
    /// This is a non-blocking check; it never takes on combining duty. A
    /// `true` result is definitive and [`complete`] will return without
    /// blocking.
    ///
    /// # Examples
    ///
    /// ```
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Combiner::new(0);
    ///
    /// // This thread found the combiner idle, so it ran its own submission
    /// // before `submit` returned.
    /// let submission = combiner.submit(|value| *value += 1);
    /// assert!(submission.is_complete());
    /// submission.complete();
    /// ```
    /// [`complete`]: Submission::complete
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    /// Waits until the operation has executed and returns its result.
    ///
    /// # Examples
    ///
    /// ```
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Combiner::new(1);
    ///
    /// let submission = combiner.submit(|value| *value * 2);
    /// assert_eq!(submission.complete(), 2);
    /// ```
    #[inline]
    pub fn complete(self) -> Ret {
        self.inner.complete()
    }
}

#[doc(hidden)]
impl<'a, T: ?Sized, R: Relax, F, Ret> From<inner::Submission<'a, T, R, F, Ret>>
    for Submission<'a, T, R, F, Ret>
{
    #[inline(always)]
    fn from(inner: inner::Submission<'a, T, R, F, Ret>) -> Self {
        Self { inner }
    }
}

impl<T: ?Sized, R: Relax, F, Ret> Debug for Submission<'_, T, R, F, Ret> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// An RAII implementation of a "scoped lock" of a combiner. When this
/// structure is dropped (falls out of scope), the lock will be unlocked and
/// the backlog of operations submitted during the critical section will be
/// handed off to a waiting thread.
///
/// The data protected by the combiner can be access through this guard via
/// its [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is returned by the [`lock`] method on [`Combiner`]. It is
/// also given as closure argument by the [`lock_then`] method.
///
/// [`Deref`]: core::ops::Deref
/// [`DerefMut`]: core::ops::DerefMut
/// [`lock`]: Combiner::lock
/// [`lock_then`]: Combiner::lock_then
#[must_use = "if unused the Combiner will immediately unlock"]
pub struct CombinerGuard<'a, T: ?Sized, R: Relax> {
    inner: inner::Guard<'a, T, R>,
}

// Same unsafe impls as `crate::inner::raw::Guard`.
// SAFETY: The inner guard type upholds these.
unsafe impl<T: ?Sized + Sync, R: Relax> Sync for CombinerGuard<'_, T, R> {}

#[doc(hidden)]
impl<'a, T: ?Sized, R: Relax> From<inner::Guard<'a, T, R>> for CombinerGuard<'a, T, R> {
    #[inline(always)]
    fn from(inner: inner::Guard<'a, T, R>) -> Self {
        Self { inner }
    }
}

impl<T: ?Sized + Debug, R: Relax> Debug for CombinerGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T: ?Sized + Display, R: Relax> Display for CombinerGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, R: Relax> core::ops::Deref for CombinerGuard<'_, T, R> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, R: Relax> core::ops::DerefMut for CombinerGuard<'_, T, R> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

// SAFETY: A guard instance holds the lock locked, with exclusive access to
// the underlying data.
#[cfg(all(loom, test))]
#[cfg(not(tarpaulin_include))]
unsafe impl<T: ?Sized, R: Relax> crate::loom::Guard for CombinerGuard<'_, T, R> {
    type Target = T;

    fn get(&self) -> &loom::cell::UnsafeCell<Self::Target> {
        self.inner.get()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::vec::Vec;

    use crate::raw::yields::Combiner;
    use crate::test::tests;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<Combiner<_>>();
    }

    #[test]
    fn lots_and_lots_combine() {
        tests::lots_and_lots_combine::<Combiner<_>>();
    }

    #[test]
    fn combine_excludes_concurrent_operations() {
        tests::combine_excludes_concurrent_operations::<Combiner<_>>();
    }

    #[test]
    fn combine_observes_serialized_history() {
        tests::combine_observes_serialized_history::<Combiner<_>>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<Combiner<_>>();
    }

    #[test]
    fn test_guard_debug_display() {
        tests::test_guard_debug_display::<Combiner<_>>();
    }

    #[test]
    fn test_combiner_debug() {
        tests::test_combiner_debug::<Combiner<_>>();
    }

    #[test]
    fn test_combiner_from() {
        tests::test_combiner_from::<Combiner<_>>();
    }

    #[test]
    fn test_combiner_default() {
        tests::test_combiner_default::<Combiner<_>>();
    }

    #[test]
    fn test_get_mut() {
        tests::test_get_mut::<Combiner<_>>();
    }

    #[test]
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<Combiner<_>, Combiner<_>>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<Combiner<_>>();
    }

    #[test]
    fn test_combine_arc_access_in_unwind() {
        tests::test_combine_arc_access_in_unwind::<Combiner<_>>();
    }

    #[test]
    fn test_lock_unsized() {
        tests::test_lock_unsized::<Combiner<_>>();
    }

    #[test]
    fn elected_submission_completes_synchronously() {
        let combiner = Combiner::new(0);
        // The queue was idle, so this thread combined its own submission
        // before `submit` returned.
        let submission = combiner.submit(|value| {
            *value += 1;
            *value
        });
        assert!(submission.is_complete());
        assert_eq!(submission.complete(), 1);
        assert!(combiner.is_idle());
    }

    #[test]
    fn submissions_queued_behind_guard_drain_after_unlock() {
        const SUBMITTERS: usize = 15;

        let combiner = Arc::new(Combiner::new(0));
        let barrier = Arc::new(Barrier::new(SUBMITTERS + 1));
        let guard = combiner.lock();

        let handles: Vec<_> = (0..SUBMITTERS)
            .map(|_| {
                let combiner = Arc::clone(&combiner);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let submission = combiner.submit(|value| {
                        let prev = *value;
                        *value += 1;
                        prev
                    });
                    // Not complete: the lock is held and nothing combines.
                    barrier.wait();
                    submission.complete()
                })
            })
            .collect();

        // All submissions are enqueued (and still pending) at this point.
        barrier.wait();
        drop(guard);

        let mut prevs: Vec<usize> =
            handles.into_iter().map(|handle| handle.join().unwrap()).collect();
        prevs.sort_unstable();
        let expected: Vec<usize> = (0..SUBMITTERS).collect();
        assert_eq!(prevs, expected, "each increment must observe a unique value");

        assert_eq!(combiner.combine(|value| *value), SUBMITTERS);
        assert!(combiner.is_idle());
    }

    #[test]
    fn dropped_submission_still_runs() {
        let combiner = Arc::new(Combiner::new(0));
        let guard = combiner.lock();

        let (tx, rx) = channel();
        let c_combiner = Arc::clone(&combiner);
        let handle = thread::spawn(move || {
            let submission = c_combiner.submit(|value| *value += 1);
            tx.send(()).unwrap();
            // Blocks until the operation has run, then discards the value.
            drop(submission);
        });

        rx.recv().unwrap();
        drop(guard);
        handle.join().unwrap();

        assert_eq!(combiner.combine(|value| *value), 1);
        assert!(combiner.is_idle());
    }

    #[test]
    fn mixed_locks_and_combines() {
        const THREADS: usize = 4;
        const ITERS: usize = 1000;

        let combiner = Arc::new(Combiner::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|run| {
                let combiner = Arc::clone(&combiner);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        if run % 2 == 0 {
                            combiner.combine(|value| *value += 1);
                        } else {
                            *combiner.lock() += 1;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(combiner.combine(|value| *value), THREADS * ITERS);
        assert!(combiner.is_idle());
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn combine_join() {
        models::combine_join();
    }

    #[test]
    fn lock_join() {
        models::lock_join();
    }

    #[test]
    fn mixed_join() {
        models::mixed_join();
    }

    #[test]
    fn submit_join() {
        models::submit_join();
    }
}
