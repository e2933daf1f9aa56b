use core::ops::{Deref, DerefMut};

use crate::cfg::sync::Arc;

/// A trait for convertion from `&Self` to a type that implements the [`Deref`]
/// trait.
pub trait AsDeref {
    /// The type of the value that `Self::Deref` dereferences to.
    type Target: ?Sized;

    /// The type that implements [`Deref`] trait.
    type Deref<'a>: Deref<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Returns a instance of the type that implements the [`Deref`] trait.
    fn as_deref(&self) -> Self::Deref<'_>;
}

/// A trait for convertion from `&mut Self` to a type that implements the
/// [`DerefMut`] trait.
pub trait AsDerefMut: AsDeref {
    /// The type that implements [`DerefMut`] trait.
    type DerefMut<'a>: DerefMut<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Returns a instance of the type that implements the [`DerefMut`] trait.
    fn as_deref_mut(&mut self) -> Self::DerefMut<'_>;
}

/// A trait for lock types that can hold user defined values.
pub trait LockNew {
    /// The type of the value this lock holds.
    type Target: ?Sized;

    /// Creates a new lock in an idle state ready for use.
    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized;
}

/// A trait for lock types that can run closures against a guard instance.
pub trait LockThen: LockNew {
    /// A `guard` has access to a type that can can give shared and exclusive
    /// references to the protected data.
    type Guard<'a>: AsDerefMut<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Acquires the lock and then runs the closure against its guard.
    fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(Self::Guard<'_>) -> Ret;
}

/// A trait for lock types that can combine closures over the protected data.
pub trait CombineThen: LockNew {
    /// Submits the closure and blocks until some thread has combined it.
    fn combine_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Self::Target) -> Ret + Send,
        Ret: Send;
}

/// A trait for lock types that can return either the underlying value (by
// consuming the lock) or a exclusive reference to it.
#[cfg(not(loom))]
pub trait LockData: LockNew {
    /// Returns a mutable reference to the underlying data.
    fn get_mut(&mut self) -> &mut Self::Target;
}

// Trivial implementation of `AsDeref` for `T` where `T: Deref`.
impl<T: Deref> AsDeref for T {
    type Target = <Self as Deref>::Target;

    type Deref<'a>
        = &'a <Self as Deref>::Target
    where
        Self: 'a,
        Self::Target: 'a;

    fn as_deref(&self) -> Self::Deref<'_> {
        self
    }
}

// Trivial implementation of `AsDerefMut` for `T` where `T: DerefMut`.
impl<T: DerefMut> AsDerefMut for T {
    type DerefMut<'a>
        = &'a mut <Self as Deref>::Target
    where
        Self: 'a,
        Self::Target: 'a;

    fn as_deref_mut(&mut self) -> Self::DerefMut<'_> {
        self
    }
}

/// An arbitrary unsigned integer type.
pub type Int = u32;

/// Get a copy of the lock protected data.
pub fn get<L>(lock: &Arc<L>) -> L::Target
where
    L: LockThen<Target: Sized + Copy>,
{
    lock.lock_then(|data| *data.as_deref())
}

/// Increments a shared integer by holding the lock.
pub fn inc<L>(lock: &Arc<L>)
where
    L: LockThen<Target = Int>,
{
    lock.lock_then(inc_inner::<L>);
}

/// Increments a shared integer by combining the increment.
pub fn inc_combine<L>(lock: &Arc<L>)
where
    L: CombineThen<Target = Int>,
{
    lock.combine_then(|data| *data += 1);
}

/// Increments a shared integer through a guard instance.
fn inc_inner<L>(mut guard: L::Guard<'_>)
where
    L: LockThen<Target = Int>,
{
    *guard.as_deref_mut() += 1;
}

#[cfg(all(not(loom), test))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation with minor changes
    // since the API is not compatible with this crate implementation and some
    // new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use std::fmt::{Debug, Display};
    use std::format;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::{get, inc, inc_combine, Int};
    use super::{AsDeref, AsDerefMut, CombineThen, LockData, LockThen};

    #[derive(Eq, PartialEq, Debug)]
    pub struct NonCopy(u32);

    const ITERS: Int = 1000;
    const CONCURRENCY: Int = 3;
    const EXPECTED_VALUE: Int = ITERS * CONCURRENCY * 2;

    fn lots_and_lots<L>(f: fn(&Arc<L>)) -> Int
    where
        L: LockThen<Target = Int> + Send + Sync + 'static,
    {
        let lock = Arc::new(L::new(0));
        let (tx, rx) = channel();
        for _ in 0..CONCURRENCY {
            let lock1 = Arc::clone(&lock);
            let tx2 = tx.clone();
            thread::spawn(move || {
                f(&lock1);
                tx2.send(()).unwrap();
            });
            let lock2 = Arc::clone(&lock);
            let tx2 = tx.clone();
            thread::spawn(move || {
                f(&lock2);
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
        get(&lock)
    }

    pub fn lots_and_lots_lock<L>()
    where
        L: LockThen<Target = Int> + Send + Sync + 'static,
    {
        fn inc_for<L: LockThen<Target = Int>>(lock: &Arc<L>) {
            for _ in 0..ITERS {
                inc(lock);
            }
        }
        let value = lots_and_lots(inc_for::<L>);
        assert_eq!(value, EXPECTED_VALUE);
    }

    pub fn lots_and_lots_combine<L>()
    where
        L: LockThen<Target = Int> + CombineThen<Target = Int> + Send + Sync + 'static,
    {
        fn inc_for<L: CombineThen<Target = Int> + LockThen<Target = Int>>(lock: &Arc<L>) {
            for _ in 0..ITERS {
                inc_combine(lock);
            }
        }
        let value = lots_and_lots(inc_for::<L>);
        assert_eq!(value, EXPECTED_VALUE);
    }

    /// Every combined operation must run serialized with all others: no two
    /// closures may ever execute concurrently, regardless of which thread
    /// was drafted to run them.
    pub fn combine_excludes_concurrent_operations<L>()
    where
        L: CombineThen<Target = Int> + Send + Sync + 'static,
    {
        const THREADS: Int = 4;
        const RUNS: Int = 10_000;

        let lock = Arc::new(L::new(0));
        let exclusive = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let exclusive = Arc::clone(&exclusive);
                thread::spawn(move || {
                    for _ in 0..RUNS {
                        let exclusive = Arc::clone(&exclusive);
                        lock.combine_then(move |data| {
                            assert!(!exclusive.swap(true, Ordering::SeqCst));
                            *data += 1;
                            exclusive.store(false, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let value = lock.combine_then(|data| *data);
        assert_eq!(value, THREADS * RUNS);
    }

    /// Combined operations submitted by one thread must apply in submission
    /// order, and every other submission must observe a consistent history.
    pub fn combine_observes_serialized_history<L>()
    where
        L: CombineThen<Target = Int>,
    {
        let lock = L::new(0);
        for expected in 0..10 {
            let prev = lock.combine_then(|data| {
                let prev = *data;
                *data += 1;
                prev
            });
            assert_eq!(prev, expected);
        }
        assert_eq!(lock.combine_then(|data| *data), 10);
    }

    pub fn smoke<L>()
    where
        L: LockThen<Target = Int>,
    {
        let lock = L::new(1);
        lock.lock_then(|guard| drop(guard));
        lock.lock_then(|guard| drop(guard));
    }

    pub fn test_guard_debug_display<L>()
    where
        L: LockThen<Target = Int>,
        for<'a> <L as LockThen>::Guard<'a>: Debug + Display,
    {
        let value = 42;
        let lock = L::new(value);
        lock.lock_then(|data| {
            assert_eq!(format!("{value:?}"), format!("{data:?}"));
            assert_eq!(format!("{value}"), format!("{data}"));
        });
    }

    pub fn test_combiner_debug<L>()
    where
        L: LockThen<Target = Int> + Debug + Send + Sync + 'static,
    {
        let value = 42;
        let lock = Arc::new(L::new(value));
        let msg = format!("Combiner {{ data: {value:?} }}");
        assert_eq!(msg, format!("{lock:?}"));
    }

    pub fn test_combiner_default<L>()
    where
        L: LockData<Target = Int> + Default,
    {
        let mut lock: L = Default::default();
        assert_eq!(u32::default(), *lock.get_mut());
    }

    pub fn test_combiner_from<L>()
    where
        L: LockData<Target = Int> + From<Int>,
    {
        let value = 42;
        let mut lock = L::from(value);
        assert_eq!(value, *lock.get_mut());
    }

    pub fn test_get_mut<M>()
    where
        M: LockData<Target = NonCopy>,
    {
        let mut lock = M::new(NonCopy(10));
        *lock.get_mut() = NonCopy(20);
        assert_eq!(*lock.get_mut(), NonCopy(20));
    }

    pub fn test_lock_arc_nested<L1, L2>()
    where
        L1: LockThen<Target = Int>,
        L2: LockThen<Target = Arc<L1>> + Send + Sync + 'static,
    {
        // Tests nested locks and access
        // to underlying data.
        let arc = Arc::new(L1::new(1));
        let arc2 = Arc::new(L2::new(arc));
        let (tx, rx) = channel();
        let _t = thread::spawn(move || {
            let val = arc2.lock_then(|arc2| {
                let arc2 = arc2.as_deref();
                get(&arc2)
            });
            assert_eq!(val, 1);
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
    }

    pub fn test_acquire_more_than_one_lock<L>()
    where
        L: LockThen<Target = Int> + Send + Sync + 'static,
    {
        let arc = Arc::new(L::new(1));
        let (tx, rx) = channel();
        for _ in 0..4 {
            let tx2 = tx.clone();
            let c_arc = Arc::clone(&arc);
            let _t = thread::spawn(move || {
                c_arc.lock_then(|_d| {
                    let lock = L::new(1);
                    lock.lock_then(|_g| ());
                });
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..4 {
            rx.recv().unwrap();
        }
    }

    pub fn test_combine_arc_access_in_unwind<L>()
    where
        L: CombineThen<Target = Int> + LockThen<Target = Int> + Send + Sync + 'static,
    {
        let arc = Arc::new(L::new(1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || {
            struct Unwinder<T: CombineThen<Target = Int>> {
                i: Arc<T>,
            }
            impl<T: CombineThen<Target = Int>> Drop for Unwinder<T> {
                fn drop(&mut self) {
                    inc_combine(&self.i);
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let value = get(&arc);
        assert_eq!(value, 2);
    }

    pub fn test_lock_unsized<L>()
    where
        L: LockThen<Target = [Int; 3]>,
    {
        let lock = Arc::new(L::new([1, 2, 3]));
        {
            lock.lock_then(|mut d| {
                d.as_deref_mut()[0] = 4;
                d.as_deref_mut()[2] = 5;
            });
        }
        let comp: &[Int] = &[4, 2, 5];
        let data = get(&lock);
        assert_eq!(comp, data);
    }
}
