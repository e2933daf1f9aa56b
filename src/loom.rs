use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use loom::cell::{ConstPtr, MutPtr, UnsafeCell};

/// A trait for guard types that hold exclusive access to the underlying data
/// behind Loom's [`UnsafeCell`].
///
/// # Safety
///
/// Must guarantee that an instance of the guard holds exclusive access to its
/// underlying data through all its lifetime.
pub unsafe trait Guard: Sized {
    /// The target type after dereferencing [`GuardDeref`] or [`GuardDerefMut`].
    type Target: ?Sized;

    /// Returns a shared reference to the underlying [`UnsafeCell`].
    fn get(&self) -> &UnsafeCell<Self::Target>;

    /// Get a Loom immutable pointer bounded by this guard lifetime.
    fn deref(&self) -> GuardDeref<'_, Self> {
        GuardDeref::new(self)
    }

    /// Get a Loom mutable pointer bounded by this guard lifetime.
    fn deref_mut(&self) -> GuardDerefMut<'_, Self> {
        GuardDerefMut::new(self)
    }
}

/// A Loom immutable pointer borrowed from a guard instance.
pub struct GuardDeref<'a, G: Guard> {
    ptr: ConstPtr<G::Target>,
    marker: PhantomData<(&'a G::Target, &'a G)>,
}

impl<G: Guard> GuardDeref<'_, G> {
    fn new(guard: &G) -> Self {
        let ptr = guard.get().get();
        Self { ptr, marker: PhantomData }
    }
}

impl<G: Guard> Deref for GuardDeref<'_, G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

/// A Loom mutable pointer borrowed from a guard instance.
pub struct GuardDerefMut<'a, G: Guard> {
    ptr: MutPtr<G::Target>,
    marker: PhantomData<(&'a G::Target, &'a G)>,
}

impl<G: Guard> GuardDerefMut<'_, G> {
    fn new(guard: &G) -> Self {
        let ptr = guard.get().get_mut();
        Self { ptr, marker: PhantomData }
    }
}

impl<G: Guard> Deref for GuardDerefMut<'_, G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

impl<G: Guard> DerefMut for GuardDerefMut<'_, G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

pub mod models {
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::loom::Guard;
    use crate::raw::yields::Combiner;

    /// Evaluates that concurrent `combine` calls will serialize all
    /// mutations against the shared data, therefore no data races.
    pub fn combine_join() {
        model(|| {
            let data = Arc::new(Combiner::new(0));
            let handle = {
                let data = Arc::clone(&data);
                thread::spawn(move || data.combine(|value| *value += 1))
            };
            data.combine(|value| *value += 1);
            handle.join().unwrap();
            let value = data.combine(|value| *value);
            assert_eq!(value, 2);
        });
    }

    /// Evaluates that concurrent `lock` calls will serialize all mutations
    /// against the shared data, therefore no data races.
    pub fn lock_join() {
        model(|| {
            let data = Arc::new(Combiner::new(0));
            let handle = {
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let guard = data.lock();
                    *guard.deref_mut() += 1;
                })
            };
            {
                let guard = data.lock();
                *guard.deref_mut() += 1;
            }
            handle.join().unwrap();
            let guard = data.lock();
            assert_eq!(*guard.deref(), 2);
        });
    }

    /// Evaluates that a raw acquisition and a combined operation exclude
    /// each other, whichever order the scheduler explores.
    pub fn mixed_join() {
        model(|| {
            let data = Arc::new(Combiner::new(0));
            let handle = {
                let data = Arc::clone(&data);
                thread::spawn(move || data.combine(|value| *value += 1))
            };
            {
                let guard = data.lock();
                *guard.deref_mut() += 1;
            }
            handle.join().unwrap();
            let value = data.combine(|value| *value);
            assert_eq!(value, 2);
        });
    }

    /// Evaluates that an asynchronous submission runs exactly once and its
    /// result is visible to the handle owner, under every interleaving.
    pub fn submit_join() {
        model(|| {
            let data = Arc::new(Combiner::new(0));
            let handle = {
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let submission = data.submit(|value| {
                        *value += 1;
                        *value
                    });
                    submission.complete()
                })
            };
            data.combine(|value| *value += 1);
            let seen = handle.join().unwrap();
            assert!(seen == 1 || seen == 2);
            let value = data.combine(|value| *value);
            assert_eq!(value, 2);
        });
    }
}
