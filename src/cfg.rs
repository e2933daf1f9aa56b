//! Conditional re-exports over `core`/`std` and Loom types, so that the lock
//! implementation is written once and model checked with the same source.

pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{fence, AtomicPtr};

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::sync::atomic::{fence, AtomicPtr};
}

pub mod cell {
    #[cfg(not(all(loom, test)))]
    pub use core::cell::UnsafeCell;

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::cell::UnsafeCell;

    /// A closure based access extension for both `core` and Loom unsafe
    /// cells, bypassing any borrow tracking.
    ///
    /// Callers are responsible for upholding Rust's aliasing rules, exactly
    /// as when dereferencing the pointer returned by `UnsafeCell::get`.
    pub trait UnsafeCellWith<T: ?Sized> {
        /// Runs `f` against a shared reference to the underlying data.
        ///
        /// # Safety
        ///
        /// There must be no concurrent mutable access to the underlying data.
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret;

        /// Runs `f` against an exclusive reference to the underlying data.
        ///
        /// # Safety
        ///
        /// There must be no concurrent access to the underlying data.
        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret;
    }

    #[cfg(not(all(loom, test)))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no concurrent mutable access.
            f(unsafe { &*self.get() })
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no concurrent access.
            f(unsafe { &mut *self.get() })
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no concurrent mutable access.
            self.with(|ptr| f(unsafe { &*ptr }))
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no concurrent access.
            self.with_mut(|ptr| f(unsafe { &mut *ptr }))
        }
    }
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::hint::spin_loop;
}

#[cfg(any(feature = "yield", test))]
pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::thread::yield_now;
}

#[cfg(test)]
pub mod sync {
    #[cfg(not(loom))]
    pub use std::sync::Arc;

    #[cfg(loom)]
    #[cfg(not(tarpaulin_include))]
    pub use loom::sync::Arc;
}
