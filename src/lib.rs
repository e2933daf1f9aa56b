//! An implementation of Hendler, Incze, Shavit and Tzafrir's [flat combining]
//! technique for mutual exclusion.
//!
//! A flat-combining lock is a queue-based mutual exclusion primitive that,
//! instead of shepherding every thread through its own critical section,
//! encourages threads to describe their critical sections as closures and
//! submit them to a waiting queue. A single thread at a time, the combiner,
//! drains the queue and executes pending closures back to back. The main
//! properties of this mechanism are:
//!
//! - operations submitted by one thread are applied in submission order;
//! - batching keeps the protected data hot in the combiner's cache, cutting
//!   down on cache line transfers under heavy contention;
//! - waiting threads spin on locally-accessible completion words only;
//! - combining rounds are capped, so no thread is conscripted into an
//!   unbounded amount of other threads' work.
//!
//! Operations can be submitted synchronously through [`combine`], which
//! blocks until the closure has run, or asynchronously through [`submit`],
//! which returns a handle for later completion. The lock can also be held
//! directly across a scope through [`lock`], which is useful when a critical
//! section cannot be expressed as a single closure.
//!
//! ## Spinlock use cases
//!
//! It is noteworthy to mention that [spinlocks are usually not what you want].
//! The majority of use cases are well covered by OS-based mutexes like
//! [`std::sync::Mutex`], [`parking_lot::Mutex`]. These implementations will
//! notify the system that the waiting thread should be parked, freeing the
//! processor to work on something else.
//!
//! Spinlocks are only efficient in very few circunstances where the overhead
//! of context switching or process rescheduling are greater than busy waiting
//! for very short periods. Spinlocks can be useful inside operating-system
//! kernels, on embedded systems or even complement other locking designs.
//!
//! ## Waiting queue node allocations
//!
//! Queue nodes for blocking submissions are transparently allocated in the
//! submitting thread's stack, since the submitter cannot return before its
//! node reaches a terminal state. Asynchronous submissions and raw lock
//! acquisitions allocate their nodes in the heap, because the associated
//! handles may outlive the acquiring call and move across threads while the
//! node must stay pinned. Therefore, this crate requires linking with Rust's
//! core [alloc] library.
//!
//! ## Combining a closure
//!
//! This implementation executes operations in submission order. Closures are
//! run exactly once, on whichever thread holds combining duty at the time.
//! This implementation is `no_std` compatible. See the [`raw`] module for
//! more information.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! // Simply spins during contention.
//! use fclock::raw::spins::Combiner;
//!
//! let combiner = Arc::new(Combiner::new(0));
//! let c_combiner = Arc::clone(&combiner);
//!
//! thread::spawn(move || {
//!     // The closure may run on either thread, but it runs exactly once.
//!     c_combiner.combine(|value| *value = 10);
//! })
//! .join().expect("thread::spawn failed");
//!
//! // The lock may also be held directly, without submitting an operation.
//! assert_eq!(*combiner.lock(), 10);
//! ```
//!
//! ## Features
//!
//! This crate dos not provide any default features. Features that can be enabled
//! are:
//!
//! ### yield
//!
//! The `yield` feature requires linking to the standard library, so it is not
//! suitable for `no_std` environments. By enabling the `yield` feature, instead
//! of busy-waiting during lock acquisitions and releases, this will call
//! [`std::thread::yield_now`], which cooperatively gives up a timeslice to the
//! OS scheduler. This may cause a context switch, so you may not want to enable
//! this feature if your intention is to to actually do optimistic spinning. The
//! default implementation calls [`core::hint::spin_loop`], which does in fact
//! just simply busy-waits. This feature is not `not_std` compatible.
//!
//! [flat combining]: https://people.csail.mit.edu/shanir/publications/Flat%20Combining%20SPAA%2010.pdf
//! [spinlocks are usually not what you want]: https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html
//!
//! [`combine`]: raw::Combiner::combine
//! [`submit`]: raw::Combiner::submit
//! [`lock`]: raw::Combiner::lock
//! [`parking_lot::Mutex`]: https://docs.rs/parking_lot/latest/parking_lot/type.Mutex.html

#![no_std]
#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

#[cfg(any(feature = "yield", loom, test))]
extern crate std;

pub mod raw;
pub mod relax;

pub(crate) mod cfg;
pub(crate) mod inner;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
