//! Flat-combining lock implementation.
//!
//! The `raw` implementation batches pending operations into combining rounds:
//! one thread at a time, the combiner, executes queued closures on behalf of
//! their submitters, in submission order. Each waiting thread spins against
//! its own, locally-accessible atomic completion word, which avoids the
//! network contention of a shared lock state.
//!
//! Operations can be submitted synchronously through [`combine`], which
//! blocks until the closure has run and returns its value, or asynchronously
//! through [`submit`], which returns a [`Submission`] handle that can be
//! polled or consumed later. The lock itself can also be acquired without an
//! operation through [`lock`], returning a RAII [`CombinerGuard`].
//!
//! This module is `no_std` compatible. Queue nodes for blocking submissions
//! live on the submitter's stack; asynchronous submissions and raw
//! acquisitions allocate their node in the heap, since the handle may
//! outlive the acquiring call.
//!
//! The combiner is generic over the relax policy. Users may choose a policy
//! as long as it implements the [`Relax`] trait.
//!
//! There is a number of relax policies provided by the [`relax`] module. The
//! following modules provide type aliases for [`Combiner`], [`CombinerGuard`]
//! and [`Submission`] associated with a relax policy. See their documentation
//! for more information.
//!
//! [`combine`]: Combiner::combine
//! [`submit`]: Combiner::submit
//! [`lock`]: Combiner::lock
//! [`relax`]: crate::relax
//! [`Relax`]: crate::relax::Relax

mod combiner;
pub use combiner::{Combiner, CombinerGuard, Submission};

/// A flat-combining lock that implements a `spin` relax policy.
///
/// During lock contention, this lock spins while signaling the processor that
/// it is running a busy-wait spin-loop.
pub mod spins {
    use super::combiner;
    use crate::relax::Spin;

    /// A [`raw::Combiner`] that implements the [`Spin`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use fclock::raw::spins::Combiner;
    ///
    /// let combiner = Combiner::new(0);
    /// let prev = combiner.combine(|value| {
    ///     let prev = *value;
    ///     *value += 1;
    ///     prev
    /// });
    /// assert_eq!(prev, 0);
    /// ```
    /// [`raw::Combiner`]: combiner::Combiner
    pub type Combiner<T> = combiner::Combiner<T, Spin>;

    /// A [`raw::CombinerGuard`] that implements the [`Spin`] relax policy.
    ///
    /// [`raw::CombinerGuard`]: combiner::CombinerGuard
    pub type CombinerGuard<'a, T> = combiner::CombinerGuard<'a, T, Spin>;

    /// A [`raw::Submission`] that implements the [`Spin`] relax policy.
    ///
    /// [`raw::Submission`]: combiner::Submission
    pub type Submission<'a, T, F, Ret> = combiner::Submission<'a, T, Spin, F, Ret>;

    /// A flat-combining lock that implements a `spin with backoff` relax
    /// policy.
    ///
    /// During lock contention, this lock will perform exponential backoff
    /// while spinning, signaling the processor that it is running a busy-wait
    /// spin-loop.
    pub mod backoff {
        use super::combiner;
        use crate::relax::SpinBackoff;

        /// A [`raw::Combiner`] that implements the [`SpinBackoff`] relax
        /// policy.
        ///
        /// # Example
        ///
        /// ```
        /// use fclock::raw::spins::backoff::Combiner;
        ///
        /// let combiner = Combiner::new(0);
        /// combiner.combine(|value| *value += 1);
        /// assert_eq!(combiner.combine(|value| *value), 1);
        /// ```
        /// [`raw::Combiner`]: combiner::Combiner
        pub type Combiner<T> = combiner::Combiner<T, SpinBackoff>;

        /// A [`raw::CombinerGuard`] that implements the [`SpinBackoff`]
        /// relax policy.
        ///
        /// [`raw::CombinerGuard`]: combiner::CombinerGuard
        pub type CombinerGuard<'a, T> = combiner::CombinerGuard<'a, T, SpinBackoff>;

        /// A [`raw::Submission`] that implements the [`SpinBackoff`] relax
        /// policy.
        ///
        /// [`raw::Submission`]: combiner::Submission
        pub type Submission<'a, T, F, Ret> = combiner::Submission<'a, T, SpinBackoff, F, Ret>;
    }
}

/// A flat-combining lock that implements a `yield` relax policy.
///
/// During lock contention, this lock will yield the current time slice to the
/// OS scheduler.
#[cfg(any(feature = "yield", loom, test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub mod yields {
    use super::combiner;
    use crate::relax::Yield;

    /// A [`raw::Combiner`] that implements the [`Yield`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use fclock::raw::yields::Combiner;
    ///
    /// let combiner = Combiner::new(0);
    /// combiner.combine(|value| *value += 1);
    /// assert_eq!(combiner.combine(|value| *value), 1);
    /// ```
    /// [`raw::Combiner`]: combiner::Combiner
    pub type Combiner<T> = combiner::Combiner<T, Yield>;

    /// A [`raw::CombinerGuard`] that implements the [`Yield`] relax policy.
    ///
    /// [`raw::CombinerGuard`]: combiner::CombinerGuard
    pub type CombinerGuard<'a, T> = combiner::CombinerGuard<'a, T, Yield>;

    /// A [`raw::Submission`] that implements the [`Yield`] relax policy.
    ///
    /// [`raw::Submission`]: combiner::Submission
    pub type Submission<'a, T, F, Ret> = combiner::Submission<'a, T, Yield, F, Ret>;

    /// A flat-combining lock that implements a `yield with backoff` relax
    /// policy.
    ///
    /// During lock contention, this lock will perform exponential backoff
    /// while spinning, up to a threshold, then yields back to the OS
    /// scheduler.
    #[cfg(feature = "yield")]
    pub mod backoff {
        use super::combiner;
        use crate::relax::YieldBackoff;

        /// A [`raw::Combiner`] that implements the [`YieldBackoff`] relax
        /// policy.
        ///
        /// # Example
        ///
        /// ```
        /// use fclock::raw::yields::backoff::Combiner;
        ///
        /// let combiner = Combiner::new(0);
        /// combiner.combine(|value| *value += 1);
        /// assert_eq!(combiner.combine(|value| *value), 1);
        /// ```
        /// [`raw::Combiner`]: combiner::Combiner
        pub type Combiner<T> = combiner::Combiner<T, YieldBackoff>;

        /// A [`raw::CombinerGuard`] that implements the [`YieldBackoff`]
        /// relax policy.
        ///
        /// [`raw::CombinerGuard`]: combiner::CombinerGuard
        pub type CombinerGuard<'a, T> = combiner::CombinerGuard<'a, T, YieldBackoff>;

        /// A [`raw::Submission`] that implements the [`YieldBackoff`] relax
        /// policy.
        ///
        /// [`raw::Submission`]: combiner::Submission
        pub type Submission<'a, T, F, Ret> = combiner::Submission<'a, T, YieldBackoff, F, Ret>;
    }
}

/// A flat-combining lock that implements a `loop` relax policy.
///
/// During lock contention, this lock will rapidly spin without telling the CPU
/// to do any power down.
pub mod loops {
    use super::combiner;
    use crate::relax::Loop;

    /// A [`raw::Combiner`] that implements the [`Loop`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use fclock::raw::loops::Combiner;
    ///
    /// let combiner = Combiner::new(0);
    /// combiner.combine(|value| *value += 1);
    /// assert_eq!(combiner.combine(|value| *value), 1);
    /// ```
    /// [`raw::Combiner`]: combiner::Combiner
    pub type Combiner<T> = combiner::Combiner<T, Loop>;

    /// A [`raw::CombinerGuard`] that implements the [`Loop`] relax policy.
    ///
    /// [`raw::CombinerGuard`]: combiner::CombinerGuard
    pub type CombinerGuard<'a, T> = combiner::CombinerGuard<'a, T, Loop>;

    /// A [`raw::Submission`] that implements the [`Loop`] relax policy.
    ///
    /// [`raw::Submission`]: combiner::Submission
    pub type Submission<'a, T, F, Ret> = combiner::Submission<'a, T, Loop, F, Ret>;
}
