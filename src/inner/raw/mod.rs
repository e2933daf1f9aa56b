use alloc::boxed::Box;

use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::cfg::atomic::{fence, AtomicPtr};
use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::relax::Relax;

/// The maximum number of operations a single combining round may execute.
///
/// A capped round keeps any one thread from being conscripted into an
/// unbounded amount of other threads' work: once the cap is reached the
/// remainder of the backlog is handed to another waiter.
pub(crate) const MAX_RUN: usize = 10;

/// The completion state of a queue node, decoded from one atomic word.
///
/// The hand-off variant carries the queue position the receiving thread must
/// continue combining from, so no separate field is needed to transfer the
/// backlog.
#[derive(Debug)]
pub(crate) enum Completion<T: ?Sized> {
    /// The operation has not run and the node is still linked.
    Waiting,
    /// The operation has run (or the lock was released) and the node is no
    /// longer reachable by any other thread.
    Finished,
    /// The observing thread now holds combining duty, starting at the
    /// carried node.
    Handoff(*mut Node<T>),
}

/// Atomic storage for a [`Completion`].
///
/// Encoding: null is `Waiting`, address 1 is `Finished` (nodes are at least
/// word aligned, so no node can ever carry that address), and any other
/// value is `Handoff` to that node.
struct AtomicCompletion<T: ?Sized> {
    state: AtomicPtr<Node<T>>,
}

impl<T: ?Sized> AtomicCompletion<T> {
    /// The sentinel address signalling the finished state.
    fn finished() -> *mut Node<T> {
        1 as *mut Node<T>
    }

    /// Creates a new completion marker in the waiting state.
    fn waiting() -> Self {
        Self { state: AtomicPtr::new(ptr::null_mut()) }
    }

    fn load(&self, order: Ordering) -> Completion<T> {
        let state = self.state.load(order);
        if state.is_null() {
            Completion::Waiting
        } else if state == Self::finished() {
            Completion::Finished
        } else {
            Completion::Handoff(state)
        }
    }

    fn set_finished(&self, order: Ordering) {
        self.state.store(Self::finished(), order);
    }

    fn set_handoff(&self, head: *mut Node<T>, order: Ordering) {
        debug_assert!(!head.is_null() && head != Self::finished());
        self.state.store(head, order);
    }

    /// Resets the state back to waiting.
    ///
    /// Only ever called by the owning thread right after it consumed a
    /// hand-off, which is the point where it holds combining duty and no
    /// other thread may store into this word.
    fn set_waiting(&self) {
        self.state.store(ptr::null_mut(), Relaxed);
    }
}

/// A type erased submission: a shim function plus a pointer to the packet
/// holding the caller's closure and return slot.
pub(crate) struct OpSlot<T: ?Sized> {
    call: unsafe fn(*mut (), &mut T),
    data: *mut (),
}

/// The caller owned closure and return value slot backing an [`OpSlot`].
///
/// The packet stays untouched by its owner from enqueue until the finished
/// transition is observed, which is what makes the combiner's accesses to it
/// data race free.
pub(crate) struct Packet<F, Ret> {
    f: Option<F>,
    ret: Option<Ret>,
}

impl<F, Ret> Packet<F, Ret> {
    pub(crate) fn new(f: F) -> Self {
        Self { f: Some(f), ret: None }
    }
}

/// The shim invoked by whichever thread combines a submission.
///
/// # Safety
///
/// `data` must point to a live `Packet<F, Ret>` whose owner does not access
/// it until it observes the node's finished transition.
unsafe fn execute_packet<T: ?Sized, F, Ret>(data: *mut (), value: &mut T)
where
    F: FnOnce(&mut T) -> Ret,
{
    // SAFETY: Caller guaranteed the packet is live and unaliased for the
    // duration of this call.
    let packet = unsafe { &mut *data.cast::<Packet<F, Ret>>() };
    debug_assert!(packet.f.is_some(), "a combined operation must run at most once");
    if let Some(f) = packet.f.take() {
        packet.ret = Some(f(value));
    }
}

/// The intrusive queue node carried by every submission.
///
/// A node is owned by its submitter (stack frame, submission handle or lock
/// guard) for its entire linked lifetime, and its storage may only be
/// released after the owner observes a terminal completion state. All
/// cross-thread accesses go through the atomic fields.
pub(crate) struct Node<T: ?Sized> {
    /// Link to the node enqueued immediately after this one. Stored by the
    /// *next* inserter, so there is a short window where a logical successor
    /// exists but the link is still null.
    next: AtomicPtr<Node<T>>,
    /// The node this one is currently linked behind. Written at enqueue
    /// and repaired by removals, so it always names the live list
    /// predecessor; read and repaired only while holding combining duty.
    prev: AtomicPtr<Node<T>>,
    completion: AtomicCompletion<T>,
    /// Whether the submitter actively polls `completion` (and may therefore
    /// be notified by a direct hand-off store).
    blocking: bool,
    /// The submission to execute, or `None` for a raw lock acquisition.
    op: Option<OpSlot<T>>,
}

impl<T: ?Sized> Node<T> {
    /// Creates a new unlinked node in the waiting state, with no operation
    /// attached yet.
    fn new(blocking: bool) -> Self {
        let next = AtomicPtr::new(ptr::null_mut());
        let prev = AtomicPtr::new(ptr::null_mut());
        let completion = AtomicCompletion::waiting();
        Self { next, prev, completion, blocking, op: None }
    }
}

/// An owning pointer that manages a heap allocated queue node.
///
/// Used by the guard and submission types, whose nodes must stay pinned
/// while the handles themselves move around.
struct NodeHandle<T: ?Sized> {
    inner: NonNull<Node<T>>,
}

// SAFETY: A node handle is just an owning pointer; all shared mutation of
// the pointee goes through atomics.
unsafe impl<T: ?Sized> Send for NodeHandle<T> {}
// SAFETY: Same argument as the Send impl above.
unsafe impl<T: ?Sized> Sync for NodeHandle<T> {}

impl<T: ?Sized> NodeHandle<T> {
    fn new(node: Node<T>) -> Self {
        let ptr = Box::into_raw(Box::new(node));
        // SAFETY: The returned `ptr` is guaranteed to be properly aligned
        // and non-null by the `Box::into_raw` function contract.
        let inner = unsafe { NonNull::new_unchecked(ptr) };
        Self { inner }
    }

    fn as_ptr(&self) -> *mut Node<T> {
        self.inner.as_ptr()
    }

    fn as_ref(&self) -> &Node<T> {
        // SAFETY: The inner pointer always points to a valid allocation
        // owned by this handle.
        unsafe { self.inner.as_ref() }
    }
}

impl<T: ?Sized> Drop for NodeHandle<T> {
    fn drop(&mut self) {
        // SAFETY: The memory was allocated through the Box API, this drop
        // call only ever runs once, and the owner only drops the handle
        // after the node reached a terminal completion state, at which
        // point no other thread can still reach it.
        drop(unsafe { Box::from_raw(self.inner.as_ptr()) });
    }
}

/// A flat-combining lock protecting a value of type `T`.
///
/// The queue of pending submissions is reachable from `tail` alone; there
/// is no head pointer, the processed prefix is simply abandoned as each
/// node is marked finished. At most one thread holds combining duty at any
/// time: whichever thread found the queue idle at enqueue, whichever thread
/// last received a hand-off, or whichever waiter consumed the takeover
/// slot.
pub struct Combiner<T: ?Sized, W> {
    /// The most recently enqueued node, or null when the queue is idle.
    tail: AtomicPtr<Node<T>>,
    /// A backlog head parked here when no pending submitter was actively
    /// polling at hand-off time. Cleared by whichever waiter consumes it.
    takeover: AtomicPtr<Node<T>>,
    wait: PhantomData<W>,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
// SAFETY: The combiner hands `&mut T` to other threads, which is what the
// `T: Send` bound accounts for.
unsafe impl<T: ?Sized + Send, W> Send for Combiner<T, W> {}
// SAFETY: See above; shared access to the data is always serialized.
unsafe impl<T: ?Sized + Send, W> Sync for Combiner<T, W> {}

impl<T, W> Combiner<T, W> {
    /// Creates a new combiner in an idle state ready for use.
    pub fn new(value: T) -> Self {
        let tail = AtomicPtr::new(ptr::null_mut());
        let takeover = AtomicPtr::new(ptr::null_mut());
        let data = UnsafeCell::new(value);
        Self { tail, takeover, wait: PhantomData, data }
    }
}

impl<T: ?Sized, W> Combiner<T, W> {
    /// Returns a mutable reference to the underlying data.
    #[cfg(not(all(loom, test)))]
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: We hold exclusive access to the combiner and its data.
        unsafe { &mut *self.data.get() }
    }

    /// Whether the queue and the takeover slot are both empty.
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.tail.load(Relaxed).is_null() && self.takeover.load(Relaxed).is_null()
    }
}

impl<T: ?Sized, W: Relax> Combiner<T, W> {
    /// Submits `f` and blocks until it has executed, returning its result.
    ///
    /// The operation runs exactly once, on whichever thread ends up
    /// combining it: this one (when elected or self-servicing) or the
    /// current combiner.
    pub fn combine<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let mut packet = Packet::new(f);
        let mut node = Node::new(true);
        let data = (&mut packet as *mut Packet<F, Ret>).cast::<()>();
        node.op = Some(OpSlot { call: execute_packet::<T, F, Ret>, data });
        let node_ptr = (&node as *const Node<T>).cast_mut();
        if self.enqueue(&node) {
            // SAFETY: We found the queue idle, so we are the combiner; the
            // node outlives the round since it lives in this stack frame.
            unsafe { self.combine_round(node_ptr, ptr::null_mut()) };
        } else {
            // SAFETY: The node is enqueued, carries an operation, and stays
            // pinned in this stack frame until completion.
            unsafe { self.wait_message(&node) };
        }
        // SAFETY: The finished transition implies the operation ran and
        // stored its result; nothing else reaches the packet anymore.
        unsafe { packet.ret.take().unwrap_unchecked() }
    }

    /// Submits `f` without waiting for it, returning a completion handle.
    ///
    /// When this thread is elected combiner the round runs synchronously
    /// before returning, so the handle may already be complete.
    pub fn submit<F, Ret>(&self, f: F) -> Submission<'_, T, W, F, Ret>
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let slot = Box::into_raw(Box::new(SubmitSlot {
            node: Node::new(false),
            packet: Packet::new(f),
        }));
        // SAFETY: `slot` is a live, exclusively owned heap allocation; the
        // operation pointer is wired up before the node is published.
        unsafe {
            let data = ptr::addr_of_mut!((*slot).packet).cast::<()>();
            (*slot).node.op = Some(OpSlot { call: execute_packet::<T, F, Ret>, data });
            let node_ptr = ptr::addr_of_mut!((*slot).node);
            if self.enqueue(&(*slot).node) {
                self.combine_round(node_ptr, ptr::null_mut());
            }
            let slot = NonNull::new_unchecked(slot);
            Submission { lock: self, slot }
        }
    }

    /// Acquires the lock itself, without submitting an operation.
    ///
    /// The returned guard holds the queue head position; the backlog behind
    /// it is only combined after the guard is dropped.
    pub fn lock(&self) -> Guard<'_, T, W> {
        let head = NodeHandle::new(Node::new(true));
        if !self.enqueue(head.as_ref()) {
            // SAFETY: The node is enqueued, operation-less and pinned by
            // the heap handle.
            unsafe { self.wait_acquisition(head.as_ref()) };
        }
        fence(Acquire);
        Guard::new(self, head)
    }

    /// Inserts `node` at the queue tail.
    ///
    /// Returns true iff the queue was idle, in which case the inserting
    /// thread is elected combiner and must never wait.
    fn enqueue(&self, node: &Node<T>) -> bool {
        debug_assert!(node.next.load(Relaxed).is_null());
        debug_assert!(matches!(node.completion.load(Relaxed), Completion::Waiting));
        let node_ptr = (node as *const Node<T>).cast_mut();
        let prev = self.tail.swap(node_ptr, AcqRel);
        node.prev.store(prev, Relaxed);
        if prev.is_null() {
            return true;
        }
        // SAFETY: The predecessor cannot be released before this link store
        // becomes visible: whoever finishes it must first dequeue it, and
        // the dequeue either observes this link or spins until it appears.
        unsafe { &(*prev).next }.store(node_ptr, Release);
        false
    }

    /// Runs one combining round from `head` and releases combining duty.
    ///
    /// When `must_finish` is non-null it is the caller's own pending node:
    /// if the capped batch did not reach it, the caller services it out of
    /// band before handing off, so this function always leaves a non-null
    /// `must_finish` in the finished state.
    ///
    /// # Safety
    ///
    /// The caller must hold combining duty, `head` must be the first
    /// unprocessed node and carry an operation, and `must_finish` (when
    /// non-null) must be a node owned by the calling thread.
    unsafe fn combine_round(&self, head: *mut Node<T>, must_finish: *mut Node<T>) {
        // SAFETY: Guaranteed by the caller.
        let last = unsafe { self.perform_work(head) };
        if !must_finish.is_null() && must_finish != last {
            // SAFETY: A node the caller owns is alive by definition.
            let own = unsafe { &*must_finish };
            // A node the batch executed has already left the waiting state.
            if let Completion::Waiting = own.completion.load(Relaxed) {
                // SAFETY: We hold combining duty and the node is still
                // linked and waiting.
                unsafe { self.remove_and_run(must_finish) };
            }
        }
        // SAFETY: `last` was executed by this round and not yet finished.
        unsafe { self.advance_and_notify(last) };
    }

    /// The combining engine: executes queued operations in enqueue order,
    /// starting at `head`, and returns the last node it executed.
    ///
    /// The batch ends at the first of: an unset `next` link (backlog
    /// drained for now), the run cap, or a node with no operation attached
    /// (a raw acquisition, which is never executed and never skipped; the
    /// hand-off step routes the lock to its owner instead). The returned
    /// node is intentionally not yet marked finished: it must be dequeued
    /// first, which is the hand-off protocol's job.
    ///
    /// # Safety
    ///
    /// The caller must hold combining duty and `head` must be the first
    /// unprocessed node and carry an operation.
    unsafe fn perform_work(&self, head: *mut Node<T>) -> *mut Node<T> {
        debug_assert!(!head.is_null());
        let mut last = head;
        let mut current = head;
        let mut run = 0;
        loop {
            // SAFETY: `current` is a linked, unprocessed node; its owner
            // cannot release it before we mark it finished.
            let node = unsafe { &*current };
            let Some(op) = node.op.as_ref() else { break };
            let next = node.next.load(Acquire);
            // SAFETY: Combining duty grants exclusive access to the data,
            // and the waiting state of `current` guarantees its operation
            // has not run yet.
            unsafe { self.data.with_mut_unchecked(|data| (op.call)(op.data, data)) };
            if current != last {
                // The predecessor's effects are published before its waiter
                // is allowed to proceed; nothing traverses back to it.
                // SAFETY: `last` stays alive until this very store.
                unsafe { &*last }.completion.set_finished(Release);
            }
            last = current;
            run += 1;
            if run == MAX_RUN || next.is_null() {
                break;
            }
            current = next;
        }
        debug_assert!(run > 0, "a round must execute at least its head");
        last
    }

    /// Finds the node to continue from after `stop_at`, resetting the queue
    /// to idle when `stop_at` is the last queued node.
    ///
    /// # Safety
    ///
    /// The caller must hold combining duty and `stop_at` must be a linked
    /// node owned by this round.
    unsafe fn advance(&self, stop_at: *mut Node<T>) -> *mut Node<T> {
        // SAFETY: `stop_at` has not been marked finished, so it is alive.
        let node = unsafe { &*stop_at };
        let mut next = node.next.load(Acquire);
        if next.is_null() {
            // Release on success publishes this round's effects to the next
            // elected combiner through its acquiring tail swap.
            let result =
                self.tail.compare_exchange(stop_at, ptr::null_mut(), Release, Relaxed);
            if result.is_ok() {
                return ptr::null_mut();
            }
            // The failed exchange proves an enqueue is in flight: its link
            // store must appear within a bounded number of its steps.
            let mut relax = W::new();
            loop {
                next = node.next.load(Acquire);
                if !next.is_null() {
                    break;
                }
                relax.relax();
            }
        }
        next
    }

    /// The hand-off protocol: dequeues the processed prefix ending at
    /// `stop_at`, marks it finished, and transfers combining duty.
    ///
    /// A successor with no operation receives the lock directly. Otherwise
    /// the first pending waiter that actively polls its completion word is
    /// handed the backlog; failing that, duty is parked in the takeover
    /// slot for whichever waiter looks for it first.
    ///
    /// # Safety
    ///
    /// The caller must hold combining duty; `stop_at` must be this round's
    /// last executed node (or the caller's own released acquisition node)
    /// and must not already be finished.
    unsafe fn advance_and_notify(&self, stop_at: *mut Node<T>) {
        // SAFETY: Guaranteed by the caller.
        let next = unsafe { self.advance(stop_at) };
        // Dequeue before finish: the waiter may release the node's storage
        // as soon as it observes this transition.
        // SAFETY: `stop_at` stays alive until this very store.
        unsafe { &*stop_at }.completion.set_finished(Release);
        if next.is_null() {
            return;
        }
        // SAFETY: `next` is pending, so its owner keeps it alive; a duty
        // holder is the only thread that stores into pending completions.
        let successor = unsafe { &*next };
        if successor.op.is_none() {
            // A raw acquisition heads the backlog: the lock goes straight
            // to its owner, ending this thread's combining duty.
            successor.completion.set_handoff(next, Release);
            return;
        }
        let mut current = next;
        loop {
            // SAFETY: Every node on the pending suffix is alive.
            let node = unsafe { &*current };
            if node.blocking {
                node.completion.set_handoff(next, Release);
                return;
            }
            let ahead = node.next.load(Acquire);
            if ahead.is_null() {
                break;
            }
            current = ahead;
        }
        // Every visible pending submitter is asynchronous: park duty for
        // whichever waiter decides to look for it.
        debug_assert!(self.takeover.load(Relaxed).is_null());
        self.takeover.store(next, Release);
    }

    /// Self-service removal: runs the calling thread's own pending
    /// operation and unlinks its node, ahead of the engine reaching it.
    ///
    /// Exactly-once execution holds because this is only ever called while
    /// the caller holds combining duty, which is also what makes the
    /// neighbouring link updates race free: the only concurrent mutation is
    /// an enqueue at the tail, which the final exchange arbitrates.
    ///
    /// # Safety
    ///
    /// The caller must hold combining duty; `node_ptr` must be the caller's
    /// own node, still linked and in the waiting state, and must not be the
    /// current round's last executed node. The node must have been enqueued
    /// behind a predecessor (an elected node is never removed).
    unsafe fn remove_and_run(&self, node_ptr: *mut Node<T>) {
        // SAFETY: The node is owned by the calling thread.
        let node = unsafe { &*node_ptr };
        if let Some(op) = node.op.as_ref() {
            // SAFETY: Combining duty grants exclusive access to the data,
            // and the waiting state guarantees the operation has not run.
            unsafe { self.data.with_mut_unchecked(|data| (op.call)(op.data, data)) };
        }
        node.completion.set_finished(Release);
        let prev = node.prev.load(Relaxed);
        // A removable node was never elected and every removal repairs its
        // successor's backpointer, so `prev` names the live predecessor.
        debug_assert!(!prev.is_null());
        // Any node we are linked behind is either this round's boundary or
        // still unprocessed, hence alive.
        debug_assert!({
            // SAFETY: See the liveness note above.
            let linked = unsafe { &*prev }.next.load(Relaxed);
            linked == node_ptr
        });
        let next = node.next.load(Acquire);
        if !next.is_null() {
            // Interior node: bridge the predecessor over us, and point the
            // successor back at it, so that a later removal of the
            // successor never walks through this dead node.
            // SAFETY: See the liveness note above.
            unsafe { &(*prev).next }.store(next, Release);
            // SAFETY: A pending successor stays alive, and only a duty
            // holder touches the backpointer of a linked node.
            unsafe { &(*next).prev }.store(prev, Relaxed);
            return;
        }
        // We look like the tail. Clearing the link with a plain store is
        // fine: it is only ever read by a duty holder, and we are it.
        // SAFETY: See the liveness note above.
        unsafe { &(*prev).next }.store(ptr::null_mut(), Relaxed);
        if self.tail.compare_exchange(node_ptr, prev, Release, Relaxed).is_err() {
            // A racing enqueue linked behind us; wait for its link store
            // and bridge to it instead.
            let mut relax = W::new();
            let mut next = node.next.load(Acquire);
            while next.is_null() {
                relax.relax();
                next = node.next.load(Acquire);
            }
            // SAFETY: See the liveness note above.
            unsafe { &(*prev).next }.store(next, Release);
            // SAFETY: Same argument as the interior bridge above.
            unsafe { &(*next).prev }.store(prev, Relaxed);
        }
    }

    /// Attempts to consume the takeover slot.
    ///
    /// Returns the parked backlog head on success, null otherwise. A
    /// successful consume transfers combining duty to the caller.
    fn try_takeover(&self) -> *mut Node<T> {
        let head = self.takeover.load(Relaxed);
        if head.is_null() {
            return ptr::null_mut();
        }
        match self.takeover.compare_exchange(head, ptr::null_mut(), Acquire, Relaxed) {
            Ok(head) => head,
            Err(_) => ptr::null_mut(),
        }
    }

    /// Waits until this thread's submission has executed, combining the
    /// backlog whenever duty lands here (by direct hand-off or through the
    /// takeover slot).
    ///
    /// # Safety
    ///
    /// `node` must be the calling thread's enqueued submission node, and it
    /// must carry an operation.
    unsafe fn wait_message(&self, node: &Node<T>) {
        let node_ptr = (node as *const Node<T>).cast_mut();
        let mut relax = W::new();
        loop {
            match node.completion.load(Relaxed) {
                Completion::Finished => {
                    fence(Acquire);
                    return;
                }
                Completion::Handoff(head) => {
                    fence(Acquire);
                    node.completion.set_waiting();
                    // SAFETY: Receiving a hand-off makes us the combiner;
                    // the round below services our own node if the capped
                    // batch misses it.
                    unsafe { self.combine_round(head, node_ptr) };
                    debug_assert!(matches!(
                        node.completion.load(Relaxed),
                        Completion::Finished
                    ));
                    return;
                }
                Completion::Waiting => {
                    let head = self.try_takeover();
                    if !head.is_null() {
                        fence(Acquire);
                        // SAFETY: Consuming the slot makes us the combiner.
                        unsafe { self.combine_round(head, node_ptr) };
                        debug_assert!(matches!(
                            node.completion.load(Relaxed),
                            Completion::Finished
                        ));
                        return;
                    }
                    relax.relax();
                }
            }
        }
    }

    /// Waits until this thread's raw acquisition node holds the queue head
    /// position, combining on behalf of earlier submissions whenever duty
    /// lands here.
    ///
    /// # Safety
    ///
    /// `node` must be the calling thread's enqueued acquisition node, with
    /// no operation attached.
    unsafe fn wait_acquisition(&self, node: &Node<T>) {
        let node_ptr = (node as *const Node<T>).cast_mut();
        let mut relax = W::new();
        loop {
            match node.completion.load(Relaxed) {
                // Any transition out of waiting signals the head position
                // is ours; finished only arises from hand-off shortcuts.
                Completion::Finished => return,
                Completion::Handoff(head) => {
                    if head == node_ptr {
                        // The processed prefix ends right before us: the
                        // lock is ours.
                        return;
                    }
                    fence(Acquire);
                    node.completion.set_waiting();
                    // SAFETY: Receiving a hand-off makes us the combiner.
                    // The engine stops at our own operation-less node and
                    // the hand-off step then routes the lock back here.
                    unsafe { self.combine_round(head, ptr::null_mut()) };
                }
                Completion::Waiting => {
                    let head = self.try_takeover();
                    if !head.is_null() {
                        fence(Acquire);
                        // SAFETY: Consuming the slot makes us the combiner.
                        unsafe { self.combine_round(head, ptr::null_mut()) };
                    } else {
                        relax.relax();
                    }
                }
            }
        }
    }
}

impl<T: ?Sized + Debug, W: Relax> Debug for Combiner<T, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Combiner");
        self.lock().with(|data| d.field("data", &data));
        d.finish()
    }
}

/// A heap slot tying a submission node to its closure packet, so a single
/// allocation backs the whole asynchronous submission.
struct SubmitSlot<T: ?Sized, F, Ret> {
    node: Node<T>,
    packet: Packet<F, Ret>,
}

/// A handle to a pending asynchronous submission.
///
/// Completion can be polled without blocking; consuming the handle waits
/// for (and, when duty lands here, helps with) the operation's execution
/// and yields its result. Dropping the handle also waits: the node's
/// storage cannot be released while it may still be linked.
#[must_use = "the submission is only guaranteed to run once completed or dropped"]
pub struct Submission<'a, T: ?Sized, W: Relax, F, Ret> {
    lock: &'a Combiner<T, W>,
    slot: NonNull<SubmitSlot<T, F, Ret>>,
}

// SAFETY: A submission moves the closure, its result and access to the
// protected data across threads, all of which the bounds account for.
unsafe impl<T: ?Sized + Send, W: Relax, F: Send, Ret: Send> Send
    for Submission<'_, T, W, F, Ret>
{
}

impl<'a, T: ?Sized, W: Relax, F, Ret> Submission<'a, T, W, F, Ret> {
    fn node(&self) -> &Node<T> {
        // SAFETY: The slot allocation is owned by this handle and stays
        // live until the handle is consumed or dropped.
        &unsafe { self.slot.as_ref() }.node
    }

    /// Whether the operation has already executed.
    ///
    /// This is a non-blocking check; it never takes on combining duty.
    pub fn is_complete(&self) -> bool {
        matches!(self.node().completion.load(Relaxed), Completion::Finished)
    }

    /// Waits until the operation has executed and returns its result.
    ///
    /// If combining duty lands on this thread while waiting, it services
    /// the backlog, running its own operation out of band if the capped
    /// batch does not reach it.
    pub fn complete(self) -> Ret {
        let lock = self.lock;
        let slot_ptr = self.slot.as_ptr();
        mem::forget(self);
        // SAFETY: The slot is live, its node is enqueued and carries an
        // operation; after the wait the allocation is exclusively ours.
        unsafe {
            lock.wait_message(&(*slot_ptr).node);
            let slot = Box::from_raw(slot_ptr);
            // SAFETY: The finished transition implies the operation ran and
            // stored its result.
            slot.packet.ret.unwrap_unchecked()
        }
    }
}

impl<T: ?Sized, W: Relax, F, Ret> Drop for Submission<'_, T, W, F, Ret> {
    fn drop(&mut self) {
        // SAFETY: Same argument as `complete`; the result is discarded.
        unsafe {
            self.lock.wait_message(&self.slot.as_ref().node);
            drop(Box::from_raw(self.slot.as_ptr()));
        }
    }
}

impl<T: ?Sized, W: Relax, F, Ret> Debug for Submission<'_, T, W, F, Ret> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission").field("is_complete", &self.is_complete()).finish()
    }
}

/// An RAII implementation of a "scoped lock" over a combiner. When this
/// structure is dropped (falls out of scope), the lock is released and the
/// backlog behind it is handed off.
#[must_use = "if unused the Combiner will immediately unlock"]
pub struct Guard<'a, T: ?Sized, W: Relax> {
    lock: &'a Combiner<T, W>,
    head: NodeHandle<T>,
}

// Rust's `std::sync::MutexGuard` is not Send for pthread compatibility, but
// this implementation is safe to be Send.
// SAFETY: The guard's drop hand-off may run on any thread; the data moves
// with it, which the `T: Send` bound accounts for.
unsafe impl<T: ?Sized + Send, W: Relax> Send for Guard<'_, T, W> {}
// Same unsafe Sync impl as `std::sync::MutexGuard`.
// SAFETY: Shared access through the guard only exposes `&T`.
unsafe impl<T: ?Sized + Sync, W: Relax> Sync for Guard<'_, T, W> {}

impl<'a, T: ?Sized, W: Relax> Guard<'a, T, W> {
    /// Creates a new guard instance holding the queue head position.
    fn new(lock: &'a Combiner<T, W>, head: NodeHandle<T>) -> Self {
        Self { lock, head }
    }

    /// Runs `f` against a shared reference pointing to the underlying data.
    pub(crate) fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { self.lock.data.with_unchecked(f) }
    }
}

impl<T: ?Sized, W: Relax> Drop for Guard<'_, T, W> {
    fn drop(&mut self) {
        // SAFETY: A guard holds the queue head position, which is combining
        // duty in suspended form; the hand-off dequeues and finishes our
        // node before the handle's drop releases its storage.
        unsafe { self.lock.advance_and_notify(self.head.as_ptr()) };
    }
}

impl<T: ?Sized + Debug, W: Relax> Debug for Guard<'_, T, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

impl<T: ?Sized + Display, W: Relax> Display for Guard<'_, T, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, W: Relax> core::ops::Deref for Guard<'_, T, W> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data.get() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, W: Relax> core::ops::DerefMut for Guard<'_, T, W> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin_include))]
impl<T: ?Sized, W: Relax> Guard<'_, T, W> {
    /// Returns a shared reference to the underlying Loom cell.
    pub(crate) fn get(&self) -> &loom::cell::UnsafeCell<T> {
        &self.lock.data
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use core::ptr;
    use core::sync::atomic::Ordering::Relaxed;

    use super::{execute_packet, Combiner, Completion, Node, OpSlot, Packet, MAX_RUN};
    use crate::relax::Yield;

    type Log = Vec<usize>;

    /// Builds a submission node that appends an index to the combined log.
    fn make_node<F: FnOnce(&mut Log)>(
        packet: &mut Packet<F, ()>,
        blocking: bool,
    ) -> Box<Node<Log>> {
        let mut node = Box::new(Node::new(blocking));
        let data = (packet as *mut Packet<F, ()>).cast::<()>();
        node.op = Some(OpSlot { call: execute_packet::<Log, F, ()>, data });
        node
    }

    fn node_ptr(node: &Node<Log>) -> *mut Node<Log> {
        (node as *const Node<Log>).cast_mut()
    }

    fn is_finished(node: &Node<Log>) -> bool {
        matches!(node.completion.load(Relaxed), Completion::Finished)
    }

    #[test]
    fn capped_batch_removes_own_node_and_parks_duty() {
        const BACKLOG: usize = MAX_RUN + 3;
        let combiner: Combiner<Log, Yield> = Combiner::new(Vec::new());

        let mut packets: Vec<_> =
            (0..BACKLOG).map(|i| Packet::new(move |log: &mut Log| log.push(i))).collect();
        let mut nodes = Vec::with_capacity(BACKLOG);
        for (i, packet) in packets.iter_mut().enumerate() {
            let node = make_node(packet, false);
            assert_eq!(combiner.enqueue(&node), i == 0);
            nodes.push(node);
        }

        // The first inserter combines a capped batch, services its "own"
        // tail node out of band, then parks duty in the takeover slot.
        let own = node_ptr(&nodes[BACKLOG - 1]);
        // SAFETY: The first enqueue elected this thread; all nodes are alive.
        unsafe { combiner.combine_round(node_ptr(&nodes[0]), own) };

        for node in nodes.iter().take(MAX_RUN) {
            assert!(is_finished(node));
        }
        assert!(is_finished(&nodes[BACKLOG - 1]), "self-serviced node must finish");
        assert!(!is_finished(&nodes[MAX_RUN]), "nodes beyond the cap stay pending");

        let parked = combiner.try_takeover();
        assert_eq!(parked, node_ptr(&nodes[MAX_RUN]));

        // A second round drains the remainder; the removed node is gone.
        // SAFETY: Consuming the takeover slot transferred combining duty.
        unsafe { combiner.combine_round(parked, ptr::null_mut()) };
        assert!(combiner.is_idle());

        let log = combiner.lock().with(Log::clone);
        let mut expected: Log = (0..MAX_RUN).collect();
        expected.push(BACKLOG - 1);
        expected.extend(MAX_RUN..BACKLOG - 1);
        assert_eq!(log, expected);
    }

    #[test]
    fn removal_repairs_successor_backpointer_across_rounds() {
        const BACKLOG: usize = 2 * MAX_RUN + 2;
        let combiner: Combiner<Log, Yield> = Combiner::new(Vec::new());

        let mut packets: Vec<_> =
            (0..BACKLOG).map(|i| Packet::new(move |log: &mut Log| log.push(i))).collect();
        let mut nodes = Vec::with_capacity(BACKLOG);
        for (i, packet) in packets.iter_mut().enumerate() {
            let node = make_node(packet, false);
            assert_eq!(combiner.enqueue(&node), i == 0);
            nodes.push(node);
        }

        // Round one: a capped batch plus the out-of-band removal of an
        // interior node. The removal must point the successor back at the
        // node's predecessor, not leave it aimed at the removed node.
        let removed = node_ptr(&nodes[BACKLOG - 2]);
        // SAFETY: The first enqueue elected this thread; all nodes are alive.
        unsafe { combiner.combine_round(node_ptr(&nodes[0]), removed) };
        assert!(is_finished(&nodes[BACKLOG - 2]));
        assert_eq!(nodes[BACKLOG - 1].prev.load(Relaxed), node_ptr(&nodes[BACKLOG - 3]));

        // Round two: another capped batch whose out-of-band removal is the
        // repaired successor itself. The tail retreat must land on a live
        // node rather than resurrect the one removed a round earlier.
        let parked = combiner.try_takeover();
        assert_eq!(parked, node_ptr(&nodes[MAX_RUN]));
        let own = node_ptr(&nodes[BACKLOG - 1]);
        // SAFETY: Consuming the takeover slot transferred combining duty.
        unsafe { combiner.combine_round(parked, own) };

        assert!(combiner.is_idle());
        for node in &nodes {
            assert!(is_finished(node));
        }

        let log = combiner.lock().with(Log::clone);
        let mut expected: Log = (0..MAX_RUN).collect();
        expected.push(BACKLOG - 2);
        expected.extend(MAX_RUN..BACKLOG - 2);
        expected.push(BACKLOG - 1);
        assert_eq!(log, expected, "every operation must run exactly once");
    }

    #[test]
    fn acquisition_node_terminates_batch_with_direct_handoff() {
        let combiner: Combiner<Log, Yield> = Combiner::new(Vec::new());

        let mut first = Packet::new(|log: &mut Log| log.push(0));
        let mut second = Packet::new(|log: &mut Log| log.push(1));
        let mut fourth = Packet::new(|log: &mut Log| log.push(3));

        let n0 = make_node(&mut first, false);
        let n1 = make_node(&mut second, false);
        let raw: Box<Node<Log>> = Box::new(Node::new(true));
        let n3 = make_node(&mut fourth, false);

        assert!(combiner.enqueue(&n0));
        assert!(!combiner.enqueue(&n1));
        assert!(!combiner.enqueue(&raw));
        assert!(!combiner.enqueue(&n3));

        // SAFETY: The first enqueue elected this thread; all nodes are alive.
        unsafe { combiner.combine_round(node_ptr(&n0), ptr::null_mut()) };

        // The engine stopped before the operation-less node and handed the
        // lock straight to its owner, without executing anything past it.
        assert!(is_finished(&n0) && is_finished(&n1));
        assert!(!is_finished(&n3));
        match raw.completion.load(Relaxed) {
            Completion::Handoff(head) => assert_eq!(head, node_ptr(&raw)),
            other => panic!("expected a direct hand-off, got {other:?}"),
        }

        // The owner releases; the only pending submission is asynchronous,
        // so duty is parked rather than stored into a completion word.
        // SAFETY: The direct hand-off made this thread the lock holder.
        unsafe { combiner.advance_and_notify(node_ptr(&raw)) };
        assert!(is_finished(&raw));
        let parked = combiner.try_takeover();
        assert_eq!(parked, node_ptr(&n3));

        // SAFETY: Consuming the takeover slot transferred combining duty.
        unsafe { combiner.combine_round(parked, ptr::null_mut()) };
        assert!(combiner.is_idle());

        let log = combiner.lock().with(Log::clone);
        assert_eq!(log, [0, 1, 3]);
    }

    #[test]
    fn interior_removal_bridges_neighbours() {
        let combiner: Combiner<Log, Yield> = Combiner::new(Vec::new());

        let mut packets: Vec<_> =
            (0..3).map(|i| Packet::new(move |log: &mut Log| log.push(i))).collect();
        let mut nodes = Vec::with_capacity(3);
        for (i, packet) in packets.iter_mut().enumerate() {
            let node = make_node(packet, false);
            assert_eq!(combiner.enqueue(&node), i == 0);
            nodes.push(node);
        }

        // Remove the interior node, then drain the rest in one round.
        // SAFETY: The first enqueue elected this thread; the node is linked
        // and waiting.
        unsafe { combiner.remove_and_run(node_ptr(&nodes[1])) };
        assert!(is_finished(&nodes[1]));
        assert_eq!(nodes[2].prev.load(Relaxed), node_ptr(&nodes[0]));

        // SAFETY: Still the combiner; the backlog head is unprocessed.
        unsafe { combiner.combine_round(node_ptr(&nodes[0]), ptr::null_mut()) };
        assert!(combiner.is_idle());

        let log = combiner.lock().with(Log::clone);
        assert_eq!(log, [1, 0, 2]);
    }

    #[test]
    fn tail_removal_retreats_the_tail() {
        let combiner: Combiner<Log, Yield> = Combiner::new(Vec::new());

        let mut head = Packet::new(|log: &mut Log| log.push(0));
        let mut tail = Packet::new(|log: &mut Log| log.push(1));
        let n0 = make_node(&mut head, false);
        let n1 = make_node(&mut tail, false);

        assert!(combiner.enqueue(&n0));
        assert!(!combiner.enqueue(&n1));

        // SAFETY: The first enqueue elected this thread; the node is linked
        // and waiting.
        unsafe { combiner.remove_and_run(node_ptr(&n1)) };
        assert!(is_finished(&n1));

        // The queue now ends at the head node again.
        // SAFETY: Still the combiner; the backlog head is unprocessed.
        unsafe { combiner.combine_round(node_ptr(&n0), ptr::null_mut()) };
        assert!(combiner.is_idle());

        let log = combiner.lock().with(Log::clone);
        assert_eq!(log, [1, 0]);
    }
}
