// the cooperative scheduler.
//
// all channel activity happens on scheduler turns: a task is deferred onto
// the turn queue and runs when `tick` or `run_until_idle` drains it. timers
// are a seq-tiebroken min-heap of deferred tasks; firing a timer just moves
// its task onto the turn queue. the registry maps channel ids to their
// event queues, which is the single place a parked instruction can live.
//
// the turn queue is the reentrancy boundary. every outside entry point
// (async bridges, close flushes, cross-channel requeues, process resumes)
// defers instead of touching a queue directly, so queue state is only ever
// borrowed from inside a turn.

use super::{
    buffer::Policy,
    chan::{Chan, XformErrorHandler, XformStep},
    error::Error,
    instr::Instruction,
    queue::EventQueue,
};
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

pub(crate) type Task = Box<dyn FnOnce(&Scheduler)>;

struct TimerEntry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed, so the max-heap pops the earliest deadline first
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct SchedInner {
    registry: RefCell<HashMap<u64, Rc<RefCell<EventQueue>>>>,
    turns: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    next_chan_id: Cell<u64>,
    next_timer_seq: Cell<u64>,
}

/// Single-threaded cooperative scheduler
///
/// Owns every channel's event queue and the turn queue that serializes all
/// work against them. Clonable handle; clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Rc::new(SchedInner {
                registry: RefCell::new(HashMap::new()),
                turns: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                next_chan_id: Cell::new(1),
                next_timer_seq: Cell::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SchedInner>) -> Self {
        Scheduler { inner }
    }

    pub(crate) fn downgrade(&self) -> std::rc::Weak<SchedInner> {
        Rc::downgrade(&self.inner)
    }

    // channel constructors

    /// Create a channel with a fixed buffer of capacity `n`.
    pub fn channel(&self, n: usize) -> super::error::Result<Chan> {
        Ok(self.channel_with(Policy::fixed(n)?))
    }

    /// Create a channel with the given buffer policy.
    pub fn channel_with(&self, buffer: Policy) -> Chan {
        self.register(buffer, None)
    }

    /// Create a channel whose puts run through a transform step.
    pub fn channel_xform(
        &self,
        buffer: Policy,
        step: XformStep,
        on_error: Option<XformErrorHandler>,
    ) -> Chan {
        self.register(buffer, Some((step, on_error)))
    }

    /// Create a channel that closes itself after `millis` milliseconds.
    pub fn timeout(&self, millis: u64) -> Chan {
        let buffer = Policy::fixed(1).expect("internal bug: nonzero capacity");
        let ch = self.channel_with(buffer);
        let timed = ch.clone();
        self.defer_after(millis, move |_| timed.close());
        ch
    }

    fn register(
        &self,
        buffer: Policy,
        xform: Option<(XformStep, Option<XformErrorHandler>)>,
    ) -> Chan {
        let id = self.inner.next_chan_id.get();
        self.inner.next_chan_id.set(id + 1);
        let ch = Chan::new(id, self.downgrade(), buffer, xform);
        let queue = Rc::new(RefCell::new(EventQueue::new(ch.clone())));
        self.inner.registry.borrow_mut().insert(id, queue);
        ch
    }

    // registry

    pub fn is_registered(&self, ch: &Chan) -> bool {
        self.inner.registry.borrow().contains_key(&ch.id())
    }

    pub(crate) fn queue_of(&self, ch: &Chan) -> Option<Rc<RefCell<EventQueue>>> {
        self.inner.registry.borrow().get(&ch.id()).cloned()
    }

    pub(crate) fn unregister(&self, ch: &Chan) {
        self.inner.registry.borrow_mut().remove(&ch.id());
    }

    // turn queue

    /// Run `task` on a later turn.
    pub(crate) fn defer(&self, task: impl FnOnce(&Scheduler) + 'static) {
        self.inner.turns.borrow_mut().push_back(Box::new(task));
    }

    /// Run `task` once `millis` milliseconds have elapsed.
    pub(crate) fn defer_after(&self, millis: u64, task: impl FnOnce(&Scheduler) + 'static) {
        let seq = self.inner.next_timer_seq.get();
        self.inner.next_timer_seq.set(seq + 1);
        self.inner.timers.borrow_mut().push(TimerEntry {
            due: Instant::now() + Duration::from_millis(millis),
            seq,
            task: Box::new(task),
        });
    }

    /// Submit an instruction to its channel's queue on a later turn. An
    /// instruction whose channel has left the registry by then is
    /// cancelled, observing `Closed`.
    pub(crate) fn submit(&self, instr: Instruction) {
        self.defer(move |s| match s.queue_of(instr.chan()) {
            Some(queue) => {
                let result = queue.borrow_mut().add(s, instr);
                s.log_queue_result(result);
            }
            None => instr.cancel(),
        });
    }

    /// Flush a channel's queue after it closed, unregistering the channel
    /// once nothing remains parked on it.
    pub(crate) fn flush_channel(&self, ch: &Chan) {
        let Some(queue) = self.queue_of(ch) else {
            return;
        };
        let result = queue.borrow_mut().flush(self);
        match result {
            Ok(retire) => {
                if retire {
                    self.unregister(ch);
                }
            }
            Err(e) => self.log_queue_result(Err(e)),
        }
    }

    fn log_queue_result(&self, result: super::error::Result<()>) {
        match result {
            Ok(()) => {}
            Err(Error::Internal(msg)) => panic!("queue invariant violated: {}", msg),
            Err(e) => warn!(%e, "queue rejected instruction"),
        }
    }

    // driving

    /// Run every task currently on the turn queue. Tasks deferred while the
    /// batch runs wait for the next tick. Returns whether anything ran.
    pub fn tick(&self) -> bool {
        let batch = std::mem::take(&mut *self.inner.turns.borrow_mut());
        let ran = !batch.is_empty();
        for task in batch {
            task(self);
        }
        ran
    }

    /// Drain turns and timers until both are empty, sleeping through timer
    /// gaps. Parked instructions waiting on outside input do not count as
    /// work, so a scheduler with only parked queues goes idle.
    pub fn run_until_idle(&self) {
        loop {
            self.fire_due_timers();
            if self.tick() {
                continue;
            }
            let Some(due) = self.next_deadline() else {
                return;
            };
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        loop {
            let fired = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.due <= now => timers.pop(),
                    _ => None,
                }
            };
            match fired {
                Some(entry) => self.inner.turns.borrow_mut().push_back(entry.task),
                None => return,
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.timers.borrow().peek().map(|entry| entry.due)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csp::value::Value;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn tick_runs_one_batch() {
        let sched = Scheduler::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        sched.defer(move |s| {
            c.set(c.get() + 1);
            let c2 = c.clone();
            // deferred from inside a turn: lands in the next batch
            s.defer(move |_| c2.set(c2.get() + 10));
        });
        assert!(sched.tick());
        assert_eq!(count.get(), 1);
        assert!(sched.tick());
        assert_eq!(count.get(), 11);
        assert!(!sched.tick());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (ms, tag) in [(20u64, 2), (5, 1), (20, 3)] {
            let o = order.clone();
            sched.defer_after(ms, move |_| o.borrow_mut().push(tag));
        }
        sched.run_until_idle();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn timeout_channel_closes() {
        let sched = Scheduler::new();
        let ch = sched.timeout(5);
        assert!(!ch.is_closed());
        sched.run_until_idle();
        assert!(ch.is_closed());
        assert_eq!(ch.remove(), Value::Closed);
    }

    #[test]
    fn channels_get_distinct_ids() {
        let sched = Scheduler::new();
        let a = sched.channel(1).unwrap();
        let b = sched.channel(1).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert!(sched.is_registered(&a));
        assert!(sched.is_registered(&b));
    }
}
