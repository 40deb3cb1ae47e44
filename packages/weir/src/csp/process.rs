// cooperative processes.
//
// a process is an ordered list of channel operations driven by an explicit
// state machine. the driver pops one op per scheduler turn, wraps it as a
// step instruction, and submits it to the target channel's queue; the step's
// completion defers the next driver turn. the only suspension point is an
// instruction parked in a queue.
//
// termination is kill: exhausting the op list kills the process, which
// delivers one `true` on the completion channel and closes it. `kill` is
// also externally callable and idempotent.

use super::{
    chan::Chan,
    instr::{Event, Instruction, Step, StepFn},
    sched::Scheduler,
    value::Value,
};
use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

enum OpKind {
    Put {
        chan: Chan,
        source: Box<dyn FnMut() -> Option<Value>>,
    },
    Take {
        chan: Chan,
        sink: Box<dyn FnMut(Value)>,
        pred: Option<Box<dyn Fn(&Value) -> bool>>,
    },
    Sleep {
        millis: u64,
    },
    Sub(Process),
}

/// One channel operation in a process's program.
pub struct Op {
    kind: OpKind,
}

impl Op {
    /// Put values drawn from `source` until it returns `None`.
    pub fn put(chan: Chan, source: impl FnMut() -> Option<Value> + 'static) -> Self {
        Op { kind: OpKind::Put { chan, source: Box::new(source) } }
    }

    /// Put a single value.
    pub fn put_value(chan: Chan, value: Value) -> Self {
        let mut slot = Some(value);
        Op::put(chan, move || slot.take())
    }

    /// Take one value and hand it to `sink`.
    pub fn take(chan: Chan, sink: impl FnMut(Value) + 'static) -> Self {
        Op { kind: OpKind::Take { chan, sink: Box::new(sink), pred: None } }
    }

    /// Take one value and discard it, for synchronization only.
    pub fn take_one(chan: Chan) -> Self {
        Op::take(chan, |_| {})
    }

    /// Take values until one satisfies `pred`, handing only that one to
    /// `sink`. Rejected values are consumed and dropped.
    pub fn take_filtered(
        chan: Chan,
        pred: impl Fn(&Value) -> bool + 'static,
        sink: impl FnMut(Value) + 'static,
    ) -> Self {
        Op {
            kind: OpKind::Take {
                chan,
                sink: Box::new(sink),
                pred: Some(Box::new(pred)),
            },
        }
    }

    /// Park the process for `millis` milliseconds.
    pub fn sleep(millis: u64) -> Self {
        Op { kind: OpKind::Sleep { millis } }
    }

    /// Run `child` to completion before continuing.
    pub fn sub(child: Process) -> Self {
        Op { kind: OpKind::Sub(child) }
    }
}

impl Debug for Op {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match &self.kind {
            OpKind::Put { .. } => "Put",
            OpKind::Take { .. } => "Take",
            OpKind::Sleep { .. } => "Sleep",
            OpKind::Sub(_) => "Sub",
        };
        f.write_str(name)
    }
}

struct ProcInner {
    sched: Scheduler,
    // popped from the end; stored in reverse submission order
    ops: RefCell<Vec<Op>>,
    started: Cell<bool>,
    killed: Cell<bool>,
    live: Cell<bool>,
    done: Chan,
    kill_hook: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// Handle to a process
///
/// Clonable; all clones drive the same process.
#[derive(Clone)]
pub struct Process {
    inner: Rc<ProcInner>,
}

impl Process {
    /// Build a process over `ops`, executed in the order given.
    pub fn new(sched: &Scheduler, mut ops: Vec<Op>) -> Self {
        ops.reverse();
        let done = sched
            .channel(1)
            .expect("internal bug: nonzero capacity");
        Process {
            inner: Rc::new(ProcInner {
                sched: sched.clone(),
                ops: RefCell::new(ops),
                started: Cell::new(false),
                killed: Cell::new(false),
                live: Cell::new(false),
                done,
                kill_hook: RefCell::new(None),
            }),
        }
    }

    /// Install a hook that runs once when the process is killed.
    pub fn on_kill(&self, hook: impl FnOnce() + 'static) {
        *self.inner.kill_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Start driving the process. A process runs at most once.
    pub fn run(&self) {
        if self.inner.started.replace(true) {
            return;
        }
        self.inner.live.set(true);
        self.schedule_step();
    }

    /// True from `run` until the completion value has been delivered.
    pub fn is_live(&self) -> bool {
        self.inner.live.get()
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.get()
    }

    /// Channel that delivers one `true` and closes when the process ends.
    pub fn completion_channel(&self) -> Chan {
        self.inner.done.clone()
    }

    /// Stop the process. Remaining ops are dropped, outstanding parked
    /// instructions go stale, the kill hook runs, and the completion
    /// channel delivers its final value. Idempotent.
    pub fn kill(&self) {
        if self.inner.killed.replace(true) {
            return;
        }
        trace!("killing process");
        self.inner.ops.borrow_mut().clear();
        let done = self.inner.done.clone();
        let inner = self.inner.clone();
        let mut slot = Some(Value::Bool(true));
        self.inner.sched.submit(Instruction::callback_closing(
            Event::Put,
            done,
            Box::new(move |_| {
                inner.live.set(false);
                slot.take()
            }),
        ));
        if let Some(hook) = self.inner.kill_hook.borrow_mut().take() {
            hook();
        }
    }

    fn schedule_step(&self) {
        let proc = self.clone();
        self.inner.sched.defer(move |_| proc.step());
    }

    // pop and submit the next op
    fn step(&self) {
        if self.inner.killed.get() {
            return;
        }
        let next = self.inner.ops.borrow_mut().pop();
        let Some(op) = next else {
            self.kill();
            return;
        };
        match op.kind {
            OpKind::Put { chan, source } => {
                let alt = chan.alt_flag();
                let step = PutStep { source, proc: self.clone(), finished: false };
                self.inner
                    .sched
                    .submit(Instruction::step(Event::Put, chan, alt, Box::new(step)));
            }
            OpKind::Take { chan, sink, pred } => {
                self.submit_take(chan, sink, pred);
            }
            OpKind::Sleep { millis } => {
                let ch = self
                    .inner
                    .sched
                    .channel(1)
                    .expect("internal bug: nonzero capacity");
                self.submit_take(ch.clone(), Box::new(|_| {}), None);
                self.inner.sched.defer_after(millis, move |s| {
                    let mut slot = Some(Value::Bool(true));
                    s.submit(Instruction::callback_closing(
                        Event::Put,
                        ch,
                        Box::new(move |_| slot.take()),
                    ));
                });
            }
            OpKind::Sub(child) => {
                child.run();
                self.submit_take(child.completion_channel(), Box::new(|_| {}), None);
            }
        }
    }

    fn submit_take(
        &self,
        chan: Chan,
        sink: Box<dyn FnMut(Value)>,
        pred: Option<Box<dyn Fn(&Value) -> bool>>,
    ) {
        let alt = chan.alt_flag();
        let step = TakeStep { sink, pred, proc: self.clone(), finished: false };
        self.inner
            .sched
            .submit(Instruction::step(Event::Take, chan, alt, Box::new(step)));
    }
}

impl Debug for Process {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Process")
            .field("ops", &self.inner.ops.borrow().len())
            .field("live", &self.inner.live.get())
            .field("killed", &self.inner.killed.get())
            .finish()
    }
}

struct PutStep {
    source: Box<dyn FnMut() -> Option<Value>>,
    proc: Process,
    finished: bool,
}

impl StepFn for PutStep {
    fn resume(&mut self, _input: Value) -> Step {
        if self.finished || self.proc.is_killed() {
            self.finished = true;
            return Step::Done;
        }
        match (self.source)() {
            Some(value) => Step::Yield(value),
            None => {
                self.finished = true;
                self.proc.schedule_step();
                Step::Done
            }
        }
    }

    fn cancel(&mut self) {
        if !self.finished {
            self.finished = true;
            // a closed channel does not stop the process
            if !self.proc.is_killed() {
                self.proc.schedule_step();
            }
        }
    }

    fn stale(&self) -> bool {
        self.finished || self.proc.is_killed()
    }
}

struct TakeStep {
    sink: Box<dyn FnMut(Value)>,
    pred: Option<Box<dyn Fn(&Value) -> bool>>,
    proc: Process,
    finished: bool,
}

impl StepFn for TakeStep {
    fn resume(&mut self, input: Value) -> Step {
        if self.finished || self.proc.is_killed() {
            self.finished = true;
            return Step::Done;
        }
        if input.is_closed() {
            self.finished = true;
            self.proc.schedule_step();
            return Step::Done;
        }
        if let Some(pred) = &self.pred {
            if !pred(&input) {
                // consumed and rejected; wait for the next value
                return Step::Yield(Value::Closed);
            }
        }
        (self.sink)(input);
        self.finished = true;
        self.proc.schedule_step();
        Step::Done
    }

    fn cancel(&mut self) {
        if !self.finished {
            self.finished = true;
            if !self.proc.is_killed() {
                self.proc.schedule_step();
            }
        }
    }

    fn stale(&self) -> bool {
        self.finished || self.proc.is_killed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn put_then_take_across_processes() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        let producer = Process::new(
            &sched,
            vec![
                Op::put_value(ch.clone(), Value::Int(1)),
                Op::put_value(ch.clone(), Value::Int(2)),
            ],
        );
        let consumer = Process::new(
            &sched,
            vec![
                Op::take(ch.clone(), {
                    let sink = sink.clone();
                    move |v| sink.borrow_mut().push(v)
                }),
                Op::take(ch.clone(), move |v| sink.borrow_mut().push(v)),
            ],
        );
        producer.run();
        consumer.run();
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Int(1), Value::Int(2)]);
        assert!(!producer.is_live());
        assert!(!consumer.is_live());
    }

    #[test]
    fn completion_channel_signals_once_and_closes() {
        let sched = Scheduler::new();
        let proc = Process::new(&sched, vec![]);
        proc.run();
        sched.run_until_idle();
        let done = proc.completion_channel();
        assert!(done.is_closed());
        assert_eq!(done.count(), 1);
        assert_eq!(done.last(), Value::Bool(true));
        assert!(!proc.is_live());
    }

    #[test]
    fn source_streams_until_exhausted() {
        let sched = Scheduler::new();
        let ch = sched.channel(8).unwrap();
        let mut next = 0;
        let proc = Process::new(
            &sched,
            vec![Op::put(ch.clone(), move || {
                next += 1;
                (next <= 5).then(|| Value::Int(next))
            })],
        );
        proc.run();
        sched.run_until_idle();
        assert_eq!(ch.count(), 5);
    }

    #[test]
    fn streaming_producer_completes_through_a_consumer() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        let mut next = 0;
        // capacity 1: the source is drained across several take-driven
        // refills, with the final resumption happening mid-refill
        let producer = Process::new(
            &sched,
            vec![Op::put(ch.clone(), move || {
                next += 1;
                (next <= 3).then(|| Value::Int(next))
            })],
        );
        let consumer = Process::new(
            &sched,
            vec![
                Op::take(ch.clone(), {
                    let sink = sink.clone();
                    move |v| sink.borrow_mut().push(v)
                }),
                Op::take(ch.clone(), {
                    let sink = sink.clone();
                    move |v| sink.borrow_mut().push(v)
                }),
                Op::take(ch.clone(), move |v| sink.borrow_mut().push(v)),
            ],
        );
        producer.run();
        consumer.run();
        sched.run_until_idle();
        assert_eq!(
            *out.borrow(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        assert!(!producer.is_live());
        assert!(!consumer.is_live());
    }

    #[test]
    fn sleep_parks_for_the_duration() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let proc = Process::new(
            &sched,
            vec![Op::sleep(25), Op::put_value(ch.clone(), Value::Int(1))],
        );
        let start = Instant::now();
        proc.run();
        sched.run_until_idle();
        assert!(start.elapsed().as_millis() >= 25);
        assert_eq!(ch.remove(), Value::Int(1));
    }

    #[test]
    fn sub_process_completes_before_parent_continues() {
        let sched = Scheduler::new();
        let ch = sched.channel(4).unwrap();
        let child = Process::new(&sched, vec![Op::put_value(ch.clone(), Value::Int(1))]);
        let parent = Process::new(
            &sched,
            vec![Op::sub(child), Op::put_value(ch.clone(), Value::Int(2))],
        );
        parent.run();
        sched.run_until_idle();
        assert_eq!(ch.remove(), Value::Int(1));
        assert_eq!(ch.remove(), Value::Int(2));
    }

    #[test]
    fn kill_drops_remaining_ops_and_runs_the_hook() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let hooked = Rc::new(Cell::new(false));
        let flag = hooked.clone();
        // the first op parks forever; the second must never run
        let proc = Process::new(
            &sched,
            vec![
                Op::take_one(ch.clone()),
                Op::put_value(ch.clone(), Value::Int(99)),
            ],
        );
        proc.on_kill(move || flag.set(true));
        proc.run();
        sched.run_until_idle();
        proc.kill();
        proc.kill();
        sched.run_until_idle();
        assert!(hooked.get());
        assert!(!proc.is_live());
        assert_eq!(ch.count(), 0);
    }

    #[test]
    fn take_filtered_skips_rejected_values() {
        let sched = Scheduler::new();
        let ch = sched.channel(4).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        let proc = Process::new(
            &sched,
            vec![Op::take_filtered(
                ch.clone(),
                |v| matches!(v, Value::Int(n) if *n % 2 == 0),
                move |v| sink.borrow_mut().push(v),
            )],
        );
        proc.run();
        let mut next = 0;
        let producer = Process::new(
            &sched,
            vec![Op::put(ch.clone(), move || {
                next += 1;
                (next <= 4).then(|| Value::Int(next))
            })],
        );
        producer.run();
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Int(2)]);
        // later values stay buffered for other consumers
        assert_eq!(ch.remove(), Value::Int(3));
    }
}
