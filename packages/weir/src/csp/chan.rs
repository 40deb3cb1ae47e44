// channel handles and channel state.
//
// a Chan is a cheap clonable handle around Rc<shared state>; identity (for
// the registry and for value equality) is a numeric id. the buffer is only
// ever mutated from the owning queue's add path, but the state lives behind
// its own RefCell so the queue can interleave buffer access with user
// continuations without holding a borrow across them.

use super::{
    buffer::Policy,
    error::Result,
    sched::{SchedInner, Scheduler},
    value::Value,
};
use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    rc::{Rc, Weak},
};

/// One step of a channel transform
///
/// A transform runs over every value offered to [`Chan::add`] before it
/// reaches the buffer.
pub enum Xform {
    /// Store this value
    Emit(Value),
    /// Store nothing for this input
    Skip,
    /// Optionally store one final value, then close the channel
    Done(Option<Value>),
}

/// Transform step function attached to a channel.
pub type XformStep = Box<dyn FnMut(Value) -> anyhow::Result<Xform>>;

/// Handler for errors raised by a transform step; may substitute a value to
/// store in place of the failed input.
pub type XformErrorHandler = Box<dyn Fn(anyhow::Error) -> Option<Value>>;

struct XformState {
    step: XformStep,
    on_error: Option<XformErrorHandler>,
}

struct ChanState {
    buffer: Policy,
    // monotonic: once true, never false
    closed: bool,
    // true while a select race holds a pending claim on this channel
    alt_flag: bool,
    // the value that emptied the buffer; what a losing select arm can still
    // observe after close
    last_value: Value,
    // cleared on channels that carry Chan values as plain data (the select
    // return channel); the queue then delivers them instead of flattening
    flatten: bool,
    xform: Option<XformState>,
}

pub(crate) struct ChanShared {
    id: u64,
    sched: Weak<SchedInner>,
    state: RefCell<ChanState>,
}

/// Handle to a channel
///
/// Clonable and cheap; all clones refer to the same channel. Channels are
/// created through [`Scheduler::channel`](super::sched::Scheduler::channel)
/// and friends so that `close` can schedule its own queue flush.
#[derive(Clone)]
pub struct Chan {
    shared: Rc<ChanShared>,
}

impl Chan {
    pub(crate) fn new(
        id: u64,
        sched: Weak<SchedInner>,
        buffer: Policy,
        xform: Option<(XformStep, Option<XformErrorHandler>)>,
    ) -> Self {
        Chan {
            shared: Rc::new(ChanShared {
                id,
                sched,
                state: RefCell::new(ChanState {
                    buffer,
                    closed: false,
                    alt_flag: false,
                    last_value: Value::Closed,
                    flatten: true,
                    xform: xform.map(|(step, on_error)| XformState { step, on_error }),
                }),
            }),
        }
    }

    /// Numeric identity of this channel.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Offer a value to the channel's buffer.
    ///
    /// For a transformed channel the value first runs through the attached
    /// step function; a step signalling termination closes the channel. A
    /// step error goes to the channel's error handler, which may substitute
    /// a value. Fails only on buffer backpressure; such a failure is local
    /// and does not close the channel.
    pub fn add(&self, value: Value) -> Result<()> {
        // move the transform out so the user step runs without any state
        // borrow held
        let xform = self.shared.state.borrow_mut().xform.take();
        let Some(mut xform) = xform else {
            return self.shared.state.borrow_mut().buffer.add(value);
        };
        let outcome = (xform.step)(value);
        let result = match outcome {
            Ok(Xform::Emit(v)) => self.shared.state.borrow_mut().buffer.add(v),
            Ok(Xform::Skip) => Ok(()),
            Ok(Xform::Done(last)) => {
                let mut result = Ok(());
                if let Some(v) = last {
                    result = self.shared.state.borrow_mut().buffer.add(v);
                }
                self.shared.state.borrow_mut().xform = Some(xform);
                self.close();
                return result;
            }
            Err(e) => match &xform.on_error {
                Some(handler) => match handler(e) {
                    Some(v) => self.shared.state.borrow_mut().buffer.add(v),
                    None => Ok(()),
                },
                None => {
                    error!("error in channel transform: {:#}", e);
                    Ok(())
                }
            },
        };
        self.shared.state.borrow_mut().xform = Some(xform);
        result
    }

    /// Pop the oldest buffered value.
    ///
    /// The value that empties the buffer is remembered as the channel's
    /// last value. Returns [`Value::Closed`] when the channel is closed,
    /// the buffer is (now) empty, and no select race is holding the
    /// channel.
    pub fn remove(&self) -> Value {
        let mut state = self.shared.state.borrow_mut();
        let popped = state.buffer.remove();
        if state.buffer.count() == 0 {
            if let Some(v) = &popped {
                state.last_value = v.clone();
            }
        }
        if state.closed && state.buffer.count() == 0 && !state.alt_flag {
            return Value::Closed;
        }
        popped.unwrap_or(Value::Closed)
    }

    /// Pop for internal drains. Unlike [`remove`](Self::remove) this never
    /// substitutes the CLOSED sentinel, so the value that empties a closed
    /// channel is still yielded.
    pub(crate) fn drain_value(&self) -> Option<Value> {
        let mut state = self.shared.state.borrow_mut();
        let popped = state.buffer.remove();
        if state.buffer.count() == 0 {
            if let Some(v) = &popped {
                state.last_value = v.clone();
            }
        }
        popped
    }

    /// Peek the oldest buffered value without removing it.
    ///
    /// On an empty, closed channel that is a select participant this
    /// returns the remembered last value, so a losing select arm can still
    /// be inspected.
    pub fn last(&self) -> Value {
        let state = self.shared.state.borrow();
        if let Some(v) = state.buffer.last() {
            return v.clone();
        }
        if state.buffer.count() == 0
            && !state.last_value.is_closed()
            && state.closed
            && state.alt_flag
        {
            return state.last_value.clone();
        }
        Value::Closed
    }

    /// Close the channel. Idempotent.
    ///
    /// The first call flips `closed` and schedules a flush of the pending
    /// queue on the next scheduler turn.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        if let Some(inner) = self.shared.sched.upgrade() {
            let sched = Scheduler::from_inner(inner);
            if sched.is_registered(self) {
                let ch = self.clone();
                sched.defer(move |s| s.flush_channel(&ch));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().closed
    }

    pub fn count(&self) -> usize {
        self.shared.state.borrow().buffer.count()
    }

    pub fn is_full(&self) -> bool {
        self.shared.state.borrow().buffer.is_full()
    }

    pub fn alt_flag(&self) -> bool {
        self.shared.state.borrow().alt_flag
    }

    pub(crate) fn set_alt_flag(&self, alt: bool) {
        self.shared.state.borrow_mut().alt_flag = alt;
    }

    pub(crate) fn flattens(&self) -> bool {
        self.shared.state.borrow().flatten
    }

    pub(crate) fn set_flatten(&self, flatten: bool) {
        self.shared.state.borrow_mut().flatten = flatten;
    }
}

impl PartialEq for Chan {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Chan {}

impl Hash for Chan {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl Debug for Chan {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Chan")
            .field("id", &self.shared.id)
            .field("count", &state.buffer.count())
            .field("closed", &state.closed)
            .field("alt_flag", &state.alt_flag)
            .finish()
    }
}
