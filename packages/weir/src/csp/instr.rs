// pending operations parked in a channel's event queue.
//
// an Instruction pairs an event kind with the continuation to run when the
// queue can serve it. continuations come in two shapes: a plain callback
// (the async bridge, select resolution, internal plumbing) and a resumable
// step function (a process mid-run).

use super::{chan::Chan, value::Value};
use std::fmt::{self, Debug, Formatter};

/// What a pending instruction wants to do to its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Put,
    Take,
    Sleep,
}

/// Outcome of resuming a [`StepFn`].
pub enum Step {
    /// The step produced a value to hand to its channel.
    Yield(Value),
    /// The step parked itself elsewhere; the current queue is done with it.
    Await,
    /// The step finished.
    Done,
}

/// A resumable continuation, the driver side of a suspended process.
pub trait StepFn {
    /// Feed the step one input and run it to its next suspension point.
    fn resume(&mut self, input: Value) -> Step;

    /// Abandon the step; it will never be resumed.
    fn cancel(&mut self);

    /// True when the step no longer wants a value, typically because
    /// another arm of its select already won. Stale instructions are
    /// discarded without consuming anything.
    fn stale(&self) -> bool {
        false
    }
}

pub(crate) enum Fulfil {
    Callback {
        f: Box<dyn FnMut(Value) -> Option<Value>>,
        /// close the channel after a put delivers
        close: bool,
    },
    Step(Box<dyn StepFn>),
}

/// One parked operation.
pub struct Instruction {
    event: Event,
    chan: Chan,
    // set when the instruction belongs to a select race
    alt: bool,
    fulfil: Fulfil,
}

impl Instruction {
    pub(crate) fn callback(
        event: Event,
        chan: Chan,
        f: Box<dyn FnMut(Value) -> Option<Value>>,
    ) -> Self {
        Instruction { event, chan, alt: false, fulfil: Fulfil::Callback { f, close: false } }
    }

    /// Callback instruction whose successful put also closes the channel.
    pub(crate) fn callback_closing(
        event: Event,
        chan: Chan,
        f: Box<dyn FnMut(Value) -> Option<Value>>,
    ) -> Self {
        Instruction { event, chan, alt: false, fulfil: Fulfil::Callback { f, close: true } }
    }

    pub(crate) fn step(event: Event, chan: Chan, alt: bool, step: Box<dyn StepFn>) -> Self {
        Instruction { event, chan, alt, fulfil: Fulfil::Step(step) }
    }

    pub(crate) fn event(&self) -> Event {
        self.event
    }

    pub(crate) fn chan(&self) -> &Chan {
        &self.chan
    }

    pub(crate) fn alt(&self) -> bool {
        self.alt
    }

    /// Redirect the instruction at a different channel, as when a take on a
    /// channel-of-channels follows the inner channel. An alt marker carries
    /// over; the new target's flag can only add to it.
    pub(crate) fn retarget(&mut self, chan: Chan) {
        self.alt = self.alt || chan.alt_flag();
        self.chan = chan;
    }

    pub(crate) fn stale(&self) -> bool {
        match &self.fulfil {
            Fulfil::Callback { .. } => false,
            Fulfil::Step(step) => step.stale(),
        }
    }

    pub(crate) fn fulfil_mut(&mut self) -> &mut Fulfil {
        &mut self.fulfil
    }

    /// Tear the instruction down without serving it. Callbacks observe a
    /// final `Closed`; steps are cancelled.
    pub(crate) fn cancel(mut self) {
        match &mut self.fulfil {
            Fulfil::Callback { f, .. } => {
                let _ = f(Value::Closed);
            }
            Fulfil::Step(step) => step.cancel(),
        }
    }
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let kind = match self.fulfil {
            Fulfil::Callback { .. } => "callback",
            Fulfil::Step(_) => "step",
        };
        f.debug_struct("Instruction")
            .field("event", &self.event)
            .field("chan", &self.chan.id())
            .field("alt", &self.alt)
            .field("fulfil", &kind)
            .finish()
    }
}

/// Result of trying to serve a put instruction against its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutState {
    /// Callback produced no value; nothing was stored.
    NoPutDefault,
    /// The channel refused the value; the put must park.
    NoPutChanFull,
    /// The value landed and the continuation is finished.
    Done,
    /// The value landed but the step suspended again on the same event.
    NotDone,
}

/// Result of trying to serve a take instruction against its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TakeState {
    /// The taken value was an already-closed inner channel; it was drained
    /// in place and the take continues.
    ChanValueClosed,
    /// The taken value was an open inner channel; the take moved there.
    ChanValueOpen,
    /// A value was delivered and the continuation is finished.
    Done,
    /// A value was delivered but the step suspended again on the same event.
    NotDone,
    /// Nothing to take; the take must park.
    NoTakeChanEmpty,
}
