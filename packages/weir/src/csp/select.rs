// racing channel operations.
//
// a select marks every arm channel with the alt flag, submits one alt
// instruction per arm, and lets them race through the normal queue
// machinery. the first arm to transfer a value wins: the shared race cell
// is set, all alt flags drop, and every other arm goes stale, never to
// consume a value. the outcome arrives on a dedicated return channel that
// yields exactly one value and closes.

use super::{
    chan::Chan,
    error::{Error, Result},
    instr::{Event, Instruction, Step, StepFn},
    sched::Scheduler,
    value::Value,
};
use std::{cell::RefCell, rc::Rc};

/// One operation in a select race.
#[derive(Debug, Clone)]
pub enum SelectArm {
    /// Offer a value; wins when the value lands in the channel's buffer.
    Put(Chan, Value),
    /// Wait for a value; wins when one is consumed.
    Take(Chan),
    /// Not raceable; rejected at construction. Use a
    /// [`timeout`](Scheduler::timeout) channel with a take arm instead.
    Sleep(Chan, u64),
}

struct Race {
    sched: Scheduler,
    chans: Vec<Chan>,
    ret: Chan,
    winner: RefCell<Option<Chan>>,
}

impl Race {
    fn won(&self) -> bool {
        self.winner.borrow().is_some()
    }

    // first transfer wins; everything else goes stale
    fn resolve(&self, winner: Chan, outcome: Value) {
        if self.won() {
            return;
        }
        trace!(winner = winner.id(), "select resolved");
        *self.winner.borrow_mut() = Some(winner);
        for ch in &self.chans {
            ch.set_alt_flag(false);
            // a channel that closed while claimed still owes its flush
            if ch.is_closed() {
                let ch = ch.clone();
                self.sched.defer(move |s| s.flush_channel(&ch));
            }
        }
        let mut slot = Some(outcome);
        self.sched.submit(Instruction::callback_closing(
            Event::Put,
            self.ret.clone(),
            Box::new(move |_| slot.take()),
        ));
    }
}

struct TakeArm {
    race: Rc<Race>,
    chan: Chan,
    done: bool,
}

impl StepFn for TakeArm {
    fn resume(&mut self, input: Value) -> Step {
        if self.done || self.race.won() {
            self.done = true;
            return Step::Done;
        }
        self.done = true;
        // a closed winner delivers its remembered final value
        let outcome = if input.is_closed() { self.chan.last() } else { input };
        self.race.resolve(self.chan.clone(), outcome);
        Step::Done
    }

    fn cancel(&mut self) {
        self.done = true;
    }

    fn stale(&self) -> bool {
        self.done || self.race.won()
    }
}

struct PutArm {
    race: Rc<Race>,
    chan: Chan,
    value: Option<Value>,
    done: bool,
}

impl StepFn for PutArm {
    fn resume(&mut self, _input: Value) -> Step {
        if self.done || self.race.won() {
            self.done = true;
            return Step::Done;
        }
        match self.value.take() {
            Some(value) => {
                // the queue stores the yielded value before anything else
                // can run, so the transfer is decided here
                self.race
                    .resolve(self.chan.clone(), Value::Chan(self.chan.clone()));
                Step::Yield(value)
            }
            None => {
                self.done = true;
                Step::Done
            }
        }
    }

    fn cancel(&mut self) {
        self.done = true;
    }

    fn stale(&self) -> bool {
        self.done || self.value.is_none() || self.race.won()
    }
}

impl Scheduler {
    /// Race the given arms; the outcome arrives on the returned channel,
    /// which delivers exactly one value and closes.
    ///
    /// A take win delivers the taken value; a put win delivers the winning
    /// channel as [`Value::Chan`]. Sleep arms are invalid.
    pub fn select(&self, arms: Vec<SelectArm>) -> Result<Chan> {
        if arms.iter().any(|arm| matches!(arm, SelectArm::Sleep(..))) {
            return Err(Error::InvalidSelectArm);
        }
        let ret = self.channel(1)?;
        // the outcome of a put win is a Chan value; deliver it as data
        ret.set_flatten(false);
        let chans: Vec<Chan> = arms
            .iter()
            .map(|arm| match arm {
                SelectArm::Put(ch, _) | SelectArm::Take(ch) => ch.clone(),
                SelectArm::Sleep(..) => unreachable!("rejected above"),
            })
            .collect();
        for ch in &chans {
            ch.set_alt_flag(true);
        }
        let race = Rc::new(Race {
            sched: self.clone(),
            chans,
            ret: ret.clone(),
            winner: RefCell::new(None),
        });
        for arm in arms {
            match arm {
                SelectArm::Take(ch) => {
                    let step = TakeArm { race: race.clone(), chan: ch.clone(), done: false };
                    self.submit(Instruction::step(Event::Take, ch, true, Box::new(step)));
                }
                SelectArm::Put(ch, value) => {
                    let step = PutArm {
                        race: race.clone(),
                        chan: ch.clone(),
                        value: Some(value),
                        done: false,
                    };
                    self.submit(Instruction::step(Event::Put, ch, true, Box::new(step)));
                }
                SelectArm::Sleep(..) => unreachable!("rejected above"),
            }
        }
        Ok(ret)
    }
}
