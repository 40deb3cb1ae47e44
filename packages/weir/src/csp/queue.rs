// per-channel matching engine.
//
// every channel owns one EventQueue. all parked instructions in a queue
// share one event type (`current`); an instruction of the other type drains
// or serves the parked ones before it may park itself. serving is fully
// synchronous within a turn; the only deferred work is cross-channel
// redirection (a take following an inner channel) and the synthetic puts
// that flatten a closed inner channel's leftovers.
//
// two hard limits apply: MAX_DIRTY parked instructions (beyond which new
// same-type arrivals are cancelled outright) and the ring's MAX_QUEUE_SIZE
// growth ceiling.

use super::{
    chan::Chan,
    error::{Error, Result, MAX_DIRTY},
    instr::{Event, Fulfil, Instruction, PutState, Step, TakeState},
    ring::RingBuffer,
    sched::Scheduler,
    value::Value,
};
use smallvec::SmallVec;
use std::collections::VecDeque;

const INITIAL_PENDING: usize = 32;

/// Feed one round of a put instruction into the channel's buffer.
fn drain_to_chan(chan: &Chan, source: &mut Instruction) -> Result<PutState> {
    if source.event() != Event::Put {
        return Ok(PutState::NoPutDefault);
    }
    if chan.is_full() {
        return Ok(PutState::NoPutChanFull);
    }
    match source.fulfil_mut() {
        Fulfil::Callback { f, close } => {
            let close = *close;
            if let Some(value) = f(Value::Closed) {
                chan.add(value)?;
                if close {
                    chan.close();
                }
            }
            Ok(PutState::Done)
        }
        Fulfil::Step(step) => match step.resume(Value::Closed) {
            Step::Yield(value) => {
                chan.add(value)?;
                Ok(PutState::NotDone)
            }
            Step::Await | Step::Done => Ok(PutState::Done),
        },
    }
}

/// Offer the channel's oldest value to a take instruction.
///
/// A buffered value that is itself a channel is not delivered: an open one
/// redirects the take ([`TakeState::ChanValueOpen`]), a closed one is
/// flattened in place, its leftovers re-entering this channel as deferred
/// synthetic puts.
fn take_from_chan(sched: &Scheduler, chan: &Chan, sink: &mut Instruction) -> Result<TakeState> {
    if chan.count() == 0 && chan.last().is_closed() && !chan.is_closed() {
        return Ok(TakeState::NoTakeChanEmpty);
    }
    let value = chan.last();
    if let Value::Chan(inner) = &value {
        if chan.flattens() {
            if inner.is_closed() && !inner.alt_flag() {
                chan.remove();
                // raw drain: remove() would swallow the value that empties
                // the closed inner channel
                while let Some(leftover) = inner.drain_value() {
                    if !leftover.is_closed() {
                        let mut slot = Some(leftover);
                        sched.submit(Instruction::callback(
                            Event::Put,
                            chan.clone(),
                            Box::new(move |_| slot.take()),
                        ));
                    }
                }
                if chan.count() == 0 && chan.last().is_closed() && !chan.is_closed() {
                    return Ok(TakeState::NoTakeChanEmpty);
                }
                return Ok(TakeState::ChanValueClosed);
            }
            return Ok(TakeState::ChanValueOpen);
        }
    }
    match sink.fulfil_mut() {
        Fulfil::Callback { f, .. } => {
            f(value);
            Ok(TakeState::Done)
        }
        Fulfil::Step(step) => match step.resume(value) {
            Step::Done | Step::Await => Ok(TakeState::Done),
            Step::Yield(_) => Ok(TakeState::NotDone),
        },
    }
}

/// Move a take to the channel currently buffered at the front of `outer`.
fn requeue_to_inner(sched: &Scheduler, outer: &Chan, mut instr: Instruction) -> Result<()> {
    match outer.last() {
        Value::Chan(inner) => {
            instr.retarget(inner);
            sched.submit(instr);
            Ok(())
        }
        _ => Err(Error::Internal("redirect target is not a channel")),
    }
}

pub(crate) struct EventQueue {
    chan: Chan,
    pending: RingBuffer<Instruction>,
    current: Option<Event>,
}

impl EventQueue {
    pub(crate) fn new(chan: Chan) -> Self {
        EventQueue {
            chan,
            pending: RingBuffer::new(INITIAL_PENDING)
                .expect("internal bug: nonzero initial capacity"),
            current: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Submit an instruction against this queue's channel.
    pub(crate) fn add(&mut self, sched: &Scheduler, instr: Instruction) -> Result<()> {
        // a stale instruction must not consume a value
        if instr.stale() {
            instr.cancel();
            return Ok(());
        }
        if self.chan.is_closed() && !self.chan.alt_flag() {
            let serveable = instr.event() == Event::Take && self.chan.count() > 0;
            if !serveable {
                instr.cancel();
                return Ok(());
            }
        }
        // sleeps never park; the process driver owns the actual timer
        if instr.event() == Event::Sleep {
            instr.cancel();
            return Ok(());
        }
        match self.current {
            Some(cur) if cur == instr.event() => self.add_same(instr),
            None => self.add_idle(sched, instr),
            Some(_) => self.add_switch(sched, instr),
        }
    }

    // incoming instruction matches the parked type
    fn add_same(&mut self, mut instr: Instruction) -> Result<()> {
        if self.pending.len() >= MAX_DIRTY {
            trace!(chan = self.chan.id(), "dirty queue, cancelling instruction");
            instr.cancel();
            return Ok(());
        }
        if instr.event() != Event::Put {
            return self.pending.bounded_push_front(instr);
        }
        loop {
            match drain_to_chan(&self.chan, &mut instr)? {
                PutState::NotDone => continue,
                PutState::NoPutChanFull => return self.pending.bounded_push_front(instr),
                PutState::Done | PutState::NoPutDefault => return Ok(()),
            }
        }
    }

    // queue has no parked type
    fn add_idle(&mut self, sched: &Scheduler, instr: Instruction) -> Result<()> {
        while let Some(stray) = self.pending.pop_back() {
            stray.cancel();
        }
        match instr.event() {
            Event::Put => {
                let mut instr = instr;
                loop {
                    match drain_to_chan(&self.chan, &mut instr)? {
                        PutState::NotDone => continue,
                        PutState::NoPutChanFull => {
                            self.current = Some(Event::Put);
                            return self.pending.bounded_push_front(instr);
                        }
                        PutState::Done | PutState::NoPutDefault => return Ok(()),
                    }
                }
            }
            Event::Take => {
                let mut instr = instr;
                loop {
                    match take_from_chan(sched, &self.chan, &mut instr)? {
                        TakeState::Done => {
                            self.chan.remove();
                            return Ok(());
                        }
                        TakeState::NotDone => {
                            self.chan.remove();
                        }
                        TakeState::ChanValueClosed => {}
                        TakeState::ChanValueOpen => {
                            return requeue_to_inner(sched, &self.chan, instr);
                        }
                        TakeState::NoTakeChanEmpty => {
                            self.current = Some(Event::Take);
                            return self.pending.bounded_push_front(instr);
                        }
                    }
                }
            }
            Event::Sleep => unreachable!("sleeps are handled before dispatch"),
        }
    }

    // incoming instruction differs from the parked type
    fn add_switch(&mut self, sched: &Scheduler, instr: Instruction) -> Result<()> {
        if self.pending.is_empty() {
            self.current = None;
            return self.add_idle(sched, instr);
        }
        match instr.event() {
            Event::Put => self.put_over_takes(sched, instr),
            Event::Take => self.take_over_puts(sched, instr),
            Event::Sleep => unreachable!("sleeps are handled before dispatch"),
        }
    }

    // alternate filling the buffer from the incoming put and serving parked
    // takes, oldest first, one buffered value per take
    fn put_over_takes(&mut self, sched: &Scheduler, mut instr: Instruction) -> Result<()> {
        let mut done: SmallVec<[usize; 8]> = SmallVec::new();
        let mut redirect: SmallVec<[(usize, Chan); 2]> = SmallVec::new();
        let mut instr_done = false;
        loop {
            if !instr_done {
                loop {
                    match drain_to_chan(&self.chan, &mut instr)? {
                        PutState::NotDone => continue,
                        PutState::NoPutChanFull => break,
                        PutState::Done | PutState::NoPutDefault => {
                            instr_done = true;
                            break;
                        }
                    }
                }
            }
            let chan = self.chan.clone();
            let mut progressed = false;
            for (i, other) in self.pending.iter_mut().enumerate() {
                let settled = done.iter().any(|&d| d == i)
                    || redirect.iter().any(|&(d, _)| d == i);
                if settled {
                    continue;
                }
                if other.stale() {
                    done.push(i);
                    progressed = true;
                    continue;
                }
                match take_from_chan(sched, &chan, other)? {
                    TakeState::NoTakeChanEmpty => break,
                    TakeState::Done => {
                        chan.remove();
                        done.push(i);
                        progressed = true;
                    }
                    TakeState::NotDone => {
                        chan.remove();
                        progressed = true;
                    }
                    TakeState::ChanValueClosed => {
                        progressed = true;
                    }
                    TakeState::ChanValueOpen => {
                        match chan.last() {
                            Value::Chan(inner) => redirect.push((i, inner)),
                            _ => {
                                return Err(Error::Internal(
                                    "redirect target is not a channel",
                                ))
                            }
                        }
                        progressed = true;
                    }
                }
            }
            if done.len() + redirect.len() == self.pending.len() || !progressed {
                break;
            }
        }
        self.settle_pending(sched, &done, &mut redirect);
        if self.pending.is_empty() {
            if instr_done {
                self.current = None;
                Ok(())
            } else {
                self.current = Some(Event::Put);
                self.pending.bounded_push_front(instr)
            }
        } else if instr_done {
            Ok(())
        } else {
            Err(Error::Internal("parked takes remain with an unfinished put"))
        }
    }

    // feed the incoming take from the buffer, refilling from parked puts
    // whenever the buffer runs dry
    fn take_over_puts(&mut self, sched: &Scheduler, mut instr: Instruction) -> Result<()> {
        let mut done: SmallVec<[usize; 8]> = SmallVec::new();
        let mut redirect: SmallVec<[(usize, Chan); 2]> = SmallVec::new();
        let mut instr_done = false;
        let mut follow: Option<Chan> = None;
        loop {
            let mark = (done.len(), self.chan.count());
            match take_from_chan(sched, &self.chan, &mut instr)? {
                TakeState::ChanValueOpen => {
                    match self.chan.last() {
                        Value::Chan(inner) => follow = Some(inner),
                        _ => return Err(Error::Internal("redirect target is not a channel")),
                    }
                    instr_done = true;
                }
                TakeState::Done => {
                    self.chan.remove();
                    instr_done = true;
                }
                TakeState::NotDone => {
                    self.chan.remove();
                }
                TakeState::ChanValueClosed => {}
                TakeState::NoTakeChanEmpty => {
                    let chan = self.chan.clone();
                    for (i, other) in self.pending.iter_mut().enumerate() {
                        if done.iter().any(|&d| d == i) {
                            continue;
                        }
                        if other.stale() {
                            done.push(i);
                            continue;
                        }
                        // run the put to exhaustion or a full buffer, so a
                        // step that yielded its last value still observes
                        // the end of its source
                        let mut finished = false;
                        loop {
                            match drain_to_chan(&chan, other)? {
                                PutState::NotDone => continue,
                                PutState::Done | PutState::NoPutDefault => {
                                    finished = true;
                                    break;
                                }
                                PutState::NoPutChanFull => break,
                            }
                        }
                        if finished {
                            done.push(i);
                        }
                        if chan.is_full() {
                            break;
                        }
                    }
                }
            }
            if instr_done {
                break;
            }
            // every parked put exhausted and nothing buffered: the take
            // must park
            if done.len() == self.pending.len() && self.chan.count() == 0 {
                break;
            }
            if (done.len(), self.chan.count()) == mark {
                return Err(Error::Internal("take over parked puts made no progress"));
            }
        }
        self.settle_pending(sched, &done, &mut redirect);
        if let Some(inner) = follow {
            instr.retarget(inner);
            sched.submit(instr);
            if self.pending.is_empty() {
                self.current = None;
            }
            return Ok(());
        }
        if instr_done {
            if self.pending.is_empty() {
                self.current = None;
            }
            Ok(())
        } else if self.pending.is_empty() {
            self.current = Some(Event::Take);
            self.pending.bounded_push_front(instr)
        } else {
            Err(Error::Internal("parked puts remain with an unserved take"))
        }
    }

    // drop served instructions, hand redirected ones to their new queue,
    // keep the rest parked in order
    fn settle_pending(
        &mut self,
        sched: &Scheduler,
        done: &SmallVec<[usize; 8]>,
        redirect: &mut SmallVec<[(usize, Chan); 2]>,
    ) {
        if redirect.is_empty() {
            self.pending.cleanup(|_, i| !done.iter().any(|&d| d == i));
            return;
        }
        let total = self.pending.len();
        for i in 0..total {
            let Some(mut parked) = self.pending.pop_back() else {
                break;
            };
            if let Some(pos) = redirect.iter().position(|&(d, _)| d == i) {
                let (_, inner) = redirect.swap_remove(pos);
                parked.retarget(inner);
                sched.submit(parked);
            } else if done.iter().any(|&d| d == i) {
                drop(parked);
            } else {
                self.pending.push_front(parked);
            }
        }
    }

    /// Tear the queue down after its channel closed.
    ///
    /// Returns whether the channel can leave the registry (nothing
    /// buffered, nothing parked, no select claim).
    pub(crate) fn flush(&mut self, sched: &Scheduler) -> Result<bool> {
        if !self.chan.is_closed() {
            self.chan.close();
        }
        let stale = self.pending.iter().filter(|p| p.stale()).count();
        debug!(chan = self.chan.id(), parked = self.pending.len(), stale, "flushing queue");
        match self.current.take() {
            Some(Event::Take) => self.flush_takes(sched)?,
            _ => {
                while let Some(parked) = self.pending.pop_back() {
                    parked.cancel();
                }
            }
        }
        Ok(self.chan.count() == 0 && self.pending.is_empty() && !self.chan.alt_flag())
    }

    // distribute remaining buffered values to parked takes, then let the
    // leftovers observe the close
    fn flush_takes(&mut self, sched: &Scheduler) -> Result<()> {
        let mut parked: VecDeque<Instruction> = self.pending.drain().into();
        while self.chan.count() > 0 {
            let Some(mut p) = parked.pop_front() else {
                break;
            };
            if p.stale() {
                p.cancel();
                continue;
            }
            if p.chan() != &self.chan {
                // a take redistributed here by another flush goes home, or
                // observes its own channel's close
                if p.chan().is_closed() && p.chan().count() == 0 {
                    p.cancel();
                } else {
                    sched.submit(p);
                }
                continue;
            }
            match take_from_chan(sched, &self.chan, &mut p)? {
                TakeState::Done => {
                    self.chan.remove();
                }
                TakeState::NotDone => {
                    self.chan.remove();
                    parked.push_front(p);
                }
                TakeState::ChanValueClosed => {
                    parked.push_front(p);
                }
                TakeState::ChanValueOpen => match self.chan.last() {
                    Value::Chan(inner) => {
                        self.chan.remove();
                        p.retarget(inner.clone());
                        sched.submit(p);
                        for mut rest in parked.drain(..) {
                            rest.retarget(inner.clone());
                            sched.submit(rest);
                        }
                    }
                    _ => return Err(Error::Internal("redirect target is not a channel")),
                },
                TakeState::NoTakeChanEmpty => {
                    parked.push_front(p);
                    break;
                }
            }
        }
        for mut p in parked {
            let own = p.chan() == &self.chan;
            if own && p.alt() && !p.stale() {
                // an alt take observes the close as a transfer of Closed
                take_from_chan(sched, &self.chan, &mut p)?;
                continue;
            }
            if own || (p.chan().is_closed() && p.chan().count() == 0) {
                p.cancel();
            } else {
                sched.submit(p);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csp::buffer::Policy;
    use std::{cell::RefCell, rc::Rc};

    fn put(ch: &Chan, value: Value) -> Instruction {
        let mut slot = Some(value);
        Instruction::callback(Event::Put, ch.clone(), Box::new(move |_| slot.take()))
    }

    fn take(ch: &Chan, out: &Rc<RefCell<Vec<Value>>>) -> Instruction {
        let out = out.clone();
        Instruction::callback(
            Event::Take,
            ch.clone(),
            Box::new(move |v| {
                out.borrow_mut().push(v);
                None
            }),
        )
    }

    #[test]
    fn puts_then_takes_deliver_fifo() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            sched.submit(put(&ch, Value::Int(i)));
        }
        for _ in 0..3 {
            sched.submit(take(&ch, &out));
        }
        sched.run_until_idle();
        assert_eq!(
            *out.borrow(),
            vec![Value::Int(0), Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn takes_park_until_a_put_arrives() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        sched.submit(take(&ch, &out));
        sched.run_until_idle();
        assert!(out.borrow().is_empty());
        sched.submit(put(&ch, Value::Int(9)));
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Int(9)]);
    }

    #[test]
    fn take_on_closed_empty_channel_observes_closed() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        ch.close();
        let out = Rc::new(RefCell::new(Vec::new()));
        sched.submit(take(&ch, &out));
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Closed]);
    }

    #[test]
    fn close_drains_buffer_to_parked_takes_then_closes_the_rest() {
        let sched = Scheduler::new();
        let ch = sched.channel(2).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        sched.submit(put(&ch, Value::Int(1)));
        sched.run_until_idle();
        for _ in 0..3 {
            sched.submit(take(&ch, &out));
        }
        sched.run_until_idle();
        // one take served from the buffer, two still parked
        assert_eq!(*out.borrow(), vec![Value::Int(1)]);
        ch.close();
        sched.run_until_idle();
        assert_eq!(
            *out.borrow(),
            vec![Value::Int(1), Value::Closed, Value::Closed]
        );
        assert!(!sched.is_registered(&ch));
    }

    #[test]
    fn dirty_queue_cancels_excess_instructions() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..(MAX_DIRTY + 1) {
            sched.submit(take(&ch, &out));
        }
        sched.run_until_idle();
        // the overflow take was cancelled with Closed, the rest are parked
        assert_eq!(*out.borrow(), vec![Value::Closed]);
        let queue = sched.queue_of(&ch).unwrap();
        assert_eq!(queue.borrow().pending_len(), MAX_DIRTY);
    }

    #[test]
    fn closed_inner_channel_is_flattened() {
        let sched = Scheduler::new();
        let outer = sched.channel(1).unwrap();
        let inner = sched.channel_with(Policy::fixed(4).unwrap());
        inner.add(Value::Int(10)).unwrap();
        inner.add(Value::Int(20)).unwrap();
        inner.close();
        let out = Rc::new(RefCell::new(Vec::new()));
        sched.submit(put(&outer, Value::Chan(inner)));
        sched.submit(take(&outer, &out));
        sched.submit(take(&outer, &out));
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Int(10), Value::Int(20)]);
    }

    #[test]
    fn open_inner_channel_redirects_the_take() {
        let sched = Scheduler::new();
        let outer = sched.channel(1).unwrap();
        let inner = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        sched.submit(put(&outer, Value::Chan(inner.clone())));
        sched.submit(take(&outer, &out));
        sched.run_until_idle();
        // the take now waits on the inner channel
        assert!(out.borrow().is_empty());
        sched.submit(put(&inner, Value::Int(5)));
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Int(5)]);
    }

    #[test]
    fn put_on_closed_channel_is_dropped() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        ch.close();
        sched.run_until_idle();
        sched.submit(put(&ch, Value::Int(1)));
        sched.run_until_idle();
        assert_eq!(ch.count(), 0);
    }

    #[test]
    fn last_parked_put_reaches_a_waiting_take() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        sched.submit(put(&ch, Value::Int(1)));
        sched.submit(put(&ch, Value::Int(2)));
        sched.run_until_idle();
        sched.submit(take(&ch, &out));
        sched.submit(take(&ch, &out));
        sched.run_until_idle();
        assert_eq!(*out.borrow(), vec![Value::Int(1), Value::Int(2)]);
        // nothing buffered and nothing parked once both sides are settled
        assert_eq!(ch.count(), 0);
        assert_eq!(sched.queue_of(&ch).unwrap().borrow().pending_len(), 0);
    }

    #[test]
    fn parked_puts_serve_a_later_take_in_order() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let out = Rc::new(RefCell::new(Vec::new()));
        // capacity 1: the first put lands, the rest park
        for i in 0..4 {
            sched.submit(put(&ch, Value::Int(i)));
        }
        sched.run_until_idle();
        assert_eq!(ch.count(), 1);
        for _ in 0..4 {
            sched.submit(take(&ch, &out));
        }
        sched.run_until_idle();
        assert_eq!(
            *out.borrow(),
            vec![Value::Int(0), Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }
}
