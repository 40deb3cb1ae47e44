// bridges between channel land and the world outside the scheduler.
//
// both entry points validate registration synchronously and defer the
// actual queue submission to a scheduler turn.

use super::{
    chan::Chan,
    error::{Error, Result},
    instr::{Event, Instruction},
    sched::Scheduler,
    value::Value,
};
use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// Put one value from outside the scheduler.
///
/// With `close` set the channel closes once the value lands.
/// `on_delivered` fires at delivery time. Fails with
/// [`Error::Unregistered`] when the channel has no queue.
pub fn put_async(
    sched: &Scheduler,
    ch: &Chan,
    value: Value,
    close: bool,
    on_delivered: Option<Box<dyn FnOnce()>>,
) -> Result<()> {
    if !sched.is_registered(ch) {
        return Err(Error::Unregistered);
    }
    let mut slot = Some((value, on_delivered));
    let f: Box<dyn FnMut(Value) -> Option<Value>> = Box::new(move |_| {
        slot.take().map(|(value, cb)| {
            if let Some(cb) = cb {
                cb();
            }
            value
        })
    });
    let instr = if close {
        Instruction::callback_closing(Event::Put, ch.clone(), f)
    } else {
        Instruction::callback(Event::Put, ch.clone(), f)
    };
    sched.submit(instr);
    Ok(())
}

/// Take one value from outside the scheduler.
///
/// The returned future resolves once the queue delivers; a take on a
/// closed, empty channel resolves to [`Value::Closed`]. Fails with
/// [`Error::Unregistered`] when the channel has no queue.
pub fn take_async(sched: &Scheduler, ch: &Chan) -> Result<TakeFuture> {
    if !sched.is_registered(ch) {
        return Err(Error::Unregistered);
    }
    let shared = Rc::new(RefCell::new(TakeShared {
        value: None,
        waker: None,
        finished: false,
    }));
    let delivery = shared.clone();
    sched.submit(Instruction::callback(
        Event::Take,
        ch.clone(),
        Box::new(move |value| {
            let mut shared = delivery.borrow_mut();
            shared.value = Some(value);
            if let Some(waker) = shared.waker.take() {
                waker.wake();
            }
            None
        }),
    ));
    Ok(TakeFuture { shared })
}

struct TakeShared {
    value: Option<Value>,
    waker: Option<Waker>,
    finished: bool,
}

/// Pending result of [`take_async`].
pub struct TakeFuture {
    shared: Rc<RefCell<TakeShared>>,
}

impl TakeFuture {
    /// The delivered value, if any, without consuming the future.
    pub fn value(&self) -> Option<Value> {
        self.shared.borrow().value.clone()
    }
}

impl Future for TakeFuture {
    type Output = Value;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Value> {
        let mut shared = self.shared.borrow_mut();
        match shared.value.clone() {
            Some(value) => {
                shared.finished = true;
                Poll::Ready(value)
            }
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(feature = "futures")]
impl futures::future::FusedFuture for TakeFuture {
    fn is_terminated(&self) -> bool {
        self.shared.borrow().finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_the_bridge() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let fut = take_async(&sched, &ch).unwrap();
        put_async(&sched, &ch, Value::Int(3), false, None).unwrap();
        sched.run_until_idle();
        assert_eq!(fut.value(), Some(Value::Int(3)));
    }

    #[test]
    fn close_flag_closes_after_delivery() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        put_async(&sched, &ch, Value::Int(1), true, None).unwrap();
        sched.run_until_idle();
        assert!(ch.is_closed());
        assert_eq!(ch.last(), Value::Int(1));
    }

    #[test]
    fn delivery_callback_fires() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let fired = Rc::new(std::cell::Cell::new(false));
        let flag = fired.clone();
        put_async(
            &sched,
            &ch,
            Value::Int(1),
            false,
            Some(Box::new(move || flag.set(true))),
        )
        .unwrap();
        sched.run_until_idle();
        assert!(fired.get());
    }

    #[test]
    fn foreign_channel_is_unregistered() {
        let sched = Scheduler::new();
        let other = Scheduler::new();
        let ch = other.channel(1).unwrap();
        assert!(matches!(
            put_async(&sched, &ch, Value::Int(1), false, None),
            Err(Error::Unregistered)
        ));
        assert!(matches!(take_async(&sched, &ch), Err(Error::Unregistered)));
    }

    #[test]
    fn take_on_closed_channel_resolves_closed() {
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        ch.close();
        let fut = take_async(&sched, &ch).unwrap();
        sched.run_until_idle();
        assert_eq!(fut.value(), Some(Value::Closed));
        // once the flush retires the channel the bridge refuses it
        assert!(matches!(take_async(&sched, &ch), Err(Error::Unregistered)));
    }

    #[cfg(feature = "futures")]
    #[test]
    fn future_resolves_under_an_executor() {
        use futures::future::FusedFuture;
        let sched = Scheduler::new();
        let ch = sched.channel(1).unwrap();
        let fut = take_async(&sched, &ch).unwrap();
        put_async(&sched, &ch, Value::Int(8), false, None).unwrap();
        sched.run_until_idle();
        assert!(!fut.is_terminated());
        let value = futures::executor::block_on(fut);
        assert_eq!(value, Value::Int(8));
    }
}
