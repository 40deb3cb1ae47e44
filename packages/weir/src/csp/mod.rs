// implementation of the weir engine.
//
// the basic architecture is as such:
//
// channel handles wrap around Rc<shared state>
//                                  |
//          /-----------------------/
//          v
//       shared state
//          |
//          |------ it contains one buffer Policy (fixed / sliding / dropping),
//          |       each of which owns a RingBuffer<Value> and decides admission
//          |       and eviction
//          |
//          \------ it contains the closed / alt-flag / last-value bits that
//                  govern what `remove` and `last` report to a select race
//
// the Scheduler owns the registry associating each channel with its
// EventQueue: a ring of parked Instructions plus the current instruction
// type. the queue is the matching engine; everything it does is synchronous
// within one scheduler turn, except cross-channel re-queueing and process
// driver resumption, which go through the scheduler's deferred turn queue.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      ring<--------------------queue: the matching engine. parks, matches,
//                    |          ^      drains, flushes; home of every close-
//      buffer<-------|          |      propagation and backpressure rule.
//                    |          |
//      value<--------|          |
//                    |          |
//      instr<--------/          |
//                               |
//      sched<---+---------------+      (also home of the channel
//               |                       constructors and timeout)
//               |
//               +---------process: drives an op list one suspension point at
//               |                  a time through the queues.
//               |
//               +---------select: races arms through the same primitives and
//               |                 commits to one winner.
//               |
//               \---------api: async bridges (put_async / take_async).
//                              re-exported publically.
//
// there is also the error module, which contains the relevant error types,
// which is also re-exported publically.

pub(crate) mod api;
pub(crate) mod buffer;
pub(crate) mod chan;
pub(crate) mod error;
pub(crate) mod instr;
pub(crate) mod process;
pub(crate) mod queue;
pub(crate) mod ring;
pub(crate) mod sched;
pub(crate) mod select;
pub(crate) mod value;
