// SPDX-License-Identifier: MPL-2.0

//! The per-CPU ordered deadline queue.
//!
//! A `SpinLock`-guarded event list ordered by
//! deadline, periodic re-arm, and a wake-object payload alternative to
//! a plain callback.
//!
//! The hardware clock backing this module
//! ([`crate::arch::x86_64::timer`]) is a fixed-rate PIT square wave, not
//! a one-shot-armable source, so it is treated throughout as a
//! `SOFT`-typed hardware timer: [`reg`]/[`dereg`] never touch the
//! hardware, and [`on_tick`] (driven by every PIT interrupt) does the
//! tick-polling a `SOFT` timer requires.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

#[cfg(not(test))]
use spin::Once;

use crate::prelude::*;
use crate::sync::SpinLock;
use crate::time::current_clock;

bitflags::bitflags! {
    pub struct RegFlags: u32 {
        /// De-register the event first if it is already in use, instead
        /// of rejecting the call.
        const REG_DEREG    = 1 << 0;
        /// Re-insert the event after every expiry using the same delta.
        const REG_PERIODIC = 1 << 1;
    }
}

/// Something a timer event can wake on expiry, in place of a plain
/// callback. No scheduler exists in this kernel core, so this
/// is the full extent of the "wake" side: a caller-supplied hook run at
/// `IPL_TIMER`, not an actual blocking/wake primitive.
pub trait WaitObject: Send + Sync {
    /// Called with the timeout cause cleared, at `IPL_TIMER`.
    fn wake_timeout(&self);
}

enum Payload {
    None,
    Callback(Box<dyn Fn(usize) + Send + Sync>, usize),
    Wake(Arc<dyn WaitObject>),
}

struct EventInner {
    deadline: u64,
    delta: u64,
    payload: Payload,
    in_use: bool,
    periodic: bool,
}

/// One timer event.
pub struct TimerEvent {
    inner: SpinLock<EventInner>,
}

impl TimerEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::with_ipl(
                EventInner {
                    deadline: 0,
                    delta: 0,
                    payload: Payload::None,
                    in_use: false,
                    periodic: false,
                },
                crate::trap::ipl::IPL_TIMER,
            ),
        })
    }

    pub fn set_cb(self: &Arc<Self>, cb: impl Fn(usize) + Send + Sync + 'static, arg: usize) {
        self.inner.lock().payload = Payload::Callback(Box::new(cb), arg);
    }

    pub fn set_wake(self: &Arc<Self>, wait_obj: Arc<dyn WaitObject>) {
        self.inner.lock().payload = Payload::Wake(wait_obj);
    }

    pub fn is_in_use(&self) -> bool {
        self.inner.lock().in_use
    }

    fn deadline(&self) -> u64 {
        self.inner.lock().deadline
    }

    fn fire(&self) {
        let inner = self.inner.lock();
        match &inner.payload {
            Payload::Callback(cb, arg) => cb(*arg),
            Payload::Wake(wait_obj) => wait_obj.wake_timeout(),
            Payload::None => {}
        }
    }
}

struct EventList {
    /// Ascending by deadline; a `Vec` rather than a real priority queue
    /// since `MAX_CPUS` is 1 and the expected list length is small.
    events: Vec<Arc<TimerEvent>>,
}

impl EventList {
    fn insert(&mut self, event: Arc<TimerEvent>) {
        let deadline = event.deadline();
        let pos = self.events.partition_point(|e| e.deadline() <= deadline);
        self.events.insert(pos, event);
    }

    fn remove(&mut self, event: &Arc<TimerEvent>) {
        self.events.retain(|e| !Arc::ptr_eq(e, event));
    }
}

#[cfg(not(test))]
static EVENTS: Once<SpinLock<EventList>> = Once::new();

#[cfg(not(test))]
fn events() -> &'static SpinLock<EventList> {
    EVENTS.get().expect("timer event list not initialized")
}

/// Brings up the per-CPU event list. Must run once, before [`reg`] is
/// first called.
#[cfg(not(test))]
pub fn init() {
    EVENTS.call_once(|| SpinLock::with_ipl(EventList { events: Vec::new() }, crate::trap::ipl::IPL_TIMER));
}

// A single global list would let unrelated tests on cargo's test thread
// pool interleave their events, since every test in this module shares
// one process. Each host test thread gets its own list instead; the
// real kernel's one `EVENTS` per CPU already has that isolation for
// free.
#[cfg(test)]
std::thread_local! {
    static EVENTS_TL: &'static SpinLock<EventList> = Box::leak(Box::new(
        SpinLock::with_ipl(EventList { events: Vec::new() }, crate::trap::ipl::IPL_TIMER),
    ));
}

#[cfg(test)]
fn events() -> &'static SpinLock<EventList> {
    EVENTS_TL.with(|e| *e)
}

#[cfg(test)]
pub fn init() {}

/// Registers `event` to fire `delta` ticks from now. A `delta` of
/// zero is bumped to one tick so a freshly
/// registered event never collides with an already-expired deadline on
/// the same tick.
pub fn reg(event: Arc<TimerEvent>, delta: u64, flags: RegFlags) -> Result<()> {
    if event.is_in_use() {
        if flags.contains(RegFlags::REG_DEREG) {
            dereg(&event);
        } else {
            return Err(Error::InvalidArgs);
        }
    }
    let delta = delta.max(1);
    let deadline = current_clock() + delta;
    {
        let mut inner = event.inner.lock();
        inner.deadline = deadline;
        inner.delta = delta;
        inner.in_use = true;
        inner.periodic = flags.contains(RegFlags::REG_PERIODIC);
    }
    events().lock().insert(event);
    Ok(())
}

/// De-registers `event`, if it is still in the list. Safe against
/// already-expired events.
pub fn dereg(event: &Arc<TimerEvent>) {
    let mut inner = event.inner.lock();
    if !inner.in_use {
        return;
    }
    inner.in_use = false;
    drop(inner);
    events().lock().remove(event);
}

/// Called from the hardware tick interrupt. Walks the list from the
/// front, batching every event whose
/// deadline has been reached, firing each one and re-admitting periodic
/// events at their next deadline.
pub fn on_tick() {
    let now = current_clock();
    loop {
        let due = {
            let mut list = events().lock();
            let Some(head) = list.events.first().cloned() else {
                break;
            };
            if head.deadline() > now {
                break;
            }
            list.events.remove(0);
            head
        };

        let (periodic, delta) = {
            let inner = due.inner.lock();
            (inner.periodic, inner.delta)
        };
        due.fire();

        if periodic {
            let mut inner = due.inner.lock();
            inner.deadline += delta;
            drop(inner);
            events().lock().insert(due);
        } else {
            due.inner.lock().in_use = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn register(delta: u64, fired: &Arc<SpinLock<Vec<u64>>>) -> Arc<TimerEvent> {
        let event = TimerEvent::new();
        let fired = fired.clone();
        event.set_cb(move |_| fired.lock().push(delta), 0);
        reg(event.clone(), delta, RegFlags::empty()).unwrap();
        event
    }

    /// Deltas {50, 10, 30} registered in that
    /// order sort into ascending deadline order [10, 30, 50]; expiring
    /// the head fires exactly that event and exposes the next-soonest
    /// as the new head.
    #[test]
    fn events_fire_in_deadline_order() {
        init();
        let fired = Arc::new(SpinLock::new(Vec::new()));

        let e50 = register(50, &fired);
        let e10 = register(10, &fired);
        let e30 = register(30, &fired);

        let deadlines: Vec<u64> = events().lock().events.iter().map(|e| e.deadline()).collect();
        assert_eq!(deadlines, alloc::vec![10, 30, 50]);

        // Force the head due without waiting on the real hardware
        // clock: this crate's host test harness never ticks it.
        e10.inner.lock().deadline = current_clock();
        on_tick();
        assert_eq!(*fired.lock(), alloc::vec![10]);
        assert!(!e10.is_in_use());

        let deadlines: Vec<u64> = events().lock().events.iter().map(|e| e.deadline()).collect();
        assert_eq!(deadlines, alloc::vec![30, 50]);

        dereg(&e30);
        dereg(&e50);
        assert!(events().lock().events.is_empty());
    }

    #[test]
    fn periodic_event_rearms_at_delta_past_its_old_deadline() {
        init();
        let fired = Arc::new(SpinLock::new(Vec::new()));
        let event = TimerEvent::new();
        {
            let fired = fired.clone();
            event.set_cb(move |_| fired.lock().push(1), 0);
        }
        reg(event.clone(), 10, RegFlags::REG_PERIODIC).unwrap();
        let first_deadline = event.deadline();

        event.inner.lock().deadline = current_clock();
        on_tick();

        assert_eq!(*fired.lock(), alloc::vec![1]);
        assert!(event.is_in_use());
        assert_eq!(event.deadline(), first_deadline + 10);

        dereg(&event);
    }

    #[test]
    fn dereg_is_idempotent_and_reg_rejects_reuse_without_dereg_flag() {
        init();
        let event = TimerEvent::new();
        reg(event.clone(), 5, RegFlags::empty()).unwrap();

        assert!(reg(event.clone(), 5, RegFlags::empty()).is_err());
        reg(event.clone(), 5, RegFlags::REG_DEREG).unwrap();

        dereg(&event);
        assert!(!event.is_in_use());
        // Safe against an event that already expired or was never armed.
        dereg(&event);
    }
}
