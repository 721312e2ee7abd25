use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use bitflags::bitflags;

use omx_api::event::{Event, EventType, WaitStatus};
use omx_api::{Error, RECVQ_ENTRY_SIZE};

use crate::counter::{Counter, Counters};
use crate::pages::Pages;
use crate::wrap_index;

bitflags! {
    /// Conditions the lower layer raises for the application to notice.
    #[derive(Default)]
    pub struct DescStatus: u32 {
        const EXP_EVENTQ_FULL = 1 << 0;
        const UNEXP_EVENTQ_FULL = 1 << 1;
    }
}

struct EventSlot {
    tag: AtomicU8,
    body: spin::Mutex<Event>,
}

struct EventRing {
    slots: Box<[EventSlot]>,
}

impl EventRing {
    fn new(entries: usize) -> Self {
        assert!(
            entries.is_power_of_two(),
            "event ring size {} is not a power of two",
            entries
        );
        let slots = (0..entries)
            .map(|_| EventSlot {
                tag: AtomicU8::new(EventType::None as u8),
                body: spin::Mutex::new(Event::None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        EventRing { slots }
    }

    #[inline]
    fn cap(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: u64) -> &EventSlot {
        &self.slots[wrap_index(index, self.cap())]
    }

    #[inline]
    fn is_free(&self, index: u64) -> bool {
        self.slot(index).tag.load(Ordering::Acquire) == EventType::None as u8
    }

    /// Stores the body first, then flips the tag so the reader never sees a half
    /// written event.
    fn publish(&self, index: u64, event: Event) {
        let ty = event.event_type();
        assert_ne!(ty, EventType::None, "publishing an empty event");
        let slot = self.slot(index);
        assert_eq!(
            slot.tag.load(Ordering::Acquire),
            EventType::None as u8,
            "event slot {} overwritten before being consumed",
            index
        );
        *slot.body.lock() = event;
        slot.tag.store(ty as u8, Ordering::Release);
    }

    fn peek(&self, index: u64) -> Option<Event> {
        let slot = self.slot(index);
        let tag = EventType::from_tag(slot.tag.load(Ordering::Acquire));
        if tag == EventType::None {
            return None;
        }
        let event = *slot.body.lock();
        assert_eq!(event.event_type(), tag, "event slot {} torn", index);
        Some(event)
    }

    fn release(&self, index: u64) {
        let slot = self.slot(index);
        assert_ne!(
            slot.tag.load(Ordering::Acquire),
            EventType::None as u8,
            "releasing event slot {} twice",
            index
        );
        *slot.body.lock() = Event::None;
        slot.tag.store(EventType::None as u8, Ordering::Release);
    }
}

/// Producer side positions. Indices grow forever, slots are `index % capacity`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub next_exp: u64,
    pub next_free_unexp: u64,
    pub next_reserved_unexp: u64,
    pub next_recvq: u64,
}

pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) status: WaitStatus,
}

pub(crate) struct Desc {
    pub(crate) cursors: Cursors,
    pub(crate) waiters: Vec<Waiter>,
    pub(crate) next_waiter_id: u64,
    pub(crate) wakeup_deadline: Option<Instant>,
}

impl Desc {
    pub(crate) fn wakeup_on_event(&mut self) {
        for waiter in self.waiters.iter_mut() {
            waiter.status = WaitStatus::Event;
        }
    }
}

/// The expected and unexpected event rings of one endpoint, the receive data queue
/// paired with the unexpected ring, and the wait list.
pub struct EventQueues {
    exp: EventRing,
    unexp: EventRing,
    recvq: Pages,
    pub(crate) desc: Mutex<Desc>,
    pub(crate) cond: Condvar,
    status: AtomicU32,
    pub(crate) counters: Counters,
}

impl EventQueues {
    pub fn new(exp_entries: usize, unexp_entries: usize) -> Self {
        EventQueues {
            exp: EventRing::new(exp_entries),
            unexp: EventRing::new(unexp_entries),
            recvq: Pages::new(unexp_entries, RECVQ_ENTRY_SIZE),
            desc: Mutex::new(Desc {
                cursors: Cursors::default(),
                waiters: Vec::new(),
                next_waiter_id: 0,
                wakeup_deadline: None,
            }),
            cond: Condvar::new(),
            status: AtomicU32::new(0),
            counters: Counters::default(),
        }
    }

    #[inline]
    pub(crate) fn lock_desc(&self) -> MutexGuard<'_, Desc> {
        // nothing runs user code under this lock, a poisoned one is still consistent
        self.desc.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn exp_entries(&self) -> usize {
        self.exp.cap()
    }

    #[inline]
    pub fn unexp_entries(&self) -> usize {
        self.unexp.cap()
    }

    #[inline]
    pub fn recvq(&self) -> &Pages {
        &self.recvq
    }

    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn cursors(&self) -> Cursors {
        self.lock_desc().cursors
    }

    pub fn status(&self) -> DescStatus {
        DescStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    /// Returns the raised conditions and clears them.
    pub fn take_status(&self) -> DescStatus {
        DescStatus::from_bits_truncate(self.status.swap(0, Ordering::AcqRel))
    }

    fn raise(&self, status: DescStatus, counter: Counter) -> Error {
        self.counters.inc(counter);
        self.status.fetch_or(status.bits(), Ordering::AcqRel);
        Error::Busy
    }

    /// Reports the completion of something the engine asked for.
    pub fn notify_exp(&self, event: Event) -> Result<(), Error> {
        let mut desc = self.lock_desc();
        let index = desc.cursors.next_exp;
        if !self.exp.is_free(index) {
            tracing::debug!("expected event queue full, dropping {:?}", event.event_type());
            return Err(self.raise(DescStatus::EXP_EVENTQ_FULL, Counter::ExpEventqFull));
        }
        desc.cursors.next_exp += 1;
        self.exp.publish(index, event);
        self.counters.inc(Counter::ExpEvents);
        desc.wakeup_on_event();
        self.cond.notify_all();
        Ok(())
    }

    fn reserve_unexp(&self, desc: &mut Desc) -> Result<(), Error> {
        let c = &desc.cursors;
        let outstanding = c.next_free_unexp - c.next_reserved_unexp;
        if outstanding as usize >= self.unexp.cap() || !self.unexp.is_free(c.next_free_unexp) {
            tracing::debug!("unexpected event queue full");
            return Err(self.raise(DescStatus::UNEXP_EVENTQ_FULL, Counter::UnexpEventqFull));
        }
        desc.cursors.next_free_unexp += 1;
        Ok(())
    }

    fn commit_unexp(&self, desc: &mut Desc, event: Event) {
        let index = desc.cursors.next_reserved_unexp;
        desc.cursors.next_reserved_unexp += 1;
        self.unexp.publish(index, event);
        self.counters.inc(Counter::UnexpEvents);
        desc.wakeup_on_event();
        self.cond.notify_all();
    }

    /// Reports an arrival whose whole content fits in the event slot.
    pub fn notify_unexp(&self, event: Event) -> Result<(), Error> {
        assert!(!event.uses_recvq(), "{:?} needs a receive queue slot", event.event_type());
        let mut desc = self.lock_desc();
        self.reserve_unexp(&mut desc)?;
        self.commit_unexp(&mut desc, event);
        Ok(())
    }

    /// Reserves an unexpected slot and hands out the receive queue page to fill
    /// before `commit_unexp_with_recvq` makes the event visible.
    pub fn prepare_unexp_with_recvq(&self) -> Result<u32, Error> {
        let mut desc = self.lock_desc();
        self.reserve_unexp(&mut desc)?;
        let recvq_index = wrap_index(desc.cursors.next_recvq, self.recvq.len());
        desc.cursors.next_recvq += 1;
        Ok(recvq_index as u32)
    }

    pub fn commit_unexp_with_recvq(&self, event: Event) {
        let mut desc = self.lock_desc();
        assert!(
            desc.cursors.next_reserved_unexp < desc.cursors.next_free_unexp,
            "committing an unexpected event that was never prepared"
        );
        self.commit_unexp(&mut desc, event);
    }

    /// Copies a payload into a receive queue page obtained from `prepare_unexp_with_recvq`.
    pub fn write_recvq(&self, recvq_index: u32, data: &[u8]) {
        self.recvq.write(recvq_index as usize, data);
    }

    /// Reads a payload out of the receive queue. Must happen before the event that
    /// refers to it is released.
    pub fn read_recvq(&self, recvq_index: u32, buf: &mut [u8]) {
        self.recvq.read(recvq_index as usize, buf);
    }

    /// Returns the expected event at the reader position, if one was published.
    pub fn peek_exp(&self, index: u64) -> Option<Event> {
        self.exp.peek(index)
    }

    pub fn release_exp(&self, index: u64) {
        self.exp.release(index)
    }

    pub fn peek_unexp(&self, index: u64) -> Option<Event> {
        self.unexp.peek(index)
    }

    pub fn release_unexp(&self, index: u64) {
        self.unexp.release(index)
    }

    /// Deadline at which a sleeping waiter should come back for the engine's own
    /// bookkeeping.
    pub fn set_progress_deadline(&self, deadline: Option<Instant>) {
        self.lock_desc().wakeup_deadline = deadline;
    }

    pub fn progress_deadline(&self) -> Option<Instant> {
        self.lock_desc().wakeup_deadline
    }
}
