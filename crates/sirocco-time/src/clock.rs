use thiserror::Error;

use crate::timeline::{ClientId, Timeline, PS_PER_SECOND};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("negative cycle count: {0}")]
    NegativeCycles(i64),

    #[error("event is already enqueued")]
    AlreadyEnqueued,

    #[error("frequency {0} Hz is not representable")]
    InvalidFrequency(i64),

    #[error("wheel length {0} is not a power of two")]
    InvalidWheelLen(usize),
}

/// Construction parameters for a [`ClockDomain`].
#[derive(Debug, Clone, Copy)]
pub struct ClockConfig {
    /// Tick frequency in hertz. Zero builds the domain clock-gated: events can be
    /// enqueued but nothing runs until [`ClockDomain::set_frequency`] ungates it.
    pub frequency_hz: i64,
    /// Cycle wheel length in slots. Must be a power of two.
    pub wheel_len: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 0,
            wheel_len: 64,
        }
    }
}

/// Handle to an event slot allocated on a [`ClockDomain`].
///
/// Components allocate one slot per concern at construction time and reuse it for the
/// lifetime of the domain; enqueueing never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u32);

impl EventId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Event<T> {
    payload: T,
    /// Absolute tick at which the event fires; only meaningful while enqueued.
    cycle: i64,
    enqueued: bool,
    next: Option<EventId>,
}

/// One wheel slot: a FIFO chain of events due at the same tick.
#[derive(Debug, Clone, Copy)]
struct Slot {
    head: Option<EventId>,
    tail: Option<EventId>,
}

/// Cycle-driven event scheduler for one frequency domain.
///
/// Events due within the next `wheel_len` ticks live on a circular wheel indexed by
/// tick; farther events wait in a cycle-ordered delayed queue and migrate onto the
/// wheel as it wraps. The domain registers itself as a timeline client and reports its
/// next wakeup after every exec window, so a domain with nothing to do costs nothing.
///
/// The exec protocol is three calls. Once [`Timeline::pop_due`] hands back this
/// domain's client: [`ClockDomain::begin_exec`], then [`ClockDomain::pop_due`] until it
/// returns `None` (dispatching each payload), then [`ClockDomain::end_exec`], whose
/// return value goes to [`Timeline::complete`].
#[derive(Debug)]
pub struct ClockDomain<T> {
    name: String,
    client: ClientId,
    frequency: i64,
    /// Picoseconds per tick; 0 while clock-gated.
    period: i64,
    cycles: i64,
    current_slot: usize,
    /// Time at which the domain last went idle; base for cycle resynchronization.
    stop_time: i64,
    wheel: Vec<Slot>,
    wheel_mask: usize,
    nb_in_wheel: usize,
    delayed_head: Option<EventId>,
    must_flush_delayed: bool,
    running: bool,
    events: Vec<Event<T>>,
}

impl<T: Copy> ClockDomain<T> {
    pub fn new(name: &str, cfg: ClockConfig, timeline: &mut Timeline) -> Result<Self, ClockError> {
        if !cfg.wheel_len.is_power_of_two() {
            return Err(ClockError::InvalidWheelLen(cfg.wheel_len));
        }
        let period = period_for(cfg.frequency_hz)?;
        let client = timeline.register(name);
        Ok(Self {
            name: name.to_string(),
            client,
            frequency: cfg.frequency_hz,
            period,
            cycles: 0,
            current_slot: 0,
            stop_time: 0,
            wheel: vec![Slot { head: None, tail: None }; cfg.wheel_len],
            wheel_mask: cfg.wheel_len - 1,
            nb_in_wheel: 0,
            delayed_head: None,
            must_flush_delayed: false,
            running: false,
            events: Vec::new(),
        })
    }

    /// Allocates an event slot carrying `payload`. Slots are never freed.
    pub fn new_event(&mut self, payload: T) -> EventId {
        let id = EventId(self.events.len() as u32);
        self.events.push(Event {
            payload,
            cycle: 0,
            enqueued: false,
            next: None,
        });
        id
    }

    /// Schedules `event` to fire `cycles` ticks from the domain's current tick.
    ///
    /// Zero is allowed: enqueued from a handler it fires later in the same exec window,
    /// after the events already chained on the live slot.
    pub fn enqueue(
        &mut self,
        event: EventId,
        cycles: i64,
        timeline: &mut Timeline,
    ) -> Result<(), ClockError> {
        if cycles < 0 {
            return Err(ClockError::NegativeCycles(cycles));
        }
        if self.events[event.idx()].enqueued {
            return Err(ClockError::AlreadyEnqueued);
        }
        if self.running && cycles < self.wheel.len() as i64 {
            self.push_to_slot(event, cycles);
        } else {
            self.enqueue_delayed(event, cycles, timeline);
        }
        Ok(())
    }

    /// Cancels `event` if pending, then enqueues it `cycles` ticks from now. Used to
    /// pull an already-scheduled wakeup closer.
    pub fn reenqueue(
        &mut self,
        event: EventId,
        cycles: i64,
        timeline: &mut Timeline,
    ) -> Result<(), ClockError> {
        if self.events[event.idx()].enqueued {
            self.cancel(event, timeline);
        }
        self.enqueue(event, cycles, timeline)
    }

    /// Removes `event` from whichever queue holds it. No-op when it is not enqueued.
    /// When the last event goes away the idle domain drops off the timeline.
    pub fn cancel(&mut self, event: EventId, timeline: &mut Timeline) {
        if !self.events[event.idx()].enqueued {
            return;
        }
        if !self.unlink_delayed(event) && !self.unlink_wheel(event) {
            debug_assert!(false, "enqueued event is in neither queue");
            tracing::error!(
                domain = %self.name,
                "enqueued event is in neither the wheel nor the delayed queue"
            );
        }
        self.events[event.idx()].enqueued = false;
        if !self.has_events() && !self.running {
            timeline.dequeue(self.client);
        }
    }

    /// Opens an exec window. Call once after the timeline pops this domain's client.
    pub fn begin_exec(&mut self) {
        debug_assert!(self.has_events(), "exec window on a domain with no events");
        self.running = true;
        if self.must_flush_delayed {
            self.flush_delayed();
        }
    }

    /// Pops the next event due at the current tick.
    ///
    /// The live slot is re-read on every call, so a handler enqueueing at relative
    /// cycle 0 sees its event come back later in the same window.
    pub fn pop_due(&mut self) -> Option<T> {
        let id = self.wheel[self.current_slot].head?;
        let next = self.events[id.idx()].next;
        self.wheel[self.current_slot].head = next;
        if next.is_none() {
            self.wheel[self.current_slot].tail = None;
        }
        let ev = &mut self.events[id.idx()];
        ev.next = None;
        ev.enqueued = false;
        self.nb_in_wheel -= 1;
        Some(ev.payload)
    }

    /// Closes the exec window and reports the delay to hand to [`Timeline::complete`]:
    /// one period while the wheel still holds events, the distance to the first delayed
    /// event once it does not, `None` when nothing is pending or the domain was gated
    /// mid-window.
    pub fn end_exec(&mut self, now: i64) -> Option<i64> {
        self.running = false;
        if self.nb_in_wheel > 0 {
            self.cycles += 1;
            self.current_slot = (self.current_slot + 1) & self.wheel_mask;
            if self.current_slot == 0 {
                self.must_flush_delayed = true;
            }
            if self.period == 0 {
                self.stop_time = now;
                return None;
            }
            return Some(self.period);
        }

        self.must_flush_delayed = true;
        self.stop_time = now;
        match self.delayed_head {
            Some(id) if self.period != 0 => {
                Some((self.events[id.idx()].cycle - self.cycles) * self.period)
            }
            _ => None,
        }
    }

    /// Changes the domain frequency.
    ///
    /// A pending timeline wakeup is rescaled so the same number of whole ticks remains
    /// under the new period. Zero clock-gates the domain: it drops off the timeline and
    /// pending events hold until a later call resumes them.
    pub fn set_frequency(
        &mut self,
        frequency_hz: i64,
        timeline: &mut Timeline,
    ) -> Result<(), ClockError> {
        if frequency_hz == 0 {
            if !self.running {
                timeline.dequeue(self.client);
            }
            self.frequency = 0;
            self.period = 0;
            return Ok(());
        }
        let new_period = period_for(frequency_hz)?;

        let deadline = timeline.deadline(self.client);
        let reposition = !self.running && timeline.dequeue(self.client);
        let old_period = self.period;
        self.frequency = frequency_hz;
        self.period = new_period;

        if reposition && old_period > 0 {
            if let Some(deadline) = deadline {
                let remaining = (deadline - timeline.time()) / old_period;
                timeline.schedule(self.client, remaining * self.period);
            }
        } else if old_period == 0 {
            // Leaving clock gating: pending events resume under the new period.
            if let Some(cycle) = self.next_event_cycle() {
                timeline.schedule(self.client, (cycle - self.cycles) * self.period);
            }
        }
        Ok(())
    }

    /// Advances the cycle counter of a stopped clock to `now`, rounding partial
    /// periods up to the next whole tick.
    pub fn update(&mut self, now: i64) {
        if self.period == 0 {
            return;
        }
        let diff = now - self.stop_time;
        if diff > 0 {
            let ticks = (diff + self.period - 1) / self.period;
            self.stop_time += ticks * self.period;
            self.cycles += ticks;
        }
    }

    #[inline]
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Current tick. Stale while the domain sits idle; see [`ClockDomain::update`].
    #[inline]
    pub fn cycles(&self) -> i64 {
        self.cycles
    }

    #[inline]
    pub fn period(&self) -> i64 {
        self.period
    }

    #[inline]
    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    #[inline]
    pub fn is_enqueued(&self, event: EventId) -> bool {
        self.events[event.idx()].enqueued
    }

    #[inline]
    pub fn has_events(&self) -> bool {
        self.nb_in_wheel > 0 || self.delayed_head.is_some()
    }

    /// Number of pending events. O(pending); diagnostics and tests.
    pub fn pending_events(&self) -> usize {
        let mut n = self.nb_in_wheel;
        let mut cur = self.delayed_head;
        while let Some(c) = cur {
            n += 1;
            cur = self.events[c.idx()].next;
        }
        n
    }

    /// Slow path: the domain is idle or the target tick is beyond the wheel. The event
    /// goes to the delayed queue and the timeline gets a wakeup.
    fn enqueue_delayed(&mut self, event: EventId, cycles: i64, timeline: &mut Timeline) {
        if !self.running && !self.has_events() {
            // First event of an idle domain: bring the cycle counter up to date so
            // relative cycles count from now, not from when the domain went idle.
            self.update(timeline.time());
        }
        self.must_flush_delayed = true;
        if self.period != 0 {
            timeline.schedule(self.client, cycles * self.period);
        }

        let full_cycle = self.cycles + cycles;
        let mut prev: Option<EventId> = None;
        let mut cur = self.delayed_head;
        while let Some(c) = cur {
            if self.events[c.idx()].cycle > full_cycle {
                break;
            }
            prev = Some(c);
            cur = self.events[c.idx()].next;
        }
        let ev = &mut self.events[event.idx()];
        ev.cycle = full_cycle;
        ev.enqueued = true;
        ev.next = cur;
        match prev {
            None => self.delayed_head = Some(event),
            Some(p) => self.events[p.idx()].next = Some(event),
        }
    }

    /// Chains `event` on the wheel slot `cycles` ticks ahead of the live one.
    fn push_to_slot(&mut self, event: EventId, cycles: i64) {
        let slot = (self.current_slot + cycles as usize) & self.wheel_mask;
        let full_cycle = self.cycles + cycles;
        {
            let ev = &mut self.events[event.idx()];
            ev.cycle = full_cycle;
            ev.enqueued = true;
            ev.next = None;
        }
        match self.wheel[slot].tail {
            None => self.wheel[slot].head = Some(event),
            Some(tail) => self.events[tail.idx()].next = Some(event),
        }
        self.wheel[slot].tail = Some(event);
        self.nb_in_wheel += 1;
    }

    /// Migrates delayed events that fit the wheel window. With an empty wheel the
    /// cycle counter jumps straight to the first delayed event instead of ticking
    /// through the gap.
    fn flush_delayed(&mut self) {
        self.must_flush_delayed = false;
        while let Some(id) = self.delayed_head {
            if self.nb_in_wheel == 0 {
                self.cycles = self.events[id.idx()].cycle;
            }
            let diff = self.events[id.idx()].cycle - self.cycles;
            debug_assert!(diff >= 0, "delayed event in the past");
            if diff >= self.wheel.len() as i64 {
                break;
            }
            self.delayed_head = self.events[id.idx()].next;
            self.push_to_slot(id, diff);
        }
    }

    fn next_event_cycle(&self) -> Option<i64> {
        if self.nb_in_wheel > 0 {
            for i in 0..self.wheel.len() {
                let slot = (self.current_slot + i) & self.wheel_mask;
                if let Some(id) = self.wheel[slot].head {
                    return Some(self.events[id.idx()].cycle);
                }
            }
            debug_assert!(false, "wheel count is non-zero but every slot is empty");
        }
        self.delayed_head.map(|id| self.events[id.idx()].cycle)
    }

    fn unlink_delayed(&mut self, event: EventId) -> bool {
        let mut prev: Option<EventId> = None;
        let mut cur = self.delayed_head;
        while let Some(c) = cur {
            if c == event {
                let after = self.events[c.idx()].next;
                match prev {
                    None => self.delayed_head = after,
                    Some(p) => self.events[p.idx()].next = after,
                }
                self.events[c.idx()].next = None;
                return true;
            }
            prev = cur;
            cur = self.events[c.idx()].next;
        }
        false
    }

    fn unlink_wheel(&mut self, event: EventId) -> bool {
        for slot in 0..self.wheel.len() {
            let mut prev: Option<EventId> = None;
            let mut cur = self.wheel[slot].head;
            while let Some(c) = cur {
                if c == event {
                    let after = self.events[c.idx()].next;
                    match prev {
                        None => self.wheel[slot].head = after,
                        Some(p) => self.events[p.idx()].next = after,
                    }
                    if self.wheel[slot].tail == Some(c) {
                        self.wheel[slot].tail = prev;
                    }
                    self.events[c.idx()].next = None;
                    self.nb_in_wheel -= 1;
                    return true;
                }
                prev = cur;
                cur = self.events[c.idx()].next;
            }
        }
        false
    }
}

fn period_for(frequency_hz: i64) -> Result<i64, ClockError> {
    if frequency_hz == 0 {
        return Ok(0);
    }
    if frequency_hz < 0 || frequency_hz > PS_PER_SECOND {
        return Err(ClockError::InvalidFrequency(frequency_hz));
    }
    Ok(PS_PER_SECOND / frequency_hz)
}
