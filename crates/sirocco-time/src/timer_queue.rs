use crate::timeline::{ClientId, Timeline, TimelineError};

/// Generation-tagged handle to an armed timer. A handle goes stale once the timer fires
/// or is cancelled; stale handles are detected and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct TimerSlot<T> {
    generation: u32,
    /// Absolute deadline in picoseconds; meaningful while armed.
    deadline: i64,
    payload: Option<T>,
    next: Option<u32>,
}

/// One-shot timer list for components that need occasional timed callbacks rather than
/// a whole clock domain.
///
/// The queue registers a single timeline client. When the timeline pops that client,
/// the embedder drains [`TimerQueue::pop_due`] at the new current time, dispatches the
/// payloads, and completes the client with [`TimerQueue::next_delay`].
#[derive(Debug)]
pub struct TimerQueue<T> {
    client: ClientId,
    slots: Vec<TimerSlot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
}

impl<T: Copy> TimerQueue<T> {
    pub fn new(name: &str, timeline: &mut Timeline) -> Self {
        Self {
            client: timeline.register(name),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
        }
    }

    #[inline]
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Arms a one-shot timer `delay` picoseconds from now. Timers at equal deadlines
    /// fire in arming order.
    pub fn schedule(
        &mut self,
        delay: i64,
        payload: T,
        timeline: &mut Timeline,
    ) -> Result<TimerId, TimelineError> {
        if delay < 0 {
            return Err(TimelineError::NegativeDelay(delay));
        }
        let deadline = timeline.time() + delay;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(TimerSlot {
                    generation: 0,
                    deadline: 0,
                    payload: None,
                    next: None,
                });
                index
            }
        };
        let generation = {
            let slot = &mut self.slots[index as usize];
            slot.deadline = deadline;
            slot.payload = Some(payload);
            slot.generation
        };
        self.link(index, deadline);
        timeline.schedule(self.client, delay);
        Ok(TimerId { index, generation })
    }

    /// Disarms `id` and reports whether it was still pending. The last timer going
    /// away drops the queue's client off the timeline.
    pub fn cancel(&mut self, id: TimerId, timeline: &mut Timeline) -> bool {
        if !self.is_scheduled(id) {
            return false;
        }
        let mut prev: Option<u32> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == id.index {
                let after = self.slots[c as usize].next;
                match prev {
                    None => self.head = after,
                    Some(p) => self.slots[p as usize].next = after,
                }
                self.release(c);
                if self.head.is_none() {
                    timeline.dequeue(self.client);
                }
                return true;
            }
            prev = cur;
            cur = self.slots[c as usize].next;
        }
        debug_assert!(false, "armed timer is not linked");
        tracing::error!("armed timer is not linked in its queue");
        false
    }

    /// Pops the next timer due at `now`.
    ///
    /// `None` once nothing further is due. A timeline wakeup can legitimately find
    /// nothing when the timer it was scheduled for has since been cancelled.
    pub fn pop_due(&mut self, now: i64) -> Option<T> {
        let head = self.head?;
        if self.slots[head as usize].deadline > now {
            return None;
        }
        self.head = self.slots[head as usize].next;
        let payload = self.slots[head as usize].payload;
        debug_assert!(payload.is_some(), "armed timer with no payload");
        self.release(head);
        payload
    }

    /// Delay from `now` to the earliest pending timer, in the form
    /// [`Timeline::complete`] expects.
    pub fn next_delay(&self, now: i64) -> Option<i64> {
        self.head
            .map(|h| (self.slots[h as usize].deadline - now).max(0))
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        let slot = &self.slots[id.index as usize];
        slot.generation == id.generation && slot.payload.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of armed timers. O(n); diagnostics and tests.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            n += 1;
            cur = self.slots[c as usize].next;
        }
        n
    }

    fn link(&mut self, index: u32, deadline: i64) {
        let mut prev: Option<u32> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if self.slots[c as usize].deadline > deadline {
                break;
            }
            prev = Some(c);
            cur = self.slots[c as usize].next;
        }
        self.slots[index as usize].next = cur;
        match prev {
            None => self.head = Some(index),
            Some(p) => self.slots[p as usize].next = Some(index),
        }
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.payload = None;
        slot.next = None;
        self.free.push(index);
    }
}
