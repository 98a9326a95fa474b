use thiserror::Error;

/// The global time unit is the picosecond.
pub const PS_PER_SECOND: i64 = 1_000_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("negative delay: {0}")]
    NegativeDelay(i64),
}

/// Handle to a client registered on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u32);

impl ClientId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Client {
    name: String,
    /// Absolute deadline while enqueued; -1 when the client is idle.
    next_event_time: i64,
    enqueued: bool,
    next: Option<ClientId>,
}

/// Global ordered list of scheduling clients (clock domains, timer queues).
///
/// The list is strictly ordered by ascending deadline and is only ever walked and mutated
/// from the single simulation thread. The driver loop alternates [`Timeline::pop_due`]
/// (unlink the head, advance time to its deadline, mark it running) with
/// [`Timeline::complete`] (hand back the client's next relative delay, or `None` to leave
/// it idle until something re-enqueues it).
#[derive(Debug)]
pub struct Timeline {
    time: i64,
    clients: Vec<Client>,
    head: Option<ClientId>,
    running: Option<ClientId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            time: 0,
            clients: Vec::new(),
            head: None,
            running: None,
        }
    }

    /// Registers a client slot. Clients live until teardown; there is no unregister.
    pub fn register(&mut self, name: &str) -> ClientId {
        let id = ClientId(self.clients.len() as u32);
        self.clients.push(Client {
            name: name.to_string(),
            next_event_time: -1,
            enqueued: false,
            next: None,
        });
        id
    }

    /// Current simulated time in picoseconds.
    #[inline]
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Schedules `client` to run `delay` picoseconds from now.
    ///
    /// Returns `Ok(false)` without touching the list when the client is currently
    /// executing (its end-of-exec report positions it instead) or when it is already
    /// enqueued at an equal-or-earlier deadline. A client enqueued at a later deadline is
    /// moved up. Among equal deadlines the new entry lands after the existing ones; that
    /// order is an artifact of the linear insertion, not a guarantee.
    pub fn enqueue(&mut self, client: ClientId, delay: i64) -> Result<bool, TimelineError> {
        if delay < 0 {
            return Err(TimelineError::NegativeDelay(delay));
        }
        Ok(self.schedule(client, delay))
    }

    /// Infallible core of [`Timeline::enqueue`] for in-crate callers whose delays are
    /// non-negative by construction.
    pub(crate) fn schedule(&mut self, client: ClientId, delay: i64) -> bool {
        debug_assert!(delay >= 0);
        if self.running == Some(client) {
            return false;
        }
        let deadline = self.time + delay;
        if self.clients[client.idx()].enqueued {
            if self.clients[client.idx()].next_event_time <= deadline {
                return false;
            }
            self.unlink(client);
        }

        let mut prev = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if self.clients[c.idx()].next_event_time > deadline {
                break;
            }
            prev = Some(c);
            cur = self.clients[c.idx()].next;
        }
        let slot = &mut self.clients[client.idx()];
        slot.next_event_time = deadline;
        slot.enqueued = true;
        slot.next = cur;
        match prev {
            None => self.head = Some(client),
            Some(p) => self.clients[p.idx()].next = Some(client),
        }
        true
    }

    /// Removes `client` from the list. Returns whether it was enqueued.
    pub fn dequeue(&mut self, client: ClientId) -> bool {
        if !self.clients[client.idx()].enqueued {
            return false;
        }
        self.unlink(client);
        true
    }

    fn unlink(&mut self, client: ClientId) {
        let mut prev: Option<ClientId> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == client {
                let after = self.clients[c.idx()].next;
                match prev {
                    None => self.head = after,
                    Some(p) => self.clients[p.idx()].next = after,
                }
                let slot = &mut self.clients[c.idx()];
                slot.next = None;
                slot.enqueued = false;
                return;
            }
            prev = Some(c);
            cur = self.clients[c.idx()].next;
        }
        debug_assert!(false, "client marked enqueued but not linked");
        tracing::error!(
            client = %self.clients[client.idx()].name,
            "timeline client marked enqueued but not linked"
        );
    }

    /// Deadline of the earliest pending client, or the current time when the list is
    /// empty ("nothing to do, stay put").
    pub fn next_event_time(&self) -> i64 {
        match self.head {
            Some(c) => self.clients[c.idx()].next_event_time,
            None => self.time,
        }
    }

    /// Absolute deadline of `client` if it is enqueued.
    pub fn deadline(&self, client: ClientId) -> Option<i64> {
        let slot = &self.clients[client.idx()];
        slot.enqueued.then(|| slot.next_event_time)
    }

    pub fn is_enqueued(&self, client: ClientId) -> bool {
        self.clients[client.idx()].enqueued
    }

    pub fn client_name(&self, client: ClientId) -> &str {
        &self.clients[client.idx()].name
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of enqueued clients. O(n); diagnostics and tests only.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            n += 1;
            cur = self.clients[c.idx()].next;
        }
        n
    }

    /// Unlinks the earliest pending client, advances time to its deadline and marks it
    /// running; enqueue calls for it no-op until [`Timeline::complete`].
    pub fn pop_due(&mut self) -> Option<ClientId> {
        debug_assert!(self.running.is_none(), "pop_due inside an exec window");
        let head = self.head?;
        let slot = &mut self.clients[head.idx()];
        debug_assert!(slot.next_event_time >= self.time);
        self.head = slot.next;
        slot.next = None;
        slot.enqueued = false;
        self.time = slot.next_event_time;
        self.running = Some(head);
        Some(head)
    }

    /// Ends `client`'s exec window. `Some(delay)` re-enqueues it `delay` picoseconds
    /// from now; `None` leaves it idle.
    pub fn complete(&mut self, client: ClientId, next: Option<i64>) {
        debug_assert_eq!(self.running, Some(client));
        self.running = None;
        match next {
            Some(delay) => {
                debug_assert!(delay >= 0);
                self.schedule(client, delay.max(0));
            }
            None => self.clients[client.idx()].next_event_time = -1,
        }
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut tl = Timeline::new();
        let a = tl.register("a");
        let b = tl.register("b");
        let c = tl.register("c");
        tl.enqueue(a, 30).unwrap();
        tl.enqueue(b, 10).unwrap();
        tl.enqueue(c, 20).unwrap();

        assert_eq!(tl.next_event_time(), 10);
        assert_eq!(tl.pop_due(), Some(b));
        assert_eq!(tl.time(), 10);
        tl.complete(b, None);
        assert_eq!(tl.pop_due(), Some(c));
        tl.complete(c, None);
        assert_eq!(tl.pop_due(), Some(a));
        tl.complete(a, None);

        assert!(tl.is_empty());
        // Idle timeline reports the current time.
        assert_eq!(tl.next_event_time(), 30);
    }

    #[test]
    fn negative_delay_is_an_error() {
        let mut tl = Timeline::new();
        let a = tl.register("a");
        assert_eq!(tl.enqueue(a, -1), Err(TimelineError::NegativeDelay(-1)));
        assert!(!tl.is_enqueued(a));
    }

    #[test]
    fn later_enqueue_does_not_duplicate() {
        let mut tl = Timeline::new();
        let a = tl.register("a");
        let b = tl.register("b");
        tl.enqueue(a, 10).unwrap();
        tl.enqueue(b, 20).unwrap();
        assert_eq!(tl.len(), 2);

        // Already enqueued earlier: no-op.
        assert!(!tl.enqueue(a, 15).unwrap());
        assert_eq!(tl.len(), 2);
        assert_eq!(tl.deadline(a), Some(10));

        // Enqueued later: moved up, still a single entry.
        assert!(tl.enqueue(b, 5).unwrap());
        assert_eq!(tl.len(), 2);
        assert_eq!(tl.deadline(b), Some(5));
        assert_eq!(tl.pop_due(), Some(b));
    }

    #[test]
    fn enqueue_of_running_client_is_ignored() {
        let mut tl = Timeline::new();
        let a = tl.register("a");
        tl.enqueue(a, 5).unwrap();
        assert_eq!(tl.pop_due(), Some(a));

        // Mid-exec self-enqueue must not corrupt the list; the exec report wins.
        assert!(!tl.enqueue(a, 0).unwrap());
        assert!(!tl.is_enqueued(a));
        tl.complete(a, Some(7));
        assert_eq!(tl.deadline(a), Some(12));
    }

    #[test]
    fn dequeue_reports_presence() {
        let mut tl = Timeline::new();
        let a = tl.register("a");
        assert!(!tl.dequeue(a));
        tl.enqueue(a, 1).unwrap();
        assert!(tl.dequeue(a));
        assert!(tl.is_empty());
    }

    proptest! {
        #[test]
        fn pop_times_never_decrease(delays in prop::collection::vec(0i64..10_000, 1..40)) {
            let mut tl = Timeline::new();
            let clients: Vec<_> = delays
                .iter()
                .enumerate()
                .map(|(i, _)| tl.register(&format!("c{i}")))
                .collect();
            for (client, delay) in clients.iter().zip(&delays) {
                tl.enqueue(*client, *delay).unwrap();
            }

            let mut last = tl.time();
            while let Some(client) = tl.pop_due() {
                prop_assert!(tl.time() >= last);
                last = tl.time();
                tl.complete(client, None);
            }
            prop_assert_eq!(tl.next_event_time(), tl.time());
        }
    }
}
