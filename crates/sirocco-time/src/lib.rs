//! Scheduling engine of the simulation core.
//!
//! Simulated time is a single signed 64-bit picosecond counter owned by the [`Timeline`].
//! Anything that wants to run registers a timeline *client*: a [`ClockDomain`] for
//! clock-driven components (events placed on a cycle wheel, executed in causal order at
//! the domain's frequency) or a [`TimerQueue`] for components that only need occasional
//! timed callbacks. The embedding machine owns all of them and drives the loop: pop the
//! due client from the timeline, run its due events, hand its next-event report back to
//! the timeline.
//!
//! Handlers are not callbacks. Events carry a `Copy` payload chosen by the embedder
//! (typically a small enum) and the machine dispatches on the payloads it pops, so the
//! engine stays free of aliasing between scheduler state and component state.

mod clock;
mod timeline;
mod timer_queue;

pub use clock::{ClockConfig, ClockDomain, ClockError, EventId};
pub use timeline::{ClientId, Timeline, TimelineError, PS_PER_SECOND};
pub use timer_queue::{TimerId, TimerQueue};
