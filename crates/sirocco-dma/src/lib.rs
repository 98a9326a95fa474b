//! Multi-channel memory transfer peripheral (cluster DMA).
//!
//! Cores stream variable-length command words into a per-channel CMD register:
//! header, local address, external address (one or two words), then length and
//! stride for 2D transfers. Assembled commands queue per channel, get promoted
//! round-robin into two global direction queues, and the external engine carves the
//! current command of each direction into bursts. Arriving read data and staged
//! write data cross the local bus in 4-byte beats over a small set of ports, while
//! the external interface paces itself from the latency and duration each target
//! reports. Completion retires bytes against one of sixteen shared transfer
//! counters; software observes and frees counters through the STATUS register.
//!
//! The controller owns no memory and no wiring. It talks to the rest of the machine
//! through [`DmaPorts`] and advances only when the embedder feeds it the [`DmaEvent`]
//! tokens it scheduled on its [`sirocco_time::ClockDomain`].

mod cmd;
mod controller;

pub use cmd::{
    CMD_2D, CMD_BROADCAST, CMD_EVENT_ENABLE, CMD_INC, CMD_IRQ_ENABLE, CMD_LEN_MASK,
    CMD_TYPE_EXT2LOC, MAX_CMD_WORDS,
};
pub use controller::{
    DmaBuildError, DmaController, DmaEvent, DmaPorts, CMD_OFFSET, NB_COUNTERS, STATUS_OFFSET,
};
