//! Framework services shared by the sirocco model crates.
//!
//! The simulation core proper lives in `sirocco-time` (scheduling), `sirocco-icache`
//! (decoded-instruction cache) and `sirocco-dma` (transfer peripheral). This crate holds
//! the narrow seams those models consume from the surrounding framework: the hierarchical
//! configuration tree they are constructed from, the memory-transaction types exchanged
//! with bus targets, and the value-change trace sink.

mod config;
mod io;
mod trace;

pub use config::{Config, ConfigError};
pub use io::{IoReq, IoStatus, IoTarget};
pub use trace::{NullTrace, TraceSink};
