/// Status returned by a bus target for one memory transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Completed synchronously; the latency/duration fields on the request are valid.
    Ok,
    /// Accepted but not complete; the target reports completion later through the
    /// master's response path.
    Pending,
    /// Refused for now. The master must stall this stream until the target grants it.
    Denied,
    /// The access itself is erroneous (bad decode, out of range). Masters treat this as
    /// a modeling warning, not a stall.
    Invalid,
}

/// One memory transaction.
///
/// The payload travels alongside the request as a byte slice so targets never own model
/// memory: reads fill the slice, writes consume it. `latency` and `duration` are written
/// by the target: latency is the delay in target cycles until the first data beat,
/// duration is how long the target's interface stays busy (the bandwidth the transaction
/// consumes).
#[derive(Debug, Clone)]
pub struct IoReq {
    pub addr: u64,
    pub size: usize,
    pub is_write: bool,
    pub latency: i64,
    pub duration: i64,
    /// Opaque master-owned slot. A target answering [`IoStatus::Pending`] or
    /// [`IoStatus::Denied`] hands this value back through the master's response path to
    /// name the request it is completing.
    pub tag: u64,
}

impl IoReq {
    pub fn read(addr: u64, size: usize) -> Self {
        Self {
            addr,
            size,
            is_write: false,
            latency: 0,
            duration: 0,
            tag: 0,
        }
    }

    pub fn write(addr: u64, size: usize) -> Self {
        Self {
            addr,
            size,
            is_write: true,
            latency: 0,
            duration: 0,
            tag: 0,
        }
    }

    /// Resets the target-reported timing before the request is (re)issued.
    pub fn prepare(&mut self) {
        self.latency = 0;
        self.duration = 0;
    }

    /// Cycles until the transaction has fully completed at the target.
    #[inline]
    pub fn full_latency(&self) -> i64 {
        self.latency + self.duration
    }
}

/// Slave side of a memory port.
///
/// `data.len()` always equals `req.size`. A `Pending` return hands the buffer back
/// untouched; the target reports completion later via whatever response path the master
/// exposes.
pub trait IoTarget {
    fn req(&mut self, req: &mut IoReq, data: &mut [u8]) -> IoStatus;
}
