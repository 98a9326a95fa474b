use std::collections::VecDeque;

use sirocco_core::{Config, ConfigError, IoReq, IoStatus, TraceSink};
use sirocco_time::{ClockDomain, EventId, Timeline};
use thiserror::Error;

use crate::cmd::{CmdId, CmdPool, CmdQueue};

/// Transfer counters shared by all channels. A command's byte total is charged to
/// exactly one counter; software polls and frees them through the STATUS register.
pub const NB_COUNTERS: usize = 16;

/// Command stream register, one per channel. Writes stream command words, reads
/// allocate a counter.
pub const CMD_OFFSET: u64 = 0x0;

/// Counter status register. Reads pack pending/allocated bits, writes free counters.
pub const STATUS_OFFSET: u64 = 0x4;

#[derive(Debug, Error)]
pub enum DmaBuildError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{what} must be at least {min}, got {got}")]
    TooSmall {
        what: &'static str,
        min: u64,
        got: u64,
    },

    #[error("loc_addr_width must be between 1 and 32, got {0}")]
    AddrWidth(u64),
}

/// Payload tokens for the controller's clock events. The embedder pops them from the
/// domain inside an exec window and feeds each one back through
/// [`DmaController::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    /// Promote one command from a channel queue to a global direction queue.
    CheckQueue,
    /// Issue the next chunk of the current external-read command.
    ExtRead,
    /// Stage the next chunk of the current external-write command.
    ExtWrite,
    /// Move data beats through the local ports.
    LocTransfer,
    /// The head of the latency-ordered external request list is due.
    ExtReq,
}

/// Everything the controller reaches outside itself: the two buses and the signal
/// lines. Line callbacks default to no-ops so embedders wire only what they observe.
///
/// `ext_req` may answer `Pending` (completion arrives later through
/// [`DmaController::ext_response`]) or `Denied` (the controller stalls its external
/// side until [`DmaController::ext_grant`]). `loc_req` is synchronous: the target
/// moves the bytes before returning and reports its latency on the request.
pub trait DmaPorts {
    fn ext_req(&mut self, req: &mut IoReq, data: &mut [u8]) -> IoStatus;
    fn loc_req(&mut self, port: usize, req: &mut IoReq, data: &mut [u8]) -> IoStatus;

    fn event_line(&mut self, _channel: usize) {}
    fn irq_line(&mut self, _channel: usize) {}
    fn ext_irq_line(&mut self) {}
    fn busy_line(&mut self, _busy: bool) {}
    /// A CMD write parked on a full channel queue has now been absorbed.
    fn cmd_write_resumed(&mut self, _channel: usize, _tag: u64) {}
    /// A counter allocation parked on an exhausted pool has now been served.
    fn counter_alloc_resumed(&mut self, _channel: usize, _counter: u32, _tag: u64) {}
}

/// Index of a request slot in the controller's external request pool. The slot's
/// `io.tag` carries the same value so asynchronous completions can name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReqId(u32);

impl ReqId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One in-flight external bus transaction plus its local-side cursor. `done` counts
/// the bytes already moved through local ports; `trigger_cycle` orders the request in
/// the pending list once the external side has answered.
#[derive(Debug)]
struct ExtReq {
    io: IoReq,
    data: Vec<u8>,
    cmd: CmdId,
    loc_addr: u32,
    done: u32,
    trigger_cycle: i64,
}

#[derive(Debug)]
struct ReqPool {
    slots: Vec<ExtReq>,
    free_read: Vec<ReqId>,
    free_write: Vec<ReqId>,
}

impl ReqPool {
    fn new(nb_read: usize, nb_write: usize, burst: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(nb_read + nb_write),
            free_read: Vec::with_capacity(nb_read),
            free_write: Vec::with_capacity(nb_write),
        };
        for _ in 0..nb_read {
            let id = pool.push_slot(IoReq::read(0, 0), burst);
            pool.free_read.push(id);
        }
        for _ in 0..nb_write {
            let id = pool.push_slot(IoReq::write(0, 0), burst);
            pool.free_write.push(id);
        }
        pool
    }

    fn push_slot(&mut self, mut io: IoReq, burst: usize) -> ReqId {
        let id = ReqId(self.slots.len() as u32);
        io.tag = id.0 as u64;
        self.slots.push(ExtReq {
            io,
            data: vec![0; burst],
            cmd: CmdId::default(),
            loc_addr: 0,
            done: 0,
            trigger_cycle: 0,
        });
        id
    }
}

#[derive(Debug)]
struct Channel {
    /// Counter handed out by the most recent CMD read; newly assembled commands
    /// charge their bytes to it.
    current_counter: u32,
    /// Command currently being streamed in, if any.
    current_cmd: Option<CmdId>,
    /// Assembled commands waiting for promotion to a global queue.
    pending: CmdQueue,
    /// A CMD write held while the queue is full, with the master's tag.
    parked_write: Option<(u32, u64)>,
}

/// Multi-channel block-transfer controller.
///
/// Cores program it through per-channel CMD/STATUS registers. Assembled commands move
/// through per-channel queues into two global direction queues, and from there the
/// external engine carves them into bursts: reads land in a pooled request buffer and
/// drain into local memory through ports 0 and 1, writes are staged from local memory
/// through ports 2 and up before going out. All pacing runs over a [`ClockDomain`];
/// the controller owns five event slots and re-checks its queues after every state
/// change.
#[derive(Debug)]
pub struct DmaController {
    name: String,

    nb_channels: usize,
    core_queue_depth: usize,
    global_queue_depth: usize,
    is_64: bool,
    max_nb_ext_read_req: usize,
    max_nb_ext_write_req: usize,
    max_burst_length: usize,
    nb_loc_ports: usize,
    loc_addr_mask: u32,

    channels: Vec<Channel>,
    free_counter_mask: u32,
    pending_bytes: [i64; NB_COUNTERS],
    parked_allocs: VecDeque<(usize, u64)>,

    cmds: CmdPool,
    nb_core_read_cmd: usize,
    nb_core_write_cmd: usize,
    sched_core_queue: usize,
    pending_read_cmds: CmdQueue,
    pending_write_cmds: CmdQueue,
    current_ext_read_cmd: Option<CmdId>,
    current_ext_write_cmd: Option<CmdId>,

    reqs: ReqPool,
    nb_pending_ext_read_req: usize,
    nb_pending_ext_write_req: usize,
    ext_is_stalled: bool,
    /// Earliest cycle the external interface accepts another request; advanced by the
    /// duration each target reports, which is how bus bandwidth limits reach us.
    ext_itf_next_req_time: i64,
    /// Answered external requests waiting out their latency, ordered by
    /// `trigger_cycle`.
    pending_ext_reqs: VecDeque<ReqId>,

    /// Read data waiting to drain into local memory.
    pending_write_reqs: VecDeque<ReqId>,
    /// The single write-staging request being filled from local memory.
    pending_loc_read_req: Option<ReqId>,
    loc_port_ready_cycle: Vec<i64>,

    nb_cmd_started: i64,
    counter_paths: Vec<String>,

    ev_check_queue: EventId,
    ev_ext_read: EventId,
    ev_ext_write: EventId,
    ev_loc_transfer: EventId,
    ev_ext_req: EventId,
}

fn require_at_least(what: &'static str, min: u64, got: u64) -> Result<u64, DmaBuildError> {
    if got < min {
        return Err(DmaBuildError::TooSmall { what, min, got });
    }
    Ok(got)
}

impl DmaController {
    pub fn new(
        name: &str,
        cfg: &Config,
        clock: &mut ClockDomain<DmaEvent>,
    ) -> Result<Self, DmaBuildError> {
        let nb_channels =
            require_at_least("nb_channels", 1, cfg.require_uint("nb_channels")?)? as usize;
        let core_queue_depth = require_at_least(
            "core_queue_depth",
            1,
            cfg.require_uint("core_queue_depth")?,
        )? as usize;
        let global_queue_depth = require_at_least(
            "global_queue_depth",
            1,
            cfg.require_uint("global_queue_depth")?,
        )? as usize;
        let is_64 = cfg.require_bool("is_64")?;
        let max_nb_ext_read_req = require_at_least(
            "max_nb_ext_read_req",
            1,
            cfg.require_uint("max_nb_ext_read_req")?,
        )? as usize;
        let max_nb_ext_write_req = require_at_least(
            "max_nb_ext_write_req",
            1,
            cfg.require_uint("max_nb_ext_write_req")?,
        )? as usize;
        let max_burst_length = require_at_least(
            "max_burst_length",
            1,
            cfg.require_uint("max_burst_length")?,
        )? as usize;
        // ports 0 and 1 drain reads; write staging needs at least one port above that
        let nb_loc_ports =
            require_at_least("nb_loc_ports", 1, cfg.require_uint("nb_loc_ports")?)? as usize;
        let loc_addr_width = cfg.require_uint("loc_addr_width")?;
        if loc_addr_width == 0 || loc_addr_width > 32 {
            return Err(DmaBuildError::AddrWidth(loc_addr_width));
        }
        let loc_addr_mask = ((1u64 << loc_addr_width) - 1) as u32;

        let channels = (0..nb_channels)
            .map(|_| Channel {
                current_counter: 0,
                current_cmd: None,
                pending: CmdQueue::new(core_queue_depth),
                parked_write: None,
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            nb_channels,
            core_queue_depth,
            global_queue_depth,
            is_64,
            max_nb_ext_read_req,
            max_nb_ext_write_req,
            max_burst_length,
            nb_loc_ports,
            loc_addr_mask,
            channels,
            free_counter_mask: (1 << NB_COUNTERS) - 1,
            pending_bytes: [0; NB_COUNTERS],
            parked_allocs: VecDeque::new(),
            cmds: CmdPool::default(),
            nb_core_read_cmd: 0,
            nb_core_write_cmd: 0,
            sched_core_queue: 0,
            pending_read_cmds: CmdQueue::new(global_queue_depth),
            pending_write_cmds: CmdQueue::new(global_queue_depth),
            current_ext_read_cmd: None,
            current_ext_write_cmd: None,
            reqs: ReqPool::new(max_nb_ext_read_req, max_nb_ext_write_req, max_burst_length),
            nb_pending_ext_read_req: 0,
            nb_pending_ext_write_req: 0,
            ext_is_stalled: false,
            ext_itf_next_req_time: 0,
            pending_ext_reqs: VecDeque::new(),
            pending_write_reqs: VecDeque::new(),
            pending_loc_read_req: None,
            loc_port_ready_cycle: vec![0; nb_loc_ports],
            nb_cmd_started: 0,
            counter_paths: (0..NB_COUNTERS)
                .map(|i| format!("{name}/channel_{i}"))
                .collect(),
            ev_check_queue: clock.new_event(DmaEvent::CheckQueue),
            ev_ext_read: clock.new_event(DmaEvent::ExtRead),
            ev_ext_write: clock.new_event(DmaEvent::ExtWrite),
            ev_loc_transfer: clock.new_event(DmaEvent::LocTransfer),
            ev_ext_req: clock.new_event(DmaEvent::ExtReq),
        })
    }

    /// One register access from a core on `channel`'s slave port. Word-sized only.
    ///
    /// `Pending` means the core is stalled: either its CMD write parked on a full
    /// queue (resumed through [`DmaPorts::cmd_write_resumed`]) or its counter
    /// allocation parked on an exhausted pool ([`DmaPorts::counter_alloc_resumed`]).
    #[allow(clippy::too_many_arguments)]
    pub fn access(
        &mut self,
        channel: usize,
        req: &mut IoReq,
        data: &mut [u8],
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) -> IoStatus {
        if channel >= self.nb_channels || req.size != 4 {
            return IoStatus::Invalid;
        }
        match (req.addr, req.is_write) {
            (CMD_OFFSET, true) => {
                let word = reg_word(data);
                if self.channels[channel].pending.is_full() {
                    tracing::trace!(
                        dma = %self.name,
                        channel,
                        "channel queue full, stalling command write"
                    );
                    self.channels[channel].parked_write = Some((word, req.tag));
                    return IoStatus::Pending;
                }
                self.handle_cmd_word(channel, word, clock, timeline, ports, trace);
                IoStatus::Ok
            }
            (CMD_OFFSET, false) => match self.alloc_counter(channel, req.tag) {
                Some(id) => {
                    data[..4].copy_from_slice(&id.to_le_bytes());
                    IoStatus::Ok
                }
                None => IoStatus::Pending,
            },
            (STATUS_OFFSET, true) => {
                self.free_counters(reg_word(data), ports);
                IoStatus::Ok
            }
            (STATUS_OFFSET, false) => {
                data[..4].copy_from_slice(&self.get_status().to_le_bytes());
                IoStatus::Ok
            }
            _ => IoStatus::Invalid,
        }
    }

    /// Low 16 bits: one bit per counter with bytes still pending. High 16 bits: one
    /// bit per allocated counter.
    pub fn get_status(&self) -> u32 {
        let mut status = 0u32;
        for (i, pending) in self.pending_bytes.iter().enumerate() {
            if *pending != 0 {
                status |= 1 << i;
            }
        }
        status | ((!self.free_counter_mask & ((1 << NB_COUNTERS) - 1)) << 16)
    }

    /// True while any command is in flight; mirrors the busy line.
    pub fn busy(&self) -> bool {
        self.nb_cmd_started != 0
    }

    /// Dispatches one event token popped from the controller's clock domain.
    pub fn handle(
        &mut self,
        event: DmaEvent,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        match event {
            DmaEvent::CheckQueue => self.promote_command(clock, timeline, ports, trace),
            DmaEvent::ExtRead => self.check_ext_read(clock, timeline, ports),
            DmaEvent::ExtWrite => self.check_ext_write(clock, timeline),
            DmaEvent::LocTransfer => self.check_loc_transfer(clock, timeline, ports, trace),
            DmaEvent::ExtReq => self.handle_due_ext_reqs(clock, timeline, ports, trace),
        }
    }

    /// Completion callback for an external request the target answered `Pending` (or
    /// `Denied`) earlier. `tag` is the request's tag; for reads, `data` carries the
    /// bytes and must cover the request size.
    pub fn ext_response(
        &mut self,
        tag: u64,
        data: &[u8],
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let idx = tag as usize;
        if idx >= self.reqs.slots.len() {
            debug_assert!(false, "response for unknown request tag {tag}");
            tracing::error!(dma = %self.name, tag, "response names no pooled request, dropping");
            return;
        }
        let req_id = ReqId(idx as u32);
        if self.reqs.slots[idx].io.is_write {
            self.handle_ext_write_req_end(req_id, ports, trace);
        } else {
            let size = self.reqs.slots[idx].io.size;
            if data.len() < size {
                debug_assert!(false, "short read response: {} < {size}", data.len());
                tracing::error!(
                    dma = %self.name,
                    tag,
                    got = data.len(),
                    want = size,
                    "short read response, dropping"
                );
                return;
            }
            self.reqs.slots[idx].data[..size].copy_from_slice(&data[..size]);
            self.pending_write_reqs.push_back(req_id);
        }
        self.check_queue(clock, timeline);
    }

    /// The external target that answered `Denied` is ready again.
    pub fn ext_grant(&mut self, clock: &mut ClockDomain<DmaEvent>, timeline: &mut Timeline) {
        self.ext_is_stalled = false;
        self.check_queue(clock, timeline);
    }

    /// Hardware reset. Assertion drops every queued command and in-flight request,
    /// rebuilds the pools and releases all counters; deassertion is a no-op.
    pub fn reset(
        &mut self,
        active: bool,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        trace: &mut dyn TraceSink,
    ) {
        if !active {
            return;
        }
        for ev in [
            self.ev_check_queue,
            self.ev_ext_read,
            self.ev_ext_write,
            self.ev_loc_transfer,
            self.ev_ext_req,
        ] {
            clock.cancel(ev, timeline);
        }
        for channel in &mut self.channels {
            channel.current_cmd = None;
            channel.parked_write = None;
            channel.pending = CmdQueue::new(self.core_queue_depth);
        }
        self.free_counter_mask = (1 << NB_COUNTERS) - 1;
        self.pending_bytes = [0; NB_COUNTERS];
        self.parked_allocs.clear();
        self.cmds = CmdPool::default();
        self.nb_core_read_cmd = 0;
        self.nb_core_write_cmd = 0;
        self.sched_core_queue = 0;
        self.pending_read_cmds = CmdQueue::new(self.global_queue_depth);
        self.pending_write_cmds = CmdQueue::new(self.global_queue_depth);
        self.current_ext_read_cmd = None;
        self.current_ext_write_cmd = None;
        self.reqs = ReqPool::new(
            self.max_nb_ext_read_req,
            self.max_nb_ext_write_req,
            self.max_burst_length,
        );
        self.nb_pending_ext_read_req = 0;
        self.nb_pending_ext_write_req = 0;
        self.ext_is_stalled = false;
        self.ext_itf_next_req_time = 0;
        self.pending_ext_reqs.clear();
        self.pending_write_reqs.clear();
        self.pending_loc_read_req = None;
        for ready in &mut self.loc_port_ready_cycle {
            *ready = 0;
        }
        self.nb_cmd_started = 0;
        for path in &self.counter_paths {
            trace.value_change(path, None);
        }
    }

    // ---- command intake ----------------------------------------------------------

    fn handle_cmd_word(
        &mut self,
        channel: usize,
        word: u32,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let cmd_id = match self.channels[channel].current_cmd {
            Some(id) => id,
            None => {
                let id = self.cmds.alloc();
                self.channels[channel].current_cmd = Some(id);
                id
            }
        };
        let done = self.cmds[cmd_id].push_word(word, self.is_64);
        if self.cmds[cmd_id].step == 1 {
            self.cmds[cmd_id].counter = self.channels[channel].current_counter as usize;
        }
        if done {
            self.channels[channel].current_cmd = None;
            self.finish_command(channel, cmd_id, clock, timeline, ports, trace);
        }
    }

    fn finish_command(
        &mut self,
        channel: usize,
        cmd_id: CmdId,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let cmd = &self.cmds[cmd_id];
        let counter = cmd.counter;
        let size = cmd.size;
        let loc2ext = cmd.loc2ext;
        tracing::debug!(
            dma = %self.name,
            channel,
            counter,
            size,
            loc2ext,
            is_2d = cmd.is_2d,
            broadcast = cmd.broadcast,
            source = cmd.source,
            dest = cmd.dest,
            "command ready"
        );
        if !cmd.incr {
            tracing::warn!(
                dma = %self.name,
                channel,
                "fixed-address mode is not modeled, the transfer will increment"
            );
        }

        self.pending_bytes[counter] += size as i64;
        self.cmd_start(counter, ports, trace);
        self.channels[channel].pending.push(cmd_id);
        if loc2ext {
            self.nb_core_write_cmd += 1;
        } else {
            self.nb_core_read_cmd += 1;
        }
        self.check_queue(clock, timeline);
    }

    fn cmd_start(&mut self, counter: usize, ports: &mut dyn DmaPorts, trace: &mut dyn TraceSink) {
        trace.value_change(&self.counter_paths[counter], Some(1));
        self.nb_cmd_started += 1;
        if self.nb_cmd_started == 1 {
            ports.busy_line(true);
        }
    }

    fn handle_cmd_termination(
        &mut self,
        cmd_id: CmdId,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let counter = self.cmds[cmd_id].counter;
        trace.value_change(&self.counter_paths[counter], None);
        let before = self.nb_cmd_started;
        debug_assert!(before > 0, "command retired while none started");
        self.nb_cmd_started = (before - 1).max(0);
        if before == 1 {
            ports.busy_line(false);
        }
        self.cmds.release(cmd_id);
    }

    fn account_transferred(&mut self, cmd_id: CmdId, bytes: i64, ports: &mut dyn DmaPorts) {
        let counter = self.cmds[cmd_id].counter;
        self.pending_bytes[counter] -= bytes;
        tracing::trace!(
            dma = %self.name,
            counter,
            bytes,
            remaining = self.pending_bytes[counter],
            "retired bytes"
        );
        if self.pending_bytes[counter] < 0 {
            tracing::warn!(
                dma = %self.name,
                counter,
                count = self.pending_bytes[counter],
                "transfer counter went negative"
            );
        }
        if self.pending_bytes[counter] == 0 {
            // completion is signalled on every channel whatever the header's
            // broadcast bit says, matching the silicon
            let raise_irq = self.cmds[cmd_id].raise_irq;
            let raise_event = self.cmds[cmd_id].raise_event;
            for ch in 0..self.nb_channels {
                if ch == self.nb_channels - 1 {
                    ports.ext_irq_line();
                } else {
                    if raise_irq {
                        ports.irq_line(ch);
                    }
                    if raise_event {
                        ports.event_line(ch);
                    }
                }
            }
        }
    }

    // ---- counters ----------------------------------------------------------------

    fn alloc_counter(&mut self, channel: usize, tag: u64) -> Option<u32> {
        if self.free_counter_mask != 0 {
            Some(self.do_alloc_counter(channel))
        } else {
            tracing::debug!(dma = %self.name, channel, "no free counter, stalling core");
            self.parked_allocs.push_back((channel, tag));
            None
        }
    }

    fn do_alloc_counter(&mut self, channel: usize) -> u32 {
        let id = self.free_counter_mask.trailing_zeros();
        self.free_counter_mask &= !(1 << id);
        tracing::debug!(
            dma = %self.name,
            channel,
            counter = id,
            free = self.free_counter_mask,
            "allocated counter"
        );
        self.channels[channel].current_counter = id;
        id
    }

    fn free_counters(&mut self, counter_mask: u32, ports: &mut dyn DmaPorts) {
        self.free_counter_mask |= counter_mask & ((1 << NB_COUNTERS) - 1);
        tracing::debug!(
            dma = %self.name,
            mask = counter_mask,
            free = self.free_counter_mask,
            "freed counters"
        );
        // one parked allocation resumes per release, and only once a counter is
        // actually free
        if self.free_counter_mask != 0 {
            if let Some((channel, tag)) = self.parked_allocs.pop_front() {
                let id = self.do_alloc_counter(channel);
                ports.counter_alloc_resumed(channel, id, tag);
            }
        }
    }

    // ---- scheduling --------------------------------------------------------------

    fn sched(
        &self,
        event: EventId,
        delay: i64,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
    ) {
        if clock.is_enqueued(event) {
            return;
        }
        if let Err(err) = clock.enqueue(event, delay, timeline) {
            debug_assert!(false, "event schedule failed: {err}");
            tracing::error!(dma = %self.name, %err, "dropping event schedule");
        }
    }

    fn resched(
        &self,
        event: EventId,
        delay: i64,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
    ) {
        if let Err(err) = clock.reenqueue(event, delay, timeline) {
            debug_assert!(false, "event reschedule failed: {err}");
            tracing::error!(dma = %self.name, %err, "dropping event reschedule");
        }
    }

    /// Re-examines the four engine conditions and schedules the matching events.
    /// Called after every state change; events that are already pending stay put.
    fn check_queue(&mut self, clock: &mut ClockDomain<DmaEvent>, timeline: &mut Timeline) {
        let cycles = clock.cycles();

        if (self.nb_core_read_cmd > 0 && !self.pending_read_cmds.is_full())
            || (self.nb_core_write_cmd > 0 && !self.pending_write_cmds.is_full())
        {
            self.sched(self.ev_check_queue, 1, clock, timeline);
        }

        // the external interface throttles both directions through
        // ext_itf_next_req_time
        let ext_delay = (self.ext_itf_next_req_time - cycles).max(1);

        if (!self.pending_read_cmds.is_empty() && self.current_ext_read_cmd.is_none())
            || (self.current_ext_read_cmd.is_some()
                && self.nb_pending_ext_read_req < self.max_nb_ext_read_req)
        {
            if !self.ext_is_stalled {
                self.sched(self.ev_ext_read, ext_delay, clock, timeline);
            }
        }

        if (!self.pending_write_cmds.is_empty() && self.current_ext_write_cmd.is_none())
            || (self.current_ext_write_cmd.is_some()
                && self.nb_pending_ext_write_req < self.max_nb_ext_write_req
                && self.pending_loc_read_req.is_none())
        {
            if !self.ext_is_stalled {
                self.sched(self.ev_ext_write, ext_delay, clock, timeline);
            }
        }

        if !self.pending_write_reqs.is_empty() || self.pending_loc_read_req.is_some() {
            let min_ready = self.loc_port_ready_cycle.iter().copied().min().unwrap_or(0);
            let delay = if min_ready <= cycles {
                1
            } else {
                min_ready - cycles
            };
            self.sched(self.ev_loc_transfer, delay, clock, timeline);
        }
    }

    // ---- command promotion -------------------------------------------------------

    fn promote_command(
        &mut self,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        if self.nb_core_read_cmd > 0 && !self.pending_read_cmds.is_full() {
            self.move_to_global_queue(true, clock, timeline, ports, trace);
        } else if self.nb_core_write_cmd > 0 && !self.pending_write_cmds.is_full() {
            self.move_to_global_queue(false, clock, timeline, ports, trace);
        }
        self.check_queue(clock, timeline);
    }

    /// Round-robin over the channels from the scheduling cursor, moving the first
    /// matching command to the global queue. One command per event.
    fn move_to_global_queue(
        &mut self,
        read_queue: bool,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let mut channel = self.sched_core_queue;
        for _ in 0..self.nb_channels {
            if let Some(cmd_id) = self.pop_cmd(channel, read_queue, clock, timeline, ports, trace)
            {
                tracing::trace!(dma = %self.name, channel, "promoting command to global queue");
                if read_queue {
                    self.pending_read_cmds.push(cmd_id);
                } else {
                    self.pending_write_cmds.push(cmd_id);
                }
                self.sched_core_queue = (self.sched_core_queue + 1) % self.nb_channels;
                return;
            }
            channel = (channel + 1) % self.nb_channels;
        }
    }

    /// Pops a direction-matching command off a channel queue. Freed space absorbs the
    /// channel's parked CMD write, if any, resuming the stalled core.
    fn pop_cmd(
        &mut self,
        channel: usize,
        read_queue: bool,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) -> Option<CmdId> {
        // the read queue carries external-to-local commands
        let cmd_id = self.channels[channel]
            .pending
            .pop_direction(&self.cmds, !read_queue)?;
        if self.cmds[cmd_id].loc2ext {
            self.nb_core_write_cmd -= 1;
        } else {
            self.nb_core_read_cmd -= 1;
        }
        if let Some((word, tag)) = self.channels[channel].parked_write.take() {
            self.handle_cmd_word(channel, word, clock, timeline, ports, trace);
            ports.cmd_write_resumed(channel, tag);
        }
        Some(cmd_id)
    }

    // ---- external engine ---------------------------------------------------------

    fn check_ext_read(
        &mut self,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
    ) {
        if self.current_ext_read_cmd.is_none() {
            self.current_ext_read_cmd = self.pending_read_cmds.pop();
        }
        if self.current_ext_read_cmd.is_some()
            && self.nb_pending_ext_read_req < self.max_nb_ext_read_req
        {
            self.send_read_req(clock, timeline, ports);
        }
        self.check_queue(clock, timeline);
    }

    fn check_ext_write(&mut self, clock: &mut ClockDomain<DmaEvent>, timeline: &mut Timeline) {
        if self.current_ext_write_cmd.is_none() {
            self.current_ext_write_cmd = self.pending_write_cmds.pop();
        }
        if self.current_ext_write_cmd.is_some()
            && self.nb_pending_ext_write_req < self.max_nb_ext_write_req
            && self.pending_loc_read_req.is_none()
        {
            self.stage_write_req();
        }
        self.check_queue(clock, timeline);
    }

    fn chunk_size(&self, cmd_id: CmdId) -> u32 {
        let cmd = &self.cmds[cmd_id];
        let size = if cmd.is_2d {
            cmd.line_size_to_read
        } else {
            cmd.size_to_read
        };
        size.min(self.max_burst_length as u32)
    }

    /// Issues one read burst for the current external-read command.
    fn send_read_req(
        &mut self,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
    ) {
        let Some(cmd_id) = self.current_ext_read_cmd else {
            return;
        };
        let Some(req_id) = self.reqs.free_read.pop() else {
            debug_assert!(false, "read request pool drained below its limit");
            tracing::error!(dma = %self.name, "read request pool drained below its limit");
            return;
        };
        let size = self.chunk_size(cmd_id);
        self.nb_pending_ext_read_req += 1;

        let (ext_addr, loc_addr) = {
            let cmd = &mut self.cmds[cmd_id];
            let pair = (cmd.source, (cmd.dest as u32) & self.loc_addr_mask);
            cmd.advance(size);
            pair
        };
        if self.cmds[cmd_id].size_to_read == 0 {
            self.current_ext_read_cmd = None;
        }
        tracing::trace!(
            dma = %self.name,
            addr = ext_addr,
            size,
            "sending read burst to external interface"
        );

        let status = {
            let slot = &mut self.reqs.slots[req_id.idx()];
            slot.io.prepare();
            slot.io.addr = ext_addr;
            slot.io.size = size as usize;
            slot.cmd = cmd_id;
            slot.loc_addr = loc_addr;
            slot.done = 0;
            ports.ext_req(&mut slot.io, &mut slot.data[..size as usize])
        };
        match status {
            IoStatus::Ok => self.schedule_ext_req(req_id, clock, timeline),
            IoStatus::Denied => self.ext_is_stalled = true,
            IoStatus::Pending => {}
            IoStatus::Invalid => {
                tracing::warn!(
                    dma = %self.name,
                    addr = ext_addr,
                    size,
                    "external read burst faulted"
                );
            }
        }
    }

    /// Allocates and fills the cursor of one write burst for the current
    /// external-write command. The burst buffer is then loaded from local memory by
    /// the local ports before it goes out on the external bus.
    fn stage_write_req(&mut self) {
        let Some(cmd_id) = self.current_ext_write_cmd else {
            return;
        };
        let Some(req_id) = self.reqs.free_write.pop() else {
            debug_assert!(false, "write request pool drained below its limit");
            tracing::error!(dma = %self.name, "write request pool drained below its limit");
            return;
        };
        let size = self.chunk_size(cmd_id);
        self.nb_pending_ext_write_req += 1;

        let (ext_addr, loc_addr) = {
            let cmd = &mut self.cmds[cmd_id];
            let pair = (cmd.dest, (cmd.source as u32) & self.loc_addr_mask);
            cmd.advance(size);
            pair
        };
        if self.cmds[cmd_id].size_to_read == 0 {
            self.current_ext_write_cmd = None;
        }
        tracing::trace!(
            dma = %self.name,
            addr = ext_addr,
            size,
            "staging write burst for external interface"
        );

        let slot = &mut self.reqs.slots[req_id.idx()];
        slot.io.prepare();
        slot.io.addr = ext_addr;
        slot.io.size = size as usize;
        slot.cmd = cmd_id;
        slot.loc_addr = loc_addr;
        slot.done = 0;
        self.pending_loc_read_req = Some(req_id);
    }

    /// Sends a fully staged write burst to the external bus. Denied and pending
    /// answers both complete later through `ext_response`.
    fn send_staged_write(
        &mut self,
        req_id: ReqId,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
    ) {
        let status = {
            let slot = &mut self.reqs.slots[req_id.idx()];
            let size = slot.io.size;
            ports.ext_req(&mut slot.io, &mut slot.data[..size])
        };
        if status == IoStatus::Ok {
            self.schedule_ext_req(req_id, clock, timeline);
        }
    }

    /// Parks an answered request until its reported latency has elapsed, keeping the
    /// pending list ordered by trigger cycle, and pushes the external interface's
    /// next-request time out by the reported duration.
    fn schedule_ext_req(
        &mut self,
        req_id: ReqId,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
    ) {
        let cycles = clock.cycles();
        let (duration, full_latency) = {
            let io = &self.reqs.slots[req_id.idx()].io;
            (io.duration, io.full_latency())
        };
        self.ext_itf_next_req_time = cycles + duration;
        let trigger = cycles + full_latency;
        self.reqs.slots[req_id.idx()].trigger_cycle = trigger;

        let pos = self
            .pending_ext_reqs
            .iter()
            .position(|&id| self.reqs.slots[id.idx()].trigger_cycle > trigger)
            .unwrap_or(self.pending_ext_reqs.len());
        self.pending_ext_reqs.insert(pos, req_id);

        // a new head carries the earliest trigger, so the wakeup moves up
        if pos == 0 {
            self.resched(self.ev_ext_req, full_latency.max(1), clock, timeline);
        }
    }

    /// Fires the pending external requests whose trigger cycle has passed: completed
    /// reads start draining to local memory, completed writes retire command bytes.
    fn handle_due_ext_reqs(
        &mut self,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let cycles = clock.cycles();
        while let Some(&req_id) = self.pending_ext_reqs.front() {
            if self.reqs.slots[req_id.idx()].trigger_cycle > cycles {
                break;
            }
            self.pending_ext_reqs.pop_front();
            if self.reqs.slots[req_id.idx()].io.is_write {
                self.handle_ext_write_req_end(req_id, ports, trace);
            } else {
                self.pending_write_reqs.push_back(req_id);
            }
        }
        if let Some(&head) = self.pending_ext_reqs.front() {
            let delay = self.reqs.slots[head.idx()].trigger_cycle - cycles;
            self.sched(self.ev_ext_req, delay, clock, timeline);
        }
        self.check_queue(clock, timeline);
    }

    fn handle_ext_write_req_end(
        &mut self,
        req_id: ReqId,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let (cmd_id, size) = {
            let slot = &self.reqs.slots[req_id.idx()];
            (slot.cmd, slot.io.size as u32)
        };
        let finished = {
            let cmd = &mut self.cmds[cmd_id];
            cmd.size_to_write -= size;
            cmd.size_to_write == 0
        };
        self.reqs.free_write.push(req_id);
        self.nb_pending_ext_write_req -= 1;
        self.account_transferred(cmd_id, size as i64, ports);
        if finished {
            self.handle_cmd_termination(cmd_id, ports, trace);
        }
    }

    // ---- local ports ---------------------------------------------------------------

    /// Walks the local ports and moves up to one 4-byte beat through each free one.
    /// Ports 0 and 1 drain arrived read data into local memory; ports 2 and up load
    /// the write-staging buffer from local memory. Several ports advance the same
    /// request within one event via its `done` cursor.
    fn check_loc_transfer(
        &mut self,
        clock: &mut ClockDomain<DmaEvent>,
        timeline: &mut Timeline,
        ports: &mut dyn DmaPorts,
        trace: &mut dyn TraceSink,
    ) {
        let cycles = clock.cycles();
        for port in 0..self.nb_loc_ports {
            if self.loc_port_ready_cycle[port] > cycles {
                continue;
            }
            let (req_id, is_write) = if port < 2 {
                match self.pending_write_reqs.front() {
                    Some(&id) => (id, true),
                    None => continue,
                }
            } else {
                match self.pending_loc_read_req {
                    Some(id) => (id, false),
                    None => continue,
                }
            };

            let (done, total, loc_base, cmd_id) = {
                let slot = &self.reqs.slots[req_id.idx()];
                (slot.done, slot.io.size as u32, slot.loc_addr, slot.cmd)
            };
            let remaining = total - done;
            let addr = loc_base.wrapping_add(done);
            // beats never cross a 4-byte boundary
            let size = (4 - (addr & 0x3)).min(remaining);

            let mut beat = if is_write {
                IoReq::write(addr as u64, size as usize)
            } else {
                IoReq::read(addr as u64, size as usize)
            };
            let status = {
                let slot = &mut self.reqs.slots[req_id.idx()];
                let lo = done as usize;
                ports.loc_req(port, &mut beat, &mut slot.data[lo..lo + size as usize])
            };
            if status == IoStatus::Ok {
                self.loc_port_ready_cycle[port] = cycles + beat.latency + 1;
            }

            if is_write {
                let finished_cmd = {
                    let cmd = &mut self.cmds[cmd_id];
                    cmd.size_to_write -= size;
                    cmd.size_to_write == 0
                };
                self.account_transferred(cmd_id, size as i64, ports);
                if finished_cmd {
                    self.handle_cmd_termination(cmd_id, ports, trace);
                }
                if remaining == size {
                    self.pending_write_reqs.pop_front();
                    self.reqs.free_read.push(req_id);
                    self.nb_pending_ext_read_req -= 1;
                } else {
                    self.reqs.slots[req_id.idx()].done = done + size;
                }
            } else if remaining == size {
                self.pending_loc_read_req = None;
                self.send_staged_write(req_id, clock, timeline, ports);
            } else {
                self.reqs.slots[req_id.idx()].done = done + size;
            }
        }
        self.check_queue(clock, timeline);
    }
}

/// The register file is word-sized; accesses carry exactly four bytes.
fn reg_word(data: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[..4]);
    u32::from_le_bytes(word)
}
