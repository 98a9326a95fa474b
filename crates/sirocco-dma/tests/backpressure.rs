//! Stall paths: full command queues parking the core, denied and pending external
//! requests, and the always-broadcast completion lines.

use sirocco_core::{Config, IoReq, IoStatus, TraceSink};
use sirocco_dma::{
    DmaController, DmaEvent, DmaPorts, CMD_EVENT_ENABLE, CMD_INC, CMD_IRQ_ENABLE, CMD_OFFSET,
    CMD_TYPE_EXT2LOC,
};
use sirocco_time::{ClockConfig, ClockDomain, Timeline};

const MEM_SIZE: usize = 0x1_0000;

struct TestPorts {
    loc_mem: Vec<u8>,
    ext_mem: Vec<u8>,
    /// Answer this many external reads with `Denied`, recording them in `held`.
    deny_reads: usize,
    /// Answer every external read with `Pending`, recording it in `held`.
    hold_reads: bool,
    held: Vec<(u64, u64, usize)>,
    ext_reads: usize,
    busy_log: Vec<bool>,
    events: Vec<usize>,
    irqs: Vec<usize>,
    ext_irqs: usize,
    resumed_writes: Vec<(usize, u64)>,
}

impl TestPorts {
    fn new() -> Self {
        let mut loc_mem = vec![0u8; MEM_SIZE];
        let mut ext_mem = vec![0u8; MEM_SIZE];
        for (i, b) in loc_mem.iter_mut().enumerate() {
            *b = i as u8;
        }
        for (i, b) in ext_mem.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13).wrapping_add(1);
        }
        Self {
            loc_mem,
            ext_mem,
            deny_reads: 0,
            hold_reads: false,
            held: Vec::new(),
            ext_reads: 0,
            busy_log: Vec::new(),
            events: Vec::new(),
            irqs: Vec::new(),
            ext_irqs: 0,
            resumed_writes: Vec::new(),
        }
    }
}

impl DmaPorts for TestPorts {
    fn ext_req(&mut self, req: &mut IoReq, data: &mut [u8]) -> IoStatus {
        let lo = req.addr as usize;
        let hi = lo + req.size;
        assert!(hi <= self.ext_mem.len(), "external access out of range");
        if !req.is_write {
            self.ext_reads += 1;
            if self.deny_reads > 0 {
                self.deny_reads -= 1;
                self.held.push((req.tag, req.addr, req.size));
                return IoStatus::Denied;
            }
            if self.hold_reads {
                self.held.push((req.tag, req.addr, req.size));
                return IoStatus::Pending;
            }
            data.copy_from_slice(&self.ext_mem[lo..hi]);
        } else {
            self.ext_mem[lo..hi].copy_from_slice(data);
        }
        IoStatus::Ok
    }

    fn loc_req(&mut self, _port: usize, req: &mut IoReq, data: &mut [u8]) -> IoStatus {
        let lo = req.addr as usize;
        let hi = lo + req.size;
        assert!(hi <= self.loc_mem.len(), "local access out of range");
        if req.is_write {
            self.loc_mem[lo..hi].copy_from_slice(data);
        } else {
            data.copy_from_slice(&self.loc_mem[lo..hi]);
        }
        IoStatus::Ok
    }

    fn event_line(&mut self, channel: usize) {
        self.events.push(channel);
    }

    fn irq_line(&mut self, channel: usize) {
        self.irqs.push(channel);
    }

    fn ext_irq_line(&mut self) {
        self.ext_irqs += 1;
    }

    fn busy_line(&mut self, busy: bool) {
        self.busy_log.push(busy);
    }

    fn cmd_write_resumed(&mut self, channel: usize, tag: u64) {
        self.resumed_writes.push((channel, tag));
    }
}

struct NoopTrace;

impl TraceSink for NoopTrace {
    fn value_change(&mut self, _path: &str, _value: Option<u64>) {}
}

struct Bench {
    timeline: Timeline,
    clock: ClockDomain<DmaEvent>,
    dma: DmaController,
    ports: TestPorts,
    trace: NoopTrace,
}

fn bench(nb_channels: usize, core_queue_depth: usize) -> Bench {
    let cfg = Config::parse(&format!(
        r#"{{
            "nb_channels": {nb_channels},
            "core_queue_depth": {core_queue_depth},
            "global_queue_depth": 2,
            "is_64": false,
            "max_nb_ext_read_req": 2,
            "max_nb_ext_write_req": 2,
            "max_burst_length": 64,
            "nb_loc_ports": 4,
            "loc_addr_width": 16
        }}"#
    ))
    .unwrap();
    let mut timeline = Timeline::new();
    let mut clock = ClockDomain::new(
        "dma",
        ClockConfig {
            frequency_hz: 1_000_000_000,
            wheel_len: 64,
        },
        &mut timeline,
    )
    .unwrap();
    let dma = DmaController::new("dma", &cfg, &mut clock).unwrap();
    Bench {
        timeline,
        clock,
        dma,
        ports: TestPorts::new(),
        trace: NoopTrace,
    }
}

fn run_until_idle(b: &mut Bench) {
    for _ in 0..100_000 {
        let Some(client) = b.timeline.pop_due() else {
            return;
        };
        assert_eq!(client, b.clock.client());
        b.clock.begin_exec();
        while let Some(event) = b.clock.pop_due() {
            b.dma.handle(
                event,
                &mut b.clock,
                &mut b.timeline,
                &mut b.ports,
                &mut b.trace,
            );
        }
        let again = b.clock.end_exec(b.timeline.time());
        b.timeline.complete(b.clock.client(), again);
    }
    panic!("controller did not settle");
}

fn write_reg_tagged(b: &mut Bench, channel: usize, value: u32, tag: u64) -> IoStatus {
    let mut req = IoReq::write(CMD_OFFSET, 4);
    req.tag = tag;
    let mut data = value.to_le_bytes();
    b.dma.access(
        channel,
        &mut req,
        &mut data,
        &mut b.clock,
        &mut b.timeline,
        &mut b.ports,
        &mut b.trace,
    )
}

fn write_cmd(b: &mut Bench, channel: usize, value: u32) -> IoStatus {
    write_reg_tagged(b, channel, value, 0)
}

fn alloc_counter(b: &mut Bench, channel: usize) -> u32 {
    let mut req = IoReq::read(CMD_OFFSET, 4);
    let mut data = [0u8; 4];
    let status = b.dma.access(
        channel,
        &mut req,
        &mut data,
        &mut b.clock,
        &mut b.timeline,
        &mut b.ports,
        &mut b.trace,
    );
    assert_eq!(status, IoStatus::Ok);
    u32::from_le_bytes(data)
}

/// Completes a read the mock held back, feeding it the external bytes the target
/// would have returned.
fn complete_held_read(b: &mut Bench, index: usize) {
    let (tag, addr, size) = b.ports.held[index];
    let data = b.ports.ext_mem[addr as usize..addr as usize + size].to_vec();
    b.dma.ext_response(
        tag,
        &data,
        &mut b.clock,
        &mut b.timeline,
        &mut b.ports,
        &mut b.trace,
    );
}

#[test]
fn full_core_queue_stalls_and_resumes_the_command_stream() {
    let mut b = bench(1, 1);
    assert_eq!(alloc_counter(&mut b, 0), 0);

    // first command fills the depth-one channel queue
    for word in [16 | CMD_INC, 0x0, 0x9000] {
        assert_eq!(write_cmd(&mut b, 0, word), IoStatus::Ok);
    }
    // the next stream's header parks and stalls the core
    let header_b = 16 | CMD_INC | CMD_TYPE_EXT2LOC;
    assert_eq!(write_reg_tagged(&mut b, 0, header_b, 77), IoStatus::Pending);

    run_until_idle(&mut b);
    // promotion freed a slot, absorbed the parked word and resumed the core
    assert_eq!(b.ports.resumed_writes, vec![(0, 77)]);
    assert_eq!(b.ports.ext_mem[0x9000..0x9010], b.ports.loc_mem[0x0..0x10]);

    // the resumed core streams the rest of its command
    assert_eq!(write_cmd(&mut b, 0, 0x40), IoStatus::Ok);
    assert_eq!(write_cmd(&mut b, 0, 0x9100), IoStatus::Ok);
    run_until_idle(&mut b);

    assert_eq!(b.ports.loc_mem[0x40..0x50], b.ports.ext_mem[0x9100..0x9110]);
    assert_eq!(b.ports.busy_log, vec![true, false, true, false]);
    // the shared counter drained twice, once per command
    assert_eq!(b.ports.ext_irqs, 2);
}

#[test]
fn denied_external_read_stalls_the_engine_until_granted() {
    let mut b = bench(1, 2);
    b.ports.deny_reads = 1;
    assert_eq!(alloc_counter(&mut b, 0), 0);

    for word in [128 | CMD_INC | CMD_TYPE_EXT2LOC, 0x500, 0x3000] {
        assert_eq!(write_cmd(&mut b, 0, word), IoStatus::Ok);
    }
    run_until_idle(&mut b);

    // the first burst was refused and nothing else went out while stalled
    assert_eq!(b.ports.held.len(), 1);
    assert_eq!(b.ports.held[0].1, 0x3000);
    assert_eq!(b.ports.held[0].2, 64);
    assert_eq!(b.ports.ext_reads, 1);
    assert!(b.dma.busy());

    let Bench {
        timeline, clock, dma, ..
    } = &mut b;
    dma.ext_grant(clock, timeline);
    run_until_idle(&mut b);

    // the second burst proceeded on its own; the refused one is still out
    assert_eq!(b.ports.ext_reads, 2);
    assert_eq!(b.ports.loc_mem[0x540..0x580], b.ports.ext_mem[0x3040..0x3080]);
    assert!(b.dma.busy());

    // the target finally answers the burst it refused
    complete_held_read(&mut b, 0);
    run_until_idle(&mut b);

    assert_eq!(b.ports.loc_mem[0x500..0x540], b.ports.ext_mem[0x3000..0x3040]);
    assert!(!b.dma.busy());
    assert_eq!(b.ports.ext_irqs, 1);
}

#[test]
fn pending_external_read_completes_through_the_response_path() {
    let mut b = bench(1, 2);
    b.ports.hold_reads = true;
    assert_eq!(alloc_counter(&mut b, 0), 0);

    for word in [64 | CMD_INC | CMD_TYPE_EXT2LOC, 0x600, 0x2800] {
        assert_eq!(write_cmd(&mut b, 0, word), IoStatus::Ok);
    }
    run_until_idle(&mut b);

    // the burst is accepted but not answered, the engine sits on it
    assert_eq!(b.ports.held.len(), 1);
    assert!(b.dma.busy());
    assert_eq!(b.ports.loc_mem[0x600], 0x00);

    complete_held_read(&mut b, 0);
    run_until_idle(&mut b);

    assert_eq!(b.ports.loc_mem[0x600..0x640], b.ports.ext_mem[0x2800..0x2840]);
    assert_eq!(b.ports.busy_log, vec![true, false]);
    assert_eq!(b.ports.ext_irqs, 1);
}

#[test]
fn completion_broadcast_reaches_every_channel() {
    let mut b = bench(3, 2);
    assert_eq!(alloc_counter(&mut b, 1), 0);

    let header = 32 | CMD_INC | CMD_TYPE_EXT2LOC | CMD_EVENT_ENABLE | CMD_IRQ_ENABLE;
    for word in [header, 0x700, 0x4800] {
        assert_eq!(write_cmd(&mut b, 1, word), IoStatus::Ok);
    }
    run_until_idle(&mut b);

    assert_eq!(b.ports.loc_mem[0x700..0x720], b.ports.ext_mem[0x4800..0x4820]);
    // every channel signals, not just the issuing one: the last channel owns the
    // external irq line, the rest raise their enabled lines
    assert_eq!(b.ports.events, vec![0, 1]);
    assert_eq!(b.ports.irqs, vec![0, 1]);
    assert_eq!(b.ports.ext_irqs, 1);
}
