//! Cross-component scheduling: several clock domains and a timer queue sharing one
//! timeline must interleave strictly by simulated time.

use sirocco_time::{ClockConfig, ClockDomain, Timeline, TimerQueue};

#[test]
fn domains_and_timers_interleave_in_time_order() {
    let mut tl = Timeline::new();
    let mut fast: ClockDomain<&'static str> = ClockDomain::new(
        "fast",
        ClockConfig {
            frequency_hz: 1_000_000_000,
            wheel_len: 64,
        },
        &mut tl,
    )
    .unwrap();
    let mut slow: ClockDomain<&'static str> = ClockDomain::new(
        "slow",
        ClockConfig {
            frequency_hz: 250_000_000,
            wheel_len: 64,
        },
        &mut tl,
    )
    .unwrap();
    let mut timers: TimerQueue<&'static str> = TimerQueue::new("timers", &mut tl);

    let f2 = fast.new_event("fast@2");
    let f5 = fast.new_event("fast@5");
    let s1 = slow.new_event("slow@1");
    let s2 = slow.new_event("slow@2");
    fast.enqueue(f2, 2, &mut tl).unwrap();
    fast.enqueue(f5, 5, &mut tl).unwrap();
    slow.enqueue(s1, 1, &mut tl).unwrap();
    slow.enqueue(s2, 2, &mut tl).unwrap();
    timers.schedule(6_500, "timer", &mut tl).unwrap();

    let mut log = Vec::new();
    while let Some(client) = tl.pop_due() {
        let now = tl.time();
        if client == timers.client() {
            while let Some(name) = timers.pop_due(now) {
                log.push((name, now));
            }
            tl.complete(client, timers.next_delay(now));
        } else {
            let domain = if client == fast.client() {
                &mut fast
            } else {
                &mut slow
            };
            domain.begin_exec();
            while let Some(name) = domain.pop_due() {
                log.push((name, now));
            }
            let next = domain.end_exec(now);
            tl.complete(client, next);
        }
    }

    assert_eq!(
        log,
        vec![
            ("fast@2", 2_000),
            ("slow@1", 4_000),
            ("fast@5", 5_000),
            ("timer", 6_500),
            ("slow@2", 8_000),
        ]
    );
}

#[test]
fn gated_domain_resumes_under_timer_control() {
    let mut tl = Timeline::new();
    let mut cpu: ClockDomain<&'static str> = ClockDomain::new(
        "cpu",
        ClockConfig {
            frequency_hz: 1_000_000_000,
            wheel_len: 64,
        },
        &mut tl,
    )
    .unwrap();
    let mut timers: TimerQueue<&'static str> = TimerQueue::new("pmu", &mut tl);

    let work = cpu.new_event("work");
    cpu.enqueue(work, 10, &mut tl).unwrap();
    cpu.set_frequency(0, &mut tl).unwrap();
    assert!(cpu.has_events());

    // A power-management timer ungates the domain at 2 GHz after 4 ns of sleep.
    timers.schedule(4_000, "ungate", &mut tl).unwrap();

    let mut log = Vec::new();
    while let Some(client) = tl.pop_due() {
        let now = tl.time();
        if client == timers.client() {
            while let Some(name) = timers.pop_due(now) {
                assert_eq!(name, "ungate");
                cpu.set_frequency(2_000_000_000, &mut tl).unwrap();
            }
            tl.complete(client, timers.next_delay(now));
        } else {
            cpu.begin_exec();
            while let Some(name) = cpu.pop_due() {
                log.push((name, now));
            }
            let next = cpu.end_exec(now);
            tl.complete(client, next);
        }
    }

    // Ten pending ticks at the new 500 ps period, counted from the ungate time.
    assert_eq!(log, vec![("work", 9_000)]);
    assert_eq!(cpu.cycles(), 10);
}
