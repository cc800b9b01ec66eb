//! Happy-path stage runs: ordering, backpressure, and completion.

use bulkstage::{Stage, StepConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::init_logging;

#[test]
fn test_three_step_identity_preserves_order_across_parallelism() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);

    let stage = Stage::builder("identity")
        .producer_iter("read", 0u64..1000)
        .step(
            "shuffle-workers",
            StepConfig::new().with_parallelism(4).with_queue_capacity(8),
            |n| {
                // Uneven latency so the workers genuinely race.
                if n % 13 == 0 {
                    std::thread::sleep(Duration::from_micros(300));
                }
                Ok(n)
            },
        )
        .sink("collect", StepConfig::new().with_queue_capacity(8), move |n| {
            sink_seen.lock().push(n);
            Ok(())
        })
        .build()
        .unwrap();

    stage.run().unwrap();

    assert_eq!(*seen.lock(), (0u64..1000).collect::<Vec<_>>());
    for step in stage.steps() {
        assert!(step.is_completed(), "step '{}' not completed", step.name());
    }
    // The middle step forwarded every batch; the producer issued them all.
    assert_eq!(stage.steps()[1].stats().done, 1000);
    assert_eq!(stage.steps()[0].stats().done, 1000);
}

#[test]
fn test_slow_sink_applies_backpressure_to_producer() {
    init_logging();
    let stage = Stage::builder("throttled")
        .producer_iter("read", 0u64..50)
        .step("relay", StepConfig::new().with_queue_capacity(2), |n| Ok(n))
        .sink("slow-write", StepConfig::new().with_queue_capacity(2), |_| {
            std::thread::sleep(Duration::from_millis(2));
            Ok(())
        })
        .build()
        .unwrap();

    stage.run().unwrap();

    // With a 2ms sink and capacity-2 queues, upstream spends most of the
    // run blocked; the counters must show it.
    let relay = stage.steps()[1].stats();
    assert!(
        relay.blocked_time > Duration::ZERO,
        "relay never blocked: {relay:?}"
    );
    assert_eq!(stage.steps()[2].stats().done, 50);
}

#[test]
fn test_empty_input_completes() {
    init_logging();
    let stage = Stage::builder("empty")
        .producer_iter("read", std::iter::empty::<u64>())
        .step("noop", StepConfig::new().with_parallelism(3), |n| Ok(n))
        .sink("drop", StepConfig::new(), |_| Ok(()))
        .build()
        .unwrap();

    stage.run().unwrap();
    for step in stage.steps() {
        assert!(step.is_completed());
        assert_eq!(step.stats().done, 0);
    }
}

#[test]
fn test_stats_visible_during_run() {
    init_logging();
    let stage = Arc::new(
        Stage::builder("observed")
            .producer_iter("read", 0u64..200)
            .sink("slow-drop", StepConfig::new().with_queue_capacity(4), |_| {
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            })
            .build()
            .unwrap(),
    );

    let runner = {
        let stage = Arc::clone(&stage);
        std::thread::spawn(move || stage.run())
    };
    std::thread::sleep(Duration::from_millis(50));
    let mid_run = stage.steps()[1].stats();
    assert_eq!(mid_run.parallelism, 1);
    assert!(mid_run.queued <= 4, "queue overran its capacity: {mid_run:?}");
    assert!(mid_run.done > 0, "no progress after 50ms: {mid_run:?}");

    runner.join().unwrap().unwrap();
    assert_eq!(stage.steps()[1].stats().done, 200);
}
