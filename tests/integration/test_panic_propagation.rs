//! Failure paths: transform errors, worker panics, and external aborts
//! must tear the whole stage down promptly without hanging.

use anyhow::anyhow;
use bulkstage::{PanicCause, Stage, StageError, StepConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::init_logging;

#[test]
fn test_failure_mid_stream_fails_stage_without_hanging() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);

    let stage = Stage::builder("identity")
        .producer_iter("read", 0u64..1000)
        .step(
            "check",
            StepConfig::new().with_parallelism(4).with_queue_capacity(8),
            |n| {
                if n == 500 {
                    Err(anyhow!("injected failure at batch 500"))
                } else {
                    Ok(n)
                }
            },
        )
        .sink("collect", StepConfig::new().with_queue_capacity(8), move |n| {
            sink_seen.lock().push(n);
            Ok(())
        })
        .build()
        .unwrap();

    let error = stage.run().err().expect("stage must fail");
    assert!(error.to_string().contains("injected failure at batch 500"), "{error}");
    let StageError::Panicked { step, .. } = &error else {
        panic!("expected Panicked, got {error}");
    };
    assert_eq!(step, "check");

    // Neither neighbor of the failed step may report completion.
    assert!(!stage.steps()[0].is_completed());
    assert!(!stage.steps()[2].is_completed());
    // The sink saw an in-order prefix at most, never batch 500 or later.
    let seen = seen.lock();
    assert!(seen.iter().all(|&n| n < 500), "sink saw post-failure batches: {seen:?}");
    assert!(seen.windows(2).all(|w| w[1] == w[0] + 1), "sink saw out-of-order batches");
}

#[test]
fn test_worker_panic_is_reported_as_stage_error() {
    init_logging();
    let stage = Stage::builder("explosive")
        .producer_iter("read", 0u64..100)
        .step("boom", StepConfig::new().with_parallelism(2), |n| {
            assert!(n != 42, "refusing the answer");
            Ok(n)
        })
        .sink("drop", StepConfig::new(), |_| Ok(()))
        .build()
        .unwrap();

    let error = stage.run().err().expect("stage must fail");
    assert!(error.to_string().contains("refusing the answer"), "{error}");
}

#[test]
fn test_producer_error_fails_stage() {
    init_logging();
    let mut next = 0u64;
    let stage = Stage::builder("bad-input")
        .producer("read", move || {
            next += 1;
            if next > 10 {
                Err(anyhow!("source exhausted unexpectedly"))
            } else {
                Ok(Some(next))
            }
        })
        .sink("drop", StepConfig::new(), |_| Ok(()))
        .build()
        .unwrap();

    let error = stage.run().err().expect("stage must fail");
    assert!(error.to_string().contains("source exhausted unexpectedly"), "{error}");
    let StageError::Panicked { step, .. } = &error else {
        panic!("expected Panicked, got {error}");
    };
    assert_eq!(step, "read");
}

#[test]
fn test_external_panic_unblocks_backpressured_stage() {
    init_logging();
    // Infinite producer against a slow sink: without an abort this stage
    // never ends, and upstream is permanently parked on full queues.
    let stage = Arc::new(
        Stage::builder("endless")
            .producer("read", move || Ok(Some(0u64)))
            .step("relay", StepConfig::new().with_queue_capacity(2), |n| Ok(n))
            .sink("slow-write", StepConfig::new().with_queue_capacity(2), |_| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(())
            })
            .build()
            .unwrap(),
    );

    let runner = {
        let stage = Arc::clone(&stage);
        std::thread::spawn(move || stage.run())
    };
    std::thread::sleep(Duration::from_millis(100));
    stage.steps()[2].receive_panic(PanicCause::new(anyhow!("external abort")));

    let error = runner.join().unwrap().err().expect("stage must fail");
    assert!(error.to_string().contains("external abort"), "{error}");
    assert!(stage.steps().iter().all(|step| !step.is_completed()));
}

#[test]
fn test_first_cause_wins_over_cascading_failures() {
    init_logging();
    // Both the transform and the sink can fail; whichever reports first is
    // the stage error, and the run still terminates cleanly.
    let stage = Stage::builder("racing-failures")
        .producer_iter("read", 0u64..100)
        .step("early-fail", StepConfig::new().with_parallelism(2), |n| {
            if n == 10 {
                Err(anyhow!("primary failure"))
            } else {
                Ok(n)
            }
        })
        .sink("late-fail", StepConfig::new(), |n| {
            if n == 50 {
                Err(anyhow!("secondary failure"))
            } else {
                Ok(())
            }
        })
        .build()
        .unwrap();

    let error = stage.run().err().expect("stage must fail");
    // The sink never reaches batch 50 because the stage dies at batch 10.
    assert!(error.to_string().contains("primary failure"), "{error}");
}
