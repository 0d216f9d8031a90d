//! End-to-End Engine Integration Tests
//!
//! Drives a synchronous engine block by block:
//! - Signal flow through plain, joint and virtual connections
//! - Suspension and resumption
//! - Feedback cycles
//! - Flow jobs, boundary jobs, probes and timers
//! - Reconfiguration

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use approx::assert_abs_diff_eq;
use parking_lot::Mutex;
use sigflow_engine::{Engine, EngineError, Job, ModuleFlags, ProbeData};

use common::*;

fn engine() -> Engine {
    init_logging();
    Engine::new_synchronous(test_config()).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNAL FLOW
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_source_to_consumer() {
    let engine = engine();
    let bs = engine.block_size();
    let (src, _) = const_source(0.25);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();

    let log = log.lock();
    assert_eq!(log.calls, vec![(1, bs)]);
    assert_eq!(log.samples.len(), bs);
    for v in &log.samples {
        assert_abs_diff_eq!(*v, 0.25);
    }
    assert_eq!(engine.tick_stamp(), 1 + bs as u64);
    assert_eq!(engine.n_integrated(), 2);
    assert!(sink.has_source(0));
    assert!(src.is_scheduled());
    assert_eq!(src.tick_stamp(), 1 + bs as u64);
}

#[test]
fn test_unconnected_input_reads_silence() {
    let engine = engine();
    let (sink, log) = recorder();
    engine.transact([Job::integrate(&sink), Job::set_consumer(&sink)]);
    engine.render(2).unwrap();

    let log = log.lock();
    assert_eq!(log.calls.len(), 2);
    assert!(log.samples.iter().all(|v| *v == 0.0));
}

#[test]
fn test_chain_through_processor() {
    let engine = engine();
    let src = ramp_source();
    let amp = gain(2.0, 1.0, ModuleFlags::CHEAP);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&amp),
        Job::integrate(&sink),
        Job::connect(&src, 0, &amp, 0).unwrap(),
        Job::connect(&amp, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(2).unwrap();

    let log = log.lock();
    for (i, v) in log.samples.iter().enumerate() {
        assert_abs_diff_eq!(*v, 1.0 + 2.0 * (1 + i) as f32);
    }
}

#[test]
fn test_joint_inputs_are_mixed() {
    let engine = engine();
    let (a, _) = const_source(1.0);
    let (b, _) = const_source(2.0);
    let mix = mixer();
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&a),
        Job::integrate(&b),
        Job::integrate(&mix),
        Job::integrate(&sink),
        Job::jconnect(&a, 0, &mix, 0).unwrap(),
        Job::jconnect(&b, 0, &mix, 0).unwrap(),
        Job::connect(&mix, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();
    assert!(log.lock().samples.iter().all(|v| *v == 3.0));

    log.lock().samples.clear();
    engine.transact([Job::jdisconnect(&mix, 0, &a, 0).unwrap()]);
    engine.render(1).unwrap();
    assert!(log.lock().samples.iter().all(|v| *v == 2.0));
}

#[test]
fn test_virtual_module_passes_through() {
    let engine = engine();
    let bs = engine.block_size();
    let src = ramp_source();
    let pass = sigflow_engine::Module::new_virtual(1).unwrap();
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&pass),
        Job::integrate(&sink),
        Job::connect(&src, 0, &pass, 0).unwrap(),
        Job::connect(&pass, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();

    let log = log.lock();
    assert_eq!(log.samples.len(), bs);
    for (i, v) in log.samples.iter().enumerate() {
        assert_abs_diff_eq!(*v, (1 + i) as f32);
    }
    assert!(src.is_scheduled());
}

#[test]
fn test_virtual_module_rejects_timed_jobs() {
    let pass = sigflow_engine::Module::new_virtual(2).unwrap();
    assert!(matches!(Job::suspend_now(&pass), Err(EngineError::VirtualModule(_))));
    assert!(Job::flow_access(&pass, 10, |_| {}).is_err());
}

#[test]
fn test_out_of_range_stream_refused_eagerly() {
    let (src, _) = const_source(0.0);
    let (sink, _) = recorder();
    assert!(matches!(
        Job::connect(&src, 1, &sink, 0),
        Err(EngineError::StreamOutOfRange { .. })
    ));
    assert!(Job::connect(&src, 0, &sink, 3).is_err());
}

// ═══════════════════════════════════════════════════════════════════════════════
// SUSPEND / RESUME
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_suspend_silences_and_resume_restores() {
    let engine = engine();
    let bs = engine.block_size();
    let (src, resets) = const_source(0.5);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();
    assert!(log.lock().samples.iter().all(|v| *v == 0.5));

    engine.transact([Job::suspend_now(&src).unwrap()]);
    log.lock().samples.clear();
    engine.render(1).unwrap();
    {
        let log = log.lock();
        assert_eq!(log.samples.len(), bs);
        assert!(log.samples.iter().all(|v| *v == 0.0));
    }

    let now = engine.tick_stamp();
    engine.transact([Job::resume_at(&src, now).unwrap()]);
    log.lock().samples.clear();
    engine.render(1).unwrap();
    assert!(log.lock().samples.iter().all(|v| *v == 0.5));
    assert!(resets.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_unconsumed_module_is_not_processed() {
    let engine = engine();
    let (sink, log) = recorder();
    engine.transact([Job::integrate(&sink)]);
    engine.render(2).unwrap();
    assert!(log.lock().calls.is_empty());
    assert!(!sink.is_scheduled());

    engine.transact([Job::set_consumer(&sink)]);
    engine.render(1).unwrap();
    assert_eq!(log.lock().calls.len(), 1);

    engine.transact([Job::unset_consumer(&sink)]);
    engine.render(1).unwrap();
    assert_eq!(log.lock().calls.len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// FEEDBACK
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_feedback_with_delay_processes() {
    let engine = engine();
    let a = gain(0.5, 1.0, ModuleFlags::DELAY);
    let b = gain(1.0, 0.0, ModuleFlags::CHEAP);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&a),
        Job::integrate(&b),
        Job::integrate(&sink),
        Job::connect(&a, 0, &b, 0).unwrap(),
        Job::connect(&b, 0, &a, 0).unwrap(),
        Job::connect(&b, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    let start = engine.tick_stamp();
    let end = engine.render(4).unwrap();
    assert_eq!(end, start + 4 * engine.block_size() as u64);

    let log = log.lock();
    assert_eq!(log.calls.len(), 4);
    assert!(log.samples.iter().all(|v| v.is_finite() && (0.0..=2.0).contains(v)));
    assert!(log.samples.iter().any(|v| *v >= 1.0));
    assert!(a.is_scheduled() && b.is_scheduled());
}

#[test]
fn test_feedback_without_delay_halts_until_fixed() {
    let engine = engine();
    let a = gain(0.5, 1.0, ModuleFlags::CHEAP);
    let b = gain(1.0, 0.0, ModuleFlags::CHEAP);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&a),
        Job::integrate(&b),
        Job::integrate(&sink),
        Job::connect(&a, 0, &b, 0).unwrap(),
        Job::connect(&b, 0, &a, 0).unwrap(),
        Job::connect(&b, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    let start = engine.tick_stamp();
    assert_eq!(engine.render(3).unwrap(), start);
    assert!(log.lock().calls.is_empty());

    engine.transact([Job::disconnect(&a, 0).unwrap()]);
    assert!(engine.render(1).unwrap() > start);
    assert_eq!(log.lock().calls.len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TIMED JOBS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_flow_job_splits_block() {
    let engine = engine();
    let bs = engine.block_size();
    let (src, _) = const_source(1.0);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();

    let t = engine.tick_stamp();
    let hit = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hit);
    engine.transact([Job::flow_access(&sink, t + 5, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap()]);
    log.lock().calls.clear();
    engine.render(1).unwrap();

    assert_eq!(hit.load(Ordering::SeqCst), 1);
    assert_eq!(log.lock().calls, vec![(t, 5), (t + 5, bs - 5)]);
}

#[test]
fn test_flow_job_on_source_splits_source_only() {
    let engine = engine();
    let bs = engine.block_size();
    let src = ramp_source();
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    let t = engine.tick_stamp();
    engine.transact([Job::flow_access(&src, t + 7, |_| {}).unwrap()]);
    engine.render(1).unwrap();

    let log = log.lock();
    assert_eq!(log.calls, vec![(t, bs)]);
    // the split is invisible downstream
    for (i, v) in log.samples.iter().enumerate() {
        assert_abs_diff_eq!(*v, (t + i as u64) as f32);
    }
}

#[test]
fn test_boundary_jobs_run_between_blocks() {
    let engine = engine();
    let (src, _) = const_source(1.0);
    let (sink, log) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&ran);
    let t = engine.tick_stamp();
    engine.transact([
        Job::boundary_access(&src, t + 2 * engine.block_size() as u64, move |_| {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap(),
    ]);
    engine.render(1).unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    engine.render(2).unwrap();
    assert!(ran.load(Ordering::SeqCst));

    engine.transact([Job::boundary_discard(&src)]);
    engine.render(1).unwrap();
    assert!(!src.is_integrated());
    assert!(!sink.has_source(0));
    assert_eq!(engine.n_integrated(), 1);

    log.lock().samples.clear();
    engine.render(1).unwrap();
    assert!(log.lock().samples.iter().all(|v| *v == 0.0));
}

#[test]
fn test_probe_captures_block() {
    let engine = engine();
    let bs = engine.block_size();
    let src = ramp_source();
    let (sink, _) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    let captured: Arc<Mutex<Option<ProbeData>>> = Arc::new(Mutex::new(None));
    let c = Arc::clone(&captured);
    engine.transact([Job::probe_request(&src, move |data| {
        *c.lock() = Some(data);
    })]);

    let t = engine.tick_stamp();
    engine.render(1).unwrap();
    assert!(captured.lock().is_none());
    engine.collect();

    let data = captured.lock().take().unwrap();
    assert_eq!(data.tick_stamp, t);
    assert_eq!(data.n_values, bs);
    assert_eq!(data.ostreams.len(), 1);
    assert!(data.ostreams[0].connected);
    assert_eq!(data.ostreams[0].values.len(), bs);
    for (i, v) in data.ostreams[0].values.iter().enumerate() {
        assert_abs_diff_eq!(*v, (t + i as u64) as f32);
    }
}

#[test]
fn test_probe_on_virtual_module_reads_resolved_source() {
    let engine = engine();
    let bs = engine.block_size();
    let src = ramp_source();
    let pass = sigflow_engine::Module::new_virtual(1).unwrap();
    let (sink, _) = recorder();

    engine.transact([
        Job::integrate(&src),
        Job::integrate(&pass),
        Job::integrate(&sink),
        Job::connect(&src, 0, &pass, 0).unwrap(),
        Job::connect(&pass, 0, &sink, 0).unwrap(),
        Job::set_consumer(&sink),
    ]);
    engine.render(1).unwrap();

    let captured: Arc<Mutex<Option<ProbeData>>> = Arc::new(Mutex::new(None));
    let c = Arc::clone(&captured);
    engine.transact([Job::probe_request(&pass, move |data| {
        *c.lock() = Some(data);
    })]);

    let t = engine.tick_stamp();
    engine.render(1).unwrap();
    engine.collect();

    let data = captured.lock().take().unwrap();
    assert_eq!(data.tick_stamp, t);
    assert_eq!(data.n_values, bs);
    assert_eq!(data.ostreams.len(), 1);
    assert!(data.ostreams[0].connected);
    assert_eq!(data.ostreams[0].values.len(), bs);
    for (i, v) in data.ostreams[0].values.iter().enumerate() {
        assert_abs_diff_eq!(*v, (t + i as u64) as f32);
    }
}

#[test]
fn test_probe_on_unscheduled_module_reports_silence() {
    let engine = engine();
    let bs = engine.block_size();
    let src = ramp_source();
    engine.transact([Job::integrate(&src)]);

    let captured: Arc<Mutex<Option<ProbeData>>> = Arc::new(Mutex::new(None));
    let c = Arc::clone(&captured);
    engine.transact([Job::probe_request(&src, move |data| {
        *c.lock() = Some(data);
    })]);
    let t = engine.tick_stamp();
    engine.render(1).unwrap();
    engine.collect();

    let data = captured.lock().take().unwrap();
    assert_eq!(data.tick_stamp, t);
    assert_eq!(data.n_values, bs);
    assert!(!data.ostreams[0].connected);
    assert!(data.ostreams[0].values.iter().all(|v| *v == 0.0));
}

#[test]
fn test_probe_on_discarded_module_reports_no_data() {
    let engine = engine();
    let (src, _) = const_source(1.0);
    let stamp = Arc::new(Mutex::new(None));
    let s = Arc::clone(&stamp);
    engine.transact([Job::probe_request(&src, move |data| {
        *s.lock() = Some(data.tick_stamp);
    })]);
    engine.render(1).unwrap();
    engine.collect();
    assert_eq!(*stamp.lock(), Some(0));
}

#[test]
fn test_timers_run_after_each_block() {
    let engine = engine();
    let bs = engine.block_size() as u64;
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&stamps);
    engine.transact([Job::add_timer(move |stamp| {
        let mut stamps = s.lock();
        stamps.push(stamp);
        stamps.len() < 3
    })]);
    engine.render(5).unwrap();

    assert_eq!(*stamps.lock(), vec![1 + bs, 1 + 2 * bs, 1 + 3 * bs]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_failed_job_leaves_rest_of_transaction() {
    let engine = engine();
    let (src, _) = const_source(1.0);
    let (sink, _) = recorder();
    engine.transact([
        Job::integrate(&src),
        Job::integrate(&src),
        Job::integrate(&sink),
        Job::connect(&src, 0, &sink, 0).unwrap(),
        Job::connect(&src, 0, &sink, 0).unwrap(),
    ]);
    engine.wait_on_trans();
    assert_eq!(engine.n_integrated(), 2);
    assert!(sink.has_source(0));
}

#[test]
fn test_configure_requires_empty_engine() {
    let engine = engine();
    let block = engine.configure(20, 44_100, 0).unwrap();
    assert_eq!(engine.block_size(), block.block_size);
    assert_eq!(engine.sample_freq(), 44_100);

    let (src, _) = const_source(1.0);
    engine.transact([Job::integrate(&src)]);
    assert!(matches!(
        engine.configure(10, 48_000, 0),
        Err(EngineError::ConfigureRefused(_))
    ));
    assert_eq!(engine.sample_freq(), 44_100);

    engine.transact([Job::discard(&src)]);
    assert!(engine.configure(10, 48_000, 0).is_ok());
}

#[test]
fn test_discarded_module_released_on_collect() {
    let engine = engine();
    let (src, resets) = const_source(1.0);
    engine.transact([Job::integrate(&src)]);
    engine.transact([Job::discard(&src)]);
    engine.render(1).unwrap();
    assert!(engine.has_garbage());
    engine.collect();
    assert!(!engine.has_garbage());
    assert!(!src.is_integrated());
    // the implementation went with the module
    assert_eq!(Arc::strong_count(&resets), 1);
}

#[test]
fn test_transaction_merge_and_dismiss() {
    let engine = engine();
    let (a, _) = const_source(1.0);
    let (b, _) = const_source(1.0);

    let mut first = engine.transaction();
    first.add(Job::integrate(&a));
    let mut second = engine.transaction();
    second.add(Job::integrate(&b));
    first.merge(second);
    assert_eq!(first.len(), 2);
    first.commit();

    let mut dropped = engine.transaction();
    dropped.add(Job::discard(&a));
    dropped.dismiss();

    engine.wait_on_trans();
    assert_eq!(engine.n_integrated(), 2);
    assert!(a.is_integrated());
}

#[test]
fn test_commit_delayed_refused_without_master_thread() {
    let engine = engine();
    let mut trans = engine.transaction();
    trans.add(Job::nop());
    assert!(matches!(trans.commit_delayed(1_000_000), Err(EngineError::NotThreaded)));
}
