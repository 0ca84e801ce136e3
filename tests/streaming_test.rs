//! Integration tests for sample streaming through a session.
//!
//! These run against the simulated transport with instant timing, so finite runs
//! complete as fast as the queues can absorb them.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rust_smu::transport::sim::{SimDevice, SimulatedTransport};
use rust_smu::{Mode, ReadTimeout, Session, SessionState, SmuError};

fn session_with(devices: usize) -> (Arc<SimulatedTransport>, Session) {
    let transport = Arc::new(SimulatedTransport::with_devices(devices));
    let session = Session::new(transport.clone());
    session.add_all().expect("devices should be claimable");
    (transport, session)
}

#[test]
fn test_blocking_read_returns_exact_count() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);

    session.start(0).unwrap();
    let result = device.read(1000, ReadTimeout::Forever).unwrap();
    session.cancel().unwrap();
    session.wait_for_completion().unwrap();

    assert_eq!(result.len(), 1000);
    assert!(result
        .samples
        .windows(2)
        .all(|pair| pair[0].index < pair[1].index));
}

#[test]
fn test_non_blocking_read_never_waits() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);

    // Nothing streamed yet
    let result = device.read(100, ReadTimeout::NonBlocking).unwrap();
    assert!(result.is_empty());

    session.run(50).unwrap();
    let result = device.read(100, ReadTimeout::NonBlocking).unwrap();
    assert_eq!(result.len(), 50);
}

#[test]
fn test_cyclic_output_repeats_buffer() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);
    device.set_mode(0, Mode::Svmi).unwrap();
    device.write(&[1.0, 2.0, 3.0], 0, true).unwrap();

    session.run(9).unwrap();
    let result = device.read(9, ReadTimeout::Forever).unwrap();
    let voltages: Vec<f32> = result.samples.iter().map(|s| s.a.1).collect();
    assert_eq!(voltages, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_non_cyclic_output_holds_last_value() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);
    device.set_mode(1, Mode::Svmi).unwrap();
    device.write(&[4.0, 2.0], 1, false).unwrap();

    session.run(5).unwrap();
    let result = device.read(5, ReadTimeout::Forever).unwrap();
    let voltages: Vec<f32> = result.samples.iter().map(|s| s.b.1).collect();
    assert_eq!(voltages, vec![4.0, 2.0, 2.0, 2.0, 2.0]);
}

#[test]
fn test_default_rate_run_per_channel_counts() {
    let (_transport, session) = session_with(2);
    session.configure(0).unwrap();
    assert_eq!(session.state(), SessionState::Configured);

    session.run(1000).unwrap();
    for device in session.devices() {
        for channel in device.channels() {
            let result = channel.read(2000, ReadTimeout::NonBlocking).unwrap();
            assert_eq!(result.len(), 1000, "channel {channel}");
            assert_eq!(result.samples[0].index, 0);
            assert_eq!(result.samples[999].index, 999);
        }
    }
}

#[test]
fn test_overflow_keeps_newest_and_reports_dropped() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);
    session.set_queue_size(100).unwrap();

    session.start(150).unwrap();
    session.wait_for_completion().unwrap();
    let result = device.read(100, ReadTimeout::Forever).unwrap();

    assert_eq!(result.len(), 100);
    assert_eq!(result.dropped, 50);
    let indices: Vec<u64> = result.samples.iter().map(|s| s.index).collect();
    assert_eq!(indices, (50..150).collect::<Vec<u64>>());

    // The overflow is reported once
    let again = device.read(10, ReadTimeout::NonBlocking).unwrap();
    assert!(again.is_empty());
    assert_eq!(again.dropped, 0);
}

#[test]
fn test_indices_continue_across_runs() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);

    session.run(10).unwrap();
    let first = device.read(10, ReadTimeout::Forever).unwrap();
    session.run(10).unwrap();
    let second = device.read(10, ReadTimeout::Forever).unwrap();

    assert!(first.samples.last().unwrap().index < second.samples[0].index);
}

#[test]
fn test_simv_measures_voltage_across_load() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.plug(SimDevice::new("LOAD").load_ohms(100.0));
    let session = Session::new(transport.clone());
    session.add_all().unwrap();
    let device = session.devices().remove(0);

    device.set_mode(0, Mode::Simv).unwrap();
    device.write(&[0.01], 0, false).unwrap();
    let samples = device.get_samples(20).unwrap();

    assert_eq!(samples.len(), 20);
    for sample in samples {
        let (current, voltage) = sample.a;
        assert!((current - 0.01).abs() < 1e-6);
        assert!((voltage - 1.0).abs() < 1e-4);
        // Channel B floats
        assert_eq!(sample.b, (0.0, 0.0));
    }
}

#[test]
fn test_transfer_failure_surfaces_on_read_and_run() {
    let (transport, session) = session_with(1);
    let device = session.devices().remove(0);
    transport.fail_transfers_after(
        device.serial(),
        1,
        rust_smu::transport::TransportError::Io,
    );

    let err = session.run(10_000).unwrap_err();
    assert!(matches!(err, SmuError::Stream(_)));
    assert_eq!(session.state(), SessionState::Idle);

    // Samples from the successful transfer come out first, then the fault
    let result = device.read(10_000, ReadTimeout::Forever).unwrap();
    assert!(!result.is_empty());
    let err = device.read(1, ReadTimeout::Forever).unwrap_err();
    assert!(matches!(err, SmuError::DeviceIo(_)));
}

#[test]
fn test_sample_iterator_ends_with_stream() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);

    session.start(300).unwrap();
    let count = device.samples().count();
    session.wait_for_completion().unwrap();
    assert_eq!(count, 300);
}

#[test]
fn test_blocking_read_larger_than_queue() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);
    session.set_queue_size(100).unwrap();
    session.start(0).unwrap();

    let (tx, rx) = mpsc::channel();
    let reader = Arc::clone(&device);
    thread::spawn(move || {
        let indices = reader
            .read(200, ReadTimeout::Forever)
            .map(|r| r.samples.iter().map(|s| s.index).collect::<Vec<u64>>())
            .map_err(|e| e.to_string());
        let _ = tx.send(indices);
    });

    let indices = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("read should return once 200 samples arrived")
        .unwrap();
    session.cancel().unwrap();

    assert_eq!(indices.len(), 200);
    assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_channel_read_larger_than_queue() {
    let (_transport, session) = session_with(1);
    let device = session.devices().remove(0);
    session.set_queue_size(64).unwrap();
    session.start(0).unwrap();

    let (tx, rx) = mpsc::channel();
    let channel = device.channel(1).unwrap();
    thread::spawn(move || {
        let count = channel
            .read(500, ReadTimeout::Forever)
            .map(|r| r.len())
            .map_err(|e| e.to_string());
        let _ = tx.send(count);
    });

    let count = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    session.cancel().unwrap();
    assert_eq!(count, 500);
}
