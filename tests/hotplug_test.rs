//! Integration tests for hotplug dispatch and firmware flashing.
//!
//! The simulated transport raises hotplug events on its own notifier thread;
//! `wait_idle` is used as a barrier before asserting on callback effects.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use rust_smu::transport::sim::{SimDevice, SimulatedTransport};
use rust_smu::{DeviceState, Session, SessionState, SmuError};

#[test]
fn test_detach_fires_once_after_removal() {
    let transport = Arc::new(SimulatedTransport::with_devices(2));
    let session = Arc::new(Session::new(transport.clone()));
    session.add_all().unwrap();
    let device = session.devices().remove(0);
    let serial = device.serial().to_string();

    let (tx, rx) = mpsc::channel();
    let weak = Arc::downgrade(&session);
    session.hotplug_detach(move |gone| {
        let still_listed = weak
            .upgrade()
            .map(|s| s.devices().iter().any(|d| Arc::ptr_eq(d, &gone)));
        let _ = tx.send((gone.serial().to_string(), still_listed));
    });

    transport.detach(&serial);
    transport.wait_idle();

    let (reported, still_listed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reported, serial);
    assert_eq!(still_listed, Some(false));
    assert!(rx.try_recv().is_err(), "detach reported twice");

    assert_eq!(device.state(), DeviceState::Detached);
    assert_eq!(session.active_count(), 1);
    assert!(session
        .available_devices()
        .iter()
        .all(|d| d.serial() != serial));
}

#[test]
fn test_detach_resolved_in_each_session() {
    let transport = Arc::new(SimulatedTransport::with_devices(2));
    let first = Session::new(transport.clone());
    first.scan().unwrap();
    let device = first.available_devices().remove(0);
    first.add(&device).unwrap();

    let detached = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&detached);
    first.hotplug_detach(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // A second session on the same bus claims the other device
    let second = Session::new(transport.clone());
    assert_eq!(second.add_all().unwrap(), 1);
    let other_detached = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&other_detached);
    second.hotplug_detach(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    transport.detach(device.serial());
    transport.wait_idle();

    assert_eq!(detached.load(Ordering::SeqCst), 1);
    assert_eq!(first.active_count(), 0);
    assert_eq!(device.state(), DeviceState::Detached);
    // The second session only knew it as discovered; its claim is untouched
    assert_eq!(other_detached.load(Ordering::SeqCst), 1);
    assert_eq!(second.active_count(), 1);
    assert!(second
        .available_devices()
        .iter()
        .all(|d| d.serial() != device.serial()));
}

#[test]
fn test_dropped_session_stops_receiving_events() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let first = Session::new(transport.clone());
    first.add_all().unwrap();

    let attached = Arc::new(AtomicUsize::new(0));
    {
        let second = Session::new(transport.clone());
        let counter = Arc::clone(&attached);
        second.hotplug_attach(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        transport.attach(SimDevice::new("LIVE"));
        transport.wait_idle();
    }

    transport.attach(SimDevice::new("GONE"));
    transport.wait_idle();
    assert_eq!(attached.load(Ordering::SeqCst), 1);
    // The surviving session still tracks both arrivals
    assert!(first.available_devices().iter().any(|d| d.serial() == "GONE"));
}

#[test]
fn test_detach_while_streaming_ends_that_worker() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let session = Session::new(transport.clone());
    session.add_all().unwrap();
    let device = session.devices().remove(0);

    session.start(0).unwrap();
    transport.detach(device.serial());
    transport.wait_idle();

    session.wait_for_completion().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!device.is_streaming());
    assert!(session.devices().is_empty());
}

#[test]
fn test_attach_reports_new_device() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = Session::new(transport.clone());

    let (tx, rx) = mpsc::channel();
    session.hotplug_attach(move |device| {
        let _ = tx.send(device.serial().to_string());
    });

    transport.attach(SimDevice::new("HOT1"));
    transport.wait_idle();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "HOT1");
    let available = session.available_devices();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].state(), DeviceState::Available);

    // The announced device can be claimed straight away
    session.add(&available[0]).unwrap();
    assert_eq!(session.active_count(), 1);
}

#[test]
fn test_last_registration_wins() {
    let transport = Arc::new(SimulatedTransport::new());
    let session = Session::new(transport.clone());

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first);
    session.hotplug_attach(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&second);
    session.hotplug_attach(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    transport.attach(SimDevice::new("HOT2"));
    transport.wait_idle();

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test]
fn test_events_after_session_drop_are_ignored() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    {
        let session = Session::new(transport.clone());
        session.add_all().unwrap();
    }
    transport.detach(&rust_smu::transport::sim::default_serial(0));
    transport.attach(SimDevice::new("AFTER"));
    transport.wait_idle();
}

#[test]
fn test_flash_firmware_through_bootloader() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let session = Session::new(transport.clone());
    session.add_all().unwrap();
    let device = session.devices().remove(0);
    let serial = device.serial().to_string();

    let mut image = tempfile::NamedTempFile::new().unwrap();
    image.write_all(&[0xAA; 512]).unwrap();

    session.flash_firmware(image.path(), Some(&device)).unwrap();
    transport.wait_idle();

    assert_eq!(device.state(), DeviceState::Bootloader);
    assert_eq!(device.owner(), None);
    assert!(session.devices().is_empty());
    let reattached: Vec<_> = session
        .available_devices()
        .into_iter()
        .filter(|d| d.serial() == serial)
        .collect();
    assert_eq!(reattached.len(), 1);
    assert!(!reattached[0].is_bootloader());

    // The re-attached handle is fully usable
    session.add(&reattached[0]).unwrap();
}

#[test]
fn test_flash_rejects_missing_image() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let session = Session::new(transport);
    let err = session
        .flash_firmware("/nonexistent/firmware.bin", None)
        .unwrap_err();
    assert!(matches!(err, SmuError::Firmware(_)));
}
