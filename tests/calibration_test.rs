//! Integration tests for storing and applying device calibration.

use std::io::Write;
use std::sync::Arc;

use rust_smu::calibration::Coefficients;
use rust_smu::transport::sim::{SimDevice, SimulatedTransport};
use rust_smu::{Calibration, Device, Mode, Session, SmuError};

fn claimed(transport: &Arc<SimulatedTransport>) -> (Session, Arc<Device>) {
    let session = Session::new(transport.clone());
    session.add_all().unwrap();
    let device = session.devices().remove(0);
    (session, device)
}

fn calibration_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_write_from_file_is_stored_and_applied() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let (_session, device) = claimed(&transport);
    let file = calibration_file(
        r#"
        [A.voltage.measure]
        gain = 1.0
        offset = 0.25

        [B.current.measure]
        gain = 1.0
        offset = -0.001
        "#,
    );

    device.write_calibration(Some(file.path())).unwrap();

    let stored = transport.stored_calibration(device.serial()).unwrap();
    assert_eq!(stored.a.voltage.measure, Coefficients::linear(1.0, 0.25));
    assert_eq!(device.calibration().unwrap(), stored);

    // Floating channels read raw zero, so the offsets show through
    let samples = device.get_samples(10).unwrap();
    for sample in samples {
        assert_eq!(sample.a.1, 0.25);
        assert_eq!(sample.b.0, -0.001);
    }
}

#[test]
fn test_source_correction_applied_to_output() {
    let transport = Arc::new(SimulatedTransport::new());
    let mut calibration = Calibration::identity();
    calibration.a.voltage.source = Coefficients::linear(1.0, 0.5);
    transport.plug(SimDevice::new("CAL1").calibration(calibration));
    let (_session, device) = claimed(&transport);

    device.set_mode(0, Mode::Svmi).unwrap();
    device.write(&[3.0], 0, false).unwrap();
    let samples = device.get_samples(4).unwrap();

    // The device is driven with 2.5 V to produce a calibrated 3.0 V set-point
    assert!(samples.iter().all(|s| (s.a.1 - 2.5).abs() < 1e-6));
}

#[test]
fn test_reset_restores_factory_defaults() {
    let mut calibration = Calibration::identity();
    calibration.b.voltage.measure = Coefficients::linear(1.1, 0.0);
    let transport = Arc::new(SimulatedTransport::new());
    transport.plug(SimDevice::new("CAL2").calibration(calibration));
    let (_session, device) = claimed(&transport);
    assert!(!device.calibration().unwrap().is_factory());

    device.write_calibration(None).unwrap();

    assert!(device.calibration().unwrap().is_factory());
    assert!(transport
        .stored_calibration(device.serial())
        .unwrap()
        .is_factory());
}

#[test]
fn test_malformed_file_leaves_device_untouched() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let (_session, device) = claimed(&transport);
    let file = calibration_file("[A.voltage.measure]\ngain = \"fast\"\n");

    let err = device.write_calibration(Some(file.path())).unwrap_err();
    assert!(matches!(err, SmuError::Calibration(_)));
    assert!(device.calibration().unwrap().is_factory());
}

#[test]
fn test_write_rejected_while_streaming() {
    let transport = Arc::new(SimulatedTransport::with_devices(1));
    let (session, device) = claimed(&transport);

    session.start(0).unwrap();
    let err = device.write_calibration(None).unwrap_err();
    assert!(err.is_invalid_state());
    session.cancel().unwrap();
}
