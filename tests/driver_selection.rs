//! Driver registration, selection and parameter editing.

use std::time::Duration;

use mosca::config::Settings;
use mosca::driver::Driver;
use mosca::manager::{AcquisitionEvent, AcquisitionState};
use mosca::parameter::{apply_edit, Configurable};
use mosca::{DaqContext, DaqError};

const CONFIG: &str = r#"
    [acquisition]
    stop_timeout_ms = 1000

    [[devices]]
    kind = "labview"

    [[devices]]
    kind = "dummy"

    [[devices]]
    kind = "nidaqmx"
    default = true

    [[devices]]
    kind = "dummy"
    default = true
    [devices.args]
    name = "Bench"
    channels = 2

    [[storages]]
    kind = "numpy"
    [storages.args]
    basename = "shot"
"#;

fn create_test_context() -> (DaqContext, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::from_toml_str(CONFIG).expect("Failed to parse settings");
    settings.storage.directory = dir.path().to_path_buf();
    (DaqContext::new(settings).expect("Failed to create context"), dir)
}

#[test]
fn test_unknown_kind_is_skipped_and_first_default_wins() {
    let (ctx, _dir) = create_test_context();
    let devices = ctx.devices();
    assert_eq!(devices.get_drivers(), vec!["Dummy", "NI-DAQmx", "Bench"]);
    assert_eq!(devices.get_driver().as_deref(), Some("NI-DAQmx"));
    assert_eq!(devices.get_index(None), Some(1));
    assert_eq!(devices.get_index(Some("Bench")), Some(2));
    ctx.shutdown().unwrap();
}

#[test]
fn test_unknown_driver_name_keeps_current() {
    let (ctx, _dir) = create_test_context();
    let devices = ctx.devices();
    let err = devices.set_driver("nonexistent").unwrap_err();
    assert!(matches!(err, DaqError::NotFound(_)));
    assert_eq!(devices.get_driver().as_deref(), Some("NI-DAQmx"));
    assert!(devices.set_driver(9usize).is_err());
    ctx.shutdown().unwrap();
}

#[test]
fn test_driver_change_is_broadcast() {
    let (ctx, _dir) = create_test_context();
    let mut events = ctx.devices().subscribe_events();
    assert!(ctx.devices().set_driver("Bench").unwrap());
    assert_eq!(
        events.try_recv().unwrap(),
        AcquisitionEvent::DriverChanged("Bench".into())
    );
    assert_eq!(
        ctx.devices()
            .with_current(|d| d.channels().names().len())
            .unwrap(),
        2
    );
    ctx.shutdown().unwrap();
}

#[test]
fn test_stub_driver_fails_to_start() {
    let (ctx, _dir) = create_test_context();
    let err = ctx.start(false).unwrap_err();
    assert!(matches!(
        err,
        DaqError::FeatureNotEnabled(_) | DaqError::FeatureIncomplete(..)
    ));
    assert_eq!(ctx.devices().state(), AcquisitionState::Idle);

    ctx.devices().set_driver("Dummy").unwrap();
    ctx.start(false).unwrap();
    assert!(matches!(
        ctx.devices().set_driver("Bench"),
        Err(DaqError::InvalidState(_))
    ));
    ctx.stop().unwrap();
    ctx.shutdown().unwrap();
}

#[test]
fn test_invalid_scale_keeps_previous_value() {
    let (ctx, _dir) = create_test_context();
    ctx.devices()
        .with_current(|driver| {
            let channel = driver.channels_mut().get_mut("AI0").unwrap();
            channel.set_param("scale", "0.5").unwrap();

            let rejected = apply_edit(channel, "scale", "abc").unwrap_err();
            assert!(matches!(rejected.error, DaqError::Validation(_)));
            assert_eq!(rejected.restored, "0.5");
            assert_eq!(channel.scale(), 0.5);
        })
        .unwrap();
    ctx.shutdown().unwrap();
}

#[test]
fn test_sampling_parameters_are_validated() {
    let (ctx, _dir) = create_test_context();
    ctx.devices().set_driver("Dummy").unwrap();
    ctx.devices()
        .with_current(|driver: &mut dyn Driver| {
            let core = driver.core_mut();
            let rejected = apply_edit(core, "rate", "fast").unwrap_err();
            assert_eq!(
                rejected.error.to_string(),
                "Validation error: Failed to parse sampling rate: 'fast'"
            );
            assert!(matches!(
                apply_edit(core, "interval", "0").unwrap_err().error,
                DaqError::Range(_)
            ));
            assert_eq!(apply_edit(core, "rate", "20000").unwrap(), "20000");
            assert_eq!(driver.sampling().rate_hz, 20_000);
            assert_eq!(driver.sampling().period(), Duration::from_millis(50));
        })
        .unwrap();
    ctx.shutdown().unwrap();
}

#[test]
fn test_storage_selection_and_parameters() {
    let (ctx, dir) = create_test_context();
    let storage = ctx.storage();
    assert_eq!(storage.get_drivers(), vec!["NumPy Binary"]);
    assert_eq!(storage.next_path().unwrap(), dir.path().join("shot_001.npy"));
    assert!(matches!(
        storage.set_driver("HDF5"),
        Err(DaqError::NotFound(_))
    ));

    storage
        .with_current(|s| {
            let target = s.target_mut();
            assert_eq!(apply_edit(target, "acqno", "41").unwrap(), "41");
            assert!(apply_edit(target, "acqno", "x41").is_err());
        })
        .unwrap();
    assert_eq!(storage.next_path().unwrap(), dir.path().join("shot_041.npy"));
    ctx.shutdown().unwrap();
}
