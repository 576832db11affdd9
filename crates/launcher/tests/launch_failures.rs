//! Failure-path coverage for the launch orchestrator: every error before
//! the handshake must tear the launch down completely and put the handle
//! back in the configuration state with no child processes left behind.

mod common;

use common::{appliance_on_disk, drive_file, fake_hypervisor, DEFAULT_HELP};
use guestkit_launcher::{Drive, Error, Handle, HandleState, LaunchConfig};
use serial_test::serial;
use std::time::{Duration, Instant};

fn handle_with(config: LaunchConfig, drive: &std::path::Path) -> Handle {
    let mut handle = Handle::new(config);
    handle.add_drive(Drive::new(drive));
    handle
}

#[test]
fn launch_without_drives_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let appliance = appliance_on_disk(dir.path(), false);

    let mut handle = Handle::new(LaunchConfig::default());
    assert!(matches!(handle.launch(&appliance), Err(Error::NoDrives)));
    assert_eq!(handle.state(), HandleState::Config);
}

#[test]
fn unrunnable_hypervisor_fails_the_probe() {
    let dir = tempfile::tempdir().unwrap();
    let appliance = appliance_on_disk(dir.path(), false);

    let config = LaunchConfig::default().with_hypervisor("/nonexistent/hypervisor-binary");
    let mut handle = handle_with(config, &drive_file(dir.path()));

    assert!(matches!(handle.launch(&appliance), Err(Error::Probe { .. })));
    assert_eq!(handle.state(), HandleState::Config);
    assert!(handle.pid().is_err());
}

#[test]
fn missing_appliance_fails_before_any_fork() {
    let dir = tempfile::tempdir().unwrap();
    let appliance = guestkit_launcher::FixedAppliance {
        kernel: dir.path().join("no-such-kernel"),
        initrd: dir.path().join("no-such-initrd"),
        root_image: None,
    };

    let mut handle = handle_with(LaunchConfig::default(), &drive_file(dir.path()));
    assert!(matches!(handle.launch(&appliance), Err(Error::Appliance(_))));
    assert_eq!(handle.state(), HandleState::Config);
}

#[test]
#[serial]
fn unclosed_quote_in_extra_options_aborts_the_launch() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let appliance = appliance_on_disk(dir.path(), true);
    let hypervisor = fake_hypervisor(
        dir.path(),
        "/bin/sh",
        DEFAULT_HELP,
        "name \"e1000\"",
        "exec sleep 30",
    );

    let config = LaunchConfig::default()
        .with_hypervisor(hypervisor)
        .with_hypervisor_options("\"--foo bar")
        .with_launch_timeout(Duration::from_secs(30));

    let mut handle = handle_with(config, &drive_file(dir.path()));
    let started = Instant::now();

    match handle.launch(&appliance) {
        Err(Error::CmdlineParse(msg)) => assert!(msg.contains("unclosed quote"), "msg: {msg}"),
        other => panic!("expected a command-line parse error, got {other:?}"),
    }

    // The child reports through the status pipe, so this must not have
    // waited for the rendezvous deadline.
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(handle.state(), HandleState::Config);
    assert!(handle.pid().is_err());
}

#[test]
#[serial]
fn rendezvous_timeout_cleans_up_the_hypervisor() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let appliance = appliance_on_disk(dir.path(), true);
    // A hypervisor that never dials back.
    let hypervisor = fake_hypervisor(
        dir.path(),
        "/bin/sh",
        DEFAULT_HELP,
        "name \"e1000\"",
        "exec sleep 30",
    );

    let config = LaunchConfig::default()
        .with_hypervisor(hypervisor)
        .with_launch_timeout(Duration::from_secs(2));

    let mut handle = handle_with(config, &drive_file(dir.path()));

    match handle.launch(&appliance) {
        Err(Error::Handshake(msg)) => assert!(msg.contains("timed out"), "msg: {msg}"),
        other => panic!("expected a handshake timeout, got {other:?}"),
    }
    assert_eq!(handle.state(), HandleState::Config);
    assert!(handle.pid().is_err());
    assert!(handle.data_socket().is_none());
    assert!(handle.stdio().is_none());
}

#[test]
fn shutdown_is_idempotent_without_a_launch() {
    let mut handle = Handle::new(LaunchConfig::default());
    assert!(handle.shutdown().is_ok());
    assert!(handle.shutdown().is_ok());
    assert_eq!(handle.state(), HandleState::Config);
}
