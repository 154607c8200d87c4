mod common;

use common::{registry_with, SimDevice, SimulatedBus};
use directservo_core::prelude::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LEGS: &str = "/dev/ttyUSB0";
const ARMS: &str = "/dev/ttyUSB1";

fn zero_torque_frames(bus: &SimulatedBus) -> Vec<String> {
    bus.frames()
        .into_iter()
        .filter(|frame| frame.ends_with("T+00"))
        .collect()
}

#[tokio::test]
async fn test_shutdown_zeroes_every_known_device() {
    let legs = SimulatedBus::with_devices(&[(1, SimDevice::at(0)), (2, SimDevice::at(0))]);
    let arms = SimulatedBus::with_devices(&[(3, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, legs.clone()), (ARMS, arms.clone())]);

    for (port, id) in [(LEGS, 1u8), (LEGS, 2), (ARMS, 3)] {
        let servo = registry.device(port, Address(id)).unwrap();
        assert!(servo.torque(0.3).await.unwrap().is_ok());
    }

    let report = registry.trigger_shutdown().await;
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.stopped.len(), 3);
    assert!(!registry.governor().is_armed());

    assert_eq!(zero_torque_frames(&legs), vec!["01T+00", "02T+00"]);
    assert_eq!(zero_torque_frames(&arms), vec!["03T+00"]);
    assert_eq!(legs.device(1).unwrap().torque, Some(0));
    assert_eq!(arms.device(3).unwrap().torque, Some(0));
}

#[tokio::test]
async fn test_shutdown_blocks_torque_afterwards() {
    let bus = SimulatedBus::with_devices(&[(1, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    let servo = registry.device(LEGS, Address(1)).unwrap();

    registry.trigger_shutdown().await;
    let written = bus.written_len();

    let reply = servo.torque(1.0).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::SafetyRejected);
    assert_eq!(bus.written_len(), written);

    // Non-torque commands still go through
    assert!(servo.get_angle().await.unwrap().is_some());
}

#[tokio::test]
async fn test_shutdown_completes_despite_missing_and_broken_devices() {
    let legs = SimulatedBus::with_devices(&[(1, SimDevice::at(0))]);
    let arms = SimulatedBus::with_devices(&[(3, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, legs.clone()), (ARMS, arms.clone())]);

    registry.device(LEGS, Address(1)).unwrap();
    registry.device(LEGS, Address(9)).unwrap();
    registry.device(ARMS, Address(3)).unwrap();
    arms.set_fail_writes(true);

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    registry.governor().set_user_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = registry.trigger_shutdown().await;
    assert_eq!(report.attempted(), 3);
    assert_eq!(report.stopped.len(), 1);
    assert_eq!(report.stopped[0].address, Address(1));

    let mut failed: Vec<(String, Address)> = report
        .failed
        .iter()
        .map(|(device, _)| (device.transport_id.clone(), device.address))
        .collect();
    failed.sort();
    assert_eq!(
        failed,
        vec![(LEGS.to_string(), Address(9)), (ARMS.to_string(), Address(3))]
    );
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert_eq!(zero_torque_frames(&legs), vec!["01T+00", "09T+00"]);
}

#[tokio::test]
async fn test_shutdown_includes_devices_only_seen_on_the_wire() {
    let bus = SimulatedBus::silent();
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    let connection = registry.acquire(LEGS, 115200).unwrap();

    bus.inject(b"2A000000\n");
    let known = connection.clone();
    assert!(bus.wait_until(Duration::from_secs(1), |_| {
        known.known_addresses() == vec![Address(0x2A)]
    }));

    registry.trigger_shutdown().await;
    assert_eq!(zero_torque_frames(&bus), vec!["2AT+00"]);
}

#[tokio::test]
async fn test_repeated_shutdown_sweeps_again() {
    let bus = SimulatedBus::with_devices(&[(1, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    registry.device(LEGS, Address(1)).unwrap();

    assert!(registry.trigger_shutdown().await.is_clean());
    assert!(registry.trigger_shutdown().await.is_clean());
    assert_eq!(zero_torque_frames(&bus).len(), 2);
}

#[test]
fn test_blocking_shutdown_from_sync_code() {
    let bus = SimulatedBus::with_devices(&[(4, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    let connection = registry.acquire(LEGS, 115200).unwrap();
    connection.device(Address(4));

    let report = registry.trigger_shutdown_blocking().unwrap();
    assert_eq!(report.stopped.len(), 1);
    assert_eq!(zero_torque_frames(&bus), vec!["04T+00"]);
}

#[tokio::test]
async fn test_blocking_shutdown_from_async_context() {
    let bus = SimulatedBus::with_devices(&[(4, SimDevice::at(0)), (5, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    registry.device(LEGS, Address(4)).unwrap();
    registry.device(LEGS, Address(5)).unwrap();

    let report = registry.trigger_shutdown_blocking().unwrap();
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.stopped.len(), 2);
    assert_eq!(zero_torque_frames(&bus), vec!["04T+00", "05T+00"]);
    assert!(!registry.governor().is_armed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_shutdown_on_multi_thread_runtime() {
    let bus = SimulatedBus::with_devices(&[(6, SimDevice::at(0))]);
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    let servo = registry.device(LEGS, Address(6)).unwrap();
    assert!(servo.torque(0.2).await.unwrap().is_ok());

    let report = registry.trigger_shutdown_blocking().unwrap();
    assert_eq!(report.stopped.len(), 1);
    assert_eq!(bus.device(6).unwrap().torque, Some(0));
}

#[test]
fn test_read_timeout_applied_to_transport() {
    let bus = SimulatedBus::silent();
    let (registry, _) = registry_with(&[(LEGS, bus.clone())]);
    registry.acquire(LEGS, 115200).unwrap();

    assert_eq!(bus.applied_read_timeout(), Some(Duration::from_millis(20)));
}

#[test]
fn test_unshareable_transport_fails_to_connect() {
    let bus = SimulatedBus::silent();
    bus.set_fail_clone(true);
    let (registry, _) = registry_with(&[(LEGS, bus)]);

    let err = registry.acquire(LEGS, 115200).unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionFailed(_)), "{:?}", err);
    assert!(registry.connections().is_empty());
}

#[test]
fn test_concurrent_acquire_opens_once() {
    let bus = SimulatedBus::silent();
    let (registry, opens) = registry_with(&[(LEGS, bus)]);
    let registry = Arc::new(registry);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            std::thread::spawn(move || registry.acquire(LEGS, 115200).unwrap())
        })
        .collect();
    let connections: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(opens.load(Ordering::SeqCst), 1);
    for connection in &connections[1..] {
        assert!(Arc::ptr_eq(connection, &connections[0]));
    }
    assert_eq!(registry.connections().len(), 1);
}

#[test]
fn test_failed_acquire_registers_nothing() {
    let (registry, opens) = registry_with(&[]);

    let err = registry.acquire("/dev/ttyUSB7", 115200).unwrap_err();
    assert!(matches!(err, ProtocolError::PortNotFound(_)));
    assert!(registry.connections().is_empty());

    // A retry attempts the open again
    assert!(registry.device("/dev/ttyUSB7", Address(1)).is_err());
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[test]
fn test_acquire_configured_requires_port() {
    let (registry, _) = registry_with(&[]);
    let err = registry.acquire_configured().unwrap_err();
    assert!(matches!(err, ProtocolError::Config(_)));
}
