//! Session, topology and device handle integration tests
//!
//! Covers the lifecycle around transfers on the mock platform:
//! - Enumeration snapshots and filters
//! - Opening devices, configurations and interface claims
//! - Disconnects, resets and re-enumeration
//! - Session teardown
//!
//! Run with: `cargo test -p host --test session_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, DeviceFixture, LOOPBACK_PRODUCT_ID, LOOPBACK_VENDOR_ID,
    loopback_test_device, with_timeout,
};
use host::platform::mock::{MockPlatform, ResetBehavior};
use host::{
    DeviceFilter, DeviceHandle, DeviceLocation, ErrorKind, HandleState, ResetOutcome, Session,
    SessionConfig,
};
use std::sync::Arc;
use std::time::Duration;

const LOOPBACK: DeviceLocation = DeviceLocation { bus: 1, address: 4 };
const TIMEOUT: Duration = Duration::from_millis(1000);

fn setup_with(config: SessionConfig) -> (MockPlatform, Session) {
    let mock = MockPlatform::new();
    mock.add_device(LOOPBACK.bus, LOOPBACK.address, loopback_test_device());
    let session = Session::init(Arc::new(mock.clone()), config).unwrap();
    (mock, session)
}

fn setup() -> (MockPlatform, Session) {
    setup_with(SessionConfig::default())
}

fn open(session: &Session) -> DeviceHandle {
    let topology = session.enumerate().unwrap();
    let device = topology
        .find_device(LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID)
        .unwrap();
    session.open(device).unwrap()
}

fn open_claimed(session: &Session) -> DeviceHandle {
    let mut handle = open(session);
    handle.set_configuration(1).unwrap();
    handle.claim_interface(0).unwrap();
    handle
}

fn loopback_filter() -> DeviceFilter {
    DeviceFilter::new(LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID)
}

// ============================================================================
// Session Initialization
// ============================================================================

mod init {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SessionConfig::default();
        config.transfers.cancel_grace_ms = 0;

        let err = Session::init(Arc::new(MockPlatform::new()), config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_new_session_is_live() {
        let (_mock, session) = setup();
        assert!(session.is_live());
        assert_eq!(session.open_handles(), 0);
        assert_eq!(session.stats().submitted, 0);
    }
}

// ============================================================================
// Enumeration
// ============================================================================

mod enumeration {
    use super::*;

    #[test]
    fn test_enumeration_is_repeatable() {
        let (_mock, session) = setup();

        let first = session.enumerate().unwrap();
        let second = session.enumerate().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.device_count(), 1);
    }

    #[test]
    fn test_snapshots_are_independent() {
        let (mock, session) = setup();
        let before = session.enumerate().unwrap();

        mock.plug(2, 1, DeviceFixture::new(0x1209, 0x0001));
        let after = session.enumerate().unwrap();

        assert_eq!(before.device_count(), 1);
        assert_eq!(after.device_count(), 2);
        assert!(after.device_at(DeviceLocation::new(2, 1)).is_some());
        assert!(before.device_at(DeviceLocation::new(2, 1)).is_none());
    }

    #[test]
    fn test_session_filters_apply() {
        let config = SessionConfig {
            filters: vec![DeviceFilter::vendor(0x1209)],
            ..SessionConfig::default()
        };
        let (mock, session) = setup_with(config);
        mock.add_device(2, 1, DeviceFixture::new(0x1209, 0x0001));

        let topology = session.enumerate().unwrap();
        assert_eq!(topology.device_count(), 1);
        assert_eq!(topology.devices().next().unwrap().vendor_id(), 0x1209);
    }

    #[test]
    fn test_unplugged_device_disappears() {
        let (mock, session) = setup();
        assert!(mock.unplug(LOOPBACK));

        let topology = session.enumerate().unwrap();
        assert_eq!(topology.device_count(), 0);
        assert!(!mock.unplug(LOOPBACK));
    }

    #[tokio::test]
    async fn test_enumerate_with_strings() {
        let (_mock, session) = setup();

        let topology = session.enumerate_with_strings().await.unwrap();
        let device = topology.device_at(LOOPBACK).unwrap();
        assert_eq!(device.strings.manufacturer.as_deref(), Some("usb-host"));
        assert_eq!(
            device.strings.product.as_deref(),
            Some("Loopback Test Device")
        );
        assert_eq!(device.strings.serial_number.as_deref(), Some("LB000001"));

        // The temporary handles are gone again
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_strings_skip_busy_devices() {
        let (mock, session) = setup();
        mock.hold_elsewhere(LOOPBACK, true);

        let topology = session.enumerate_with_strings().await.unwrap();
        let device = topology.device_at(LOOPBACK).unwrap();
        assert_eq!(device.strings, Default::default());
    }
}

// ============================================================================
// Opening and Closing
// ============================================================================

mod open_close {
    use super::*;

    #[test]
    fn test_open_twice_is_unavailable() {
        let (_mock, session) = setup();
        let _handle = open(&session);

        let topology = session.enumerate().unwrap();
        let device = topology.device_at(LOOPBACK).unwrap();
        let err = session.open(device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }

    #[test]
    fn test_open_held_elsewhere() {
        let (mock, session) = setup();
        mock.hold_elsewhere(LOOPBACK, true);

        let topology = session.enumerate().unwrap();
        let err = session.open(topology.device_at(LOOPBACK).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }

    #[test]
    fn test_open_stale_snapshot() {
        let (mock, session) = setup();
        let topology = session.enumerate().unwrap();
        mock.unplug(LOOPBACK);

        let err = session.open(topology.device_at(LOOPBACK).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }

    #[test]
    fn test_drop_closes_handle() {
        let (mock, session) = setup();
        {
            let handle = open_claimed(&session);
            assert_eq!(handle.state(), HandleState::Configured);
            assert!(mock.is_open(LOOPBACK));
            assert_eq!(session.open_handles(), 1);
        }

        assert!(!mock.is_open(LOOPBACK));
        assert!(mock.claimed_interfaces(LOOPBACK).is_empty());
        assert_eq!(session.open_handles(), 0);

        // And the device can be opened again
        let handle = open(&session);
        assert_eq!(handle.state(), HandleState::Open);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mock, session) = setup();
        let mut handle = open_claimed(&session);

        handle.close();
        handle.close();
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(mock.counters().closes, 1);

        let err = handle.claim_interface(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}

// ============================================================================
// Configurations and Interfaces
// ============================================================================

mod interfaces {
    use super::*;

    #[test]
    fn test_claim_requires_configuration() {
        let (_mock, session) = setup();
        let mut handle = open(&session);

        let err = handle.claim_interface(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_unknown_configuration() {
        let (_mock, session) = setup();
        let mut handle = open(&session);

        let err = handle.set_configuration(7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(handle.state(), HandleState::Open);
    }

    #[test]
    fn test_unknown_interface_and_alt_setting() {
        let (_mock, session) = setup();
        let mut handle = open(&session);
        handle.set_configuration(1).unwrap();

        let err = handle.claim_interface(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchInterface);

        let err = handle.set_alt_interface(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceNotClaimed);

        handle.claim_interface(0).unwrap();
        let err = handle.set_alt_interface(0, 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchAltSetting);
    }

    #[test]
    fn test_claim_is_idempotent() {
        let (mock, session) = setup();
        let mut handle = open_claimed(&session);

        handle.claim_interface(0).unwrap();
        assert_eq!(handle.claimed_interfaces(), vec![0]);
        assert_eq!(handle.active_alt_setting(0), Some(0));
        assert_eq!(mock.claimed_interfaces(LOOPBACK), vec![0]);
    }

    #[test]
    fn test_interface_held_elsewhere() {
        let (mock, session) = setup();
        mock.hold_interface_elsewhere(LOOPBACK, 0);
        let mut handle = open(&session);
        handle.set_configuration(1).unwrap();

        let err = handle.claim_interface(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceBusy);
        assert!(handle.claimed_interfaces().is_empty());
    }

    #[test]
    fn test_release_unclaimed_interface() {
        let (_mock, session) = setup();
        let mut handle = open(&session);
        handle.set_configuration(1).unwrap();

        let err = handle.release_interface(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceNotClaimed);
    }

    #[tokio::test]
    async fn test_release_with_pending_transfer() {
        let (mock, session) = setup();
        let mut handle = open_claimed(&session);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], Duration::ZERO)
            .await
            .unwrap();

        let err = handle.release_interface(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceBusy);
        let err = handle.set_configuration(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceBusy);
        let err = handle.set_alt_interface(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceBusy);

        transfer.cancel();
        let err = transfer.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        handle.release_interface(0).unwrap();
        assert!(mock.claimed_interfaces(LOOPBACK).is_empty());
    }
}

// ============================================================================
// Disconnects, Resets and Re-enumeration
// ============================================================================

mod reset {
    use super::*;

    #[tokio::test]
    async fn test_unplug_fails_pending_transfer() {
        let (mock, session) = setup();
        let handle = open_claimed(&session);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], TIMEOUT)
            .await
            .unwrap();
        mock.unplug(LOOPBACK);

        let err = transfer.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected);

        let err = handle.bulk_write(0x02, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected);
    }

    #[tokio::test]
    async fn test_reset_keeping_address() {
        let (mock, session) = setup();
        let mut handle = open_claimed(&session);

        let outcome = handle.reset().unwrap();
        assert_eq!(outcome, ResetOutcome::Retained);
        assert_eq!(handle.state(), HandleState::Open);
        assert!(handle.claimed_interfaces().is_empty());
        assert_eq!(mock.counters().resets, 1);

        // Set up again and use the device
        handle.set_configuration(1).unwrap();
        handle.claim_interface(0).unwrap();
        handle.bulk_write(0x02, b"again", TIMEOUT).await.unwrap();
        assert_eq!(
            handle.bulk_read(0x82, 64, TIMEOUT).await.unwrap(),
            b"again".to_vec()
        );
    }

    #[tokio::test]
    async fn test_reset_cancels_outstanding_transfers() {
        let (_mock, session) = setup();
        let mut handle = open_claimed(&session);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], Duration::ZERO)
            .await
            .unwrap();
        handle.reset().unwrap();

        let err = transfer.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(handle.pending_transfers(), 0);
    }

    #[tokio::test]
    async fn test_reset_refused_while_transfer_cannot_be_cancelled() {
        let (mock, session) = setup();
        let mut handle = open_claimed(&session);
        mock.set_ignore_cancel(true);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], Duration::ZERO)
            .await
            .unwrap();

        let err = handle.reset().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Platform);
        assert_eq!(handle.state(), HandleState::Configured);
        assert_eq!(handle.claimed_interfaces(), vec![0]);
        assert_eq!(handle.pending_transfers(), 1);

        // Once the transfer drains the reset goes through
        mock.inject_in_data(LOOPBACK, 0x82, b"done".to_vec());
        assert_eq!(transfer.wait().await.unwrap().data, b"done".to_vec());
        assert_eq!(handle.reset().unwrap(), ResetOutcome::Retained);
        assert!(handle.claimed_interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_reset_with_reenumeration() {
        let (mock, session) = setup();
        let mut handle = open_claimed(&session);
        mock.set_reset_behavior(
            LOOPBACK,
            ResetBehavior::Reenumerate {
                new_address: 9,
                delay: Duration::from_millis(100),
            },
        );

        let outcome = handle.reset().unwrap();
        assert_eq!(outcome, ResetOutcome::Reenumerated);
        assert_eq!(handle.state(), HandleState::Closed);
        assert_eq!(session.open_handles(), 0);

        let device = with_timeout(
            DEFAULT_TEST_TIMEOUT,
            session.wait_for_device(&loopback_filter(), Duration::from_secs(2)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(device.location(), DeviceLocation::new(1, 9));

        let mut reopened = session.open(&device).unwrap();
        reopened.set_configuration(1).unwrap();
        reopened.claim_interface(0).unwrap();
        reopened.bulk_write(0x02, b"back", TIMEOUT).await.unwrap();
        assert_eq!(
            reopened.bulk_read(0x82, 64, TIMEOUT).await.unwrap(),
            b"back".to_vec()
        );
    }

    #[tokio::test]
    async fn test_wait_for_absent_device_times_out() {
        let (_mock, session) = setup();
        let filter = DeviceFilter::new(0xdead, 0xbeef);

        let err = session
            .wait_for_device(&filter, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }

    #[tokio::test]
    async fn test_wait_for_device_sees_hotplug() {
        let (mock, session) = setup();
        let plugger = {
            let mock = mock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                mock.plug(3, 2, DeviceFixture::new(0x1209, 0x0002));
            })
        };

        let device = session
            .wait_for_device(&DeviceFilter::new(0x1209, 0x0002), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(device.location(), DeviceLocation::new(3, 2));
        plugger.await.unwrap();
    }
}

// ============================================================================
// Teardown
// ============================================================================

mod teardown {
    use super::*;

    #[tokio::test]
    async fn test_teardown_cancels_and_closes() {
        let (mock, session) = setup();
        let handle = open_claimed(&session);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], Duration::ZERO)
            .await
            .unwrap();
        session.teardown();

        let err = with_timeout(DEFAULT_TEST_TIMEOUT, transfer.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        assert!(!session.is_live());
        assert!(!mock.is_open(LOOPBACK));
        assert_eq!(handle.state(), HandleState::Closed);

        let err = handle.bulk_write(0x02, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        let err = session.enumerate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (mock, session) = setup();
        let handle = open(&session);

        session.teardown();
        session.teardown();
        drop(handle);

        assert_eq!(mock.counters().closes, 1);
    }

    #[test]
    fn test_open_after_teardown() {
        let (_mock, session) = setup();
        let topology = session.enumerate().unwrap();
        session.teardown();

        let err = session.open(topology.device_at(LOOPBACK).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }
}
