//! Transfer engine integration tests
//!
//! Drives control, bulk and interrupt transfers against the loopback test
//! device on the mock platform:
//! - Standard requests and descriptor reads on the default pipe
//! - Loopback round trips, short reads and concurrent endpoints
//! - Timeouts, cancellation and cancellation races
//! - Stalls, endpoint validation and alternate settings
//!
//! Run with: `cargo test -p host --test transfer_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, LOOPBACK_PRODUCT_ID, LOOPBACK_VENDOR_ID, create_test_payload,
    loopback_test_device, with_timeout,
};
use descriptors::constants::{DT_DEVICE, REQ_GET_STATUS};
use host::platform::mock::MockPlatform;
use host::{CancelOutcome, DeviceHandle, DeviceLocation, ErrorKind, Session, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const LOOPBACK: DeviceLocation = DeviceLocation { bus: 1, address: 4 };
const TIMEOUT: Duration = Duration::from_millis(1000);

fn setup() -> (MockPlatform, Session) {
    let mock = MockPlatform::new();
    mock.add_device(LOOPBACK.bus, LOOPBACK.address, loopback_test_device());
    let session = Session::init(Arc::new(mock.clone()), SessionConfig::default()).unwrap();
    (mock, session)
}

fn open_loopback(session: &Session) -> DeviceHandle {
    let topology = session.enumerate().unwrap();
    let device = topology
        .find_device(LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID)
        .unwrap();
    let mut handle = session.open(device).unwrap();
    handle.set_configuration(1).unwrap();
    handle.claim_interface(0).unwrap();
    handle
}

// ============================================================================
// Control Transfers
// ============================================================================

mod control {
    use super::*;

    #[tokio::test]
    async fn test_get_status() {
        let (_mock, session) = setup();
        let topology = session.enumerate().unwrap();
        let device = topology
            .find_device(LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID)
            .unwrap();

        // No configuration or claim needed on the default pipe
        let handle = session.open(device).unwrap();
        let mut status = [0xffu8; 2];
        let n = handle
            .control_transfer(0x80, REQ_GET_STATUS, 0, 0, &mut status, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(status, [0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_loopback_bring_up_sequence() {
        let (_mock, session) = setup();
        let mut handle = open_loopback(&session);
        handle.set_alt_interface(0, 0).unwrap();

        let mut buffer = [0u8; 2];
        let n = handle
            .control_transfer(0x80, REQ_GET_STATUS, 2, 0, &mut buffer, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_string_descriptors() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let manufacturer = handle.get_string_descriptor(1, 100).await.unwrap();
        assert_eq!(manufacturer, "usb-host");

        let product = handle.get_string_descriptor(2, 8).await.unwrap();
        assert_eq!(product, "Loopback");

        let serial = handle.get_string_descriptor(3, 100).await.unwrap();
        assert_eq!(serial, "LB000001");
    }

    #[tokio::test]
    async fn test_string_index_zero_rejected() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let err = handle.get_string_descriptor(0, 100).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_missing_string_stalls() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let err = handle.get_string_descriptor(9, 100).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stalled);
    }

    #[tokio::test]
    async fn test_raw_device_descriptor() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let bytes = handle.get_raw_descriptor(DT_DEVICE, 0, 18).await.unwrap();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0], 18);
        assert_eq!(bytes[1], DT_DEVICE);
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), LOOPBACK_VENDOR_ID);

        // A shorter request returns only the prefix
        let prefix = handle.get_raw_descriptor(DT_DEVICE, 0, 8).await.unwrap();
        assert_eq!(prefix, bytes[..8].to_vec());
    }

    #[tokio::test]
    async fn test_read_device_strings() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let strings = handle.read_device_strings().await;
        assert_eq!(strings.manufacturer.as_deref(), Some("usb-host"));
        assert_eq!(strings.product.as_deref(), Some("Loopback Test Device"));
        assert_eq!(strings.serial_number.as_deref(), Some("LB000001"));
    }

    #[tokio::test]
    async fn test_control_timeout_on_hung_pipe() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);
        mock.hang_endpoint(LOOPBACK, 0x00);

        let mut status = [0u8; 2];
        let err = handle
            .control_transfer(0x80, REQ_GET_STATUS, 0, 0, &mut status, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}

// ============================================================================
// Bulk and Interrupt Loopback
// ============================================================================

mod loopback {
    use super::*;

    #[tokio::test]
    async fn test_bulk_round_trip() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);
        let payload = create_test_payload(300);

        let written = handle.bulk_write(0x02, &payload, TIMEOUT).await.unwrap();
        assert_eq!(written, 300);

        let read = handle.bulk_read(0x82, 512, TIMEOUT).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_interrupt_round_trip() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        handle
            .interrupt_write(0x01, b"report", TIMEOUT)
            .await
            .unwrap();
        let read = handle.interrupt_read(0x81, 64, TIMEOUT).await.unwrap();
        assert_eq!(read, b"report".to_vec());
    }

    #[tokio::test]
    async fn test_short_read_is_success() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);
        handle.bulk_write(0x02, b"hello", TIMEOUT).await.unwrap();

        let mut buffer = [0u8; 3];
        let n = handle.bulk_transfer(0x82, &mut buffer, TIMEOUT).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buffer, b"hel");

        let rest = handle.bulk_read(0x82, 64, TIMEOUT).await.unwrap();
        assert_eq!(rest, b"lo".to_vec());
    }

    #[tokio::test]
    async fn test_concurrent_read_then_write() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let (read, written) = tokio::join!(handle.bulk_read(0x82, 64, TIMEOUT), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.bulk_write(0x02, b"late", TIMEOUT).await
        });

        assert_eq!(written.unwrap(), 4);
        assert_eq!(read.unwrap(), b"late".to_vec());
    }

    #[tokio::test]
    async fn test_same_endpoint_transfers_complete_in_order() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);

        let first = handle
            .submit_bulk(0x82, vec![0; 64], TIMEOUT)
            .await
            .unwrap();

        // The second read queues behind the first and cannot take its data
        let (first, second, ()) = tokio::join!(
            first.wait(),
            handle.bulk_read(0x82, 64, TIMEOUT),
            async {
                mock.inject_in_data(LOOPBACK, 0x82, b"one".to_vec());
                mock.inject_in_data(LOOPBACK, 0x82, b"two".to_vec());
            }
        );

        assert_eq!(first.unwrap().data, b"one".to_vec());
        assert_eq!(second.unwrap(), b"two".to_vec());
    }

    #[tokio::test]
    async fn test_stats_track_completions() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        handle.bulk_write(0x02, &[1, 2, 3, 4], TIMEOUT).await.unwrap();
        handle.bulk_read(0x82, 64, TIMEOUT).await.unwrap();

        let stats = session.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.bytes_transferred, 8);
    }
}

// ============================================================================
// Timeouts and Cancellation
// ============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_timeout_is_not_early() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);
        mock.hang_endpoint(LOOPBACK, 0x82);

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = handle.bulk_read(0x82, 64, timeout).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= timeout);
        let ctx = err.transfer_context().unwrap();
        assert_eq!(ctx.endpoint.0, 0x82);
        assert_eq!(ctx.requested, 64);

        // The platform was asked to cancel and nothing is left pending
        assert_eq!(mock.counters().cancel_requests, 1);
        assert_eq!(mock.pending_transfers(LOOPBACK), 0);
        assert_eq!(handle.pending_transfers(), 0);
        assert_eq!(session.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_timeout_when_platform_ignores_cancel() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);
        mock.hang_endpoint(LOOPBACK, 0x82);
        mock.set_ignore_cancel(true);

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = with_timeout(DEFAULT_TEST_TIMEOUT, handle.bulk_read(0x82, 64, timeout))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        let grace = session.config().transfers.cancel_grace();
        assert!(started.elapsed() >= timeout + grace);

        // The platform still owns the transfer until it reports a final status
        assert_eq!(handle.pending_transfers(), 1);
        assert_eq!(mock.pending_transfers(LOOPBACK), 1);

        assert!(mock.unplug(LOOPBACK));
        assert_eq!(handle.pending_transfers(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_stays_queued_behind_unconfirmed_cancel() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);
        mock.set_ignore_cancel(true);

        let err = handle
            .bulk_read(0x82, 64, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(mock.pending_transfers(LOOPBACK), 1);

        let (second, _) = tokio::join!(handle.bulk_read(0x82, 64, TIMEOUT), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The next read waits for the abandoned one instead of joining it
            assert_eq!(mock.pending_transfers(LOOPBACK), 1);
            mock.inject_in_data(LOOPBACK, 0x82, b"late".to_vec());
            tokio::time::sleep(Duration::from_millis(50)).await;
            mock.inject_in_data(LOOPBACK, 0x82, b"next".to_vec());
        });

        assert_eq!(second.unwrap(), b"next".to_vec());
        assert_eq!(handle.pending_transfers(), 0);
    }

    #[tokio::test]
    async fn test_queued_transfer_times_out_behind_stuck_one() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);
        mock.hang_endpoint(LOOPBACK, 0x82);
        mock.set_ignore_cancel(true);

        let _ = handle.bulk_read(0x82, 64, Duration::from_millis(20)).await;

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = with_timeout(DEFAULT_TEST_TIMEOUT, handle.bulk_read(0x82, 64, timeout))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= timeout);
        assert_eq!(mock.pending_transfers(LOOPBACK), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_until_cancelled() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], Duration::ZERO)
            .await
            .unwrap();
        let canceller = transfer.canceller();
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel()
        });

        let err = with_timeout(DEFAULT_TEST_TIMEOUT, transfer.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(cancel.await.unwrap(), CancelOutcome::Requested);
        assert_eq!(session.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_result() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);
        handle.bulk_write(0x02, b"done", TIMEOUT).await.unwrap();

        // Data is already queued, so the read completes during submission
        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(transfer.cancel(), CancelOutcome::AlreadyCompleted);

        let done = transfer.wait().await.unwrap();
        assert_eq!(done.data, b"done".to_vec());
        assert_eq!(session.stats().cancellation_races, 1);
        assert_eq!(session.stats().cancelled, 0);
    }

    #[tokio::test]
    async fn test_second_cancel_sees_finished_transfer() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);

        let transfer = handle
            .submit_bulk(0x82, vec![0; 64], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(transfer.cancel(), CancelOutcome::Requested);
        assert_eq!(transfer.cancel(), CancelOutcome::AlreadyCompleted);

        let err = transfer.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(mock.counters().cancel_requests, 1);
    }
}

// ============================================================================
// Endpoint Validation, Stalls and Alternate Settings
// ============================================================================

mod endpoints {
    use super::*;

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let err = handle.bulk_read(0x83, 64, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchEndpoint);
    }

    #[tokio::test]
    async fn test_wrong_endpoint_type() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let err = handle.bulk_write(0x01, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongEndpointType);

        let err = handle.interrupt_read(0x82, 64, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongEndpointType);
    }

    #[tokio::test]
    async fn test_direction_mismatch() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let err = handle.bulk_write(0x82, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = handle.bulk_read(0x02, 64, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_alt_setting_switches_endpoints() {
        let (mock, session) = setup();
        let mut handle = open_loopback(&session);

        handle.set_alt_interface(0, 1).unwrap();
        assert_eq!(handle.active_alt_setting(0), Some(1));
        assert_eq!(mock.alt_setting(LOOPBACK, 0), Some(1));

        handle.bulk_write(0x03, b"alt", TIMEOUT).await.unwrap();
        assert_eq!(
            handle.bulk_read(0x83, 64, TIMEOUT).await.unwrap(),
            b"alt".to_vec()
        );

        let err = handle.bulk_write(0x02, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchEndpoint);
    }

    #[tokio::test]
    async fn test_configuration_change_invalidates_claims() {
        let (mock, session) = setup();
        let mut handle = open_loopback(&session);

        handle.set_configuration(2).unwrap();
        assert!(handle.claimed_interfaces().is_empty());
        assert_eq!(mock.active_configuration(LOOPBACK), Some(2));

        let err = handle.bulk_write(0x04, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchEndpoint);

        handle.claim_interface(0).unwrap();
        handle.bulk_write(0x04, b"cfg2", TIMEOUT).await.unwrap();
        assert_eq!(
            handle.bulk_read(0x84, 64, TIMEOUT).await.unwrap(),
            b"cfg2".to_vec()
        );

        let err = handle.bulk_write(0x02, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchEndpoint);
    }

    #[tokio::test]
    async fn test_stall_and_clear_halt() {
        let (mock, session) = setup();
        let handle = open_loopback(&session);
        mock.stall_endpoint(LOOPBACK, 0x02);

        let err = handle.bulk_write(0x02, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stalled);
        assert_eq!(err.transfer_context().unwrap().endpoint.0, 0x02);

        // The halt persists until cleared
        let err = handle.bulk_write(0x02, b"x", TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stalled);

        handle.clear_halt(0x02).unwrap();
        assert!(!mock.is_halted(LOOPBACK, 0x02));
        assert_eq!(handle.bulk_write(0x02, b"ok", TIMEOUT).await.unwrap(), 2);
        assert_eq!(session.stats().stalled, 2);
    }

    #[tokio::test]
    async fn test_clear_halt_requires_claimed_endpoint() {
        let (_mock, session) = setup();
        let handle = open_loopback(&session);

        let err = handle.clear_halt(0x84).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchEndpoint);
    }
}
