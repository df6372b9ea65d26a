//! Integration tests for event delivery
//!
//! Tests the session event channels including:
//! - Status broadcast to sessions sharing a device
//! - Delayed and coalesced status events
//! - Drain thread liveness under concurrent raisers
//! - Data, freeze and strict FIFO gating
//! - Events the raiser waits on
//! - The Tokio bridge
//!
//! Run with: `cargo test -p engine --test event_tests`

use common::Timeout;
use engine::test_utils::{
    DEFAULT_TEST_TIMEOUT, RecordingSink, failing_task, open_enabled, stays_false, wait_for,
};
use engine::{
    ChannelKind, Command, DataEvent, Delay, DeviceError, DeviceIndex, DirectIoEvent, Driver,
    EngineConfig, ErrorCode, ErrorEvent, ErrorLocus, ErrorResponse, Event, EventSink,
    Exclusivity, GenericClass, OutputCompleteEvent, PowerState, Session, SessionState,
    StatusUpdateEvent, TransitionEvent, create_event_bridge, status,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn driver() -> Driver {
    driver_with(EngineConfig::default())
}

fn driver_with(config: EngineConfig) -> Driver {
    Driver::new("test", Arc::new(GenericClass::new("Scanner")), config)
}

fn status_event(session: &Session, value: i32) -> StatusUpdateEvent {
    StatusUpdateEvent::new(session.id(), value)
}

mod fan_out {
    use super::*;

    fn shared_driver() -> Driver {
        let class = GenericClass::new("LineDisplay").with_exclusivity(Exclusivity::Allowed);
        Driver::new("shared", Arc::new(class), EngineConfig::default())
    }

    fn open_shared(
        driver: &Driver,
        name: &str,
        power_notify: bool,
        enable: bool,
    ) -> (Arc<Session>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let session = driver.open_session(DeviceIndex(0), name, sink.clone());
        session.set_power_notify(power_notify).unwrap();
        if enable {
            session.set_device_enabled(true).unwrap();
        }
        (session, sink)
    }

    #[test]
    fn test_power_status_reaches_each_notifying_session() {
        let driver = shared_driver();
        let (x, sink_x) = open_shared(&driver, "x", true, true);
        let (y, sink_y) = open_shared(&driver, "y", true, true);
        let (z, sink_z) = open_shared(&driver, "z", true, false);
        let (w, sink_w) = open_shared(&driver, "w", false, true);

        x.raise_status_event(status_event(&x, status::POWER_OFFLINE));

        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || {
            sink_x.statuses().len() == 1 && sink_y.statuses().len() == 1
        }));
        assert_eq!(sink_x.statuses()[0].source, x.id());
        assert_eq!(sink_y.statuses()[0].source, y.id());
        assert_eq!(sink_y.statuses()[0].status, status::POWER_OFFLINE);
        assert_eq!(x.props().power_state, PowerState::Offline);
        assert_eq!(y.props().power_state, PowerState::Offline);

        assert!(stays_false(Duration::from_millis(50), || {
            !sink_z.is_empty() || !sink_w.is_empty()
        }));
        assert_eq!(w.props().power_state, PowerState::Unknown);
        assert_eq!(driver.device(DeviceIndex(0)).power_state(), PowerState::Offline);

        // Enabling later reports the state the device is in
        z.set_device_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || {
            sink_z.status_values() == vec![status::POWER_OFFLINE]
        }));
        assert_eq!(sink_z.statuses()[0].source, z.id());
        assert_eq!(z.props().power_state, PowerState::Offline);
    }

    #[test]
    fn test_plain_status_reaches_every_enabled_session() {
        let driver = shared_driver();
        let (x, sink_x) = open_shared(&driver, "x", false, true);
        let (_y, sink_y) = open_shared(&driver, "y", false, true);
        let (_z, sink_z) = open_shared(&driver, "z", false, false);

        x.raise_status_event(status_event(&x, 42));

        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || {
            sink_x.status_values() == vec![42] && sink_y.status_values() == vec![42]
        }));
        assert!(sink_z.is_empty());
    }

    #[test]
    fn test_closed_session_leaves_device() {
        let driver = shared_driver();
        let (x, sink_x) = open_shared(&driver, "x", false, true);
        let (y, sink_y) = open_shared(&driver, "y", false, true);
        assert_eq!(driver.device(DeviceIndex(0)).sessions().len(), 2);

        y.close().unwrap();
        assert_eq!(y.state(), SessionState::Closed);
        assert_eq!(driver.device(DeviceIndex(0)).sessions().len(), 1);

        x.raise_status_event(status_event(&x, 7));
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink_x.status_values() == vec![7]));
        assert!(sink_y.is_empty());
    }
}

mod coalescing {
    use super::*;

    fn delayed(session: &Session, value: i32, millis: u64) -> StatusUpdateEvent {
        status_event(session, value).with_delay(Delay::After(Duration::from_millis(millis)))
    }

    #[test]
    fn test_delayed_status_fires_later() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(delayed(&session, 5, 100));
        assert!(sink.is_empty());
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.status_values() == vec![5]));
    }

    #[test]
    fn test_newer_delayed_status_replaces_buffered() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(delayed(&session, 5, 200));
        session.raise_status_event(delayed(&session, 6, 50));

        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.status_values() == vec![6]));
        assert!(stays_false(Duration::from_millis(300), || sink.len() > 1));
    }

    #[test]
    fn test_cancel_fire_drops_buffered_and_fires() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(delayed(&session, 7, 100));
        session.raise_status_event(status_event(&session, 8).with_delay(Delay::CancelFire));

        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.status_values() == vec![8]));
        assert!(stays_false(Duration::from_millis(300), || sink.len() > 1));
    }

    #[test]
    fn test_cancel_only_drops_both() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(delayed(&session, 7, 100));
        session.raise_status_event(status_event(&session, 9).with_delay(Delay::CancelOnly));

        assert!(stays_false(Duration::from_millis(300), || !sink.is_empty()));
    }

    #[test]
    fn test_cancel_only_without_buffered_fires() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(
            status_event(&session, 9).with_delay(Delay::from_millis(Delay::CANCEL_ONLY)),
        );
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.status_values() == vec![9]));
    }

    #[test]
    fn test_cancel_only_still_updates_power_state() {
        let driver = driver();
        let sink = Arc::new(RecordingSink::new());
        let session = driver.open_session(DeviceIndex(0), "scanner", sink.clone());
        session.claim(Timeout::from_millis(1000)).unwrap();
        session.set_power_notify(true).unwrap();
        session.set_device_enabled(true).unwrap();

        session.raise_status_event(delayed(&session, status::POWER_OFF, 100));
        session.raise_status_event(
            status_event(&session, status::POWER_ONLINE).with_delay(Delay::CancelOnly),
        );

        assert_eq!(session.props().power_state, PowerState::Online);
        assert!(stays_false(Duration::from_millis(300), || !sink.is_empty()));
        assert_eq!(session.props().power_state, PowerState::Online);
    }

    #[test]
    fn test_disable_cancels_buffered() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(delayed(&session, 5, 100));
        session.set_device_enabled(false).unwrap();

        assert!(stays_false(Duration::from_millis(300), || !sink.is_empty()));
    }
}

mod draining {
    use super::*;

    #[test]
    fn test_concurrent_raisers_all_delivered_in_order() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        const THREADS: i32 = 4;
        const PER_THREAD: i32 = 50;

        let raisers: Vec<_> = (0..THREADS)
            .map(|t| {
                let session = session.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        session.raise_status_event(status_event(&session, t * 10_000 + i));
                    }
                })
            })
            .collect();
        for raiser in raisers {
            raiser.join().unwrap();
        }

        let total = (THREADS * PER_THREAD) as usize;
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.len() == total));
        assert_eq!(sink.max_concurrent(ChannelKind::General), 1);

        let values = sink.status_values();
        for t in 0..THREADS {
            let from_thread: Vec<i32> = values.iter().copied().filter(|v| v / 10_000 == t).collect();
            let expected: Vec<i32> = (0..PER_THREAD).map(|i| t * 10_000 + i).collect();
            assert_eq!(from_thread, expected);
        }
        assert_eq!(session.queued_events(ChannelKind::General), 0);
    }

    #[test]
    fn test_bounded_callback_wait_moves_on() {
        let driver = driver_with(EngineConfig {
            callback_wait_ms: Some(50),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::new().with_callback_delay(Duration::from_millis(300)));
        let session = driver.open_session(DeviceIndex(0), "slow", sink.clone());
        session.claim(Timeout::from_millis(1000)).unwrap();
        session.set_device_enabled(true).unwrap();

        session.raise_status_event(status_event(&session, 1));
        session.raise_status_event(status_event(&session, 2));

        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.len() == 2));
        assert_eq!(sink.max_concurrent(ChannelKind::General), 2);
    }

    #[test]
    fn test_freeze_holds_back_delivery() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.set_freeze_events(true).unwrap();
        session.raise_status_event(status_event(&session, 3));
        assert_eq!(session.queued_events(ChannelKind::General), 1);
        assert!(stays_false(Duration::from_millis(50), || !sink.is_empty()));

        session.set_freeze_events(false).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.status_values() == vec![3]));
    }

    #[test]
    fn test_strict_fifo_holds_events_behind_data() {
        let driver = driver_with(EngineConfig {
            strict_fifo: true,
            ..Default::default()
        });
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_status_event(status_event(&session, 1));
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.status_values() == vec![1]));

        session.raise_data_event(DataEvent::new(session.id(), 0, b"4006381333931".to_vec()));
        session.raise_status_event(status_event(&session, 2));
        assert!(stays_false(Duration::from_millis(100), || sink.len() > 1));

        session.set_data_event_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.len() == 3));
        assert_eq!(sink.data().len(), 1);
        assert_eq!(sink.status_values(), vec![1, 2]);
    }
}

mod input {
    use super::*;

    fn scan(session: &Session, label: &[u8]) -> DataEvent {
        DataEvent::new(session.id(), 0, label.to_vec())
    }

    #[test]
    fn test_data_event_enabled_releases_one_event() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        for label in [b"one", b"two", b"six"] {
            session.raise_data_event(scan(&session, label));
        }
        assert_eq!(session.data_count(), 3);
        assert!(stays_false(Duration::from_millis(50), || !sink.is_empty()));

        session.set_data_event_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.data().len() == 1));
        assert!(stays_false(Duration::from_millis(50), || sink.data().len() > 1));
        assert_eq!(session.data_count(), 2);
        assert!(!session.props().data_event_enabled);
        assert_eq!(sink.data()[0].payload, b"one".to_vec());

        session.set_data_event_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.data().len() == 2));
        assert_eq!(sink.data()[1].payload, b"two".to_vec());
    }

    #[test]
    fn test_input_error_reported_ahead_of_buffered_data() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_data_event(scan(&session, b"one"));
        session.raise_data_event(scan(&session, b"two"));
        let error = DeviceError::failure("misread");
        session.raise_error_event(ErrorEvent::new(session.id(), &error, ErrorLocus::Input));

        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(session.queued_events(ChannelKind::Data), 4);

        // The input-data copy continues input by default, then "one" follows
        session.set_data_event_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.len() == 2));
        assert_eq!(sink.errors()[0].locus, ErrorLocus::InputData);
        assert_eq!(sink.errors()[0].message, "misread");
        assert_eq!(sink.data()[0].payload, b"one".to_vec());

        session.set_data_event_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.data().len() == 2));

        // The input error itself clears input by default
        session.set_data_event_enabled(true).unwrap();
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || sink.errors().len() == 2));
        assert_eq!(sink.errors()[1].locus, ErrorLocus::Input);
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || {
            session.state() == SessionState::Idle
        }));
        assert_eq!(session.data_count(), 0);
    }

    #[test]
    fn test_clear_input_drops_buffered_data() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();

        session.raise_data_event(scan(&session, b"one"));
        session.raise_data_event(scan(&session, b"two"));
        session.clear_input().unwrap();

        assert_eq!(session.data_count(), 0);
        assert_eq!(session.queued_events(ChannelKind::Data), 0);
        session.set_data_event_enabled(true).unwrap();
        assert!(stays_false(Duration::from_millis(50), || !sink.is_empty()));
    }

    #[test]
    fn test_auto_disable_after_first_data() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        session.set_auto_disable(true).unwrap();

        session.raise_data_event(scan(&session, b"one"));
        assert!(!session.is_enabled());
        session.raise_data_event(scan(&session, b"two"));
        assert_eq!(session.data_count(), 1);
    }

    #[test]
    fn test_disabled_session_drops_device_events() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        session.set_device_enabled(false).unwrap();

        session.raise_data_event(scan(&session, b"lost"));
        session.raise_status_event(status_event(&session, 4));
        assert_eq!(session.data_count(), 0);
        assert!(stays_false(Duration::from_millis(50), || !sink.is_empty()));
    }
}

mod claim {
    use super::*;

    #[test]
    fn test_claim_waits_for_release() {
        let driver = driver();
        let (holder, _sink) = open_enabled(&driver, DeviceIndex(0), "first").unwrap();
        let other = driver.open_session(DeviceIndex(0), "second", Arc::new(RecordingSink::new()));

        let err = other.claim(Timeout::from_millis(100)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(!other.is_claimed());

        let releaser = {
            let holder = holder.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                holder.release().unwrap();
            })
        };
        other.claim(Timeout::from_millis(3000)).unwrap();
        releaser.join().unwrap();

        assert!(other.is_claimed());
        assert_eq!(driver.device(DeviceIndex(0)).claimed_by(), Some(other.id()));
        assert!(!holder.is_enabled());
    }

    #[test]
    fn test_claim_is_idempotent() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        session.claim(Timeout::IMMEDIATE).unwrap();
        assert!(session.is_claimed());
    }

    #[test]
    fn test_shareable_devices_cannot_be_claimed() {
        let class = GenericClass::new("Keylock").with_exclusivity(Exclusivity::Shareable);
        let driver = Driver::new("keylock", Arc::new(class), EngineConfig::default());
        let session = driver.open_session(DeviceIndex(0), "keylock", Arc::new(RecordingSink::new()));

        let err = session.claim(Timeout::IMMEDIATE).unwrap_err();
        assert_eq!(err.code, ErrorCode::Illegal);
        session.set_device_enabled(true).unwrap();
    }

    #[test]
    fn test_power_notify_only_while_disabled() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        let err = session.set_power_notify(true).unwrap_err();
        assert_eq!(err.code, ErrorCode::Illegal);
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(3), "scanner").unwrap();
        session.raise_data_event(DataEvent::new(session.id(), 0, b"x".to_vec()));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.logical_name, "scanner");
        assert_eq!(snapshot.device, DeviceIndex(3));
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(snapshot.props.claimed);
        assert!(snapshot.props.device_enabled);
        assert_eq!(snapshot.props.data_count, 1);
        assert_eq!(snapshot.queued_events.data, 1);
        assert_eq!(snapshot.commands, 0);
    }
}

mod waiting_raisers {
    use super::*;

    #[test]
    fn test_direct_io_comes_back_modified() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        sink.set_direct_io_reply(Some(42));

        let mut event = session
            .raise_direct_io_event_and_wait(
                DirectIoEvent::new(session.id(), 5, 0, vec![1, 2]),
                Timeout::from_millis(3000),
            )
            .unwrap();

        assert_eq!(event.data(), 42);
        assert_eq!(event.payload(), &[1, 2]);
        assert!(event.is_write_protected());
        assert_eq!(event.set_data(1).unwrap_err().code, ErrorCode::Illegal);
    }

    #[test]
    fn test_transition_event_round_trips() {
        let driver = driver();
        let (session, sink) = open_enabled(&driver, DeviceIndex(0), "pinpad").unwrap();

        let event = session
            .raise_transition_event_and_wait(
                TransitionEvent::new(session.id(), 1, 0, "enter pin"),
                Timeout::from_millis(3000),
            )
            .unwrap();
        assert_eq!(event.text(), "enter pin");
        assert!(event.is_write_protected());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_wait_times_out_while_frozen() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        session.set_freeze_events(true).unwrap();

        let err = session
            .raise_direct_io_event_and_wait(
                DirectIoEvent::new(session.id(), 5, 0, Vec::new()),
                Timeout::from_millis(100),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[test]
    fn test_wait_requires_enabled_session() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        session.set_device_enabled(false).unwrap();

        let err = session
            .raise_direct_io_event_and_wait(
                DirectIoEvent::new(session.id(), 5, 0, Vec::new()),
                Timeout::from_millis(100),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Disabled);
    }

    #[test]
    fn test_release_wakes_waiting_raiser() {
        let driver = driver();
        let (session, _sink) = open_enabled(&driver, DeviceIndex(0), "scanner").unwrap();
        session.set_freeze_events(true).unwrap();

        let raiser = {
            let session = session.clone();
            thread::spawn(move || {
                session.raise_direct_io_event_and_wait(
                    DirectIoEvent::new(session.id(), 5, 0, Vec::new()),
                    Timeout::INFINITE,
                )
            })
        };
        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || {
            session.queued_events(ChannelKind::General) == 1
        }));

        session.release().unwrap();
        let err = raiser.join().unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::Failure);
        assert!(err.message.contains("discarded"));
    }

    /// Sink whose transition callback panics
    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn deliver_data(&self, _event: &DataEvent) {}
        fn deliver_error(&self, _event: &mut ErrorEvent) {}
        fn deliver_status(&self, _event: &StatusUpdateEvent) {}
        fn deliver_output_complete(&self, _event: &OutputCompleteEvent) {}
        fn deliver_direct_io(&self, _event: &mut DirectIoEvent) {}

        fn deliver_transition(&self, _event: &mut TransitionEvent) {
            panic!("display unplugged");
        }
    }

    #[test]
    fn test_panicking_callback_wakes_waiting_raiser() {
        let driver = driver();
        let session = driver.open_session(DeviceIndex(0), "pinpad", Arc::new(PanickingSink));
        session.claim(Timeout::from_millis(1000)).unwrap();
        session.set_device_enabled(true).unwrap();

        let err = session
            .raise_transition_event_and_wait(
                TransitionEvent::new(session.id(), 1, 0, "enter pin"),
                Timeout::INFINITE,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Failure);

        // The drain thread survived the panic
        let err = session
            .raise_transition_event_and_wait(
                TransitionEvent::new(session.id(), 2, 0, "again"),
                Timeout::from_millis(1000),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Failure);
    }
}

mod bridge {
    use super::*;

    #[tokio::test]
    async fn test_bridge_forwards_status() {
        let (bridge, sink) = create_event_bridge(16);
        let driver = driver();
        let session = driver.open_session(DeviceIndex(0), "bridged", Arc::new(sink));
        session.claim(Timeout::from_millis(1000)).unwrap();
        session.set_device_enabled(true).unwrap();

        session.raise_status_event(status_event(&session, 12));

        let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
            .await
            .expect("bridge timed out")
            .unwrap();
        match event {
            Event::Status(s) => {
                assert_eq!(s.status, 12);
                assert_eq!(s.source, session.id());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bridge_error_responder_clears() {
        let (bridge, sink) = create_event_bridge(16);
        let sink = sink.with_error_responder(|_event| Some(ErrorResponse::Clear));
        let driver = driver();
        let session = driver.open_session(DeviceIndex(0), "bridged", Arc::new(sink));
        session.claim(Timeout::from_millis(1000)).unwrap();
        session.set_device_enabled(true).unwrap();

        Command::new(&session, failing_task("print", DeviceError::failure("cover open")))
            .enqueue()
            .unwrap();

        let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
            .await
            .expect("bridge timed out")
            .unwrap();
        match event {
            Event::Error(e) => assert_eq!(e.response, ErrorResponse::Clear),
            other => panic!("unexpected event {:?}", other),
        }

        let session = session.clone();
        let idle = tokio::task::spawn_blocking(move || {
            wait_for(DEFAULT_TEST_TIMEOUT, || session.state() == SessionState::Idle)
        })
        .await
        .unwrap();
        assert!(idle);
    }
}
