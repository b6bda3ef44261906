// Notification engine integration tests against the mock transport.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bletty::gatt::notify::NotificationEngine;
use bletty::gatt::{CharProps, CharacteristicInfo, Profile, Record, ServiceInfo};
use bletty::{CancelToken, GattTransport, MockTransport, StreamMode, SubscribeOptions};

fn heart_rate_profile() -> Profile {
    Profile {
        services: vec![ServiceInfo {
            uuid: "180d".into(),
            characteristics: vec![
                CharacteristicInfo {
                    uuid: "2a37".into(),
                    properties: CharProps {
                        notify: true,
                        ..CharProps::default()
                    },
                },
                CharacteristicInfo {
                    uuid: "2a38".into(),
                    properties: CharProps {
                        notify: true,
                        ..CharProps::default()
                    },
                },
            ],
        }],
    }
}

fn subscription(chars: &[&str]) -> Vec<SubscribeOptions> {
    vec![SubscribeOptions {
        service_uuid: "180d".into(),
        characteristic_uuids: chars.iter().map(|c| c.to_string()).collect(),
    }]
}

type Captured = Arc<Mutex<Vec<Record>>>;

fn capture() -> (Captured, bletty::gatt::notify::RecordCallback) {
    let records: Captured = Arc::new(Mutex::new(Vec::new()));
    let callback: bletty::gatt::notify::RecordCallback = {
        let records = Arc::clone(&records);
        Arc::new(move |record: Record| {
            records.lock().unwrap().push(record);
        })
    };
    (records, callback)
}

fn wait_for<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_every_update_emits_one_record_per_notification() {
    let transport = MockTransport::new();
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
    let token = CancelToken::new();
    let (records, callback) = capture();

    let engine = NotificationEngine::start(
        Arc::clone(&conn),
        &subscription(&["2a37"]),
        StreamMode::EveryUpdate,
        Duration::from_millis(100),
        callback,
        &token,
    )
    .expect("start engine");

    for i in 0..5u8 {
        peripheral.inject("2a37", &[i]);
    }

    assert!(wait_for(Duration::from_secs(2), || records
        .lock()
        .unwrap()
        .len()
        == 5));
    let records = records.lock().unwrap();
    for (i, record) in records.iter().enumerate() {
        let values = record.values.as_ref().expect("values populated");
        assert_eq!(values.len(), 1);
        assert_eq!(values["2a37"], vec![i as u8]);
        assert!(record.batch_values.is_none());
    }
    drop(records);
    engine.stop();
}

#[test]
fn test_batched_collects_window_in_arrival_order() {
    let transport = MockTransport::new();
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
    let token = CancelToken::new();
    let (records, callback) = capture();

    let engine = NotificationEngine::start(
        Arc::clone(&conn),
        &subscription(&["2a37"]),
        StreamMode::Batched,
        Duration::from_millis(100),
        callback,
        &token,
    )
    .expect("start engine");

    // All three land well inside one rate window.
    peripheral.inject("2a37", &[0x0a]);
    peripheral.inject("2a37", &[0x0b]);
    peripheral.inject("2a37", &[0x0c]);

    assert!(wait_for(Duration::from_secs(2), || !records
        .lock()
        .unwrap()
        .is_empty()));
    let records = records.lock().unwrap();
    let batch = records[0].batch_values.as_ref().expect("batch populated");
    assert_eq!(batch["2a37"], vec![vec![0x0a], vec![0x0b], vec![0x0c]]);
    assert!(records[0].values.is_none());
    drop(records);
    engine.stop();
}

#[test]
fn test_batched_respects_rate_cap() {
    let transport = MockTransport::new();
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
    let token = CancelToken::new();
    let (records, callback) = capture();

    let engine = NotificationEngine::start(
        Arc::clone(&conn),
        &subscription(&["2a37"]),
        StreamMode::Batched,
        Duration::from_millis(100),
        callback,
        &token,
    )
    .expect("start engine");

    // A steady stream over ~350ms cannot produce more than ~4 emissions at
    // one per 100ms.
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(350) {
        peripheral.inject("2a37", &[0x01]);
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(150));
    let count = records.lock().unwrap().len();
    assert!(count >= 2, "expected multiple windows, got {count}");
    assert!(count <= 5, "rate cap exceeded: {count} emissions");
    engine.stop();
}

#[test]
fn test_aggregated_latest_flags_missing_characteristics() {
    let transport = MockTransport::new();
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
    let token = CancelToken::new();
    let (records, callback) = capture();

    let engine = NotificationEngine::start(
        Arc::clone(&conn),
        &subscription(&["2a37", "2a38"]),
        StreamMode::AggregatedLatest,
        Duration::from_millis(100),
        callback,
        &token,
    )
    .expect("start engine");

    peripheral.inject("2a37", &[0x10]);

    assert!(wait_for(Duration::from_secs(2), || !records
        .lock()
        .unwrap()
        .is_empty()));
    let records = records.lock().unwrap();
    let values = records[0].values.as_ref().expect("values populated");
    assert_eq!(values.len(), 2);
    assert_eq!(values["2a37"], vec![0x10]);
    assert_eq!(values["2a38"], Vec::<u8>::new());
    assert!(records[0].flags.missing);
    drop(records);
    engine.stop();
}

#[test]
fn test_aggregated_latest_is_silent_without_data() {
    let transport = MockTransport::new();
    let _peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
    let token = CancelToken::new();
    let (records, callback) = capture();

    let engine = NotificationEngine::start(
        Arc::clone(&conn),
        &subscription(&["2a37"]),
        StreamMode::AggregatedLatest,
        Duration::from_millis(50),
        callback,
        &token,
    )
    .expect("start engine");

    // Several ticks pass with no notifications: nothing may be emitted.
    thread::sleep(Duration::from_millis(250));
    assert!(records.lock().unwrap().is_empty());
    engine.stop();
}

#[test]
fn test_stop_unsubscribes_and_returns_promptly() {
    let transport = MockTransport::new();
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
    let token = CancelToken::new();
    let (_records, callback) = capture();

    let engine = NotificationEngine::start(
        Arc::clone(&conn),
        &subscription(&["2a37"]),
        StreamMode::Batched,
        Duration::from_millis(100),
        callback,
        &token,
    )
    .expect("start engine");

    assert!(peripheral.is_subscribed());
    let started = Instant::now();
    engine.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!peripheral.is_subscribed());
}
