// End-to-end bridge tests against the mock transport.
//
// Each test runs the full arrangement: mock peripheral <-> notification
// engine <-> Lua transform <-> PTY engine <-> a test-side fd on the slave
// path standing in for the legacy serial application.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bletty::bridge::{run_device_bridge, BridgeOptions};
use bletty::gatt::{CharProps, CharacteristicInfo, Profile, ServiceInfo};
use bletty::{BridgeError, CancelToken, MockPeripheral, MockTransport, StreamMode, SubscribeOptions};

const ECHO_SCRIPT: &str = r#"
    function ble_to_tty(record)
        for _, value in pairs(record.values) do
            buffer:append(value)
        end
    end

    function tty_to_ble(data)
        ble.set("2a39", data)
    end
"#;

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
                    uuid: "2a39".into(),
                    properties: CharProps {
                        write: true,
                        ..CharProps::default()
                    },
                },
            ],
        }],
    }
}

fn echo_options() -> BridgeOptions {
    let mut options = BridgeOptions::new("aa:bb");
    options.script_source = ECHO_SCRIPT.into();
    options.script_name = "echo.lua".into();
    options.subscriptions = vec![SubscribeOptions {
        service_uuid: "180d".into(),
        characteristic_uuids: vec!["2a37".into()],
    }];
    options
}

/// A bridge running on a background thread, with the slave path reported
/// through a channel once the bridge reaches Running.
struct RunningBridge {
    token: CancelToken,
    tty_path: String,
    thread: thread::JoinHandle<Result<(), BridgeError>>,
}

fn start_bridge(
    transport: Arc<MockTransport>,
    options: BridgeOptions,
) -> (RunningBridge, Arc<MockPeripheral>) {
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let token = CancelToken::new();
    let (path_tx, path_rx) = mpsc::sync_channel::<String>(1);

    let bridge_token = token.clone();
    let thread = thread::spawn(move || {
        run_device_bridge(
            &bridge_token,
            transport.as_ref(),
            options,
            |_progress| {},
            move |handle| {
                path_tx.send(handle.tty_path().to_string()).unwrap();
                handle.wait();
            },
        )
    });

    let tty_path = path_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("bridge reached Running");
    (
        RunningBridge {
            token,
            tty_path,
            thread,
        },
        peripheral,
    )
}

fn open_slave(path: &str) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .expect("open slave path")
}

fn read_from_slave(slave: &mut File, expected: usize, deadline: Duration) -> Vec<u8> {
    let start = Instant::now();
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while collected.len() < expected && start.elapsed() < deadline {
        match slave.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("slave read failed: {e}"),
        }
    }
    collected
}

#[test]
fn test_echo_bridge_forwards_notifications_in_order() {
    let transport = Arc::new(MockTransport::new());
    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), echo_options());
    let mut slave = open_slave(&bridge.tty_path);

    peripheral.inject("2a37", &[0x01]);
    peripheral.inject("2a37", &[0x02]);

    let collected = read_from_slave(&mut slave, 2, Duration::from_millis(200));
    assert_eq!(collected, vec![0x01, 0x02]);

    bridge.token.cancel();
    assert!(bridge.thread.join().unwrap().is_ok());
}

#[test]
fn test_reverse_path_writes_reach_the_peripheral() {
    let transport = Arc::new(MockTransport::new());
    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), echo_options());
    let mut slave = open_slave(&bridge.tty_path);

    slave.write_all(b"at+test\r").expect("write to slave");

    let start = Instant::now();
    while peripheral.writes().is_empty() && start.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(5));
    }
    let writes = peripheral.writes();
    assert!(!writes.is_empty(), "no GATT writes captured");
    assert_eq!(writes[0].uuid, "2a39");
    let payload: Vec<u8> = writes.iter().flat_map(|w| w.data.clone()).collect();
    assert_eq!(payload, b"at+test\r");

    bridge.token.cancel();
    assert!(bridge.thread.join().unwrap().is_ok());
}

#[test]
fn test_backpressure_drops_oldest_and_accounts() {
    let transport = Arc::new(MockTransport::new());
    let mut options = echo_options();
    options.write_cap = 8;
    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), options);

    // No slave reader attached yet: the 10-byte burst lands in the 8-byte
    // write ring in one call and must drop the 2 oldest bytes.
    peripheral.inject("2a37", b"ABCDEFGHIJ");

    let mut slave = open_slave(&bridge.tty_path);
    let collected = read_from_slave(&mut slave, 8, Duration::from_secs(2));
    assert_eq!(collected, b"CDEFGHIJ");

    bridge.token.cancel();
    assert!(bridge.thread.join().unwrap().is_ok());
}

#[test]
fn test_aggregated_latest_bridge_flags_missing() {
    let transport = Arc::new(MockTransport::new());
    let mut options = BridgeOptions::new("aa:bb");
    options.script_name = "agg.lua".into();
    options.script_source = r#"
        function ble_to_tty(record)
            local line = ""
            if record.values["2a37"] then line = line .. "hr" end
            if record.flags.missing then line = line .. "!" end
            buffer:append(line .. "\n")
        end

        function tty_to_ble(data) end
    "#
    .into();
    options.subscriptions = vec![SubscribeOptions {
        service_uuid: "180d".into(),
        characteristic_uuids: vec!["2a37".into(), "2a38".into()],
    }];
    options.stream_mode = StreamMode::AggregatedLatest;
    options.max_rate = Duration::from_millis(100);

    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), options);
    let mut slave = open_slave(&bridge.tty_path);

    peripheral.inject("2a37", &[0x10]);
    // One tick later the record carries 2a37 plus a flagged-missing 2a38.
    let collected = read_from_slave(&mut slave, 4, Duration::from_millis(300));
    assert_eq!(&collected[..4], b"hr!\n");

    bridge.token.cancel();
    assert!(bridge.thread.join().unwrap().is_ok());
}

#[test]
fn test_batched_bridge_preserves_order() {
    let transport = Arc::new(MockTransport::new());
    let mut options = BridgeOptions::new("aa:bb");
    options.script_name = "batch.lua".into();
    options.script_source = r#"
        function ble_to_tty(record)
            for _, batch in pairs(record.batch_values) do
                for _, value in ipairs(batch) do
                    buffer:append(value)
                end
            end
        end

        function tty_to_ble(data) end
    "#
    .into();
    options.subscriptions = vec![SubscribeOptions {
        service_uuid: "180d".into(),
        characteristic_uuids: vec!["2a37".into()],
    }];
    options.stream_mode = StreamMode::Batched;
    options.max_rate = Duration::from_millis(100);

    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), options);
    let mut slave = open_slave(&bridge.tty_path);

    peripheral.inject("2a37", &[0x0a]);
    peripheral.inject("2a37", &[0x0b]);
    peripheral.inject("2a37", &[0x0c]);

    let collected = read_from_slave(&mut slave, 3, Duration::from_millis(400));
    assert_eq!(collected, vec![0x0a, 0x0b, 0x0c]);

    bridge.token.cancel();
    assert!(bridge.thread.join().unwrap().is_ok());
}

#[test]
fn test_graceful_shutdown_within_deadline() {
    let transport = Arc::new(MockTransport::new());
    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), echo_options());

    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    bridge.token.cancel();
    let result = bridge.thread.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    // User cancellation is a clean exit, and the transport is closed.
    assert!(result.is_ok());
    assert!(peripheral.is_closed());
    assert!(!peripheral.is_subscribed());
}

#[test]
fn test_transport_disconnect_surfaces_connection_lost() {
    let transport = Arc::new(MockTransport::new());
    let dir = tempfile::tempdir().unwrap();
    let symlink = dir.path().join("bletty0");
    let mut options = echo_options();
    options.tty_symlink_path = Some(symlink.clone());

    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), options);
    assert!(std::fs::read_link(&symlink).is_ok(), "symlink created");

    let started = Instant::now();
    peripheral.trigger_disconnect();
    let result = bridge.thread.join().unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(matches!(result, Err(BridgeError::ConnectionLost)));
    assert!(
        std::fs::symlink_metadata(&symlink).is_err(),
        "symlink removed on teardown"
    );
}

#[test]
fn test_script_fatal_error_terminates_bridge() {
    let transport = Arc::new(MockTransport::new());
    let mut options = echo_options();
    options.script_source = r#"
        function ble_to_tty(record)
            error("deliberate failure")
        end

        function tty_to_ble(data) end
    "#
    .into();

    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), options);
    peripheral.inject("2a37", &[0x01]);

    let result = bridge.thread.join().unwrap();
    assert!(matches!(result, Err(BridgeError::Script(_))));
}

#[test]
fn test_script_load_failure_closes_transport() {
    let transport = Arc::new(MockTransport::new());
    let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
    let token = CancelToken::new();
    let mut options = echo_options();
    options.script_source = "this is not lua (".into();

    let result = run_device_bridge(
        &token,
        transport.as_ref(),
        options,
        |_progress| {},
        |_handle| panic!("bridge must not reach Running"),
    );
    assert!(matches!(result, Err(BridgeError::Script(_))));
    assert!(peripheral.is_closed());
}

#[test]
fn test_connect_failure_reports_transport_error() {
    let transport = MockTransport::new();
    let token = CancelToken::new();
    let result = run_device_bridge(
        &token,
        &transport,
        BridgeOptions::new("no:such:device"),
        |_progress| {},
        |_handle| panic!("bridge must not reach Running"),
    );
    assert!(matches!(result, Err(BridgeError::Transport(_))));
}

#[test]
fn test_script_driven_subscription_mode() {
    // With no caller subscriptions, the script's load-time
    // ble:subscribe{...} decides what to listen to.
    let transport = Arc::new(MockTransport::new());
    let mut options = BridgeOptions::new("aa:bb");
    options.script_name = "selfsub.lua".into();
    options.script_source = r#"
        ble:subscribe{
            services = {
                { service = "180d", characteristics = { "2a37" } },
            },
            pattern = "every-update",
        }

        function ble_to_tty(record)
            for _, value in pairs(record.values) do
                buffer:append(value)
            end
        end

        function tty_to_ble(data) end
    "#
    .into();

    let (bridge, peripheral) = start_bridge(Arc::clone(&transport), options);
    let mut slave = open_slave(&bridge.tty_path);

    peripheral.inject("2a37", &[0x42]);
    let collected = read_from_slave(&mut slave, 1, Duration::from_secs(2));
    assert_eq!(collected, vec![0x42]);

    bridge.token.cancel();
    assert!(bridge.thread.join().unwrap().is_ok());
}
