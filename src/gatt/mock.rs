//! In-process mock transport.
//!
//! Implements the [`GattTransport`] seam without any radio: tests and
//! offline demos register peripherals, inject notifications, and capture
//! writes. The same handle the test holds doubles as the injection side of
//! the connection the bridge holds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::gatt::{
    uuid, GattConnection, GattTransport, NotificationSink, Profile,
};

/// A write captured by the mock connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedWrite {
    pub uuid: String,
    pub data: Vec<u8>,
    pub with_response: bool,
}

/// Shared state of one mock peripheral; held by both the test (for
/// injection and assertions) and the connection handed to the bridge.
pub struct MockPeripheral {
    address: String,
    profile: Profile,
    values: Mutex<BTreeMap<String, Vec<u8>>>,
    sink: Mutex<Option<(Vec<String>, NotificationSink)>>,
    writes: Mutex<Vec<CapturedWrite>>,
    disconnect: CancelToken,
    closed: AtomicBool,
}

impl MockPeripheral {
    /// Inject a notification as if the peripheral pushed it.
    ///
    /// Delivered synchronously on the caller's thread iff the
    /// characteristic is currently subscribed; silently dropped otherwise
    /// (matching a radio that notifies into the void).
    pub fn inject(&self, char_uuid: &str, value: &[u8]) {
        let normal = match uuid::normalize(char_uuid) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("mock inject with bad uuid: {}", e);
                return;
            }
        };
        let sink = self.sink.lock().expect("mock sink mutex poisoned");
        if let Some((subscribed, sink)) = sink.as_ref() {
            if subscribed.iter().any(|u| u == &normal) {
                sink(&normal, value.to_vec());
            }
        }
    }

    /// Set the value returned by characteristic reads.
    pub fn set_value(&self, char_uuid: &str, value: &[u8]) {
        if let Ok(normal) = uuid::normalize(char_uuid) {
            self.values
                .lock()
                .expect("mock values mutex poisoned")
                .insert(normal, value.to_vec());
        }
    }

    /// Writes captured so far, in arrival order.
    #[must_use]
    pub fn writes(&self) -> Vec<CapturedWrite> {
        self.writes
            .lock()
            .expect("mock writes mutex poisoned")
            .clone()
    }

    /// Fire the disconnect signal, as if the link dropped.
    pub fn trigger_disconnect(&self) {
        self.disconnect.cancel();
    }

    /// Whether the bridge has closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a subscription is currently active.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.sink
            .lock()
            .expect("mock sink mutex poisoned")
            .is_some()
    }
}

/// Mock implementation of [`GattTransport`].
#[derive(Default)]
pub struct MockTransport {
    peripherals: Mutex<BTreeMap<String, Arc<MockPeripheral>>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peripheral; the returned handle injects notifications and
    /// inspects captured writes.
    pub fn add_peripheral(&self, address: &str, profile: Profile) -> Arc<MockPeripheral> {
        let peripheral = Arc::new(MockPeripheral {
            address: address.to_string(),
            profile,
            values: Mutex::new(BTreeMap::new()),
            sink: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            disconnect: CancelToken::new(),
            closed: AtomicBool::new(false),
        });
        self.peripherals
            .lock()
            .expect("mock peripherals mutex poisoned")
            .insert(address.to_ascii_lowercase(), Arc::clone(&peripheral));
        peripheral
    }
}

impl GattTransport for MockTransport {
    fn connect(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn GattConnection>, TransportError> {
        let peripherals = self
            .peripherals
            .lock()
            .expect("mock peripherals mutex poisoned");
        let peripheral = peripherals
            .get(&address.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::NotFound(address.to_string()))?;
        log::debug!("mock connect: {}", peripheral.address);
        Ok(Arc::new(MockConnection { peripheral }))
    }
}

/// Connection half handed to the bridge.
struct MockConnection {
    peripheral: Arc<MockPeripheral>,
}

impl GattConnection for MockConnection {
    fn discover(&self, _timeout: Duration) -> Result<Profile, TransportError> {
        if self.peripheral.is_closed() {
            return Err(TransportError::Disconnected);
        }
        Ok(self.peripheral.profile.clone())
    }

    fn subscribe(
        &self,
        characteristic_uuids: &[String],
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        if self.peripheral.is_closed() {
            return Err(TransportError::Disconnected);
        }
        *self
            .peripheral
            .sink
            .lock()
            .expect("mock sink mutex poisoned") = Some((characteristic_uuids.to_vec(), sink));
        Ok(())
    }

    fn unsubscribe_all(&self) -> Result<(), TransportError> {
        *self
            .peripheral
            .sink
            .lock()
            .expect("mock sink mutex poisoned") = None;
        Ok(())
    }

    fn read_characteristic(
        &self,
        char_uuid: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let normal =
            uuid::normalize(char_uuid).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.peripheral
            .values
            .lock()
            .expect("mock values mutex poisoned")
            .get(&normal)
            .cloned()
            .ok_or(TransportError::NotFound(normal))
    }

    fn write(
        &self,
        char_uuid: &str,
        bytes: &[u8],
        with_response: bool,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.peripheral.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let normal =
            uuid::normalize(char_uuid).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.peripheral
            .writes
            .lock()
            .expect("mock writes mutex poisoned")
            .push(CapturedWrite {
                uuid: normal,
                data: bytes.to_vec(),
                with_response,
            });
        Ok(())
    }

    fn disconnect_signal(&self) -> CancelToken {
        self.peripheral.disconnect.clone()
    }

    fn close(&self) {
        if !self.peripheral.closed.swap(true, Ordering::SeqCst) {
            let _ = self.unsubscribe_all();
            log::debug!("mock connection closed: {}", self.peripheral.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{CharProps, CharacteristicInfo, ServiceInfo};

    fn heart_rate_profile() -> Profile {
        Profile {
            services: vec![ServiceInfo {
                uuid: "180d".into(),
                characteristics: vec![CharacteristicInfo {
                    uuid: "2a37".into(),
                    properties: CharProps {
                        notify: true,
                        ..CharProps::default()
                    },
                }],
            }],
        }
    }

    #[test]
    fn test_connect_unknown_address_not_found() {
        let transport = MockTransport::new();
        assert!(matches!(
            transport.connect("aa:bb", Duration::from_secs(1)),
            Err(TransportError::NotFound(_))
        ));
    }

    #[test]
    fn test_inject_reaches_subscribed_sink() {
        let transport = MockTransport::new();
        let peripheral = transport.add_peripheral("AA:BB", heart_rate_profile());
        let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();

        let seen: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink: NotificationSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |uuid: &str, value: Vec<u8>| {
                seen.lock().unwrap().push((uuid.to_string(), value));
            })
        };
        conn.subscribe(&["2a37".to_string()], sink).unwrap();

        peripheral.inject("2A37", &[0x01]);
        peripheral.inject("2a38", &[0xff]); // not subscribed, dropped

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("2a37".to_string(), vec![0x01])]);
    }

    #[test]
    fn test_write_capture_normalises_uuid() {
        let transport = MockTransport::new();
        let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
        let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
        conn.write(
            "00002A39-0000-1000-8000-00805F9B34FB",
            &[0x05],
            false,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(peripheral.writes()[0].uuid, "2a39");
    }

    #[test]
    fn test_disconnect_signal_fires() {
        let transport = MockTransport::new();
        let peripheral = transport.add_peripheral("aa:bb", heart_rate_profile());
        let conn = transport.connect("aa:bb", Duration::from_secs(1)).unwrap();
        let signal = conn.disconnect_signal();
        assert!(!signal.is_cancelled());
        peripheral.trigger_disconnect();
        assert!(signal.is_cancelled());
    }
}
