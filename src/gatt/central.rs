//! btleplug-backed transport.
//!
//! The rest of the tool is thread-based; btleplug is async. This module
//! owns a small tokio runtime and exposes the synchronous
//! [`GattTransport`] / [`GattConnection`] seam over it. Notification
//! streams and the central event stream run as tasks on that runtime and
//! feed the sink / disconnect token from there.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::runtime::{Builder, Runtime};

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::gatt::{
    uuid, CharProps, CharacteristicInfo, GattConnection, GattTransport, NotificationSink, Profile,
    ScanEntry, ServiceInfo,
};

/// How often the connect loop re-checks the adapter's peripheral list.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn map_err(err: btleplug::Error) -> TransportError {
    match err {
        btleplug::Error::NotConnected => TransportError::Disconnected,
        btleplug::Error::PermissionDenied => TransportError::Permission(err.to_string()),
        btleplug::Error::TimedOut(_) => TransportError::Timeout,
        btleplug::Error::DeviceNotFound => TransportError::NotFound("device".into()),
        other => TransportError::Protocol(other.to_string()),
    }
}

/// btleplug central wrapped behind the synchronous transport seam.
pub struct BtleTransport {
    runtime: Runtime,
    adapter: Adapter,
}

impl BtleTransport {
    /// Bind to the first Bluetooth adapter on the system.
    ///
    /// # Errors
    ///
    /// `TransportError::NotFound` when no adapter exists;
    /// `TransportError::Permission` when the OS denies access.
    pub fn new() -> Result<Self, TransportError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ble")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Protocol(format!("tokio runtime: {e}")))?;

        let adapter = runtime.block_on(async {
            let manager = Manager::new().await.map_err(map_err)?;
            let adapters = manager.adapters().await.map_err(map_err)?;
            adapters
                .into_iter()
                .next()
                .ok_or_else(|| TransportError::NotFound("no bluetooth adapter".into()))
        })?;

        Ok(Self { runtime, adapter })
    }

    /// Scan for `duration` and list everything seen.
    ///
    /// # Errors
    ///
    /// Propagates adapter failures as `TransportError`.
    pub fn scan(&self, duration: Duration) -> Result<Vec<ScanEntry>, TransportError> {
        self.runtime.block_on(async {
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(map_err)?;
            tokio::time::sleep(duration).await;
            let _ = self.adapter.stop_scan().await;

            let mut entries = Vec::new();
            for peripheral in self.adapter.peripherals().await.map_err(map_err)? {
                let props = peripheral.properties().await.map_err(map_err)?;
                let address = peripheral.address().to_string();
                let (name, rssi) = match props {
                    Some(p) => (p.local_name, p.rssi),
                    None => (None, None),
                };
                entries.push(ScanEntry {
                    address,
                    name,
                    rssi,
                });
            }
            Ok(entries)
        })
    }

    /// Find a peripheral by adapter address (case-insensitive) or
    /// advertised name, scanning until `timeout`.
    async fn find_peripheral(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Peripheral, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_err)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for peripheral in self.adapter.peripherals().await.map_err(map_err)? {
                if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                    let _ = self.adapter.stop_scan().await;
                    return Ok(peripheral);
                }
                if let Ok(Some(props)) = peripheral.properties().await {
                    if props.local_name.as_deref() == Some(address) {
                        let _ = self.adapter.stop_scan().await;
                        return Ok(peripheral);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.adapter.stop_scan().await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }
}

impl GattTransport for BtleTransport {
    fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn GattConnection>, TransportError> {
        let peripheral = self
            .runtime
            .block_on(async {
                let peripheral = self.find_peripheral(address, timeout).await?;
                tokio::time::timeout(timeout, peripheral.connect())
                    .await
                    .map_err(|_| TransportError::Timeout)?
                    .map_err(map_err)?;
                Ok::<_, TransportError>(peripheral)
            })?;

        let disconnect = CancelToken::new();

        // Watch the central event stream for this peripheral's disconnect.
        let event_task = {
            let events = self
                .runtime
                .block_on(self.adapter.events())
                .map_err(map_err)?;
            let id = peripheral.id();
            let disconnect = disconnect.clone();
            self.runtime.spawn(async move {
                let mut events = events;
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(gone) = event {
                        if gone == id {
                            log::info!("peripheral disconnected");
                            disconnect.cancel();
                            return;
                        }
                    }
                }
            })
        };

        log::debug!("connected to {}", address);

        Ok(Arc::new(BtleConnection {
            handle: self.runtime.handle().clone(),
            peripheral,
            disconnect,
            closed: AtomicBool::new(false),
            characteristics: Mutex::new(None),
            subscribed: Mutex::new(BTreeSet::new()),
            tasks: Mutex::new(vec![event_task]),
        }))
    }
}

/// One established btleplug connection.
struct BtleConnection {
    handle: tokio::runtime::Handle,
    peripheral: Peripheral,
    disconnect: CancelToken,
    closed: AtomicBool,
    /// Discovered characteristics, populated by the first discover call.
    characteristics: Mutex<Option<Vec<Characteristic>>>,
    /// Normal-form UUIDs with notifications enabled.
    subscribed: Mutex<BTreeSet<String>>,
    /// Background tasks: event watcher, notification forwarder.
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BtleConnection {
    /// Discover (once) and return the characteristic matching `raw`.
    fn find_characteristic(
        &self,
        raw: &str,
        timeout: Duration,
    ) -> Result<Characteristic, TransportError> {
        self.ensure_discovered(timeout)?;
        let characteristics = self
            .characteristics
            .lock()
            .expect("characteristics mutex poisoned");
        characteristics
            .as_ref()
            .expect("discovered above")
            .iter()
            .find(|c| uuid::matches(&c.uuid.to_string(), raw))
            .cloned()
            .ok_or_else(|| TransportError::NotFound(raw.to_string()))
    }

    fn ensure_discovered(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut characteristics = self
            .characteristics
            .lock()
            .expect("characteristics mutex poisoned");
        if characteristics.is_some() {
            return Ok(());
        }
        self.handle.block_on(async {
            tokio::time::timeout(timeout, self.peripheral.discover_services())
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(map_err)
        })?;
        *characteristics = Some(self.peripheral.characteristics().into_iter().collect());
        Ok(())
    }
}

impl GattConnection for BtleConnection {
    fn discover(&self, timeout: Duration) -> Result<Profile, TransportError> {
        self.ensure_discovered(timeout)?;
        let mut services = Vec::new();
        for service in self.peripheral.services() {
            let service_uuid = uuid::normalize(&service.uuid.to_string())
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            let mut characteristics = Vec::new();
            for c in &service.characteristics {
                let char_uuid = uuid::normalize(&c.uuid.to_string())
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                characteristics.push(CharacteristicInfo {
                    uuid: char_uuid,
                    properties: CharProps {
                        read: c.properties.contains(CharPropFlags::READ),
                        write: c.properties.contains(CharPropFlags::WRITE),
                        write_without_response: c
                            .properties
                            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                        notify: c.properties.contains(CharPropFlags::NOTIFY),
                        indicate: c.properties.contains(CharPropFlags::INDICATE),
                    },
                });
            }
            services.push(ServiceInfo {
                uuid: service_uuid,
                characteristics,
            });
        }
        Ok(Profile { services })
    }

    fn subscribe(
        &self,
        characteristic_uuids: &[String],
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        for raw in characteristic_uuids {
            let characteristic = self.find_characteristic(raw, crate::constants::DEFAULT_DISCOVER_TIMEOUT)?;
            self.handle
                .block_on(self.peripheral.subscribe(&characteristic))
                .map_err(map_err)?;
            self.subscribed
                .lock()
                .expect("subscribed set mutex poisoned")
                .insert(raw.clone());
        }

        // One forwarder task per subscribe call; the stream yields every
        // notification on the connection, so filter to what was asked for.
        let wanted: BTreeSet<String> = characteristic_uuids.iter().cloned().collect();
        let stream = self
            .handle
            .block_on(self.peripheral.notifications())
            .map_err(map_err)?;
        let task = self.handle.spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                let Ok(normal) = uuid::normalize(&notification.uuid.to_string()) else {
                    continue;
                };
                if wanted.contains(&normal) {
                    sink(&normal, notification.value);
                }
            }
        });
        self.tasks
            .lock()
            .expect("task list mutex poisoned")
            .push(task);

        Ok(())
    }

    fn unsubscribe_all(&self) -> Result<(), TransportError> {
        let subscribed: Vec<String> = {
            let mut subscribed = self
                .subscribed
                .lock()
                .expect("subscribed set mutex poisoned");
            std::mem::take(&mut *subscribed).into_iter().collect()
        };
        for raw in subscribed {
            match self.find_characteristic(&raw, crate::constants::DEFAULT_DISCOVER_TIMEOUT) {
                Ok(characteristic) => {
                    if let Err(e) = self
                        .handle
                        .block_on(self.peripheral.unsubscribe(&characteristic))
                    {
                        log::debug!("unsubscribe {} failed: {}", raw, e);
                    }
                }
                Err(e) => log::debug!("unsubscribe lookup {} failed: {}", raw, e),
            }
        }
        Ok(())
    }

    fn read_characteristic(&self, raw: &str, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.find_characteristic(raw, timeout)?;
        self.handle.block_on(async {
            tokio::time::timeout(timeout, self.peripheral.read(&characteristic))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(map_err)
        })
    }

    fn write(
        &self,
        raw: &str,
        bytes: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let characteristic = self.find_characteristic(raw, timeout)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.handle.block_on(async {
            tokio::time::timeout(timeout, self.peripheral.write(&characteristic, bytes, write_type))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(map_err)
        })
    }

    fn disconnect_signal(&self) -> CancelToken {
        self.disconnect.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stop watching events first so an orderly disconnect is not
        // mistaken for a dropped link.
        for task in std::mem::take(&mut *self.tasks.lock().expect("task list mutex poisoned")) {
            task.abort();
        }
        let _ = self.unsubscribe_all();
        if let Err(e) = self.handle.block_on(self.peripheral.disconnect()) {
            log::debug!("disconnect failed: {}", e);
        }
        log::debug!("connection closed");
    }
}
