//! GATT data model and the transport seam.
//!
//! The bridge core never talks to a BLE stack directly: it consumes the
//! [`GattTransport`] / [`GattConnection`] traits defined here. The shipped
//! implementations are [`central::BtleTransport`] (btleplug-backed) and
//! [`mock::MockTransport`] (in-process, for tests and offline demos).
//!
//! Record aggregation over notification streams lives in [`notify`]; UUID
//! canonicalisation in [`uuid`].

pub mod central;
pub mod mock;
pub mod notify;
pub mod uuid;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::error::TransportError;

/// One subscribe request: a service and the characteristics wanted from it.
///
/// An empty characteristic list means "every notifying characteristic of
/// the service".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeOptions {
    pub service_uuid: String,
    pub characteristic_uuids: Vec<String>,
}

/// Delivery pattern for notification records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamMode {
    /// One record per inbound notification, unthrottled.
    EveryUpdate,
    /// Accumulate per characteristic; emit at most once per rate interval.
    Batched,
    /// Emit the latest value of every subscribed characteristic per tick.
    AggregatedLatest,
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "every-update" | "everyupdate" | "live" => Ok(StreamMode::EveryUpdate),
            "batched" | "batch" => Ok(StreamMode::Batched),
            "aggregated-latest" | "aggregated" | "latest" => Ok(StreamMode::AggregatedLatest),
            other => Err(format!(
                "unknown stream mode '{other}' (expected every-update, batched, or aggregated-latest)"
            )),
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::EveryUpdate => write!(f, "every-update"),
            StreamMode::Batched => write!(f, "batched"),
            StreamMode::AggregatedLatest => write!(f, "aggregated-latest"),
        }
    }
}

/// Advisory flags on an emitted [`Record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordFlags {
    /// Queue overflow discarded one or more records before this one.
    pub dropped: bool,
    /// At least one subscribed characteristic had no update during the
    /// aggregation window; its entry carries the last-known value.
    pub missing: bool,
}

impl RecordFlags {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.dropped && !self.missing
    }
}

/// Unit of output from the notification engine.
///
/// Exactly one of `values` / `batch_values` is populated, depending on the
/// [`StreamMode`]:
///
/// - `EveryUpdate`: `values` with a single entry
/// - `Batched`: `batch_values` with per-characteristic arrival-ordered lists
/// - `AggregatedLatest`: `values` with one entry per subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub values: Option<BTreeMap<String, Vec<u8>>>,
    pub batch_values: Option<BTreeMap<String, Vec<Vec<u8>>>>,
    pub flags: RecordFlags,
}

impl Record {
    /// Record carrying a single characteristic value (EveryUpdate shape).
    #[must_use]
    pub fn single(uuid: String, value: Vec<u8>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(uuid, value);
        Self {
            timestamp: Utc::now(),
            values: Some(values),
            batch_values: None,
            flags: RecordFlags::default(),
        }
    }
}

/// Characteristic property flags, as discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A discovered characteristic, UUID in normal form.
#[derive(Debug, Clone, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: String,
    pub properties: CharProps,
}

/// A discovered service, UUID in normal form.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// The peripheral's discovered GATT database.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Profile {
    pub services: Vec<ServiceInfo>,
}

impl Profile {
    /// Look up a characteristic by any accepted UUID form.
    #[must_use]
    pub fn find_characteristic(&self, any_form: &str) -> Option<&CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| uuid::matches(&c.uuid, any_form))
    }

    /// Every characteristic that can notify or indicate.
    #[must_use]
    pub fn notifying_characteristics(&self) -> Vec<&CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| c.properties.notify || c.properties.indicate)
            .collect()
    }
}

/// A peripheral seen during scanning.
#[derive(Debug, Clone, Serialize)]
pub struct ScanEntry {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Sink for raw per-characteristic notifications: `(normalised uuid, value)`.
pub type NotificationSink = Arc<dyn Fn(&str, Vec<u8>) + Send + Sync>;

/// Capability to dial peripherals. The bridge owns exactly one.
pub trait GattTransport: Send + Sync {
    /// Connect to the peripheral at `address` (adapter address or
    /// advertised name, implementation-defined) within `timeout`.
    ///
    /// # Errors
    ///
    /// `TransportError::Timeout` when the deadline passes,
    /// `TransportError::NotFound` when no such peripheral is visible.
    fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn GattConnection>, TransportError>;
}

/// An established peripheral connection.
///
/// All methods are callable from any thread; implementations serialise
/// access to the underlying stack internally.
pub trait GattConnection: Send + Sync {
    /// Discover the GATT database.
    fn discover(&self, timeout: Duration) -> Result<Profile, TransportError>;

    /// Enable notifications on `characteristic_uuids` (normal form) and
    /// deliver them to `sink` until [`GattConnection::unsubscribe_all`].
    fn subscribe(
        &self,
        characteristic_uuids: &[String],
        sink: NotificationSink,
    ) -> Result<(), TransportError>;

    /// Disable every active notification subscription.
    fn unsubscribe_all(&self) -> Result<(), TransportError>;

    /// Read a characteristic value.
    fn read_characteristic(&self, uuid: &str, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Write to a characteristic.
    fn write(
        &self,
        uuid: &str,
        bytes: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Token cancelled when the peripheral disconnects.
    fn disconnect_signal(&self) -> CancelToken;

    /// Tear down the connection. Idempotent.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_mode_parsing() {
        assert_eq!(
            "every-update".parse::<StreamMode>().unwrap(),
            StreamMode::EveryUpdate
        );
        assert_eq!("batched".parse::<StreamMode>().unwrap(), StreamMode::Batched);
        assert_eq!(
            "aggregated_latest".parse::<StreamMode>().unwrap(),
            StreamMode::AggregatedLatest
        );
        assert!("firehose".parse::<StreamMode>().is_err());
    }

    #[test]
    fn test_single_record_shape() {
        let record = Record::single("2a37".into(), vec![0x01]);
        assert_eq!(record.values.as_ref().unwrap().len(), 1);
        assert!(record.batch_values.is_none());
        assert!(record.flags.is_empty());
    }

    #[test]
    fn test_profile_lookup_accepts_any_form() {
        let profile = Profile {
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
        };
        assert!(profile
            .find_characteristic("00002A37-0000-1000-8000-00805F9B34FB")
            .is_some());
        assert_eq!(profile.notifying_characteristics().len(), 1);
    }
}
