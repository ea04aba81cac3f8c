//! Hub-facing side of the bridge.
//!
//! An [`Accessory`] is the characteristic model of one device. Transports
//! serve it to hubs and report hub writes back through
//! [`Accessory::remote_write`]; the bridge consumes those writes from the
//! channel returned by [`Accessory::take_write_events`].

mod http;
mod setup;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

pub use http::HttpAccessoryService;
pub use setup::render_pairing_aid;
pub use setup::setup_id;
pub use setup::setup_uri;

/// Accessory category, as advertised to hubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccessoryKind {
    Lightbulb,
    Fan,
}

impl AccessoryKind {
    /// Numeric category used in setup payloads
    pub fn category(self) -> u8 {
        match self {
            Self::Fan => 3,
            Self::Lightbulb => 5,
        }
    }

    /// Characteristics exposed by this kind, with their initial values
    fn default_characteristics(self) -> BTreeMap<Characteristic, CharacteristicValue> {
        let level = match self {
            Self::Lightbulb => Characteristic::Brightness,
            Self::Fan => Characteristic::RotationSpeed,
        };
        BTreeMap::from([
            (Characteristic::On, CharacteristicValue::Bool(false)),
            (level, CharacteristicValue::Int(100)),
        ])
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Characteristic {
    On,
    Brightness,
    RotationSpeed,
}

impl Characteristic {
    /// Instance id within the accessory
    pub fn iid(self) -> u64 {
        match self {
            Self::On => 10,
            Self::Brightness => 11,
            Self::RotationSpeed => 12,
        }
    }

    pub fn from_iid(iid: u64) -> Option<Self> {
        <Self as strum::IntoEnumIterator>::iter().find(|c| c.iid() == iid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharacteristicValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl CharacteristicValue {
    /// Hubs sometimes encode booleans as 0/1
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            Self::Int(0) => Some(false),
            Self::Int(1) => Some(true),
            _ => None,
        }
    }

    /// Integral value, rounding floats to nearest
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Bool(_) => None,
            Self::Int(i) => Some(i),
            Self::Float(f) if f.is_finite() => Some(f.round() as i64),
            Self::Float(_) => None,
        }
    }
}

/// A hub-initiated characteristic change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacteristicWrite {
    pub characteristic: Characteristic,
    pub value: CharacteristicValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessoryInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AccessoryError {
    #[error("accessory has no characteristic with iid {0}")]
    UnknownCharacteristic(u64),

    #[error("accessory does not expose {0}")]
    Unsupported(Characteristic),

    #[error("invalid value for {characteristic}: {value:?}")]
    InvalidValue {
        characteristic: Characteristic,
        value: CharacteristicValue,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transport rejected accessory: {0}")]
    Rejected(String),
}

/// Characteristic model of one device
#[derive(Debug)]
pub struct Accessory {
    info: AccessoryInfo,
    kind: AccessoryKind,
    values: RwLock<BTreeMap<Characteristic, CharacteristicValue>>,
    writes_tx: mpsc::UnboundedSender<CharacteristicWrite>,
    writes_rx: Mutex<Option<mpsc::UnboundedReceiver<CharacteristicWrite>>>,
}

impl Accessory {
    pub fn new(kind: AccessoryKind, info: AccessoryInfo) -> Self {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        Self {
            info,
            kind,
            values: RwLock::new(kind.default_characteristics()),
            writes_tx,
            writes_rx: Mutex::new(Some(writes_rx)),
        }
    }

    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    pub fn kind(&self) -> AccessoryKind {
        self.kind
    }

    /// Update a characteristic from the device side. Unknown
    /// characteristics are ignored.
    pub fn set_characteristic(&self, characteristic: Characteristic, value: CharacteristicValue) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = values.get_mut(&characteristic) {
            *slot = value;
        }
    }

    pub fn characteristic(&self, characteristic: Characteristic) -> Option<CharacteristicValue> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&characteristic)
            .copied()
    }

    pub fn characteristics(&self) -> Vec<(Characteristic, CharacteristicValue)> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(c, v)| (*c, *v))
            .collect()
    }

    /// Accept a write from a hub.
    ///
    /// The value is type-checked and forwarded to the write channel; the
    /// stored value is left to the bridge, which reconciles it with the
    /// device state.
    pub fn remote_write(
        &self,
        characteristic: Characteristic,
        value: CharacteristicValue,
    ) -> Result<(), AccessoryError> {
        if self.characteristic(characteristic).is_none() {
            return Err(AccessoryError::Unsupported(characteristic));
        }

        let valid = match characteristic {
            Characteristic::On => value.as_bool().is_some(),
            Characteristic::Brightness | Characteristic::RotationSpeed => value.as_int().is_some(),
        };
        if !valid {
            return Err(AccessoryError::InvalidValue {
                characteristic,
                value,
            });
        }

        // Only fails once the bridge has stopped listening
        let _ = self.writes_tx.send(CharacteristicWrite {
            characteristic,
            value,
        });
        Ok(())
    }

    /// Take the stream of hub writes. Returns `None` after the first call.
    pub fn take_write_events(&self) -> Option<mpsc::UnboundedReceiver<CharacteristicWrite>> {
        self.writes_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn identify(&self) {
        info!("Identifying accessory {}", self.info.name);
    }
}

/// Per-accessory transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub pin: String,

    /// Per-device storage directory
    pub storage_path: Option<PathBuf>,
}

/// Starts transports that serve accessories to hubs
#[async_trait]
pub trait AccessoryService: Send + Sync {
    async fn start(
        &self,
        accessory: std::sync::Arc<Accessory>,
        config: &TransportConfig,
    ) -> Result<Box<dyn AccessoryTransport>, AccessoryError>;
}

/// A running transport for one accessory
#[async_trait]
pub trait AccessoryTransport: Send + Sync {
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop serving and wait until the transport has shut down
    async fn stop(self: Box<Self>) -> Result<(), AccessoryError>;
}

#[cfg(test)]
pub use mock::MockAccessoryService;


#[cfg(test)]
mod tests {
    use super::*;

    fn lightbulb() -> Accessory {
        Accessory::new(
            AccessoryKind::Lightbulb,
            AccessoryInfo {
                name: "hallway-light".to_string(),
                manufacturer: "Treatlife".to_string(),
                model: "DS03".to_string(),
                serial_number: "hallway-light".to_string(),
            },
        )
    }

    #[test]
    fn test_default_characteristics() {
        let accessory = lightbulb();
        assert_eq!(
            accessory.characteristic(Characteristic::On),
            Some(CharacteristicValue::Bool(false))
        );
        assert_eq!(
            accessory.characteristic(Characteristic::Brightness),
            Some(CharacteristicValue::Int(100))
        );
        assert_eq!(accessory.characteristic(Characteristic::RotationSpeed), None);
    }

    #[test]
    fn test_set_characteristic_ignores_unknown() {
        let accessory = lightbulb();
        accessory.set_characteristic(Characteristic::RotationSpeed, CharacteristicValue::Int(5));
        assert_eq!(accessory.characteristic(Characteristic::RotationSpeed), None);
    }

    #[tokio::test]
    async fn test_remote_write_forwards_event() {
        let accessory = lightbulb();
        let mut writes = accessory.take_write_events().unwrap();
        assert!(accessory.take_write_events().is_none());

        accessory
            .remote_write(Characteristic::Brightness, CharacteristicValue::Float(42.4))
            .unwrap();
        let write = writes.recv().await.unwrap();
        assert_eq!(write.characteristic, Characteristic::Brightness);
        assert_eq!(write.value.as_int(), Some(42));
        // The stored value is left for the bridge to reconcile
        assert_eq!(
            accessory.characteristic(Characteristic::Brightness),
            Some(CharacteristicValue::Int(100))
        );
    }

    #[test]
    fn test_remote_write_rejects_bad_values() {
        let accessory = lightbulb();
        assert!(matches!(
            accessory.remote_write(Characteristic::On, CharacteristicValue::Int(7)),
            Err(AccessoryError::InvalidValue { .. })
        ));
        assert!(matches!(
            accessory.remote_write(Characteristic::RotationSpeed, CharacteristicValue::Int(7)),
            Err(AccessoryError::Unsupported(Characteristic::RotationSpeed))
        ));
    }

    #[test]
    fn test_iid_lookup() {
        assert_eq!(Characteristic::from_iid(10), Some(Characteristic::On));
        assert_eq!(Characteristic::from_iid(12), Some(Characteristic::RotationSpeed));
        assert_eq!(Characteristic::from_iid(99), None);
    }
}
