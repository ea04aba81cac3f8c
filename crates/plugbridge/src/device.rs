//! Device proxies: the bridge's view of one physical device.
//!
//! A [`Device`] keeps the last known or requested power and level, computes
//! the command payloads its firmware expects, and mirrors its state into
//! the attached [`Accessory`] once one exists.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::accessory::Accessory;
use crate::accessory::AccessoryInfo;
use crate::accessory::AccessoryKind;
use crate::accessory::Characteristic;
use crate::accessory::CharacteristicValue;
use crate::convert;
use crate::convert::PowerState;
use crate::error::BridgeError;

/// Level assumed before the device reports one
const INITIAL_LEVEL: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeviceClass {
    Dimmer,
    Fan,
}

/// Firmware-specific payload convention, fixed when a device is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Quirk {
    /// Dimmer taking `{state, brightness}` JSON on one command topic
    CombinedPayload,
    /// Dimmer taking power as JSON on the command topic and brightness as a
    /// bare percentage on `<command_topic>/brightness_pct`
    SplitTopics,
    /// Fan taking bare `ON`/`OFF` and bare speed labels on separate topics
    SpeedBuckets,
}

impl Quirk {
    pub fn class(self) -> DeviceClass {
        match self {
            Self::CombinedPayload | Self::SplitTopics => DeviceClass::Dimmer,
            Self::SpeedBuckets => DeviceClass::Fan,
        }
    }

    /// Discovery component carrying devices with this quirk
    pub fn component(self) -> &'static str {
        match self.class() {
            DeviceClass::Dimmer => "light",
            DeviceClass::Fan => "fan",
        }
    }
}

/// Everything needed to build a [`Device`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub quirk: Quirk,
    pub state_topic: String,
    pub command_topic: String,

    /// Fans only
    pub speed_state_topic: Option<String>,
    pub speed_command_topic: Option<String>,

    pub manufacturer: String,
    pub model: String,
}

/// Topics outbound commands are published on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopics {
    pub command: String,
    pub brightness: Option<String>,
    pub speed: Option<String>,
}

/// A payload to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Command {
    fn new(topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
        }
    }
}

/// JSON state and command payload of dimmer firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimmerPayload {
    pub state: PowerState,

    /// Raw brightness (0-255)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
}

/// An inbound state change in accessory-domain units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub power: Option<bool>,

    /// Brightness or speed percentage
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub power: bool,

    /// Brightness (dimmers) or speed (fans) percentage
    pub level: u8,
}

/// Proxy for one physical device
#[derive(Debug)]
pub struct Device {
    name: String,
    quirk: Quirk,
    state_topic: String,
    speed_state_topic: Option<String>,
    topics: CommandTopics,
    info: AccessoryInfo,
    state: Mutex<DeviceState>,
    accessory: OnceLock<Arc<Accessory>>,
}

impl Device {
    /// Build a proxy. Pure; no I/O happens here.
    pub fn new(config: DeviceConfig) -> Self {
        let topics = CommandTopics {
            brightness: (config.quirk == Quirk::SplitTopics)
                .then(|| format!("{}/brightness_pct", config.command_topic)),
            speed: config.speed_command_topic,
            command: config.command_topic,
        };

        Self {
            info: AccessoryInfo {
                name: config.name.clone(),
                manufacturer: config.manufacturer,
                model: config.model,
                serial_number: config.name.clone(),
            },
            name: config.name,
            quirk: config.quirk,
            state_topic: config.state_topic,
            speed_state_topic: config.speed_state_topic,
            topics,
            state: Mutex::new(DeviceState {
                power: false,
                level: INITIAL_LEVEL,
            }),
            accessory: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quirk(&self) -> Quirk {
        self.quirk
    }

    pub fn class(&self) -> DeviceClass {
        self.quirk.class()
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn speed_state_topic(&self) -> Option<&str> {
        self.speed_state_topic.as_deref()
    }

    pub fn command_topics(&self) -> &CommandTopics {
        &self.topics
    }

    pub fn accessory_info(&self) -> &AccessoryInfo {
        &self.info
    }

    pub fn accessory_kind(&self) -> AccessoryKind {
        match self.class() {
            DeviceClass::Dimmer => AccessoryKind::Lightbulb,
            DeviceClass::Fan => AccessoryKind::Fan,
        }
    }

    pub fn accessory(&self) -> Option<&Arc<Accessory>> {
        self.accessory.get()
    }

    pub fn state(&self) -> DeviceState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn level_characteristic(&self) -> Characteristic {
        match self.class() {
            DeviceClass::Dimmer => Characteristic::Brightness,
            DeviceClass::Fan => Characteristic::RotationSpeed,
        }
    }

    /// Push state into the accessory. Callers hold the state lock so that
    /// pushes are ordered the same way as state changes.
    fn push_characteristics(&self, state: &DeviceState) {
        if let Some(accessory) = self.accessory.get() {
            accessory.set_characteristic(Characteristic::On, CharacteristicValue::Bool(state.power));
            accessory.set_characteristic(
                self.level_characteristic(),
                CharacteristicValue::Int(i64::from(state.level)),
            );
        }
    }

    /// Attach the accessory and seed it with the current state.
    ///
    /// Returns false if an accessory was already attached.
    pub fn attach_accessory(&self, accessory: Arc<Accessory>) -> bool {
        if self.accessory.set(accessory).is_err() {
            return false;
        }
        let state = self.lock_state();
        self.push_characteristics(&state);
        true
    }

    /// Apply state reported by the device. Re-applying the same values is
    /// harmless.
    pub fn apply_inbound_state(&self, update: StateUpdate) -> DeviceState {
        let mut state = self.lock_state();
        if let Some(power) = update.power {
            state.power = power;
        }
        if let Some(level) = update.level {
            state.level = level.min(convert::PERCENT_MAX);
        }
        self.push_characteristics(&state);
        debug!(
            "{} state is now power={} level={}",
            self.name, state.power, state.level
        );
        *state
    }

    /// Restore the accessory to the stored state after a rejected write
    pub fn resync_accessory(&self) {
        let state = self.lock_state();
        self.push_characteristics(&state);
    }

    /// Hub asked for a power change. Updates local state and returns the
    /// commands to publish.
    pub fn request_power(&self, power: bool) -> Result<Vec<Command>, BridgeError> {
        let mut state = self.lock_state();
        state.power = power;
        self.push_characteristics(&state);

        let commands = match self.quirk {
            Quirk::CombinedPayload | Quirk::SplitTopics => {
                vec![self.dimmer_command(&state)?]
            }
            Quirk::SpeedBuckets => {
                vec![Command::new(
                    &self.topics.command,
                    PowerState::from(power).as_ref(),
                )]
            }
        };
        Ok(commands)
    }

    /// Hub asked for a brightness change (dimmers only)
    pub fn request_brightness(&self, pct: i64) -> Result<Vec<Command>, BridgeError> {
        let level = convert::check_percent(pct)?;

        let mut state = self.lock_state();
        state.level = level;
        self.push_characteristics(&state);

        let commands = match self.quirk {
            Quirk::CombinedPayload => vec![self.dimmer_command(&state)?],
            Quirk::SplitTopics => {
                let topic = self.topics.brightness.as_deref().unwrap_or(&self.topics.command);
                vec![Command::new(topic, level.to_string())]
            }
            Quirk::SpeedBuckets => {
                debug!("Ignoring brightness request for fan {}", self.name);
                Vec::new()
            }
        };
        Ok(commands)
    }

    /// Hub asked for a speed change (fans only)
    pub fn request_speed(&self, pct: i64) -> Result<Vec<Command>, BridgeError> {
        let bucket = convert::speed_percent_to_bucket(pct)?;
        let level = convert::check_percent(pct)?;

        let mut state = self.lock_state();
        state.level = level;
        self.push_characteristics(&state);

        match (&self.quirk, &self.topics.speed) {
            (Quirk::SpeedBuckets, Some(topic)) => Ok(vec![Command::new(topic, bucket.as_ref())]),
            _ => {
                debug!("Ignoring speed request for {}", self.name);
                Ok(Vec::new())
            }
        }
    }

    /// `{state, brightness}` command for dimmers. A power-on request at zero
    /// brightness is sent as OFF.
    fn dimmer_command(&self, state: &DeviceState) -> Result<Command, BridgeError> {
        let power = if state.power && state.level == 0 {
            info!("Keeping {} off since brightness is 0", self.name);
            PowerState::Off
        } else {
            PowerState::from(state.power)
        };
        let payload = DimmerPayload {
            state: power,
            brightness: Some(convert::to_raw_brightness(i64::from(state.level))?),
        };
        let payload = serde_json::to_vec(&payload)
            .map_err(|e| BridgeError::parse(&self.topics.command, e))?;
        Ok(Command::new(&self.topics.command, payload))
    }
}
