//! Device state in both directions.
//!
//! Inbound: state topics are parsed and applied to the owning [`Device`],
//! registering it first when the state arrives before its discovery
//! announcement. Outbound: hub writes become device commands which are
//! published on the broker.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use tracing::info;

use crate::accessory::Characteristic;
use crate::accessory::CharacteristicWrite;
use crate::config::FamilyConfig;
use crate::convert;
use crate::convert::PowerState;
use crate::device::Device;
use crate::device::DeviceClass;
use crate::device::DeviceConfig;
use crate::device::DimmerPayload;
use crate::device::Quirk;
use crate::device::StateUpdate;
use crate::error::BridgeError;
use crate::mqtt::topic_matches;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttMessage;
use crate::registry::DeviceRegistry;
use crate::registry::Registration;
use crate::registry::TopicRole;

/// Dimmer state: `{"state": "ON"|"OFF", "brightness": 0-255}`
pub fn parse_dimmer_state(topic: &str, payload: &[u8]) -> Result<StateUpdate, BridgeError> {
    let state: DimmerPayload =
        serde_json::from_slice(payload).map_err(|e| BridgeError::parse(topic, e))?;

    Ok(StateUpdate {
        power: Some(state.state.is_on()),
        level: state.brightness.map(convert::to_percent_brightness),
    })
}

/// Power-only state object, as some fan firmware reports it
#[derive(Deserialize)]
struct PowerPayload {
    state: PowerState,
}

/// Fan power state: bare `ON`/`OFF`, or the JSON object dimmers use
pub fn parse_fan_power(topic: &str, payload: &[u8]) -> Result<StateUpdate, BridgeError> {
    let text = std::str::from_utf8(payload).map_err(|e| BridgeError::parse(topic, e))?;

    let power = match text.trim().parse::<PowerState>() {
        Ok(power) => power,
        Err(_) => {
            serde_json::from_str::<PowerPayload>(text)
                .map_err(|_| BridgeError::parse(topic, format!("unrecognised power state {:?}", text)))?
                .state
        }
    };

    Ok(StateUpdate {
        power: Some(power.is_on()),
        level: None,
    })
}

/// Fan speed state: a bare speed label. Unknown labels read as speed 0.
pub fn parse_fan_speed(topic: &str, payload: &[u8]) -> Result<StateUpdate, BridgeError> {
    let label = std::str::from_utf8(payload).map_err(|e| BridgeError::parse(topic, e))?;

    Ok(StateUpdate {
        power: None,
        level: Some(convert::speed_label_to_percent(label)),
    })
}

/// Keeps devices and the broker in step
pub struct StateSynchronizer<C> {
    client: Arc<C>,
    registry: Arc<DeviceRegistry>,
    families: Vec<FamilyConfig>,
}

impl<C: MqttClient> StateSynchronizer<C> {
    pub fn new(client: Arc<C>, registry: Arc<DeviceRegistry>, families: Vec<FamilyConfig>) -> Self {
        Self {
            client,
            registry,
            families,
        }
    }

    /// Wildcard state filters for families whose firmware topics are known
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for family in &self.families {
            if let Some(prefix) = &family.state_prefix {
                let filter = format!("{}/{}/+/state", prefix, family.quirk.component());
                if !filters.contains(&filter) {
                    filters.push(filter);
                }
            }
        }
        filters
    }

    fn covered(&self, topic: &str) -> bool {
        self.subscriptions()
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }

    /// Subscribe to a device's state topics. Topics already covered by a
    /// family wildcard are skipped.
    pub async fn track(&self, device: &Device) -> Result<(), BridgeError> {
        let topics = std::iter::once(device.state_topic()).chain(device.speed_state_topic());

        for topic in topics {
            if self.covered(topic) {
                debug!("{} is covered by a family subscription", topic);
                continue;
            }
            self.client
                .subscribe(topic)
                .await
                .map_err(|source| BridgeError::Subscribe {
                    topic: topic.to_string(),
                    source,
                })?;
            debug!("Subscribed to {} for {}", topic, device.name());
        }
        Ok(())
    }

    /// Configuration for a device seen only through its firmware state topic,
    /// `<state_prefix>/<component>/<object_id>/state`.
    pub fn infer_config(&self, topic: &str) -> Option<DeviceConfig> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [node, component, object_id, "state"] = parts.as_slice() else {
            return None;
        };

        let family = self.families.iter().find(|family| {
            family.state_prefix.as_deref() == Some(*node) && family.quirk.component() == *component
        })?;

        let base = format!("{}/{}/{}", node, component, object_id);
        let (speed_state_topic, speed_command_topic) = match family.quirk {
            Quirk::SpeedBuckets => (
                Some(format!("{}/speed/state", base)),
                Some(format!("{}/speed/command", base)),
            ),
            Quirk::CombinedPayload | Quirk::SplitTopics => (None, None),
        };

        Some(DeviceConfig {
            name: object_id.to_string(),
            quirk: family.quirk,
            state_topic: topic.to_string(),
            command_topic: format!("{}/command", base),
            speed_state_topic,
            speed_command_topic,
            manufacturer: family.manufacturer.clone(),
            model: family.model.clone(),
        })
    }

    /// Apply a state message.
    ///
    /// Returns the registration when the message introduced a new device,
    /// so the caller can bring up its accessory.
    pub async fn handle_state(&self, msg: &MqttMessage) -> Result<Option<Registration>, BridgeError> {
        let (device, role, registration) = match self.registry.route(&msg.topic).await {
            Some((device, role)) => (device, role, None),
            None => {
                let Some(config) = self.infer_config(&msg.topic) else {
                    debug!("No device for state topic {}", msg.topic);
                    return Ok(None);
                };
                // Parse before registering so garbage cannot create devices
                parse_state(config.quirk.class(), TopicRole::State, &msg.topic, &msg.payload)?;

                let registration = self.registry.register(config).await;
                if registration.is_created() {
                    info!(
                        "Registered {} from state before discovery",
                        registration.device().name()
                    );
                }
                let device = registration.device().clone();
                // An existing device may own this topic under another role
                let role = self
                    .registry
                    .route(&msg.topic)
                    .await
                    .map_or(TopicRole::State, |(_, role)| role);
                (device, role, Some(registration))
            }
        };

        let update = parse_state(device.class(), role, &msg.topic, &msg.payload)?;
        device.apply_inbound_state(update);

        Ok(registration.filter(Registration::is_created))
    }

    /// Translate a hub write into device commands and publish them.
    ///
    /// Local state is updated before publishing and is not rolled back when
    /// a publish fails. Out-of-range values restore the accessory to the
    /// stored state.
    pub async fn handle_write(&self, device: &Device, write: CharacteristicWrite) -> Result<(), BridgeError> {
        let invalid = || {
            BridgeError::parse(
                &device.command_topics().command,
                format!("invalid value {:?} for {}", write.value, write.characteristic),
            )
        };

        let result = match write.characteristic {
            Characteristic::On => device.request_power(write.value.as_bool().ok_or_else(invalid)?),
            Characteristic::Brightness => {
                device.request_brightness(write.value.as_int().ok_or_else(invalid)?)
            }
            Characteristic::RotationSpeed => {
                device.request_speed(write.value.as_int().ok_or_else(invalid)?)
            }
        };

        let commands = match result {
            Ok(commands) => commands,
            Err(e) => {
                device.resync_accessory();
                return Err(e);
            }
        };

        for command in commands {
            debug!(
                "Publishing {} to {}",
                String::from_utf8_lossy(&command.payload),
                command.topic
            );
            self.client
                .publish(&command.topic, &command.payload, false)
                .await
                .map_err(|source| BridgeError::PublishFailed {
                    topic: command.topic.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

fn parse_state(
    class: DeviceClass,
    role: TopicRole,
    topic: &str,
    payload: &[u8],
) -> Result<StateUpdate, BridgeError> {
    match (class, role) {
        (DeviceClass::Dimmer, _) => parse_dimmer_state(topic, payload),
        (DeviceClass::Fan, TopicRole::State) => parse_fan_power(topic, payload),
        (DeviceClass::Fan, TopicRole::SpeedState) => parse_fan_speed(topic, payload),
    }
}
