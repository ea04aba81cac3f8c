use serde::Deserialize;
use tracing::debug;

use crate::config::FamilyConfig;
use crate::device::DeviceConfig;
use crate::device::Quirk;
use crate::error::BridgeError;
use crate::mqtt::topic_matches;
use crate::mqtt::MqttMessage;

/// Discovery announcement payload.
///
/// Keys may appear in full or abbreviated form. Only the fields the bridge
/// acts on are modelled; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryMessage {
    pub name: Option<String>,

    #[serde(alias = "stat_t")]
    pub state_topic: Option<String>,

    #[serde(alias = "cmd_t")]
    pub command_topic: Option<String>,

    #[serde(alias = "spd_cmd_t")]
    pub speed_command_topic: Option<String>,

    #[serde(alias = "spd_stat_t")]
    pub speed_state_topic: Option<String>,

    #[serde(alias = "dev")]
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInfo {
    #[serde(alias = "mf")]
    pub manufacturer: Option<String>,

    #[serde(alias = "mdl")]
    pub model: Option<String>,
}

/// Parse a discovery topic to extract component type, node_id, and object_id
///
/// Topic format: {prefix}/{component}/{node_id}/{object_id}/config
/// Example: homeassistant/light/treatlifeds03_1a2b3c/light/config
pub fn parse_discovery_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str, &'a str)> {
    let without_prefix = topic.strip_prefix(prefix)?.strip_prefix('/')?;

    let parts: Vec<&str> = without_prefix.split('/').collect();
    match parts.as_slice() {
        [component, node_id, object_id, "config"] => Some((*component, *node_id, *object_id)),
        _ => None,
    }
}

/// Classifies discovery announcements into device configurations
#[derive(Debug, Clone)]
pub struct DiscoveryDispatcher {
    prefix: String,
    families: Vec<FamilyConfig>,
}

impl DiscoveryDispatcher {
    pub fn new(prefix: impl Into<String>, families: Vec<FamilyConfig>) -> Self {
        Self {
            prefix: prefix.into(),
            families,
        }
    }

    /// Topic filters covering every component a known family uses
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for family in &self.families {
            let filter = format!("{}/{}/+/+/config", self.prefix, family.quirk.component());
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        }
        filters
    }

    pub fn is_discovery(&self, topic: &str) -> bool {
        self.subscriptions()
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }

    fn family(&self, component: &str, node_id: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|family| {
            family.quirk.component() == component && node_id.starts_with(&family.node_prefix)
        })
    }

    /// Turn an announcement into a device configuration.
    ///
    /// `Ok(None)` means the announcement is not for a device this bridge
    /// handles (or is a removal, which is not modelled).
    pub fn classify(&self, msg: &MqttMessage) -> Result<Option<DeviceConfig>, BridgeError> {
        let Some((component, node_id, object_id)) = parse_discovery_topic(&msg.topic, &self.prefix)
        else {
            debug!("Ignoring malformed discovery topic {}", msg.topic);
            return Ok(None);
        };

        let Some(family) = self.family(component, node_id) else {
            debug!(
                "Ignoring discovery for unsupported device: component={}, node_id={}",
                component, node_id
            );
            return Ok(None);
        };

        if msg.payload.is_empty() {
            debug!("Ignoring removal of {}/{}", node_id, object_id);
            return Ok(None);
        }

        let discovery: DiscoveryMessage = serde_json::from_slice(&msg.payload)
            .map_err(|e| BridgeError::parse(&msg.topic, e))?;

        let required = |field: Option<String>, key: &str| {
            field
                .filter(|value| !value.is_empty())
                .ok_or_else(|| BridgeError::parse(&msg.topic, format!("missing {}", key)))
        };

        let name = required(discovery.name, "name")?;
        let state_topic = required(discovery.state_topic, "state_topic")?;
        let command_topic = required(discovery.command_topic, "command_topic")?;

        let (speed_state_topic, speed_command_topic) = match family.quirk {
            Quirk::SpeedBuckets => (
                Some(required(discovery.speed_state_topic, "speed_state_topic")?),
                Some(required(discovery.speed_command_topic, "speed_command_topic")?),
            ),
            Quirk::CombinedPayload | Quirk::SplitTopics => (None, None),
        };

        let device = discovery.device.unwrap_or_default();

        debug!(
            "Discovery: component={}, node_id={}, object_id={}, name={}",
            component, node_id, object_id, name
        );

        Ok(Some(DeviceConfig {
            name,
            quirk: family.quirk,
            state_topic,
            command_topic,
            speed_state_topic,
            speed_command_topic,
            manufacturer: device
                .manufacturer
                .unwrap_or_else(|| family.manufacturer.clone()),
            model: device.model.unwrap_or_else(|| family.model.clone()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_families;

    fn dispatcher() -> DiscoveryDispatcher {
        DiscoveryDispatcher::new("homeassistant", default_families())
    }

    #[test]
    fn test_parse_discovery_topic() {
        let topic = "homeassistant/light/gosundsw2/hallway/config";
        assert_eq!(
            parse_discovery_topic(topic, "homeassistant"),
            Some(("light", "gosundsw2", "hallway"))
        );
    }

    #[test]
    fn test_parse_discovery_topic_invalid() {
        assert_eq!(
            parse_discovery_topic("homeassistant/light/gosundsw2", "homeassistant"),
            None
        );
        assert_eq!(
            parse_discovery_topic("homeassistant/light/gosundsw2/hallway/state", "homeassistant"),
            None
        );
        assert_eq!(
            parse_discovery_topic("other/light/gosundsw2/hallway/config", "homeassistant"),
            None
        );
    }

    #[test]
    fn test_subscriptions() {
        assert_eq!(
            dispatcher().subscriptions(),
            vec![
                "homeassistant/light/+/+/config".to_string(),
                "homeassistant/fan/+/+/config".to_string(),
            ]
        );
        assert!(dispatcher().is_discovery("homeassistant/fan/treatlifeds03/attic/config"));
        assert!(!dispatcher().is_discovery("treatlifeds03/fan/attic/state"));
    }

    #[test]
    fn test_classify_split_topic_dimmer() {
        let msg = MqttMessage::new(
            "homeassistant/light/gosundsw2/hallway/config",
            r#"{"name":"hallway-light","state_topic":"stat/hallway","command_topic":"cmnd/hallway"}"#,
        );
        let config = dispatcher().classify(&msg).unwrap().unwrap();

        assert_eq!(config.name, "hallway-light");
        assert_eq!(config.quirk, Quirk::SplitTopics);
        assert_eq!(config.state_topic, "stat/hallway");
        assert_eq!(config.command_topic, "cmnd/hallway");
        assert_eq!(config.manufacturer, "Gosund");
        assert_eq!(config.speed_command_topic, None);
    }

    #[test]
    fn test_classify_abbreviated_keys_and_device_block() {
        let msg = MqttMessage::new(
            "homeassistant/light/treatlifeds03_4f2a/light/config",
            r#"{"name":"den","stat_t":"treatlifeds03/light/den/state","cmd_t":"treatlifeds03/light/den/command","dev":{"mf":"Acme","mdl":"D1"}}"#,
        );
        let config = dispatcher().classify(&msg).unwrap().unwrap();

        assert_eq!(config.quirk, Quirk::CombinedPayload);
        assert_eq!(config.state_topic, "treatlifeds03/light/den/state");
        assert_eq!(config.manufacturer, "Acme");
        assert_eq!(config.model, "D1");
    }

    #[test]
    fn test_classify_fan_requires_speed_topics() {
        let complete = MqttMessage::new(
            "homeassistant/fan/treatlifeds03/attic-fan/config",
            r#"{"name":"attic-fan","state_topic":"treatlifeds03/fan/attic-fan/state","command_topic":"treatlifeds03/fan/attic-fan/command","speed_state_topic":"treatlifeds03/fan/attic-fan/speed/state","speed_command_topic":"treatlifeds03/fan/attic-fan/speed/command"}"#,
        );
        let config = dispatcher().classify(&complete).unwrap().unwrap();
        assert_eq!(config.quirk, Quirk::SpeedBuckets);
        assert_eq!(
            config.speed_command_topic.as_deref(),
            Some("treatlifeds03/fan/attic-fan/speed/command")
        );

        let missing = MqttMessage::new(
            "homeassistant/fan/treatlifeds03/attic-fan/config",
            r#"{"name":"attic-fan","state_topic":"a","command_topic":"b"}"#,
        );
        let err = dispatcher().classify(&missing).unwrap_err();
        assert!(err.to_string().contains("missing speed_state_topic"));
    }

    #[test]
    fn test_classify_ignores_unknown_and_removals() {
        let unknown = MqttMessage::new(
            "homeassistant/light/0x00124b001234abcd/light/config",
            r#"{"name":"x","state_topic":"a","command_topic":"b"}"#,
        );
        assert!(dispatcher().classify(&unknown).unwrap().is_none());

        let wrong_component = MqttMessage::new(
            "homeassistant/switch/gosundsw2/hallway/config",
            r#"{"name":"x","state_topic":"a","command_topic":"b"}"#,
        );
        assert!(dispatcher().classify(&wrong_component).unwrap().is_none());

        let removal = MqttMessage::new("homeassistant/light/gosundsw2/hallway/config", "");
        assert!(dispatcher().classify(&removal).unwrap().is_none());
    }

    #[test]
    fn test_classify_rejects_bad_payloads() {
        let garbage = MqttMessage::new("homeassistant/light/gosundsw2/hallway/config", "{not json");
        assert!(matches!(
            dispatcher().classify(&garbage),
            Err(BridgeError::Parse { .. })
        ));

        let nameless = MqttMessage::new(
            "homeassistant/light/gosundsw2/hallway/config",
            r#"{"state_topic":"a","command_topic":"b"}"#,
        );
        assert!(matches!(
            dispatcher().classify(&nameless),
            Err(BridgeError::Parse { .. })
        ));
    }
}
