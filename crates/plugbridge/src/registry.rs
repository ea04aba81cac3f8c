//! Registry of live device proxies.
//!
//! Registration is a single check-and-insert under the registry lock, so
//! concurrent discovery and state messages for one device produce exactly
//! one [`Device`]. Anything slow (subscriptions, accessory transports) is
//! left to the caller, who only does it for [`Registration::Created`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::device::DeviceConfig;

/// What a state topic carries for its device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    /// Power (and for dimmers, brightness) state
    State,
    /// Fan speed label
    SpeedState,
}

/// Outcome of [`DeviceRegistry::register`]
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new proxy was inserted; the caller owns its bring-up
    Created(Arc<Device>),
    /// A proxy already existed for this name or state topic
    Existing(Arc<Device>),
}

impl Registration {
    pub fn device(&self) -> &Arc<Device> {
        match self {
            Self::Created(device) | Self::Existing(device) => device,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_name: HashMap<String, Arc<Device>>,
    by_topic: HashMap<String, (String, TopicRole)>,
}

/// Devices known to the bridge, keyed by name
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: Mutex<Entries>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the proxy for `config.name`, creating it if absent.
    ///
    /// A state topic already owned by another device also counts as
    /// present, so a device announced under two names maps to one proxy.
    pub async fn register(&self, config: DeviceConfig) -> Registration {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.by_name.get(&config.name) {
            return Registration::Existing(existing.clone());
        }
        if let Some(existing) = entries
            .by_topic
            .get(&config.state_topic)
            .and_then(|(name, _)| entries.by_name.get(name))
        {
            debug!(
                "State topic {} already belongs to {}, not registering {}",
                config.state_topic,
                existing.name(),
                config.name
            );
            return Registration::Existing(existing.clone());
        }

        let device = Arc::new(Device::new(config));
        let name = device.name().to_string();

        entries
            .by_topic
            .insert(device.state_topic().to_string(), (name.clone(), TopicRole::State));
        if let Some(topic) = device.speed_state_topic() {
            match entries.by_topic.get(topic) {
                Some((owner, _)) => warn!(
                    "Speed state topic {} already belongs to {}, not routing it to {}",
                    topic, owner, name
                ),
                None => {
                    entries
                        .by_topic
                        .insert(topic.to_string(), (name.clone(), TopicRole::SpeedState));
                }
            }
        }
        entries.by_name.insert(name, device.clone());

        info!(
            "Registered {} {} ({})",
            device.class(),
            device.name(),
            device.quirk()
        );
        Registration::Created(device)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.entries.lock().await.by_name.get(name).cloned()
    }

    /// Find the device a state topic belongs to
    pub async fn route(&self, topic: &str) -> Option<(Arc<Device>, TopicRole)> {
        let entries = self.entries.lock().await;
        let (name, role) = entries.by_topic.get(topic)?;
        entries.by_name.get(name).map(|device| (device.clone(), *role))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::dimmer_config;
    use crate::device::tests::fan_config;
    use crate::device::Quirk;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = DeviceRegistry::new();
        let first = registry
            .register(dimmer_config("hallway-light", Quirk::CombinedPayload))
            .await;
        let second = registry
            .register(dimmer_config("hallway-light", Quirk::CombinedPayload))
            .await;

        assert!(first.is_created());
        assert!(!second.is_created());
        assert!(Arc::ptr_eq(first.device(), second.device()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_creates_one_proxy() {
        let registry = Arc::new(DeviceRegistry::new());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register(dimmer_config("hallway-light", Quirk::CombinedPayload))
                        .await
                        .is_created()
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_state_topic_claimed_once() {
        let registry = DeviceRegistry::new();
        registry
            .register(dimmer_config("hallway", Quirk::SplitTopics))
            .await;

        let mut alias = dimmer_config("Hallway Light", Quirk::SplitTopics);
        alias.state_topic = "stat/hallway".to_string();
        let registration = registry.register(alias).await;

        assert!(!registration.is_created());
        assert_eq!(registration.device().name(), "hallway");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_speed_state_topic_keeps_first_owner() {
        let registry = DeviceRegistry::new();
        registry.register(fan_config("attic-fan")).await;

        let mut other = fan_config("porch-fan");
        other.speed_state_topic = Some("treatlifeds03/fan/attic-fan/speed/state".to_string());
        assert!(registry.register(other).await.is_created());

        let (device, role) = registry
            .route("treatlifeds03/fan/attic-fan/speed/state")
            .await
            .unwrap();
        assert_eq!(device.name(), "attic-fan");
        assert_eq!(role, TopicRole::SpeedState);

        // The second fan still owns its own power state topic
        let (device, _) = registry
            .route("treatlifeds03/fan/porch-fan/state")
            .await
            .unwrap();
        assert_eq!(device.name(), "porch-fan");
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_route_by_topic() {
        let registry = DeviceRegistry::new();
        registry.register(fan_config("attic-fan")).await;

        let (device, role) = registry
            .route("treatlifeds03/fan/attic-fan/speed/state")
            .await
            .unwrap();
        assert_eq!(device.name(), "attic-fan");
        assert_eq!(role, TopicRole::SpeedState);

        let (_, role) = registry
            .route("treatlifeds03/fan/attic-fan/state")
            .await
            .unwrap();
        assert_eq!(role, TopicRole::State);

        assert!(registry.route("treatlifeds03/fan/other/state").await.is_none());
        assert!(registry.get("attic-fan").await.is_some());
    }
}
