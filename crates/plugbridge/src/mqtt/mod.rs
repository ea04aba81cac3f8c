mod client;

#[cfg(test)]
pub use client::MockMqttClient;
pub use client::Inbox;
pub use client::MqttClient;
pub use client::MqttError;
pub use client::MqttMessage;
pub use client::RumqttcClient;

/// Whether an MQTT topic filter (with `+` and `#` wildcards) matches a topic.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (expected, Some(level)) if expected == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}
