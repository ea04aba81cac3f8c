use crate::accessory::AccessoryError;
use crate::mqtt::MqttError;

/// Errors raised while bridging broker traffic and accessories.
///
/// `Parse`, `ValueOutOfRange`, `PublishFailed` and `Subscribe` are local to a
/// single message and are logged and dropped at the dispatch boundary.
/// `TransportStartupFailed` and `BrokerConnectFailed` end the process.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to parse message on {topic}: {reason}")]
    Parse { topic: String, reason: String },

    #[error("value {value} is outside the range 0-100")]
    ValueOutOfRange { value: i64 },

    #[error("failed to publish to {topic}: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: MqttError,
    },

    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: MqttError,
    },

    #[error("failed to start accessory transport for {name}: {source}")]
    TransportStartupFailed {
        name: String,
        #[source]
        source: AccessoryError,
    },

    #[error("failed to connect to MQTT broker: {0}")]
    BrokerConnectFailed(#[source] MqttError),
}

impl BridgeError {
    pub(crate) fn parse(topic: &str, reason: impl ToString) -> Self {
        Self::Parse {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
