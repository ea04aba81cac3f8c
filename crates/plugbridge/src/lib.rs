pub mod accessory;
pub mod bridge;
pub mod config;
pub mod convert;
pub mod device;
pub mod discovery;
pub mod error;
pub mod mqtt;
pub mod registry;
pub mod sync;

pub use bridge::Bridge;
pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use error::BridgeError;
