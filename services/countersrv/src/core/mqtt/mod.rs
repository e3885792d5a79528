//! MQTT collection plane: managed client, payload decoding, topic routing.

pub mod client;
pub mod decoder;
pub mod topics;

pub use client::{MqttIngest, MqttIngestStats};
pub use decoder::DeviceBinding;
pub use topics::TopicRegistry;
