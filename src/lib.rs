//! femtomq - Small single-threaded MQTT v3.1.1 broker
//!
//! One thread multiplexes every client over non-blocking sockets. Clients
//! identify with CONNECT, subscribe to topic filters with `+` and `#`
//! wildcards and exchange QoS 0 messages routed by topic.

pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod topic;

pub use broker::{Broker, BrokerConfig, FanoutMode};
pub use config::Config;
pub use protocol::QoS;
