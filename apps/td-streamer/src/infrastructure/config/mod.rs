//! Configuration Module
//!
//! Configuration loading for the streaming client and binary.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_STREAMER_URL, FieldKeying, SessionSettings, SinkSettings,
    StreamerConfig, SubscriptionSpec,
};
