//! # Wearable Telemetry Library
//!
//! Fuse heart-rate readings with location fixes and publish them to an MQTT broker.
//!
//! The agent provisions its own device identity on first start (a UUID plus a
//! broker-issued client certificate), keeps a single TLS session to the
//! broker, and publishes one JSON record per location fix that arrives while a
//! recent, sufficiently accurate heart-rate sample is buffered.

pub mod agent;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod identity;
pub mod sensor;
pub mod telemetry;
