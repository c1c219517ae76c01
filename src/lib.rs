//! # chanbus
//!
//! `chanbus` is the messaging fabric of an IoT platform. It moves device
//! messages between front-end protocols and one interchangeable backend
//! broker, behind a single publish/subscribe contract.
//!
//! ## Core Modules
//!
//! - `broker`: the `PubSub` facade, the message envelope, topic naming and the
//!   subscription registry.
//! - `driver`: backend drivers (in-process, AMQP, MQTT) selected by URL scheme.
//! - `coap`: the CoAP adapter, including observe relationships with
//!   retransmission and keep-alive.
//! - `auth`: credential checks used by the adapter.
//! - `persistence`: a durable route map backed by `sled`.
//! - `config`: loading settings from files and the environment.
//! - `utils`: shared error types and the logging bootstrap.

pub mod auth;
pub mod broker;
pub mod coap;
pub mod config;
pub mod driver;
pub mod persistence;
pub mod utils;
