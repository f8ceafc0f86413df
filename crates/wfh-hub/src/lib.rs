//! The `wfh-hub` library crate provides the building blocks of a
//! WasteFreeHome hub, the process that bridges home devices publishing on an
//! `MQTT` broker to the WasteFreeHome server.
//!
//! Core functionalities of this crate include:
//!
//! - Classifying the messages published by devices on `device/<id>/state`
//!   and `device/<id>/record` topics
//! - Forwarding device states and records to the server through
//!   authenticated `REST` requests, refreshing the bearer token when it
//!   expires
//! - Managing the broker session lifecycle, including reconnections and a
//!   bounded graceful shutdown
//! - Advertising the hub services on the local network through `mDNS`
//! - Serving a small `HTTP` interface to check the hub health and to update
//!   the user credentials
//!
//! Messages received from the broker are dispatched by a fixed pool of
//! `tokio` tasks, so a slow server request never blocks the delivery of
//! messages coming from other devices.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// The hub `HTTP` interface.
pub mod api;
/// An authenticated client for the server.
pub mod client;
/// Hub configuration.
pub mod config;
/// Bearer token management.
pub mod credential;
/// Hub services advertisement on the local network.
pub mod discovery;
/// Error management.
pub mod error;
/// Broker session lifecycle and message dispatching.
pub mod relay;
/// Server responses.
pub mod response;
/// Classification of broker messages into device events.
pub mod topic;

#[cfg(test)]
mod tests;
