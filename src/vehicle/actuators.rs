//! Actuator and radio trait definitions
//!
//! Defines the interfaces the vehicle firmware drives. Real hardware and the
//! simulator both implement them; the binary picks one set at startup.

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// Errors from light and propulsion outputs
#[derive(Error, Debug)]
pub enum ActuatorError {
    #[error("No such channel: {0}")]
    InvalidChannel(u8),

    #[error("Value out of range: {0}")]
    OutOfRange(i8),

    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ActuatorResult<T> = Result<T, ActuatorError>;

/// Errors from the radio
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Command failed: {0}")]
    Command(String),

    #[error("Not hosting a network")]
    NotHosting,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Light outputs, one per channel
#[async_trait]
pub trait LightActuator: Send + Sync {
    async fn get(&self, channel: u8) -> ActuatorResult<bool>;

    async fn set(&self, channel: u8, on: bool) -> ActuatorResult<()>;
}

/// Motor driver taking a signed percentage (negative is reverse)
#[async_trait]
pub trait PropulsionActuator: Send + Sync {
    async fn get(&self) -> ActuatorResult<i8>;

    async fn set(&self, percent: i8) -> ActuatorResult<()>;
}

/// Hosting a temporary access point
#[async_trait]
pub trait NetworkHost: Send + Sync {
    /// Start hosting; returns the advertised name and the vehicle's address
    async fn start(&mut self, name: &str) -> NetworkResult<(String, IpAddr)>;

    async fn stop(&mut self) -> NetworkResult<()>;
}

/// Joining an existing network as a client
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn join(&mut self, name: &str, secret: &str) -> NetworkResult<()>;
}
