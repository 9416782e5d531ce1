//! Simulated vehicle hardware
//!
//! In-memory lights, motor and radio for running a vehicle on a PC.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::Arc;

use super::actuators::{
    ActuatorError, ActuatorResult, LightActuator, NetworkClient, NetworkError, NetworkHost,
    NetworkResult, PropulsionActuator,
};
use crate::protocol::channels;

/// Light outputs kept in memory
#[derive(Debug, Default)]
pub struct SimulatedLights {
    lights: [AtomicBool; channels::COUNT as usize],
}

impl SimulatedLights {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, channel: u8) -> ActuatorResult<&AtomicBool> {
        self.lights
            .get(channel as usize)
            .ok_or(ActuatorError::InvalidChannel(channel))
    }
}

#[async_trait]
impl LightActuator for SimulatedLights {
    async fn get(&self, channel: u8) -> ActuatorResult<bool> {
        Ok(self.slot(channel)?.load(Ordering::SeqCst))
    }

    async fn set(&self, channel: u8, on: bool) -> ActuatorResult<()> {
        self.slot(channel)?.store(on, Ordering::SeqCst);
        tracing::info!("[sim] light {} {}", channel, if on { "on" } else { "off" });
        Ok(())
    }
}

/// Motor kept in memory
#[derive(Debug, Default)]
pub struct SimulatedMotor {
    percent: AtomicI8,
}

impl SimulatedMotor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_throttle(percent: i8) -> Self {
        Self {
            percent: AtomicI8::new(percent),
        }
    }
}

#[async_trait]
impl PropulsionActuator for SimulatedMotor {
    async fn get(&self) -> ActuatorResult<i8> {
        Ok(self.percent.load(Ordering::SeqCst))
    }

    async fn set(&self, percent: i8) -> ActuatorResult<()> {
        self.percent.store(percent, Ordering::SeqCst);
        tracing::info!("[sim] motor {}%", percent);
        Ok(())
    }
}

/// Pretend access point
///
/// Hosting state is shared so tests can observe it after handing the host
/// to the pairing state machine.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    address: IpAddr,
    hosting: Arc<AtomicBool>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hosting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_hosting(&self) -> bool {
        self.hosting.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkHost for SimulatedHost {
    async fn start(&mut self, name: &str) -> NetworkResult<(String, IpAddr)> {
        self.hosting.store(true, Ordering::SeqCst);
        tracing::info!("[sim] hosting access point \"{}\"", name);
        Ok((name.to_string(), self.address))
    }

    async fn stop(&mut self) -> NetworkResult<()> {
        if !self.hosting.swap(false, Ordering::SeqCst) {
            return Err(NetworkError::NotHosting);
        }
        tracing::info!("[sim] access point stopped");
        Ok(())
    }
}

/// Pretend station client; can be told to fail a number of joins
#[derive(Debug, Clone, Default)]
pub struct SimulatedClient {
    failures_left: u32,
}

impl SimulatedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: times,
        }
    }
}

#[async_trait]
impl NetworkClient for SimulatedClient {
    async fn join(&mut self, name: &str, _secret: &str) -> NetworkResult<()> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(NetworkError::Command(format!("[sim] {} out of range", name)));
        }
        tracing::info!("[sim] joined network \"{}\"", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_lights() {
        let lights = SimulatedLights::new();
        lights.set(channels::REAR_LIGHT, true).await.unwrap();
        assert!(lights.get(channels::REAR_LIGHT).await.unwrap());
        assert!(!lights.get(channels::HEADLIGHT).await.unwrap());
        assert!(matches!(
            lights.get(5).await,
            Err(ActuatorError::InvalidChannel(5))
        ));
    }

    #[tokio::test]
    async fn test_simulated_host_state() {
        let mut host = SimulatedHost::new();
        let observer = host.clone();
        let (name, _) = host.start("RailFi_USSC_148").await.unwrap();
        assert_eq!(name, "RailFi_USSC_148");
        assert!(observer.is_hosting());
        host.stop().await.unwrap();
        assert!(!observer.is_hosting());
        assert!(matches!(host.stop().await, Err(NetworkError::NotHosting)));
    }
}
