//! Linux vehicle hardware
//!
//! Uses the sysfs GPIO and PWM interfaces for lights and motor, and
//! NetworkManager's `nmcli` for the radio.
//!
//! Requirements:
//! - Write access to /sys/class/gpio and /sys/class/pwm (root or the gpio group)
//! - NetworkManager running, with a Wi-Fi interface that supports AP mode

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::actuators::{
    ActuatorError, ActuatorResult, LightActuator, NetworkClient, NetworkError, NetworkHost,
    NetworkResult, PropulsionActuator,
};
use crate::protocol::{channels, THROTTLE_RANGE};

const GPIO_ROOT: &str = "/sys/class/gpio";
const PWM_ROOT: &str = "/sys/class/pwm";

// Hotspot connection profile managed by nmcli
const HOTSPOT_PROFILE: &str = "railfi-pairing";

// Wait for udev to set permissions on freshly exported nodes
const EXPORT_SETTLE: Duration = Duration::from_millis(100);

struct GpioPin {
    number: u32,
}

impl GpioPin {
    async fn export(number: u32, output: bool) -> ActuatorResult<Self> {
        let pin = Self { number };
        if !tokio::fs::try_exists(pin.path()).await? {
            tokio::fs::write(format!("{}/export", GPIO_ROOT), number.to_string()).await?;
            tokio::time::sleep(EXPORT_SETTLE).await;
        }
        let direction = if output { "out" } else { "in" };
        tokio::fs::write(pin.path().join("direction"), direction).await?;
        Ok(pin)
    }

    fn path(&self) -> PathBuf {
        PathBuf::from(format!("{}/gpio{}", GPIO_ROOT, self.number))
    }

    async fn read(&self) -> ActuatorResult<bool> {
        let value = tokio::fs::read_to_string(self.path().join("value")).await?;
        match value.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(ActuatorError::Device(format!(
                "gpio{} reported {:?}",
                self.number, other
            ))),
        }
    }

    async fn write(&self, high: bool) -> ActuatorResult<()> {
        let value = if high { "1" } else { "0" };
        tokio::fs::write(self.path().join("value"), value).await?;
        Ok(())
    }
}

/// Lights on two GPIO output pins
pub struct GpioLights {
    pins: [GpioPin; channels::COUNT as usize],
}

impl GpioLights {
    pub async fn open(headlight_pin: u32, rear_light_pin: u32) -> ActuatorResult<Self> {
        let pins = [
            GpioPin::export(headlight_pin, true).await?,
            GpioPin::export(rear_light_pin, true).await?,
        ];
        tracing::info!(
            "GPIO lights on pins {} and {}",
            headlight_pin,
            rear_light_pin
        );
        Ok(Self { pins })
    }

    fn pin(&self, channel: u8) -> ActuatorResult<&GpioPin> {
        self.pins
            .get(channel as usize)
            .ok_or(ActuatorError::InvalidChannel(channel))
    }
}

#[async_trait]
impl LightActuator for GpioLights {
    async fn get(&self, channel: u8) -> ActuatorResult<bool> {
        self.pin(channel)?.read().await
    }

    async fn set(&self, channel: u8, on: bool) -> ActuatorResult<()> {
        self.pin(channel)?.write(on).await
    }
}

/// Motor driven by one PWM channel plus a GPIO direction line
pub struct PwmMotor {
    channel_path: PathBuf,
    period_ns: u32,
    direction: GpioPin,
    percent: Mutex<i8>,
}

impl PwmMotor {
    pub async fn open(
        chip: u32,
        channel: u32,
        period_ns: u32,
        direction_pin: u32,
    ) -> ActuatorResult<Self> {
        let chip_path = PathBuf::from(format!("{}/pwmchip{}", PWM_ROOT, chip));
        let channel_path = chip_path.join(format!("pwm{}", channel));
        if !tokio::fs::try_exists(&channel_path).await? {
            tokio::fs::write(chip_path.join("export"), channel.to_string()).await?;
            tokio::time::sleep(EXPORT_SETTLE).await;
        }

        tokio::fs::write(channel_path.join("duty_cycle"), "0").await?;
        tokio::fs::write(channel_path.join("period"), period_ns.to_string()).await?;
        tokio::fs::write(channel_path.join("enable"), "1").await?;

        let direction = GpioPin::export(direction_pin, true).await?;
        direction.write(false).await?;

        tracing::info!(
            "PWM motor on pwmchip{}/pwm{} (period {} ns, direction pin {})",
            chip,
            channel,
            period_ns,
            direction_pin
        );
        Ok(Self {
            channel_path,
            period_ns,
            direction,
            percent: Mutex::new(0),
        })
    }
}

#[async_trait]
impl PropulsionActuator for PwmMotor {
    async fn get(&self) -> ActuatorResult<i8> {
        Ok(*self.percent.lock().await)
    }

    async fn set(&self, percent: i8) -> ActuatorResult<()> {
        if !THROTTLE_RANGE.contains(&percent) {
            return Err(ActuatorError::OutOfRange(percent));
        }

        let mut current = self.percent.lock().await;
        let duty = u64::from(self.period_ns) * u64::from(percent.unsigned_abs()) / 100;

        // Duty cycle is zero while the direction line changes
        if (percent < 0) != (*current < 0) {
            tokio::fs::write(self.channel_path.join("duty_cycle"), "0").await?;
            self.direction.write(percent < 0).await?;
        }
        tokio::fs::write(self.channel_path.join("duty_cycle"), duty.to_string()).await?;

        *current = percent;
        Ok(())
    }
}

async fn nmcli(args: &[&str]) -> NetworkResult<String> {
    tracing::debug!("nmcli {}", args.join(" "));
    let output = Command::new("nmcli").args(args).output().await?;
    if !output.status.success() {
        return Err(NetworkError::Command(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn interface_address(interface: &str) -> NetworkResult<IpAddr> {
    let output = nmcli(&["-g", "IP4.ADDRESS", "device", "show", interface]).await?;
    output
        .lines()
        .filter_map(|line| line.split('/').next())
        .find_map(|addr| addr.trim().parse().ok())
        .ok_or_else(|| NetworkError::Command(format!("{} has no IPv4 address", interface)))
}

/// Open temporary access point through a NetworkManager shared connection
pub struct NmHotspot {
    interface: String,
    active: bool,
}

impl NmHotspot {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            active: false,
        }
    }
}

#[async_trait]
impl NetworkHost for NmHotspot {
    async fn start(&mut self, name: &str) -> NetworkResult<(String, IpAddr)> {
        // Left over from a run that did not shut down cleanly
        let _ = nmcli(&["connection", "delete", HOTSPOT_PROFILE]).await;

        nmcli(&[
            "connection",
            "add",
            "type",
            "wifi",
            "ifname",
            &self.interface,
            "con-name",
            HOTSPOT_PROFILE,
            "autoconnect",
            "no",
            "ssid",
            name,
            "802-11-wireless.mode",
            "ap",
            "ipv4.method",
            "shared",
        ])
        .await?;
        nmcli(&["connection", "up", HOTSPOT_PROFILE]).await?;
        self.active = true;

        let address = interface_address(&self.interface).await?;
        tracing::info!("Hosting \"{}\" on {} ({})", name, self.interface, address);
        Ok((name.to_string(), address))
    }

    async fn stop(&mut self) -> NetworkResult<()> {
        if !self.active {
            return Err(NetworkError::NotHosting);
        }
        self.active = false;
        nmcli(&["connection", "down", HOTSPOT_PROFILE]).await?;
        nmcli(&["connection", "delete", HOTSPOT_PROFILE]).await?;
        Ok(())
    }
}

/// Station network client through NetworkManager
pub struct NmClient {
    interface: String,
}

impl NmClient {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

#[async_trait]
impl NetworkClient for NmClient {
    async fn join(&mut self, name: &str, secret: &str) -> NetworkResult<()> {
        nmcli(&[
            "device",
            "wifi",
            "connect",
            name,
            "password",
            secret,
            "ifname",
            &self.interface,
        ])
        .await?;
        tracing::info!("Joined \"{}\" on {}", name, self.interface);
        Ok(())
    }
}
