//! Vehicle-side command handling
//!
//! Reads frames from the station link, drives the actuators and answers every
//! request with an ACKNOWLEDGE or ERROR.

use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::actuators::{ActuatorError, LightActuator, PropulsionActuator};
use crate::network::{Connection, ConnectionError, DeviceState};
use crate::protocol::{
    channels, error_codes, CodecError, Packet, PacketKind, PacketType, THROTTLE_RANGE,
};

#[derive(Error, Debug)]
pub enum ResponderError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),
}

pub type ResponderResult<T> = Result<T, ResponderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    AwaitingFrame,
    ProcessingCommand,
    Closed,
}

/// The actuators a responder drives
#[derive(Clone)]
pub struct Actuators {
    pub lights: Arc<dyn LightActuator>,
    pub motor: Arc<dyn PropulsionActuator>,
}

impl Actuators {
    pub fn new(lights: Arc<dyn LightActuator>, motor: Arc<dyn PropulsionActuator>) -> Self {
        Self { lights, motor }
    }

    /// Read the current outputs
    pub async fn snapshot(&self) -> Result<DeviceState, ActuatorError> {
        Ok(DeviceState {
            headlight: self.lights.get(channels::HEADLIGHT).await?,
            rear_light: self.lights.get(channels::REAR_LIGHT).await?,
            throttle: self.motor.get().await?,
        })
    }
}

struct Rejection {
    code: u8,
    message: String,
}

impl Rejection {
    fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ActuatorError> for Rejection {
    fn from(e: ActuatorError) -> Self {
        match e {
            ActuatorError::InvalidChannel(_) | ActuatorError::OutOfRange(_) => {
                Rejection::new(error_codes::OUT_OF_RANGE, e.to_string())
            }
            other => Rejection::new(error_codes::ACTUATOR_FAILURE, other.to_string()),
        }
    }
}

/// Serves one station session
pub struct Responder<S = TcpStream> {
    conn: Connection<S>,
    actuators: Actuators,
    device: DeviceState,
    state: ResponderState,
}

impl<S> Responder<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn new(conn: Connection<S>, actuators: Actuators) -> ResponderResult<Self> {
        let device = actuators.snapshot().await?;
        Ok(Self {
            conn,
            actuators,
            device,
            state: ResponderState::AwaitingFrame,
        })
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn device_state(&self) -> DeviceState {
        self.device
    }

    /// Serve until the station closes the link
    pub async fn run(&mut self) -> ResponderResult<()> {
        let result = self.serve().await;
        self.state = ResponderState::Closed;
        self.conn.conversations().close_all();
        match result {
            Err(ResponderError::Connection(ConnectionError::Closed)) => {
                tracing::warn!("Station link closed mid-frame");
                Ok(())
            }
            other => other,
        }
    }

    async fn serve(&mut self) -> ResponderResult<()> {
        loop {
            self.state = ResponderState::AwaitingFrame;

            let mut batch = Vec::new();
            while let Some(packet) = self.conn.next_buffered() {
                batch.push(packet);
            }

            if batch.is_empty() {
                match self.conn.recv().await? {
                    Some(packet) => batch.push(packet),
                    None => {
                        tracing::info!("Station closed the session");
                        return Ok(());
                    }
                }
                while let Some(packet) = self.conn.next_buffered() {
                    batch.push(packet);
                }
            }

            // Emergency stops jump the queue; the rest keep arrival order
            let (stops, rest): (Vec<Packet>, Vec<Packet>) = batch
                .into_iter()
                .partition(|p| p.packet_type() == Some(PacketType::EStop));

            for packet in stops.into_iter().chain(rest) {
                self.state = ResponderState::ProcessingCommand;
                self.process(packet).await?;
            }
        }
    }

    async fn process(&mut self, packet: Packet) -> ResponderResult<()> {
        let conversation = packet.conversation();

        let ty = match packet.kind() {
            PacketKind::Known(ty) => ty,
            PacketKind::Unrecognized(byte) => {
                tracing::warn!("Unrecognized packet type {:#04x}", byte);
                if let Some(id) = conversation {
                    let _ = self.conn.conversations().accept(id, true);
                    let reply = Packet::error(
                        error_codes::UNKNOWN_TYPE,
                        &format!("unknown packet type {:#04x}", byte),
                    );
                    self.reply(id, reply).await?;
                }
                return Ok(());
            }
        };

        if !ty.is_request() {
            match conversation {
                Some(id) if ty == PacketType::EndConversation => {
                    self.conn.conversations().close(id);
                }
                // Only requests open conversations here
                Some(id) if !self.conn.conversations().is_open(id) => {
                    tracing::warn!("{} for unknown conversation {}", ty, id);
                    let reply = Packet::error(
                        error_codes::UNKNOWN_CONVERSATION,
                        &format!("no conversation {}", id),
                    );
                    self.conn.send(&reply.with_conversation(Some(id))).await?;
                }
                _ => tracing::debug!("Ignoring {} from station", ty),
            }
            return Ok(());
        }

        if let Some(id) = conversation {
            if let Err(e) = self.conn.conversations().accept(id, true) {
                tracing::warn!("Dropping {}: {}", ty, e);
                return Ok(());
            }
        }

        tracing::debug!("Handling {} ({} byte payload)", ty, packet.payload().len());
        let reply = match self.execute(ty, packet.payload()).await {
            Ok(payload) => Packet::new(PacketType::Acknowledge, payload)?,
            Err(rejection) => {
                tracing::warn!("Rejecting {}: {}", ty, rejection.message);
                Packet::error(rejection.code, &rejection.message)
            }
        };

        match conversation {
            Some(id) => self.reply(id, reply).await,
            None => Ok(self.conn.send(&reply).await?),
        }
    }

    /// Send a correlated reply and retire its conversation
    async fn reply(&mut self, id: u32, reply: Packet) -> ResponderResult<()> {
        self.conn.send(&reply.with_conversation(Some(id))).await?;
        let end = Packet::correlated(PacketType::EndConversation, id, Vec::new())?;
        self.conn.send(&end).await?;
        self.conn.conversations().close(id);
        Ok(())
    }

    async fn execute(&mut self, ty: PacketType, payload: &[u8]) -> Result<Vec<u8>, Rejection> {
        let before = self.device;
        let ack = match ty {
            PacketType::SetLight => {
                let [channel, value] = fixed::<2>(ty, payload)?;
                let channel = check_channel(channel)?;
                let on = match value {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(Rejection::new(
                            error_codes::MALFORMED_PAYLOAD,
                            format!("light value must be 0 or 1, got {}", other),
                        ))
                    }
                };
                self.actuators.lights.set(channel, on).await?;
                self.device.set_light(channel, on);
                Vec::new()
            }
            PacketType::GetLight => {
                let [channel] = fixed::<1>(ty, payload)?;
                let on = self.actuators.lights.get(check_channel(channel)?).await?;
                self.device.set_light(channel, on);
                vec![u8::from(on)]
            }
            PacketType::SetThrottle => {
                let [raw] = fixed::<1>(ty, payload)?;
                let percent = raw as i8;
                if !THROTTLE_RANGE.contains(&percent) {
                    return Err(Rejection::new(
                        error_codes::OUT_OF_RANGE,
                        format!("throttle {}% is outside -100..=100", percent),
                    ));
                }
                self.actuators.motor.set(percent).await?;
                self.device.throttle = percent;
                Vec::new()
            }
            PacketType::GetThrottle => {
                fixed::<0>(ty, payload)?;
                let percent = self.actuators.motor.get().await?;
                self.device.throttle = percent;
                vec![percent as u8]
            }
            PacketType::EStop => {
                tracing::warn!("Emergency stop");
                self.actuators.motor.set(0).await?;
                self.device.throttle = 0;
                Vec::new()
            }
            other => {
                return Err(Rejection::new(
                    error_codes::UNKNOWN_TYPE,
                    format!("{} is not a command", other),
                ))
            }
        };

        if self.device != before {
            tracing::info!(
                "Device state: headlight={} rear={} throttle={}%",
                self.device.headlight,
                self.device.rear_light,
                self.device.throttle
            );
        }
        Ok(ack)
    }
}

fn fixed<const N: usize>(ty: PacketType, payload: &[u8]) -> Result<[u8; N], Rejection> {
    payload.try_into().map_err(|_| {
        Rejection::new(
            error_codes::MALFORMED_PAYLOAD,
            format!("{} expects {} payload bytes, got {}", ty, N, payload.len()),
        )
    })
}

fn check_channel(channel: u8) -> Result<u8, Rejection> {
    if channel < channels::COUNT {
        Ok(channel)
    } else {
        Err(Rejection::new(
            error_codes::OUT_OF_RANGE,
            format!("no light channel {}", channel),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Dialect;
    use crate::vehicle::{SimulatedLights, SimulatedMotor};
    use tokio::io::AsyncWriteExt;

    fn actuators(throttle: i8) -> (Arc<SimulatedLights>, Arc<SimulatedMotor>, Actuators) {
        let lights = Arc::new(SimulatedLights::new());
        let motor = Arc::new(SimulatedMotor::with_throttle(throttle));
        let actuators = Actuators::new(lights.clone(), motor.clone());
        (lights, motor, actuators)
    }

    #[tokio::test]
    async fn test_set_light_is_acknowledged() {
        let (lights, _, actuators) = actuators(0);
        let stream = tokio_test::io::Builder::new()
            .read(&[0x52, 0x46, 0x2D, 0x02, 0x00, 0x02, 0x00, 0x01])
            .write(&[0x52, 0x46, 0x2D, 0x05, 0x00, 0x00])
            .build();

        let conn = Connection::new(stream, Dialect::Sequential);
        let mut responder = Responder::new(conn, actuators).await.unwrap();
        responder.run().await.unwrap();

        assert!(lights.get(channels::HEADLIGHT).await.unwrap());
        assert!(responder.device_state().headlight);
        assert_eq!(responder.state(), ResponderState::Closed);
    }

    #[tokio::test]
    async fn test_get_throttle_reports_negative_percent() {
        let (_, _, actuators) = actuators(-42);
        let stream = tokio_test::io::Builder::new()
            .read(&[0x52, 0x46, 0x2D, 0x01, 0x00, 0x00])
            .write(&[0x52, 0x46, 0x2D, 0x05, 0x00, 0x01, 0xD6])
            .build();

        let conn = Connection::new(stream, Dialect::Sequential);
        let mut responder = Responder::new(conn, actuators).await.unwrap();
        responder.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_type_is_ignored_in_sequential() {
        let (_, _, actuators) = actuators(7);
        let stream = tokio_test::io::Builder::new()
            .read(&[0x52, 0x46, 0x2D, 0x09, 0x00, 0x00])
            .read(&[0x52, 0x46, 0x2D, 0x01, 0x00, 0x00])
            .write(&[0x52, 0x46, 0x2D, 0x05, 0x00, 0x01, 0x07])
            .build();

        let conn = Connection::new(stream, Dialect::Sequential);
        let mut responder = Responder::new(conn, actuators).await.unwrap();
        responder.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_throttle_out_of_range_is_rejected_not_clamped() {
        let (_, motor, actuators) = actuators(10);
        let (station, vehicle) = tokio::io::duplex(256);
        let mut station = Connection::new(station, Dialect::Sequential);

        let task = tokio::spawn(async move {
            let conn = Connection::new(vehicle, Dialect::Sequential);
            let mut responder = Responder::new(conn, actuators).await.unwrap();
            responder.run().await
        });

        let packet = Packet::new(PacketType::SetThrottle, vec![120u8]).unwrap();
        station.send(&packet).await.unwrap();
        let reply = station.recv().await.unwrap().unwrap();
        let (code, _) = reply.error_details().unwrap();
        assert_eq!(code, error_codes::OUT_OF_RANGE);
        assert_eq!(motor.get().await.unwrap(), 10);

        drop(station);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_channel_and_malformed_payload() {
        let (_, _, actuators) = actuators(0);
        let (station, vehicle) = tokio::io::duplex(256);
        let mut station = Connection::new(station, Dialect::Sequential);

        tokio::spawn(async move {
            let conn = Connection::new(vehicle, Dialect::Sequential);
            let mut responder = Responder::new(conn, actuators).await.unwrap();
            responder.run().await
        });

        station
            .send(&Packet::new(PacketType::GetLight, vec![9u8]).unwrap())
            .await
            .unwrap();
        let reply = station.recv().await.unwrap().unwrap();
        assert_eq!(reply.error_details().unwrap().0, error_codes::OUT_OF_RANGE);

        station
            .send(&Packet::new(PacketType::SetLight, vec![0u8]).unwrap())
            .await
            .unwrap();
        let reply = station.recv().await.unwrap().unwrap();
        assert_eq!(
            reply.error_details().unwrap().0,
            error_codes::MALFORMED_PAYLOAD
        );
    }

    #[tokio::test]
    async fn test_emergency_stop_jumps_the_batch() {
        let (_, motor, actuators) = actuators(30);
        let mut frames = vec![0x52, 0x46, 0x2D, 0x01, 0x00, 0x00];
        frames.extend_from_slice(&[0x52, 0x46, 0x2D, 0x04, 0x00, 0x00]);
        let stream = tokio_test::io::Builder::new()
            .read(&frames)
            .write(&[0x52, 0x46, 0x2D, 0x05, 0x00, 0x00])
            .write(&[0x52, 0x46, 0x2D, 0x05, 0x00, 0x01, 0x00])
            .build();

        let conn = Connection::new(stream, Dialect::Sequential);
        let mut responder = Responder::new(conn, actuators).await.unwrap();
        responder.run().await.unwrap();
        assert_eq!(motor.get().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_correlated_replies_end_the_conversation() {
        let (_, _, actuators) = actuators(-42);
        let (station, vehicle) = tokio::io::duplex(256);
        let mut station = Connection::new(station, Dialect::Correlated);

        tokio::spawn(async move {
            let conn = Connection::new(vehicle, Dialect::Correlated);
            let mut responder = Responder::new(conn, actuators).await.unwrap();
            responder.run().await
        });

        let request = Packet::correlated(PacketType::GetThrottle, 6, Vec::new()).unwrap();
        station.send(&request).await.unwrap();

        let ack = station.recv().await.unwrap().unwrap();
        assert_eq!(ack.packet_type(), Some(PacketType::Acknowledge));
        assert_eq!(ack.conversation(), Some(6));
        assert_eq!(ack.payload().as_ref(), &[0xD6]);

        let end = station.recv().await.unwrap().unwrap();
        assert_eq!(end.packet_type(), Some(PacketType::EndConversation));
        assert_eq!(end.conversation(), Some(6));
    }

    #[tokio::test]
    async fn test_unrecognized_type_gets_correlated_error() {
        let (_, _, actuators) = actuators(0);
        let (mut station, vehicle) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let conn = Connection::new(vehicle, Dialect::Correlated);
            let mut responder = Responder::new(conn, actuators).await.unwrap();
            responder.run().await
        });

        // magic, type 0x2A, conversation 4, empty payload
        station
            .write_all(&[0x52, 0x46, 0x2D, 0x2A, 0, 0, 0, 4, 0, 0])
            .await
            .unwrap();

        let mut station = Connection::new(station, Dialect::Correlated);
        let reply = station.recv().await.unwrap().unwrap();
        assert_eq!(reply.conversation(), Some(4));
        assert_eq!(reply.error_details().unwrap().0, error_codes::UNKNOWN_TYPE);
        let end = station.recv().await.unwrap().unwrap();
        assert_eq!(end.packet_type(), Some(PacketType::EndConversation));
        assert_eq!(end.conversation(), Some(4));
    }

    #[tokio::test]
    async fn test_reply_on_unknown_conversation_is_refused() {
        let (_, _, actuators) = actuators(15);
        let (station, vehicle) = tokio::io::duplex(256);
        let mut station = Connection::new(station, Dialect::Correlated);

        tokio::spawn(async move {
            let conn = Connection::new(vehicle, Dialect::Correlated);
            let mut responder = Responder::new(conn, actuators).await.unwrap();
            responder.run().await
        });

        let stray = Packet::correlated(PacketType::Acknowledge, 8, Vec::new()).unwrap();
        station.send(&stray).await.unwrap();
        let reply = station.recv().await.unwrap().unwrap();
        assert_eq!(reply.conversation(), Some(8));
        assert_eq!(
            reply.error_details().unwrap().0,
            error_codes::UNKNOWN_CONVERSATION
        );

        // END for a conversation the vehicle never had gets no answer
        let end = Packet::correlated(PacketType::EndConversation, 8, Vec::new()).unwrap();
        station.send(&end).await.unwrap();
        let request = Packet::correlated(PacketType::GetThrottle, 10, Vec::new()).unwrap();
        station.send(&request).await.unwrap();
        let ack = station.recv().await.unwrap().unwrap();
        assert_eq!(ack.conversation(), Some(10));
        assert_eq!(ack.payload().as_ref(), &[15]);
    }
}
