//! Station-side sessions
//!
//! A session owns the framed connection to one vehicle. Commands are sent
//! from any number of cloned [`SessionHandle`]s and executed by the session
//! task, which matches each reply to its request.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::connection::Connection;
use super::SessionConfig;
use crate::protocol::{channels, CodecError, Dialect, Packet, PacketType, THROTTLE_RANGE};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No response from vehicle")]
    NoResponse,

    #[error("Vehicle disconnected")]
    Disconnected,

    #[error("Vehicle rejected the command (code {code}): {message}")]
    Rejected { code: u8, message: String },

    #[error("Throttle {0}% is outside -100..=100")]
    ThrottleOutOfRange(i8),

    #[error("No light channel {0}")]
    InvalidChannel(u8),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Last known actuator state of a vehicle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub headlight: bool,
    pub rear_light: bool,
    pub throttle: i8,
}

impl DeviceState {
    pub fn set_light(&mut self, channel: u8, on: bool) {
        match channel {
            channels::HEADLIGHT => self.headlight = on,
            channels::REAR_LIGHT => self.rear_light = on,
            _ => {}
        }
    }
}

/// A command the station can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetLight { channel: u8, on: bool },
    GetLight { channel: u8 },
    SetThrottle(i8),
    GetThrottle,
    EmergencyStop,
}

impl Command {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Command::SetLight { .. } => PacketType::SetLight,
            Command::GetLight { .. } => PacketType::GetLight,
            Command::SetThrottle(_) => PacketType::SetThrottle,
            Command::GetThrottle => PacketType::GetThrottle,
            Command::EmergencyStop => PacketType::EStop,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match *self {
            Command::SetLight { channel, on } => vec![channel, u8::from(on)],
            Command::GetLight { channel } => vec![channel],
            Command::SetThrottle(percent) => vec![percent as u8],
            Command::GetThrottle | Command::EmergencyStop => Vec::new(),
        }
    }

    pub fn to_packet(&self, conversation: Option<u32>) -> Result<Packet, CodecError> {
        match conversation {
            Some(id) => Packet::correlated(self.packet_type(), id, self.payload()),
            None => Packet::new(self.packet_type(), self.payload()),
        }
    }
}

/// Successful outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Done,
    Light(bool),
    Throttle(i8),
}

struct Request {
    command: Command,
    reply_tx: oneshot::Sender<SessionResult<Reply>>,
}

struct InFlight {
    command: Command,
    conversation: Option<u32>,
    attempts: u32,
    reply_tx: oneshot::Sender<SessionResult<Reply>>,
}

/// Handle for issuing commands to a session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    request_tx: mpsc::Sender<Request>,
    shutdown_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<DeviceState>,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Start a session task on a connection
    ///
    /// The returned join handle resolves with the disconnect reason once the
    /// session has ended and its connection is closed.
    pub fn spawn<S>(conn: Connection<S>, config: SessionConfig) -> (Self, JoinHandle<String>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(DeviceState::default());
        let connected = Arc::new(AtomicBool::new(true));

        let handle = Self {
            request_tx,
            shutdown_tx,
            state_rx,
            connected: connected.clone(),
        };

        let task = tokio::spawn(async move {
            let reason = run_session(conn, config, request_rx, shutdown_rx, state_tx).await;
            connected.store(false, Ordering::SeqCst);
            reason
        });

        (handle, task)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last known device state
    pub fn device_state(&self) -> DeviceState {
        *self.state_rx.borrow()
    }

    /// Ask the session task to close the connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Execute a command and wait for its reply
    pub async fn request(&self, command: Command) -> SessionResult<Reply> {
        if !self.is_connected() {
            return Err(SessionError::Disconnected);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(Request { command, reply_tx })
            .await
            .map_err(|_| SessionError::Disconnected)?;

        reply_rx.await.map_err(|_| SessionError::Disconnected)?
    }

    pub async fn set_light(&self, channel: u8, on: bool) -> SessionResult<()> {
        check_channel(channel)?;
        self.request(Command::SetLight { channel, on }).await.map(|_| ())
    }

    pub async fn get_light(&self, channel: u8) -> SessionResult<bool> {
        check_channel(channel)?;
        match self.request(Command::GetLight { channel }).await? {
            Reply::Light(on) => Ok(on),
            other => Err(SessionError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn set_throttle(&self, percent: i8) -> SessionResult<()> {
        if !THROTTLE_RANGE.contains(&percent) {
            return Err(SessionError::ThrottleOutOfRange(percent));
        }
        self.request(Command::SetThrottle(percent)).await.map(|_| ())
    }

    pub async fn get_throttle(&self) -> SessionResult<i8> {
        match self.request(Command::GetThrottle).await? {
            Reply::Throttle(percent) => Ok(percent),
            other => Err(SessionError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn emergency_stop(&self) -> SessionResult<()> {
        self.request(Command::EmergencyStop).await.map(|_| ())
    }
}

fn check_channel(channel: u8) -> SessionResult<()> {
    if channel < channels::COUNT {
        Ok(())
    } else {
        Err(SessionError::InvalidChannel(channel))
    }
}

/// Session task main loop
async fn run_session<S>(
    mut conn: Connection<S>,
    config: SessionConfig,
    mut request_rx: mpsc::Receiver<Request>,
    mut shutdown_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<DeviceState>,
) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dialect = conn.dialect();
    let mut pending: VecDeque<InFlight> = VecDeque::new();

    let reason = loop {
        let can_issue = dialect == Dialect::Correlated || pending.is_empty();

        tokio::select! {
            request = request_rx.recv(), if can_issue => {
                match request {
                    Some(request) => {
                        if let Err(e) = issue(&mut conn, &mut pending, request).await {
                            break format!("Send error: {}", e);
                        }
                        continue;
                    }
                    None => break "All session handles dropped".to_string(),
                }
            }

            read = tokio::time::timeout(config.attempt_timeout, conn.fill()) => {
                match read {
                    Ok(Ok(0)) => break "Connection closed".to_string(),
                    Ok(Ok(_)) | Err(_) => {}
                    Ok(Err(e)) => break format!("Error: {}", e),
                }
            }

            _ = shutdown_rx.recv() => {
                break "Session shutdown requested".to_string();
            }
        }

        while let Some(packet) = conn.next_buffered() {
            handle_reply(&mut conn, &mut pending, packet, &state_tx);
        }

        for in_flight in pending.iter_mut() {
            in_flight.attempts += 1;
        }
        while let Some(index) = pending
            .iter()
            .position(|p| p.attempts >= config.response_attempts)
        {
            if let Some(expired) = pending.remove(index) {
                tracing::warn!(
                    "{} got no response after {} attempts",
                    expired.command.packet_type(),
                    expired.attempts
                );
                if let Some(id) = expired.conversation {
                    conn.conversations().close(id);
                }
                let _ = expired.reply_tx.send(Err(SessionError::NoResponse));
            }
        }
    };

    tracing::info!("Session with {:?} ending: {}", conn.peer(), reason);

    for in_flight in pending.drain(..) {
        let _ = in_flight.reply_tx.send(Err(SessionError::Disconnected));
    }
    request_rx.close();
    while let Ok(request) = request_rx.try_recv() {
        let _ = request.reply_tx.send(Err(SessionError::Disconnected));
    }

    let _ = conn.shutdown().await;
    reason
}

/// Send a request and record it as in flight
async fn issue<S>(
    conn: &mut Connection<S>,
    pending: &mut VecDeque<InFlight>,
    request: Request,
) -> Result<(), super::ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conversation = match conn.dialect() {
        Dialect::Correlated => match conn.conversations().begin(None) {
            Ok(id) => Some(id),
            Err(e) => {
                let _ = request
                    .reply_tx
                    .send(Err(SessionError::UnexpectedReply(e.to_string())));
                return Ok(());
            }
        },
        Dialect::Sequential => None,
    };

    let packet = match request.command.to_packet(conversation) {
        Ok(packet) => packet,
        Err(e) => {
            if let Some(id) = conversation {
                conn.conversations().close(id);
            }
            let _ = request.reply_tx.send(Err(SessionError::Codec(e)));
            return Ok(());
        }
    };

    tracing::debug!("Sending {:?} (conversation {:?})", request.command, conversation);
    conn.send(&packet).await?;

    pending.push_back(InFlight {
        command: request.command,
        conversation,
        attempts: 0,
        reply_tx: request.reply_tx,
    });
    Ok(())
}

/// Match an incoming packet to the request it answers
fn handle_reply<S>(
    conn: &mut Connection<S>,
    pending: &mut VecDeque<InFlight>,
    packet: Packet,
    state_tx: &watch::Sender<DeviceState>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(ty) = packet.packet_type() else {
        tracing::warn!("Ignoring packet of unrecognized type {:?}", packet.kind());
        return;
    };

    let index = match packet.conversation() {
        Some(id) => {
            if conn.conversations().accept(id, false).is_err() {
                // The reply already closed it
                if ty == PacketType::EndConversation {
                    tracing::trace!("END for finished conversation {}", id);
                } else {
                    tracing::warn!("Dropping {} for closed conversation {}", ty, id);
                }
                return;
            }
            if ty == PacketType::EndConversation {
                conn.conversations().close(id);
            }
            pending.iter().position(|p| p.conversation == Some(id))
        }
        None if pending.is_empty() => None,
        None => Some(0),
    };

    let Some(index) = index else {
        if ty != PacketType::EndConversation {
            tracing::warn!("Unsolicited {} from vehicle", ty);
        }
        return;
    };

    let result = match ty {
        PacketType::Acknowledge => interpret_ack(pending[index].command, &packet, state_tx),
        PacketType::Error => {
            let (code, message) = packet
                .error_details()
                .unwrap_or((0, "empty error payload".to_string()));
            Err(SessionError::Rejected { code, message })
        }
        PacketType::EndConversation => Err(SessionError::UnexpectedReply(
            "conversation ended without a reply".to_string(),
        )),
        other => {
            tracing::warn!("Vehicle sent request type {} to the station", other);
            return;
        }
    };

    if let Some(in_flight) = pending.remove(index) {
        // Vehicles need not send END after their reply
        if let Some(id) = in_flight.conversation {
            conn.conversations().close(id);
        }
        let _ = in_flight.reply_tx.send(result);
    }
}

fn interpret_ack(
    command: Command,
    packet: &Packet,
    state_tx: &watch::Sender<DeviceState>,
) -> SessionResult<Reply> {
    let payload = packet.payload();
    match command {
        Command::SetLight { channel, on } => {
            state_tx.send_modify(|state| state.set_light(channel, on));
            Ok(Reply::Done)
        }
        Command::GetLight { channel } => {
            let &value = payload
                .first()
                .ok_or_else(|| SessionError::UnexpectedReply("empty GET_LIGHT reply".to_string()))?;
            let on = value != 0;
            state_tx.send_modify(|state| state.set_light(channel, on));
            Ok(Reply::Light(on))
        }
        Command::SetThrottle(percent) => {
            state_tx.send_modify(|state| state.throttle = percent);
            Ok(Reply::Done)
        }
        Command::GetThrottle => {
            let &value = payload.first().ok_or_else(|| {
                SessionError::UnexpectedReply("empty GET_THROTTLE reply".to_string())
            })?;
            let percent = value as i8;
            state_tx.send_modify(|state| state.throttle = percent);
            Ok(Reply::Throttle(percent))
        }
        Command::EmergencyStop => {
            state_tx.send_modify(|state| state.throttle = 0);
            Ok(Reply::Done)
        }
    }
}
