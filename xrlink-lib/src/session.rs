//! Connection lifecycle of one pair of glasses.
//!
//! [`DeviceSession`] is a handle over an actor task that owns all mutable
//! session state. Link events, caller requests and timer expiries all arrive
//! on that task's mailboxes, so the state machine never runs concurrently
//! with itself.
//!
//! ```text
//! AVAILABLE -> CONNECTING -> PAIRING -> CONNECTED
//!                               |          |
//!                               +----------+--> DISCONNECTED
//! ```

use crate::command::{
    AckFrame, Command, CommandContext, ConnectSucceeded, RawCommand, RequestPhoneModel, ShowLongPress,
};
use crate::config::SessionConfig;
use crate::constants::{HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED, HANDSHAKE_RESPONSE_SIZE};
use crate::error::{Result, XrError};
use crate::executor::{CommandExecutor, CommandWriter, PendingCommand};
use crate::framer::BinaryPacketFramer;
use crate::link::{ChannelId, ChannelInfo, Link, LinkEvent};
use crate::telemetry::{self, TelemetrySample};
use crate::token::{DeviceToken, HandshakeToken, current_cloud_token};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize)]
pub enum ConnectionState {
    #[default]
    Available,
    Connecting,
    Pairing,
    Connected,
    Disconnected,
}

/// Notifications the glasses raise on their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceEvent {
    EnterAgent,
    LeaveAgent,
    LeaveNavigation,
    /// First-time pairing confirmed by the user. Persist the token to
    /// reconnect later with [`SessionConfig::with_retrieve_token`].
    Paired { user_id: u32, device_token: DeviceToken },
}

/// Verdict on a handshake channel read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResponse {
    Accepted(DeviceToken),
    Rejected,
    Malformed,
}

impl HandshakeResponse {
    pub fn classify(value: &[u8]) -> Self {
        if value.len() != HANDSHAKE_RESPONSE_SIZE {
            return HandshakeResponse::Malformed;
        }
        match value[0] {
            HANDSHAKE_ACCEPTED => {
                let mut token = [0u8; 4];
                token.copy_from_slice(&value[12..16]);
                HandshakeResponse::Accepted(token)
            }
            HANDSHAKE_REJECTED => HandshakeResponse::Rejected,
            _ => HandshakeResponse::Malformed,
        }
    }
}

const CANCEL_PAIRING: [[u8; 9]; 2] = [
    [0x4F, 0x42, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x1C],
    [0x4F, 0x42, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x14],
];
const PAIRING_PROMPT: [u8; 1] = [0x01];
const LONG_PRESS_CONFIRMED: [u8; 9] = [0x4F, 0x42, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00];
const PAIRING_RESULT: [u8; 4] = [0x45, 0x4D, 0x68, 0x00];
const ENTER_AGENT: [u8; 9] = [0x45, 0x4D, 0xCC, 0x00, 0x01, 0x00, 0x02, 0x00, 0x01];
const LEAVE_AGENT: [u8; 9] = [0x45, 0x4D, 0xCD, 0x00, 0x01, 0x00, 0x02, 0x00, 0x01];
const LEAVE_NAVIGATION: [u8; 8] = [0x45, 0x4D, 0x8F, 0x00, 0x12, 0x00, 0x24, 0x00];
const BATTERY_REPORT: [u8; 8] = [0x45, 0x4D, 0x10, 0x00, 0x02, 0x00, 0x04, 0x00];
const BATTERY_ACK: [u8; 8] = [0x4F, 0x42, 0x10, 0x00, 0x03, 0x00, 0x06, 0x00];

/// What a frame on the response channel means. Checked in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    CancelPairing,
    PairingPrompt,
    LongPressConfirmed,
    PairingResult { accepted: bool },
    Device(DeviceEvent),
    /// `ack` is set when the report also completes a battery read.
    Battery { level: u16, ack: bool },
    Ack,
    Unknown,
}

impl ResponseFrame {
    pub fn classify(value: &[u8]) -> Self {
        if CANCEL_PAIRING.iter().any(|p| value.starts_with(p)) {
            return ResponseFrame::CancelPairing;
        }
        if value == PAIRING_PROMPT {
            return ResponseFrame::PairingPrompt;
        }
        if value == LONG_PRESS_CONFIRMED {
            return ResponseFrame::LongPressConfirmed;
        }
        if value.len() == 9 && value.starts_with(&PAIRING_RESULT) {
            return ResponseFrame::PairingResult {
                accepted: value[8] == 0x01,
            };
        }
        if value.starts_with(&ENTER_AGENT) {
            return ResponseFrame::Device(DeviceEvent::EnterAgent);
        }
        if value.starts_with(&LEAVE_AGENT) {
            return ResponseFrame::Device(DeviceEvent::LeaveAgent);
        }
        if value.starts_with(&BATTERY_REPORT) || value.starts_with(&BATTERY_ACK) {
            if value.len() >= BATTERY_REPORT.len() + 2 {
                let n = value.len();
                return ResponseFrame::Battery {
                    level: u16::from_le_bytes([value[n - 2], value[n - 1]]),
                    ack: value.starts_with(&BATTERY_ACK),
                };
            }
            return ResponseFrame::Unknown;
        }
        if value.starts_with(&LEAVE_NAVIGATION) {
            return ResponseFrame::Device(DeviceEvent::LeaveNavigation);
        }
        if AckFrame::is_ack(value) {
            return ResponseFrame::Ack;
        }
        ResponseFrame::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Settle,
    HandshakeRead,
    HandshakeRetry,
    ShowLongPress,
    PhoneModel,
    ReturningPhoneModel,
}

enum Message {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Timer { generation: u64, timer: Timer },
    ReturningReady { generation: u64 },
    WriteFailed(String),
}

/// Writes executor payloads to the command channel, at most one write per
/// `min_interval`.
struct SessionWriter {
    link: Arc<dyn Link>,
    mtu: Arc<AtomicUsize>,
    writable: Arc<AtomicBool>,
    min_interval: Duration,
    last_write: tokio::sync::Mutex<Option<Instant>>,
    faults: mpsc::WeakUnboundedSender<Message>,
}

#[async_trait::async_trait]
impl CommandWriter for SessionWriter {
    async fn write_command(&self, payload: Bytes) -> Result<()> {
        if !self.writable.load(Ordering::Acquire) {
            return Err(XrError::NotConnected);
        }
        let mut last = self.last_write.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        debug!(bytes = %hex::encode(&payload), "write");
        let result = self.link.write(ChannelId::Write, payload).await;
        *last = Some(Instant::now());

        if let Err(e) = &result {
            if e.is_transport() {
                if let Some(faults) = self.faults.upgrade() {
                    let _ = faults.send(Message::WriteFailed(e.to_string()));
                }
            }
        }
        result
    }

    fn context(&self) -> CommandContext {
        CommandContext {
            mtu: self.mtu.load(Ordering::Relaxed),
        }
    }
}

struct Actor {
    link: Arc<dyn Link>,
    config: SessionConfig,
    executor: Arc<CommandExecutor>,
    writer: Arc<SessionWriter>,
    mtu: Arc<AtomicUsize>,
    writable: Arc<AtomicBool>,
    state: watch::Sender<ConnectionState>,
    battery: watch::Sender<Option<u16>>,
    telemetry: broadcast::Sender<TelemetrySample>,
    events: broadcast::Sender<DeviceEvent>,
    mailbox: mpsc::WeakUnboundedSender<Message>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,

    channels: BTreeSet<ChannelId>,
    descriptors: VecDeque<ChannelId>,
    handshake_started: bool,
    handshake_attempts: u32,
    device_token: Option<DeviceToken>,
    /// Set between a successful open and the next close or drop.
    link_open: bool,
    /// Bumped on every teardown; timers from older connections are ignored.
    generation: u64,
}

impl Actor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Message>, mut link_rx: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            tokio::select! {
                message = mailbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                Some(event) = link_rx.recv() => self.handle_link_event(event).await,
            }
        }
        trace!("session actor stopped");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            info!(from = %state, to = %next, "session state");
            *state = next;
            true
        });
        if !changed {
            trace!(state = %next, "state unchanged");
        }
    }

    fn schedule(&self, timer: Timer, delay: Duration) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(Message::Timer { generation, timer });
        });
    }

    /// Forgets everything tied to the current connection.
    fn cleanup(&mut self) {
        self.generation += 1;
        self.executor.clear();
        self.executor.abort_pending(XrError::LinkClosed);
        self.writable.store(false, Ordering::Release);
        self.channels.clear();
        self.descriptors.clear();
        self.handshake_started = false;
        self.handshake_attempts = 0;
        self.device_token = None;
    }

    async fn close_link(&mut self) {
        if let Err(e) = self.link.close().await {
            debug!(error = %e, "close failed");
        }
        self.link_open = false;
    }

    /// Closes the link and settles in `state`.
    async fn shutdown(&mut self, state: ConnectionState) {
        self.close_link().await;
        self.set_state(state);
        self.cleanup();
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Message::Disconnect(reply) => {
                self.shutdown(ConnectionState::Disconnected).await;
                let _ = reply.send(());
            }
            Message::Timer { generation, timer } => {
                if generation == self.generation {
                    self.handle_timer(timer).await;
                } else {
                    trace!(?timer, "stale timer");
                }
            }
            Message::ReturningReady { generation } => {
                if generation == self.generation {
                    self.set_state(ConnectionState::Connected);
                }
            }
            Message::WriteFailed(error) => {
                warn!(%error, "command write failed, dropping link");
                self.shutdown(ConnectionState::Disconnected).await;
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.link_open {
            debug!(state = %self.current(), "reconnecting, closing current link");
            self.close_link().await;
        }
        self.cleanup();
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.link.open(self.link_tx.clone()).await {
            warn!(error = %e, "open failed");
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        self.link_open = true;
        Ok(())
    }

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Settle => {
                if let Err(e) = self.link.discover_services().await {
                    self.link_failed("discover services", e).await;
                }
            }
            Timer::HandshakeRead => {
                if let Err(e) = self.link.read(ChannelId::Handshake).await {
                    self.link_failed("read handshake", e).await;
                }
            }
            Timer::HandshakeRetry => {
                self.handshake_attempts += 1;
                if self.handshake_attempts < self.config.max_handshake_attempts {
                    self.start_handshake().await;
                } else {
                    let error = XrError::HandshakeRejected {
                        attempts: self.handshake_attempts,
                    };
                    warn!(%error, "giving up");
                    self.shutdown(ConnectionState::Disconnected).await;
                }
            }
            Timer::ShowLongPress => {
                // Written directly; the glasses do not acknowledge the prompt.
                let result = match ShowLongPress.payload(&self.writer.context()) {
                    Ok(payload) => self.writer.write_command(payload).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "long-press prompt not sent");
                }
            }
            Timer::PhoneModel => {
                let _ = self.executor.enqueue(RequestPhoneModel);
            }
            Timer::ReturningPhoneModel => {
                let pending = self.executor.enqueue(RequestPhoneModel);
                let mailbox = self.mailbox.clone();
                let generation = self.generation;
                tokio::spawn(async move {
                    if let Err(e) = pending.await {
                        debug!(error = %e, "phone model request on reconnect");
                    }
                    if let Some(mailbox) = mailbox.upgrade() {
                        let _ = mailbox.send(Message::ReturningReady { generation });
                    }
                });
            }
        }
    }

    async fn link_failed(&mut self, operation: &'static str, error: XrError) {
        warn!(operation, %error, "link operation failed");
        self.shutdown(ConnectionState::Disconnected).await;
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                if self.current() != ConnectionState::Connecting {
                    trace!(state = %self.current(), "stale connect event");
                    return;
                }
                self.set_state(ConnectionState::Pairing);
                if let Err(e) = self.link.request_mtu(self.config.requested_mtu).await {
                    // Keep going at the default MTU.
                    warn!(error = %e, "mtu request failed");
                }
                self.schedule(Timer::Settle, self.config.settle_delay);
            }
            LinkEvent::Disconnected => {
                self.link_open = false;
                match self.current() {
                    ConnectionState::Available | ConnectionState::Disconnected => {
                        trace!("disconnect after teardown");
                    }
                    _ => {
                        info!("link dropped");
                        self.set_state(ConnectionState::Disconnected);
                        self.cleanup();
                    }
                }
            }
            LinkEvent::MtuChanged(mtu) => {
                debug!(mtu, "mtu negotiated");
                self.mtu.store(mtu.into(), Ordering::Relaxed);
            }
            LinkEvent::ServicesDiscovered(_) | LinkEvent::DescriptorWritten(_)
                if self.current() != ConnectionState::Pairing =>
            {
                trace!(state = %self.current(), ?event, "setup event outside pairing");
            }
            LinkEvent::ServicesDiscovered(channels) => self.services_discovered(channels).await,
            LinkEvent::DescriptorWritten(channel) => {
                trace!(%channel, "descriptor written");
                self.next_descriptor().await;
            }
            LinkEvent::FrameReceived(channel, value) => {
                trace!(%channel, bytes = %hex::encode(&value), "frame");
                match channel {
                    ChannelId::Handshake => self.handshake_response(&value).await,
                    ChannelId::Response => self.response_frame(value).await,
                    ChannelId::Telemetry => self.telemetry_frame(&value),
                    _ => trace!(%channel, "frame on unhandled channel"),
                }
            }
        }
    }

    async fn services_discovered(&mut self, channels: Vec<ChannelInfo>) {
        self.channels = channels.iter().map(|c| c.id).collect();
        self.writable
            .store(self.channels.contains(&ChannelId::Write), Ordering::Release);
        self.descriptors = channels.iter().filter(|c| c.notify).map(|c| c.id).collect();
        debug!(channels = self.channels.len(), subscriptions = self.descriptors.len(), "services discovered");
        self.next_descriptor().await;
    }

    /// Subscriptions go out one at a time; the handshake starts once the last is confirmed.
    async fn next_descriptor(&mut self) {
        match self.descriptors.pop_front() {
            Some(channel) => {
                if let Err(e) = self.link.write_descriptor(channel).await {
                    self.link_failed("write descriptor", e).await;
                }
            }
            None if !self.handshake_started => self.start_handshake().await,
            None => {}
        }
    }

    async fn start_handshake(&mut self) {
        if !self.channels.contains(&ChannelId::Handshake) {
            warn!("no handshake channel");
            self.shutdown(ConnectionState::Disconnected).await;
            return;
        }
        self.handshake_started = true;

        let token = match self.config.retrieve_token {
            Some(device_token) => HandshakeToken::retrieve(self.config.user_id, device_token),
            None => HandshakeToken::connection(self.config.user_id, current_cloud_token()),
        };
        debug!(attempt = self.handshake_attempts + 1, %token, "handshake");
        let token = Bytes::copy_from_slice(token.as_bytes());
        if let Err(e) = self.link.write(ChannelId::Handshake, token).await {
            self.link_failed("write handshake", e).await;
            return;
        }
        self.schedule(Timer::HandshakeRead, self.config.handshake_read_delay);
    }

    async fn handshake_response(&mut self, value: &[u8]) {
        match HandshakeResponse::classify(value) {
            HandshakeResponse::Accepted(token) => {
                info!(token = %hex::encode(token), "handshake accepted");
                self.device_token = Some(token);
                if let Err(e) = self.link.write_descriptor(ChannelId::Response).await {
                    self.link_failed("subscribe responses", e).await;
                }
            }
            HandshakeResponse::Rejected => {
                warn!(attempt = self.handshake_attempts + 1, "handshake rejected");
                self.schedule(Timer::HandshakeRetry, self.config.handshake_retry_delay);
            }
            HandshakeResponse::Malformed => {
                let error = XrError::HandshakeMalformed {
                    len: value.len(),
                    first: value.first().copied().unwrap_or(0),
                };
                warn!(%error, attempt = self.handshake_attempts + 1, "handshake");
                self.schedule(Timer::HandshakeRetry, self.config.handshake_retry_delay);
            }
        }
    }

    async fn response_frame(&mut self, value: Bytes) {
        if !self.channels.contains(&ChannelId::Write) {
            return;
        }
        match ResponseFrame::classify(&value) {
            ResponseFrame::CancelPairing => {
                info!("pairing cancelled on the glasses");
                self.shutdown(ConnectionState::Available).await;
            }
            ResponseFrame::PairingPrompt => {
                if self.config.is_returning_device() {
                    self.schedule(Timer::ReturningPhoneModel, self.config.pairing_reply_delay);
                } else {
                    self.set_state(ConnectionState::Pairing);
                    self.schedule(Timer::ShowLongPress, self.config.pairing_reply_delay);
                }
            }
            ResponseFrame::LongPressConfirmed => {
                let _ = self.executor.enqueue(RequestPhoneModel);
            }
            ResponseFrame::PairingResult { accepted } => {
                let _ = self.executor.enqueue(ConnectSucceeded);
                self.schedule(Timer::PhoneModel, self.config.phone_model_delay);
                if accepted {
                    if let Some(device_token) = self.device_token {
                        let _ = self.events.send(DeviceEvent::Paired {
                            user_id: self.config.user_id,
                            device_token,
                        });
                    }
                    self.set_state(ConnectionState::Connected);
                } else {
                    info!("pairing declined");
                    self.set_state(ConnectionState::Available);
                }
            }
            ResponseFrame::Device(event) => {
                debug!(?event, "device event");
                let _ = self.events.send(event);
            }
            ResponseFrame::Battery { level, ack } => {
                debug!(level, "battery");
                self.battery.send_replace(Some(level));
                if ack {
                    self.executor.signal_response(value);
                }
            }
            ResponseFrame::Ack => {
                self.executor.signal_response(value);
            }
            ResponseFrame::Unknown => {
                debug!(bytes = %hex::encode(&value), "unrecognized response frame");
            }
        }
    }

    fn telemetry_frame(&self, value: &[u8]) {
        match telemetry::parse_frame(value) {
            Ok(samples) => {
                for sample in samples {
                    // No subscribers is fine.
                    let _ = self.telemetry.send(sample);
                }
            }
            Err(e) => warn!(error = %e, "bad telemetry frame"),
        }
    }
}

struct Inner {
    address: String,
    config: SessionConfig,
    mtu: Arc<AtomicUsize>,
    executor: Arc<CommandExecutor>,
    mailbox: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
    battery: watch::Receiver<Option<u16>>,
    telemetry: broadcast::Sender<TelemetrySample>,
    events: broadcast::Sender<DeviceEvent>,
    actor: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.actor.abort();
    }
}

/// Handle to one accessory. Clones share the same session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl DeviceSession {
    /// Spawns the session on the current tokio runtime. Nothing touches the
    /// link until [`connect`](Self::connect).
    pub fn new(address: impl Into<String>, link: Arc<dyn Link>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let address = address.into();

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Available);
        let (battery_tx, battery_rx) = watch::channel(None);
        let (telemetry_tx, _) = broadcast::channel(config.telemetry_capacity);
        let (events_tx, _) = broadcast::channel(32);

        let mtu = Arc::new(AtomicUsize::new(crate::constants::DEFAULT_MTU));
        let writable = Arc::new(AtomicBool::new(false));
        let writer = Arc::new(SessionWriter {
            link: link.clone(),
            mtu: mtu.clone(),
            writable: writable.clone(),
            min_interval: config.min_write_interval,
            last_write: tokio::sync::Mutex::new(None),
            faults: mailbox_tx.downgrade(),
        });
        let executor = Arc::new(CommandExecutor::spawn(writer.clone(), config.command_timeout));

        let actor = Actor {
            link,
            config: config.clone(),
            executor: executor.clone(),
            writer,
            mtu: mtu.clone(),
            writable,
            state: state_tx,
            battery: battery_tx,
            telemetry: telemetry_tx.clone(),
            events: events_tx.clone(),
            mailbox: mailbox_tx.downgrade(),
            link_tx,
            channels: BTreeSet::new(),
            descriptors: VecDeque::new(),
            handshake_started: false,
            handshake_attempts: 0,
            device_token: None,
            link_open: false,
            generation: 0,
        };
        let actor = tokio::spawn(actor.run(mailbox_rx, link_rx));
        debug!(%address, "session created");

        Ok(Self {
            inner: Arc::new(Inner {
                address,
                config,
                mtu,
                executor,
                mailbox: mailbox_tx,
                state: state_rx,
                battery: battery_rx,
                telemetry: telemetry_tx,
                events: events_tx,
                actor,
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Starts connecting. Progress is observable through [`state`](Self::state).
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .mailbox
            .send(Message::Connect(tx))
            .map_err(|_| XrError::LinkClosed)?;
        rx.await.map_err(|_| XrError::LinkClosed)?
    }

    /// Closes the link and enters DISCONNECTED. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .mailbox
            .send(Message::Disconnect(tx))
            .map_err(|_| XrError::LinkClosed)?;
        rx.await.map_err(|_| XrError::LinkClosed)
    }

    /// Queues `command` behind everything already submitted.
    pub fn enqueue<C: Command>(&self, command: C) -> PendingCommand<C::Output> {
        self.inner.executor.enqueue(command)
    }

    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.inner.executor.execute(command).await
    }

    /// Writes a pre-built frame through the command queue.
    pub async fn send_raw(&self, frame: impl Into<Bytes>) -> Result<()> {
        self.execute(RawCommand::new("Raw", frame)).await
    }

    /// Frames `inner` for the current MTU and queues one command per frame.
    pub fn send_binary(
        &self,
        bin_type: u8,
        inner: &[u8],
        reserved: Option<[u32; 4]>,
    ) -> Result<Vec<PendingCommand<()>>> {
        let framer = BinaryPacketFramer::new(self.mtu())?;
        Ok(framer
            .build(bin_type, inner, reserved)
            .into_iter()
            .map(|frame| self.enqueue(RawCommand::new("BinaryPacket", frame)))
            .collect())
    }

    /// Drops queued commands that have not started.
    pub fn clear_commands(&self) -> usize {
        self.inner.executor.clear()
    }

    pub fn mtu(&self) -> usize {
        self.inner.mtu.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.inner.state.clone())
    }

    /// Waits until the state satisfies `predicate` and returns that state.
    pub async fn wait_for_state(&self, mut predicate: impl FnMut(ConnectionState) -> bool) -> Result<ConnectionState> {
        let mut rx = self.inner.state.clone();
        let state = rx
            .wait_for(|s| predicate(*s))
            .await
            .map_err(|_| XrError::LinkClosed)?;
        Ok(*state)
    }

    /// Live sensor samples. A slow consumer loses the oldest samples.
    pub fn telemetry(&self) -> impl Stream<Item = TelemetrySample> + Send + 'static {
        BroadcastStream::new(self.inner.telemetry.subscribe()).filter_map(|item| match item {
            Ok(sample) => Some(sample),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "telemetry consumer lagging");
                None
            }
        })
    }

    /// Latest reported battery level.
    pub fn battery(&self) -> watch::Receiver<Option<u16>> {
        self.inner.battery.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.inner.address)
            .field("state", &self.current_state())
            .finish()
    }
}

/// Sessions by device address, owned by the application.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the session previously registered under the same address.
    pub fn insert(&self, session: DeviceSession) -> Option<DeviceSession> {
        self.sessions().insert(session.address().to_string(), session)
    }

    pub fn get(&self, address: &str) -> Option<DeviceSession> {
        self.sessions().get(address).cloned()
    }

    pub fn remove(&self, address: &str) -> Option<DeviceSession> {
        self.sessions().remove(address)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Disconnects every registered session concurrently.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions().values().cloned().collect();
        let results = futures::future::join_all(sessions.iter().map(|s| s.disconnect())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                debug!(address = session.address(), error = %e, "disconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hex: &str) -> Vec<u8> {
        hex::decode(hex).unwrap()
    }

    #[test]
    fn test_handshake_classification() {
        let mut accepted = vec![0u8; 18];
        accepted[0] = 0x64;
        accepted[12..16].copy_from_slice(&[0xA1, 0xB2, 0xC3, 0xD4]);
        assert_eq!(
            HandshakeResponse::classify(&accepted),
            HandshakeResponse::Accepted([0xA1, 0xB2, 0xC3, 0xD4])
        );

        let mut rejected = vec![0u8; 18];
        rejected[0] = 0x01;
        assert_eq!(HandshakeResponse::classify(&rejected), HandshakeResponse::Rejected);

        assert_eq!(HandshakeResponse::classify(&accepted[..17]), HandshakeResponse::Malformed);
        assert_eq!(HandshakeResponse::classify(&[0x02; 18]), HandshakeResponse::Malformed);
        assert_eq!(HandshakeResponse::classify(&[]), HandshakeResponse::Malformed);
    }

    #[test]
    fn test_pairing_frames() {
        assert_eq!(ResponseFrame::classify(&[0x01]), ResponseFrame::PairingPrompt);
        assert_eq!(
            ResponseFrame::classify(&frame("4f4200000100020000")),
            ResponseFrame::LongPressConfirmed
        );
        assert_eq!(
            ResponseFrame::classify(&frame("454d6800010002001c")),
            ResponseFrame::PairingResult { accepted: false }
        );
        assert_eq!(
            ResponseFrame::classify(&frame("454d68000100020001")),
            ResponseFrame::PairingResult { accepted: true }
        );
        assert_eq!(ResponseFrame::classify(&frame("4f420000010002001c")), ResponseFrame::CancelPairing);
        assert_eq!(ResponseFrame::classify(&frame("4f4200000100020014ff")), ResponseFrame::CancelPairing);
    }

    #[test]
    fn test_device_and_battery_frames() {
        assert_eq!(
            ResponseFrame::classify(&frame("454dcc000100020001")),
            ResponseFrame::Device(DeviceEvent::EnterAgent)
        );
        assert_eq!(
            ResponseFrame::classify(&frame("454dcd000100020001")),
            ResponseFrame::Device(DeviceEvent::LeaveAgent)
        );
        assert_eq!(
            ResponseFrame::classify(&frame("454d8f001200240000")),
            ResponseFrame::Device(DeviceEvent::LeaveNavigation)
        );
        assert_eq!(
            ResponseFrame::classify(&frame("454d1000020004005a00")),
            ResponseFrame::Battery { level: 90, ack: false }
        );
        assert_eq!(
            ResponseFrame::classify(&frame("4f42100003000600004b00")),
            ResponseFrame::Battery { level: 75, ack: true }
        );
        assert_eq!(ResponseFrame::classify(&frame("454d100002000400")), ResponseFrame::Unknown);
    }

    #[test]
    fn test_acks_and_noise() {
        assert_eq!(ResponseFrame::classify(&frame("4f4222000200040000")), ResponseFrame::Ack);
        assert_eq!(ResponseFrame::classify(&frame("4f42")), ResponseFrame::Ack);
        assert_eq!(ResponseFrame::classify(&frame("454d2200")), ResponseFrame::Unknown);
        assert_eq!(ResponseFrame::classify(&[0x02]), ResponseFrame::Unknown);
    }
}
