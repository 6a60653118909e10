//! The control stream of a connection.
//!
//! The channel announces the client, answers platform heartbeats, drives the
//! client side heartbeat monitor and correlates acknowledgements of awaitable
//! instructions. A stream that fails with a retryable error asks the owning
//! connection to reconnect; the connection reconnects the channel once a new
//! transport is in place.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::actor::{mailbox, Actor, ActorRef, Observe, Receive};
use crate::backoff::ScheduleDue;
use crate::connection::ConnectionOwner;
use crate::error::{ConnectorError, ErrorCategory, PlatformError, Result, TransportError};
use crate::heartbeat::{HeartbeatChannel, HeartbeatMonitor, HeartbeatStatus, InstructionWriter, MissedHandler};
use crate::ids::{ClientIdentity, Context, InstructionId};
use crate::scheduler::Scheduler;
use crate::transport::{ControlStream, PlatformTransport, Pump, TransportProxy};
use crate::wire::{
    InstructionAck, PlatformInbound, PlatformInboundRequest, PlatformOutbound,
    PlatformOutboundRequest,
};

type Reply = oneshot::Sender<Result<()>>;

enum Message {
    Connect,
    Reconnect,
    Disconnect,
    OpenStream,
    StreamOpened(Result<ControlStream, TransportError>),
    Received {
        generation: u64,
        frame: Result<PlatformOutbound, TransportError>,
    },
    Send(PlatformInbound),
    SendAwaitable { instruction: PlatformInbound, reply: Reply },
    OnConnected,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Reconnect => f.write_str("Reconnect"),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::OpenStream => f.write_str("OpenStream"),
            Self::StreamOpened(result) => f
                .debug_tuple("StreamOpened")
                .field(&result.as_ref().map(|_| "stream"))
                .finish(),
            Self::Received { generation, frame } => f
                .debug_struct("Received")
                .field("generation", generation)
                .field("frame", frame)
                .finish(),
            Self::Send(instruction) => f.debug_tuple("Send").field(instruction).finish(),
            Self::SendAwaitable { instruction, .. } => {
                f.debug_tuple("SendAwaitable").field(instruction).finish()
            }
            Self::OnConnected => f.write_str("OnConnected"),
        }
    }
}

/// Lifecycle of a channel stream as seen from outside the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
    Faulted,
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Opening { reconnecting: bool },
    Connected {
        tx: mpsc::UnboundedSender<PlatformInbound>,
        _pump: Pump,
        awaited: HashMap<InstructionId, Reply>,
    },
    Faulted,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    generation: u64,
}

impl Observe for State {
    type View = ChannelStatus;

    fn observe(&self) -> ChannelStatus {
        match &self.phase {
            Phase::Disconnected => ChannelStatus::Disconnected,
            Phase::Opening { reconnecting: false } => ChannelStatus::Connecting,
            Phase::Opening { reconnecting: true } => ChannelStatus::Reconnecting,
            Phase::Connected { .. } => ChannelStatus::Connected,
            Phase::Faulted => ChannelStatus::Faulted,
        }
    }
}

struct Receiver {
    context: Context,
    client_identity: ClientIdentity,
    transport: TransportProxy,
    owner: Arc<dyn ConnectionOwner>,
    monitor: Arc<HeartbeatMonitor>,
    heartbeats: Arc<HeartbeatChannel>,
    connected: Arc<AtomicBool>,
    mailbox: ActorRef<Message>,
}

impl Receiver {
    fn open_stream(&self) {
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let cancel = self.mailbox.cancellation().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = transport.open_control_stream() => {
                    let _ = mailbox.tell(Message::StreamOpened(result));
                }
            }
        });
    }

    fn retry_open(&self, error: &TransportError) {
        let due = ScheduleDue::from_error(error);
        log::warn!(
            "control({}): failed to open stream: {}, retrying in {:?}",
            self.context,
            error,
            due
        );
        if let Err(e) = self.mailbox.schedule(Message::OpenStream, due) {
            log::debug!("control({}): could not schedule stream retry: {}", self.context, e);
        }
    }

    /// Announces the client on a fresh stream and starts consuming it.
    fn announce(&self, stream: ControlStream, generation: u64) -> std::result::Result<Phase, TransportError> {
        let register = PlatformInbound {
            instruction_id: InstructionId::new().to_string(),
            request: PlatformInboundRequest::Register(self.client_identity.to_identification()),
        };
        stream.tx.send(register).map_err(|_| TransportError::Closed)?;

        let mailbox = self.mailbox.clone();
        let pump = Pump::spawn(stream.rx, self.mailbox.cancellation(), move |frame| {
            mailbox.tell(Message::Received { generation, frame }).is_ok()
        });
        Ok(Phase::Connected {
            tx: stream.tx,
            _pump: pump,
            awaited: HashMap::new(),
        })
    }

    fn unavailable(&self, message: &str) -> ConnectorError {
        PlatformError::new(
            self.client_identity.clone(),
            ErrorCategory::InstructionAckError,
            message,
        )
        .into()
    }

    fn fail_awaited(&self, awaited: HashMap<InstructionId, Reply>, error: &ConnectorError) {
        for (_, reply) in awaited {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn receive_frame(
        &self,
        frame: PlatformOutbound,
        tx: &mpsc::UnboundedSender<PlatformInbound>,
        awaited: &mut HashMap<InstructionId, Reply>,
    ) {
        match frame.request {
            PlatformOutboundRequest::RequestReconnect => {
                log::info!("control({}): platform requested a reconnect", self.context);
                self.owner.reconnect();
            }
            PlatformOutboundRequest::Heartbeat => {
                if let Err(e) = self.monitor.receive_server_heartbeat() {
                    log::debug!("control({}): heartbeat monitor is gone: {}", self.context, e);
                }
                let answer = PlatformInbound {
                    instruction_id: String::new(),
                    request: PlatformInboundRequest::Heartbeat,
                };
                if tx.send(answer).is_err() {
                    log::warn!("control({}): failed to answer platform heartbeat", self.context);
                }
            }
            PlatformOutboundRequest::Ack(ack) => self.receive_ack(ack, awaited),
        }
    }

    fn receive_ack(&self, ack: InstructionAck, awaited: &mut HashMap<InstructionId, Reply>) {
        let reply = InstructionId::parse(ack.instruction_id.clone()).and_then(|id| awaited.remove(&id));
        match reply {
            Some(reply) => {
                let outcome = if ack.success {
                    Ok(())
                } else {
                    let error = ack.error.unwrap_or_default();
                    Err(PlatformError::from_error_message(self.client_identity.clone(), &error).into())
                };
                let _ = reply.send(outcome);
            }
            None => {
                if let Err(e) = self.heartbeats.receive(ack) {
                    log::debug!("control({}): heartbeat channel is gone: {}", self.context, e);
                }
            }
        }
    }
}

#[async_trait]
impl Receive<Message, State> for Receiver {
    async fn receive(&self, message: Message, mut state: State) -> State {
        let phase = std::mem::replace(&mut state.phase, Phase::Disconnected);
        let next = match (message, phase) {
            (message @ (Message::Connect | Message::Reconnect), Phase::Disconnected) => {
                if let Err(e) = self.mailbox.tell(Message::OpenStream) {
                    log::debug!("control({}): {}", self.context, e);
                }
                Phase::Opening {
                    reconnecting: matches!(message, Message::Reconnect),
                }
            }

            (Message::OpenStream, phase @ Phase::Opening { .. }) => {
                self.open_stream();
                phase
            }

            (Message::StreamOpened(Ok(stream)), Phase::Opening { reconnecting }) => {
                state.generation += 1;
                match self.announce(stream, state.generation) {
                    Ok(connected) => {
                        log::info!("control({}): client announced", self.context);
                        self.set_connected(true);
                        if let Err(e) = self.monitor.resume() {
                            log::debug!("control({}): heartbeat monitor is gone: {}", self.context, e);
                        }
                        if let Err(e) = self.mailbox.tell(Message::OnConnected) {
                            log::debug!("control({}): {}", self.context, e);
                        }
                        connected
                    }
                    Err(e) => {
                        self.retry_open(&e);
                        Phase::Opening { reconnecting }
                    }
                }
            }

            (Message::StreamOpened(Err(e)), phase @ Phase::Opening { .. }) => {
                self.retry_open(&e);
                phase
            }

            (Message::Disconnect, Phase::Connected { awaited, .. }) => {
                self.set_connected(false);
                self.fail_awaited(awaited, &ConnectorError::Cancelled);
                Phase::Disconnected
            }

            (Message::Disconnect, _) => Phase::Disconnected,

            (Message::Send(instruction), Phase::Connected { tx, _pump, awaited }) => {
                if tx.send(instruction.clone()).is_err() {
                    let due = ScheduleDue::from_error(&TransportError::Closed);
                    log::error!(
                        "control({}): unable to send instruction {:?}, reconnecting in {:?}",
                        self.context,
                        instruction,
                        due
                    );
                    if let Err(e) = self.mailbox.schedule(Message::Reconnect, due) {
                        log::debug!("control({}): {}", self.context, e);
                    }
                }
                Phase::Connected { tx, _pump, awaited }
            }

            (Message::Send(instruction), phase) => {
                log::warn!(
                    "control({}): unable to send instruction {:?}: no connection to AxonServer",
                    self.context,
                    instruction
                );
                phase
            }

            (
                Message::SendAwaitable { instruction, reply },
                Phase::Connected {
                    tx,
                    _pump,
                    mut awaited,
                },
            ) => {
                let instruction_id = InstructionId::parse(instruction.instruction_id.clone());
                if tx.send(instruction).is_err() {
                    let _ = reply.send(Err(self.unavailable("Unable to send instruction: AxonServer unavailable")));
                } else {
                    match instruction_id {
                        Some(id) => {
                            awaited.insert(id, reply);
                        }
                        None => {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                Phase::Connected { tx, _pump, awaited }
            }

            (Message::SendAwaitable { reply, .. }, phase) => {
                let _ = reply.send(Err(self.unavailable("Unable to send instruction: no connection to AxonServer")));
                phase
            }

            (Message::Received { generation, frame }, Phase::Connected { tx, _pump, mut awaited })
                if generation == state.generation =>
            {
                match frame {
                    Ok(frame) => {
                        self.receive_frame(frame, &tx, &mut awaited);
                        Phase::Connected { tx, _pump, awaited }
                    }
                    Err(e) => {
                        self.set_connected(false);
                        if let Err(e) = self.monitor.pause() {
                            log::debug!("control({}): heartbeat monitor is gone: {}", self.context, e);
                        }
                        if e.requires_reconnect() {
                            log::warn!("control({}): stream failed: {}, reconnecting", self.context, e);
                            self.owner.reconnect();
                        } else {
                            log::error!(
                                "control({}): {} remains unhandled and did not cause a reconnect",
                                self.context,
                                e
                            );
                        }
                        self.fail_awaited(awaited, &ConnectorError::Transport(e));
                        Phase::Faulted
                    }
                }
            }

            (Message::Received { generation, .. }, phase) if generation != state.generation => {
                log::debug!(
                    "control({}): dropped frame of stream {} (current {})",
                    self.context,
                    generation,
                    state.generation
                );
                phase
            }

            (Message::Reconnect, Phase::Connected { awaited, .. }) => {
                self.set_connected(false);
                self.fail_awaited(
                    awaited,
                    &ConnectorError::unavailable("control stream is reconnecting"),
                );
                if let Err(e) = self.monitor.pause() {
                    log::debug!("control({}): heartbeat monitor is gone: {}", self.context, e);
                }
                if let Err(e) = self.mailbox.tell(Message::OpenStream) {
                    log::debug!("control({}): {}", self.context, e);
                }
                Phase::Opening { reconnecting: true }
            }

            (message @ (Message::Connect | Message::Reconnect), Phase::Faulted) => {
                if let Err(e) = self.mailbox.tell(Message::OpenStream) {
                    log::debug!("control({}): {}", self.context, e);
                }
                Phase::Opening {
                    reconnecting: matches!(message, Message::Reconnect),
                }
            }

            (Message::Connect, phase @ Phase::Connected { .. })
            | (Message::Connect | Message::Reconnect, phase @ Phase::Opening { .. }) => {
                log::debug!("control({}): stream is already opening or open", self.context);
                phase
            }

            (Message::OnConnected, phase @ Phase::Connected { .. }) => {
                self.owner.check_readiness();
                phase
            }

            (message, phase) => {
                log::warn!("control({}): skipped {:?} in {:?}", self.context, message, phase);
                phase
            }
        };
        state.phase = next;
        state
    }
}

/// Control stream of one connection, with the heartbeat machinery attached.
pub struct ControlChannel {
    actor: Actor<Message, State>,
    monitor: Arc<HeartbeatMonitor>,
    heartbeats: Arc<HeartbeatChannel>,
    connected: Arc<AtomicBool>,
}

impl ControlChannel {
    pub(crate) fn new(
        context: Context,
        client_identity: ClientIdentity,
        transport: TransportProxy,
        owner: Arc<dyn ConnectionOwner>,
        heartbeat_purge_interval: Duration,
        scheduler: &Scheduler,
    ) -> Self {
        let (mailbox, inbox) = mailbox("control-channel", scheduler);

        let writer_mailbox = mailbox.clone();
        let writer: InstructionWriter =
            Arc::new(move |instruction| writer_mailbox.tell(Message::Send(instruction)));
        let heartbeats = Arc::new(HeartbeatChannel::new(
            context.clone(),
            writer,
            heartbeat_purge_interval,
            scheduler,
        ));

        let missed_owner = owner.clone();
        let on_missed: MissedHandler = Arc::new(move || missed_owner.reconnect());
        let monitor = Arc::new(HeartbeatMonitor::new(
            context.clone(),
            heartbeats.clone(),
            on_missed,
            scheduler,
        ));

        let connected = Arc::new(AtomicBool::new(false));
        let receiver = Receiver {
            context,
            client_identity,
            transport,
            owner,
            monitor: monitor.clone(),
            heartbeats: heartbeats.clone(),
            connected: connected.clone(),
            mailbox: mailbox.clone(),
        };
        let initial = State {
            phase: Phase::Disconnected,
            generation: 0,
        };
        Self {
            actor: Actor::spawn(mailbox, inbox, receiver, initial),
            monitor,
            heartbeats,
            connected,
        }
    }

    pub(crate) fn connect(&self) -> Result<()> {
        self.actor.tell(Message::Connect)
    }

    pub(crate) fn reconnect(&self) -> Result<()> {
        self.actor.tell(Message::Reconnect)
    }

    pub(crate) fn disconnect(&self) -> Result<()> {
        self.actor.tell(Message::Disconnect)
    }

    /// Writes `instruction` without waiting for an acknowledgement.
    pub fn send_instruction(&self, instruction: PlatformInbound) -> Result<()> {
        self.actor.tell(Message::Send(instruction))
    }

    /// Writes `instruction` and resolves when the platform acknowledges it.
    /// Instructions without an instruction id resolve once written.
    pub async fn send_awaitable(&self, instruction: PlatformInbound) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.actor.tell(Message::SendAwaitable { instruction, reply })?;
        outcome.await.map_err(|_| ConnectorError::Cancelled)?
    }

    pub fn enable_heartbeat(&self, interval: Duration, timeout: Duration) -> Result<()> {
        self.monitor.enable(interval, timeout)?;
        if !self.is_connected() {
            self.monitor.pause()?;
        }
        Ok(())
    }

    pub fn disable_heartbeat(&self) -> Result<()> {
        self.monitor.disable()
    }

    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        self.monitor.status()
    }

    pub fn status(&self) -> ChannelStatus {
        self.actor.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn dispose(&self) {
        self.monitor.dispose().await;
        self.heartbeats.dispose().await;
        self.actor.dispose().await;
        self.connected.store(false, Ordering::Release);
    }
}
