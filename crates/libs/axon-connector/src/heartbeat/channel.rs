use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{InstructionWriter, Responder, SendHeartbeat};
use crate::actor::{mailbox, Actor, ActorRef, Observe, Receive};
use crate::error::Result;
use crate::ids::{Context, InstructionId};
use crate::scheduler::Scheduler;
use crate::wire::{InstructionAck, PlatformInbound, PlatformInboundRequest};

pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

enum Message {
    Send { responder: Responder, timeout: Duration },
    Receive(InstructionAck),
    Purge,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send { timeout, .. } => f.debug_struct("Send").field("timeout", timeout).finish(),
            Self::Receive(ack) => f.debug_tuple("Receive").field(ack).finish(),
            Self::Purge => f.write_str("Purge"),
        }
    }
}

struct Outstanding {
    responder: Responder,
    expires_at: Instant,
}

impl fmt::Debug for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outstanding")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct State {
    outstanding: HashMap<InstructionId, Outstanding>,
    purge_armed: bool,
}

impl Observe for State {
    type View = usize;

    fn observe(&self) -> usize {
        self.outstanding.len()
    }
}

struct Receiver {
    context: Context,
    writer: InstructionWriter,
    purge_interval: Duration,
    mailbox: ActorRef<Message>,
}

impl Receiver {
    fn arm_purge(&self, state: &mut State) {
        if state.purge_armed || state.outstanding.is_empty() {
            return;
        }
        match self.mailbox.schedule(Message::Purge, self.purge_interval) {
            Ok(()) => state.purge_armed = true,
            Err(e) => log::debug!("heartbeat({}): could not arm purge: {}", self.context, e),
        }
    }
}

#[async_trait]
impl Receive<Message, State> for Receiver {
    async fn receive(&self, message: Message, mut state: State) -> State {
        match message {
            Message::Send { responder, timeout } => {
                let instruction_id = InstructionId::new();
                let instruction = PlatformInbound {
                    instruction_id: instruction_id.to_string(),
                    request: PlatformInboundRequest::Heartbeat,
                };
                match (self.writer)(instruction) {
                    Ok(()) => {
                        state.outstanding.insert(
                            instruction_id,
                            Outstanding {
                                responder,
                                expires_at: Instant::now() + timeout,
                            },
                        );
                        self.arm_purge(&mut state);
                    }
                    Err(e) => {
                        log::warn!("heartbeat({}): failed to send heartbeat: {}", self.context, e);
                    }
                }
            }
            Message::Receive(ack) => {
                let outstanding = InstructionId::parse(ack.instruction_id.clone())
                    .and_then(|id| state.outstanding.remove(&id));
                match outstanding {
                    Some(outstanding) => (outstanding.responder)(ack),
                    None => log::debug!(
                        "heartbeat({}): no outstanding heartbeat for ack {}",
                        self.context,
                        ack.instruction_id
                    ),
                }
            }
            Message::Purge => {
                state.purge_armed = false;
                let now = Instant::now();
                let before = state.outstanding.len();
                state.outstanding.retain(|id, outstanding| {
                    let keep = outstanding.expires_at >= now;
                    if !keep {
                        log::info!("heartbeat({}): purged unanswered heartbeat {}", self.context, id);
                    }
                    keep
                });
                log::debug!(
                    "heartbeat({}): purged {} of {} outstanding heartbeats",
                    self.context,
                    before - state.outstanding.len(),
                    before
                );
                self.arm_purge(&mut state);
            }
        }
        state
    }
}

/// Sends heartbeat probes and hands their acknowledgements to the responders.
///
/// Acknowledgements that arrive after a probe's timeout are still delivered
/// until the next purge removes the probe.
pub struct HeartbeatChannel {
    actor: Actor<Message, State>,
}

impl HeartbeatChannel {
    pub fn new(
        context: Context,
        writer: InstructionWriter,
        purge_interval: Duration,
        scheduler: &Scheduler,
    ) -> Self {
        let (mailbox, inbox) = mailbox("heartbeat-channel", scheduler);
        let receiver = Receiver {
            context,
            writer,
            purge_interval,
            mailbox: mailbox.clone(),
        };
        Self {
            actor: Actor::spawn(mailbox, inbox, receiver, State::default()),
        }
    }

    pub fn send(&self, responder: Responder, timeout: Duration) -> Result<()> {
        self.actor.tell(Message::Send { responder, timeout })
    }

    pub fn receive(&self, ack: InstructionAck) -> Result<()> {
        self.actor.tell(Message::Receive(ack))
    }

    /// Number of probes still waiting for an acknowledgement.
    pub fn outstanding(&self) -> usize {
        self.actor.state()
    }

    pub async fn dispose(&self) {
        self.actor.dispose().await;
    }
}

impl SendHeartbeat for HeartbeatChannel {
    fn send_heartbeat(&self, responder: Responder, timeout: Duration) -> Result<()> {
        self.send(responder, timeout)
    }
}
