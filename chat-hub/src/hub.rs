//! Membership and fan-out coordinator.
//!
//! The hub task is the only owner of the membership set. Sessions reach it
//! through a [`HubHandle`], which feeds three channels:
//!
//! - **join** registers a member, then announces it and publishes a roster
//! - **leave** removes a member, then tells the remaining members
//! - **broadcast** delivers a message to everyone currently registered
//!
//! The loop takes one event at a time and finishes every send it causes
//! before it looks at the next one. A roster can therefore never mention a
//! member whose leave was already processed, and a chat only reaches the
//! members present when it was taken off the channel.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{message::Message, session::SessionId};

/// Pending events buffered per channel before callers wait for the hub.
const EVENT_BUFFER: usize = 64;

/// A registered participant as seen by the hub.
///
/// `outbound` is the write side of the member's connection. Sending waits
/// while the connection's buffer is full.
#[derive(Debug)]
pub struct Member {
    pub id: SessionId,
    pub name: String,
    pub outbound: mpsc::Sender<Message>,
}

/// An event plus the signal fired once the hub has fully processed it.
struct Event<T> {
    payload: T,
    done: oneshot::Sender<()>,
}

/// Cloneable entry point to a running hub.
///
/// Each method returns after the hub has processed the event, so a caller
/// that joins and then broadcasts sees its join applied first.
#[derive(Debug, Clone)]
pub struct HubHandle {
    join_tx: mpsc::Sender<Event<Member>>,
    leave_tx: mpsc::Sender<Event<SessionId>>,
    broadcast_tx: mpsc::Sender<Event<Message>>,
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Event")
    }
}

impl HubHandle {
    pub async fn join(&self, member: Member) -> Result<()> {
        submit(&self.join_tx, member).await.context("join")
    }

    pub async fn leave(&self, id: SessionId) -> Result<()> {
        submit(&self.leave_tx, id).await.context("leave")
    }

    pub async fn broadcast(&self, message: Message) -> Result<()> {
        submit(&self.broadcast_tx, message).await.context("broadcast")
    }
}

async fn submit<T>(tx: &mpsc::Sender<Event<T>>, payload: T) -> Result<()> {
    let (done, processed) = oneshot::channel();
    if tx.send(Event { payload, done }).await.is_err() {
        bail!("hub loop has stopped");
    }
    processed
        .await
        .context("hub loop stopped before processing the event")
}

/// Starts the hub loop on the current Tokio runtime.
///
/// The loop ends once every clone of the returned handle has been dropped.
pub fn spawn() -> HubHandle {
    let (join_tx, join_rx) = mpsc::channel(EVENT_BUFFER);
    let (leave_tx, leave_rx) = mpsc::channel(EVENT_BUFFER);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(EVENT_BUFFER);

    let hub = Hub {
        members: BTreeMap::new(),
        join_rx,
        leave_rx,
        broadcast_rx,
    };
    tokio::spawn(hub.run());

    HubHandle {
        join_tx,
        leave_tx,
        broadcast_tx,
    }
}

struct Hub {
    members: BTreeMap<SessionId, Member>,
    join_rx: mpsc::Receiver<Event<Member>>,
    leave_rx: mpsc::Receiver<Event<SessionId>>,
    broadcast_rx: mpsc::Receiver<Event<Message>>,
}

impl Hub {
    async fn run(mut self) {
        loop {
            select! {
                Some(Event { payload, done }) = self.join_rx.recv() => {
                    self.handle_join(payload).await;
                    let _ = done.send(());
                }
                Some(Event { payload, done }) = self.leave_rx.recv() => {
                    self.handle_leave(payload).await;
                    let _ = done.send(());
                }
                Some(Event { payload, done }) = self.broadcast_rx.recv() => {
                    self.handle_broadcast(payload).await;
                    let _ = done.send(());
                }
                else => break,
            }
        }
        debug!("hub loop stopped");
    }

    async fn handle_join(&mut self, member: Member) {
        let id = member.id;
        let name = member.name.clone();
        if let Some(previous) = self.members.insert(id, member) {
            warn!(session = %id, name = %previous.name, "session joined twice; replacing entry");
        }
        info!(session = %id, %name, members = self.members.len(), "member joined");

        self.fan_out(&Message::joined(&name)).await;
        self.fan_out(&self.roster()).await;
    }

    async fn handle_leave(&mut self, id: SessionId) {
        let Some(Member { name, .. }) = self.members.remove(&id) else {
            debug!(session = %id, "leave for unknown session ignored");
            return;
        };
        info!(session = %id, %name, members = self.members.len(), "member left");

        self.fan_out(&Message::left(&name)).await;
        self.fan_out(&self.roster()).await;
    }

    async fn handle_broadcast(&mut self, message: Message) {
        debug!(event = message.event_name(), members = self.members.len(), "broadcasting");
        self.fan_out(&message).await;
    }

    fn roster(&self) -> Message {
        Message::roster(self.members.values().map(|member| member.name.as_str()))
    }

    /// Sends `message` to every member in turn.
    ///
    /// A closed connection is logged and skipped. Its member stays
    /// registered until its own session sends the leave.
    async fn fan_out(&self, message: &Message) {
        for member in self.members.values() {
            if member.outbound.send(message.clone()).await.is_err() {
                warn!(
                    session = %member.id,
                    name = %member.name,
                    event = message.event_name(),
                    "failed to deliver message; connection closed"
                );
            }
        }
    }
}
