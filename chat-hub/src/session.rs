use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    hub::{HubHandle, Member},
    message::Message,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static LAST_GUEST_SUFFIX: AtomicU64 = AtomicU64::new(0);

/// Opaque identity of one connected client, unrelated to its display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Picks the display name for a new connection.
///
/// Surrounding whitespace is trimmed; a missing or blank name falls back to
/// [`guest_name`].
pub fn resolve_display_name(requested: Option<&str>) -> String {
    match requested.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => guest_name(),
    }
}

/// Generates `Guest-<nanos>`, where the suffix is the current UNIX time in
/// nanoseconds, bumped past the last suffix handed out so concurrent
/// connects never share a name.
pub fn guest_name() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();

    let mut last = LAST_GUEST_SUFFIX.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_GUEST_SUFFIX.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("Guest-{candidate}"),
            Err(actual) => last = actual,
        }
    }
}

/// One connected client, registered with the hub for as long as its
/// receive loop runs.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    name: String,
    hub: HubHandle,
}

impl ClientSession {
    /// Registers a new session with the hub. `outbound` is the write side of
    /// the client's connection.
    pub async fn start(
        hub: HubHandle,
        name: String,
        outbound: mpsc::Sender<Message>,
    ) -> Result<Self> {
        let id = SessionId::next();
        hub.join(Member {
            id,
            name: name.clone(),
            outbound,
        })
        .await?;

        Ok(Self { id, name, hub })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forwards every inbound frame to the hub as a chat message until the
    /// stream ends or fails, then leaves the hub.
    ///
    /// Consuming `self` guarantees the session leaves exactly once.
    pub async fn run<S, E>(self, mut inbound: S) -> Result<()>
    where
        S: Stream<Item = Result<String, E>> + Unpin,
        E: fmt::Display,
    {
        let forwarded = self.forward_frames(&mut inbound).await;
        drop(inbound);

        info!(session = %self.id, name = %self.name, "session ended");
        let left = self.hub.leave(self.id).await;
        forwarded.and(left)
    }

    async fn forward_frames<S, E>(&self, inbound: &mut S) -> Result<()>
    where
        S: Stream<Item = Result<String, E>> + Unpin,
        E: fmt::Display,
    {
        while let Some(frame) = inbound.next().await {
            let body = match frame {
                Ok(body) => body,
                Err(err) => {
                    debug!(session = %self.id, error = %err, "receive failed; closing session");
                    break;
                }
            };
            debug!(session = %self.id, name = %self.name, "message received");
            self.hub.broadcast(Message::chat(&self.name, body)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, io, time::Duration};

    use futures::stream;
    use tokio::time::timeout;

    use super::*;
    use crate::hub;

    async fn recv(inbox: &mut mpsc::Receiver<Message>) -> Message {
        timeout(Duration::from_secs(1), inbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound channel closed")
    }

    #[test]
    fn supplied_name_is_trimmed() {
        assert_eq!(resolve_display_name(Some("  alice \n")), "alice");
    }

    #[test]
    fn blank_name_becomes_guest() {
        for requested in [None, Some(""), Some("   ")] {
            let name = resolve_display_name(requested);
            let suffix = name.strip_prefix("Guest-").expect("guest prefix");
            assert!(!suffix.is_empty());
            assert!(suffix.chars().all(|c| c.is_ascii_digit()), "{name}");
        }
    }

    #[test]
    fn concurrent_guest_names_are_distinct() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| guest_name()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for name in handle.join().expect("thread") {
                assert!(seen.insert(name.clone()), "duplicate guest name {name}");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[tokio::test]
    async fn session_forwards_frames_then_leaves_on_error() {
        let hub = hub::spawn();
        let (watcher_tx, mut watcher) = mpsc::channel(32);
        let watcher_session = ClientSession::start(hub.clone(), "watcher".into(), watcher_tx)
            .await
            .expect("watcher joins");

        let (alice_tx, _alice_inbox) = mpsc::channel(32);
        let alice = ClientSession::start(hub.clone(), "alice".into(), alice_tx)
            .await
            .expect("alice joins");
        let frames = stream::iter(vec![
            Ok("hello".to_string()),
            Ok("{not json}".to_string()),
            Err(io::Error::other("connection reset")),
            Ok("never sent".to_string()),
        ]);
        alice.run(frames).await.expect("session run");

        assert_eq!(recv(&mut watcher).await, Message::joined("watcher"));
        assert_eq!(recv(&mut watcher).await, Message::roster(["watcher"]));
        assert_eq!(recv(&mut watcher).await, Message::joined("alice"));
        assert_eq!(
            recv(&mut watcher).await,
            Message::roster(["alice", "watcher"])
        );
        assert_eq!(recv(&mut watcher).await, Message::chat("alice", "hello"));
        assert_eq!(
            recv(&mut watcher).await,
            Message::chat("alice", "{not json}")
        );
        assert_eq!(recv(&mut watcher).await, Message::left("alice"));
        assert_eq!(recv(&mut watcher).await, Message::roster(["watcher"]));
        assert!(watcher.try_recv().is_err());

        drop(watcher_session);
    }

    #[tokio::test]
    async fn session_leaves_on_clean_close() {
        let hub = hub::spawn();
        let (watcher_tx, mut watcher) = mpsc::channel(32);
        let _watcher = ClientSession::start(hub.clone(), "watcher".into(), watcher_tx)
            .await
            .expect("watcher joins");

        let (bob_tx, _bob_inbox) = mpsc::channel(32);
        let bob = ClientSession::start(hub.clone(), "bob".into(), bob_tx)
            .await
            .expect("bob joins");
        assert_eq!(bob.name(), "bob");
        bob.run(stream::empty::<Result<String, io::Error>>())
            .await
            .expect("session run");

        for _ in 0..4 {
            recv(&mut watcher).await;
        }
        assert_eq!(recv(&mut watcher).await, Message::left("bob"));
        assert_eq!(recv(&mut watcher).await, Message::roster(["watcher"]));
    }
}
