use std::fmt;

use serde::{Deserialize, Serialize};

const CHAT_TYPE: u8 = 0;
const SYSTEM_TYPE: u8 = 1;
const ROSTER_TYPE: u8 = 2;

/// Envelope broadcast by the hub to every member.
///
/// On the wire each message is a single JSON object carrying a numeric
/// `type` (0 chat, 1 system, 2 roster) and a matching `event` name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub enum Message {
    Chat {
        author: String,
        body: String,
    },
    System {
        event: SystemEvent,
        author: String,
        body: String,
    },
    Roster {
        users: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Join,
    Leave,
}

impl SystemEvent {
    fn as_str(self) -> &'static str {
        match self {
            SystemEvent::Join => "join",
            SystemEvent::Leave => "leave",
        }
    }
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn chat(author: impl Into<String>, body: impl Into<String>) -> Self {
        Message::Chat {
            author: author.into(),
            body: body.into(),
        }
    }

    pub fn joined(name: &str) -> Self {
        Message::System {
            event: SystemEvent::Join,
            author: name.to_string(),
            body: format!("{name} joined the chat"),
        }
    }

    pub fn left(name: &str) -> Self {
        Message::System {
            event: SystemEvent::Leave,
            author: name.to_string(),
            body: format!("{name} left the chat"),
        }
    }

    /// Builds a roster snapshot, sorting the names so every client renders
    /// the same order.
    pub fn roster<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut users: Vec<String> = names.into_iter().map(Into::into).collect();
        users.sort();
        Message::Roster { users }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Message::Chat { .. } => "message",
            Message::System { event, .. } => event.as_str(),
            Message::Roster { .. } => "roster",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Flat JSON shape shared by all message kinds.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    users: Option<Vec<String>>,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let event = message.event_name().to_string();
        match message {
            Message::Chat { author, body } => WireMessage {
                kind: CHAT_TYPE,
                body: Some(body),
                author: Some(author),
                event,
                users: None,
            },
            Message::System { author, body, .. } => WireMessage {
                kind: SYSTEM_TYPE,
                body: Some(body),
                author: Some(author),
                event,
                users: None,
            },
            Message::Roster { users } => WireMessage {
                kind: ROSTER_TYPE,
                body: None,
                author: None,
                event,
                users: Some(users),
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        match (wire.kind, wire.event.as_str()) {
            (CHAT_TYPE, "message") => Ok(Message::Chat {
                author: wire.author.unwrap_or_default(),
                body: wire.body.unwrap_or_default(),
            }),
            (SYSTEM_TYPE, "join" | "leave") => {
                let event = if wire.event == "join" {
                    SystemEvent::Join
                } else {
                    SystemEvent::Leave
                };
                Ok(Message::System {
                    event,
                    author: wire.author.unwrap_or_default(),
                    body: wire.body.unwrap_or_default(),
                })
            }
            (ROSTER_TYPE, "roster") => Ok(Message::Roster {
                users: wire.users.unwrap_or_default(),
            }),
            (kind, event) => Err(format!("unknown message type {kind} with event '{event}'")),
        }
    }
}
