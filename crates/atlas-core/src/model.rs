use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(ConversationId);
string_id!(ParticipantId);
string_id!(MessageId);

/// Transport state of a message, owned by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl SendState {
    /// Status text shown under locally-sent bubbles.
    pub fn label(self) -> &'static str {
        match self {
            SendState::Pending => "Sending",
            SendState::Sent => "Sent",
            SendState::Delivered => "Delivered",
            SendState::Failed => "Not sent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: ParticipantId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub state: SendState,
    pub is_unread: bool,
}

impl Message {
    pub fn new(
        sender: impl Into<ParticipantId>,
        content: impl Into<String>,
        state: SendState,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender: sender.into(),
            content: content.into(),
            sent_at: Utc::now(),
            state,
            is_unread: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn unread(mut self) -> Self {
        self.is_unread = true;
        self
    }
}

/// Avatar as handed to the presentation surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Avatar {
    Image(String),
    Initials(String),
    Placeholder,
}

impl Avatar {
    /// Image when the participant has one, initials otherwise.
    pub fn for_participant(participant: &Participant) -> Self {
        if let Some(url) = participant.avatar.as_deref().filter(|u| !u.is_empty()) {
            return Avatar::Image(url.to_string());
        }
        let initials: String = participant
            .display_name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .take(2)
            .flat_map(char::to_uppercase)
            .collect();
        if initials.is_empty() {
            Avatar::Placeholder
        } else {
            Avatar::Initials(initials)
        }
    }
}

/// Display-ready participant data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub display_name: String,
    pub avatar: Avatar,
}

/// Change signalled by the session for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    MessageInserted { conversation: ConversationId, message: MessageId },
    MessageUpdated { conversation: ConversationId, message: MessageId },
    MessageRemoved { conversation: ConversationId, message: MessageId },
    ParticipantChanged { conversation: ConversationId, participant: ParticipantId },
    /// History page finished loading; `count == 0` means nothing older exists.
    OlderMessagesLoaded { conversation: ConversationId, count: usize },
}

impl ChangeNotification {
    pub fn conversation(&self) -> &ConversationId {
        match self {
            ChangeNotification::MessageInserted { conversation, .. }
            | ChangeNotification::MessageUpdated { conversation, .. }
            | ChangeNotification::MessageRemoved { conversation, .. }
            | ChangeNotification::ParticipantChanged { conversation, .. }
            | ChangeNotification::OlderMessagesLoaded { conversation, .. } => conversation,
        }
    }
}

/// One batched update for the presentation surface.
///
/// `removed` indexes the previously projected list; `inserted` and `updated`
/// index the current list. All index lists are ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshInstruction {
    pub inserted: Vec<usize>,
    pub updated: Vec<usize>,
    pub removed: Vec<usize>,
    pub participants: Vec<ParticipantId>,
    pub older_loaded: Option<usize>,
    pub reload: bool,
}

impl RefreshInstruction {
    pub fn reload() -> Self {
        Self {
            reload: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.participants.is_empty()
            && self.older_loaded.is_none()
            && !self.reload
    }
}

/// Navigation requests raised to whoever owns the screen stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenIntent {
    ShowProfile(ParticipantId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_prefers_image() {
        let p = Participant::new("u1", "Ada Lovelace").with_avatar("https://img/ada.png");
        assert_eq!(
            Avatar::for_participant(&p),
            Avatar::Image("https://img/ada.png".to_string())
        );
    }

    #[test]
    fn avatar_falls_back_to_initials() {
        let p = Participant::new("u1", "ada byron lovelace");
        assert_eq!(Avatar::for_participant(&p), Avatar::Initials("AB".to_string()));
    }

    #[test]
    fn avatar_placeholder_for_blank_name() {
        let p = Participant::new("u1", "   ");
        assert_eq!(Avatar::for_participant(&p), Avatar::Placeholder);
    }

    #[test]
    fn state_labels() {
        assert_eq!(SendState::Pending.label(), "Sending");
        assert_eq!(SendState::Failed.label(), "Not sent");
    }

    #[test]
    fn notification_exposes_conversation() {
        let n = ChangeNotification::OlderMessagesLoaded {
            conversation: "c1".into(),
            count: 0,
        };
        assert_eq!(n.conversation().as_str(), "c1");
    }

    #[test]
    fn empty_refresh() {
        assert!(RefreshInstruction::default().is_empty());
        assert!(!RefreshInstruction::reload().is_empty());
    }
}
