use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::AtlasError;
use crate::model::{
    ChangeNotification, ConversationId, Message, MessageId, Participant, ParticipantId, SendState,
};
use crate::session::{ChangeListener, SessionController, SubscriptionHandle, SubscriptionRegistry};

/// Default number of messages returned per history page.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// A command the session received, kept so callers can see what was forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Send { conversation: ConversationId, message: MessageId },
    Resend { conversation: ConversationId, message: MessageId },
    MarkRead { conversation: ConversationId, message: MessageId },
    LoadOlder { conversation: ConversationId },
}

#[derive(Default)]
struct ConversationState {
    messages: Vec<Message>,
    participants: Vec<Participant>,
    /// Older messages not yet paged in, oldest first.
    backlog: Vec<Message>,
}

/// In-memory loopback session.
///
/// Commands are applied to local state immediately; the transport side is
/// driven by the caller through [`receive`](Self::receive),
/// [`acknowledge`](Self::acknowledge) and friends, which may run on any
/// thread and notify subscribers from that thread.
#[derive(Clone)]
pub struct LocalSession {
    me: Participant,
    conversations: Arc<Mutex<HashMap<ConversationId, ConversationState>>>,
    registry: SubscriptionRegistry,
    commands: Arc<Mutex<Vec<SessionCommand>>>,
    page_size: usize,
}

impl LocalSession {
    pub fn new(me: Participant) -> Self {
        Self {
            me,
            conversations: Arc::new(Mutex::new(HashMap::new())),
            registry: SubscriptionRegistry::new(),
            commands: Arc::new(Mutex::new(Vec::new())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn me(&self) -> &Participant {
        &self.me
    }

    /// Create a conversation between the signed-in user and `others`.
    pub fn create_conversation(&self, others: Vec<Participant>) -> ConversationId {
        let id = ConversationId::generate();
        let mut participants = vec![self.me.clone()];
        participants.extend(others);
        self.conversations.lock().unwrap().insert(
            id.clone(),
            ConversationState {
                participants,
                ..Default::default()
            },
        );
        tracing::info!("conversation created: {id}");
        id
    }

    /// Seed a message without notifying subscribers.
    pub fn insert_message(
        &self,
        conversation: &ConversationId,
        message: Message,
    ) -> Result<(), AtlasError> {
        self.with_conversation(conversation, |state| state.messages.push(message))
    }

    /// Seed history that `load_older_messages` pages in, oldest first.
    pub fn set_backlog(
        &self,
        conversation: &ConversationId,
        backlog: Vec<Message>,
    ) -> Result<(), AtlasError> {
        self.with_conversation(conversation, |state| state.backlog = backlog)
    }

    /// A message arrived from the network.
    pub fn receive(&self, conversation: &ConversationId, message: Message) -> Result<(), AtlasError> {
        let id = message.id.clone();
        self.with_conversation(conversation, |state| state.messages.push(message))?;
        self.registry.emit(ChangeNotification::MessageInserted {
            conversation: conversation.clone(),
            message: id,
        });
        Ok(())
    }

    /// The transport reported a new state for a message.
    pub fn acknowledge(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
        state: SendState,
    ) -> Result<(), AtlasError> {
        self.update_message(conversation, message, |m| m.state = state)?;
        tracing::debug!("acknowledge: message={message} state={state:?}");
        self.registry.emit(ChangeNotification::MessageUpdated {
            conversation: conversation.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    pub fn remove_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
    ) -> Result<(), AtlasError> {
        let removed = self.with_conversation(conversation, |state| {
            let before = state.messages.len();
            state.messages.retain(|m| &m.id != message);
            before != state.messages.len()
        })?;
        if !removed {
            return Err(AtlasError::Session(format!("unknown message {message}")));
        }
        self.registry.emit(ChangeNotification::MessageRemoved {
            conversation: conversation.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    /// Replace a participant's profile data.
    pub fn update_participant(
        &self,
        conversation: &ConversationId,
        participant: Participant,
    ) -> Result<(), AtlasError> {
        let id = participant.id.clone();
        self.with_conversation(conversation, |state| {
            match state.participants.iter_mut().find(|p| p.id == participant.id) {
                Some(existing) => *existing = participant,
                None => state.participants.push(participant),
            }
        })?;
        self.registry.emit(ChangeNotification::ParticipantChanged {
            conversation: conversation.clone(),
            participant: id,
        });
        Ok(())
    }

    /// Finish an outstanding history request: moves up to one page from the
    /// backlog to the front of the conversation.
    pub fn complete_history_load(&self, conversation: &ConversationId) -> Result<usize, AtlasError> {
        let page_size = self.page_size;
        let count = self.with_conversation(conversation, |state| {
            let split = state.backlog.len().saturating_sub(page_size);
            let page: Vec<Message> = state.backlog.drain(split..).collect();
            let count = page.len();
            state.messages.splice(0..0, page);
            count
        })?;
        tracing::debug!("history page loaded: conversation={conversation} count={count}");
        self.registry.emit(ChangeNotification::OlderMessagesLoaded {
            conversation: conversation.clone(),
            count,
        });
        Ok(count)
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<SessionCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Take the commands not yet handed to the transport.
    pub fn drain_commands(&self) -> Vec<SessionCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }

    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.registry.subscriber_count(conversation)
    }

    fn record(&self, command: SessionCommand) {
        self.commands.lock().unwrap().push(command);
    }

    fn with_conversation<T>(
        &self,
        conversation: &ConversationId,
        f: impl FnOnce(&mut ConversationState) -> T,
    ) -> Result<T, AtlasError> {
        let mut conversations = self.conversations.lock().unwrap();
        let state = conversations
            .get_mut(conversation)
            .ok_or_else(|| AtlasError::ConversationNotFound(conversation.clone()))?;
        Ok(f(state))
    }

    fn update_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
        f: impl FnOnce(&mut Message),
    ) -> Result<(), AtlasError> {
        self.with_conversation(conversation, |state| {
            state
                .messages
                .iter_mut()
                .find(|m| &m.id == message)
                .map(f)
                .ok_or_else(|| AtlasError::Session(format!("unknown message {message}")))
        })?
    }
}

impl SessionController for LocalSession {
    fn authenticated_participant(&self) -> ParticipantId {
        self.me.id.clone()
    }

    fn has_conversation(&self, conversation: &ConversationId) -> bool {
        self.conversations.lock().unwrap().contains_key(conversation)
    }

    fn messages(&self, conversation: &ConversationId) -> Result<Vec<Message>, AtlasError> {
        self.with_conversation(conversation, |state| state.messages.clone())
    }

    fn participants(&self, conversation: &ConversationId) -> Result<Vec<Participant>, AtlasError> {
        self.with_conversation(conversation, |state| state.participants.clone())
    }

    fn send(&self, conversation: &ConversationId, content: &str) -> Result<Message, AtlasError> {
        let message = Message::new(self.me.id.clone(), content, SendState::Pending);
        self.with_conversation(conversation, |state| state.messages.push(message.clone()))?;
        self.record(SessionCommand::Send {
            conversation: conversation.clone(),
            message: message.id.clone(),
        });
        tracing::info!("send: conversation={conversation} message={}", message.id);
        self.registry.emit(ChangeNotification::MessageInserted {
            conversation: conversation.clone(),
            message: message.id.clone(),
        });
        Ok(message)
    }

    fn resend(&self, conversation: &ConversationId, message: &MessageId) -> Result<(), AtlasError> {
        self.with_conversation(conversation, |state| {
            match state.messages.iter_mut().find(|m| &m.id == message) {
                Some(m) if m.state == SendState::Failed => {
                    m.state = SendState::Pending;
                    Ok(())
                }
                Some(m) => Err(AtlasError::Session(format!(
                    "message {message} is {:?}, not failed",
                    m.state
                ))),
                None => Err(AtlasError::Session(format!("unknown message {message}"))),
            }
        })??;
        self.record(SessionCommand::Resend {
            conversation: conversation.clone(),
            message: message.clone(),
        });
        tracing::info!("resend: conversation={conversation} message={message}");
        self.registry.emit(ChangeNotification::MessageUpdated {
            conversation: conversation.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    fn mark_read(&self, conversation: &ConversationId, message: &MessageId) -> Result<(), AtlasError> {
        self.update_message(conversation, message, |m| m.is_unread = false)?;
        self.record(SessionCommand::MarkRead {
            conversation: conversation.clone(),
            message: message.clone(),
        });
        self.registry.emit(ChangeNotification::MessageUpdated {
            conversation: conversation.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    fn load_older_messages(&self, conversation: &ConversationId) -> Result<(), AtlasError> {
        if !self.has_conversation(conversation) {
            return Err(AtlasError::ConversationNotFound(conversation.clone()));
        }
        self.record(SessionCommand::LoadOlder {
            conversation: conversation.clone(),
        });
        tracing::debug!("load_older_messages: conversation={conversation}");
        Ok(())
    }

    fn subscribe(
        &self,
        conversation: &ConversationId,
        listener: Arc<dyn ChangeListener>,
    ) -> SubscriptionHandle {
        self.registry.subscribe(conversation, listener)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.registry.unsubscribe(handle);
    }
}
