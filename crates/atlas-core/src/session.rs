use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::AtlasError;
use crate::model::{
    ChangeNotification, ConversationId, Message, MessageId, Participant, ParticipantId,
};

/// Receives change notifications from a session.
/// Implementations must be Send + Sync (called from transport threads).
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, notification: ChangeNotification);
}

/// Token returned by [`SessionController::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// The messaging session a conversation screen talks to.
///
/// Owns authentication, conversation state, persistence and transport.
/// Commands are fire-and-forget: their outcome comes back as change
/// notifications to subscribers.
pub trait SessionController: Send + Sync {
    /// The signed-in user; messages from this sender are outgoing.
    fn authenticated_participant(&self) -> ParticipantId;

    fn has_conversation(&self, conversation: &ConversationId) -> bool;

    /// Messages in arrival order.
    fn messages(&self, conversation: &ConversationId) -> Result<Vec<Message>, AtlasError>;

    fn participants(&self, conversation: &ConversationId) -> Result<Vec<Participant>, AtlasError>;

    /// Queue a new message. It is inserted as `Pending` before this returns.
    fn send(&self, conversation: &ConversationId, content: &str) -> Result<Message, AtlasError>;

    fn resend(&self, conversation: &ConversationId, message: &MessageId) -> Result<(), AtlasError>;

    fn mark_read(&self, conversation: &ConversationId, message: &MessageId)
    -> Result<(), AtlasError>;

    /// Request the previous page of history. Completion is signalled with
    /// [`ChangeNotification::OlderMessagesLoaded`].
    fn load_older_messages(&self, conversation: &ConversationId) -> Result<(), AtlasError>;

    fn subscribe(
        &self,
        conversation: &ConversationId,
        listener: Arc<dyn ChangeListener>,
    ) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

struct Subscription {
    conversation: ConversationId,
    listener: Arc<dyn ChangeListener>,
}

/// Per-conversation listener registry that session implementations use to
/// fan notifications out to subscribers.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    subscriptions: Arc<RwLock<HashMap<SubscriptionHandle, Subscription>>>,
    next_handle: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(
        &self,
        conversation: &ConversationId,
        listener: Arc<dyn ChangeListener>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().unwrap().insert(
            handle,
            Subscription {
                conversation: conversation.clone(),
                listener,
            },
        );
        tracing::debug!("subscribe: conversation={conversation} handle={handle:?}");
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.subscriptions.write().unwrap().remove(&handle).is_none() {
            tracing::debug!("unsubscribe: unknown handle {handle:?}");
        }
    }

    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.subscriptions
            .read()
            .unwrap()
            .values()
            .filter(|s| &s.conversation == conversation)
            .count()
    }

    pub fn emit(&self, notification: ChangeNotification) {
        // Listeners are collected first so one may unsubscribe from inside its callback.
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .subscriptions
            .read()
            .unwrap()
            .values()
            .filter(|s| &s.conversation == notification.conversation())
            .map(|s| s.listener.clone())
            .collect();
        for listener in listeners {
            listener.on_change(notification.clone());
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
