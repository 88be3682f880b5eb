use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::errors::AtlasError;
use crate::model::{
    Avatar, ChangeNotification, ConversationId, Message, MessageId, Participant, ParticipantId,
    ParticipantInfo, RefreshInstruction, ScreenIntent, SendState,
};
use crate::projection::{diff_messages, format_timestamp};
use crate::session::{ChangeListener, SessionController, SubscriptionHandle};
use crate::settings::Settings;

/// Receives batched refresh instructions. Always called on the thread that
/// drives the mediator.
pub trait PresentationSurface: Send + Sync {
    fn apply_refresh(&self, instruction: RefreshInstruction);
}

/// Owner of navigation for the hosting screen.
pub trait ScreenCoordinator: Send + Sync {
    fn handle_intent(&self, intent: ScreenIntent);
}

/// Told that notifications are queued and the host should call
/// [`ConversationMediator::process_notifications`] on its presentation thread.
/// Fires on whichever thread the session emitted from, once per drain.
pub trait ChangeSignal: Send + Sync {
    fn changes_pending(&self);
}

type SignalSlot = Arc<RwLock<Option<Arc<dyn ChangeSignal>>>>;

/// Read-only queries the presentation surface polls during layout.
pub trait ConversationDataSource {
    fn message_count(&self, conversation: &ConversationId) -> usize;
    fn message_at(&self, index: usize) -> Result<&Message, AtlasError>;
    fn participant_info(&self, participant: &ParticipantId) -> Result<ParticipantInfo, AtlasError>;
    /// Never fails; unresolvable senders get the placeholder.
    fn avatar_for(&self, message: &Message) -> Avatar;
    fn timestamp_label(&self, index: usize) -> Result<String, AtlasError>;
    /// `None` for incoming messages or when status labels are disabled.
    fn status_label(&self, index: usize) -> Result<Option<String>, AtlasError>;
    /// Whether the sender name goes above this bubble.
    fn should_show_sender(&self, index: usize) -> Result<bool, AtlasError>;
}

/// User-initiated events raised by the presentation surface.
pub trait ConversationDelegate {
    fn did_tap_send(&mut self, draft: &str) -> Result<(), AtlasError>;
    fn did_tap_resend(&mut self, message: &Message) -> Result<(), AtlasError>;
    fn did_tap_participant(&mut self, participant: &ParticipantId);
    fn did_scroll_to_top(&mut self) -> Result<(), AtlasError>;
    fn did_display_message(&mut self, index: usize) -> Result<(), AtlasError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediatorState {
    Unbound,
    Idle,
    /// A refresh was issued and not yet acknowledged.
    Refreshing,
}

/// Listener handed to the session. Only enqueues; never touches mediator state.
struct NotificationRelay {
    alive: Arc<AtomicBool>,
    signalled: Arc<AtomicBool>,
    signal: SignalSlot,
    sender: UnboundedSender<ChangeNotification>,
}

impl ChangeListener for NotificationRelay {
    fn on_change(&self, notification: ChangeNotification) {
        if !self.alive.load(Ordering::Acquire) {
            tracing::debug!("dropping notification after detach: {notification:?}");
            return;
        }
        if self.sender.send(notification).is_err() {
            tracing::debug!("notification inbox closed");
            return;
        }
        let signal = self.signal.read().unwrap().clone();
        if let Some(signal) = signal {
            if !self.signalled.swap(true, Ordering::AcqRel) {
                signal.changes_pending();
            }
        }
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    alive: Arc<AtomicBool>,
    signalled: Arc<AtomicBool>,
    inbox: UnboundedReceiver<ChangeNotification>,
}

impl Subscription {
    fn open(
        session: &dyn SessionController,
        conversation: &ConversationId,
        signal: &SignalSlot,
    ) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let signalled = Arc::new(AtomicBool::new(false));
        let relay = Arc::new(NotificationRelay {
            alive: alive.clone(),
            signalled: signalled.clone(),
            signal: signal.clone(),
            sender,
        });
        let handle = session.subscribe(conversation, relay);
        Self {
            handle,
            alive,
            signalled,
            inbox,
        }
    }

    fn close(self, session: &dyn SessionController) {
        self.alive.store(false, Ordering::Release);
        session.unsubscribe(self.handle);
    }
}

struct Binding {
    conversation: ConversationId,
    surface: Arc<dyn PresentationSurface>,
    subscription: Subscription,
    messages: Vec<Message>,
    participants: Vec<Participant>,
    refreshing: bool,
    pending: Vec<ChangeNotification>,
    pending_reload: bool,
    loading_older: bool,
    marked_read: HashSet<MessageId>,
}

/// Screen-level mediator between a [`SessionController`] and one chat view.
///
/// Session notifications may arrive on any thread. They are queued and only
/// applied when the host calls [`process_notifications`](Self::process_notifications)
/// (or awaits [`wait_for_notifications`](Self::wait_for_notifications)) on the
/// presentation thread. Data-source reads serve the projection as of the last
/// issued refresh, so they stay consistent with what the surface was told.
pub struct ConversationMediator {
    session: Arc<dyn SessionController>,
    settings: Settings,
    coordinator: Option<Arc<dyn ScreenCoordinator>>,
    signal: SignalSlot,
    binding: Option<Binding>,
}

impl ConversationMediator {
    pub fn new(session: Arc<dyn SessionController>, settings: Settings) -> Self {
        Self {
            session,
            settings,
            coordinator: None,
            signal: Arc::new(RwLock::new(None)),
            binding: None,
        }
    }

    pub fn session(&self) -> &Arc<dyn SessionController> {
        &self.session
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn set_coordinator(&mut self, coordinator: Option<Arc<dyn ScreenCoordinator>>) {
        self.coordinator = coordinator;
    }

    /// Install the hook that tells the host to come back and drain the queue.
    pub fn set_change_signal(&mut self, signal: Option<Arc<dyn ChangeSignal>>) {
        *self.signal.write().unwrap() = signal;
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.binding.as_ref().map(|b| &b.conversation)
    }

    pub fn state(&self) -> MediatorState {
        match &self.binding {
            None => MediatorState::Unbound,
            Some(b) if b.refreshing => MediatorState::Refreshing,
            Some(_) => MediatorState::Idle,
        }
    }

    /// Bind to a conversation and start relaying its changes to `surface`.
    ///
    /// Re-attaching the bound conversation only swaps the surface; the
    /// existing subscription is kept.
    pub fn attach(
        &mut self,
        conversation: ConversationId,
        surface: Arc<dyn PresentationSurface>,
    ) -> Result<(), AtlasError> {
        if let Some(binding) = self.binding.as_mut() {
            if binding.conversation == conversation {
                tracing::debug!("attach: already bound to {conversation}, swapping surface");
                binding.surface = surface;
                return Ok(());
            }
        }
        if !self.session.has_conversation(&conversation) {
            return Err(AtlasError::ConversationNotFound(conversation));
        }
        self.detach();

        // Subscribe before the first read so nothing between the two is missed.
        let subscription =
            Subscription::open(self.session.as_ref(), &conversation, &self.signal);
        let (messages, participants) = match self.load_snapshot(&conversation) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                subscription.close(self.session.as_ref());
                return Err(e);
            }
        };
        tracing::info!(
            "attach: conversation={conversation} messages={} participants={}",
            messages.len(),
            participants.len()
        );
        self.binding = Some(Binding {
            conversation,
            surface,
            subscription,
            messages,
            participants,
            refreshing: false,
            pending: Vec::new(),
            pending_reload: false,
            loading_older: false,
            marked_read: HashSet::new(),
        });
        Ok(())
    }

    /// Unsubscribe and drop everything queued. Late notifications become no-ops.
    pub fn detach(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        binding.subscription.close(self.session.as_ref());
        if !binding.pending.is_empty() || binding.refreshing {
            tracing::debug!(
                "detach: discarding {} queued notifications (refreshing={})",
                binding.pending.len(),
                binding.refreshing
            );
        }
        tracing::info!("detach: conversation={}", binding.conversation);
    }

    /// Point the mediator at another session, moving the subscription over.
    /// A bound surface receives a full reload.
    pub fn rebind_session(&mut self, session: Arc<dyn SessionController>) -> Result<(), AtlasError> {
        let previous = std::mem::replace(&mut self.session, session);
        let Some(binding) = self.binding.as_mut() else {
            return Ok(());
        };
        let conversation = binding.conversation.clone();
        if !self.session.has_conversation(&conversation) {
            // Nothing to show from the new session; tear the old binding down.
            if let Some(binding) = self.binding.take() {
                binding.subscription.close(previous.as_ref());
            }
            tracing::warn!("rebind_session: {conversation} unknown to new session, detached");
            return Err(AtlasError::ConversationNotFound(conversation));
        }

        let subscription =
            Subscription::open(self.session.as_ref(), &conversation, &self.signal);
        std::mem::replace(&mut binding.subscription, subscription).close(previous.as_ref());
        binding.pending.clear();
        binding.pending_reload = true;
        binding.loading_older = false;
        binding.marked_read.clear();
        tracing::info!("rebind_session: conversation={conversation}");
        self.flush();
        Ok(())
    }

    /// Drain queued notifications on the presentation thread. Issues at most
    /// one refresh per call. Returns the number of notifications drained.
    pub fn process_notifications(&mut self) -> usize {
        let Some(binding) = self.binding.as_mut() else {
            return 0;
        };
        binding.subscription.signalled.store(false, Ordering::Release);
        let mut drained = 0;
        while let Ok(notification) = binding.subscription.inbox.try_recv() {
            binding.pending.push(notification);
            drained += 1;
        }
        self.flush();
        drained
    }

    /// Wait for at least one notification, then behave like
    /// [`process_notifications`](Self::process_notifications).
    /// For hosts that drive their UI loop from a single-threaded runtime.
    pub async fn wait_for_notifications(&mut self) -> usize {
        let Some(binding) = self.binding.as_mut() else {
            return 0;
        };
        match binding.subscription.inbox.recv().await {
            Some(notification) => {
                binding.pending.push(notification);
                1 + self.process_notifications()
            }
            None => 0,
        }
    }

    /// The surface finished applying the outstanding refresh. Anything that
    /// queued up meanwhile goes out as one merged refresh.
    pub fn refresh_applied(&mut self) {
        match self.binding.as_mut() {
            Some(binding) if binding.refreshing => binding.refreshing = false,
            Some(_) => {
                tracing::debug!("refresh_applied without outstanding refresh");
                return;
            }
            None => return,
        }
        self.process_notifications();
    }

    fn load_snapshot(
        &self,
        conversation: &ConversationId,
    ) -> Result<(Vec<Message>, Vec<Participant>), AtlasError> {
        Ok((
            self.session.messages(conversation)?,
            self.session.participants(conversation)?,
        ))
    }

    fn flush(&mut self) {
        let conversation = match &self.binding {
            Some(binding)
                if !binding.refreshing && (!binding.pending.is_empty() || binding.pending_reload) =>
            {
                binding.conversation.clone()
            }
            _ => return,
        };
        // Pending changes stay queued until the session can be read.
        let (messages, participants) = match self.load_snapshot(&conversation) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("refresh: cannot read {conversation}: {e}");
                return;
            }
        };
        let Some(binding) = self.binding.as_mut() else {
            return;
        };
        let batch = std::mem::take(&mut binding.pending);
        let reload = std::mem::take(&mut binding.pending_reload);

        let mut instruction = RefreshInstruction {
            reload,
            ..Default::default()
        };
        for notification in &batch {
            match notification {
                ChangeNotification::ParticipantChanged { participant, .. } => {
                    if !instruction.participants.contains(participant) {
                        instruction.participants.push(participant.clone());
                    }
                }
                ChangeNotification::OlderMessagesLoaded { count, .. } => {
                    binding.loading_older = false;
                    *instruction.older_loaded.get_or_insert(0) += count;
                }
                _ => {}
            }
        }
        if !reload {
            let diff = diff_messages(&binding.messages, &messages);
            instruction.inserted = diff.inserted;
            instruction.updated = diff.updated;
            instruction.removed = diff.removed;
        }
        binding.messages = messages;
        binding.participants = participants;

        if instruction.is_empty() {
            tracing::debug!("refresh: {} notifications, no visible change", batch.len());
            return;
        }
        tracing::debug!(
            "refresh: conversation={} batch={} inserted={:?} updated={:?} removed={:?} reload={}",
            binding.conversation,
            batch.len(),
            instruction.inserted,
            instruction.updated,
            instruction.removed,
            instruction.reload
        );
        binding.refreshing = true;
        binding.surface.apply_refresh(instruction);
    }

    fn bound(&self) -> Result<&Binding, AtlasError> {
        self.binding.as_ref().ok_or(AtlasError::NotBound)
    }

    fn placeholder(&self) -> Avatar {
        match &self.settings.placeholder_avatar {
            Some(url) => Avatar::Image(url.clone()),
            None => Avatar::Placeholder,
        }
    }

    fn is_outgoing(&self, message: &Message) -> bool {
        message.sender == self.session.authenticated_participant()
    }
}

impl ConversationDataSource for ConversationMediator {
    fn message_count(&self, conversation: &ConversationId) -> usize {
        match &self.binding {
            Some(binding) if &binding.conversation == conversation => binding.messages.len(),
            _ => 0,
        }
    }

    fn message_at(&self, index: usize) -> Result<&Message, AtlasError> {
        let messages = &self.bound()?.messages;
        messages.get(index).ok_or(AtlasError::OutOfRange {
            index,
            count: messages.len(),
        })
    }

    fn participant_info(&self, participant: &ParticipantId) -> Result<ParticipantInfo, AtlasError> {
        let found = self
            .bound()?
            .participants
            .iter()
            .find(|p| &p.id == participant)
            .ok_or_else(|| AtlasError::ParticipantNotFound(participant.clone()))?;
        let avatar = match Avatar::for_participant(found) {
            Avatar::Placeholder => self.placeholder(),
            avatar => avatar,
        };
        Ok(ParticipantInfo {
            display_name: found.display_name.clone(),
            avatar,
        })
    }

    fn avatar_for(&self, message: &Message) -> Avatar {
        match self.participant_info(&message.sender) {
            Ok(info) => info.avatar,
            Err(_) => self.placeholder(),
        }
    }

    fn timestamp_label(&self, index: usize) -> Result<String, AtlasError> {
        let message = self.message_at(index)?;
        Ok(format_timestamp(
            &message.sent_at.with_timezone(&Local),
            &Local::now(),
        ))
    }

    fn status_label(&self, index: usize) -> Result<Option<String>, AtlasError> {
        let message = self.message_at(index)?;
        if !self.settings.show_status_labels || !self.is_outgoing(message) {
            return Ok(None);
        }
        Ok(Some(message.state.label().to_string()))
    }

    fn should_show_sender(&self, index: usize) -> Result<bool, AtlasError> {
        let message = self.message_at(index)?;
        if self.is_outgoing(message) {
            return Ok(false);
        }
        Ok(match index.checked_sub(1) {
            Some(previous) => self.message_at(previous)?.sender != message.sender,
            None => true,
        })
    }
}

impl ConversationDelegate for ConversationMediator {
    fn did_tap_send(&mut self, draft: &str) -> Result<(), AtlasError> {
        let conversation = self.bound()?.conversation.clone();
        let content = draft.trim();
        if content.is_empty() {
            return Err(AtlasError::InvalidDraft("message is empty".into()));
        }
        let length = content.chars().count();
        if length > self.settings.max_message_length {
            return Err(AtlasError::InvalidDraft(format!(
                "message is {length} characters, limit is {}",
                self.settings.max_message_length
            )));
        }
        let message = self.session.send(&conversation, content).map_err(|e| {
            tracing::warn!("send failed: conversation={conversation}: {e}");
            e
        })?;
        tracing::debug!("did_tap_send: queued {}", message.id);
        self.process_notifications();
        Ok(())
    }

    fn did_tap_resend(&mut self, message: &Message) -> Result<(), AtlasError> {
        let binding = self.bound()?;
        let conversation = binding.conversation.clone();
        // Judge by the freshest known state, not the caller's copy.
        let state = binding
            .messages
            .iter()
            .find(|m| m.id == message.id)
            .map_or(message.state, |m| m.state);
        if state != SendState::Failed {
            tracing::debug!("did_tap_resend: ignoring {} in state {state:?}", message.id);
            return Ok(());
        }
        self.session.resend(&conversation, &message.id).map_err(|e| {
            tracing::warn!("resend failed: message={}: {e}", message.id);
            e
        })?;
        self.process_notifications();
        Ok(())
    }

    fn did_tap_participant(&mut self, participant: &ParticipantId) {
        match &self.coordinator {
            Some(coordinator) => {
                coordinator.handle_intent(ScreenIntent::ShowProfile(participant.clone()))
            }
            None => tracing::debug!("did_tap_participant: no coordinator for {participant}"),
        }
    }

    fn did_scroll_to_top(&mut self) -> Result<(), AtlasError> {
        let binding = self.binding.as_mut().ok_or(AtlasError::NotBound)?;
        if binding.loading_older {
            tracing::debug!("did_scroll_to_top: load already in flight");
            return Ok(());
        }
        binding.loading_older = true;
        if let Err(e) = self.session.load_older_messages(&binding.conversation) {
            binding.loading_older = false;
            tracing::warn!("load_older_messages failed: {e}");
            return Err(e);
        }
        Ok(())
    }

    fn did_display_message(&mut self, index: usize) -> Result<(), AtlasError> {
        if !self.settings.marks_messages_as_read {
            return Ok(());
        }
        let message = self.message_at(index)?;
        if !message.is_unread || self.is_outgoing(message) {
            return Ok(());
        }
        let id = message.id.clone();
        let binding = self.binding.as_mut().ok_or(AtlasError::NotBound)?;
        if !binding.marked_read.insert(id.clone()) {
            return Ok(());
        }
        if let Err(e) = self.session.mark_read(&binding.conversation, &id) {
            binding.marked_read.remove(&id);
            tracing::warn!("mark_read failed: message={id}: {e}");
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for ConversationMediator {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalSession, SessionCommand};
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    #[derive(Default)]
    struct RecordingSurface {
        refreshes: Mutex<Vec<(RefreshInstruction, ThreadId)>>,
    }

    impl RecordingSurface {
        fn instructions(&self) -> Vec<RefreshInstruction> {
            self.refreshes
                .lock()
                .unwrap()
                .iter()
                .map(|(i, _)| i.clone())
                .collect()
        }

        fn threads(&self) -> Vec<ThreadId> {
            self.refreshes.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    impl PresentationSurface for RecordingSurface {
        fn apply_refresh(&self, instruction: RefreshInstruction) {
            self.refreshes
                .lock()
                .unwrap()
                .push((instruction, thread::current().id()));
        }
    }

    #[derive(Default)]
    struct RecordingCoordinator {
        intents: Mutex<Vec<ScreenIntent>>,
    }

    impl ScreenCoordinator for RecordingCoordinator {
        fn handle_intent(&self, intent: ScreenIntent) {
            self.intents.lock().unwrap().push(intent);
        }
    }

    struct Fixture {
        session: LocalSession,
        conversation: ConversationId,
        surface: Arc<RecordingSurface>,
        mediator: ConversationMediator,
    }

    fn fixture() -> Fixture {
        let session = LocalSession::new(Participant::new("me", "Me"));
        let conversation = session.create_conversation(vec![
            Participant::new("bob", "Bob Stone"),
            Participant::new("ann", "Ann").with_avatar("https://img/ann.png"),
        ]);
        session
            .insert_message(
                &conversation,
                Message::new("bob", "hi", SendState::Sent).with_id("a"),
            )
            .unwrap();
        session
            .insert_message(
                &conversation,
                Message::new("me", "hey", SendState::Pending).with_id("b"),
            )
            .unwrap();
        let surface = Arc::new(RecordingSurface::default());
        let mut mediator = ConversationMediator::new(Arc::new(session.clone()), Settings::default());
        mediator
            .attach(conversation.clone(), surface.clone())
            .unwrap();
        Fixture {
            session,
            conversation,
            surface,
            mediator,
        }
    }

    #[test]
    fn new_mediator_is_unbound() {
        let session = LocalSession::new(Participant::new("me", "Me"));
        let mediator = ConversationMediator::new(Arc::new(session), Settings::default());
        assert_eq!(mediator.state(), MediatorState::Unbound);
        assert!(mediator.conversation().is_none());
        assert_eq!(mediator.message_at(0), Err(AtlasError::NotBound));
    }

    #[test]
    fn attach_subscribes_once() {
        let mut f = fixture();
        assert_eq!(f.mediator.state(), MediatorState::Idle);
        assert_eq!(f.session.subscriber_count(&f.conversation), 1);

        // Screen re-entry with the same conversation must not double-subscribe.
        let surface = Arc::new(RecordingSurface::default());
        f.mediator.attach(f.conversation.clone(), surface).unwrap();
        assert_eq!(f.session.subscriber_count(&f.conversation), 1);
    }

    #[test]
    fn attach_unknown_conversation_fails() {
        let session = LocalSession::new(Participant::new("me", "Me"));
        let mut mediator = ConversationMediator::new(Arc::new(session), Settings::default());
        let result = mediator.attach("missing".into(), Arc::new(RecordingSurface::default()));
        assert_eq!(
            result,
            Err(AtlasError::ConversationNotFound("missing".into()))
        );
        assert_eq!(mediator.state(), MediatorState::Unbound);
    }

    #[test]
    fn messages_keep_arrival_order() {
        let f = fixture();
        assert_eq!(f.mediator.message_count(&f.conversation), 2);
        assert_eq!(f.mediator.message_at(0).unwrap().content, "hi");
        assert_eq!(f.mediator.message_at(1).unwrap().content, "hey");
        assert_eq!(f.mediator.message_at(0).unwrap().content, "hi");
        assert_eq!(
            f.mediator.message_at(2),
            Err(AtlasError::OutOfRange { index: 2, count: 2 })
        );
        assert_eq!(f.mediator.message_count(&"other".into()), 0);
    }

    #[test]
    fn participant_info_and_avatars() {
        let f = fixture();
        let bob = f.mediator.participant_info(&"bob".into()).unwrap();
        assert_eq!(bob.display_name, "Bob Stone");
        assert_eq!(bob.avatar, Avatar::Initials("BS".into()));

        let ann = f.mediator.participant_info(&"ann".into()).unwrap();
        assert_eq!(ann.avatar, Avatar::Image("https://img/ann.png".into()));

        assert_eq!(
            f.mediator.participant_info(&"zed".into()),
            Err(AtlasError::ParticipantNotFound("zed".into()))
        );

        let stranger = Message::new("zed", "boo", SendState::Sent);
        assert_eq!(f.mediator.avatar_for(&stranger), Avatar::Placeholder);
    }

    #[test]
    fn configured_placeholder_is_used() {
        let mut f = fixture();
        f.mediator.set_settings(Settings {
            placeholder_avatar: Some("asset://default".into()),
            ..Settings::default()
        });
        let stranger = Message::new("zed", "boo", SendState::Sent);
        assert_eq!(
            f.mediator.avatar_for(&stranger),
            Avatar::Image("asset://default".into())
        );
    }

    #[test]
    fn send_appears_pending_and_relays_ack() {
        let mut f = fixture();
        f.mediator.did_tap_send("  yo ").unwrap();

        assert_eq!(f.mediator.message_count(&f.conversation), 3);
        let sent = f.mediator.message_at(2).unwrap().clone();
        assert_eq!(sent.content, "yo");
        assert_eq!(sent.state, SendState::Pending);
        assert_eq!(f.surface.instructions()[0].inserted, vec![2]);
        f.mediator.refresh_applied();

        f.session
            .acknowledge(&f.conversation, &sent.id, SendState::Sent)
            .unwrap();
        assert_eq!(f.mediator.message_at(2).unwrap().state, SendState::Pending);
        f.mediator.process_notifications();
        assert_eq!(f.mediator.message_at(2).unwrap().state, SendState::Sent);
        assert_eq!(f.surface.instructions()[1].updated, vec![2]);
    }

    #[test]
    fn empty_or_long_draft_is_rejected() {
        let mut f = fixture();
        f.mediator.set_settings(Settings {
            max_message_length: 3,
            ..Settings::default()
        });
        assert!(matches!(
            f.mediator.did_tap_send("   "),
            Err(AtlasError::InvalidDraft(_))
        ));
        assert!(matches!(
            f.mediator.did_tap_send("toolong"),
            Err(AtlasError::InvalidDraft(_))
        ));
        assert!(f.session.commands().is_empty());
    }

    #[test]
    fn resend_on_sent_message_is_ignored() {
        let mut f = fixture();
        let a = f.mediator.message_at(0).unwrap().clone();
        f.mediator.did_tap_resend(&a).unwrap();

        assert!(f.session.commands().is_empty());
        assert!(f.surface.instructions().is_empty());
        assert_eq!(f.mediator.message_count(&f.conversation), 2);
    }

    #[test]
    fn resend_on_failed_message_is_forwarded() {
        let mut f = fixture();
        f.session
            .acknowledge(&f.conversation, &"b".into(), SendState::Failed)
            .unwrap();
        f.mediator.process_notifications();
        f.mediator.refresh_applied();

        let b = f.mediator.message_at(1).unwrap().clone();
        assert_eq!(b.state, SendState::Failed);
        f.mediator.did_tap_resend(&b).unwrap();

        assert_eq!(
            f.session.commands(),
            vec![SessionCommand::Resend {
                conversation: f.conversation.clone(),
                message: "b".into()
            }]
        );
        assert_eq!(f.mediator.message_at(1).unwrap().state, SendState::Pending);
    }

    #[test]
    fn notifications_during_refresh_merge_into_one() {
        let mut f = fixture();
        f.session
            .receive(&f.conversation, Message::new("bob", "one", SendState::Sent))
            .unwrap();
        f.mediator.process_notifications();
        assert_eq!(f.mediator.state(), MediatorState::Refreshing);

        let late = Message::new("bob", "two", SendState::Pending).with_id("late");
        f.session.receive(&f.conversation, late).unwrap();
        f.session
            .acknowledge(&f.conversation, &"late".into(), SendState::Delivered)
            .unwrap();
        f.session
            .acknowledge(&f.conversation, &"b".into(), SendState::Sent)
            .unwrap();
        f.mediator.process_notifications();
        assert_eq!(f.surface.instructions().len(), 1);

        f.mediator.refresh_applied();
        let instructions = f.surface.instructions();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[1].inserted, vec![3]);
        assert_eq!(instructions[1].updated, vec![1]);
        assert_eq!(f.mediator.message_at(3).unwrap().state, SendState::Delivered);

        f.mediator.refresh_applied();
        assert_eq!(f.mediator.state(), MediatorState::Idle);
    }

    #[test]
    fn no_refresh_after_detach() {
        let mut f = fixture();
        f.session
            .receive(&f.conversation, Message::new("bob", "queued", SendState::Sent))
            .unwrap();
        f.mediator.detach();
        assert_eq!(f.mediator.state(), MediatorState::Unbound);
        assert_eq!(f.session.subscriber_count(&f.conversation), 0);

        f.session
            .receive(&f.conversation, Message::new("bob", "late", SendState::Sent))
            .unwrap();
        assert_eq!(f.mediator.process_notifications(), 0);
        f.mediator.refresh_applied();
        assert!(f.surface.instructions().is_empty());
    }

    #[test]
    fn late_relay_call_after_detach_is_noop() {
        let (sender, mut inbox) = mpsc::unbounded_channel();
        let relay = NotificationRelay {
            alive: Arc::new(AtomicBool::new(false)),
            signalled: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(RwLock::new(None)),
            sender,
        };
        relay.on_change(ChangeNotification::MessageInserted {
            conversation: "c".into(),
            message: "m".into(),
        });
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn background_notifications_land_on_presentation_thread() {
        let mut f = fixture();
        let presentation = thread::current().id();

        let session = f.session.clone();
        let conversation = f.conversation.clone();
        let transport = thread::spawn(move || {
            session
                .receive(&conversation, Message::new("bob", "from afar", SendState::Sent))
                .unwrap();
            thread::current().id()
        });
        let transport_id = transport.join().unwrap();
        assert_ne!(transport_id, presentation);

        // Nothing reaches the surface until the presentation thread drains.
        assert!(f.surface.instructions().is_empty());
        assert_eq!(f.mediator.message_count(&f.conversation), 2);

        assert_eq!(f.mediator.process_notifications(), 1);
        assert_eq!(f.surface.threads(), vec![presentation]);
        assert_eq!(f.mediator.message_count(&f.conversation), 3);
    }

    #[test]
    fn scroll_to_top_coalesces_loads() {
        let mut f = fixture();
        f.session
            .set_backlog(
                &f.conversation,
                vec![Message::new("bob", "old", SendState::Sent)],
            )
            .unwrap();

        f.mediator.did_scroll_to_top().unwrap();
        f.mediator.did_scroll_to_top().unwrap();
        f.mediator.did_scroll_to_top().unwrap();
        let loads = f
            .session
            .commands()
            .into_iter()
            .filter(|c| matches!(c, SessionCommand::LoadOlder { .. }))
            .count();
        assert_eq!(loads, 1);

        f.session.complete_history_load(&f.conversation).unwrap();
        f.mediator.process_notifications();
        let refresh = &f.surface.instructions()[0];
        assert_eq!(refresh.inserted, vec![0]);
        assert_eq!(refresh.older_loaded, Some(1));
        assert_eq!(f.mediator.message_at(0).unwrap().content, "old");
        f.mediator.refresh_applied();

        // History exhausted: the empty result is still relayed.
        f.mediator.did_scroll_to_top().unwrap();
        f.session.complete_history_load(&f.conversation).unwrap();
        f.mediator.process_notifications();
        assert_eq!(f.surface.instructions()[1].older_loaded, Some(0));
    }

    #[test]
    fn participant_tap_raises_intent() {
        let mut f = fixture();
        let coordinator = Arc::new(RecordingCoordinator::default());
        f.mediator.set_coordinator(Some(coordinator.clone()));
        f.mediator.did_tap_participant(&"bob".into());
        assert_eq!(
            *coordinator.intents.lock().unwrap(),
            vec![ScreenIntent::ShowProfile("bob".into())]
        );
    }

    #[test]
    fn participant_change_is_relayed() {
        let mut f = fixture();
        f.session
            .update_participant(&f.conversation, Participant::new("bob", "Robert"))
            .unwrap();
        f.mediator.process_notifications();
        assert_eq!(
            f.surface.instructions()[0].participants,
            vec![ParticipantId::from("bob")]
        );
        assert_eq!(
            f.mediator
                .participant_info(&"bob".into())
                .unwrap()
                .display_name,
            "Robert"
        );
    }

    #[test]
    fn displayed_unread_message_is_marked_once() {
        let mut f = fixture();
        f.session
            .receive(
                &f.conversation,
                Message::new("bob", "ping", SendState::Sent).with_id("u").unread(),
            )
            .unwrap();
        f.mediator.process_notifications();
        f.mediator.refresh_applied();

        f.mediator.did_display_message(2).unwrap();
        f.mediator.did_display_message(2).unwrap();
        // Outgoing and already-read messages are skipped.
        f.mediator.did_display_message(0).unwrap();
        f.mediator.did_display_message(1).unwrap();
        assert_eq!(
            f.session.commands(),
            vec![SessionCommand::MarkRead {
                conversation: f.conversation.clone(),
                message: "u".into()
            }]
        );

        // Read-state changes are invisible to the list and produce no refresh.
        f.mediator.process_notifications();
        assert_eq!(f.surface.instructions().len(), 1);
        assert_eq!(f.mediator.state(), MediatorState::Idle);
    }

    #[test]
    fn status_and_sender_labels() {
        let f = fixture();
        assert_eq!(f.mediator.status_label(0).unwrap(), None);
        assert_eq!(f.mediator.status_label(1).unwrap(), Some("Sending".into()));
        assert!(f.mediator.should_show_sender(0).unwrap());
        assert!(!f.mediator.should_show_sender(1).unwrap());
        assert!(f.mediator.timestamp_label(0).is_ok());
        assert!(f.mediator.status_label(5).is_err());
    }

    #[test]
    fn rebind_moves_subscription_and_reloads() {
        let mut f = fixture();
        let replacement = LocalSession::new(Participant::new("me", "Me"));
        assert!(f.mediator.rebind_session(Arc::new(replacement)).is_err());
        assert_eq!(f.mediator.state(), MediatorState::Unbound);
        assert_eq!(f.session.subscriber_count(&f.conversation), 0);

        let mut f = fixture();
        let same_backend = f.session.clone();
        f.mediator.rebind_session(Arc::new(same_backend)).unwrap();
        assert_eq!(f.session.subscriber_count(&f.conversation), 1);
        assert_eq!(f.surface.instructions(), vec![RefreshInstruction::reload()]);
    }

    #[derive(Default)]
    struct CountingSignal {
        fired: Mutex<Vec<ThreadId>>,
    }

    impl ChangeSignal for CountingSignal {
        fn changes_pending(&self) {
            self.fired.lock().unwrap().push(thread::current().id());
        }
    }

    #[test]
    fn change_signal_fires_once_per_drain() {
        let mut f = fixture();
        let signal = Arc::new(CountingSignal::default());
        f.mediator.set_change_signal(Some(signal.clone()));

        let session = f.session.clone();
        let conversation = f.conversation.clone();
        let transport = thread::spawn(move || {
            for text in ["one", "two"] {
                session
                    .receive(&conversation, Message::new("bob", text, SendState::Sent))
                    .unwrap();
            }
            thread::current().id()
        });
        let transport_id = transport.join().unwrap();
        assert_eq!(*signal.fired.lock().unwrap(), vec![transport_id]);
        assert!(f.surface.instructions().is_empty());

        assert_eq!(f.mediator.process_notifications(), 2);
        assert_eq!(f.surface.instructions()[0].inserted, vec![2, 3]);

        f.session
            .receive(&f.conversation, Message::new("bob", "three", SendState::Sent))
            .unwrap();
        assert_eq!(signal.fired.lock().unwrap().len(), 2);

        f.mediator.set_change_signal(None);
        f.mediator.process_notifications();
        f.session
            .receive(&f.conversation, Message::new("bob", "four", SendState::Sent))
            .unwrap();
        assert_eq!(signal.fired.lock().unwrap().len(), 2);
    }

    /// Session whose reads fail while `unavailable` is set.
    struct FlakySession {
        inner: LocalSession,
        unavailable: AtomicBool,
    }

    impl SessionController for FlakySession {
        fn authenticated_participant(&self) -> ParticipantId {
            self.inner.authenticated_participant()
        }

        fn has_conversation(&self, conversation: &ConversationId) -> bool {
            self.inner.has_conversation(conversation)
        }

        fn messages(&self, conversation: &ConversationId) -> Result<Vec<Message>, AtlasError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(AtlasError::Session("store offline".into()));
            }
            self.inner.messages(conversation)
        }

        fn participants(
            &self,
            conversation: &ConversationId,
        ) -> Result<Vec<Participant>, AtlasError> {
            self.inner.participants(conversation)
        }

        fn send(&self, conversation: &ConversationId, content: &str) -> Result<Message, AtlasError> {
            self.inner.send(conversation, content)
        }

        fn resend(&self, conversation: &ConversationId, message: &MessageId) -> Result<(), AtlasError> {
            self.inner.resend(conversation, message)
        }

        fn mark_read(
            &self,
            conversation: &ConversationId,
            message: &MessageId,
        ) -> Result<(), AtlasError> {
            self.inner.mark_read(conversation, message)
        }

        fn load_older_messages(&self, conversation: &ConversationId) -> Result<(), AtlasError> {
            self.inner.load_older_messages(conversation)
        }

        fn subscribe(
            &self,
            conversation: &ConversationId,
            listener: Arc<dyn ChangeListener>,
        ) -> SubscriptionHandle {
            self.inner.subscribe(conversation, listener)
        }

        fn unsubscribe(&self, handle: SubscriptionHandle) {
            self.inner.unsubscribe(handle)
        }
    }

    #[test]
    fn failed_session_read_keeps_batch_queued() {
        let session = LocalSession::new(Participant::new("me", "Me"));
        let conversation = session.create_conversation(vec![Participant::new("bob", "Bob")]);
        session
            .insert_message(&conversation, Message::new("bob", "hi", SendState::Sent))
            .unwrap();
        session
            .set_backlog(&conversation, vec![Message::new("bob", "old", SendState::Sent)])
            .unwrap();
        let flaky = Arc::new(FlakySession {
            inner: session.clone(),
            unavailable: AtomicBool::new(false),
        });
        let surface = Arc::new(RecordingSurface::default());
        let mut mediator = ConversationMediator::new(flaky.clone(), Settings::default());
        mediator.attach(conversation.clone(), surface.clone()).unwrap();

        mediator.did_scroll_to_top().unwrap();
        session.complete_history_load(&conversation).unwrap();
        flaky.unavailable.store(true, Ordering::SeqCst);
        assert_eq!(mediator.process_notifications(), 1);
        assert!(surface.instructions().is_empty());
        assert_eq!(mediator.state(), MediatorState::Idle);

        flaky.unavailable.store(false, Ordering::SeqCst);
        assert_eq!(mediator.process_notifications(), 0);
        let refreshes = surface.instructions();
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].inserted, vec![0]);
        assert_eq!(refreshes[0].older_loaded, Some(1));
        mediator.refresh_applied();

        // The load is no longer considered in flight.
        mediator.did_scroll_to_top().unwrap();
        let loads = session
            .commands()
            .into_iter()
            .filter(|c| matches!(c, SessionCommand::LoadOlder { .. }))
            .count();
        assert_eq!(loads, 2);
    }

    #[tokio::test]
    async fn waits_for_notification() {
        let mut f = fixture();
        let session = f.session.clone();
        let conversation = f.conversation.clone();
        std::thread::spawn(move || {
            session
                .receive(&conversation, Message::new("bob", "async", SendState::Sent))
                .unwrap();
        });
        assert!(f.mediator.wait_for_notifications().await >= 1);
        assert_eq!(f.surface.instructions()[0].inserted, vec![2]);
    }
}
