//! UniFFI bindings for atlas-core.
//!
//! Provides a ConversationClient object that wraps the loopback session,
//! the conversation mediator and the settings store into a single FFI-safe
//! interface for Swift/Kotlin chat screens.

use std::cell::Cell;
use std::sync::{Arc, Mutex};

use atlas_core::{
    self, Avatar as CoreAvatar, ChangeSignal, ConversationDataSource, ConversationDelegate,
    ConversationId, ConversationMediator, LocalSession, MediatorState as CoreMediatorState,
    Message as CoreMessage, Participant as CoreParticipant, ParticipantInfo as CoreParticipantInfo,
    PresentationSurface, RefreshInstruction as CoreRefreshInstruction, ScreenCoordinator,
    ScreenIntent, SendState as CoreSendState, SessionCommand, SettingsStore,
};

uniffi::include_scaffolding!("atlas");

const DEFAULT_LOG_FILTER: &str = "atlas_core=debug,atlas_ffi=debug";

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using ConversationClient.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .init();
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum SendState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl From<CoreSendState> for SendState {
    fn from(s: CoreSendState) -> Self {
        match s {
            CoreSendState::Pending => Self::Pending,
            CoreSendState::Sent => Self::Sent,
            CoreSendState::Delivered => Self::Delivered,
            CoreSendState::Failed => Self::Failed,
        }
    }
}

impl From<SendState> for CoreSendState {
    fn from(s: SendState) -> Self {
        match s {
            SendState::Pending => Self::Pending,
            SendState::Sent => Self::Sent,
            SendState::Delivered => Self::Delivered,
            SendState::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MediatorState {
    Unbound,
    Idle,
    Refreshing,
}

impl From<CoreMediatorState> for MediatorState {
    fn from(s: CoreMediatorState) -> Self {
        match s {
            CoreMediatorState::Unbound => Self::Unbound,
            CoreMediatorState::Idle => Self::Idle,
            CoreMediatorState::Refreshing => Self::Refreshing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl From<Participant> for CoreParticipant {
    fn from(p: Participant) -> Self {
        Self {
            id: p.id.into(),
            display_name: p.display_name,
            avatar: p.avatar,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub sent_at_ms: i64,
    pub state: SendState,
    pub is_unread: bool,
}

impl From<CoreMessage> for Message {
    fn from(m: CoreMessage) -> Self {
        Self {
            id: m.id.to_string(),
            sender: m.sender.to_string(),
            content: m.content,
            sent_at_ms: m.sent_at.timestamp_millis(),
            state: m.state.into(),
            is_unread: m.is_unread,
        }
    }
}

impl From<Message> for CoreMessage {
    fn from(m: Message) -> Self {
        Self {
            id: m.id.into(),
            sender: m.sender.into(),
            content: m.content,
            sent_at: chrono::DateTime::from_timestamp_millis(m.sent_at_ms).unwrap_or_default(),
            state: m.state.into(),
            is_unread: m.is_unread,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Avatar {
    Image { url: String },
    Initials { text: String },
    Placeholder,
}

impl From<CoreAvatar> for Avatar {
    fn from(a: CoreAvatar) -> Self {
        match a {
            CoreAvatar::Image(url) => Self::Image { url },
            CoreAvatar::Initials(text) => Self::Initials { text },
            CoreAvatar::Placeholder => Self::Placeholder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub display_name: String,
    pub avatar: Avatar,
}

impl From<CoreParticipantInfo> for ParticipantInfo {
    fn from(p: CoreParticipantInfo) -> Self {
        Self {
            display_name: p.display_name,
            avatar: p.avatar.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshInstruction {
    pub inserted: Vec<u32>,
    pub updated: Vec<u32>,
    pub removed: Vec<u32>,
    pub participants: Vec<String>,
    pub older_loaded: Option<u32>,
    pub reload: bool,
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn indices(list: Vec<usize>) -> Vec<u32> {
    list.into_iter().map(to_u32).collect()
}

impl From<CoreRefreshInstruction> for RefreshInstruction {
    fn from(r: CoreRefreshInstruction) -> Self {
        Self {
            inserted: indices(r.inserted),
            updated: indices(r.updated),
            removed: indices(r.removed),
            participants: r.participants.into_iter().map(|p| p.to_string()).collect(),
            older_loaded: r.older_loaded.map(to_u32),
            reload: r.reload,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutboundCommand {
    Send { conversation_id: String, message_id: String },
    Resend { conversation_id: String, message_id: String },
    MarkRead { conversation_id: String, message_id: String },
    LoadOlder { conversation_id: String },
}

impl From<SessionCommand> for OutboundCommand {
    fn from(c: SessionCommand) -> Self {
        match c {
            SessionCommand::Send { conversation, message } => Self::Send {
                conversation_id: conversation.to_string(),
                message_id: message.to_string(),
            },
            SessionCommand::Resend { conversation, message } => Self::Resend {
                conversation_id: conversation.to_string(),
                message_id: message.to_string(),
            },
            SessionCommand::MarkRead { conversation, message } => Self::MarkRead {
                conversation_id: conversation.to_string(),
                message_id: message.to_string(),
            },
            SessionCommand::LoadOlder { conversation } => Self::LoadOlder {
                conversation_id: conversation.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub marks_messages_as_read: bool,
    pub placeholder_avatar: Option<String>,
    pub max_message_length: u32,
    pub show_status_labels: bool,
}

impl From<atlas_core::Settings> for Settings {
    fn from(s: atlas_core::Settings) -> Self {
        Self {
            marks_messages_as_read: s.marks_messages_as_read,
            placeholder_avatar: s.placeholder_avatar,
            max_message_length: u32::try_from(s.max_message_length).unwrap_or(u32::MAX),
            show_status_labels: s.show_status_labels,
        }
    }
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    #[error("Out of range: {msg}")]
    OutOfRange { msg: String },
    #[error("Not found: {msg}")]
    NotFound { msg: String },
    #[error("Not bound: {msg}")]
    NotBound { msg: String },
    #[error("Invalid draft: {msg}")]
    InvalidDraft { msg: String },
    #[error("Session error: {msg}")]
    Session { msg: String },
}

impl From<atlas_core::AtlasError> for AtlasError {
    fn from(e: atlas_core::AtlasError) -> Self {
        tracing::error!("AtlasError: {e}");
        let msg = e.to_string();
        match e {
            atlas_core::AtlasError::OutOfRange { .. } => Self::OutOfRange { msg },
            atlas_core::AtlasError::ParticipantNotFound(_)
            | atlas_core::AtlasError::ConversationNotFound(_) => Self::NotFound { msg },
            atlas_core::AtlasError::NotBound => Self::NotBound { msg },
            atlas_core::AtlasError::InvalidDraft(_) => Self::InvalidDraft { msg },
            atlas_core::AtlasError::Session(_) => Self::Session { msg },
        }
    }
}

// ── Callback interface ────────────────────────────────────────────────

pub trait ConversationListener: Send + Sync {
    fn on_refresh(&self, instruction: RefreshInstruction);
    fn on_show_profile(&self, participant_id: String);
    /// Notifications are queued. May fire on any thread; the host should hop
    /// to its main thread and call `process_notifications()`.
    fn on_changes_pending(&self);
}

// ── Bridge: core surface and coordinator → FFI callback ───────────────
//
// Core callbacks fire while the mediator lock is held. They are buffered and
// handed to the foreign listener only after the lock is released, so the
// listener may call straight back into the client.

thread_local! {
    static IN_MEDIATOR: Cell<bool> = const { Cell::new(false) };
}

enum BridgeEvent {
    Refresh(CoreRefreshInstruction),
    ShowProfile(String),
    ChangesPending,
}

struct BridgeListener {
    ffi_listener: Arc<dyn ConversationListener>,
    pending: Mutex<Vec<BridgeEvent>>,
}

impl BridgeListener {
    fn deliver(&self) {
        let events = std::mem::take(&mut *self.pending.lock().unwrap());
        for event in events {
            match event {
                BridgeEvent::Refresh(instruction) => self.ffi_listener.on_refresh(instruction.into()),
                BridgeEvent::ShowProfile(participant) => self.ffi_listener.on_show_profile(participant),
                BridgeEvent::ChangesPending => self.ffi_listener.on_changes_pending(),
            }
        }
    }
}

impl PresentationSurface for BridgeListener {
    fn apply_refresh(&self, instruction: CoreRefreshInstruction) {
        self.pending.lock().unwrap().push(BridgeEvent::Refresh(instruction));
    }
}

impl ScreenCoordinator for BridgeListener {
    fn handle_intent(&self, intent: ScreenIntent) {
        match intent {
            ScreenIntent::ShowProfile(participant) => self
                .pending
                .lock()
                .unwrap()
                .push(BridgeEvent::ShowProfile(participant.to_string())),
        }
    }
}

impl ChangeSignal for BridgeListener {
    fn changes_pending(&self) {
        // Emitted from inside a mediator call on this thread: wait for the unlock.
        if IN_MEDIATOR.with(Cell::get) {
            self.pending.lock().unwrap().push(BridgeEvent::ChangesPending);
        } else {
            self.ffi_listener.on_changes_pending();
        }
    }
}

// ── ConversationClient: main FFI object ───────────────────────────────

/// One chat screen's worth of state. Mediator calls are expected on the
/// host's main thread; transport hooks may be called from anywhere.
pub struct ConversationClient {
    session: LocalSession,
    mediator: Mutex<ConversationMediator>,
    bridge: Mutex<Option<Arc<BridgeListener>>>,
    settings: SettingsStore,
}

impl ConversationClient {
    pub fn new(data_dir: String, user_id: String, display_name: String) -> Self {
        let settings = SettingsStore::new(&data_dir);
        let session = LocalSession::new(CoreParticipant::new(user_id, display_name));
        let mediator = ConversationMediator::new(Arc::new(session.clone()), settings.get());
        tracing::info!("ConversationClient created for {}", session.me().id);
        Self {
            session,
            mediator: Mutex::new(mediator),
            bridge: Mutex::new(None),
            settings,
        }
    }

    /// Run `f` against the mediator, then hand buffered callbacks to the listener.
    fn with_mediator<T>(&self, f: impl FnOnce(&mut ConversationMediator) -> T) -> T {
        let mut mediator = self.mediator.lock().unwrap();
        IN_MEDIATOR.with(|flag| flag.set(true));
        let result = f(&mut mediator);
        IN_MEDIATOR.with(|flag| flag.set(false));
        drop(mediator);
        let bridge = self.bridge.lock().unwrap().clone();
        if let Some(bridge) = bridge {
            bridge.deliver();
        }
        result
    }

    pub fn create_conversation(&self, participants: Vec<Participant>) -> String {
        self.session
            .create_conversation(participants.into_iter().map(CoreParticipant::from).collect())
            .to_string()
    }

    pub fn attach(
        &self,
        conversation_id: String,
        listener: Box<dyn ConversationListener>,
    ) -> Result<(), AtlasError> {
        let bridge = Arc::new(BridgeListener {
            ffi_listener: Arc::from(listener),
            pending: Mutex::new(Vec::new()),
        });
        self.with_mediator(|mediator| {
            mediator.attach(ConversationId::from(conversation_id), bridge.clone())?;
            mediator.set_coordinator(Some(bridge.clone()));
            mediator.set_change_signal(Some(bridge.clone()));
            Ok::<_, atlas_core::AtlasError>(())
        })?;
        *self.bridge.lock().unwrap() = Some(bridge);
        Ok(())
    }

    pub fn detach(&self) {
        self.with_mediator(|mediator| {
            mediator.detach();
            mediator.set_coordinator(None);
            mediator.set_change_signal(None);
        });
        *self.bridge.lock().unwrap() = None;
    }

    pub fn state(&self) -> MediatorState {
        self.with_mediator(|mediator| mediator.state()).into()
    }

    pub fn process_notifications(&self) -> u32 {
        to_u32(self.with_mediator(|mediator| mediator.process_notifications()))
    }

    pub fn refresh_applied(&self) {
        self.with_mediator(|mediator| mediator.refresh_applied());
    }

    pub fn message_count(&self) -> u32 {
        self.with_mediator(|mediator| match mediator.conversation() {
            Some(conversation) => to_u32(mediator.message_count(conversation)),
            None => 0,
        })
    }

    pub fn message_at(&self, index: u32) -> Result<Message, AtlasError> {
        let message = self.with_mediator(|mediator| mediator.message_at(index as usize).cloned())?;
        Ok(message.into())
    }

    pub fn participant_info(&self, participant_id: String) -> Result<ParticipantInfo, AtlasError> {
        let info = self.with_mediator(|mediator| mediator.participant_info(&participant_id.into()))?;
        Ok(info.into())
    }

    pub fn avatar_for(&self, message: Message) -> Avatar {
        self.with_mediator(|mediator| mediator.avatar_for(&message.into()))
            .into()
    }

    pub fn timestamp_label(&self, index: u32) -> Result<String, AtlasError> {
        Ok(self.with_mediator(|mediator| mediator.timestamp_label(index as usize))?)
    }

    pub fn status_label(&self, index: u32) -> Result<Option<String>, AtlasError> {
        Ok(self.with_mediator(|mediator| mediator.status_label(index as usize))?)
    }

    pub fn should_show_sender(&self, index: u32) -> Result<bool, AtlasError> {
        Ok(self.with_mediator(|mediator| mediator.should_show_sender(index as usize))?)
    }

    pub fn send_message(&self, draft: String) -> Result<(), AtlasError> {
        Ok(self.with_mediator(|mediator| mediator.did_tap_send(&draft))?)
    }

    pub fn resend_message(&self, index: u32) -> Result<(), AtlasError> {
        Ok(self.with_mediator(|mediator| {
            let message = mediator.message_at(index as usize)?.clone();
            mediator.did_tap_resend(&message)
        })?)
    }

    pub fn tap_participant(&self, participant_id: String) {
        self.with_mediator(|mediator| mediator.did_tap_participant(&participant_id.into()));
    }

    pub fn scroll_to_top(&self) -> Result<(), AtlasError> {
        Ok(self.with_mediator(|mediator| mediator.did_scroll_to_top())?)
    }

    pub fn message_displayed(&self, index: u32) -> Result<(), AtlasError> {
        Ok(self.with_mediator(|mediator| mediator.did_display_message(index as usize))?)
    }

    pub fn receive_message(&self, conversation_id: String, message: Message) -> Result<(), AtlasError> {
        Ok(self.session.receive(&conversation_id.into(), message.into())?)
    }

    pub fn acknowledge(
        &self,
        conversation_id: String,
        message_id: String,
        state: SendState,
    ) -> Result<(), AtlasError> {
        Ok(self
            .session
            .acknowledge(&conversation_id.into(), &message_id.into(), state.into())?)
    }

    pub fn complete_history_load(&self, conversation_id: String) -> Result<u32, AtlasError> {
        let count = self.session.complete_history_load(&conversation_id.into())?;
        Ok(to_u32(count))
    }

    pub fn take_outbox(&self) -> Vec<OutboundCommand> {
        self.session
            .drain_commands()
            .into_iter()
            .map(OutboundCommand::from)
            .collect()
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get().into()
    }

    pub fn set_marks_messages_as_read(&self, enabled: bool) {
        self.settings.set_marks_messages_as_read(enabled);
        self.sync_settings();
    }

    pub fn set_placeholder_avatar(&self, avatar: Option<String>) {
        self.settings.set_placeholder_avatar(avatar);
        self.sync_settings();
    }

    pub fn set_max_message_length(&self, max: u32) {
        self.settings.set_max_message_length(max as usize);
        self.sync_settings();
    }

    pub fn set_show_status_labels(&self, enabled: bool) {
        self.settings.set_show_status_labels(enabled);
        self.sync_settings();
    }

    fn sync_settings(&self) {
        let settings = self.settings.get();
        self.with_mediator(|mediator| mediator.set_settings(settings));
    }
}
