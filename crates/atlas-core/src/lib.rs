//! Atlas conversation core.
//!
//! Pure Rust crate with no platform dependencies. Mediates between a
//! messaging session and a native chat view; consumed by UI shells via
//! UniFFI bindings.

pub mod errors;
pub mod local;
pub mod mediator;
pub mod model;
mod projection;
pub mod session;
pub mod settings;

pub use errors::AtlasError;
pub use local::{LocalSession, SessionCommand};
pub use mediator::{
    ChangeSignal, ConversationDataSource, ConversationDelegate, ConversationMediator, MediatorState,
    PresentationSurface, ScreenCoordinator,
};
pub use model::{
    Avatar, ChangeNotification, ConversationId, Message, MessageId, Participant, ParticipantId,
    ParticipantInfo, RefreshInstruction, ScreenIntent, SendState,
};
pub use session::{ChangeListener, SessionController, SubscriptionHandle, SubscriptionRegistry};
pub use settings::{Settings, SettingsStore};
