//! Conversation controller and context construction.
//!
//! ## Modules
//!
//! - `context`: context windows sent to the provider
//! - `conversation`: send/regenerate/clear flows and the session view

pub mod context;
pub mod conversation;

pub use context::{regenerate_context, relevant_context, send_context};
pub use conversation::{
    ConversationController, RegeneratedResponses, SessionView, SettingsUpdate, SettingsView,
    TurnReply,
};
