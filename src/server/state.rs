//! Application state shared across all request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::controller::ConversationController;

/// Shared application state.
pub struct AppState {
    /// Conversation controller owning the store and the session.
    pub controller: ConversationController,
    /// Directory served as the browser front-end.
    pub static_dir: PathBuf,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(controller: ConversationController, static_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            static_dir: static_dir.into(),
        })
    }
}
