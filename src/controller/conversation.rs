//! Conversation controller: send, regenerate and clear-context flows over the
//! store, plus the session view (active chat and regenerated replies).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::controller::context::{regenerate_context, send_context};
use crate::gateway::{CompletionGateway, CompletionReply, CompletionRequest, KeyUsage};
use crate::ledger::core::config::GatewayConfig;
use crate::ledger::core::document::{BaseUrlKey, Chat, Folder, LedgerDocument, SavedPrompt};
use crate::ledger::core::errors::{LedgerError, LedgerResult};
use crate::ledger::core::ids::{ChatId, FolderId, PromptId};
use crate::ledger::core::message::{ChatMessage, Message, Role};
use crate::ledger::pricing::{self, ModelPricing, ModelSummary};
use crate::ledger::store::ConversationStore;

/// Alternate assistant replies keyed by position in the main message sequence.
pub type RegeneratedResponses = BTreeMap<usize, Vec<Message>>;

/// Transient per-session state. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Chat shown to the user.
    pub active_chat: Option<ChatId>,
    /// Regenerated replies for the active chat.
    pub regenerated: RegeneratedResponses,
}

/// Result of a successful send.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    /// Chat the reply was attributed to.
    pub chat_id: ChatId,
    /// Assistant message appended to the chat.
    pub message: Message,
    /// Chat title after the turn.
    pub title: String,
}

/// Settings as shown to the user; key values stay hidden.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    /// Names of the registered API keys.
    pub api_keys: Vec<String>,
    /// Name of the selected key.
    pub selected_api_key: Option<String>,
    /// Selected model.
    pub selected_model: String,
    /// Selected provider.
    pub base_url_key: BaseUrlKey,
    /// Instruction prepended to every request.
    pub initial_system_instruction: String,
}

/// Partial settings update; absent fields stay unchanged.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    /// New model.
    pub selected_model: Option<String>,
    /// New provider.
    pub base_url_key: Option<BaseUrlKey>,
    /// New system instruction.
    pub initial_system_instruction: Option<String>,
}

struct LedgerState {
    store: ConversationStore,
    session: SessionView,
}

impl LedgerState {
    fn activate(&mut self, chat_id: Option<ChatId>) {
        if self.session.active_chat != chat_id {
            self.session.regenerated.clear();
        }
        self.session.active_chat = chat_id;
    }

    fn activate_first(&mut self) {
        let first = self.store.first_chat_id();
        self.activate(first);
    }
}

/// In-flight mark for one chat, released on drop.
struct LoadingGuard<'a> {
    loading: &'a DashSet<ChatId>,
    chat_id: ChatId,
}

impl<'a> LoadingGuard<'a> {
    fn acquire(loading: &'a DashSet<ChatId>, chat_id: &ChatId) -> LedgerResult<Self> {
        if !loading.insert(chat_id.clone()) {
            return Err(LedgerError::Busy(chat_id.to_string()));
        }
        Ok(Self {
            loading,
            chat_id: chat_id.clone(),
        })
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.loading.remove(&self.chat_id);
    }
}

/// Request parameters resolved from the document.
struct RequestSettings {
    api_key: String,
    model: String,
    base_url: String,
    pricing: &'static ModelPricing,
}

impl RequestSettings {
    fn request(self, messages: Vec<ChatMessage>) -> CompletionRequest {
        CompletionRequest {
            messages,
            api_key: self.api_key,
            model: self.model,
            base_url: self.base_url,
        }
    }
}

/// A turn between its provisional insert and the provider's answer.
struct PendingTurn<'a> {
    chat_id: ChatId,
    output_price: f64,
    _guard: LoadingGuard<'a>,
}

/// Drives conversations against a completion gateway.
pub struct ConversationController {
    state: Mutex<LedgerState>,
    loading: DashSet<ChatId>,
    gateway: Arc<dyn CompletionGateway>,
    request_timeout: Duration,
    base_url_override: Option<String>,
}

impl ConversationController {
    /// Build a controller; the first chat becomes active.
    #[must_use]
    pub fn new(
        store: ConversationStore,
        gateway: Arc<dyn CompletionGateway>,
        config: &GatewayConfig,
    ) -> Self {
        let session = SessionView {
            active_chat: store.first_chat_id(),
            regenerated: RegeneratedResponses::new(),
        };
        if let Some(base_url) = &config.base_url_override {
            info!("All providers routed to {}", base_url);
        }
        Self {
            state: Mutex::new(LedgerState { store, session }),
            loading: DashSet::new(),
            gateway,
            request_timeout: config.request_timeout(),
            base_url_override: config.base_url_override.clone(),
        }
    }

    /// Replace the completion timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn request_settings(&self, document: &LedgerDocument) -> LedgerResult<RequestSettings> {
        if document.selected_api_key.is_empty() {
            return Err(LedgerError::Configuration(
                "no API key selected".to_string(),
            ));
        }
        let pricing = pricing::lookup(&document.selected_model)?;
        let base_url = self
            .base_url_override
            .clone()
            .unwrap_or_else(|| document.base_url_key.base_url().to_string());

        Ok(RequestSettings {
            api_key: document.selected_api_key.clone(),
            model: document.selected_model.clone(),
            base_url,
            pricing,
        })
    }

    async fn call_gateway(
        &self,
        chat_id: &ChatId,
        request: CompletionRequest,
    ) -> LedgerResult<CompletionReply> {
        let result = tokio::time::timeout(self.request_timeout, self.gateway.complete(request))
            .await
            .unwrap_or_else(|_| {
                Err(LedgerError::Network(format!(
                    "request timed out after {:?}",
                    self.request_timeout
                )))
            });

        if let Err(e) = &result {
            warn!("Completion for chat {} failed: {}", chat_id, e);
        }
        result
    }

    // ===== Session ==========================================================

    /// Current session view.
    pub async fn session(&self) -> SessionView {
        self.state.lock().await.session.clone()
    }

    /// Whether a request for the chat is in flight.
    #[must_use]
    pub fn is_loading(&self, chat_id: &ChatId) -> bool {
        self.loading.contains(chat_id)
    }

    /// Make a chat active. Switching chats drops the regenerated replies.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn select_chat(&self, chat_id: &ChatId) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.store.chat(chat_id)?;
        state.activate(Some(chat_id.clone()));
        Ok(())
    }

    /// Create a chat at the front of a folder and make it active.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown folder.
    pub async fn new_chat(&self, folder_id: &FolderId) -> LedgerResult<Chat> {
        let mut state = self.state.lock().await;
        let chat = state.store.create_chat(folder_id).await?;
        state.activate(Some(chat.id.clone()));
        Ok(chat)
    }

    // ===== Send =============================================================

    /// Send a user message to the active chat.
    ///
    /// # Errors
    /// Returns `Validation` when no chat is active, plus every error of
    /// [`Self::send_to_chat`].
    pub async fn send_message(&self, content: &str) -> LedgerResult<TurnReply> {
        let active = self.state.lock().await.session.active_chat.clone();
        let chat_id =
            active.ok_or_else(|| LedgerError::Validation("no active chat".to_string()))?;
        self.send_to_chat(&chat_id, content).await
    }

    /// Send a user message to a chat and append the provider's reply.
    ///
    /// The user message is persisted before the request and kept when the
    /// request fails. The reply always lands in `chat_id`, whichever chat is
    /// active when it arrives.
    ///
    /// # Errors
    /// Returns `Validation` for empty content, `NotFound` for an unknown chat,
    /// `Configuration` without a key or with an unknown model, `Busy` while a
    /// request for the chat is in flight, and any gateway error.
    pub async fn send_to_chat(&self, chat_id: &ChatId, content: &str) -> LedgerResult<TurnReply> {
        if content.trim().is_empty() {
            return Err(LedgerError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let (pending, request) = self.begin_send(chat_id, content).await?;
        let reply = self.call_gateway(chat_id, request).await?;
        self.finish_send(pending, reply).await
    }

    async fn begin_send(
        &self,
        chat_id: &ChatId,
        content: &str,
    ) -> LedgerResult<(PendingTurn<'_>, CompletionRequest)> {
        let mut state = self.state.lock().await;
        let timestamp = state.store.chat(chat_id)?.next_timestamp(Utc::now());
        let settings = self.request_settings(state.store.document())?;
        let guard = LoadingGuard::acquire(&self.loading, chat_id)?;

        let user = Message::priced(
            Role::User,
            content,
            timestamp,
            settings.pricing.input_cost_per_million,
        );
        state.store.append_message(chat_id, user).await?;

        let instruction = state.store.document().initial_system_instruction.clone();
        let messages = send_context(state.store.chat(chat_id)?, &instruction);
        let output_price = settings.pricing.output_cost_per_million;

        Ok((
            PendingTurn {
                chat_id: chat_id.clone(),
                output_price,
                _guard: guard,
            },
            settings.request(messages),
        ))
    }

    async fn finish_send(
        &self,
        pending: PendingTurn<'_>,
        reply: CompletionReply,
    ) -> LedgerResult<TurnReply> {
        let mut state = self.state.lock().await;
        let chat_id = &pending.chat_id;
        let timestamp = state.store.chat(chat_id)?.next_timestamp(Utc::now());
        let message = Message::priced(Role::Assistant, reply.content, timestamp, pending.output_price);

        state.store.append_message(chat_id, message.clone()).await?;
        state.store.auto_title(chat_id, &message.content).await?;
        let title = state.store.chat(chat_id)?.title.clone();

        info!(
            "Chat {} received a reply ({} tokens)",
            chat_id, message.token_count
        );
        Ok(TurnReply {
            chat_id: chat_id.clone(),
            message,
            title,
        })
    }

    // ===== Regenerate =======================================================

    /// Ask again for the most recent user message of the active chat.
    ///
    /// The reply joins the regenerated replies for the last position of the
    /// chat while that chat is still active; the main sequence is untouched.
    /// Its output cost counts toward the chat totals.
    ///
    /// # Errors
    /// Returns `Validation` without an active chat or user message,
    /// `Configuration`, `Busy`, and any gateway error.
    pub async fn regenerate(&self) -> LedgerResult<Message> {
        let (pending, slot, request) = {
            let state = self.state.lock().await;
            let chat_id = state
                .session
                .active_chat
                .clone()
                .ok_or_else(|| LedgerError::Validation("no active chat".to_string()))?;
            let chat = state.store.chat(&chat_id)?;
            let (_, target) = chat.last_user_message().ok_or_else(|| {
                LedgerError::Validation("chat has no user message to regenerate".to_string())
            })?;
            let settings = self.request_settings(state.store.document())?;
            let guard = LoadingGuard::acquire(&self.loading, &chat_id)?;

            let messages = regenerate_context(
                chat,
                target,
                &state.store.document().initial_system_instruction,
            );
            let slot = chat.messages.len().saturating_sub(1);
            let output_price = settings.pricing.output_cost_per_million;
            (
                PendingTurn {
                    chat_id,
                    output_price,
                    _guard: guard,
                },
                slot,
                settings.request(messages),
            )
        };

        let reply = self.call_gateway(&pending.chat_id, request).await?;

        let mut state = self.state.lock().await;
        let message = Message::priced(
            Role::Assistant,
            reply.content,
            Utc::now(),
            pending.output_price,
        );
        state
            .store
            .record_usage(&pending.chat_id, message.token_count, message.cost)
            .await?;
        if state.session.active_chat.as_ref() == Some(&pending.chat_id) {
            state
                .session
                .regenerated
                .entry(slot)
                .or_default()
                .push(message.clone());
        }

        info!("Regenerated reply {} for chat {}", slot, pending.chat_id);
        Ok(message)
    }

    // ===== Clear context ====================================================

    /// Exclude every current message of the chat (the active chat when
    /// `None`) from future requests.
    ///
    /// # Errors
    /// Returns `Validation` without an active chat and `NotFound` for an unknown chat.
    pub async fn clear_context(&self, chat_id: Option<&ChatId>) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let chat_id = match chat_id {
            Some(id) => id.clone(),
            None => state
                .session
                .active_chat
                .clone()
                .ok_or_else(|| LedgerError::Validation("no active chat".to_string()))?,
        };
        let checkpoint = state.store.chat(&chat_id)?.next_timestamp(Utc::now());
        state
            .store
            .set_clear_context_checkpoint(&chat_id, checkpoint)
            .await
    }

    // ===== Folders and chats ================================================

    /// Snapshot of all folders with their chats.
    pub async fn folders(&self) -> Vec<Folder> {
        self.state.lock().await.store.folders().to_vec()
    }

    /// Snapshot of one chat.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn chat(&self, chat_id: &ChatId) -> LedgerResult<Chat> {
        self.state.lock().await.store.chat(chat_id).cloned()
    }

    /// Create a folder.
    ///
    /// # Errors
    /// Returns `Validation` for an empty name.
    pub async fn create_folder(&self, name: &str) -> LedgerResult<Folder> {
        self.state.lock().await.store.create_folder(name).await
    }

    /// Rename a folder.
    ///
    /// # Errors
    /// Returns `Protected`, `Validation` or `NotFound`.
    pub async fn rename_folder(&self, folder_id: &FolderId, name: &str) -> LedgerResult<()> {
        self.state
            .lock()
            .await
            .store
            .rename_folder(folder_id, name)
            .await
    }

    /// Delete a folder and its chats; the first remaining chat becomes active
    /// when the active one went with it.
    ///
    /// # Errors
    /// Returns `Protected` or `NotFound`.
    pub async fn delete_folder(&self, folder_id: &FolderId) -> LedgerResult<Vec<ChatId>> {
        let mut state = self.state.lock().await;
        let removed = state.store.delete_folder(folder_id).await?;
        if state
            .session
            .active_chat
            .as_ref()
            .is_some_and(|active| removed.contains(active))
        {
            state.activate_first();
        }
        Ok(removed)
    }

    /// Delete a chat; the first remaining chat becomes active when it was active.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn delete_chat(&self, chat_id: &ChatId) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.store.delete_chat(chat_id).await?;
        if state.session.active_chat.as_ref() == Some(chat_id) {
            state.activate_first();
        }
        Ok(())
    }

    /// Rename a chat.
    ///
    /// # Errors
    /// Returns `Validation` or `NotFound`.
    pub async fn rename_chat(&self, chat_id: &ChatId, title: &str) -> LedgerResult<()> {
        self.state.lock().await.store.rename_chat(chat_id, title).await
    }

    /// Move a chat to another folder.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat or folder.
    pub async fn move_chat(&self, chat_id: &ChatId, destination: &FolderId) -> LedgerResult<()> {
        self.state
            .lock()
            .await
            .store
            .move_chat(chat_id, destination)
            .await
    }

    // ===== Settings and keys ================================================

    /// Current settings.
    pub async fn settings(&self) -> SettingsView {
        let state = self.state.lock().await;
        let doc = state.store.document();
        SettingsView {
            api_keys: doc.api_keys.iter().map(|entry| entry.name.clone()).collect(),
            selected_api_key: doc
                .api_keys
                .iter()
                .find(|entry| entry.key == doc.selected_api_key)
                .map(|entry| entry.name.clone()),
            selected_model: doc.selected_model.clone(),
            base_url_key: doc.base_url_key,
            initial_system_instruction: doc.initial_system_instruction.clone(),
        }
    }

    /// Apply a partial settings update as a single write.
    ///
    /// # Errors
    /// Returns `Configuration` for an unknown model; nothing changes then.
    pub async fn update_settings(&self, update: SettingsUpdate) -> LedgerResult<SettingsView> {
        self.state
            .lock()
            .await
            .store
            .update_settings(
                update.selected_model.as_deref(),
                update.base_url_key,
                update.initial_system_instruction.as_deref(),
            )
            .await?;
        Ok(self.settings().await)
    }

    /// Register a named API key.
    ///
    /// # Errors
    /// Returns `Validation` for empty fields or a duplicate name.
    pub async fn add_api_key(&self, name: &str, key: &str) -> LedgerResult<()> {
        self.state.lock().await.store.add_api_key(name, key).await
    }

    /// Remove a named API key.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown name.
    pub async fn remove_api_key(&self, name: &str) -> LedgerResult<()> {
        self.state.lock().await.store.remove_api_key(name).await
    }

    /// Select a registered key by name.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown name.
    pub async fn select_api_key(&self, name: &str) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let key = state
            .store
            .document()
            .api_keys
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.key.clone())
            .ok_or_else(|| LedgerError::not_found("api key", name))?;
        state.store.select_api_key(&key).await
    }

    /// Models available for selection.
    #[must_use]
    pub fn models(&self) -> Vec<ModelSummary> {
        pricing::catalog()
    }

    /// Credit usage of the selected key.
    ///
    /// # Errors
    /// Returns `Configuration` without a selected key, and any gateway error.
    pub async fn key_usage(&self) -> LedgerResult<KeyUsage> {
        let (api_key, base_url) = {
            let state = self.state.lock().await;
            let doc = state.store.document();
            if doc.selected_api_key.is_empty() {
                return Err(LedgerError::Configuration(
                    "no API key selected".to_string(),
                ));
            }
            let base_url = self
                .base_url_override
                .clone()
                .unwrap_or_else(|| doc.base_url_key.base_url().to_string());
            (doc.selected_api_key.clone(), base_url)
        };

        tokio::time::timeout(
            self.request_timeout,
            self.gateway.key_usage(&api_key, &base_url),
        )
        .await
        .unwrap_or_else(|_| Err(LedgerError::Network("usage request timed out".to_string())))
    }

    // ===== Saved prompts ====================================================

    /// Saved prompts, filtered by name when a term is given.
    pub async fn prompts(&self, term: Option<&str>) -> Vec<SavedPrompt> {
        let state = self.state.lock().await;
        match term {
            Some(term) => state.store.search_prompts(term).into_iter().cloned().collect(),
            None => state.store.document().saved_prompts.clone(),
        }
    }

    /// Save a prompt template.
    ///
    /// # Errors
    /// Returns `Validation` for an empty name or content.
    pub async fn create_prompt(&self, name: &str, content: &str) -> LedgerResult<SavedPrompt> {
        self.state.lock().await.store.create_prompt(name, content).await
    }

    /// Update a prompt template.
    ///
    /// # Errors
    /// Returns `Validation` or `NotFound`.
    pub async fn update_prompt(
        &self,
        prompt_id: &PromptId,
        name: &str,
        content: &str,
    ) -> LedgerResult<SavedPrompt> {
        self.state
            .lock()
            .await
            .store
            .update_prompt(prompt_id, name, content)
            .await
    }

    /// Delete a prompt template.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown prompt.
    pub async fn delete_prompt(&self, prompt_id: &PromptId) -> LedgerResult<SavedPrompt> {
        self.state.lock().await.store.delete_prompt(prompt_id).await
    }

    /// Copy a prompt template.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown prompt.
    pub async fn duplicate_prompt(&self, prompt_id: &PromptId) -> LedgerResult<SavedPrompt> {
        self.state.lock().await.store.duplicate_prompt(prompt_id).await
    }

    /// Use a saved prompt as the system instruction.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown prompt.
    pub async fn apply_prompt(&self, prompt_id: &PromptId) -> LedgerResult<SavedPrompt> {
        let mut state = self.state.lock().await;
        let prompt = state
            .store
            .prompt(prompt_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("prompt", prompt_id.as_str()))?;
        state
            .store
            .set_initial_system_instruction(&prompt.content)
            .await?;
        info!("Applied prompt {} as system instruction", prompt.name);
        Ok(prompt)
    }

    // ===== Export / import ==================================================

    /// The persisted document as JSON.
    ///
    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub async fn export(&self) -> LedgerResult<serde_json::Value> {
        let state = self.state.lock().await;
        Ok(serde_json::to_value(state.store.document())?)
    }

    /// Replace all state with an exported document and reset the session.
    ///
    /// # Errors
    /// Returns `Validation` for a document missing required keys, one that
    /// does not decode, or one that repeats a chat id.
    pub async fn import(&self, value: serde_json::Value) -> LedgerResult<()> {
        let Some(object) = value.as_object() else {
            return Err(LedgerError::Validation(
                "import must be a JSON object".to_string(),
            ));
        };
        let missing: Vec<&str> = LedgerDocument::REQUIRED_KEYS
            .into_iter()
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(LedgerError::Validation(format!(
                "missing keys: {}",
                missing.join(", ")
            )));
        }

        let document: LedgerDocument = serde_json::from_value(value)
            .map_err(|e| LedgerError::Validation(format!("malformed document: {e}")))?;

        let mut state = self.state.lock().await;
        state.store.replace_document(document).await?;
        state.session = SessionView::default();
        state.activate_first();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gateway::scripted::ScriptedGateway;
    use crate::ledger::storage::MemoryDocumentStorage;
    use tokio::sync::Notify;

    async fn controller_with(gateway: Arc<ScriptedGateway>) -> Arc<ConversationController> {
        let storage = Arc::new(MemoryDocumentStorage::new());
        let store = ConversationStore::open(storage).await.expect("store");
        let controller =
            ConversationController::new(store, gateway, &GatewayConfig::default());
        controller
            .add_api_key("personal", "sk-test")
            .await
            .expect("add key");
        controller.select_api_key("personal").await.expect("select key");
        Arc::new(controller)
    }

    async fn controller_on(storage: Arc<MemoryDocumentStorage>) -> ConversationController {
        let store = ConversationStore::open(storage).await.expect("store");
        ConversationController::new(
            store,
            Arc::new(ScriptedGateway::new()),
            &GatewayConfig::default(),
        )
    }

    async fn wait_for_requests(gateway: &ScriptedGateway, count: usize) {
        while gateway.requests().len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_and_regenerate_scenario() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_reply("hi there");
        gateway.push_reply("hey");
        let controller = controller_with(gateway.clone()).await;
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let turn = controller.send_message("hello").await.expect("send");
        assert_eq!(turn.chat_id, chat.id);
        assert_eq!(turn.title, "hi there");

        let stored = controller.chat(&chat.id).await.expect("chat");
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].role, Role::User);
        assert_eq!(stored.messages[1].content, "hi there");
        assert_eq!(stored.total_tokens, 4);
        let expected = 2.0 / 1e6 * 0.15 + 2.0 / 1e6 * 0.6;
        assert!((stored.total_cost - expected).abs() < 1e-15);

        let alternate = controller.regenerate().await.expect("regenerate");
        assert_eq!(alternate.content, "hey");
        let session = controller.session().await;
        assert_eq!(session.regenerated.get(&1).map(Vec::len), Some(1));

        let stored = controller.chat(&chat.id).await.expect("chat");
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.total_tokens, 5);
    }

    #[tokio::test]
    async fn test_request_carries_selected_settings() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_reply("ok");
        let controller = controller_with(gateway.clone()).await;
        let prompt = controller
            .create_prompt("Terse", "Answer briefly.")
            .await
            .expect("prompt");
        controller.apply_prompt(&prompt.id).await.expect("apply");
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        controller.send_to_chat(&chat.id, "hello").await.expect("send");

        let requests = gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].api_key, "sk-test");
        assert_eq!(requests[0].base_url, "https://openrouter.ai/api/v1");
        assert_eq!(requests[0].messages[0], ChatMessage::system("Answer briefly."));
        assert_eq!(requests[0].messages.len(), 2);
        let stored = controller.chat(&chat.id).await.expect("chat");
        assert!(stored.messages.iter().all(|msg| msg.role != Role::System));
    }

    #[tokio::test]
    async fn test_missing_key_is_configuration_error() {
        let gateway = Arc::new(ScriptedGateway::new());
        let storage = Arc::new(MemoryDocumentStorage::new());
        let store = ConversationStore::open(storage).await.expect("store");
        let controller =
            ConversationController::new(store, gateway.clone(), &GatewayConfig::default());
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let result = controller.send_message("hello").await;
        assert!(matches!(result, Err(LedgerError::Configuration(_))));
        assert!(gateway.requests().is_empty());
        assert!(controller.chat(&chat.id).await.expect("chat").messages.is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let gateway = Arc::new(ScriptedGateway::new());
        let controller = controller_with(gateway.clone()).await;
        controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        let result = controller.send_message("   ").await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_user_message() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_error(LedgerError::RateLimit("slow down".to_string()));
        gateway.push_reply("second try");
        let controller = controller_with(gateway.clone()).await;
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let failed = controller.send_message("hello").await;
        assert!(matches!(failed, Err(LedgerError::RateLimit(_))));
        let stored = controller.chat(&chat.id).await.expect("chat");
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].role, Role::User);
        assert!(!controller.is_loading(&chat.id));

        controller.send_message("hello again").await.expect("retry");
        assert_eq!(controller.chat(&chat.id).await.expect("chat").messages.len(), 3);
    }

    #[tokio::test]
    async fn test_second_send_while_loading_is_busy() {
        let hold = Arc::new(Notify::new());
        let gateway = Arc::new(ScriptedGateway::held(hold.clone()));
        gateway.push_reply("hi there");
        let controller = controller_with(gateway.clone()).await;
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let first = tokio::spawn({
            let controller = controller.clone();
            let chat_id = chat.id.clone();
            async move { controller.send_to_chat(&chat_id, "hello").await }
        });
        wait_for_requests(&gateway, 1).await;
        assert!(controller.is_loading(&chat.id));

        let second = controller.send_to_chat(&chat.id, "again").await;
        assert!(matches!(second, Err(LedgerError::Busy(_))));

        hold.notify_one();
        let first = first.await.expect("join");
        assert!(first.is_ok());
        assert!(!controller.is_loading(&chat.id));
        assert_eq!(controller.chat(&chat.id).await.expect("chat").messages.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_lands_in_originating_chat() {
        let hold = Arc::new(Notify::new());
        let gateway = Arc::new(ScriptedGateway::held(hold.clone()));
        gateway.push_reply("hi there");
        let controller = controller_with(gateway.clone()).await;
        let first_chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send_message("hello").await }
        });
        wait_for_requests(&gateway, 1).await;

        let other = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        hold.notify_one();
        let turn = pending.await.expect("join").expect("send");

        assert_eq!(turn.chat_id, first_chat.id);
        assert_eq!(
            controller.chat(&first_chat.id).await.expect("chat").messages.len(),
            2
        );
        assert!(controller.chat(&other.id).await.expect("chat").messages.is_empty());
        assert_eq!(controller.session().await.active_chat, Some(other.id));
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let hold = Arc::new(Notify::new());
        let gateway = Arc::new(ScriptedGateway::held(hold));
        gateway.push_reply("too late");
        let storage = Arc::new(MemoryDocumentStorage::new());
        let store = ConversationStore::open(storage).await.expect("store");
        let controller =
            ConversationController::new(store, gateway, &GatewayConfig::default())
                .with_request_timeout(Duration::from_millis(20));
        controller.add_api_key("k", "sk").await.expect("key");
        controller.select_api_key("k").await.expect("select");
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let result = controller.send_message("hello").await;
        assert!(matches!(result, Err(LedgerError::Network(_))));
        assert!(!controller.is_loading(&chat.id));
    }

    #[tokio::test]
    async fn test_clear_context_limits_next_request() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_reply("first reply");
        gateway.push_reply("second reply");
        let controller = controller_with(gateway.clone()).await;
        controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        controller.send_message("hello").await.expect("send");
        controller.clear_context(None).await.expect("clear");
        controller.send_message("fresh start").await.expect("send");

        let requests = gateway.requests();
        let last: Vec<&str> = requests[1]
            .messages
            .iter()
            .map(|msg| msg.content.as_str())
            .collect();
        assert_eq!(last, vec!["fresh start"]);
    }

    #[tokio::test]
    async fn test_regenerate_without_user_message() {
        let gateway = Arc::new(ScriptedGateway::new());
        let controller = controller_with(gateway).await;
        controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        let result = controller.regenerate().await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_switching_chats_resets_regenerated() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_reply("hi there");
        gateway.push_reply("alternate");
        let controller = controller_with(gateway).await;
        let chat = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        controller.send_message("hello").await.expect("send");
        controller.regenerate().await.expect("regenerate");
        assert!(!controller.session().await.regenerated.is_empty());

        let other = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        assert!(controller.session().await.regenerated.is_empty());
        controller.select_chat(&chat.id).await.expect("select");
        assert_ne!(controller.session().await.active_chat, Some(other.id));
    }

    #[tokio::test]
    async fn test_deleting_active_chat_selects_first() {
        let gateway = Arc::new(ScriptedGateway::new());
        let controller = controller_with(gateway).await;
        let work = controller.create_folder("Work").await.expect("folder");
        let kept = controller
            .new_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        let doomed = controller.new_chat(&work.id).await.expect("chat");

        controller.delete_folder(&work.id).await.expect("delete");
        assert_eq!(controller.session().await.active_chat, Some(kept.id.clone()));
        assert!(matches!(
            controller.chat(&doomed.id).await,
            Err(LedgerError::NotFound { .. })
        ));

        controller.delete_chat(&kept.id).await.expect("delete");
        assert_eq!(controller.session().await.active_chat, None);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_reply("hi there");
        let controller = controller_with(gateway).await;
        let work = controller.create_folder("Work").await.expect("folder");
        controller.new_chat(&work.id).await.expect("chat");
        controller.send_message("hello").await.expect("send");
        let exported = controller.export().await.expect("export");

        let fresh = controller_with(Arc::new(ScriptedGateway::new())).await;
        fresh.import(exported.clone()).await.expect("import");
        assert_eq!(fresh.export().await.expect("export"), exported);
        assert_eq!(fresh.folders().await.len(), 2);
        assert!(fresh.session().await.active_chat.is_some());
    }

    #[tokio::test]
    async fn test_import_rejects_missing_keys() {
        let controller = controller_with(Arc::new(ScriptedGateway::new())).await;
        let before = controller.export().await.expect("export");
        let result = controller
            .import(serde_json::json!({"folders": [], "apiKeys": []}))
            .await;
        let Err(LedgerError::Validation(message)) = result else {
            panic!("expected validation error");
        };
        assert!(message.contains("initialSystemInstruction"));
        assert!(message.contains("baseUrlKey"));
        assert_eq!(controller.export().await.expect("export"), before);
    }

    #[tokio::test]
    async fn test_import_restores_default_folder() {
        let controller = controller_with(Arc::new(ScriptedGateway::new())).await;
        controller
            .import(serde_json::json!({
                "folders": [{"id": "work", "name": "Work", "chats": []}],
                "apiKeys": [],
                "initialSystemInstruction": "",
                "savedPrompts": [],
                "baseUrlKey": "groq"
            }))
            .await
            .expect("import");
        let folders = controller.folders().await;
        assert!(folders[0].id.is_default());
        assert_eq!(controller.settings().await.base_url_key, BaseUrlKey::Groq);
        assert_eq!(controller.settings().await.selected_api_key, None);
    }

    #[tokio::test]
    async fn test_settings_update_and_usage() {
        let controller = controller_with(Arc::new(ScriptedGateway::new())).await;
        let bad = controller
            .update_settings(SettingsUpdate {
                selected_model: Some("acme/unknown".to_string()),
                ..SettingsUpdate::default()
            })
            .await;
        assert!(matches!(bad, Err(LedgerError::Configuration(_))));

        let view = controller
            .update_settings(SettingsUpdate {
                base_url_key: Some(BaseUrlKey::Together),
                initial_system_instruction: Some("Be kind.".to_string()),
                ..SettingsUpdate::default()
            })
            .await
            .expect("update");
        assert_eq!(view.base_url_key, BaseUrlKey::Together);
        assert_eq!(view.selected_api_key.as_deref(), Some("personal"));
        assert_eq!(view.api_keys, vec!["personal".to_string()]);

        let usage = controller.key_usage().await.expect("usage");
        assert_eq!(usage.data.label, "scripted");
        assert_eq!(controller.models().len(), 6);
    }

    #[tokio::test]
    async fn test_failed_settings_write_changes_nothing() {
        let storage = Arc::new(MemoryDocumentStorage::new());
        let controller = controller_on(storage.clone()).await;
        let before = controller.settings().await;

        storage.fail_after_writes(0);
        let failed = controller
            .update_settings(SettingsUpdate {
                selected_model: Some("anthropic/claude-3.5-sonnet".to_string()),
                base_url_key: Some(BaseUrlKey::Groq),
                initial_system_instruction: Some("Be brief.".to_string()),
            })
            .await;
        assert!(matches!(failed, Err(LedgerError::Io(_))));
        assert_eq!(controller.settings().await, before);

        storage.fail_after_writes(1);
        let view = controller
            .update_settings(SettingsUpdate {
                selected_model: Some("anthropic/claude-3.5-sonnet".to_string()),
                base_url_key: Some(BaseUrlKey::Groq),
                initial_system_instruction: None,
            })
            .await
            .expect("one write is enough");
        assert_eq!(view.selected_model, "anthropic/claude-3.5-sonnet");
        assert_eq!(view.base_url_key, BaseUrlKey::Groq);
    }
}
