//! Canonical folder/chat/message state with all-or-nothing persistence.
//!
//! Every mutation runs against a draft copy of the document. The draft is
//! serialized and written to storage, and only a successful write replaces the
//! in-memory state, so a failed validation or a failed write leaves both the
//! memory and the storage untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::ledger::core::document::{
    ApiKeyEntry, BaseUrlKey, Chat, Folder, LedgerDocument, NEW_CHAT_TITLE, SavedPrompt,
};
use crate::ledger::core::errors::{LedgerError, LedgerResult};
use crate::ledger::core::ids::{ChatId, FolderId, IdSequence, PromptId};
use crate::ledger::core::message::Message;
use crate::ledger::pricing;
use crate::ledger::storage::DocumentStorage;

/// Maximum number of characters kept from a reply when naming a chat.
pub const AUTO_TITLE_MAX_CHARS: usize = 30;

/// Folder/chat/message state backed by durable storage.
pub struct ConversationStore {
    document: LedgerDocument,
    storage: Arc<dyn DocumentStorage>,
    ids: IdSequence,
}

impl ConversationStore {
    /// Load the stored document, or start from the default folder.
    ///
    /// The loaded (or fresh) document is written back immediately.
    ///
    /// # Errors
    /// Returns an error if storage access fails or the stored document is corrupt.
    pub async fn open(storage: Arc<dyn DocumentStorage>) -> LedgerResult<Self> {
        let document = match storage.read_document().await? {
            Some(body) => {
                let mut document: LedgerDocument = serde_json::from_str(&body)?;
                if document.ensure_default_folder() {
                    warn!("Stored ledger had no default folder, re-created it");
                }
                document
            }
            None => {
                info!("No stored ledger found, starting with the default folder");
                LedgerDocument::default()
            }
        };

        let store = Self {
            document,
            storage,
            ids: IdSequence::new(),
        };
        store.persist(&store.document).await?;

        info!(
            "Ledger loaded: {} folders, {} chats",
            store.document.folders.len(),
            store.document.chat_count()
        );
        Ok(store)
    }

    /// Apply `mutate` to a draft, persist the draft, then swap it in.
    async fn commit<T, F>(&mut self, mutate: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut LedgerDocument, &mut IdSequence) -> LedgerResult<T>,
    {
        let mut draft = self.document.clone();
        let mut ids = self.ids.clone();
        let output = mutate(&mut draft, &mut ids)?;

        self.persist(&draft).await?;
        self.document = draft;
        self.ids = ids;
        Ok(output)
    }

    async fn persist(&self, document: &LedgerDocument) -> LedgerResult<()> {
        let body = serde_json::to_string(document)?;
        self.storage.write_document(body).await
    }

    // ===== Queries ==========================================================

    /// The whole document.
    #[must_use]
    pub const fn document(&self) -> &LedgerDocument {
        &self.document
    }

    /// Folders in display order.
    #[must_use]
    pub fn folders(&self) -> &[Folder] {
        &self.document.folders
    }

    /// Find a chat in any folder.
    #[must_use]
    pub fn find_chat(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.document.chat(chat_id)
    }

    /// Find a chat or fail with `NotFound`.
    ///
    /// # Errors
    /// Returns `NotFound` when no folder holds the chat.
    pub fn chat(&self, chat_id: &ChatId) -> LedgerResult<&Chat> {
        self.document
            .chat(chat_id)
            .ok_or_else(|| LedgerError::not_found("chat", chat_id.as_str()))
    }

    /// Folder currently holding the chat.
    #[must_use]
    pub fn folder_of(&self, chat_id: &ChatId) -> Option<&FolderId> {
        self.document.folder_of(chat_id)
    }

    /// Total number of chats.
    #[must_use]
    pub fn chat_count(&self) -> usize {
        self.document.chat_count()
    }

    /// First chat in display order.
    #[must_use]
    pub fn first_chat_id(&self) -> Option<ChatId> {
        self.document.first_chat_id().cloned()
    }

    /// Saved prompt by id.
    #[must_use]
    pub fn prompt(&self, prompt_id: &PromptId) -> Option<&SavedPrompt> {
        self.document
            .saved_prompts
            .iter()
            .find(|prompt| &prompt.id == prompt_id)
    }

    /// Saved prompts whose name contains `term`, ignoring case.
    #[must_use]
    pub fn search_prompts(&self, term: &str) -> Vec<&SavedPrompt> {
        let needle = term.to_lowercase();
        self.document
            .saved_prompts
            .iter()
            .filter(|prompt| prompt.name.to_lowercase().contains(&needle))
            .collect()
    }

    // ===== Folders ==========================================================

    /// Create an empty folder at the end of the folder list.
    ///
    /// # Errors
    /// Returns `Validation` when the name is empty after trimming.
    pub async fn create_folder(&mut self, name: &str) -> LedgerResult<Folder> {
        let name = non_empty(name, "folder name")?;
        let folder = self
            .commit(|doc, ids| {
                let id = FolderId::new(ids.next_unused(|candidate| doc.id_in_use(candidate)));
                let folder = Folder::new(id, name);
                doc.folders.push(folder.clone());
                Ok(folder)
            })
            .await?;

        info!("Created folder {} ({})", folder.id, folder.name);
        Ok(folder)
    }

    /// Rename a folder.
    ///
    /// # Errors
    /// Returns `Protected` for the default folder, `Validation` for an empty
    /// name and `NotFound` for an unknown folder.
    pub async fn rename_folder(&mut self, folder_id: &FolderId, name: &str) -> LedgerResult<()> {
        if folder_id.is_default() {
            return Err(LedgerError::Protected(
                "the default folder cannot be renamed".to_string(),
            ));
        }
        let name = non_empty(name, "folder name")?;

        self.commit(|doc, _| {
            let folder = doc
                .folder_mut(folder_id)
                .ok_or_else(|| LedgerError::not_found("folder", folder_id.as_str()))?;
            folder.name = name.to_string();
            Ok(())
        })
        .await?;

        debug!("Renamed folder {} to {}", folder_id, name);
        Ok(())
    }

    /// Delete a folder together with all of its chats.
    ///
    /// Returns the ids of the chats that were removed.
    ///
    /// # Errors
    /// Returns `Protected` for the default folder and `NotFound` for an unknown folder.
    pub async fn delete_folder(&mut self, folder_id: &FolderId) -> LedgerResult<Vec<ChatId>> {
        if folder_id.is_default() {
            return Err(LedgerError::Protected(
                "the default folder cannot be deleted".to_string(),
            ));
        }

        let removed = self
            .commit(|doc, _| {
                let index = doc
                    .folders
                    .iter()
                    .position(|folder| &folder.id == folder_id)
                    .ok_or_else(|| LedgerError::not_found("folder", folder_id.as_str()))?;
                let folder = doc.folders.remove(index);
                Ok(folder.chats.into_iter().map(|chat| chat.id).collect::<Vec<_>>())
            })
            .await?;

        info!("Deleted folder {} with {} chats", folder_id, removed.len());
        Ok(removed)
    }

    // ===== Chats ============================================================

    /// Create an empty chat at the front of the folder.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown folder.
    pub async fn create_chat(&mut self, folder_id: &FolderId) -> LedgerResult<Chat> {
        let chat = self
            .commit(|doc, ids| {
                let id = ChatId::new(ids.next_unused(|candidate| doc.id_in_use(candidate)));
                let folder = doc
                    .folder_mut(folder_id)
                    .ok_or_else(|| LedgerError::not_found("folder", folder_id.as_str()))?;
                let chat = Chat::new(id);
                folder.chats.insert(0, chat.clone());
                Ok(chat)
            })
            .await?;

        info!("Created chat {} in folder {}", chat.id, folder_id);
        Ok(chat)
    }

    /// Delete a chat from whichever folder holds it.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn delete_chat(&mut self, chat_id: &ChatId) -> LedgerResult<()> {
        self.commit(|doc, _| {
            let folder = doc
                .folders
                .iter_mut()
                .find(|folder| folder.position_of(chat_id).is_some())
                .ok_or_else(|| LedgerError::not_found("chat", chat_id.as_str()))?;
            folder.chats.retain(|chat| &chat.id != chat_id);
            Ok(())
        })
        .await?;

        info!("Deleted chat {}", chat_id);
        Ok(())
    }

    /// Rename a chat.
    ///
    /// # Errors
    /// Returns `Validation` for an empty title and `NotFound` for an unknown chat.
    pub async fn rename_chat(&mut self, chat_id: &ChatId, title: &str) -> LedgerResult<()> {
        let title = non_empty(title, "chat title")?;
        self.commit(|doc, _| {
            let chat = chat_in(doc, chat_id)?;
            chat.title = title.to_string();
            Ok(())
        })
        .await
    }

    /// Move a chat to the end of another folder.
    ///
    /// Moving a chat to the folder that already holds it changes nothing.
    ///
    /// # Errors
    /// Returns `NotFound` when either the chat or the destination is unknown.
    pub async fn move_chat(&mut self, chat_id: &ChatId, destination: &FolderId) -> LedgerResult<()> {
        if self.document.folder(destination).is_none() {
            return Err(LedgerError::not_found("folder", destination.as_str()));
        }
        let source = self
            .document
            .folder_of(chat_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("chat", chat_id.as_str()))?;
        if &source == destination {
            return Ok(());
        }

        self.commit(|doc, _| {
            let from = doc
                .folder_mut(&source)
                .ok_or_else(|| LedgerError::not_found("folder", source.as_str()))?;
            let index = from
                .position_of(chat_id)
                .ok_or_else(|| LedgerError::not_found("chat", chat_id.as_str()))?;
            let chat = from.chats.remove(index);
            let to = doc
                .folder_mut(destination)
                .ok_or_else(|| LedgerError::not_found("folder", destination.as_str()))?;
            to.chats.push(chat);
            Ok(())
        })
        .await?;

        info!("Moved chat {} from {} to {}", chat_id, source, destination);
        Ok(())
    }

    // ===== Messages and totals ==============================================

    /// Append a message and add its tokens and cost to the chat totals.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn append_message(&mut self, chat_id: &ChatId, message: Message) -> LedgerResult<()> {
        let role = message.role;
        self.commit(|doc, _| {
            let chat = chat_in(doc, chat_id)?;
            chat.total_tokens += message.token_count;
            chat.total_cost += message.cost;
            chat.messages.push(message);
            Ok(())
        })
        .await?;

        debug!("Appended {} message to chat {}", role, chat_id);
        Ok(())
    }

    /// Add a contribution to the chat totals without adding a message.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn record_usage(&mut self, chat_id: &ChatId, tokens: u64, cost: f64) -> LedgerResult<()> {
        self.commit(|doc, _| {
            let chat = chat_in(doc, chat_id)?;
            chat.total_tokens += tokens;
            chat.total_cost += cost;
            Ok(())
        })
        .await
    }

    /// Leave every message at or before `timestamp` out of future requests.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn set_clear_context_checkpoint(
        &mut self,
        chat_id: &ChatId,
        timestamp: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.commit(|doc, _| {
            let chat = chat_in(doc, chat_id)?;
            chat.clear_context_timestamp = Some(timestamp);
            Ok(())
        })
        .await?;

        info!("Cleared context of chat {} at {}", chat_id, timestamp);
        Ok(())
    }

    /// Name a chat after its first reply.
    ///
    /// Fires only while the title is still the placeholder and the chat holds
    /// exactly one assistant message. Returns whether the title changed.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown chat.
    pub async fn auto_title(&mut self, chat_id: &ChatId, candidate: &str) -> LedgerResult<bool> {
        let chat = self.chat(chat_id)?;
        if chat.title != NEW_CHAT_TITLE || chat.assistant_count() != 1 {
            return Ok(false);
        }
        let Some(title) = title_from(candidate) else {
            return Ok(false);
        };

        self.commit(|doc, _| {
            let chat = chat_in(doc, chat_id)?;
            chat.title.clone_from(&title);
            Ok(())
        })
        .await?;

        debug!("Titled chat {} as {}", chat_id, title);
        Ok(true)
    }

    // ===== Settings =========================================================

    /// Register a named API key.
    ///
    /// # Errors
    /// Returns `Validation` for an empty name or key, or a duplicate name.
    pub async fn add_api_key(&mut self, name: &str, key: &str) -> LedgerResult<()> {
        let name = non_empty(name, "api key name")?;
        let key = non_empty(key, "api key")?;
        if self.document.api_keys.iter().any(|entry| entry.name == name) {
            return Err(LedgerError::Validation(format!(
                "an api key named {name} already exists"
            )));
        }

        self.commit(|doc, _| {
            doc.api_keys.push(ApiKeyEntry {
                name: name.to_string(),
                key: key.to_string(),
            });
            Ok(())
        })
        .await?;

        info!("Registered api key {}", name);
        Ok(())
    }

    /// Remove a named API key, clearing the selection if it was selected.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown name.
    pub async fn remove_api_key(&mut self, name: &str) -> LedgerResult<()> {
        self.commit(|doc, _| {
            let index = doc
                .api_keys
                .iter()
                .position(|entry| entry.name == name)
                .ok_or_else(|| LedgerError::not_found("api key", name))?;
            let removed = doc.api_keys.remove(index);
            if doc.selected_api_key == removed.key {
                doc.selected_api_key.clear();
            }
            Ok(())
        })
        .await
    }

    /// Select the key used for all requests.
    ///
    /// # Errors
    /// Returns `NotFound` when the key is not registered.
    pub async fn select_api_key(&mut self, key: &str) -> LedgerResult<()> {
        let Some(entry) = self.document.api_keys.iter().find(|entry| entry.key == key) else {
            return Err(LedgerError::not_found("api key", "<redacted>"));
        };
        let name = entry.name.clone();

        self.commit(|doc, _| {
            doc.selected_api_key = key.to_string();
            Ok(())
        })
        .await?;

        info!("Selected api key {}", name);
        Ok(())
    }

    /// Change the model, the provider and the system instruction in one write.
    /// `None` leaves a field as it is.
    ///
    /// # Errors
    /// Returns `Configuration` for a model missing from the pricing table.
    pub async fn update_settings(
        &mut self,
        model_id: Option<&str>,
        base_url_key: Option<BaseUrlKey>,
        instruction: Option<&str>,
    ) -> LedgerResult<()> {
        if let Some(model_id) = model_id {
            pricing::lookup(model_id)?;
        }
        self.commit(|doc, _| {
            if let Some(model_id) = model_id {
                doc.selected_model = model_id.to_string();
            }
            if let Some(key) = base_url_key {
                doc.base_url_key = key;
            }
            if let Some(instruction) = instruction {
                doc.initial_system_instruction = instruction.to_string();
            }
            Ok(())
        })
        .await
    }

    /// Set the instruction prepended to every request (empty to disable).
    ///
    /// # Errors
    /// Returns an error if persisting fails.
    pub async fn set_initial_system_instruction(&mut self, instruction: &str) -> LedgerResult<()> {
        self.commit(|doc, _| {
            doc.initial_system_instruction = instruction.to_string();
            Ok(())
        })
        .await
    }

    // ===== Saved prompts ====================================================

    /// Save a new prompt template.
    ///
    /// # Errors
    /// Returns `Validation` for an empty name or content.
    pub async fn create_prompt(&mut self, name: &str, content: &str) -> LedgerResult<SavedPrompt> {
        let name = non_empty(name, "prompt name")?;
        let content = non_empty(content, "prompt content")?;
        self.commit(|doc, ids| {
            let prompt = SavedPrompt {
                id: PromptId::new(ids.next_unused(|candidate| doc.id_in_use(candidate))),
                name: name.to_string(),
                content: content.to_string(),
            };
            doc.saved_prompts.push(prompt.clone());
            Ok(prompt)
        })
        .await
    }

    /// Replace a prompt's name and content.
    ///
    /// # Errors
    /// Returns `Validation` for an empty name or content and `NotFound` for an unknown prompt.
    pub async fn update_prompt(
        &mut self,
        prompt_id: &PromptId,
        name: &str,
        content: &str,
    ) -> LedgerResult<SavedPrompt> {
        let name = non_empty(name, "prompt name")?;
        let content = non_empty(content, "prompt content")?;
        self.commit(|doc, _| {
            let prompt = doc
                .saved_prompts
                .iter_mut()
                .find(|prompt| &prompt.id == prompt_id)
                .ok_or_else(|| LedgerError::not_found("prompt", prompt_id.as_str()))?;
            prompt.name = name.to_string();
            prompt.content = content.to_string();
            Ok(prompt.clone())
        })
        .await
    }

    /// Delete a prompt and return it.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown prompt.
    pub async fn delete_prompt(&mut self, prompt_id: &PromptId) -> LedgerResult<SavedPrompt> {
        self.commit(|doc, _| {
            let index = doc
                .saved_prompts
                .iter()
                .position(|prompt| &prompt.id == prompt_id)
                .ok_or_else(|| LedgerError::not_found("prompt", prompt_id.as_str()))?;
            Ok(doc.saved_prompts.remove(index))
        })
        .await
    }

    /// Copy a prompt under the name `"<name> (Copy)"`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown prompt.
    pub async fn duplicate_prompt(&mut self, prompt_id: &PromptId) -> LedgerResult<SavedPrompt> {
        self.commit(|doc, ids| {
            let source = doc
                .saved_prompts
                .iter()
                .find(|prompt| &prompt.id == prompt_id)
                .ok_or_else(|| LedgerError::not_found("prompt", prompt_id.as_str()))?;
            let copy = SavedPrompt {
                id: PromptId::new(ids.next_unused(|candidate| doc.id_in_use(candidate))),
                name: format!("{} (Copy)", source.name),
                content: source.content.clone(),
            };
            doc.saved_prompts.push(copy.clone());
            Ok(copy)
        })
        .await
    }

    // ===== Whole document ===================================================

    /// Replace the whole state.
    ///
    /// The default folder is re-created when absent.
    ///
    /// # Errors
    /// Returns `Validation` when a folder or chat id appears more than once.
    pub async fn replace_document(&mut self, mut document: LedgerDocument) -> LedgerResult<()> {
        if let Some(duplicate) = document.duplicate_folder_id() {
            return Err(LedgerError::Validation(format!(
                "folder id {duplicate} appears more than once"
            )));
        }
        if let Some(duplicate) = document.duplicate_chat_id() {
            return Err(LedgerError::Validation(format!(
                "chat id {duplicate} appears more than once"
            )));
        }
        if document.ensure_default_folder() {
            warn!("Replacement document had no default folder, re-created it");
        }

        self.commit(|doc, _| {
            *doc = document;
            Ok(())
        })
        .await?;

        info!(
            "Replaced ledger: {} folders, {} chats",
            self.document.folders.len(),
            self.document.chat_count()
        );
        Ok(())
    }
}

fn non_empty<'a>(value: &'a str, what: &str) -> LedgerResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::Validation(format!("{what} must not be empty")));
    }
    Ok(trimmed)
}

fn chat_in<'a>(doc: &'a mut LedgerDocument, chat_id: &ChatId) -> LedgerResult<&'a mut Chat> {
    doc.chat_mut(chat_id)
        .ok_or_else(|| LedgerError::not_found("chat", chat_id.as_str()))
}

/// Title derived from a reply: its first line as written, cut to
/// [`AUTO_TITLE_MAX_CHARS`] characters with `"..."` when cut. A blank first
/// line yields `None`.
#[must_use]
pub fn title_from(candidate: &str) -> Option<String> {
    let first_line = candidate.lines().next().unwrap_or_default();
    if first_line.trim().is_empty() {
        return None;
    }
    if first_line.chars().count() <= AUTO_TITLE_MAX_CHARS {
        return Some(first_line.to_string());
    }
    let cut: String = first_line.chars().take(AUTO_TITLE_MAX_CHARS).collect();
    Some(format!("{cut}..."))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::core::message::Role;
    use crate::ledger::storage::MemoryDocumentStorage;
    use std::collections::HashSet;

    async fn open_store() -> (ConversationStore, Arc<MemoryDocumentStorage>) {
        let storage = Arc::new(MemoryDocumentStorage::new());
        let store = ConversationStore::open(storage.clone())
            .await
            .expect("open store");
        (store, storage)
    }

    fn stored(storage: &MemoryDocumentStorage) -> LedgerDocument {
        let body = storage.snapshot().expect("document written");
        serde_json::from_str(&body).expect("valid json")
    }

    fn assert_membership_invariant(store: &ConversationStore) {
        let mut seen = HashSet::new();
        let mut total = 0;
        for folder in store.folders() {
            total += folder.chats.len();
            for chat in &folder.chats {
                assert!(seen.insert(chat.id.clone()), "chat {} in two folders", chat.id);
            }
        }
        assert_eq!(total, store.chat_count());
    }

    #[tokio::test]
    async fn test_open_initializes_and_persists_default_folder() {
        let (store, storage) = open_store().await;
        assert_eq!(store.folders().len(), 1);
        assert!(store.folders()[0].id.is_default());
        assert_eq!(stored(&storage), *store.document());
    }

    #[tokio::test]
    async fn test_open_repairs_missing_default_folder() {
        let body = r#"{"folders":[{"id":"work","name":"Work","chats":[]}]}"#;
        let storage = Arc::new(MemoryDocumentStorage::with_document(body));
        let store = ConversationStore::open(storage).await.expect("open store");
        assert!(store.folders()[0].id.is_default());
        assert_eq!(store.folders()[1].name, "Work");
    }

    #[tokio::test]
    async fn test_create_folder_rejects_empty_name() {
        let (mut store, _) = open_store().await;
        let result = store.create_folder("   ").await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(store.folders().len(), 1);
    }

    #[tokio::test]
    async fn test_create_and_rename_folder() {
        let (mut store, storage) = open_store().await;
        let folder = store.create_folder("  Work ").await.expect("create");
        assert_eq!(folder.name, "Work");
        store.rename_folder(&folder.id, "Office").await.expect("rename");
        assert_eq!(store.folders()[1].name, "Office");
        assert_eq!(stored(&storage).folders[1].name, "Office");

        let missing = store.rename_folder(&FolderId::from("nope"), "x").await;
        assert!(matches!(missing, Err(LedgerError::NotFound { .. })));
        let empty = store.rename_folder(&folder.id, "").await;
        assert!(matches!(empty, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_default_folder_is_protected() {
        let (mut store, _) = open_store().await;
        store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        let before = store.document().clone();

        let deleted = store.delete_folder(&FolderId::default_folder()).await;
        assert!(matches!(deleted, Err(LedgerError::Protected(_))));
        let renamed = store
            .rename_folder(&FolderId::default_folder(), "Other")
            .await;
        assert!(matches!(renamed, Err(LedgerError::Protected(_))));
        assert_eq!(*store.document(), before);
    }

    #[tokio::test]
    async fn test_delete_folder_removes_its_chats() {
        let (mut store, _) = open_store().await;
        let folder = store.create_folder("Work").await.expect("folder");
        let chat = store.create_chat(&folder.id).await.expect("chat");
        let kept = store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        let removed = store.delete_folder(&folder.id).await.expect("delete");
        assert_eq!(removed, vec![chat.id.clone()]);
        assert!(store.find_chat(&chat.id).is_none());
        assert!(store.find_chat(&kept.id).is_some());
        assert_eq!(store.folders().len(), 1);
    }

    #[tokio::test]
    async fn test_create_chat_inserts_at_front() {
        let (mut store, _) = open_store().await;
        let default = FolderId::default_folder();
        let first = store.create_chat(&default).await.expect("chat");
        let second = store.create_chat(&default).await.expect("chat");

        assert_ne!(first.id, second.id);
        assert_eq!(store.folders()[0].chats[0].id, second.id);
        assert_eq!(first.title, NEW_CHAT_TITLE);
        assert_eq!(first.total_tokens, 0);
        assert!(first.clear_context_timestamp.is_none());

        let missing = store.create_chat(&FolderId::from("nope")).await;
        assert!(matches!(missing, Err(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_and_rename_chat() {
        let (mut store, _) = open_store().await;
        let chat = store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        store.rename_chat(&chat.id, "Plans").await.expect("rename");
        assert_eq!(store.chat(&chat.id).expect("chat").title, "Plans");

        store.delete_chat(&chat.id).await.expect("delete");
        let again = store.delete_chat(&chat.id).await;
        assert!(matches!(again, Err(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_move_chat_between_folders() {
        let (mut store, _) = open_store().await;
        let work = store.create_folder("Work").await.expect("folder");
        let existing = store.create_chat(&work.id).await.expect("chat");
        let chat = store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");

        store.move_chat(&chat.id, &work.id).await.expect("move");
        assert_eq!(store.folder_of(&chat.id), Some(&work.id));
        let order: Vec<_> = store.folders()[1].chats.iter().map(|c| c.id.clone()).collect();
        assert_eq!(order, vec![existing.id, chat.id.clone()]);
        assert!(store.folders()[0].chats.is_empty());
        assert_membership_invariant(&store);

        let bad_dest = store.move_chat(&chat.id, &FolderId::from("nope")).await;
        assert!(matches!(bad_dest, Err(LedgerError::NotFound { .. })));
        let bad_chat = store.move_chat(&ChatId::from("nope"), &work.id).await;
        assert!(matches!(bad_chat, Err(LedgerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_move_chat_to_current_folder_is_noop() {
        let (mut store, _) = open_store().await;
        let default = FolderId::default_folder();
        let a = store.create_chat(&default).await.expect("chat");
        let _b = store.create_chat(&default).await.expect("chat");
        let before = store.document().clone();

        store.move_chat(&a.id, &default).await.expect("noop move");
        assert_eq!(*store.document(), before);
    }

    #[tokio::test]
    async fn test_append_message_accumulates_totals() {
        let (mut store, storage) = open_store().await;
        let chat = store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        let now = Utc::now();
        let input = Message::priced(Role::User, "a".repeat(40), now, 0.15);
        let output = Message::priced(Role::Assistant, "b".repeat(80), now, 0.6);
        assert_eq!(input.token_count, 10);
        assert_eq!(output.token_count, 20);

        store.append_message(&chat.id, input).await.expect("append");
        store.append_message(&chat.id, output).await.expect("append");

        let chat = store.chat(&chat.id).expect("chat");
        assert_eq!(chat.total_tokens, 30);
        assert_eq!(chat.total_cost, 10.0 / 1e6 * 0.15 + 20.0 / 1e6 * 0.6);
        assert_eq!(stored(&storage).chat(&chat.id).map(|c| c.messages.len()), Some(2));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let (mut store, storage) = open_store().await;
        let before = store.document().clone();
        storage.set_fail_writes(true);

        let result = store.create_folder("Work").await;
        assert!(result.is_err());
        assert_eq!(*store.document(), before);

        storage.set_fail_writes(false);
        store.create_folder("Work").await.expect("create after recovery");
        assert_eq!(store.folders().len(), 2);
    }

    #[tokio::test]
    async fn test_auto_title_fires_once() {
        let (mut store, _) = open_store().await;
        let chat = store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        let now = Utc::now();

        let early = store.auto_title(&chat.id, "hi there").await.expect("title");
        assert!(!early, "no assistant reply yet");

        store
            .append_message(&chat.id, Message::priced(Role::User, "hello", now, 0.15))
            .await
            .expect("append");
        store
            .append_message(&chat.id, Message::priced(Role::Assistant, "hi there", now, 0.6))
            .await
            .expect("append");

        assert!(store.auto_title(&chat.id, "hi there\nsecond line").await.expect("title"));
        assert_eq!(store.chat(&chat.id).expect("chat").title, "hi there");
        assert!(!store.auto_title(&chat.id, "something else").await.expect("title"));
        assert_eq!(store.chat(&chat.id).expect("chat").title, "hi there");
    }

    #[test]
    fn test_title_from_truncates_long_lines() {
        let long = "This reply starts with a rather long opening sentence";
        let title = title_from(long).expect("title");
        assert_eq!(title, "This reply starts with a rathe...");
        assert_eq!(title_from("short\nrest").as_deref(), Some("short"));
        assert_eq!(title_from("\nlate start"), None);
        assert_eq!(title_from("   \nlate start"), None);
        assert_eq!(title_from("  indented").as_deref(), Some("  indented"));
    }

    #[tokio::test]
    async fn test_clear_context_checkpoint_keeps_messages() {
        let (mut store, _) = open_store().await;
        let chat = store
            .create_chat(&FolderId::default_folder())
            .await
            .expect("chat");
        store
            .append_message(&chat.id, Message::priced(Role::User, "hello", Utc::now(), 0.15))
            .await
            .expect("append");
        let checkpoint = Utc::now();
        store
            .set_clear_context_checkpoint(&chat.id, checkpoint)
            .await
            .expect("checkpoint");

        let chat = store.chat(&chat.id).expect("chat");
        assert_eq!(chat.clear_context_timestamp, Some(checkpoint));
        assert_eq!(chat.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_api_key_lifecycle() {
        let (mut store, _) = open_store().await;
        store.add_api_key("personal", "sk-1").await.expect("add");
        let dup = store.add_api_key("personal", "sk-2").await;
        assert!(matches!(dup, Err(LedgerError::Validation(_))));

        let unknown = store.select_api_key("sk-404").await;
        assert!(matches!(unknown, Err(LedgerError::NotFound { .. })));

        store.select_api_key("sk-1").await.expect("select");
        assert_eq!(store.document().selected_api_key, "sk-1");

        store.remove_api_key("personal").await.expect("remove");
        assert!(store.document().selected_api_key.is_empty());
        assert!(store.document().api_keys.is_empty());
    }

    #[tokio::test]
    async fn test_selected_model_must_be_known() {
        let (mut store, _) = open_store().await;
        let unknown = store
            .update_settings(Some("acme/unknown"), Some(BaseUrlKey::Groq), None)
            .await;
        assert!(matches!(unknown, Err(LedgerError::Configuration(_))));
        assert_eq!(store.document().base_url_key, BaseUrlKey::default());

        store
            .update_settings(Some("anthropic/claude-3.5-sonnet"), None, None)
            .await
            .expect("model");
        assert_eq!(store.document().selected_model, "anthropic/claude-3.5-sonnet");
    }

    #[tokio::test]
    async fn test_settings_update_is_one_write() {
        let (mut store, storage) = open_store().await;
        storage.fail_after_writes(1);
        store
            .update_settings(
                Some("anthropic/claude-3.5-sonnet"),
                Some(BaseUrlKey::Groq),
                Some("Be brief."),
            )
            .await
            .expect("settings");

        let saved = stored(&storage);
        assert_eq!(saved.selected_model, "anthropic/claude-3.5-sonnet");
        assert_eq!(saved.base_url_key, BaseUrlKey::Groq);
        assert_eq!(saved.initial_system_instruction, "Be brief.");

        let failed = store
            .update_settings(Some(pricing::DEFAULT_MODEL_ID), Some(BaseUrlKey::Together), None)
            .await;
        assert!(matches!(failed, Err(LedgerError::Io(_))));
        assert_eq!(store.document().selected_model, "anthropic/claude-3.5-sonnet");
        assert_eq!(store.document().base_url_key, BaseUrlKey::Groq);
        assert_eq!(stored(&storage).base_url_key, BaseUrlKey::Groq);
    }

    #[tokio::test]
    async fn test_prompt_lifecycle() {
        let (mut store, _) = open_store().await;
        let prompt = store
            .create_prompt("Reviewer", "Review the code.")
            .await
            .expect("prompt");
        let copy = store.duplicate_prompt(&prompt.id).await.expect("copy");
        assert_eq!(copy.name, "Reviewer (Copy)");
        assert_ne!(copy.id, prompt.id);

        store
            .update_prompt(&prompt.id, "Editor", "Edit the text.")
            .await
            .expect("update");
        assert_eq!(store.search_prompts("edit").len(), 1);
        assert_eq!(store.search_prompts("REVIEWER").len(), 1);

        let removed = store.delete_prompt(&copy.id).await.expect("delete");
        assert_eq!(removed.id, copy.id);
        assert!(store.prompt(&copy.id).is_none());

        let empty = store.create_prompt("", "content").await;
        assert!(matches!(empty, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_replace_document_rejects_duplicate_chat_ids() {
        let (mut store, _) = open_store().await;
        let mut doc = LedgerDocument::default();
        let mut work = Folder::new(FolderId::from("work"), "Work");
        work.chats.push(Chat::new(ChatId::from("1")));
        doc.folders[0].chats.push(Chat::new(ChatId::from("1")));
        doc.folders.push(work);

        let before = store.document().clone();
        let result = store.replace_document(doc).await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(*store.document(), before);
    }

    #[tokio::test]
    async fn test_replace_document_rejects_duplicate_folder_ids() {
        let (mut store, storage) = open_store().await;
        let mut first = Folder::new(FolderId::from("work"), "Work");
        first.chats.push(Chat::new(ChatId::from("1")));
        let mut second = Folder::new(FolderId::from("work"), "Work");
        second.chats.push(Chat::new(ChatId::from("2")));
        let mut doc = LedgerDocument::default();
        doc.folders.push(first);
        doc.folders.push(second);

        let before = store.document().clone();
        let result = store.replace_document(doc).await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(*store.document(), before);
        assert_eq!(stored(&storage), before);
    }

    #[tokio::test]
    async fn test_ids_unique_across_folders() {
        let (mut store, _) = open_store().await;
        let work = store.create_folder("Work").await.expect("folder");
        for _ in 0..5 {
            store
                .create_chat(&FolderId::default_folder())
                .await
                .expect("chat");
            store.create_chat(&work.id).await.expect("chat");
        }
        assert_eq!(store.chat_count(), 10);
        assert_membership_invariant(&store);
    }
}
