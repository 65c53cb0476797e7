//! Context window construction for completion requests.

use chrono::{DateTime, Utc};

use crate::ledger::core::document::Chat;
use crate::ledger::core::message::{ChatMessage, Message};

/// Messages newer than the clear-context checkpoint, in order.
///
/// Every message is relevant while no checkpoint is set.
#[must_use]
pub fn relevant_context(messages: &[Message], checkpoint: Option<DateTime<Utc>>) -> Vec<&Message> {
    messages
        .iter()
        .filter(|msg| checkpoint.is_none_or(|cut| msg.timestamp > cut))
        .collect()
}

fn with_instruction<'a>(
    instruction: &str,
    messages: impl IntoIterator<Item = &'a Message>,
) -> Vec<ChatMessage> {
    let system = (!instruction.is_empty()).then(|| ChatMessage::system(instruction));
    system
        .into_iter()
        .chain(messages.into_iter().map(Message::to_chat_message))
        .collect()
}

/// Context for a send: the relevant window, which already ends with the new
/// user message, behind the system instruction when one is set.
#[must_use]
pub fn send_context(chat: &Chat, instruction: &str) -> Vec<ChatMessage> {
    let relevant = relevant_context(&chat.messages, chat.clear_context_timestamp);
    let context = with_instruction(instruction, relevant);
    tracing::debug!("Built send context for chat {}: {} messages", chat.id, context.len());
    context
}

/// Context for a regeneration: the relevant window without its last element,
/// then `target`, behind the system instruction when one is set.
#[must_use]
pub fn regenerate_context(chat: &Chat, target: &Message, instruction: &str) -> Vec<ChatMessage> {
    let mut relevant = relevant_context(&chat.messages, chat.clear_context_timestamp);
    relevant.pop();
    relevant.push(target);
    let context = with_instruction(instruction, relevant);
    tracing::debug!(
        "Built regenerate context for chat {}: {} messages",
        chat.id,
        context.len()
    );
    context
}
