//! `ConversationStore` — consumed, not specified, by the engines: an
//! in-memory implementation suitable for the gateway's default wiring and
//! for tests. Grounded on the teacher's `runtime/runs.rs` in-memory-store
//! shape; a SQL-backed implementation is out of scope here (spec §9 names
//! the interface as the migration seam).

use parking_lot::Mutex;
use sa_domain::records::{Conversation, Message, MessageRole};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConversationStoreError {
    #[error("conversation_not_found")]
    NotFound,
}

pub trait ConversationStore: Send + Sync {
    fn list_conversations(&self, account_root_id: &str) -> Vec<Conversation>;
    fn create_conversation(&self, owner_key_id: &str, account_root_id: &str) -> Conversation;
    fn get_conversation(&self, account_root_id: &str, id: Uuid) -> Result<Conversation, ConversationStoreError>;
    fn add_user_message(&self, account_root_id: &str, id: Uuid, content: &str) -> Result<Message, ConversationStoreError>;
    fn add_assistant_message(
        &self,
        account_root_id: &str,
        id: Uuid,
        stage1_summary: &str,
        stage2_summary: &str,
        stage3: &str,
    ) -> Result<Message, ConversationStoreError>;
    fn update_conversation_title(&self, account_root_id: &str, id: Uuid, title: &str) -> Result<(), ConversationStoreError>;
    fn messages(&self, account_root_id: &str, id: Uuid) -> Result<Vec<Message>, ConversationStoreError>;
}

struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
}

/// All methods scope by `account_root_id`: a conversation owned by one
/// account is invisible (not merely unwritable) to another, matching the
/// `conversation_not_found` account-isolation behavior.
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<Uuid, ConversationRecord>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self { conversations: Mutex::new(HashMap::new()) }
    }

    fn owned_by(record: &ConversationRecord, account_root_id: &str) -> bool {
        record.conversation.account_root_id == account_root_id
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn list_conversations(&self, account_root_id: &str) -> Vec<Conversation> {
        self.conversations
            .lock()
            .values()
            .filter(|r| Self::owned_by(r, account_root_id))
            .map(|r| r.conversation.clone())
            .collect()
    }

    fn create_conversation(&self, owner_key_id: &str, account_root_id: &str) -> Conversation {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner_key_id: owner_key_id.to_string(),
            account_root_id: account_root_id.to_string(),
            title: None,
            created_at: chrono::Utc::now(),
        };
        self.conversations
            .lock()
            .insert(conversation.id, ConversationRecord { conversation: conversation.clone(), messages: Vec::new() });
        conversation
    }

    fn get_conversation(&self, account_root_id: &str, id: Uuid) -> Result<Conversation, ConversationStoreError> {
        let guard = self.conversations.lock();
        let record = guard.get(&id).filter(|r| Self::owned_by(r, account_root_id));
        record.map(|r| r.conversation.clone()).ok_or(ConversationStoreError::NotFound)
    }

    fn add_user_message(&self, account_root_id: &str, id: Uuid, content: &str) -> Result<Message, ConversationStoreError> {
        let mut guard = self.conversations.lock();
        let record = guard.get_mut(&id).filter(|r| r.conversation.account_root_id == account_root_id);
        let Some(record) = record else { return Err(ConversationStoreError::NotFound) };
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: id,
            role: MessageRole::User,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
        };
        record.messages.push(message.clone());
        Ok(message)
    }

    fn add_assistant_message(
        &self,
        account_root_id: &str,
        id: Uuid,
        stage1_summary: &str,
        stage2_summary: &str,
        stage3: &str,
    ) -> Result<Message, ConversationStoreError> {
        let mut guard = self.conversations.lock();
        let record = guard.get_mut(&id).filter(|r| r.conversation.account_root_id == account_root_id);
        let Some(record) = record else { return Err(ConversationStoreError::NotFound) };
        let content = format!("{stage3}\n\n---\nstage1: {stage1_summary}\nstage2: {stage2_summary}");
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: id,
            role: MessageRole::Assistant,
            content,
            created_at: chrono::Utc::now(),
        };
        record.messages.push(message.clone());
        Ok(message)
    }

    fn update_conversation_title(&self, account_root_id: &str, id: Uuid, title: &str) -> Result<(), ConversationStoreError> {
        let mut guard = self.conversations.lock();
        let record = guard.get_mut(&id).filter(|r| r.conversation.account_root_id == account_root_id);
        let Some(record) = record else { return Err(ConversationStoreError::NotFound) };
        record.conversation.title = Some(title.to_string());
        Ok(())
    }

    fn messages(&self, account_root_id: &str, id: Uuid) -> Result<Vec<Message>, ConversationStoreError> {
        let guard = self.conversations.lock();
        let record = guard.get(&id).filter(|r| Self::owned_by(r, account_root_id));
        record.map(|r| r.messages.clone()).ok_or(ConversationStoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation("key-a", "account-a");
        let fetched = store.get_conversation("account-a", conv.id).unwrap();
        assert_eq!(fetched.id, conv.id);
        assert!(fetched.title.is_none());
    }

    #[test]
    fn cross_account_lookup_returns_not_found() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation("key-a", "account-a");
        let err = store.get_conversation("account-b", conv.id).unwrap_err();
        assert!(matches!(err, ConversationStoreError::NotFound));
    }

    #[test]
    fn user_then_assistant_message_are_ordered() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation("key-a", "account-a");
        store.add_user_message("account-a", conv.id, "hello").unwrap();
        store.add_assistant_message("account-a", conv.id, "s1", "s2", "final").unwrap();
        let messages = store.messages("account-a", conv.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn update_title_is_scoped_to_owning_account() {
        let store = InMemoryConversationStore::new();
        let conv = store.create_conversation("key-a", "account-a");
        assert!(store.update_conversation_title("account-b", conv.id, "nope").is_err());
        store.update_conversation_title("account-a", conv.id, "My Title").unwrap();
        let fetched = store.get_conversation("account-a", conv.id).unwrap();
        assert_eq!(fetched.title.as_deref(), Some("My Title"));
    }

    #[test]
    fn list_conversations_only_returns_owning_account() {
        let store = InMemoryConversationStore::new();
        store.create_conversation("key-a", "account-a");
        store.create_conversation("key-b", "account-b");
        assert_eq!(store.list_conversations("account-a").len(), 1);
        assert_eq!(store.list_conversations("account-b").len(), 1);
    }
}
