//! Per-agent chat threads and their messages. The conversation row's
//! counters (`message_count`, `total_credits`, `last_message_at`) are
//! maintained server-side as messages arrive; this client only inserts and
//! reads rows.

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::Result;
use crate::client::{Client, Filters};

const CONVERSATIONS: &str = "agent_conversations";
const MESSAGES: &str = "agent_messages";
const DEFAULT_TITLE: &str = "New conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub title: String,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub total_credits: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub credits_used: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct ConversationsClient {
    client: Client,
}

impl ConversationsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// A user's conversations with one agent, most recently active first.
    pub async fn conversations(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Vec<Conversation>> {
        self.client
            .select(CONVERSATIONS)
            .eq("user_id", user_id)
            .eq("agent_id", agent_id)
            .order("updated_at", true)
            .fetch()
            .await
    }

    /// All messages of one conversation, oldest first.
    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.client
            .select(MESSAGES)
            .eq("conversation_id", conversation_id)
            .order("created_at", false)
            .fetch()
            .await
    }

    pub async fn create(&self, user_id: &str, agent_id: &str) -> Result<Conversation> {
        self.client
            .insert(
                CONVERSATIONS,
                &json!({
                    "user_id": user_id,
                    "agent_id": agent_id,
                    "title": DEFAULT_TITLE,
                }),
            )
            .await
    }

    /// Appends one message. `credits_used` is the metered price of an
    /// assistant turn; user turns carry zero.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        credits_used: i64,
    ) -> Result<Message> {
        self.client
            .insert(
                MESSAGES,
                &json!({
                    "conversation_id": conversation_id,
                    "role": role,
                    "content": content,
                    "credits_used": credits_used,
                }),
            )
            .await
    }

    pub async fn rename(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.client
            .update(
                CONVERSATIONS,
                &Filters::new().eq("id", conversation_id),
                &json!({ "title": title }),
            )
            .await
    }

    pub async fn delete(&self, conversation_id: &str) -> Result<()> {
        self.client
            .delete(CONVERSATIONS, &Filters::new().eq("id", conversation_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_role_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(MessageRole::Assistant).unwrap(),
            serde_json::json!("assistant")
        );
    }

    #[test]
    fn conversation_tolerates_missing_counters() {
        let conversation: Conversation = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "user_id": "u1",
            "agent_id": "3",
            "title": "New conversation",
            "created_at": "2026-01-05T10:00:00+00:00",
        }))
        .unwrap();
        assert_eq!(conversation.message_count, 0);
        assert_eq!(conversation.total_credits, 0);
        assert!(conversation.last_message_at.is_none());
    }
}
