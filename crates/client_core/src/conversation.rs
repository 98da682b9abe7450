use std::collections::BTreeSet;

use chrono::Utc;
use shared::{
    domain::{ChatMessage, ConversationId, MessageId, UserId},
    protocol::ChatEvent,
};

/// Ordered in-memory view of one conversation, kept current from hub events.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    local_user: UserId,
    conversation_id: Option<ConversationId>,
    messages: Vec<ChatMessage>,
    typing: BTreeSet<UserId>,
}

impl ConversationLog {
    /// Direct-message view: accepts every message event.
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            conversation_id: None,
            messages: Vec::new(),
            typing: BTreeSet::new(),
        }
    }

    pub fn for_conversation(local_user: UserId, conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::new(local_user)
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn typing_users(&self) -> impl Iterator<Item = &UserId> {
        self.typing.iter()
    }

    /// Shows a local send right away; the hub echo replaces it later.
    pub fn push_outgoing(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Inbound messages from others that are delivered but not read yet.
    pub fn unread_ids(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != self.local_user && !m.is_pending())
            .filter(|m| m.read_at.is_none() && !m.deleted)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Folds one event into the log; returns whether anything changed.
    pub fn apply(&mut self, event: &ChatEvent) -> bool {
        match event {
            ChatEvent::MessageReceived(message) => {
                if !self.accepts(message.conversation_id.as_ref()) {
                    return false;
                }
                self.upsert(message.clone());
                if message.sender_id != self.local_user {
                    self.typing.remove(&message.sender_id);
                }
                true
            }
            ChatEvent::MessageEdited(edit) => self.with_message(&edit.message_id, |m| {
                m.apply_edit(edit.body.clone());
                true
            }),
            ChatEvent::MessageDeleted(deleted) => self.with_message(&deleted.message_id, |m| {
                if m.deleted {
                    return false;
                }
                m.mark_deleted();
                true
            }),
            ChatEvent::ReactionUpdated(update) => self.with_message(&update.message_id, |m| {
                m.replace_reactions(update.reactions.clone());
                true
            }),
            ChatEvent::MessagesRead(receipt) => {
                if !self.accepts(receipt.conversation_id.as_ref()) {
                    return false;
                }
                let at = receipt.read_at.unwrap_or_else(Utc::now);
                let mut changed = false;
                for id in &receipt.message_ids {
                    changed |= self.with_message(id, |m| m.mark_read(at));
                }
                changed
            }
            ChatEvent::Typing(state) => {
                if !self.accepts(state.conversation_id.as_ref()) {
                    return false;
                }
                self.set_typing(&state.user_id, state.is_typing)
            }
            ChatEvent::UserTyping(change) => {
                self.accepts(change.conversation_id.as_ref())
                    && self.set_typing(&change.user_id, true)
            }
            ChatEvent::UserStopTyping(change) | ChatEvent::UserLeft(change) => {
                self.accepts(change.conversation_id.as_ref())
                    && self.set_typing(&change.user_id, false)
            }
            ChatEvent::UserJoined(_) | ChatEvent::ActiveUsers(_) => false,
        }
    }

    fn accepts(&self, conversation_id: Option<&ConversationId>) -> bool {
        match (&self.conversation_id, conversation_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }

    fn upsert(&mut self, message: ChatMessage) {
        let pending_echo = message.client_message_id.as_ref().and_then(|client_id| {
            self.messages
                .iter()
                .position(|m| m.is_pending() && m.client_message_id.as_ref() == Some(client_id))
        });
        let existing = pending_echo.or_else(|| {
            (!message.is_pending())
                .then(|| self.messages.iter().position(|m| m.id == message.id))
                .flatten()
        });
        match existing {
            Some(index) => self.messages[index] = message,
            None => self.messages.push(message),
        }
    }

    fn with_message(&mut self, id: &MessageId, apply: impl FnOnce(&mut ChatMessage) -> bool) -> bool {
        self.messages
            .iter_mut()
            .find(|m| &m.id == id)
            .map_or(false, apply)
    }

    fn set_typing(&mut self, user_id: &UserId, typing: bool) -> bool {
        if user_id == &self.local_user {
            return false;
        }
        if typing {
            self.typing.insert(user_id.clone())
        } else {
            self.typing.remove(user_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shared::protocol::{events, ChatEvent};

    use super::*;

    fn received(value: serde_json::Value) -> ChatEvent {
        ChatEvent::decode(events::RECEIVE_MESSAGE, &[value]).expect("valid message")
    }

    #[test]
    fn hub_echo_replaces_optimistic_message_in_place() {
        let me = UserId::from("me");
        let mut log = ConversationLog::new(me.clone());
        let outgoing = ChatMessage::outgoing(me.clone(), "hello");
        let client_id = outgoing.client_message_id.clone().expect("generated id");
        log.push_outgoing(outgoing);
        log.apply(&received(json!({"id": "other-1", "senderId": "bob", "body": "yo"})));

        assert!(log.apply(&received(json!({
            "id": "m-1",
            "senderId": "me",
            "body": "hello",
            "clientMessageId": client_id.as_str(),
        }))));

        assert_eq!(log.messages().len(), 2);
        assert_eq!(log.messages()[0].id, MessageId::from("m-1"));
        assert!(!log.messages()[0].is_pending());
    }

    #[test]
    fn edits_deletes_reactions_and_receipts_update_messages() {
        let mut log = ConversationLog::new(UserId::from("me"));
        log.apply(&received(json!({"id": "m-1", "senderId": "bob", "body": "hi"})));

        assert!(log.apply(
            &ChatEvent::decode(events::MESSAGE_EDITED, &[json!("m-1"), json!("hi there")])
                .expect("edit")
        ));
        assert_eq!(log.get(&MessageId::from("m-1")).map(|m| m.edited), Some(true));

        let reactions = json!({"messageId": "m-1", "reactions": {"👍": ["alice", "me"]}});
        assert!(log.apply(
            &ChatEvent::decode(events::MESSAGE_REACTION_UPDATED, &[reactions]).expect("reactions")
        ));

        assert_eq!(log.unread_ids(), vec![MessageId::from("m-1")]);
        let receipt = json!({"readerId": "me", "messageIds": ["m-1", "missing"]});
        assert!(log.apply(&ChatEvent::decode(events::MESSAGES_READ, &[receipt]).expect("read")));
        assert!(log.unread_ids().is_empty());

        let delete = ChatEvent::decode(events::MESSAGE_DELETED, &[json!("m-1")]).expect("delete");
        assert!(log.apply(&delete));
        assert!(!log.apply(&delete));
        let message = log.get(&MessageId::from("m-1")).expect("kept as tombstone");
        assert!(message.deleted && message.reactions.is_empty());
    }

    #[test]
    fn conversation_filter_and_typing_set() {
        let mut log =
            ConversationLog::for_conversation(UserId::from("me"), ConversationId::from("c-1"));
        assert!(!log.apply(&received(
            json!({"id": "x", "senderId": "bob", "conversationId": "c-2"})
        )));

        let typing = |user: &str, on: bool| {
            ChatEvent::decode(
                events::TYPING,
                &[json!({"userId": user, "conversationId": "c-1", "isTyping": on})],
            )
            .expect("typing")
        };
        assert!(log.apply(&typing("bob", true)));
        assert!(!log.apply(&typing("me", true)));
        assert_eq!(log.typing_users().count(), 1);

        log.apply(&received(json!({"id": "y", "senderId": "bob", "conversationId": "c-1"})));
        assert_eq!(log.typing_users().count(), 0);
    }
}
