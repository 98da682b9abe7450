use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{ChatMessage, ClientMessageId, ConversationId, MessageId, UserId},
    protocol::{events, methods, CallSignal, ChatEvent, CustomPayload, MessageMeta},
};
use tracing::{debug, warn};

use crate::{
    call::CallSignaling,
    error::InvokeError,
    handlers::Subscription,
    session::{ConnectionState, HubSession},
};

/// Typed chat and presence operations over a [`HubSession`].
#[derive(Clone)]
pub struct ChatApi {
    session: Arc<HubSession>,
}

impl ChatApi {
    pub fn new(session: Arc<HubSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<HubSession> {
        &self.session
    }

    /// Direct message with metadata. A client message id is generated when
    /// `meta` has none, and returned for reconciling the hub echo.
    pub async fn send_message_with_meta(
        &self,
        recipient: &UserId,
        body: &str,
        mut meta: MessageMeta,
    ) -> Result<ClientMessageId, InvokeError> {
        let client_message_id = meta
            .client_message_id
            .get_or_insert_with(ClientMessageId::generate)
            .clone();
        let meta = to_argument(methods::SEND_MESSAGE_TO_USER_WITH_META, &meta)?;
        self.session
            .invoke(
                methods::SEND_MESSAGE_TO_USER_WITH_META,
                vec![json!(recipient), json!(body), meta],
            )
            .await?;
        Ok(client_message_id)
    }

    /// Voice notes, images and call signals.
    pub async fn send_message_with_custom_data(
        &self,
        recipient: &UserId,
        body: &str,
        payload: &CustomPayload,
    ) -> Result<(), InvokeError> {
        let payload = to_argument(methods::SEND_MESSAGE_TO_USER_WITH_CUSTOM_DATA, payload)?;
        self.session
            .invoke(
                methods::SEND_MESSAGE_TO_USER_WITH_CUSTOM_DATA,
                vec![json!(recipient), json!(body), payload],
            )
            .await?;
        Ok(())
    }

    /// Broadcast to everyone in a conversation.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        body: &str,
    ) -> Result<(), InvokeError> {
        self.call(methods::SEND_MESSAGE, vec![json!(conversation_id), json!(body)])
            .await
    }

    pub async fn join_conversation(&self, conversation_id: &ConversationId) -> Result<(), InvokeError> {
        self.call(methods::JOIN_CONVERSATION, vec![json!(conversation_id)])
            .await?;
        self.session.track_conversation(conversation_id, true).await;
        Ok(())
    }

    pub async fn leave_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), InvokeError> {
        self.call(methods::LEAVE_CONVERSATION, vec![json!(conversation_id)])
            .await?;
        self.session.track_conversation(conversation_id, false).await;
        Ok(())
    }

    pub async fn react(&self, message_id: &MessageId, emoji: &str) -> Result<(), InvokeError> {
        self.call(methods::REACT_TO_MESSAGE, vec![json!(message_id), json!(emoji)])
            .await
    }

    pub async fn unreact(&self, message_id: &MessageId, emoji: &str) -> Result<(), InvokeError> {
        self.call(methods::UNREACT_TO_MESSAGE, vec![json!(message_id), json!(emoji)])
            .await
    }

    pub async fn edit_message(&self, message_id: &MessageId, body: &str) -> Result<(), InvokeError> {
        self.call(methods::EDIT_MESSAGE, vec![json!(message_id), json!(body)])
            .await
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), InvokeError> {
        self.call(methods::DELETE_MESSAGE, vec![json!(message_id)])
            .await
    }

    /// Returns how many messages the hub newly marked as read.
    pub async fn mark_read(&self, message_ids: &[MessageId]) -> Result<u64, InvokeError> {
        if message_ids.is_empty() {
            self.require_connected(methods::MARK_MESSAGES_READ)?;
            return Ok(0);
        }
        let result = self
            .session
            .invoke(methods::MARK_MESSAGES_READ, vec![json!(message_ids)])
            .await?;
        marked_count(&result).ok_or_else(|| InvokeError::Codec {
            method: methods::MARK_MESSAGES_READ.to_string(),
            reason: format!("unexpected result {result}"),
        })
    }

    pub async fn start_typing(&self, conversation_id: &ConversationId) -> Result<(), InvokeError> {
        self.call(methods::START_TYPING, vec![json!(conversation_id)])
            .await
    }

    pub async fn stop_typing(&self, conversation_id: &ConversationId) -> Result<(), InvokeError> {
        self.call(methods::STOP_TYPING, vec![json!(conversation_id)])
            .await
    }

    pub async fn connection_id(&self) -> Result<String, InvokeError> {
        self.session
            .invoke_as(methods::GET_CONNECTION_ID, Vec::new())
            .await
    }

    pub async fn add_user(&self, user_id: &UserId) -> Result<(), InvokeError> {
        self.call(methods::ADD_USER, vec![json!(user_id)]).await
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.session.on(event, handler)
    }

    /// One handler for every inbound chat event, decoded into [`ChatEvent`].
    pub fn on_chat_event<F>(&self, handler: F) -> ChatSubscription
    where
        F: Fn(ChatEvent) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let subscriptions = events::ALL
            .iter()
            .map(|event| {
                let handler = Arc::clone(&handler);
                let name = *event;
                self.session.on(event, move |arguments| {
                    match ChatEvent::decode(name, arguments) {
                        Ok(decoded) => handler(decoded),
                        Err(err) => warn!(event = name, "hub: undecodable event: {err}"),
                    }
                })
            })
            .collect();
        ChatSubscription { subscriptions }
    }

    /// Call signals arrive as `ReceiveMessage` custom data; the handler gets
    /// the sender and the decoded signal.
    pub fn on_call_signal<F>(&self, handler: F) -> Subscription
    where
        F: Fn(UserId, CallSignal) + Send + Sync + 'static,
    {
        self.session.on(events::RECEIVE_MESSAGE, move |arguments| {
            let Ok(ChatEvent::MessageReceived(message)) =
                ChatEvent::decode(events::RECEIVE_MESSAGE, arguments)
            else {
                return;
            };
            if let Some((from, signal)) = call_signal_of(&message) {
                handler(from, signal);
            }
        })
    }

    fn require_connected(&self, method: &str) -> Result<(), InvokeError> {
        let state = self.session.state();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            warn!(method, ?state, "hub: invoke while not connected");
            Err(InvokeError::NotConnected {
                method: method.to_string(),
                state,
            })
        }
    }

    async fn call(&self, method: &str, arguments: Vec<Value>) -> Result<(), InvokeError> {
        self.session.invoke(method, arguments).await.map(|_| ())
    }
}

#[async_trait]
impl CallSignaling for ChatApi {
    async fn send_signal(&self, to: &UserId, signal: CallSignal) -> Result<(), InvokeError> {
        debug!(to = %to, call_id = %signal.call_id(), "call: sending signal");
        self.send_message_with_custom_data(to, "", &CustomPayload::CallSignal { signal })
            .await
    }
}

/// Registrations made by [`ChatApi::on_chat_event`]; dropping it unregisters all.
#[must_use = "dropping a ChatSubscription unregisters its handlers"]
#[derive(Debug)]
pub struct ChatSubscription {
    subscriptions: Vec<Subscription>,
}

impl ChatSubscription {
    pub fn unsubscribe(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

pub fn call_signal_of(message: &ChatMessage) -> Option<(UserId, CallSignal)> {
    let data = message.custom_data.as_ref()?;
    CallSignal::from_custom_data(data)
        .ok()
        .map(|signal| (message.sender_id.clone(), signal))
}

fn to_argument<T: serde::Serialize>(method: &str, value: &T) -> Result<Value, InvokeError> {
    serde_json::to_value(value).map_err(|err| InvokeError::Codec {
        method: method.to_string(),
        reason: err.to_string(),
    })
}

/// Accepts a bare number, `{"count": n}` / `{"marked": n}` or null.
fn marked_count(result: &Value) -> Option<u64> {
    match result {
        Value::Null => Some(0),
        Value::Number(n) => n.as_u64(),
        Value::Object(fields) => fields
            .get("count")
            .or_else(|| fields.get("marked"))
            .and_then(Value::as_u64),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
