use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        Attachment, CallId, ChatMessage, ClientMessageId, ConversationId, MessageId, ReactionMap,
        UserId,
    },
    error::{EventDecodeError, HubProtocolError},
};

/// Terminates every record of the JSON hub protocol.
pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const HUB_PROTOCOL: &str = "json";
pub const HUB_PROTOCOL_VERSION: u32 = 1;

pub mod methods {
    pub const SEND_MESSAGE_TO_USER_WITH_META: &str = "SendMessageToUserWithMeta";
    pub const SEND_MESSAGE_TO_USER_WITH_CUSTOM_DATA: &str = "SendMessageToUserWithCustomData";
    pub const SEND_MESSAGE: &str = "SendMessage";
    pub const JOIN_CONVERSATION: &str = "JoinConversation";
    pub const LEAVE_CONVERSATION: &str = "LeaveConversation";
    pub const START_TYPING: &str = "StartTyping";
    pub const STOP_TYPING: &str = "StopTyping";
    pub const REACT_TO_MESSAGE: &str = "ReactToMessage";
    pub const UNREACT_TO_MESSAGE: &str = "UnreactToMessage";
    pub const EDIT_MESSAGE: &str = "EditMessage";
    pub const DELETE_MESSAGE: &str = "DeleteMessage";
    pub const MARK_MESSAGES_READ: &str = "MarkMessagesRead";
    pub const GET_CONNECTION_ID: &str = "GetConnectionId";
    pub const ADD_USER: &str = "AddUser";
}

pub mod events {
    pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
    pub const MESSAGE_EDITED: &str = "MessageEdited";
    pub const MESSAGE_DELETED: &str = "MessageDeleted";
    pub const USER_JOINED: &str = "UserJoined";
    pub const USER_LEFT: &str = "UserLeft";
    pub const USER_TYPING: &str = "UserTyping";
    pub const USER_STOP_TYPING: &str = "UserStopTyping";
    pub const RECEIVE_ACTIVE_USERS: &str = "ReceiveActiveUsers";
    pub const TYPING: &str = "Typing";
    pub const MESSAGES_READ: &str = "MessagesRead";
    pub const MESSAGE_REACTION_UPDATED: &str = "MessageReactionUpdated";

    pub const ALL: [&str; 11] = [
        RECEIVE_MESSAGE,
        MESSAGE_EDITED,
        MESSAGE_DELETED,
        USER_JOINED,
        USER_LEFT,
        USER_TYPING,
        USER_STOP_TYPING,
        RECEIVE_ACTIVE_USERS,
        TYPING,
        MESSAGES_READ,
        MESSAGE_REACTION_UPDATED,
    ];
}

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: HUB_PROTOCOL.to_string(),
            version: HUB_PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, stream invocations and cancellations; not used by chat.
    Unsupported(u8),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type", default)]
    kind: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    /// Serializes into one separator-terminated record.
    pub fn encode(&self) -> Result<String, HubProtocolError> {
        let raw = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawHubMessage {
                kind: Some(TYPE_INVOCATION),
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..RawHubMessage::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawHubMessage {
                kind: Some(TYPE_COMPLETION),
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..RawHubMessage::default()
            },
            HubMessage::Ping => RawHubMessage {
                kind: Some(TYPE_PING),
                ..RawHubMessage::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawHubMessage {
                kind: Some(TYPE_CLOSE),
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..RawHubMessage::default()
            },
            HubMessage::Unsupported(kind) => RawHubMessage {
                kind: Some(*kind),
                ..RawHubMessage::default()
            },
        };
        encode_record(&raw)
    }

    fn from_raw(raw: RawHubMessage) -> Result<Self, HubProtocolError> {
        let kind = raw.kind.ok_or(HubProtocolError::MissingType)?;
        match kind {
            TYPE_INVOCATION => Ok(HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(HubProtocolError::MissingField {
                    kind,
                    field: "target",
                })?,
                arguments: raw.arguments.unwrap_or_default(),
            }),
            TYPE_COMPLETION => Ok(HubMessage::Completion {
                invocation_id: raw.invocation_id.ok_or(HubProtocolError::MissingField {
                    kind,
                    field: "invocationId",
                })?,
                result: raw.result,
                error: raw.error,
            }),
            TYPE_PING => Ok(HubMessage::Ping),
            TYPE_CLOSE => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Ok(HubMessage::Unsupported(other)),
        }
    }
}

pub fn encode_record<T: Serialize>(value: &T) -> Result<String, HubProtocolError> {
    let mut record = serde_json::to_string(value)?;
    record.push(RECORD_SEPARATOR);
    Ok(record)
}

/// Decodes every complete record in a text frame or poll body.
pub fn decode_records(text: &str) -> Result<Vec<HubMessage>, HubProtocolError> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .map(|record| {
            let raw: RawHubMessage = serde_json::from_str(record)?;
            HubMessage::from_raw(raw)
        })
        .collect()
}

pub fn handshake_request() -> Result<String, HubProtocolError> {
    encode_record(&HandshakeRequest::default())
}

/// Splits the handshake response from any records that arrived with it.
pub fn split_handshake(text: &str) -> Result<(HandshakeResponse, &str), HubProtocolError> {
    let Some(end) = text.find(RECORD_SEPARATOR) else {
        return Err(HubProtocolError::IncompleteHandshake);
    };
    let response: HandshakeResponse = serde_json::from_str(&text[..end])?;
    Ok((response, &text[end + RECORD_SEPARATOR.len_utf8()..]))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<ClientMessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum CustomPayload {
    Voice {
        url: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    CallSignal {
        signal: CallSignal,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum CallSignal {
    Offer {
        call_id: CallId,
        sdp: String,
        #[serde(default)]
        video: bool,
    },
    Answer {
        call_id: CallId,
        sdp: String,
    },
    IceCandidate {
        call_id: CallId,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u16>,
    },
    Hangup {
        call_id: CallId,
    },
}

impl CallSignal {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallSignal::Offer { call_id, .. }
            | CallSignal::Answer { call_id, .. }
            | CallSignal::IceCandidate { call_id, .. }
            | CallSignal::Hangup { call_id } => call_id,
        }
    }

    pub fn into_custom_data(self) -> Value {
        serde_json::to_value(CustomPayload::CallSignal { signal: self }).unwrap_or(Value::Null)
    }

    pub fn from_custom_data(value: &Value) -> Result<Self, EventDecodeError> {
        match serde_json::from_value::<CustomPayload>(value.clone()) {
            Ok(CustomPayload::CallSignal { signal }) => Ok(signal),
            _ => Err(EventDecodeError::NotACallSignal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdited {
    pub message_id: MessageId,
    #[serde(alias = "newText", alias = "text", alias = "newBody")]
    pub body: String,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user_id: UserId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub user_id: UserId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default = "default_true")]
    pub is_typing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub reader_id: UserId,
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    pub message_id: MessageId,
    #[serde(default)]
    pub reactions: ReactionMap,
}

/// Inbound hub push events, decoded from their positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageReceived(ChatMessage),
    MessageEdited(MessageEdited),
    MessageDeleted(MessageDeleted),
    UserJoined(PresenceChange),
    UserLeft(PresenceChange),
    UserTyping(PresenceChange),
    UserStopTyping(PresenceChange),
    ActiveUsers(Vec<UserId>),
    Typing(TypingState),
    MessagesRead(ReadReceipt),
    ReactionUpdated(ReactionUpdate),
}

impl ChatEvent {
    /// Event names are matched case-insensitively, as the hub does.
    pub fn decode(event: &str, arguments: &[Value]) -> Result<Self, EventDecodeError> {
        let name = event.to_ascii_lowercase();
        let matches = |candidate: &str| name == candidate.to_ascii_lowercase();

        if matches(events::RECEIVE_MESSAGE) {
            decode_arguments(event, arguments).map(ChatEvent::MessageReceived)
        } else if matches(events::MESSAGE_EDITED) {
            decode_arguments(event, arguments).map(ChatEvent::MessageEdited)
        } else if matches(events::MESSAGE_DELETED) {
            decode_arguments(event, arguments).map(ChatEvent::MessageDeleted)
        } else if matches(events::USER_JOINED) {
            decode_arguments(event, arguments).map(ChatEvent::UserJoined)
        } else if matches(events::USER_LEFT) {
            decode_arguments(event, arguments).map(ChatEvent::UserLeft)
        } else if matches(events::USER_TYPING) {
            decode_arguments(event, arguments).map(ChatEvent::UserTyping)
        } else if matches(events::USER_STOP_TYPING) {
            decode_arguments(event, arguments).map(ChatEvent::UserStopTyping)
        } else if matches(events::RECEIVE_ACTIVE_USERS) {
            let value = match arguments {
                [list @ Value::Array(_)] => list.clone(),
                _ => Value::Array(arguments.to_vec()),
            };
            serde_json::from_value(value)
                .map(ChatEvent::ActiveUsers)
                .map_err(|source| EventDecodeError::InvalidArguments {
                    event: event.to_string(),
                    source,
                })
        } else if matches(events::TYPING) {
            decode_arguments(event, arguments).map(ChatEvent::Typing)
        } else if matches(events::MESSAGES_READ) {
            decode_arguments(event, arguments).map(ChatEvent::MessagesRead)
        } else if matches(events::MESSAGE_REACTION_UPDATED) {
            decode_arguments(event, arguments).map(ChatEvent::ReactionUpdated)
        } else {
            Err(EventDecodeError::UnknownEvent(event.to_string()))
        }
    }
}

/// A single object argument is decoded by field name; anything else positionally.
fn decode_arguments<T: DeserializeOwned>(
    event: &str,
    arguments: &[Value],
) -> Result<T, EventDecodeError> {
    let value = match arguments {
        [object @ Value::Object(_)] => object.clone(),
        _ => Value::Array(arguments.to_vec()),
    };
    serde_json::from_value(value).map_err(|source| EventDecodeError::InvalidArguments {
        event: event.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn invocation_record_matches_wire_shape() {
        let record = HubMessage::invocation("7", methods::SEND_MESSAGE, vec![json!("c1")])
            .encode()
            .expect("encode");
        assert!(record.ends_with(RECORD_SEPARATOR));

        let value: Value = serde_json::from_str(record.trim_end_matches(RECORD_SEPARATOR))
            .expect("json");
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "7");
        assert_eq!(value["target"], "SendMessage");
        assert_eq!(value["arguments"], json!(["c1"]));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn decodes_several_records_from_one_frame() {
        let frame = "{\"type\":3,\"invocationId\":\"1\",\"result\":4}\u{1e}{\"type\":6}\u{1e}\
                     {\"type\":3,\"invocationId\":\"2\",\"error\":\"denied\"}\u{1e}";
        let messages = decode_records(frame).expect("decode");
        assert_eq!(
            messages,
            vec![
                HubMessage::Completion {
                    invocation_id: "1".into(),
                    result: Some(json!(4)),
                    error: None,
                },
                HubMessage::Ping,
                HubMessage::Completion {
                    invocation_id: "2".into(),
                    result: None,
                    error: Some("denied".into()),
                },
            ]
        );
    }

    #[test]
    fn completion_without_invocation_id_is_rejected() {
        let err = decode_records("{\"type\":3}\u{1e}").expect_err("must fail");
        assert!(matches!(
            err,
            HubProtocolError::MissingField {
                kind: 3,
                field: "invocationId"
            }
        ));
    }

    #[test]
    fn stream_records_are_unsupported_not_errors() {
        let messages = decode_records("{\"type\":2,\"invocationId\":\"1\"}\u{1e}").expect("decode");
        assert_eq!(messages, vec![HubMessage::Unsupported(2)]);
    }

    #[test]
    fn handshake_split_keeps_trailing_records() {
        let (response, rest) =
            split_handshake("{}\u{1e}{\"type\":6}\u{1e}").expect("handshake");
        assert_eq!(response.error, None);
        assert_eq!(decode_records(rest).expect("rest"), vec![HubMessage::Ping]);

        let (response, _) =
            split_handshake("{\"error\":\"unsupported protocol\"}\u{1e}").expect("handshake");
        assert_eq!(response.error.as_deref(), Some("unsupported protocol"));

        assert!(matches!(
            split_handshake("{}"),
            Err(HubProtocolError::IncompleteHandshake)
        ));
    }

    #[test]
    fn decodes_events_from_object_or_positional_arguments() {
        let edited = ChatEvent::decode(
            "messageedited",
            &[json!({"messageId": "m1", "newText": "fixed"})],
        )
        .expect("object form");
        assert_eq!(
            edited,
            ChatEvent::MessageEdited(MessageEdited {
                message_id: MessageId::from("m1"),
                body: "fixed".into(),
                edited_at: None,
            })
        );

        let typing = ChatEvent::decode(events::USER_TYPING, &[json!("u2"), json!("c9")])
            .expect("positional form");
        assert_eq!(
            typing,
            ChatEvent::UserTyping(PresenceChange {
                user_id: UserId::from("u2"),
                conversation_id: Some(ConversationId::from("c9")),
            })
        );

        let active = ChatEvent::decode(events::RECEIVE_ACTIVE_USERS, &[json!(["a", "b"])])
            .expect("active users");
        assert_eq!(
            active,
            ChatEvent::ActiveUsers(vec![UserId::from("a"), UserId::from("b")])
        );

        assert!(matches!(
            ChatEvent::decode("Unknown", &[]),
            Err(EventDecodeError::UnknownEvent(_))
        ));
    }

    #[test]
    fn call_signals_travel_as_custom_data() {
        let signal = CallSignal::IceCandidate {
            call_id: CallId::from("call-1"),
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 53421 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let data = signal.clone().into_custom_data();
        assert_eq!(data["type"], "call_signal");
        assert_eq!(data["signal"]["kind"], "ice_candidate");
        assert_eq!(data["signal"]["sdpMLineIndex"], 0);
        assert_eq!(CallSignal::from_custom_data(&data).expect("decode"), signal);

        let voice = serde_json::to_value(CustomPayload::Voice {
            url: "https://cdn/v.m4a".into(),
            duration_ms: 1200,
            mime_type: None,
        })
        .expect("voice");
        assert!(matches!(
            CallSignal::from_custom_data(&voice),
            Err(EventDecodeError::NotACallSignal)
        ));
    }
}
