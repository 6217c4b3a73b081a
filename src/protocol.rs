//! Wire envelope and the closed action vocabulary.
//!
//! Every frame is a JSON envelope `{action, payload, target, sender, time}`.
//! Inbound frames are decoded in two steps: the envelope with its action tag,
//! then the payload into the typed request for that action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GameError;
use crate::types::{GameId, User, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "join-game")]
    JoinGame,
    #[serde(rename = "leave-game")]
    LeaveGame,
    #[serde(rename = "send-message")]
    SendMessage,
    #[serde(rename = "select-topic")]
    SelectTopic,
    #[serde(rename = "start-game")]
    StartGame,
    #[serde(rename = "start-round")]
    StartRound,
    #[serde(rename = "start-answer")]
    StartAnswer,
    #[serde(rename = "end-answer")]
    EndAnswer,
    #[serde(rename = "rate-user")]
    RateUser,
    #[serde(rename = "start-stage")]
    StartStage,
    #[serde(rename = "delete-user")]
    DeleteUser,
    #[serde(rename = "game-end")]
    EndGame,
    #[serde(rename = "join-success")]
    JoinSuccess,
    #[serde(rename = "user-left")]
    UserLeft,
    #[serde(rename = "round-end")]
    RoundEnd,
    #[serde(rename = "rate-end")]
    RateEnd,
    #[serde(rename = "error")]
    Error,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinGame => "join-game",
            Self::LeaveGame => "leave-game",
            Self::SendMessage => "send-message",
            Self::SelectTopic => "select-topic",
            Self::StartGame => "start-game",
            Self::StartRound => "start-round",
            Self::StartAnswer => "start-answer",
            Self::EndAnswer => "end-answer",
            Self::RateUser => "rate-user",
            Self::StartStage => "start-stage",
            Self::DeleteUser => "delete-user",
            Self::EndGame => "game-end",
            Self::JoinSuccess => "join-success",
            Self::UserLeft => "user-left",
            Self::RoundEnd => "round-end",
            Self::RateEnd => "rate-end",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame as it travels on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub target: GameId,
    #[serde(default)]
    pub sender: Option<User>,
    pub time: DateTime<Utc>,
}

impl Envelope {
    pub fn new(action: Action, target: GameId, payload: Value) -> Self {
        Self {
            action,
            payload,
            target,
            sender: None,
            time: Utc::now(),
        }
    }

    pub fn with_sender(mut self, sender: &User) -> Self {
        self.sender = Some(sender.clone());
        self
    }

    pub fn error(target: GameId, err: &GameError) -> Self {
        Self::new(
            Action::Error,
            target,
            serde_json::json!({
                "code": err.code(),
                "message": err.to_string(),
            }),
        )
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound envelope before payload decoding. `sender` and `time` from the
/// client are ignored; the connection attaches its own participant.
#[derive(Debug, Deserialize)]
pub struct Inbound {
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
    /// Missing or `null` targets decode as the nil id.
    #[serde(default, deserialize_with = "nullable_target")]
    pub target: GameId,
}

fn nullable_target<'de, D>(deserializer: D) -> Result<GameId, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<GameId>::deserialize(deserializer)?.unwrap_or_default())
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, GameError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRef {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePayload {
    pub user_id: UserId,
    pub value: u32,
    #[serde(default)]
    pub tags: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: UserId,
}

/// What a client asked for, routed by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Join,
    Leave,
    Game(GameRequest),
}

/// Requests handled inside a game session's command loop.
#[derive(Debug, Clone, PartialEq)]
pub enum GameRequest {
    SendMessage(Value),
    SelectTopic(Vec<Uuid>),
    StartGame,
    StartRound { topic: Uuid },
    StartAnswer,
    EndAnswer,
    Rate(RatePayload),
    StartStage,
    DeleteUser { user: UserId },
    EndGame,
}

impl ClientRequest {
    pub fn decode(action: Action, payload: Value) -> Result<Self, GameError> {
        let request = match action {
            Action::JoinGame => Self::Join,
            Action::LeaveGame => Self::Leave,
            Action::SendMessage => Self::Game(GameRequest::SendMessage(payload)),
            Action::SelectTopic => {
                let topics: Vec<TopicRef> = if payload.is_null() {
                    Vec::new()
                } else {
                    decode_payload(action, payload)?
                };
                Self::Game(GameRequest::SelectTopic(
                    topics.into_iter().map(|t| t.id).collect(),
                ))
            }
            Action::StartGame => Self::Game(GameRequest::StartGame),
            Action::StartRound => {
                let topic: TopicRef = decode_payload(action, payload)?;
                Self::Game(GameRequest::StartRound { topic: topic.id })
            }
            Action::StartAnswer => Self::Game(GameRequest::StartAnswer),
            Action::EndAnswer => Self::Game(GameRequest::EndAnswer),
            Action::RateUser => Self::Game(GameRequest::Rate(decode_payload(action, payload)?)),
            Action::StartStage => Self::Game(GameRequest::StartStage),
            Action::DeleteUser => {
                let user: UserRef = decode_payload(action, payload)?;
                Self::Game(GameRequest::DeleteUser { user: user.user_id })
            }
            Action::EndGame => Self::Game(GameRequest::EndGame),
            Action::JoinSuccess
            | Action::UserLeft
            | Action::RoundEnd
            | Action::RateEnd
            | Action::Error => {
                return Err(GameError::Payload(format!(
                    "{action} is not a client action"
                )));
            }
        };
        Ok(request)
    }
}

fn decode_payload<T: DeserializeOwned>(action: Action, payload: Value) -> Result<T, GameError> {
    serde_json::from_value(payload).map_err(|e| GameError::Payload(format!("{action}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tags_match_wire_strings() {
        let all = [
            Action::JoinGame,
            Action::LeaveGame,
            Action::SendMessage,
            Action::SelectTopic,
            Action::StartGame,
            Action::StartRound,
            Action::StartAnswer,
            Action::EndAnswer,
            Action::RateUser,
            Action::StartStage,
            Action::DeleteUser,
            Action::EndGame,
            Action::JoinSuccess,
            Action::UserLeft,
            Action::RoundEnd,
            Action::RateEnd,
            Action::Error,
        ];
        for action in all {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
    }

    #[test]
    fn decodes_rate_request() {
        let target = Uuid::new_v4();
        let rated = Uuid::new_v4();
        let text = format!(
            r#"{{"action":"rate-user","target":"{target}","payload":{{"user_id":"{rated}","value":5}}}}"#
        );
        let inbound = Inbound::parse(&text).unwrap();
        assert_eq!(inbound.target, target);
        let request = ClientRequest::decode(inbound.action, inbound.payload).unwrap();
        assert_eq!(
            request,
            ClientRequest::Game(GameRequest::Rate(RatePayload {
                user_id: rated,
                value: 5,
                tags: vec![],
            }))
        );
    }

    #[test]
    fn select_topic_accepts_missing_payload() {
        let request = ClientRequest::decode(Action::SelectTopic, Value::Null).unwrap();
        assert_eq!(request, ClientRequest::Game(GameRequest::SelectTopic(vec![])));

        let id = Uuid::new_v4();
        let request =
            ClientRequest::decode(Action::SelectTopic, serde_json::json!([{ "id": id }])).unwrap();
        assert_eq!(request, ClientRequest::Game(GameRequest::SelectTopic(vec![id])));
    }

    #[test]
    fn malformed_payload_is_code_3() {
        let err = ClientRequest::decode(Action::StartRound, serde_json::json!({"id": 7}))
            .unwrap_err();
        assert_eq!(err.code(), 3);

        let err = ClientRequest::decode(Action::RateUser, Value::Null).unwrap_err();
        assert_eq!(err.code(), 3);
    }

    #[test]
    fn server_actions_are_not_accepted_from_clients() {
        let err = ClientRequest::decode(Action::RateEnd, Value::Null).unwrap_err();
        assert!(matches!(err, GameError::Payload(_)));
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        let err = Inbound::parse(r#"{"action":"dance","target":null}"#).unwrap_err();
        assert_eq!(err.code(), 3);
    }

    #[test]
    fn null_or_missing_target_is_nil() {
        let inbound = Inbound::parse(r#"{"action":"send-message","target":null,"payload":"hi"}"#).unwrap();
        assert!(inbound.target.is_nil());
        assert_eq!(inbound.payload, Value::from("hi"));

        let inbound = Inbound::parse(r#"{"action":"start-game"}"#).unwrap();
        assert!(inbound.target.is_nil());

        assert!(Inbound::parse(r#"{"action":"start-game","target":"not-a-uuid"}"#).is_err());
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let target = Uuid::new_v4();
        let envelope = Envelope::error(target, &GameError::Capacity { max: 3 });
        let json: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["action"], "error");
        assert_eq!(json["payload"]["code"], 1);
        assert_eq!(json["target"], target.to_string());
        assert!(json["sender"].is_null());
    }
}
