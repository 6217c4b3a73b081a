use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type GameId = Uuid;
pub type UserId = Uuid;
pub type ConnectionId = Uuid;

/// A participant bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub authenticated: bool,
}

impl User {
    /// An account holder admitted with a verified token.
    pub fn account(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            authenticated: true,
        }
    }

    /// An anonymous guest with a freshly minted id.
    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            authenticated: false,
        }
    }
}

/// Lifecycle of a game session. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    #[serde(alias = "not_started", alias = "created")]
    Lobby,
    InProgress,
    Ended,
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lobby => write!(f, "lobby"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// Subscription tier of a game's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Advanced,
    Premium,
    /// Also the tier for plan names this server does not know.
    #[serde(other)]
    Basic,
}

impl PlanType {
    /// Maximum number of participants a game of this tier admits.
    pub fn max_size(self) -> usize {
        match self {
            Self::Basic => 3,
            Self::Advanced => 5,
            Self::Premium => 10,
        }
    }

    /// Whether the creator picks topics explicitly instead of getting a random set.
    pub fn picks_topics(self) -> bool {
        !matches!(self, Self::Basic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Topic metadata as served by the topic repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
}

/// A topic selected for a game, with the questions fetched for it at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: Uuid,
    pub used: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<Question>,
}

impl From<TopicInfo> for Topic {
    fn from(info: TopicInfo) -> Self {
        Self {
            id: info.id,
            used: false,
            title: info.title,
            questions: Vec::new(),
        }
    }
}

/// One rater's verdict on a participant's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub value: u32,
    #[serde(default)]
    pub tags: Vec<Uuid>,
    /// Zero rating seeded when the respondent finished answering; replaced by the real one.
    #[serde(skip)]
    pub placeholder: bool,
}

impl Rating {
    pub fn placeholder() -> Self {
        Self {
            value: 0,
            tags: Vec::new(),
            placeholder: true,
        }
    }
}

/// A participant's assigned question for the current round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuestion {
    pub number: usize,
    pub user: UserId,
    pub question: Question,
    #[serde(skip)]
    pub rates: HashMap<UserId, Rating>,
}

impl UserQuestion {
    /// Distinct raters that submitted a real rating.
    pub fn rater_count(&self) -> usize {
        self.rates.values().filter(|r| !r.placeholder).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub topic: Uuid,
    #[serde(rename = "users-questions")]
    pub user_questions: Vec<UserQuestion>,
}

/// Accumulated score of one participant across all rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub value: u32,
    pub tags: BTreeSet<Uuid>,
}

/// Canonical aggregated result for one participant, as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerResult {
    pub user_id: UserId,
    #[serde(default)]
    pub name: String,
    pub value: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Game row stored by the backend of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: GameId,
    pub name: String,
    pub status: GameStatus,
    pub creator_id: UserId,
}

/// Account profile stored by the backend of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub second_name: String,
}

impl Account {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.second_name)
            .trim()
            .to_string()
    }
}

/// Video meeting attached to a started game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingInfo {
    pub number: String,
    pub passcode: String,
    pub token: String,
}

/// Read-only copy of a session's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct GameSnapshot {
    pub id: GameId,
    pub name: String,
    pub creator: UserId,
    pub status: GameStatus,
    pub max_size: usize,
    pub participants: Vec<User>,
    pub connections: usize,
    pub topics: Vec<Topic>,
    pub round: Option<Round>,
    pub results: HashMap<UserId, Score>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_tiers_map_to_capacity() {
        assert_eq!(PlanType::Basic.max_size(), 3);
        assert_eq!(PlanType::Advanced.max_size(), 5);
        assert_eq!(PlanType::Premium.max_size(), 10);
        assert!(!PlanType::Basic.picks_topics());
        assert!(PlanType::Premium.picks_topics());
    }

    #[test]
    fn unknown_plan_falls_back_to_basic() {
        let plan: PlanType = serde_json::from_str("\"trial\"").unwrap();
        assert_eq!(plan, PlanType::Basic);
        let plan: PlanType = serde_json::from_str("\"advanced\"").unwrap();
        assert_eq!(plan, PlanType::Advanced);
        assert_eq!(serde_json::to_string(&PlanType::Basic).unwrap(), "\"basic\"");
        let plan: PlanType = serde_json::from_str("\"basic\"").unwrap();
        assert_eq!(plan, PlanType::Basic);
    }

    #[test]
    fn backend_status_aliases() {
        let status: GameStatus = serde_json::from_str("\"not_started\"").unwrap();
        assert_eq!(status, GameStatus::Lobby);
        let status: GameStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(status, GameStatus::InProgress);
        assert_eq!(GameStatus::Ended.to_string(), "ended");
    }

    #[test]
    fn placeholders_do_not_count_as_raters() {
        let mut uq = UserQuestion {
            number: 1,
            user: Uuid::new_v4(),
            question: Question {
                id: Uuid::new_v4(),
                topic_id: Uuid::new_v4(),
                content: "Favourite holiday?".into(),
                tags: vec![],
            },
            rates: HashMap::new(),
        };
        uq.rates.insert(Uuid::new_v4(), Rating::placeholder());
        uq.rates.insert(
            Uuid::new_v4(),
            Rating {
                value: 3,
                tags: vec![],
                placeholder: false,
            },
        );
        assert_eq!(uq.rater_count(), 1);
    }

    #[test]
    fn account_display_name_is_trimmed() {
        let account = Account {
            id: Uuid::new_v4(),
            first_name: "Ada".into(),
            second_name: String::new(),
        };
        assert_eq!(account.display_name(), "Ada");
    }
}
