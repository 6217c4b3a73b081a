//! Error types for admission, game commands and backend collaborators.

use thiserror::Error;
use uuid::Uuid;

use crate::types::GameStatus;

/// A rejected game command. Sent back to the originating connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("max number of participants ({max}) reached")]
    Capacity { max: usize },

    #[error("cannot {action} while the game is {status}")]
    InvalidState {
        action: &'static str,
        status: GameStatus,
    },

    /// A backend request for the same transition is still outstanding.
    #[error("a {0} request is already pending")]
    Busy(&'static str),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("not enough questions for topic {topic}: got {got}, need {need}")]
    InsufficientQuestions { topic: Uuid, got: usize, need: usize },

    #[error("game is already {0}")]
    AlreadyInState(GameStatus),

    #[error("number of rounds is 0")]
    NoTopics,

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("only the game creator can {0}")]
    Permission(&'static str),

    #[error("invalid round target: {0}")]
    InvalidRound(String),

    #[error("participants cannot rate themselves")]
    SelfRating,

    #[error("participant {0} was already rated by this participant")]
    AlreadyRated(Uuid),

    #[error("not a participant of this game")]
    NotMember,

    #[error("game not found")]
    GameNotFound,
}

impl GameError {
    /// Stable wire code carried in the error envelope.
    pub fn code(&self) -> u16 {
        match self {
            Self::Capacity { .. } => 1,
            Self::InvalidState { .. } | Self::Busy(_) => 2,
            Self::Payload(_) => 3,
            Self::InsufficientQuestions { .. } => 4,
            Self::AlreadyInState(_) => 5,
            Self::NoTopics => 6,
            Self::Backend(_) => 7,
            Self::Permission(_) => 8,
            Self::InvalidRound(_) => 9,
            Self::SelfRating => 10,
            Self::AlreadyRated(_) => 11,
            Self::NotMember => 12,
            Self::GameNotFound => 13,
        }
    }
}

impl From<RepositoryError> for GameError {
    fn from(err: RepositoryError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for GameError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

/// Failure of an external collaborator call.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// Why a connection was refused before the upgrade.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("either a token or a name query parameter is required")]
    MissingCredentials,

    #[error("token rejected: {0}")]
    InvalidToken(RepositoryError),

    #[error("role {0:?} may not join games")]
    ForbiddenRole(String),

    #[error("display name must be 1 to {max} characters")]
    InvalidName { max: usize },

    #[error("account lookup failed: {0}")]
    Account(RepositoryError),
}
