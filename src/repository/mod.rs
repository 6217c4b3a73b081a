//! Narrow interfaces to the collaborators a game session depends on.

mod http;
mod meeting;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::types::{Account, GameId, GameRecord, PlanType, PlayerResult, Question, Score, TopicInfo, UserId};

pub use http::HttpBackend;
pub use meeting::{HttpMeetingRepository, MeetingApiConfig};
pub use memory::{BackendSeed, MemoryBackend, SeedGame, SeedQuestion, SeedTopic, SeedUser};

#[async_trait]
pub trait GameRepository: Send + Sync {
    async fn get_game(&self, id: GameId) -> Result<GameRecord, RepositoryError>;
    async fn start_game(&self, id: GameId) -> Result<(), RepositoryError>;
    async fn end_game(&self, id: GameId) -> Result<(), RepositoryError>;
    async fn save_results(
        &self,
        id: GameId,
        results: &HashMap<UserId, Score>,
    ) -> Result<(), RepositoryError>;
    async fn get_results(&self, id: GameId) -> Result<Vec<PlayerResult>, RepositoryError>;
}

#[async_trait]
pub trait TopicRepository: Send + Sync {
    async fn get_topic(&self, id: Uuid) -> Result<TopicInfo, RepositoryError>;
    async fn get_random_questions(
        &self,
        topic_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Question>, RepositoryError>;
    async fn get_random_topics(&self, limit: usize) -> Result<Vec<TopicInfo>, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Verifies a bearer token, returning the participant id and its role.
    fn parse_token(&self, token: &str) -> Result<(UserId, String), RepositoryError>;
    async fn get_user_by_id(&self, id: UserId) -> Result<Account, RepositoryError>;
    async fn get_creator_plan(&self, creator_id: UserId) -> Result<PlanType, RepositoryError>;
}

#[async_trait]
pub trait MeetingRepository: Send + Sync {
    /// Creates a meeting and returns its number and passcode.
    async fn create_meeting(&self) -> Result<(String, String), RepositoryError>;
    fn generate_meeting_token(&self, meeting_number: &str, role: u8) -> Result<String, RepositoryError>;
}

/// The collaborator bundle injected into the registry and every session.
#[derive(Clone)]
pub struct Services {
    pub games: Arc<dyn GameRepository>,
    pub topics: Arc<dyn TopicRepository>,
    pub users: Arc<dyn UserRepository>,
    pub meetings: Option<Arc<dyn MeetingRepository>>,
}

impl Services {
    pub fn http(backend: Arc<HttpBackend>) -> Self {
        Self {
            games: backend.clone(),
            topics: backend.clone(),
            users: backend,
            meetings: None,
        }
    }

    pub fn memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            games: backend.clone(),
            topics: backend.clone(),
            users: backend,
            meetings: None,
        }
    }

    pub fn with_meetings(mut self, meetings: Arc<dyn MeetingRepository>) -> Self {
        self.meetings = Some(meetings);
        self
    }
}
