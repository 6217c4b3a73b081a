use std::collections::HashMap;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{GameRepository, TopicRepository, UserRepository};
use crate::error::RepositoryError;
use crate::tokens::TokenVerifier;
use crate::types::{
    Account, GameId, GameRecord, GameStatus, PlanType, PlayerResult, Question, Score, Tag, TopicInfo, UserId,
};

/// Demo data loaded from `backend.json` when no backend URL is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSeed {
    #[serde(default)]
    pub games: Vec<SeedGame>,
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub topics: Vec<SeedTopic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedGame {
    pub id: GameId,
    pub name: String,
    #[serde(default = "lobby")]
    pub status: GameStatus,
    pub creator_id: UserId,
}

fn lobby() -> GameStatus {
    GameStatus::Lobby
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub id: UserId,
    pub first_name: String,
    #[serde(default)]
    pub second_name: String,
    #[serde(default = "basic")]
    pub plan: PlanType,
}

fn basic() -> PlanType {
    PlanType::Basic
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedTopic {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub questions: Vec<SeedQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedQuestion {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Default)]
struct MemoryState {
    games: HashMap<GameId, GameRecord>,
    accounts: HashMap<UserId, Account>,
    plans: HashMap<UserId, PlanType>,
    topics: Vec<TopicInfo>,
    questions: HashMap<Uuid, Vec<Question>>,
    results: HashMap<GameId, HashMap<UserId, Score>>,
    start_calls: HashMap<GameId, usize>,
    end_calls: HashMap<GameId, usize>,
}

/// In-process stand-in for the backend of record. Records every write so
/// callers can inspect what a session persisted.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    tokens: TokenVerifier,
}

impl MemoryBackend {
    pub fn new(tokens: TokenVerifier) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            tokens,
        }
    }

    pub fn from_seed(seed: BackendSeed, tokens: TokenVerifier) -> Self {
        let mut state = MemoryState::default();
        for game in seed.games {
            state.games.insert(
                game.id,
                GameRecord {
                    id: game.id,
                    name: game.name,
                    status: game.status,
                    creator_id: game.creator_id,
                },
            );
        }
        for user in seed.users {
            state.plans.insert(user.id, user.plan);
            state.accounts.insert(
                user.id,
                Account {
                    id: user.id,
                    first_name: user.first_name,
                    second_name: user.second_name,
                },
            );
        }
        for topic in seed.topics {
            let questions = topic
                .questions
                .into_iter()
                .map(|q| Question {
                    id: q.id,
                    topic_id: topic.id,
                    content: q.content,
                    tags: q.tags,
                })
                .collect();
            state.questions.insert(topic.id, questions);
            state.topics.push(TopicInfo {
                id: topic.id,
                title: topic.title,
            });
        }
        Self {
            state: Mutex::new(state),
            tokens,
        }
    }

    pub fn tokens(&self) -> &TokenVerifier {
        &self.tokens
    }

    pub async fn insert_game(&self, record: GameRecord) {
        self.state.lock().await.games.insert(record.id, record);
    }

    pub async fn insert_user(&self, account: Account, plan: PlanType) {
        let mut state = self.state.lock().await;
        state.plans.insert(account.id, plan);
        state.accounts.insert(account.id, account);
    }

    pub async fn insert_topic(&self, topic: TopicInfo, questions: Vec<Question>) {
        let mut state = self.state.lock().await;
        state.questions.insert(topic.id, questions);
        state.topics.retain(|t| t.id != topic.id);
        state.topics.push(topic);
    }

    pub async fn game(&self, id: GameId) -> Option<GameRecord> {
        self.state.lock().await.games.get(&id).cloned()
    }

    pub async fn start_calls(&self, id: GameId) -> usize {
        self.state.lock().await.start_calls.get(&id).copied().unwrap_or(0)
    }

    pub async fn end_calls(&self, id: GameId) -> usize {
        self.state.lock().await.end_calls.get(&id).copied().unwrap_or(0)
    }

    pub async fn saved_results(&self, id: GameId) -> Option<HashMap<UserId, Score>> {
        self.state.lock().await.results.get(&id).cloned()
    }
}

impl MemoryState {
    fn game_mut(&mut self, id: GameId) -> Result<&mut GameRecord, RepositoryError> {
        self.games
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("game {id}")))
    }

    fn tag(&self, id: Uuid) -> Tag {
        self.questions
            .values()
            .flatten()
            .flat_map(|q| q.tags.iter())
            .find(|t| t.id == id)
            .cloned()
            .unwrap_or(Tag {
                id,
                name: String::new(),
            })
    }
}

#[async_trait]
impl GameRepository for MemoryBackend {
    async fn get_game(&self, id: GameId) -> Result<GameRecord, RepositoryError> {
        let mut state = self.state.lock().await;
        Ok(state.game_mut(id)?.clone())
    }

    async fn start_game(&self, id: GameId) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.game_mut(id)?.status = GameStatus::InProgress;
        *state.start_calls.entry(id).or_default() += 1;
        Ok(())
    }

    async fn end_game(&self, id: GameId) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.game_mut(id)?.status = GameStatus::Ended;
        *state.end_calls.entry(id).or_default() += 1;
        Ok(())
    }

    async fn save_results(
        &self,
        id: GameId,
        results: &HashMap<UserId, Score>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.game_mut(id)?;
        state.results.insert(id, results.clone());
        Ok(())
    }

    async fn get_results(&self, id: GameId) -> Result<Vec<PlayerResult>, RepositoryError> {
        let state = self.state.lock().await;
        let Some(saved) = state.results.get(&id) else {
            return Ok(Vec::new());
        };
        let mut results: Vec<PlayerResult> = saved
            .iter()
            .map(|(user_id, score)| PlayerResult {
                user_id: *user_id,
                name: state
                    .accounts
                    .get(user_id)
                    .map(Account::display_name)
                    .unwrap_or_default(),
                value: score.value,
                tags: score.tags.iter().map(|t| state.tag(*t)).collect(),
            })
            .collect();
        results.sort_by(|a, b| b.value.cmp(&a.value).then(a.user_id.cmp(&b.user_id)));
        Ok(results)
    }
}

#[async_trait]
impl TopicRepository for MemoryBackend {
    async fn get_topic(&self, id: Uuid) -> Result<TopicInfo, RepositoryError> {
        let state = self.state.lock().await;
        state
            .topics
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("topic {id}")))
    }

    async fn get_random_questions(
        &self,
        topic_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Question>, RepositoryError> {
        let state = self.state.lock().await;
        let mut questions = state
            .questions
            .get(&topic_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("topic {topic_id}")))?;
        questions.shuffle(&mut rand::rng());
        questions.truncate(limit);
        Ok(questions)
    }

    async fn get_random_topics(&self, limit: usize) -> Result<Vec<TopicInfo>, RepositoryError> {
        let state = self.state.lock().await;
        let mut topics = state.topics.clone();
        topics.shuffle(&mut rand::rng());
        topics.truncate(limit);
        Ok(topics)
    }
}

#[async_trait]
impl UserRepository for MemoryBackend {
    fn parse_token(&self, token: &str) -> Result<(UserId, String), RepositoryError> {
        self.tokens.verify(token)
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Account, RepositoryError> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))
    }

    async fn get_creator_plan(&self, creator_id: UserId) -> Result<PlanType, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.plans.get(&creator_id).copied().unwrap_or(PlanType::Basic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn seed() -> BackendSeed {
        serde_json::from_value(serde_json::json!({
            "games": [{
                "id": "00000000-0000-0000-0000-0000000000a1",
                "name": "Friday icebreaker",
                "creator_id": "00000000-0000-0000-0000-000000000001"
            }],
            "users": [{
                "id": "00000000-0000-0000-0000-000000000001",
                "first_name": "Ada",
                "second_name": "Lovelace",
                "plan": "advanced"
            }],
            "topics": [{
                "id": "00000000-0000-0000-0000-0000000000b1",
                "title": "Travel",
                "questions": [
                    { "content": "Best trip?" },
                    { "content": "Worst trip?" },
                    { "content": "Next trip?" }
                ]
            }]
        }))
        .unwrap()
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::from_seed(seed(), TokenVerifier::new("secret"))
    }

    #[tokio::test]
    async fn seeded_game_starts_in_lobby() {
        let backend = backend();
        let game = backend.get_game(Uuid::from_u128(0xa1)).await.unwrap();
        assert_eq!(game.status, GameStatus::Lobby);
        assert_eq!(game.creator_id, Uuid::from_u128(1));
        assert_eq!(
            backend.get_creator_plan(Uuid::from_u128(1)).await.unwrap(),
            PlanType::Advanced
        );
    }

    #[tokio::test]
    async fn random_questions_respect_limit() {
        let backend = backend();
        let topic = Uuid::from_u128(0xb1);
        let questions = backend.get_random_questions(topic, 2).await.unwrap();
        assert_eq!(questions.len(), 2);
        assert!(questions.iter().all(|q| q.topic_id == topic));

        let questions = backend.get_random_questions(topic, 10).await.unwrap();
        assert_eq!(questions.len(), 3);
    }

    #[tokio::test]
    async fn unknown_topic_is_not_found() {
        let err = backend().get_topic(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn end_game_is_counted_and_results_are_named() {
        let backend = backend();
        let game = Uuid::from_u128(0xa1);
        let ada = Uuid::from_u128(1);
        let guest = Uuid::new_v4();

        backend.end_game(game).await.unwrap();
        assert_eq!(backend.end_calls(game).await, 1);
        assert_eq!(backend.game(game).await.unwrap().status, GameStatus::Ended);

        let mut results = HashMap::new();
        results.insert(ada, Score { value: 4, tags: BTreeSet::new() });
        results.insert(guest, Score { value: 9, tags: BTreeSet::new() });
        backend.save_results(game, &results).await.unwrap();

        let canonical = backend.get_results(game).await.unwrap();
        assert_eq!(canonical[0].user_id, guest);
        assert_eq!(canonical[1].name, "Ada Lovelace");
    }
}
