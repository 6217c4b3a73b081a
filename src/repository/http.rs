use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{GameRepository, TopicRepository, UserRepository};
use crate::error::RepositoryError;
use crate::tokens::TokenVerifier;
use crate::types::{Account, GameId, GameRecord, PlanType, PlayerResult, Question, Score, TopicInfo, UserId};

const API_KEY_HEADER: &str = "X-API-Key";

/// Game, topic and user repositories backed by the account service's REST API.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    tokens: TokenVerifier,
}

#[derive(Deserialize)]
struct PlanResponse {
    plan_type: PlanType,
}

#[derive(Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    results: Vec<PlayerResult>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, tokens: TokenVerifier) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, RepositoryError> {
        let response = request.header(API_KEY_HEADER, &self.api_key).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(RepositoryError::NotFound(url.to_string())),
            status => Err(RepositoryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RepositoryError> {
        let url = self.url(path);
        let response = self.send(self.client.get(&url), &url).await?;
        Ok(response.json().await?)
    }

    async fn patch(&self, path: &str) -> Result<(), RepositoryError> {
        let url = self.url(path);
        self.send(self.client.patch(&url), &url).await?;
        Ok(())
    }
}

#[async_trait]
impl GameRepository for HttpBackend {
    async fn get_game(&self, id: GameId) -> Result<GameRecord, RepositoryError> {
        self.get_json(&format!("/api/games/{id}")).await
    }

    async fn start_game(&self, id: GameId) -> Result<(), RepositoryError> {
        self.patch(&format!("/api/games/start/{id}")).await
    }

    async fn end_game(&self, id: GameId) -> Result<(), RepositoryError> {
        self.patch(&format!("/api/games/end/{id}")).await
    }

    async fn save_results(
        &self,
        id: GameId,
        results: &HashMap<UserId, Score>,
    ) -> Result<(), RepositoryError> {
        let url = self.url(&format!("/api/games/{id}/results"));
        let body = serde_json::json!({ "results": results });
        self.send(self.client.post(&url).json(&body), &url).await?;
        Ok(())
    }

    async fn get_results(&self, id: GameId) -> Result<Vec<PlayerResult>, RepositoryError> {
        let response: ResultsResponse = self.get_json(&format!("/api/games/{id}/results")).await?;
        Ok(response.results)
    }
}

#[async_trait]
impl TopicRepository for HttpBackend {
    async fn get_topic(&self, id: Uuid) -> Result<TopicInfo, RepositoryError> {
        self.get_json(&format!("/api/topics/{id}")).await
    }

    async fn get_random_questions(
        &self,
        topic_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Question>, RepositoryError> {
        let url = self.url("/api/questions/");
        let request = self
            .client
            .get(&url)
            .query(&[("topic_id", topic_id.to_string()), ("limit", limit.to_string())]);
        let response = self.send(request, &url).await?;
        Ok(response.json().await?)
    }

    async fn get_random_topics(&self, limit: usize) -> Result<Vec<TopicInfo>, RepositoryError> {
        self.get_json(&format!("/api/topics/list/{limit}")).await
    }
}

#[async_trait]
impl UserRepository for HttpBackend {
    fn parse_token(&self, token: &str) -> Result<(UserId, String), RepositoryError> {
        self.tokens.verify(token)
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Account, RepositoryError> {
        self.get_json(&format!("/api/users/{id}")).await
    }

    async fn get_creator_plan(&self, creator_id: UserId) -> Result<PlanType, RepositoryError> {
        let plan: PlanResponse = self.get_json(&format!("/api/users/{creator_id}/plan")).await?;
        Ok(plan.plan_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let backend = HttpBackend::new("http://backend:8001/", "key", TokenVerifier::new("s"));
        assert_eq!(
            backend.url("/api/topics/list/3"),
            "http://backend:8001/api/topics/list/3"
        );
    }

    #[test]
    fn results_body_decodes() {
        let body = r#"{"results":[{"user_id":"6f1c3c2e-4c1b-4a7e-9a51-7f0d2c9f1a11","name":"Ada L","value":9,"tags":[]}]}"#;
        let parsed: ResultsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].value, 9);
    }

    #[test]
    fn plan_body_decodes() {
        let parsed: PlanResponse =
            serde_json::from_str(r#"{"id":"6f1c3c2e-4c1b-4a7e-9a51-7f0d2c9f1a11","plan_type":"premium"}"#)
                .unwrap();
        assert_eq!(parsed.plan_type, PlanType::Premium);
    }
}
