use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::MeetingRepository;
use crate::error::RepositoryError;
use crate::tokens::MeetingTokenGenerator;

/// Credentials and endpoints of the video meeting provider.
#[derive(Debug, Clone)]
pub struct MeetingApiConfig {
    pub api_url: String,
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    pub sdk_key: String,
    pub sdk_secret: String,
}

#[derive(Deserialize)]
struct CreatedMeeting {
    id: i64,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct AuthData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct OAuthTokens {
    access: String,
    refresh: String,
}

/// Creates meetings through the provider's REST API, refreshing the OAuth
/// access token once when it has expired.
pub struct HttpMeetingRepository {
    client: Client,
    config: MeetingApiConfig,
    tokens: RwLock<OAuthTokens>,
    generator: MeetingTokenGenerator,
}

impl HttpMeetingRepository {
    pub fn new(config: MeetingApiConfig) -> Self {
        let tokens = OAuthTokens {
            access: config.access_token.clone(),
            refresh: config.refresh_token.clone(),
        };
        let generator = MeetingTokenGenerator::new(&config.sdk_key, &config.sdk_secret);
        Self {
            client: Client::new(),
            config,
            tokens: RwLock::new(tokens),
            generator,
        }
    }

    fn meetings_url(&self) -> String {
        format!("{}/users/me/meetings", self.config.api_url.trim_end_matches('/'))
    }

    async fn request_meeting(&self) -> Result<reqwest::Response, RepositoryError> {
        let access = self.tokens.read().await.access.clone();
        let body = serde_json::json!({
            "topic": "Game meeting",
            "type": 2,
            "settings": {},
        });
        Ok(self
            .client
            .post(self.meetings_url())
            .bearer_auth(access)
            .json(&body)
            .send()
            .await?)
    }

    async fn refresh_access_token(&self) -> Result<(), RepositoryError> {
        let mut tokens = self.tokens.write().await;
        let response = self
            .client
            .post(&self.config.oauth_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .query(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RepositoryError::Status {
                url: self.config.oauth_url.clone(),
                status: response.status().as_u16(),
            });
        }
        let auth: AuthData = response.json().await?;
        tokens.access = auth.access_token;
        if let Some(refresh) = auth.refresh_token {
            tokens.refresh = refresh;
        }
        tracing::info!("meeting provider access token refreshed");
        Ok(())
    }
}

#[async_trait]
impl MeetingRepository for HttpMeetingRepository {
    async fn create_meeting(&self) -> Result<(String, String), RepositoryError> {
        let mut response = self.request_meeting().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.refresh_access_token().await?;
            response = self.request_meeting().await?;
        }
        if !response.status().is_success() {
            return Err(RepositoryError::Status {
                url: self.meetings_url(),
                status: response.status().as_u16(),
            });
        }
        let meeting: CreatedMeeting = response.json().await?;
        Ok((meeting.id.to_string(), meeting.password))
    }

    fn generate_meeting_token(&self, meeting_number: &str, role: u8) -> Result<String, RepositoryError> {
        self.generator.generate(meeting_number, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MeetingApiConfig {
        MeetingApiConfig {
            api_url: "https://api.meetings.test/v2/".into(),
            oauth_url: "https://auth.meetings.test/oauth/token".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            sdk_key: "sdk".into(),
            sdk_secret: "sdk-secret".into(),
        }
    }

    #[test]
    fn meetings_url_is_built_from_api_root() {
        let repo = HttpMeetingRepository::new(config());
        assert_eq!(repo.meetings_url(), "https://api.meetings.test/v2/users/me/meetings");
    }

    #[test]
    fn created_meeting_decodes() {
        let meeting: CreatedMeeting =
            serde_json::from_str(r#"{"id": 84512345678, "password": "x1y2", "topic": "Game meeting"}"#)
                .unwrap();
        assert_eq!(meeting.id.to_string(), "84512345678");
        assert_eq!(meeting.password, "x1y2");
    }

    #[test]
    fn token_is_signed_with_sdk_secret() {
        let repo = HttpMeetingRepository::new(config());
        let token = repo.generate_meeting_token("123", 1).unwrap();
        assert_eq!(token.split('.').count(), 3);
    }
}
