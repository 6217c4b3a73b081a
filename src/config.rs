use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionConfig;
use crate::game::SessionConfig;
use crate::repository::{BackendSeed, MeetingApiConfig};

const SEED_FILE: &str = "backend.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be set when {trigger} is set")]
    Missing { key: &'static str, trigger: &'static str },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where games, topics and accounts come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Http { base_url: String, api_key: String },
    Memory { seed_path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub config_path: PathBuf,
    pub backend: BackendConfig,
    pub jwt_signing_key: String,
    pub session: SessionConfig,
    pub connection: ConnectionConfig,
    pub meeting: Option<MeetingApiConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let port = number(&var, "PORT", 3000)?;
        let config_path = PathBuf::from(var("CONFIG_PATH").unwrap_or_else(|| "config".to_string()));

        let backend = match var("BACKEND_URL") {
            Some(base_url) => BackendConfig::Http {
                base_url,
                api_key: var("BACKEND_API_KEY").unwrap_or_default(),
            },
            None => BackendConfig::Memory {
                seed_path: config_path.join(SEED_FILE),
            },
        };

        let session = SessionConfig {
            ended_ttl: Duration::from_secs(number(&var, "ENDED_SESSION_TTL_SECS", 300)?),
        };
        let connection = ConnectionConfig::new(
            Duration::from_secs(number(&var, "WS_WRITE_WAIT_SECS", 10)?),
            Duration::from_secs(number(&var, "WS_PONG_WAIT_SECS", 60)?),
            number(&var, "WS_MAX_MESSAGE_SIZE", 10_000)?,
            number(&var, "WS_SEND_QUEUE", 256)?,
        );

        let meeting = match var("MEETING_SDK_KEY") {
            None => None,
            Some(sdk_key) => {
                let required = |key: &'static str| {
                    var(key).ok_or(ConfigError::Missing {
                        key,
                        trigger: "MEETING_SDK_KEY",
                    })
                };
                Some(MeetingApiConfig {
                    api_url: var("MEETING_API_URL").unwrap_or_else(|| "https://api.zoom.us/v2".to_string()),
                    oauth_url: var("MEETING_OAUTH_URL").unwrap_or_else(|| "https://zoom.us/oauth".to_string()),
                    client_id: required("MEETING_CLIENT_ID")?,
                    client_secret: required("MEETING_CLIENT_SECRET")?,
                    access_token: required("MEETING_ACCESS_TOKEN")?,
                    refresh_token: required("MEETING_REFRESH_TOKEN")?,
                    sdk_secret: required("MEETING_SDK_SECRET")?,
                    sdk_key,
                })
            }
        };

        Ok(Self {
            port,
            config_path,
            backend,
            jwt_signing_key: var("JWT_SIGNING_KEY").unwrap_or_else(|| "secret".to_string()),
            session,
            connection,
            meeting,
        })
    }
}

fn number<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

/// Initialize the config directory with a demo backend seed if missing.
pub fn init(dir: &Path) -> Result<(), ConfigError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Io { path, source }
    };
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(io(dir))?;
    }

    let seed_path = dir.join(SEED_FILE);
    if !seed_path.exists() {
        let demo = serde_json::json!({
            "users": [
                {
                    "id": "7b0e2f4c-8d7a-4f0e-9a51-3c2d1e0f9a01",
                    "first_name": "Demo",
                    "second_name": "Host",
                    "plan": "premium"
                }
            ],
            "games": [
                {
                    "id": "5f1c9e2a-3b4d-4c6e-8f70-9a1b2c3d4e5f",
                    "name": "Friday icebreaker",
                    "status": "lobby",
                    "creator_id": "7b0e2f4c-8d7a-4f0e-9a51-3c2d1e0f9a01"
                }
            ],
            "topics": [
                {
                    "id": "0c3e5a7b-1d2f-4a6b-8c9d-0e1f2a3b4c5d",
                    "title": "Travel",
                    "questions": [
                        { "content": "What is the best trip you have ever taken?" },
                        { "content": "Where would you go with a free ticket?" },
                        { "content": "Mountains or seaside?" },
                        { "content": "What is the strangest food you tried abroad?" },
                        { "content": "Which city would you move to tomorrow?" }
                    ]
                },
                {
                    "id": "9d8c7b6a-5f4e-4d3c-b2a1-0f9e8d7c6b5a",
                    "title": "Work habits",
                    "questions": [
                        { "content": "Morning person or night owl?" },
                        { "content": "What is on your desk right now?" },
                        { "content": "Which tool could you not work without?" },
                        { "content": "What was your first job?" },
                        { "content": "Best productivity tip you know?" }
                    ]
                },
                {
                    "id": "1a2b3c4d-5e6f-4a7b-8c9d-aabbccddeeff",
                    "title": "Hobbies",
                    "questions": [
                        { "content": "What did you do last weekend?" },
                        { "content": "Which skill would you like to learn?" },
                        { "content": "Favourite book or series?" },
                        { "content": "What hobby did you drop and miss?" },
                        { "content": "What do you collect?" }
                    ]
                }
            ]
        });
        let pretty = serde_json::to_string_pretty(&demo).map_err(|source| ConfigError::Parse {
            path: seed_path.clone(),
            source,
        })?;
        fs::write(&seed_path, pretty).map_err(io(&seed_path))?;
        tracing::info!("wrote demo backend seed to {}", seed_path.display());
    }
    Ok(())
}

/// Load the in-memory backend seed.
pub fn load_seed(path: &Path) -> Result<BackendSeed, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_use_memory_backend() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(
            config.backend,
            BackendConfig::Memory {
                seed_path: PathBuf::from("config/backend.json")
            }
        );
        assert_eq!(config.session.ended_ttl, Duration::from_secs(300));
        assert_eq!(config.connection.max_message_size, 10_000);
        assert_eq!(config.connection.ping_period, Duration::from_secs(54));
        assert!(config.meeting.is_none());
    }

    #[test]
    fn backend_url_selects_http() {
        let config = Config::from_lookup(lookup(&[
            ("BACKEND_URL", "http://backend:8080"),
            ("BACKEND_API_KEY", "key"),
            ("WS_PONG_WAIT_SECS", "10"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Http {
                base_url: "http://backend:8080".into(),
                api_key: "key".into()
            }
        );
        assert_eq!(config.connection.ping_period, Duration::from_secs(9));
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = Config::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { key: "PORT", .. }));
    }

    #[test]
    fn partial_meeting_block_is_rejected() {
        let err = Config::from_lookup(lookup(&[("MEETING_SDK_KEY", "sdk")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));

        let config = Config::from_lookup(lookup(&[
            ("MEETING_SDK_KEY", "sdk"),
            ("MEETING_SDK_SECRET", "s"),
            ("MEETING_CLIENT_ID", "id"),
            ("MEETING_CLIENT_SECRET", "cs"),
            ("MEETING_ACCESS_TOKEN", "at"),
            ("MEETING_REFRESH_TOKEN", "rt"),
        ]))
        .unwrap();
        let meeting = config.meeting.unwrap();
        assert_eq!(meeting.sdk_key, "sdk");
        assert_eq!(meeting.api_url, "https://api.zoom.us/v2");
    }

    #[test]
    fn init_writes_a_loadable_seed_once() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        init(&config_dir).unwrap();

        let seed = load_seed(&config_dir.join(SEED_FILE)).unwrap();
        assert_eq!(seed.games.len(), 1);
        assert_eq!(seed.topics.len(), 3);
        assert!(seed.topics.iter().all(|t| t.questions.len() == 5));

        fs::write(config_dir.join(SEED_FILE), "{\"games\": []}").unwrap();
        init(&config_dir).unwrap();
        assert!(load_seed(&config_dir.join(SEED_FILE)).unwrap().games.is_empty());
    }

    #[test]
    fn malformed_seed_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SEED_FILE);
        fs::write(&path, "not json").unwrap();
        assert!(matches!(load_seed(&path), Err(ConfigError::Parse { .. })));
    }
}
