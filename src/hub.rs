//! Process-wide registry of live connections and resident game sessions.
//!
//! All registry state is owned by one task; callers reach it through [`Hub`].

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::error::{GameError, RepositoryError};
use crate::game::{self, GameCommand, GameHandle, SessionConfig, SessionSeed};
use crate::repository::Services;
use crate::types::{ConnectionId, GameId, GameStatus, User};

type Lookup = oneshot::Sender<Result<GameHandle, GameError>>;

/// Commands the registry task accepts.
#[derive(Debug)]
pub enum HubCommand {
    Register { id: ConnectionId, user: User },
    Unregister { id: ConnectionId },
    FindSession { id: GameId, reply: Lookup },
    SessionLoaded { id: GameId, outcome: Result<SessionSeed, GameError> },
    Evict { id: GameId },
    ConnectionCount { reply: oneshot::Sender<usize> },
}

#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
}

/// Non-owning reference to the registry, held by sessions.
#[derive(Clone)]
pub struct WeakHub {
    tx: mpsc::WeakSender<HubCommand>,
}

impl WeakHub {
    pub async fn evict(&self, id: GameId) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(HubCommand::Evict { id }).await;
        }
    }
}

struct HubState {
    connections: HashMap<ConnectionId, User>,
    sessions: HashMap<GameId, GameHandle>,
    pending: HashMap<GameId, Vec<Lookup>>,
    services: Services,
    config: SessionConfig,
    weak: WeakHub,
}

impl Hub {
    /// Starts the registry task.
    pub fn spawn(services: Services, config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let hub = Self { tx };
        let state = HubState {
            connections: HashMap::new(),
            sessions: HashMap::new(),
            pending: HashMap::new(),
            services,
            config,
            weak: hub.downgrade(),
        };
        tokio::spawn(hub_task(state, rx));
        hub
    }

    pub fn downgrade(&self) -> WeakHub {
        WeakHub {
            tx: self.tx.downgrade(),
        }
    }

    pub async fn register(&self, id: ConnectionId, user: User) {
        let _ = self.tx.send(HubCommand::Register { id, user }).await;
    }

    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.tx.send(HubCommand::Unregister { id }).await;
    }

    /// Returns the resident session for `id`, materializing it from the
    /// backend on first reference.
    pub async fn find_session(&self, id: GameId) -> Result<GameHandle, GameError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::FindSession { id, reply })
            .await
            .map_err(|_| GameError::Backend("registry stopped".into()))?;
        rx.await
            .map_err(|_| GameError::Backend("registry stopped".into()))?
    }

    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubCommand::ConnectionCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn hub_task(mut state: HubState, mut rx: mpsc::Receiver<HubCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register { id, user } => {
                state.connections.insert(id, user);
            }
            HubCommand::Unregister { id } => {
                state.connections.remove(&id);
            }
            HubCommand::FindSession { id, reply } => {
                handle_find(&mut state, id, reply);
            }
            HubCommand::SessionLoaded { id, outcome } => {
                handle_loaded(&mut state, id, outcome);
            }
            HubCommand::Evict { id } => {
                if let Some(handle) = state.sessions.remove(&id) {
                    let _ = handle.send(GameCommand::Shutdown).await;
                    tracing::info!(game_id = %id, "session evicted");
                }
            }
            HubCommand::ConnectionCount { reply } => {
                let _ = reply.send(state.connections.len());
            }
        }
    }
    tracing::info!("registry stopped");
}

fn handle_find(state: &mut HubState, id: GameId, reply: Lookup) {
    if let Some(handle) = state.sessions.get(&id) {
        let _ = reply.send(Ok(handle.clone()));
        return;
    }
    if let Some(waiters) = state.pending.get_mut(&id) {
        waiters.push(reply);
        return;
    }
    state.pending.insert(id, vec![reply]);

    let services = state.services.clone();
    let weak = state.weak.clone();
    tokio::spawn(async move {
        let outcome = load_session(&services, id).await;
        if let Some(tx) = weak.tx.upgrade() {
            let _ = tx.send(HubCommand::SessionLoaded { id, outcome }).await;
        }
    });
}

fn handle_loaded(state: &mut HubState, id: GameId, outcome: Result<SessionSeed, GameError>) {
    let waiters = state.pending.remove(&id).unwrap_or_default();
    let result = outcome.map(|seed| {
        let handle = game::spawn_session(seed, state.services.clone(), state.weak.clone(), state.config.clone());
        state.sessions.insert(id, handle.clone());
        tracing::info!(game_id = %id, "session materialized ({} resident)", state.sessions.len());
        handle
    });
    if let Err(e) = &result {
        tracing::warn!(game_id = %id, "session lookup failed: {}", e);
    }
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

async fn load_session(services: &Services, id: GameId) -> Result<SessionSeed, GameError> {
    let record = services.games.get_game(id).await.map_err(|e| match e {
        RepositoryError::NotFound(_) => GameError::GameNotFound,
        other => other.into(),
    })?;
    if record.status == GameStatus::Ended {
        return Err(GameError::AlreadyInState(GameStatus::Ended));
    }
    let plan = services.users.get_creator_plan(record.creator_id).await?;
    Ok(SessionSeed { record, plan })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::repository::MemoryBackend;
    use crate::tokens::TokenVerifier;
    use crate::types::{Account, GameRecord, PlanType};
    use uuid::Uuid;

    async fn setup(status: GameStatus, plan: PlanType) -> (Hub, Arc<MemoryBackend>, GameId) {
        let backend = Arc::new(MemoryBackend::new(TokenVerifier::new("secret")));
        let creator = Uuid::new_v4();
        let game_id = Uuid::new_v4();
        backend
            .insert_user(
                Account {
                    id: creator,
                    first_name: "Creator".into(),
                    second_name: String::new(),
                },
                plan,
            )
            .await;
        backend
            .insert_game(GameRecord {
                id: game_id,
                name: "Team sync".into(),
                status,
                creator_id: creator,
            })
            .await;
        let hub = Hub::spawn(Services::memory(backend.clone()), SessionConfig::default());
        (hub, backend, game_id)
    }

    #[tokio::test]
    async fn first_reference_materializes_with_plan_capacity() {
        let (hub, _, game_id) = setup(GameStatus::Lobby, PlanType::Advanced).await;
        let handle = hub.find_session(game_id).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, GameStatus::Lobby);
        assert_eq!(snapshot.max_size, 5);
        assert_eq!(snapshot.name, "Team sync");
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_session() {
        let (hub, _, game_id) = setup(GameStatus::Lobby, PlanType::Basic).await;
        let (a, b) = tokio::join!(hub.find_session(game_id), hub.find_session(game_id));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.same_session(&b));

        let c = hub.find_session(game_id).await.unwrap();
        assert!(a.same_session(&c));
    }

    #[tokio::test]
    async fn ended_game_is_not_materialized() {
        let (hub, _, game_id) = setup(GameStatus::Ended, PlanType::Basic).await;
        let err = hub.find_session(game_id).await.unwrap_err();
        assert_eq!(err, GameError::AlreadyInState(GameStatus::Ended));
        assert_eq!(err.code(), 5);
    }

    #[tokio::test]
    async fn unknown_game_is_not_found() {
        let (hub, _, _) = setup(GameStatus::Lobby, PlanType::Basic).await;
        let err = hub.find_session(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, GameError::GameNotFound);
    }

    #[tokio::test]
    async fn tracks_connection_set() {
        let (hub, _, _) = setup(GameStatus::Lobby, PlanType::Basic).await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        hub.register(a, User::guest("a")).await;
        hub.register(b, User::guest("b")).await;
        assert_eq!(hub.connection_count().await, 2);
        hub.unregister(a).await;
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn evicted_session_stops_accepting_commands() {
        let (hub, _, game_id) = setup(GameStatus::Lobby, PlanType::Basic).await;
        let handle = hub.find_session(game_id).await.unwrap();
        hub.downgrade().evict(game_id).await;
        // The registry processes commands in order, so the shutdown has been sent.
        assert_eq!(hub.connection_count().await, 0);
        assert!(handle.snapshot().await.is_none());
    }
}
