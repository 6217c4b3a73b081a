use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::connection::ConnHandle;
use crate::error::{GameError, RepositoryError};
use crate::hub::WeakHub;
use crate::protocol::{Action, Envelope, GameRequest, RatePayload};
use crate::repository::{MeetingRepository, Services, TopicRepository};
use crate::types::*;

/// Size of the random topic set handed to basic-tier creators.
const BASIC_TOPIC_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an ended session stays resident before it is evicted.
    pub ended_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ended_ttl: Duration::from_secs(300),
        }
    }
}

/// Backend data a session is materialized from.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub record: GameRecord,
    pub plan: PlanType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The participant asked to leave.
    Leave,
    /// The connection's transport went away.
    Disconnect,
}

/// Questions fetched for every selected topic, plus the optional meeting.
#[derive(Debug)]
pub struct StartPlan {
    questions: Vec<(Uuid, Vec<Question>)>,
    meeting: Option<MeetingInfo>,
}

/// Commands a game session's task processes, strictly in arrival order.
#[derive(Debug)]
pub enum GameCommand {
    Register(ConnHandle),
    Unregister {
        conn: ConnectionId,
        user: UserId,
        departure: Departure,
    },
    Request {
        conn: ConnHandle,
        request: GameRequest,
    },
    /// Completion of a select-topic backend fetch.
    TopicsLoaded {
        conn: ConnHandle,
        outcome: Result<Vec<Topic>, GameError>,
    },
    /// Completion of a start-game question fetch.
    QuestionsLoaded {
        conn: ConnHandle,
        outcome: Result<StartPlan, GameError>,
    },
    /// Canonical results after the end of the game was persisted.
    Finalized { results: Vec<PlayerResult> },
    Snapshot(oneshot::Sender<GameSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct GameHandle {
    pub game_id: GameId,
    cmd_tx: mpsc::Sender<GameCommand>,
}

impl GameHandle {
    pub async fn send(&self, cmd: GameCommand) -> Result<(), GameError> {
        self.cmd_tx.send(cmd).await.map_err(|_| GameError::GameNotFound)
    }

    /// `None` once the session has stopped.
    pub async fn snapshot(&self) -> Option<GameSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(GameCommand::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }

    pub fn same_session(&self, other: &GameHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }
}

/// The internal state of a running game. Owned by its task alone.
struct GameState {
    id: GameId,
    name: String,
    creator: UserId,
    status: GameStatus,
    plan: PlanType,
    max_size: usize,

    participants: Vec<User>,
    connections: HashMap<ConnectionId, ConnHandle>,

    topics: Vec<Topic>,
    round: Option<Round>,
    results: HashMap<UserId, Score>,

    selecting: bool,
    starting: bool,

    services: Services,
    hub: WeakHub,
    config: SessionConfig,
    self_tx: mpsc::WeakSender<GameCommand>,
}

impl GameState {
    fn envelope(&self, action: Action, payload: Value) -> Envelope {
        Envelope::new(action, self.id, payload)
    }

    async fn broadcast(&self, envelope: Envelope) {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(game_id = %self.id, "failed to encode {}: {}", envelope.action, e);
                return;
            }
        };
        for conn in self.connections.values() {
            conn.send_frame(frame.clone()).await;
        }
    }

    async fn reject(&self, conn: &ConnHandle, err: GameError) {
        tracing::warn!(game_id = %self.id, user = %conn.user.id, "rejected: {}", err);
        conn.send(&Envelope::error(self.id, &err)).await;
    }

    fn view(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "status": self.status,
            "max_size": self.max_size,
            "creator_id": self.creator,
            "users": self.participants,
            "topics": self.topics,
            "round": self.round,
        })
    }

    fn is_member(&self, user: UserId) -> bool {
        self.participants.iter().any(|p| p.id == user)
    }

    fn ensure_creator(&self, user: &User, action: &'static str) -> Result<(), GameError> {
        if user.id == self.creator {
            Ok(())
        } else {
            Err(GameError::Permission(action))
        }
    }

    fn ensure_status(&self, expected: GameStatus, action: &'static str) -> Result<(), GameError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(GameError::InvalidState {
                action,
                status: self.status,
            })
        }
    }

    fn local_results(&self) -> Vec<PlayerResult> {
        self.results
            .iter()
            .map(|(user_id, score)| PlayerResult {
                user_id: *user_id,
                name: self
                    .participants
                    .iter()
                    .find(|p| p.id == *user_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
                value: score.value,
                tags: score
                    .tags
                    .iter()
                    .map(|id| Tag {
                        id: *id,
                        name: String::new(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            id: self.id,
            name: self.name.clone(),
            creator: self.creator,
            status: self.status,
            max_size: self.max_size,
            participants: self.participants.clone(),
            connections: self.connections.len(),
            topics: self.topics.clone(),
            round: self.round.clone(),
            results: self.results.clone(),
        }
    }
}

/// Start a session task for a game loaded from the backend.
pub fn spawn_session(seed: SessionSeed, services: Services, hub: WeakHub, config: SessionConfig) -> GameHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let state = GameState {
        id: seed.record.id,
        name: seed.record.name,
        creator: seed.record.creator_id,
        status: seed.record.status,
        plan: seed.plan,
        max_size: seed.plan.max_size(),
        participants: Vec::new(),
        connections: HashMap::new(),
        topics: Vec::new(),
        round: None,
        results: HashMap::new(),
        selecting: false,
        starting: false,
        services,
        hub,
        config,
        self_tx: cmd_tx.downgrade(),
    };
    let handle = GameHandle {
        game_id: state.id,
        cmd_tx,
    };
    tokio::spawn(game_task(state, cmd_rx));
    handle
}

async fn game_task(mut state: GameState, mut cmd_rx: mpsc::Receiver<GameCommand>) {
    tracing::info!(
        game_id = %state.id,
        "session running ({}, up to {} participants)",
        state.status,
        state.max_size
    );

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            GameCommand::Register(conn) => {
                if let Err(e) = handle_join(&mut state, &conn).await {
                    state.reject(&conn, e).await;
                }
            }
            GameCommand::Unregister {
                conn,
                user,
                departure,
            } => {
                handle_departure(&mut state, conn, user, departure).await;
            }
            GameCommand::Request { conn, request } => {
                if let Err(e) = handle_request(&mut state, &conn, request).await {
                    state.reject(&conn, e).await;
                }
            }
            GameCommand::TopicsLoaded { conn, outcome } => {
                if let Err(e) = apply_topics(&mut state, &conn, outcome).await {
                    state.reject(&conn, e).await;
                }
            }
            GameCommand::QuestionsLoaded { conn, outcome } => {
                if let Err(e) = apply_start(&mut state, &conn, outcome).await {
                    state.reject(&conn, e).await;
                }
            }
            GameCommand::Finalized { results } => {
                let payload = json!({ "results": results, "game": state.view() });
                state.broadcast(state.envelope(Action::EndGame, payload)).await;
            }
            GameCommand::Snapshot(reply) => {
                let _ = reply.send(state.snapshot());
            }
            GameCommand::Shutdown => break,
        }
    }

    tracing::info!(game_id = %state.id, "session stopped");
}

async fn handle_join(state: &mut GameState, conn: &ConnHandle) -> Result<(), GameError> {
    if state.is_member(conn.user.id) {
        state.connections.insert(conn.id, conn.clone());
        let envelope = state
            .envelope(Action::JoinSuccess, state.view())
            .with_sender(&conn.user);
        conn.send(&envelope).await;
        return Ok(());
    }

    if state.participants.len() >= state.max_size {
        return Err(GameError::Capacity {
            max: state.max_size,
        });
    }
    state.ensure_status(GameStatus::Lobby, "join")?;

    state.participants.push(conn.user.clone());
    state.connections.insert(conn.id, conn.clone());
    tracing::info!(
        game_id = %state.id,
        user = %conn.user.id,
        "{} joined ({}/{})",
        conn.user.name,
        state.participants.len(),
        state.max_size
    );

    let notice = state
        .envelope(Action::JoinGame, state.view())
        .with_sender(&conn.user);
    state.broadcast(notice).await;
    let success = state
        .envelope(Action::JoinSuccess, state.view())
        .with_sender(&conn.user);
    conn.send(&success).await;
    Ok(())
}

async fn handle_departure(state: &mut GameState, conn: ConnectionId, user: UserId, departure: Departure) {
    let was_attached = state.connections.remove(&conn).is_some();
    // Membership of an ended game is frozen; only the connection detaches.
    if state.status == GameStatus::Ended {
        return;
    }
    if departure == Departure::Disconnect {
        let still_attached = state.connections.values().any(|c| c.user.id == user);
        if !was_attached || still_attached {
            return;
        }
    }

    let Some((left, _)) = remove_participant(state, user) else {
        return;
    };
    let notice = state
        .envelope(Action::UserLeft, state.view())
        .with_sender(&left);
    state.broadcast(notice).await;
    after_departure(state, user).await;
}

/// Drops a participant and every connection bound to it, and purges the
/// ratings it gave in the open round.
fn remove_participant(state: &mut GameState, user: UserId) -> Option<(User, Vec<ConnHandle>)> {
    let index = state.participants.iter().position(|p| p.id == user)?;
    let removed = state.participants.remove(index);

    let dropped: Vec<ConnHandle> = state
        .connections
        .values()
        .filter(|c| c.user.id == user)
        .cloned()
        .collect();
    state.connections.retain(|_, c| c.user.id != user);

    if let Some(round) = state.round.as_mut() {
        for uq in &mut round.user_questions {
            uq.rates.remove(&user);
        }
    }

    tracing::info!(
        game_id = %state.id,
        user = %user,
        "{} left ({} remaining)",
        removed.name,
        state.participants.len()
    );
    Some((removed, dropped))
}

async fn after_departure(state: &mut GameState, user: UserId) {
    if state.status == GameStatus::Ended {
        return;
    }
    if user == state.creator {
        finish(state, "creator left");
        return;
    }
    if state.participants.len() < 2 {
        finish(state, "not enough participants");
        return;
    }
    if state.status != GameStatus::InProgress {
        return;
    }

    // The departed participant's own question can no longer be answered.
    let departed = state
        .round
        .as_ref()
        .and_then(|r| r.user_questions.iter().position(|uq| uq.user == user));
    if let Some(index) = departed {
        close_question(state, index).await;
    }
    close_completed(state).await;
}

async fn handle_request(state: &mut GameState, conn: &ConnHandle, request: GameRequest) -> Result<(), GameError> {
    let user = &conn.user;
    if !state.is_member(user.id) {
        return Err(GameError::NotMember);
    }
    if state.status == GameStatus::Ended {
        return Err(GameError::AlreadyInState(GameStatus::Ended));
    }

    match request {
        GameRequest::SendMessage(text) => {
            let envelope = state.envelope(Action::SendMessage, text).with_sender(user);
            state.broadcast(envelope).await;
            Ok(())
        }
        GameRequest::SelectTopic(ids) => handle_select_topic(state, conn, ids),
        GameRequest::StartGame => handle_start_game(state, conn),
        GameRequest::StartRound { topic } => handle_start_round(state, user, topic).await,
        GameRequest::StartAnswer => {
            state.ensure_status(GameStatus::InProgress, "start answering")?;
            let envelope = state.envelope(Action::StartAnswer, Value::Null).with_sender(user);
            state.broadcast(envelope).await;
            Ok(())
        }
        GameRequest::EndAnswer => handle_end_answer(state, user).await,
        GameRequest::Rate(rate) => handle_rate(state, user, rate).await,
        GameRequest::StartStage => handle_start_stage(state, user).await,
        GameRequest::DeleteUser { user: target } => handle_delete_user(state, user, target).await,
        GameRequest::EndGame => {
            state.ensure_creator(user, "end the game")?;
            finish(state, "ended by creator");
            Ok(())
        }
    }
}

fn handle_select_topic(state: &mut GameState, conn: &ConnHandle, ids: Vec<Uuid>) -> Result<(), GameError> {
    state.ensure_creator(&conn.user, "select topics")?;
    state.ensure_status(GameStatus::Lobby, "select topics")?;
    if state.selecting {
        return Err(GameError::Busy("select-topic"));
    }
    if state.starting {
        return Err(GameError::Busy("start-game"));
    }
    let plan = state.plan;
    if plan.picks_topics() && ids.is_empty() {
        return Err(GameError::NoTopics);
    }

    state.selecting = true;
    let topics = state.services.topics.clone();
    let tx = state.self_tx.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let outcome = fetch_topics(topics.as_ref(), plan, ids).await;
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(GameCommand::TopicsLoaded { conn, outcome }).await;
        }
    });
    Ok(())
}

async fn fetch_topics(repo: &dyn TopicRepository, plan: PlanType, ids: Vec<Uuid>) -> Result<Vec<Topic>, GameError> {
    if !plan.picks_topics() {
        let topics = repo.get_random_topics(BASIC_TOPIC_COUNT).await?;
        if topics.is_empty() {
            return Err(GameError::NoTopics);
        }
        return Ok(topics.into_iter().map(Topic::from).collect());
    }

    let mut topics: Vec<Topic> = Vec::with_capacity(ids.len());
    for id in ids {
        if topics.iter().any(|t| t.id == id) {
            continue;
        }
        let info = repo.get_topic(id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => GameError::Payload(format!("unknown topic {id}")),
            other => other.into(),
        })?;
        topics.push(Topic {
            id,
            ..Topic::from(info)
        });
    }
    Ok(topics)
}

async fn apply_topics(
    state: &mut GameState,
    conn: &ConnHandle,
    outcome: Result<Vec<Topic>, GameError>,
) -> Result<(), GameError> {
    state.selecting = false;
    let topics = outcome?;
    state.ensure_status(GameStatus::Lobby, "select topics")?;

    state.topics = topics;
    let envelope = state
        .envelope(Action::SelectTopic, json!({ "topics": state.topics }))
        .with_sender(&conn.user);
    state.broadcast(envelope).await;
    Ok(())
}

fn handle_start_game(state: &mut GameState, conn: &ConnHandle) -> Result<(), GameError> {
    state.ensure_creator(&conn.user, "start the game")?;
    if state.status != GameStatus::Lobby {
        return Err(GameError::AlreadyInState(state.status));
    }
    if state.starting {
        return Err(GameError::Busy("start-game"));
    }
    if state.selecting {
        return Err(GameError::Busy("select-topic"));
    }
    if state.topics.is_empty() {
        return Err(GameError::NoTopics);
    }

    state.starting = true;
    let need = state.participants.len();
    let topic_ids: Vec<Uuid> = state.topics.iter().map(|t| t.id).collect();
    let services = state.services.clone();
    let tx = state.self_tx.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let outcome = prepare_start(&services, topic_ids, need).await;
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(GameCommand::QuestionsLoaded { conn, outcome }).await;
        }
    });
    Ok(())
}

async fn prepare_start(services: &Services, topic_ids: Vec<Uuid>, need: usize) -> Result<StartPlan, GameError> {
    let mut questions = Vec::with_capacity(topic_ids.len());
    for topic in topic_ids {
        let fetched = services.topics.get_random_questions(topic, need).await?;
        if fetched.len() != need {
            return Err(GameError::InsufficientQuestions {
                topic,
                got: fetched.len(),
                need,
            });
        }
        questions.push((topic, fetched));
    }

    let meeting = match &services.meetings {
        Some(meetings) => create_meeting(meetings.as_ref()).await,
        None => None,
    };
    Ok(StartPlan { questions, meeting })
}

async fn create_meeting(meetings: &dyn MeetingRepository) -> Option<MeetingInfo> {
    let created = async {
        let (number, passcode) = meetings.create_meeting().await?;
        let token = meetings.generate_meeting_token(&number, 0)?;
        Ok::<_, RepositoryError>(MeetingInfo {
            number,
            passcode,
            token,
        })
    }
    .await;
    match created {
        Ok(meeting) => Some(meeting),
        Err(e) => {
            tracing::error!("meeting creation failed: {}", e);
            None
        }
    }
}

async fn apply_start(
    state: &mut GameState,
    conn: &ConnHandle,
    outcome: Result<StartPlan, GameError>,
) -> Result<(), GameError> {
    state.starting = false;
    let StartPlan { questions, meeting } = outcome?;
    if state.status != GameStatus::Lobby {
        return Err(GameError::AlreadyInState(state.status));
    }
    // Membership may have changed while the questions were in flight.
    let need = state.participants.len();
    if let Some((topic, fetched)) = questions.iter().find(|(_, q)| q.len() != need) {
        return Err(GameError::InsufficientQuestions {
            topic: *topic,
            got: fetched.len(),
            need,
        });
    }

    for (id, fetched) in questions {
        if let Some(topic) = state.topics.iter_mut().find(|t| t.id == id) {
            topic.questions = fetched;
        }
    }
    state.status = GameStatus::InProgress;
    tracing::info!(game_id = %state.id, "game started with {} participants", need);

    let games = state.services.games.clone();
    let id = state.id;
    tokio::spawn(async move {
        if let Err(e) = games.start_game(id).await {
            tracing::error!(game_id = %id, "failed to persist game start: {}", e);
        }
    });

    let envelope = state
        .envelope(Action::StartGame, json!({ "game": state.view(), "meeting": meeting }))
        .with_sender(&conn.user);
    state.broadcast(envelope).await;
    Ok(())
}

async fn handle_start_round(state: &mut GameState, user: &User, topic_id: Uuid) -> Result<(), GameError> {
    state.ensure_creator(user, "start a round")?;
    state.ensure_status(GameStatus::InProgress, "start a round")?;

    if state.topics.iter().all(|t| t.used) {
        finish(state, "all topics used");
        return Ok(());
    }

    let participants = &state.participants;
    let topic = state
        .topics
        .iter_mut()
        .find(|t| t.id == topic_id)
        .ok_or_else(|| GameError::InvalidRound(format!("topic {topic_id} is not selected")))?;
    if topic.used {
        return Err(GameError::InvalidRound(format!("topic {topic_id} was already played")));
    }
    if topic.questions.len() != participants.len() {
        return Err(GameError::InvalidRound(format!(
            "topic has {} questions for {} participants",
            topic.questions.len(),
            participants.len()
        )));
    }

    let user_questions = participants
        .iter()
        .zip(&topic.questions)
        .enumerate()
        .map(|(i, (participant, question))| UserQuestion {
            number: i + 1,
            user: participant.id,
            question: question.clone(),
            rates: HashMap::new(),
        })
        .collect();
    topic.used = true;
    state.round = Some(Round {
        topic: topic_id,
        user_questions,
    });

    let envelope = state
        .envelope(Action::StartRound, json!({ "round": state.round }))
        .with_sender(user);
    state.broadcast(envelope).await;
    Ok(())
}

async fn handle_start_stage(state: &mut GameState, user: &User) -> Result<(), GameError> {
    state.ensure_creator(user, "start a stage")?;
    state.ensure_status(GameStatus::InProgress, "start a stage")?;
    close_completed(state).await;

    let unused_topics = state.topics.iter().any(|t| !t.used);
    let next = state
        .round
        .as_ref()
        .and_then(|r| r.user_questions.first().cloned());

    match next {
        None if !unused_topics => finish(state, "all rounds played"),
        None => {
            let topic = state.round.as_ref().map(|r| r.topic);
            let envelope = state.envelope(Action::RoundEnd, json!({ "topic": topic }));
            state.broadcast(envelope).await;
        }
        Some(stage) => {
            let envelope = state
                .envelope(Action::StartStage, json!(stage))
                .with_sender(user);
            state.broadcast(envelope).await;
        }
    }
    Ok(())
}

async fn handle_end_answer(state: &mut GameState, user: &User) -> Result<(), GameError> {
    state.ensure_status(GameStatus::InProgress, "end answering")?;

    let others: Vec<UserId> = state
        .participants
        .iter()
        .map(|p| p.id)
        .filter(|id| *id != user.id)
        .collect();
    let own_question = state
        .round
        .as_mut()
        .and_then(|r| r.user_questions.iter_mut().find(|uq| uq.user == user.id));
    if let Some(uq) = own_question {
        for rater in others {
            uq.rates.entry(rater).or_insert_with(Rating::placeholder);
        }
        state.results.entry(user.id).or_default();
    }

    let envelope = state.envelope(Action::EndAnswer, Value::Null).with_sender(user);
    state.broadcast(envelope).await;
    Ok(())
}

async fn handle_rate(state: &mut GameState, user: &User, rate: RatePayload) -> Result<(), GameError> {
    state.ensure_status(GameStatus::InProgress, "rate")?;
    if rate.user_id == user.id {
        return Err(GameError::SelfRating);
    }

    let round = state
        .round
        .as_mut()
        .ok_or_else(|| GameError::InvalidRound("no round in progress".into()))?;
    let index = round
        .user_questions
        .iter()
        .position(|uq| uq.user == rate.user_id)
        .ok_or_else(|| GameError::InvalidRound(format!("no open question for participant {}", rate.user_id)))?;
    let uq = &mut round.user_questions[index];
    if uq.rates.get(&user.id).is_some_and(|r| !r.placeholder) {
        return Err(GameError::AlreadyRated(rate.user_id));
    }

    uq.rates.insert(
        user.id,
        Rating {
            value: rate.value,
            tags: rate.tags.clone(),
            placeholder: false,
        },
    );
    let complete = rated_by_all(uq, &state.participants);

    let score = state.results.entry(rate.user_id).or_default();
    score.value = score.value.saturating_add(rate.value);
    score.tags.extend(rate.tags.iter().copied());

    let envelope = state
        .envelope(Action::RateUser, json!(rate))
        .with_sender(user);
    state.broadcast(envelope).await;

    if complete {
        close_question(state, index).await;
    }
    Ok(())
}

async fn handle_delete_user(state: &mut GameState, user: &User, target: UserId) -> Result<(), GameError> {
    state.ensure_creator(user, "remove participants")?;
    if target == state.creator {
        return Err(GameError::Payload("the creator cannot be removed".into()));
    }

    let (removed, dropped) = remove_participant(state, target)
        .ok_or_else(|| GameError::Payload(format!("{target} is not a participant")))?;
    for conn in &dropped {
        conn.close().await;
    }

    let envelope = state
        .envelope(
            Action::DeleteUser,
            json!({ "user_id": removed.id, "game": state.view() }),
        )
        .with_sender(user);
    state.broadcast(envelope).await;
    after_departure(state, target).await;
    Ok(())
}

/// Every current participant other than the respondent has a rating on the
/// question. Zero ratings seeded by end-answer count, so a silent rater cannot
/// hold the question open.
fn rated_by_all(uq: &UserQuestion, participants: &[User]) -> bool {
    participants
        .iter()
        .filter(|p| p.id != uq.user)
        .all(|p| uq.rates.contains_key(&p.id))
}

/// Retires a question from the pending list and announces it.
async fn close_question(state: &mut GameState, index: usize) {
    let Some(round) = state.round.as_mut() else {
        return;
    };
    let topic = round.topic;
    let uq = round.user_questions.remove(index);

    let envelope = state.envelope(
        Action::RateEnd,
        json!({
            "user_id": uq.user,
            "number": uq.number,
            "topic": topic,
            "raters": uq.rater_count(),
        }),
    );
    state.broadcast(envelope).await;
}

async fn close_completed(state: &mut GameState) {
    loop {
        let next = state.round.as_ref().and_then(|r| {
            r.user_questions
                .iter()
                .position(|uq| rated_by_all(uq, &state.participants))
        });
        match next {
            Some(index) => close_question(state, index).await,
            None => break,
        }
    }
}

/// Ends the game. Persisting the end, saving results and fetching the
/// canonical results happen off the loop; their outcome comes back as
/// [`GameCommand::Finalized`].
fn finish(state: &mut GameState, reason: &str) {
    if state.status == GameStatus::Ended {
        return;
    }
    state.status = GameStatus::Ended;
    state.selecting = false;
    state.starting = false;
    tracing::info!(game_id = %state.id, "game ended: {}", reason);

    let games = state.services.games.clone();
    let id = state.id;
    let results = state.results.clone();
    let fallback = state.local_results();
    let tx = state.self_tx.clone();
    let hub = state.hub.clone();
    let ttl = state.config.ended_ttl;
    tokio::spawn(async move {
        if let Err(e) = games.end_game(id).await {
            tracing::error!(game_id = %id, "failed to persist game end: {}", e);
        }
        if let Err(e) = games.save_results(id, &results).await {
            tracing::error!(game_id = %id, "failed to save results: {}", e);
        }
        let results = match games.get_results(id).await {
            Ok(canonical) if !canonical.is_empty() => canonical,
            Ok(_) => fallback,
            Err(e) => {
                tracing::error!(game_id = %id, "failed to fetch results: {}", e);
                fallback
            }
        };
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(GameCommand::Finalized { results }).await;
        }

        tokio::time::sleep(ttl).await;
        hub.evict(id).await;
    });
}
