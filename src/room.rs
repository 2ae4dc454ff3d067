use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock, RwLockReadGuard};
use uuid::Uuid;

use crate::config;
use crate::game::{Game, Player};
use crate::response::{self, PlayerGuessResponse};
use crate::storage::GameStorage;
use crate::word::{Word, WordSource, WORD_LENGTH};

/// Wire-level event names, `<namespace>/<verb>`. Clients may only send
/// `server/*`; everything the server emits is `client/*`. Unrecognized names
/// survive parsing so the room can answer them with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ServerStart,
    ServerPlay,
    ServerMessage,
    ClientStart,
    ClientPlay,
    ClientMessage,
    ClientJoin,
    ClientLeave,
    ClientFinish,
    ClientData,
    ClientError,
    Unknown(String),
}

impl Event {
    fn as_str(&self) -> &str {
        match self {
            Event::ServerStart => "server/start",
            Event::ServerPlay => "server/play",
            Event::ServerMessage => "server/message",
            Event::ClientStart => "client/start",
            Event::ClientPlay => "client/play",
            Event::ClientMessage => "client/message",
            Event::ClientJoin => "client/join",
            Event::ClientLeave => "client/leave",
            Event::ClientFinish => "client/finish",
            Event::ClientData => "client/data",
            Event::ClientError => "client/error",
            Event::Unknown(name) => name,
        }
    }

    fn from_name(name: &str) -> Event {
        match name {
            "server/start" => Event::ServerStart,
            "server/play" => Event::ServerPlay,
            "server/message" => Event::ServerMessage,
            "client/start" => Event::ClientStart,
            "client/play" => Event::ClientPlay,
            "client/message" => Event::ClientMessage,
            "client/join" => Event::ClientJoin,
            "client/leave" => Event::ClientLeave,
            "client/finish" => Event::ClientFinish,
            "client/data" => Event::ClientData,
            "client/error" => Event::ClientError,
            other => Event::Unknown(other.to_string()),
        }
    }

    /// True for anything in the `server/` namespace, known or not.
    fn is_server(&self) -> bool {
        self.as_str().starts_with("server/")
    }
}

impl Serialize for Event {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Event::from_name(&name))
    }
}

/// One wire message. `from` is always overwritten by the server with the
/// sender's username; `key` is an opaque client tag echoed back for
/// deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub event: Event,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Payload {
    fn new(event: Event, data: Value) -> Self {
        Payload {
            event,
            data,
            from: String::new(),
            key: None,
        }
    }

    fn text(event: Event, text: impl Into<String>) -> Self {
        Payload::new(event, Value::String(text.into()))
    }

    fn with_from(mut self, from: &str) -> Self {
        self.from = from.to_string();
        self
    }

    fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }
}

/// Messages consumed by the room task. Client payloads arrive tagged with the
/// connection that produced them; the rest are produced by the server itself.
enum RoomMsg {
    Client {
        payload: Payload,
        sender: Arc<PlayerConn>,
    },
    Join(Arc<PlayerConn>),
    Leave(Vec<Arc<PlayerConn>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("the room is closed")]
    Closed,
    #[error("the game has already started")]
    AlreadyStarted,
}

/// One player's socket. Writes are serialized by the sink mutex; the read and
/// ping tasks never touch room state, they only enqueue room messages.
pub struct PlayerConn {
    player: Player,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    active: AtomicBool,
    last_pong: std::sync::Mutex<Instant>,
}

impl PlayerConn {
    fn new(player: Player, sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(PlayerConn {
            player,
            sink: Mutex::new(sink),
            active: AtomicBool::new(true),
            last_pong: std::sync::Mutex::new(Instant::now()),
        })
    }

    pub fn name(&self) -> &str {
        &self.player.username
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Serialized write of one payload.
    async fn write(&self, payload: &Payload) -> Result<(), axum::Error> {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("failed to encode payload: {}", err);
                return Ok(());
            }
        };
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await
    }

    async fn ping(&self) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new().into())).await
    }

    fn touch_pong(&self) {
        *self.last_pong.lock().expect("pong lock poisoned") = Instant::now();
    }

    fn pong_overdue(&self) -> bool {
        self.last_pong.lock().expect("pong lock poisoned").elapsed() > config::pong_wait()
    }

    /// Marks the connection dead and closes the socket. Safe to call twice.
    async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

/// The live coordinator of one game.
///
/// A room is an actor: a single consumer task owns the connection map and is
/// the only mutator of the game, so the engine needs no locking discipline
/// beyond the event channel. Producers (connection read and ping tasks) race
/// their sends against the room's cancel scope and drop them when the room
/// closes first.
pub struct Room {
    id: Uuid,
    game: RwLock<Game>,
    tx: mpsc::Sender<RoomMsg>,
    cancel: watch::Sender<bool>,
    active: AtomicBool,
    closed: AtomicBool,
    storage: Arc<dyn GameStorage>,
    words: Arc<dyn WordSource>,
}

impl Room {
    /// Builds a room and returns it with its driver future. The caller
    /// decides when to spawn the driver, so racing restores can discard a
    /// loser before its task ever runs.
    pub fn new(
        game: Game,
        storage: Arc<dyn GameStorage>,
        words: Arc<dyn WordSource>,
    ) -> (Arc<Room>, impl std::future::Future<Output = ()> + Send) {
        let (tx, rx) = mpsc::channel(256);
        let (cancel, cancel_rx) = watch::channel(false);
        let active = game.is_active() && !game.has_ended();
        let closed = game.has_ended();

        let room = Arc::new(Room {
            id: game.id,
            game: RwLock::new(game),
            tx,
            cancel,
            active: AtomicBool::new(active),
            closed: AtomicBool::new(closed),
            storage,
            words,
        });
        let driver = room.clone().run(rx, cancel_rx);
        (room, driver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read-only view of the game. Callers must treat it as a snapshot.
    pub async fn snapshot(&self) -> RwLockReadGuard<'_, Game> {
        self.game.read().await
    }

    #[cfg(test)]
    pub(crate) async fn game_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, Game> {
        self.game.write().await
    }

    /// Whether `username` may attach a connection right now.
    pub async fn can_join(&self, username: &str) -> Result<(), JoinError> {
        if self.is_closed() {
            return Err(JoinError::Closed);
        }
        let game = self.game.read().await;
        if self.is_active() && !game.sessions.contains_key(username) {
            return Err(JoinError::AlreadyStarted);
        }
        Ok(())
    }

    /// Attaches an upgraded socket: splits it, spawns its read and ping
    /// tasks and enqueues the join for the consumer.
    pub async fn join(self: &Arc<Self>, player: Player, socket: WebSocket) {
        let (sink, stream) = socket.split();
        let conn = PlayerConn::new(player, sink);
        tokio::spawn(read_loop(self.clone(), conn.clone(), stream));
        tokio::spawn(ping_loop(self.clone(), conn.clone()));
        self.try_broadcast(RoomMsg::Join(conn)).await;
    }

    /// Signals the room to shut down. Idempotent; the consumer task performs
    /// the actual teardown and persistence.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        let _ = self.cancel.send(true);
    }

    /// Enqueues a message unless the room's cancel scope fires first. The
    /// only safe way to produce into the channel, because the room may close
    /// concurrently.
    async fn try_broadcast(&self, msg: RoomMsg) {
        let mut cancel_rx = self.cancel.subscribe();
        tokio::select! {
            _ = cancel_rx.wait_for(|stop| *stop) => {}
            _ = self.tx.send(msg) => {}
        }
    }

    /// The consumer task. All game and connection-map mutation happens here.
    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RoomMsg>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        tracing::debug!("room {} task started", self.id);
        let mut players: HashMap<String, Arc<PlayerConn>> = HashMap::new();

        loop {
            let msg = tokio::select! {
                _ = cancel_rx.wait_for(|stop| *stop) => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                RoomMsg::Client { payload, sender } => {
                    let event = payload.event.clone();
                    match event {
                        Event::ServerStart => {
                            self.handle_start(&mut players, payload, sender).await
                        }
                        Event::ServerPlay => self.handle_play(&mut players, payload, sender).await,
                        Event::ServerMessage => {
                            self.handle_message(&mut players, payload, sender).await
                        }
                        _ => {
                            let reply = Payload::text(Event::ClientError, "Unknown message type")
                                .with_key(payload.key);
                            let _ = sender.write(&reply).await;
                        }
                    }
                }
                RoomMsg::Join(conn) => self.handle_join(&mut players, conn).await,
                RoomMsg::Leave(conns) => self.handle_leave(&mut players, conns, false).await,
            }

            if self.is_closed() {
                break;
            }
        }

        self.shutdown(&mut players).await;
        tracing::debug!("room {} task ended", self.id);
    }

    /// `server/start`: creator only, lobby only. Persists the started game
    /// before anyone is told; a storage failure returns the room to lobby.
    async fn handle_start(
        &self,
        players: &mut HashMap<String, Arc<PlayerConn>>,
        m: Payload,
        sender: Arc<PlayerConn>,
    ) {
        let mut game = self.game.write().await;
        if game.creator != m.from {
            let reply = Payload::text(
                Event::ClientError,
                "Only the game's creator can start the game",
            )
            .with_key(m.key);
            let _ = sender.write(&reply).await;
            return;
        }
        if self.is_active() {
            let reply = Payload::text(Event::ClientError, "Game already started").with_key(m.key);
            let _ = sender.write(&reply).await;
            return;
        }

        game.start();
        if let Err(err) = self.storage.start_game(&game).await {
            tracing::error!("failed to persist start of game {}: {}", self.id, err);
            game.abort_start();
            let reply = Payload::text(Event::ClientError, "Failed to start game").with_key(m.key);
            let _ = sender.write(&reply).await;
            return;
        }
        self.active.store(true, Ordering::SeqCst);

        self.send_all(players, Payload::text(Event::ClientStart, "Game started!"))
            .await;
        // every player gets their own view of the fresh game
        let mut failed = Vec::new();
        for (username, conn) in players.iter() {
            let data = data_payload(&game, username);
            if conn.write(&data).await.is_err() {
                failed.push(conn.clone());
            }
        }
        drop(game);
        if !failed.is_empty() {
            self.handle_leave(players, failed, false).await;
        }
    }

    /// `server/message`: fan a chat line out to the whole room.
    async fn handle_message(
        &self,
        players: &mut HashMap<String, Arc<PlayerConn>>,
        m: Payload,
        sender: Arc<PlayerConn>,
    ) {
        let Some(text) = m.data.as_str() else {
            let reply = Payload::text(Event::ClientError, "Invalid message type").with_key(m.key);
            let _ = sender.write(&reply).await;
            return;
        };
        self.send_all(
            players,
            Payload::text(Event::ClientMessage, text).with_from(&m.from),
        )
        .await;
    }

    /// `server/play`: validate, score, re-rank, broadcast. Failures are
    /// reported to the sender only and never change room state.
    async fn handle_play(
        &self,
        players: &mut HashMap<String, Arc<PlayerConn>>,
        m: Payload,
        sender: Arc<PlayerConn>,
    ) {
        let mut game = self.game.write().await;

        let text = match play_precheck(self.is_active(), &game, sender.name(), &m.data) {
            Ok(text) => text.to_string(),
            Err(reason) => {
                let reply = Payload::text(Event::ClientError, reason).with_key(m.key);
                let _ = sender.write(&reply).await;
                return;
            }
        };
        if !self.words.validate(&text) {
            let reply = Payload::text(Event::ClientError, "Invalid english word").with_key(m.key);
            let _ = sender.write(&reply).await;
            return;
        }

        let outcome = match game.play(sender.name(), Word::new(&text)) {
            Ok(outcome) => outcome,
            Err(err) => {
                let reply = Payload::text(Event::ClientError, err.to_string()).with_key(m.key);
                let _ = sender.write(&reply).await;
                return;
            }
        };
        tracing::debug!(
            "play by {} in room {}: improved={} displaced={}",
            sender.name(),
            self.id,
            outcome.improved,
            outcome.displacement
        );

        let result = PlayerGuessResponse {
            result: response::to_guess(&outcome.guess, false),
            rank_offset: Some(outcome.displacement),
            leaderboard: response::to_leaderboard(&game),
        };
        let payload = Payload::new(
            Event::ClientPlay,
            serde_json::to_value(&result).unwrap_or_default(),
        )
        .with_from(&m.from)
        .with_key(m.key);
        self.send_all(players, payload).await;

        if game.has_ended() {
            self.send_all(players, Payload::text(Event::ClientFinish, "Game has ended"))
                .await;
            drop(game);
            self.close();
        }
    }

    /// A fresh connection for `username`. A previous connection under the
    /// same name is kicked out first, on this same task, so exactly one
    /// connection per player survives.
    async fn handle_join(
        &self,
        players: &mut HashMap<String, Arc<PlayerConn>>,
        conn: Arc<PlayerConn>,
    ) {
        if let Some(old) = players.get(conn.name()).cloned() {
            self.handle_leave(players, vec![old], true).await;
        }

        let mut game = self.game.write().await;
        if !game.sessions.contains_key(conn.name()) && !game.is_active() {
            game.join(conn.player.clone());
        }
        let data = data_payload(&game, conn.name());
        drop(game);

        // a player who cannot receive their state cannot play; drop them
        if let Err(err) = conn.write(&data).await {
            tracing::error!("failed to send player data to {}: {}", conn.name(), err);
            conn.close().await;
            return;
        }

        players.insert(conn.name().to_string(), conn.clone());
        self.send_all(
            players,
            Payload::text(Event::ClientJoin, format!("{} has joined", conn.name()))
                .with_from(conn.name()),
        )
        .await;
    }

    /// Reaps connections: closes each still-active one, removes it from the
    /// map and tells the room who left. Connections already marked inactive
    /// are skipped so duplicate failure reports produce one notification.
    async fn handle_leave(
        &self,
        players: &mut HashMap<String, Arc<PlayerConn>>,
        conns: Vec<Arc<PlayerConn>>,
        kicked: bool,
    ) {
        let mut gone = Vec::new();
        for conn in conns {
            if !conn.active.swap(false, Ordering::SeqCst) {
                continue;
            }
            conn.close().await;
            players.remove(conn.name());
            gone.push(conn.name().to_string());
        }

        for username in gone {
            let text = if kicked {
                format!("{username} has been kicked out")
            } else {
                format!("{username} has left")
            };
            let failed = self
                .broadcast(players, &Payload::text(Event::ClientLeave, text))
                .await;
            if !failed.is_empty() {
                self.try_broadcast(RoomMsg::Leave(failed)).await;
            }
        }
    }

    /// Writes a payload to every connection, returning the ones whose write
    /// failed.
    async fn broadcast(
        &self,
        players: &HashMap<String, Arc<PlayerConn>>,
        payload: &Payload,
    ) -> Vec<Arc<PlayerConn>> {
        let mut failed = Vec::new();
        for conn in players.values() {
            if conn.write(payload).await.is_err() {
                failed.push(conn.clone());
            }
        }
        failed
    }

    /// Broadcast plus immediate reaping of failed connections.
    async fn send_all(&self, players: &mut HashMap<String, Arc<PlayerConn>>, payload: Payload) {
        let failed = self.broadcast(players, &payload).await;
        if !failed.is_empty() {
            self.handle_leave(players, failed, false).await;
        }
    }

    /// Final teardown on the consumer task: close every connection, then
    /// settle the game with storage. A started-and-ended game is persisted;
    /// a started-but-abandoned one is wiped; a game that never started left
    /// no durable trace.
    async fn shutdown(&self, players: &mut HashMap<String, Arc<PlayerConn>>) {
        self.closed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        let _ = self.cancel.send(true);

        for (_, conn) in players.drain() {
            conn.close().await;
        }

        let game = self.game.read().await;
        if game.is_active() {
            if game.has_ended() {
                if let Err(err) = self.storage.finish_game(&game).await {
                    tracing::error!("failed to persist finished game {}: {}", self.id, err);
                }
            } else if let Err(err) = self.storage.wipe_game(game.id).await {
                tracing::error!("failed to wipe abandoned game {}: {}", self.id, err);
            }
        }
    }
}

/// Renders the per-recipient `client/data` payload.
fn data_payload(game: &Game, username: &str) -> Payload {
    let data = response::initial_data(game, username);
    Payload::new(
        Event::ClientData,
        serde_json::to_value(&data).unwrap_or_default(),
    )
}

/// Validates a `server/play` request, returning the guess text or the
/// message reported back to the sender. Dictionary lookup happens after.
fn play_precheck<'a>(
    active: bool,
    game: &Game,
    username: &str,
    data: &'a Value,
) -> Result<&'a str, &'static str> {
    if !active {
        return Err("Room isn't active");
    }
    let Some(session) = game.sessions.get(username) else {
        return Err("Invalid user session");
    };
    if session.won() {
        return Err("You already won");
    }
    if !session.can_play() {
        return Err("You already used all your attempts");
    }
    let Some(text) = data.as_str() else {
        return Err("Invalid message");
    };
    if text.chars().count() != WORD_LENGTH {
        return Err("Invalid message string length");
    }
    if !text.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err("Invalid message characters");
    }
    Ok(text)
}

/// Forwards decoded payloads from the socket into the room. Exits on any
/// read or decode failure, reporting the connection for reaping.
async fn read_loop(room: Arc<Room>, conn: Arc<PlayerConn>, mut stream: SplitStream<WebSocket>) {
    tracing::info!("player {} connected to room {}", conn.name(), room.id());
    loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            _ => break,
        };
        match msg {
            Message::Text(text) => {
                let payload: Payload = match serde_json::from_str(&text) {
                    Ok(payload) => payload,
                    Err(_) => break,
                };
                if !payload.event.is_server() {
                    let reply = Payload::text(Event::ClientError, "unsupported action")
                        .with_key(payload.key);
                    let _ = conn.write(&reply).await;
                    continue;
                }
                // the client's idea of `from` is never trusted
                let payload = Payload {
                    from: conn.name().to_string(),
                    ..payload
                };
                room.try_broadcast(RoomMsg::Client {
                    payload,
                    sender: conn.clone(),
                })
                .await;
            }
            Message::Pong(_) => conn.touch_pong(),
            Message::Close(_) => break,
            _ => {}
        }
    }
    tracing::info!("player {} disconnected from room {}", conn.name(), room.id());
    room.try_broadcast(RoomMsg::Leave(vec![conn.clone()])).await;
}

/// Pings the socket on a fixed cadence and reports the connection for
/// reaping when the peer stops answering or the write fails.
async fn ping_loop(room: Arc<Room>, conn: Arc<PlayerConn>) {
    let mut ticker = tokio::time::interval(config::ping_interval());
    ticker.tick().await; // first tick fires immediately
    loop {
        ticker.tick().await;
        if !conn.is_active() {
            return;
        }
        if conn.pong_overdue() || conn.ping().await.is_err() {
            room.try_broadcast(RoomMsg::Leave(vec![conn.clone()])).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::word::LocalWords;
    use serde_json::json;
    use std::time::Duration;

    fn deps() -> (Arc<MemoryStorage>, Arc<LocalWords>) {
        (Arc::new(MemoryStorage::new()), Arc::new(LocalWords::new()))
    }

    fn lobby_game(creator: &str, players: &[&str]) -> Game {
        let mut g = Game::new(creator, Word::new("GAMES"));
        for p in players {
            g.join(Player::new(p));
        }
        g
    }

    #[test]
    fn payload_round_trip_keeps_key() {
        let payload = Payload::text(Event::ClientError, "nope").with_key(Some("k1".into()));
        let json = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event, Event::ClientError);
        assert_eq!(back.key.as_deref(), Some("k1"));
        assert_eq!(back.data, json!("nope"));
    }

    #[test]
    fn payload_event_names_on_the_wire() {
        let payload = Payload::text(Event::ClientPlay, "x");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event"], "client/play");

        let parsed: Payload = serde_json::from_str(
            r#"{"event":"server/play","data":"GAMES","from":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(parsed.event, Event::ServerPlay);
    }

    #[test]
    fn unknown_event_strings_keep_their_namespace() {
        // a malformed server verb still reaches the room for its error reply
        let parsed: Payload =
            serde_json::from_str(r#"{"event":"server/bogus","data":null}"#).unwrap();
        assert_eq!(parsed.event, Event::Unknown("server/bogus".to_string()));
        assert!(parsed.event.is_server());

        // anything outside `server/` is refused at the socket
        for name in ["private/join", "client/play", "garbage"] {
            let raw = format!(r#"{{"event":"{name}","data":null}}"#);
            let parsed: Payload = serde_json::from_str(&raw).unwrap();
            assert!(!parsed.event.is_server(), "{name} must not pass as server");
        }
    }

    #[test]
    fn precheck_walks_the_failure_ladder() {
        let mut game = lobby_game("alice", &["alice"]);
        let guess = json!("GAMES");

        assert_eq!(
            play_precheck(false, &game, "alice", &guess),
            Err("Room isn't active")
        );

        game.start();
        assert_eq!(
            play_precheck(true, &game, "ghost", &guess),
            Err("Invalid user session")
        );
        assert_eq!(
            play_precheck(true, &game, "alice", &json!(42)),
            Err("Invalid message")
        );
        assert_eq!(
            play_precheck(true, &game, "alice", &json!("GAME")),
            Err("Invalid message string length")
        );
        assert_eq!(
            play_precheck(true, &game, "alice", &json!("G4MES")),
            Err("Invalid message characters")
        );
        assert_eq!(play_precheck(true, &game, "alice", &guess), Ok("GAMES"));
    }

    #[test]
    fn precheck_blocks_finished_sessions() {
        let mut game = lobby_game("alice", &["alice"]);
        game.start();
        game.play("alice", Word::new("GAMES")).unwrap();
        assert_eq!(
            play_precheck(true, &game, "alice", &json!("GAMES")),
            Err("You already won")
        );

        let mut game = lobby_game("bob", &["bob"]);
        game.start();
        for _ in 0..crate::word::MAX_GUESSES {
            game.play("bob", Word::new("SEIZE")).unwrap();
        }
        assert_eq!(
            play_precheck(true, &game, "bob", &json!("GAMES")),
            Err("You already used all your attempts")
        );
    }

    #[tokio::test]
    async fn can_join_gates_closed_and_running_rooms() {
        let (storage, words) = deps();
        let (room, driver) = Room::new(lobby_game("alice", &["alice"]), storage, words);
        tokio::spawn(driver);

        assert_eq!(room.can_join("alice").await, Ok(()));
        assert_eq!(room.can_join("newcomer").await, Ok(()));

        {
            let mut game = room.game.write().await;
            game.start();
        }
        room.active.store(true, Ordering::SeqCst);
        assert_eq!(room.can_join("alice").await, Ok(()));
        assert_eq!(room.can_join("newcomer").await, Err(JoinError::AlreadyStarted));

        room.close();
        assert_eq!(room.can_join("alice").await, Err(JoinError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_wipes_abandoned_games() {
        let (storage, words) = deps();
        let mut game = lobby_game("alice", &["alice"]);
        game.start();
        let id = game.id;

        let (room, driver) = Room::new(game, storage.clone(), words);
        let handle = tokio::spawn(driver);
        {
            let game = room.snapshot().await;
            storage.start_game(&game).await.unwrap();
        }

        room.close();
        room.close();
        handle.await.unwrap();

        // started but never finished: the row is gone, not finalized
        assert!(storage.fetch_game("alice", id).await.is_err());
    }

    #[tokio::test]
    async fn close_persists_finished_games() {
        let (storage, words) = deps();
        let mut game = lobby_game("alice", &["alice"]);
        game.start();
        let id = game.id;

        let (room, driver) = Room::new(game, storage.clone(), words);
        let handle = tokio::spawn(driver);
        {
            let game = room.snapshot().await;
            storage.start_game(&game).await.unwrap();
        }
        {
            let mut game = room.game.write().await;
            game.play("alice", Word::new("GAMES")).unwrap();
            assert!(game.has_ended());
        }

        room.close();
        handle.await.unwrap();

        let fetched = storage.fetch_game("alice", id).await.unwrap();
        assert!(fetched.has_ended());
        assert_eq!(fetched.sessions["alice"].guesses.len(), 1);
    }

    #[tokio::test]
    async fn restored_rooms_inherit_lifecycle_flags() {
        let (storage, words) = deps();

        let mut running = lobby_game("alice", &["alice"]);
        running.start();
        let (room, _driver) = Room::new(running, storage.clone(), words.clone());
        assert!(room.is_active());
        assert!(!room.is_closed());

        let mut done = lobby_game("alice", &["alice"]);
        done.start();
        done.play("alice", Word::new("GAMES")).unwrap();
        let (room, _driver) = Room::new(done, storage, words);
        assert!(!room.is_active());
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn try_broadcast_drops_sends_after_close() {
        let (storage, words) = deps();
        let (room, driver) = Room::new(lobby_game("alice", &[]), storage, words);
        let handle = tokio::spawn(driver);
        room.close();
        handle.await.unwrap();

        // must return promptly instead of blocking on a dead consumer
        tokio::time::timeout(
            Duration::from_secs(1),
            room.try_broadcast(RoomMsg::Leave(Vec::new())),
        )
        .await
        .expect("send against a closed room should be dropped");
    }
}
