use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::game::{Game, Player, RankBoard, Session};
use crate::word::Word;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("game not found")]
    NotFound,
    #[error("game has not finished")]
    NotFinished,
}

/// Durable lifecycle of a game.
///
/// `start_game` and `finish_game` write the game and all its participants in
/// one atomic step. `fetch_game` projects the stored game for one requester:
/// that player gets their full guess history, everyone else is reduced to a
/// re-scored best guess, their rank and their words-played count. Callers run
/// [`Game::resync`] on the result.
#[async_trait]
pub trait GameStorage: Send + Sync {
    async fn start_game(&self, game: &Game) -> Result<(), StorageError>;
    async fn finish_game(&self, game: &Game) -> Result<(), StorageError>;
    async fn wipe_game(&self, id: Uuid) -> Result<(), StorageError>;
    async fn fetch_game(&self, username: &str, id: Uuid) -> Result<Game, StorageError>;
    /// Game listing for a player, newest first. No sessions are attached.
    async fn list_games(
        &self,
        username: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Game>, StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGuess {
    word: String,
    played_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    username: String,
    guesses: Vec<StoredGuess>,
    best_word: Option<String>,
    best_played_at: Option<DateTime<Utc>>,
    rank: usize,
    words_played: usize,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGame {
    id: Uuid,
    creator: String,
    secret: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    players: HashMap<String, StoredSession>,
}

/// In-process storage backend. Holds the same projection a relational
/// backend would: game metadata plus one row per participant.
#[derive(Default)]
pub struct MemoryStorage {
    games: RwLock<HashMap<Uuid, StoredGame>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GameStorage for MemoryStorage {
    async fn start_game(&self, game: &Game) -> Result<(), StorageError> {
        let players = game
            .sessions
            .values()
            .map(|s| {
                (
                    s.player.username.clone(),
                    StoredSession {
                        username: s.player.username.clone(),
                        guesses: Vec::new(),
                        best_word: None,
                        best_played_at: None,
                        rank: 0,
                        words_played: 0,
                        finished_at: None,
                    },
                )
            })
            .collect();

        let row = StoredGame {
            id: game.id,
            creator: game.creator.clone(),
            secret: game.secret.text.clone(),
            created_at: game.created_at,
            started_at: game.started_at,
            ended_at: game.ended_at,
            players,
        };
        self.games.write().await.insert(game.id, row);
        Ok(())
    }

    async fn finish_game(&self, game: &Game) -> Result<(), StorageError> {
        if !game.has_ended() {
            return Err(StorageError::NotFinished);
        }
        let mut games = self.games.write().await;
        let row = games.get_mut(&game.id).ok_or(StorageError::NotFound)?;

        row.ended_at = game.ended_at;
        for session in game.sessions.values() {
            let best = session.best_guess();
            let username = session.player.username.clone();
            let rank = game
                .leaderboard
                .positions
                .get(&username)
                .copied()
                .unwrap_or_default();
            row.players.insert(
                username.clone(),
                StoredSession {
                    username,
                    guesses: session
                        .guesses
                        .iter()
                        .map(|w| StoredGuess {
                            word: w.text.clone(),
                            played_at: w.played_at,
                        })
                        .collect(),
                    best_word: (!best.text.is_empty()).then(|| best.text.clone()),
                    best_played_at: best.played_at,
                    rank,
                    words_played: session.words_count(),
                    finished_at: session.won().then_some(best.played_at).flatten(),
                },
            );
        }
        Ok(())
    }

    async fn wipe_game(&self, id: Uuid) -> Result<(), StorageError> {
        self.games.write().await.remove(&id);
        Ok(())
    }

    async fn fetch_game(&self, username: &str, id: Uuid) -> Result<Game, StorageError> {
        let games = self.games.read().await;
        let row = games.get(&id).ok_or(StorageError::NotFound)?;

        let secret = Word::new(&row.secret);
        let mut sessions = HashMap::with_capacity(row.players.len());
        for stored in row.players.values() {
            let guesses: Vec<Word> = if stored.username == username {
                stored
                    .guesses
                    .iter()
                    .map(|g| {
                        let mut w = Word::replayed(&g.word, g.played_at);
                        w.check(&secret);
                        w
                    })
                    .collect()
            } else {
                // only the best guess leaves storage for other players,
                // re-scored so statuses are always consistent
                stored
                    .best_word
                    .iter()
                    .map(|text| {
                        let mut w = Word::replayed(text, stored.best_played_at);
                        w.check(&secret);
                        w
                    })
                    .collect()
            };

            let mut session = Session::new(Player::new(&stored.username));
            for w in guesses {
                session.play(w);
            }
            if stored.username != username {
                session.set_words_count(stored.words_played);
            }
            sessions.insert(stored.username.clone(), session);
        }

        let mut ordered: Vec<&StoredSession> = row.players.values().collect();
        ordered.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.username.cmp(&b.username)));
        let ranks = ordered.into_iter().map(|s| s.username.clone()).collect();

        let mut game = Game::new(&row.creator, secret);
        game.id = row.id;
        game.created_at = row.created_at;
        game.started_at = row.started_at;
        game.ended_at = row.ended_at;
        game.sessions = sessions;
        game.leaderboard = RankBoard::from_ranks(ranks);
        Ok(game)
    }

    async fn list_games(
        &self,
        username: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Game>, StorageError> {
        let games = self.games.read().await;
        let mut rows: Vec<&StoredGame> = games
            .values()
            .filter(|g| g.players.contains_key(username))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .map(|row| {
                let mut game = Game::new(&row.creator, Word::new(&row.secret));
                game.id = row.id;
                game.created_at = row.created_at;
                game.started_at = row.started_at;
                game.ended_at = row.ended_at;
                game
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::MAX_GUESSES;

    fn played_game() -> Game {
        let mut g = Game::new("u1", Word::new("CORRE"));
        for user in ["u1", "u2"] {
            g.join(Player::new(user));
        }
        g.start();
        g.play("u1", Word::new("NATCO")).unwrap();
        g.play("u1", Word::new("CORRE")).unwrap();
        for _ in 0..MAX_GUESSES {
            g.play("u2", Word::new("NOTCO")).unwrap();
        }
        assert!(g.has_ended());
        g
    }

    #[tokio::test]
    async fn finish_requires_started_row() {
        let storage = MemoryStorage::new();
        let g = played_game();
        assert!(matches!(
            storage.finish_game(&g).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn finish_rejects_running_game() {
        let storage = MemoryStorage::new();
        let mut g = Game::new("u1", Word::new("CORRE"));
        g.join(Player::new("u1"));
        g.start();
        storage.start_game(&g).await.unwrap();
        assert!(matches!(
            storage.finish_game(&g).await,
            Err(StorageError::NotFinished)
        ));
    }

    #[tokio::test]
    async fn fetch_round_trip_preserves_own_history_and_ranks() {
        let storage = MemoryStorage::new();
        let mut g = Game::new("u1", Word::new("CORRE"));
        for user in ["u1", "u2"] {
            g.join(Player::new(user));
        }
        g.start();
        storage.start_game(&g).await.unwrap();

        g.play("u1", Word::new("NATCO")).unwrap();
        g.play("u1", Word::new("CORRE")).unwrap();
        for _ in 0..MAX_GUESSES {
            g.play("u2", Word::new("NOTCO")).unwrap();
        }
        assert!(g.has_ended());
        storage.finish_game(&g).await.unwrap();

        let mut fetched = storage.fetch_game("u1", g.id).await.unwrap();
        fetched.resync();

        let mine = &fetched.sessions["u1"];
        assert_eq!(mine.guesses.len(), 2);
        assert_eq!(mine.guesses[0].text, "NATCO");
        assert_eq!(mine.guesses[1].text, "CORRE");
        assert_eq!(mine.guesses[0].stat_ints(), vec![1, 1, 1, 2, 2]);

        let theirs = &fetched.sessions["u2"];
        assert_eq!(theirs.guesses.len(), 1, "only the best guess is projected");
        assert_eq!(theirs.words_count(), MAX_GUESSES);
        assert_eq!(theirs.best_guess().stat_ints(), vec![1, 3, 1, 2, 1]);

        assert_eq!(fetched.leaderboard.positions, g.leaderboard.positions);
        assert_eq!(fetched.ended_at, g.ended_at);
    }

    #[tokio::test]
    async fn wipe_removes_all_traces() {
        let storage = MemoryStorage::new();
        let g = played_game();
        storage.start_game(&g).await.unwrap();
        storage.wipe_game(g.id).await.unwrap();
        assert!(matches!(
            storage.fetch_game("u1", g.id).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_games_filters_and_pages() {
        let storage = MemoryStorage::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut g = Game::new("u1", Word::new("GAMES"));
            g.join(Player::new("u1"));
            g.start();
            storage.start_game(&g).await.unwrap();
            ids.push(g.id);
        }
        let other = {
            let mut g = Game::new("someone", Word::new("GAMES"));
            g.join(Player::new("someone"));
            g.start();
            storage.start_game(&g).await.unwrap();
            g.id
        };

        let listed = storage.list_games("u1", 0, 0).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|g| g.id != other));
        assert!(listed.iter().all(|g| g.sessions.is_empty()));

        let page = storage.list_games("u1", 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
    }
}
