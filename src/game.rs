use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::word::{Word, MAX_GUESSES};

/// A player identity. Authentication happens upstream; the engine only cares
/// about the username.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub username: String,
}

impl Player {
    pub fn new(username: &str) -> Self {
        Player {
            username: username.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("player not found")]
    PlayerNotFound,
    #[error("user session has ended")]
    SessionEnded,
}

/// A single player's guess history within one game.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub player: Player,
    pub guesses: Vec<Word>,
    best: Option<Word>,
    /// Word count restored from storage for games where only the best guess
    /// survived. Zero means "use the live guess list".
    words_count: usize,
}

impl Session {
    pub fn new(player: Player) -> Self {
        Session {
            player,
            guesses: Vec::new(),
            best: None,
            words_count: 0,
        }
    }

    /// Appends a guess and returns true when it became the new best.
    pub(crate) fn play(&mut self, w: Word) -> bool {
        let improved = match &self.best {
            None => true,
            Some(best) => w.outranks(best),
        };
        if improved {
            self.best = Some(w.clone());
        }
        self.guesses.push(w);
        improved
    }

    /// Rebuilds `best` from the guess list. Used after a cold reload.
    pub fn resync(&mut self) {
        let guesses = std::mem::take(&mut self.guesses);
        self.best = None;
        for w in guesses {
            self.play(w);
        }
    }

    /// The best guess so far, or the empty word when none was played.
    pub fn best_guess(&self) -> Word {
        self.best.clone().unwrap_or_default()
    }

    pub fn set_words_count(&mut self, n: usize) {
        self.words_count = n;
    }

    /// Number of words this player has played. Prefers the externally
    /// restored count when the full guess list was not loaded.
    pub fn words_count(&self) -> usize {
        if self.words_count != 0 {
            return self.words_count;
        }
        self.guesses.len()
    }

    /// True when this session's best guess ranks strictly above `other`'s.
    pub fn outranks(&self, other: &Session) -> bool {
        match (&self.best, &other.best) {
            (None, _) => false,
            (Some(mine), None) => mine.outranks(&Word::default()),
            (Some(mine), Some(theirs)) => mine.outranks(theirs),
        }
    }

    /// True when the best guess matches the secret.
    pub fn won(&self) -> bool {
        if self.guesses.is_empty() {
            return false;
        }
        self.best_guess().correct()
    }

    pub fn can_play(&self) -> bool {
        self.guesses.len() < MAX_GUESSES
    }

    /// One-way latch: all attempts used, or the word was found.
    pub fn ended(&self) -> bool {
        self.guesses.len() == MAX_GUESSES || self.won()
    }
}

/// Ordered view of the sessions, best guess first. `ranks` holds usernames;
/// `positions` is the inverse permutation.
#[derive(Debug, Clone, Default)]
pub struct RankBoard {
    pub ranks: Vec<String>,
    pub positions: HashMap<String, usize>,
}

impl RankBoard {
    /// Builds a board over the given sessions in arbitrary order.
    pub fn new(sessions: &HashMap<String, Session>) -> Self {
        let mut ranks = Vec::with_capacity(sessions.len());
        let mut positions = HashMap::with_capacity(sessions.len());
        for (index, username) in sessions.keys().enumerate() {
            ranks.push(username.clone());
            positions.insert(username.clone(), index);
        }
        RankBoard { ranks, positions }
    }

    /// Restores a board from an already-ordered list of usernames.
    pub fn from_ranks(ranks: Vec<String>) -> Self {
        let positions = ranks
            .iter()
            .enumerate()
            .map(|(i, u)| (u.clone(), i))
            .collect();
        RankBoard { ranks, positions }
    }

    /// Bubbles `username` up toward rank 0 after their best guess improved.
    /// Returns the number of players they displaced.
    pub fn fix_position(&mut self, username: &str, sessions: &HashMap<String, Session>) -> usize {
        let Some(&start) = self.positions.get(username) else {
            return 0;
        };
        let mut moves = 0;
        let mut i = start;
        while i > 0 {
            let curr = &self.ranks[i];
            let prev = &self.ranks[i - 1];
            let outranks = match (sessions.get(curr), sessions.get(prev)) {
                (Some(c), Some(p)) => c.outranks(p),
                _ => false,
            };
            if !outranks {
                break;
            }
            self.positions.insert(curr.clone(), i - 1);
            self.positions.insert(prev.clone(), i);
            self.ranks.swap(i, i - 1);
            moves += 1;
            i -= 1;
        }
        moves
    }

    /// Full re-sort, best guess first. Used after a cold reload.
    pub fn resync(&mut self, sessions: &HashMap<String, Session>) {
        self.ranks.sort_by(|a, b| {
            let (sa, sb) = (&sessions[a], &sessions[b]);
            if sa.outranks(sb) {
                std::cmp::Ordering::Less
            } else if sb.outranks(sa) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        for (i, username) in self.ranks.iter().enumerate() {
            self.positions.insert(username.clone(), i);
        }
    }
}

/// Outcome of a successful play.
#[derive(Debug, Clone)]
pub struct PlayOutcome {
    /// Players displaced on the leaderboard by this guess.
    pub displacement: usize,
    /// Whether the guess became the player's new best.
    pub improved: bool,
    /// The scored guess.
    pub guess: Word,
}

/// One game: the secret, the per-player sessions and the leaderboard.
/// Mutated only by its room's consumer task.
#[derive(Debug, Clone)]
pub struct Game {
    pub id: Uuid,
    pub creator: String,
    pub secret: Word,
    pub sessions: HashMap<String, Session>,
    pub leaderboard: RankBoard,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    finished: usize,
}

impl Game {
    pub fn new(creator: &str, secret: Word) -> Self {
        Game {
            id: Uuid::new_v4(),
            creator: creator.to_string(),
            secret,
            sessions: HashMap::new(),
            leaderboard: RankBoard::default(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            finished: 0,
        }
    }

    /// Adds an empty session for `player`. Only meaningful before the game
    /// becomes active.
    pub fn join(&mut self, player: Player) {
        let username = player.username.clone();
        self.sessions.insert(username, Session::new(player));
    }

    /// Marks the game started and freezes the participant set into the
    /// leaderboard.
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.leaderboard = RankBoard::new(&self.sessions);
    }

    /// Rolls back a start whose persistence failed, returning to the lobby.
    pub fn abort_start(&mut self) {
        self.started_at = None;
    }

    pub fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Scores `guess` for `username` and repositions them on the leaderboard.
    ///
    /// Must only be called from the room's consumer task. Sets `ended_at`
    /// once every session has ended.
    pub fn play(&mut self, username: &str, mut guess: Word) -> Result<PlayOutcome, GameError> {
        let secret = self.secret.clone();
        let session = self
            .sessions
            .get_mut(username)
            .ok_or(GameError::PlayerNotFound)?;
        if session.ended() {
            return Err(GameError::SessionEnded);
        }

        guess.played_at = Some(Utc::now());
        guess.check(&secret);
        let improved = session.play(guess.clone());
        let ended = session.ended();

        let displacement = self.leaderboard.fix_position(username, &self.sessions);
        if ended {
            self.finished += 1;
            if self.finished == self.sessions.len() {
                self.ended_at = Some(Utc::now());
            }
        }

        Ok(PlayOutcome {
            displacement,
            improved,
            guess,
        })
    }

    /// Recomputes the derived state after a cold reload: per-session bests,
    /// the finished count and the leaderboard order.
    pub fn resync(&mut self) {
        self.finished = 0;
        for session in self.sessions.values_mut() {
            session.resync();
            if session.won() {
                self.finished += 1;
            }
        }
        self.leaderboard.resync(&self.sessions);
    }

}
