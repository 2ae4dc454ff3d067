use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::{Game, Player, Session};
use crate::word::Word;

/// File-backed snapshot of the live rooms.
///
/// On shutdown every open game is written out; on the next boot the snapshot
/// is read back, its games revived into rooms and the file cleared. Scored
/// statuses are not persisted, they are recomputed from the secret on load.
pub struct HubBackup {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct GuessSnapshot {
    word: String,
    played_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionSnapshot {
    username: String,
    guesses: Vec<GuessSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GameSnapshot {
    id: Uuid,
    creator: String,
    secret: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    sessions: Vec<SessionSnapshot>,
}

fn snapshot(game: &Game) -> GameSnapshot {
    GameSnapshot {
        id: game.id,
        creator: game.creator.clone(),
        secret: game.secret.text.clone(),
        created_at: game.created_at,
        started_at: game.started_at,
        ended_at: game.ended_at,
        sessions: game
            .sessions
            .values()
            .map(|s| SessionSnapshot {
                username: s.player.username.clone(),
                guesses: s
                    .guesses
                    .iter()
                    .map(|w| GuessSnapshot {
                        word: w.text.clone(),
                        played_at: w.played_at,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn revive(snap: GameSnapshot) -> Game {
    let secret = Word::new(&snap.secret);
    let mut game = Game::new(&snap.creator, secret.clone());
    game.id = snap.id;
    game.created_at = snap.created_at;
    game.started_at = snap.started_at;
    game.ended_at = snap.ended_at;

    for stored in snap.sessions {
        let mut session = Session::new(Player::new(&stored.username));
        for g in stored.guesses {
            let mut w = Word::replayed(&g.word, g.played_at);
            w.check(&secret);
            session.play(w);
        }
        game.sessions.insert(stored.username, session);
    }
    game.resync();
    game
}

impl HubBackup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HubBackup { path: path.into() }
    }

    /// Writes every open game to the snapshot file.
    pub fn dump(&self, games: &[Game]) -> io::Result<()> {
        let snaps: Vec<GameSnapshot> = games.iter().map(snapshot).collect();
        let data = serde_json::to_vec(&snaps)?;
        fs::write(&self.path, data)
    }

    /// Loads the snapshot, clears the file and returns the revived games
    /// ready to be wrapped in rooms. A missing file is an empty hub.
    pub fn load_and_clear(&self) -> io::Result<Vec<Game>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let snaps: Vec<GameSnapshot> = serde_json::from_slice(&data)?;
        fs::remove_file(&self.path)?;
        Ok(snaps.into_iter().map(revive).collect())
    }
}
