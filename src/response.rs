use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::Game;
use crate::word::Word;

/// One scored guess as seen over the wire. `word` is present only when the
/// guess belongs to the recipient or the game has ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuessResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word: Option<String>,
    pub played_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<u8>,
}

/// A player's row on the leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSummaryResponse {
    pub rank: usize,
    pub best: GuessResponse,
    pub username: String,
    pub words_played: usize,
}

/// Effect of a guess: its score, how far the player climbed and the board
/// everyone now sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerGuessResponse {
    pub result: GuessResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_offset: Option<usize>,
    pub leaderboard: Vec<PlayerSummaryResponse>,
}

/// Full view of a game for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameResponse {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub creator: String,
    /// Revealed only once the game has ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_word: Option<String>,
    /// The recipient's own guess history, words visible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guesses: Vec<GuessResponse>,
    /// Best guesses of every player, words hidden while the game runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub game_performance: Vec<PlayerSummaryResponse>,
    pub id: Uuid,
}

/// Payload of `client/data`: the game view plus whether play is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialData {
    #[serde(flatten)]
    pub response: GameResponse,
    pub active: bool,
}

/// Renders a word for the wire, hiding the text unless `show_word`.
pub fn to_guess(w: &Word, show_word: bool) -> GuessResponse {
    GuessResponse {
        word: show_word.then(|| w.text.clone()),
        played_at: w.played_at,
        status: w.stat_ints(),
    }
}

/// Renders the leaderboard in rank order, words hidden.
pub fn to_leaderboard(game: &Game) -> Vec<PlayerSummaryResponse> {
    game.leaderboard
        .ranks
        .iter()
        .filter_map(|username| {
            let session = game.sessions.get(username)?;
            Some(PlayerSummaryResponse {
                rank: game
                    .leaderboard
                    .positions
                    .get(username)
                    .copied()
                    .unwrap_or_default(),
                best: to_guess(&session.best_guess(), false),
                username: username.clone(),
                words_played: session.words_count(),
            })
        })
        .collect()
}

/// Renders the whole game for `username`. Their own guesses carry words;
/// everyone else contributes statuses only. The secret appears once the game
/// has ended.
pub fn to_response(game: &Game, username: &str) -> GameResponse {
    let performance = if game.is_active() {
        to_leaderboard(game)
    } else {
        // no board yet in the lobby; list players in a stable order
        let mut names: Vec<&String> = game.sessions.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let session = &game.sessions[name];
                PlayerSummaryResponse {
                    rank: game
                        .leaderboard
                        .positions
                        .get(name)
                        .copied()
                        .unwrap_or_default(),
                    best: to_guess(&session.best_guess(), false),
                    username: name.clone(),
                    words_played: session.words_count(),
                }
            })
            .collect()
    };

    let guesses = game
        .sessions
        .get(username)
        .map(|session| session.guesses.iter().map(|w| to_guess(w, true)).collect())
        .unwrap_or_default();

    GameResponse {
        created_at: game.created_at,
        started_at: game.started_at,
        ended_at: game.ended_at,
        creator: game.creator.clone(),
        correct_word: game.has_ended().then(|| game.secret.text.clone()),
        guesses,
        game_performance: performance,
        id: game.id,
    }
}

/// The `client/data` payload sent on start and on every fresh connection.
pub fn initial_data(game: &Game, username: &str) -> InitialData {
    InitialData {
        response: to_response(game, username),
        active: game.is_active(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Game, Player};
    use crate::word::Word;

    fn played_game() -> Game {
        let mut g = Game::new("user2", Word::new("CORRE"));
        for user in ["user1", "user2", "user3"] {
            g.join(Player::new(user));
        }
        g.start();
        for user in ["user1", "user2", "user3"] {
            g.play(user, Word::new("NATCO")).unwrap();
            g.play(user, Word::new("NOTCO")).unwrap();
        }
        g
    }

    #[test]
    fn own_guesses_show_words_others_do_not() {
        let resp = to_response(&played_game(), "user1");

        assert_eq!(resp.guesses.len(), 2);
        assert_eq!(resp.guesses[0].word.as_deref(), Some("NATCO"));
        assert_eq!(resp.guesses[0].status, vec![1, 1, 1, 2, 2]);
        assert_eq!(resp.guesses[1].word.as_deref(), Some("NOTCO"));
        assert_eq!(resp.guesses[1].status, vec![1, 3, 1, 2, 1]);

        assert_eq!(resp.game_performance.len(), 3);
        for row in &resp.game_performance {
            assert!(row.best.word.is_none(), "leaked word for {}", row.username);
            assert_eq!(row.best.status, vec![1, 3, 1, 2, 1]);
        }
    }

    #[test]
    fn correct_word_revealed_only_after_end() {
        let mut g = played_game();
        assert!(to_response(&g, "user1").correct_word.is_none());

        for user in ["user1", "user2", "user3"] {
            g.play(user, Word::new("CORRE")).unwrap();
        }
        assert!(g.has_ended());
        assert_eq!(
            to_response(&g, "user1").correct_word.as_deref(),
            Some("CORRE")
        );
    }

    #[test]
    fn lobby_performance_is_sorted_by_username() {
        let mut g = Game::new("zoe", Word::new("GAMES"));
        g.join(Player::new("zoe"));
        g.join(Player::new("amy"));
        let resp = to_response(&g, "amy");
        let names: Vec<&str> = resp
            .game_performance
            .iter()
            .map(|p| p.username.as_str())
            .collect();
        assert_eq!(names, vec!["amy", "zoe"]);
    }

    #[test]
    fn active_performance_follows_leaderboard_order() {
        let g = played_game();
        let resp = to_response(&g, "user2");
        let names: Vec<&str> = resp
            .game_performance
            .iter()
            .map(|p| p.username.as_str())
            .collect();
        assert_eq!(names[0], "user1"); // earliest NOTCO
        for (i, row) in resp.game_performance.iter().enumerate() {
            assert_eq!(row.rank, i);
        }
    }

    #[test]
    fn initial_data_tracks_activity() {
        let mut g = Game::new("amy", Word::new("GAMES"));
        g.join(Player::new("amy"));
        assert!(!initial_data(&g, "amy").active);
        g.start();
        assert!(initial_data(&g, "amy").active);
    }

    #[test]
    fn guess_serialization_omits_hidden_word() {
        let mut w = Word::new("NOTCO");
        w.check(&Word::new("CORRE"));
        let json = serde_json::to_value(to_guess(&w, false)).unwrap();
        assert!(json.get("word").is_none());
        assert_eq!(json["status"], serde_json::json!([1, 3, 1, 2, 1]));
    }
}
