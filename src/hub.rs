use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config;
use crate::game::Game;
use crate::room::Room;
use crate::storage::GameStorage;
use crate::word::{Word, WordSource};

/// Longest a room may live before it is collected.
pub const ROOM_DURATION: Duration = Duration::from_secs(60 * 60);

/// Rooms that never gathered a session are collected sooner.
pub const EMPTY_ROOM_DURATION: Duration = Duration::from_secs(15 * 60);

/// Process-wide directory of live rooms.
///
/// Lookups hit the map; misses fall back to cold storage and revive the game
/// in a fresh room. A garbage-collection task reclaims rooms nobody plays in.
pub struct Hub {
    rooms: DashMap<Uuid, Arc<Room>>,
    storage: Arc<dyn GameStorage>,
    words: Arc<dyn WordSource>,
}

impl Hub {
    pub fn new(storage: Arc<dyn GameStorage>, words: Arc<dyn WordSource>) -> Arc<Self> {
        Arc::new(Hub {
            rooms: DashMap::new(),
            storage,
            words,
        })
    }

    /// Creates a new game with a fresh secret and registers its room.
    pub fn create_room(&self, creator: &str) -> Arc<Room> {
        let secret = Word::new(&self.words.generate());
        let game = Game::new(creator, secret);
        tracing::info!("game created: {} by {}", game.id, creator);

        let (room, driver) = Room::new(game, self.storage.clone(), self.words.clone());
        self.rooms.insert(room.id(), room.clone());
        tokio::spawn(driver);
        room
    }

    /// Revives an already-built game (a snapshot from a previous run) into a
    /// registered room.
    pub fn adopt(&self, game: Game) -> Arc<Room> {
        let (room, driver) = Room::new(game, self.storage.clone(), self.words.clone());
        self.rooms.insert(room.id(), room.clone());
        tokio::spawn(driver);
        room
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Room>> {
        self.rooms.get(&id).map(|entry| entry.clone())
    }

    /// Copies of every open game, for the shutdown snapshot.
    pub async fn games(&self) -> Vec<Game> {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| entry.value().clone()).collect();
        let mut games = Vec::with_capacity(rooms.len());
        for room in rooms {
            if room.is_closed() {
                continue;
            }
            games.push(room.snapshot().await.clone());
        }
        games
    }

    /// Fast path reads the map; on a miss the game is loaded from storage,
    /// resynced and wrapped in a new room. Concurrent misses for the same id
    /// converge on a single room through the map entry.
    pub async fn get_or_restore(&self, id: Uuid, username: &str) -> Option<Arc<Room>> {
        if let Some(room) = self.get(id) {
            return Some(room);
        }

        let mut game = self.storage.fetch_game(username, id).await.ok()?;
        game.resync();
        let (room, driver) = Room::new(game, self.storage.clone(), self.words.clone());

        match self.rooms.entry(id) {
            // lost the race; the loser's driver is never spawned
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(room.clone());
                tracing::info!("room restored from storage: {}", id);
                tokio::spawn(driver);
                Some(room)
            }
        }
    }

    /// Selects the rooms to collect: already closed, past their lifetime, or
    /// empty past the shorter empty-room lifetime.
    async fn mark(&self) -> Vec<Arc<Room>> {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| entry.value().clone()).collect();
        let now = Utc::now();

        let mut garbage = Vec::new();
        for room in rooms {
            if room.is_closed() {
                garbage.push(room);
                continue;
            }
            let expired = {
                let game = room.snapshot().await;
                is_expired(&game, now)
            };
            if expired {
                garbage.push(room);
            }
        }
        garbage
    }

    /// Drops marked rooms from the map, then closes the survivors of the
    /// grace window outside any map access.
    fn sweep(&self, garbage: &mut Vec<Arc<Room>>) {
        for room in garbage.iter() {
            self.rooms.remove(&room.id());
        }
        for room in garbage.drain(..) {
            if room.is_closed() {
                continue;
            }
            room.close();
        }
    }

    /// Two-phase collector: rooms marked on one tick are swept on the next,
    /// giving a late join one interval of grace. Exits on app shutdown.
    pub async fn run_gc(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        if !config::gc_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(config::gc_interval());
        ticker.tick().await; // first tick fires immediately

        let mut mark_phase = true;
        let mut garbage: Vec<Arc<Room>> = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.wait_for(|stop| *stop) => return,
                _ = ticker.tick() => {}
            }
            if mark_phase {
                garbage = self.mark().await;
                if !garbage.is_empty() {
                    tracing::debug!("{} rooms marked for collection", garbage.len());
                }
            } else {
                self.sweep(&mut garbage);
            }
            mark_phase = !mark_phase;
        }
    }
}

/// Whether a game's room has outlived its welcome.
fn is_expired(game: &Game, now: DateTime<Utc>) -> bool {
    let age = now
        .signed_duration_since(game.created_at)
        .to_std()
        .unwrap_or_default();
    if age >= ROOM_DURATION {
        return true;
    }
    age >= EMPTY_ROOM_DURATION && game.sessions.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Player;
    use crate::storage::MemoryStorage;
    use crate::word::LocalWords;

    fn hub() -> (Arc<Hub>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let words = Arc::new(LocalWords::new());
        (Hub::new(storage.clone(), words), storage)
    }

    #[tokio::test]
    async fn create_room_registers_a_lobby() {
        let (hub, _) = hub();
        let room = hub.create_room("alice");
        assert!(!room.is_active());
        let found = hub.get(room.id()).expect("room should be registered");
        assert!(Arc::ptr_eq(&found, &room));

        let game = room.snapshot().await;
        assert_eq!(game.creator, "alice");
        assert_eq!(game.secret.text.chars().count(), crate::word::WORD_LENGTH);
    }

    #[tokio::test]
    async fn restore_misses_without_stored_game() {
        let (hub, _) = hub();
        assert!(hub.get_or_restore(Uuid::new_v4(), "alice").await.is_none());
    }

    #[tokio::test]
    async fn restore_revives_a_stored_game_once() {
        let (hub, storage) = hub();

        let mut game = Game::new("alice", Word::new("GAMES"));
        game.join(Player::new("alice"));
        game.join(Player::new("bob"));
        game.start();
        storage.start_game(&game).await.unwrap();
        let id = game.id;

        let restored = hub.get_or_restore(id, "alice").await.expect("stored game");
        assert_eq!(restored.id(), id);
        assert!(restored.is_active());
        {
            let game = restored.snapshot().await;
            assert_eq!(game.sessions.len(), 2);
        }

        let again = hub.get_or_restore(id, "bob").await.expect("same room");
        assert!(Arc::ptr_eq(&restored, &again));
        assert_eq!(hub.rooms.len(), 1);
    }

    #[tokio::test]
    async fn expiry_rules() {
        let now = Utc::now();

        let fresh = Game::new("alice", Word::new("GAMES"));
        assert!(!is_expired(&fresh, now));

        // an empty lobby dies after the short timeout
        let mut idle = Game::new("alice", Word::new("GAMES"));
        idle.created_at = now - chrono::Duration::minutes(20);
        assert!(is_expired(&idle, now));

        // with a session it survives until the full room lifetime
        let mut occupied = idle.clone();
        occupied.join(Player::new("alice"));
        assert!(!is_expired(&occupied, now));
        occupied.created_at = now - chrono::Duration::minutes(61);
        assert!(is_expired(&occupied, now));
    }

    #[tokio::test]
    async fn mark_and_sweep_collect_stale_rooms() {
        let (hub, storage) = hub();

        let stale = hub.create_room("alice");
        {
            let mut game = stale.game_mut().await;
            game.join(Player::new("alice"));
            game.start();
            game.created_at = Utc::now() - chrono::Duration::hours(2);
            storage.start_game(&game).await.unwrap();
        }
        let live = hub.create_room("bob");

        let mut garbage = hub.mark().await;
        assert_eq!(garbage.len(), 1);
        assert_eq!(garbage[0].id(), stale.id());

        hub.sweep(&mut garbage);
        assert!(hub.get(stale.id()).is_none());
        assert!(hub.get(live.id()).is_some());
        assert!(stale.is_closed());

        // abandoned mid-game: the started row is wiped, not finished
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(storage.fetch_game("alice", stale.id()).await.is_err());
    }
}
