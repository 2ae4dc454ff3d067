use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use uuid::Uuid;

use crate::game::Player;

/// How long an invite token stays redeemable.
const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// How often expired tokens are evicted.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct Invite {
    player: Player,
    game_id: Uuid,
    created_at: Instant,
}

/// Short-lived tokens binding a player to a game they may connect to.
///
/// Tokens are deterministic: issuing twice for the same (player, game) pair
/// returns the same token and keeps a single entry.
pub struct InviteStore {
    salt: String,
    entries: RwLock<HashMap<String, Invite>>,
}

impl InviteStore {
    pub fn new(salt: &str) -> Arc<Self> {
        Arc::new(InviteStore {
            salt: salt.to_string(),
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Issues (or re-issues) the token for `player` on `game_id`.
    pub fn issue(&self, player: Player, game_id: Uuid) -> String {
        let mut hasher = Sha256::new();
        hasher.update(player.username.as_bytes());
        hasher.update(self.salt.as_bytes());
        hasher.update(game_id.to_string().as_bytes());
        let token = format!("{:x}", hasher.finalize());

        let mut entries = self.entries.write().expect("invite lock poisoned");
        entries.entry(token.clone()).or_insert_with(|| Invite {
            player,
            game_id,
            created_at: Instant::now(),
        });
        token
    }

    /// Resolves a token back to its player and game.
    pub fn redeem(&self, token: &str) -> Option<(Player, Uuid)> {
        let entries = self.entries.read().expect("invite lock poisoned");
        entries
            .get(token)
            .map(|inv| (inv.player.clone(), inv.game_id))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().expect("invite lock poisoned").len()
    }

    fn evict_older_than(&self, ttl: Duration) {
        let mut entries = self.entries.write().expect("invite lock poisoned");
        entries.retain(|_, inv| inv.created_at.elapsed() <= ttl);
    }

    /// Periodic eviction of expired tokens. Exits on app shutdown.
    pub async fn run_cleanup(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = cancel.wait_for(|stop| *stop) => return,
                _ = ticker.tick() => self.evict_older_than(TOKEN_TTL),
            }
        }
    }
}
