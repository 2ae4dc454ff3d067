use std::time::Duration;

/// Reads an environment variable with a fallback.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Port the HTTP server listens on.
pub fn port() -> u16 {
    env_or("PORT", "3000").parse().unwrap_or(3000)
}

/// Salt mixed into invite tokens. Override it in production.
pub fn salt() -> String {
    env_or(
        "WORDRACE_SALT",
        "NdZXxlv1ShnypBDGrJCRe8g7HPENVyXkSZyOsSYyQbGtqnduoxMPyfcnKXEVKdHz",
    )
}

/// Whether the room garbage collector runs.
pub fn gc_enabled() -> bool {
    env_or("WORDRACE_GC", "true").parse().unwrap_or(true)
}

/// Interval between garbage-collector ticks.
pub fn gc_interval() -> Duration {
    let secs = env_or("WORDRACE_GC_INTERVAL_SECS", "900")
        .parse()
        .unwrap_or(900);
    Duration::from_secs(secs)
}

/// Where the shutdown snapshot of open games is written.
pub fn backup_path() -> String {
    env_or("WORDRACE_BACKUP_PATH", "wordrace_hub.json")
}

/// How long a connection may go without answering a ping.
pub fn pong_wait() -> Duration {
    let secs = env_or("WORDRACE_PONG_WAIT_SECS", "10").parse().unwrap_or(10);
    Duration::from_secs(secs)
}

/// Ping cadence, kept comfortably inside the pong deadline.
pub fn ping_interval() -> Duration {
    pong_wait().mul_f64(0.9)
}
