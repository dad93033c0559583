//! Upstream registry: the fleet of decryption servers behind the gateway.
//!
//! Upstreams are addressed by index into a fixed, startup-loaded list.
//! Workers pick an idle upstream round-robin and mark it busy for a
//! fixed grace period while a key-generation request is in flight on
//! the drone side; the front-end only ever reads.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;

/// One entry of the `SERVERS_CONFIG` JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSpec {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
struct Token {
    value: String,
    issued_at: Instant,
}

struct UpstreamState {
    status: Status,
    busy_until: Option<Instant>,
    token: Option<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Busy,
}

/// A single upstream decryption server, identified by its index in the registry.
pub struct Upstream {
    pub index: usize,
    pub url: String,
    pub username: String,
    pub password: String,
    state: RwLock<UpstreamState>,
}

impl Upstream {
    fn new(index: usize, spec: UpstreamSpec) -> Self {
        Self {
            index,
            url: spec.url,
            username: spec.username,
            password: spec.password,
            state: RwLock::new(UpstreamState {
                status: Status::Idle,
                busy_until: None,
                token: None,
            }),
        }
    }

    /// True if idle, lazily clearing an expired busy mark.
    fn is_idle_now(&self) -> bool {
        let mut st = self.state.write();
        if st.status == Status::Busy {
            if let Some(until) = st.busy_until {
                if Instant::now() >= until {
                    st.status = Status::Idle;
                    st.busy_until = None;
                }
            }
        }
        st.status == Status::Idle
    }

    pub fn set_busy(&self, for_duration: Duration) {
        let mut st = self.state.write();
        st.status = Status::Busy;
        st.busy_until = Some(Instant::now() + for_duration);
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_idle_now() { "idle" } else { "busy" }
    }

    pub fn current_token(&self) -> Option<String> {
        self.state.read().token.as_ref().map(|t| t.value.clone())
    }

    /// Whether the cached token is missing or older than `refresh_after`.
    pub fn needs_token_refresh(&self, refresh_after: Duration) -> bool {
        match &self.state.read().token {
            None => true,
            Some(t) => t.issued_at.elapsed() >= refresh_after,
        }
    }

    pub fn store_token(&self, value: String) {
        self.state.write().token = Some(Token {
            value,
            issued_at: Instant::now(),
        });
    }

    pub fn invalidate_token(&self) {
        self.state.write().token = None;
    }

    pub fn token_status_label(&self, refresh_after: Duration) -> &'static str {
        match &self.state.read().token {
            None => "none",
            Some(t) if t.issued_at.elapsed() >= refresh_after => "expired",
            Some(_) => "valid",
        }
    }

    pub fn token_fetch_time(&self) -> Option<Instant> {
        self.state.read().token.as_ref().map(|t| t.issued_at)
    }
}

/// Ordered registry of upstream servers with round-robin idle selection.
pub struct Registry {
    upstreams: Vec<Upstream>,
    last_picked: RwLock<usize>,
}

impl Registry {
    pub fn new(specs: Vec<UpstreamSpec>) -> Self {
        let upstreams = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Upstream::new(index, spec))
            .collect();
        Self {
            upstreams,
            last_picked: RwLock::new(usize::MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Upstream> {
        self.upstreams.get(index)
    }

    pub fn all(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Picks the next idle upstream starting just after the last pick,
    /// wrapping around. Returns `None` if every upstream is busy.
    pub fn pick_idle_round_robin(&self) -> Option<usize> {
        let n = self.upstreams.len();
        if n == 0 {
            return None;
        }

        let start = {
            let last = *self.last_picked.read();
            if last == usize::MAX { 0 } else { (last + 1) % n }
        };

        for offset in 0..n {
            let idx = (start + offset) % n;
            if self.upstreams[idx].is_idle_now() {
                *self.last_picked.write() = idx;
                return Some(idx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(url: &str) -> UpstreamSpec {
        UpstreamSpec {
            url: url.to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        }
    }

    #[test]
    fn round_robin_skips_busy() {
        let reg = Registry::new(vec![spec("a"), spec("b"), spec("c")]);
        reg.get(0).unwrap().set_busy(Duration::from_secs(60));
        let first = reg.pick_idle_round_robin().unwrap();
        assert_eq!(first, 1);
        let second = reg.pick_idle_round_robin().unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn all_busy_returns_none() {
        let reg = Registry::new(vec![spec("a")]);
        reg.get(0).unwrap().set_busy(Duration::from_secs(60));
        assert_eq!(reg.pick_idle_round_robin(), None);
    }

    #[test]
    fn busy_expires_lazily() {
        let reg = Registry::new(vec![spec("a")]);
        reg.get(0).unwrap().set_busy(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.pick_idle_round_robin(), Some(0));
    }
}
