//! User authentication and quota accounting.
//!
//! Real deployments back this with a database; the gateway only needs
//! the interface. `InMemoryUserStore` is the reference implementation
//! used by default and by tests.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub priority: i64,
    /// `-1` means unlimited.
    pub total_requests: i64,
    pub remaining_requests: i64,
    pub update_time_epoch: i64,
}

impl UserRecord {
    pub fn orders_summary(&self) -> String {
        if self.total_requests == -1 {
            format!("{}/unlimited", self.remaining_requests)
        } else {
            format!("{}/{}", self.remaining_requests, self.total_requests)
        }
    }

    pub fn visit_times_summary(&self) -> String {
        if self.total_requests == -1 {
            "unlimited".to_string()
        } else {
            format!("{}/{}", self.remaining_requests, self.total_requests)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded;

/// External authentication and quota-accounting collaborator.
///
/// Password verification and persistence are someone else's job; this
/// trait is the seam the gateway calls through.
pub trait UserStore: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord, AuthFail>;

    /// Atomically charges one request against the user's quota.
    /// Unlimited accounts (`total_requests == -1`) always succeed.
    fn charge(&self, username: &str) -> Result<UserRecord, QuotaExceeded>;

    /// Best-effort freshness stamp; failures are logged and swallowed by callers.
    fn touch_last_request(&self, username: &str) -> anyhow::Result<()>;
}

struct Account {
    password: String,
    priority: i64,
    total_requests: i64,
    remaining_requests: i64,
    /// Epoch seconds of the account's last priority-tier change. Feeds the
    /// priority-queue score; unrelated to request activity.
    update_time_epoch: i64,
    /// Best-effort last-request stamp, telemetry only.
    last_request_at: i64,
}

/// In-memory reference `UserStore`, seeded at construction.
pub struct InMemoryUserStore {
    accounts: Mutex<HashMap<String, Account>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_account(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
        priority: i64,
        total_requests: i64,
    ) -> Self {
        self.accounts.lock().insert(
            username.into(),
            Account {
                password: password.into(),
                priority,
                total_requests,
                remaining_requests: 0,
                update_time_epoch: now_epoch(),
                last_request_at: 0,
            },
        );
        self
    }
}

impl Default for InMemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for InMemoryUserStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord, AuthFail> {
        let accounts = self.accounts.lock();
        let account = accounts.get(username).ok_or(AuthFail)?;
        if account.password != password {
            return Err(AuthFail);
        }
        Ok(UserRecord {
            username: username.to_string(),
            priority: account.priority,
            total_requests: account.total_requests,
            remaining_requests: account.remaining_requests,
            update_time_epoch: account.update_time_epoch,
        })
    }

    fn charge(&self, username: &str) -> Result<UserRecord, QuotaExceeded> {
        let mut accounts = self.accounts.lock();
        let account = accounts.get_mut(username).ok_or(QuotaExceeded)?;

        if account.total_requests != -1 && account.remaining_requests >= account.total_requests {
            return Err(QuotaExceeded);
        }
        if account.total_requests != -1 {
            account.remaining_requests += 1;
        }

        Ok(UserRecord {
            username: username.to_string(),
            priority: account.priority,
            total_requests: account.total_requests,
            remaining_requests: account.remaining_requests,
            update_time_epoch: account.update_time_epoch,
        })
    }

    fn touch_last_request(&self, username: &str) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| anyhow::anyhow!("unknown user {username}"))?;
        account.last_request_at = now_epoch();
        Ok(())
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_fails_once_quota_exhausted() {
        let store = InMemoryUserStore::new().with_account("alice", "secret", 1, 2);
        store.charge("alice").unwrap();
        store.charge("alice").unwrap();
        assert!(store.charge("alice").is_err());
    }

    #[test]
    fn unlimited_quota_never_exhausts() {
        let store = InMemoryUserStore::new().with_account("bob", "secret", 1, -1);
        for _ in 0..1000 {
            store.charge("bob").unwrap();
        }
    }

    #[test]
    fn wrong_password_rejected() {
        let store = InMemoryUserStore::new().with_account("alice", "secret", 1, 10);
        assert!(store.authenticate("alice", "wrong").is_err());
    }

    #[test]
    fn charging_and_touching_do_not_move_the_queue_score_time() {
        let store = InMemoryUserStore::new().with_account("alice", "secret", 1, 10);
        let before = store.authenticate("alice", "secret").unwrap().update_time_epoch;
        store.charge("alice").unwrap();
        store.touch_last_request("alice").unwrap();
        let after = store.authenticate("alice", "secret").unwrap().update_time_epoch;
        assert_eq!(before, after);
    }
}
