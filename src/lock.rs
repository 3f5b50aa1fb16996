// Single-writer lock
//
// A leased token stored under `migrator:lock`. Only the holder of the
// current run_token may advance the batch. An expired lease belongs to a
// process that died and may be taken over.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{LOCK_KEY, LOCK_LEASE_SECONDS, TIMESTAMP_FORMAT};
use crate::error::{MigratorError, Result};
use crate::store::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner: String,
    pub run_token: String,
    pub acquired_at: String,
    pub lease_expires_at: String,
}

impl LockToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match NaiveDateTime::parse_from_str(&self.lease_expires_at, TIMESTAMP_FORMAT) {
            Ok(expires) => expires.and_utc() <= now,
            // Unreadable lease: treat as stale
            Err(_) => true,
        }
    }
}

fn worker_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    format!("{}:{}", hostname, pid)
}

fn lease_expiry(now: DateTime<Utc>, lease_seconds: i64) -> String {
    (now + Duration::seconds(lease_seconds)).format(TIMESTAMP_FORMAT).to_string()
}

fn read_raw(store: &dyn ContentStore) -> Result<Option<(String, Option<LockToken>)>> {
    Ok(store.kv_get(LOCK_KEY)?.map(|raw| {
        let token = serde_json::from_str(&raw).ok();
        (raw, token)
    }))
}

/// Current holder, if any (expired leases included).
pub fn current(store: &dyn ContentStore) -> Result<Option<LockToken>> {
    Ok(read_raw(store)?.and_then(|(_, token)| token))
}

/// Holder of a lease that has not expired yet.
pub fn live_holder(store: &dyn ContentStore) -> Result<Option<LockToken>> {
    Ok(current(store)?.filter(|t| !t.is_expired(Utc::now())))
}

pub fn acquire(store: &dyn ContentStore) -> Result<LockToken> {
    acquire_with_lease(store, LOCK_LEASE_SECONDS)
}

/// Take the lock with a compare-and-swap against what we read, so two
/// processes racing for a free or stale lock cannot both win.
pub fn acquire_with_lease(store: &dyn ContentStore, lease_seconds: i64) -> Result<LockToken> {
    let now = Utc::now();
    let existing = read_raw(store)?;
    if let Some((_, Some(holder))) = &existing {
        if !holder.is_expired(now) {
            return Err(MigratorError::ConcurrentActivation(holder.owner.clone()));
        }
        log::warn!(
            "Reclaiming expired migration lock held by {} (expired {})",
            holder.owner,
            holder.lease_expires_at
        );
    }

    let token = LockToken {
        owner: worker_id(),
        run_token: Uuid::new_v4().to_string(),
        acquired_at: now.format(TIMESTAMP_FORMAT).to_string(),
        lease_expires_at: lease_expiry(now, lease_seconds),
    };
    let expected = existing.as_ref().map(|(raw, _)| raw.as_str());
    if store.kv_swap(LOCK_KEY, expected, &serde_json::to_string(&token)?)? {
        return Ok(token);
    }
    let winner = current(store)?.map(|t| t.owner).unwrap_or_else(|| "unknown".to_string());
    Err(MigratorError::ConcurrentActivation(winner))
}

/// Extend the lease. Fails if the token was taken over.
pub fn renew(store: &dyn ContentStore, token: &mut LockToken) -> Result<()> {
    renew_with_lease(store, token, LOCK_LEASE_SECONDS)
}

pub fn renew_with_lease(store: &dyn ContentStore, token: &mut LockToken, lease_seconds: i64) -> Result<()> {
    let held = serde_json::to_string(token)?;
    let mut renewed = token.clone();
    renewed.lease_expires_at = lease_expiry(Utc::now(), lease_seconds);
    if store.kv_swap(LOCK_KEY, Some(&held), &serde_json::to_string(&renewed)?)? {
        *token = renewed;
        return Ok(());
    }
    match current(store)? {
        Some(stored) if stored.run_token != token.run_token => Err(MigratorError::ConcurrentActivation(stored.owner)),
        Some(_) => Err(MigratorError::ConcurrentActivation("lease changed underneath us".to_string())),
        None => Err(MigratorError::ConcurrentActivation("lock was cleared".to_string())),
    }
}

/// Drop the lock if we still hold it.
pub fn release(store: &dyn ContentStore, token: &LockToken) -> Result<()> {
    store.kv_del_if(LOCK_KEY, &serde_json::to_string(token)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;

    #[test]
    fn test_second_acquire_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let token = acquire(&store).unwrap();
        assert!(token.owner.contains(':'));
        assert!(matches!(acquire(&store), Err(MigratorError::ConcurrentActivation(_))));

        release(&store, &token).unwrap();
        assert!(current(&store).unwrap().is_none());
        acquire(&store).unwrap();
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut stale = acquire_with_lease(&store, -10).unwrap();
        assert!(live_holder(&store).unwrap().is_none());

        let fresh = acquire(&store).unwrap();
        assert_ne!(fresh.run_token, stale.run_token);
        assert!(matches!(renew(&store, &mut stale), Err(MigratorError::ConcurrentActivation(_))));

        // A stale holder cannot release someone else's lock
        release(&store, &stale).unwrap();
        assert_eq!(current(&store).unwrap(), Some(fresh));
    }

    #[test]
    fn test_renew_extends_lease() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut token = acquire_with_lease(&store, 1).unwrap();
        renew(&store, &mut token).unwrap();
        let stored = current(&store).unwrap().unwrap();
        assert_eq!(stored, token);
        assert!(!stored.is_expired(Utc::now() + Duration::seconds(60)));
    }
}
