//! Account pool leasing and validation.
//!
//! A crawl leases three times the accounts it needs, logs each candidate in
//! through a fresh judge session, and keeps the first N that work. The
//! [`Lease`] guard owns every leased username and releases the remaining
//! ones when dropped, so accounts return to ACTIVE on every exit path,
//! including panics.

use std::sync::Arc;

use crate::oj::{Connector, JudgeClient};
use crate::store::{Account, Store};

/// Candidate multiplier absorbing login failures.
pub const LEASE_OVERSUBSCRIPTION: usize = 3;

/// A leased, logged-in account ready for probe submissions.
pub struct ReadyAccount {
    pub account: Account,
    pub client: Box<dyn JudgeClient>,
}

impl std::fmt::Debug for ReadyAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyAccount")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of leased accounts.
pub struct Lease {
    store: Arc<dyn Store>,
    usernames: Vec<String>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("usernames", &self.usernames)
            .finish_non_exhaustive()
    }
}

impl Lease {
    fn new(store: Arc<dyn Store>, accounts: &[Account]) -> Self {
        Self {
            store,
            usernames: accounts.iter().map(|a| a.username.clone()).collect(),
        }
    }

    /// Release a subset immediately (failed logins, surplus candidates).
    fn release_now(&mut self, usernames: &[String]) {
        if usernames.is_empty() {
            return;
        }
        if let Err(err) = self.store.release_accounts(usernames) {
            tracing::warn!(error = %err, "failed to release accounts early");
            return;
        }
        self.usernames.retain(|u| !usernames.contains(u));
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.usernames.is_empty() {
            return;
        }
        if let Err(err) = self.store.release_accounts(&self.usernames) {
            tracing::error!(error = %err, "failed to release leased accounts");
        }
    }
}

/// Lease and validate a working pool of `needed` accounts.
///
/// Candidates are walked in lease order. The pass stops as soon as the pool
/// is full, or as soon as the remaining candidates cannot possibly fill it
/// (`admitted + remaining >= needed` must hold at every step). Login
/// failures are transient: the account is released back to ACTIVE and
/// skipped for this task only.
pub async fn prepare_pool(
    store: &Arc<dyn Store>,
    connector: &dyn Connector,
    needed: usize,
    password: &str,
) -> anyhow::Result<(Vec<ReadyAccount>, Lease)> {
    let needed = needed.max(1);
    let candidates = store.lease_accounts(needed * LEASE_OVERSUBSCRIPTION)?;
    let mut lease = Lease::new(store.clone(), &candidates);

    let mut ready: Vec<ReadyAccount> = Vec::with_capacity(needed);
    let mut unused: Vec<String> = Vec::new();

    for (index, account) in candidates.iter().enumerate() {
        if ready.len() + (candidates.len() - index) < needed {
            unused.extend(candidates[index..].iter().map(|a| a.username.clone()));
            break;
        }
        if ready.len() >= needed {
            unused.push(account.username.clone());
            continue;
        }

        let client = connector.client()?;
        match client.login(&account.username, password).await {
            Ok(()) => ready.push(ReadyAccount {
                account: account.clone(),
                client,
            }),
            Err(err) => {
                tracing::warn!(
                    account = %account.username,
                    error = %err,
                    "login failed, skipping account for this task"
                );
                unused.push(account.username.clone());
            }
        }
    }

    lease.release_now(&unused);

    if ready.len() < needed {
        anyhow::bail!(
            "failed to prepare enough usable accounts (got {}, needed {needed})",
            ready.len()
        );
    }
    Ok((ready, lease))
}
