//! Persisted OAuth token cache: accounts, access tokens and refresh tokens.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Scopes the identity platform adds on its own; never used to match cache entries.
pub const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// A signed-in account known to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    /// `{oid}.{tid}` of the user; keys the account's tokens.
    pub home_account_id: String,
    pub username: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub authority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAccessToken {
    pub home_account_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub secret: String,
    pub expires_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRefreshToken {
    pub home_account_id: String,
    pub client_id: String,
    pub secret: String,
}

/// Whole OAuth cache as stored under one cache key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCacheData {
    #[serde(default)]
    pub accounts: Vec<CachedAccount>,
    #[serde(default)]
    pub access_tokens: Vec<CachedAccessToken>,
    #[serde(default)]
    pub refresh_tokens: Vec<CachedRefreshToken>,
}

impl TokenCacheData {
    /// Accounts whose username matches, in cache order.
    pub fn accounts_for(&self, username: &str) -> Vec<CachedAccount> {
        self.accounts
            .iter()
            .filter(|a| a.username.eq_ignore_ascii_case(username))
            .cloned()
            .collect()
    }

    /// An access token covering every requested scope that outlives `margin`.
    pub fn access_token_for(
        &self,
        account: &CachedAccount,
        client_id: &str,
        scopes: &[String],
        margin: Duration,
    ) -> Option<&CachedAccessToken> {
        let wanted = matchable_scopes(scopes);
        let not_before = Utc::now() + margin;
        self.access_tokens.iter().find(|t| {
            t.home_account_id == account.home_account_id
                && t.client_id == client_id
                && t.expires_on > not_before
                && wanted
                    .iter()
                    .all(|w| t.scopes.iter().any(|s| s.eq_ignore_ascii_case(w)))
        })
    }

    pub fn refresh_token_for(&self, account: &CachedAccount, client_id: &str) -> Option<&str> {
        self.refresh_tokens
            .iter()
            .find(|t| t.home_account_id == account.home_account_id && t.client_id == client_id)
            .map(|t| t.secret.as_str())
    }

    /// Insert or replace an account, keyed by home account id.
    pub fn upsert_account(&mut self, account: CachedAccount) {
        match self
            .accounts
            .iter_mut()
            .find(|a| a.home_account_id == account.home_account_id)
        {
            Some(existing) => *existing = account,
            None => self.accounts.push(account),
        }
    }

    /// Store a freshly minted access token, superseding any entry for the same scope set.
    pub fn put_access_token(&mut self, token: CachedAccessToken) {
        let key = matchable_scopes(&token.scopes);
        self.access_tokens.retain(|t| {
            !(t.home_account_id == token.home_account_id
                && t.client_id == token.client_id
                && same_scopes(&matchable_scopes(&t.scopes), &key))
        });
        self.access_tokens.push(token);
    }

    pub fn put_refresh_token(&mut self, token: CachedRefreshToken) {
        self.refresh_tokens.retain(|t| {
            !(t.home_account_id == token.home_account_id && t.client_id == token.client_id)
        });
        self.refresh_tokens.push(token);
    }

    /// Drop access tokens that have already expired.
    pub fn prune_expired(&mut self) {
        let now = Utc::now();
        self.access_tokens.retain(|t| t.expires_on > now);
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.access_tokens.is_empty() && self.refresh_tokens.is_empty()
    }
}

fn matchable_scopes(scopes: &[String]) -> Vec<&str> {
    scopes
        .iter()
        .map(String::as_str)
        .filter(|s| !RESERVED_SCOPES.iter().any(|r| r.eq_ignore_ascii_case(s)))
        .collect()
}

fn same_scopes(a: &[&str], b: &[&str]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| y.eq_ignore_ascii_case(x)))
}
