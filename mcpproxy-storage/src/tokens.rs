//! OAuth token set persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{ProxyDb, TREE_TOKENS};
use crate::error::StorageResult;

/// A persisted OAuth token set
///
/// Keyed by `(server_name, auth_server_url)`: one upstream may authenticate
/// against several authorization servers over its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Upstream server this token belongs to
    pub server_name: String,

    /// Authorization server that issued the token
    pub auth_server_url: String,

    /// Bearer access token
    pub access_token: String,

    /// Refresh token, when the grant included one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute expiry time of the access token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// When the access token was issued
    pub issued_at: DateTime<Utc>,

    /// Granted scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// OAuth client identifier used for this grant
    pub client_id: String,

    /// RFC 8707 resource indicator sent with token requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl TokenSet {
    /// Remaining lifetime from `issued_at` to `expires_at`
    pub fn lifetime(&self) -> Option<chrono::Duration> {
        self.expires_at.map(|exp| exp - self.issued_at)
    }

    /// Whether the access token has expired as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Store for token sets inside `config.db`
#[derive(Clone)]
pub struct TokenStore {
    db: ProxyDb,
}

impl TokenStore {
    pub fn new(db: ProxyDb) -> Self {
        Self { db }
    }

    fn key(server_name: &str, auth_server_url: &str) -> Vec<u8> {
        // 0x1f never occurs in server names or URLs
        let mut key = Vec::with_capacity(server_name.len() + auth_server_url.len() + 1);
        key.extend_from_slice(server_name.as_bytes());
        key.push(0x1f);
        key.extend_from_slice(auth_server_url.as_bytes());
        key
    }

    /// Insert or replace a token set
    pub fn put(&self, tokens: &TokenSet) -> StorageResult<()> {
        let tree = self.db.tree(TREE_TOKENS)?;
        let key = Self::key(&tokens.server_name, &tokens.auth_server_url);
        tree.insert(key, serde_json::to_vec(tokens)?)?;
        tree.flush()?;
        Ok(())
    }

    /// Fetch the token set for a server / authorization-server pair
    pub fn get(&self, server_name: &str, auth_server_url: &str) -> StorageResult<Option<TokenSet>> {
        let tree = self.db.tree(TREE_TOKENS)?;
        match tree.get(Self::key(server_name, auth_server_url))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch any token set stored for a server
    pub fn get_for_server(&self, server_name: &str) -> StorageResult<Option<TokenSet>> {
        let tree = self.db.tree(TREE_TOKENS)?;
        let mut prefix = server_name.as_bytes().to_vec();
        prefix.push(0x1f);

        for entry in tree.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }
        Ok(None)
    }

    /// Delete every token set stored for a server (logout)
    pub fn delete_for_server(&self, server_name: &str) -> StorageResult<usize> {
        let tree = self.db.tree(TREE_TOKENS)?;
        let mut prefix = server_name.as_bytes().to_vec();
        prefix.push(0x1f);

        let keys: Vec<_> = tree
            .scan_prefix(prefix)
            .map(|entry| entry.map(|(k, _)| k))
            .collect::<Result<_, sled::Error>>()?;

        let count = keys.len();
        for key in keys {
            tree.remove(key)?;
        }
        tree.flush()?;
        Ok(count)
    }

    /// List all persisted token sets
    pub fn list(&self) -> StorageResult<Vec<TokenSet>> {
        let tree = self.db.tree(TREE_TOKENS)?;
        tree.iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect::<StorageResult<Vec<_>>>()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(server: &str) -> TokenSet {
        let issued = Utc::now();
        TokenSet {
            server_name: server.to_string(),
            auth_server_url: "https://auth.example.com".to_string(),
            access_token: "at-123".to_string(),
            refresh_token: Some("rt-456".to_string()),
            expires_at: Some(issued + Duration::hours(1)),
            issued_at: issued,
            scope: Some("mcp".to_string()),
            client_id: "client-1".to_string(),
            resource: Some("https://mcp.example.com".to_string()),
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let store = TokenStore::new(ProxyDb::open_temporary().unwrap());
        let tokens = sample("gh");
        store.put(&tokens).unwrap();

        let loaded = store.get("gh", "https://auth.example.com").unwrap().unwrap();
        assert_eq!(loaded, tokens);
        assert!(store.get("gh", "https://other.example.com").unwrap().is_none());
    }

    #[test]
    fn test_delete_for_server_removes_all_pairs() {
        let store = TokenStore::new(ProxyDb::open_temporary().unwrap());
        let mut a = sample("gh");
        store.put(&a).unwrap();
        a.auth_server_url = "https://auth2.example.com".to_string();
        store.put(&a).unwrap();
        store.put(&sample("slack")).unwrap();

        assert_eq!(store.delete_for_server("gh").unwrap(), 2);
        assert!(store.get_for_server("gh").unwrap().is_none());
        assert!(store.get_for_server("slack").unwrap().is_some());
    }

    #[test]
    fn test_lifetime_and_expiry() {
        let tokens = sample("gh");
        assert_eq!(tokens.lifetime(), Some(Duration::hours(1)));
        assert!(!tokens.is_expired(tokens.issued_at));
        assert!(tokens.is_expired(tokens.issued_at + Duration::hours(2)));
    }
}
