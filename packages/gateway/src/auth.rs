// ABOUTME: Connection authentication collaborator
// ABOUTME: Resolves a bearer token to the user and workspace it belongs to

use async_trait::async_trait;
use runhub_config::AuthToken;
use std::collections::HashMap;

/// Verified identity of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub workspace_id: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` when the token is not recognised
    async fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table loaded from configuration
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: &[AuthToken]) -> Self {
        let tokens = tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    Identity {
                        user_id: t.user_id.clone(),
                        workspace_id: t.workspace_id.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}
