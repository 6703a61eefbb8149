use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hosting providers the remote code-search service understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteProviderKind {
    GitHub,
    AzureDevOps,
}

impl RemoteProviderKind {
    /// Hostname used to recognize this provider in remote URLs
    pub fn host(&self) -> &'static str {
        match self {
            RemoteProviderKind::GitHub => "github.com",
            RemoteProviderKind::AzureDevOps => "dev.azure.com",
        }
    }
}

/// An authentication session for one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    /// Bearer token for the remote service
    pub token: String,
}

/// Retrieves authentication sessions per provider.
///
/// `interactive` controls whether the provider may prompt the user; a silent
/// request returns `None` when no cached session exists.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn session(&self, provider: RemoteProviderKind, interactive: bool)
    -> Option<AuthSession>;
}
