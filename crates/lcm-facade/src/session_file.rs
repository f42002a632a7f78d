//! The injected session-file collaborator: bootstrap reads a
//! host-owned linear transcript log without this crate owning its format.

use anyhow::Result;
use async_trait::async_trait;
use lcm_core::Role;

#[derive(Debug, Clone)]
pub struct SessionFileMessage {
    pub role: Role,
    pub content: String,
}

#[async_trait]
pub trait SessionFileReader: Send + Sync {
    async fn read(&self, session_file: &str) -> Result<Vec<SessionFileMessage>>;
}
