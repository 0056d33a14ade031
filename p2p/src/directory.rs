use std::future::Future;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("directory request rejected: {0}")]
    Rejected(String),
}

/// Best-effort online-peer directory used only for bootstrap and keep-alive.
///
/// Presence inside the mesh is gossip driven; callers swallow every error
/// from this trait after logging it.
pub trait Directory: Send + Sync + 'static {
    fn list_online(&self) -> impl Future<Output = Result<Vec<String>, DirectoryError>> + Send;

    fn register_online(
        &self,
        peer_id: &str,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    fn unregister_online(
        &self,
        peer_id: &str,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;
}
