pub mod vk;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

pub use vk::VkClient;

pub type MediaId = String;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("rejected by marketplace ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether a later attempt could succeed without changing the request.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) => true,
            RemoteError::Status(code) => *code == 429 || *code >= 500,
            RemoteError::Rejected { code, .. } => matches!(code, 6 | 9 | 10),
            RemoteError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListingDraft {
    pub title: String,
    pub description: String,
    pub price: i64,
    pub category_id: Option<i64>,
    pub main_media: MediaId,
    pub media: Vec<MediaId>,
}

/// One external marketplace. Owner context (group, shop, credentials) lives
/// in the implementation.
#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn upload_media(&self, image: Bytes, primary: bool) -> Result<MediaId, RemoteError>;

    /// Creates the listing and returns its external id.
    async fn create_listing(&self, draft: &ListingDraft) -> Result<String, RemoteError>;

    async fn delete_listing(&self, external_id: &str) -> Result<(), RemoteError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RemoteError::Transport("timeout".into()).is_transient());
        assert!(RemoteError::Status(503).is_transient());
        assert!(RemoteError::Status(429).is_transient());
        assert!(!RemoteError::Status(400).is_transient());
        assert!(
            RemoteError::Rejected {
                code: 6,
                message: "Too many requests per second".into()
            }
            .is_transient()
        );
        assert!(
            !RemoteError::Rejected {
                code: 15,
                message: "Access denied".into()
            }
            .is_transient()
        );
    }
}
