use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("picture url is empty")]
    EmptyUrl,
    #[error("failed to fetch picture: {0}")]
    Transport(String),
    #[error("unexpected status: HTTP {0}")]
    Status(u16),
}

/// Downloads picture bytes by URL.
#[async_trait]
pub trait PictureFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpPictureFetcher {
    http: Client,
}

impl HttpPictureFetcher {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PictureFetcher for HttpPictureFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::EmptyUrl);
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    /// Serves registered URLs from memory; anything else is a 404.
    #[derive(Default)]
    pub struct FakeFetcher {
        pictures: HashMap<String, Bytes>,
        pub requested: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub fn with(mut self, url: &str, body: &'static [u8]) -> Self {
            self.pictures.insert(url.to_string(), Bytes::from_static(body));
            self
        }
    }

    #[async_trait]
    impl PictureFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            if url.trim().is_empty() {
                return Err(FetchError::EmptyUrl);
            }
            self.pictures
                .get(url)
                .cloned()
                .ok_or(FetchError::Status(404))
        }
    }
}
