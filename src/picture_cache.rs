use crate::media::{FetchError, PictureFetcher};
use bytes::Bytes;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("url does not point to a .jpg or .jpeg image: {0}")]
    UnsupportedFormat(String),
    #[error("picture for product {0} is not cached")]
    NotFound(i64),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local copy of each product's main picture, stored as `<dir>/<id>.jpg`.
#[derive(Clone)]
pub struct PictureCache {
    dir: PathBuf,
    fetcher: Arc<dyn PictureFetcher>,
}

impl PictureCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn PictureFetcher>) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
        }
    }

    fn path_for(&self, product_id: i64) -> PathBuf {
        self.dir.join(format!("{product_id}.jpg"))
    }

    pub async fn save(&self, product_id: i64, url: &str) -> Result<PathBuf, CacheError> {
        let lowered = url.to_lowercase();
        let without_query = lowered.split(['?', '#']).next().unwrap_or_default();
        if !without_query.ends_with(".jpg") && !without_query.ends_with(".jpeg") {
            return Err(CacheError::UnsupportedFormat(url.to_string()));
        }
        let body = self.fetcher.fetch(url).await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(product_id);
        tokio::fs::write(&path, &body).await?;
        debug!(target = "relay.cache", product_id, path = %path.display(), bytes = body.len(), "picture cached");
        Ok(path)
    }

    pub async fn load(&self, product_id: i64) -> Result<Bytes, CacheError> {
        match tokio::fs::read(self.path_for(product_id)).await {
            Ok(body) => Ok(Bytes::from(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(product_id))
            }
            Err(err) => Err(CacheError::Io(err)),
        }
    }
}
