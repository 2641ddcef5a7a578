use crate::{
    metrics,
    models::{DeleteRequest, Platform, Product},
    picture_cache::PictureCache,
    storage::{Storage, StorageError},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid product: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0} delete queue is full")]
    QueueFull(Platform),
    #[error("{0} queue is closed")]
    QueueClosed(Platform),
    #[error("{0} has no running publisher")]
    PlatformDisabled(Platform),
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for BrokerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(detail) => Self::NotFound(detail),
            StorageError::Validation(detail) => Self::Validation(detail),
            other => Self::Storage(other),
        }
    }
}

/// Sending halves of one platform's bounded work queues.
#[derive(Debug, Clone)]
pub struct PlatformQueues {
    pub add: mpsc::Sender<Arc<Product>>,
    pub delete: mpsc::Sender<DeleteRequest>,
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// How long a fan-out task waits for room on a full add-queue before
    /// dropping the dispatch.
    pub dispatch_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(2),
        }
    }
}

/// Entry point for intake: saves products before fanning them out and
/// resolves external ids before queueing retractions.
#[derive(Clone)]
pub struct Broker {
    storage: Storage,
    queues: Arc<HashMap<Platform, PlatformQueues>>,
    tracker: TaskTracker,
    cache: Option<PictureCache>,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(
        storage: Storage,
        queues: HashMap<Platform, PlatformQueues>,
        tracker: TaskTracker,
        cache: Option<PictureCache>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            storage,
            queues: Arc::new(queues),
            tracker,
            cache,
            settings,
        }
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.queues.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Saves the product and dispatches it to every requested platform.
    ///
    /// Returns as soon as the row is durable; dispatch failures are logged and
    /// never reach the caller.
    pub async fn enqueue(&self, mut product: Product) -> Result<i64, BrokerError> {
        product.validate().map_err(BrokerError::Validation)?;

        let id = self.storage.save(&product).await?;
        product.id = id;
        let product = Arc::new(product);

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let url = product.main_picture_url.clone();
            self.tracker.spawn(async move {
                if let Err(err) = cache.save(id, &url).await {
                    warn!(target = "relay.broker", product_id = id, error = %err, "failed to cache picture");
                }
            });
        }

        let platforms = product.requested_platforms();
        for platform in &platforms {
            self.dispatch_add(*platform, product.clone());
        }
        info!(
            target = "relay.broker",
            product_id = id,
            title = %product.title,
            platforms = ?platforms,
            "product saved and dispatched"
        );
        Ok(id)
    }

    fn dispatch_add(&self, platform: Platform, product: Arc<Product>) {
        let Some(queues) = self.queues.get(&platform) else {
            warn!(
                target = "relay.broker",
                product_id = product.id,
                %platform,
                "platform has no running publisher; product stays pending"
            );
            metrics::dispatch_dropped(platform, "add");
            return;
        };
        let tx = queues.add.clone();
        let timeout = self.settings.dispatch_timeout;
        self.tracker.spawn(async move {
            let product_id = product.id;
            match tx.send_timeout(product, timeout).await {
                Ok(()) => {
                    debug!(target = "relay.broker", product_id, %platform, "queued for publishing");
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(target = "relay.broker", product_id, %platform, "add queue full; dispatch dropped");
                    metrics::dispatch_dropped(platform, "add");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    warn!(target = "relay.broker", product_id, %platform, "add queue closed; dispatch dropped");
                    metrics::dispatch_dropped(platform, "add");
                }
            }
        });
    }

    /// Queues retraction of a product from every platform it is live on, or
    /// only from `only` when given. Either every target queue accepts the
    /// request or nothing is queued. Repeated requests for the same listing
    /// may be queued; the publisher deletes it once and skips the rest.
    pub async fn enqueue_delete(
        &self,
        product_id: i64,
        only: Option<Platform>,
    ) -> Result<Vec<Platform>, BrokerError> {
        if product_id < 1 {
            return Err(BrokerError::NotFound(format!(
                "product id must be positive, got {product_id}"
            )));
        }

        let targets = match only {
            Some(platform) => vec![(
                platform,
                self.storage.resolve_external_id(product_id, platform).await?,
            )],
            None => self.storage.resolve_external_ids(product_id).await?,
        };
        if targets.is_empty() {
            return Err(BrokerError::NotFound(format!(
                "product {product_id} is not published on any platform"
            )));
        }

        let mut reserved = Vec::with_capacity(targets.len());
        for (platform, external_id) in targets {
            let queues = self
                .queues
                .get(&platform)
                .ok_or(BrokerError::PlatformDisabled(platform))?;
            let permit = queues.delete.try_reserve().map_err(|err| match err {
                TrySendError::Full(()) => BrokerError::QueueFull(platform),
                TrySendError::Closed(()) => BrokerError::QueueClosed(platform),
            })?;
            reserved.push((
                permit,
                DeleteRequest {
                    product_id,
                    platform,
                    external_id,
                },
            ));
        }

        let mut platforms = Vec::with_capacity(reserved.len());
        for (permit, request) in reserved {
            debug!(
                target = "relay.broker",
                product_id,
                platform = %request.platform,
                external_id = %request.external_id,
                "queued for deletion"
            );
            platforms.push(request.platform);
            permit.send(request);
        }
        Ok(platforms)
    }
}
