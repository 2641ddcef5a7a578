use crate::{
    marketplace::{ListingDraft, Marketplace, RemoteError},
    media::{FetchError, PictureFetcher},
    metrics,
    models::{DeleteRequest, Platform, Product},
    storage::{Storage, StorageError},
};
use bytes::Bytes;
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Instant,
};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc::Receiver};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Additional pictures beyond the main one that are attached to a listing.
pub const MAX_ADDITIONAL_PICTURES: usize = 4;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to fetch main picture: {0}")]
    MainPicture(FetchError),
    #[error("failed to fetch additional pictures: {0}")]
    Pictures(FetchError),
    #[error("failed to upload main picture: {0}")]
    MainUpload(RemoteError),
    #[error("failed to create listing: {0}")]
    Listing(RemoteError),
}

impl PublishError {
    pub fn step(&self) -> &'static str {
        match self {
            PublishError::MainPicture(_) => "fetch_main_picture",
            PublishError::Pictures(_) => "fetch_pictures",
            PublishError::MainUpload(_) => "upload_main_picture",
            PublishError::Listing(_) => "create_listing",
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::MainPicture(_) | PublishError::Pictures(_) => true,
            PublishError::MainUpload(err) | PublishError::Listing(err) => err.is_transient(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetractError {
    #[error("failed to look up listing state: {0}")]
    Lookup(StorageError),
    #[error("failed to delete listing: {0}")]
    Remote(RemoteError),
    #[error("listing deleted remotely but not recorded: {0}")]
    Status(StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractOutcome {
    Deleted,
    /// The listing is no longer recorded as live under this external id.
    AlreadyRetracted,
    /// Another task is already retracting the same listing.
    InFlight,
}

/// Marks an external id as being retracted until dropped.
struct RetractClaim<'a> {
    retracting: &'a Mutex<HashSet<String>>,
    external_id: String,
}

impl<'a> RetractClaim<'a> {
    fn acquire(retracting: &'a Mutex<HashSet<String>>, external_id: &str) -> Option<Self> {
        let mut set = retracting.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.insert(external_id.to_string()).then(|| Self {
            retracting,
            external_id: external_id.to_string(),
        })
    }
}

impl Drop for RetractClaim<'_> {
    fn drop(&mut self) {
        let mut set = self
            .retracting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.external_id);
    }
}

/// Outcome of one successful publication. `warnings` collects the partial
/// failures that did not stop the listing from going live.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub external_id: String,
    pub media_count: usize,
    pub warnings: Vec<String>,
    pub recorded: bool,
}

/// Consumes one platform's add and delete queues. Each direction has its own
/// in-flight limit, so slow publications never hold back retractions.
pub struct Publisher {
    platform: Platform,
    marketplace: Arc<dyn Marketplace>,
    fetcher: Arc<dyn PictureFetcher>,
    storage: Storage,
    add_limiter: Arc<Semaphore>,
    delete_limiter: Arc<Semaphore>,
    retracting: Mutex<HashSet<String>>,
    tracker: TaskTracker,
}

impl Publisher {
    pub fn new(
        platform: Platform,
        marketplace: Arc<dyn Marketplace>,
        fetcher: Arc<dyn PictureFetcher>,
        storage: Storage,
        max_in_flight: usize,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            platform,
            marketplace,
            fetcher,
            storage,
            add_limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
            delete_limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
            retracting: Mutex::new(HashSet::new()),
            tracker,
        }
    }

    /// Runs until every sender of the add-queue is dropped. Each item gets its
    /// own task, bounded by the in-flight limit.
    pub async fn run_add_loop(self: Arc<Self>, mut rx: Receiver<Arc<Product>>) {
        info!(target = "relay.publisher", platform = %self.platform, "add loop started");
        while let Some(product) = rx.recv().await {
            let Ok(permit) = self.add_limiter.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                worker.handle_publish(&product).await;
            });
        }
        info!(target = "relay.publisher", platform = %self.platform, "add loop stopped");
    }

    pub async fn run_delete_loop(self: Arc<Self>, mut rx: Receiver<DeleteRequest>) {
        info!(target = "relay.publisher", platform = %self.platform, "delete loop started");
        while let Some(request) = rx.recv().await {
            let Ok(permit) = self.delete_limiter.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                worker.handle_retract(&request).await;
            });
        }
        info!(target = "relay.publisher", platform = %self.platform, "delete loop stopped");
    }

    async fn handle_publish(&self, product: &Product) {
        let started = Instant::now();
        match self.publish(product).await {
            Ok(report) if report.warnings.is_empty() => {
                info!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = product.id,
                    title = %product.title,
                    external_id = %report.external_id,
                    media = report.media_count,
                    "product published"
                );
                metrics::item_outcome(self.platform, "publish", "published");
            }
            Ok(report) => {
                warn!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = product.id,
                    title = %product.title,
                    external_id = %report.external_id,
                    media = report.media_count,
                    warnings = ?report.warnings,
                    "product published with warnings"
                );
                let outcome = if report.recorded { "partial" } else { "unrecorded" };
                metrics::item_outcome(self.platform, "publish", outcome);
            }
            Err(err) => {
                error!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = product.id,
                    title = %product.title,
                    step = err.step(),
                    transient = err.is_transient(),
                    error = %err,
                    "publish failed"
                );
                metrics::item_outcome(self.platform, "publish", "failed");
            }
        }
        metrics::item_elapsed(self.platform, "publish", started.elapsed().as_millis());
    }

    async fn handle_retract(&self, request: &DeleteRequest) {
        let started = Instant::now();
        match self.retract(request).await {
            Ok(RetractOutcome::Deleted) => {
                info!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = request.product_id,
                    external_id = %request.external_id,
                    "listing retracted"
                );
                metrics::item_outcome(self.platform, "retract", "deleted");
            }
            Ok(outcome) => {
                debug!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = request.product_id,
                    external_id = %request.external_id,
                    ?outcome,
                    "duplicate retract skipped"
                );
                metrics::item_outcome(self.platform, "retract", "skipped");
            }
            Err(err) => {
                error!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = request.product_id,
                    external_id = %request.external_id,
                    error = %err,
                    "retract failed"
                );
                metrics::item_outcome(self.platform, "retract", "failed");
            }
        }
        metrics::item_elapsed(self.platform, "retract", started.elapsed().as_millis());
    }

    /// Fetches pictures, uploads them, creates the listing and records the
    /// external id. A failure to record is reported, never rolled back remotely.
    pub async fn publish(&self, product: &Product) -> Result<PublishReport, PublishError> {
        let mut warnings = Vec::new();

        let main = self
            .fetcher
            .fetch(&product.main_picture_url)
            .await
            .map_err(PublishError::MainPicture)?;
        let additional = self.fetch_additional(product, &mut warnings).await?;

        let main_media = self
            .marketplace
            .upload_media(main, true)
            .await
            .map_err(PublishError::MainUpload)?;
        let mut media = Vec::with_capacity(additional.len());
        for (url, image) in additional {
            match self.marketplace.upload_media(image, false).await {
                Ok(id) => media.push(id),
                Err(err) => warnings.push(format!("upload {url}: {err}")),
            }
        }

        let draft = ListingDraft {
            title: product.listing_title().to_string(),
            description: product.description.clone(),
            price: product.price,
            category_id: self.platform.category(product),
            main_media,
            media,
        };
        let external_id = self
            .marketplace
            .create_listing(&draft)
            .await
            .map_err(PublishError::Listing)?;

        let recorded = match self
            .storage
            .mark_published(product.id, self.platform, &external_id)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(
                    target = "relay.publisher",
                    platform = %self.platform,
                    product_id = product.id,
                    external_id = %external_id,
                    error = %err,
                    "listing is live but its external id was not recorded"
                );
                warnings.push(format!("external id not recorded: {err}"));
                false
            }
        };

        Ok(PublishReport {
            external_id,
            media_count: 1 + draft.media.len(),
            warnings,
            recorded,
        })
    }

    // Individual misses are warnings; the item aborts only when every
    // candidate fails.
    async fn fetch_additional(
        &self,
        product: &Product,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<(String, Bytes)>, PublishError> {
        let candidates: Vec<&String> = product
            .picture_urls
            .iter()
            .filter(|url| !url.trim().is_empty())
            .take(MAX_ADDITIONAL_PICTURES)
            .collect();
        if candidates.len() < product.picture_urls.len() {
            debug!(
                target = "relay.publisher",
                product_id = product.id,
                given = product.picture_urls.len(),
                used = candidates.len(),
                "skipping empty or surplus picture urls"
            );
        }

        let mut pictures = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for url in candidates {
            match self.fetcher.fetch(url).await {
                Ok(image) => pictures.push((url.clone(), image)),
                Err(err) => {
                    warnings.push(format!("fetch {url}: {err}"));
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if pictures.is_empty() => Err(PublishError::Pictures(err)),
            _ => Ok(pictures),
        }
    }

    /// Deletes the remote listing and records the retraction. Requests for a
    /// listing that is already gone or already being retracted are skipped.
    pub async fn retract(&self, request: &DeleteRequest) -> Result<RetractOutcome, RetractError> {
        let Some(_claim) = RetractClaim::acquire(&self.retracting, &request.external_id) else {
            return Ok(RetractOutcome::InFlight);
        };
        match self
            .storage
            .resolve_external_id(request.product_id, self.platform)
            .await
        {
            Ok(current) if current == request.external_id => {}
            Ok(_) | Err(StorageError::NotFound(_)) => return Ok(RetractOutcome::AlreadyRetracted),
            Err(err) => return Err(RetractError::Lookup(err)),
        }

        self.marketplace
            .delete_listing(&request.external_id)
            .await
            .map_err(RetractError::Remote)?;
        self.storage
            .mark_deleted(request.product_id, self.platform)
            .await
            .map_err(RetractError::Status)?;
        Ok(RetractOutcome::Deleted)
    }
}
