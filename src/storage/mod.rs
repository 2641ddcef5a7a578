mod schema;

use crate::models::{Platform, PlatformState, Product, SearchPage, UcozListing, VkListing};
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("media reference `{0}` already belongs to another product")]
    DuplicateMedia(String),
    #[error("external id `{external_id}` already recorded for {platform}")]
    DuplicateExternalId {
        platform: Platform,
        external_id: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// SQLite-backed store for products, per-platform external ids and the search
/// projection. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

const SEARCH_FILTER: &str =
    "(CAST(vk_published AS INTEGER) = 1 OR CAST(ucoz_published AS INTEGER) = 1)";

impl Storage {
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        if path.trim().is_empty() {
            return Err(StorageError::Validation("storage path is empty".into()));
        }
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }
        debug!(target = "relay.storage", path, "opening sqlite storage");
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(options).await
    }

    pub async fn connect(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Inserts the product, its empty platform-id row and its primary media row
    /// in one transaction. The id is returned only after commit.
    pub async fn save(&self, product: &Product) -> Result<i64, StorageError> {
        let picture_urls = serde_json::to_string(&product.picture_urls)
            .map_err(|err| StorageError::Validation(err.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO products(
                title, search_title, price, description, size, status,
                main_picture_url, picture_urls, vk_requested, vk_category_id,
                ucoz_requested, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&product.title)
        .bind(product.title.to_lowercase())
        .bind(product.price)
        .bind(&product.description)
        .bind(&product.size)
        .bind(&product.status)
        .bind(&product.main_picture_url)
        .bind(picture_urls)
        .bind(product.vk.to_load)
        .bind(product.vk.category_id)
        .bind(product.ucoz.to_load)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO product_platform_ids(product_id) VALUES (?)")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO product_media(product_id, primary_media_ref, primary_media_url)
             VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(&product.source_media_ref)
        .bind(&product.main_picture_url)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StorageError::DuplicateMedia(product.source_media_ref.clone())
            } else {
                StorageError::Database(err)
            }
        })?;

        tx.commit().await?;
        debug!(target = "relay.storage", product_id = id, "product saved");
        Ok(id)
    }

    /// Records the external id and flips the published flag in one
    /// transaction. An external id is written at most once per pair.
    pub async fn mark_published(
        &self,
        product_id: i64,
        platform: Platform,
        external_id: &str,
    ) -> Result<(), StorageError> {
        let duplicate = || StorageError::DuplicateExternalId {
            platform,
            external_id: external_id.to_string(),
        };
        let mut tx = self.pool.begin().await?;

        let update_mapping = format!(
            "UPDATE product_platform_ids SET {col} = ? WHERE product_id = ? AND {col} IS NULL",
            col = platform.external_id_column(),
        );
        let result = sqlx::query(&update_mapping)
            .bind(external_id)
            .bind(product_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    duplicate()
                } else {
                    StorageError::Database(err)
                }
            })?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT product_id FROM product_platform_ids WHERE product_id = ?",
            )
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match exists {
                Some(_) => duplicate(),
                None => StorageError::NotFound(format!("no platform mapping for product {product_id}")),
            });
        }

        let update_flag = format!(
            "UPDATE products SET {} = TRUE WHERE id = ?",
            platform.published_column()
        );
        sqlx::query(&update_flag)
            .bind(product_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(target = "relay.storage", product_id, %platform, external_id, "marked published");
        Ok(())
    }

    /// Stamps the retraction time and clears the published flag. The external
    /// id is kept for audit.
    pub async fn mark_deleted(&self, product_id: i64, platform: Platform) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let update_mapping = format!(
            "UPDATE product_platform_ids SET {deleted} = ?
             WHERE product_id = ? AND {ext} IS NOT NULL AND {deleted} IS NULL",
            deleted = platform.deleted_at_column(),
            ext = platform.external_id_column(),
        );
        let result = sqlx::query(&update_mapping)
            .bind(Utc::now())
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "product {product_id} is not published on {platform}"
            )));
        }

        let update_flag = format!(
            "UPDATE products SET {} = FALSE WHERE id = ?",
            platform.published_column()
        );
        sqlx::query(&update_flag)
            .bind(product_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(target = "relay.storage", product_id, %platform, "marked deleted");
        Ok(())
    }

    pub async fn resolve_external_id(
        &self,
        product_id: i64,
        platform: Platform,
    ) -> Result<String, StorageError> {
        let query = format!(
            "SELECT {}, {} FROM product_platform_ids WHERE product_id = ?",
            platform.external_id_column(),
            platform.deleted_at_column(),
        );
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(&query)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Err(StorageError::NotFound(format!(
                "no platform mapping for product {product_id}"
            ))),
            Some((None, _)) => Err(StorageError::NotFound(format!(
                "product {product_id} is not published on {platform}"
            ))),
            Some((Some(_), Some(_))) => Err(StorageError::NotFound(format!(
                "product {product_id} was already retracted from {platform}"
            ))),
            Some((Some(external_id), None)) => Ok(external_id),
        }
    }

    /// Every platform the product is currently published on. Fails with
    /// `NotFound` only when the product has no mapping row at all.
    pub async fn resolve_external_ids(
        &self,
        product_id: i64,
    ) -> Result<Vec<(Platform, String)>, StorageError> {
        let row = sqlx::query("SELECT * FROM product_platform_ids WHERE product_id = ?")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StorageError::NotFound(format!("no platform mapping for product {product_id}"))
            })?;

        let mut resolved = Vec::new();
        for platform in Platform::ALL {
            let external_id: Option<String> = row.try_get(platform.external_id_column())?;
            let deleted_at: Option<String> = row.try_get(platform.deleted_at_column())?;
            if let (Some(external_id), None) = (external_id, deleted_at) {
                resolved.push((platform, external_id));
            }
        }
        Ok(resolved)
    }

    pub async fn platform_state(
        &self,
        product_id: i64,
        platform: Platform,
    ) -> Result<PlatformState, StorageError> {
        let query = format!(
            "SELECT p.{}, m.{}, m.{}
             FROM products p JOIN product_platform_ids m ON m.product_id = p.id
             WHERE p.id = ?",
            platform.requested_column(),
            platform.external_id_column(),
            platform.deleted_at_column(),
        );
        let row: Option<(bool, Option<String>, Option<String>)> = sqlx::query_as(&query)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some((requested, external_id, deleted_at)) = row else {
            return Err(StorageError::NotFound(format!("product {product_id}")));
        };
        Ok(match (external_id, deleted_at) {
            (Some(external_id), Some(_)) => PlatformState::Deleted { external_id },
            (Some(external_id), None) => PlatformState::Published { external_id },
            (None, _) if requested => PlatformState::Pending,
            (None, _) => PlatformState::NotRequested,
        })
    }

    /// Case-insensitive title search over products published on at least one
    /// platform. Count and page are read inside one transaction.
    pub async fn search(
        &self,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> Result<SearchPage, StorageError> {
        let expression = match_expression(query)
            .ok_or_else(|| StorageError::Validation("empty search query".into()))?;
        if limit < 1 || offset < 0 {
            return Err(StorageError::Validation(format!(
                "invalid page window: offset {offset}, limit {limit}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        let count_query =
            format!("SELECT COUNT(*) FROM products_fts WHERE products_fts MATCH ? AND {SEARCH_FILTER}");
        let total: i64 = sqlx::query_scalar(&count_query)
            .bind(&expression)
            .fetch_one(&mut *tx)
            .await?;
        if total == 0 {
            tx.commit().await?;
            return Ok(SearchPage {
                products: Vec::new(),
                total,
            });
        }

        let page_query = format!(
            "SELECT p.id, p.title, p.price, p.description, p.size, p.status,
                    p.main_picture_url, p.picture_urls, p.vk_requested, p.vk_category_id,
                    p.vk_published, p.ucoz_requested, p.ucoz_published, p.created_at,
                    m.primary_media_ref
             FROM products p
             JOIN product_media m ON m.product_id = p.id
             WHERE p.id IN (
                 SELECT rowid FROM products_fts
                 WHERE products_fts MATCH ? AND {SEARCH_FILTER}
                 ORDER BY rowid LIMIT ? OFFSET ?
             )
             ORDER BY p.id"
        );
        let rows: Vec<ProductRow> = sqlx::query_as(&page_query)
            .bind(&expression)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let products = rows
            .into_iter()
            .map(Product::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchPage { products, total })
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!(target = "relay.storage", "sqlite storage closed");
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(FromRow)]
struct ProductRow {
    id: i64,
    title: String,
    price: i64,
    description: String,
    size: String,
    status: String,
    main_picture_url: String,
    picture_urls: String,
    vk_requested: bool,
    vk_category_id: Option<i64>,
    vk_published: bool,
    ucoz_requested: bool,
    ucoz_published: bool,
    created_at: DateTime<Utc>,
    primary_media_ref: String,
}

impl TryFrom<ProductRow> for Product {
    type Error = StorageError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let picture_urls: Vec<String> = serde_json::from_str(&row.picture_urls)
            .map_err(|err| StorageError::Database(sqlx::Error::Decode(Box::new(err))))?;
        Ok(Product {
            id: row.id,
            title: row.title,
            description: row.description,
            size: row.size,
            status: row.status,
            price: row.price,
            source_media_ref: row.primary_media_ref,
            main_picture_url: row.main_picture_url,
            picture_urls,
            vk: VkListing {
                to_load: row.vk_requested,
                category_id: row.vk_category_id,
                published: row.vk_published,
            },
            ucoz: UcozListing {
                to_load: row.ucoz_requested,
                published: row.ucoz_published,
            },
            created_at: Some(row.created_at),
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Builds an FTS5 expression from free text: every term is case-folded,
/// quoted and matched as a prefix; all terms are required.
fn match_expression(query: &str) -> Option<String> {
    let terms = query
        .to_lowercase()
        .split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect::<Vec<_>>();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::temp_storage;
    use super::*;
    use crate::models::fixtures::product;
    use std::collections::BTreeSet;

    async fn count(storage: &Storage, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(storage.pool())
            .await
            .expect("count")
    }

    #[test]
    fn match_expression_quotes_and_folds() {
        assert_eq!(match_expression("Red CHAIR").as_deref(), Some("\"red\"* \"chair\"*"));
        assert_eq!(match_expression("say \"hi\"").as_deref(), Some("\"say\"* \"\"\"hi\"\"\"*"));
        assert_eq!(match_expression("  -- ! "), None);
    }

    #[tokio::test]
    async fn save_assigns_increasing_ids() {
        let (storage, _dir) = temp_storage().await;
        let first = storage.save(&product("Red Chair", "m1")).await.unwrap();
        let second = storage.save(&product("Blue Table", "m2")).await.unwrap();
        assert_eq!(first, 1);
        assert!(second > first);
        assert_eq!(count(&storage, "product_platform_ids").await, 2);
        assert_eq!(count(&storage, "product_media").await, 2);
    }

    #[tokio::test]
    async fn save_duplicate_media_rolls_back_everything() {
        let (storage, _dir) = temp_storage().await;
        storage.save(&product("Red Chair", "m1")).await.unwrap();

        let err = storage
            .save(&product("Another Chair", "m1"))
            .await
            .expect_err("duplicate media must fail");
        assert!(matches!(err, StorageError::DuplicateMedia(ref media) if media == "m1"));

        assert_eq!(count(&storage, "products").await, 1);
        assert_eq!(count(&storage, "product_platform_ids").await, 1);
        assert_eq!(count(&storage, "product_media").await, 1);
        assert_eq!(count(&storage, "products_fts").await, 1);
    }

    #[tokio::test]
    async fn red_chair_scenario() {
        let (storage, _dir) = temp_storage().await;
        let id = storage.save(&product("Red Chair", "m1")).await.unwrap();
        assert_eq!(id, 1);

        let before = storage.search("chair", 0, 10).await.unwrap();
        assert!(before.is_empty(), "unpublished products are not searchable");

        storage.mark_published(1, Platform::Vk, "ext-77").await.unwrap();

        let page = storage.search("chair", 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.products.len(), 1);
        let found = &page.products[0];
        assert_eq!(found.id, 1);
        assert_eq!(found.title, "Red Chair");
        assert!(found.vk.published);
        assert!(!found.ucoz.published);
        assert_eq!(found.source_media_ref, "m1");
        assert!(found.created_at.is_some());
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let (storage, _dir) = temp_storage().await;
        let id = storage.save(&product("Стул КРАСНЫЙ", "m1")).await.unwrap();
        storage.mark_published(id, Platform::Vk, "1").await.unwrap();

        for query in ["стул", "СТУЛ", "красн"] {
            let page = storage.search(query, 0, 10).await.unwrap();
            assert_eq!(page.total, 1, "query {query}");
        }
    }

    #[tokio::test]
    async fn mark_published_twice_is_rejected() {
        let (storage, _dir) = temp_storage().await;
        let id = storage.save(&product("Red Chair", "m1")).await.unwrap();
        storage.mark_published(id, Platform::Vk, "ext-1").await.unwrap();

        let err = storage
            .mark_published(id, Platform::Vk, "ext-2")
            .await
            .expect_err("second publish must fail");
        assert!(matches!(err, StorageError::DuplicateExternalId { .. }));
        assert_eq!(
            storage.resolve_external_id(id, Platform::Vk).await.unwrap(),
            "ext-1"
        );
    }

    #[tokio::test]
    async fn external_ids_are_unique_per_platform() {
        let (storage, _dir) = temp_storage().await;
        let a = storage.save(&product("Chair", "m1")).await.unwrap();
        let b = storage.save(&product("Table", "m2")).await.unwrap();
        storage.mark_published(a, Platform::Vk, "ext-1").await.unwrap();

        let err = storage.mark_published(b, Platform::Vk, "ext-1").await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateExternalId { .. }));
        assert_eq!(
            storage.platform_state(b, Platform::Vk).await.unwrap(),
            PlatformState::Pending
        );
        storage.mark_published(b, Platform::Ucoz, "ext-1").await.unwrap();
    }

    #[tokio::test]
    async fn mark_published_unknown_product_is_not_found() {
        let (storage, _dir) = temp_storage().await;
        let err = storage.mark_published(42, Platform::Vk, "x").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_external_id_paths() {
        let (storage, _dir) = temp_storage().await;
        assert!(matches!(
            storage.resolve_external_id(1, Platform::Vk).await,
            Err(StorageError::NotFound(_))
        ));

        let id = storage.save(&product("Red Chair", "m1")).await.unwrap();
        assert!(matches!(
            storage.resolve_external_id(id, Platform::Vk).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.resolve_external_ids(id).await.unwrap().is_empty());

        storage.mark_published(id, Platform::Vk, "ext-77").await.unwrap();
        assert_eq!(
            storage.resolve_external_ids(id).await.unwrap(),
            vec![(Platform::Vk, "ext-77".to_string())]
        );
    }

    #[tokio::test]
    async fn state_transitions_and_search_projection() {
        let (storage, _dir) = temp_storage().await;
        let id = storage.save(&product("Red Chair", "m1")).await.unwrap();
        assert_eq!(
            storage.platform_state(id, Platform::Vk).await.unwrap(),
            PlatformState::Pending
        );
        assert_eq!(
            storage.platform_state(id, Platform::Ucoz).await.unwrap(),
            PlatformState::NotRequested
        );

        storage.mark_published(id, Platform::Vk, "ext-77").await.unwrap();
        assert_eq!(storage.search("red", 0, 10).await.unwrap().total, 1);

        storage.mark_deleted(id, Platform::Vk).await.unwrap();
        assert_eq!(
            storage.platform_state(id, Platform::Vk).await.unwrap(),
            PlatformState::Deleted {
                external_id: "ext-77".into()
            }
        );
        assert!(storage.search("red", 0, 10).await.unwrap().is_empty());
        assert!(matches!(
            storage.resolve_external_id(id, Platform::Vk).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.mark_deleted(id, Platform::Vk).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn search_pages_cover_matches_exactly_once() {
        let (storage, _dir) = temp_storage().await;
        let mut expected = BTreeSet::new();
        for n in 0..23 {
            let id = storage
                .save(&product(&format!("Chair number {n}"), &format!("c{n}")))
                .await
                .unwrap();
            if n % 4 != 0 {
                storage
                    .mark_published(id, Platform::Vk, &format!("ext-{n}"))
                    .await
                    .unwrap();
                expected.insert(id);
            }
        }
        let unrelated = storage.save(&product("Table", "t1")).await.unwrap();
        storage.mark_published(unrelated, Platform::Vk, "ext-t").await.unwrap();

        for limit in [1, 5, 7, 100] {
            let mut seen = Vec::new();
            let mut offset = 0;
            loop {
                let page = storage.search("chair", offset, limit).await.unwrap();
                assert_eq!(page.total, expected.len() as i64);
                if page.products.is_empty() {
                    break;
                }
                assert!(page.products.len() as i64 <= limit);
                seen.extend(page.products.iter().map(|p| p.id));
                offset += limit;
            }
            assert_eq!(seen.len(), expected.len(), "limit {limit}");
            assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);
        }
    }

    #[tokio::test]
    async fn search_rejects_empty_query_and_bad_window() {
        let (storage, _dir) = temp_storage().await;
        assert!(matches!(
            storage.search("   ", 0, 10).await,
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            storage.search("chair", 0, 0).await,
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn ping_and_close() {
        let (storage, _dir) = temp_storage().await;
        storage.ping().await.unwrap();
        storage.close().await;
        assert!(storage.ping().await.is_err());
    }
}
