use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// A product listing as accepted from intake and stored locally.
///
/// `id` is `0` until [`crate::storage::Storage::save`] assigns one.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub description: String,
    pub size: String,
    pub status: String,
    pub price: i64,
    #[serde(rename = "tg_fileID")]
    pub source_media_ref: String,
    #[serde(rename = "mainPictureURL")]
    pub main_picture_url: String,
    #[serde(rename = "picturesURL", default)]
    pub picture_urls: Vec<String>,
    #[serde(default)]
    pub vk: VkListing,
    #[serde(default)]
    pub ucoz: UcozListing,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VkListing {
    #[serde(rename = "toLoad", default)]
    pub to_load: bool,
    #[serde(rename = "categoryID", default)]
    pub category_id: Option<i64>,
    /// Set from storage on reads; ignored on intake.
    #[serde(default, skip_deserializing)]
    pub published: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UcozListing {
    #[serde(rename = "toLoad", default)]
    pub to_load: bool,
    #[serde(default, skip_deserializing)]
    pub published: bool,
}

impl Product {
    /// Checks the fields intake must always provide. Returns a short reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("title", &self.title),
            ("description", &self.description),
            ("size", &self.size),
            ("status", &self.status),
            ("tg_fileID", &self.source_media_ref),
            ("mainPictureURL", &self.main_picture_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{name} is required"));
            }
        }
        if self.price <= 0 {
            return Err("price must be positive".into());
        }
        for url in std::iter::once(&self.main_picture_url)
            .chain(self.picture_urls.iter().filter(|u| !u.trim().is_empty()))
        {
            match reqwest::Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(_) => return Err(format!("unsupported_url_scheme: {url}")),
                Err(_) => return Err(format!("invalid_picture_url: {url}")),
            }
        }
        if self.vk.to_load && self.vk.category_id.is_none_or(|id| id <= 0) {
            return Err("vk.categoryID is required when publishing to vk".into());
        }
        Ok(())
    }

    pub fn requested_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|platform| platform.requested(self))
            .collect()
    }

    /// Title shown on marketplaces: the first description line wins when the
    /// description spans several lines.
    pub fn listing_title(&self) -> &str {
        match self.description.split_once('\n') {
            Some((first, _)) if !first.trim().is_empty() => first.trim(),
            _ => &self.title,
        }
    }
}

/// External marketplaces a product can be published to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Vk,
    Ucoz,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Vk, Platform::Ucoz];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Vk => "vk",
            Platform::Ucoz => "ucoz",
        }
    }

    pub fn requested(&self, product: &Product) -> bool {
        match self {
            Platform::Vk => product.vk.to_load,
            Platform::Ucoz => product.ucoz.to_load,
        }
    }

    /// Platform-specific category parameter used when building the listing.
    pub fn category(&self, product: &Product) -> Option<i64> {
        match self {
            Platform::Vk => product.vk.category_id,
            Platform::Ucoz => None,
        }
    }

    pub(crate) fn published_column(&self) -> &'static str {
        match self {
            Platform::Vk => "vk_published",
            Platform::Ucoz => "ucoz_published",
        }
    }

    pub(crate) fn external_id_column(&self) -> &'static str {
        match self {
            Platform::Vk => "vk_external_id",
            Platform::Ucoz => "ucoz_external_id",
        }
    }

    pub(crate) fn deleted_at_column(&self) -> &'static str {
        match self {
            Platform::Vk => "vk_deleted_at",
            Platform::Ucoz => "ucoz_deleted_at",
        }
    }

    pub(crate) fn requested_column(&self) -> &'static str {
        match self {
            Platform::Vk => "vk_requested",
            Platform::Ucoz => "ucoz_requested",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown platform `{0}`")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "vk" => Ok(Platform::Vk),
            "ucoz" => Ok(Platform::Ucoz),
            _ => Err(UnknownPlatform(input.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication state of one (product, platform) pair.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlatformState {
    NotRequested,
    Pending,
    Published { external_id: String },
    Deleted { external_id: String },
}

/// Work item for a platform's delete-queue. The external id is resolved when
/// the request is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub product_id: i64,
    pub platform: Platform,
    pub external_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub products: Vec<Product>,
    pub total: i64,
}

impl SearchPage {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// 1-based page over search results.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
}

impl Pagination {
    /// Row offset of the page; `None` when it does not fit in an `i64`.
    pub fn offset(&self) -> Option<i64> {
        self.page.checked_sub(1)?.checked_mul(self.limit)
    }
}

#[derive(Debug, Serialize)]
pub struct PageMeta {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub next: bool,
}

impl PageMeta {
    pub fn new(limit: i64, offset: i64, total: i64) -> Self {
        Self {
            total,
            limit,
            offset,
            next: offset.saturating_add(limit) < total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::product;
    use super::*;

    #[test]
    fn listing_title_prefers_first_description_line() {
        let mut p = product("chair", "m1");
        p.description = "Red oak chair\nbarely used, pickup only".into();
        assert_eq!(p.listing_title(), "Red oak chair");

        p.description = "single line".into();
        assert_eq!(p.listing_title(), "chair");
    }

    #[test]
    fn validate_rejects_missing_fields_and_bad_price() {
        let mut p = product("chair", "m1");
        assert!(p.validate().is_ok());

        p.price = 0;
        assert_eq!(p.validate().unwrap_err(), "price must be positive");

        let mut p = product("chair", "m1");
        p.source_media_ref = "  ".into();
        assert!(p.validate().unwrap_err().contains("tg_fileID"));

        let mut p = product("chair", "m1");
        p.main_picture_url = "ftp://example.com/a.jpg".into();
        assert!(p.validate().unwrap_err().starts_with("unsupported_url_scheme"));
    }

    #[test]
    fn validate_requires_vk_category_when_requested() {
        let mut p = product("chair", "m1");
        p.vk.category_id = None;
        assert!(p.validate().is_err());
        p.vk.to_load = false;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn intake_json_field_names() {
        let raw = serde_json::json!({
            "title": "Red Chair",
            "description": "desc",
            "size": "L",
            "status": "new",
            "price": 500,
            "tg_fileID": "m1",
            "mainPictureURL": "https://cdn.example.com/m1.jpg",
            "picturesURL": ["", "https://cdn.example.com/m2.jpg"],
            "vk": {"toLoad": true, "categoryID": 3, "published": true}
        });
        let p: Product = serde_json::from_value(raw).expect("decode");
        assert_eq!(p.source_media_ref, "m1");
        assert_eq!(p.vk.category_id, Some(3));
        assert!(!p.vk.published);
        assert_eq!(p.requested_platforms(), vec![Platform::Vk]);
    }

    #[test]
    fn page_meta_next_flag() {
        assert!(!PageMeta::new(10, 0, 10).next);
        assert!(PageMeta::new(10, 0, 11).next);
        assert!(!PageMeta::new(100, i64::MAX - 1, 5).next);
        assert_eq!(Pagination { page: 3, limit: 10 }.offset(), Some(20));
    }

    #[test]
    fn offset_overflow_is_none() {
        let huge = Pagination {
            page: i64::MAX,
            limit: 10,
        };
        assert_eq!(huge.offset(), None);
        let min = Pagination {
            page: i64::MIN,
            limit: 10,
        };
        assert_eq!(min.offset(), None);
    }

    #[test]
    fn platform_parses_case_insensitively() {
        assert_eq!(" VK ".parse::<Platform>().unwrap(), Platform::Vk);
        assert_eq!("ucoz".parse::<Platform>().unwrap(), Platform::Ucoz);
        assert!("ebay".parse::<Platform>().is_err());
    }
}
