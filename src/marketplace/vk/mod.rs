//! VK market client: photo upload, item creation and deletion over the VK
//! HTTP API.

pub mod config;
mod market;
mod photos;

use crate::marketplace::{ListingDraft, Marketplace, MediaId, RemoteError};
use async_trait::async_trait;
use bytes::Bytes;
use config::API_ROOT;
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VkClient {
    http: Client,
    token: String,
    group_id: i64,
    version: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: Option<T>,
    error: Option<VkApiError>,
}

#[derive(Debug, Deserialize)]
struct VkApiError {
    error_code: i64,
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct ProfileInfo {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
}

impl VkClient {
    pub fn new(http: Client, token: String, group_id: i64, version: String) -> Self {
        Self {
            http,
            token,
            group_id,
            version,
        }
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    /// Market items belong to the community, which VK addresses by negative id.
    fn owner_id(&self) -> String {
        (-self.group_id).to_string()
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&'static str, String)],
    ) -> Result<T, RemoteError> {
        let url = format!("{}/{method}", *API_ROOT);
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("access_token", self.token.clone()));
        form.push(("v", self.version.clone()));

        let response = self.http.post(url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status(response.status().as_u16()));
        }
        let envelope: Envelope<T> = response.json().await?;
        debug!(target = "relay.vk", method, "vk call completed");
        unwrap_envelope(envelope)
    }

    /// Display name of the account behind the token.
    pub async fn account_name(&self) -> Result<String, RemoteError> {
        let info: ProfileInfo = self.call("account.getProfileInfo", &[]).await?;
        Ok(format!("{} {}", info.first_name, info.last_name)
            .trim()
            .to_string())
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, RemoteError> {
    match envelope {
        Envelope {
            error: Some(error), ..
        } => Err(RemoteError::Rejected {
            code: error.error_code,
            message: error.error_msg,
        }),
        Envelope {
            response: Some(response),
            ..
        } => Ok(response),
        _ => Err(RemoteError::Decode("empty vk response".into())),
    }
}

#[async_trait]
impl Marketplace for VkClient {
    async fn upload_media(&self, image: Bytes, primary: bool) -> Result<MediaId, RemoteError> {
        photos::upload_market_photo(self, image, primary)
            .await
            .map(|id| id.to_string())
    }

    async fn create_listing(&self, draft: &ListingDraft) -> Result<String, RemoteError> {
        market::add_item(self, draft).await.map(|id| id.to_string())
    }

    async fn delete_listing(&self, external_id: &str) -> Result<(), RemoteError> {
        market::delete_item(self, external_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_error_becomes_rejection() {
        let envelope: Envelope<i64> = serde_json::from_value(json!({
            "error": {"error_code": 15, "error_msg": "Access denied", "request_params": []}
        }))
        .unwrap();
        match unwrap_envelope(envelope) {
            Err(RemoteError::Rejected { code, message }) => {
                assert_eq!(code, 15);
                assert_eq!(message, "Access denied");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn envelope_response_and_empty() {
        let envelope: Envelope<i64> = serde_json::from_value(json!({"response": 1})).unwrap();
        assert_eq!(unwrap_envelope(envelope).unwrap(), 1);

        let envelope: Envelope<i64> = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(unwrap_envelope(envelope), Err(RemoteError::Decode(_))));
    }

    #[test]
    fn owner_id_is_negative_group() {
        let client = VkClient::new(Client::new(), "t".into(), 4242, "5.199".into());
        assert_eq!(client.owner_id(), "-4242");
        assert_eq!(client.group_id(), 4242);
    }
}
