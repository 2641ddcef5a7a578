use super::VkClient;
use crate::marketplace::RemoteError;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct UploadServer {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadedPhoto {
    server: i64,
    #[serde(default)]
    photo: String,
    hash: String,
    #[serde(default)]
    crop_data: Option<String>,
    #[serde(default)]
    crop_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SavedPhoto {
    id: i64,
}

/// Three-step VK upload: fetch an upload url, post the file there, then
/// register the uploaded photo with the community.
pub(super) async fn upload_market_photo(
    client: &VkClient,
    image: Bytes,
    main: bool,
) -> Result<i64, RemoteError> {
    let server: UploadServer = client
        .call(
            "photos.getMarketUploadServer",
            &[
                ("group_id", client.group_id.to_string()),
                ("main_photo", if main { "1" } else { "0" }.to_string()),
            ],
        )
        .await?;

    let part = Part::bytes(image.to_vec())
        .file_name("photo.jpg")
        .mime_str("image/jpeg")?;
    let response = client
        .http
        .post(&server.upload_url)
        .multipart(Form::new().part("file", part))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(RemoteError::Status(response.status().as_u16()));
    }
    let uploaded: UploadedPhoto = response.json().await?;

    let saved: Vec<SavedPhoto> = client
        .call("photos.saveMarketPhoto", &save_params(client.group_id, uploaded)?)
        .await?;
    saved
        .first()
        .map(|photo| photo.id)
        .ok_or_else(|| RemoteError::Decode("photos.saveMarketPhoto returned no photo".into()))
}

fn save_params(
    group_id: i64,
    uploaded: UploadedPhoto,
) -> Result<Vec<(&'static str, String)>, RemoteError> {
    if uploaded.photo.is_empty() || uploaded.photo == "[]" {
        return Err(RemoteError::Decode("upload server accepted no photo".into()));
    }
    let mut params = vec![
        ("group_id", group_id.to_string()),
        ("photo", uploaded.photo),
        ("server", uploaded.server.to_string()),
        ("hash", uploaded.hash),
    ];
    if let Some(crop_data) = uploaded.crop_data {
        params.push(("crop_data", crop_data));
    }
    if let Some(crop_hash) = uploaded.crop_hash {
        params.push(("crop_hash", crop_hash));
    }
    Ok(params)
}
