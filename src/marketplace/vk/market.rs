use super::VkClient;
use crate::marketplace::{ListingDraft, RemoteError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct AddResponse {
    market_item_id: i64,
}

pub(super) async fn add_item(client: &VkClient, draft: &ListingDraft) -> Result<i64, RemoteError> {
    let response: AddResponse = client
        .call("market.add", &add_params(&client.owner_id(), draft))
        .await?;
    Ok(response.market_item_id)
}

pub(super) async fn delete_item(client: &VkClient, item_id: &str) -> Result<(), RemoteError> {
    let _: i64 = client
        .call(
            "market.delete",
            &[
                ("owner_id", client.owner_id()),
                ("item_id", item_id.to_string()),
            ],
        )
        .await?;
    Ok(())
}

fn add_params(owner_id: &str, draft: &ListingDraft) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("owner_id", owner_id.to_string()),
        ("name", draft.title.clone()),
        ("description", draft.description.clone()),
        ("price", draft.price.to_string()),
        ("main_photo_id", draft.main_media.clone()),
    ];
    if let Some(category_id) = draft.category_id {
        params.push(("category_id", category_id.to_string()));
    }
    if !draft.media.is_empty() {
        params.push(("photo_ids", draft.media.join(",")));
    }
    params
}
