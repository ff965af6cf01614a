//! Google Photos Library API destination.
//!
//! Uploading is two calls: the raw bytes go to `v1/uploads` for an upload
//! token, which `mediaItems:batchCreate` turns into a media item. Albums are
//! looked up by title among app-created albums and created when missing.

use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{AdapterError, CollectionHandle, CredentialProvider, DestinationAdapter, ItemMetadata};

const API_BASE: &str = "https://photoslibrary.googleapis.com/v1/";
const ALBUM_PAGE_SIZE: &str = "50";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Album {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumPage {
    #[serde(default)]
    albums: Vec<Album>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCreateResponse {
    #[serde(default)]
    new_media_item_results: Vec<MediaItemResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItemResult {
    status: Option<ItemStatus>,
    media_item: Option<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct ItemStatus {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MediaItem {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewMediaItem<'a> {
    description: &'a str,
    simple_media_item: SimpleMediaItem<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimpleMediaItem<'a> {
    upload_token: &'a str,
    file_name: &'a str,
}

pub struct GooglePhotosDestination {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    base: String,
}

impl GooglePhotosDestination {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_base_url(credentials, API_BASE)
    }

    /// `base` must end with a slash.
    pub fn with_base_url(credentials: Arc<dyn CredentialProvider>, base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            credentials,
            base: base.into(),
        }
    }

    // Plain concatenation: `Url::join` would read `mediaItems:` as a scheme.
    fn endpoint(&self, path: &str) -> Result<Url, AdapterError> {
        Url::parse(&format!("{}{path}", self.base))
            .map_err(|e| AdapterError::permanent(format!("Bad endpoint {path}: {e}")))
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response, AdapterError> {
        let token = self.credentials.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, %body, context, "Google Photos request failed");
            Err(AdapterError::from_status(status, context))
        }
    }

    async fn find_album(&self, title: &str) -> Result<Option<Album>, AdapterError> {
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint("albums")?;
            url.query_pairs_mut()
                .append_pair("pageSize", ALBUM_PAGE_SIZE)
                .append_pair("excludeNonAppCreatedData", "true");
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let page: AlbumPage = self
                .send(self.client.get(url), "List albums")
                .await?
                .json()
                .await?;
            if let Some(album) = page.albums.into_iter().find(|album| album.title == title) {
                return Ok(Some(album));
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(None),
            }
        }
    }
}

#[async_trait::async_trait]
impl DestinationAdapter for GooglePhotosDestination {
    #[tracing::instrument(skip(self, bytes), fields(source_id = %metadata.source_id, size = bytes.len()))]
    async fn upload(
        &self,
        bytes: Vec<u8>,
        metadata: &ItemMetadata,
    ) -> Result<String, AdapterError> {
        let mime_type = metadata
            .mime_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let request = self
            .client
            .post(self.endpoint("uploads")?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("X-Goog-Upload-Content-Type", mime_type)
            .header("X-Goog-Upload-File-Name", metadata.file_name.as_str())
            .header("X-Goog-Upload-Protocol", "raw")
            .body(bytes);
        let upload_token = self.send(request, "Upload bytes").await?.text().await?;
        if upload_token.is_empty() {
            return Err(AdapterError::transient("Empty upload token"));
        }

        let item = NewMediaItem {
            description: "",
            simple_media_item: SimpleMediaItem {
                upload_token: &upload_token,
                file_name: &metadata.file_name,
            },
        };
        let request = self
            .client
            .post(self.endpoint("mediaItems:batchCreate")?)
            .json(&json!({ "newMediaItems": [item] }));
        let response: BatchCreateResponse = self
            .send(request, "Create media item")
            .await?
            .json()
            .await?;

        let result = response
            .new_media_item_results
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::transient("batchCreate returned no results"))?;
        match result.media_item {
            Some(media_item) => Ok(media_item.id),
            None => Err(AdapterError::permanent(format!(
                "Media item rejected: {}",
                result.status.map(|s| s.message).unwrap_or_default()
            ))),
        }
    }

    async fn ensure_collection(&self, name: &str) -> Result<CollectionHandle, AdapterError> {
        let album = match self.find_album(name).await? {
            Some(album) => album,
            None => {
                tracing::info!(title = name, "Creating album");
                let request = self
                    .client
                    .post(self.endpoint("albums")?)
                    .json(&json!({ "album": { "title": name } }));
                self.send(request, "Create album").await?.json().await?
            }
        };
        Ok(CollectionHandle {
            id: album.id,
            name: name.to_string(),
        })
    }

    async fn add_to_collection(
        &self,
        destination_id: &str,
        collection: &CollectionHandle,
    ) -> Result<(), AdapterError> {
        let path = format!("albums/{}:batchAddMediaItems", collection.id);
        let request = self
            .client
            .post(self.endpoint(&path)?)
            .json(&json!({ "mediaItemIds": [destination_id] }));
        self.send(request, "Add to album").await?;
        Ok(())
    }
}
