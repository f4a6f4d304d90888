use std::path::Path;

use chrono::{DateTime, FixedOffset};
use filetime::FileTime;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{Client, header};
use thiserror::Error;

use crate::credentials::TokenRecord;
use crate::model::{DiscoveryDocument, MediaItem, MediaItemsResponse, date_folder_name};

/// Discovery endpoint describing the Photos Library service.
pub const DISCOVERY_URL: &str =
    "https://photoslibrary.googleapis.com/$discovery/rest?version=v1";

const SERVICE_NAME: &str = "photoslibrary";
const SERVICE_VERSION: &str = "v1";

/// Items requested per list call, the maximum the service allows.
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("discovery document describes {name} {version}, not the photos library v1 service")]
    ServiceMismatch { name: String, version: String },

    #[error("the access token cannot be carried in a request header")]
    InvalidCredential,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum PageCursor {
    Start,
    Next(String),
    Done,
}

/// Authenticated session against the media library, bound to the base
/// address its discovery document advertises.
pub struct PhotosClient {
    base_address: String,
    client: Client,
}

impl PhotosClient {
    /// Build the session: the bearer credential is baked into every request
    /// and the discovery document must describe the expected service.
    pub async fn connect(
        discovery_url: &str,
        credential: &TokenRecord,
    ) -> Result<PhotosClient, ApiError> {
        let client = Self::build_client(credential)?;

        let discovery: DiscoveryDocument = client
            .get(discovery_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if discovery.name != SERVICE_NAME || discovery.version != SERVICE_VERSION {
            return Err(ApiError::ServiceMismatch {
                name: discovery.name,
                version: discovery.version,
            });
        }
        log::debug!(
            "Connected to {name} {version} at {base_address}",
            name = discovery.name,
            version = discovery.version,
            base_address = discovery.base_url
        );

        Ok(PhotosClient {
            base_address: discovery.base_url,
            client,
        })
    }

    fn build_client(credential: &TokenRecord) -> Result<Client, ApiError> {
        let mut bearer =
            header::HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
                .map_err(|_| ApiError::InvalidCredential)?;
        bearer.set_sensitive(true);

        let mut headers = header::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, bearer);

        Ok(Client::builder().default_headers(headers).build()?)
    }

    async fn list_page(&self, page_token: Option<&str>) -> Result<MediaItemsResponse, ApiError> {
        let mut request = self
            .client
            .get(format!(
                "{base_address}v1/mediaItems",
                base_address = self.base_address
            ))
            .query(&[("pageSize", PAGE_SIZE)]);
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Lazy page sequence over the whole library. A page is only requested
    /// once its predecessor has been consumed. A list failure is reported
    /// and ends the sequence, as does a page without items.
    pub fn pages(&self) -> impl Stream<Item = Vec<MediaItem>> + '_ {
        stream::unfold(PageCursor::Start, move |cursor| async move {
            let page_token = match cursor {
                PageCursor::Start => None,
                PageCursor::Next(token) => Some(token),
                PageCursor::Done => return None,
            };
            match self.list_page(page_token.as_deref()).await {
                Ok(page) => {
                    if page.media_items.is_empty() {
                        println!("No items found.");
                        return None;
                    }
                    let next = match page.next_page_token {
                        Some(token) => PageCursor::Next(token),
                        None => PageCursor::Done,
                    };
                    Some((page.media_items, next))
                }
                Err(e) => {
                    println!("An error occurred: {e}");
                    None
                }
            }
        })
    }

    /// The same sequence flattened to single items, in service order.
    #[allow(dead_code)] // download_all walks pages() for its per-page progress line
    pub fn stream_items(&self) -> impl Stream<Item = MediaItem> + '_ {
        self.pages().flat_map(stream::iter)
    }

    /// Walk the whole library, saving every item under its dated folder.
    /// Returns the number of items handled.
    pub async fn download_all(&self, output_directory: &Path) -> u64 {
        let mut total: u64 = 0;

        let pages = self.pages();
        futures::pin_mut!(pages);
        while let Some(items) = pages.next().await {
            for item in items {
                let taken_at = match item.capture_time() {
                    Ok(taken_at) => taken_at,
                    Err(e) => {
                        println!("Skipping {filename}: {e}", filename = item.filename);
                        log::warn!("No capture date for item {id}: {e}", id = item.id);
                        continue;
                    }
                };
                let folder = output_directory.join(date_folder_name(taken_at.as_ref()));
                self.save_media_item(&item, &folder, taken_at).await;
                total += 1;
            }
            println!("Downloaded {total} items so far...");
        }
        println!("All items downloaded: {total} in total.");

        total
    }

    /// Fetch one item into `folder`. Failures are reported on the console
    /// and swallowed so the rest of the export keeps moving.
    pub async fn save_media_item(
        &self,
        item: &MediaItem,
        folder: &Path,
        taken_at: Option<DateTime<FixedOffset>>,
    ) {
        if let Err(e) = self.try_save(item, folder, taken_at).await {
            match e {
                FetchError::Status(status) => println!(
                    "Failed to download {filename}: HTTP {status}",
                    filename = item.filename
                ),
                _ => {
                    println!("Error downloading {filename}: {e}", filename = item.filename);
                    log::warn!("Cannot save {filename}: {e}", filename = item.filename);
                }
            }
        }
    }

    async fn try_save(
        &self,
        item: &MediaItem,
        folder: &Path,
        taken_at: Option<DateTime<FixedOffset>>,
    ) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(folder).await?;

        let download_url = item.download_url();
        println!(
            "Downloading {filename} from {download_url}",
            filename = item.filename
        );
        let response = self.client.get(&download_url).send().await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        let filepath = folder.join(&item.filename);
        tokio::fs::write(&filepath, &bytes).await?;
        println!("Downloaded {filepath}", filepath = filepath.display());

        if let Some(taken_at) = taken_at {
            if let Err(e) =
                filetime::set_file_mtime(&filepath, FileTime::from_unix_time(taken_at.timestamp(), 0))
            {
                log::warn!("Cannot set the modification time of {}: {e}", filepath.display());
            }
        }

        Ok(())
    }
}
