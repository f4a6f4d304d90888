pub use chrono::{DateTime, FixedOffset};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Folder name for items whose metadata carries no usable capture time.
pub const UNKNOWN_DATE_FOLDER: &str = "unknown_date";

#[derive(Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub version: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
}

#[derive(Serialize, Deserialize)]
pub struct MediaItemsResponse {
    #[serde(rename = "mediaItems", default)]
    pub media_items: Vec<MediaItem>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub description: Option<String>,
    #[serde(rename = "productUrl")]
    pub product_url: Option<String>,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "mediaMetadata")]
    pub media_metadata: Option<MediaMetadata>,
    pub filename: String,
}

#[derive(Serialize, Deserialize)]
pub struct MediaMetadata {
    #[serde(rename = "creationTime")]
    pub creation_time: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
}

impl MediaItem {
    /// Capture timestamp from the metadata block, if the item has one.
    pub fn capture_time(&self) -> Result<Option<DateTime<FixedOffset>>, CreationTimeError> {
        let raw = self
            .media_metadata
            .as_ref()
            .and_then(|metadata| metadata.creation_time.as_deref());
        match raw {
            Some(raw) => parse_creation_time(raw).map(Some),
            None => Ok(None),
        }
    }

    /// URL serving the item at original resolution rather than a preview.
    pub fn download_url(&self) -> String {
        let base_url = &self.base_url;
        format!("{base_url}=d")
    }
}

#[derive(Debug, Error)]
#[error("unrecognized creation time {0:?}")]
pub struct CreationTimeError(pub String);

type ParseStrategy = fn(&str) -> Option<DateTime<FixedOffset>>;

/// Accepted `creationTime` layouts, tried in order. The service usually
/// sends fractional UTC timestamps but older items carry a numeric offset.
const PARSE_STRATEGIES: &[ParseStrategy] = &[parse_fractional_utc, parse_numeric_offset];

fn parse_fractional_utc(raw: &str) -> Option<DateTime<FixedOffset>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.fZ")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

fn parse_numeric_offset(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z").ok()
}

pub fn parse_creation_time(raw: &str) -> Result<DateTime<FixedOffset>, CreationTimeError> {
    PARSE_STRATEGIES
        .iter()
        .find_map(|parse| parse(raw))
        .ok_or_else(|| CreationTimeError(raw.to_string()))
}

/// Name of the per-day folder an item belongs in. The day is taken in the
/// timestamp's own offset, not converted to UTC.
pub fn date_folder_name(taken_at: Option<&DateTime<FixedOffset>>) -> String {
    match taken_at {
        Some(taken_at) => taken_at.format("%Y-%m-%d").to_string(),
        None => UNKNOWN_DATE_FOLDER.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{MediaItem, MediaItemsResponse, date_folder_name, parse_creation_time};

    #[test]
    fn fractional_utc_layout_parses() {
        let taken_at = parse_creation_time("2023-07-04T10:15:30.123456Z").unwrap();
        assert_eq!(date_folder_name(Some(&taken_at)), "2023-07-04");
    }

    #[test]
    fn whole_second_utc_layout_parses() {
        let taken_at = parse_creation_time("2023-07-04T10:15:30Z").unwrap();
        assert_eq!(date_folder_name(Some(&taken_at)), "2023-07-04");
    }

    #[test]
    fn numeric_offset_layout_parses() {
        let taken_at = parse_creation_time("2023-07-04T10:15:30+02:00").unwrap();
        assert_eq!(date_folder_name(Some(&taken_at)), "2023-07-04");
    }

    #[test]
    fn folder_day_follows_the_offset_not_utc() {
        let taken_at = parse_creation_time("2023-12-31T23:30:00-05:00").unwrap();
        assert_eq!(date_folder_name(Some(&taken_at)), "2023-12-31");
    }

    #[test]
    fn unrecognized_layout_is_an_error() {
        assert!(parse_creation_time("last Tuesday").is_err());
        assert!(parse_creation_time("2023-07-04 10:15:30").is_err());
    }

    #[test]
    fn absent_timestamp_falls_back_to_unknown_folder() {
        assert_eq!(date_folder_name(None), "unknown_date");
    }

    #[test]
    fn null_test() {
        let media_item_json = r#"
            {
                "id":"AIbEiA",
                "description":null,
                "productUrl":"https://photos.google.com/lr/photo/AIbEiA",
                "baseUrl":"https://lh3.googleusercontent.com/lr/abc123",
                "mimeType":"image/jpeg",
                "mediaMetadata":{
                    "creationTime":"2023-07-04T10:15:30.123456Z",
                    "width":"4032",
                    "height":"3024",
                    "photo":{}
                },
                "contributorInfo":null,
                "filename":"IMG_2023.jpg"
             }
            "#;
        let json_result = serde_json::from_str::<MediaItem>(media_item_json).unwrap();

        assert!(json_result.description.is_none());
        assert_eq!(json_result.filename, "IMG_2023.jpg");
        let taken_at = json_result.capture_time().unwrap().unwrap();
        assert_eq!(date_folder_name(Some(&taken_at)), "2023-07-04");
    }

    #[test]
    fn item_without_metadata_has_no_capture_time() {
        let media_item_json = r#"
            {
                "id":"AIbEiB",
                "baseUrl":"https://lh3.googleusercontent.com/lr/def456",
                "filename":"scan.png"
             }
            "#;
        let json_result = serde_json::from_str::<MediaItem>(media_item_json).unwrap();

        assert!(json_result.capture_time().unwrap().is_none());
        assert_eq!(
            date_folder_name(json_result.capture_time().unwrap().as_ref()),
            "unknown_date"
        );
    }

    #[test]
    fn metadata_without_timestamp_has_no_capture_time() {
        let media_item_json = r#"
            {
                "id":"AIbEiC",
                "baseUrl":"https://lh3.googleusercontent.com/lr/ghi789",
                "mediaMetadata":{"width":"800","height":"600"},
                "filename":"clip.mp4"
             }
            "#;
        let json_result = serde_json::from_str::<MediaItem>(media_item_json).unwrap();

        assert!(json_result.capture_time().unwrap().is_none());
    }

    #[test]
    fn unreadable_timestamp_is_surfaced_as_an_error() {
        let media_item_json = r#"
            {
                "id":"AIbEiD",
                "baseUrl":"https://lh3.googleusercontent.com/lr/jkl012",
                "mediaMetadata":{"creationTime":"July the fourth"},
                "filename":"odd.jpg"
             }
            "#;
        let json_result = serde_json::from_str::<MediaItem>(media_item_json).unwrap();

        assert!(json_result.capture_time().is_err());
    }

    #[test]
    fn download_url_requests_original_bytes() {
        let media_item_json = r#"
            {
                "id":"AIbEiE",
                "baseUrl":"https://lh3.googleusercontent.com/lr/mno345",
                "filename":"IMG_0001.jpg"
             }
            "#;
        let json_result = serde_json::from_str::<MediaItem>(media_item_json).unwrap();

        assert_eq!(
            json_result.download_url(),
            "https://lh3.googleusercontent.com/lr/mno345=d"
        );
    }

    #[test]
    fn page_without_items_deserializes_empty() {
        let page: MediaItemsResponse = serde_json::from_str("{}").unwrap();

        assert!(page.media_items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn page_with_items_keeps_service_order() {
        let page_json = r#"
            {
                "mediaItems":[
                    {"id":"first","baseUrl":"https://example/1","filename":"a.jpg"},
                    {"id":"second","baseUrl":"https://example/2","filename":"b.jpg"}
                ],
                "nextPageToken":"token-2"
            }
            "#;
        let page: MediaItemsResponse = serde_json::from_str(page_json).unwrap();

        assert_eq!(page.media_items.len(), 2);
        assert_eq!(page.media_items[0].id, "first");
        assert_eq!(page.media_items[1].id, "second");
        assert_eq!(page.next_page_token.as_deref(), Some("token-2"));
    }
}
