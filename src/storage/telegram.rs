use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use reqwest::multipart;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Blob, BlobGroup, Blobs, TelegramFile, UploadGroup};

/// Telegram media groups accept at most 6 photos per request.
const BATCH_SIZE: usize = 6;
const MAX_RETRIES: u32 = 10;
const RETRY_DELAY: f64 = 5.0;
/// Delay between individual image retries
const INDIVIDUAL_RETRY_DELAY: f64 = 3.0;

/// Result of uploading one group: blob groups split by outcome.
#[derive(Debug)]
pub struct UploadOutcome {
    pub succeeded: Vec<BlobGroup>,
    pub failed: Vec<BlobGroup>,
}

/// One batch attempt; `files` is None when every retry failed.
#[derive(Debug)]
struct BatchUpload {
    files: Option<Vec<Vec<TelegramFile>>>,
    webpage_media_empty: bool,
}

#[derive(Debug, Serialize)]
struct GroupUploadRequest<'a> {
    urls: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GroupUploadResponse {
    #[serde(default)]
    success: bool,
    error: Option<String>,
    #[serde(default)]
    files: Vec<Vec<TelegramFile>>,
}

#[derive(Debug, Deserialize)]
struct DocumentUploadResponse {
    #[serde(default)]
    success: bool,
    error: Option<String>,
    #[serde(default)]
    files: Vec<TelegramFile>,
}

/// awsl-telegram-storageサービスのHTTPクライアント
pub struct StorageClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    chat_id: Option<String>,
}

impl StorageClient {
    pub fn new(config: &Config) -> AppResult<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            base_url: config.storage_url.trim_end_matches('/').to_string(),
            api_token: config.storage_api_token.clone(),
            chat_id: config.storage_chat_id.clone(),
        })
    }

    /// Final URL for accessing a file via awsl-telegram-storage.
    pub fn file_url(&self, file_id: &str) -> String {
        format!("{}/file/{}", self.base_url, file_id)
    }

    /// Uploads the photos of one group, splitting into batches of 6.
    /// On WEBPAGE_MEDIA_EMPTY the batch is retried image by image, with a
    /// document upload as the last resort.
    pub async fn upload_media_group(&self, group: &UploadGroup) -> AppResult<UploadOutcome> {
        if group.blob_groups.is_empty() {
            return Err(AppError::Storage("at least 1 blob group required".into()));
        }

        let urls: Vec<String> = group
            .blob_groups
            .iter()
            .map(|bg| {
                bg.blobs
                    .blobs
                    .values()
                    .next()
                    .map(|b| b.url.clone())
                    .ok_or_else(|| {
                        AppError::Storage(format!("blob group {} has no blobs", bg.id))
                    })
            })
            .collect::<AppResult<_>>()?;

        let mut all_files: Vec<Option<Vec<TelegramFile>>> = Vec::with_capacity(urls.len());

        for batch_urls in urls.chunks(BATCH_SIZE) {
            let batch_result = self.upload_batch(batch_urls, &group.caption).await;

            if let Some(files) = batch_result.files {
                all_files.extend(files.into_iter().map(Some));
            } else if batch_result.webpage_media_empty {
                tracing::info!(
                    "WEBPAGE_MEDIA_EMPTY detected, retrying batch of {} images individually",
                    batch_urls.len()
                );
                for (i, url) in batch_urls.iter().enumerate() {
                    let single = self
                        .upload_batch(std::slice::from_ref(url), &group.caption)
                        .await;
                    let first = single.files.and_then(|mut f| {
                        if f.is_empty() {
                            None
                        } else {
                            Some(f.remove(0))
                        }
                    });
                    match first {
                        Some(files) => {
                            all_files.push(Some(files));
                            tracing::info!(
                                "Successfully uploaded image {}/{} as photo",
                                i + 1,
                                batch_urls.len()
                            );
                        }
                        None => {
                            tracing::info!(
                                "Photo upload failed for image {}/{}, trying as document: {}",
                                i + 1,
                                batch_urls.len(),
                                url
                            );
                            match self.upload_as_document(url).await {
                                Some(files) => {
                                    all_files.push(Some(files));
                                    tracing::info!(
                                        "Successfully uploaded image {}/{} as document",
                                        i + 1,
                                        batch_urls.len()
                                    );
                                }
                                None => {
                                    all_files.push(None);
                                    tracing::warn!(
                                        "Failed to upload image {}/{} (both photo and document): {}",
                                        i + 1,
                                        batch_urls.len(),
                                        url
                                    );
                                }
                            }
                        }
                    }
                    if i < batch_urls.len() - 1 {
                        sleep_secs(INDIVIDUAL_RETRY_DELAY).await;
                    }
                }
            } else {
                tracing::error!(
                    "Batch upload failed with non-WEBPAGE_MEDIA_EMPTY error, marking all as failed"
                );
                all_files.extend(std::iter::repeat_with(|| None).take(batch_urls.len()));
            }
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (blob_group, files) in group.blob_groups.iter().zip(all_files) {
            match files {
                Some(files) => succeeded.push(BlobGroup {
                    id: blob_group.id.clone(),
                    awsl_id: blob_group.awsl_id,
                    blobs: self.files_to_blobs(&files),
                }),
                None => {
                    tracing::warn!("Failed blob_group: pic_id={}", blob_group.id);
                    failed.push(blob_group.clone());
                }
            }
        }

        tracing::info!(
            "Upload result: {} succeeded, {} failed",
            succeeded.len(),
            failed.len()
        );
        Ok(UploadOutcome { succeeded, failed })
    }

    /// Uploads a single batch of URLs (max 6) with retry.
    async fn upload_batch(&self, urls: &[String], caption: &str) -> BatchUpload {
        let api_url = format!("{}/api/upload/group", self.base_url);
        let payload = GroupUploadRequest {
            urls,
            caption: (!caption.is_empty()).then_some(caption),
            chat_id: self.chat_id.as_deref(),
        };

        let mut last_error = String::new();
        for attempt in 1..=MAX_RETRIES {
            let response = self
                .client
                .post(&api_url)
                .header("X-Api-Token", &self.api_token)
                .json(&payload)
                .send()
                .await;

            let data: GroupUploadResponse = match response {
                Ok(resp) => match resp.json().await {
                    Ok(data) => data,
                    Err(e) => {
                        last_error = format!("Invalid JSON response: {}", e);
                        tracing::warn!(
                            "JSON parse failed (attempt {}/{}): {}",
                            attempt,
                            MAX_RETRIES,
                            last_error
                        );
                        sleep_secs(RETRY_DELAY * attempt as f64).await;
                        continue;
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}",
                        attempt,
                        MAX_RETRIES,
                        last_error
                    );
                    sleep_secs(RETRY_DELAY * attempt as f64).await;
                    continue;
                }
            };

            if !data.success {
                last_error = data.error.unwrap_or_else(|| "Unknown error".to_string());
                if last_error.contains("WEBPAGE_MEDIA_EMPTY") {
                    tracing::warn!("WEBPAGE_MEDIA_EMPTY detected: {}", last_error);
                    return BatchUpload {
                        files: None,
                        webpage_media_empty: true,
                    };
                }
                if is_rate_limited(&last_error) {
                    let delay =
                        parse_retry_after(&last_error).unwrap_or(RETRY_DELAY * attempt as f64);
                    tracing::warn!(
                        "Upload rate limited (attempt {}/{}), sleeping for {:.1}s: {}",
                        attempt,
                        MAX_RETRIES,
                        delay,
                        last_error
                    );
                    sleep_secs(delay).await;
                } else {
                    tracing::warn!(
                        "Upload failed (attempt {}/{}): {}",
                        attempt,
                        MAX_RETRIES,
                        last_error
                    );
                    sleep_secs(RETRY_DELAY * attempt as f64).await;
                }
                continue;
            }

            tracing::info!("Uploaded {} images to Telegram", data.files.len());
            return BatchUpload {
                files: Some(data.files),
                webpage_media_empty: false,
            };
        }

        tracing::error!("Upload failed after {} attempts: {}", MAX_RETRIES, last_error);
        BatchUpload {
            files: None,
            webpage_media_empty: false,
        }
    }

    /// Uploads a single image as a document (fallback when the photo upload
    /// keeps failing). Only rate-limit errors are retried.
    async fn upload_as_document(&self, url: &str) -> Option<Vec<TelegramFile>> {
        let api_url = format!("{}/api/upload", self.base_url);

        let Some(image_data) = self.download_image(url).await else {
            tracing::warn!("Cannot download image, skipping document upload");
            return None;
        };

        for attempt in 1..=MAX_RETRIES {
            let part = match multipart::Part::bytes(image_data.clone())
                .file_name("image.jpg")
                .mime_str("image/jpeg")
            {
                Ok(part) => part,
                Err(e) => {
                    tracing::warn!("Failed to build multipart body: {}", e);
                    return None;
                }
            };
            let mut form = multipart::Form::new()
                .part("file", part)
                .text("media_type", "document");
            if let Some(chat_id) = &self.chat_id {
                form = form.text("chat_id", chat_id.clone());
            }

            let response = match self
                .client
                .post(&api_url)
                .header("X-Api-Token", &self.api_token)
                .multipart(form)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!("Document upload request failed: {}", e);
                    return None;
                }
            };

            let data: DocumentUploadResponse = match response.json().await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Document upload JSON parse failed: {}", e);
                    return None;
                }
            };

            if !data.success {
                let error = data.error.unwrap_or_else(|| "Unknown error".to_string());
                if is_rate_limited(&error) {
                    let delay = parse_retry_after(&error).unwrap_or(RETRY_DELAY * attempt as f64);
                    tracing::warn!(
                        "Document upload rate limited (attempt {}/{}), sleeping for {:.1}s: {}",
                        attempt,
                        MAX_RETRIES,
                        delay,
                        error
                    );
                    sleep_secs(delay).await;
                    continue;
                }
                tracing::warn!("Document upload failed (non-retriable): {}", error);
                return None;
            }

            tracing::info!("Successfully uploaded as document");
            return Some(data.files);
        }

        tracing::error!(
            "Document upload failed after {} rate limit retries",
            MAX_RETRIES
        );
        None
    }

    /// Downloads the image into memory so it can be re-sent as multipart.
    async fn download_image(&self, url: &str) -> Option<Vec<u8>> {
        tracing::info!("Downloading image: {}", url);
        let result = async {
            let resp = self
                .client
                .get(url)
                .timeout(Duration::from_secs(30))
                .send()
                .await?;
            resp.error_for_status()?.bytes().await
        }
        .await;

        match result {
            Ok(bytes) => {
                tracing::info!("Downloaded {} bytes", bytes.len());
                Some(bytes.to_vec())
            }
            Err(e) => {
                tracing::warn!("Failed to download image: {}", e);
                None
            }
        }
    }

    /// Maps returned photo sizes to the stored blobs: the largest becomes
    /// "original", the first over 800 px becomes "large".
    fn files_to_blobs(&self, files: &[TelegramFile]) -> Blobs {
        let mut blobs = BTreeMap::new();
        if let Some(original) = get_largest_file(files) {
            blobs.insert("original".to_string(), self.file_to_blob(original));
        }
        if let Some(large) = get_first_file_over_800(files) {
            blobs.insert("large".to_string(), self.file_to_blob(large));
        }
        Blobs { blobs }
    }

    fn file_to_blob(&self, file: &TelegramFile) -> Blob {
        Blob {
            url: self.file_url(&file.file_id),
            file_id: Some(file.file_id.clone()),
            width: file.width,
            height: file.height,
        }
    }
}

/// Largest photo size by area; falls back to the last entry when no size
/// carries dimensions.
fn get_largest_file(files: &[TelegramFile]) -> Option<&TelegramFile> {
    files
        .iter()
        .filter_map(|f| match (f.width, f.height) {
            (Some(w), Some(h)) => Some((w * h, f)),
            _ => None,
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, f)| f)
        .or_else(|| files.last())
}

/// First photo size exceeding 800 pixels in either dimension.
fn get_first_file_over_800(files: &[TelegramFile]) -> Option<&TelegramFile> {
    files
        .iter()
        .find(|f| f.width.is_some_and(|w| w > 800) || f.height.is_some_and(|h| h > 800))
        .or_else(|| files.last())
}

fn is_rate_limited(error: &str) -> bool {
    error.contains("Too Many Requests") || error.to_lowercase().contains("retry after")
}

/// Parses "retry after N" out of an error message, e.g.
/// "Too Many Requests: retry after 16" -> 16.0.
fn parse_retry_after(error_msg: &str) -> Option<f64> {
    let re = Regex::new(r"(?i)retry after\s+(\d+(?:\.\d+)?)").ok()?;
    re.captures(error_msg)?.get(1)?.as_str().parse().ok()
}

async fn sleep_secs(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> StorageClient {
        StorageClient::new(&Config {
            db_url: "postgres://localhost/test".to_string(),
            migration_limit: 100,
            storage_url: "https://storage.example.com/".to_string(),
            storage_api_token: "token".to_string(),
            storage_chat_id: None,
            enable_delete: false,
        })
        .unwrap()
    }

    fn file(file_id: &str, width: Option<i64>, height: Option<i64>) -> TelegramFile {
        TelegramFile {
            file_id: file_id.to_string(),
            width,
            height,
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(
            parse_retry_after("Too Many Requests: retry after 16"),
            Some(16.0)
        );
        assert_eq!(parse_retry_after("retry after 5.5 seconds"), Some(5.5));
        assert_eq!(parse_retry_after("Retry After 3"), Some(3.0));
        assert_eq!(parse_retry_after("some other error"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn test_is_rate_limited() {
        assert!(is_rate_limited("Too Many Requests: retry after 16"));
        assert!(is_rate_limited("please RETRY AFTER 5"));
        assert!(!is_rate_limited("WEBPAGE_MEDIA_EMPTY"));
    }

    #[test]
    fn test_get_largest_file_by_area() {
        let files = vec![
            file("small", Some(90), Some(60)),
            file("big", Some(1200), Some(900)),
            file("mid", Some(800), Some(600)),
        ];
        assert_eq!(get_largest_file(&files).map(|f| f.file_id.as_str()), Some("big"));
    }

    #[test]
    fn test_get_largest_file_without_dimensions() {
        let files = vec![file("a", None, None), file("b", None, Some(10))];
        assert_eq!(get_largest_file(&files).map(|f| f.file_id.as_str()), Some("b"));
        assert!(get_largest_file(&[]).is_none());
    }

    #[test]
    fn test_get_first_file_over_800() {
        let files = vec![
            file("small", Some(90), Some(60)),
            file("tall", Some(600), Some(900)),
            file("big", Some(1200), Some(900)),
        ];
        assert_eq!(
            get_first_file_over_800(&files).map(|f| f.file_id.as_str()),
            Some("tall")
        );

        let none_over = vec![file("a", Some(100), Some(100))];
        assert_eq!(
            get_first_file_over_800(&none_over).map(|f| f.file_id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn test_file_url_strips_trailing_slash() {
        let client = test_client();
        assert_eq!(
            client.file_url("abc123"),
            "https://storage.example.com/file/abc123"
        );
    }

    #[test]
    fn test_files_to_blobs_labels() {
        let client = test_client();
        let files = vec![
            file("small", Some(90), Some(60)),
            file("tall", Some(600), Some(900)),
            file("big", Some(1200), Some(900)),
        ];
        let blobs = client.files_to_blobs(&files).blobs;

        assert_eq!(blobs["original"].file_id.as_deref(), Some("big"));
        assert_eq!(blobs["large"].file_id.as_deref(), Some("tall"));
        assert_eq!(
            blobs["original"].url,
            "https://storage.example.com/file/big"
        );
    }
}
