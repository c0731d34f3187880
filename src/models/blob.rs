use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One hosted image variant, either the legacy source or a storage file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

/// Size label ("original", "large") to blob mapping, stored as JSON in
/// awsl_blob_v2.pic_info.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blobs {
    pub blobs: BTreeMap<String, Blob>,
}

/// One pic selected for upload.
#[derive(Debug, Clone)]
pub struct BlobGroup {
    pub id: String,
    pub awsl_id: i64,
    pub blobs: Blobs,
}

/// All pics of one awsl_id, uploaded together with a shared caption.
#[derive(Debug, Clone)]
pub struct UploadGroup {
    pub awsl_id: i64,
    pub blob_groups: Vec<BlobGroup>,
    pub caption: String,
}

/// Photo size entry returned by the storage service.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
}
