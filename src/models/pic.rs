use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Candidate row produced by the migration query: one not-yet-migrated pic
/// joined with its mblog and (optionally) the producer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CandidatePicRow {
    pub pic_id: String,
    pub awsl_id: i64,
    pub pic_info: Option<String>,
    pub uid: i64,
    pub mblogid: String,
    pub re_user: Option<String>,
    pub producer_name: Option<String>,
}
