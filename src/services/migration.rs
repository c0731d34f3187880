use std::time::Duration;

use sqlx::PgPool;

use crate::config::Config;
use crate::db;
use crate::error::AppResult;
use crate::models::{BlobGroup, UploadGroup};
use crate::storage::StorageClient;

/// Pause between groups to stay under the storage service's rate limits.
const UPLOAD_DELAY: f64 = 3.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSummary {
    pub success: usize,
    pub fail: usize,
    pub total: usize,
}

/// Runs one bounded migration pass over the candidate groups.
pub struct MigrationRunner {
    pool: PgPool,
    storage: StorageClient,
    migration_limit: i64,
    enable_delete: bool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool, storage: StorageClient, config: &Config) -> Self {
        Self {
            pool,
            storage,
            migration_limit: config.migration_limit,
            enable_delete: config.enable_delete,
        }
    }

    /// 移行処理のエントリポイント
    pub async fn run(&self) -> AppResult<MigrationSummary> {
        let groups = db::fetch_upload_groups(&self.pool, self.migration_limit).await?;
        let mut summary = MigrationSummary {
            total: groups.len(),
            ..Default::default()
        };

        tracing::info!("Starting migration: {} groups to process", summary.total);

        for (idx, group) in groups.iter().enumerate() {
            tracing::info!(
                "Processing group {}/{} (awsl_id={})",
                idx + 1,
                summary.total,
                group.awsl_id
            );
            match self.upload_group_to_telegram(group).await {
                Ok(true) => summary.success += 1,
                Ok(false) => summary.fail += 1,
                Err(e) => {
                    tracing::error!(
                        "Error uploading group {}/{} (awsl_id={}): {}",
                        idx + 1,
                        summary.total,
                        group.awsl_id,
                        e
                    );
                    self.delete_upload_group(group).await;
                    summary.fail += 1;
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(UPLOAD_DELAY)).await;
        }

        tracing::info!(
            "Migration completed: success={}, fail={}, total={}",
            summary.success,
            summary.fail,
            summary.total
        );
        Ok(summary)
    }

    /// Uploads one group, persisting partial success: succeeded pics get an
    /// awsl_blob_v2 row, failed pics are deleted (when enabled).
    async fn upload_group_to_telegram(&self, group: &UploadGroup) -> AppResult<bool> {
        let outcome = self.storage.upload_media_group(group).await?;

        if !outcome.succeeded.is_empty() {
            db::save_blobs(&self.pool, &outcome.succeeded).await?;
            tracing::info!(
                "Saved {} succeeded pics for awsl_id={}",
                outcome.succeeded.len(),
                group.awsl_id
            );
        }

        if !outcome.failed.is_empty() {
            for blob_group in &outcome.failed {
                self.delete_pic(blob_group).await?;
            }
            tracing::warn!(
                "Deleted {} failed pics for awsl_id={}",
                outcome.failed.len(),
                group.awsl_id
            );
        }

        if outcome.succeeded.is_empty() {
            tracing::error!("All pics failed for awsl_id={}", group.awsl_id);
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Deletes the pic rows only when deletion is enabled.
    async fn delete_pic(&self, blob_group: &BlobGroup) -> AppResult<()> {
        if !self.enable_delete {
            tracing::info!("Delete disabled, skipping pic_id={}", blob_group.id);
            return Ok(());
        }
        db::mark_pic_deleted(&self.pool, &blob_group.id).await
    }

    /// Deletes every pic of a group that errored out entirely.
    async fn delete_upload_group(&self, group: &UploadGroup) {
        if !self.enable_delete {
            tracing::info!("Delete disabled, skipping awsl_id={}", group.awsl_id);
            return;
        }
        for blob_group in &group.blob_groups {
            if let Err(e) = db::mark_pic_deleted(&self.pool, &blob_group.id).await {
                tracing::error!("Failed to delete pic_id={}: {}", blob_group.id, e);
            }
        }
        tracing::info!("Deleted all pics for awsl_id={}", group.awsl_id);
    }
}
