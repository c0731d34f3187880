use sqlx::PgPool;

use crate::error::AppResult;
use crate::models::{Blob, BlobGroup, Blobs, CandidatePicRow, UploadGroup};

/// Size labels tried in priority order when picking the upload source.
const PIC_TYPES: [&str; 2] = ["original", "large"];

/// Pics skipped while building upload groups, reported once per run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterStats {
    pub json_error: usize,
    pub invalid_url: usize,
    pub no_valid_type: usize,
}

/// 移行対象のpicをawsl_id単位で取得する
///
/// The limit bounds the number of distinct awsl_id groups, not pic rows.
/// Already-migrated pics (those with an awsl_blob_v2 row) and deleted pics
/// are excluded, so re-runs never touch them again.
pub async fn fetch_upload_groups(pool: &PgPool, limit: i64) -> AppResult<Vec<UploadGroup>> {
    let rows = sqlx::query_as::<_, CandidatePicRow>(
        r#"
        SELECT p.pic_id, p.awsl_id, p.pic_info, m.uid, m.mblogid, m.re_user,
               pr.name AS producer_name
        FROM pic p
        JOIN mblog m ON p.awsl_id = m.id
        LEFT JOIN awsl_blob_v2 b ON p.pic_id = b.pic_id
        LEFT JOIN awsl_producer pr ON m.uid = pr.uid
        WHERE b.pic_id IS NULL
          AND p.deleted IS NOT TRUE
          AND p.awsl_id IN (
              SELECT p2.awsl_id
              FROM pic p2
              JOIN mblog m2 ON p2.awsl_id = m2.id
              LEFT JOIN awsl_blob_v2 b2 ON p2.pic_id = b2.pic_id
              WHERE b2.pic_id IS NULL
                AND p2.deleted IS NOT TRUE
              GROUP BY p2.awsl_id
              ORDER BY p2.awsl_id DESC
              LIMIT $1
          )
        ORDER BY p.awsl_id DESC
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let (groups, stats) = group_candidates(rows);
    tracing::info!(
        "fetch_upload_groups: {} groups (filtered pics: invalid_url={}, no_type={}, json_err={})",
        groups.len(),
        stats.invalid_url,
        stats.no_valid_type,
        stats.json_error
    );
    Ok(groups)
}

/// Groups candidate rows by awsl_id, picking one blob per pic.
///
/// Rows arrive ordered by awsl_id, so pics of the same group are adjacent
/// and groups keep the query order.
pub fn group_candidates(rows: Vec<CandidatePicRow>) -> (Vec<UploadGroup>, FilterStats) {
    let mut groups: Vec<UploadGroup> = Vec::new();
    let mut stats = FilterStats::default();

    for row in rows {
        let pic_info: serde_json::Value = match row.pic_info.as_deref() {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(value) => value,
                Err(_) => {
                    stats.json_error += 1;
                    continue;
                }
            },
            None => serde_json::Value::Null,
        };

        let mut found_valid_pic = false;
        for pic_type in PIC_TYPES {
            let Some(entry) = pic_info.get(pic_type).and_then(|e| e.as_object()) else {
                continue;
            };
            let url = entry.get("url").and_then(|u| u.as_str()).unwrap_or("");
            if url.is_empty() || url.contains(".gif") {
                stats.invalid_url += 1;
                continue;
            }

            found_valid_pic = true;
            let blob_group = BlobGroup {
                id: row.pic_id.clone(),
                awsl_id: row.awsl_id,
                blobs: Blobs {
                    blobs: [(
                        pic_type.to_string(),
                        Blob {
                            url: url.to_string(),
                            file_id: None,
                            width: entry.get("width").and_then(|v| v.as_i64()),
                            height: entry.get("height").and_then(|v| v.as_i64()),
                        },
                    )]
                    .into(),
                },
            };

            if groups.last().map_or(true, |g| g.awsl_id != row.awsl_id) {
                groups.push(UploadGroup {
                    awsl_id: row.awsl_id,
                    blob_groups: Vec::new(),
                    caption: build_caption(&row),
                });
            }
            if let Some(group) = groups.last_mut() {
                group.blob_groups.push(blob_group);
            }
            break;
        }

        if !found_valid_pic {
            stats.no_valid_type += 1;
        }
    }

    (groups, stats)
}

/// Caption format: `#screen_name https://weibo.com/{uid}/{mblogid}`.
/// The name comes from the reposted user when present, else the producer.
fn build_caption(row: &CandidatePicRow) -> String {
    let wb_url = format!("https://weibo.com/{}/{}", row.uid, row.mblogid);

    let mut screen_name = row
        .re_user
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .and_then(|v| {
            v.get("screen_name")
                .and_then(|n| n.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    if screen_name.is_empty() {
        screen_name = row.producer_name.clone().unwrap_or_default();
    }

    if screen_name.is_empty() {
        wb_url
    } else {
        format!("#{} {}", screen_name, wb_url)
    }
}

/// Persists uploaded file info for each succeeded pic.
pub async fn save_blobs(pool: &PgPool, blob_groups: &[BlobGroup]) -> AppResult<()> {
    for blob_group in blob_groups {
        let pic_info = serde_json::to_string(&blob_group.blobs)?;
        sqlx::query(
            r#"
            INSERT INTO awsl_blob_v2 (awsl_id, pic_id, pic_info)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(blob_group.awsl_id)
        .bind(&blob_group.id)
        .bind(&pic_info)
        .execute(pool)
        .await?;
        tracing::info!("Saved: pic_id={}", blob_group.id);
    }
    Ok(())
}

/// Marks every row of the pic as deleted and cleaned.
pub async fn mark_pic_deleted(pool: &PgPool, pic_id: &str) -> AppResult<()> {
    sqlx::query("UPDATE pic SET deleted = TRUE, cleaned = TRUE WHERE pic_id = $1")
        .bind(pic_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pic_id: &str, awsl_id: i64, pic_info: &str) -> CandidatePicRow {
        CandidatePicRow {
            pic_id: pic_id.to_string(),
            awsl_id,
            pic_info: Some(pic_info.to_string()),
            uid: 123,
            mblogid: "Mab12".to_string(),
            re_user: None,
            producer_name: None,
        }
    }

    #[test]
    fn test_group_candidates_picks_original_first() {
        let rows = vec![row(
            "p1",
            10,
            r#"{"original": {"url": "http://a/1.jpg", "width": 100, "height": 200},
                "large": {"url": "http://a/1l.jpg"}}"#,
        )];
        let (groups, stats) = group_candidates(rows);

        assert_eq!(groups.len(), 1);
        let blobs = &groups[0].blob_groups[0].blobs.blobs;
        assert!(blobs.contains_key("original"));
        assert!(!blobs.contains_key("large"));
        assert_eq!(blobs["original"].url, "http://a/1.jpg");
        assert_eq!(blobs["original"].width, Some(100));
        assert_eq!(stats, FilterStats::default());
    }

    #[test]
    fn test_group_candidates_falls_back_past_gif() {
        let rows = vec![row(
            "p1",
            10,
            r#"{"original": {"url": "http://a/anim.gif"},
                "large": {"url": "http://a/1l.jpg"}}"#,
        )];
        let (groups, stats) = group_candidates(rows);

        assert_eq!(groups.len(), 1);
        assert!(groups[0].blob_groups[0].blobs.blobs.contains_key("large"));
        assert_eq!(stats.invalid_url, 1);
    }

    #[test]
    fn test_group_candidates_counts_bad_json() {
        let rows = vec![
            row("p1", 10, "not json"),
            row("p2", 10, r#"{"original": {"url": "http://a/2.jpg"}}"#),
        ];
        let (groups, stats) = group_candidates(rows);

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].blob_groups.len(), 1);
        assert_eq!(stats.json_error, 1);
    }

    #[test]
    fn test_group_candidates_counts_no_valid_type() {
        let rows = vec![row("p1", 10, r#"{"thumbnail": {"url": "http://a/t.jpg"}}"#)];
        let (groups, stats) = group_candidates(rows);

        assert!(groups.is_empty());
        assert_eq!(stats.no_valid_type, 1);
    }

    #[test]
    fn test_group_candidates_groups_adjacent_rows() {
        let rows = vec![
            row("p1", 20, r#"{"original": {"url": "http://a/1.jpg"}}"#),
            row("p2", 20, r#"{"original": {"url": "http://a/2.jpg"}}"#),
            row("p3", 10, r#"{"original": {"url": "http://a/3.jpg"}}"#),
        ];
        let (groups, _) = group_candidates(rows);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].awsl_id, 20);
        assert_eq!(groups[0].blob_groups.len(), 2);
        assert_eq!(groups[1].awsl_id, 10);
        assert_eq!(groups[1].blob_groups.len(), 1);
    }

    #[test]
    fn test_build_caption_prefers_re_user() {
        let mut r = row("p1", 10, "{}");
        r.re_user = Some(r#"{"screen_name": "neko"}"#.to_string());
        r.producer_name = Some("fallback".to_string());
        assert_eq!(build_caption(&r), "#neko https://weibo.com/123/Mab12");
    }

    #[test]
    fn test_build_caption_falls_back_to_producer() {
        let mut r = row("p1", 10, "{}");
        r.re_user = Some("broken".to_string());
        r.producer_name = Some("maker".to_string());
        assert_eq!(build_caption(&r), "#maker https://weibo.com/123/Mab12");
    }

    #[test]
    fn test_build_caption_url_only() {
        let r = row("p1", 10, "{}");
        assert_eq!(build_caption(&r), "https://weibo.com/123/Mab12");
    }
}
