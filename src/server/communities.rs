use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::common::models::{Community, GeoPoint, Visibility};
use crate::server::database::Database;
use crate::server::embedding::EmbeddingProvider;
use crate::server::error::ServiceError;
use crate::server::geo::haversine_m;

pub const TRENDING_LIMIT: usize = 20;
pub const NEARBY_LIMIT: usize = 20;
const MAX_TAGS: usize = 10;

// Activity score blend, recomputed periodically: membership weighs less than
// fresh pod creation.
const ACTIVITY_MEMBER_WEIGHT: f64 = 0.3;
const ACTIVITY_POD_WEIGHT: f64 = 0.7;

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn dt(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

pub fn community_from_row(row: &SqliteRow) -> Community {
    let tags: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("tags")).unwrap_or_default();
    let embedding: Vec<f32> = row
        .get::<Option<String>, _>("embedding")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Community {
        id: row.get("id"),
        name: row.get("name"),
        tags,
        description: row.get("description"),
        visibility: Visibility::parse(&row.get::<String, _>("visibility"))
            .unwrap_or(Visibility::Global),
        geo: GeoPoint::new(row.get("lng"), row.get("lat")),
        admin_ip: row.get("admin_ip"),
        embedding,
        members_count: row.get("members_count"),
        activity_score: row.get("activity_score"),
        created_by: row.get("created_by"),
        created_at: dt(row.get("created_at")),
        last_active: dt(row.get("last_active")),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn create_community(
    db: Arc<Database>,
    embedder: &dyn EmbeddingProvider,
    user_id: &str,
    name: &str,
    tags: &[String],
    description: &str,
    visibility: Visibility,
    geo: GeoPoint,
    admin_ip: Option<&str>,
) -> Result<Community, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::InvalidInput("community name is empty".into()));
    }
    if description.trim().is_empty() {
        return Err(ServiceError::InvalidInput("description is empty".into()));
    }
    let tags: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if tags.is_empty() || tags.len() > MAX_TAGS {
        return Err(ServiceError::InvalidInput(format!(
            "expected 1-{} tags, got {}",
            MAX_TAGS,
            tags.len()
        )));
    }

    // Embedding is computed server-side from the searchable text. On provider
    // unavailability the community is created without one and can still be
    // found by keyword and fuzzy signals.
    let embed_text = format!("{} {} {}", name, tags.join(" "), description);
    let embedding = embedder.embed(&embed_text).await.unwrap_or_default();
    if embedding.is_empty() {
        warn!("[COMMUNITY] No embedding for '{}' (provider unavailable)", name);
    }

    let now = Utc::now();
    let community = Community {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        tags,
        description: description.trim().to_string(),
        visibility,
        geo,
        admin_ip: admin_ip.map(|s| s.to_string()),
        embedding,
        members_count: 1,
        activity_score: 0.0,
        created_by: Some(user_id.to_string()),
        created_at: now,
        last_active: now,
    };

    sqlx::query(
        "INSERT INTO communities \
         (id, name, tags, description, visibility, lng, lat, admin_ip, embedding, \
          members_count, activity_score, created_by, created_at, last_active) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&community.id)
    .bind(&community.name)
    .bind(serde_json::to_string(&community.tags).unwrap_or_else(|_| "[]".into()))
    .bind(&community.description)
    .bind(community.visibility.as_str())
    .bind(community.geo.lng)
    .bind(community.geo.lat)
    .bind(&community.admin_ip)
    .bind(serde_json::to_string(&community.embedding).ok())
    .bind(community.members_count)
    .bind(community.activity_score)
    .bind(&community.created_by)
    .bind(ts(community.created_at))
    .bind(ts(community.last_active))
    .execute(&db.pool)
    .await
    .map_err(|e| {
        warn!("[COMMUNITY] Error creating community '{}': {}", name, e);
        ServiceError::InvalidInput(format!("could not persist community: {}", e))
    })?;

    info!("[COMMUNITY] '{}' created by {} ({})", community.name, user_id, community.id);
    Ok(community)
}

pub async fn get_community(db: Arc<Database>, id: &str) -> Result<Community, ServiceError> {
    let row = sqlx::query("SELECT * FROM communities WHERE id = ?")
        .bind(id)
        .fetch_optional(&db.pool)
        .await
        .map_err(|e| {
            warn!("[COMMUNITY] Error loading {}: {}", id, e);
            ServiceError::NotFound
        })?;

    row.map(|r| community_from_row(&r)).ok_or(ServiceError::NotFound)
}

/// Membership counter increment plus activity touch, in one statement.
pub async fn join_community(
    db: Arc<Database>,
    id: &str,
    user_id: &str,
) -> Result<(), ServiceError> {
    let res = sqlx::query(
        "UPDATE communities SET members_count = members_count + 1, last_active = ? WHERE id = ?",
    )
    .bind(ts(Utc::now()))
    .bind(id)
    .execute(&db.pool)
    .await
    .map_err(|_| ServiceError::NotFound)?;

    if res.rows_affected() == 0 {
        return Err(ServiceError::NotFound);
    }
    info!("[COMMUNITY] {} joined {}", user_id, id);
    Ok(())
}

/// Decrement floors at zero in the statement itself, so concurrent leaves can
/// never drive the counter negative.
pub async fn leave_community(
    db: Arc<Database>,
    id: &str,
    user_id: &str,
) -> Result<(), ServiceError> {
    let res = sqlx::query(
        "UPDATE communities SET members_count = MAX(0, members_count - 1) WHERE id = ?",
    )
    .bind(id)
    .execute(&db.pool)
    .await
    .map_err(|_| ServiceError::NotFound)?;

    if res.rows_affected() == 0 {
        return Err(ServiceError::NotFound);
    }
    info!("[COMMUNITY] {} left {}", user_id, id);
    Ok(())
}

pub async fn trending(db: Arc<Database>) -> Vec<Community> {
    let rows = sqlx::query(
        "SELECT * FROM communities ORDER BY activity_score DESC, members_count DESC LIMIT ?",
    )
    .bind(TRENDING_LIMIT as i64)
    .fetch_all(&db.pool)
    .await;

    match rows {
        Ok(rows) => rows.iter().map(community_from_row).collect(),
        Err(e) => {
            warn!("[COMMUNITY] Error listing trending: {}", e);
            Vec::new()
        }
    }
}

/// Communities with a known location inside `radius_m` of `origin`,
/// most-proximate first.
pub async fn nearby(db: Arc<Database>, origin: GeoPoint, radius_m: f64) -> Vec<Community> {
    let rows = sqlx::query("SELECT * FROM communities WHERE lng != 0 OR lat != 0")
        .fetch_all(&db.pool)
        .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            warn!("[COMMUNITY] Error listing nearby: {}", e);
            return Vec::new();
        }
    };

    let mut within: Vec<(f64, Community)> = rows
        .iter()
        .map(community_from_row)
        .map(|c| (haversine_m(origin, c.geo), c))
        .filter(|(d, _)| *d <= radius_m)
        .collect();
    within.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    within.truncate(NEARBY_LIMIT);
    within.into_iter().map(|(_, c)| c).collect()
}

/// Bump a community when one of its pods is created.
pub async fn touch_for_pod(db: Arc<Database>, id: &str) {
    let res = sqlx::query(
        "UPDATE communities SET last_active = ?, activity_score = activity_score + 1 WHERE id = ?",
    )
    .bind(ts(Utc::now()))
    .bind(id)
    .execute(&db.pool)
    .await;
    if let Err(e) = res {
        warn!("[COMMUNITY] Error touching {} after pod creation: {}", id, e);
    }
}

/// Periodic recompute: `members · 0.3 + pods_created_last_24h · 0.7` per
/// community. A single community's failure does not stop the pass.
pub async fn recompute_activity(db: Arc<Database>) {
    let rows = sqlx::query("SELECT id, members_count FROM communities")
        .fetch_all(&db.pool)
        .await;
    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            warn!("[COMMUNITY] Activity recompute skipped: {}", e);
            return;
        }
    };

    let cutoff = ts(Utc::now() - Duration::hours(24));
    let mut updated = 0usize;
    for row in rows {
        let id: String = row.get("id");
        let members: i64 = row.get("members_count");

        let recent_pods = match sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pods WHERE community_id = ? AND created_at > ?",
        )
        .bind(&id)
        .bind(cutoff)
        .fetch_one(&db.pool)
        .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!("[COMMUNITY] Pod count failed for {}: {}", id, e);
                continue;
            }
        };

        let score = members as f64 * ACTIVITY_MEMBER_WEIGHT + recent_pods as f64 * ACTIVITY_POD_WEIGHT;
        match sqlx::query("UPDATE communities SET activity_score = ? WHERE id = ?")
            .bind(score)
            .bind(&id)
            .execute(&db.pool)
            .await
        {
            Ok(_) => updated += 1,
            Err(e) => warn!("[COMMUNITY] Score update failed for {}: {}", id, e),
        }
    }
    info!("[COMMUNITY] Activity scores recomputed for {} communities", updated);
}
