use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::common::models::{ChatMessage, GeoPoint, Pod, PodType};
use crate::server::communities;
use crate::server::database::Database;
use crate::server::error::ServiceError;

pub const MIN_ICEBREAKER_MEMBERS: usize = 2;

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn dt(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

fn pod_from_row(row: &SqliteRow) -> Pod {
    let lng: Option<f64> = row.get("lng");
    let lat: Option<f64> = row.get("lat");
    Pod {
        id: row.get("id"),
        community_id: row.get("community_id"),
        created_by: row.get("created_by"),
        pod_type: PodType::parse(&row.get::<String, _>("pod_type")).unwrap_or(PodType::Chat),
        title: row.get("title"),
        expires_at: dt(row.get("expires_at")),
        members: Vec::new(),
        transcript: Vec::new(),
        geo: match (lng, lat) {
            (Some(lng), Some(lat)) => Some(GeoPoint::new(lng, lat)),
            _ => None,
        },
        active: row.get::<i64, _>("active") != 0,
        last_activity: dt(row.get("last_activity")),
        created_at: dt(row.get("created_at")),
    }
}

fn message_from_row(row: &SqliteRow) -> ChatMessage {
    ChatMessage {
        sender: row.get("sender_id"),
        text: row.get("text"),
        time: dt(row.get("sent_at")),
        is_generated: row.get::<i64, _>("is_generated") != 0,
    }
}

/// Authoritative in-memory map of the rooms this process owns. Rooms are
/// independent: each sits behind its own lock so membership and transcript
/// mutations are linearizable per room while distinct rooms proceed in
/// parallel. The registry is built once in main and handed to the router and
/// both sweepers.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Pod>>>>,
    db: Arc<Database>,
    min_duration_hours: i64,
    max_duration_hours: i64,
}

impl RoomRegistry {
    pub fn new(db: Arc<Database>, min_duration_hours: i64, max_duration_hours: i64) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            db,
            min_duration_hours,
            max_duration_hours,
        }
    }

    /// Reload rooms that were active at last shutdown. The expiry sweeper
    /// deals with any that lapsed while the process was down.
    pub async fn hydrate(&self) -> Result<usize, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM pods WHERE active = 1")
            .fetch_all(&self.db.pool)
            .await?;

        let mut loaded = 0usize;
        for row in &rows {
            let mut pod = pod_from_row(row);

            let member_rows =
                sqlx::query("SELECT user_id FROM pod_members WHERE pod_id = ? ORDER BY joined_at, rowid")
                    .bind(&pod.id)
                    .fetch_all(&self.db.pool)
                    .await?;
            pod.members = member_rows.iter().map(|r| r.get("user_id")).collect();

            let message_rows =
                sqlx::query("SELECT * FROM pod_messages WHERE pod_id = ? ORDER BY seq")
                    .bind(&pod.id)
                    .fetch_all(&self.db.pool)
                    .await?;
            pod.transcript = message_rows.iter().map(message_from_row).collect();

            self.rooms
                .write()
                .await
                .insert(pod.id.clone(), Arc::new(Mutex::new(pod)));
            loaded += 1;
        }
        info!("[POD] Hydrated {} active rooms from storage", loaded);
        Ok(loaded)
    }

    pub async fn room(&self, pod_id: &str) -> Option<Arc<Mutex<Pod>>> {
        self.rooms.read().await.get(pod_id).cloned()
    }

    pub async fn create_pod(
        &self,
        community_id: &str,
        created_by: &str,
        pod_type: PodType,
        title: Option<String>,
        duration_hours: Option<i64>,
        geo: Option<GeoPoint>,
    ) -> Result<Pod, ServiceError> {
        let exists = sqlx::query("SELECT 1 FROM communities WHERE id = ?")
            .bind(community_id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|_| ServiceError::NotFound)?;
        if exists.is_none() {
            return Err(ServiceError::NotFound);
        }

        let duration = duration_hours
            .unwrap_or(self.min_duration_hours)
            .clamp(self.min_duration_hours, self.max_duration_hours);

        let now = Utc::now();
        let pod = Pod {
            id: Uuid::new_v4().to_string(),
            community_id: community_id.to_string(),
            created_by: created_by.to_string(),
            pod_type,
            title,
            // Fixed at creation; nothing ever extends it.
            expires_at: now + Duration::hours(duration),
            members: vec![created_by.to_string()],
            transcript: Vec::new(),
            geo,
            active: true,
            last_activity: now,
            created_at: now,
        };

        let tx = self.db.pool.begin().await;
        match tx {
            Ok(mut tx) => {
                let res = sqlx::query(
                    "INSERT INTO pods \
                     (id, community_id, created_by, pod_type, title, expires_at, lng, lat, \
                      active, last_activity, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
                )
                .bind(&pod.id)
                .bind(&pod.community_id)
                .bind(&pod.created_by)
                .bind(pod.pod_type.as_str())
                .bind(&pod.title)
                .bind(ts(pod.expires_at))
                .bind(pod.geo.map(|g| g.lng))
                .bind(pod.geo.map(|g| g.lat))
                .bind(ts(pod.last_activity))
                .bind(ts(pod.created_at))
                .execute(&mut *tx)
                .await;
                if let Err(e) = res {
                    warn!("[POD] Error creating pod: {}", e);
                    return Err(ServiceError::InvalidInput(format!("could not persist pod: {}", e)));
                }

                let res2 = sqlx::query(
                    "INSERT INTO pod_members (pod_id, user_id, joined_at) VALUES (?, ?, ?)",
                )
                .bind(&pod.id)
                .bind(created_by)
                .bind(ts(now))
                .execute(&mut *tx)
                .await;
                if let Err(e) = res2 {
                    warn!("[POD] Error adding creator as member: {}", e);
                    return Err(ServiceError::InvalidInput(format!(
                        "could not persist membership: {}",
                        e
                    )));
                }
                tx.commit().await.ok();
            }
            Err(e) => {
                warn!("[POD] Error starting transaction: {}", e);
                return Err(ServiceError::InvalidInput(format!("storage unavailable: {}", e)));
            }
        }

        self.rooms
            .write()
            .await
            .insert(pod.id.clone(), Arc::new(Mutex::new(pod.clone())));

        communities::touch_for_pod(self.db.clone(), community_id).await;
        info!(
            "[POD] {} created in community {} by {} (expires {})",
            pod.id, community_id, created_by, pod.expires_at
        );
        Ok(pod)
    }

    /// Idempotent join. Returns a snapshot of the room (membership plus
    /// transcript) as of the join.
    pub async fn join(&self, pod_id: &str, user_id: &str) -> Result<Pod, ServiceError> {
        let room = self.room(pod_id).await.ok_or(ServiceError::NotFound)?;

        let (snapshot, newly_joined) = {
            let mut pod = room.lock().await;
            if !pod.active || Utc::now() >= pod.expires_at {
                return Err(ServiceError::Unavailable);
            }
            let newly_joined = if pod.members.iter().any(|m| m.as_str() == user_id) {
                false
            } else {
                pod.members.push(user_id.to_string());
                true
            };
            (pod.clone(), newly_joined)
        };

        if newly_joined {
            let res = sqlx::query(
                "INSERT OR IGNORE INTO pod_members (pod_id, user_id, joined_at) VALUES (?, ?, ?)",
            )
            .bind(pod_id)
            .bind(user_id)
            .bind(ts(Utc::now()))
            .execute(&self.db.pool)
            .await;
            if let Err(e) = res {
                warn!("[POD] Membership write failed for {} in {}: {}", user_id, pod_id, e);
            }
            info!("[POD] {} joined {}", user_id, pod_id);
        }
        Ok(snapshot)
    }

    pub async fn get_pod(&self, pod_id: &str) -> Result<Pod, ServiceError> {
        if let Some(room) = self.room(pod_id).await {
            return Ok(room.lock().await.clone());
        }

        // Deactivated rooms stay in the map; rooms from before the last
        // hydrate only exist in storage.
        let row = sqlx::query("SELECT * FROM pods WHERE id = ?")
            .bind(pod_id)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|_| ServiceError::NotFound)?
            .ok_or(ServiceError::NotFound)?;
        let mut pod = pod_from_row(&row);

        if let Ok(member_rows) =
            sqlx::query("SELECT user_id FROM pod_members WHERE pod_id = ? ORDER BY joined_at, rowid")
                .bind(pod_id)
                .fetch_all(&self.db.pool)
                .await
        {
            pod.members = member_rows.iter().map(|r| r.get("user_id")).collect();
        }
        if let Ok(message_rows) =
            sqlx::query("SELECT * FROM pod_messages WHERE pod_id = ? ORDER BY seq")
                .bind(pod_id)
                .fetch_all(&self.db.pool)
                .await
        {
            pod.transcript = message_rows.iter().map(message_from_row).collect();
        }
        Ok(pod)
    }

    /// Active, unexpired pods, newest first, optionally restricted to one
    /// community. Listing does not load transcripts.
    pub async fn active_pods(&self, community_id: Option<&str>) -> Vec<Pod> {
        let now = ts(Utc::now());
        let rows = match community_id {
            Some(cid) => {
                sqlx::query(
                    "SELECT * FROM pods WHERE active = 1 AND expires_at > ? AND community_id = ? \
                     ORDER BY created_at DESC, rowid DESC",
                )
                .bind(now)
                .bind(cid)
                .fetch_all(&self.db.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM pods WHERE active = 1 AND expires_at > ? \
                     ORDER BY created_at DESC, rowid DESC",
                )
                .bind(now)
                .fetch_all(&self.db.pool)
                .await
            }
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[POD] Error listing active pods: {}", e);
                return Vec::new();
            }
        };

        let mut pods = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut pod = pod_from_row(row);
            if let Ok(member_rows) =
                sqlx::query("SELECT user_id FROM pod_members WHERE pod_id = ? ORDER BY joined_at, rowid")
                    .bind(&pod.id)
                    .fetch_all(&self.db.pool)
                    .await
            {
                pod.members = member_rows.iter().map(|r| r.get("user_id")).collect();
            }
            pods.push(pod);
        }
        pods
    }

    /// Flip every room past its expiry to inactive. The transition is one-way:
    /// nothing in the registry ever sets `active` back to true. Idempotent and
    /// safe to run concurrently with message posting; a message that got in
    /// before the flip stays in the transcript.
    pub async fn deactivate_due(&self, now: DateTime<Utc>) -> usize {
        let rooms: Vec<Arc<Mutex<Pod>>> = self.rooms.read().await.values().cloned().collect();

        let mut expired = 0usize;
        for room in rooms {
            let mut pod = room.lock().await;
            if pod.active && pod.expires_at < now {
                pod.active = false;
                expired += 1;
            }
        }

        let res = sqlx::query("UPDATE pods SET active = 0 WHERE active = 1 AND expires_at < ?")
            .bind(ts(now))
            .execute(&self.db.pool)
            .await;
        if let Err(e) = res {
            warn!("[POD] Expiry write-back failed: {}", e);
        }

        if expired > 0 {
            info!("[POD] Deactivated {} expired rooms", expired);
        }
        expired
    }

    /// Rooms eligible for a conversation starter: active, unexpired, at least
    /// two members, idle past the threshold, and not inside the cooldown
    /// window since the last generated message.
    pub async fn icebreaker_candidates(
        &self,
        now: DateTime<Utc>,
        idle_threshold_secs: i64,
        cooldown_secs: i64,
    ) -> Vec<(String, String)> {
        let rooms: Vec<Arc<Mutex<Pod>>> = self.rooms.read().await.values().cloned().collect();

        let mut candidates = Vec::new();
        for room in rooms {
            let pod = room.lock().await;
            if !pod.active || now >= pod.expires_at {
                continue;
            }
            if pod.members.len() < MIN_ICEBREAKER_MEMBERS {
                continue;
            }
            if (now - pod.last_activity).num_seconds() < idle_threshold_secs {
                continue;
            }
            let last_generated = pod.transcript.iter().rev().find(|m| m.is_generated);
            if let Some(m) = last_generated {
                if (now - m.time).num_seconds() < cooldown_secs {
                    continue;
                }
            }
            candidates.push((pod.id.clone(), pod.community_id.clone()));
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::Visibility;
    use crate::server::communities::create_community;
    use crate::server::embedding::EmbeddingProvider;
    use async_trait::async_trait;

    struct NoEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for NoEmbeddings {
        async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
            None
        }
    }

    async fn setup() -> (Arc<Database>, RoomRegistry, String) {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();
        let community = create_community(
            db.clone(),
            &NoEmbeddings,
            "creator",
            "Chess Club",
            &["chess".to_string()],
            "A place to play",
            Visibility::Global,
            GeoPoint::UNKNOWN,
            None,
        )
        .await
        .unwrap();
        let registry = RoomRegistry::new(db.clone(), 1, 24);
        (db, registry, community.id)
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let (_db, registry, community_id) = setup().await;
        let pod = registry
            .create_pod(&community_id, "alice", PodType::Chat, None, Some(2), None)
            .await
            .unwrap();

        let once = registry.join(&pod.id, "bob").await.unwrap();
        let twice = registry.join(&pod.id, "bob").await.unwrap();
        assert_eq!(once.members, vec!["alice", "bob"]);
        assert_eq!(twice.members, once.members);
    }

    #[tokio::test]
    async fn join_missing_room_is_not_found() {
        let (_db, registry, _community_id) = setup().await;
        let err = registry.join("no-such-pod", "bob").await.unwrap_err();
        assert_eq!(err, ServiceError::NotFound);
    }

    #[tokio::test]
    async fn expiry_is_set_from_duration_and_clamped() {
        let (_db, registry, community_id) = setup().await;
        let pod = registry
            .create_pod(&community_id, "alice", PodType::Study, None, Some(1), None)
            .await
            .unwrap();
        assert_eq!(pod.expires_at, pod.created_at + Duration::hours(1));

        let capped = registry
            .create_pod(&community_id, "alice", PodType::Study, None, Some(500), None)
            .await
            .unwrap();
        assert_eq!(capped.expires_at, capped.created_at + Duration::hours(24));

        let defaulted = registry
            .create_pod(&community_id, "alice", PodType::Study, None, None, None)
            .await
            .unwrap();
        assert_eq!(defaulted.expires_at, defaulted.created_at + Duration::hours(1));
    }

    #[tokio::test]
    async fn expired_room_rejects_joins_and_stays_inactive() {
        let (_db, registry, community_id) = setup().await;
        let pod = registry
            .create_pod(&community_id, "alice", PodType::Chat, None, Some(1), None)
            .await
            .unwrap();

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(registry.deactivate_due(later).await, 1);
        // Second sweep is a no-op: the transition is one-way.
        assert_eq!(registry.deactivate_due(later).await, 0);

        let err = registry.join(&pod.id, "bob").await.unwrap_err();
        assert_eq!(err, ServiceError::Unavailable);

        let stored = registry.get_pod(&pod.id).await.unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn hydrate_restores_active_rooms() {
        let (db, registry, community_id) = setup().await;
        let pod = registry
            .create_pod(&community_id, "alice", PodType::Hangout, Some("evening".into()), Some(3), None)
            .await
            .unwrap();
        registry.join(&pod.id, "bob").await.unwrap();

        let fresh = RoomRegistry::new(db, 1, 24);
        let loaded = fresh.hydrate().await.unwrap();
        assert_eq!(loaded, 1);

        let restored = fresh.join(&pod.id, "carol").await.unwrap();
        assert_eq!(restored.members, vec!["alice", "bob", "carol"]);
        assert_eq!(restored.title.as_deref(), Some("evening"));
    }

    #[tokio::test]
    async fn icebreaker_candidates_respect_idle_and_cooldown() {
        let (_db, registry, community_id) = setup().await;
        let pod = registry
            .create_pod(&community_id, "alice", PodType::Chat, None, Some(2), None)
            .await
            .unwrap();
        registry.join(&pod.id, "bob").await.unwrap();

        let now = Utc::now();
        let room = registry.room(&pod.id).await.unwrap();

        // Idle six minutes, generated message three minutes ago: inside the
        // ten-minute cooldown, so no candidate.
        {
            let mut state = room.lock().await;
            state.last_activity = now - Duration::minutes(6);
            state.transcript.push(ChatMessage {
                sender: None,
                text: "What's everyone playing?".into(),
                time: now - Duration::minutes(3),
                is_generated: true,
            });
        }
        assert!(registry.icebreaker_candidates(now, 300, 600).await.is_empty());

        // Same room with the generated message aged past the cooldown.
        {
            let mut state = room.lock().await;
            state.transcript.last_mut().unwrap().time = now - Duration::minutes(12);
        }
        let candidates = registry.icebreaker_candidates(now, 300, 600).await;
        assert_eq!(candidates, vec![(pod.id.clone(), community_id.clone())]);
    }

    #[tokio::test]
    async fn single_member_room_is_never_an_icebreaker_candidate() {
        let (_db, registry, community_id) = setup().await;
        let pod = registry
            .create_pod(&community_id, "alice", PodType::Chat, None, Some(2), None)
            .await
            .unwrap();

        let now = Utc::now();
        {
            let room = registry.room(&pod.id).await.unwrap();
            room.lock().await.last_activity = now - Duration::minutes(30);
        }
        assert!(registry.icebreaker_candidates(now, 300, 600).await.is_empty());
    }
}
