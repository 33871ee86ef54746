use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};

use crate::common::models::ChatMessage;
use crate::server::database::Database;
use crate::server::rooms::RoomRegistry;
use crate::server::websocket::PodSocketManager;

/// Validates and appends messages to room transcripts and fans them out to
/// connected members. One router instance serves every room; per-room
/// ordering comes from the room lock, not from this struct.
pub struct MessageRouter {
    registry: Arc<RoomRegistry>,
    sockets: Arc<PodSocketManager>,
    db: Arc<Database>,
}

impl MessageRouter {
    pub fn new(registry: Arc<RoomRegistry>, sockets: Arc<PodSocketManager>, db: Arc<Database>) -> Self {
        Self { registry, sockets, db }
    }

    /// Append one message and broadcast it. A missing or deactivated room is
    /// a silent no-op: callers validated the room at join time, and a room
    /// vanishing in between means a dropped message, not an error.
    ///
    /// The in-memory append, the `last_activity` bump and the fan-out happen
    /// under the room's own lock, so concurrent senders to one room serialize
    /// and every subscriber observes messages in acceptance order. The
    /// storage write happens after the lock is released: the transcript table
    /// is append-only (INSERT plus a timestamp UPDATE in one transaction), so
    /// concurrent appends cannot overwrite each other there either.
    pub async fn post_message(
        &self,
        pod_id: &str,
        sender: Option<&str>,
        text: &str,
        is_generated: bool,
    ) -> Option<ChatMessage> {
        let Some(room) = self.registry.room(pod_id).await else {
            debug!("[ROUTER] Dropping message for unknown room {}", pod_id);
            return None;
        };

        let message = {
            let mut pod = room.lock().await;
            if !pod.active {
                debug!("[ROUTER] Dropping message for inactive room {}", pod_id);
                return None;
            }

            let message = ChatMessage {
                sender: sender.map(|s| s.to_string()),
                text: text.to_string(),
                time: Utc::now(),
                is_generated,
            };
            pod.transcript.push(message.clone());
            pod.last_activity = message.time;

            self.sockets
                .broadcast_to_pod(
                    pod_id,
                    &serde_json::json!({
                        "event": "pod-message",
                        "pod_id": pod_id,
                        "message": &message,
                    }),
                    None,
                )
                .await;
            message
        };

        self.persist(pod_id, &message).await;
        Some(message)
    }

    async fn persist(&self, pod_id: &str, message: &ChatMessage) {
        let tx = self.db.pool.begin().await;
        let mut tx = match tx {
            Ok(tx) => tx,
            Err(e) => {
                warn!("[ROUTER] Storage unavailable for {}: {}", pod_id, e);
                return;
            }
        };

        let insert = sqlx::query(
            "INSERT INTO pod_messages (pod_id, sender_id, text, sent_at, is_generated) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(pod_id)
        .bind(&message.sender)
        .bind(&message.text)
        .bind(message.time.timestamp())
        .bind(message.is_generated as i64)
        .execute(&mut *tx)
        .await;
        if let Err(e) = insert {
            warn!("[ROUTER] Message write failed for {}: {}", pod_id, e);
            return;
        }

        let touch = sqlx::query("UPDATE pods SET last_activity = ? WHERE id = ?")
            .bind(message.time.timestamp())
            .bind(pod_id)
            .execute(&mut *tx)
            .await;
        if let Err(e) = touch {
            warn!("[ROUTER] Activity update failed for {}: {}", pod_id, e);
            return;
        }

        if let Err(e) = tx.commit().await {
            warn!("[ROUTER] Message commit failed for {}: {}", pod_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::{GeoPoint, PodType, Visibility};
    use crate::server::communities::create_community;
    use crate::server::embedding::EmbeddingProvider;
    use async_trait::async_trait;
    use tokio_tungstenite::tungstenite::Message;

    struct NoEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for NoEmbeddings {
        async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
            None
        }
    }

    async fn setup() -> (Arc<Database>, Arc<RoomRegistry>, Arc<PodSocketManager>, Arc<MessageRouter>, String) {
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
        let registry = Arc::new(RoomRegistry::new(db.clone(), 1, 24));
        let sockets = Arc::new(PodSocketManager::new());
        let router = Arc::new(MessageRouter::new(registry.clone(), sockets.clone(), db.clone()));
        let pod = registry
            .create_pod(&community.id, "alice", PodType::Chat, None, Some(2), None)
            .await
            .unwrap();
        (db, registry, sockets, router, pod.id)
    }

    #[tokio::test]
    async fn messages_append_in_order_and_reach_subscribers_in_order() {
        let (_db, registry, sockets, router, pod_id) = setup().await;
        registry.join(&pod_id, "bob").await.unwrap();

        let (alice_client, mut alice_rx) = sockets.register_test_client("alice").await;
        let (bob_client, mut bob_rx) = sockets.register_test_client("bob").await;
        sockets.subscribe(&pod_id, &alice_client).await;
        sockets.subscribe(&pod_id, &bob_client).await;

        router.post_message(&pod_id, Some("alice"), "A", false).await.unwrap();
        router.post_message(&pod_id, Some("bob"), "B", false).await.unwrap();

        let room = registry.room(&pod_id).await.unwrap();
        let texts: Vec<String> = room
            .lock()
            .await
            .transcript
            .iter()
            .map(|m| m.text.clone())
            .collect();
        assert_eq!(texts, vec!["A", "B"]);

        for rx in [&mut alice_rx, &mut bob_rx] {
            let mut seen = Vec::new();
            while let Ok(Message::Text(raw)) = rx.try_recv() {
                let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
                seen.push(v["message"]["text"].as_str().unwrap().to_string());
            }
            assert_eq!(seen, vec!["A", "B"]);
        }
    }

    #[tokio::test]
    async fn concurrent_senders_lose_no_appends() {
        let (db, _registry, _sockets, router, pod_id) = setup().await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let router = router.clone();
            let pod_id = pod_id.clone();
            handles.push(tokio::spawn(async move {
                router
                    .post_message(&pod_id, Some("alice"), &format!("msg-{}", i), false)
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_some());
        }

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pod_messages WHERE pod_id = ?")
            .bind(&pod_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(stored, 20);
    }

    #[tokio::test]
    async fn missing_room_is_a_silent_no_op() {
        let (db, _registry, _sockets, router, _pod_id) = setup().await;
        let out = router.post_message("no-such-room", Some("alice"), "hello", false).await;
        assert!(out.is_none());

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pod_messages")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn deactivated_room_drops_messages() {
        let (_db, registry, _sockets, router, pod_id) = setup().await;
        registry.deactivate_due(Utc::now() + chrono::Duration::hours(3)).await;

        let out = router.post_message(&pod_id, Some("alice"), "too late", false).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn generated_messages_flow_through_the_same_path() {
        let (_db, registry, _sockets, router, pod_id) = setup().await;
        let msg = router
            .post_message(&pod_id, None, "What's everyone working on?", true)
            .await
            .unwrap();
        assert!(msg.is_generated);
        assert!(msg.sender.is_none());

        let room = registry.room(&pod_id).await.unwrap();
        let pod = room.lock().await;
        assert_eq!(pod.transcript.len(), 1);
        assert_eq!(pod.last_activity, msg.time);
    }
}
