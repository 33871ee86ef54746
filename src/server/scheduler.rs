use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use sqlx::Row;
use tokio::time;

use crate::server::agent::ConversationAgent;
use crate::server::communities;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::messages::MessageRouter;
use crate::server::rooms::RoomRegistry;

/// Deactivate rooms whose time-to-live has elapsed. Runs forever; spawned
/// once from main.
pub async fn run_expiry_sweeper(registry: Arc<RoomRegistry>, interval_secs: u64) {
    let mut ticker = time::interval(Duration::from_secs(interval_secs));
    info!("[SWEEP] Expiry sweeper running every {}s", interval_secs);
    loop {
        ticker.tick().await;
        registry.deactivate_due(Utc::now()).await;
    }
}

/// Inject a conversation starter into idle-but-populated rooms.
pub async fn run_icebreaker_scheduler(
    registry: Arc<RoomRegistry>,
    router: Arc<MessageRouter>,
    db: Arc<Database>,
    agent: Arc<dyn ConversationAgent>,
    config: ServerConfig,
) {
    let mut ticker = time::interval(Duration::from_secs(config.sweep_interval_secs));
    info!(
        "[SWEEP] Icebreaker scheduler running every {}s (idle {}s, cooldown {}s)",
        config.sweep_interval_secs, config.idle_threshold_secs, config.icebreaker_cooldown_secs
    );
    loop {
        ticker.tick().await;
        icebreaker_tick(
            &registry,
            &router,
            &db,
            agent.as_ref(),
            config.idle_threshold_secs,
            config.icebreaker_cooldown_secs,
        )
        .await;
    }
}

/// One scheduler pass. A single room's failure is logged and skipped; the
/// rest of the candidates still get processed.
pub async fn icebreaker_tick(
    registry: &RoomRegistry,
    router: &MessageRouter,
    db: &Database,
    agent: &dyn ConversationAgent,
    idle_threshold_secs: i64,
    cooldown_secs: i64,
) -> usize {
    let candidates = registry
        .icebreaker_candidates(Utc::now(), idle_threshold_secs, cooldown_secs)
        .await;

    let mut injected = 0usize;
    for (pod_id, community_id) in candidates {
        let tags: Vec<String> = match sqlx::query("SELECT tags FROM communities WHERE id = ?")
            .bind(&community_id)
            .fetch_optional(&db.pool)
            .await
        {
            Ok(Some(row)) => {
                serde_json::from_str(&row.get::<String, _>("tags")).unwrap_or_default()
            }
            Ok(None) => {
                warn!("[SWEEP] Community {} missing for pod {}", community_id, pod_id);
                Vec::new()
            }
            Err(e) => {
                warn!("[SWEEP] Tag lookup failed for pod {}: {}", pod_id, e);
                continue;
            }
        };

        // The agent call degrades to a static line on failure, and the
        // injected message rides the regular append-and-broadcast path.
        let text = agent.icebreaker(&tags).await;
        match router.post_message(&pod_id, None, &text, true).await {
            Some(_) => {
                info!("[SWEEP] Icebreaker injected into {}", pod_id);
                injected += 1;
            }
            None => {
                // Room expired or vanished between candidate selection and
                // the post; nothing to do.
            }
        }
    }
    injected
}

/// Hourly trending refresh over all communities.
pub async fn run_activity_recompute(db: Arc<Database>, interval_secs: u64) {
    let mut ticker = time::interval(Duration::from_secs(interval_secs));
    info!("[SWEEP] Activity recompute running every {}s", interval_secs);
    loop {
        ticker.tick().await;
        communities::recompute_activity(db.clone()).await;
    }
}
