use chrono::Utc;
use log::{error, info, warn};
use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};
use sysinfo::System;
use tokio::time;

use crate::server::database::Database;

pub async fn start_performance_logger(db: Arc<Database>, log_path: &str) {
    let mut system = System::new_all();

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Unable to open performance log file '{}': {}", log_path, e);
            return;
        }
    };

    // Write header if file is empty
    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(file, "# Huddle Server Performance Log") {
            error!("Failed to write header to performance log: {}", e);
            return;
        }
        if let Err(e) = writeln!(file, "# Timestamp, Communities, Active_Pods, Total_Messages, CPU_Usage") {
            error!("Failed to write header to performance log: {}", e);
            return;
        }
        info!("Performance log initialized: {}", log_path);
    }

    loop {
        system.refresh_all();
        let cpu_usage =
            system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len().max(1) as f32;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

        let communities = match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM communities")
            .fetch_one(&db.pool)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to query communities: {}", e);
                -1
            }
        };

        let active_pods = match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pods WHERE active = 1")
            .fetch_one(&db.pool)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to query active pods: {}", e);
                -1
            }
        };

        let total_messages = match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pod_messages")
            .fetch_one(&db.pool)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to query messages: {}", e);
                -1
            }
        };

        info!(
            "Performance - Communities: {}, Active Pods: {}, Messages: {}, CPU: {:.1}%",
            communities, active_pods, total_messages, cpu_usage
        );

        if let Err(e) = writeln!(
            file,
            "{}, {}, {}, {}, {:.1}%",
            timestamp, communities, active_pods, total_messages, cpu_usage
        ) {
            error!("Failed to write to performance log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("Failed to flush performance log: {}", e);
        }

        time::sleep(Duration::from_secs(120)).await;
    }
}
