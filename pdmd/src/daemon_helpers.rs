fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn format_status_counts(counts: &StatusCounts) -> String {
    const ORDER: [SyncStatus; 8] = [
        SyncStatus::Synced,
        SyncStatus::Added,
        SyncStatus::Modified,
        SyncStatus::Moved,
        SyncStatus::Outdated,
        SyncStatus::CloudOnly,
        SyncStatus::CloudNew,
        SyncStatus::DeletedRemote,
    ];
    ORDER
        .iter()
        .map(|status| format!("{}={}", status.as_str(), counts.get(*status)))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn refresh_active(engine: &VaultEngine, vault_id: &str, user_id: &str, reason: &str) {
    match engine.refresh(vault_id, user_id).await {
        Ok(snapshot) => {
            debug!(vault_id, reason, entries = snapshot.entries.len(), "refreshed");
        }
        Err(err) => warn!(vault_id, reason, "refresh failed: {err}"),
    }
}

async fn replay_after_reconnect(engine: &VaultEngine, vault_id: &str, user_id: &str) {
    if engine.staged(vault_id).is_empty() {
        refresh_active(engine, vault_id, user_id, "reconnect").await;
        return;
    }
    match engine
        .replay_staged(vault_id, user_id, &CancellationToken::new())
        .await
    {
        Ok(report) => {
            for conflict in &report.conflicts {
                warn!(
                    path = %conflict.path,
                    staged = ?conflict.staged_version,
                    server = ?conflict.server_version,
                    "staged check-in needs attention"
                );
            }
            info!(
                vault_id,
                replayed = report.batch.succeeded,
                failed = report.batch.failed,
                conflicts = report.conflicts.len(),
                "offline check-ins replayed"
            );
        }
        Err(err) => error!(vault_id, "replay failed: {err}"),
    }
}
