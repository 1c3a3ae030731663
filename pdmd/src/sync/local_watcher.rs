use std::path::Path;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use super::ignore::IgnoreRules;
use super::paths::relative_path_for;

/// A change under the vault root, in vault-relative form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Changed { path: String },
    Removed { path: String },
    Renamed { from: String, to: String },
}

impl LocalChange {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            LocalChange::Changed { path } | LocalChange::Removed { path } => vec![path.as_str()],
            LocalChange::Renamed { from, to } => vec![from.as_str(), to.as_str()],
        }
    }
}

pub fn start_watcher(
    root: &Path,
    ignore: IgnoreRules,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalChange>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for change in map_event(&watch_root, &ignore, event) {
                let _ = tx.send(change);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

/// Waits for one change, then keeps collecting until the stream has been
/// quiet for `quiet`. `None` once the watcher is gone.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<LocalChange>,
    quiet: Duration,
) -> Option<Vec<LocalChange>> {
    let mut batch = vec![rx.recv().await?];
    while let Ok(Some(change)) = tokio::time::timeout(quiet, rx.recv()).await {
        batch.push(change);
    }
    debug!(changes = batch.len(), "local changes settled");
    Some(batch)
}

fn map_event(root: &Path, ignore: &IgnoreRules, event: Event) -> Vec<LocalChange> {
    let relative = |path: &Path| {
        relative_path_for(root, path)
            .ok()
            .filter(|path| !path.is_empty() && !ignore.is_ignored(path))
    };
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            match (relative(&event.paths[0]), relative(&event.paths[1])) {
                (Some(from), Some(to)) => vec![LocalChange::Renamed { from, to }],
                // Atomic writes rename an ignored `.partial` sibling into place.
                (None, Some(path)) => vec![LocalChange::Changed { path }],
                (Some(path), None) => vec![LocalChange::Removed { path }],
                (None, None) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| relative(path))
            .map(|path| LocalChange::Removed { path })
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| relative(path))
            .map(|path| LocalChange::Changed { path })
            .collect(),
        _ => Vec::new(),
    }
}
