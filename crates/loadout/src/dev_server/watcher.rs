//! File watching with debounce and superseding rebuilds

use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use indexmap::IndexSet;
use log::{debug, info, warn};
use notify::{
    Event, EventKind, RecursiveMode, Watcher,
    event::ModifyKind,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use super::DevSession;
use crate::error::BuildError;

/// Rebuild `session` whenever files under the project root change, until `shutdown`.
///
/// Changes are coalesced until none arrived for `dev_server.debounce_ms`. A change
/// that arrives while a rebuild runs cancels it; the rebuild then restarts with
/// both sets of changes after the next quiet period.
pub async fn watch(session: &mut DevSession, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = session.config();
    let root = config.root.clone();
    let output_dir = config.output_dir();
    let debounce = Duration::from_millis(config.dev_server.debounce_ms);

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_content_change(event.kind) => {
            let paths: Vec<PathBuf> = event
                .paths
                .into_iter()
                .filter(|path| !is_ignored(path, &output_dir))
                .collect();
            if !paths.is_empty() {
                let _ = tx.send(paths);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("File watcher error: {e}"),
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    info!("Watching {} for changes", root.display());

    let mut pending: IndexSet<PathBuf> = IndexSet::new();
    loop {
        if pending.is_empty() {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(paths) => pending.extend(paths),
                    None => break,
                },
            }
        }
        if !quiet_period(&mut rx, &mut pending, debounce, &shutdown).await {
            break;
        }

        let batch: Vec<PathBuf> = pending.drain(..).collect();
        debug!("Rebuilding for {} changed files", batch.len());
        let token = shutdown.child_token();
        let result = {
            let rebuild = session.rebuild(&batch, token.clone());
            tokio::pin!(rebuild);
            loop {
                tokio::select! {
                    result = &mut rebuild => break result,
                    Some(paths) = rx.recv(), if !token.is_cancelled() => {
                        debug!("Files changed during rebuild; cancelling it");
                        token.cancel();
                        pending.extend(paths);
                    }
                }
            }
        };
        match result {
            Ok(outcome) => debug!(
                "Rebuild done: {} failures, {} changed files",
                outcome.failures.len(),
                outcome.changed.len()
            ),
            Err(BuildError::Cancelled) if shutdown.is_cancelled() => break,
            Err(BuildError::Cancelled) => pending.extend(batch),
            Err(e) => warn!("Rebuild failed: {e}"),
        }
    }

    session.stop();
    info!("Stopped watching");
    Ok(())
}

/// Collect further changes until none arrive for `debounce`; false on shutdown
async fn quiet_period(
    rx: &mut UnboundedReceiver<Vec<PathBuf>>,
    pending: &mut IndexSet<PathBuf>,
    debounce: Duration,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(debounce) => return true,
            received = rx.recv() => match received {
                Some(paths) => pending.extend(paths),
                None => return true,
            },
        }
    }
}

fn is_content_change(kind: EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        _ => false,
    }
}

fn is_ignored(path: &std::path::Path, output_dir: &std::path::Path) -> bool {
    path.starts_with(output_dir) || path.components().any(|c| c.as_os_str() == ".git")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind};

    use super::*;

    #[test]
    fn test_content_changes() {
        assert!(is_content_change(EventKind::Create(CreateKind::File)));
        assert!(is_content_change(EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(!is_content_change(EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_content_change(EventKind::Access(AccessKind::Read)));
    }

    #[test]
    fn test_output_and_vcs_paths_are_ignored() {
        let out = Path::new("/project/dist");
        assert!(is_ignored(Path::new("/project/dist/app.js"), out));
        assert!(is_ignored(Path::new("/project/.git/index"), out));
        assert!(!is_ignored(Path::new("/project/src/app.js"), out));
    }
}
