use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Watches `root` recursively and forwards every created, modified or
/// renamed-to path. Removals are not reported. The watcher stops when dropped.
pub fn start_notify_watcher(
    root: &Path,
    tx: mpsc::UnboundedSender<PathBuf>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for path in changed_paths(event) {
                let _ = tx.send(path);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn changed_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            // rename pairs carry (from, to); only the destination has content
            event.paths.into_iter().last().into_iter().collect()
        }
        EventKind::Create(_) | EventKind::Modify(_) => event.paths,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modify_event_reports_path() {
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![PathBuf::from("/tmp/root/Docs/A.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            changed_paths(event),
            vec![PathBuf::from("/tmp/root/Docs/A.txt")]
        );
    }

    #[test]
    fn rename_reports_destination_only() {
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![
                PathBuf::from("/tmp/root/Docs/A.txt"),
                PathBuf::from("/tmp/root/Docs/B.txt"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(
            changed_paths(event),
            vec![PathBuf::from("/tmp/root/Docs/B.txt")]
        );
    }

    #[test]
    fn removals_are_ignored() {
        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/tmp/root/gone.txt")],
            attrs: Default::default(),
        };
        assert!(changed_paths(event).is_empty());
    }
}
