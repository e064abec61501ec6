//! Watch list maintenance and the file watcher that drives re-uploads.
//!
//! The watch list lives in the user config (`watch` key). A [`WatchSession`]
//! watches the parent directory of every listed file and of the config file,
//! so editors that save by renaming a temp file over the original are seen too.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use anyhow::{Context, Result};
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{DebounceEventResult, Debouncer, FileIdMap, new_debouncer};
use tracing::{debug, warn};

use crate::config::UserConfig;
use crate::runtime::absolutize;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddWatchResult {
    Added(PathBuf),
    AlreadyWatching(PathBuf),
    Missing { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveWatchResult {
    Removed(PathBuf),
    NotWatching(PathBuf),
}

/// Append readable files to the watch list. The caller saves the config.
pub fn add_watch_paths(
    config: &mut UserConfig,
    paths: &[PathBuf],
    cwd: &Path,
) -> Vec<AddWatchResult> {
    paths
        .iter()
        .map(|path| {
            let candidate = absolutize(path, cwd);
            let resolved = match readable_file(&candidate) {
                Ok(resolved) => resolved,
                Err(reason) => {
                    return AddWatchResult::Missing {
                        path: candidate,
                        reason,
                    };
                }
            };
            if config.watch.iter().any(|entry| entry == &resolved) {
                AddWatchResult::AlreadyWatching(resolved)
            } else {
                config.watch.push(resolved.clone());
                AddWatchResult::Added(resolved)
            }
        })
        .collect()
}

fn readable_file(path: &Path) -> Result<PathBuf, String> {
    let resolved = fs::canonicalize(path).map_err(|error| error.to_string())?;
    if !resolved.is_file() {
        return Err("not a regular file".to_string());
    }
    File::open(&resolved).map_err(|error| error.to_string())?;
    Ok(resolved)
}

/// Drop files from the watch list. Files that no longer exist can still be removed.
pub fn remove_watch_paths(
    config: &mut UserConfig,
    paths: &[PathBuf],
    cwd: &Path,
) -> Vec<RemoveWatchResult> {
    paths
        .iter()
        .map(|path| {
            let lexical = absolutize(path, cwd);
            let canonical = fs::canonicalize(&lexical).ok();
            let before = config.watch.len();
            config
                .watch
                .retain(|entry| entry != &lexical && Some(entry) != canonical.as_ref());
            let display = canonical.unwrap_or(lexical);
            if config.watch.len() < before {
                RemoveWatchResult::Removed(display)
            } else {
                RemoveWatchResult::NotWatching(display)
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ConfigChanged,
    FileChanged(PathBuf),
}

/// Turn a batch of changed paths into events for the watched set.
///
/// A config change is reported first; each file at most once, in batch order.
/// Paths outside the watched set are ignored.
pub fn classify_paths(
    changed: &[PathBuf],
    files: &[PathBuf],
    config_path: &Path,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    if changed.iter().any(|path| path == config_path) {
        events.push(WatchEvent::ConfigChanged);
    }
    let mut seen = BTreeSet::new();
    for path in changed {
        if files.contains(path) && seen.insert(path.clone()) {
            events.push(WatchEvent::FileChanged(path.clone()));
        }
    }
    events
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchRegistration {
    Watching(PathBuf),
    Missing(PathBuf),
}

pub struct WatchSession {
    debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    receiver: Receiver<Vec<PathBuf>>,
    config_key: PathBuf,
    files: Vec<PathBuf>,
    watched_dirs: BTreeSet<PathBuf>,
}

impl WatchSession {
    pub fn start(
        config_path: &Path,
        files: &[PathBuf],
        debounce: Duration,
    ) -> Result<(Self, Vec<WatchRegistration>)> {
        let (sender, receiver) = channel::<Vec<PathBuf>>();
        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let paths = events
                        .iter()
                        .filter(|event| {
                            matches!(
                                event.event.kind,
                                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                            )
                        })
                        .flat_map(|event| event.paths.iter().cloned())
                        .collect::<Vec<_>>();
                    if !paths.is_empty() && sender.send(paths).is_err() {
                        debug!("watch receiver dropped; ignoring file events");
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!(%error, "file watcher error");
                    }
                }
            }
        })
        .context("failed to start file watcher")?;

        let mut session = Self {
            debouncer,
            receiver,
            config_key: watch_key(config_path),
            files: Vec::new(),
            watched_dirs: BTreeSet::new(),
        };
        let registrations = session.replace_files(files)?;
        Ok((session, registrations))
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Re-register the watched files, e.g. after the watch list was edited.
    pub fn replace_files(&mut self, files: &[PathBuf]) -> Result<Vec<WatchRegistration>> {
        let mut registrations = Vec::with_capacity(files.len());
        let mut keys = Vec::with_capacity(files.len());
        let mut dirs = BTreeSet::new();
        if let Some(parent) = self.config_key.parent()
            && parent.is_dir()
        {
            dirs.insert(parent.to_path_buf());
        }

        for file in files {
            if !file.is_file() {
                registrations.push(WatchRegistration::Missing(file.clone()));
                continue;
            }
            let key = watch_key(file);
            if let Some(parent) = key.parent() {
                dirs.insert(parent.to_path_buf());
            }
            if !keys.contains(&key) {
                keys.push(key);
            }
            registrations.push(WatchRegistration::Watching(file.clone()));
        }

        self.files = keys;
        sync_watched_dirs(self.debouncer.watcher(), &mut self.watched_dirs, dirs)?;
        Ok(registrations)
    }

    /// Block until a batch touches the config file or a watched file.
    pub fn next_events(&mut self) -> Result<Vec<WatchEvent>> {
        loop {
            let batch = self
                .receiver
                .recv()
                .context("file watcher stopped unexpectedly")?;
            let changed = batch.iter().map(|path| watch_key(path)).collect::<Vec<_>>();
            let events = classify_paths(&changed, &self.files, &self.config_key);
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }
}

/// Directory registration seam over the notify watcher.
trait DirectoryWatcher {
    fn watch_dir(&mut self, dir: &Path) -> Result<()>;
    fn unwatch_dir(&mut self, dir: &Path) -> Result<()>;
}

impl DirectoryWatcher for RecommendedWatcher {
    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        self.watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))
    }

    fn unwatch_dir(&mut self, dir: &Path) -> Result<()> {
        self.unwatch(dir)
            .with_context(|| format!("failed to unwatch {}", dir.display()))
    }
}

/// Bring `watched` to `wanted`, recording each directory as its call succeeds.
fn sync_watched_dirs<W: DirectoryWatcher>(
    watcher: &mut W,
    watched: &mut BTreeSet<PathBuf>,
    wanted: BTreeSet<PathBuf>,
) -> Result<()> {
    let stale = watched.difference(&wanted).cloned().collect::<Vec<_>>();
    for dir in stale {
        if let Err(error) = watcher.unwatch_dir(&dir) {
            debug!(dir = %dir.display(), "{error:#}");
        }
        watched.remove(&dir);
    }
    for dir in wanted {
        if watched.contains(&dir) {
            continue;
        }
        watcher.watch_dir(&dir)?;
        debug!(dir = %dir.display(), "watching directory");
        watched.insert(dir);
    }
    Ok(())
}

/// Stable key for a possibly-deleted file: canonical parent plus file name.
fn watch_key(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::{Result, bail};
    use tempfile::tempdir;

    use super::{
        AddWatchResult, DEFAULT_DEBOUNCE, DirectoryWatcher, RemoveWatchResult, WatchEvent,
        WatchRegistration, WatchSession, add_watch_paths, classify_paths, remove_watch_paths,
        sync_watched_dirs,
    };
    use crate::config::UserConfig;

    #[test]
    fn add_watch_paths_absolutizes_and_deduplicates() {
        let temp = tempdir().expect("tempdir");
        let cwd = fs::canonicalize(temp.path()).expect("canonical tempdir");
        fs::write(cwd.join("notes.txt"), "x").expect("write");
        let mut config = UserConfig::default();

        let results = add_watch_paths(
            &mut config,
            &[PathBuf::from("notes.txt"), PathBuf::from("./notes.txt")],
            &cwd,
        );
        assert_eq!(
            results,
            vec![
                AddWatchResult::Added(cwd.join("notes.txt")),
                AddWatchResult::AlreadyWatching(cwd.join("notes.txt")),
            ]
        );
        assert_eq!(config.watch, vec![cwd.join("notes.txt")]);
    }

    #[test]
    fn add_watch_paths_reports_missing_files_and_directories() {
        let temp = tempdir().expect("tempdir");
        let mut config = UserConfig::default();
        let results = add_watch_paths(
            &mut config,
            &[PathBuf::from("absent.txt"), temp.path().to_path_buf()],
            temp.path(),
        );
        assert!(matches!(
            &results[0],
            AddWatchResult::Missing { path, .. } if path.ends_with("absent.txt")
        ));
        assert!(matches!(
            &results[1],
            AddWatchResult::Missing { reason, .. } if reason == "not a regular file"
        ));
        assert!(config.watch.is_empty());
    }

    #[test]
    fn remove_watch_paths_handles_deleted_and_unknown_files() {
        let temp = tempdir().expect("tempdir");
        let cwd = fs::canonicalize(temp.path()).expect("canonical tempdir");
        let gone = cwd.join("gone.txt");
        let mut config = UserConfig {
            watch: vec![gone.clone(), PathBuf::from("/elsewhere/keep.txt")],
            ..UserConfig::default()
        };

        let results = remove_watch_paths(
            &mut config,
            &[PathBuf::from("gone.txt"), PathBuf::from("never.txt")],
            &cwd,
        );
        assert_eq!(
            results,
            vec![
                RemoveWatchResult::Removed(gone),
                RemoveWatchResult::NotWatching(cwd.join("never.txt")),
            ]
        );
        assert_eq!(config.watch, vec![PathBuf::from("/elsewhere/keep.txt")]);
    }

    #[test]
    fn classify_paths_puts_config_first_and_deduplicates_files() {
        let config = PathBuf::from("/home/dev/.confdoc");
        let a = PathBuf::from("/srv/a.txt");
        let b = PathBuf::from("/srv/b.txt");
        let changed = vec![
            b.clone(),
            PathBuf::from("/srv/.a.txt.swp"),
            a.clone(),
            b.clone(),
            config.clone(),
        ];
        let events = classify_paths(&changed, &[a.clone(), b.clone()], &config);
        assert_eq!(
            events,
            vec![
                WatchEvent::ConfigChanged,
                WatchEvent::FileChanged(b),
                WatchEvent::FileChanged(a),
            ]
        );
    }

    #[test]
    fn classify_paths_ignores_unrelated_batches() {
        let events = classify_paths(
            &[PathBuf::from("/srv/other.txt")],
            &[PathBuf::from("/srv/a.txt")],
            &PathBuf::from("/home/dev/.confdoc"),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn session_reports_missing_files_and_tracks_existing_ones() {
        let temp = tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonical tempdir");
        let present = root.join("present.txt");
        let missing = root.join("missing.txt");
        fs::write(&present, "x").expect("write");

        let (mut session, registrations) = WatchSession::start(
            &root.join(".confdoc"),
            &[present.clone(), missing.clone()],
            DEFAULT_DEBOUNCE,
        )
        .expect("start session");
        assert_eq!(
            registrations,
            vec![
                WatchRegistration::Watching(present.clone()),
                WatchRegistration::Missing(missing),
            ]
        );
        assert_eq!(session.files(), &[present.clone()]);

        let registrations = session.replace_files(&[]).expect("replace");
        assert!(registrations.is_empty());
        assert!(session.files().is_empty());
    }

    #[derive(Default)]
    struct FakeWatcher {
        failing: Option<PathBuf>,
        active: BTreeSet<PathBuf>,
    }

    impl DirectoryWatcher for FakeWatcher {
        fn watch_dir(&mut self, dir: &Path) -> Result<()> {
            if self.failing.as_deref() == Some(dir) {
                bail!("cannot watch {}", dir.display());
            }
            self.active.insert(dir.to_path_buf());
            Ok(())
        }

        fn unwatch_dir(&mut self, dir: &Path) -> Result<()> {
            self.active.remove(dir);
            Ok(())
        }
    }

    #[test]
    fn failed_directory_watch_keeps_the_registered_set_accurate() {
        let mut watcher = FakeWatcher {
            failing: Some(PathBuf::from("/srv/c")),
            ..FakeWatcher::default()
        };
        let mut watched = BTreeSet::new();
        sync_watched_dirs(
            &mut watcher,
            &mut watched,
            BTreeSet::from([PathBuf::from("/srv/a"), PathBuf::from("/srv/old")]),
        )
        .expect("initial sync");

        let error = sync_watched_dirs(
            &mut watcher,
            &mut watched,
            BTreeSet::from([
                PathBuf::from("/srv/a"),
                PathBuf::from("/srv/b"),
                PathBuf::from("/srv/c"),
            ]),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("/srv/c"));
        assert_eq!(watched, watcher.active);
        assert_eq!(
            watched,
            BTreeSet::from([PathBuf::from("/srv/a"), PathBuf::from("/srv/b")])
        );
    }
}
