//! Change-triggered runs: poll a repository and fire when HEAD moves.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::stages::{Revision, SourceRepository};

pub struct RevisionWatcher<R> {
    repository: R,
    last_commit: Option<String>,
}

impl<R: SourceRepository> RevisionWatcher<R> {
    /// The first poll always reports the current revision.
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            last_commit: None,
        }
    }

    /// Starts from a known commit, so only later changes are reported.
    pub fn starting_at(repository: R, commit: impl Into<String>) -> Self {
        Self {
            repository,
            last_commit: Some(commit.into()),
        }
    }

    pub fn poll(&mut self) -> Result<Option<Revision>> {
        let revision = self.repository.head()?;
        if self.last_commit.as_deref() == Some(revision.commit.as_str()) {
            debug!(commit = revision.commit.as_str(), "No new revision");
            return Ok(None);
        }
        info!(
            commit = revision.commit.as_str(),
            previous = self.last_commit.as_deref().unwrap_or("<none>"),
            "New revision detected"
        );
        self.last_commit = Some(revision.commit.clone());
        Ok(Some(revision))
    }

    /// Polls every `interval`, calling `on_change` for each new revision, until
    /// `max_runs` triggers have happened (forever when `None`). Returns the
    /// number of triggers.
    pub fn watch<F>(
        &mut self,
        interval: Duration,
        max_runs: Option<usize>,
        mut on_change: F,
    ) -> Result<usize>
    where
        F: FnMut(&Revision) -> Result<()>,
    {
        let mut runs = 0;
        let mut first = true;
        while max_runs.is_none_or(|max| runs < max) {
            if !first {
                thread::sleep(interval);
            }
            first = false;
            if let Some(revision) = self.poll()? {
                on_change(&revision)?;
                runs += 1;
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Yields the queued commits in order, repeating the last one.
    struct Scripted {
        path: PathBuf,
        commits: Mutex<Vec<&'static str>>,
    }

    impl SourceRepository for Scripted {
        fn location(&self) -> &Path {
            &self.path
        }

        fn head(&self) -> std::result::Result<Revision, ExecutionError> {
            let mut commits = self.commits.lock().unwrap();
            let commit = if commits.len() > 1 {
                commits.remove(0)
            } else {
                commits[0]
            };
            Ok(Revision {
                commit: commit.to_string(),
                branch: Some("main".into()),
                message: None,
            })
        }
    }

    fn scripted(commits: Vec<&'static str>) -> Scripted {
        Scripted {
            path: PathBuf::from("/srv/repo"),
            commits: Mutex::new(commits),
        }
    }

    #[test]
    fn reports_only_changes() {
        let mut watcher = RevisionWatcher::new(scripted(vec!["a", "a", "b", "b"]));
        assert_eq!(watcher.poll().unwrap().unwrap().commit, "a");
        assert!(watcher.poll().unwrap().is_none());
        assert_eq!(watcher.poll().unwrap().unwrap().commit, "b");
        assert!(watcher.poll().unwrap().is_none());
    }

    #[test]
    fn starting_commit_is_not_reported() {
        let mut watcher = RevisionWatcher::starting_at(scripted(vec!["a", "b"]), "a");
        assert!(watcher.poll().unwrap().is_none());
        assert_eq!(watcher.poll().unwrap().unwrap().commit, "b");
    }

    #[test]
    fn watch_stops_after_max_runs() {
        let mut watcher = RevisionWatcher::new(scripted(vec!["a", "a", "b", "c"]));
        let mut seen = Vec::new();
        let runs = watcher
            .watch(Duration::ZERO, Some(2), |revision| {
                seen.push(revision.commit.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(runs, 2);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn zero_max_runs_never_polls() {
        let repository = scripted(vec!["a"]);
        repository.commits.lock().unwrap().clear();
        let mut watcher = RevisionWatcher::new(repository);
        let runs = watcher
            .watch(Duration::ZERO, Some(0), |_| panic!("no run expected"))
            .unwrap();
        assert_eq!(runs, 0);
    }
}
