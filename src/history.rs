//! Tag history (`.deploy-tag`): a newline-separated list of the last ten
//! successfully deployed tags, newest first, used by `rollback` when no
//! explicit `--tag` is given.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const HISTORY_FILE_NAME: &str = ".deploy-tag";
const MAX_ENTRIES: usize = 10;

pub struct TagHistory {
    path: PathBuf,
}

impl TagHistory {
    pub fn at(project_dir: &Path) -> TagHistory {
        TagHistory { path: project_dir.join(HISTORY_FILE_NAME) }
    }

    /// All recorded tags, newest first. Empty if the file has never been
    /// written.
    pub fn tags(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw.lines().map(str::to_string).filter(|l| !l.is_empty()).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    /// The tag currently deployed, i.e. the most recent entry.
    pub fn current(&self) -> Result<Option<String>> {
        Ok(self.tags()?.into_iter().next())
    }

    /// The tag a rollback with no explicit `--tag` should target: the
    /// entry immediately before the current one.
    pub fn previous(&self) -> Result<Option<String>> {
        Ok(self.tags()?.into_iter().nth(1))
    }

    /// Prepends `tag`, de-duplicating an immediate repeat, and truncates
    /// to the last ten entries. Called only after a fully successful
    /// deploy.
    pub fn record(&self, tag: &str) -> Result<()> {
        let mut tags = self.tags()?;
        if tags.first().map(String::as_str) != Some(tag) {
            tags.insert(0, tag.to_string());
        }
        tags.truncate(MAX_ENTRIES);
        let rendered = tags.join("\n") + "\n";
        fs::write(&self.path, rendered).with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_history_returns_none() {
        let dir = tempdir().unwrap();
        let history = TagHistory::at(dir.path());
        assert_eq!(history.current().unwrap(), None);
        assert_eq!(history.previous().unwrap(), None);
    }

    #[test]
    fn record_prepends_newest_first() {
        let dir = tempdir().unwrap();
        let history = TagHistory::at(dir.path());
        history.record("v1").unwrap();
        history.record("v2").unwrap();
        assert_eq!(history.current().unwrap(), Some("v2".to_string()));
        assert_eq!(history.previous().unwrap(), Some("v1".to_string()));
    }

    #[test]
    fn record_truncates_to_ten_entries() {
        let dir = tempdir().unwrap();
        let history = TagHistory::at(dir.path());
        for i in 0..15 {
            history.record(&format!("v{i}")).unwrap();
        }
        let tags = history.tags().unwrap();
        assert_eq!(tags.len(), 10);
        assert_eq!(tags[0], "v14");
    }

    #[test]
    fn repeated_tag_is_not_duplicated() {
        let dir = tempdir().unwrap();
        let history = TagHistory::at(dir.path());
        history.record("v1").unwrap();
        history.record("v1").unwrap();
        assert_eq!(history.tags().unwrap(), vec!["v1".to_string()]);
    }
}
