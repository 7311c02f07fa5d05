use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use uuid::Uuid;

/// Entries kept per user; the oldest fall off the end.
pub const MAX_HISTORY_PER_USER: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub ts: String,
    pub task: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_prompt: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    pub path: PathBuf,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_diff: Option<Vec<String>>,
}

/// What the pipeline hands over after a successful generation; the store
/// fills in id, timestamp and the diff against the previous prompt.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub task: String,
    pub prompt: String,
    pub final_prompt: Option<String>,
    pub provider: String,
    pub model: String,
    pub format: Option<String>,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
    pub locator: Option<String>,
    pub path: PathBuf,
}

type HistoryMap = BTreeMap<String, Vec<HistoryEntry>>;

/// Per-user generation log, newest first, capped at
/// [`MAX_HISTORY_PER_USER`].
#[derive(Debug)]
pub struct GenerationHistory {
    path: PathBuf,
    state: Mutex<HistoryMap>,
}

impl GenerationHistory {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("history unreadable: {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HistoryMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading {}", path.display()))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn add(&self, user_id: u64, entry: NewEntry) -> Result<HistoryEntry> {
        let mut state = self.lock()?;
        let rows = state.entry(user_id.to_string()).or_default();
        let previous_prompt = rows.first().map(|row| row.prompt.clone());

        let diff = prompt_diff(previous_prompt.as_deref(), &entry.prompt);
        let entry = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            ts: now_utc_iso(),
            task: entry.task,
            prompt: entry.prompt,
            final_prompt: entry.final_prompt,
            provider: entry.provider,
            model: entry.model,
            format: entry.format,
            style: entry.style,
            negative_prompt: entry.negative_prompt,
            locator: entry.locator,
            path: entry.path,
            favorite: false,
            prompt_diff: diff,
        };

        rows.insert(0, entry.clone());
        rows.truncate(MAX_HISTORY_PER_USER);
        self.persist(&state)?;
        Ok(entry)
    }

    pub fn list(&self, user_id: u64, limit: usize) -> Result<Vec<HistoryEntry>> {
        let state = self.lock()?;
        Ok(state
            .get(&user_id.to_string())
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    pub fn favorites(&self, user_id: u64) -> Result<Vec<HistoryEntry>> {
        let state = self.lock()?;
        Ok(state
            .get(&user_id.to_string())
            .map(|rows| rows.iter().filter(|row| row.favorite).cloned().collect())
            .unwrap_or_default())
    }

    /// Flips the favorite flag; returns the new state, or None when the
    /// entry does not exist.
    pub fn toggle_favorite(&self, user_id: u64, entry_id: &str) -> Result<Option<bool>> {
        let mut state = self.lock()?;
        let flipped = state
            .get_mut(&user_id.to_string())
            .and_then(|rows| rows.iter_mut().find(|row| row.id == entry_id))
            .map(|row| {
                row.favorite = !row.favorite;
                row.favorite
            });
        if flipped.is_some() {
            self.persist(&state)?;
        }
        Ok(flipped)
    }

    pub fn count(&self, user_id: u64) -> Result<usize> {
        let state = self.lock()?;
        Ok(state
            .get(&user_id.to_string())
            .map(Vec::len)
            .unwrap_or(0))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HistoryMap>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))
    }

    fn persist(&self, state: &HistoryMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).with_context(|| format!("failed writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn prompt_diff(prev: Option<&str>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    if prev == curr {
        return None;
    }
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    Some(rendered.lines().map(str::to_string).collect())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prompt: &str) -> NewEntry {
        NewEntry {
            task: "text_to_image".to_string(),
            prompt: prompt.to_string(),
            final_prompt: None,
            provider: "stability".to_string(),
            model: "sd3.5-large".to_string(),
            format: Some("1:1".to_string()),
            style: None,
            negative_prompt: None,
            locator: None,
            path: PathBuf::from("/tmp/out.png"),
        }
    }

    #[test]
    fn newest_entry_comes_first() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::open(temp.path().join("history.json"))?;

        history.add(1, entry("first"))?;
        history.add(1, entry("second"))?;

        let rows = history.list(1, 10)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].prompt, "second");
        assert_eq!(rows[1].prompt, "first");
        Ok(())
    }

    #[test]
    fn cap_evicts_oldest() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::open(temp.path().join("history.json"))?;

        for idx in 0..(MAX_HISTORY_PER_USER + 5) {
            history.add(1, entry(&format!("prompt {idx}")))?;
        }

        assert_eq!(history.count(1)?, MAX_HISTORY_PER_USER);
        let rows = history.list(1, MAX_HISTORY_PER_USER)?;
        assert_eq!(rows[0].prompt, format!("prompt {}", MAX_HISTORY_PER_USER + 4));
        assert!(rows.iter().all(|row| row.prompt != "prompt 0"));
        Ok(())
    }

    #[test]
    fn favorite_toggle_round_trips() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::open(temp.path().join("history.json"))?;

        let added = history.add(1, entry("keep me"))?;
        assert_eq!(history.toggle_favorite(1, &added.id)?, Some(true));
        assert_eq!(history.favorites(1)?.len(), 1);
        assert_eq!(history.toggle_favorite(1, &added.id)?, Some(false));
        assert!(history.favorites(1)?.is_empty());
        assert_eq!(history.toggle_favorite(1, "missing")?, None);
        Ok(())
    }

    #[test]
    fn prompt_diff_tracks_refinement_chain() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let history = GenerationHistory::open(temp.path().join("history.json"))?;

        let first = history.add(1, entry("a red fox"))?;
        assert!(first.prompt_diff.is_none());

        let second = history.add(1, entry("a red fox at night"))?;
        let diff = second.prompt_diff.expect("diff for changed prompt");
        assert!(diff.iter().any(|line| line.contains("a red fox at night")));
        Ok(())
    }

    #[test]
    fn history_survives_reopen() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("history.json");
        {
            let history = GenerationHistory::open(&path)?;
            history.add(1, entry("persisted"))?;
        }
        let reopened = GenerationHistory::open(&path)?;
        assert_eq!(reopened.list(1, 1)?[0].prompt, "persisted");
        Ok(())
    }
}
