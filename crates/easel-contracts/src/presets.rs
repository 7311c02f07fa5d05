use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Named parameter bundle a user can re-apply with one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub created: String,
}

type PresetMap = BTreeMap<String, BTreeMap<String, Preset>>;

/// File-backed preset store keyed by (user id, preset name). Same locking
/// and atomic-save discipline as the quota ledger.
#[derive(Debug)]
pub struct PresetStore {
    path: PathBuf,
    state: Mutex<PresetMap>,
}

impl PresetStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("preset store unreadable: {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PresetMap::new(),
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

    /// Stores a preset under a new name. Returns false without writing
    /// when the name is already taken.
    pub fn save(&self, user_id: u64, name: &str, mut preset: Preset) -> Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let mut state = self.lock()?;
        let user = state.entry(user_id.to_string()).or_default();
        if user.contains_key(name) {
            return Ok(false);
        }
        if preset.created.is_empty() {
            preset.created = now_utc_iso();
        }
        user.insert(name.to_string(), preset);
        self.persist(&state)?;
        Ok(true)
    }

    pub fn get(&self, user_id: u64, name: &str) -> Result<Option<Preset>> {
        let state = self.lock()?;
        Ok(state
            .get(&user_id.to_string())
            .and_then(|user| user.get(name.trim()))
            .cloned())
    }

    pub fn list(&self, user_id: u64) -> Result<Vec<(String, Preset)>> {
        let state = self.lock()?;
        Ok(state
            .get(&user_id.to_string())
            .map(|user| {
                user.iter()
                    .map(|(name, preset)| (name.clone(), preset.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn delete(&self, user_id: u64, name: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state
            .get_mut(&user_id.to_string())
            .map(|user| user.remove(name.trim()).is_some())
            .unwrap_or(false);
        if removed {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    /// Renames a preset; refuses when the source is missing or the target
    /// name is taken.
    pub fn rename(&self, user_id: u64, from: &str, to: &str) -> Result<bool> {
        let to = to.trim();
        if to.is_empty() {
            return Ok(false);
        }
        let mut state = self.lock()?;
        let Some(user) = state.get_mut(&user_id.to_string()) else {
            return Ok(false);
        };
        if user.contains_key(to) {
            return Ok(false);
        }
        let Some(preset) = user.remove(from.trim()) else {
            return Ok(false);
        };
        user.insert(to.to_string(), preset);
        self.persist(&state)?;
        Ok(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PresetMap>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("preset store lock poisoned"))
    }

    fn persist(&self, state: &PresetMap) -> Result<()> {
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

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
