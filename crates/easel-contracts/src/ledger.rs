use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Free generations granted to every user before purchases or rewards.
pub const FREE_GENERATION_LIMIT: u64 = 10;

/// Generations credited to the referrer when a referred user completes
/// their first generation. Also the number quoted in user-facing copy.
pub const REFERRAL_REWARD: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    #[serde(default)]
    pub used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_generation_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referrals: Vec<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub referral_bonus_given: bool,
}

impl QuotaRecord {
    pub fn remaining(&self) -> u64 {
        FREE_GENERATION_LIMIT.saturating_sub(self.used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub used: u64,
    pub remaining: u64,
}

/// Result of a debit attempt. `Exhausted` means another action spent the
/// last credit between the caller's quota check and this debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Debit {
    Applied {
        used: u64,
        remaining: u64,
        first_generation: bool,
        rewarded_referrer: Option<u64>,
    },
    Exhausted {
        used: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferralStats {
    pub referrer_id: Option<u64>,
    pub referrals_count: usize,
    pub referrals_with_generations: usize,
    pub earned: u64,
}

/// Durable per-user usage counters and referral bookkeeping.
///
/// One JSON object keyed by stringified user id. Every mutation is a single
/// read-modify-write under `state`, and every save goes through a temp file
/// rename, so concurrent handlers cannot interleave partial updates.
#[derive(Debug)]
pub struct QuotaLedger {
    path: PathBuf,
    state: Mutex<BTreeMap<String, QuotaRecord>>,
}

impl QuotaLedger {
    /// Opens the ledger, loading existing records. A file that exists but
    /// does not parse is an error: truncating usage data to an empty map
    /// would silently refund every user.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("quota ledger unreadable: {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
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

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, user_id: u64) -> Result<QuotaRecord> {
        let state = self.lock()?;
        Ok(state.get(&key(user_id)).cloned().unwrap_or_default())
    }

    pub fn can_generate(&self, user_id: u64) -> Result<QuotaStatus> {
        let record = self.record(user_id)?;
        let remaining = record.remaining();
        Ok(QuotaStatus {
            allowed: remaining > 0,
            used: record.used,
            remaining,
        })
    }

    /// Debits one generation. On the user's first generation this also
    /// triggers the one-time referrer reward.
    pub fn use_generation(&self, user_id: u64) -> Result<Debit> {
        let mut state = self.lock()?;
        let record = state.entry(key(user_id)).or_default();
        if record.remaining() == 0 {
            return Ok(Debit::Exhausted { used: record.used });
        }

        let first_generation = record.first_generation_at.is_none();
        if first_generation {
            record.first_generation_at = Some(now_utc_iso());
        }
        record.used += 1;
        let used = record.used;
        let remaining = record.remaining();

        let rewarded_referrer = if first_generation {
            Self::reward_referrer(&mut state, user_id)
        } else {
            None
        };

        self.save(&state)?;
        Ok(Debit::Applied {
            used,
            remaining,
            first_generation,
            rewarded_referrer,
        })
    }

    /// Credits generations by lowering `used`, clamped at zero.
    pub fn add_generations(&self, user_id: u64, amount: u64) -> Result<QuotaStatus> {
        let mut state = self.lock()?;
        let record = state.entry(key(user_id)).or_default();
        record.used = record.used.saturating_sub(amount);
        let status = QuotaStatus {
            allowed: record.remaining() > 0,
            used: record.used,
            remaining: record.remaining(),
        };
        self.save(&state)?;
        Ok(status)
    }

    /// Links `user_id` to `referrer_id`. Fails on self-referral and when a
    /// referrer is already recorded; the first link wins permanently.
    pub fn register_referral(&self, user_id: u64, referrer_id: u64) -> Result<bool> {
        if user_id == referrer_id {
            return Ok(false);
        }
        let mut state = self.lock()?;
        let record = state.entry(key(user_id)).or_default();
        if record.referrer_id.is_some() {
            return Ok(false);
        }
        record.referrer_id = Some(referrer_id);

        let referrer = state.entry(key(referrer_id)).or_default();
        if !referrer.referrals.contains(&user_id) {
            referrer.referrals.push(user_id);
        }
        self.save(&state)?;
        Ok(true)
    }

    pub fn referral_stats(&self, user_id: u64) -> Result<ReferralStats> {
        let state = self.lock()?;
        let record = state.get(&key(user_id)).cloned().unwrap_or_default();
        let referrals_with_generations = record
            .referrals
            .iter()
            .filter(|referred| {
                state
                    .get(&key(**referred))
                    .map(|row| row.first_generation_at.is_some())
                    .unwrap_or(false)
            })
            .count();
        Ok(ReferralStats {
            referrer_id: record.referrer_id,
            referrals_count: record.referrals.len(),
            referrals_with_generations,
            earned: referrals_with_generations as u64 * REFERRAL_REWARD,
        })
    }

    pub fn all_users(&self) -> Result<Vec<(u64, QuotaRecord)>> {
        let state = self.lock()?;
        let mut rows: Vec<(u64, QuotaRecord)> = state
            .iter()
            .filter_map(|(id, record)| id.parse::<u64>().ok().map(|id| (id, record.clone())))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        Ok(rows)
    }

    fn reward_referrer(
        state: &mut BTreeMap<String, QuotaRecord>,
        user_id: u64,
    ) -> Option<u64> {
        let record = state.get_mut(&key(user_id))?;
        if record.referral_bonus_given {
            return None;
        }
        let referrer_id = record.referrer_id?;
        record.referral_bonus_given = true;
        let referrer = state.entry(key(referrer_id)).or_default();
        referrer.used = referrer.used.saturating_sub(REFERRAL_REWARD);
        Some(referrer_id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, QuotaRecord>>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("quota ledger lock poisoned"))
    }

    fn save(&self, state: &BTreeMap<String, QuotaRecord>) -> Result<()> {
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

fn key(user_id: u64) -> String {
    user_id.to_string()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn debit_remaining(debit: &Debit) -> u64 {
        match debit {
            Debit::Applied { remaining, .. } => *remaining,
            Debit::Exhausted { .. } => 0,
        }
    }

    #[test]
    fn fresh_user_counts_down_to_zero() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;

        for step in 1..=FREE_GENERATION_LIMIT {
            let debit = ledger.use_generation(7)?;
            assert_eq!(debit_remaining(&debit), FREE_GENERATION_LIMIT - step);
        }

        let status = ledger.can_generate(7)?;
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(
            ledger.use_generation(7)?,
            Debit::Exhausted {
                used: FREE_GENERATION_LIMIT
            }
        );
        Ok(())
    }

    #[test]
    fn add_generations_clamps_used_at_zero() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;

        for _ in 0..3 {
            ledger.use_generation(1)?;
        }
        let status = ledger.add_generations(1, 50)?;
        assert_eq!(status.used, 0);
        assert_eq!(status.remaining, FREE_GENERATION_LIMIT);

        let again = ledger.add_generations(1, 5)?;
        assert_eq!(again.used, 0);
        Ok(())
    }

    #[test]
    fn self_referral_is_rejected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;
        assert!(!ledger.register_referral(5, 5)?);
        assert_eq!(ledger.record(5)?.referrer_id, None);
        Ok(())
    }

    #[test]
    fn first_referrer_wins() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;

        assert!(ledger.register_referral(1, 2)?);
        assert!(!ledger.register_referral(1, 3)?);
        assert_eq!(ledger.record(1)?.referrer_id, Some(2));
        assert_eq!(ledger.record(2)?.referrals, vec![1]);
        assert!(ledger.record(3)?.referrals.is_empty());
        Ok(())
    }

    #[test]
    fn referral_bonus_fires_once_on_first_generation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;

        // Referrer B has burned seven credits so the reward is visible.
        for _ in 0..7 {
            ledger.use_generation(2)?;
        }
        assert_eq!(ledger.can_generate(2)?.remaining, 3);

        assert!(ledger.register_referral(1, 2)?);
        let first = ledger.use_generation(1)?;
        match first {
            Debit::Applied {
                first_generation,
                rewarded_referrer,
                ..
            } => {
                assert!(first_generation);
                assert_eq!(rewarded_referrer, Some(2));
            }
            Debit::Exhausted { .. } => panic!("fresh user must have credit"),
        }
        assert_eq!(
            ledger.can_generate(2)?.remaining,
            3 + REFERRAL_REWARD
        );

        let second = ledger.use_generation(1)?;
        match second {
            Debit::Applied {
                first_generation,
                rewarded_referrer,
                ..
            } => {
                assert!(!first_generation);
                assert_eq!(rewarded_referrer, None);
            }
            Debit::Exhausted { .. } => panic!("user still has credit"),
        }
        assert_eq!(ledger.can_generate(2)?.remaining, 3 + REFERRAL_REWARD);
        assert!(ledger.record(1)?.referral_bonus_given);
        Ok(())
    }

    #[test]
    fn referral_registered_after_first_generation_never_rewards() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;

        ledger.use_generation(1)?;
        assert!(ledger.register_referral(1, 2)?);
        ledger.use_generation(1)?;
        assert_eq!(ledger.record(2)?.used, 0);
        assert!(!ledger.record(1)?.referral_bonus_given);
        Ok(())
    }

    #[test]
    fn corrupt_file_fails_open() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("limits.json");
        std::fs::write(&path, "{not json")?;
        assert!(QuotaLedger::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn state_survives_reopen() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("limits.json");
        {
            let ledger = QuotaLedger::open(&path)?;
            ledger.use_generation(9)?;
            ledger.register_referral(9, 4)?;
        }
        let reopened = QuotaLedger::open(&path)?;
        let record = reopened.record(9)?;
        assert_eq!(record.used, 1);
        assert_eq!(record.referrer_id, Some(4));
        assert!(record.first_generation_at.is_some());
        Ok(())
    }

    #[test]
    fn referral_stats_count_activated_referrals() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = QuotaLedger::open(temp.path().join("limits.json"))?;

        ledger.register_referral(10, 1)?;
        ledger.register_referral(11, 1)?;
        ledger.use_generation(10)?;

        let stats = ledger.referral_stats(1)?;
        assert_eq!(stats.referrals_count, 2);
        assert_eq!(stats.referrals_with_generations, 1);
        assert_eq!(stats.earned, REFERRAL_REWARD);
        Ok(())
    }

    #[test]
    fn concurrent_debits_do_not_lose_updates() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = Arc::new(QuotaLedger::open(temp.path().join("limits.json"))?);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.use_generation(3).map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("debit thread panicked"))??;
        }

        assert_eq!(ledger.record(3)?.used, 8);
        Ok(())
    }
}
