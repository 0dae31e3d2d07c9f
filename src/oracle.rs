use std::collections::{BTreeSet, HashMap, HashSet};

use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info, warn};

use crate::error::{PlatformError, Result};
use crate::models::{OracleValues, TxContext};

pub const DEFAULT_UPDATE_LIMIT_SECONDS: i64 = 7200;

/// Ordered token pair an oracle record is keyed by.
pub type PairKey = (Pubkey, Pubkey);

/// One generation of submitted data for a key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: u64,
    pub key: PairKey,
    pub values: OracleValues,
    pub submitter: Pubkey,
    pub confirmers: BTreeSet<Pubkey>,
    pub committed: bool,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedRecord {
    pub values: OracleValues,
    pub submission_id: u64,
    pub updated_at: i64,
}

/// Multi-confirmer data oracle. A submission becomes the committed value for
/// its key pair once `threshold` distinct confirmers have confirmed it; a newer
/// submission for the same pair supersedes any pending one.
#[derive(Debug, Clone)]
pub struct ConsensusOracle {
    owner: Pubkey,
    confirmers: HashSet<Pubkey>,
    threshold: u32,
    update_limit: i64,
    submissions: Vec<Submission>,
    latest: HashMap<PairKey, u64>,
    committed: HashMap<PairKey, CommittedRecord>,
}

impl ConsensusOracle {
    pub fn new(owner: Pubkey) -> Self {
        Self {
            owner,
            confirmers: HashSet::new(),
            threshold: 1,
            update_limit: DEFAULT_UPDATE_LIMIT_SECONDS,
            submissions: Vec::new(),
            latest: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    pub fn owner(&self) -> Pubkey {
        self.owner
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn update_limit(&self) -> i64 {
        self.update_limit
    }

    pub fn is_confirmer(&self, account: &Pubkey) -> bool {
        self.confirmers.contains(account)
    }

    pub fn submission_count(&self) -> u64 {
        self.submissions.len() as u64
    }

    pub fn submission(&self, id: u64) -> Option<&Submission> {
        self.submissions.get(id as usize)
    }

    /// Confirmers recorded on submission `id`.
    pub fn get_confirmers(&self, id: u64) -> Result<Vec<Pubkey>> {
        let submission = self.submission(id).ok_or(PlatformError::SubmissionNotFound(id))?;
        Ok(submission.confirmers.iter().copied().collect())
    }

    /// Flags or unflags a confirmer. Owner only.
    pub fn set_is_confirmer(&mut self, ctx: &TxContext, account: Pubkey, enabled: bool) -> Result<()> {
        self.require_owner(ctx)?;
        if enabled {
            self.confirmers.insert(account);
        } else {
            if self.confirmers.contains(&account) && self.confirmers.len() as u32 <= self.threshold {
                return Err(PlatformError::InvalidThreshold {
                    threshold: self.threshold,
                    members: self.confirmers.len() as u32 - 1,
                });
            }
            self.confirmers.remove(&account);
        }
        info!("Oracle confirmer {} set to {}", account, enabled);
        Ok(())
    }

    /// Sets the commit threshold. Owner only.
    pub fn set_num_confirmations_required(&mut self, ctx: &TxContext, threshold: u32) -> Result<()> {
        self.require_owner(ctx)?;
        if threshold == 0 || threshold as usize > self.confirmers.len() {
            return Err(PlatformError::InvalidThreshold {
                threshold,
                members: self.confirmers.len() as u32,
            });
        }
        self.threshold = threshold;
        info!("Oracle confirmation threshold set to {}", threshold);
        Ok(())
    }

    /// Sets how long a committed record stays fresh. Owner only.
    pub fn set_update_limit(&mut self, ctx: &TxContext, seconds: i64) -> Result<()> {
        self.require_owner(ctx)?;
        if seconds <= 0 {
            return Err(PlatformError::BadAmount(0));
        }
        self.update_limit = seconds;
        info!("Oracle update limit set to {}s", seconds);
        Ok(())
    }

    /// Opens a new generation for `(key_a, key_b)` seeded with the submitter's
    /// confirmation and returns its id. Commits at once when the threshold is one.
    pub fn submit_data(&mut self, ctx: &TxContext, key_a: Pubkey, key_b: Pubkey, values: OracleValues) -> Result<u64> {
        self.require_confirmer(ctx)?;

        let id = self.submissions.len() as u64;
        let key = (key_a, key_b);
        let mut confirmers = BTreeSet::new();
        confirmers.insert(ctx.caller);
        self.submissions.push(Submission {
            id,
            key,
            values,
            submitter: ctx.caller,
            confirmers,
            committed: false,
            submitted_at: ctx.timestamp,
        });
        if let Some(previous) = self.latest.insert(key, id) {
            debug!("Submission {} supersedes {} for {:?}", id, previous, key);
        }
        info!("Oracle submission {} for ({}, {}) by {}", id, key_a, key_b, ctx.caller);

        self.try_commit(id, ctx.timestamp);
        Ok(id)
    }

    /// Adds the caller's confirmation and commits the values at threshold.
    pub fn confirm_submit(&mut self, ctx: &TxContext, id: u64) -> Result<u32> {
        self.require_confirmer(ctx)?;

        let submission = self.submissions.get_mut(id as usize).ok_or(PlatformError::SubmissionNotFound(id))?;
        if self.latest.get(&submission.key) != Some(&id) {
            return Err(PlatformError::SupersededSubmission(id));
        }
        if !submission.confirmers.insert(ctx.caller) {
            return Err(PlatformError::AlreadyConfirmed { id, operator: ctx.caller });
        }
        let count = submission.confirmers.len() as u32;
        info!("Oracle submission {} confirmed by {} ({}/{})", id, ctx.caller, count, self.threshold);

        self.try_commit(id, ctx.timestamp);
        Ok(count)
    }

    /// Last committed values for the pair, or `None` if no generation ever reached the threshold.
    pub fn get_data(&self, key_a: &Pubkey, key_b: &Pubkey) -> Option<OracleValues> {
        self.committed.get(&(*key_a, *key_b)).map(|record| record.values)
    }

    pub fn committed_record(&self, key_a: &Pubkey, key_b: &Pubkey) -> Option<CommittedRecord> {
        self.committed.get(&(*key_a, *key_b)).copied()
    }

    /// Committed record that is no older than the update limit at `now`.
    pub fn get_fresh_data(&self, key_a: &Pubkey, key_b: &Pubkey, now: i64) -> Result<CommittedRecord> {
        let record = self.committed_record(key_a, key_b).ok_or(PlatformError::NoOracleData)?;
        if now.saturating_sub(record.updated_at) > self.update_limit {
            return Err(PlatformError::StaleOracleData {
                updated_at: record.updated_at,
                update_limit: self.update_limit,
            });
        }
        Ok(record)
    }

    fn try_commit(&mut self, id: u64, now: i64) {
        let threshold = self.threshold;
        let Some(submission) = self.submissions.get_mut(id as usize) else {
            return;
        };
        if submission.committed || (submission.confirmers.len() as u32) < threshold {
            return;
        }

        submission.committed = true;
        self.committed.insert(
            submission.key,
            CommittedRecord {
                values: submission.values,
                submission_id: id,
                updated_at: now,
            },
        );
        info!("Oracle submission {} committed for {:?}", id, submission.key);
    }

    fn require_owner(&self, ctx: &TxContext) -> Result<()> {
        if ctx.caller != self.owner {
            return Err(PlatformError::NotAdmin(ctx.caller));
        }
        Ok(())
    }

    fn require_confirmer(&self, ctx: &TxContext) -> Result<()> {
        if !self.is_confirmer(&ctx.caller) {
            warn!("Only confirmer: rejected {}", ctx.caller);
            return Err(PlatformError::OnlyConfirmer(ctx.caller));
        }
        Ok(())
    }
}
