use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use votematch_core::{
    BallotStats, FactionId, FactionTally, Poll, PollId, QuestionRecord, Stance, SynthesizedQuestion, UserChoice,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("poll {0} not found")]
    PollNotFound(PollId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Listing filter for [`PollStore::list_polls`].
#[derive(Debug, Clone, Default)]
pub struct PollFilter {
    pub theme: Option<String>,
    pub limit: Option<usize>,
}

/// Keyed, upsert-only persistence for the pipeline and the citizen surface.
///
/// Every write is idempotent on its natural key: polls on id, tallies on
/// (poll, faction), questions on poll, citizen ballots on (poll, session).
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn poll_exists(&self, poll_id: PollId) -> Result<bool, StoreError>;

    async fn upsert_poll(&self, poll: &Poll) -> Result<(), StoreError>;

    async fn poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError>;

    /// Newest first by poll date, then by id.
    async fn list_polls(&self, filter: &PollFilter) -> Result<Vec<Poll>, StoreError>;

    /// Atomically replace the tallies of one poll. Factions missing from
    /// `tallies` are removed. An empty slice leaves stored tallies untouched.
    async fn replace_tallies(&self, poll_id: PollId, tallies: &[FactionTally]) -> Result<(), StoreError>;

    async fn tallies_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, Vec<FactionTally>>, StoreError>;

    async fn question(&self, poll_id: PollId) -> Result<Option<QuestionRecord>, StoreError>;

    async fn questions_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, QuestionRecord>, StoreError>;

    /// Overwrites the synthesized fields; a cached deep explanation survives.
    async fn upsert_question(&self, poll_id: PollId, question: &SynthesizedQuestion) -> Result<(), StoreError>;

    async fn flips_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, bool>, StoreError> {
        Ok(self
            .questions_for(poll_ids)
            .await?
            .into_iter()
            .map(|(id, q)| (id, q.vote_flip))
            .collect())
    }

    async fn set_deep_explanation(&self, poll_id: PollId, text: &str) -> Result<(), StoreError>;

    async fn record_ballot(&self, session_id: &str, poll_id: PollId, stance: Stance) -> Result<(), StoreError>;

    async fn clear_ballot(&self, session_id: &str, poll_id: PollId) -> Result<(), StoreError>;

    async fn session_ballots(&self, session_id: &str) -> Result<BTreeMap<PollId, UserChoice>, StoreError>;

    async fn ballot_stats(&self, poll_id: PollId) -> Result<BallotStats, StoreError>;

    /// Drop question rows so the next sync regenerates them. Returns rows removed.
    async fn reset_questions(&self, poll_id: Option<PollId>) -> Result<u64, StoreError>;

    /// Claim the named job for `holder` unless another holder has a live lease.
    async fn try_acquire_lease(&self, job: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn release_lease(&self, job: &str, holder: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    polls: BTreeMap<PollId, Poll>,
    tallies: BTreeMap<PollId, BTreeMap<FactionId, FactionTally>>,
    questions: BTreeMap<PollId, QuestionRecord>,
    ballots: BTreeMap<(PollId, String), Stance>,
    leases: HashMap<String, (String, Instant)>,
    failing_polls: HashSet<PollId>,
}

/// In-process store for tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryPollStore {
    state: Mutex<MemoryState>,
}

impl MemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write touching `poll_id` fail.
    pub async fn fail_writes_for(&self, poll_id: PollId) {
        self.state.lock().await.failing_polls.insert(poll_id);
    }

    fn check_writable(state: &MemoryState, poll_id: PollId) -> Result<(), StoreError> {
        if state.failing_polls.contains(&poll_id) {
            return Err(StoreError::Unavailable(format!("writes for poll {poll_id} are failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn poll_exists(&self, poll_id: PollId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.polls.contains_key(&poll_id))
    }

    async fn upsert_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state, poll.id)?;
        state.polls.insert(poll.id, poll.clone());
        Ok(())
    }

    async fn poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError> {
        Ok(self.state.lock().await.polls.get(&poll_id).cloned())
    }

    async fn list_polls(&self, filter: &PollFilter) -> Result<Vec<Poll>, StoreError> {
        let state = self.state.lock().await;
        let mut polls: Vec<Poll> = state
            .polls
            .values()
            .filter(|p| match &filter.theme {
                Some(theme) => p.theme.as_deref() == Some(theme.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        polls.sort_by(|a, b| b.poll_date.cmp(&a.poll_date).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            polls.truncate(limit);
        }
        Ok(polls)
    }

    async fn replace_tallies(&self, poll_id: PollId, tallies: &[FactionTally]) -> Result<(), StoreError> {
        if tallies.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        Self::check_writable(&state, poll_id)?;
        let rows = tallies
            .iter()
            .map(|t| {
                (
                    t.faction_id,
                    FactionTally {
                        poll_id,
                        ..t.clone()
                    },
                )
            })
            .collect();
        state.tallies.insert(poll_id, rows);
        Ok(())
    }

    async fn tallies_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, Vec<FactionTally>>, StoreError> {
        let state = self.state.lock().await;
        Ok(poll_ids
            .iter()
            .filter_map(|id| {
                state
                    .tallies
                    .get(id)
                    .map(|rows| (*id, rows.values().cloned().collect()))
            })
            .collect())
    }

    async fn question(&self, poll_id: PollId) -> Result<Option<QuestionRecord>, StoreError> {
        Ok(self.state.lock().await.questions.get(&poll_id).cloned())
    }

    async fn questions_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, QuestionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(poll_ids
            .iter()
            .filter_map(|id| state.questions.get(id).map(|q| (*id, q.clone())))
            .collect())
    }

    async fn upsert_question(&self, poll_id: PollId, question: &SynthesizedQuestion) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state, poll_id)?;
        let deep = state.questions.get(&poll_id).and_then(|q| q.deep_explanation.clone());
        let mut record = question.clone().into_record(poll_id);
        record.deep_explanation = deep;
        state.questions.insert(poll_id, record);
        Ok(())
    }

    async fn set_deep_explanation(&self, poll_id: PollId, text: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state, poll_id)?;
        let record = state.questions.entry(poll_id).or_insert_with(|| QuestionRecord {
            poll_id,
            ..Default::default()
        });
        record.deep_explanation = Some(text.to_string());
        Ok(())
    }

    async fn record_ballot(&self, session_id: &str, poll_id: PollId, stance: Stance) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.polls.contains_key(&poll_id) {
            return Err(StoreError::PollNotFound(poll_id));
        }
        state.ballots.insert((poll_id, session_id.to_string()), stance);
        Ok(())
    }

    async fn clear_ballot(&self, session_id: &str, poll_id: PollId) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .ballots
            .remove(&(poll_id, session_id.to_string()));
        Ok(())
    }

    async fn session_ballots(&self, session_id: &str) -> Result<BTreeMap<PollId, UserChoice>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ballots
            .iter()
            .filter(|((_, session), _)| session == session_id)
            .map(|((poll_id, _), stance)| (*poll_id, UserChoice::from(*stance)))
            .collect())
    }

    async fn ballot_stats(&self, poll_id: PollId) -> Result<BallotStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = BallotStats::default();
        for ((id, _), stance) in &state.ballots {
            if *id != poll_id {
                continue;
            }
            match stance {
                Stance::Yes => stats.total_yes += 1,
                Stance::No => stats.total_no += 1,
            }
        }
        Ok(stats)
    }

    async fn reset_questions(&self, poll_id: Option<PollId>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        match poll_id {
            Some(id) => Ok(u64::from(state.questions.remove(&id).is_some())),
            None => {
                let removed = state.questions.len() as u64;
                state.questions.clear();
                Ok(removed)
            }
        }
    }

    async fn try_acquire_lease(&self, job: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((current, expires_at)) = state.leases.get(job) {
            if current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        state.leases.insert(job.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, job: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.get(job).is_some_and(|(current, _)| current == holder) {
            state.leases.remove(job);
        }
        Ok(())
    }
}
