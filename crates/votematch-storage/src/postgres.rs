use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use votematch_core::{
    BallotStats, FactionTally, Poll, PollId, QuestionRecord, RelatedLink, Stance, SynthesizedQuestion, UserChoice,
};

use crate::store::{PollFilter, PollStore, StoreError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// [`PollStore`] backed by Postgres.
#[derive(Debug, Clone)]
pub struct PgPollStore {
    pool: PgPool,
}

impl PgPollStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn count_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn count_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn poll_from_row(row: &PgRow) -> Result<Poll, sqlx::Error> {
    let links: Json<Vec<RelatedLink>> = row.try_get("related_links")?;
    Ok(Poll {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        description: row.try_get("description")?,
        poll_date: row.try_get("poll_date")?,
        accepted: row.try_get("accepted")?,
        legislature_id: row.try_get("legislature_id")?,
        topics: row.try_get("topics")?,
        related_links: links.0,
        theme: row.try_get("theme")?,
    })
}

fn tally_from_row(row: &PgRow) -> Result<FactionTally, sqlx::Error> {
    Ok(FactionTally {
        poll_id: row.try_get("poll_id")?,
        faction_id: row.try_get("faction_id")?,
        faction_label: row.try_get("faction_label")?,
        yes: count_from_db(row.try_get("votes_yes")?),
        no: count_from_db(row.try_get("votes_no")?),
        abstain: count_from_db(row.try_get("votes_abstain")?),
        absent: count_from_db(row.try_get("votes_absent")?),
    })
}

fn question_from_row(row: &PgRow) -> Result<QuestionRecord, sqlx::Error> {
    Ok(QuestionRecord {
        poll_id: row.try_get("poll_id")?,
        question: row.try_get("question")?,
        simplified_title: row.try_get("simplified_title")?,
        explanation: row.try_get("explanation")?,
        vote_flip: row.try_get("vote_flip")?,
        originator: row.try_get("originator")?,
        model_used: row.try_get("model_used")?,
        deep_explanation: row.try_get("deep_explanation")?,
    })
}

fn stance_to_db(stance: Stance) -> &'static str {
    match stance {
        Stance::Yes => "yes",
        Stance::No => "no",
    }
}

const POLL_COLUMNS: &str =
    "id, label, description, poll_date, accepted, legislature_id, topics, related_links, theme";

const QUESTION_COLUMNS: &str =
    "poll_id, question, simplified_title, explanation, vote_flip, originator, model_used, deep_explanation";

#[async_trait]
impl PollStore for PgPollStore {
    async fn poll_exists(&self, poll_id: PollId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM polls WHERE id = $1)")
            .bind(poll_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn upsert_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO polls (id, label, description, poll_date, accepted, legislature_id, topics, related_links, theme)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
               SET label = EXCLUDED.label,
                   description = EXCLUDED.description,
                   poll_date = EXCLUDED.poll_date,
                   accepted = EXCLUDED.accepted,
                   legislature_id = EXCLUDED.legislature_id,
                   topics = EXCLUDED.topics,
                   related_links = EXCLUDED.related_links,
                   theme = EXCLUDED.theme,
                   updated_at = NOW()
            "#,
        )
        .bind(poll.id)
        .bind(&poll.label)
        .bind(&poll.description)
        .bind(poll.poll_date)
        .bind(poll.accepted)
        .bind(poll.legislature_id)
        .bind(&poll.topics)
        .bind(Json(&poll.related_links))
        .bind(&poll.theme)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError> {
        let row = sqlx::query(&format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"))
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(poll_from_row).transpose()?)
    }

    async fn list_polls(&self, filter: &PollFilter) -> Result<Vec<Poll>, StoreError> {
        let limit = filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(&format!(
            r#"
            SELECT {POLL_COLUMNS}
              FROM polls
             WHERE ($1::text IS NULL OR theme = $1)
             ORDER BY poll_date DESC NULLS LAST, id DESC
             LIMIT $2
            "#
        ))
        .bind(&filter.theme)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(poll_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn replace_tallies(&self, poll_id: PollId, tallies: &[FactionTally]) -> Result<(), StoreError> {
        if tallies.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for tally in tallies {
            sqlx::query(
                r#"
                INSERT INTO faction_tallies
                    (poll_id, faction_id, faction_label, votes_yes, votes_no, votes_abstain, votes_absent)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (poll_id, faction_id) DO UPDATE
                   SET faction_label = EXCLUDED.faction_label,
                       votes_yes = EXCLUDED.votes_yes,
                       votes_no = EXCLUDED.votes_no,
                       votes_abstain = EXCLUDED.votes_abstain,
                       votes_absent = EXCLUDED.votes_absent,
                       updated_at = NOW()
                "#,
            )
            .bind(poll_id)
            .bind(tally.faction_id)
            .bind(&tally.faction_label)
            .bind(count_to_db(tally.yes))
            .bind(count_to_db(tally.no))
            .bind(count_to_db(tally.abstain))
            .bind(count_to_db(tally.absent))
            .execute(&mut *tx)
            .await?;
        }
        let keep: Vec<i64> = tallies.iter().map(|t| t.faction_id).collect();
        let removed = sqlx::query("DELETE FROM faction_tallies WHERE poll_id = $1 AND NOT (faction_id = ANY($2))")
            .bind(poll_id)
            .bind(&keep)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if removed > 0 {
            debug!(poll_id, removed, "dropped stale faction tallies");
        }
        Ok(())
    }

    async fn tallies_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, Vec<FactionTally>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT poll_id, faction_id, faction_label, votes_yes, votes_no, votes_abstain, votes_absent
              FROM faction_tallies
             WHERE poll_id = ANY($1)
             ORDER BY poll_id, faction_id
            "#,
        )
        .bind(poll_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: BTreeMap<PollId, Vec<FactionTally>> = BTreeMap::new();
        for row in &rows {
            let tally = tally_from_row(row)?;
            out.entry(tally.poll_id).or_default().push(tally);
        }
        Ok(out)
    }

    async fn question(&self, poll_id: PollId) -> Result<Option<QuestionRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {QUESTION_COLUMNS} FROM poll_questions WHERE poll_id = $1"))
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(question_from_row).transpose()?)
    }

    async fn questions_for(&self, poll_ids: &[PollId]) -> Result<BTreeMap<PollId, QuestionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUESTION_COLUMNS} FROM poll_questions WHERE poll_id = ANY($1)"
        ))
        .bind(poll_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in &rows {
            let record = question_from_row(row)?;
            out.insert(record.poll_id, record);
        }
        Ok(out)
    }

    async fn upsert_question(&self, poll_id: PollId, question: &SynthesizedQuestion) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO poll_questions
                (poll_id, question, simplified_title, explanation, vote_flip, originator, model_used)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (poll_id) DO UPDATE
               SET question = EXCLUDED.question,
                   simplified_title = EXCLUDED.simplified_title,
                   explanation = EXCLUDED.explanation,
                   vote_flip = EXCLUDED.vote_flip,
                   originator = EXCLUDED.originator,
                   model_used = EXCLUDED.model_used,
                   updated_at = NOW()
            "#,
        )
        .bind(poll_id)
        .bind(&question.question)
        .bind(&question.simplified_title)
        .bind(&question.explanation)
        .bind(question.vote_flip)
        .bind(&question.originator)
        .bind(&question.model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_deep_explanation(&self, poll_id: PollId, text: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO poll_questions (poll_id, deep_explanation)
            VALUES ($1, $2)
            ON CONFLICT (poll_id) DO UPDATE
               SET deep_explanation = EXCLUDED.deep_explanation,
                   updated_at = NOW()
            "#,
        )
        .bind(poll_id)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_ballot(&self, session_id: &str, poll_id: PollId, stance: Stance) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO user_ballots (poll_id, session_id, choice)
            SELECT $1, $2, $3
             WHERE EXISTS (SELECT 1 FROM polls WHERE id = $1)
            ON CONFLICT (poll_id, session_id) DO UPDATE
               SET choice = EXCLUDED.choice,
                   updated_at = NOW()
            "#,
        )
        .bind(poll_id)
        .bind(session_id)
        .bind(stance_to_db(stance))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::PollNotFound(poll_id));
        }
        Ok(())
    }

    async fn clear_ballot(&self, session_id: &str, poll_id: PollId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM user_ballots WHERE poll_id = $1 AND session_id = $2")
            .bind(poll_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn session_ballots(&self, session_id: &str) -> Result<BTreeMap<PollId, UserChoice>, StoreError> {
        let rows = sqlx::query("SELECT poll_id, choice FROM user_ballots WHERE session_id = $1")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let choice: String = row.try_get("choice")?;
            if let Some(choice) = UserChoice::parse(&choice) {
                out.insert(row.try_get("poll_id")?, choice);
            }
        }
        Ok(out)
    }

    async fn ballot_stats(&self, poll_id: PollId) -> Result<BallotStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE choice = 'yes') AS total_yes,
                   COUNT(*) FILTER (WHERE choice = 'no') AS total_no
              FROM user_ballots
             WHERE poll_id = $1
            "#,
        )
        .bind(poll_id)
        .fetch_one(&self.pool)
        .await?;
        let yes: i64 = row.try_get("total_yes")?;
        let no: i64 = row.try_get("total_no")?;
        Ok(BallotStats {
            total_yes: u64::try_from(yes).unwrap_or(0),
            total_no: u64::try_from(no).unwrap_or(0),
        })
    }

    async fn reset_questions(&self, poll_id: Option<PollId>) -> Result<u64, StoreError> {
        let result = match poll_id {
            Some(id) => {
                sqlx::query("DELETE FROM poll_questions WHERE poll_id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            None => sqlx::query("DELETE FROM poll_questions").execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn try_acquire_lease(&self, job: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO sync_leases (job, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (job) DO UPDATE
               SET holder = EXCLUDED.holder,
                   expires_at = EXCLUDED.expires_at
             WHERE sync_leases.expires_at < NOW()
                OR sync_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(job)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn release_lease(&self, job: &str, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_leases WHERE job = $1 AND holder = $2")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
