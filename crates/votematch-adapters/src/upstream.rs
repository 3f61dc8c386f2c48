//! Client for the parliamentary open-data API (abgeordnetenwatch.de v2 layout).

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use votematch_core::{one_or_many, Ballot, CastVote, FactionRef, Poll, PollId, RelatedLink};
use votematch_storage::{FetchError, HttpFetcher, RetryDisposition};

pub const DEFAULT_UPSTREAM_URL: &str = "https://www.abgeordnetenwatch.de/api/v2";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("ballots of poll {poll_id} exceed {max_pages} pages; roster is incomplete")]
    PageCapExceeded { poll_id: PollId, max_pages: usize },
}

impl UpstreamError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            UpstreamError::Fetch(err) => err.disposition(),
            UpstreamError::PageCapExceeded { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Read access to polls and the individual ballots cast on them.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Newest polls of a legislature, newest first.
    async fn fetch_recent_polls(&self, legislature_id: i64, limit: usize) -> Result<Vec<Poll>, UpstreamError>;

    /// Every ballot of a poll, independents already removed.
    async fn fetch_ballots_for_poll(&self, poll_id: PollId) -> Result<Vec<Ballot>, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub page_size: usize,
    pub max_pages: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_URL.to_string(),
            page_size: 100,
            max_pages: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbgeordnetenwatchClient {
    http: HttpFetcher,
    config: UpstreamConfig,
}

impl AbgeordnetenwatchClient {
    pub fn new(http: HttpFetcher, config: UpstreamConfig) -> Self {
        Self { http, config }
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    pub fn polls_url(&self, legislature_id: i64, limit: usize) -> String {
        format!(
            "{}/polls?field_legislature={legislature_id}&range_end={limit}&sort_by=field_poll_date&sort_direction=desc",
            self.base()
        )
    }

    pub fn votes_url(&self, poll_id: PollId, page: usize) -> String {
        let size = self.config.page_size;
        format!("{}/votes?poll={poll_id}&range_start={}&range_end={size}", self.base(), page * size)
    }
}

#[async_trait]
impl PollSource for AbgeordnetenwatchClient {
    async fn fetch_recent_polls(&self, legislature_id: i64, limit: usize) -> Result<Vec<Poll>, UpstreamError> {
        let url = self.polls_url(legislature_id, limit);
        let span = info_span!("fetch_recent_polls", legislature_id, limit);
        async {
            let envelope: Envelope<ApiPoll> = self.http.get_json(&url).await?;
            let polls: Vec<Poll> = envelope
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.into_poll(legislature_id))
                .collect();
            debug!(count = polls.len(), "listed polls");
            Ok(polls)
        }
        .instrument(span)
        .await
    }

    async fn fetch_ballots_for_poll(&self, poll_id: PollId) -> Result<Vec<Ballot>, UpstreamError> {
        let span = info_span!("fetch_ballots", poll_id);
        async {
            let page_size = self.config.page_size.max(1);
            let mut roster = Roster::default();

            for page in 0..self.config.max_pages {
                let envelope: Envelope<ApiVote> = self.http.get_json(&self.votes_url(poll_id, page)).await?;
                let total = envelope.total();
                let rows = envelope.data.unwrap_or_default();
                let len = rows.len();
                let added = roster.extend(rows);

                if len < page_size || total.is_some_and(|t| roster.rows as u64 >= t) {
                    debug!(pages = page + 1, rows = roster.rows, kept = roster.ballots.len(), "fetched ballots");
                    return Ok(roster.ballots);
                }
                if added == 0 {
                    // upstream ignored the offset and repeated a page
                    warn!(page, rows = roster.rows, "ballot page added no new votes; stopping pagination");
                    return Ok(roster.ballots);
                }
            }

            warn!(max_pages = self.config.max_pages, rows = roster.rows, "ballot pagination hit page cap");
            Err(UpstreamError::PageCapExceeded {
                poll_id,
                max_pages: self.config.max_pages,
            })
        }
        .instrument(span)
        .await
    }
}

/// Ballots collected across pages, de-duplicated by upstream vote id.
#[derive(Default)]
struct Roster {
    seen: HashSet<i64>,
    rows: usize,
    ballots: Vec<Ballot>,
}

impl Roster {
    /// Returns how many rows were new.
    fn extend(&mut self, rows: Vec<ApiVote>) -> usize {
        let mut added = 0;
        for row in rows {
            if let Some(id) = row.id {
                if !self.seen.insert(id) {
                    continue;
                }
            }
            added += 1;
            if let Some(ballot) = row.into_ballot() {
                self.ballots.push(ballot);
            }
        }
        self.rows += added;
        added
    }
}

/// Parse a recorded `/polls` response body.
pub fn parse_polls_response(body: &str, legislature_id: i64) -> Result<Vec<Poll>, serde_json::Error> {
    let envelope: Envelope<ApiPoll> = serde_json::from_str(body)?;
    Ok(envelope
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.into_poll(legislature_id))
        .collect())
}

/// Parse a recorded `/votes` response body; ballots without a faction and
/// repeated vote ids are dropped.
pub fn parse_votes_response(body: &str) -> Result<Vec<Ballot>, serde_json::Error> {
    let envelope: Envelope<ApiVote> = serde_json::from_str(body)?;
    let mut roster = Roster::default();
    roster.extend(envelope.data.unwrap_or_default());
    Ok(roster.ballots)
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default = "Option::default")]
    data: Option<Vec<T>>,
}

impl<T> Envelope<T> {
    fn total(&self) -> Option<u64> {
        self.meta.as_ref()?.result.as_ref()?.total
    }
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    result: Option<ResultMeta>,
}

#[derive(Debug, Deserialize)]
struct ResultMeta {
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct LabelRef {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLink {
    #[serde(default, alias = "uri")]
    url: Option<String>,
    #[serde(default, alias = "label")]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPoll {
    id: PollId,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    field_intro: Option<String>,
    #[serde(default)]
    field_poll_date: Option<String>,
    #[serde(default)]
    field_accepted: Option<bool>,
    #[serde(default, deserialize_with = "one_or_many")]
    field_legislature: Option<IdRef>,
    #[serde(default)]
    field_topics: Option<Vec<LabelRef>>,
    #[serde(default)]
    field_related_links: Option<Vec<ApiLink>>,
}

impl ApiPoll {
    fn into_poll(self, fallback_legislature: i64) -> Poll {
        let mut topics: Vec<String> = Vec::new();
        for label in self.field_topics.unwrap_or_default().into_iter().filter_map(|t| t.label) {
            let label = label.trim().to_string();
            if !label.is_empty() && !topics.contains(&label) {
                topics.push(label);
            }
        }

        let related_links = self
            .field_related_links
            .unwrap_or_default()
            .into_iter()
            .filter_map(|link| {
                let url = link.url.filter(|u| !u.trim().is_empty())?;
                let label = link.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| url.clone());
                Some(RelatedLink { label, url })
            })
            .collect();

        let poll_date = self
            .field_poll_date
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d").ok());

        Poll {
            id: self.id,
            label: self.label.unwrap_or_default(),
            description: self.field_intro.unwrap_or_default(),
            poll_date,
            accepted: self.field_accepted,
            legislature_id: self.field_legislature.map(|l| l.id).unwrap_or(fallback_legislature),
            topics,
            related_links,
            theme: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiFraction {
    id: i64,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiVote {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default, deserialize_with = "one_or_many")]
    fraction: Option<ApiFraction>,
    #[serde(default)]
    vote: Option<String>,
}

impl ApiVote {
    fn into_ballot(self) -> Option<Ballot> {
        let fraction = self.fraction?;
        Some(Ballot {
            faction: Some(FactionRef {
                id: fraction.id,
                label: fraction.label.unwrap_or_else(|| format!("Fraktion {}", fraction.id)),
            }),
            vote: CastVote::parse(self.vote.as_deref().unwrap_or_default()),
        })
    }
}
