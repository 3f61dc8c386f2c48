//! JSON API for the sync trigger, citizen ballots and party matching.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;
use votematch_adapters::QuestionSynthesizer;
use votematch_core::{
    agreeing_factions, compute_matches_with, BallotStats, DisplayedTally, MatchPolicy, MatchResult, PollId, QuestionRecord,
    RelatedLink, UserChoice,
};
use votematch_storage::{PgPollStore, PollFilter, PollStore, StoreError};
use votematch_sync::{build_synthesizer, SyncConfig, SyncError, SyncPipeline};

pub const CRATE_NAME: &str = "votematch-web";

pub const SESSION_COOKIE: &str = "session_id";
const SESSION_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;
const MAX_SYNC_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PollStore>,
    pub pipeline: Option<Arc<SyncPipeline>>,
    pub synthesizer: Option<QuestionSynthesizer>,
    /// Bearer token for the sync trigger; the trigger is open when unset.
    pub cron_secret: Option<String>,
    pub match_policy: MatchPolicy,
}

impl AppState {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self {
            store,
            pipeline: None,
            synthesizer: None,
            cron_secret: None,
            match_policy: MatchPolicy::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: QuestionSynthesizer) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_cron_secret(mut self, secret: Option<String>) -> Self {
        self.cron_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync-polls", get(sync_polls_handler).post(sync_polls_handler))
        .route("/api/vote", post(vote_handler))
        .route("/api/polls", get(polls_handler))
        .route("/api/polls/{id}", get(poll_detail_handler))
        .route("/api/matches", get(session_matches_handler).post(client_matches_handler))
        .route("/api/explain-more", post(explain_more_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving votematch api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Postgres-backed state from the environment, shared by `serve` callers.
pub async fn state_from_env(config: &SyncConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn PollStore> = Arc::new(
        PgPollStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    let pipeline = SyncPipeline::from_config(config, store.clone())?;
    Ok(AppState::new(store)
        .with_pipeline(Arc::new(pipeline))
        .with_synthesizer(build_synthesizer(config)?)
        .with_cron_secret(std::env::var("CRON_SECRET").ok())
        .with_match_policy(MatchPolicy {
            exclude_abstain_majority: config.exclude_abstain_majority,
        }))
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    limit: Option<usize>,
}

async fn sync_polls_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Response {
    if !authorized(state.cron_secret.as_deref(), &headers) {
        warn!("sync trigger rejected: bad credentials");
        return json_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Some(pipeline) = state.pipeline.clone() else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "sync is not configured");
    };

    let limit = query.limit.map(|l| l.clamp(1, MAX_SYNC_LIMIT));
    match pipeline.run_once(limit).await {
        Ok(summary) => Json(json!({
            "success": true,
            "newPolls": summary.new_polls,
            "updatedPolls": summary.updated_polls,
            "runId": summary.run_id.to_string(),
        }))
        .into_response(),
        Err(err) => {
            error!(error = %err, "sync trigger failed");
            let status = match err {
                SyncError::AlreadyRunning => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            json_error(status, &err.to_string())
        }
    }
}

/// Compares SHA-256 digests so the comparison does not depend on where the
/// strings first differ.
fn authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
        .map(|id| id.to_string())
}

fn session_cookie(session_id: &str) -> String {
    format!("{SESSION_COOKIE}={session_id}; Path=/; Max-Age={SESSION_MAX_AGE_SECS}; HttpOnly; SameSite=Lax")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody {
    poll_id: PollId,
    #[serde(default)]
    vote: Option<String>,
}

async fn vote_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<VoteBody>) -> Response {
    let stance = match body.vote.as_deref() {
        None => None,
        Some(raw) => match UserChoice::parse(raw).and_then(UserChoice::stance) {
            Some(stance) => Some(stance),
            None => return json_error(StatusCode::BAD_REQUEST, "vote must be \"yes\", \"no\" or null"),
        },
    };

    let (session_id, fresh) = match session_from_headers(&headers) {
        Some(id) => (id, false),
        None => (Uuid::new_v4().to_string(), true),
    };

    let stored = match stance {
        Some(stance) => state.store.record_ballot(&session_id, body.poll_id, stance).await,
        None => state.store.clear_ballot(&session_id, body.poll_id).await,
    };
    if let Err(err) = stored {
        return store_failure(err);
    }

    let vote = stance.map(UserChoice::from);
    let mut response = Json(json!({ "success": true, "pollId": body.poll_id, "vote": vote })).into_response();
    if fresh {
        if let Ok(value) = HeaderValue::from_str(&session_cookie(&session_id)) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

#[derive(Debug, Deserialize, Default)]
struct PollsQuery {
    theme: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollSummary {
    id: PollId,
    label: String,
    title: String,
    question: String,
    theme: Option<String>,
    poll_date: Option<String>,
    accepted: Option<bool>,
    topics: Vec<String>,
    has_question: bool,
    vote_flip: bool,
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Displayed title and question; both fall back to the original label.
fn displayed_text(label: &str, record: Option<&QuestionRecord>) -> (String, String) {
    let title = record.and_then(|q| non_blank(q.simplified_title.as_ref())).unwrap_or(label);
    let question = record.and_then(|q| non_blank(q.question.as_ref())).unwrap_or(label);
    (title.to_string(), question.to_string())
}

async fn polls_handler(State(state): State<Arc<AppState>>, Query(query): Query<PollsQuery>) -> Response {
    let filter = PollFilter {
        theme: query.theme.filter(|t| !t.trim().is_empty()),
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)),
    };
    let polls = match state.store.list_polls(&filter).await {
        Ok(polls) => polls,
        Err(err) => return store_failure(err),
    };
    let ids: Vec<PollId> = polls.iter().map(|p| p.id).collect();
    let questions = match state.store.questions_for(&ids).await {
        Ok(questions) => questions,
        Err(err) => return store_failure(err),
    };

    let rows: Vec<PollSummary> = polls
        .into_iter()
        .map(|poll| {
            let record = questions.get(&poll.id);
            let (title, question) = displayed_text(&poll.label, record);
            PollSummary {
                id: poll.id,
                title,
                question,
                theme: poll.theme,
                poll_date: poll.poll_date.map(|d| d.to_string()),
                accepted: poll.accepted,
                topics: poll.topics,
                has_question: record.is_some_and(QuestionRecord::is_complete),
                vote_flip: record.is_some_and(|q| q.vote_flip),
                label: poll.label,
            }
        })
        .collect();
    Json(json!({ "polls": rows })).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgreeingFaction {
    id: i64,
    label: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollDetail {
    id: PollId,
    label: String,
    description: String,
    poll_date: Option<String>,
    accepted: Option<bool>,
    legislature_id: i64,
    theme: Option<String>,
    topics: Vec<String>,
    related_links: Vec<RelatedLink>,
    title: String,
    question: String,
    explanation: Option<String>,
    originator: Option<String>,
    has_question: bool,
    vote_flip: bool,
    tallies: Vec<DisplayedTally>,
    ballot_stats: BallotStats,
    user_vote: Option<UserChoice>,
    agreeing_factions: Vec<AgreeingFaction>,
}

async fn poll_detail_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<PollId>,
) -> Response {
    match load_poll_detail(state.store.as_ref(), id, session_from_headers(&headers)).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, &format!("poll {id} not found")),
        Err(err) => store_failure(err),
    }
}

async fn load_poll_detail(
    store: &dyn PollStore,
    id: PollId,
    session_id: Option<String>,
) -> Result<Option<PollDetail>, StoreError> {
    let Some(poll) = store.poll(id).await? else {
        return Ok(None);
    };
    let record = store.question(id).await?;
    let tallies = store.tallies_for(&[id]).await?.remove(&id).unwrap_or_default();
    let ballot_stats = store.ballot_stats(id).await?;
    let user_vote = match session_id {
        Some(session_id) => store.session_ballots(&session_id).await?.get(&id).copied(),
        None => None,
    };

    let vote_flip = record.as_ref().is_some_and(|q| q.vote_flip);
    let agreeing = match user_vote.and_then(UserChoice::stance) {
        Some(stance) => agreeing_factions(stance, vote_flip, &tallies)
            .into_iter()
            .map(|t| AgreeingFaction {
                id: t.faction_id,
                label: t.faction_label.clone(),
            })
            .collect(),
        None => Vec::new(),
    };
    let (title, question) = displayed_text(&poll.label, record.as_ref());

    Ok(Some(PollDetail {
        id: poll.id,
        description: poll.description,
        poll_date: poll.poll_date.map(|d| d.to_string()),
        accepted: poll.accepted,
        legislature_id: poll.legislature_id,
        theme: poll.theme,
        topics: poll.topics,
        related_links: poll.related_links,
        title,
        question,
        explanation: record.as_ref().and_then(|q| non_blank(q.explanation.as_ref())).map(str::to_string),
        originator: record.as_ref().and_then(|q| q.originator.clone()),
        has_question: record.as_ref().is_some_and(QuestionRecord::is_complete),
        vote_flip,
        tallies: tallies.iter().map(|t| t.displayed(vote_flip)).collect(),
        ballot_stats,
        user_vote,
        agreeing_factions: agreeing,
        label: poll.label,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchReport {
    matches: Vec<MatchResult>,
    polls_considered: usize,
}

async fn match_report(
    store: &dyn PollStore,
    policy: MatchPolicy,
    ballots: &BTreeMap<PollId, UserChoice>,
) -> Result<MatchReport, StoreError> {
    let decided: Vec<PollId> = ballots
        .iter()
        .filter(|(_, choice)| choice.stance().is_some())
        .map(|(id, _)| *id)
        .collect();
    if decided.is_empty() {
        return Ok(MatchReport {
            matches: Vec::new(),
            polls_considered: 0,
        });
    }
    let tallies = store.tallies_for(&decided).await?;
    let flips = store.flips_for(&decided).await?;
    Ok(MatchReport {
        matches: compute_matches_with(policy, ballots, &tallies, &flips),
        polls_considered: decided.iter().filter(|id| tallies.contains_key(id)).count(),
    })
}

async fn session_matches_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ballots = match session_from_headers(&headers) {
        Some(session_id) => match state.store.session_ballots(&session_id).await {
            Ok(ballots) => ballots,
            Err(err) => return store_failure(err),
        },
        None => BTreeMap::new(),
    };
    match match_report(state.store.as_ref(), state.match_policy, &ballots).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => store_failure(err),
    }
}

#[derive(Debug, Deserialize)]
struct MatchesBody {
    #[serde(default)]
    ballots: BTreeMap<PollId, UserChoice>,
}

async fn client_matches_handler(State(state): State<Arc<AppState>>, Json(body): Json<MatchesBody>) -> Response {
    match match_report(state.store.as_ref(), state.match_policy, &body.ballots).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => store_failure(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplainBody {
    poll_id: PollId,
}

async fn explain_more_handler(State(state): State<Arc<AppState>>, Json(body): Json<ExplainBody>) -> Response {
    let poll_id = body.poll_id;
    let poll = match state.store.poll(poll_id).await {
        Ok(Some(poll)) => poll,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, &format!("poll {poll_id} not found")),
        Err(err) => return store_failure(err),
    };
    match state.store.question(poll_id).await {
        Ok(record) => {
            if let Some(cached) = record.as_ref().and_then(|q| non_blank(q.deep_explanation.as_ref())) {
                return Json(json!({ "explanation": cached, "cached": true })).into_response();
            }
        }
        Err(err) => return store_failure(err),
    }

    let Some(synthesizer) = state.synthesizer.as_ref() else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "explanations are not configured");
    };
    let explanation = match synthesizer.explain_more(poll_id, &poll.label, &poll.description).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => return json_error(StatusCode::BAD_GATEWAY, "completion returned no content"),
        Err(err) => {
            warn!(poll_id, error = %err, "explain-more failed");
            let status = if err.is_quota() {
                StatusCode::TOO_MANY_REQUESTS
            } else {
                StatusCode::BAD_GATEWAY
            };
            return json_error(status, &err.to_string());
        }
    };

    if let Err(err) = state.store.set_deep_explanation(poll_id, &explanation).await {
        warn!(poll_id, error = %err, "failed to cache explanation");
    }
    Json(json!({ "explanation": explanation, "cached": false })).into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

fn store_failure(err: StoreError) -> Response {
    match err {
        StoreError::PollNotFound(id) => json_error(StatusCode::NOT_FOUND, &format!("poll {id} not found")),
        other => {
            error!(error = %other, "store request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;
    use votematch_adapters::{
        CompletionBackend, CompletionRequest, PollSource, SynthesisConfig, SynthesisError, UpstreamError,
    };
    use votematch_core::{aggregate, Ballot, Poll, SynthesizedQuestion, VoteKind};
    use votematch_storage::{MemoryPollStore, RetryPolicy};
    use votematch_sync::{PipelineOptions, ThemeRules};

    struct CountingBackend {
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for CountingBackend {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    #[derive(Default)]
    struct OnePollSource {
        last_limit: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PollSource for OnePollSource {
        async fn fetch_recent_polls(&self, _legislature_id: i64, limit: usize) -> Result<Vec<Poll>, UpstreamError> {
            self.last_limit.store(limit, Ordering::SeqCst);
            Ok(vec![poll(200, "Neuer Antrag", &[])])
        }

        async fn fetch_ballots_for_poll(&self, _poll_id: PollId) -> Result<Vec<Ballot>, UpstreamError> {
            Ok(vec![Ballot::new(1, "Fraktion A", VoteKind::Yes)])
        }
    }

    fn poll(id: PollId, label: &str, topics: &[&str]) -> Poll {
        Poll {
            id,
            label: label.into(),
            description: "<p>Der Bundestag soll beschließen.</p>".into(),
            poll_date: None,
            accepted: Some(true),
            legislature_id: 161,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            related_links: vec![],
            theme: Some(if topics.is_empty() { "Sonstiges" } else { "Klima & Umwelt" }.into()),
        }
    }

    fn ballots(faction: i64, label: &str, yes: usize, no: usize) -> Vec<Ballot> {
        let mut out = vec![Ballot::new(faction, label, VoteKind::Yes); yes];
        out.extend(vec![Ballot::new(faction, label, VoteKind::No); no]);
        out
    }

    /// Poll 100 (flipped question, A 5/2, B 1/6) and poll 101 without question.
    async fn seeded_store() -> Arc<MemoryPollStore> {
        let store = Arc::new(MemoryPollStore::new());
        store.upsert_poll(&poll(100, "Antrag zur Energie", &["Energie"])).await.unwrap();
        store.upsert_poll(&poll(101, "Antrag ohne Frage", &[])).await.unwrap();

        let mut roster = ballots(1, "Fraktion A", 5, 2);
        roster.extend(ballots(2, "Fraktion B", 1, 6));
        store.replace_tallies(100, &aggregate(100, &roster)).await.unwrap();
        store
            .upsert_question(
                100,
                &SynthesizedQuestion {
                    simplified_title: "Kohleausstieg verschieben".into(),
                    question: "Soll der Kohleausstieg verschoben werden?".into(),
                    explanation: "Es geht um den Zeitplan.".into(),
                    vote_flip: true,
                    originator: Some("Bundesregierung".into()),
                    model: "test-model".into(),
                },
            )
            .await
            .unwrap();
        store
    }

    fn synthesizer(backend: Arc<CountingBackend>) -> QuestionSynthesizer {
        QuestionSynthesizer::new(
            backend,
            SynthesisConfig {
                retry: RetryPolicy::fixed(3, std::time::Duration::ZERO),
                ..SynthesisConfig::default()
            },
        )
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn sync_trigger_requires_matching_secret() {
        let store = seeded_store().await;
        let backend = Arc::new(CountingBackend {
            reply: r#"{"simplified_title":"T","question":"Q?","explanation":"E","vote_flip":false}"#,
            calls: AtomicUsize::new(0),
        });
        let pipeline = SyncPipeline::new(
            Arc::new(OnePollSource::default()),
            synthesizer(backend.clone()),
            store.clone(),
            ThemeRules::builtin().unwrap(),
            PipelineOptions::default(),
        );
        let app = app(
            AppState::new(store.clone())
                .with_pipeline(Arc::new(pipeline))
                .with_cron_secret(Some("s3cret".into())),
        );

        let denied = app.clone().oneshot(get("/api/sync-polls", None)).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(denied).await["success"], false);

        let wrong = Request::builder()
            .uri("/api/sync-polls")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

        let ok = Request::builder()
            .method("POST")
            .uri("/api/sync-polls?limit=5")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(ok).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["newPolls"], 1);
        assert_eq!(body["updatedPolls"], 0);
        assert!(store.poll_exists(200).await.unwrap());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_trigger_clamps_requested_limit() {
        let store = seeded_store().await;
        let source = OnePollSource::default();
        let last_limit = source.last_limit.clone();
        let backend = Arc::new(CountingBackend {
            reply: r#"{"simplified_title":"T","question":"Q?","explanation":"E","vote_flip":false}"#,
            calls: AtomicUsize::new(0),
        });
        let pipeline = SyncPipeline::new(
            Arc::new(source),
            synthesizer(backend),
            store.clone(),
            ThemeRules::builtin().unwrap(),
            PipelineOptions::default(),
        );
        let app = app(AppState::new(store).with_pipeline(Arc::new(pipeline)));

        let resp = app.clone().oneshot(get("/api/sync-polls?limit=5000", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(last_limit.load(Ordering::SeqCst), MAX_SYNC_LIMIT);

        let resp = app.clone().oneshot(get("/api/sync-polls?limit=0", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(last_limit.load(Ordering::SeqCst), 1);

        // no limit falls back to the configured default
        app.oneshot(get("/api/sync-polls", None)).await.unwrap();
        assert_eq!(last_limit.load(Ordering::SeqCst), PipelineOptions::default().default_limit);
    }

    #[tokio::test]
    async fn sync_trigger_without_pipeline_reports_structured_error() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app.oneshot(get("/api/sync-polls", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn first_vote_issues_session_cookie_and_feeds_matches() {
        let app = app(AppState::new(seeded_store().await));

        let resp = app
            .clone()
            .oneshot(post("/api/vote", json!({"pollId": 100, "vote": "yes"}), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("session_id="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=31536000"));
        let session = cookie.split(';').next().unwrap().to_string();

        let resp = app.clone().oneshot(get("/api/matches", Some(&session))).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["pollsConsidered"], 1);
        // flipped question: "yes" targets the original "no", which Fraktion B held
        assert_eq!(body["matches"][0]["factionLabel"], "Fraktion B");
        assert_eq!(body["matches"][0]["percentage"], 100);
        assert_eq!(body["matches"][1]["factionLabel"], "Fraktion A");
        assert_eq!(body["matches"][1]["percentage"], 0);

        let resp = app
            .clone()
            .oneshot(post("/api/vote", json!({"pollId": 100, "vote": null}), Some(&session)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::SET_COOKIE).is_none());

        let body = body_json(app.oneshot(get("/api/matches", Some(&session))).await.unwrap()).await;
        assert_eq!(body["matches"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn invalid_or_unknown_votes_are_rejected() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app
            .clone()
            .oneshot(post("/api/vote", json!({"pollId": 100, "vote": "maybe"}), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post("/api/vote", json!({"pollId": 999, "vote": "no"}), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_list_falls_back_to_label_and_filters_by_theme() {
        let app = app(AppState::new(seeded_store().await));
        let body = body_json(app.clone().oneshot(get("/api/polls", None)).await.unwrap()).await;
        let polls = body["polls"].as_array().unwrap();
        assert_eq!(polls.len(), 2);
        let bare = polls.iter().find(|p| p["id"] == 101).unwrap();
        assert_eq!(bare["title"], "Antrag ohne Frage");
        assert_eq!(bare["question"], "Antrag ohne Frage");
        assert_eq!(bare["hasQuestion"], false);
        let framed = polls.iter().find(|p| p["id"] == 100).unwrap();
        assert_eq!(framed["title"], "Kohleausstieg verschieben");
        assert_eq!(framed["voteFlip"], true);

        let body = body_json(
            app.oneshot(get("/api/polls?theme=Klima%20%26%20Umwelt&limit=10", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["polls"].as_array().unwrap().len(), 1);
        assert_eq!(body["polls"][0]["id"], 100);
    }

    #[tokio::test]
    async fn poll_detail_shows_flipped_tallies_and_agreeing_factions() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app
            .clone()
            .oneshot(post("/api/vote", json!({"pollId": 100, "vote": "yes"}), None))
            .await
            .unwrap();
        let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let session = cookie.split(';').next().unwrap().to_string();

        let resp = app.clone().oneshot(get("/api/polls/100", Some(&session))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["voteFlip"], true);
        assert_eq!(body["userVote"], "yes");
        assert_eq!(body["tallies"][0]["displayedYes"], 2);
        assert_eq!(body["tallies"][0]["displayedNo"], 5);
        assert_eq!(body["ballotStats"]["totalYes"], 1);
        assert_eq!(body["agreeingFactions"].as_array().unwrap().len(), 1);
        assert_eq!(body["agreeingFactions"][0]["label"], "Fraktion B");

        let missing = app.oneshot(get("/api/polls/999", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn client_side_ballots_are_matched_without_a_session() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app
            .oneshot(post(
                "/api/matches",
                json!({"ballots": {"100": "no", "101": "yes", "555": "skip"}}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        // 101 has no tallies, so only 100 counts
        assert_eq!(body["pollsConsidered"], 1);
        assert_eq!(body["matches"][0]["factionLabel"], "Fraktion A");
        assert_eq!(body["matches"][0]["matchCount"], 1);
        assert_eq!(body["matches"][0]["total"], 1);
    }

    #[tokio::test]
    async fn abstain_majority_policy_drops_abstaining_factions() {
        let store = seeded_store().await;
        let mut roster = ballots(1, "Fraktion A", 3, 1);
        roster.extend(ballots(3, "Fraktion C", 2, 1));
        roster.extend(vec![Ballot::new(3, "Fraktion C", VoteKind::Abstain); 6]);
        store.replace_tallies(101, &aggregate(101, &roster)).await.unwrap();
        let request = || post("/api/matches", json!({"ballots": {"101": "yes"}}), None);

        let lenient = app(AppState::new(store.clone()));
        let body = body_json(lenient.oneshot(request()).await.unwrap()).await;
        let labels: Vec<&str> = body["matches"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["factionLabel"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["Fraktion A", "Fraktion C"]);

        let strict = app(AppState::new(store).with_match_policy(MatchPolicy {
            exclude_abstain_majority: true,
        }));
        let body = body_json(strict.oneshot(request()).await.unwrap()).await;
        let matches = body["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["factionLabel"], "Fraktion A");
        assert_eq!(matches[0]["percentage"], 100);
    }

    #[tokio::test]
    async fn explanations_are_generated_once_then_cached() {
        let backend = Arc::new(CountingBackend {
            reply: "  Der Bundestag hat abgestimmt. ",
            calls: AtomicUsize::new(0),
        });
        let app = app(AppState::new(seeded_store().await).with_synthesizer(synthesizer(backend.clone())));

        let first = body_json(
            app.clone()
                .oneshot(post("/api/explain-more", json!({"pollId": 100}), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(first["explanation"], "Der Bundestag hat abgestimmt.");
        assert_eq!(first["cached"], false);

        let second = body_json(
            app.clone()
                .oneshot(post("/api/explain-more", json!({"pollId": 100}), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(second["cached"], true);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let missing = app
            .oneshot(post("/api/explain-more", json!({"pollId": 999}), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn secret_check_accepts_only_exact_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(authorized(None, &headers));
        assert!(!authorized(Some("abc"), &headers));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(authorized(Some("abc"), &headers));
        assert!(!authorized(Some("abcd"), &headers));
    }

    #[test]
    fn session_cookie_is_read_from_cookie_header() {
        let id = Uuid::new_v4().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; session_id={id}")).unwrap(),
        );
        assert_eq!(session_from_headers(&headers), Some(id));

        headers.insert(header::COOKIE, HeaderValue::from_static("session_id=not-a-uuid"));
        assert_eq!(session_from_headers(&headers), None);
    }
}
