//! Core domain model for roll-call polls, faction tallies and citizen ballots.
//!
//! The one rule every consumer of this crate has to respect is the vote flip:
//! a synthesized question may ask the logical inverse of the original motion.
//! [`FactionTally::displayed`] and [`targets_original_yes`] are the only two
//! places that translate between the recorded frame and the displayed frame.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

pub mod aggregate;
pub mod matching;

pub use aggregate::aggregate;
pub use matching::{agreeing_factions, compute_matches, compute_matches_with, MatchPolicy};

pub const CRATE_NAME: &str = "votematch-core";

pub type PollId = i64;
pub type FactionId = i64;

/// Link to a document related to a poll (motion text, committee report, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedLink {
    pub label: String,
    pub url: String,
}

/// A single roll-call vote event as observed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub label: String,
    /// Rich text, may contain markup.
    pub description: String,
    pub poll_date: Option<NaiveDate>,
    pub accepted: Option<bool>,
    pub legislature_id: i64,
    pub topics: Vec<String>,
    pub related_links: Vec<RelatedLink>,
    #[serde(default)]
    pub theme: Option<String>,
}

/// Faction reference carried on an individual ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionRef {
    pub id: FactionId,
    pub label: String,
}

/// The four ballot values the upstream records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    Yes,
    No,
    Abstain,
    Absent,
}

impl VoteKind {
    pub const ALL: [VoteKind; 4] = [VoteKind::Yes, VoteKind::No, VoteKind::Abstain, VoteKind::Absent];

    pub fn from_upstream(value: &str) -> Option<Self> {
        match value.trim() {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            "abstain" => Some(Self::Abstain),
            "no_show" | "absent" => Some(Self::Absent),
            _ => None,
        }
    }
}

/// Ballot value as received; unknown values survive parsing so the aggregator
/// can log and skip them instead of failing the whole poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastVote {
    Known(VoteKind),
    Unrecognized(String),
}

impl CastVote {
    pub fn parse(raw: &str) -> Self {
        match VoteKind::from_upstream(raw) {
            Some(kind) => Self::Known(kind),
            None => Self::Unrecognized(raw.to_string()),
        }
    }
}

impl From<VoteKind> for CastVote {
    fn from(kind: VoteKind) -> Self {
        Self::Known(kind)
    }
}

impl<'de> Deserialize<'de> for CastVote {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Self::parse(raw.as_deref().unwrap_or_default()))
    }
}

/// One legislator's recorded vote on one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub faction: Option<FactionRef>,
    pub vote: CastVote,
}

impl Ballot {
    pub fn new(faction_id: FactionId, faction_label: &str, vote: VoteKind) -> Self {
        Self {
            faction: Some(FactionRef {
                id: faction_id,
                label: faction_label.to_string(),
            }),
            vote: CastVote::Known(vote),
        }
    }
}

/// Aggregated counts for one faction on one poll, in the original motion's frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionTally {
    pub poll_id: PollId,
    pub faction_id: FactionId,
    pub faction_label: String,
    pub yes: u32,
    pub no: u32,
    pub abstain: u32,
    pub absent: u32,
}

impl FactionTally {
    pub fn empty(poll_id: PollId, faction: &FactionRef) -> Self {
        Self {
            poll_id,
            faction_id: faction.id,
            faction_label: faction.label.clone(),
            yes: 0,
            no: 0,
            abstain: 0,
            absent: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.yes + self.no + self.abstain + self.absent
    }

    pub fn record(&mut self, kind: VoteKind) {
        match kind {
            VoteKind::Yes => self.yes += 1,
            VoteKind::No => self.no += 1,
            VoteKind::Abstain => self.abstain += 1,
            VoteKind::Absent => self.absent += 1,
        }
    }

    /// Majority direction on the original motion, `None` on a yes/no tie.
    pub fn original_majority(&self) -> Option<Stance> {
        if self.yes == self.no {
            None
        } else if self.yes > self.no {
            Some(Stance::Yes)
        } else {
            Some(Stance::No)
        }
    }

    /// Counts as shown next to the synthesized question.
    pub fn displayed(&self, vote_flip: bool) -> DisplayedTally {
        DisplayedTally {
            faction_id: self.faction_id,
            faction_label: self.faction_label.clone(),
            yes: displayed_yes(self, vote_flip),
            no: displayed_no(self, vote_flip),
            abstain: self.abstain,
            absent: self.absent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayedTally {
    pub faction_id: FactionId,
    pub faction_label: String,
    #[serde(rename = "displayedYes")]
    pub yes: u32,
    #[serde(rename = "displayedNo")]
    pub no: u32,
    pub abstain: u32,
    pub absent: u32,
}

pub fn displayed_yes(tally: &FactionTally, vote_flip: bool) -> u32 {
    if vote_flip {
        tally.no
    } else {
        tally.yes
    }
}

pub fn displayed_no(tally: &FactionTally, vote_flip: bool) -> u32 {
    if vote_flip {
        tally.yes
    } else {
        tally.no
    }
}

/// Whether a citizen's displayed-frame choice supports the original motion.
pub fn targets_original_yes(user_chose_yes: bool, vote_flip: bool) -> bool {
    user_chose_yes != vote_flip
}

/// Yes/no direction, used for majorities and for decided citizen ballots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Yes,
    No,
}

impl Stance {
    pub fn is_yes(self) -> bool {
        matches!(self, Stance::Yes)
    }
}

/// A citizen's own choice on a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserChoice {
    Yes,
    No,
    Skip,
    #[default]
    None,
}

impl UserChoice {
    pub fn stance(self) -> Option<Stance> {
        match self {
            UserChoice::Yes => Some(Stance::Yes),
            UserChoice::No => Some(Stance::No),
            UserChoice::Skip | UserChoice::None => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserChoice::Yes => "yes",
            UserChoice::No => "no",
            UserChoice::Skip => "skip",
            UserChoice::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            "skip" => Some(Self::Skip),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl From<Stance> for UserChoice {
    fn from(stance: Stance) -> Self {
        match stance {
            Stance::Yes => UserChoice::Yes,
            Stance::No => UserChoice::No,
        }
    }
}

impl fmt::Display for UserChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully populated output of one successful synthesis call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizedQuestion {
    pub simplified_title: String,
    pub question: String,
    pub explanation: String,
    pub vote_flip: bool,
    pub originator: Option<String>,
    pub model: String,
}

impl SynthesizedQuestion {
    pub fn into_record(self, poll_id: PollId) -> QuestionRecord {
        QuestionRecord {
            poll_id,
            question: Some(self.question),
            simplified_title: Some(self.simplified_title),
            explanation: Some(self.explanation),
            vote_flip: self.vote_flip,
            originator: self.originator,
            model_used: Some(self.model),
            deep_explanation: None,
        }
    }
}

/// Stored question row; may be partially populated by older runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuestionRecord {
    pub poll_id: PollId,
    pub question: Option<String>,
    pub simplified_title: Option<String>,
    pub explanation: Option<String>,
    pub vote_flip: bool,
    pub originator: Option<String>,
    pub model_used: Option<String>,
    pub deep_explanation: Option<String>,
}

impl QuestionRecord {
    /// Complete records are never regenerated.
    pub fn is_complete(&self) -> bool {
        [
            &self.question,
            &self.simplified_title,
            &self.explanation,
            &self.model_used,
        ]
        .iter()
        .all(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

/// Completeness of an optional record; a missing record is incomplete.
pub fn question_is_complete(record: Option<&QuestionRecord>) -> bool {
    record.is_some_and(QuestionRecord::is_complete)
}

/// Agreement between one citizen and one faction across the polls they both voted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub faction_id: FactionId,
    pub faction_label: String,
    pub match_count: u32,
    pub total: u32,
    pub percentage: u32,
}

/// Citizen yes/no totals for one poll across all sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BallotStats {
    pub total_yes: u64,
    pub total_no: u64,
}

/// Accepts a single object, a sequence (first element wins) or null for a
/// one-to-one relation that upstream sources sometimes render as an array.
pub fn one_or_many<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => None,
        Some(OneOrMany::One(value)) => Some(value),
        Some(OneOrMany::Many(values)) => values.into_iter().next(),
    })
}
