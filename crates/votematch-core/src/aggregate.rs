//! Reduction of individual ballots into per-faction tallies.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{Ballot, CastVote, FactionTally, PollId};

/// Group ballots by faction and count each recognized vote value.
///
/// Ballots without a faction (independents) are excluded, and ballots with an
/// unrecognized vote value are logged and skipped. Output is ordered by
/// faction id, so equal inputs always produce equal tallies.
pub fn aggregate(poll_id: PollId, ballots: &[Ballot]) -> Vec<FactionTally> {
    let mut by_faction: BTreeMap<i64, FactionTally> = BTreeMap::new();
    let mut independents = 0usize;

    for ballot in ballots {
        let Some(faction) = &ballot.faction else {
            independents += 1;
            continue;
        };
        let kind = match &ballot.vote {
            CastVote::Known(kind) => *kind,
            CastVote::Unrecognized(raw) => {
                warn!(poll_id, faction_id = faction.id, vote = %raw, "skipping ballot with unrecognized vote value");
                continue;
            }
        };
        by_faction
            .entry(faction.id)
            .or_insert_with(|| FactionTally::empty(poll_id, faction))
            .record(kind);
    }

    if independents > 0 {
        debug!(poll_id, independents, "excluded ballots without faction");
    }

    by_faction.into_values().collect()
}
