//! Citizen-to-faction agreement scoring.

use std::collections::BTreeMap;

use crate::{targets_original_yes, FactionId, FactionTally, MatchResult, PollId, Stance, UserChoice};

/// Knobs for which faction positions count as attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchPolicy {
    /// Also drop factions whose abstentions outnumber both yes and no.
    pub exclude_abstain_majority: bool,
}

impl MatchPolicy {
    fn attributable(&self, tally: &FactionTally) -> Option<Stance> {
        let majority = tally.original_majority()?;
        if self.exclude_abstain_majority && tally.abstain > tally.yes && tally.abstain > tally.no {
            return None;
        }
        Some(majority)
    }
}

#[derive(Debug, Default)]
struct FactionStats {
    label: String,
    matches: u32,
    total: u32,
}

pub fn compute_matches(
    ballots: &BTreeMap<PollId, UserChoice>,
    tallies: &BTreeMap<PollId, Vec<FactionTally>>,
    flips: &BTreeMap<PollId, bool>,
) -> Vec<MatchResult> {
    compute_matches_with(MatchPolicy::default(), ballots, tallies, flips)
}

/// Per-faction agreement across every poll the citizen decided on.
///
/// Skipped and unanswered polls are ignored, a missing flip entry counts as
/// `false`, and polls without tallies contribute nothing. A faction that tied
/// on a poll is left out of that poll's numerator and denominator. Factions
/// with a zero denominator are not reported. Results are ordered by
/// percentage, then by number of shared polls, then by faction id.
pub fn compute_matches_with(
    policy: MatchPolicy,
    ballots: &BTreeMap<PollId, UserChoice>,
    tallies: &BTreeMap<PollId, Vec<FactionTally>>,
    flips: &BTreeMap<PollId, bool>,
) -> Vec<MatchResult> {
    let mut stats: BTreeMap<FactionId, FactionStats> = BTreeMap::new();

    for (poll_id, choice) in ballots {
        let Some(stance) = choice.stance() else {
            continue;
        };
        let Some(poll_tallies) = tallies.get(poll_id) else {
            continue;
        };
        let vote_flip = flips.get(poll_id).copied().unwrap_or(false);
        let target_yes = targets_original_yes(stance.is_yes(), vote_flip);

        for tally in poll_tallies {
            let Some(majority) = policy.attributable(tally) else {
                continue;
            };
            let entry = stats.entry(tally.faction_id).or_insert_with(|| FactionStats {
                label: tally.faction_label.clone(),
                ..Default::default()
            });
            if target_yes == majority.is_yes() {
                entry.matches += 1;
            }
            entry.total += 1;
        }
    }

    let mut results: Vec<MatchResult> = stats
        .into_iter()
        .filter(|(_, s)| s.total > 0)
        .map(|(faction_id, s)| MatchResult {
            faction_id,
            faction_label: s.label,
            match_count: s.matches,
            total: s.total,
            percentage: rounded_percentage(s.matches, s.total),
        })
        .collect();
    results.sort_by(|a, b| {
        b.percentage
            .cmp(&a.percentage)
            .then(b.total.cmp(&a.total))
            .then(a.faction_id.cmp(&b.faction_id))
    });
    results
}

/// Factions on one poll whose original-frame majority agrees with the citizen,
/// largest decided blocs first.
pub fn agreeing_factions<'a>(
    stance: Stance,
    vote_flip: bool,
    tallies: &'a [FactionTally],
) -> Vec<&'a FactionTally> {
    let target_yes = targets_original_yes(stance.is_yes(), vote_flip);
    let mut out: Vec<&FactionTally> = tallies
        .iter()
        .filter(|t| t.original_majority().is_some_and(|m| m.is_yes() == target_yes))
        .collect();
    out.sort_by(|a, b| (b.yes + b.no).cmp(&(a.yes + a.no)).then(a.faction_id.cmp(&b.faction_id)));
    out
}

/// `round(100 * matches / total)` with halves rounded up; `total` must be non-zero.
fn rounded_percentage(matches: u32, total: u32) -> u32 {
    let (m, t) = (u64::from(matches), u64::from(total));
    ((200 * m + t) / (2 * t)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(poll_id: PollId, faction_id: FactionId, yes: u32, no: u32) -> FactionTally {
        FactionTally {
            poll_id,
            faction_id,
            faction_label: format!("Faction {faction_id}"),
            yes,
            no,
            abstain: 0,
            absent: 0,
        }
    }

    fn single(choice: UserChoice, flip: bool, majority: Stance) -> Vec<MatchResult> {
        let (yes, no) = if majority.is_yes() { (4, 1) } else { (1, 4) };
        compute_matches(
            &BTreeMap::from([(1, choice)]),
            &BTreeMap::from([(1, vec![tally(1, 9, yes, no)])]),
            &BTreeMap::from([(1, flip)]),
        )
    }

    #[test]
    fn xor_truth_table() {
        let cases = [
            (UserChoice::Yes, false, Stance::Yes, true),
            (UserChoice::Yes, false, Stance::No, false),
            (UserChoice::Yes, true, Stance::Yes, false),
            (UserChoice::Yes, true, Stance::No, true),
            (UserChoice::No, false, Stance::Yes, false),
            (UserChoice::No, false, Stance::No, true),
            (UserChoice::No, true, Stance::Yes, true),
            (UserChoice::No, true, Stance::No, false),
        ];
        for (choice, flip, majority, expect_match) in cases {
            let results = single(choice, flip, majority);
            assert_eq!(results.len(), 1, "{choice:?} flip={flip} majority={majority:?}");
            assert_eq!(results[0].total, 1);
            assert_eq!(
                results[0].match_count,
                u32::from(expect_match),
                "{choice:?} flip={flip} majority={majority:?}"
            );
        }
    }

    #[test]
    fn end_to_end_flipped_poll() {
        let tallies = BTreeMap::from([(100, vec![tally(100, 1, 5, 2), tally(100, 2, 1, 6)])]);
        let results = compute_matches(
            &BTreeMap::from([(100, UserChoice::Yes)]),
            &tallies,
            &BTreeMap::from([(100, true)]),
        );
        let a = results.iter().find(|r| r.faction_id == 1).unwrap();
        let b = results.iter().find(|r| r.faction_id == 2).unwrap();
        assert_eq!((a.match_count, a.total, a.percentage), (0, 1, 0));
        assert_eq!((b.match_count, b.total, b.percentage), (1, 1, 100));
        assert_eq!(results[0].faction_id, 2);
    }

    #[test]
    fn ties_are_excluded_from_numerator_and_denominator() {
        let tallies = BTreeMap::from([
            (1, vec![tally(1, 5, 3, 3), tally(1, 6, 4, 1)]),
            (2, vec![tally(2, 5, 5, 1), tally(2, 6, 2, 2)]),
        ]);
        let ballots = BTreeMap::from([(1, UserChoice::Yes), (2, UserChoice::Yes)]);
        let results = compute_matches(&ballots, &tallies, &BTreeMap::new());
        let five = results.iter().find(|r| r.faction_id == 5).unwrap();
        let six = results.iter().find(|r| r.faction_id == 6).unwrap();
        assert_eq!((five.match_count, five.total), (1, 1));
        assert_eq!((six.match_count, six.total), (1, 1));
    }

    #[test]
    fn always_tied_faction_is_not_reported() {
        let tallies = BTreeMap::from([(1, vec![tally(1, 5, 2, 2), tally(1, 6, 0, 0)])]);
        let results = compute_matches(
            &BTreeMap::from([(1, UserChoice::No)]),
            &tallies,
            &BTreeMap::new(),
        );
        assert!(results.is_empty());
    }

    #[test]
    fn skip_none_and_missing_data_contribute_nothing() {
        let tallies = BTreeMap::from([(1, vec![tally(1, 5, 3, 1)]), (2, vec![tally(2, 5, 3, 1)])]);
        let ballots = BTreeMap::from([
            (1, UserChoice::Skip),
            (2, UserChoice::None),
            (3, UserChoice::Yes),
        ]);
        assert!(compute_matches(&ballots, &tallies, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn missing_flip_defaults_to_unflipped() {
        let tallies = BTreeMap::from([(1, vec![tally(1, 5, 3, 1)])]);
        let results = compute_matches(&BTreeMap::from([(1, UserChoice::Yes)]), &tallies, &BTreeMap::new());
        assert_eq!(results[0].match_count, 1);
    }

    #[test]
    fn percentages_round_half_up_and_sort_descending() {
        let mut tallies = BTreeMap::new();
        let mut ballots = BTreeMap::new();
        for poll in 1..=8 {
            ballots.insert(poll, UserChoice::Yes);
            // faction 1 agrees on poll 1 only, faction 2 on polls 1..=2 of 3
            let mut rows = vec![tally(poll, 1, if poll == 1 { 5 } else { 0 }, if poll == 1 { 0 } else { 5 })];
            if poll <= 3 {
                rows.push(tally(poll, 2, if poll <= 2 { 5 } else { 0 }, if poll <= 2 { 0 } else { 5 }));
            }
            tallies.insert(poll, rows);
        }
        let results = compute_matches(&ballots, &tallies, &BTreeMap::new());
        assert_eq!(results[0].faction_id, 2);
        assert_eq!(results[0].percentage, 67);
        assert_eq!(results[1].faction_id, 1);
        assert_eq!(results[1].percentage, 13);
        assert_eq!(rounded_percentage(1, 3), 33);
        assert_eq!(rounded_percentage(1, 2), 50);
        assert_eq!(rounded_percentage(0, 4), 0);
    }

    #[test]
    fn abstain_majority_policy_is_opt_in() {
        let mut abstaining = tally(1, 5, 2, 1);
        abstaining.abstain = 10;
        let tallies = BTreeMap::from([(1, vec![abstaining])]);
        let ballots = BTreeMap::from([(1, UserChoice::Yes)]);
        assert_eq!(compute_matches(&ballots, &tallies, &BTreeMap::new()).len(), 1);
        let strict = MatchPolicy {
            exclude_abstain_majority: true,
        };
        assert!(compute_matches_with(strict, &ballots, &tallies, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn agreeing_factions_follow_flip() {
        let rows = vec![tally(1, 1, 5, 2), tally(1, 2, 1, 6), tally(1, 3, 2, 2)];
        let flipped: Vec<_> = agreeing_factions(Stance::Yes, true, &rows).iter().map(|t| t.faction_id).collect();
        assert_eq!(flipped, vec![2]);
        let plain: Vec<_> = agreeing_factions(Stance::Yes, false, &rows).iter().map(|t| t.faction_id).collect();
        assert_eq!(plain, vec![1]);
    }
}
