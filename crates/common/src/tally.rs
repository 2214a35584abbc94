//! Result aggregation.
//!
//! Percentages are computed from the denormalized option counters, which the
//! ledger updates in the same atomic step as each vote record, so aggregation
//! never needs to lock or scan the ledger.

use serde::{Deserialize, Serialize};

/// Per-option counter as read from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionCount {
    /// Option ID.
    pub option_id: String,
    /// Current vote counter.
    pub votes: i64,
}

/// Aggregated result for one option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionResult {
    /// Option ID.
    pub option_id: String,
    /// Votes for this option.
    pub votes: i64,
    /// Share of all votes, rounded half-up to one decimal place.
    pub percentage: f64,
}

/// Aggregated results for a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    /// Sum of all option counters.
    pub total_votes: i64,
    /// Results in display order.
    pub results: Vec<OptionResult>,
}

/// Pure aggregation over option counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    /// Aggregate counters, preserving their order.
    #[must_use]
    pub fn aggregate(counts: &[OptionCount]) -> Tally {
        let total_votes: i64 = counts.iter().map(|c| c.votes.max(0)).sum();
        let results = counts
            .iter()
            .map(|c| OptionResult {
                option_id: c.option_id.clone(),
                votes: c.votes,
                percentage: percentage(c.votes, total_votes),
            })
            .collect();

        Tally {
            total_votes,
            results,
        }
    }
}

/// `votes / total * 100`, rounded half-up to one decimal; `0.0` when there
/// are no votes.
///
/// Computed in integer tenths so exact halves such as 1/16 = 6.25% round up.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentage(votes: i64, total: i64) -> f64 {
    if total <= 0 || votes <= 0 {
        return 0.0;
    }
    let votes = i128::from(votes);
    let total = i128::from(total);
    // round(votes * 1000 / total) with halves rounded up
    let tenths = (votes * 2000 + total) / (2 * total);
    tenths as f64 / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(values: &[i64]) -> Vec<OptionCount> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| OptionCount {
                option_id: format!("opt{i}"),
                votes: *v,
            })
            .collect()
    }

    #[test]
    fn test_zero_total_is_all_zero() {
        let tally = ResultAggregator::aggregate(&counts(&[0, 0, 0]));
        assert_eq!(tally.total_votes, 0);
        assert!(tally.results.iter().all(|r| r.percentage == 0.0));
    }

    #[test]
    fn test_simple_split() {
        let tally = ResultAggregator::aggregate(&counts(&[1, 3]));
        assert_eq!(tally.total_votes, 4);
        assert_eq!(tally.results[0].percentage, 25.0);
        assert_eq!(tally.results[1].percentage, 75.0);
    }

    #[test]
    fn test_round_half_up() {
        // 1/3 = 33.333.. -> 33.3, 2/3 = 66.666.. -> 66.7
        assert_eq!(percentage(1, 3), 33.3);
        assert_eq!(percentage(2, 3), 66.7);
        // 1/16 = 6.25 -> 6.3 (half rounds up)
        assert_eq!(percentage(1, 16), 6.3);
        // 1/80 = 1.25 -> 1.3
        assert_eq!(percentage(1, 80), 1.3);
        // 1/2000 = 0.05 -> 0.1
        assert_eq!(percentage(1, 2000), 0.1);
    }

    #[test]
    fn test_preserves_order() {
        let tally = ResultAggregator::aggregate(&counts(&[5, 0, 2]));
        let ids: Vec<_> = tally.results.iter().map(|r| r.option_id.as_str()).collect();
        assert_eq!(ids, ["opt0", "opt1", "opt2"]);
    }
}
