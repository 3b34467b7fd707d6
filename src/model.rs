// Shared domain types: codes, voting dates and the two tally shapes
// that the reconciliation compares against each other.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// Municipality number assigned by the federal statistics office (BFS).
pub type BfsCode = u32;

/// Proposal identifier (`vorlagenId` in the result files).
pub type ProposalCode = u32;

/// Storage format for voting and mutation dates ("20240303").
pub const COMPACT_DATE_FORMAT: &str = "%Y%m%d";

/// Parse a voting date given either as `YYYYMMDD` or `YYYY-MM-DD`.
pub fn parse_voting_date(input: &str) -> Result<NaiveDate, ReconcileError> {
    let trimmed = input.trim();
    NaiveDate::parse_from_str(trimmed, COMPACT_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .map_err(|_| ReconcileError::InvalidDate(input.to_string()))
}

/// Format a date the way the database and the dataset file names store it.
pub fn compact_date(date: NaiveDate) -> String {
    date.format(COMPACT_DATE_FORMAT).to_string()
}

// ============================================================================
// RAW TALLY (as recorded in the per-date result file)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTally {
    pub code: BfsCode,
    pub name: String,
    pub canton: String,
    pub yes_count: u64,
    pub no_count: u64,
    pub valid_count: u64,
    pub turnout_pct: f64,

    /// Present in newer result files; needed to recompute turnout for sums
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballots_cast: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligible_voters: Option<u64>,
}

// ============================================================================
// AGGREGATED TALLY (precomputed by the database view)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedTally {
    pub voting_date: NaiveDate,
    pub proposal_code: ProposalCode,
    pub title_de: Option<String>,
    pub municipality_code: BfsCode,
    pub municipality_name: String,
    pub yes_count: u64,
    pub no_count: u64,
    pub valid_count: u64,
    pub turnout_pct: Option<f64>,
    pub source_count: u32,
    /// Ascending, without duplicates
    pub source_codes: Vec<BfsCode>,
}

/// Parse the view's comma-separated `source_codes` column.
///
/// `GROUP_CONCAT` gives no ordering guarantee, so the result is sorted and
/// de-duplicated here.
pub fn parse_source_codes(raw: &str) -> Result<Vec<BfsCode>, ReconcileError> {
    let mut codes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<BfsCode>()
                .map_err(|_| ReconcileError::CorruptView(format!("invalid source code '{s}' in '{raw}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    codes.sort_unstable();
    codes.dedup();
    Ok(codes)
}

/// Turnout in hundredths of a percent, the precision the view rounds to.
pub fn turnout_hundredths(pct: f64) -> i64 {
    (pct * 100.0).round() as i64
}

// ============================================================================
// LISTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingDateSummary {
    pub date: NaiveDate,
    pub proposal_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeableMunicipality {
    pub code: BfsCode,
    pub name: String,
    pub merger_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_voting_date_both_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        assert_eq!(parse_voting_date("20240303").unwrap(), expected);
        assert_eq!(parse_voting_date("2024-03-03").unwrap(), expected);
        assert_eq!(compact_date(expected), "20240303");
    }

    #[test]
    fn test_parse_voting_date_rejects_garbage() {
        let err = parse_voting_date("03.03.2024").unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidDate(_)));
    }

    #[test]
    fn test_parse_source_codes_sorts_and_dedups() {
        let codes = parse_source_codes("5237,5226, 5236,5226").unwrap();
        assert_eq!(codes, vec![5226, 5236, 5237]);
        assert!(parse_source_codes("").unwrap().is_empty());
        assert!(parse_source_codes("52x6").is_err());
    }

    #[test]
    fn test_turnout_hundredths_rounds() {
        assert_eq!(turnout_hundredths(45.678), 4568);
        assert_eq!(turnout_hundredths(45.68), 4568);
        assert_eq!(turnout_hundredths(0.0), 0);
    }
}
