// ⚖️ Reconciliation Engine - raw tallies vs. the merger-aware view
//
// For one (voting date, current municipality):
//   Σ raw tallies of every predecessor found in the dataset
//     == aggregated tally of the view, field by field, proposal by proposal
//
// Proposals are paired by proposal code, never by position. Anything that
// cannot be paired is reported in the verdict, not skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::aggregate::AggregateSource;
use crate::dataset::DatasetStore;
use crate::error::{ReconcileError, Result};
use crate::locator::{LocatedTallies, ProposalTallies};
use crate::merger_graph::{MergerEdge, MergerGraph, PredecessorSet};
use crate::model::{turnout_hundredths, AggregatedTally, BfsCode, ProposalCode, RawTally};

// ============================================================================
// VERDICT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    /// Every field of every compared proposal matches (at least one compared)
    PerfectMatch,
    /// At least one field differs on at least one proposal
    Mismatch,
    /// One side has no proposals for this municipality and date
    NoData,
    /// The two sides disagree on which proposals exist
    ProposalAlignmentError,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::PerfectMatch => "PERFECT_MATCH",
            VerdictStatus::Mismatch => "MISMATCH",
            VerdictStatus::NoData => "NO_DATA",
            VerdictStatus::ProposalAlignmentError => "PROPOSAL_ALIGNMENT_ERROR",
        }
    }
}

// ============================================================================
// FIELD COMPARISON
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TallyField {
    YesCount,
    NoCount,
    ValidCount,
    /// Compared in hundredths of a percent
    TurnoutPct,
}

impl TallyField {
    pub const ALL: [TallyField; 4] = [
        TallyField::YesCount,
        TallyField::NoCount,
        TallyField::ValidCount,
        TallyField::TurnoutPct,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TallyField::YesCount => "yes",
            TallyField::NoCount => "no",
            TallyField::ValidCount => "valid",
            TallyField::TurnoutPct => "turnout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field: TallyField,
    /// Counts as-is, turnout in hundredths of a percent
    pub aggregated: Option<i64>,
    pub recomputed: Option<i64>,
    /// recomputed - aggregated
    pub difference: Option<i64>,
    pub matches: bool,
}

impl FieldComparison {
    fn new(field: TallyField, aggregated: Option<i64>, recomputed: Option<i64>) -> Self {
        let difference = match (aggregated, recomputed) {
            (Some(a), Some(r)) => Some(r - a),
            _ => None,
        };
        FieldComparison {
            field,
            aggregated,
            recomputed,
            difference,
            matches: aggregated == recomputed,
        }
    }
}

/// Sums over the raw tallies that were actually found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecomputedTotals {
    pub yes_count: u64,
    pub no_count: u64,
    pub valid_count: u64,
    pub turnout_pct: Option<f64>,
    pub contributor_count: usize,
}

impl RecomputedTotals {
    pub fn from_tallies(tallies: &[RawTally]) -> Self {
        RecomputedTotals {
            yes_count: tallies.iter().map(|t| t.yes_count).sum(),
            no_count: tallies.iter().map(|t| t.no_count).sum(),
            valid_count: tallies.iter().map(|t| t.valid_count).sum(),
            turnout_pct: recompute_turnout(tallies),
            contributor_count: tallies.len(),
        }
    }
}

/// Percentages cannot be summed: turnout is rebuilt from ballots cast and
/// eligible voters when every contributor reports both. A lone contributor
/// without those counts keeps its reported turnout.
fn recompute_turnout(tallies: &[RawTally]) -> Option<f64> {
    let counts: Option<Vec<(u64, u64)>> = tallies
        .iter()
        .map(|t| t.ballots_cast.zip(t.eligible_voters))
        .collect();

    if let Some(counts) = counts {
        let ballots: u64 = counts.iter().map(|(b, _)| b).sum();
        let eligible: u64 = counts.iter().map(|(_, e)| e).sum();
        if eligible > 0 {
            return Some(100.0 * ballots as f64 / eligible as f64);
        }
    }

    match tallies {
        [single] => Some(single.turnout_pct),
        _ => None,
    }
}

fn compare_fields(aggregated: &AggregatedTally, recomputed: &RecomputedTotals) -> Vec<FieldComparison> {
    TallyField::ALL
        .iter()
        .map(|&field| {
            let (a, r) = match field {
                TallyField::YesCount => (
                    Some(aggregated.yes_count as i64),
                    Some(recomputed.yes_count as i64),
                ),
                TallyField::NoCount => (
                    Some(aggregated.no_count as i64),
                    Some(recomputed.no_count as i64),
                ),
                TallyField::ValidCount => (
                    Some(aggregated.valid_count as i64),
                    Some(recomputed.valid_count as i64),
                ),
                TallyField::TurnoutPct => (
                    aggregated.turnout_pct.map(turnout_hundredths),
                    recomputed.turnout_pct.map(turnout_hundredths),
                ),
            };
            FieldComparison::new(field, a, r)
        })
        .collect()
}

// ============================================================================
// PER-PROPOSAL RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalOutcome {
    Compared,
    /// The view has the proposal, the dataset does not
    MissingFromDataset,
    /// The dataset has raw tallies for our codes, the view has no row
    MissingFromAggregate,
    /// Both have the proposal but none of the predecessor codes is in the file
    NoRawTallies,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalReconciliation {
    pub proposal_code: ProposalCode,
    pub title_de: Option<String>,
    pub outcome: ProposalOutcome,
    pub aggregated: Option<AggregatedTally>,
    /// Raw tallies by source municipality, ascending code
    pub raw_tallies: Vec<RawTally>,
    pub recomputed: Option<RecomputedTotals>,
    pub fields: Vec<FieldComparison>,
    /// Predecessors not present in the dataset for this proposal; excluded
    /// from the sums, their value is unknown
    pub absent_predecessors: Vec<BfsCode>,
    /// Codes the view claims to have summed that the dataset lacks
    pub missing_sources: Vec<BfsCode>,
    /// Codes found in the dataset that the view did not sum
    pub unexpected_sources: Vec<BfsCode>,
}

impl ProposalReconciliation {
    pub fn is_compared(&self) -> bool {
        self.outcome == ProposalOutcome::Compared
    }

    pub fn is_match(&self) -> bool {
        self.is_compared() && self.fields.iter().all(|f| f.matches)
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &FieldComparison> {
        self.fields.iter().filter(|f| !f.matches)
    }

    pub fn field(&self, field: TallyField) -> Option<&FieldComparison> {
        self.fields.iter().find(|f| f.field == field)
    }
}

// ============================================================================
// RECONCILIATION VERDICT
// ============================================================================

/// Built fresh per request and never persisted. Contains no wall-clock
/// time, so identical inputs serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationVerdict {
    pub voting_date: NaiveDate,
    pub municipality_code: BfsCode,
    pub municipality_name: Option<String>,
    pub status: VerdictStatus,
    pub source_file: String,
    pub predecessors: PredecessorSet,
    pub timeline: Vec<MergerEdge>,
    /// Ordered by proposal code
    pub proposals: Vec<ProposalReconciliation>,
    pub caveats: Vec<String>,
}

impl ReconciliationVerdict {
    pub fn is_perfect_match(&self) -> bool {
        self.status == VerdictStatus::PerfectMatch
    }

    pub fn compared_count(&self) -> usize {
        self.proposals.iter().filter(|p| p.is_compared()).count()
    }

    pub fn mismatch_count(&self) -> usize {
        self.proposals
            .iter()
            .filter(|p| p.is_compared() && !p.is_match())
            .count()
    }

    pub fn proposal(&self, code: ProposalCode) -> Option<&ProposalReconciliation> {
        self.proposals.iter().find(|p| p.proposal_code == code)
    }

    /// SHA-256 over the JSON serialization.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation for {} ({}) on {}: {}, {} proposal(s) compared, {} mismatching, {} predecessor code(s)",
            self.municipality_name.as_deref().unwrap_or("?"),
            self.municipality_code,
            self.voting_date,
            self.status.as_str(),
            self.compared_count(),
            self.mismatch_count(),
            self.predecessors.len(),
        )
    }
}

// ============================================================================
// BATCH VALIDATION
// ============================================================================

/// One compared proposal, flattened for CSV export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRow {
    pub voting_date: NaiveDate,
    pub municipality_code: BfsCode,
    pub municipality_name: String,
    pub proposal_code: ProposalCode,
    pub title_de: String,
    pub source_count: u32,
    pub source_codes: String,
    pub aggregated_yes: u64,
    pub aggregated_no: u64,
    pub aggregated_valid: u64,
    pub recomputed_yes: u64,
    pub recomputed_no: u64,
    pub recomputed_valid: u64,
    pub yes_match: bool,
    pub no_match: bool,
    pub valid_match: bool,
    pub turnout_match: bool,
}

impl ValidationRow {
    fn from_proposal(verdict: &ReconciliationVerdict, proposal: &ProposalReconciliation) -> Option<Self> {
        let aggregated = proposal.aggregated.as_ref()?;
        let recomputed = proposal.recomputed.as_ref()?;
        let matches = |field| proposal.field(field).map_or(false, |f| f.matches);

        Some(ValidationRow {
            voting_date: verdict.voting_date,
            municipality_code: verdict.municipality_code,
            municipality_name: aggregated.municipality_name.clone(),
            proposal_code: proposal.proposal_code,
            title_de: proposal.title_de.clone().unwrap_or_default(),
            source_count: aggregated.source_count,
            source_codes: aggregated
                .source_codes
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(","),
            aggregated_yes: aggregated.yes_count,
            aggregated_no: aggregated.no_count,
            aggregated_valid: aggregated.valid_count,
            recomputed_yes: recomputed.yes_count,
            recomputed_no: recomputed.no_count,
            recomputed_valid: recomputed.valid_count,
            yes_match: matches(TallyField::YesCount),
            no_match: matches(TallyField::NoCount),
            valid_match: matches(TallyField::ValidCount),
            turnout_match: matches(TallyField::TurnoutPct),
        })
    }

    pub fn all_match(&self) -> bool {
        self.yes_match && self.no_match && self.valid_match && self.turnout_match
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub verdicts: BTreeMap<VerdictStatus, usize>,
    pub rows: Vec<ValidationRow>,
    /// Dates without a dataset file
    pub skipped_dates: Vec<NaiveDate>,
    /// Requests that failed outright (graph integrity, unknown code)
    pub failures: Vec<String>,
}

impl ValidationSummary {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn match_count(&self, field: TallyField) -> usize {
        self.rows
            .iter()
            .filter(|r| match field {
                TallyField::YesCount => r.yes_match,
                TallyField::NoCount => r.no_match,
                TallyField::ValidCount => r.valid_match,
                TallyField::TurnoutPct => r.turnout_match,
            })
            .count()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &ValidationRow> {
        self.rows.iter().filter(|r| !r.all_match())
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        for row in &self.rows {
            csv_writer.serialize(row)?;
        }
        csv_writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    graph: MergerGraph,
    store: DatasetStore,
}

impl ReconciliationEngine {
    pub fn new(graph: MergerGraph, store: DatasetStore) -> Self {
        ReconciliationEngine { graph, store }
    }

    pub fn graph(&self) -> &MergerGraph {
        &self.graph
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// Reconcile one current municipality on one voting date.
    ///
    /// Errors: `GraphIntegrity` (fatal), `UnknownMunicipality`,
    /// `DatasetNotFound`. Everything else is reported in the verdict.
    pub fn reconcile<S>(&self, source: &S, date: NaiveDate, code: BfsCode) -> Result<ReconciliationVerdict>
    where
        S: AggregateSource + ?Sized,
    {
        // Full history: which predecessors matter on `date` shows up in
        // which ones the dataset actually contains
        let predecessors = self.graph.resolve_predecessors(code, None)?;
        let aggregates = source.fetch_aggregate(date, code)?;

        if aggregates.is_empty() && !self.graph.contains(code) && !source.knows_municipality(code)? {
            return Err(ReconcileError::UnknownMunicipality(code));
        }

        let located = self.store.locate_raw_tallies(date, &predecessors.codes())?;
        let timeline = self.graph.timeline(code)?;

        let municipality_name = aggregates
            .first()
            .map(|a| a.municipality_name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| self.graph.name_of(code).map(str::to_string));

        let aggregate_proposals = aggregates.len();
        let proposals = pair_proposals(aggregates, &located, &predecessors);

        let status = classify(&proposals, aggregate_proposals, &located);
        let caveats = collect_caveats(status, &proposals, &predecessors, &located, aggregate_proposals);

        let verdict = ReconciliationVerdict {
            voting_date: date,
            municipality_code: code,
            municipality_name,
            status,
            source_file: located.source_file.clone(),
            predecessors,
            timeline,
            proposals,
            caveats,
        };

        info!(
            %date,
            code,
            status = verdict.status.as_str(),
            compared = verdict.compared_count(),
            mismatching = verdict.mismatch_count(),
            "reconciled"
        );
        Ok(verdict)
    }

    /// Reconcile every (date, municipality) pair. Dates without a dataset
    /// are skipped; integrity and unknown-code failures are collected.
    pub fn validate_all<S>(
        &self,
        source: &S,
        dates: &[NaiveDate],
        codes: &[BfsCode],
    ) -> Result<ValidationSummary>
    where
        S: AggregateSource + ?Sized,
    {
        let mut summary = ValidationSummary::default();

        for &date in dates {
            if !self.store.has_dataset(date) {
                warn!(%date, file = %self.store.path_for(date).display(), "no dataset, skipping date");
                summary.skipped_dates.push(date);
                continue;
            }

            for &code in codes {
                match self.reconcile(source, date, code) {
                    Ok(verdict) => {
                        *summary.verdicts.entry(verdict.status).or_default() += 1;
                        summary.rows.extend(
                            verdict
                                .proposals
                                .iter()
                                .filter(|p| p.is_compared())
                                .filter_map(|p| ValidationRow::from_proposal(&verdict, p)),
                        );
                    }
                    Err(e @ ReconcileError::GraphIntegrity { .. })
                    | Err(e @ ReconcileError::UnknownMunicipality(_)) => {
                        warn!(%date, code, error = %e, "reconciliation failed");
                        summary.failures.push(format!("{date} / {code}: {e}"));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(
            rows = summary.total_rows(),
            skipped = summary.skipped_dates.len(),
            failures = summary.failures.len(),
            "batch validation done"
        );
        Ok(summary)
    }
}

/// Key both sides by proposal code and build one entry per proposal that
/// concerns this municipality.
fn pair_proposals(
    aggregates: Vec<AggregatedTally>,
    located: &LocatedTallies,
    predecessors: &PredecessorSet,
) -> Vec<ProposalReconciliation> {
    let mut by_code: BTreeMap<ProposalCode, AggregatedTally> = aggregates
        .into_iter()
        .map(|a| (a.proposal_code, a))
        .collect();

    let all_codes: BTreeSet<ProposalCode> = by_code
        .keys()
        .copied()
        .chain(located.proposals.keys().copied())
        .collect();

    let mut proposals = Vec::new();
    for proposal_code in all_codes {
        let aggregated = by_code.remove(&proposal_code);
        let raw = located.proposals.get(&proposal_code);

        let entry = match (aggregated, raw) {
            (Some(aggregated), Some(raw)) if raw.tallies.is_empty() => ProposalReconciliation {
                proposal_code,
                title_de: aggregated.title_de.clone().or_else(|| raw.title_de.clone()),
                outcome: ProposalOutcome::NoRawTallies,
                missing_sources: aggregated.source_codes.clone(),
                aggregated: Some(aggregated),
                raw_tallies: Vec::new(),
                recomputed: None,
                fields: Vec::new(),
                absent_predecessors: predecessors.ordered_codes(),
                unexpected_sources: Vec::new(),
            },
            (Some(aggregated), Some(raw)) => compare_proposal(aggregated, raw, predecessors),
            (Some(aggregated), None) => ProposalReconciliation {
                proposal_code,
                title_de: aggregated.title_de.clone(),
                outcome: ProposalOutcome::MissingFromDataset,
                missing_sources: aggregated.source_codes.clone(),
                aggregated: Some(aggregated),
                raw_tallies: Vec::new(),
                recomputed: None,
                fields: Vec::new(),
                absent_predecessors: predecessors.ordered_codes(),
                unexpected_sources: Vec::new(),
            },
            // Proposal exists in the file but none of our codes voted on it
            (None, Some(raw)) if raw.tallies.is_empty() => continue,
            (None, Some(raw)) => {
                let raw_tallies: Vec<RawTally> = raw.tallies.values().cloned().collect();
                ProposalReconciliation {
                    proposal_code,
                    title_de: raw.title_de.clone(),
                    outcome: ProposalOutcome::MissingFromAggregate,
                    aggregated: None,
                    recomputed: Some(RecomputedTotals::from_tallies(&raw_tallies)),
                    absent_predecessors: absent_from(predecessors, raw),
                    unexpected_sources: raw.tallies.keys().copied().collect(),
                    raw_tallies,
                    fields: Vec::new(),
                    missing_sources: Vec::new(),
                }
            }
            (None, None) => continue,
        };
        proposals.push(entry);
    }

    proposals
}

fn compare_proposal(
    aggregated: AggregatedTally,
    raw: &ProposalTallies,
    predecessors: &PredecessorSet,
) -> ProposalReconciliation {
    let raw_tallies: Vec<RawTally> = raw.tallies.values().cloned().collect();
    let recomputed = RecomputedTotals::from_tallies(&raw_tallies);
    let fields = compare_fields(&aggregated, &recomputed);

    let claimed: BTreeSet<BfsCode> = aggregated.source_codes.iter().copied().collect();
    let missing_sources = claimed
        .iter()
        .filter(|c| !raw.tallies.contains_key(c))
        .copied()
        .collect();
    let unexpected_sources = raw
        .tallies
        .keys()
        .filter(|c| !claimed.contains(c))
        .copied()
        .collect();

    ProposalReconciliation {
        proposal_code: aggregated.proposal_code,
        title_de: aggregated.title_de.clone().or_else(|| raw.title_de.clone()),
        outcome: ProposalOutcome::Compared,
        aggregated: Some(aggregated),
        raw_tallies,
        recomputed: Some(recomputed),
        fields,
        absent_predecessors: absent_from(predecessors, raw),
        missing_sources,
        unexpected_sources,
    }
}

fn absent_from(predecessors: &PredecessorSet, raw: &ProposalTallies) -> Vec<BfsCode> {
    predecessors
        .ordered_codes()
        .into_iter()
        .filter(|c| !raw.tallies.contains_key(c))
        .collect()
}

fn classify(
    proposals: &[ProposalReconciliation],
    aggregate_proposals: usize,
    located: &LocatedTallies,
) -> VerdictStatus {
    if aggregate_proposals == 0 || located.proposals_with_tallies() == 0 {
        return VerdictStatus::NoData;
    }
    if proposals.iter().any(|p| !p.is_compared()) {
        return VerdictStatus::ProposalAlignmentError;
    }
    if proposals.iter().any(|p| !p.is_match()) {
        return VerdictStatus::Mismatch;
    }
    VerdictStatus::PerfectMatch
}

fn collect_caveats(
    status: VerdictStatus,
    proposals: &[ProposalReconciliation],
    predecessors: &PredecessorSet,
    located: &LocatedTallies,
    aggregate_proposals: usize,
) -> Vec<String> {
    let mut caveats = Vec::new();
    let found = located.found_codes();

    if status == VerdictStatus::NoData && aggregate_proposals == 0 && !found.is_empty() {
        caveats.push(format!(
            "dataset has raw tallies for {} proposal(s) but the view has no rows",
            located.proposals_with_tallies()
        ));
    }

    // Upstream pre-aggregation and a post-merger date look the same here
    if status == VerdictStatus::PerfectMatch
        && predecessors.len() > 1
        && found.len() == 1
        && found.contains(&predecessors.root)
    {
        caveats.push(format!(
            "only {} reported on this date although {} codes feed into it; \
             upstream pre-aggregation of merged municipalities cannot be detected",
            predecessors.root,
            predecessors.len()
        ));
    }

    for proposal in proposals.iter().filter(|p| p.is_compared()) {
        let Some(aggregated) = &proposal.aggregated else {
            continue;
        };
        if aggregated.source_count as usize != aggregated.source_codes.len() {
            caveats.push(format!(
                "proposal {}: view reports source_count {} but lists {} source code(s)",
                proposal.proposal_code,
                aggregated.source_count,
                aggregated.source_codes.len()
            ));
        }
        if !proposal.missing_sources.is_empty() || !proposal.unexpected_sources.is_empty() {
            caveats.push(format!(
                "proposal {}: source codes differ (view only: {:?}, dataset only: {:?})",
                proposal.proposal_code, proposal.missing_sources, proposal.unexpected_sources
            ));
        }
    }

    caveats
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    /// In-memory aggregate source, to model views that disagree with the
    /// dataset without building a database for each case.
    #[derive(Default)]
    struct FakeAggregates {
        rows: HashMap<(NaiveDate, BfsCode), Vec<AggregatedTally>>,
    }

    impl AggregateSource for FakeAggregates {
        fn fetch_aggregate(&self, date: NaiveDate, code: BfsCode) -> Result<Vec<AggregatedTally>> {
            Ok(self.rows.get(&(date, code)).cloned().unwrap_or_default())
        }

        fn knows_municipality(&self, code: BfsCode) -> Result<bool> {
            Ok(self.rows.keys().any(|(_, c)| *c == code))
        }
    }

    fn voting_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2003, 5, 18).unwrap()
    }

    fn aggregate(proposal: ProposalCode, yes: u64, no: u64, codes: &[BfsCode]) -> AggregatedTally {
        AggregatedTally {
            voting_date: voting_date(),
            proposal_code: proposal,
            title_de: Some(format!("Vorlage {proposal}")),
            municipality_code: 5226,
            municipality_name: "Lugano".to_string(),
            yes_count: yes,
            no_count: no,
            valid_count: yes + no,
            // the view falls back to the reported turnout of a lone source
            turnout_pct: (codes.len() == 1).then_some(50.0),
            source_count: codes.len() as u32,
            source_codes: codes.to_vec(),
        }
    }

    fn municipality(code: BfsCode, yes: u64, no: u64) -> serde_json::Value {
        serde_json::json!({
            "geoLevelnummer": code.to_string(),
            "geoLevelname": format!("Gemeinde {code}"),
            "resultat": {
                "jaStimmenAbsolut": yes,
                "neinStimmenAbsolut": no,
                "gueltigeStimmen": yes + no,
                "stimmbeteiligungInProzent": 50.0
            }
        })
    }

    fn write_dataset(store: &DatasetStore, proposals: Vec<(ProposalCode, Vec<serde_json::Value>)>) {
        let vorlagen: Vec<serde_json::Value> = proposals
            .into_iter()
            .map(|(code, gemeinden)| {
                serde_json::json!({
                    "vorlagenId": code,
                    "vorlagenTitel": [{"langKey": "de", "text": format!("Vorlage {code}")}],
                    "kantone": [{"geoLevelnummer": "21", "geoLevelname": "Ticino", "gemeinden": gemeinden}]
                })
            })
            .collect();
        let body = serde_json::json!({"abstimmtag": "20030518", "schweiz": {"vorlagen": vorlagen}});
        fs::write(store.path_for(voting_date()), body.to_string()).unwrap();
    }

    fn lugano_graph() -> MergerGraph {
        let edge = |old: BfsCode| MergerEdge {
            old_code: old,
            old_name: format!("Gemeinde {old}"),
            new_code: 5226,
            new_name: "Lugano".to_string(),
            mutation_date: NaiveDate::from_ymd_opt(2004, 4, 4).unwrap(),
            mutation_type: "merger".to_string(),
            is_merger: true,
        };
        MergerGraph::new(vec![edge(5236), edge(5237)])
    }

    fn engine_with(
        proposals: Vec<(ProposalCode, Vec<serde_json::Value>)>,
    ) -> (tempfile::TempDir, ReconciliationEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "sd-t-17-02-", "-eidgAbstimmung.json", true);
        write_dataset(&store, proposals);
        (dir, ReconciliationEngine::new(lugano_graph(), store))
    }

    fn fake(rows: Vec<AggregatedTally>) -> FakeAggregates {
        let mut fake = FakeAggregates::default();
        fake.rows.insert((voting_date(), 5226), rows);
        fake
    }

    #[test]
    fn test_reconciliation_perfect_match() {
        let (_dir, engine) = engine_with(vec![(
            6720,
            vec![municipality(5226, 1009, 10), municipality(5236, 814, 20), municipality(5237, 268, 30)],
        )]);
        let source = fake(vec![aggregate(6720, 2091, 60, &[5226, 5236, 5237])]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();

        assert_eq!(verdict.status, VerdictStatus::PerfectMatch);
        assert!(verdict.is_perfect_match());
        let proposal = verdict.proposal(6720).unwrap();
        assert_eq!(proposal.raw_tallies.len(), 3);
        assert_eq!(proposal.recomputed.as_ref().unwrap().yes_count, 2091);
        let yes = proposal.field(TallyField::YesCount).unwrap();
        assert_eq!(yes.aggregated, Some(2091));
        assert_eq!(yes.difference, Some(0));
        assert!(proposal.absent_predecessors.is_empty());
        assert!(verdict.caveats.is_empty());

        println!("✅ Test passed: {}", verdict.summary());
    }

    #[test]
    fn test_reconciliation_mismatch_reports_difference() {
        let (_dir, engine) = engine_with(vec![(
            6720,
            vec![municipality(5226, 1009, 10), municipality(5236, 814, 20), municipality(5237, 268, 30)],
        )]);
        let source = fake(vec![aggregate(6720, 2100, 60, &[5226, 5236, 5237])]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();

        assert_eq!(verdict.status, VerdictStatus::Mismatch);
        assert_eq!(verdict.mismatch_count(), 1);
        let proposal = verdict.proposal(6720).unwrap();
        let mismatches: Vec<_> = proposal.mismatches().collect();
        // yes and valid both carry the 9 vote gap
        assert_eq!(mismatches.len(), 2);
        let yes = proposal.field(TallyField::YesCount).unwrap();
        assert_eq!(yes.recomputed, Some(2091));
        assert_eq!(yes.difference, Some(-9));
        assert!(proposal.field(TallyField::NoCount).unwrap().matches);
    }

    #[test]
    fn test_absent_predecessor_not_treated_as_zero() {
        // 5237 did not report: the view summed only two codes
        let (_dir, engine) = engine_with(vec![(
            6720,
            vec![municipality(5226, 1009, 10), municipality(5236, 814, 20)],
        )]);
        let source = fake(vec![aggregate(6720, 1823, 30, &[5226, 5236])]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();
        let proposal = verdict.proposal(6720).unwrap();

        assert_eq!(verdict.status, VerdictStatus::PerfectMatch);
        assert_eq!(proposal.absent_predecessors, vec![5237]);
        assert_eq!(proposal.recomputed.as_ref().unwrap().contributor_count, 2);
        assert!(proposal.raw_tallies.iter().all(|t| t.code != 5237));
    }

    #[test]
    fn test_alignment_error_instead_of_positional_pairing() {
        let (_dir, engine) = engine_with(vec![(6720, vec![municipality(5226, 1009, 10)])]);
        let source = fake(vec![
            aggregate(6710, 5, 5, &[5226]),
            aggregate(6720, 1009, 10, &[5226]),
        ]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();

        assert_eq!(verdict.status, VerdictStatus::ProposalAlignmentError);
        let missing = verdict.proposal(6710).unwrap();
        assert_eq!(missing.outcome, ProposalOutcome::MissingFromDataset);
        // the proposal present on both sides is still compared correctly
        let compared = verdict.proposal(6720).unwrap();
        assert!(compared.is_match());
    }

    #[test]
    fn test_missing_from_aggregate_is_alignment_error() {
        let (_dir, engine) = engine_with(vec![
            (6720, vec![municipality(5226, 1009, 10)]),
            (6730, vec![municipality(5226, 7, 3)]),
        ]);
        let source = fake(vec![aggregate(6720, 1009, 10, &[5226])]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();

        assert_eq!(verdict.status, VerdictStatus::ProposalAlignmentError);
        let extra = verdict.proposal(6730).unwrap();
        assert_eq!(extra.outcome, ProposalOutcome::MissingFromAggregate);
        assert_eq!(extra.unexpected_sources, vec![5226]);
    }

    #[test]
    fn test_proposal_without_our_codes_is_ignored() {
        let (_dir, engine) = engine_with(vec![
            (6720, vec![municipality(5226, 1009, 10)]),
            (6730, vec![municipality(261, 7, 3)]),
        ]);
        let source = fake(vec![aggregate(6720, 1009, 10, &[5226])]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();
        assert_eq!(verdict.status, VerdictStatus::PerfectMatch);
        assert_eq!(verdict.proposals.len(), 1);
    }

    #[test]
    fn test_no_data_when_view_is_empty() {
        let (_dir, engine) = engine_with(vec![(6720, vec![municipality(261, 7, 3)])]);
        let source = fake(vec![]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();
        assert_eq!(verdict.status, VerdictStatus::NoData);
        assert!(!verdict.is_perfect_match());
        assert_eq!(verdict.compared_count(), 0);
    }

    #[test]
    fn test_missing_dataset_is_error_not_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "sd-t-17-02-", "-eidgAbstimmung.json", false);
        let engine = ReconciliationEngine::new(lugano_graph(), store);
        let source = fake(vec![aggregate(6720, 1009, 10, &[5226])]);

        let err = engine.reconcile(&source, voting_date(), 5226).unwrap_err();
        assert!(matches!(err, ReconcileError::DatasetNotFound { .. }));
    }

    #[test]
    fn test_unknown_municipality() {
        let (_dir, engine) = engine_with(vec![(6720, vec![municipality(5226, 1009, 10)])]);
        let source = fake(vec![]);

        let err = engine.reconcile(&source, voting_date(), 42).unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownMunicipality(42)));
    }

    #[test]
    fn test_idempotent_verdicts() {
        let (_dir, engine) = engine_with(vec![(
            6720,
            vec![municipality(5226, 1009, 10), municipality(5236, 814, 20)],
        )]);
        let source = fake(vec![aggregate(6720, 1823, 30, &[5226, 5236])]);

        let first = engine.reconcile(&source, voting_date(), 5226).unwrap();
        let second = engine.reconcile(&source, voting_date(), 5226).unwrap();

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);
    }

    #[test]
    fn test_detection_gap_caveat() {
        // After the merger only the surviving code reports
        let (_dir, engine) = engine_with(vec![(6720, vec![municipality(5226, 3000, 100)])]);
        let source = fake(vec![aggregate(6720, 3000, 100, &[5226])]);

        let verdict = engine.reconcile(&source, voting_date(), 5226).unwrap();

        assert_eq!(verdict.status, VerdictStatus::PerfectMatch);
        assert_eq!(verdict.caveats.len(), 1);
        assert!(verdict.caveats[0].contains("cannot be detected"));
    }

    #[test]
    fn test_turnout_recomputed_from_counts() {
        let with_counts = |code, ballots, eligible| RawTally {
            code,
            name: String::new(),
            canton: String::new(),
            yes_count: 0,
            no_count: 0,
            valid_count: 0,
            turnout_pct: 99.0,
            ballots_cast: Some(ballots),
            eligible_voters: Some(eligible),
        };

        let totals = RecomputedTotals::from_tallies(&[with_counts(1, 300, 1000), with_counts(2, 200, 600)]);
        assert_eq!(totals.turnout_pct.map(turnout_hundredths), Some(3125));

        let mut lone = with_counts(1, 0, 0);
        lone.ballots_cast = None;
        let totals = RecomputedTotals::from_tallies(&[lone.clone()]);
        assert_eq!(totals.turnout_pct, Some(99.0));

        let totals = RecomputedTotals::from_tallies(&[lone.clone(), lone]);
        assert_eq!(totals.turnout_pct, None);
    }

    #[test]
    fn test_validate_all_counts_and_skips() {
        let (_dir, engine) = engine_with(vec![(
            6720,
            vec![municipality(5226, 1009, 10), municipality(5236, 814, 20)],
        )]);
        let source = fake(vec![aggregate(6720, 1800, 30, &[5226, 5236])]);
        let missing_date = NaiveDate::from_ymd_opt(1999, 2, 7).unwrap();

        let summary = engine
            .validate_all(&source, &[voting_date(), missing_date], &[5226, 42])
            .unwrap();

        assert_eq!(summary.skipped_dates, vec![missing_date]);
        assert_eq!(summary.total_rows(), 1);
        assert_eq!(summary.match_count(TallyField::NoCount), 1);
        assert_eq!(summary.match_count(TallyField::YesCount), 0);
        assert_eq!(summary.mismatches().count(), 1);
        assert_eq!(summary.verdicts.get(&VerdictStatus::Mismatch), Some(&1));
        assert_eq!(summary.failures.len(), 1);

        let mut out = Vec::new();
        summary.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("voting_date,municipality_code"));
        assert!(text.contains("5226,5236"));
    }

    #[test]
    fn test_verdict_status_serializes_screaming() {
        let json = serde_json::to_string(&VerdictStatus::PerfectMatch).unwrap();
        assert_eq!(json, "\"PERFECT_MATCH\"");
        assert_eq!(VerdictStatus::ProposalAlignmentError.as_str(), "PROPOSAL_ALIGNMENT_ERROR");
    }
}
