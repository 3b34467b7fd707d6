// Raw Result Locator
//
// Pulls the recorded tallies of a set of municipality codes out of one
// dataset, for every proposal of that voting date, in a single pass.
// A code missing from a proposal stays missing: it either did not exist
// yet or had already been merged away, and that is not the same as zero.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::dataset::{Dataset, DatasetStore};
use crate::error::{ReconcileError, Result};
use crate::model::{BfsCode, ProposalCode, RawTally};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalTallies {
    pub proposal_code: ProposalCode,
    pub title_de: Option<String>,
    /// Only the requested codes that were actually found
    pub tallies: BTreeMap<BfsCode, RawTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatedTallies {
    pub voting_date: NaiveDate,
    pub source_file: String,
    /// Every proposal of the dataset, keyed by proposal code
    pub proposals: BTreeMap<ProposalCode, ProposalTallies>,
}

impl LocatedTallies {
    /// Codes found under at least one proposal.
    pub fn found_codes(&self) -> BTreeSet<BfsCode> {
        self.proposals
            .values()
            .flat_map(|p| p.tallies.keys().copied())
            .collect()
    }

    /// Proposals where at least one requested code was found.
    pub fn proposals_with_tallies(&self) -> usize {
        self.proposals
            .values()
            .filter(|p| !p.tallies.is_empty())
            .count()
    }
}

/// Index the requested codes across all proposals and cantons of `dataset`.
///
/// A requested code listed twice under one proposal is an integrity failure
/// of the file and is reported instead of silently overwriting a tally.
pub fn index_tallies(
    dataset: &Dataset,
    codes: &BTreeSet<BfsCode>,
    source: &Path,
) -> Result<LocatedTallies> {
    let mut proposals = BTreeMap::new();

    for proposal in &dataset.country.proposals {
        let mut tallies = BTreeMap::new();

        for canton in &proposal.cantons {
            for entry in canton
                .municipalities
                .iter()
                .filter(|entry| codes.contains(&entry.code))
            {
                if tallies.insert(entry.code, entry.to_tally(canton)).is_some() {
                    return Err(ReconcileError::DatasetParse {
                        path: source.to_path_buf(),
                        message: format!(
                            "municipality {} listed twice for proposal {}",
                            entry.code, proposal.proposal_code
                        ),
                    });
                }
            }
        }

        let located = ProposalTallies {
            proposal_code: proposal.proposal_code,
            title_de: proposal.title("de").map(str::to_string),
            tallies,
        };
        if proposals.insert(proposal.proposal_code, located).is_some() {
            return Err(ReconcileError::DatasetParse {
                path: source.to_path_buf(),
                message: format!("proposal {} listed twice", proposal.proposal_code),
            });
        }
    }

    Ok(LocatedTallies {
        voting_date: dataset.voting_date()?,
        source_file: source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
        proposals,
    })
}

impl DatasetStore {
    /// Raw tallies of `codes` for every proposal on `date`.
    ///
    /// `DatasetNotFound` when there is no file for the date; an existing file
    /// without any of the codes yields proposals with empty tally maps.
    pub fn locate_raw_tallies(
        &self,
        date: NaiveDate,
        codes: &BTreeSet<BfsCode>,
    ) -> Result<LocatedTallies> {
        let dataset = self.load(date)?;
        let located = index_tallies(&dataset, codes, &self.path_for(date))?;

        debug!(
            %date,
            requested = codes.len(),
            found = located.found_codes().len(),
            proposals = located.proposals.len(),
            "raw tallies located"
        );
        Ok(located)
    }
}
