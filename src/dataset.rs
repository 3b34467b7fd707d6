// Dataset artifacts: one JSON file per voting date, published by the
// federal statistics office and never modified afterwards.
//
// The file is an untyped nested document (country -> proposals -> cantons
// -> municipalities). The record shapes below pin it down at the boundary
// so a missing field fails here instead of leaking nulls into the sums.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{ReconcileError, Result};
use crate::model::{compact_date, BfsCode, ProposalCode, RawTally, COMPACT_DATE_FORMAT};

// ============================================================================
// RECORD SHAPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    /// Voting date as recorded in the file ("20240303")
    #[serde(rename = "abstimmtag")]
    pub recorded_date: String,

    #[serde(rename = "schweiz")]
    pub country: CountryResults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountryResults {
    #[serde(rename = "vorlagen")]
    pub proposals: Vec<ProposalResults>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposalResults {
    #[serde(rename = "vorlagenId", deserialize_with = "numeric_code")]
    pub proposal_code: ProposalCode,

    #[serde(rename = "vorlagenTitel", default)]
    pub titles: Vec<LocalizedTitle>,

    #[serde(rename = "kantone")]
    pub cantons: Vec<CantonResults>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalizedTitle {
    #[serde(rename = "langKey")]
    pub lang: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CantonResults {
    #[serde(rename = "geoLevelnummer", deserialize_with = "text_code")]
    pub code: String,

    #[serde(rename = "geoLevelname")]
    pub name: String,

    /// Some cantons publish no municipality breakdown
    #[serde(rename = "gemeinden", default)]
    pub municipalities: Vec<MunicipalityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MunicipalityEntry {
    #[serde(rename = "geoLevelnummer", deserialize_with = "numeric_code")]
    pub code: BfsCode,

    #[serde(rename = "geoLevelname")]
    pub name: String,

    #[serde(rename = "resultat")]
    pub result: ResultFields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultFields {
    #[serde(rename = "jaStimmenAbsolut")]
    pub yes_count: u64,

    #[serde(rename = "neinStimmenAbsolut")]
    pub no_count: u64,

    #[serde(rename = "gueltigeStimmen")]
    pub valid_count: u64,

    #[serde(rename = "stimmbeteiligungInProzent")]
    pub turnout_pct: f64,

    #[serde(rename = "eingelegteStimmzettel", default)]
    pub ballots_cast: Option<u64>,

    #[serde(rename = "anzahlStimmberechtigte", default)]
    pub eligible_voters: Option<u64>,
}

/// `geoLevelnummer` is a string in most vintages and a number in some.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Number(u64),
    Text(String),
}

fn numeric_code<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(n) => u32::try_from(n)
            .map_err(|_| de::Error::custom(format!("code {n} out of range"))),
        StringOrNumber::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid numeric code '{s}'"))),
    }
}

fn text_code<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(n) => n.to_string(),
        StringOrNumber::Text(s) => s,
    })
}

impl Dataset {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_reader(BufReader::new(file)).map_err(|e| ReconcileError::DatasetParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn voting_date(&self) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(self.recorded_date.trim(), COMPACT_DATE_FORMAT)
            .map_err(|_| ReconcileError::InvalidDate(self.recorded_date.clone()))
    }
}

impl ProposalResults {
    /// Title in the given language; German is the canonical display title.
    pub fn title(&self, lang: &str) -> Option<&str> {
        self.titles
            .iter()
            .find(|t| t.lang == lang)
            .map(|t| t.text.as_str())
    }
}

impl MunicipalityEntry {
    pub fn to_tally(&self, canton: &CantonResults) -> RawTally {
        RawTally {
            code: self.code,
            name: self.name.clone(),
            canton: canton.name.clone(),
            yes_count: self.result.yes_count,
            no_count: self.result.no_count,
            valid_count: self.result.valid_count,
            turnout_pct: self.result.turnout_pct,
            ballots_cast: self.result.ballots_cast,
            eligible_voters: self.result.eligible_voters,
        }
    }
}

// ============================================================================
// DATASET STORE
// ============================================================================

/// Maps voting dates to dataset files and keeps parsed files around.
#[derive(Debug)]
pub struct DatasetStore {
    votes_dir: PathBuf,
    prefix: String,
    suffix: String,
    cache: Option<RwLock<HashMap<NaiveDate, Arc<Dataset>>>>,
}

impl DatasetStore {
    pub fn new(votes_dir: impl Into<PathBuf>, prefix: &str, suffix: &str, cache: bool) -> Self {
        DatasetStore {
            votes_dir: votes_dir.into(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            cache: cache.then(|| RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.votes_dir.clone(),
            &config.dataset_prefix,
            &config.dataset_suffix,
            config.cache_datasets,
        )
    }

    pub fn votes_dir(&self) -> &Path {
        &self.votes_dir
    }

    pub fn file_name_for(&self, date: NaiveDate) -> String {
        format!("{}{}{}", self.prefix, compact_date(date), self.suffix)
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.votes_dir.join(self.file_name_for(date))
    }

    pub fn has_dataset(&self, date: NaiveDate) -> bool {
        self.path_for(date).is_file()
    }

    /// Parsed dataset for `date`. Fails fast with `DatasetNotFound` when the
    /// file does not exist.
    pub fn load(&self, date: NaiveDate) -> Result<Arc<Dataset>> {
        if let Some(cache) = &self.cache {
            let cached = cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&date)
                .cloned();
            if let Some(dataset) = cached {
                debug!(%date, "dataset cache hit");
                return Ok(dataset);
            }
        }

        let path = self.path_for(date);
        if !path.is_file() {
            return Err(ReconcileError::DatasetNotFound { date, path });
        }

        let dataset = Dataset::from_path(&path)?;
        let recorded = dataset
            .voting_date()
            .map_err(|_| ReconcileError::DatasetDateMismatch {
                path: path.clone(),
                expected: date,
                found: dataset.recorded_date.clone(),
            })?;
        if recorded != date {
            return Err(ReconcileError::DatasetDateMismatch {
                path,
                expected: date,
                found: dataset.recorded_date.clone(),
            });
        }

        info!(
            file = %path.display(),
            proposals = dataset.country.proposals.len(),
            "dataset parsed"
        );

        let dataset = Arc::new(dataset);
        if let Some(cache) = &self.cache {
            cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(date, Arc::clone(&dataset));
        }
        Ok(dataset)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE: &str = r#"{
        "abstimmtag": "20040208",
        "schweiz": {
            "vorlagen": [{
                "vorlagenId": 4970,
                "vorlagenTitel": [
                    {"langKey": "de", "text": "Avanti"},
                    {"langKey": "fr", "text": "Avanti (fr)"}
                ],
                "kantone": [{
                    "geoLevelnummer": "21",
                    "geoLevelname": "Ticino",
                    "gemeinden": [{
                        "geoLevelnummer": "5226",
                        "geoLevelname": "Lugano",
                        "resultat": {
                            "jaStimmenAbsolut": 1009,
                            "neinStimmenAbsolut": 500,
                            "gueltigeStimmen": 1509,
                            "stimmbeteiligungInProzent": 45.5
                        }
                    }]
                }, {
                    "geoLevelnummer": 26,
                    "geoLevelname": "Jura"
                }]
            }]
        }
    }"#;

    fn write_sample(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_parse_sample_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path(), "sample.json", SAMPLE);

        let dataset = Dataset::from_path(&path).unwrap();
        assert_eq!(dataset.voting_date().unwrap(), NaiveDate::from_ymd_opt(2004, 2, 8).unwrap());

        let proposal = &dataset.country.proposals[0];
        assert_eq!(proposal.proposal_code, 4970);
        assert_eq!(proposal.title("de"), Some("Avanti"));
        assert_eq!(proposal.title("rm"), None);

        // numeric canton code and missing municipality list are both accepted
        assert_eq!(proposal.cantons[1].code, "26");
        assert!(proposal.cantons[1].municipalities.is_empty());

        let entry = &proposal.cantons[0].municipalities[0];
        let tally = entry.to_tally(&proposal.cantons[0]);
        assert_eq!(tally.code, 5226);
        assert_eq!(tally.canton, "Ticino");
        assert_eq!(tally.yes_count, 1009);
        assert_eq!(tally.ballots_cast, None);
    }

    #[test]
    fn test_missing_required_field_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let broken = SAMPLE.replace("\"jaStimmenAbsolut\": 1009,", "");
        let path = write_sample(dir.path(), "broken.json", &broken);

        let err = Dataset::from_path(&path).unwrap_err();
        match err {
            ReconcileError::DatasetParse { message, .. } => {
                assert!(message.contains("jaStimmenAbsolut"), "message: {message}");
            }
            other => panic!("expected DatasetParse, got {other:?}"),
        }
    }

    #[test]
    fn test_null_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let broken = SAMPLE.replace("\"jaStimmenAbsolut\": 1009", "\"jaStimmenAbsolut\": null");
        let path = write_sample(dir.path(), "null.json", &broken);

        assert!(matches!(
            Dataset::from_path(&path),
            Err(ReconcileError::DatasetParse { .. })
        ));
    }

    #[test]
    fn test_store_naming_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "sd-t-17-02-", "-eidgAbstimmung.json", true);
        let date = NaiveDate::from_ymd_opt(2004, 2, 8).unwrap();

        assert_eq!(store.file_name_for(date), "sd-t-17-02-20040208-eidgAbstimmung.json");
        assert!(!store.has_dataset(date));

        let err = store.load(date).unwrap_err();
        assert!(matches!(err, ReconcileError::DatasetNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_store_caches_parsed_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "sd-t-17-02-", "-eidgAbstimmung.json", true);
        let date = NaiveDate::from_ymd_opt(2004, 2, 8).unwrap();
        let path = write_sample(dir.path(), &store.file_name_for(date), SAMPLE);

        let first = store.load(date).unwrap();
        fs::remove_file(&path).unwrap();
        let second = store.load(date).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_store_rejects_date_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "v-", ".json", false);
        let date = NaiveDate::from_ymd_opt(2005, 6, 5).unwrap();
        write_sample(dir.path(), &store.file_name_for(date), SAMPLE);

        let err = store.load(date).unwrap_err();
        assert!(matches!(err, ReconcileError::DatasetDateMismatch { .. }));
    }
}
