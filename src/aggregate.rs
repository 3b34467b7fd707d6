// Aggregate Fetcher - reads the precomputed merger-aware view.
// No merger logic lives here; the view already rolled everything up.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ReconcileError, Result};
use crate::model::{compact_date, parse_source_codes, AggregatedTally, BfsCode};

/// Source of aggregated tallies. Implemented for the SQLite connection;
/// the engine only depends on this trait.
pub trait AggregateSource {
    /// One row per proposal on `date` for the current municipality `code`,
    /// ordered by proposal code. Empty when the municipality has no rows.
    fn fetch_aggregate(&self, date: NaiveDate, code: BfsCode) -> Result<Vec<AggregatedTally>>;

    /// Whether `code` appears in the view for any voting date.
    fn knows_municipality(&self, code: BfsCode) -> Result<bool>;
}

impl AggregateSource for Connection {
    fn fetch_aggregate(&self, date: NaiveDate, code: BfsCode) -> Result<Vec<AggregatedTally>> {
        let mut stmt = self.prepare_cached(
            "SELECT proposal_code, title_de, municipality_name,
                    ja_count, nein_count, valid_count, turnout_pct,
                    source_count, source_codes
             FROM v_voting_results_current
             WHERE voting_date = ?1 AND municipality_code = ?2
             ORDER BY proposal_code",
        )?;

        let rows = stmt.query_map(params![compact_date(date), code], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut tallies = Vec::new();
        for row in rows {
            let (proposal_code, title_de, name, yes, no, valid, turnout, source_count, codes) = row?;

            tallies.push(AggregatedTally {
                voting_date: date,
                proposal_code,
                title_de,
                municipality_code: code,
                municipality_name: name.unwrap_or_default(),
                yes_count: non_negative(yes, "ja_count", code)?,
                no_count: non_negative(no, "nein_count", code)?,
                valid_count: non_negative(valid, "valid_count", code)?,
                turnout_pct: turnout,
                source_count,
                source_codes: parse_source_codes(&codes)?,
            });
        }

        Ok(tallies)
    }

    fn knows_municipality(&self, code: BfsCode) -> Result<bool> {
        let found = self
            .query_row(
                "SELECT 1 FROM v_voting_results_current WHERE municipality_code = ?1 LIMIT 1",
                params![code],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn non_negative(value: i64, column: &str, code: BfsCode) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        ReconcileError::CorruptView(format!("{column} = {value} for municipality {code}"))
    })
}
