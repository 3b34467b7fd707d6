use std::path::Path;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::error::{ReconcileError, Result};
use crate::merger_graph::MergerEdge;
use crate::model::{compact_date, BfsCode, RawTally, VotingDateSummary, COMPACT_DATE_FORMAT};

/// Open the results database for the lifetime of the process.
///
/// The core never writes: the handle is read-only and `query_only` is set
/// as a second guard.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(ReconcileError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "database not found"),
        });
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.pragma_update(None, "query_only", true)?;
    info!(path = %path.display(), "database opened read-only");
    Ok(conn)
}

/// Create the schema contract: raw results, the change table and the two
/// derived views. Safe to run on an existing database.
pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Raw results (one row per geo unit, proposal and voting date)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS votings (
            voting_id INTEGER PRIMARY KEY AUTOINCREMENT,
            voting_date TEXT NOT NULL UNIQUE,
            source_file TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS proposals (
            proposal_id INTEGER PRIMARY KEY AUTOINCREMENT,
            voting_id INTEGER NOT NULL REFERENCES votings(voting_id),
            vorlage_id INTEGER NOT NULL,
            title_de TEXT,
            title_fr TEXT,
            title_it TEXT,
            title_rm TEXT,
            title_en TEXT,
            UNIQUE (voting_id, vorlage_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS voting_results (
            result_id INTEGER PRIMARY KEY AUTOINCREMENT,
            voting_id INTEGER NOT NULL REFERENCES votings(voting_id),
            proposal_id INTEGER NOT NULL REFERENCES proposals(proposal_id),
            geo_level TEXT NOT NULL,
            geo_id INTEGER NOT NULL,
            geo_name TEXT,
            ja_stimmen_absolut INTEGER NOT NULL,
            nein_stimmen_absolut INTEGER NOT NULL,
            gueltige_stimmen INTEGER NOT NULL,
            stimmbeteiligung_prozent REAL,
            eingelegte_stimmzettel INTEGER,
            anzahl_stimmberechtigte INTEGER
        )",
        [],
    )?;

    // ==========================================================================
    // Municipal change table (populated by the import, read-only here)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS municipal_changes (
            change_id INTEGER PRIMARY KEY AUTOINCREMENT,
            old_bfs_number INTEGER NOT NULL,
            old_name TEXT,
            new_bfs_number INTEGER NOT NULL,
            new_name TEXT,
            mutation_date TEXT NOT NULL,
            mutation_type TEXT,
            is_merger BOOLEAN NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_geo ON voting_results(geo_level, geo_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_proposal ON voting_results(proposal_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_changes_old ON municipal_changes(old_bfs_number)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_changes_new ON municipal_changes(new_bfs_number)",
        [],
    )?;

    // ==========================================================================
    // Views: every recorded code mapped to the end of its merger chain,
    // then raw results summed per current municipality
    // ==========================================================================
    conn.execute(
        "CREATE VIEW IF NOT EXISTS v_municipality_mapping AS
        WITH RECURSIVE successor_chain(original_bfs, current_bfs, merge_depth) AS (
            SELECT DISTINCT geo_id, geo_id, 0
            FROM voting_results
            WHERE geo_level = 'municipality'

            UNION

            SELECT sc.original_bfs, mc.new_bfs_number, sc.merge_depth + 1
            FROM successor_chain sc
            JOIN municipal_changes mc ON mc.old_bfs_number = sc.current_bfs
            WHERE mc.is_merger = 1
              AND mc.old_bfs_number != mc.new_bfs_number
              AND sc.merge_depth < 32
        )
        SELECT sc.original_bfs, sc.current_bfs, sc.merge_depth
        FROM successor_chain sc
        WHERE NOT EXISTS (
            SELECT 1 FROM municipal_changes mc
            WHERE mc.old_bfs_number = sc.current_bfs
              AND mc.is_merger = 1
              AND mc.old_bfs_number != mc.new_bfs_number
        )",
        [],
    )?;

    conn.execute(
        "CREATE VIEW IF NOT EXISTS v_voting_results_current AS
        SELECT
            v.voting_date,
            p.vorlage_id AS proposal_code,
            p.title_de,
            m.current_bfs AS municipality_code,
            COALESCE(
                (SELECT mc.new_name FROM municipal_changes mc
                 WHERE mc.new_bfs_number = m.current_bfs
                 ORDER BY mc.mutation_date DESC LIMIT 1),
                MAX(vr.geo_name)
            ) AS municipality_name,
            SUM(vr.ja_stimmen_absolut) AS ja_count,
            SUM(vr.nein_stimmen_absolut) AS nein_count,
            SUM(vr.gueltige_stimmen) AS valid_count,
            CASE
                WHEN SUM(vr.anzahl_stimmberechtigte) > 0
                THEN ROUND(100.0 * SUM(vr.eingelegte_stimmzettel) / SUM(vr.anzahl_stimmberechtigte), 2)
                WHEN COUNT(DISTINCT vr.geo_id) = 1
                THEN MAX(vr.stimmbeteiligung_prozent)
                ELSE NULL
            END AS turnout_pct,
            COUNT(DISTINCT vr.geo_id) AS source_count,
            GROUP_CONCAT(DISTINCT vr.geo_id) AS source_codes
        FROM votings v
        JOIN proposals p ON p.voting_id = v.voting_id
        JOIN voting_results vr ON vr.proposal_id = p.proposal_id
        JOIN v_municipality_mapping m ON m.original_bfs = vr.geo_id
        WHERE vr.geo_level = 'municipality'
        GROUP BY v.voting_date, p.vorlage_id, p.title_de, m.current_bfs",
        [],
    )?;

    debug!("schema and views ready");
    Ok(())
}

// ============================================================================
// WRITES (schema fixtures only; the core itself never writes)
// ============================================================================

pub fn insert_voting(conn: &Connection, date: NaiveDate, source_file: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO votings (voting_date, source_file) VALUES (?1, ?2)",
        params![compact_date(date), source_file],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_proposal(
    conn: &Connection,
    voting_id: i64,
    vorlage_id: u32,
    title_de: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO proposals (voting_id, vorlage_id, title_de) VALUES (?1, ?2, ?3)",
        params![voting_id, vorlage_id, title_de],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_municipality_result(
    conn: &Connection,
    voting_id: i64,
    proposal_id: i64,
    tally: &RawTally,
) -> Result<()> {
    conn.execute(
        "INSERT INTO voting_results (
            voting_id, proposal_id, geo_level, geo_id, geo_name,
            ja_stimmen_absolut, nein_stimmen_absolut, gueltige_stimmen,
            stimmbeteiligung_prozent, eingelegte_stimmzettel, anzahl_stimmberechtigte
        ) VALUES (?1, ?2, 'municipality', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            voting_id,
            proposal_id,
            tally.code,
            tally.name,
            tally.yes_count as i64,
            tally.no_count as i64,
            tally.valid_count as i64,
            tally.turnout_pct,
            tally.ballots_cast.map(|v| v as i64),
            tally.eligible_voters.map(|v| v as i64),
        ],
    )?;
    Ok(())
}

pub fn insert_merger_edge(conn: &Connection, edge: &MergerEdge) -> Result<()> {
    conn.execute(
        "INSERT INTO municipal_changes (
            old_bfs_number, old_name, new_bfs_number, new_name,
            mutation_date, mutation_type, is_merger
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            edge.old_code,
            edge.old_name,
            edge.new_code,
            edge.new_name,
            compact_date(edge.mutation_date),
            edge.mutation_type,
            edge.is_merger,
        ],
    )?;
    Ok(())
}

/// Store every municipality row of a parsed dataset. Used to build
/// databases whose raw side is known to agree with a given file.
pub fn insert_dataset(conn: &Connection, dataset: &Dataset, source_file: &str) -> Result<usize> {
    let voting_id = insert_voting(conn, dataset.voting_date()?, source_file)?;
    let mut rows = 0;

    for proposal in &dataset.country.proposals {
        let proposal_id = insert_proposal(
            conn,
            voting_id,
            proposal.proposal_code,
            proposal.title("de"),
        )?;
        for canton in &proposal.cantons {
            for entry in &canton.municipalities {
                insert_municipality_result(conn, voting_id, proposal_id, &entry.to_tally(canton))?;
                rows += 1;
            }
        }
    }

    Ok(rows)
}

// ============================================================================
// READS
// ============================================================================

/// All rows of the change table, in table order.
pub fn load_merger_edges(conn: &Connection) -> Result<Vec<MergerEdge>> {
    let mut stmt = conn.prepare(
        "SELECT old_bfs_number, old_name, new_bfs_number, new_name,
                mutation_date, mutation_type, is_merger
         FROM municipal_changes
         ORDER BY change_id",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, BfsCode>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, BfsCode>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, bool>(6)?,
        ))
    })?;

    let mut edges = Vec::new();
    for row in rows {
        let (old_code, old_name, new_code, new_name, date, mutation_type, is_merger) = row?;
        let mutation_date = NaiveDate::parse_from_str(&date, COMPACT_DATE_FORMAT).map_err(|_| {
            ReconcileError::CorruptView(format!(
                "change {old_code} -> {new_code} has mutation_date '{date}'"
            ))
        })?;

        edges.push(MergerEdge {
            old_code,
            old_name: old_name.unwrap_or_default(),
            new_code,
            new_name: new_name.unwrap_or_default(),
            mutation_date,
            mutation_type: mutation_type.unwrap_or_default(),
            is_merger,
        });
    }

    Ok(edges)
}

/// Voting dates with the number of proposals on each, oldest first.
pub fn get_voting_dates(conn: &Connection) -> Result<Vec<VotingDateSummary>> {
    let mut stmt = conn.prepare(
        "SELECT v.voting_date, COUNT(p.proposal_id)
         FROM votings v
         LEFT JOIN proposals p ON p.voting_id = v.voting_id
         GROUP BY v.voting_id, v.voting_date
         ORDER BY v.voting_date",
    )?;

    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;

    let mut dates = Vec::new();
    for row in rows {
        let (date, proposal_count) = row?;
        let date = NaiveDate::parse_from_str(&date, COMPACT_DATE_FORMAT)
            .map_err(|_| ReconcileError::CorruptView(format!("voting_date '{date}'")))?;
        dates.push(VotingDateSummary {
            date,
            proposal_count,
        });
    }

    Ok(dates)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn tally(code: BfsCode, yes: u64, no: u64) -> RawTally {
        RawTally {
            code,
            name: format!("Gemeinde {code}"),
            canton: "TI".to_string(),
            yes_count: yes,
            no_count: no,
            valid_count: yes + no,
            turnout_pct: 50.0,
            ballots_cast: Some(yes + no),
            eligible_voters: Some(2 * (yes + no)),
        }
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let views: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(views, 2);
    }

    #[test]
    fn test_merger_edges_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let edge = MergerEdge {
            old_code: 5236,
            old_name: "Pazzallo".to_string(),
            new_code: 5226,
            new_name: "Lugano".to_string(),
            mutation_date: date("2004-04-04"),
            mutation_type: "merger".to_string(),
            is_merger: true,
        };
        insert_merger_edge(&conn, &edge).unwrap();

        let edges = load_merger_edges(&conn).unwrap();
        assert_eq!(edges, vec![edge]);
    }

    #[test]
    fn test_bad_mutation_date_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn.execute(
            "INSERT INTO municipal_changes (old_bfs_number, new_bfs_number, mutation_date, is_merger)
             VALUES (1, 2, '2004-13-01', 1)",
            [],
        )
        .unwrap();

        let err = load_merger_edges(&conn).unwrap_err();
        assert!(matches!(err, ReconcileError::CorruptView(_)));
    }

    #[test]
    fn test_voting_dates_count_proposals() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let later = insert_voting(&conn, date("2024-03-03"), "b.json").unwrap();
        let earlier = insert_voting(&conn, date("2004-02-08"), "a.json").unwrap();
        insert_proposal(&conn, later, 6720, Some("Initiative A")).unwrap();
        insert_proposal(&conn, later, 6730, Some("Initiative B")).unwrap();
        insert_proposal(&conn, earlier, 5000, None).unwrap();

        let dates = get_voting_dates(&conn).unwrap();
        assert_eq!(dates.len(), 2);
        assert_eq!(dates[0].date, date("2004-02-08"));
        assert_eq!(dates[0].proposal_count, 1);
        assert_eq!(dates[1].proposal_count, 2);
    }

    #[test]
    fn test_view_rolls_up_merged_codes() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        for old in [5236, 5237] {
            insert_merger_edge(
                &conn,
                &MergerEdge {
                    old_code: old,
                    old_name: format!("Gemeinde {old}"),
                    new_code: 5226,
                    new_name: "Lugano".to_string(),
                    mutation_date: date("2004-04-04"),
                    mutation_type: "merger".to_string(),
                    is_merger: true,
                },
            )
            .unwrap();
        }

        let voting_id = insert_voting(&conn, date("2003-05-18"), "x.json").unwrap();
        let proposal_id = insert_proposal(&conn, voting_id, 4970, Some("Vorlage")).unwrap();
        insert_municipality_result(&conn, voting_id, proposal_id, &tally(5226, 1009, 1)).unwrap();
        insert_municipality_result(&conn, voting_id, proposal_id, &tally(5236, 814, 2)).unwrap();
        insert_municipality_result(&conn, voting_id, proposal_id, &tally(5237, 268, 3)).unwrap();
        insert_municipality_result(&conn, voting_id, proposal_id, &tally(261, 5000, 4)).unwrap();

        let (yes, count, codes, name): (i64, i64, String, String) = conn
            .query_row(
                "SELECT ja_count, source_count, source_codes, municipality_name
                 FROM v_voting_results_current WHERE municipality_code = 5226",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();

        assert_eq!(yes, 2091);
        assert_eq!(count, 3);
        assert_eq!(crate::model::parse_source_codes(&codes).unwrap(), vec![5226, 5236, 5237]);
        assert_eq!(name, "Lugano");

        let untouched: i64 = conn
            .query_row(
                "SELECT source_count FROM v_voting_results_current WHERE municipality_code = 261",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(untouched, 1);
    }

    #[test]
    fn test_open_read_only_missing_file() {
        let err = open_read_only(Path::new("/nonexistent/votes.db")).unwrap_err();
        assert!(matches!(err, ReconcileError::Io { .. }));
    }
}
