//! Orchestrates scan, decode, conditional write, and verification.
//!
//! Errors against one location or one row are accumulated and reported,
//! never fatal to the run. A second live run over the same data updates
//! zero rows.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::FieldLocation;
use crate::entities::{EntityRule, decode_all};
use crate::scanner::find_candidates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    #[serde(rename = "dry-run")]
    DryRun,
    #[serde(rename = "live")]
    Live,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Live => "live",
        }
    }
}

/// One record whose value would change (dry-run) or was changed (live).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub table: String,
    pub column: String,
    pub record_id: i64,
    pub original_value: String,
    pub decoded_value: String,
    pub matched_entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationError {
    pub table: String,
    pub column: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateError {
    pub table: String,
    pub record_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemainingRow {
    pub table: String,
    pub column: String,
    pub record_id: i64,
}

/// Result of the Scanning+Verifying pass: rows still matching any rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub remaining: usize,
    pub rows: Vec<RemainingRow>,
    pub location_errors: Vec<LocationError>,
}

/// The externally visible result of one run. `verify` is populated only
/// after a live run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub total_scanned: usize,
    pub total_updated: usize,
    pub total_errored: usize,
    pub per_entity_counts: BTreeMap<String, usize>,
    pub matches: Vec<MatchRecord>,
    pub location_errors: Vec<LocationError>,
    pub update_errors: Vec<UpdateError>,
    pub verify: Option<VerifyReport>,
}

struct ScanOutcome {
    matches: Vec<MatchRecord>,
    total_scanned: usize,
    location_errors: Vec<LocationError>,
}

pub struct FixRunner<'a> {
    connection: &'a Connection,
    rules: &'a [EntityRule],
    locations: &'a [FieldLocation],
}

impl<'a> FixRunner<'a> {
    pub fn new(
        connection: &'a Connection,
        rules: &'a [EntityRule],
        locations: &'a [FieldLocation],
    ) -> Self {
        Self {
            connection,
            rules,
            locations,
        }
    }

    /// Scan every location, decode candidates, and in live mode write the
    /// decoded values back one row at a time before a verification re-scan.
    pub fn run(&self, mode: RunMode) -> Result<RunReport> {
        let scan = self.scan_all();

        let mut per_entity_counts = BTreeMap::new();
        for record in &scan.matches {
            for entity in &record.matched_entities {
                *per_entity_counts.entry(entity.clone()).or_insert(0) += 1;
            }
        }

        let mut report = RunReport {
            mode,
            total_scanned: scan.total_scanned,
            total_updated: 0,
            total_errored: 0,
            per_entity_counts,
            matches: scan.matches,
            location_errors: scan.location_errors,
            update_errors: Vec::new(),
            verify: None,
        };

        if mode == RunMode::DryRun {
            return Ok(report);
        }

        for record in &report.matches {
            match self.apply_update(record) {
                Ok(()) => report.total_updated += 1,
                Err(error) => {
                    report.total_errored += 1;
                    report.update_errors.push(UpdateError {
                        table: record.table.clone(),
                        record_id: record.record_id,
                        error: format!("{error:#}"),
                    });
                }
            }
        }

        report.verify = Some(self.verify()?);
        Ok(report)
    }

    /// The Scanning+Verifying steps alone: every candidate row still
    /// matching any rule, with per-location failures recorded.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut rows = Vec::new();
        let mut location_errors = Vec::new();
        for location in self.locations {
            match find_candidates(self.connection, location, self.rules) {
                Ok(candidates) => {
                    rows.extend(candidates.into_iter().map(|candidate| RemainingRow {
                        table: location.table.clone(),
                        column: location.column.clone(),
                        record_id: candidate.record_id,
                    }));
                }
                Err(error) => location_errors.push(LocationError {
                    table: location.table.clone(),
                    column: location.column.clone(),
                    error: format!("{error:#}"),
                }),
            }
        }
        Ok(VerifyReport {
            remaining: rows.len(),
            rows,
            location_errors,
        })
    }

    fn scan_all(&self) -> ScanOutcome {
        let mut matches = Vec::new();
        let mut location_errors = Vec::new();
        let mut total_scanned = 0usize;

        for location in self.locations {
            match find_candidates(self.connection, location, self.rules) {
                Ok(candidates) => {
                    total_scanned += candidates.len();
                    for candidate in candidates {
                        let decoded = decode_all(self.rules, &candidate.value);
                        if decoded.text == candidate.value {
                            continue;
                        }
                        matches.push(MatchRecord {
                            table: location.table.clone(),
                            column: location.column.clone(),
                            record_id: candidate.record_id,
                            original_value: candidate.value,
                            decoded_value: decoded.text,
                            matched_entities: decoded
                                .matched
                                .into_iter()
                                .map(str::to_string)
                                .collect(),
                        });
                    }
                }
                Err(error) => location_errors.push(LocationError {
                    table: location.table.clone(),
                    column: location.column.clone(),
                    error: format!("{error:#}"),
                }),
            }
        }

        ScanOutcome {
            matches,
            total_scanned,
            location_errors,
        }
    }

    fn apply_update(&self, record: &MatchRecord) -> Result<()> {
        let location = self
            .locations
            .iter()
            .find(|location| {
                location.table == record.table && location.column == record.column
            })
            .with_context(|| {
                format!("no configured location for {}.{}", record.table, record.column)
            })?;

        let sql = format!(
            "UPDATE {table} SET {column} = ?1 WHERE {id} = ?2",
            table = location.table,
            column = location.column,
            id = location.id_column,
        );
        let affected = self
            .connection
            .execute(
                &sql,
                rusqlite::params![record.decoded_value, record.record_id],
            )
            .with_context(|| {
                format!(
                    "failed to update {} id {}",
                    location.display_name(),
                    record.record_id
                )
            })?;
        if affected == 0 {
            bail!(
                "no row updated for {} id {}",
                location.display_name(),
                record.record_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use crate::config::FieldLocation;
    use crate::db::apply_session_pragmas;
    use crate::entities::canonical_rules;

    use super::{FixRunner, RunMode};

    fn directory_fixture() -> Connection {
        let connection = Connection::open_in_memory().expect("open in-memory db");
        apply_session_pragmas(&connection).expect("pragmas");
        connection
            .execute_batch(
                "CREATE TABLE studios (id INTEGER PRIMARY KEY, name TEXT, description TEXT);
                 CREATE TABLE profiles (id INTEGER PRIMARY KEY, display_name TEXT);
                 INSERT INTO studios (id, name, description) VALUES
                   (1, 'Bob&#039;s Studio &amp; Co', 'Rates from &pound;40'),
                   (2, 'Clean Room', NULL),
                   (3, 'Caf&eacute; Voices', 'Quiet &amp; close');
                 INSERT INTO profiles (id, display_name) VALUES
                   (1, 'Ren&eacute;e'),
                   (2, 'Sam');",
            )
            .expect("seed fixture");
        connection
    }

    fn fixture_locations() -> Vec<FieldLocation> {
        vec![
            FieldLocation::new("studios", "name"),
            FieldLocation::new("studios", "description"),
            FieldLocation::new("profiles", "display_name"),
        ]
    }

    fn studio_name(connection: &Connection, id: i64) -> String {
        connection
            .query_row("SELECT name FROM studios WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .expect("read studio name")
    }

    #[test]
    fn live_run_fixes_rows_and_verifies_clean() {
        let connection = directory_fixture();
        let locations = fixture_locations();
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let report = runner.run(RunMode::Live).expect("live run");
        assert_eq!(report.total_updated, 5);
        assert_eq!(report.total_errored, 0);
        assert_eq!(studio_name(&connection, 1), "Bob's Studio & Co");
        assert_eq!(studio_name(&connection, 3), "Café Voices");

        let verify = report.verify.expect("verify report");
        assert_eq!(verify.remaining, 0);
        assert!(verify.rows.is_empty());
    }

    #[test]
    fn live_run_is_idempotent() {
        let connection = directory_fixture();
        let locations = fixture_locations();
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let first = runner.run(RunMode::Live).expect("first live run");
        assert!(first.total_updated > 0);

        let second = runner.run(RunMode::Live).expect("second live run");
        assert_eq!(second.total_updated, 0);
        assert_eq!(second.total_scanned, 0);
        assert!(second.matches.is_empty());
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let connection = directory_fixture();
        let locations = fixture_locations();
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let preview = runner.run(RunMode::DryRun).expect("dry run");
        assert_eq!(preview.total_updated, 0);
        assert!(preview.verify.is_none());
        assert_eq!(preview.matches.len(), 5);
        assert_eq!(studio_name(&connection, 1), "Bob&#039;s Studio &amp; Co");

        let again = runner.run(RunMode::DryRun).expect("second dry run");
        assert_eq!(again.matches, preview.matches);
    }

    #[test]
    fn scenario_a_report_shape() {
        let connection = directory_fixture();
        let locations = vec![FieldLocation::new("studios", "name")];
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let report = runner.run(RunMode::Live).expect("live run");
        let bob = report
            .matches
            .iter()
            .find(|record| record.record_id == 1)
            .expect("match for studio 1");
        assert_eq!(bob.decoded_value, "Bob's Studio & Co");
        assert_eq!(bob.matched_entities, vec!["&#039;", "&amp;"]);
        assert_eq!(report.per_entity_counts.get("&amp;"), Some(&1));
        assert_eq!(report.per_entity_counts.get("&eacute;"), Some(&1));
    }

    #[test]
    fn entity_free_rows_are_not_reported() {
        let connection = directory_fixture();
        let locations = fixture_locations();
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let report = runner.run(RunMode::DryRun).expect("dry run");
        assert!(
            report
                .matches
                .iter()
                .all(|record| !(record.table == "studios" && record.record_id == 2))
        );
        assert!(
            report
                .matches
                .iter()
                .all(|record| !(record.table == "profiles" && record.record_id == 2))
        );
    }

    #[test]
    fn failing_location_does_not_abort_the_scan() {
        let connection = directory_fixture();
        let mut locations = fixture_locations();
        locations.insert(0, FieldLocation::new("venues", "name"));
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let report = runner.run(RunMode::Live).expect("live run");
        assert_eq!(report.location_errors.len(), 1);
        assert_eq!(report.location_errors[0].table, "venues");
        assert_eq!(report.total_updated, 5);

        let verify = report.verify.expect("verify report");
        assert_eq!(verify.remaining, 0);
        assert_eq!(verify.location_errors.len(), 1);
    }

    #[test]
    fn blocked_update_is_counted_and_skipped() {
        let connection = directory_fixture();
        connection
            .execute_batch(
                "CREATE TRIGGER block_studio_one BEFORE UPDATE ON studios
                 WHEN NEW.id = 1
                 BEGIN SELECT RAISE(ABORT, 'row is locked'); END;",
            )
            .expect("create trigger");
        let locations = vec![
            FieldLocation::new("studios", "name"),
            FieldLocation::new("studios", "description"),
        ];
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let report = runner.run(RunMode::Live).expect("live run");
        assert_eq!(report.total_errored, 2);
        assert_eq!(report.update_errors.len(), 2);
        assert!(report.update_errors[0].error.contains("studios"));
        assert_eq!(report.total_updated, 2);
        assert_eq!(studio_name(&connection, 1), "Bob&#039;s Studio &amp; Co");
        assert_eq!(studio_name(&connection, 3), "Café Voices");

        let verify = report.verify.expect("verify report");
        assert_eq!(verify.remaining, 2);
        assert!(
            verify
                .rows
                .iter()
                .all(|row| row.table == "studios" && row.record_id == 1)
        );
    }

    #[test]
    fn verify_alone_counts_remaining_rows() {
        let connection = directory_fixture();
        let locations = fixture_locations();
        let runner = FixRunner::new(&connection, canonical_rules(), &locations);

        let before = runner.verify().expect("verify before fix");
        assert_eq!(before.remaining, 5);

        runner.run(RunMode::Live).expect("live run");

        let after = runner.verify().expect("verify after fix");
        assert_eq!(after.remaining, 0);
    }
}
