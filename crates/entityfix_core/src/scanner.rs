use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::config::FieldLocation;
use crate::entities::EntityRule;

/// A row whose column value contains at least one encoded entity. The
/// decoder fills in which entities matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub record_id: i64,
    pub value: String,
}

/// Find every row at `location` whose value contains at least one rule's
/// encoded form, ordered by the id column ascending. NULL values never
/// match. One combined OR-query per location keeps the result deduplicated
/// by primary key.
pub fn find_candidates(
    connection: &Connection,
    location: &FieldLocation,
    rules: &[EntityRule],
) -> Result<Vec<CandidateRow>> {
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    let sql = build_scan_query(location, rules.len());
    let mut statement = connection.prepare(&sql).with_context(|| {
        format!(
            "failed to prepare scan query for {}",
            location.display_name()
        )
    })?;

    let patterns: Vec<String> = rules
        .iter()
        .map(|rule| format!("%{}%", escape_like(rule.encoded)))
        .collect();
    let rows = statement
        .query_map(rusqlite::params_from_iter(patterns.iter()), |row| {
            Ok(CandidateRow {
                record_id: row.get(0)?,
                value: row.get(1)?,
            })
        })
        .with_context(|| format!("failed to run scan query for {}", location.display_name()))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(
            row.with_context(|| format!("failed to decode row from {}", location.display_name()))?,
        );
    }
    Ok(out)
}

fn build_scan_query(location: &FieldLocation, rule_count: usize) -> String {
    let clauses = (1..=rule_count)
        .map(|index| format!("{} LIKE ?{index} ESCAPE '\\'", location.column))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "SELECT {id}, {column} FROM {table} WHERE {column} IS NOT NULL AND ({clauses}) ORDER BY {id} ASC",
        id = location.id_column,
        column = location.column,
        table = location.table,
    )
}

/// Escape LIKE wildcards so encoded forms match literally.
fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
