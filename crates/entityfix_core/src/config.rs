use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "data/site.db";

/// Scan configuration: which table/column pairs are eligible for entity
/// fixes, plus an optional database path override.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FixConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub scan: Vec<FieldLocation>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DatabaseSection {
    pub path: Option<String>,
}

/// One scannable text field, keyed by its integer primary key column.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FieldLocation {
    pub table: String,
    pub column: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl FieldLocation {
    pub fn new(table: &str, column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            id_column: default_id_column(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// The directory-site fields the fix scripts have historically targeted.
pub fn default_locations() -> Vec<FieldLocation> {
    vec![
        FieldLocation::new("studios", "name"),
        FieldLocation::new("studios", "description"),
        FieldLocation::new("studios", "city"),
        FieldLocation::new("profiles", "display_name"),
        FieldLocation::new("profiles", "bio"),
    ]
}

/// Load a FixConfig from a TOML file. Returns the default location set if
/// the file does not exist or lists no `[[scan]]` entries.
pub fn load_config(config_path: &Path) -> Result<FixConfig> {
    let mut config = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<FixConfig>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        FixConfig::default()
    };

    if config.scan.is_empty() {
        config.scan = default_locations();
    }
    validate_locations(&config.scan)?;
    Ok(config)
}

/// Reject table/column names that cannot be safely interpolated into SQL.
pub fn validate_locations(locations: &[FieldLocation]) -> Result<()> {
    for location in locations {
        for (kind, name) in [
            ("table", &location.table),
            ("column", &location.column),
            ("id_column", &location.id_column),
        ] {
            if !is_valid_identifier(name) {
                bail!(
                    "invalid {kind} name {name:?} in scan location {}",
                    location.display_name()
                );
            }
        }
    }
    Ok(())
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Starter config written by `entityfix init`.
pub fn render_starter_config() -> String {
    let mut rendered = format!(
        "# entityfix configuration (materialized by `entityfix init`)\n\
         \n\
         [database]\n\
         # Relative paths resolve against the working directory.\n\
         path = \"{DEFAULT_DB_PATH}\"\n",
    );
    for location in default_locations() {
        rendered.push_str(&format!(
            "\n[[scan]]\ntable = \"{}\"\ncolumn = \"{}\"\nid_column = \"{}\"\n",
            location.table, location.column, location.id_column
        ));
    }
    rendered
}
