//! The structured table description the engine operates on.
//!
//! Parsing `CREATE TABLE` text into this shape is an external-interface
//! concern; callers hand the engine an already-parsed [`TableModel`] for
//! both the current and desired schema. The fields here mirror the parsed
//! model the real tool builds, trimmed to what the copy/replay/cutover
//! pipeline actually reads.

use serde::{Deserialize, Serialize};

/// Partition strategy, mirroring `PARTITION BY <kind>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    Range,
    List,
    Hash,
    Key,
}

/// A single `PARTITION p... VALUES ...` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub name: String,
    /// Rendered `VALUES LESS THAN (...)` / `VALUES IN (...)` text, or empty
    /// for `HASH`/`KEY` partitions which have no per-entry value list.
    pub values: String,
    pub comment: Option<String>,
}

/// `PARTITION BY ...` clause of a table, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDef {
    pub kind: PartitionKind,
    /// `true` for `LINEAR HASH`/`LINEAR KEY`.
    pub linear: bool,
    /// Partitioning columns or the raw expression text (e.g. `id` or
    /// `YEAR(created_at)`).
    pub fields_or_expr: String,
    pub num_partitions: u32,
    pub entries: Vec<PartitionEntry>,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Lowercase MySQL type keyword, e.g. `"varchar"`, `"bigint"`.
    pub column_type: String,
    pub length: Option<u64>,
    pub unsigned: bool,
    pub nullable: bool,
    pub default: Option<String>,
    pub auto_increment: bool,
    pub charset: Option<String>,
    pub collate: Option<String>,
    pub comment: Option<String>,
    /// `GENERATED ALWAYS AS (...)` expression, if this is a generated column.
    pub generated_expression: Option<String>,
    /// `true` for a generated column that is `STORED` rather than `VIRTUAL`.
    pub generated_stored: bool,
}

impl ColumnDef {
    /// Whether two column definitions are semantically equivalent for the
    /// purpose of deciding if a replay-bootstrapped default is safe, per
    /// the original parser's equality rules: integer display widths are
    /// ignored, and `utf8`/`utf8mb3` are treated as the same charset.
    pub fn same_type_family(&self, other: &ColumnDef) -> bool {
        let ints = ["tinyint", "smallint", "mediumint", "int", "bigint"];
        if ints.contains(&self.column_type.as_str()) && ints.contains(&other.column_type.as_str())
        {
            return self.column_type == other.column_type;
        }
        self.column_type == other.column_type
    }

    /// Whether a column default of `CURRENT_TIMESTAMP` makes a replay-based
    /// bootstrap for this column unsafe (spec: `UnsafeTimestampBootstrap`).
    pub fn has_unsafe_timestamp_default(&self) -> bool {
        self.column_type == "timestamp"
            && self
                .default
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case("CURRENT_TIMESTAMP"))
    }
}

/// An index definition, including the implicit primary key (`name ==
/// "PRIMARY"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub is_unique: bool,
    pub is_primary: bool,
    /// Column names in index order; a `col(len)` prefix index is encoded as
    /// `("col".to_string(), Some(len))` in `prefix_lengths`.
    pub columns: Vec<String>,
    pub prefix_lengths: Vec<Option<u64>>,
}

impl IndexDef {
    /// Whether this index fully covers the given filter-key columns as a
    /// leftmost prefix, required for the shadow-table coverage check before
    /// cutover on large tables.
    pub fn covers_as_prefix(&self, filter_columns: &[String]) -> bool {
        if self.columns.len() < filter_columns.len() {
            return false;
        }
        self.columns
            .iter()
            .zip(filter_columns.iter())
            .all(|(a, b)| a == b)
    }

    /// Whether any column of this index uses a prefix length, which
    /// disqualifies it from being trusted for exact-value coverage checks.
    pub fn is_prefix_indexable(&self) -> bool {
        self.prefix_lengths.iter().any(Option::is_some)
    }
}

/// A fully structured table: columns, indexes, and optional partitioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableModel {
    pub name: String,
    pub engine: String,
    pub charset: Option<String>,
    pub collate: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    pub partition: Option<PartitionDef>,
    /// Names of foreign keys referencing or referenced by this table, if
    /// any were found during schema inspection.
    pub foreign_keys: Vec<String>,
}

impl TableModel {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.is_primary)
    }

    /// Primary key column names, or empty if the table has none.
    pub fn primary_key_columns(&self) -> Vec<String> {
        self.primary_key()
            .map(|pk| pk.columns.clone())
            .unwrap_or_default()
    }

    /// Whether `column` is part of the current primary key.
    pub fn is_primary_column(&self, column: &str) -> bool {
        self.primary_key()
            .is_some_and(|pk| pk.columns.iter().any(|c| c == column))
    }
}
