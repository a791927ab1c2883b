//! Shared SQL fragment builders.
//!
//! Every statement the engine issues is built here rather than
//! string-formatted ad hoc at the call site, so identifier quoting stays
//! consistent and the call sites read like what they do ("build the DDL
//! to create the shadow table") rather than raw `format!` soup.

use crate::model::{ColumnDef, IndexDef, TableModel};
use crate::naming::quote_ident;

/// Renders a column definition as it would appear inside a `CREATE TABLE`.
pub fn column_ddl(col: &ColumnDef) -> String {
    let mut out = format!("{} {}", quote_ident(&col.name), col.column_type.to_uppercase());
    if let Some(len) = col.length {
        out.push_str(&format!("({len})"));
    }
    if col.unsigned {
        out.push_str(" UNSIGNED");
    }
    if let Some(expr) = &col.generated_expression {
        out.push_str(&format!(
            " GENERATED ALWAYS AS ({expr}) {}",
            if col.generated_stored { "STORED" } else { "VIRTUAL" }
        ));
    } else {
        out.push_str(if col.nullable { " NULL" } else { " NOT NULL" });
        if let Some(default) = &col.default {
            out.push_str(&format!(" DEFAULT {default}"));
        }
        if col.auto_increment {
            out.push_str(" AUTO_INCREMENT");
        }
    }
    if let Some(c) = &col.comment {
        out.push_str(&format!(" COMMENT '{}'", c.replace('\'', "''")));
    }
    out
}

/// Renders an index definition as it would appear inside a `CREATE TABLE`.
pub fn index_ddl(idx: &IndexDef) -> String {
    let cols: Vec<String> = idx
        .columns
        .iter()
        .zip(idx.prefix_lengths.iter())
        .map(|(c, len)| match len {
            Some(n) => format!("{}({n})", quote_ident(c)),
            None => quote_ident(c),
        })
        .collect();
    let col_list = cols.join(", ");
    if idx.is_primary {
        format!("PRIMARY KEY ({col_list})")
    } else if idx.is_unique {
        format!("UNIQUE KEY {} ({col_list})", quote_ident(&idx.name))
    } else {
        format!("KEY {} ({col_list})", quote_ident(&idx.name))
    }
}

/// Full `CREATE TABLE ... LIKE`-equivalent DDL built from a structured
/// model, used to materialize the shadow table with the desired schema.
pub fn create_table_ddl(table: &TableModel) -> String {
    let mut parts: Vec<String> = table.columns.iter().map(column_ddl).collect();
    parts.extend(table.indexes.iter().map(index_ddl));

    let mut ddl = format!(
        "CREATE TABLE {} (\n  {}\n) ENGINE={}",
        quote_ident(&table.name),
        parts.join(",\n  "),
        table.engine
    );
    if let Some(charset) = &table.charset {
        ddl.push_str(&format!(" DEFAULT CHARSET={charset}"));
    }
    if let Some(collate) = &table.collate {
        ddl.push_str(&format!(" COLLATE={collate}"));
    }
    ddl
}

/// `RENAME TABLE a TO b, c TO d, ...` — used for the atomic three-way
/// cutover swap (original -> renamed, shadow -> original).
pub fn rename_table_sql(pairs: &[(String, String)]) -> String {
    let clauses: Vec<String> = pairs
        .iter()
        .map(|(from, to)| format!("{} TO {}", quote_ident(from), quote_ident(to)))
        .collect();
    format!("RENAME TABLE {}", clauses.join(", "))
}

/// `DROP TABLE IF EXISTS` for one or more tables.
pub fn drop_table_sql(tables: &[String]) -> String {
    let list: Vec<String> = tables.iter().map(|t| quote_ident(t)).collect();
    format!("DROP TABLE IF EXISTS {}", list.join(", "))
}

/// `SELECT ... INTO OUTFILE` for one chunk of the dump, bounded by the
/// given filter-key range predicate.
pub fn select_into_outfile_sql(
    source: &str,
    columns: &[String],
    where_clause: &str,
    outfile_path: &str,
) -> String {
    let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {} FROM {} WHERE {} INTO OUTFILE '{}' FIELDS TERMINATED BY ',' ENCLOSED BY '\"' LINES TERMINATED BY '\\n'",
        col_list.join(", "),
        quote_ident(source),
        where_clause,
        outfile_path.replace('\'', "''")
    )
}

/// `LOAD DATA INFILE` loading a previously dumped chunk into the shadow
/// table.
pub fn load_data_infile_sql(target: &str, columns: &[String], infile_path: &str) -> String {
    let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "LOAD DATA INFILE '{}' INTO TABLE {} FIELDS TERMINATED BY ',' ENCLOSED BY '\"' LINES TERMINATED BY '\\n' ({})",
        infile_path.replace('\'', "''"),
        quote_ident(target),
        col_list.join(", ")
    )
}

/// `BIT_XOR(CRC32(...))`/`COUNT(*)` checksum aggregate over the given
/// columns, optionally bounded by a `WHERE` predicate for a chunked pass.
pub fn checksum_sql(table: &str, columns: &[String], where_clause: Option<&str>) -> String {
    let concat_expr = columns
        .iter()
        .map(|c| format!("COALESCE({}, '')", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", '\\x01', ");
    let base = format!(
        "SELECT COUNT(*) AS cnt, BIT_XOR(CRC32(CONCAT_WS('\\x01', {concat_expr}))) AS crc FROM {}",
        quote_ident(table)
    );
    match where_clause {
        Some(w) => format!("{base} WHERE {w}"),
        None => base,
    }
}

/// `GET_LOCK(name, timeout)` — acquires the named server-wide mutex
/// serializing concurrent schema changes against the same table.
pub fn get_lock_sql(name: &str, timeout_secs: f64) -> String {
    format!("SELECT GET_LOCK('{}', {timeout_secs})", name.replace('\'', "''"))
}

/// `RELEASE_LOCK(name)`.
pub fn release_lock_sql(name: &str) -> String {
    format!("SELECT RELEASE_LOCK('{}')", name.replace('\'', "''"))
}

/// `IS_USED_LOCK(name)` — returns the connection id currently holding the
/// named lock, or `NULL` if it's free. Used to learn who to `KILL` when
/// `GET_LOCK` fails.
pub fn is_used_lock_sql(name: &str) -> String {
    format!("SELECT IS_USED_LOCK('{}') AS holder", name.replace('\'', "''"))
}

/// Opens the consistent-snapshot transaction the dump runs inside, fixing
/// the `REPEATABLE READ` view before `snapshot_max_id` is read and before
/// the first `SELECT ... INTO OUTFILE`.
pub const START_TRANSACTION_WITH_CONSISTENT_SNAPSHOT: &str =
    "START TRANSACTION WITH CONSISTENT SNAPSHOT";

pub const COMMIT: &str = "COMMIT";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDef, IndexDef};

    fn col(name: &str, ty: &str) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            column_type: ty.to_string(),
            length: None,
            unsigned: false,
            nullable: true,
            default: None,
            auto_increment: false,
            charset: None,
            collate: None,
            comment: None,
            generated_expression: None,
            generated_stored: false,
        }
    }

    #[test]
    fn column_ddl_renders_not_null_and_default() {
        let mut c = col("status", "varchar");
        c.length = Some(32);
        c.nullable = false;
        c.default = Some("'active'".to_string());
        assert_eq!(column_ddl(&c), "`status` VARCHAR(32) NOT NULL DEFAULT 'active'");
    }

    #[test]
    fn index_ddl_renders_primary_key() {
        let idx = IndexDef {
            name: "PRIMARY".to_string(),
            is_unique: true,
            is_primary: true,
            columns: vec!["id".to_string()],
            prefix_lengths: vec![None],
        };
        assert_eq!(index_ddl(&idx), "PRIMARY KEY (`id`)");
    }

    #[test]
    fn rename_table_sql_joins_pairs() {
        let sql = rename_table_sql(&[
            ("orders".to_string(), "__osc_old_orders".to_string()),
            ("__osc_new_orders".to_string(), "orders".to_string()),
        ]);
        assert_eq!(
            sql,
            "RENAME TABLE `orders` TO `__osc_old_orders`, `__osc_new_orders` TO `orders`"
        );
    }

    #[test]
    fn checksum_sql_includes_where_when_given() {
        let sql = checksum_sql("orders", &["id".to_string(), "status".to_string()], Some("id < 100"));
        assert!(sql.contains("BIT_XOR(CRC32"));
        assert!(sql.contains("WHERE id < 100"));
    }
}
