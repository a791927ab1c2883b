//! Component E: loads dumped chunk files into the shadow table, and
//! manages the drop-before-load/recreate-after-load dance for
//! non-unique secondary indexes that speeds up the bulk load.

use crate::error::OscResult;
use crate::model::{ColumnDef, IndexDef};
use crate::naming::quote_ident;
use crate::session::{SessionController, SqlSession};
use crate::sql::load_data_infile_sql;

/// Loads a single previously dumped chunk file into the shadow table.
pub struct Loader {
    /// When true, `LOAD DATA` uses `IGNORE` to silently skip rows that
    /// collide with a unique key already present (used when a gap-replay
    /// chunk may legitimately overlap rows already loaded).
    pub eliminate_dups: bool,
}

impl Loader {
    pub fn new(eliminate_dups: bool) -> Self {
        Loader { eliminate_dups }
    }

    pub fn load_chunk(
        &self,
        session: &mut dyn SqlSession,
        target: &str,
        columns: &[String],
        infile_path: &str,
    ) -> OscResult<u64> {
        let sql = load_data_infile_sql(target, columns, infile_path);
        let sql = if self.eliminate_dups {
            sql.replacen("INTO TABLE", "IGNORE INTO TABLE", 1)
        } else {
            sql
        };
        session.execute(&sql)
    }
}

/// Indexes that can be safely dropped before the bulk load and recreated
/// afterward. The primary key is never included. A single-column index
/// over the auto-increment column can't be dropped (the server requires
/// one). Unique indexes are otherwise droppable like any secondary index
/// *unless* `eliminate_dups` is set, in which case they must stay in
/// place throughout so `LOAD DATA ... IGNORE` has something to collide
/// against when skipping duplicate rows.
pub fn droppable_indexes<'a>(indexes: &'a [IndexDef], columns: &[ColumnDef], eliminate_dups: bool) -> Vec<&'a IndexDef> {
    let auto_increment_col = columns.iter().find(|c| c.auto_increment).map(|c| c.name.as_str());
    indexes
        .iter()
        .filter(|i| !i.is_primary)
        .filter(|i| {
            !(i.columns.len() == 1 && auto_increment_col == Some(i.columns[0].as_str()))
        })
        .filter(|i| !(eliminate_dups && i.is_unique))
        .collect()
}

/// Drops the given indexes from the shadow table, guarded by the DDL
/// guard so the `ALTER TABLE ... DROP INDEX` doesn't stack up behind a
/// burst of concurrent queries.
pub fn drop_non_unique_indexes(
    controller: &mut SessionController,
    table: &str,
    indexes: &[&IndexDef],
    sleep: impl Fn(std::time::Duration),
) -> OscResult<()> {
    for idx in indexes {
        controller.ddl_guard(&sleep)?;
        controller
            .session
            .execute(&format!(
                "ALTER TABLE {} DROP INDEX {}",
                quote_ident(table),
                quote_ident(&idx.name)
            ))?;
    }
    Ok(())
}

/// Recreates the previously dropped non-unique indexes on the shadow
/// table in one `ALTER TABLE`.
pub fn recreate_non_unique_indexes(
    controller: &mut SessionController,
    table: &str,
    indexes: &[&IndexDef],
    sleep: impl Fn(std::time::Duration),
) -> OscResult<()> {
    if indexes.is_empty() {
        return Ok(());
    }
    controller.ddl_guard(&sleep)?;
    let clauses: Vec<String> = indexes
        .iter()
        .map(|idx| crate::sql::index_ddl(idx))
        .map(|ddl| format!("ADD {ddl}"))
        .collect();
    controller
        .session
        .execute(&format!(
            "ALTER TABLE {} {}",
            quote_ident(table),
            clauses.join(", ")
        ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_on(name: &str, unique: bool, primary: bool, column: &str) -> IndexDef {
        IndexDef {
            name: name.to_string(),
            is_unique: unique,
            is_primary: primary,
            columns: vec![column.to_string()],
            prefix_lengths: vec![None],
        }
    }

    fn idx(name: &str, unique: bool, primary: bool) -> IndexDef {
        idx_on(name, unique, primary, "a")
    }

    fn col(name: &str, auto_increment: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            column_type: "bigint".to_string(),
            length: None,
            unsigned: false,
            nullable: false,
            default: None,
            auto_increment,
            charset: None,
            collate: None,
            comment: None,
            generated_expression: None,
            generated_stored: false,
        }
    }

    #[test]
    fn droppable_indexes_excludes_primary_but_allows_unique_by_default() {
        let indexes = vec![
            idx("PRIMARY", true, true),
            idx("uniq_email", true, false),
            idx("ix_status", false, false),
        ];
        let columns = vec![col("a", false)];
        let droppable = droppable_indexes(&indexes, &columns, false);
        assert_eq!(droppable.len(), 2);
        assert!(droppable.iter().any(|i| i.name == "uniq_email"));
        assert!(droppable.iter().any(|i| i.name == "ix_status"));
    }

    #[test]
    fn droppable_indexes_keeps_unique_when_eliminating_dups() {
        let indexes = vec![idx("PRIMARY", true, true), idx("uniq_email", true, false)];
        let columns = vec![col("a", false)];
        let droppable = droppable_indexes(&indexes, &columns, true);
        assert!(droppable.is_empty());
    }

    #[test]
    fn droppable_indexes_excludes_single_column_auto_increment_index() {
        let indexes = vec![idx_on("ix_seq", false, false, "seq")];
        let columns = vec![col("seq", true)];
        let droppable = droppable_indexes(&indexes, &columns, false);
        assert!(droppable.is_empty());
    }
}
