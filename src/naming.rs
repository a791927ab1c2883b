//! Deterministic identifiers for every object the engine creates or
//! touches: the shadow table `N`, the change-log table `L`, the three
//! capture triggers, the renamed original, and the dump outfile prefix.
//!
//! MySQL identifiers are capped at 64 bytes. Simply prefixing the source
//! table's name can overflow that limit, so each name has three tiers:
//! plenty of headroom (plain prefix + name), tight (a two-byte marker
//! prefix + name, saving 8 bytes over the full word prefix), and no room
//! at all (prefix + a fixed generic placeholder, since uniqueness no
//! longer matters once the name can't carry the source table's identity
//! anyway — callers are expected to use the name only within the single
//! run, not to predict it ahead of time).

/// MySQL's identifier length limit.
pub const MAX_TABLE_LENGTH: usize = 64;

const GENERIC_TABLE_NAME: &str = "online_schema_change_temp_tbl";

const NEW_TABLE_PREFIX: &str = "__osc_new_";
const DELTA_TABLE_PREFIX: &str = "__osc_chg_";
const RENAMED_TABLE_PREFIX: &str = "__osc_old_";
const INSERT_TRIGGER_PREFIX: &str = "__osc_ins_";
const UPDATE_TRIGGER_PREFIX: &str = "__osc_upd_";
const DELETE_TRIGGER_PREFIX: &str = "__osc_del_";

const SHORT_NEW_TABLE_PREFIX: &str = "n!";
const SHORT_DELTA_TABLE_PREFIX: &str = "c!";
const SHORT_RENAMED_TABLE_PREFIX: &str = "o!";
const SHORT_INSERT_TRIGGER_PREFIX: &str = "i!";
const SHORT_UPDATE_TRIGGER_PREFIX: &str = "u!";
const SHORT_DELETE_TRIGGER_PREFIX: &str = "d!";

pub const OUTFILE_TABLE_PREFIX: &str = "__osc_tbl_";
pub const OUTFILE_EXCLUDE_ID_PREFIX: &str = "__osc_ex_";
pub const OUTFILE_INCLUDE_ID_PREFIX: &str = "__osc_in_";

/// Every table-name prefix (long and short forms) the engine may have
/// created across any run, used by forced/crash-recovery cleanup to
/// enumerate orphans by name regardless of which fallback tier a given
/// table name landed in.
pub const ALL_TABLE_PREFIXES: &[&str] = &[
    NEW_TABLE_PREFIX,
    DELTA_TABLE_PREFIX,
    RENAMED_TABLE_PREFIX,
    SHORT_NEW_TABLE_PREFIX,
    SHORT_DELTA_TABLE_PREFIX,
    SHORT_RENAMED_TABLE_PREFIX,
];

/// Every trigger-name prefix (long and short forms).
pub const ALL_TRIGGER_PREFIXES: &[&str] = &[
    INSERT_TRIGGER_PREFIX,
    UPDATE_TRIGGER_PREFIX,
    DELETE_TRIGGER_PREFIX,
    SHORT_INSERT_TRIGGER_PREFIX,
    SHORT_UPDATE_TRIGGER_PREFIX,
    SHORT_DELETE_TRIGGER_PREFIX,
];

/// Every dump-file prefix, for sweeping abandoned outfiles from the dump
/// directory during cleanup.
pub const ALL_FILE_PREFIXES: &[&str] = &[
    OUTFILE_TABLE_PREFIX,
    OUTFILE_EXCLUDE_ID_PREFIX,
    OUTFILE_INCLUDE_ID_PREFIX,
];

fn fallback_name(source: &str, long_prefix: &str, short_prefix: &str) -> String {
    if source.len() < MAX_TABLE_LENGTH - 10 {
        format!("{long_prefix}{source}")
    } else if source.len() < MAX_TABLE_LENGTH - 2 {
        format!("{short_prefix}{source}")
    } else {
        format!("{long_prefix}{GENERIC_TABLE_NAME}")
    }
}

/// Name of the shadow table the new schema is built into (`N`).
pub fn new_table_name(source: &str) -> String {
    fallback_name(source, NEW_TABLE_PREFIX, SHORT_NEW_TABLE_PREFIX)
}

/// Name of the change-log table capturing DML during the copy (`L`).
pub fn delta_table_name(source: &str) -> String {
    fallback_name(source, DELTA_TABLE_PREFIX, SHORT_DELTA_TABLE_PREFIX)
}

/// Name the original table is renamed to during cutover.
pub fn renamed_table_name(source: &str) -> String {
    fallback_name(source, RENAMED_TABLE_PREFIX, SHORT_RENAMED_TABLE_PREFIX)
}

/// Name of the `AFTER INSERT` capture trigger.
pub fn insert_trigger_name(source: &str) -> String {
    fallback_name(source, INSERT_TRIGGER_PREFIX, SHORT_INSERT_TRIGGER_PREFIX)
}

/// Name of the `AFTER UPDATE` capture trigger.
pub fn update_trigger_name(source: &str) -> String {
    fallback_name(source, UPDATE_TRIGGER_PREFIX, SHORT_UPDATE_TRIGGER_PREFIX)
}

/// Name of the `AFTER DELETE` capture trigger.
pub fn delete_trigger_name(source: &str) -> String {
    fallback_name(source, DELETE_TRIGGER_PREFIX, SHORT_DELETE_TRIGGER_PREFIX)
}

/// All three trigger names for a source table, in install/drop order.
pub fn trigger_names(source: &str) -> [String; 3] {
    [
        insert_trigger_name(source),
        update_trigger_name(source),
        delete_trigger_name(source),
    ]
}

/// Base path (without chunk suffix) for the full-table dump outfile.
pub fn outfile_base(outfile_dir: &str, source: &str) -> String {
    format!("{outfile_dir}/{OUTFILE_TABLE_PREFIX}{source}")
}

/// Path of the scratch outfile used to stage rows excluded by id during a
/// gap-replay pass.
pub fn outfile_exclude_id(outfile_dir: &str, source: &str) -> String {
    format!("{outfile_dir}/{OUTFILE_EXCLUDE_ID_PREFIX}{source}")
}

/// Path of the scratch outfile used to stage rows included by id during a
/// gap-replay pass.
pub fn outfile_include_id(outfile_dir: &str, source: &str) -> String {
    format!("{outfile_dir}/{OUTFILE_INCLUDE_ID_PREFIX}{source}")
}

/// Backtick-quotes a MySQL identifier, doubling any embedded backtick.
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}
