//! Component D: dumps the source table's current contents into a series
//! of `SELECT ... INTO OUTFILE` chunk files, bounded by the filter key so
//! each chunk can be loaded independently and retried.

use crate::config::OscConfig;
use crate::error::{OscError, OscResult};
use crate::session::SqlSession;
use crate::sql::select_into_outfile_sql;

/// Disk-space headroom check before starting a dump: fails if less than
/// `reserved_space_percent` of the outfile directory's partition would
/// remain free after accounting for the dump's footprint.
pub fn check_disk_free_space_reserved(
    config: &OscConfig,
    partition_size_bytes: u64,
    free_bytes: u64,
) -> OscResult<()> {
    let reserved = partition_size_bytes * config.reserved_space_percent as u64 / 100;
    if free_bytes < reserved {
        return Err(OscError::NotEnoughSpace {
            need: reserved,
            avail: free_bytes,
        });
    }
    Ok(())
}

/// Ensures a chunk row-count is odd, since `BIT_XOR(CRC32(col))` over an
/// even number of rows that are all equal cancels to zero, which would
/// make a checksum chunk boundary look identical to an empty one.
pub fn make_odd(n: u64) -> u64 {
    if n % 2 == 0 {
        n + 1
    } else {
        n
    }
}

/// Converts a target byte budget per chunk into a row count, using the
/// table's average row length (from `information_schema`), clamped to a
/// minimum of 1 row and a minimum assumed row length of 20 bytes to avoid
/// a division blowing the chunk size up unreasonably on tiny rows.
pub fn rows_per_chunk(chunk_bytes: u64, avg_row_length: u64) -> OscResult<u64> {
    let avg = avg_row_length.max(20);
    let rows = chunk_bytes / avg;
    if rows == 0 {
        Ok(1)
    } else if rows > u64::MAX / 2 {
        Err(OscError::DumpChunkSizeUnknown)
    } else {
        Ok(rows)
    }
}

/// One session variable per filter-key column, used as the `(range_start,
/// range_end)` chunk boundary for both the dump and the checksum passes.
pub struct RangeVariables {
    pub start: Vec<String>,
    pub end: Vec<String>,
}

impl RangeVariables {
    pub fn for_filter_columns(filter_columns: &[String]) -> RangeVariables {
        let start = (0..filter_columns.len())
            .map(|i| format!("@range_start_{i}"))
            .collect();
        let end = (0..filter_columns.len())
            .map(|i| format!("@range_end_{i}"))
            .collect();
        RangeVariables { start, end }
    }

    pub fn start_list(&self) -> String {
        self.start.join(", ")
    }

    pub fn end_list(&self) -> String {
        self.end.join(", ")
    }
}

/// Drives the chunked dump of the source table into a sequence of outfile
/// paths, one per chunk, bounded by the filter key range.
pub struct ChunkedDumper<'a> {
    pub config: &'a OscConfig,
}

impl<'a> ChunkedDumper<'a> {
    pub fn new(config: &'a OscConfig) -> Self {
        ChunkedDumper { config }
    }

    /// Dumps one chunk, returning the number of rows written. `where_clause`
    /// must already encode the filter-key range boundary for this chunk.
    pub fn dump_chunk(
        &self,
        session: &mut dyn SqlSession,
        source: &str,
        columns: &[String],
        where_clause: &str,
        outfile_path: &str,
    ) -> OscResult<u64> {
        let sql = select_into_outfile_sql(source, columns, where_clause, outfile_path);
        session.execute(&sql)
    }

    /// Dumps the entire table with no `WHERE` clause, used when the table
    /// is small enough that chunking adds no value (the filter-key
    /// coverage check is only mandatory above
    /// [`OscConfig::pk_coverage_size_threshold`]).
    pub fn dump_full_table(
        &self,
        session: &mut dyn SqlSession,
        source: &str,
        columns: &[String],
        outfile_path: &str,
    ) -> OscResult<u64> {
        self.dump_chunk(session, source, columns, "1 = 1", outfile_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_odd_bumps_even_numbers() {
        assert_eq!(make_odd(500), 501);
        assert_eq!(make_odd(501), 501);
    }

    #[test]
    fn rows_per_chunk_clamps_minimum_row_length() {
        assert_eq!(rows_per_chunk(2 * 1024 * 1024, 5).unwrap(), 2 * 1024 * 1024 / 20);
    }

    #[test]
    fn rows_per_chunk_never_returns_zero() {
        assert_eq!(rows_per_chunk(10, 1_000_000).unwrap(), 1);
    }

    #[test]
    fn disk_space_check_fails_when_headroom_insufficient() {
        let config = OscConfig::default();
        let err = check_disk_free_space_reserved(&config, 100_000, 500).unwrap_err();
        assert!(matches!(err, OscError::NotEnoughSpace { .. }));
    }

    #[test]
    fn range_variables_one_per_filter_column() {
        let vars = RangeVariables::for_filter_columns(&["a".to_string(), "b".to_string()]);
        assert_eq!(vars.start_list(), "@range_start_0, @range_start_1");
        assert_eq!(vars.end_list(), "@range_end_0, @range_end_1");
    }
}
