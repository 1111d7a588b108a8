//! Precompiled schemas for well-known base tables, generated at build time
//! from `known_tables.ron`.

use gamedata_core::schema::{StaticColumn, StaticRecordType};
use gamedata_core::table::table_key;
use gamedata_core::value::ColumnType;

include!(concat!(env!("OUT_DIR"), "/known_schemas.rs"));

/// The precompiled schema for `table`, if it is a known table.
pub fn lookup(table: &str) -> Option<&'static StaticRecordType> {
    let key = table_key(table);
    KNOWN_SCHEMAS.iter().find(|def| def.table == key)
}

/// Whether a source's columns are exactly the known schema's columns
/// (case-insensitive, any order).
pub fn matches_shape(def: &StaticRecordType, columns: &[String]) -> bool {
    if def.columns.len() != columns.len() {
        return false;
    }
    def.columns
        .iter()
        .all(|known| columns.iter().any(|c| c.eq_ignore_ascii_case(known.name)))
}
