use serde::Deserialize;
use std::env;
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Deserialize)]
enum ColumnKind {
    Int,
    Float,
    Text,
    StrRef,
}

#[derive(Deserialize)]
struct KnownTable {
    table: String,
    columns: Vec<(String, ColumnKind)>,
}

fn main() {
    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let input = crate_dir.join("known_tables.ron");

    // Only regenerate when the table list changes.
    println!("cargo:rerun-if-changed=known_tables.ron");

    let text = std::fs::read_to_string(&input).expect("failed to read known_tables.ron");
    let tables: Vec<KnownTable> = ron::from_str(&text).expect("known_tables.ron is not valid");

    let mut code = String::new();
    for (idx, table) in tables.iter().enumerate() {
        writeln!(code, "static COLUMNS_{idx}: [StaticColumn; {}] = [", table.columns.len()).unwrap();
        for (name, kind) in &table.columns {
            let ty = match kind {
                ColumnKind::Int => "Int",
                ColumnKind::Float => "Float",
                ColumnKind::Text => "Text",
                ColumnKind::StrRef => "StrRef",
            };
            writeln!(code, "    StaticColumn {{ name: {name:?}, ty: ColumnType::{ty} }},").unwrap();
        }
        writeln!(code, "];").unwrap();
    }

    writeln!(code, "pub static KNOWN_SCHEMAS: [StaticRecordType; {}] = [", tables.len()).unwrap();
    for (idx, table) in tables.iter().enumerate() {
        writeln!(
            code,
            "    StaticRecordType {{ table: {:?}, columns: &COLUMNS_{idx} }},",
            table.table.to_ascii_lowercase()
        )
        .unwrap();
    }
    writeln!(code, "];").unwrap();

    std::fs::write(out_dir.join("known_schemas.rs"), code).expect("failed to write known_schemas.rs");
}
