//! Loader configuration, deserialized from a RON, JSON or TOML file.

use crate::error::LoadError;
use crate::format::{FormatError, deserialize_file, find_data_file};
use gamedata_core::guard::GuardConfig;
use gamedata_core::relationship::RelationshipHint;
use gamedata_core::table::{IdMapping, table_key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ===========================================================================
// Guard settings
// ===========================================================================

/// Access-guard thresholds as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_blacklist_after")]
    pub blacklist_after: u32,
    #[serde(default = "default_warmup_leniency")]
    pub warmup_leniency: u32,
}

fn default_max_retries() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_blacklist_after() -> u32 {
    15
}

fn default_warmup_leniency() -> u32 {
    3
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            cooldown_ms: default_cooldown_ms(),
            blacklist_after: default_blacklist_after(),
            warmup_leniency: default_warmup_leniency(),
        }
    }
}

impl From<&GuardSettings> for GuardConfig {
    fn from(s: &GuardSettings) -> Self {
        GuardConfig {
            max_retries: s.max_retries,
            cooldown: Duration::from_millis(s.cooldown_ms),
            blacklist_after: s.blacklist_after,
            warmup_leniency: s.warmup_leniency,
        }
    }
}

// ===========================================================================
// Loader configuration
// ===========================================================================

/// Everything the pipeline needs to know besides its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory for generated schema sources and the relationship snapshot.
    /// `None` keeps caches in memory only.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Curated tables always loaded, in this order.
    #[serde(default = "default_always_load")]
    pub always_load: Vec<String>,

    /// Prefixes of custom tables relevant to characters.
    #[serde(default = "default_character_prefixes")]
    pub character_prefixes: Vec<String>,

    /// Prefixes of custom tables never loaded (textures, sounds, ...).
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,

    /// Fallback order used when relationship analysis fails.
    #[serde(default = "default_priority_tables")]
    pub priority_tables: Vec<String>,

    /// Column names whose integer values are string-table references.
    #[serde(default = "default_string_columns")]
    pub string_columns: Vec<String>,

    #[serde(default)]
    pub id_mappings: BTreeMap<String, IdMapping>,

    #[serde(default)]
    pub relationship_hints: Vec<RelationshipHint>,

    #[serde(default)]
    pub guard: GuardSettings,

    /// Tables populated between cooperative yield points. Zero disables.
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,
}

fn default_always_load() -> Vec<String> {
    [
        "classes",
        "racialtypes",
        "racialsubtypes",
        "feat",
        "skills",
        "spells",
        "domains",
    ]
    .map(String::from)
    .to_vec()
}

fn default_character_prefixes() -> Vec<String> {
    ["cls_", "race_", "feat", "spell", "skill", "mycontent_"]
        .map(String::from)
        .to_vec()
}

fn default_ignore_prefixes() -> Vec<String> {
    ["tex_", "snd_", "vfx_", "ambient", "loadscreen"]
        .map(String::from)
        .to_vec()
}

fn default_priority_tables() -> Vec<String> {
    ["classes", "racialtypes", "feat", "skills", "spells"]
        .map(String::from)
        .to_vec()
}

fn default_string_columns() -> Vec<String> {
    ["name", "description", "label", "tooltip", "plural", "lower", "convname"]
        .map(String::from)
        .to_vec()
}

fn default_yield_every() -> usize {
    8
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            always_load: default_always_load(),
            character_prefixes: default_character_prefixes(),
            ignore_prefixes: default_ignore_prefixes(),
            priority_tables: default_priority_tables(),
            string_columns: default_string_columns(),
            id_mappings: BTreeMap::new(),
            relationship_hints: Vec::new(),
            guard: GuardSettings::default(),
            yield_every: default_yield_every(),
        }
    }
}

impl LoaderConfig {
    /// Id mapping configured for `table`, or the row-index default.
    pub fn id_mapping(&self, table: &str) -> IdMapping {
        let key = table_key(table);
        self.id_mappings
            .iter()
            .find(|(name, _)| table_key(name) == key)
            .map(|(_, mapping)| mapping.clone())
            .unwrap_or_default()
    }

    /// Lowercased string-like column names.
    pub fn string_column_set(&self) -> HashSet<String> {
        self.string_columns
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .collect()
    }

    /// Whether a provider-listed table is custom content worth loading.
    pub fn is_character_relevant(&self, table: &str) -> bool {
        let key = table_key(table);
        let has = |prefixes: &[String]| {
            prefixes
                .iter()
                .any(|p| key.starts_with(&p.to_ascii_lowercase()))
        };
        has(&self.character_prefixes) && !has(&self.ignore_prefixes)
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig::from(&self.guard)
    }
}

// ===========================================================================
// Loading
// ===========================================================================

/// Load a configuration file. The format is detected from the extension.
pub fn load_config(path: &Path) -> Result<LoaderConfig, LoadError> {
    deserialize_file(path).map_err(|e| match e {
        FormatError::Parse { file, detail } => LoadError::Config { path: file, detail },
        other => LoadError::Format(other),
    })
}

/// Load `<base_name>.ron|toml|json` from `dir`, or the defaults when no such
/// file exists. Conflicting formats are an error.
pub fn load_config_from_dir(dir: &Path, base_name: &str) -> Result<LoaderConfig, LoadError> {
    match find_data_file(dir, base_name)? {
        Some(path) => load_config(&path),
        None => Ok(LoaderConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gamedata_config_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn defaults_match_guard_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.guard_config(), GuardConfig::default());
        assert_eq!(config.yield_every, 8);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn ron_config_with_partial_fields() {
        let dir = make_test_dir("ron");
        fs::write(
            dir.join("loader.ron"),
            r#"(
                cache_dir: Some("/tmp/gamedata-cache"),
                always_load: ["classes", "feat"],
                id_mappings: { "classes": Column("ClassID"), "feat": Offset(1) },
                guard: (max_retries: 2),
            )"#,
        )
        .unwrap();

        let config = load_config_from_dir(&dir, "loader").unwrap();
        assert_eq!(config.always_load, vec!["classes", "feat"]);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/gamedata-cache")));
        assert_eq!(config.id_mapping("Classes"), IdMapping::Column("ClassID".into()));
        assert_eq!(config.id_mapping("feat"), IdMapping::Offset(1));
        assert_eq!(config.id_mapping("spells"), IdMapping::RowIndex);
        assert_eq!(config.guard.max_retries, 2);
        assert_eq!(config.guard.cooldown_ms, 2000);
        assert_eq!(config.string_columns, default_string_columns());

        cleanup(&dir);
    }

    #[test]
    fn toml_and_json_configs() {
        let dir = make_test_dir("toml_json");
        let toml_path = dir.join("a.toml");
        fs::write(
            &toml_path,
            "yield_every = 2\n\n[[relationship_hints]]\ntable = \"classes\"\ncolumn = \"FeatsTable\"\ntarget = \"cls_feat_barb\"\n",
        )
        .unwrap();
        let config = load_config(&toml_path).unwrap();
        assert_eq!(config.yield_every, 2);
        assert_eq!(config.relationship_hints[0].target, "cls_feat_barb");

        let json_path = dir.join("b.json");
        fs::write(&json_path, r#"{"ignore_prefixes": ["tex_"], "guard": {"cooldown_ms": 50}}"#)
            .unwrap();
        let config = load_config(&json_path).unwrap();
        assert_eq!(config.ignore_prefixes, vec!["tex_"]);
        assert_eq!(config.guard_config().cooldown, Duration::from_millis(50));

        cleanup(&dir);
    }

    #[test]
    fn missing_config_uses_defaults() {
        let dir = make_test_dir("missing");
        assert_eq!(
            load_config_from_dir(&dir, "loader").unwrap(),
            LoaderConfig::default()
        );
        cleanup(&dir);
    }

    #[test]
    fn conflicting_config_formats_error() {
        let dir = make_test_dir("conflict");
        fs::write(dir.join("loader.ron"), "()").unwrap();
        fs::write(dir.join("loader.json"), "{}").unwrap();
        assert!(matches!(
            load_config_from_dir(&dir, "loader"),
            Err(LoadError::Format(FormatError::ConflictingFormats { .. }))
        ));
        cleanup(&dir);
    }

    #[test]
    fn invalid_config_is_config_error() {
        let dir = make_test_dir("invalid");
        let path = dir.join("loader.json");
        fs::write(&path, r#"{"yield_every": "often"}"#).unwrap();
        assert!(matches!(load_config(&path), Err(LoadError::Config { .. })));
        cleanup(&dir);
    }

    #[test]
    fn character_relevance_respects_ignore_list() {
        let config = LoaderConfig::default();
        assert!(config.is_character_relevant("cls_feat_barb"));
        assert!(config.is_character_relevant("MyContent_X"));
        assert!(!config.is_character_relevant("tex_armor"));
        assert!(!config.is_character_relevant("placeables"));
    }
}
