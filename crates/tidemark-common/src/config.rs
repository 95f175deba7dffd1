//! INI configuration documents
//!
//! Dataset and environment settings live in INI files. Files without any
//! section header are read as if they started with `[main]`, so both of these
//! are equivalent:
//!
//! ```text
//! dataset_name = clickstream
//! ```
//!
//! ```text
//! [main]
//! dataset_name = clickstream
//! ```

use crate::error::{ConfigError, Result};
use config::{Config, File, FileFormat};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Section used for files that carry no header
pub const MAIN_SECTION: &str = "main";

/// Parsed INI file: section name -> key -> value
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    path: PathBuf,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    /// Load and parse an INI file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(path, &text)
    }

    /// Parse INI text. `origin` is only used in error messages.
    pub fn parse(origin: impl AsRef<Path>, text: &str) -> Result<Self> {
        let origin = origin.as_ref().to_path_buf();

        let text = if has_section_header(text) {
            text.to_string()
        } else {
            format!("[{}]\n{}", MAIN_SECTION, text)
        };

        let raw: BTreeMap<String, BTreeMap<String, String>> = Config::builder()
            .add_source(File::from_str(&text, FileFormat::Ini))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|source| ConfigError::Parse {
                path: origin.clone(),
                source,
            })?;

        let sections = raw
            .into_iter()
            .map(|(name, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .collect();
                (name.trim().to_string(), entries)
            })
            .collect();

        Ok(Self {
            path: origin,
            sections,
        })
    }

    /// Path the document was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a key in a section
    pub fn get(&self, section: &str, key: &str) -> Result<&str> {
        self.sections
            .get(section)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Look up a key in the `[main]` section
    pub fn main(&self, key: &str) -> Result<&str> {
        self.get(MAIN_SECTION, key)
    }

    /// Look up an optional key in the `[main]` section. Empty values count as absent.
    pub fn main_opt(&self, key: &str) -> Option<&str> {
        self.sections
            .get(MAIN_SECTION)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Section names in sorted order
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// All key/value pairs of one section
    pub fn section(&self, name: &str) -> Result<&BTreeMap<String, String>> {
        self.sections
            .get(name)
            .ok_or_else(|| ConfigError::MissingSection(name.to_string()))
    }
}

/// True when the first meaningful line is a `[section]` header
fn has_section_header(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .is_some_and(|line| line.starts_with('['))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_headerless_file_gets_main_section() {
        let doc = IniDocument::parse("data.cfg", "dataset_name = clicks\nhive_db = raw\n").unwrap();
        assert_eq!(doc.main("dataset_name").unwrap(), "clicks");
        assert_eq!(doc.get("main", "hive_db").unwrap(), "raw");
    }

    #[test]
    fn test_sectioned_file_keeps_sections() {
        let text = "[main]\ndataset_name = clicks\n\n[alert_locked]\ntype = dataset_locked\ntime_window = 2h\n";
        let doc = IniDocument::parse("data.cfg", text).unwrap();

        let sections: Vec<&str> = doc.sections().collect();
        assert_eq!(sections, vec!["alert_locked", "main"]);
        assert_eq!(doc.section("alert_locked").unwrap().get("time_window").unwrap(), "2h");
    }

    #[test]
    fn test_comment_before_header_is_ignored() {
        let text = "# environment\n[main]\nmetadata_url = sqlite::memory:\n";
        let doc = IniDocument::parse("env.cfg", text).unwrap();
        assert_eq!(doc.main("metadata_url").unwrap(), "sqlite::memory:");
    }

    #[test]
    fn test_missing_key_is_reported_with_section() {
        let doc = IniDocument::parse("data.cfg", "a = 1\n").unwrap();
        let err = doc.main("b").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref section, ref key } if section == "main" && key == "b"));
    }

    #[test]
    fn test_optional_empty_value_is_none() {
        let doc = IniDocument::parse("data.cfg", "vertica_partition_expr =\nx = y\n").unwrap();
        assert!(doc.main_opt("vertica_partition_expr").is_none());
        assert_eq!(doc.main_opt("x"), Some("y"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = IniDocument::load("/nonexistent/tidemark.cfg").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dataset_name = orders").unwrap();

        let doc = IniDocument::load(file.path()).unwrap();
        assert_eq!(doc.main("dataset_name").unwrap(), "orders");
        assert_eq!(doc.path(), file.path());
    }
}
