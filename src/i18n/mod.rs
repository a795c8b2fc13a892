//! Locale manager.
//!
//! # Data Flow
//! ```text
//! <locale_root>/<tag>.toml  (flat key = "value" tables)
//!     → I18n::reload (parse every file)
//!     → LocaleTable (immutable) swapped in atomically
//!
//! Accept-Language header
//!     → negotiate (q-values, exact tag, then primary subtag)
//!     → Localizer (negotiated locale + base locale + table snapshot)
//!
//! watcher.rs: file events → reload
//! ```
//!
//! # Design Decisions
//! - Readers always see a complete table; a failed reload keeps the old one
//! - Tables are loaded on first use, not at engine construction
//! - Locale tags are compared case-insensitively

pub mod watcher;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use axum::http::{header, HeaderMap};
use thiserror::Error;

use crate::config::I18nConfig;
use watcher::LocaleWatcher;

/// Errors while loading locale files.
#[derive(Debug, Error)]
pub enum I18nError {
    #[error("failed to read locale root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read locale file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse locale file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to watch locale root: {0}")]
    Watch(#[from] notify::Error),
}

/// Translations of every known locale, keyed by lowercased tag.
#[derive(Debug, Default)]
pub struct LocaleTable {
    locales: HashMap<String, HashMap<String, String>>,
}

impl LocaleTable {
    pub fn new(locales: HashMap<String, HashMap<String, String>>) -> Self {
        Self {
            locales: locales
                .into_iter()
                .map(|(tag, entries)| (tag.to_ascii_lowercase(), entries))
                .collect(),
        }
    }

    /// Read every `*.toml` file under `root`.
    pub fn load(root: &Path) -> Result<Self, I18nError> {
        let entries = fs::read_dir(root).map_err(|source| I18nError::Root {
            path: root.to_path_buf(),
            source,
        })?;

        let mut locales = HashMap::new();
        for entry in entries {
            let path = entry
                .map_err(|source| I18nError::Root {
                    path: root.to_path_buf(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(tag) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = fs::read_to_string(&path).map_err(|source| I18nError::Read {
                path: path.clone(),
                source,
            })?;
            let entries: HashMap<String, String> =
                toml::from_str(&content).map_err(|source| I18nError::Parse {
                    path: path.clone(),
                    source,
                })?;
            locales.insert(tag.to_string(), entries);
        }

        Ok(Self::new(locales))
    }

    pub fn len(&self) -> usize {
        self.locales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locales.is_empty()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.locales.contains_key(&tag.to_ascii_lowercase())
    }

    fn lookup(&self, tag: &str, key: &str) -> Option<&str> {
        self.locales.get(tag)?.get(key).map(String::as_str)
    }

    /// Best supported locale for an `Accept-Language` value.
    fn negotiate(&self, accept_language: &str) -> Option<String> {
        let mut ranges: Vec<(&str, f32)> = accept_language
            .split(',')
            .filter_map(|range| {
                let mut parts = range.trim().split(';');
                let tag = parts.next()?.trim();
                if tag.is_empty() || tag == "*" {
                    return None;
                }
                let q = parts
                    .find_map(|p| p.trim().strip_prefix("q="))
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .unwrap_or(1.0);
                (q > 0.0).then_some((tag, q))
            })
            .collect();
        // Stable: equal weights keep header order.
        ranges.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (tag, _) in ranges {
            let tag = tag.to_ascii_lowercase();
            if self.locales.contains_key(&tag) {
                return Some(tag);
            }
            let primary = tag.split('-').next().unwrap_or(&tag);
            if self.locales.contains_key(primary) {
                return Some(primary.to_string());
            }
            if let Some(regional) = self
                .locales
                .keys()
                .filter(|known| known.split('-').next() == Some(primary))
                .min()
            {
                return Some(regional.clone());
            }
        }
        None
    }
}

/// Resolves keys for one exchange.
#[derive(Debug, Clone)]
pub struct Localizer {
    table: Arc<LocaleTable>,
    locale: Option<String>,
    base: String,
}

impl Localizer {
    /// Localizer that returns every key unchanged.
    pub fn passthrough() -> Self {
        Self {
            table: Arc::new(LocaleTable::default()),
            locale: None,
            base: String::new(),
        }
    }

    /// Negotiated locale tag, if any matched.
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// Translation of `key`: negotiated locale, then base locale, then `key`.
    pub fn get(&self, key: &str) -> String {
        self.locale
            .as_deref()
            .and_then(|tag| self.table.lookup(tag, key))
            .or_else(|| self.table.lookup(&self.base, key))
            .unwrap_or(key)
            .to_string()
    }
}

/// Locale manager shared by every exchange of an engine.
pub struct I18n {
    config: I18nConfig,
    table: ArcSwapOption<LocaleTable>,
    watcher: Mutex<Option<LocaleWatcher>>,
}

impl I18n {
    pub fn new(config: I18nConfig) -> Self {
        Self {
            config,
            table: ArcSwapOption::empty(),
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &I18nConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Re-read the locale files and swap in the new table.
    ///
    /// On error the current table stays in place.
    pub fn reload(&self) -> Result<(), I18nError> {
        let table = LocaleTable::load(Path::new(&self.config.locale_root))?;
        tracing::debug!(
            locale_root = %self.config.locale_root,
            locales = table.len(),
            "Locale table loaded"
        );
        self.store(table);
        Ok(())
    }

    /// Replace the table directly.
    pub fn store(&self, table: LocaleTable) {
        self.table.store(Some(Arc::new(table)));
    }

    fn table(&self) -> Arc<LocaleTable> {
        if let Some(table) = self.table.load_full() {
            return table;
        }
        if let Err(e) = self.reload() {
            tracing::error!(error = %e, "Failed to load locale files");
            // Remember the failure as an empty table; the watcher retries.
            self.table
                .compare_and_swap(&None::<Arc<LocaleTable>>, Some(Arc::new(LocaleTable::default())));
        }
        self.table.load_full().unwrap_or_default()
    }

    /// Localizer for a request with `headers`.
    pub fn localizer(&self, headers: &HeaderMap) -> Localizer {
        if !self.config.enabled {
            return Localizer::passthrough();
        }

        let table = self.table();
        let locale = headers
            .get_all(header::ACCEPT_LANGUAGE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| table.negotiate(v));

        Localizer {
            table,
            locale,
            base: self.config.locale_base.to_ascii_lowercase(),
        }
    }

    /// Start watching the locale root for changes. Idempotent.
    pub fn watch(self: &Arc<Self>) -> Result<(), I18nError> {
        let Ok(mut slot) = self.watcher.lock() else {
            return Ok(());
        };
        if slot.is_none() {
            *slot = Some(LocaleWatcher::start(self)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn table() -> LocaleTable {
        let mut en = HashMap::new();
        en.insert("hi".to_string(), "Hello".to_string());
        en.insert("bye".to_string(), "Goodbye".to_string());
        let mut fr = HashMap::new();
        fr.insert("hi".to_string(), "Bonjour".to_string());
        let mut pt_br = HashMap::new();
        pt_br.insert("hi".to_string(), "Olá".to_string());

        let mut locales = HashMap::new();
        locales.insert("en".to_string(), en);
        locales.insert("fr".to_string(), fr);
        locales.insert("pt-BR".to_string(), pt_br);
        LocaleTable::new(locales)
    }

    fn manager() -> I18n {
        let i18n = I18n::new(I18nConfig {
            enabled: true,
            locale_base: "en".to_string(),
            ..I18nConfig::default()
        });
        i18n.store(table());
        i18n
    }

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn negotiated_locale_then_base_then_key() {
        let localizer = manager().localizer(&accept("fr"));
        assert_eq!(localizer.get("hi"), "Bonjour");
        assert_eq!(localizer.get("bye"), "Goodbye");
        assert_eq!(localizer.get("unknown.key"), "unknown.key");
    }

    #[test]
    fn quality_values_and_subtags() {
        let i18n = manager();
        assert_eq!(i18n.localizer(&accept("de, fr;q=0.4, en;q=0.8")).locale(), Some("en"));
        assert_eq!(i18n.localizer(&accept("fr-CA")).locale(), Some("fr"));
        assert_eq!(i18n.localizer(&accept("pt")).locale(), Some("pt-br"));
        assert_eq!(i18n.localizer(&accept("PT-br")).get("hi"), "Olá");
        assert_eq!(i18n.localizer(&accept("fr;q=0, de")).locale(), None);
        assert_eq!(i18n.localizer(&HeaderMap::new()).get("hi"), "Hello");
    }

    #[test]
    fn disabled_manager_passes_keys_through() {
        let i18n = I18n::new(I18nConfig::default());
        i18n.store(table());
        assert_eq!(i18n.localizer(&accept("fr")).get("hi"), "hi");
    }

    #[test]
    fn reload_reads_files_and_keeps_table_on_error() {
        let dir = std::env::temp_dir().join(format!("airway-i18n-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("en.toml"), "hi = \"Hello\"\n").unwrap();
        fs::write(dir.join("fr.toml"), "hi = \"Bonjour\"\n").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let i18n = I18n::new(I18nConfig {
            enabled: true,
            locale_root: dir.to_string_lossy().into_owned(),
            locale_base: "en".to_string(),
            ..I18nConfig::default()
        });
        assert_eq!(i18n.localizer(&accept("fr")).get("hi"), "Bonjour");

        fs::write(dir.join("fr.toml"), "hi = [broken").unwrap();
        assert!(matches!(i18n.reload(), Err(I18nError::Parse { .. })));
        assert_eq!(i18n.localizer(&accept("fr")).get("hi"), "Bonjour");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_root_degrades_to_keys() {
        let i18n = I18n::new(I18nConfig {
            enabled: true,
            locale_root: "/nonexistent/airway-locales".to_string(),
            ..I18nConfig::default()
        });
        assert_eq!(i18n.localizer(&accept("fr")).get("hi"), "hi");
    }
}
