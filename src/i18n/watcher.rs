//! Locale file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use super::{I18n, I18nError};
use crate::config::Severity;

/// Watches the locale root and reloads the table on every change.
///
/// The watcher keeps only a weak reference to its manager, and stops when
/// dropped.
pub struct LocaleWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl LocaleWatcher {
    pub(crate) fn start(i18n: &Arc<I18n>) -> Result<Self, I18nError> {
        let root = PathBuf::from(&i18n.config().locale_root);
        let severity = i18n.config().watcher_error_level;
        let manager = Arc::downgrade(i18n);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Some(i18n) = manager.upgrade() else {
                    return;
                };
                match res {
                    Ok(event) => {
                        if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                            return;
                        }
                        tracing::debug!(paths = ?event.paths, kind = ?event.kind, "Locale file event");
                        if let Err(e) = i18n.reload() {
                            report(severity, &e);
                        }
                    }
                    Err(e) => report(severity, &e),
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?root, "Locale watcher started");

        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn report(severity: Severity, error: &dyn std::fmt::Display) {
    match severity {
        Severity::Off => {}
        Severity::Debug => tracing::debug!(error = %error, "Locale watcher error"),
        Severity::Info => tracing::info!(error = %error, "Locale watcher error"),
        Severity::Warn => tracing::warn!(error = %error, "Locale watcher error"),
        Severity::Error => tracing::error!(error = %error, "Locale watcher error"),
    }
}
