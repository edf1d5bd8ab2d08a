//! Configuration file watcher for hot reload.
//!
//! # Responsibilities
//! - Reload and validate the file whenever it changes on disk
//! - Drop reloads that leave the effective configuration unchanged
//! - Tag each update with the sections that only apply after a restart
//!
//! # Design Decisions
//! - Breaker settings, boundary timeouts and the admin key are live
//! - Server, connection quotas, the startup graph and observability are
//!   fixed for the life of the process
//! - An invalid file never produces an update; the running config stays

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::BulwarkConfig;

/// A validated config that differs from the previously seen one.
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub config: BulwarkConfig,
    /// Changed sections that are ignored until restart.
    pub restart_required: Vec<&'static str>,
}

/// Sections of `next` that differ from `current` but cannot be applied live.
pub fn restart_required(current: &BulwarkConfig, next: &BulwarkConfig) -> Vec<&'static str> {
    let mut sections = Vec::new();
    if differs(&current.server, &next.server) {
        sections.push("server");
    }
    if differs(&current.connections, &next.connections) {
        sections.push("connections");
    }
    if differs(&current.startup, &next.startup) {
        sections.push("startup");
    }
    if differs(&current.observability, &next.observability) {
        sections.push("observability");
    }
    sections
}

fn differs<T: Serialize>(a: &T, b: &T) -> bool {
    serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    current: BulwarkConfig,
    update_tx: mpsc::UnboundedSender<ConfigUpdate>,
}

impl ConfigWatcher {
    /// Create a watcher whose baseline is the config the process started with.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path, current: BulwarkConfig) -> (Self, mpsc::UnboundedReceiver<ConfigUpdate>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                current,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for updates to flow.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut current,
            update_tx,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match load_config(&path) {
                        Ok(next) => {
                            if let Some(update) = diff_update(&current, next) {
                                tracing::info!(
                                    path = ?path,
                                    restart_required = ?update.restart_required,
                                    "Config file changed"
                                );
                                current = update.config.clone();
                                let _ = update_tx.send(update);
                            }
                        }
                        Err(e) => tracing::error!(
                            path = ?path,
                            error = %e,
                            "Rejected config reload, keeping current configuration"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?watched, "Config watcher started");
        Ok(watcher)
    }
}

/// `None` when `next` is effectively the config already in force.
fn diff_update(current: &BulwarkConfig, next: BulwarkConfig) -> Option<ConfigUpdate> {
    if !differs(current, &next) {
        return None;
    }
    Some(ConfigUpdate {
        restart_required: restart_required(current, &next),
        config: next,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn unchanged_reload_is_dropped() {
        let current = BulwarkConfig::default();
        assert!(diff_update(&current, BulwarkConfig::default()).is_none());
    }

    #[test]
    fn live_sections_need_no_restart() {
        let next = parse_config(
            r#"
            [breaker]
            failure_threshold = 7

            [admin]
            api_key = "rotated"
            "#,
        )
        .unwrap();

        let update = diff_update(&BulwarkConfig::default(), next).unwrap();
        assert!(update.restart_required.is_empty());
        assert_eq!(update.config.breaker.defaults.failure_threshold, 7);
    }

    #[test]
    fn fixed_sections_are_flagged() {
        let next = parse_config(
            r#"
            [connections]
            max_total = 50

            [[startup.components]]
            name = "storage"
            "#,
        )
        .unwrap();

        let update = diff_update(&BulwarkConfig::default(), next).unwrap();
        assert_eq!(update.restart_required, vec!["connections", "startup"]);
    }
}
