//! The fixed set of sources served by the process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{self, Config, SourceSpec};
use crate::source::{follow, Source, SourceState};

/// Tuning shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub history_lines: usize,
    pub subscriber_buffer: usize,
    pub publish_buffer: usize,
    pub poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            history_lines: config::DEFAULT_HISTORY_LINES,
            subscriber_buffer: config::DEFAULT_SUBSCRIBER_BUFFER,
            publish_buffer: config::DEFAULT_PUBLISH_BUFFER,
            poll_interval: Duration::from_millis(config::DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Settings {
            history_lines: config.history_lines,
            subscriber_buffer: config.subscriber_buffer,
            publish_buffer: config.publish_buffer,
            poll_interval: config.poll_interval(),
        }
    }
}

/// A source stopped being followed.
#[derive(Debug, Clone)]
pub struct SourceFault {
    pub endpoint: String,
    pub reason: String,
}

/// All sources, keyed by endpoint. Built once; never changes afterwards.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<Source>>,
}

impl SourceRegistry {
    /// Creates the sources without starting them. Specs are expected to have
    /// unique endpoints; a later duplicate replaces an earlier one.
    pub fn new(specs: impl IntoIterator<Item = SourceSpec>, settings: Settings) -> Self {
        let sources = specs
            .into_iter()
            .map(|spec| {
                let source = Source::new(
                    spec.name,
                    spec.path,
                    settings.history_lines,
                    settings.subscriber_buffer,
                );
                (source.endpoint().to_string(), Arc::new(source))
            })
            .collect();

        SourceRegistry { sources }
    }

    /// Creates the sources and spawns a tailer and a broadcaster for each.
    ///
    /// A source whose tailer fails is marked [`SourceState::Failed`] and
    /// reported on the returned channel; the others carry on.
    pub fn start(
        specs: impl IntoIterator<Item = SourceSpec>,
        settings: Settings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SourceFault>) {
        let registry = Arc::new(Self::new(specs, settings));
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        for source in registry.sources.values() {
            info!(
                source = %source.endpoint(),
                path = %source.path().display(),
                "registered log source"
            );

            let (publisher, hub) = source.pipeline(settings.publish_buffer);
            tokio::spawn(hub.run());

            let source = Arc::clone(source);
            let fault_tx = fault_tx.clone();
            tokio::spawn(async move {
                let reason = match follow(publisher, settings.poll_interval).await {
                    Ok(()) => "file watcher stopped".to_string(),
                    Err(e) => e.to_string(),
                };

                source.set_state(SourceState::Failed);
                error!(
                    source = %source.endpoint(),
                    path = %source.path().display(),
                    reason = %reason,
                    "stopped following log file"
                );

                let _ = fault_tx.send(SourceFault {
                    endpoint: source.endpoint().to_string(),
                    reason,
                });
            });
        }

        (registry, fault_rx)
    }

    pub fn get(&self, endpoint: &str) -> Option<&Arc<Source>> {
        self.sources.get(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Endpoint to display name, for every source.
    pub fn directory(&self) -> BTreeMap<String, String> {
        self.sources
            .iter()
            .map(|(endpoint, source)| (endpoint.clone(), source.name().to_string()))
            .collect()
    }
}
