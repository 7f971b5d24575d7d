//! Live-tail growing log files and broadcast their new lines to any number of
//! subscribers.
//!
//! Every configured file becomes a [`Source`]: a tailer follows the file from
//! its current end, records each new line in a bounded [`HistoryBuffer`] and
//! hands it to a [`BroadcastHub`], which fans it out to the source's
//! [`SubscriberSet`]. A subscriber joining late first receives the history
//! window, then every line published after it joined.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use logcast::{source, Source};
//!
//! #[tokio::main]
//! async fn main() -> logcast::Result<()> {
//!     let app = Arc::new(Source::new("app", "/var/log/app.log", 20, 256));
//!     let (publisher, hub) = app.pipeline(1024);
//!     tokio::spawn(hub.run());
//!     tokio::spawn(source::follow(publisher, Duration::from_millis(500)));
//!
//!     let mut subscription = app.subscribe();
//!     for line in subscription.take_replay() {
//!         println!("(history) {}", line);
//!     }
//!     while let Some(line) = subscription.recv().await {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The `logcast` binary serves every source over WebSocket; see
//! [`server`].

use std::sync::Arc;

pub mod config;
mod error;
mod events;
pub mod history;
pub mod hub;
pub mod logging;
mod reader;
pub mod registry;
pub mod server;
pub mod source;
pub mod subscribers;

pub use config::{Config, ConfigError, SourceSpec};
pub use error::{Error, Result};
pub use events::{FileEvent, FileEvents};
pub use history::HistoryBuffer;
pub use hub::BroadcastHub;
pub use reader::TailReader;
pub use registry::SourceRegistry;
pub use source::{Source, SourceState, Subscription};
pub use subscribers::{Subscriber, SubscriberId, SubscriberSet};

/// One line of log output, without its terminator.
pub type Line = Arc<str>;

/// A line together with its position in its source's publish order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Published {
    pub seq: history::Seq,
    pub line: Line,
}
