//! Exchange directory ingestion.
//!
//! Producers drop plain-text notification files into a watched directory.
//! The parser turns file contents into a [`Notification`](crate::models::Notification);
//! the watcher drives read, parse and persist for every new file.

mod parser;
mod watcher;

pub use watcher::ExchangeWatcher;
