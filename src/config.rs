//! Process-wide configuration, set once before any thread is spawned and
//! read-only thereafter.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Kernel-bypass network interface identifier.
    pub interface: String,
    /// How often the coordinator logs a statistics summary. `None` disables it.
    pub stats_period: Option<Duration>,
    pub verbose: bool,
    pub daemon: bool,
    /// Root directory the writer task's paths must resolve under.
    pub write_root: PathBuf,
    /// Writer task's request/reply listening address.
    pub writer_addr: SocketAddr,
    /// Histogram task's publish listening address.
    pub publisher_addr: SocketAddr,
}

impl Config {
    pub fn new(interface: impl Into<String>, write_root: impl Into<PathBuf>) -> Self {
        Config {
            interface: interface.into(),
            stats_period: Some(Duration::from_secs(1)),
            verbose: false,
            daemon: true,
            write_root: write_root.into(),
            writer_addr: "0.0.0.0:55555".parse().unwrap(),
            publisher_addr: "0.0.0.0:55556".parse().unwrap(),
        }
    }
}
