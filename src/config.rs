//! Server configuration.
//!
//! Defaults are usable as-is. [`Config::from_env`] overrides them from
//! `TRELLIS_*` environment variables:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `TRELLIS_HOST` | [`host`](Config::host) | `127.0.0.1` |
//! | `TRELLIS_PORT` | [`port`](Config::port) | `8080` |
//! | `TRELLIS_HTDOCS` | [`htdocs`](Config::htdocs) | unset (no file serving) |
//! | `TRELLIS_WORKERS` | [`workers`](Config::workers) | available parallelism |
//! | `TRELLIS_FILE_IO_THREADS` | [`file_io_threads`](Config::file_io_threads) | `6` |
//! | `TRELLIS_MAX_BODY_BYTES` | [`max_body_bytes`](Config::max_body_bytes) | 8 MiB |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_FILE_IO_THREADS: usize = 6;
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Everything the server needs besides the router.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Root directory for static files. `None` disables file serving.
    pub htdocs: Option<PathBuf>,
    /// Threads allowed to run simple-handler callbacks at once.
    pub workers: usize,
    /// Threads allowed to run blocking file reads at once.
    pub file_io_threads: usize,
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            htdocs: None,
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            file_io_threads: DEFAULT_FILE_IO_THREADS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `TRELLIS_*` variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: parse_or("TRELLIS_HOST", &lookup, defaults.host),
            port: parse_or("TRELLIS_PORT", &lookup, defaults.port),
            htdocs: lookup("TRELLIS_HTDOCS")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            workers: parse_or("TRELLIS_WORKERS", &lookup, defaults.workers).max(1),
            file_io_threads: parse_or("TRELLIS_FILE_IO_THREADS", &lookup, defaults.file_io_threads)
                .max(1),
            max_body_bytes: parse_or("TRELLIS_MAX_BODY_BYTES", &lookup, defaults.max_body_bytes),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn htdocs(mut self, root: impl Into<PathBuf>) -> Self {
        self.htdocs = Some(root.into());
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn file_io_threads(mut self, n: usize) -> Self {
        self.file_io_threads = n.max(1);
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse_or<T: FromStr>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            default
        }),
    }
}
