// src/lib.rs
//! etude: an epoll-driven HTTP/1.1 static file server with a CGI gateway.
//!
//! One reactor thread accepts connections and forwards readiness to a fixed
//! worker pool. Each connection is parsed incrementally, answered from a
//! memory-mapped file, or handed to an external CGI program for POST.
//! Linux only.

pub mod cgi;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod file;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod slab;
pub mod sync;
pub mod syscalls;

// Re-exports for users
pub use config::{ConfigFile, ServerConfig};
pub use error::{EtudeError, EtudeResult};
pub use metrics::StatsSnapshot;
pub use server::{Server, ShutdownHandle};
