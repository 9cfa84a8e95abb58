// src/config.rs
//! Startup configuration.
//!
//! The file is TOML. Two keys are required and looked up by dotted path:
//!
//! ```toml
//! [web_server_info]
//! ip = "0.0.0.0"
//! port = 8080
//! ```
//!
//! Optional `[pool]` and `[server]` tables tune the worker pool and the
//! connection table; every field has a default.

use crate::error::{EtudeError, EtudeResult};
use crate::http::WRITE_BUF_SIZE;
use crate::parser::READ_BUF_SIZE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

pub const IP_KEY: &str = "web_server_info.ip";
pub const PORT_KEY: &str = "web_server_info.port";

pub const DEFAULT_MAX_REQUESTS: usize = 10_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_BACKLOG: i32 = 5;
pub const DEFAULT_CGI_PROGRAM: &str = "cgi-bin/calc_cgi";

/// Parsed configuration file with dotted-path lookup.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    root: toml::Value,
    dir: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> EtudeResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut file = Self::parse(&text)?;
        file.dir = path.parent().map(Path::to_path_buf);
        Ok(file)
    }

    pub fn parse(text: &str) -> EtudeResult<Self> {
        let root: toml::Value = toml::from_str(text)?;
        Ok(Self { root, dir: None })
    }

    /// Resolve `a.b.c`. Fails with `MissingKey` if any segment is absent.
    pub fn lookup(&self, path: &str) -> EtudeResult<&toml::Value> {
        path.split('.')
            .try_fold(&self.root, |node, key| node.get(key))
            .ok_or_else(|| EtudeError::MissingKey(path.to_string()))
    }

    pub fn get_str(&self, path: &str) -> EtudeResult<&str> {
        self.lookup(path)?
            .as_str()
            .ok_or_else(|| invalid(path, "string"))
    }

    pub fn get_int(&self, path: &str) -> EtudeResult<i64> {
        self.lookup(path)?
            .as_integer()
            .ok_or_else(|| invalid(path, "integer"))
    }

    /// Deserialize an optional table; absent means `T::default()`.
    pub fn section<T: DeserializeOwned + Default>(&self, name: &str) -> EtudeResult<T> {
        match self.root.get(name) {
            None => Ok(T::default()),
            Some(value) => Ok(value.clone().try_into()?),
        }
    }

    /// Relative paths in the file are relative to the file itself.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn invalid(path: &str, expected: &'static str) -> EtudeError {
    EtudeError::InvalidValue {
        path: path.to_string(),
        expected,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PoolSection {
    threads: Option<usize>,
    max_requests: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    max_connections: Option<usize>,
    backlog: Option<i32>,
    doc_root: Option<PathBuf>,
    cgi_program: Option<PathBuf>,
}

/// Typed settings consumed by [`crate::Server::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub threads: usize,
    pub max_requests: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub doc_root: PathBuf,
    /// Relative paths resolve against `doc_root`.
    pub cgi_program: PathBuf,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
}

impl ServerConfig {
    pub fn new(ip: IpAddr, port: u16, doc_root: impl Into<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            threads: num_cpus::get().max(1),
            max_requests: DEFAULT_MAX_REQUESTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backlog: DEFAULT_BACKLOG,
            doc_root: doc_root.into(),
            cgi_program: PathBuf::from(DEFAULT_CGI_PROGRAM),
            read_buf_size: READ_BUF_SIZE,
            write_buf_size: WRITE_BUF_SIZE,
        }
    }

    /// Build from a config file. `default_root` is used when the file has no
    /// `server.doc_root`.
    pub fn from_file(file: &ConfigFile, default_root: &Path) -> EtudeResult<Self> {
        let ip: IpAddr = file
            .get_str(IP_KEY)?
            .parse()
            .map_err(|_| invalid(IP_KEY, "IP address"))?;
        let port = u16::try_from(file.get_int(PORT_KEY)?)
            .map_err(|_| invalid(PORT_KEY, "port in 0..=65535"))?;

        let pool: PoolSection = file.section("pool")?;
        let server: ServerSection = file.section("server")?;

        let doc_root = server
            .doc_root
            .map(|p| file.resolve_path(&p))
            .unwrap_or_else(|| default_root.to_path_buf());
        let mut config = Self::new(ip, port, doc_root);

        if let Some(threads) = pool.threads {
            config = config.threads(threads);
        }
        if let Some(max_requests) = pool.max_requests {
            config = config.max_requests(max_requests);
        }
        if let Some(max_connections) = server.max_connections {
            config = config.max_connections(max_connections);
        }
        if let Some(backlog) = server.backlog {
            config = config.backlog(backlog);
        }
        if let Some(program) = server.cgi_program {
            config = config.cgi_program(program);
        }
        Ok(config)
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn cgi_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.cgi_program = program.into();
        self
    }

    pub fn doc_root(mut self, doc_root: impl Into<PathBuf>) -> Self {
        self.doc_root = doc_root.into();
        self
    }

    pub fn cgi_program_path(&self) -> PathBuf {
        if self.cgi_program.is_relative() {
            self.doc_root.join(&self.cgi_program)
        } else {
            self.cgi_program.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[web_server_info]
ip = "127.0.0.1"
port = 8080
"#;

    #[test]
    fn lookup_by_dotted_path() {
        let file = ConfigFile::parse(MINIMAL).unwrap();
        assert_eq!(file.get_str(IP_KEY).unwrap(), "127.0.0.1");
        assert_eq!(file.get_int(PORT_KEY).unwrap(), 8080);
        assert!(matches!(
            file.lookup("web_server_info.missing"),
            Err(EtudeError::MissingKey(k)) if k == "web_server_info.missing"
        ));
        assert!(matches!(file.lookup("nope.ip"), Err(EtudeError::MissingKey(_))));
        assert!(matches!(
            file.get_int(IP_KEY),
            Err(EtudeError::InvalidValue { expected: "integer", .. })
        ));
    }

    #[test]
    fn unreadable_or_malformed_files_fail() {
        assert!(matches!(
            ConfigFile::load("/definitely/not/a/config.toml"),
            Err(EtudeError::Io(_))
        ));
        assert!(matches!(
            ConfigFile::parse("[web_server_info\nip ="),
            Err(EtudeError::ConfigParse(_))
        ));
    }

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let file = ConfigFile::parse(MINIMAL).unwrap();
        let config = ServerConfig::from_file(&file, Path::new("/srv/www")).unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.max_requests, DEFAULT_MAX_REQUESTS);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert!(config.threads >= 1);
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(
            config.cgi_program_path(),
            PathBuf::from("/srv/www/cgi-bin/calc_cgi")
        );
    }

    #[test]
    fn optional_sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etude.toml");
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            "{}\n[pool]\nthreads = 3\nmax_requests = 7\n\n[server]\nmax_connections = 9\nbacklog = 64\ndoc_root = \"www\"\ncgi_program = \"/usr/bin/env\"\n",
            MINIMAL
        )
        .unwrap();

        let file = ConfigFile::load(&path).unwrap();
        let config = ServerConfig::from_file(&file, Path::new("/unused")).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.max_requests, 7);
        assert_eq!(config.max_connections, 9);
        assert_eq!(config.backlog, 64);
        assert_eq!(config.doc_root, dir.path().join("www"));
        assert_eq!(config.cgi_program_path(), PathBuf::from("/usr/bin/env"));
    }

    #[test]
    fn bad_values_are_rejected() {
        let file = ConfigFile::parse("[web_server_info]\nip = \"not-an-ip\"\nport = 1\n").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&file, Path::new("/")),
            Err(EtudeError::InvalidValue { .. })
        ));

        let file = ConfigFile::parse("[web_server_info]\nip = \"::1\"\nport = 70000\n").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&file, Path::new("/")),
            Err(EtudeError::InvalidValue { .. })
        ));

        let file = ConfigFile::parse("[web_server_info]\nip = \"::1\"\n").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&file, Path::new("/")),
            Err(EtudeError::MissingKey(_))
        ));

        let with_typo = format!("{}\n[pool]\nthread = 2\n", MINIMAL);
        let file = ConfigFile::parse(&with_typo).unwrap();
        assert!(matches!(
            ServerConfig::from_file(&file, Path::new("/")),
            Err(EtudeError::ConfigParse(_))
        ));
    }
}
