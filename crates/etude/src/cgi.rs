// src/cgi.rs
//! CGI gateway: run the configured program with the request body on its
//! stdin and copy whatever it prints, unmodified, to the client.
//!
//! The program must print a complete HTTP/1.1 response. Process creation
//! sits behind [`Spawner`] so the gateway only sees "write body, read
//! response, wait".

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CGI relay failed: {0}")]
    Relay(#[source] io::Error),

    #[error("waiting for CGI process failed: {0}")]
    Wait(#[source] io::Error),
}

/// A running child with piped stdin and stdout.
pub trait PipedChild {
    /// Write the whole body and close stdin.
    fn write_body(&mut self, body: &[u8]) -> io::Result<()>;
    /// Copy stdout into `out` until EOF. Returns the bytes copied.
    fn read_response(&mut self, out: &mut dyn Write) -> io::Result<u64>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
    fn kill(&mut self);
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, program: &Path, env: &[(&str, String)]) -> io::Result<Box<dyn PipedChild>>;
}

/// [`Spawner`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

struct CommandChild(Child);

impl PipedChild for CommandChild {
    fn write_body(&mut self, body: &[u8]) -> io::Result<()> {
        // Dropping the handle closes the pipe, signalling EOF.
        match self.0.stdin.take() {
            Some(mut stdin) => stdin.write_all(body),
            None => Ok(()),
        }
    }

    fn read_response(&mut self, out: &mut dyn Write) -> io::Result<u64> {
        match self.0.stdout.take() {
            Some(mut stdout) => copy_verbatim(&mut stdout, out),
            None => Ok(0),
        }
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.0.wait()
    }

    fn kill(&mut self) {
        let _ = self.0.kill();
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, program: &Path, env: &[(&str, String)]) -> io::Result<Box<dyn PipedChild>> {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in env {
            cmd.env(key, value);
        }
        Ok(Box::new(CommandChild(cmd.spawn()?)))
    }
}

fn copy_verbatim(from: &mut dyn Read, to: &mut dyn Write) -> io::Result<u64> {
    let mut chunk = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = match from.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        to.write_all(&chunk[..n])?;
        total += n as u64;
    }
    to.flush()?;
    Ok(total)
}

#[derive(Debug, Clone, Copy)]
pub struct CgiOutcome {
    pub bytes_relayed: u64,
    pub exit: ExitStatus,
}

pub struct CgiGateway {
    program: PathBuf,
    spawner: Box<dyn Spawner>,
}

impl std::fmt::Debug for CgiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgiGateway")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl CgiGateway {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_spawner(program, Box::new(CommandSpawner))
    }

    pub fn with_spawner(program: impl Into<PathBuf>, spawner: Box<dyn Spawner>) -> Self {
        Self {
            program: program.into(),
            spawner,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the program for one POST body, relaying its stdout into `client`.
    ///
    /// Blocks until the child exits. A spawn failure is reported before any
    /// byte reaches `client`.
    pub fn run(&self, body: &[u8], client: &mut dyn Write) -> Result<CgiOutcome, CgiError> {
        let env = [
            ("METHOD", "POST".to_string()),
            ("CONTENT_LENGTH", body.len().to_string()),
        ];
        let mut child = self
            .spawner
            .spawn(&self.program, &env)
            .map_err(|source| CgiError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Err(e) = child.write_body(body) {
            // The program may exit without reading its input; its output still counts.
            if e.kind() != io::ErrorKind::BrokenPipe {
                child.kill();
                let _ = child.wait();
                return Err(CgiError::Relay(e));
            }
            tracing::debug!("CGI program closed stdin early");
        }

        let bytes_relayed = match child.read_response(client) {
            Ok(n) => n,
            Err(e) => {
                child.kill();
                let _ = child.wait();
                return Err(CgiError::Relay(e));
            }
        };

        let exit = child.wait().map_err(CgiError::Wait)?;
        if !exit.success() {
            tracing::warn!(program = %self.program.display(), %exit, "CGI program exited abnormally");
        } else {
            tracing::debug!(bytes_relayed, "CGI program finished");
        }
        Ok(CgiOutcome {
            bytes_relayed,
            exit,
        })
    }
}
