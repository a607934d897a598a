//! Tracing subscriber installation.
//!
//! ```rust,no_run
//! use agentwire_server::LoggingConfig;
//!
//! // Stderr only, nothing to hold on to
//! LoggingConfig::stderr_minimal().init()?;
//!
//! // File output is buffered; keep the guard alive until exit
//! let _guard = LoggingConfig::production("/var/log/agent").init()?;
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! `RUST_LOG` takes precedence over [`LoggingConfig::level`].

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogOutput, LogRotation, LoggingConfig};

/// Flushes buffered file logs on drop.
///
/// Returned by [`LoggingConfig::init`] whenever a file is written; dropping
/// it early loses pending lines.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
    _stderr_guard: Option<WorkerGuard>,
}

impl LoggingConfig {
    /// Install the global subscriber.
    ///
    /// Fails when file output has no directory, the directory cannot be
    /// created, or a subscriber is already installed.
    pub fn init(&self) -> io::Result<Option<LoggingGuard>> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.output {
            LogOutput::None => Ok(None),
            LogOutput::Stderr => {
                self.install(filter, io::stderr)?;
                Ok(None)
            }
            LogOutput::FileOnly => {
                let (file, file_guard) = self.file_writer()?;
                self.install(filter, file)?;
                Ok(Some(LoggingGuard {
                    _file_guard: file_guard,
                    _stderr_guard: None,
                }))
            }
            LogOutput::Both => {
                let (file, file_guard) = self.file_writer()?;
                let (stderr, stderr_guard) = tracing_appender::non_blocking(io::stderr());
                self.install(filter, file.and(stderr))?;
                Ok(Some(LoggingGuard {
                    _file_guard: file_guard,
                    _stderr_guard: Some(stderr_guard),
                }))
            }
        }
    }

    fn file_writer(&self) -> io::Result<(NonBlocking, WorkerGuard)> {
        let dir = self.directory.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "File logging requires a directory",
            )
        })?;
        std::fs::create_dir_all(dir)?;
        let appender = rolling(dir, &self.file_prefix, self.rotation)?;
        Ok(tracing_appender::non_blocking(appender))
    }

    fn install<W>(&self, filter: EnvFilter, writer: W) -> io::Result<()>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let registry = tracing_subscriber::registry().with(filter);
        let result = if self.structured {
            registry
                .with(fmt::layer().json().with_writer(writer))
                .try_init()
        } else {
            registry.with(fmt::layer().with_writer(writer)).try_init()
        };
        result.map_err(|e| io::Error::other(e.to_string()))
    }
}

fn rolling(dir: &Path, prefix: &str, rotation: LogRotation) -> io::Result<RollingFileAppender> {
    let rotation = match rotation {
        LogRotation::Minute => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .build(dir)
        .map_err(io::Error::other)
}
