use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use node_plugin::LogLevel;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[async_trait]
#[typetag::serde]
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg)
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Forwards to the installed `tracing` subscriber.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

#[typetag::serde]
#[async_trait]
impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// Installs stdout logging plus a daily rolling file at `log_dir/log_file`.
///
/// `log_level` is an `EnvFilter` directive (e.g. `"info"` or
/// `"rtdb_flow=debug"`). Installing twice keeps the first subscriber.
pub fn init_tracing(log_dir: PathBuf, log_file: String, log_level: String) -> Result<Logger> {
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, &log_file);

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true);
    let stdout_layer = fmt::layer().with_thread_names(true);

    let installed = Registry::default()
        .with(EnvFilter::try_new(&log_level)?)
        .with(file_layer)
        .with(stdout_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    Ok(Logger(Box::new(TracingLogger::new())))
}
