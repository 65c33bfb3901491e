use thiserror::Error;

pub trait TraceableError: std::error::Error {
    fn metric_label(&self) -> String;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    LogFile(#[source] std::io::Error),

    #[error("failed to install global subscriber: {0}")]
    Init(#[source] tracing_subscriber::util::TryInitError),
}
