use std::str::FromStr;

use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

use crate::error::Error;

#[derive(Debug)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
    pub _metrics_endpoint: Option<String>,
}

pub async fn prepare_tracing(conf: TraceConfig) -> Result<(), Error> {
    let level = LevelFilter::from_str(&conf.level).map_err(|_| Error::InvalidLevel(conf.level))?;

    if conf.format == "json" {
        if let Some(path) = conf.file {
            let file = std::fs::File::create(path).map_err(Error::LogFile)?;
            Registry::default()
                .with(tracing_subscriber::fmt::Layer::new().with_writer(file))
                .with(tracing_subscriber::fmt::Layer::new().with_ansi(true).json())
                .with(level)
                .try_init()
                .map_err(Error::Init)
        } else {
            Registry::default()
                .with(tracing_subscriber::fmt::Layer::new().with_ansi(true).json())
                .with(level)
                .try_init()
                .map_err(Error::Init)
        }
    } else if let Some(path) = conf.file {
        let file = std::fs::File::create(path).map_err(Error::LogFile)?;
        Registry::default()
            .with(tracing_subscriber::fmt::Layer::new().with_writer(file))
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
            .with(level)
            .try_init()
            .map_err(Error::Init)
    } else {
        Registry::default()
            .with(tracing_subscriber::fmt::Layer::new().with_ansi(true))
            .with(level)
            .try_init()
            .map_err(Error::Init)
    }
}
