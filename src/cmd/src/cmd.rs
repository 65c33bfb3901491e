use clap::{Parser, Subcommand, ValueEnum};

use klbrd_kubernetes::controller::{config::Config, error::Error};
use klbrd_trace::init::TraceConfig;

use crate::controller::ControllerCmd;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Controller(ControllerCmd),
    Version,
}

pub fn run() -> Result<(), Error> {
    let command = Cmd::parse();

    let format = command.format;
    let level = command.level;
    let log_file = command.log_file;

    match command.sub {
        SubCmd::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        SubCmd::Controller(c) => {
            let trace_conf = TraceConfig {
                level,
                format: format.to_string(),
                file: log_file,
                _metrics_endpoint: None,
            };
            let config = controller_config(c)?;

            klbrd_kubernetes::controller::server::start(config, trace_conf)
        }
    }
}

/// Merge command line overrides into the configuration file.
pub fn controller_config(c: ControllerCmd) -> Result<Config, Error> {
    let mut config = match c.file {
        None => Config::default(),
        Some(file) => Config::load(&file)?,
    };

    config.http_port = c.http_port;
    config.https_port = c.https_port;
    if let Some(cert) = c.tls_cert {
        config.tls.cert = cert;
    }
    if let Some(key) = c.tls_key {
        config.tls.key = key;
    }
    if let Some(interval) = c.requeue_interval {
        config.requeue_interval = interval;
    }
    if c.disable_backups {
        config.backups.enabled = false;
    }
    if c.snapshots {
        config.backups.snapshots_enabled = true;
    }
    if let Some(ns) = c.velero_namespace {
        config.backups.velero_namespace = ns;
    }
    if let Some(location) = c.storage_location {
        config.backups.storage_location = location;
    }
    config.backups.validate()?;

    Ok(config)
}
