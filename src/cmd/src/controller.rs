use clap::Parser;
use klbrd_kubernetes::controller::config::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

#[derive(Debug, Clone, Parser)]
pub struct ControllerCmd {
    #[arg(long = "http-port", default_value_t = DEFAULT_HTTP_PORT, help = "HTTP server serving port")]
    pub http_port: u32,

    #[arg(long = "https-port", default_value_t = DEFAULT_HTTPS_PORT, help = "HTTPS server serving port")]
    pub https_port: u32,

    #[arg(short = 'f', long, help = "Config file path for the backup controller")]
    pub file: Option<String>,

    #[arg(long = "tls-cert", help = "path to TLS Certificate for admission webhooks")]
    pub tls_cert: Option<String>,

    #[arg(long = "tls-key", help = "path to TLS Key for admission webhooks")]
    pub tls_key: Option<String>,

    #[arg(long = "requeue-interval", help = "Resync interval of reconcilers in seconds")]
    pub requeue_interval: Option<u64>,

    #[arg(long = "disable-backups", help = "Serve admission webhooks only")]
    pub disable_backups: bool,

    #[arg(long = "snapshots", help = "Back up volumes by snapshots instead of pausing pods")]
    pub snapshots: bool,

    #[arg(long = "velero-namespace", help = "Namespace Velero runs in")]
    pub velero_namespace: Option<String>,

    #[arg(long = "storage-location", help = "Velero BackupStorageLocation to back up to")]
    pub storage_location: Option<String>,
}
