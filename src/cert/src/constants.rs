pub const DEFAULT_TLS_CERT: &str = "/etc/klbrd/cert/tls.crt";
pub const DEFAULT_TLS_KEY: &str = "/etc/klbrd/cert/tls.key";
