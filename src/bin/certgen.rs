use std::{fs::File, io::Write, ops::Add};

use clap::Parser;
use rcgen::{Certificate, CertificateParams, ExtendedKeyUsagePurpose, KeyUsagePurpose};
use time::{Duration, OffsetDateTime};

const DEFAULT_SERVICE_HOST: &str = "klbrd-webhook-service.kuberlogic.svc";
const DEFAULT_OUTPUT_DIR: &str = ".";
const VALID_DAYS: i64 = 3650;

/// Generate a self-signed serving certificate for the admission webhooks
#[derive(Parser)]
struct Args {
    /// Hostnames the webhook service is reachable at
    #[arg(long, default_value = DEFAULT_SERVICE_HOST)]
    host: Vec<String>,

    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    out_dir: String,
}

fn main() -> anyhow::Result<()> {
    let arg = Args::parse();

    println!("Generate certificate and key files for {:?}", arg.host);

    let mut params = CertificateParams::new(arg.host);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc().add(Duration::days(VALID_DAYS));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = Certificate::from_params(params)?;

    let certificate_pem = cert.serialize_pem()?;
    let private_key_pem = cert.serialize_private_key_pem();

    let mut certificate_pem_file = File::create(format!("{}/tls.crt", arg.out_dir))?;
    certificate_pem_file.write_all(certificate_pem.as_bytes())?;

    let mut private_key_pem_file = File::create(format!("{}/tls.key", arg.out_dir))?;
    private_key_pem_file.write_all(private_key_pem.as_bytes())?;

    Ok(())
}
