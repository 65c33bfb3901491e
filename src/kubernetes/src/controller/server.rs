use std::sync::Arc;

use actix_web::{
    get, middleware, post,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use k8s_openapi::api::core::v1::Pod;
use klbrd_cert::util::{load_certificates_from_pem, load_private_key_from_file};
use klbrd_trace::init::{prepare_tracing, TraceConfig};
use kube::{core::admission::AdmissionReview, Client};
use prometheus::{Encoder, TextEncoder};
use rustls::ServerConfig;

use crate::{crd::backup::KuberlogicServiceBackup, metrics::Metrics};

use super::{
    config::{BackupConfig, Config},
    context::State,
    error::Error,
    provider::velero::Velero,
    reconciler::{self, Component},
    webhook,
};

pub fn start(config: Config, trace: TraceConfig) -> Result<(), Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::StdIo)?
        .block_on(run(config, trace))
}

#[tracing::instrument(skip_all)]
async fn run(config: Config, trace_config: TraceConfig) -> Result<(), Error> {
    prepare_tracing(trace_config).await.map_err(Error::Trace)?;

    // Configure TLS settings
    let cert_chain = load_certificates_from_pem(&config.tls.cert).map_err(Error::StdIo)?;
    let private_key =
        load_private_key_from_file(&config.tls.key).map_err(|e| Error::Tls(e.to_string()))?;

    // Initialize Kubernetes controller state
    let state = State::new("klbrd-controller");
    let metrics = Metrics::new()
        .and_then(|m| m.register(&state.registry))
        .map_err(Error::Metrics)?;
    let client = Client::try_default().await.map_err(Error::Kube)?;

    // Start web server
    let server_config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    let server_state = state.clone();
    let server_client = client.clone();
    let server_backups = config.backups.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .app_data(Data::new(server_client.clone()))
            .app_data(Data::new(server_backups.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .service(pod_mutating_webhook)
            .service(backup_validating_webhook)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind_rustls_021(format!("0.0.0.0:{}", config.https_port), server_config)
    .map_err(Error::StdIo)?
    .bind(format!("0.0.0.0:{}", config.http_port))
    .map_err(Error::StdIo)?
    .shutdown_timeout(5);

    let interval = config.requeue_interval;
    if config.backups.enabled {
        let provider = Arc::new(Velero::new(client.clone(), config.backups.clone()));
        let component = Component::new(provider, config.backups.clone());

        tracing::info!("Start KuberlogicServiceBackup reconciler");
        let backup_state = state.clone();
        let backup_client = client.clone();
        let backup_component = component.clone();
        let backup_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler::backup::run(
                backup_state,
                backup_client,
                interval,
                backup_component,
                backup_metrics,
            )
            .await
            {
                tracing::error!(error=?e, "KuberlogicServiceBackup reconciler stopped");
            }
        });

        tracing::info!("Start KuberlogicServiceRestore reconciler");
        let restore_state = state.clone();
        let restore_client = client.clone();
        let restore_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler::restore::run(
                restore_state,
                restore_client,
                interval,
                component,
                restore_metrics,
            )
            .await
            {
                tracing::error!(error=?e, "KuberlogicServiceRestore reconciler stopped");
            }
        });

        tracing::info!("Start KuberlogicServiceBackupSchedule reconciler");
        let schedule_state = state.clone();
        let schedule_client = client.clone();
        let schedule_config = config.backups.scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler::backup_schedule::run(
                schedule_state,
                schedule_client,
                interval,
                schedule_config,
                metrics,
            )
            .await
            {
                tracing::error!(error=?e, "KuberlogicServiceBackupSchedule reconciler stopped");
            }
        });
    } else {
        tracing::warn!("backups are disabled, only the admission webhooks are served");
    }

    server.run().await.map_err(Error::StdIo)
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metrics, &mut buffer) {
        tracing::error!(error=?e, "failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[post("/mutate-service-pod")]
async fn pod_mutating_webhook(
    req: HttpRequest,
    body: web::Json<AdmissionReview<Pod>>,
    client: Data<Client>,
) -> impl Responder {
    webhook::pod::handle_mutation(req, body, client).await
}

#[post("/validate-kuberlogic-com-v1alpha1-kuberlogicservicebackup")]
async fn backup_validating_webhook(
    req: HttpRequest,
    body: web::Json<AdmissionReview<KuberlogicServiceBackup>>,
    config: Data<BackupConfig>,
) -> impl Responder {
    webhook::backup::handle_validation(req, body, config).await
}
