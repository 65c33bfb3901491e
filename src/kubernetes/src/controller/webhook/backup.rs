use actix_web::{http, web, HttpRequest, HttpResponse, Responder};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    response::StatusSummary,
    Status,
};

use crate::{
    controller::{config::BackupConfig, error::Error},
    crd::backup::KuberlogicServiceBackup,
};

#[tracing::instrument(skip_all)]
pub async fn handle_validation(
    req: HttpRequest,
    body: web::Json<AdmissionReview<KuberlogicServiceBackup>>,
    config: web::Data<BackupConfig>,
) -> impl Responder {
    tracing::info!(method=?req.method(), uri=?req.uri(), "Call validating webhook for KuberlogicServiceBackup");

    if let Some(content_type) = req.head().headers.get("content-type") {
        if content_type != "application/json" {
            let msg = format!("invalid content-type: {:?}", content_type);

            return HttpResponse::BadRequest().json(msg);
        }
    }

    let admission_req: AdmissionRequest<KuberlogicServiceBackup> =
        match body.into_inner().try_into() {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(error=?e, "Invalid request");
                return HttpResponse::InternalServerError()
                    .json(&AdmissionResponse::invalid(e.to_string()).into_review());
            }
        };

    let resp = validate(
        AdmissionResponse::from(&admission_req),
        &admission_req.operation,
        config.enabled,
    );
    if !resp.allowed {
        tracing::warn!(name = admission_req.name, "deny backup request, backups are disabled");
    }
    HttpResponse::Ok().json(resp.into_review())
}

/// Deny creating or updating backup requests while backups are disabled.
pub fn validate(
    mut resp: AdmissionResponse,
    operation: &Operation,
    enabled: bool,
) -> AdmissionResponse {
    if enabled || matches!(operation, Operation::Delete) {
        return resp;
    }
    resp.allowed = false;
    resp.result = Status {
        status: Some(StatusSummary::Failure),
        code: http::StatusCode::FORBIDDEN.as_u16(),
        message: "Forbidden by validating webhook".to_string(),
        reason: Error::BackupsDisabled.to_string(),
        details: None,
    };
    resp
}
