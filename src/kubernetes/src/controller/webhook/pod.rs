use actix_web::{web, HttpRequest, HttpResponse, Responder};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    Api, Client, ResourceExt,
};
use serde_json::{json, Value};

use crate::{
    controller::provider::velero::BACKUP_POD_NAME, crd::service::KuberLogicService,
};

pub const IGNORE_PAUSE_LABEL: &str = "kuberlogic.com/ignore-pause";
pub const PAUSE_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

const POD_AFFINITY_REQUIRED: &str = "requiredDuringSchedulingIgnoredDuringExecution";

#[tracing::instrument(skip_all)]
pub async fn handle_mutation(
    req: HttpRequest,
    body: web::Json<AdmissionReview<Pod>>,
    client: web::Data<Client>,
) -> impl Responder {
    if let Some(content_type) = req.head().headers.get("content-type") {
        if content_type != "application/json" {
            let msg = format!("invalid content-type: {:?}", content_type);

            return HttpResponse::BadRequest().json(msg);
        }
    }

    let admission_req: AdmissionRequest<Pod> = match body.into_inner().try_into() {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(error=?e, "invalid request");
            return HttpResponse::InternalServerError()
                .json(&AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let resp = AdmissionResponse::from(&admission_req);

    let Some(pod) = admission_req.object.as_ref() else {
        return HttpResponse::Ok().json(resp.into_review());
    };

    let Some(ns) = admission_req.namespace.clone().or_else(|| pod.namespace()) else {
        let mut resp = resp;
        resp.warnings = Some(vec!["pod namespace is unknown".to_string()]);
        return HttpResponse::Ok().json(resp.into_review());
    };

    // Fail open: an unknown workload must never block pod admission.
    let kls = match Api::<KuberLogicService>::all(client.get_ref().clone())
        .get_opt(&ns)
        .await
    {
        Ok(Some(kls)) => kls,
        Ok(None) => {
            let mut resp = resp;
            resp.warnings = Some(vec![no_workload_warning(&ns)]);
            return HttpResponse::Ok().json(resp.into_review());
        }
        Err(e) => {
            tracing::warn!(namespace = ns, error=?e, "failed to resolve workload, allow pod");
            let mut resp = resp;
            resp.warnings = Some(vec![format!("failed to resolve workload {ns}: {e}")]);
            return HttpResponse::Ok().json(resp.into_review());
        }
    };

    let Some(patch) = gate(pod, &kls) else {
        return HttpResponse::Ok().json(resp.into_review());
    };

    tracing::info!(
        name = pod.name_any(),
        namespace = ns,
        backup = ?kls.active_backup(),
        restore = ?kls.active_restore(),
        paused = kls.is_paused(),
        "gate pod of a busy workload"
    );

    match resp.with_patch(patch) {
        Ok(resp) => HttpResponse::Ok().json(resp.into_review()),
        Err(e) => {
            tracing::error!(error=?e, name=pod.name_any(), namespace=ns, "failed to handle request");
            HttpResponse::InternalServerError().json("failed to handle a webhook request")
        }
    }
}

/// Patch keeping `pod` off every node while `kls` is busy, `None` when the pod is let through.
pub fn gate(pod: &Pod, kls: &KuberLogicService) -> Option<json_patch::Patch> {
    if pod.name_any().eq(BACKUP_POD_NAME) || !kls.is_gated() {
        return None;
    }
    let spec = pod.spec.as_ref()?;

    let term = pause_affinity_term();
    let (path, value) = match spec.affinity.as_ref() {
        None => (
            "/spec/affinity".to_string(),
            json!({ "podAffinity": { POD_AFFINITY_REQUIRED: [term] } }),
        ),
        Some(affinity) => match affinity.pod_affinity.as_ref() {
            None => (
                "/spec/affinity/podAffinity".to_string(),
                json!({ POD_AFFINITY_REQUIRED: [term] }),
            ),
            Some(pod_affinity) => match pod_affinity
                .required_during_scheduling_ignored_during_execution
                .as_ref()
            {
                None => (
                    format!("/spec/affinity/podAffinity/{POD_AFFINITY_REQUIRED}"),
                    json!([term]),
                ),
                Some(terms) => {
                    let exists = terms
                        .iter()
                        .filter_map(|t| serde_json::to_value(t).ok())
                        .any(|t| t.eq(&term));
                    if exists {
                        return None;
                    }
                    (
                        format!("/spec/affinity/podAffinity/{POD_AFFINITY_REQUIRED}/-"),
                        term,
                    )
                }
            },
        },
    };

    Some(json_patch::Patch(vec![json_patch::PatchOperation::Add(
        json_patch::AddOperation { path, value },
    )]))
}

fn no_workload_warning(namespace: &str) -> String {
    format!("no kuberlogicservice manages namespace {namespace}, pod is not gated")
}

/// A term only satisfiable next to pods labeled to ignore the pause.
fn pause_affinity_term() -> Value {
    json!({
        "labelSelector": {
            "matchExpressions": [{
                "key": IGNORE_PAUSE_LABEL,
                "operator": "In",
                "values": ["true"],
            }],
        },
        "topologyKey": PAUSE_TOPOLOGY_KEY,
    })
}
