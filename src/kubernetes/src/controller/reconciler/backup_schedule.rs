use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::{
    batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec},
    core::v1::{Container, PodSpec, PodTemplateSpec},
};
use klbrd_trace::telemetry::get_trace_id;
use kube::{
    api::{ListParams, ObjectMeta, Patch, PatchParams},
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use serde_json::json;

use crate::{
    controller::{
        config::SchedulerConfig,
        context::{error_policy, ContextWith, Ctx, State},
        error::Error,
    },
    crd::{backup_schedule::KuberlogicServiceBackupSchedule, service::KuberLogicService},
    metrics::Metrics,
    util::{create_owner_reference, get_namespace},
};

pub const SCHEDULE_FIELD_MANAGER: &str = "klbrd-backup-schedule";
pub const SCHEDULE_CONTAINER: &str = "klb-create";
pub const SERVICE_ID_LABEL: &str = "kls-id";

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    klbs: Arc<KuberlogicServiceBackupSchedule>,
    ctx: Arc<ContextWith<SchedulerConfig>>,
) -> Result<Action, Error> {
    tracing::Span::current().record("trace_id", &tracing::field::display(&get_trace_id()));
    let _measure = ctx.metrics().count_and_measure(klbs.as_ref());
    ctx.touch().await;

    reconcile(&klbs, ctx.clone()).await
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    klbs: &KuberlogicServiceBackupSchedule,
    ctx: Arc<ContextWith<SchedulerConfig>>,
) -> Result<Action, Error> {
    let ns = get_namespace(klbs).map_err(Error::KubeLibrary)?;
    let workload = &klbs.spec.kuberlogic_service_name;

    let services = Api::<KuberLogicService>::all(ctx.client().clone());
    if services
        .get_opt(workload)
        .await
        .map_err(Error::Kube)?
        .is_none()
    {
        tracing::warn!(name = klbs.name_any(), namespace = ns, workload, "workload is not found");
        return Err(Error::WorkloadNotFound(workload.clone()));
    }

    let cron_jobs = Api::<CronJob>::namespaced(ctx.client().clone(), &ns);
    let cj = cron_job(klbs, &ctx.component);
    cron_jobs
        .patch(
            &klbs.name_any(),
            &PatchParams::apply(SCHEDULE_FIELD_MANAGER).force(),
            &Patch::Apply(&cj),
        )
        .await
        .map_err(Error::Kube)?;

    tracing::info!(
        name = klbs.name_any(),
        namespace = ns,
        schedule = klbs.spec.schedule,
        "applied backup cron job"
    );

    Ok(Action::requeue(ctx.interval()))
}

/// Build the CronJob creating a backup request of the scheduled workload.
pub fn cron_job(klbs: &KuberlogicServiceBackupSchedule, config: &SchedulerConfig) -> CronJob {
    let name = klbs.name_any();
    let workload = &klbs.spec.kuberlogic_service_name;
    let request = json!({
        "apiVersion": "kuberlogic.com/v1alpha1",
        "kind": "KuberlogicServiceBackup",
        "metadata": {
            "name": name,
            "labels": { SERVICE_ID_LABEL: workload },
        },
        "spec": { "kuberlogicServiceName": workload },
    });

    CronJob {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: klbs.namespace(),
            owner_references: Some(vec![create_owner_reference(klbs)]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: klbs.spec.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    backoff_limit: Some(2),
                    active_deadline_seconds: Some(15),
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            restart_policy: Some("OnFailure".to_string()),
                            service_account_name: Some(config.service_account.clone()),
                            containers: vec![Container {
                                name: SCHEDULE_CONTAINER.to_string(),
                                image: Some(config.image.clone()),
                                command: Some(vec!["/bin/sh".to_string()]),
                                args: Some(vec![
                                    "-c".to_string(),
                                    format!("echo '{request}' | kubectl apply -f -"),
                                ]),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub async fn run(
    state: State,
    client: Client,
    interval: u64,
    config: SchedulerConfig,
    metrics: Metrics,
) -> Result<(), Error> {
    let schedules = Api::<KuberlogicServiceBackupSchedule>::all(client.clone());
    if let Err(e) = schedules.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(Error::Kube(e));
    }

    tracing::info!("Start KuberlogicServiceBackupSchedule reconciler");

    Controller::new(schedules, Config::default().any_semantic())
        .owns(Api::<CronJob>::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<KuberlogicServiceBackupSchedule, ContextWith<SchedulerConfig>>,
            state.to_context_with(client, interval, config, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
