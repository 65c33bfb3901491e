use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use klbrd_trace::telemetry::get_trace_id;
use kube::{
    api::ListParams,
    runtime::{
        controller::Action,
        finalizer::{self, finalizer, Event},
        watcher::Config,
        Controller,
    },
    Api, Client, ResourceExt,
};

use crate::{
    controller::{
        context::{error_policy_with_backoff, ContextWith, Ctx, State},
        error::Error,
    },
    crd::{
        backup::{KuberlogicServiceBackup, KUBERLOGIC_SERVICE_BACKUP_FINALIZER},
        phase::{Phase, Progress},
        service::KuberLogicService,
        velero::{Backup, DeleteBackupRequest},
    },
    metrics::Metrics,
};

use super::{
    controller_of, panic_message,
    status::persist_backup_status,
    tracker::{self, Operation},
    Component,
};

pub const TOO_MANY_FAILURES: &str = "too many failures";

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    klb: Arc<KuberlogicServiceBackup>,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    tracing::Span::current().record("trace_id", &tracing::field::display(&get_trace_id()));
    let _measure = ctx.metrics().count_and_measure(klb.as_ref());
    ctx.touch().await;

    let name = klb.name_any();
    let _guard = ctx
        .component
        .locks
        .acquire(&format!("kuberlogicservicebackup/{name}"))
        .await;

    match AssertUnwindSafe(reconcile(&name, ctx.clone()))
        .catch_unwind()
        .await
    {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic_message(&panic);
            tracing::error!(name, msg, "reconcile panicked");
            Err(Error::Panicked(msg))
        }
    }
}

#[tracing::instrument(skip(ctx))]
async fn reconcile(name: &str, ctx: Arc<ContextWith<Component>>) -> Result<Action, Error> {
    let backups = Api::<KuberlogicServiceBackup>::all(ctx.client().clone());
    let services = Api::<KuberLogicService>::all(ctx.client().clone());

    let Some(klb) = backups.get_opt(name).await.map_err(Error::Kube)? else {
        tracing::debug!(name, "KuberlogicServiceBackup is already gone");
        return Ok(Action::await_change());
    };

    finalizer(
        &backups,
        KUBERLOGIC_SERVICE_BACKUP_FINALIZER,
        Arc::new(klb),
        |event| async {
            match event {
                Event::Apply(klb) => apply(&backups, &services, &klb, ctx.clone()).await,
                Event::Cleanup(klb) => cleanup(&services, &klb, ctx.clone()).await,
            }
        },
    )
    .await
    .map_err(|e| match e {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        e => Error::Finalizer(Box::new(e)),
    })
}

async fn apply(
    backups: &Api<KuberlogicServiceBackup>,
    services: &Api<KuberLogicService>,
    klb: &KuberlogicServiceBackup,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let component = &ctx.component;
    let name = klb.name_any();
    let name = name.as_str();
    let workload = klb.spec.kuberlogic_service_name.clone();

    if klb.phase().is_terminal() {
        let Some(kls) = tracker::release(services, &workload, Operation::Backup, name).await?
        else {
            return Ok(Action::await_change());
        };
        component.provider.after_backup(&kls, klb).await?;
        return Ok(Action::await_change());
    }

    let kls = match tracker::claim(services, &workload, Operation::Backup, name).await? {
        Ok(kls) => kls,
        Err(blocker) => {
            tracing::info!(name, workload, %blocker, "workload is busy, retry later");
            return Ok(Action::requeue(component.config.exclusion_requeue()));
        }
    };

    let mut desired = klb.clone();
    component
        .provider
        .set_kuberlogic_backup_status(&mut desired)
        .await?;
    tracing::info!(name, phase = %desired.phase(), "synced backup status");

    if desired.failed_attempts() >= component.config.max_failed_attempts {
        tracing::warn!(name, failed_attempts = desired.failed_attempts(), "give up backup");
        desired
            .status_mut()
            .set_phase(Phase::Failed, Some(TOO_MANY_FAILURES.to_string()));
        persist(backups, klb, &desired, ctx.metrics()).await?;
        tracker::release(services, &workload, Operation::Backup, name).await?;
        return Ok(Action::await_change());
    }

    if desired.phase().is_terminal() {
        persist(backups, klb, &desired, ctx.metrics()).await?;
        tracker::release(services, &workload, Operation::Backup, name).await?;
        component.provider.after_backup(&kls, &desired).await?;
        return Ok(Action::await_change());
    }

    if desired.phase().eq(&Phase::Pending) {
        if let Err(e) = component.provider.backup_request(&kls, &mut desired).await {
            tracing::error!(name, error=?e, "failed to request backup");
            let status = desired.status_mut();
            status.failed_attempts += 1;
            status.reason = Some(e.to_string());
            persist(backups, klb, &desired, ctx.metrics()).await?;
            return Err(e);
        }
        desired.status_mut().set_phase(Phase::Requested, None);
    }

    persist(backups, klb, &desired, ctx.metrics()).await?;
    Ok(Action::requeue(ctx.interval()))
}

/// Delete the provider side backup once the workload is released.
/// The finalizer stays until the provider confirmed the deletion.
#[tracing::instrument(skip_all)]
async fn cleanup(
    services: &Api<KuberLogicService>,
    klb: &KuberlogicServiceBackup,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let name = klb.name_any();
    let workload = &klb.spec.kuberlogic_service_name;
    tracing::info!(name, "clean up KuberlogicServiceBackup");

    let released = tracker::release(services, workload, Operation::Backup, &name).await?;
    if let Some(kls) = released {
        if !klb.phase().is_terminal() {
            tracing::info!(name, workload, phase = %klb.phase(), "undo unfinished backup");
            ctx.component.provider.after_backup(&kls, klb).await?;
        }
    }
    ctx.component.provider.backup_delete_request(klb).await?;

    Ok(Action::await_change())
}

async fn persist(
    api: &Api<KuberlogicServiceBackup>,
    current: &KuberlogicServiceBackup,
    desired: &KuberlogicServiceBackup,
    metrics: &Metrics,
) -> Result<(), Error> {
    let updated = persist_backup_status(api, desired).await?;
    if updated.phase().ne(&current.phase()) {
        tracing::info!(
            name = updated.name_any(),
            from = %current.phase(),
            to = %updated.phase(),
            "backup phase changed"
        );
        metrics.phase_transition::<KuberlogicServiceBackup>(updated.phase());
    }
    metrics.failed_attempts_set(&updated, updated.failed_attempts() as i64);
    Ok(())
}

pub async fn run(
    state: State,
    client: Client,
    interval: u64,
    component: Component,
    metrics: Metrics,
) -> Result<(), Error> {
    let backups = Api::<KuberlogicServiceBackup>::all(client.clone());
    if let Err(e) = backups.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(Error::Kube(e));
    }

    let velero_namespace = component.config.velero_namespace.clone();

    tracing::info!("Start KuberlogicServiceBackup reconciler");

    Controller::new(backups, Config::default().any_semantic())
        .watches(
            Api::<Backup>::namespaced(client.clone(), &velero_namespace),
            Config::default(),
            controller_of::<KuberlogicServiceBackup, Backup>,
        )
        .watches(
            Api::<DeleteBackupRequest>::namespaced(client.clone(), &velero_namespace),
            Config::default(),
            controller_of::<KuberlogicServiceBackup, DeleteBackupRequest>,
        )
        .watches(
            Api::<Pod>::all(client.clone()),
            Config::default(),
            controller_of::<KuberlogicServiceBackup, Pod>,
        )
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy_with_backoff::<KuberlogicServiceBackup, ContextWith<Component>>,
            state.to_context_with(client, interval, component, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
