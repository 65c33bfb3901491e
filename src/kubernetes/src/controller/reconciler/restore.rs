use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use klbrd_trace::telemetry::get_trace_id;
use kube::{
    api::ListParams,
    runtime::{controller::Action, watcher::Config, Controller},
    Api, Client, ResourceExt,
};

use crate::{
    controller::{
        context::{error_policy_with_backoff, ContextWith, Ctx, State},
        error::Error,
    },
    crd::{
        backup::KuberlogicServiceBackup,
        phase::{Phase, Progress},
        restore::KuberlogicServiceRestore,
        service::KuberLogicService,
        velero::Restore,
    },
    metrics::Metrics,
    util::is_deleting,
};

use super::{
    backup::TOO_MANY_FAILURES,
    controller_of, panic_message,
    status::persist_restore_status,
    tracker::{self, Operation},
    Component,
};

pub const DEADLINE_EXCEEDED: &str = "restore has not been successful for too long";

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    klr: Arc<KuberlogicServiceRestore>,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    tracing::Span::current().record("trace_id", &tracing::field::display(&get_trace_id()));
    let _measure = ctx.metrics().count_and_measure(klr.as_ref());
    ctx.touch().await;

    let name = klr.name_any();
    let _guard = ctx
        .component
        .locks
        .acquire(&format!("kuberlogicservicerestore/{name}"))
        .await;

    match AssertUnwindSafe(reconcile(&klr, ctx.clone()))
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

/// `last_seen` is the object as the watcher saw it, used when the restore is already gone.
#[tracing::instrument(skip_all)]
async fn reconcile(
    last_seen: &KuberlogicServiceRestore,
    ctx: Arc<ContextWith<Component>>,
) -> Result<Action, Error> {
    let restores = Api::<KuberlogicServiceRestore>::all(ctx.client().clone());
    let backups = Api::<KuberlogicServiceBackup>::all(ctx.client().clone());
    let services = Api::<KuberLogicService>::all(ctx.client().clone());
    let component = &ctx.component;
    let name = last_seen.name_any();
    let name = name.as_str();

    let klr = match restores.get_opt(name).await.map_err(Error::Kube)? {
        Some(klr) if !is_deleting(&klr) => klr,
        Some(klr) => {
            cleanup(&services, &klr, ctx.clone()).await?;
            return Ok(Action::await_change());
        }
        None => {
            cleanup(&services, last_seen, ctx.clone()).await?;
            return Ok(Action::await_change());
        }
    };

    let backup_name = klr.spec.kuberlogic_service_backup.clone();
    let Some(klb) = backups.get_opt(&backup_name).await.map_err(Error::Kube)? else {
        if klr.phase().is_terminal() {
            cleanup(&services, &klr, ctx.clone()).await?;
            return Ok(Action::await_change());
        }
        tracing::warn!(name, backup = backup_name, "source backup is not found");
        return Err(Error::BackupNotFound(backup_name));
    };
    let workload = klb.spec.kuberlogic_service_name.clone();

    if klr.phase().is_terminal() {
        let Some(kls) = tracker::release(&services, &workload, Operation::Restore, name).await?
        else {
            return Ok(Action::await_change());
        };
        component.provider.after_restore(&kls, &klr).await?;
        return Ok(Action::await_change());
    }

    if klb.phase().ne(&Phase::Successful) {
        tracing::warn!(name, backup = backup_name, phase = %klb.phase(), "source backup is not successful");
        return Err(Error::BackupNotSuccessful(backup_name));
    }

    let kls = match tracker::claim(&services, &workload, Operation::Restore, name).await? {
        Ok(kls) => kls,
        Err(blocker) => {
            tracing::info!(name, workload, %blocker, "workload is busy, retry later");
            return Ok(Action::requeue(component.config.exclusion_requeue()));
        }
    };

    let mut desired = klr.clone();
    component
        .provider
        .set_kuberlogic_restore_status(&mut desired)
        .await?;
    tracing::info!(name, phase = %desired.phase(), "synced restore status");

    let give_up = if desired.failed_attempts() >= component.config.max_failed_attempts {
        Some(TOO_MANY_FAILURES)
    } else if !desired.phase().is_terminal()
        && deadline_exceeded(&desired, Utc::now(), component.config.restore_deadline())
    {
        Some(DEADLINE_EXCEEDED)
    } else {
        None
    };
    if let Some(reason) = give_up {
        tracing::warn!(name, failed_attempts = desired.failed_attempts(), reason, "give up restore");
        desired
            .status_mut()
            .set_phase(Phase::Failed, Some(reason.to_string()));
        persist(&restores, &klr, &desired, ctx.metrics()).await?;
        tracker::release(&services, &workload, Operation::Restore, name).await?;
        return Ok(Action::await_change());
    }

    if desired.phase().is_terminal() {
        persist(&restores, &klr, &desired, ctx.metrics()).await?;
        tracker::release(&services, &workload, Operation::Restore, name).await?;
        component.provider.after_restore(&kls, &desired).await?;
        return Ok(Action::await_change());
    }

    if desired.phase().eq(&Phase::Pending) {
        if let Err(e) = component
            .provider
            .restore_request(&kls, &klb, &mut desired)
            .await
        {
            tracing::error!(name, error=?e, "failed to request restore");
            let status = desired.status_mut();
            status.failed_attempts += 1;
            status.reason = Some(e.to_string());
            persist(&restores, &klr, &desired, ctx.metrics()).await?;
            return Err(e);
        }
        desired.status_mut().set_phase(Phase::Requested, None);
    }

    persist(&restores, &klr, &desired, ctx.metrics()).await?;
    Ok(Action::requeue(ctx.interval()))
}

/// Release every workload still pointing to `klr` and undo what the restore left behind there.
#[tracing::instrument(skip_all, fields(restore = klr.name_any()))]
async fn cleanup(
    services: &Api<KuberLogicService>,
    klr: &KuberlogicServiceRestore,
    ctx: Arc<ContextWith<Component>>,
) -> Result<(), Error> {
    let name = klr.name_any();
    let workloads = services
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;
    for kls in workloads
        .items
        .iter()
        .filter(|kls| kls.active_restore().eq(&Some(name.as_str())))
    {
        tracing::info!(name, workload = kls.name_any(), "release workload of restore");
        let released =
            tracker::release(services, &kls.name_any(), Operation::Restore, &name).await?;
        if let Some(released) = released {
            ctx.component.provider.after_restore(&released, klr).await?;
        }
    }
    Ok(())
}

/// Whether `restore` stayed unsuccessful for longer than `deadline` since its creation.
pub fn deadline_exceeded(
    restore: &KuberlogicServiceRestore,
    now: DateTime<Utc>,
    deadline: Duration,
) -> bool {
    if restore.phase().eq(&Phase::Successful) {
        return false;
    }
    let (Some(created), Ok(deadline)) = (
        restore.metadata.creation_timestamp.as_ref(),
        chrono::Duration::from_std(deadline),
    ) else {
        return false;
    };
    now.signed_duration_since(created.0) > deadline
}

async fn persist(
    api: &Api<KuberlogicServiceRestore>,
    current: &KuberlogicServiceRestore,
    desired: &KuberlogicServiceRestore,
    metrics: &Metrics,
) -> Result<(), Error> {
    let updated = persist_restore_status(api, desired).await?;
    if updated.phase().ne(&current.phase()) {
        tracing::info!(
            name = updated.name_any(),
            from = %current.phase(),
            to = %updated.phase(),
            "restore phase changed"
        );
        metrics.phase_transition::<KuberlogicServiceRestore>(updated.phase());
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
    let restores = Api::<KuberlogicServiceRestore>::all(client.clone());
    if let Err(e) = restores.list(&ListParams::default().limit(1)).await {
        tracing::error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        tracing::info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(Error::Kube(e));
    }

    let velero_namespace = component.config.velero_namespace.clone();

    tracing::info!("Start KuberlogicServiceRestore reconciler");

    Controller::new(restores, Config::default().any_semantic())
        .watches(
            Api::<Restore>::namespaced(client.clone(), &velero_namespace),
            Config::default(),
            controller_of::<KuberlogicServiceRestore, Restore>,
        )
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy_with_backoff::<KuberlogicServiceRestore, ContextWith<Component>>,
            state.to_context_with(client, interval, component, metrics),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::runtime::controller::Action;
    use rstest::rstest;

    use crate::{
        controller::{config::BackupConfig, context::ContextWith, error::Error, reconciler::Component},
        crd::{
            phase::{Phase, Progress},
            restore::KuberlogicServiceRestore,
        },
        fixture::reconciler::{
            test_kls, test_klb_with_phase, test_klr, timeout_after_1s, ApiServerVerifier,
            FakeProvider,
        },
    };

    use super::*;

    fn context(provider: Arc<FakeProvider>) -> (Arc<ContextWith<Component>>, ApiServerVerifier) {
        let (ctx, fakeserver, _) =
            ContextWith::test(Component::new(provider, BackupConfig::default()));
        (ctx, fakeserver)
    }

    fn restore_created_ago(hours: i64, phase: Phase) -> KuberlogicServiceRestore {
        let mut klr = test_klr();
        klr.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::hours(hours)));
        klr.status_mut().phase = phase;
        klr
    }

    #[rstest(
        klr,
        expected,
        case(restore_created_ago(0, Phase::Requested), false),
        case(restore_created_ago(2, Phase::Requested), true),
        case(restore_created_ago(2, Phase::Successful), false),
        case(test_klr(), false)
    )]
    fn works_deadline_exceeded(klr: KuberlogicServiceRestore, expected: bool) {
        assert_eq!(
            expected,
            deadline_exceeded(&klr, Utc::now(), Duration::from_secs(60 * 60))
        );
    }

    #[tokio::test]
    async fn source_backup_must_be_successful() {
        let provider = Arc::new(FakeProvider::default());
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = test_klr();

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Requested))
                    .await;
            })
        };

        let res = reconciler(Arc::new(klr), ctx).await;
        assert!(matches!(res, Err(Error::BackupNotSuccessful(name)) if name == "b1"));
        assert!(provider.calls().is_empty());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn source_backup_must_exist() {
        let provider = Arc::new(FakeProvider::default());
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = test_klr();

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get_not_found(&test_klb_with_phase(Phase::Successful))
                    .await;
            })
        };

        let res = reconciler(Arc::new(klr), ctx).await;
        assert!(matches!(res, Err(Error::BackupNotFound(name)) if name == "b1"));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn pending_restore_is_requested() {
        let provider = Arc::new(FakeProvider::with_phase(Phase::Pending));
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = test_klr();

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;

                let kls = test_kls("demo", "", "");
                fakeserver.handle_get(&kls).await;
                let claimed = fakeserver.handle_status_update(&kls).await;
                assert_eq!(Some("r1"), claimed.active_restore());

                fakeserver.handle_get(&klr).await;
                let updated = fakeserver.handle_status_update(&klr).await;
                let status = updated.status.unwrap();
                assert_eq!(Phase::Requested, status.phase);
                assert_eq!(Some("r1".to_string()), status.restore_reference);
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::requeue(Duration::from_secs(30)), action);
        assert_eq!(
            vec!["set_kuberlogic_restore_status", "restore_request"],
            provider.calls()
        );
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn active_backup_blocks_restore() {
        let provider = Arc::new(FakeProvider::default());
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = test_klr();

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;
                fakeserver.handle_get(&test_kls("demo", "b2", "")).await;
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::requeue(Duration::from_secs(30)), action);
        assert!(provider.calls().is_empty());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn stale_restore_is_failed() {
        let provider = Arc::new(FakeProvider::with_phase(Phase::Requested));
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = restore_created_ago(2, Phase::Requested);

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;
                let kls = test_kls("demo", "", "r1");
                fakeserver.handle_get(&kls).await;

                fakeserver.handle_get(&klr).await;
                let updated = fakeserver.handle_status_update(&klr).await;
                let status = updated.status.unwrap();
                assert_eq!(Phase::Failed, status.phase);
                assert_eq!(Some(DEADLINE_EXCEEDED.to_string()), status.reason);

                fakeserver.handle_get(&kls).await;
                let released = fakeserver.handle_status_update(&kls).await;
                assert_eq!(None, released.active_restore());
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn failed_request_counts_attempt() {
        let provider = Arc::new(FakeProvider::failing());
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = test_klr();

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;
                let kls = test_kls("demo", "", "r1");
                fakeserver.handle_get(&kls).await;

                fakeserver.handle_get(&klr).await;
                let updated = fakeserver.handle_status_update(&klr).await;
                assert_eq!(1, updated.failed_attempts());
            })
        };

        let res = reconciler(Arc::new(klr), ctx).await;
        assert!(matches!(res, Err(Error::StorageUnavailable(_))));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn successful_restore_cleans_up() {
        let provider = Arc::new(FakeProvider::with_phase(Phase::Successful));
        let (ctx, mut fakeserver) = context(provider.clone());
        let mut klr = test_klr();
        klr.status_mut().phase = Phase::Requested;

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;
                let kls = test_kls("demo", "", "r1");
                fakeserver.handle_get(&kls).await;

                fakeserver.handle_get(&klr).await;
                let updated = fakeserver.handle_status_update(&klr).await;
                assert_eq!(Phase::Successful, updated.phase());

                fakeserver.handle_get(&kls).await;
                fakeserver.handle_status_update(&kls).await;
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        assert_eq!(
            vec!["set_kuberlogic_restore_status", "after_restore"],
            provider.calls()
        );
        timeout_after_1s(mocksvr).await;
    }

    fn workload_list(items: Vec<KuberLogicService>) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": "kuberlogic.com/v1alpha1",
            "kind": "KuberLogicServiceList",
            "metadata": {},
            "items": items,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn removed_restore_releases_workload() {
        let provider = Arc::new(FakeProvider::default());
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = test_klr();

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get_not_found(&klr).await;

                let kls = test_kls("demo", "", "r1");
                let other = {
                    let mut other = test_kls("other", "", "r0");
                    other.metadata.name = Some("other".to_string());
                    other
                };
                fakeserver
                    .handle_list(&kls, workload_list(vec![kls.clone(), other]))
                    .await;

                fakeserver.handle_get(&kls).await;
                let released = fakeserver.handle_status_update(&kls).await;
                assert_eq!(None, released.active_restore());
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        assert_eq!(vec!["after_restore"], provider.calls());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn deleting_unfinished_restore_undoes_it() {
        let provider = Arc::new(FakeProvider::default());
        let (ctx, mut fakeserver) = context(provider.clone());
        let mut klr = restore_created_ago(0, Phase::Requested);
        klr.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;

                let kls = test_kls("demo", "", "r1");
                fakeserver
                    .handle_list(&kls, workload_list(vec![kls.clone()]))
                    .await;
                fakeserver.handle_get(&kls).await;
                let released = fakeserver.handle_status_update(&kls).await;
                assert!(!released.is_gated());
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        assert_eq!(vec!["after_restore"], provider.calls());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn terminal_restore_without_backup_releases_workload() {
        let provider = Arc::new(FakeProvider::default());
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = restore_created_ago(0, Phase::Failed);

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get_not_found(&test_klb_with_phase(Phase::Successful))
                    .await;

                let kls = test_kls("demo", "", "r1");
                fakeserver
                    .handle_list(&kls, workload_list(vec![kls.clone()]))
                    .await;
                fakeserver.handle_get(&kls).await;
                let released = fakeserver.handle_status_update(&kls).await;
                assert_eq!(None, released.active_restore());
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        assert_eq!(vec!["after_restore"], provider.calls());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_even_if_provider_succeeds() {
        let provider = Arc::new(FakeProvider::with_phase(Phase::Successful));
        let (ctx, mut fakeserver) = context(provider.clone());
        let mut klr = restore_created_ago(0, Phase::Requested);
        klr.status_mut().failed_attempts = 10;

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;
                let kls = test_kls("demo", "", "r1");
                fakeserver.handle_get(&kls).await;

                fakeserver.handle_get(&klr).await;
                let updated = fakeserver.handle_status_update(&klr).await;
                let status = updated.status.unwrap();
                assert_eq!(Phase::Failed, status.phase);
                assert_eq!(Some(TOO_MANY_FAILURES.to_string()), status.reason);
                assert_eq!(10, status.failed_attempts);

                fakeserver.handle_get(&kls).await;
                let released = fakeserver.handle_status_update(&kls).await;
                assert_eq!(None, released.active_restore());
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        assert_eq!(vec!["set_kuberlogic_restore_status"], provider.calls());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn provider_failure_of_stale_restore_is_kept() {
        let provider = Arc::new(FakeProvider::with_phase(Phase::Failed));
        let (ctx, mut fakeserver) = context(provider.clone());
        let klr = restore_created_ago(2, Phase::Requested);

        let mocksvr = {
            let klr = klr.clone();
            tokio::spawn(async move {
                fakeserver.handle_get(&klr).await;
                fakeserver
                    .handle_get(&test_klb_with_phase(Phase::Successful))
                    .await;
                let kls = test_kls("demo", "", "r1");
                fakeserver.handle_get(&kls).await;

                fakeserver.handle_get(&klr).await;
                let updated = fakeserver.handle_status_update(&klr).await;
                let status = updated.status.unwrap();
                assert_eq!(Phase::Failed, status.phase);
                assert_ne!(Some(DEADLINE_EXCEEDED.to_string()), status.reason);

                fakeserver.handle_get(&kls).await;
                fakeserver.handle_status_update(&kls).await;
            })
        };

        let action = reconciler(Arc::new(klr), ctx).await.unwrap();
        assert_eq!(Action::await_change(), action);
        assert_eq!(
            vec!["set_kuberlogic_restore_status", "after_restore"],
            provider.calls()
        );
        timeout_after_1s(mocksvr).await;
    }
}
