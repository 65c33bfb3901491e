use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use http::{Request, Response};
use hyper::Body;
pub use kube::{
    runtime::{controller::Action, events::Reporter},
    Client, Resource,
};
use prometheus::Registry;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{crd::phase::Progress, fixture::reconciler::ApiServerVerifier, metrics::Metrics};

use super::error::{Error, ErrorClass};

const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(10);
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

pub trait Ctx {
    fn metrics(&self) -> &Metrics;
    fn client(&self) -> &Client;
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    // Kubernetes client
    pub client: Client,
    // Resync interval in seconds
    pub interval: u64,
    // Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    // Prometheus metrics
    pub metrics: Metrics,
}

impl Ctx for Context {
    fn client(&self) -> &Client {
        &self.client
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

pub struct ContextWith<T: Clone> {
    pub(crate) inner: Context,
    pub component: T,
}

impl<T: Clone> Ctx for ContextWith<T> {
    fn client(&self) -> &Client {
        &self.inner.client
    }

    fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}

impl<T: Clone> ContextWith<T> {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.inner.interval)
    }

    pub async fn touch(&self) {
        self.inner.diagnostics.write().await.last_event = Utc::now();
    }
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub registry: prometheus::Registry,
}

impl State {
    pub fn new(component: &str) -> State {
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(component.to_string()))),
            registry: prometheus::Registry::default(),
        }
    }
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client, interval: u64, metrics: Metrics) -> Arc<Context> {
        Arc::new(Context {
            client,
            interval,
            metrics,
            diagnostics: self.diagnostics.clone(),
        })
    }

    pub fn to_context_with<T: Clone>(
        &self,
        client: Client,
        interval: u64,
        component: T,
        metrics: Metrics,
    ) -> Arc<ContextWith<T>> {
        Arc::new(ContextWith {
            inner: Context {
                client,
                interval,
                diagnostics: self.diagnostics.clone(),
                metrics,
            },
            component,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    pub fn new(component: String) -> Self {
        Self {
            last_event: Utc::now(),
            reporter: component.into(),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "klbrd".into(),
        }
    }
}

/// Requeue after a fixed delay, regardless of the resource state.
#[tracing::instrument(skip_all)]
pub fn error_policy<T: Resource<DynamicType = ()>, C: Ctx>(
    resource: Arc<T>,
    error: &Error,
    ctx: Arc<C>,
) -> Action {
    tracing::warn!("reconcile failed: {:?}", error);
    ctx.metrics().reconcile_failure(resource.as_ref(), error);
    action_for(error, 0)
}

/// Requeue with an exponential backoff derived from the persisted attempt counter.
#[tracing::instrument(skip_all)]
pub fn error_policy_with_backoff<T: Resource<DynamicType = ()> + Progress, C: Ctx>(
    resource: Arc<T>,
    error: &Error,
    ctx: Arc<C>,
) -> Action {
    tracing::warn!(
        failed_attempts = resource.failed_attempts(),
        "reconcile failed: {:?}",
        error
    );
    ctx.metrics().reconcile_failure(resource.as_ref(), error);
    action_for(error, resource.failed_attempts())
}

pub(crate) fn action_for(error: &Error, failed_attempts: i32) -> Action {
    match error.class() {
        ErrorClass::Validation => Action::await_change(),
        ErrorClass::Conflict => Action::requeue(CONFLICT_REQUEUE),
        ErrorClass::TransientInfra => Action::requeue(backoff(failed_attempts)),
        ErrorClass::NotFound | ErrorClass::Internal => Action::requeue(DEFAULT_ERROR_REQUEUE),
    }
}

pub(crate) fn backoff(failed_attempts: i32) -> Duration {
    let exp = failed_attempts.clamp(0, 16) as u32;
    DEFAULT_ERROR_REQUEUE
        .saturating_mul(2u32.saturating_pow(exp))
        .min(MAX_BACKOFF)
}

impl Context {
    pub fn test() -> (Arc<Self>, ApiServerVerifier, Registry) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let registry = Registry::default();
        let ctx = Self {
            client: mock_client,
            metrics: test_metrics(&registry),
            diagnostics: Arc::default(),
            interval: 30,
        };
        (Arc::new(ctx), ApiServerVerifier(handle), registry)
    }
}

impl<T: Clone> ContextWith<T> {
    pub fn test(component: T) -> (Arc<Self>, ApiServerVerifier, Registry) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let registry = Registry::default();
        let ctx = Context {
            client: mock_client,
            metrics: test_metrics(&registry),
            diagnostics: Arc::default(),
            interval: 30,
        };
        let ctx_with = Self {
            inner: ctx,
            component,
        };
        (Arc::new(ctx_with), ApiServerVerifier(handle), registry)
    }
}

fn test_metrics(registry: &Registry) -> Metrics {
    Metrics::new().and_then(|m| m.register(registry)).unwrap()
}
