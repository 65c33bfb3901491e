use opentelemetry::trace::TraceId;
use rand::Rng;

///  Fetch an opentelemetry::trace::TraceId to correlate the logs of one reconcile
pub fn get_trace_id() -> TraceId {
    let mut rng = rand::thread_rng();
    let val: u128 = rng.gen();
    TraceId::from(val)
}
