use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static WORKER_SPAWNS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("worker_spawns_total", "Worker processes started"),
        &["instance"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WORKER_SPAWN_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("worker_spawn_failures_total", "Worker processes that failed to start"),
        &["instance"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WORKER_STOPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("worker_stops_total", "Worker processes stopped on request"),
        &["instance"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INSTANCE_RESETS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("instance_resets_total", "Credential resets performed"),
        &["instance"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RUNNING_INSTANCES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("running_instances", "Instances currently marked running").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn export_prometheus() -> String {
    // Touch the statics so every family is registered before the first scrape.
    Lazy::force(&WORKER_SPAWNS);
    Lazy::force(&WORKER_SPAWN_FAILURES);
    Lazy::force(&WORKER_STOPS);
    Lazy::force(&INSTANCE_RESETS);
    Lazy::force(&RUNNING_INSTANCES);

    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_includes_fleet_families() {
        WORKER_SPAWNS.with_label_values(&["metrics-test"]).inc();
        RUNNING_INSTANCES.set(1);
        let text = export_prometheus();
        assert!(text.contains("worker_spawns_total{instance=\"metrics-test\"} 1"));
        assert!(text.contains("running_instances"));
    }
}
