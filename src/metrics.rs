//! Process-wide Prometheus registry. No HTTP exporter is wired up here;
//! the embedding binary decides whether and how to expose [`gather_text`].

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static BATCHES_FLUSHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("etl_batches_flushed_total", "Batches flushed by component and outcome"),
        &["component", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static RECORDS_COMMITTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("etl_records_committed_total", "Records committed downstream by component"),
        &["component"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static DLQ_WRITES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("etl_dlq_writes_total", "Dead-letter writes by role and error kind"),
        &["role", "kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static COMPONENT_RESTARTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("etl_component_restarts_total", "Component restarts performed by the runner watcher"),
        &["component"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static DEDUP_HITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("etl_dedup_hits_total", "Duplicate records dropped by dedup path"),
        &["path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Forces registration of every metric. Call once at startup so `gather_text`
/// reports zero-valued series even before anything has happened.
pub fn init() {
    Lazy::force(&BATCHES_FLUSHED_TOTAL);
    Lazy::force(&RECORDS_COMMITTED_TOTAL);
    Lazy::force(&DLQ_WRITES_TOTAL);
    Lazy::force(&COMPONENT_RESTARTS_TOTAL);
    Lazy::force(&DEDUP_HITS_TOTAL);
}

pub fn inc_batch_flushed(component: &str, outcome: &str) {
    BATCHES_FLUSHED_TOTAL.with_label_values(&[component, outcome]).inc();
}

pub fn inc_records_committed(component: &str, n: u64) {
    RECORDS_COMMITTED_TOTAL.with_label_values(&[component]).inc_by(n);
}

pub fn inc_dlq_write(role: &str, kind: &str) {
    DLQ_WRITES_TOTAL.with_label_values(&[role, kind]).inc();
}

pub fn inc_component_restart(component: &str) {
    COMPONENT_RESTARTS_TOTAL.with_label_values(&[component]).inc();
}

/// `path` is either `"bus_header"` (Nats-Msg-Id dedup window) or `"kv_bucket"`
/// (processor-level have-I-seen-this-key check).
pub fn inc_dedup_hit(path: &str) {
    DEDUP_HITS_TOTAL.with_label_values(&[path]).inc();
}

/// Renders all registered metric families in the Prometheus text exposition
/// format, for an embedding binary to serve however it likes.
pub fn gather_text() -> String {
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let _ = encoder.encode(&families, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_reflects_recorded_metrics() {
        init();
        inc_batch_flushed("ingestor", "ok");
        inc_records_committed("sink", 7);
        inc_dlq_write("sink", "coerce_column");
        inc_component_restart("join");
        inc_dedup_hit("bus_header");

        let text = gather_text();
        assert!(text.contains("etl_batches_flushed_total"));
        assert!(text.contains(r#"component="ingestor""#));
        assert!(text.contains("etl_records_committed_total"));
        assert!(text.contains("etl_dlq_writes_total"));
        assert!(text.contains("etl_component_restarts_total"));
        assert!(text.contains("etl_dedup_hits_total"));
    }
}
