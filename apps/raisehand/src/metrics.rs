use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("raisehand_polls_total", "snapshot polls by result"),
        &["result"],
    )
    .expect("poll counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PUSH_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "raisehand_push_changes_total",
            "push notifications by routing decision",
        ),
        &["kind"],
    )
    .expect("push counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("raisehand_commands_total", "engine commands by name and result"),
        &["command", "result"],
    )
    .expect("command counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ROLLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "raisehand_rollbacks_total",
            "optimistic updates undone after a failed write",
        ),
        &["command"],
    )
    .expect("rollback counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn command_result<T, E>(command: &str, result: &Result<T, E>) {
    let label = if result.is_ok() { "ok" } else { "error" };
    COMMANDS.with_label_values(&[command, label]).inc();
}

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
