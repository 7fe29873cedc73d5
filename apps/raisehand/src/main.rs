use std::sync::Arc;

use anyhow::Context;
use change_feed::LocalFeed;
use raisehand::config::{Backend, EngineConfig};
use raisehand::engine::{EngineView, SyncEngine};
use raisehand::metrics;
use raisehand::poller;
use raisehand::telemetry::init_tracing;
use remote_state::{HttpRemote, InMemoryRemote, RemoteStateSource, Visibility};
use tracing::{debug, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = EngineConfig::from_env();
    init_tracing(&cfg.log_filter);

    let remote: Arc<dyn RemoteStateSource> = match cfg.backend {
        Backend::Http => {
            let url = cfg
                .remote_url
                .clone()
                .context("RAISEHAND_REMOTE_URL is required for the http backend")?;
            Arc::new(HttpRemote::new(url))
        }
        Backend::Memory => {
            let memory = InMemoryRemote::with_feed(Arc::new(LocalFeed::new()));
            if let Some(code) = &cfg.event_code {
                let code = code.trim().to_uppercase();
                memory.seed_event(&code, &code, Visibility::Public).await;
            }
            memory
        }
    };

    let engine = SyncEngine::new(remote, cfg.settings());
    if let Some(user) = cfg.participant() {
        engine.set_user(user.context("invalid participant identity")?);
    }

    info!(
        backend = ?cfg.backend,
        remote = %cfg.remote_url.as_deref().unwrap_or("unset"),
        event_code = %cfg.event_code.as_deref().unwrap_or("unset"),
        role = ?cfg.role,
        poll_interval_ms = cfg.poll_interval_ms,
        close_threshold = cfg.close_threshold,
        settle_delay_ms = cfg.settle_delay_ms,
        "starting raisehand"
    );

    if let Some(code) = &cfg.event_code {
        match engine.join_event(code).await {
            Ok(event) => info!(event_code = %event.code, name = %event.name, "watching event"),
            Err(err) => warn!(event_code = %code, error = %err, "join failed"),
        }
    }

    let _poll = poller::spawn_poll_loop(engine.clone());
    let mut report = tokio::time::interval(engine.settings().poll_interval);
    let mut last: Option<EngineView> = None;
    loop {
        tokio::select! {
            _ = report.tick() => {
                let view = engine.view();
                if last.as_ref() != Some(&view) {
                    log_view(&view);
                    last = Some(view);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    engine.leave_event();
    debug!(
        metrics = %String::from_utf8_lossy(&metrics::gather()),
        "shutting down"
    );
    Ok(())
}

fn log_view(view: &EngineView) {
    let waiting: Vec<&str> = view
        .waiting
        .iter()
        .map(|queued| queued.entry.display_name.as_str())
        .collect();
    info!(
        session_active = view.is_session_active,
        waiting = ?waiting,
        answered = view.answered.len(),
        speaker = ?view.active_speaker_id,
        rank = ?view.current_user_rank,
        sealed_sessions = view.history.len(),
        "queue"
    );
}
