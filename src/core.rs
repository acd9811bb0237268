use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::admin::{self, AdminState};
use crate::ai::analysis::Analyzer;
use crate::ai::tools::ToolExecutor;
use crate::config::AppConfig;
use crate::email::EmailService;
use crate::logbuf::LogBuffer;
use crate::notify::NotificationDispatcher;
use crate::push::{DisabledPush, FcmDispatcher, PushSender};
use crate::scheduler::Scheduler;
use crate::session::{SessionDeps, SessionRegistry};
use crate::sms::SmsService;
use crate::store::Store;

pub async fn run(config: AppConfig, log_buffer: LogBuffer) -> anyhow::Result<()> {
    let started_at = Instant::now();
    info!("Starting amparo v{}", env!("CARGO_PKG_VERSION"));

    // 1. Store
    let store = Arc::new(Store::connect(&config.database_url).await?);

    // 2. Push dispatcher. A missing provider keeps sessions alive but the
    // outbound-call scheduler stays down, exactly like losing the provider
    // at runtime would.
    let (push, push_ok): (Arc<dyn PushSender>, bool) =
        match FcmDispatcher::from_credentials_file(&config.push.credentials_path) {
            Ok(dispatcher) => (Arc::new(dispatcher), true),
            Err(e) => {
                warn!("Push provider unavailable: {}", e);
                (Arc::new(DisabledPush), false)
            }
        };

    // 3. Fallback channels (config-gated)
    let email = if config.fallback.email {
        match EmailService::new(&config.smtp) {
            Ok(service) => {
                info!("Email fallback enabled");
                Some(service)
            }
            Err(e) => {
                warn!("Email fallback not configured: {}", e);
                None
            }
        }
    } else {
        None
    };

    let sms = if config.fallback.sms || config.fallback.voice_call {
        match SmsService::new(&config.twilio) {
            Ok(service) => {
                info!("Telephony fallback enabled");
                Some(service)
            }
            Err(e) => {
                warn!("Telephony fallback not configured: {}", e);
                None
            }
        }
    } else {
        None
    };

    let notifier = Arc::new(NotificationDispatcher::new(
        push,
        email,
        sms,
        config.fallback.clone(),
    ));

    // 4. Tool executor + post-call analyzer
    let tools = Arc::new(ToolExecutor::new(
        store.clone(),
        notifier.clone(),
        config.scheduler.escalation_delay,
    ));
    let analyzer = Arc::new(Analyzer::new(&config.ai));

    // 5. Session registry
    let registry = Arc::new(SessionRegistry::new());

    // 6. Scheduler (needs a working push provider)
    if push_ok {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            notifier.clone(),
            registry.clone(),
            config.scheduler.clone(),
        ));
        scheduler.spawn();
    } else {
        warn!("Scheduler disabled: no push provider");
    }

    // 7. HTTP surface: admin endpoints + device WebSocket
    let router = admin::build_router(
        AdminState {
            store: store.clone(),
            registry: registry.clone(),
            logs: log_buffer,
            started_at,
            push_ok,
        },
        SessionDeps {
            store,
            registry,
            tools,
            analyzer,
            ai: config.ai.clone(),
        },
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    info!("Orderly shutdown complete");
    Ok(())
}
