use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ai_reply_module::{
    GeneratedReply, GeneratorConfig, HttpReplyGenerator, ReplyError, ReplyGenerator, ReplyRequest,
};
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio::task;
use tracing::{info, warn};

use crate::adapters::AdapterRegistry;
use crate::collaborators::Collaborators;
use crate::config::{AiConfig, RouterConfig};
use crate::dispatcher::{Dispatcher, DispatcherControl};
use crate::ingest::IngestService;
use crate::pipeline::Pipeline;
use crate::store::Database;
use crate::sweeps::{start_sweeps, SweepControl, Sweeper};

use super::handlers::{health, ingest_webhook, verify_webhook};
use super::state::GatewayState;
use super::BoxError;

/// Stands in for the generation service when none is configured; every
/// reply degrades to the fallback text and escalates.
#[derive(Debug, Default)]
pub struct UnavailableGenerator;

impl ReplyGenerator for UnavailableGenerator {
    fn generate(&self, _request: &ReplyRequest) -> Result<GeneratedReply, ReplyError> {
        Err(ReplyError::Config("AI service not configured".to_string()))
    }
}

/// Background threads behind the gateway.
pub struct RuntimeControl {
    dispatcher: DispatcherControl,
    sweeps: Option<SweepControl>,
    pipeline: Arc<Pipeline>,
}

impl RuntimeControl {
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn stop_and_join(&mut self) {
        if let Some(sweeps) = self.sweeps.as_mut() {
            sweeps.stop_and_join();
        }
        self.dispatcher.stop_and_join();
    }
}

/// Wires adapters, pipeline, dispatcher and (optionally) sweeps over one database.
pub fn start_runtime(
    config: Arc<RouterConfig>,
    db: Database,
    generator: Arc<dyn ReplyGenerator>,
    collaborators: Collaborators,
    run_sweeps: bool,
) -> (GatewayState, RuntimeControl) {
    let registry = AdapterRegistry::from_config(&config);
    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        config.clone(),
        registry.clone(),
        generator,
        collaborators,
    ));
    let (dispatcher, dispatcher_control) = Dispatcher::start(&config.dispatch, pipeline.clone());
    let sweeps = run_sweeps.then(|| {
        let sweeper = Sweeper::new(db.clone(), pipeline.engine().clone());
        start_sweeps(
            sweeper,
            Duration::from_secs(config.escalation.sweep_interval_secs.max(1)),
        )
    });
    info!(
        "router runtime started platforms={:?} workers={}",
        registry.platforms(),
        dispatcher.worker_count()
    );

    let ingest = IngestService::new(db, config, registry, dispatcher);
    let control = RuntimeControl {
        dispatcher: dispatcher_control,
        sweeps,
        pipeline,
    };
    (GatewayState::new(ingest), control)
}

pub fn build_router(state: GatewayState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/webhooks/:platform", get(verify_webhook).post(ingest_webhook))
        .with_state(Arc::new(state))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}

pub async fn run_server(
    config: RouterConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    for platform in config.tolerant_channels() {
        warn!(
            "channel {} accepts unsigned webhooks (allow_unsigned = true, no secret configured)",
            platform
        );
    }
    let config = Arc::new(config);

    let db_path = config.storage.db_path.clone();
    let ai = config.ai.clone();
    let ai_timeout = config.ai_timeout();
    let (db, generator) = task::spawn_blocking(move || -> Result<_, BoxError> {
        let db = Database::open(db_path)?;
        let generator = build_generator(&ai, ai_timeout)?;
        Ok((db, generator))
    })
    .await
    .map_err(|err| -> BoxError { err.into() })??;
    info!("router database ready path={}", db.path().display());

    let (state, control) =
        start_runtime(config.clone(), db, generator, Collaborators::default(), true);

    let host: IpAddr = config
        .server
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);
    let app = build_router(state, config.server.max_body_bytes);
    info!("inbound gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    // Joining worker threads (and dropping the blocking HTTP client) must
    // happen off the async runtime.
    task::spawn_blocking(move || {
        let mut control = control;
        control.stop_and_join();
    })
    .await
    .map_err(|err| -> BoxError { err.into() })?;
    serve_result?;
    info!("inbound gateway stopped");
    Ok(())
}

fn build_generator(ai: &AiConfig, timeout: Duration) -> Result<Arc<dyn ReplyGenerator>, BoxError> {
    let Some(endpoint) = ai
        .service_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    else {
        warn!("AI_SERVICE_URL not set; all replies will use the fallback text");
        return Ok(Arc::new(UnavailableGenerator));
    };
    let generator = HttpReplyGenerator::new(GeneratorConfig {
        endpoint: endpoint.to_string(),
        api_key: ai.api_key.clone(),
        model: ai.model.clone(),
        timeout,
    })?;
    Ok(Arc::new(generator))
}
