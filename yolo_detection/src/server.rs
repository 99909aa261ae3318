use crate::{
    config::Config,
    inference_service::InferenceService,
    model_service::ModelService,
    ort_service::OrtModelService,
    routes::{api_routes, track_http_metrics},
    state::{ServiceState, State},
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, middleware, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};

pub struct SharedState<M: ModelService, S: State> {
    pub inference_service: InferenceService<M, S>,
    pub metrics: Arc<Metrics>,
}

impl<M: ModelService, S: State> Clone for SharedState<M, S> {
    fn clone(&self) -> Self {
        Self {
            inference_service: self.inference_service.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Builds the HTTP router around an already loaded model.
pub fn create_router<M: ModelService, S: State>(
    inference_service: InferenceService<M, S>,
    metrics: Arc<Metrics>,
    max_upload_bytes: usize,
) -> Router {
    let metrics_layer = middleware::from_fn_with_state(metrics.clone(), track_http_metrics);

    let app_state = SharedState {
        inference_service,
        metrics,
    };

    api_routes()
        .route_layer(metrics_layer)
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService, S: State>(
        inference_service: InferenceService<M, S>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let metrics = Arc::new(Metrics::new()?);

        let router = create_router(inference_service, metrics, config.server.max_upload_bytes);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Detection service listening on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received, starting graceful shutdown")
            })
            .await?;

        tracing::info!("Detection service stopped");
        Ok(())
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let ort_model_service = OrtModelService::new(&config.model).map_err(|e| {
        tracing::error!("Failed to load detection model: {}", e);
        e
    })?;
    let service_state = ServiceState::new(config.labels.as_ref()).map_err(|e| {
        tracing::error!("Failed to load class labels: {}", e);
        e
    })?;

    let inference_service = InferenceService::new(ort_model_service, service_state);
    tracing::info!("Model {} loaded", inference_service.model_name());

    let server = HttpServer::new(inference_service, &config).await?;
    server.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
