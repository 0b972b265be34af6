use crate::auth::Authenticator;
use crate::balancer::WeightedBalancer;
use crate::config::Config;
use crate::error::ProxyError;
use crate::health::{HealthTracker, DEFAULT_FAILURE_THRESHOLD};
use crate::stats::ProxyStats;
use crate::upstream::{tag_suffix, UpstreamRegistry};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tokio::net::TcpListener;

/// Plain text response with the given status.
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// The proxy: one listener dispatching CONNECT requests and the stats
/// endpoint, over shared registry, health, balancer, and stats state.
pub struct ProxyServer {
    pub(crate) config: RwLock<Config>,
    pub(crate) config_path: String,
    pub(crate) config_mod_time: Mutex<Option<SystemTime>>,
    pub(crate) reload_lock: Mutex<()>,
    pub(crate) registry: UpstreamRegistry,
    pub(crate) health: HealthTracker,
    pub(crate) balancer: WeightedBalancer,
    pub(crate) stats: ProxyStats,
}

impl ProxyServer {
    pub fn new(config: Config, config_path: &str) -> Arc<Self> {
        let config_mod_time = std::fs::metadata(config_path)
            .ok()
            .and_then(|m| m.modified().ok());

        let registry = UpstreamRegistry::new(&config);
        let health = HealthTracker::new();
        let stats = ProxyStats::new();

        let entries = registry.snapshot();
        for upstream in &entries {
            health.register(&upstream.url, upstream.tag.as_deref());
            stats.register_upstream(&upstream.url, upstream.tag.as_deref());
        }

        info!("Upstream proxy initialization:");
        info!("  - Total enabled upstreams: {}", entries.len());
        info!("  - Total weight: {}", registry.total_weight());
        info!("  - Load balancing: weighted round-robin");
        info!(
            "  - Health monitoring: enabled (failure threshold: {}, recovery: auto)",
            DEFAULT_FAILURE_THRESHOLD
        );
        for upstream in &entries {
            info!(
                "  - Upstream: {} (weight: {}){}",
                upstream.url,
                upstream.weight,
                tag_suffix(&upstream.tag)
            );
        }
        if entries.is_empty() {
            warn!("No enabled upstream proxies found in configuration");
        }

        Arc::new(Self {
            config: RwLock::new(config),
            config_path: config_path.to_string(),
            config_mod_time: Mutex::new(config_mod_time),
            reload_lock: Mutex::new(()),
            registry,
            health,
            balancer: WeightedBalancer::new(),
            stats,
        })
    }

    /// Binds the configured listen address and serves until the process
    /// shuts down.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let (name, addr, stats_endpoint) = {
            let config = self.config.read().unwrap();
            (
                config.server.name.clone(),
                config.server.listen_address.clone(),
                config.server.stats_endpoint.clone(),
            )
        };

        info!("Starting {} on {}", name, addr);
        let listener = TcpListener::bind(&addr).await?;
        info!("  - Listening on: {}", addr);
        info!("  - Stats endpoint: {}", stats_endpoint);
        info!("Server ready to accept connections");

        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (tests bind their own
    /// ephemeral port).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.route(req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }

    /// Routing: the stats path wins over method dispatch, CONNECT goes to
    /// the pipeline, everything else is refused.
    async fn route(self: Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (stats_endpoint, auth) = {
            let config = self.config.read().unwrap();
            (
                config.server.stats_endpoint.clone(),
                config.authentication.clone(),
            )
        };

        if req.uri().path() == stats_endpoint {
            if auth.enabled && !Authenticator::check_stats(&auth, req.headers()) {
                let mut response =
                    text_response(StatusCode::UNAUTHORIZED, "Authentication Required");
                response.headers_mut().insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"Stats\""),
                );
                return response;
            }
            return self.handle_stats();
        }

        if req.method() == Method::CONNECT {
            return self.handle_connect(req, &auth).await;
        }

        text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    }

    /// Health-aware weighted selection over the current registry.
    pub fn next_upstream(&self) -> Option<Arc<crate::upstream::Upstream>> {
        self.balancer.select(&self.registry.snapshot(), &self.health)
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn registry(&self) -> &UpstreamRegistry {
        &self.registry
    }

    fn handle_stats(&self) -> Response<Full<Bytes>> {
        let registry = self.registry.snapshot();
        let healthy = self.health.healthy_map();
        let document = self.stats.document(&registry, &healthy);

        match serde_json::to_string(&document) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap(),
            Err(e) => {
                error!("Failed to encode stats: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "stats unavailable")
            }
        }
    }
}
