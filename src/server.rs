use std::sync::LazyLock;
use std::time::SystemTime;

use axum::body::Body;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream;
use serde::Serialize;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{PayloadFlags, ThrottleConfig};
use crate::context::{GroupKeyStrategy, RequestContext};
use crate::error::Result;
use crate::layer::{ThrottleLayer, ThrottleOptions};
use crate::rate::{self, Rate, RateOption, RateResolver, SharedRateFn};

const CHUNK_SIZE: usize = 1024;
const STREAM_CHUNKS: usize = 64;
const BUFFER_SIZE: usize = 256 * 1024;
const STRING_SIZE: usize = 64 * 1024;

/// Seconds `/delayed` holds its body back before releasing it at full speed.
const DELAY_SECS: f64 = 2.0;

static START_TIME: LazyLock<SystemTime> = LazyLock::new(SystemTime::now);

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pools: usize,
}

#[derive(Debug, Serialize)]
struct Record {
    id: usize,
    name: String,
    payload: String,
}

/// Demo server exposing one route per kind of throttled payload.
pub struct Server {
    app: Router,
    port: u16,
}

impl Server {
    pub fn new(config: &ThrottleConfig, port: u16) -> Result<Self> {
        let app = router(config)?;
        Ok(Self { app, port })
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", self.port)).await?;

        tracing::info!("byte-throttle demo listening on port {}", self.port);
        tracing::info!("Throttled routes: /stream /buffer /string /delayed /pojo /shared /tiered");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

/// Build the demo routes, each with its own throttling options.
pub fn router(config: &ThrottleConfig) -> Result<Router> {
    let store = config.store.build("demo")?;
    let health_store = store.clone();
    let base = ThrottleOptions::from_config(config);

    let all_payloads = base.clone().with_payloads(PayloadFlags::all());

    let delayed = ThrottleOptions::new(RateOption::Dynamic(rate::from_fn(|elapsed, _| {
        if elapsed < DELAY_SECS {
            Rate::Limited(0)
        } else {
            Rate::Unlimited
        }
    })));

    let shared = base.clone().shared(store, GroupKeyStrategy::ClientIp);

    let bytes_per_second = config.bytes_per_second;
    let tiered = ThrottleOptions::new(RateOption::Resolver(RateResolver::from_async(
        move |ctx: &RequestContext| {
            let tier = ctx.header("x-bandwidth-tier").map(str::to_string);
            async move { Ok(tier_rate(tier.as_deref(), bytes_per_second)) }
        },
    )));

    let app = Router::new()
        .route("/stream", get(stream_body).layer(ThrottleLayer::new(base.clone())))
        .route("/buffer", get(buffer_body).layer(ThrottleLayer::new(all_payloads.clone())))
        .route("/string", get(string_body).layer(ThrottleLayer::new(all_payloads.clone())))
        .route("/delayed", get(stream_body).layer(ThrottleLayer::new(delayed)))
        .route("/pojo", get(pojo_body).layer(ThrottleLayer::new(all_payloads)))
        .route("/shared", get(stream_body).layer(ThrottleLayer::new(shared)))
        .route("/tiered", get(stream_body).layer(ThrottleLayer::new(tiered)))
        .route(
            "/health",
            get(move || {
                let pools = health_store.len().unwrap_or_default();
                async move { health(pools) }
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    Ok(app)
}

/// `premium` is unthrottled, `basic` gets a quarter of the default rate.
fn tier_rate(tier: Option<&str>, bytes_per_second: u64) -> SharedRateFn {
    match tier {
        Some("premium") => rate::unlimited(),
        Some("basic") => rate::constant((bytes_per_second / 4).max(1)),
        _ => rate::constant(bytes_per_second),
    }
}

async fn stream_body() -> Body {
    let chunks = (0..STREAM_CHUNKS).map(|i| {
        let fill = b'a' + (i % 26) as u8;
        Ok::<_, std::io::Error>(Bytes::from(vec![fill; CHUNK_SIZE]))
    });
    Body::from_stream(stream::iter(chunks))
}

async fn buffer_body() -> impl IntoResponse {
    let data: Vec<u8> = (0..BUFFER_SIZE).map(|i| (i % 251) as u8).collect();
    (
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
}

async fn string_body() -> String {
    "lorem ipsum dolor sit amet ".repeat(STRING_SIZE / 27)
}

async fn pojo_body() -> Json<Vec<Record>> {
    let records = (0..256)
        .map(|id| Record {
            id,
            name: format!("record-{}", id),
            payload: "x".repeat(64),
        })
        .collect();
    Json(records)
}

fn health(pools: usize) -> Json<HealthStatus> {
    let uptime = SystemTime::now()
        .duration_since(*START_TIME)
        .unwrap_or_default()
        .as_secs();

    Json(HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        pools,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
