use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use merchantnode::metrics::MERCHANTNODE_REGISTRY;
use merchantnode::State;
use prometheus::{register_int_gauge_vec_with_registry, Encoder, IntGaugeVec, TextEncoder};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;

lazy_static! {
    pub static ref WATCHED_MERCHANTNODES: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "watched",
        "Watched merchantnodes by lifecycle state",
        &["state"],
        MERCHANTNODE_REGISTRY
    )
    .unwrap();
}

pub fn set_watched(counts: &HashMap<State, usize>) {
    WATCHED_MERCHANTNODES.reset();
    for (state, count) in counts {
        WATCHED_MERCHANTNODES
            .with_label_values(&[&state.to_string()])
            .set(*count as i64);
    }
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            // the merchantnode registry plus the default one
            let mut metric_families = MERCHANTNODE_REGISTRY.gather();
            metric_families.extend(prometheus::gather());

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                tracing::error!("Failed to encode metrics: {}", err);
                return Ok(status(StatusCode::INTERNAL_SERVER_ERROR));
            }

            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                .body(Body::from(buffer))
        }
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
                "metrics_count": MERCHANTNODE_REGISTRY.gather().len(),
            });

            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
        }
        _ => return Ok(status(StatusCode::NOT_FOUND)),
    };

    Ok(response.unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR)))
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

pub async fn start_server(port_number: Option<u16>) {
    // Default port is 9001 if not specified
    const DEFAULT_PORT: u16 = 9001;

    let port = port_number.unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = Server::bind(&addr).serve(make_svc);

    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
}
