use crate::config::Config;
use crate::dialer::ProxyDialer;
use crate::update::update_nodes;
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// URL parameter → node attribute. Only these three may be overridden;
/// anything else in the query string is ignored.
const OVERRIDABLE: &[(&str, &str)] = &[("udp", "udp-relay"), ("quic", "block-quic"), ("tfo", "tfo")];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dialer: Arc<dyn ProxyDialer>,
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/conflux", get(handle_conflux))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind 0.0.0.0:{port}"))?;
    info!("listening on http://0.0.0.0:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_conflux(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut keys: Vec<&str> = params.keys().map(String::as_str).collect();
    keys.sort_unstable();
    info!("GET /conflux params={keys:?}");

    if params.get("t").map(String::as_str) != Some(state.config.token.as_str()) {
        warn!("token check failed");
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    if params.contains_key("f") {
        info!("forced update requested, running asynchronously");
        tokio::spawn(update_nodes(state.config.clone(), state.dialer.clone()));
        return (StatusCode::ACCEPTED, "update triggered").into_response();
    }

    let path = state.config.paths.node_conf();
    if !path.exists() {
        warn!("node.conf missing, running update asynchronously");
        tokio::spawn(update_nodes(state.config.clone(), state.dialer.clone()));
        return StatusCode::NO_CONTENT.into_response();
    }

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => {
            error!("read {} failed: {e:#}", path.display());
            return (StatusCode::INTERNAL_SERVER_ERROR, "read node.conf error").into_response();
        }
    };

    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    let body = process_nodes(&lines, &params).join("\n");
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Apply the override parameters to every manifest line: replace the value
/// where the attribute exists, append it where it does not.
pub(crate) fn process_nodes(lines: &[String], params: &HashMap<String, String>) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut line = line.to_string();
            for (param, attr) in OVERRIDABLE {
                if let Some(val) = params.get(*param) {
                    line = replace_attr(&line, attr, val);
                }
            }
            for (param, attr) in OVERRIDABLE {
                if let Some(val) = params.get(*param) {
                    let attr_eq = format!("{attr}=");
                    if !line.contains(&attr_eq) {
                        line.push_str(&format!(",{attr}={val}"));
                    }
                }
            }
            line
        })
        .collect()
}

/// Replace the attribute's value, which extends to the next comma or the
/// end of the line.
pub(crate) fn replace_attr(line: &str, attr: &str, val: &str) -> String {
    let prefix = format!("{attr}=");
    let Some(idx) = line.find(&prefix) else {
        return line.to_string();
    };
    let start = idx + prefix.len();
    match line[start..].find(',') {
        None => format!("{}{}", &line[..start], val),
        Some(end) => format!("{}{}{}", &line[..start], val, &line[start + end..]),
    }
}
