use crate::dialer::{BoxedProxyStream, ProxyDialer, ProxyParams};
use crate::node::{Node, UpdateContext};
use anyhow::{anyhow, Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// Trace hosts probed in order; the second is the failover.
const TRACE_HOSTS: &[&str] = &["1.1.1.1", "1.0.0.1"];
const PROBE_CONCURRENCY: usize = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Egress stage: determine each node's real egress country by fetching the
/// Cloudflare trace endpoint through the node's own proxy protocol. Nodes
/// whose probe fails are dropped and counted against their source.
pub async fn egress(ctx: &mut UpdateContext, dialer: &dyn ProxyDialer) {
    let outcomes: Vec<(usize, Option<String>)> = stream::iter(ctx.nodes.iter().enumerate())
        .map(|(index, node)| async move {
            match probe_node(dialer, node).await {
                Ok(iso) => (index, Some(iso)),
                Err(e) => {
                    warn!("[{}] probe failed: {} - {e:#}", node.source, node.origin_name);
                    (index, None)
                }
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect()
        .await;

    apply_outcomes(ctx, outcomes);

    for (airport, stat) in &ctx.stats {
        info!(
            "[{airport}] total={} duplicated={} failed={}",
            stat.total, stat.duplicated, stat.failed
        );
    }
}

/// Write probe results back by index, drop nodes without a country, then
/// recompute each source's `total` to its surviving node count: the
/// published figure refers to shipped nodes, not intake.
pub(crate) fn apply_outcomes(ctx: &mut UpdateContext, outcomes: Vec<(usize, Option<String>)>) {
    for (index, iso) in outcomes {
        match iso {
            Some(iso) => {
                let node = &mut ctx.nodes[index];
                node.emoji = flag_emoji(&iso);
                node.iso = iso;
            }
            None => {
                let source = ctx.nodes[index].source.clone();
                ctx.stat_mut(&source).failed += 1;
            }
        }
    }

    ctx.nodes
        .retain(|node| !node.iso.is_empty() && !node.emoji.is_empty());

    let mut survivors: HashMap<&str, usize> = HashMap::new();
    for node in &ctx.nodes {
        *survivors.entry(node.source.as_str()).or_default() += 1;
    }
    for (airport, stat) in ctx.stats.iter_mut() {
        stat.total = survivors.get(airport.as_str()).copied().unwrap_or(0);
    }
}

/// One node's probe: canonicalise, dial through the proxy, fetch the trace
/// document, extract `loc=`.
async fn probe_node(dialer: &dyn ProxyDialer, node: &Node) -> Result<String> {
    let params = canonical_params(node)?;
    let mut last_err = anyhow!("no trace endpoint configured");
    for host in TRACE_HOSTS {
        match tokio::time::timeout(PROBE_TIMEOUT, probe_once(dialer, &params, host)).await {
            Ok(Ok(iso)) => return Ok(iso),
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = anyhow!("trace fetch via {host} timed out"),
        }
    }
    Err(last_err)
}

async fn probe_once(dialer: &dyn ProxyDialer, params: &ProxyParams, host: &str) -> Result<String> {
    let stream = dialer.dial(params, host, 443).await?;
    let body = fetch_trace(stream, host).await?;
    parse_trace(&body).ok_or_else(|| anyhow!("trace response carries no loc= line"))
}

/// Translate a node into the canonical parameter mapping the proxy library
/// understands: renamed keys, typed values, derived vmess alterId.
pub(crate) fn canonical_params(node: &Node) -> Result<ProxyParams> {
    use serde_yaml::Value;

    let mut map = ProxyParams::new();
    map.insert("name".to_string(), Value::String(node.origin_name.clone()));
    map.insert("type".to_string(), Value::String(node.kind.clone()));
    map.insert("server".to_string(), Value::String(node.server.clone()));
    let port: u16 = node
        .port
        .trim()
        .parse()
        .with_context(|| format!("port {:?} is not numeric", node.port))?;
    map.insert("port".to_string(), Value::Number(port.into()));

    if node.kind == "vmess" {
        // vmess-aead is a synthetic attribute: it selects the alterId and is
        // never forwarded to the proxy itself.
        let aead = matches!(
            node.params.get("vmess-aead").map(String::as_str),
            Some("true") | Some("1")
        );
        let alter_id: i64 = if aead { 0 } else { 1 };
        map.insert("alterId".to_string(), Value::Number(alter_id.into()));
    }

    for (key, value) in &node.params {
        if node.kind == "vmess" && key == "vmess-aead" {
            continue;
        }
        map.insert(canonical_name(key).to_string(), coerce_value(value));
    }

    Ok(map)
}

fn canonical_name(key: &str) -> &str {
    match key {
        "encrypt-method" => "cipher",
        "udp-relay" => "udp",
        "username" => "uuid",
        _ => key,
    }
}

/// `"true"|"1"` and `"false"|"0"` become booleans, then integer, then
/// float, else the string survives as-is.
fn coerce_value(value: &str) -> serde_yaml::Value {
    use serde_yaml::Value;
    match value {
        "true" | "1" => return Value::Bool(true),
        "false" | "0" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = value.parse::<f64>() {
        return Value::Number(f.into());
    }
    Value::String(value.to_string())
}

fn tls_connector() -> &'static TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

/// Speak HTTPS over the proxied stream and return the response body.
/// `Connection: close` keeps probes from holding the tunnel open.
async fn fetch_trace(stream: BoxedProxyStream, host: &str) -> Result<String> {
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|_| anyhow!("bad server name {host}"))?;
    let mut tls = tls_connector()
        .connect(server_name, stream)
        .await
        .context("TLS handshake with trace endpoint")?;

    let request = format!(
        "GET /cdn-cgi/trace HTTP/1.1\r\nHost: {host}\r\nUser-Agent: conflux\r\nAccept: */*\r\nConnection: close\r\n\r\n"
    );
    tls.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    match tls.read_to_end(&mut response).await {
        Ok(_) => {}
        // Servers that drop without close_notify still delivered the body.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
        Err(e) => return Err(e.into()),
    }

    let text = String::from_utf8_lossy(&response);
    let body = match text.split_once("\r\n\r\n") {
        Some((_, body)) => body.to_string(),
        None => text.into_owned(),
    };
    Ok(body)
}

/// Find the `loc=` line and take the two letters after it.
pub(crate) fn parse_trace(body: &str) -> Option<String> {
    let loc = body
        .lines()
        .find_map(|line| line.trim().strip_prefix("loc="))?;
    let iso: String = loc.chars().take(2).collect();
    if iso.len() == 2 && iso.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(iso.to_ascii_uppercase())
    } else {
        None
    }
}

/// Regional-indicator flag for an ISO alpha-2 code, with a short override
/// table for codes whose flag is politically awkward downstream.
pub(crate) fn flag_emoji(iso: &str) -> String {
    const OVERRIDES: &[(&str, &str)] = &[("TW", "🌏")];
    if let Some((_, emoji)) = OVERRIDES.iter().find(|(code, _)| *code == iso) {
        return (*emoji).to_string();
    }
    iso.chars()
        .filter_map(|c| char::from_u32(0x1F1E6 + (c.to_ascii_uppercase() as u32 - 'A' as u32)))
        .collect()
}
