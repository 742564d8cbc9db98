use crate::config::Config;
use crate::dialer::ProxyDialer;
use crate::node::UpdateContext;
use crate::{egress, ingress, parser, publisher, subscription};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// One full refresh: fetch every subscription, parse, fission and dedup,
/// probe egress countries, publish. Stages run strictly in sequence; each
/// handles its own failures, so a run always completes.
pub async fn update_nodes(config: Arc<Config>, dialer: Arc<dyn ProxyDialer>) {
    let start = Instant::now();

    let raw = subscription::fetch_all(&config.airports).await;
    let nodes = parser::parse_all(&raw);
    info!(
        "parsed {} nodes from {} sources",
        nodes.len(),
        config.airports.len()
    );

    let mut ctx = UpdateContext::new(nodes);
    ingress::ingress(&mut ctx).await;
    egress::egress(&mut ctx, dialer.as_ref()).await;
    publisher::publish(&config, &ctx.nodes).await;

    info!(
        "update finished in {:.2}s with {} nodes",
        start.elapsed().as_secs_f64(),
        ctx.nodes.len()
    );
}
