use crate::node::{Node, UpdateContext};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

const DOH_ENDPOINT: &str = "https://1.1.1.1/dns-query";
const DOH_CONCURRENCY: usize = 10;
const DOH_TIMEOUT: Duration = Duration::from_secs(3);

/// Ingress stage: split IP-literal nodes from domain nodes, resolve each
/// distinct domain over DoH, fission domain nodes into one clone per A
/// record (backfilling SNI where the protocol needs it) and deduplicate
/// everything on (type, server, port).
pub async fn ingress(ctx: &mut UpdateContext) {
    let nodes = std::mem::take(&mut ctx.nodes);
    let (ip_nodes, domain_nodes) = classify(ctx, nodes);

    let mut domains = Vec::new();
    let mut seen_domains = HashSet::new();
    for node in &domain_nodes {
        if seen_domains.insert(node.server.clone()) {
            domains.push(node.server.clone());
        }
    }
    let answers = resolve_domains(&domains).await;

    let resolved = domain_nodes
        .into_iter()
        .map(|node| {
            let ips = answers.get(&node.server).cloned().unwrap_or_default();
            (node, ips)
        })
        .collect();

    fuse(ctx, ip_nodes, resolved);

    for (airport, stat) in &ctx.stats {
        info!(
            "[{airport}] total={} duplicated={} failed={}",
            stat.total, stat.duplicated, stat.failed
        );
    }
}

/// Partition nodes by whether `server` is an IP literal. Every node counts
/// toward its source's `total` here, at stage entry.
pub(crate) fn classify(ctx: &mut UpdateContext, nodes: Vec<Node>) -> (Vec<Node>, Vec<Node>) {
    let mut ip_nodes = Vec::new();
    let mut domain_nodes = Vec::new();
    for node in nodes {
        ctx.stat_mut(&node.source).total += 1;
        if is_ip(&node.server) {
            ip_nodes.push(node);
        } else {
            domain_nodes.push(node);
        }
    }
    (ip_nodes, domain_nodes)
}

/// Fission and dedup. IP nodes keep their first occurrence; a domain node
/// with no answers counts as failed; a domain node whose every clone lost
/// dedup counts as duplicated once.
pub(crate) fn fuse(
    ctx: &mut UpdateContext,
    ip_nodes: Vec<Node>,
    resolved: Vec<(Node, Vec<String>)>,
) {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();

    for node in ip_nodes {
        if seen.insert(node.dedup_key()) {
            kept.push(node);
        } else {
            ctx.stat_mut(&node.source).duplicated += 1;
        }
    }

    for (node, ips) in resolved {
        if ips.is_empty() {
            warn!("[{}] DoH yielded no answers: {}", node.source, node.origin_name);
            ctx.stat_mut(&node.source).failed += 1;
            continue;
        }
        let original_server = node.server.clone();
        let mut added = false;
        for ip in &ips {
            let mut clone = node.clone();
            clone.server = ip.clone();
            if needs_sni(&clone.kind)
                && clone.params.get("sni").map_or(true, |s| s.is_empty())
                && is_domain(&original_server)
            {
                clone
                    .params
                    .insert("sni".to_string(), original_server.clone());
            }
            if seen.insert(clone.dedup_key()) {
                kept.push(clone);
                added = true;
            }
        }
        if !added {
            ctx.stat_mut(&node.source).duplicated += 1;
        }
    }

    ctx.nodes = kept;
}

/// One A-record query per distinct domain, bounded fan-out.
async fn resolve_domains(domains: &[String]) -> HashMap<String, Vec<String>> {
    if domains.is_empty() {
        return HashMap::new();
    }
    let client = match reqwest::Client::builder().timeout(DOH_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("failed to build DoH client: {e:#}");
            return HashMap::new();
        }
    };
    stream::iter(domains)
        .map(|domain| {
            let client = client.clone();
            async move { (domain.clone(), resolve_a(&client, domain).await) }
        })
        .buffer_unordered(DOH_CONCURRENCY)
        .collect()
        .await
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    kind: u16,
    data: String,
}

/// Network or decode errors yield an empty answer list; the caller counts
/// the affected nodes as failed.
async fn resolve_a(client: &reqwest::Client, domain: &str) -> Vec<String> {
    let result = async {
        let resp = client
            .get(DOH_ENDPOINT)
            .query(&[("name", domain), ("type", "A")])
            .header("accept", "application/dns-json")
            .send()
            .await?;
        resp.json::<DohResponse>().await
    }
    .await;

    match result {
        Ok(doh) => doh
            .answer
            .into_iter()
            .filter(|a| a.kind == 1)
            .map(|a| a.data)
            .collect(),
        Err(e) => {
            warn!("DoH query for {domain} failed: {e:#}");
            Vec::new()
        }
    }
}

fn is_ip(server: &str) -> bool {
    server.parse::<IpAddr>().is_ok()
}

fn is_domain(server: &str) -> bool {
    !is_ip(server) && server.contains('.')
}

fn needs_sni(kind: &str) -> bool {
    matches!(kind, "trojan" | "vmess")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_node_line;

    fn run(ctx: &mut UpdateContext, nodes: Vec<Node>, answers: &[(&str, &[&str])]) {
        let (ip_nodes, domain_nodes) = classify(ctx, nodes);
        let resolved = domain_nodes
            .into_iter()
            .map(|node| {
                let ips = answers
                    .iter()
                    .find(|(domain, _)| *domain == node.server)
                    .map(|(_, ips)| ips.iter().map(|s| s.to_string()).collect())
                    .unwrap_or_default();
                (node, ips)
            })
            .collect();
        fuse(ctx, ip_nodes, resolved);
    }

    #[test]
    fn fission_clones_per_ip_and_backfills_sni() {
        let mut ctx = UpdateContext::default();
        let node = parse_node_line("N2 = trojan,example.com,443,password=p", "B").unwrap();
        run(
            &mut ctx,
            vec![node],
            &[("example.com", &["5.5.5.5", "6.6.6.6"])],
        );

        assert_eq!(ctx.nodes.len(), 2);
        assert_eq!(ctx.nodes[0].server, "5.5.5.5");
        assert_eq!(ctx.nodes[1].server, "6.6.6.6");
        for node in &ctx.nodes {
            assert_eq!(node.params.get("sni").unwrap(), "example.com");
            // Only added to the map; the original token text is untouched.
            assert_eq!(node.param_string, "password=p");
        }
        let stat = ctx.stats.get("B").unwrap();
        assert_eq!((stat.total, stat.duplicated, stat.failed), (1, 0, 0));
    }

    #[test]
    fn existing_sni_is_preserved() {
        let mut ctx = UpdateContext::default();
        let node =
            parse_node_line("N = trojan,example.com,443,password=p,sni=keep.me", "B").unwrap();
        run(&mut ctx, vec![node], &[("example.com", &["5.5.5.5"])]);
        assert_eq!(ctx.nodes[0].params.get("sni").unwrap(), "keep.me");
    }

    #[test]
    fn sni_only_for_protocols_that_need_it() {
        let mut ctx = UpdateContext::default();
        let node = parse_node_line("N = ss,example.com,443,password=p", "B").unwrap();
        run(&mut ctx, vec![node], &[("example.com", &["5.5.5.5"])]);
        assert!(ctx.nodes[0].params.get("sni").is_none());
    }

    #[test]
    fn unresolvable_domain_counts_failed() {
        let mut ctx = UpdateContext::default();
        let node = parse_node_line("N = trojan,gone.example,443,password=p", "B").unwrap();
        run(&mut ctx, vec![node], &[]);
        assert!(ctx.nodes.is_empty());
        assert_eq!(ctx.stats.get("B").unwrap().failed, 1);
    }

    #[test]
    fn ip_nodes_dedup_on_type_server_port() {
        let mut ctx = UpdateContext::default();
        let a = parse_node_line("N1 = ss,9.9.9.9,443,password=p", "A").unwrap();
        let b = parse_node_line("N2 = ss,9.9.9.9,443,password=q", "A").unwrap();
        let c = parse_node_line("N3 = trojan,9.9.9.9,443,password=q", "A").unwrap();
        run(&mut ctx, vec![a, b, c], &[]);
        assert_eq!(ctx.nodes.len(), 2);
        assert_eq!(ctx.stats.get("A").unwrap().duplicated, 1);
    }

    #[test]
    fn cross_source_collision_keeps_exactly_one() {
        let mut ctx = UpdateContext::default();
        let a = parse_node_line("N1 = trojan,one.example,443,password=p", "A").unwrap();
        let b = parse_node_line("N2 = trojan,two.example,443,password=q", "B").unwrap();
        run(
            &mut ctx,
            vec![a, b],
            &[("one.example", &["9.9.9.9"]), ("two.example", &["9.9.9.9"])],
        );

        assert_eq!(ctx.nodes.len(), 1);
        let dup_a = ctx.stats.get("A").unwrap().duplicated;
        let dup_b = ctx.stats.get("B").unwrap().duplicated;
        // The iteration winner keeps the node, the loser counts one dup.
        assert_eq!(dup_a + dup_b, 1);
    }

    #[test]
    fn counters_account_for_every_node_seen() {
        let mut ctx = UpdateContext::default();
        let nodes = vec![
            parse_node_line("N1 = ss,1.2.3.4,443,password=p", "A").unwrap(),
            parse_node_line("N2 = ss,1.2.3.4,443,password=p", "A").unwrap(),
            parse_node_line("N3 = trojan,dead.example,443,password=p", "A").unwrap(),
            parse_node_line("N4 = trojan,live.example,443,password=p", "A").unwrap(),
        ];
        run(&mut ctx, nodes, &[("live.example", &["7.7.7.7"])]);

        let stat = ctx.stats.get("A").unwrap();
        let surviving = ctx.nodes.len();
        assert_eq!(stat.total, 4);
        assert_eq!(stat.duplicated + stat.failed + surviving, stat.total);
    }

    #[test]
    fn doh_answers_filter_on_a_records() {
        let json = r#"{
            "Status": 0,
            "Answer": [
                {"name": "example.com", "type": 5, "TTL": 300, "data": "edge.example.net."},
                {"name": "edge.example.net", "type": 1, "TTL": 60, "data": "5.5.5.5"},
                {"name": "edge.example.net", "type": 1, "TTL": 60, "data": "6.6.6.6"}
            ]
        }"#;
        let doh: DohResponse = serde_json::from_str(json).unwrap();
        let ips: Vec<String> = doh
            .answer
            .into_iter()
            .filter(|a| a.kind == 1)
            .map(|a| a.data)
            .collect();
        assert_eq!(ips, vec!["5.5.5.5", "6.6.6.6"]);
    }

    #[test]
    fn doh_response_without_answer_section() {
        let doh: DohResponse = serde_json::from_str(r#"{"Status": 3}"#).unwrap();
        assert!(doh.answer.is_empty());
    }
}
