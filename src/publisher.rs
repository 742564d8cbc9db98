use crate::config::{Config, GistTarget};
use crate::node::Node;
use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{error, info, warn};

const GIST_TIMEOUT: Duration = Duration::from_secs(3);

/// Publisher stage: group, number, render and persist the manifest, then
/// mirror it to the configured Gist. An empty rendering never overwrites
/// the previous manifest; all failures are logged and swallowed.
pub async fn publish(config: &Config, nodes: &[Node]) {
    let content = render_manifest(nodes);
    if content.trim().is_empty() {
        warn!("rendered manifest is empty, keeping the previous node.conf");
        return;
    }

    let path = config.paths.node_conf();
    if let Err(e) = tokio::fs::write(&path, &content).await {
        error!("write {} failed: {e:#}", path.display());
        return;
    }
    info!(
        "wrote {} ({} lines)",
        path.display(),
        content.lines().count()
    );

    if let Some(gist) = &config.gist {
        match upload_gist(gist, &content).await {
            Ok(()) => info!("uploaded node.conf to gist {}", gist.gist_id),
            Err(e) => error!("gist upload failed: {e:#}"),
        }
    }
}

/// Group by source and country, sort the groups, number within each group
/// and rewrite booleans to the client's 1/0 encoding.
pub(crate) fn render_manifest(nodes: &[Node]) -> String {
    let mut groups: BTreeMap<String, Vec<&Node>> = BTreeMap::new();
    for node in nodes {
        groups
            .entry(format!("{}|{}", node.source, node.iso))
            .or_default()
            .push(node);
    }

    let mut lines = Vec::new();
    for group in groups.values() {
        for (j, node) in group.iter().enumerate() {
            let name = format!(
                "{} [{}{}]-{:02}",
                node.source,
                node.iso,
                node.emoji,
                j + 1
            );
            lines.push(format_node(node, &name));
        }
    }

    lines
        .join("\n")
        .replace("=true", "=1")
        .replace("=false", "=0")
}

/// Render one node line. The original parameter text is emitted verbatim;
/// keys added since parse (such as a backfilled sni) follow at the end.
pub(crate) fn format_node(node: &Node, name: &str) -> String {
    let original: HashSet<&str> = node
        .param_string
        .split(',')
        .filter_map(|token| token.trim().split_once('=').map(|(k, _)| k))
        .collect();

    let mut params = node.param_string.clone();
    for (key, value) in &node.params {
        if !original.contains(key.as_str()) {
            if !params.is_empty() {
                params.push(',');
            }
            params.push_str(key);
            params.push('=');
            params.push_str(value);
        }
    }

    format!(
        "{} = {},{},{}, {}",
        name, node.kind, node.server, node.port, params
    )
}

async fn upload_gist(gist: &GistTarget, content: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(GIST_TIMEOUT)
        .user_agent("conflux")
        .build()
        .context("build gist client")?;

    let body = serde_json::json!({
        "files": { "node.conf": { "content": content } }
    });
    let resp = client
        .patch(format!("https://api.github.com/gists/{}", gist.gist_id))
        .header("Authorization", format!("Bearer {}", gist.token))
        .json(&body)
        .send()
        .await
        .context("gist request")?;

    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        let text = resp.text().await.unwrap_or_default();
        Err(anyhow!("gist API returned {status}: {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::parser::parse_node_line;

    fn probed(line: &str, source: &str, iso: &str) -> Node {
        let mut node = parse_node_line(line, source).unwrap();
        node.emoji = crate::egress::flag_emoji(iso);
        node.iso = iso.to_string();
        node
    }

    #[test]
    fn renders_name_params_and_boolean_encoding() {
        let node = probed(
            "N1 = ss,1.2.3.4,443,encrypt-method=aes-128-gcm,password=p,udp-relay=true",
            "A",
            "US",
        );
        assert_eq!(
            render_manifest(&[node]),
            "A [US🇺🇸]-01 = ss,1.2.3.4,443, encrypt-method=aes-128-gcm,password=p,udp-relay=1"
        );
    }

    #[test]
    fn added_params_are_appended_after_originals() {
        let mut node = probed("N2 = trojan,example.com,443,password=p", "B", "HK");
        node.server = "5.5.5.5".to_string();
        node.params
            .insert("sni".to_string(), "example.com".to_string());
        assert_eq!(
            render_manifest(&[node]),
            "B [HK🇭🇰]-01 = trojan,5.5.5.5,443, password=p,sni=example.com"
        );
    }

    #[test]
    fn groups_sort_and_number_independently() {
        let nodes = vec![
            probed("n1 = ss,1.1.1.1,443,password=a", "B", "HK"),
            probed("n2 = ss,1.1.1.2,443,password=b", "A", "US"),
            probed("n3 = ss,1.1.1.3,443,password=c", "B", "HK"),
            probed("n4 = ss,1.1.1.4,443,password=d", "A", "JP"),
        ];
        let manifest = render_manifest(&nodes);
        let names: Vec<&str> = manifest
            .lines()
            .map(|l| l.split(" = ").next().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "A [JP🇯🇵]-01",
                "A [US🇺🇸]-01",
                "B [HK🇭🇰]-01",
                "B [HK🇭🇰]-02",
            ]
        );
    }

    #[test]
    fn published_line_round_trips() {
        let line = "X = ss,1.1.1.1,443, udp-relay=1,block-quic=0";
        let node = parse_node_line(line, "A").unwrap();
        assert_eq!(format_node(&node, "X"), line);
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            airports: Vec::new(),
            token: "t".to_string(),
            gist: None,
            paths: Paths::new(dir),
        }
    }

    #[tokio::test]
    async fn empty_result_preserves_previous_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(config.paths.node_conf(), "previous content").unwrap();

        publish(&config, &[]).await;

        assert_eq!(
            std::fs::read_to_string(config.paths.node_conf()).unwrap(),
            "previous content"
        );
    }

    #[tokio::test]
    async fn successful_run_overwrites_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(config.paths.node_conf(), "previous content").unwrap();

        let node = probed("n = ss,1.2.3.4,443,password=p", "A", "JP");
        publish(&config, &[node]).await;

        assert_eq!(
            std::fs::read_to_string(config.paths.node_conf()).unwrap(),
            "A [JP🇯🇵]-01 = ss,1.2.3.4,443, password=p"
        );
    }
}
