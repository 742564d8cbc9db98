use crate::node::Node;
use indexmap::IndexMap;
use tracing::debug;

/// Parse every fetched source into nodes, in source order.
pub fn parse_all(raw: &[(String, Vec<String>)]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (airport, lines) in raw {
        for line in extract_proxy_lines(lines) {
            match parse_node_line(&line, airport) {
                Some(node) => nodes.push(node),
                None => debug!("[{airport}] dropped unparseable line: {line}"),
            }
        }
    }
    nodes
}

/// Extract the node lines of the `[Proxy]` section: everything after a
/// `[Proxy]` marker up to the next `[section]` header or end of input,
/// minus blanks, `#` comments and reject/direct entries.
pub fn extract_proxy_lines(lines: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut in_proxy = false;
    for line in lines {
        let line = line.trim();
        if line.starts_with("[Proxy]") {
            in_proxy = true;
            continue;
        }
        if !in_proxy || line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            break;
        }
        if line.starts_with('#') || line.contains("reject") || line.contains("direct") {
            continue;
        }
        result.push(line.to_string());
    }
    result
}

/// Decode one `name = type,server,port,k=v,...` line. Lines that do not
/// yield the three mandatory fields are dropped.
pub fn parse_node_line(line: &str, airport: &str) -> Option<Node> {
    let (name, body) = line.split_once('=')?;
    let name = name.trim();

    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 3 {
        return None;
    }
    let kind = fields[0].trim();
    let server = fields[1].trim();
    let port = fields[2].trim();
    if name.is_empty() || kind.is_empty() || server.is_empty() || port.is_empty() {
        return None;
    }

    // Both representations are kept: the map for lookup and overwrite, the
    // joined string so output preserves the upstream attribute order.
    let mut params = IndexMap::new();
    let mut param_tokens = Vec::new();
    for token in &fields[3..] {
        let token = token.trim();
        if let Some((k, v)) = token.split_once('=') {
            params.insert(k.to_string(), v.to_string());
            param_tokens.push(token.to_string());
        }
    }

    Some(Node {
        origin_name: name.to_string(),
        kind: kind.to_string(),
        server: server.to_string(),
        port: port.to_string(),
        params,
        param_string: param_tokens.join(","),
        source: airport.to_string(),
        iso: String::new(),
        emoji: String::new(),
    })
}
