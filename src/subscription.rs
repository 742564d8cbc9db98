use futures::future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Some providers serve different payloads by UA, so the fetch impersonates
/// the downstream client.
const USER_AGENT: &str = "Surge";
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fetch every configured subscription in parallel. A source that fails
/// both attempts yields an empty line list; the stage itself never fails.
pub async fn fetch_all(airports: &[(String, String)]) -> Vec<(String, Vec<String>)> {
    let client = match reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build subscription client: {e:#}");
            return airports
                .iter()
                .map(|(name, _)| (name.clone(), Vec::new()))
                .collect();
        }
    };

    let fetches = airports.iter().map(|(name, url)| {
        let client = client.clone();
        async move { (name.clone(), fetch_one(&client, name, url).await) }
    });
    future::join_all(fetches).await
}

/// One GET with a single retry after a short pause.
async fn fetch_one(client: &reqwest::Client, airport: &str, url: &str) -> Vec<String> {
    for attempt in 0..2 {
        let last = attempt == 1;
        match client.get(url).send().await {
            Ok(resp) if resp.status().as_u16() == 200 => match resp.text().await {
                Ok(body) => {
                    let lines: Vec<String> = body.lines().map(str::to_string).collect();
                    if lines.is_empty() {
                        warn!("[{airport}] subscription body is empty");
                    } else {
                        let count = crate::parser::extract_proxy_lines(&lines).len();
                        info!("[{airport}] raw node count: {count}");
                    }
                    return lines;
                }
                Err(e) => {
                    if last {
                        error!("[{airport}] read subscription body failed: {e:#}");
                    }
                }
            },
            Ok(resp) => {
                if last {
                    error!("[{airport}] unexpected HTTP status: {}", resp.status());
                }
            }
            Err(e) => {
                if last {
                    error!("[{airport}] subscription request failed: {e:#}");
                }
            }
        }
        if !last {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    Vec::new()
}
