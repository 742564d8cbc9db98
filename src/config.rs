use anyhow::{Context, Result};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Layout of the persisted state under the data root.
#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn token(&self) -> PathBuf {
        self.data_dir.join("token")
    }

    pub fn node_conf(&self) -> PathBuf {
        self.data_dir.join("node.conf")
    }
}

/// Target for the optional manifest mirror, from `GISTS=gh_token@gist_id`.
#[derive(Debug, Clone)]
pub struct GistTarget {
    pub token: String,
    pub gist_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// (airport name, subscription url) pairs in configured order.
    pub airports: Vec<(String, String)>,
    pub token: String,
    pub gist: Option<GistTarget>,
    pub paths: Paths,
}

impl Config {
    /// Resolve the full runtime configuration from the environment.
    pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let paths = Paths::new(data_dir);
        fs::create_dir_all(paths.data_dir())
            .with_context(|| format!("create data dir {}", paths.data_dir().display()))?;

        let airports = match std::env::var("SUB") {
            Ok(sub) => parse_sub_env(&sub),
            Err(_) => {
                warn!("SUB is not set, no subscription sources configured");
                Vec::new()
            }
        };

        let token = resolve_token(std::env::var("TOKEN").ok().as_deref(), &paths.token())?;

        let gist = match std::env::var("GISTS") {
            Ok(gists) => parse_gist_env(&gists),
            Err(_) => None,
        };

        Ok(Self {
            airports,
            token,
            gist,
            paths,
        })
    }
}

/// Parse `name1=url1||name2=url2` into ordered pairs. Entries without an
/// `=` are dropped silently.
pub fn parse_sub_env(sub: &str) -> Vec<(String, String)> {
    sub.split("||")
        .filter_map(|part| {
            let (name, url) = part.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                return None;
            }
            Some((name.to_string(), url.to_string()))
        })
        .collect()
}

pub fn parse_gist_env(gists: &str) -> Option<GistTarget> {
    match gists.split_once('@') {
        Some((token, gist_id)) if !token.is_empty() && !gist_id.is_empty() => Some(GistTarget {
            token: token.trim().to_string(),
            gist_id: gist_id.trim().to_string(),
        }),
        _ => {
            warn!("GISTS is malformed, expected token@gist_id");
            None
        }
    }
}

/// Token resolution order: environment, then the persisted file, then a
/// freshly generated one which is written back for later runs.
fn resolve_token(env_token: Option<&str>, token_path: &Path) -> Result<String> {
    if let Some(token) = env_token.map(str::trim).filter(|t| !t.is_empty()) {
        info!("token taken from environment");
        return Ok(token.to_string());
    }
    if let Ok(data) = fs::read_to_string(token_path) {
        let token = data.trim().to_string();
        if !token.is_empty() {
            info!("token taken from {}", token_path.display());
            return Ok(token);
        }
    }
    let token = generate_token(32);
    fs::write(token_path, &token)
        .with_context(|| format!("write token file {}", token_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(token_path, fs::Permissions::from_mode(0o640))?;
    }
    info!("generated new token and wrote {}", token_path.display());
    Ok(token)
}

/// `n`-character lowercase hex token.
fn generate_token(n: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..n).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_env_parses_in_order() {
        let airports = parse_sub_env("a=http://x/1|| b = http://y/2 ||c=http://z/3");
        assert_eq!(
            airports,
            vec![
                ("a".to_string(), "http://x/1".to_string()),
                ("b".to_string(), "http://y/2".to_string()),
                ("c".to_string(), "http://z/3".to_string()),
            ]
        );
    }

    #[test]
    fn sub_env_drops_malformed_entries() {
        let airports = parse_sub_env("good=http://x||no-equals-here||=http://y||empty=");
        assert_eq!(airports, vec![("good".to_string(), "http://x".to_string())]);
        assert!(parse_sub_env("").is_empty());
    }

    #[test]
    fn gist_env_splits_on_first_at() {
        let gist = parse_gist_env("ghp_abc@deadbeef").unwrap();
        assert_eq!(gist.token, "ghp_abc");
        assert_eq!(gist.gist_id, "deadbeef");
        assert!(parse_gist_env("no-separator").is_none());
        assert!(parse_gist_env("@id-only").is_none());
    }

    #[test]
    fn generated_token_is_lowercase_hex() {
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn token_prefers_env_then_file_then_generates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        let token = resolve_token(Some("from-env"), &path).unwrap();
        assert_eq!(token, "from-env");
        assert!(!path.exists());

        std::fs::write(&path, "from-file\n").unwrap();
        let token = resolve_token(None, &path).unwrap();
        assert_eq!(token, "from-file");

        std::fs::remove_file(&path).unwrap();
        let token = resolve_token(None, &path).unwrap();
        assert_eq!(token.len(), 32);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), token);
    }
}
