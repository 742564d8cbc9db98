use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clash_lib::app::dns::SystemResolver;
use clash_lib::app::outbound::manager::OutboundManager;
use clash_lib::config::internal::proxy::OutboundProxyProtocol;
use clash_lib::session::{Session, SocksAddr};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Canonical proxy configuration in the shape the proxy library expects.
pub type ProxyParams = HashMap<String, serde_yaml::Value>;

/// A bidirectional byte stream tunnelled through a proxy.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedProxyStream = Box<dyn ProxyStream>;

/// The single capability the egress stage needs from the proxy library:
/// given a canonicalised parameter mapping, open a connection to host:port
/// whose stream then carries ordinary client traffic.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial(&self, proxy: &ProxyParams, host: &str, port: u16) -> Result<BoxedProxyStream>;
}

/// clash-lib backed dialer. One system resolver is shared across all
/// outbounds for the lifetime of the process.
pub struct ClashDialer {
    resolver: Arc<SystemResolver>,
}

impl ClashDialer {
    pub fn new() -> Result<Self> {
        let resolver = Arc::new(
            SystemResolver::new(false).map_err(|e| anyhow!("create DNS resolver: {e}"))?,
        );
        Ok(Self { resolver })
    }
}

#[async_trait]
impl ProxyDialer for ClashDialer {
    async fn dial(&self, proxy: &ProxyParams, host: &str, port: u16) -> Result<BoxedProxyStream> {
        let protocol = OutboundProxyProtocol::try_from(proxy.clone())
            .map_err(|e| anyhow!("unsupported proxy config: {e}"))?;
        let handler = OutboundManager::load_plain_outbounds(vec![protocol])
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("proxy library rejected the outbound"))?;

        let destination = match host.parse() {
            Ok(ip) => SocksAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => SocksAddr::Domain(host.to_string(), port),
        };
        let sess = Session {
            destination,
            ..Default::default()
        };
        let stream = handler
            .connect_stream(&sess, self.resolver.clone())
            .await
            .with_context(|| format!("connect through {} to {host}:{port}", handler.name()))?;
        Ok(Box::new(stream))
    }
}
