use crate::error::{RallyError, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Listens for incoming worker connections on a bound TCP address.
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Resolve `host:service` and bind the first address that accepts.
    ///
    /// Service `0` binds an ephemeral port; read it back with [`local_addr`].
    ///
    /// [`local_addr`]: Self::local_addr
    pub async fn bind(host: &str, service: &str) -> Result<Self> {
        let endpoint = join_host_service(host, service);
        let addrs = resolve(&endpoint).await?;

        let mut last_err = None;
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr().map_err(|e| {
                        RallyError::transport_with_source(format!("local_addr of {addr}"), e)
                    })?;
                    return Ok(Self {
                        listener,
                        local_addr,
                    });
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "bind attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => RallyError::transport_with_source(format!("bind {endpoint}"), e),
            None => RallyError::transport(format!("bind {endpoint}: no addresses")),
        })
    }

    /// The actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next incoming TCP connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| RallyError::transport_with_source("accept", e))?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }
}

/// `host:service`, bracketing bare IPv6 literals.
pub(crate) fn join_host_service(host: &str, service: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{service}")
    } else {
        format!("{host}:{service}")
    }
}

/// Resolve an endpoint string to every address it names.
pub(crate) async fn resolve(endpoint: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| RallyError::transport_with_source(format!("resolve {endpoint}"), e))?
        .collect();
    if addrs.is_empty() {
        return Err(RallyError::transport(format!(
            "resolve {endpoint}: no addresses"
        )));
    }
    Ok(addrs)
}
