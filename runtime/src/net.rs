//! Host-to-container port forwarding.
//!
//! EXPOSE in a Stratafile is metadata only; nothing listens on the host
//! until a mapping is supplied at run time. Each mapping gets a userspace
//! TCP forwarder: an accept loop on the host port proxying byte streams
//! to the container's bound port on loopback.

use std::net::SocketAddr;

use strata_core::error::{Result, StrataError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One `host:container` port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    /// Parse `"3000:8080"`; a bare `"3000"` maps the port onto itself.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || {
            StrataError::ConfigError(format!(
                "Invalid port mapping '{spec}' (expected HOST:CONTAINER)"
            ))
        };

        match spec.split_once(':') {
            Some((host, container)) => Ok(PortMapping {
                host: host.parse().map_err(|_| invalid())?,
                container: container.parse().map_err(|_| invalid())?,
            }),
            None => {
                let port: u16 = spec.parse().map_err(|_| invalid())?;
                Ok(PortMapping {
                    host: port,
                    container: port,
                })
            }
        }
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// A running host-port forwarder. Stops when dropped.
#[derive(Debug)]
pub struct PortForwarder {
    host_port: u16,
    task: JoinHandle<()>,
}

impl PortForwarder {
    /// Bind the host port and start proxying to `127.0.0.1:container_port`.
    ///
    /// An occupied host port aborts container startup with
    /// `NetworkBindFailure` naming the port.
    pub async fn bind(host_port: u16, container_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", host_port))
            .await
            .map_err(|e| StrataError::NetworkBindFailure {
                port: host_port,
                message: e.to_string(),
            })?;
        let bound = listener
            .local_addr()
            .map_err(|e| StrataError::NetworkBindFailure {
                port: host_port,
                message: e.to_string(),
            })?
            .port();

        let target: SocketAddr = ([127, 0, 0, 1], container_port).into();
        let task = tokio::spawn(async move {
            loop {
                let Ok((inbound, peer)) = listener.accept().await else {
                    break;
                };
                tracing::debug!(peer = %peer, target = %target, "Forwarding connection");
                tokio::spawn(proxy(inbound, target));
            }
        });

        tracing::info!(host_port = bound, container_port, "Port forwarder listening");

        Ok(PortForwarder {
            host_port: bound,
            task,
        })
    }

    /// The actual bound host port (useful when 0 was requested).
    pub fn host_port(&self) -> u16 {
        self.host_port
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn proxy(mut inbound: TcpStream, target: SocketAddr) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(target = %target, error = %e, "Container port not reachable");
            return;
        }
    };
    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // --- PortMapping ---

    #[test]
    fn test_parse_mapping_pair() {
        let mapping = PortMapping::parse("3000:8080").unwrap();
        assert_eq!(mapping.host, 3000);
        assert_eq!(mapping.container, 8080);
    }

    #[test]
    fn test_parse_mapping_bare_port() {
        let mapping = PortMapping::parse("3000").unwrap();
        assert_eq!(mapping.host, 3000);
        assert_eq!(mapping.container, 3000);
    }

    #[test]
    fn test_parse_mapping_invalid() {
        assert!(PortMapping::parse("http:80").is_err());
        assert!(PortMapping::parse("80:").is_err());
        assert!(PortMapping::parse("").is_err());
    }

    #[test]
    fn test_mapping_display() {
        let mapping = PortMapping {
            host: 3000,
            container: 8080,
        };
        assert_eq!(mapping.to_string(), "3000:8080");
    }

    // --- PortForwarder ---

    /// Echo server standing in for the container's bound socket.
    async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_forwarder_routes_to_container_port() {
        let container_port = spawn_echo_server().await;
        let forwarder = PortForwarder::bind(0, container_port).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", forwarder.host_port()))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_forwarder_occupied_port_is_bind_failure() {
        let taken = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = PortForwarder::bind(port, 9999).await.unwrap_err();
        match err {
            StrataError::NetworkBindFailure { port: reported, .. } => {
                assert_eq!(reported, port);
            }
            other => panic!("expected NetworkBindFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forwarder_stops_on_drop() {
        let container_port = spawn_echo_server().await;
        let forwarder = PortForwarder::bind(0, container_port).await.unwrap();
        let host_port = forwarder.host_port();
        drop(forwarder);

        // Give the abort a moment, then the port must be free again
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpListener::bind(("0.0.0.0", host_port)).await.is_ok());
    }
}
