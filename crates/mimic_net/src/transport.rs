use std::io;
use std::net::SocketAddr;

use mimic_traits::{BoxedStream, DialError, Destination};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

use crate::proxy::ProxyConfig;

/// Opens the raw byte stream a handshake runs over: a direct TCP connection,
/// or a tunnel through the configured proxy.
#[derive(Debug, Clone, Default)]
pub struct TransportConnector {
    proxy: Option<ProxyConfig>,
    local_addr: Option<SocketAddr>,
}

impl TransportConnector {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self {
            proxy,
            local_addr: None,
        }
    }

    /// Binds outgoing sockets to `addr` before connecting.
    pub fn with_local_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub async fn connect(&self, dest: &Destination) -> Result<BoxedStream, DialError> {
        match &self.proxy {
            None => {
                let stream = self.connect_host(dest).await.map_err(DialError::Connect)?;
                Ok(Box::new(stream))
            }
            Some(proxy) => {
                let mut stream = self
                    .connect_host(&proxy.address())
                    .await
                    .map_err(|e| DialError::Proxy(format!("{}: {}", proxy.address(), e)))?;
                proxy
                    .tunnel(&mut stream, dest)
                    .await
                    .map_err(|e| DialError::Proxy(e.to_string()))?;
                debug!(proxy = %proxy.address(), target = %dest, "proxy tunnel established");
                Ok(Box::new(stream))
            }
        }
    }

    /// Resolves `dest` and tries each address in turn, returning the last
    /// error if none accepts.
    async fn connect_host(&self, dest: &Destination) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host((dest.host.as_str(), dest.port)).await? {
            match connect_tcp(addr, self.local_addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    trace!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", dest.host),
            )
        }))
    }
}

/// Connects a TCP socket configured before any packet leaves the host.
pub async fn connect_tcp(addr: SocketAddr, local_addr: Option<SocketAddr>) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    if let Some(local) = local_addr {
        socket.bind(&SockAddr::from(local))?;
    }

    let std_stream: std::net::TcpStream = socket.into();
    TcpSocket::from_std_stream(std_stream).connect(addr).await
}
