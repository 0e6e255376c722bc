//! Probe mechanisms.

use crate::icmp::EchoPacket;
use crate::types::{ProbeError, ProbeKind};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

/// Echo payload; replies carry it back unchanged.
const ECHO_PAYLOAD: &[u8] = b"liveness-probe\0\0";

/// Reachability probe mechanism.
///
/// Returns the round-trip time when the host answered. Timeouts are applied
/// by the caller.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe a single address
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError>;

    /// Get the name of this prober
    fn name(&self) -> &str;
}

/// Build the prober for a configured probe kind
pub fn build_prober(kind: &ProbeKind, timeout: Duration) -> Result<Arc<dyn Prober>, ProbeError> {
    let prober: Arc<dyn Prober> = match kind {
        ProbeKind::Icmp => Arc::new(IcmpProber::new()),
        ProbeKind::Tcp { port } => Arc::new(TcpProber::new(*port)),
        ProbeKind::Http {
            port,
            path,
            expected_codes,
            https,
        } => Arc::new(HttpProber::new(
            *port,
            path.clone(),
            expected_codes.clone(),
            *https,
            timeout,
        )?),
    };
    Ok(prober)
}

/// Resolve an IP literal or host name to a socket address
async fn resolve(address: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((address, port))
        .await
        .map_err(|e| ProbeError::Resolve(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| ProbeError::Resolve(address.to_string()))
}

/// ICMP echo prober
pub struct IcmpProber {
    identifier: u16,
    sequence: AtomicU16,
}

impl IcmpProber {
    /// Create a new ICMP prober
    pub fn new() -> Self {
        Self {
            identifier: (std::process::id() & 0xFFFF) as u16,
            sequence: AtomicU16::new(0),
        }
    }

    /// Open an ICMP socket for one probe.
    ///
    /// Prefers an unprivileged datagram socket, falling back to a raw socket
    /// (needs CAP_NET_RAW). Returns whether the kernel owns the echo identifier,
    /// which is the case for datagram sockets.
    fn open_socket(ipv6: bool) -> std::io::Result<(UdpSocket, bool)> {
        let (domain, protocol) = if ipv6 {
            (Domain::IPV6, Protocol::ICMPV6)
        } else {
            (Domain::IPV4, Protocol::ICMPV4)
        };

        let (socket, kernel_identifier) = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => (socket, true),
            Err(e) => {
                trace!(error = %e, "Datagram ICMP socket unavailable, using raw socket");
                (Socket::new(domain, Type::RAW, Some(protocol))?, false)
            }
        };
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok((socket, kernel_identifier))
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError> {
        let target = resolve(address, 0).await?;
        let ipv6 = target.is_ipv6();
        let (socket, kernel_identifier) = Self::open_socket(ipv6)?;
        socket.connect(target).await?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let request = EchoPacket::request(ipv6, self.identifier, sequence, ECHO_PAYLOAD);

        let start = Instant::now();
        socket.send(&request.to_bytes()).await?;

        let mut buf = [0u8; 1500];
        loop {
            let len = socket.recv(&mut buf).await?;
            match EchoPacket::parse_reply(&buf[..len], ipv6) {
                Ok(reply)
                    if reply.sequence == sequence
                        && (kernel_identifier || reply.identifier == self.identifier) =>
                {
                    let rtt = start.elapsed();
                    debug!(target = %target.ip(), rtt_us = rtt.as_micros() as u64, "Echo reply received");
                    return Ok(rtt);
                }
                Ok(_) => trace!(target = %target.ip(), "Ignoring unrelated echo reply"),
                Err(reason) => trace!(target = %target.ip(), reason, "Ignoring ICMP message"),
            }
        }
    }

    fn name(&self) -> &str {
        "icmp"
    }
}

/// TCP connect prober
pub struct TcpProber {
    port: u16,
}

impl TcpProber {
    /// Create a new TCP prober
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError> {
        let target = resolve(address, self.port).await?;
        let start = Instant::now();

        let _stream = TcpStream::connect(target).await?;
        let duration = start.elapsed();
        debug!(target = %target, duration_ms = duration.as_millis(), "TCP probe successful");
        Ok(duration)
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

/// HTTP prober
pub struct HttpProber {
    port: u16,
    path: String,
    expected_codes: Vec<u16>,
    https: bool,
    client: reqwest::Client,
}

impl HttpProber {
    /// Create a new HTTP prober
    pub fn new(
        port: u16,
        path: String,
        expected_codes: Vec<u16>,
        https: bool,
        timeout_duration: Duration,
    ) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .build()?;

        Ok(Self {
            port,
            path,
            expected_codes,
            https,
            client,
        })
    }

    fn url(&self, address: &str) -> String {
        let protocol = if self.https { "https" } else { "http" };
        let host = match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => address.to_string(),
        };
        format!("{}://{}:{}{}", protocol, host, self.port, self.path)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError> {
        let url = self.url(address);
        let start = Instant::now();

        let response = self.client.get(&url).send().await?;
        let duration = start.elapsed();
        let status_code = response.status().as_u16();

        if self.expected_codes.is_empty() || self.expected_codes.contains(&status_code) {
            debug!(url = %url, status = status_code, duration_ms = duration.as_millis(), "HTTP probe successful");
            Ok(duration)
        } else {
            Err(ProbeError::UnexpectedStatus(status_code))
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
