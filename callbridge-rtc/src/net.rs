//! UDP socket and interface plumbing
//!
//! All sessions share a single UDP port: one socket with large kernel
//! buffers is wrapped in an ICE UDP mux that every peer connection is
//! pointed at.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use webrtc::ice::udp_mux::{UDPMux, UDPMuxDefault, UDPMuxParams};

/// Target kernel buffer size for the shared media socket.
pub const UDP_SOCKET_BUFFER_SIZE: usize = 1024 * 1024 * 16;

/// Non-loopback IPv4 addresses of the local interfaces.
pub fn system_ips() -> Result<Vec<Ipv4Addr>> {
    let mut ips = Vec::new();

    let ifaces = if_addrs::get_if_addrs()?;
    for iface in ifaces {
        if let IpAddr::V4(ip) = iface.ip() {
            if !ip.is_loopback() && !ip.is_link_local() {
                ips.push(ip);
            }
        }
    }

    if ips.is_empty() {
        return Err(Error::NoListenAddress);
    }

    Ok(ips)
}

/// Creates a non-blocking UDP socket bound to `addr` with the requested
/// kernel buffer sizes.
pub fn create_udp_socket(addr: SocketAddr, buffer_size: usize) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(err) = socket.set_recv_buffer_size(buffer_size) {
        warn!(%err, buffer_size, "failed to set UDP receive buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(buffer_size) {
        warn!(%err, buffer_size, "failed to set UDP send buffer size");
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    debug!(
        %addr,
        recv_buffer = socket.recv_buffer_size().unwrap_or(0),
        send_buffer = socket.send_buffer_size().unwrap_or(0),
        "created UDP socket"
    );

    UdpSocket::from_std(socket.into()).map_err(Error::from)
}

/// Builds the shared ICE UDP mux on top of the media socket.
pub fn create_udp_mux(socket: UdpSocket) -> Arc<dyn UDPMux + Send + Sync> {
    UDPMuxDefault::new(UDPMuxParams::new(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_udp_socket_binds() {
        let socket =
            create_udp_socket("127.0.0.1:0".parse().unwrap(), UDP_SOCKET_BUFFER_SIZE).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }
}
