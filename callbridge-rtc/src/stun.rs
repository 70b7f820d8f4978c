//! Public address discovery through STUN
//!
//! At startup the server probes each listen interface against the
//! configured STUN servers so ICE candidates can advertise the public
//! address instead of the interface one.

use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use webrtc::stun::agent::TransactionId;
use webrtc::stun::message::{Getter, Message, BINDING_REQUEST};
use webrtc::stun::xoraddr::XorMappedAddress;

const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Extracts `host:port` from a `stun:` URI, defaulting the port to 3478.
pub fn stun_server_addr(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("stun:")
        .ok_or_else(|| Error::Config(format!("invalid STUN URL: {url}")))?;
    // Strip any RFC 7064 query part.
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return Err(Error::Config(format!("invalid STUN URL: {url}")));
    }
    if rest.contains(':') {
        Ok(rest.to_string())
    } else {
        Ok(format!("{rest}:3478"))
    }
}

/// Resolves the public (reflexive) address of `local_addr` by sending a
/// Binding request to the first STUN server that answers.
pub async fn discover_public_ip(local_addr: SocketAddr, stun_urls: &[String]) -> Result<IpAddr> {
    if stun_urls.is_empty() {
        return Err(Error::Config("no STUN servers configured".to_string()));
    }

    let mut last_err = Error::Config("no STUN server answered".to_string());

    for url in stun_urls {
        let server = stun_server_addr(url)?;
        match binding_request(local_addr, &server).await {
            Ok(addr) => return Ok(addr),
            Err(err) => {
                tracing::warn!(%err, server = %server, "STUN binding request failed");
                last_err = err;
            }
        }
    }

    Err(last_err)
}

async fn binding_request(local_addr: SocketAddr, server: &str) -> Result<IpAddr> {
    // The probe binds the service address itself so the reflexive mapping
    // matches the port peers will reach; it runs before the media socket
    // is created.
    let socket = UdpSocket::bind(local_addr).await?;
    socket.connect(server).await?;

    let mut req = Message::new();
    req.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(|e| Error::Config(format!("failed to build STUN request: {e}")))?;

    socket.send(&req.raw).await?;

    let mut buf = vec![0u8; 1500];
    let n = timeout(STUN_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::SignalingTimeout)??;

    let mut res = Message::new();
    res.raw = buf[..n].to_vec();
    res.decode()
        .map_err(|e| Error::Config(format!("failed to decode STUN response: {e}")))?;

    let mut reflexive = XorMappedAddress::default();
    reflexive
        .get_from(&res)
        .map_err(|e| Error::Config(format!("no XOR-MAPPED-ADDRESS in STUN response: {e}")))?;

    Ok(reflexive.ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_server_addr() {
        assert_eq!(
            stun_server_addr("stun:stun.example.com:3478").unwrap(),
            "stun.example.com:3478"
        );
        assert_eq!(
            stun_server_addr("stun:stun.example.com").unwrap(),
            "stun.example.com:3478"
        );
        assert!(stun_server_addr("turn:turn.example.com").is_err());
        assert!(stun_server_addr("stun:").is_err());
    }
}
