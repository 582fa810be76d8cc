//! Candidate endpoint resolution
//!
//! Combines the two discovery paths: STUN for the public endpoint we hand to a
//! remote peer, and local multicast for a peer on the same network.

use tracing::{debug, info};

use super::mdns::{MdnsConfig, MdnsDiscovery, RendezvousHash};
use super::stun::{StunClient, StunConfig};
use crate::endpoint::Endpoint;
use crate::error::NetworkResult;
use crate::transport::ReliableTransport;

/// Produces candidate endpoints for a peer
pub struct Resolver {
    stun_config: StunConfig,
    mdns_config: MdnsConfig,
    mdns: Option<MdnsDiscovery>,
    public_endpoint: Option<Endpoint>,
}

impl Resolver {
    pub fn new(stun_config: StunConfig, mdns_config: MdnsConfig) -> Self {
        Self {
            stun_config,
            mdns_config,
            mdns: None,
            public_endpoint: None,
        }
    }

    /// Announce `hash` locally, creating the multicast listener on first use
    pub fn start_local_discovery(&mut self, hash: RendezvousHash, port: u16) -> NetworkResult<()> {
        if self.mdns.is_none() {
            self.mdns = Some(MdnsDiscovery::new(self.mdns_config.clone())?);
        }
        if let Some(mdns) = self.mdns.as_mut() {
            mdns.announce(hash, port);
        }
        Ok(())
    }

    /// Stop announcing; the listener stays open
    pub fn stop_local_discovery(&mut self) {
        if let Some(mdns) = self.mdns.as_mut() {
            mdns.stop_announcing();
        }
    }

    /// Endpoint of a local peer announcing `hash`, if one has shown up.
    ///
    /// Always `None` before [`Resolver::start_local_discovery`].
    pub fn poll_local_peer(&mut self, hash: &RendezvousHash) -> NetworkResult<Option<Endpoint>> {
        let Some(mdns) = self.mdns.as_mut() else {
            return Ok(None);
        };
        Ok(mdns.poll(hash)?.map(|peer| peer.endpoint()))
    }

    /// Public endpoint of a fresh ephemeral socket
    pub async fn query_public_endpoint(&mut self) -> NetworkResult<Endpoint> {
        let client = StunClient::new("0.0.0.0:0").await?.with_timeout(self.stun_config.timeout);
        self.query_with(client).await
    }

    /// Public endpoint of `transport`'s own socket: the one a remote peer must punch towards
    pub async fn query_public_endpoint_for(&mut self, transport: &ReliableTransport) -> NetworkResult<Endpoint> {
        let client = StunClient::from_std(transport.try_clone_socket()?)?.with_timeout(self.stun_config.timeout);
        self.query_with(client).await
    }

    /// Last endpoint learned through STUN
    pub fn public_endpoint(&self) -> Option<Endpoint> {
        self.public_endpoint
    }

    /// Multicast listener, once created
    pub fn local_discovery(&self) -> Option<&MdnsDiscovery> {
        self.mdns.as_ref()
    }

    async fn query_with(&mut self, client: StunClient) -> NetworkResult<Endpoint> {
        debug!("Querying {} STUN servers", self.stun_config.servers.len());
        let endpoint = client.query_first(&self.stun_config.servers).await?;
        if self.public_endpoint != Some(endpoint) {
            info!("Public endpoint is now {}", endpoint);
        }
        self.public_endpoint = Some(endpoint);
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Duration;

    use super::*;
    use crate::error::NetworkError;
    use crate::p2p::mdns::MdnsAnnouncement;
    use crate::p2p::stun::build_binding_response;
    use crate::transport::TransportConfig;

    /// Loopback STUN server that reflects the sender's address
    fn spawn_reflector() -> String {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 576];
            while let Ok((len, from)) = server.recv_from(&mut buf) {
                if len < 20 {
                    continue;
                }
                let from = Endpoint::try_from(from).unwrap();
                let reply = build_binding_response(&buf[8..20], from);
                let _ = server.send_to(&reply, from.to_socket_addr());
            }
        });
        addr.to_string()
    }

    fn stun_config(servers: Vec<String>) -> StunConfig {
        StunConfig {
            servers,
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_public_endpoint_uses_transport_socket() {
        let mut resolver = Resolver::new(stun_config(vec![spawn_reflector()]), MdnsConfig::default());
        let transport = ReliableTransport::bind("127.0.0.1:0".parse().unwrap(), TransportConfig::default()).unwrap();

        assert!(resolver.public_endpoint().is_none());
        let endpoint = resolver.query_public_endpoint_for(&transport).await.unwrap();
        assert_eq!(endpoint, transport.local_endpoint().unwrap());
        assert_eq!(resolver.public_endpoint(), Some(endpoint));
    }

    #[tokio::test]
    async fn test_all_servers_failing() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = Resolver::new(
            stun_config(vec![silent.local_addr().unwrap().to_string()]),
            MdnsConfig::default(),
        );

        assert!(matches!(
            resolver.query_public_endpoint().await,
            Err(NetworkError::AllDiscoveryServersFailed)
        ));
        assert!(resolver.public_endpoint().is_none());
    }

    #[test]
    fn test_local_peer_lookup() {
        let mut resolver = Resolver::new(
            StunConfig::default(),
            MdnsConfig {
                port: 0,
                ..Default::default()
            },
        );
        let hash = RendezvousHash::from_code("3-silver-orchard");

        // Nothing to poll before discovery starts
        assert_eq!(resolver.poll_local_peer(&hash).unwrap(), None);

        resolver.start_local_discovery(hash, 5000).unwrap();
        let port = resolver.local_discovery().unwrap().port();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let announcement = MdnsAnnouncement::new(hash, 6000, Duration::from_secs(10));
        peer.send_to(&announcement.encode(), ("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        let found = loop {
            if let Some(endpoint) = resolver.poll_local_peer(&hash).unwrap() {
                break endpoint;
            }
            assert!(std::time::Instant::now() < deadline, "local peer not found");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(found, Endpoint::new([127, 0, 0, 1], 6000));

        resolver.stop_local_discovery();
        assert!(resolver.local_discovery().unwrap().announcement().is_none());
    }
}
