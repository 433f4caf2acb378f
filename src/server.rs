use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{LeaseAllocator, MacAddr};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket, MAX_HLEN};

const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    handler: Arc<Handler>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    pub async fn new(config: Config, allocator: Arc<LeaseAllocator>) -> Result<Self> {
        let config = Arc::new(config);
        let socket = Arc::new(Self::create_socket(config.listen_port)?);

        info!(
            "DHCP server starting on port {} (pool {} - {})",
            config.listen_port,
            config.start_ip,
            config.pool_end()
        );

        Ok(Self {
            handler: Arc::new(Handler::new(config, allocator)),
            socket,
        })
    }

    fn create_socket(listen_port: u16) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, listen_port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = Arc::clone(&self.handler);
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        match handler.handle(&data, source).await {
                            Ok(Some((reply, destination))) => {
                                if let Err(error) =
                                    socket.send_to(&reply.encode(), destination).await
                                {
                                    warn!("Failed to send reply to {}: {}", destination, error);
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                warn!("Error handling packet from {}: {}", source, error);
                            }
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }
}

/// Translates DHCP messages into allocator calls and builds the replies.
///
/// Stateless apart from the immutable configuration and the allocator
/// handle, so one instance serves every in-flight packet.
pub struct Handler {
    config: Arc<Config>,
    allocator: Arc<LeaseAllocator>,
}

impl Handler {
    pub fn new(config: Arc<Config>, allocator: Arc<LeaseAllocator>) -> Self {
        Self { config, allocator }
    }

    /// Processes one datagram and returns the reply to send, if any.
    pub async fn handle(
        &self,
        data: &[u8],
        source: SocketAddr,
    ) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        let packet = DhcpPacket::parse(data)?;

        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        if packet.hlen > MAX_HLEN {
            return Err(Error::InvalidPacket(format!(
                "Hardware address length {} exceeds {}",
                packet.hlen, MAX_HLEN
            )));
        }

        let mac = MacAddr::from_chaddr(&packet.chaddr)
            .ok_or_else(|| Error::InvalidPacket("Truncated hardware address".to_string()))?;

        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::InvalidPacket("Missing message type option".to_string()))?;

        info!("{} from {} ({})", message_type, mac, source);

        match message_type {
            MessageType::Discover => self.handle_discover(&packet, mac, source).await,
            MessageType::Request => self.handle_request(&packet, mac, source).await,
            MessageType::Release | MessageType::Decline => {
                self.handle_release(&packet, mac).await
            }
            other => {
                debug!("Ignoring {} message", other);
                Ok(None)
            }
        }
    }

    async fn handle_discover(
        &self,
        packet: &DhcpPacket,
        mac: MacAddr,
        source: SocketAddr,
    ) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        let offered = match self.allocator.acquire_first_free().await {
            Ok(ip) => ip,
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, cannot offer IP to {}", mac);
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        let offer = DhcpPacket::create_reply(
            packet,
            MessageType::Offer,
            offered,
            self.config.server_ip,
            self.reply_options(packet),
        );

        info!("OFFER {} to {}", offered, mac);

        Ok(Some((offer, self.reply_destination(packet, source))))
    }

    async fn handle_request(
        &self,
        packet: &DhcpPacket,
        mac: MacAddr,
        source: SocketAddr,
    ) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        if let Some(server_id) = packet.server_identifier()
            && server_id != self.config.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            return Ok(None);
        }

        let requested = packet
            .requested_ip()
            .or((packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr));

        let Some(requested) = requested else {
            return Ok(Some(self.nak(packet, source, mac, "no address in request")));
        };

        if requested == Ipv4Addr::UNSPECIFIED || !self.allocator.contains(requested) {
            return Ok(Some(self.nak(packet, source, mac, "address not in pool")));
        }

        if let Some(current) = self.allocator.lookup(requested).await?
            && current != mac
        {
            return Ok(Some(self.nak(packet, source, mac, "address held by another client")));
        }

        self.allocator
            .bind(requested, mac, self.allocator.lease_duration())
            .await?;

        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            requested,
            self.config.server_ip,
            self.reply_options(packet),
        );

        info!(
            "ACK {} to {} (lease: {} seconds)",
            requested, mac, self.config.lease_duration_seconds
        );

        Ok(Some((ack, self.reply_destination(packet, source))))
    }

    async fn handle_release(
        &self,
        packet: &DhcpPacket,
        mac: MacAddr,
    ) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        if packet.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", mac);
            return Ok(None);
        }

        self.allocator.release(packet.ciaddr, mac).await?;

        info!("Mapping {} - {} released", mac, packet.ciaddr);

        Ok(None)
    }

    fn nak(
        &self,
        packet: &DhcpPacket,
        source: SocketAddr,
        mac: MacAddr,
        reason: &str,
    ) -> (DhcpPacket, SocketAddr) {
        let nak = DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.config.server_ip,
            vec![DhcpOption::ServerIdentifier(self.config.server_ip)],
        );

        warn!("NAK to {}: {}", mac, reason);

        (nak, self.reply_destination(packet, source))
    }

    /// Replies go back to the client's source address and port; clients
    /// that have no address yet, or that set the broadcast flag, get the
    /// reply on the broadcast address instead.
    fn reply_destination(&self, packet: &DhcpPacket, source: SocketAddr) -> SocketAddr {
        if source.ip().is_unspecified() || packet.is_broadcast() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), source.port())
        } else {
            source
        }
    }

    fn reply_options(&self, packet: &DhcpPacket) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.config.server_ip),
            DhcpOption::LeaseTime(self.config.lease_duration_seconds),
        ];
        options.extend(self.select_configured(packet.parameter_request_list()));
        options
    }

    // The parameter request list picks which of the configured options the
    // client gets, in the client's order; no list means all of them.
    fn select_configured(&self, requested: Option<&[u8]>) -> Vec<DhcpOption> {
        let configured = [
            DhcpOption::SubnetMask(self.config.subnet_mask),
            DhcpOption::Router(vec![self.config.router_ip]),
            DhcpOption::DnsServer(vec![self.config.dns_ip]),
        ];

        match requested {
            None => configured.to_vec(),
            Some(codes) => codes
                .iter()
                .filter_map(|code| {
                    configured
                        .iter()
                        .find(|option| option.code() == *code)
                        .cloned()
                })
                .collect(),
        }
    }
}
