//! # UDP Relay Table
//!
//! Maps SOCKS5 UDP flows onto overlay destinations and back.
//!
//! | Map | Key | Value |
//! |-----|-----|-------|
//! | `routes` | destination the client addressed | client address |
//! | `udp_relays` | client address | socket allocated by its UDP ASSOCIATE |
//!
//! Outbound datagrams record both entries; return traffic from the overlay
//! is demultiplexed through them. Entries belong to the SOCKS5 connection
//! that created them and are cleared when it closes.
//!
//! Generic over the socket type so it can be exercised without I/O.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use tracing::debug;

use crate::messages::Endpoint;
use crate::socks5::{self, Socks5Error};

/// Identifies the SOCKS5 control connection owning an association.
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDrop {
    Malformed(Socks5Error),
    UnknownRoute(Endpoint),
    NoSocket(SocketAddr),
    /// Datagram from an address that does not own the association.
    ForeignClient(SocketAddr),
}

impl fmt::Display for RelayDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayDrop::Malformed(e) => write!(f, "malformed datagram: {e}"),
            RelayDrop::UnknownRoute(origin) => write!(f, "unknown peer {origin}"),
            RelayDrop::NoSocket(client) => write!(f, "no socket for client {client}"),
            RelayDrop::ForeignClient(addr) => write!(f, "datagram from foreign client {addr}"),
        }
    }
}

impl std::error::Error for RelayDrop {}

/// A datagram ready to go back to a SOCKS5 client.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnDatagram<S> {
    pub socket: S,
    pub client: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct UdpRelayTable<S> {
    routes: HashMap<Endpoint, SocketAddr>,
    udp_relays: HashMap<SocketAddr, S>,
    owners: HashMap<ConnectionId, HashSet<SocketAddr>>,
    drops_unknown_route: u64,
    drops_no_socket: u64,
    drops_malformed: u64,
}

impl<S> Default for UdpRelayTable<S> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            udp_relays: HashMap::new(),
            owners: HashMap::new(),
            drops_unknown_route: 0,
            drops_no_socket: 0,
            drops_malformed: 0,
        }
    }
}

impl<S: Clone> UdpRelayTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a client datagram and record where its replies must go.
    /// Returns the destination and payload to hand to the overlay.
    pub fn outbound(
        &mut self,
        conn: ConnectionId,
        client: SocketAddr,
        socket: S,
        datagram: &[u8],
    ) -> Result<(Endpoint, Vec<u8>), RelayDrop> {
        let (destination, payload) = socks5::decode_udp(datagram).map_err(|e| {
            self.drops_malformed += 1;
            RelayDrop::Malformed(e)
        })?;
        self.routes.insert(destination.clone(), client);
        self.udp_relays.insert(client, socket);
        self.owners.entry(conn).or_default().insert(client);
        Ok((destination, payload.to_vec()))
    }

    /// Resolve overlay return traffic from `origin` to the client it belongs
    /// to, re-encapsulated in a SOCKS5 UDP header.
    pub fn inbound(&mut self, origin: &Endpoint, payload: &[u8]) -> Result<ReturnDatagram<S>, RelayDrop> {
        let Some(&client) = self.routes.get(origin) else {
            self.drops_unknown_route += 1;
            debug!(origin = %origin, "dropping return datagram from unknown peer");
            return Err(RelayDrop::UnknownRoute(origin.clone()));
        };
        let Some(socket) = self.udp_relays.get(&client) else {
            self.drops_no_socket += 1;
            debug!(client = %client, origin = %origin, "dropping return datagram, no socket");
            return Err(RelayDrop::NoSocket(client));
        };
        let socket = socket.clone();
        let bytes = socks5::encode_udp(origin, payload).map_err(|e| {
            self.drops_malformed += 1;
            debug!(client = %client, error = %e, "dropping return datagram, origin not encodable");
            RelayDrop::Malformed(e)
        })?;
        Ok(ReturnDatagram { socket, client, bytes })
    }

    /// Forget the socket of `client` after it failed; routes stay so later
    /// returns are counted as socketless.
    pub fn remove_socket(&mut self, client: SocketAddr) {
        self.udp_relays.remove(&client);
    }

    /// Drop every entry created through `conn`.
    pub fn clear_connection(&mut self, conn: ConnectionId) {
        let Some(clients) = self.owners.remove(&conn) else {
            return;
        };
        for client in &clients {
            self.udp_relays.remove(client);
        }
        self.routes.retain(|_, client| !clients.contains(client));
        debug!(conn, clients = clients.len(), "cleared udp associations");
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn socket_count(&self) -> usize {
        self.udp_relays.len()
    }

    pub fn drops_unknown_route(&self) -> u64 {
        self.drops_unknown_route
    }

    pub fn drops_no_socket(&self) -> u64 {
        self.drops_no_socket
    }

    pub fn drops_malformed(&self) -> u64 {
        self.drops_malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for a socket: just a label.
    type Sock = &'static str;

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn dns() -> Endpoint {
        Endpoint::Ip("1.2.3.4:53".parse().unwrap())
    }

    #[test]
    fn round_trip_through_the_table() {
        let mut table: UdpRelayTable<Sock> = UdpRelayTable::new();
        let datagram = socks5::encode_udp(&dns(), b"q").unwrap();

        let (dest, payload) = table.outbound(1, client(), "sock-a", &datagram).unwrap();
        assert_eq!(dest, dns());
        assert_eq!(payload, b"q");

        let back = table.inbound(&dns(), b"a").unwrap();
        assert_eq!(back.socket, "sock-a");
        assert_eq!(back.client, client());
        assert_eq!(back.bytes, vec![0, 0, 0, 0x01, 1, 2, 3, 4, 0, 53, b'a']);
    }

    #[test]
    fn unknown_return_peer_is_dropped() {
        let mut table: UdpRelayTable<Sock> = UdpRelayTable::new();
        let stranger = Endpoint::Ip("9.9.9.9:1".parse().unwrap());
        assert_eq!(
            table.inbound(&stranger, b"x"),
            Err(RelayDrop::UnknownRoute(stranger.clone()))
        );
        assert_eq!(table.drops_unknown_route(), 1);
        assert_eq!(table.drops_no_socket(), 0);
    }

    #[test]
    fn missing_socket_is_dropped() {
        let mut table: UdpRelayTable<Sock> = UdpRelayTable::new();
        table
            .outbound(1, client(), "sock-a", &socks5::encode_udp(&dns(), b"q").unwrap())
            .unwrap();
        table.remove_socket(client());
        assert_eq!(table.inbound(&dns(), b"a"), Err(RelayDrop::NoSocket(client())));
        assert_eq!(table.drops_no_socket(), 1);
    }

    #[test]
    fn closing_a_connection_clears_its_entries() {
        let mut table: UdpRelayTable<Sock> = UdpRelayTable::new();
        let other: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let web = Endpoint::Domain {
            host: "example.org".into(),
            port: 443,
        };
        table
            .outbound(1, client(), "a", &socks5::encode_udp(&dns(), b"q").unwrap())
            .unwrap();
        table
            .outbound(2, other, "b", &socks5::encode_udp(&web, b"q").unwrap())
            .unwrap();

        table.clear_connection(1);
        assert_eq!(table.route_count(), 1);
        assert_eq!(table.socket_count(), 1);
        assert!(table.inbound(&dns(), b"a").is_err());
        assert_eq!(table.inbound(&web, b"a").unwrap().socket, "b");
    }

    #[test]
    fn malformed_datagram_is_counted() {
        let mut table: UdpRelayTable<Sock> = UdpRelayTable::new();
        let err = table.outbound(1, client(), "a", &[0, 0, 1, 1]).unwrap_err();
        assert_eq!(err, RelayDrop::Malformed(Socks5Error::Fragmented(1)));
        assert_eq!(table.drops_malformed(), 1);
        assert_eq!(table.route_count(), 0);
    }
}
