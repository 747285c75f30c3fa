//! Port probing for the UI server

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use tracing::debug;

/// True if nothing can bind `127.0.0.1:port`
pub fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)) {
        Ok(_) => false,
        Err(e) => {
            debug!("Port {} unavailable: {}", port, e);
            true
        }
    }
}

/// First free port in `start..=end`
pub fn find_available_port(start: u16, end: u16) -> Option<u16> {
    (start..=end).find(|&port| port != 0 && !is_port_in_use(port))
}
