//! Host port allocation for guest forwards.

use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Reserve `count` distinct free loopback ports.
///
/// All listeners are held until every port is known, so the returned ports
/// are distinct. They are released before return; another process could
/// take one before QEMU binds it, which surfaces as a launch failure.
pub fn allocate_ports(count: usize) -> io::Result<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<io::Result<Vec<_>>>()?;

    listeners
        .iter()
        .map(|listener| listener.local_addr().map(|addr| addr.port()))
        .collect()
}
