//! Replica address configuration consumed by the bus.
//!
//! The wider process accepts a comma-separated list of `ipv4[:port]` entries
//! (one per replica, in index order) and hands the parsed addresses to
//! [`MessageBus::init`](crate::message_bus::MessageBus::init). Entries omit
//! the port to use [`PORT_DEFAULT`].

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

use crate::constants::{PORT_DEFAULT, REPLICAS_MAX};

/// Errors from parsing a replica address list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The list is empty.
    #[error("configuration must list at least one replica address")]
    Empty,

    /// More entries than the cluster supports.
    #[error("too many replica addresses: {0}")]
    TooManyReplicas(usize),

    /// An entry's host is not a dotted-quad IPv4 address.
    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),

    /// An entry's port is not a decimal `u16`.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
}

/// Parses a comma-separated replica address list, e.g.
/// `"127.0.0.1:3001,127.0.0.1:3002,10.0.0.3"`.
///
/// The port, when present, is parsed from the substring after the colon.
pub fn parse_configuration(raw: &str) -> Result<Vec<SocketAddrV4>, ConfigError> {
    let entries: Vec<&str> = raw.split(',').collect();

    if raw.is_empty() {
        return Err(ConfigError::Empty);
    }
    if entries.len() > REPLICAS_MAX as usize {
        return Err(ConfigError::TooManyReplicas(entries.len()));
    }

    let mut configuration = Vec::with_capacity(entries.len());
    for entry in entries {
        let (host, port) = match entry.split_once(':') {
            Some((host, port_text)) => {
                let port: u16 = port_text
                    .parse()
                    .map_err(|_| ConfigError::InvalidPort(port_text.to_string()))?;
                (host, port)
            }
            None => (entry, PORT_DEFAULT),
        };

        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(host.to_string()))?;

        configuration.push(SocketAddrV4::new(ip, port));
    }

    assert!(!configuration.is_empty());
    assert!(configuration.len() <= REPLICAS_MAX as usize);

    Ok(configuration)
}
