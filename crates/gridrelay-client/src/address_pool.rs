//! Discovery of usable local source addresses

use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{debug, info};

use crate::allocator::AllocationError;

/// Enumerate the host's interfaces and pick one IPv4 address per interface,
/// skipping loopback. At most `limit` addresses are returned when set.
pub fn resolve_local_addresses(limit: Option<usize>) -> Result<Vec<IpAddr>, AllocationError> {
    let interfaces = if_addrs::get_if_addrs()?;

    let addresses = select_addresses(
        interfaces
            .into_iter()
            .map(|interface| (interface.name.clone(), interface.ip())),
        limit,
    )?;

    info!("Resolved {} local address(es)", addresses.len());
    Ok(addresses)
}

/// Pure selection step of [`resolve_local_addresses`].
///
/// Interfaces are visited in discovery order; the first non-loopback IPv4
/// address of each interface is kept.
pub fn select_addresses<I>(interfaces: I, limit: Option<usize>) -> Result<Vec<IpAddr>, AllocationError>
where
    I: IntoIterator<Item = (String, IpAddr)>,
{
    let mut seen_interfaces = HashSet::new();
    let mut addresses = Vec::new();

    for (name, ip) in interfaces {
        if !ip.is_ipv4() || ip.is_loopback() {
            continue;
        }
        if !seen_interfaces.insert(name.clone()) {
            debug!("Skipping extra address {} on interface {}", ip, name);
            continue;
        }
        addresses.push(ip);
    }

    if let Some(limit) = limit.filter(|l| *l > 0) {
        addresses.truncate(limit);
    }

    if addresses.is_empty() {
        return Err(AllocationError::NoAddresses);
    }

    Ok(addresses)
}
