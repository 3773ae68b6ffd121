//! Distribution of local addresses across identities

use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Startup errors raised while building the address plan
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no identities configured")]
    NoIdentities,

    #[error("no usable local addresses")]
    NoAddresses,

    #[error("failed to enumerate network interfaces: {0}")]
    InterfaceDiscovery(#[from] std::io::Error),
}

/// One (identity, local address) pair; owns at most one live connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub identity: String,
    pub address: IpAddr,
}

impl ConnectionKey {
    pub fn new(identity: impl Into<String>, address: IpAddr) -> Self {
        Self {
            identity: identity.into(),
            address,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.address, self.identity)
    }
}

/// Address plan produced by [`allocate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// A single address used by every identity
    Shared {
        address: IpAddr,
        identities: Vec<String>,
    },
    /// Each address belongs to exactly one identity
    Partitioned(Vec<(String, Vec<IpAddr>)>),
}

impl Allocation {
    /// Connections to start, in start order
    pub fn start_plan(&self) -> Vec<ConnectionKey> {
        match self {
            Allocation::Shared {
                address,
                identities,
            } => identities
                .iter()
                .map(|identity| ConnectionKey::new(identity.clone(), *address))
                .collect(),
            Allocation::Partitioned(assignments) => assignments
                .iter()
                .flat_map(|(identity, addresses)| {
                    addresses
                        .iter()
                        .map(move |address| ConnectionKey::new(identity.clone(), *address))
                })
                .collect(),
        }
    }

    pub fn addresses_for(&self, identity: &str) -> Vec<IpAddr> {
        match self {
            Allocation::Shared {
                address,
                identities,
            } => {
                if identities.iter().any(|i| i == identity) {
                    vec![*address]
                } else {
                    Vec::new()
                }
            }
            Allocation::Partitioned(assignments) => assignments
                .iter()
                .filter(|(i, _)| i == identity)
                .flat_map(|(_, addresses)| addresses.iter().copied())
                .collect(),
        }
    }
}

/// Split `addresses` across `identities`.
///
/// Identity `i` receives the contiguous block `[i*q, (i+1)*q)` where `q = M / K`.
/// The `M % K` leftover addresses are handed out one per identity, in identity
/// order, taking them from the end of the address list backwards. A single
/// address is shared by all identities instead.
pub fn allocate(identities: &[String], addresses: &[IpAddr]) -> Result<Allocation, AllocationError> {
    if identities.is_empty() {
        return Err(AllocationError::NoIdentities);
    }
    if addresses.is_empty() {
        return Err(AllocationError::NoAddresses);
    }

    if let [address] = addresses {
        return Ok(Allocation::Shared {
            address: *address,
            identities: identities.to_vec(),
        });
    }

    let total = addresses.len();
    let per_identity = total / identities.len();
    let mut excess = total % identities.len();

    let assignments = identities
        .iter()
        .enumerate()
        .map(|(i, identity)| {
            let mut assigned = addresses[i * per_identity..(i + 1) * per_identity].to_vec();
            if excess > 0 {
                assigned.push(addresses[total - excess]);
                excess -= 1;
            }
            (identity.clone(), assigned)
        })
        .collect();

    Ok(Allocation::Partitioned(assignments))
}
