//! Client address allocation inside the shared VPN subnet
//!
//! The server always sits at the first usable host (network + 1). Client
//! endpoints are handed out from network + 2 upward in strict numeric
//! order, so repeated runs over the same configuration reproduce the same
//! assignment. Results are always /32 host routes.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{VpnError, VpnResult};

/// First usable host of a CIDR block. Doubles as the inferred gateway
/// address when probing a remote subnet.
pub fn first_host(subnet: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

/// First usable host in the VPN subnet, reserved for the server endpoint.
pub fn server_address(subnet: Ipv4Net) -> Ipv4Addr {
    first_host(subnet)
}

/// Next unused client address in `subnet` as a /32, skipping everything in
/// `in_use`. Pure function of its inputs.
///
/// Candidates run from network + 2 (network address at +0, server at +1)
/// through the last host below the broadcast address. Returns
/// `AddressSpaceExhausted` when every candidate is taken; callers treat
/// that as a per-site condition, not a fatal one.
pub fn next_client_address(subnet: Ipv4Net, in_use: &BTreeSet<Ipv4Addr>) -> VpnResult<Ipv4Net> {
    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    let first = network.saturating_add(2);

    if first >= broadcast {
        // /31 and /32 have no room for any client endpoint.
        return Err(VpnError::AddressSpaceExhausted {
            subnet: subnet.to_string(),
        });
    }

    for candidate in first..broadcast {
        let addr = Ipv4Addr::from(candidate);
        if !in_use.contains(&addr) {
            let host = Ipv4Net::new(addr, 32)
                .map_err(|e| VpnError::InvalidParameter(e.to_string()))?;
            return Ok(host);
        }
    }

    Err(VpnError::AddressSpaceExhausted {
        subnet: subnet.to_string(),
    })
}
