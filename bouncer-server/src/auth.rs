//! Authentication handshake: credentials first, then network selection.

use std::time::Duration;

use crate::backend::{bounded, CredentialVerifier, NetworkRegistry};
use crate::error::SessionError;
use crate::event::{Identity, Network};

/// Resolve the USER/PASS pair to an identity and pick the network to bind.
///
/// Each step waits for the previous one; the first failure aborts the rest.
pub async fn authenticate(
    credentials: &dyn CredentialVerifier,
    registry: &dyn NetworkRegistry,
    limit: Duration,
    identifier: &str,
    password: &str,
    requested: Option<&str>,
) -> Result<(Identity, Network), SessionError> {
    let identity = bounded(limit, "credential check", credentials.verify(identifier, password))
        .await
        .map_err(|e| {
            tracing::warn!(%identifier, "Credential verifier failed: {e:#}");
            SessionError::Credential(identifier.to_string())
        })?
        .ok_or_else(|| SessionError::Credential(identifier.to_string()))?;

    let networks = bounded(limit, "network enumeration", registry.networks())
        .await
        .map_err(|e| {
            tracing::warn!(%identifier, "Network registry failed: {e:#}");
            SessionError::NetworkNotFound(requested.unwrap_or_default().to_string())
        })?;

    let network = select_network(networks, requested)?;
    tracing::info!(%identifier, network = %network.name, "Authenticated");
    Ok((identity, network))
}

/// A sole network is always chosen; otherwise the requested name must
/// match exactly one.
pub fn select_network(
    mut networks: Vec<Network>,
    requested: Option<&str>,
) -> Result<Network, SessionError> {
    if networks.len() == 1 {
        return Ok(networks.remove(0));
    }
    let wanted = requested.unwrap_or_default();
    let mut matching = networks.into_iter().filter(|n| n.name == wanted);
    match (matching.next(), matching.next()) {
        (Some(network), None) => Ok(network),
        _ => Err(SessionError::NetworkNotFound(wanted.to_string())),
    }
}
