use super::connection::Connection;
use super::context::CallContext;
use crate::utils::error::{PoolError, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// How the service-chain step narrowed the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMatch {
    /// No chain router on the call.
    Unbound,
    /// Pinned to endpoints tagged with the call's chain key.
    Hit,
    /// The key has no endpoints; every chain-tagged endpoint was excluded.
    Miss,
}

/// Narrow `active` by service chain.
///
/// 1. No router: keep everything.
/// 2. Chain key with endpoints: keep the active ones among them. If none of
///    them is connected the call fails with `NoFreeConnection`.
/// 3. Otherwise drop every endpoint belonging to any chain, unless no chain
///    endpoints exist at all.
pub async fn chain_candidates(
    app_name: &str,
    ctx: &CallContext,
    active: Vec<Arc<Connection>>,
) -> Result<(Vec<Arc<Connection>>, ChainMatch)> {
    let Some(chainer) = ctx.service_chain() else {
        return Ok((active, ChainMatch::Unbound));
    };

    if let Some(key) = ctx.chain_key() {
        let tagged = chainer
            .endpoints_for_key(app_name, key)
            .await
            .map_err(|e| chain_error(app_name, e))?;

        if !tagged.is_empty() {
            let pinned: Vec<Arc<Connection>> = active
                .iter()
                .filter(|c| tagged.contains_key(&c.endpoint().to_string()))
                .cloned()
                .collect();
            if pinned.is_empty() {
                warn!(
                    app = app_name,
                    chain = key,
                    endpoints = tagged.len(),
                    "Service chain endpoints are not connected"
                );
                return Err(PoolError::NoFreeConnection(format!(
                    "no connected endpoint on service chain {} for {}",
                    key, app_name
                )));
            }
            debug!(app = app_name, chain = key, candidates = pinned.len(), "Service chain hit");
            return Ok((pinned, ChainMatch::Hit));
        }
        debug!(app = app_name, chain = key, "Chain key has no endpoints");
    }

    let all_tagged = chainer
        .endpoints(app_name)
        .await
        .map_err(|e| chain_error(app_name, e))?;
    if all_tagged.is_empty() {
        return Ok((active, ChainMatch::Miss));
    }

    let untagged = active
        .into_iter()
        .filter(|c| !all_tagged.contains_key(&c.endpoint().to_string()))
        .collect();
    Ok((untagged, ChainMatch::Miss))
}

fn chain_error(app_name: &str, e: PoolError) -> PoolError {
    error!(app = app_name, error = %e, "Service chain lookup failed");
    match e {
        PoolError::ServiceChain(_) => e,
        other => PoolError::ServiceChain(other.to_string()),
    }
}

/// Prefer connections in the local datacenter when any exist.
pub fn prefer_local(candidates: Vec<Arc<Connection>>, local_idc: Option<&str>) -> Vec<Arc<Connection>> {
    let Some(local) = local_idc else {
        return candidates;
    };

    let local_only: Vec<Arc<Connection>> = candidates
        .iter()
        .filter(|c| c.idc() == Some(local))
        .cloned()
        .collect();
    if local_only.is_empty() {
        candidates
    } else {
        local_only
    }
}
