//! Local port identities used to address QPs during connection setup.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ibverbs::address::{Gid, GidEntry, GidType};
use crate::ibverbs::device_context::{DeviceContext, PortState, QueryGidTableError, QueryPortError};

/// Error returned by [`enumerate_port_gids`].
#[derive(Debug, thiserror::Error)]
#[error("failed to enumerate port GIDs")]
#[non_exhaustive]
pub struct EnumeratePortGidsError(#[from] pub EnumeratePortGidsErrorKind);

/// The enum type for [`EnumeratePortGidsError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EnumeratePortGidsErrorKind {
    #[error(transparent)]
    QueryGidTable(#[from] QueryGidTableError),
    #[error(transparent)]
    QueryPort(#[from] QueryPortError),
    #[error("no active port with a usable GID")]
    NoUsableGid,
}

/// One usable local identity: a port of an opened device and one of its GIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGid {
    pub port: u8,
    pub gid: Gid,
    /// Source GID index, as carried in a global route header.
    pub gid_index: u8,
    pub gid_type: GidType,
}

/// Whether a GID table entry can address a QP.
///
/// RoCE v1 and zero GIDs never qualify, and link-local RoCE v2 GIDs are not routable. With
/// `ipv4_only` set, only IPv4-mapped RoCE v2 GIDs are kept.
pub(crate) fn is_usable_gid(gid: &Gid, gid_type: GidType, ipv4_only: bool) -> bool {
    if gid.is_zero() {
        return false;
    }
    match gid_type {
        GidType::InfiniBand => true,
        GidType::RoceV1 => false,
        GidType::RoceV2 if gid.is_unicast_link_local() => false,
        GidType::RoceV2 => !ipv4_only || gid.is_ipv4_mapped(),
    }
}

/// The identity `entry` offers for addressing, `None` when it cannot address a QP.
pub(crate) fn usable_port_gid(entry: &GidEntry, ipv4_only: bool) -> Option<PortGid> {
    let (gid, gid_type) = (entry.gid(), entry.gid_type());
    if !is_usable_gid(&gid, gid_type, ipv4_only) {
        return None;
    }
    let Ok(gid_index) = u8::try_from(entry.gid_index()) else {
        log::debug!("skipping gid {gid} at index {}, out of GRH range", entry.gid_index());
        return None;
    };
    Some(PortGid {
        port: entry.port_num() as u8,
        gid,
        gid_index,
        gid_type,
    })
}

/// Collect the usable GIDs of every active port of `ctx`, ordered by port and then GID index.
pub fn enumerate_port_gids(ctx: &DeviceContext, ipv4_only: bool) -> Result<Vec<PortGid>, EnumeratePortGidsError> {
    let entries = ctx
        .query_gid_table()
        .map_err(EnumeratePortGidsErrorKind::QueryGidTable)?;

    let mut active = HashMap::new();
    let mut port_gids = Vec::new();

    for entry in entries {
        let port = entry.port_num() as u8;
        let is_active = match active.get(&port) {
            Some(&is_active) => is_active,
            None => {
                let state = ctx
                    .query_port(port)
                    .map_err(EnumeratePortGidsErrorKind::QueryPort)?
                    .port_state();
                let is_active = state == PortState::Active;
                if !is_active {
                    log::debug!("skipping port {port} in state {state:?}");
                }
                active.insert(port, is_active);
                is_active
            },
        };
        if !is_active {
            continue;
        }

        port_gids.extend(usable_port_gid(&entry, ipv4_only));
    }

    port_gids.sort_by_key(|port_gid| (port_gid.port, port_gid.gid_index));
    Ok(port_gids)
}
