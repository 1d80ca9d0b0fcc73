//! The device context is used for querying RDMA device attributes and is the parent of every
//! other verbs object the harness allocates.
use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

use rdma_mummy_sys::{
    ibv_atomic_cap, ibv_close_device, ibv_context, ibv_device_attr_ex, ibv_get_device_guid, ibv_gid_entry, ibv_mtu,
    ibv_port_attr, ibv_port_state, ibv_query_device_ex, ibv_query_gid, ibv_query_gid_table, ibv_query_gid_type,
    ibv_query_port, IBV_GID_TYPE_IB, IBV_GID_TYPE_ROCE_V1, IBV_GID_TYPE_ROCE_V2, IBV_GID_TYPE_SYSFS_IB_ROCE_V1,
    IBV_GID_TYPE_SYSFS_ROCE_V2, IBV_LINK_LAYER_ETHERNET, IBV_LINK_LAYER_INFINIBAND, IBV_LINK_LAYER_UNSPECIFIED,
};
use serde::{Deserialize, Serialize};

use super::address::{Gid, GidEntry};
use super::device::{device_name, DeviceInfo, TransportType};

/// Error returned by [`DeviceContext::query_device`] for querying device context's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query device")]
#[non_exhaustive]
pub struct QueryDeviceError(#[from] pub QueryDeviceErrorKind);

/// The enum type for [`QueryDeviceError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryDeviceErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`DeviceContext::query_port`] for querying physical port's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query port (port_num={port_num})")]
#[non_exhaustive]
pub struct QueryPortError {
    pub port_num: u8,
    #[source]
    pub source: io::Error,
}

/// Error returned by [`DeviceContext::query_gid`] and [`DeviceContext::query_gid_type`].
#[derive(Debug, thiserror::Error)]
#[error("failed to query GID (port_num={port_num}, gid_index={gid_index})")]
#[non_exhaustive]
pub struct QueryGidError {
    pub port_num: u8,
    pub gid_index: u32,
    #[source]
    pub source: io::Error,
}

/// Error returned by [`DeviceContext::query_gid_table`].
#[derive(Debug, thiserror::Error)]
#[error("failed to query GID table")]
#[non_exhaustive]
pub struct QueryGidTableError(#[from] pub QueryGidTableErrorKind);

/// The enum type for [`QueryGidTableError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryGidTableErrorKind {
    Ibverbs(#[from] io::Error),
    QueryDevice(#[from] QueryDeviceError),
    QueryPort(#[from] QueryPortError),
    QueryGid(#[from] QueryGidError),
}

/// A Global Unique Identifier (GUID) for the RDMA device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(pub(crate) u64);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}:{:04x}:{:04x}",
            (self.0 >> 48) & 0xFFFF,
            (self.0 >> 32) & 0xFFFF,
            (self.0 >> 16) & 0xFFFF,
            self.0 & 0xFFFF
        )
    }
}

/// An opened RDMA device. The harness never closes a context on its own: the device is closed when
/// the last owner drops its [`Arc`](std::sync::Arc).
#[derive(Debug)]
pub struct DeviceContext {
    pub(crate) context: *mut ibv_context,
}

unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let ret = unsafe { ibv_close_device(self.context) };
        if ret != 0 {
            log::warn!("ibv_close_device on {} returned {ret}", self.name());
        }
    }
}

/// RDMA path MTU. Only five payload sizes are defined by the verbs specification.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mtu {
    Mtu256 = ibv_mtu::IBV_MTU_256,
    Mtu512 = ibv_mtu::IBV_MTU_512,
    Mtu1024 = ibv_mtu::IBV_MTU_1024,
    Mtu2048 = ibv_mtu::IBV_MTU_2048,
    Mtu4096 = ibv_mtu::IBV_MTU_4096,
}

impl From<u32> for Mtu {
    fn from(mtu: u32) -> Self {
        match mtu {
            ibv_mtu::IBV_MTU_256 => Mtu::Mtu256,
            ibv_mtu::IBV_MTU_512 => Mtu::Mtu512,
            ibv_mtu::IBV_MTU_1024 => Mtu::Mtu1024,
            ibv_mtu::IBV_MTU_2048 => Mtu::Mtu2048,
            ibv_mtu::IBV_MTU_4096 => Mtu::Mtu4096,
            _ => panic!("Unknown MTU value: {mtu}"),
        }
    }
}

impl Mtu {
    /// Map a payload size in bytes onto the verbs MTU enumeration.
    pub fn from_bytes(bytes: u32) -> Option<Mtu> {
        match bytes {
            256 => Some(Mtu::Mtu256),
            512 => Some(Mtu::Mtu512),
            1024 => Some(Mtu::Mtu1024),
            2048 => Some(Mtu::Mtu2048),
            4096 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    pub fn bytes(&self) -> u32 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

/// The link layer protocol of physical port.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkLayer {
    Unspecified = IBV_LINK_LAYER_UNSPECIFIED,
    InfiniBand = IBV_LINK_LAYER_INFINIBAND,
    Ethernet = IBV_LINK_LAYER_ETHERNET,
}

impl From<u8> for LinkLayer {
    fn from(link: u8) -> Self {
        match link {
            IBV_LINK_LAYER_INFINIBAND => LinkLayer::InfiniBand,
            IBV_LINK_LAYER_ETHERNET => LinkLayer::Ethernet,
            _ => LinkLayer::Unspecified,
        }
    }
}

/// The logical state of a port.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortState {
    Nop = ibv_port_state::IBV_PORT_NOP,
    Down = ibv_port_state::IBV_PORT_DOWN,
    Initializing = ibv_port_state::IBV_PORT_INIT,
    Armed = ibv_port_state::IBV_PORT_ARMED,
    /// The link layer can transmit and receive all packet types.
    Active = ibv_port_state::IBV_PORT_ACTIVE,
    ActiveDefer = ibv_port_state::IBV_PORT_ACTIVE_DEFER,
}

impl From<u32> for PortState {
    fn from(port_state: u32) -> Self {
        match port_state {
            ibv_port_state::IBV_PORT_NOP => PortState::Nop,
            ibv_port_state::IBV_PORT_DOWN => PortState::Down,
            ibv_port_state::IBV_PORT_INIT => PortState::Initializing,
            ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
            ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
            ibv_port_state::IBV_PORT_ACTIVE_DEFER => PortState::ActiveDefer,
            _ => panic!("Unknown port state value: {port_state}"),
        }
    }
}

/// Atomic operation support level reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicCapability {
    /// Atomic operations are not supported.
    None,
    /// Atomicity is guaranteed between QPs on this device only.
    Hca,
    /// Atomicity is guaranteed between this device and any other component, such as CPUs.
    Global,
}

impl From<u32> for AtomicCapability {
    fn from(cap: u32) -> Self {
        match cap {
            ibv_atomic_cap::IBV_ATOMIC_HCA => AtomicCapability::Hca,
            ibv_atomic_cap::IBV_ATOMIC_GLOB => AtomicCapability::Global,
            _ => AtomicCapability::None,
        }
    }
}

/// The attributes of a port of an RDMA device context.
pub struct PortAttr {
    attr: ibv_port_attr,
}

impl PortAttr {
    pub fn max_mtu(&self) -> Mtu {
        self.attr.max_mtu.into()
    }

    pub fn active_mtu(&self) -> Mtu {
        self.attr.active_mtu.into()
    }

    pub fn gid_tbl_len(&self) -> i32 {
        self.attr.gid_tbl_len
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.attr.link_layer.into()
    }

    pub fn port_state(&self) -> PortState {
        self.attr.state.into()
    }

    pub fn lid(&self) -> u16 {
        self.attr.lid
    }
}

/// The attributes of an RDMA device that is associated with a context.
pub struct DeviceAttr {
    attr: ibv_device_attr_ex,
}

impl DeviceAttr {
    pub fn phys_port_cnt(&self) -> u8 {
        self.attr.orig_attr.phys_port_cnt
    }

    pub fn vendor_id(&self) -> u32 {
        self.attr.orig_attr.vendor_id
    }

    pub fn vendor_part_id(&self) -> u32 {
        self.attr.orig_attr.vendor_part_id
    }

    pub fn atomic_capability(&self) -> AtomicCapability {
        (self.attr.orig_attr.atomic_cap as u32).into()
    }

    pub fn max_qp_wr(&self) -> i32 {
        self.attr.orig_attr.max_qp_wr
    }

    pub fn max_cqe(&self) -> i32 {
        self.attr.orig_attr.max_cqe
    }

    pub fn max_srq_wr(&self) -> i32 {
        self.attr.orig_attr.max_srq_wr
    }

    pub fn max_mr_size(&self) -> u64 {
        self.attr.orig_attr.max_mr_size
    }
}

impl DeviceContext {
    pub fn query_device(&self) -> Result<DeviceAttr, QueryDeviceError> {
        let mut attr = MaybeUninit::<ibv_device_attr_ex>::uninit();
        unsafe {
            match ibv_query_device_ex(self.context, ptr::null(), attr.as_mut_ptr()) {
                0 => Ok(DeviceAttr {
                    attr: attr.assume_init(),
                }),
                ret => Err(QueryDeviceErrorKind::Ibverbs(io::Error::from_raw_os_error(ret)).into()),
            }
        }
    }

    /// Query the attributes of a physical port, RDMA port numbers start with `1`.
    pub fn query_port(&self, port_num: u8) -> Result<PortAttr, QueryPortError> {
        let mut attr = MaybeUninit::<ibv_port_attr>::uninit();
        unsafe {
            match ibv_query_port(self.context, port_num, attr.as_mut_ptr()) {
                0 => Ok(PortAttr {
                    attr: attr.assume_init(),
                }),
                ret => Err(QueryPortError {
                    port_num,
                    source: io::Error::from_raw_os_error(ret),
                }),
            }
        }
    }

    pub fn query_gid(&self, port_num: u8, gid_index: u32) -> Result<Gid, QueryGidError> {
        let mut gid = Gid::default();
        unsafe {
            match ibv_query_gid(self.context, port_num, gid_index as i32, gid.as_mut()) {
                0 => Ok(gid),
                ret => Err(QueryGidError {
                    port_num,
                    gid_index,
                    source: io::Error::from_raw_os_error(ret),
                }),
            }
        }
    }

    /// Query the sysfs GID type: `0` is either InfiniBand or RoCE v1, `1` is RoCE v2.
    pub fn query_gid_type(&self, port_num: u8, gid_index: u32) -> Result<u32, QueryGidError> {
        let mut gid_type = u32::default();
        unsafe {
            match ibv_query_gid_type(self.context, port_num, gid_index, &mut gid_type) {
                0 => Ok(gid_type),
                ret => Err(QueryGidError {
                    port_num,
                    gid_index,
                    source: io::Error::from_raw_os_error(ret),
                }),
            }
        }
    }

    // Older rdma-core releases lack `ibv_query_gid_table`; rebuild the table from per-index queries
    // and sysfs.
    fn query_gid_table_fallback(&self) -> Result<Vec<GidEntry>, QueryGidTableError> {
        let mut res = Vec::new();
        let dev_attr = self.query_device()?;
        let name = self.name();

        for port_num in 1..=dev_attr.phys_port_cnt() {
            let port_attr = self.query_port(port_num).map_err(QueryGidTableErrorKind::QueryPort)?;

            for gid_index in 0..port_attr.gid_tbl_len().max(0) as u32 {
                let gid = self
                    .query_gid(port_num, gid_index)
                    .map_err(QueryGidTableErrorKind::QueryGid)?;
                if gid.is_zero() {
                    continue;
                }

                let gid_type = match self
                    .query_gid_type(port_num, gid_index)
                    .map_err(QueryGidTableErrorKind::QueryGid)?
                {
                    IBV_GID_TYPE_SYSFS_IB_ROCE_V1 if port_attr.link_layer() == LinkLayer::InfiniBand => IBV_GID_TYPE_IB,
                    IBV_GID_TYPE_SYSFS_IB_ROCE_V1 => IBV_GID_TYPE_ROCE_V1,
                    IBV_GID_TYPE_SYSFS_ROCE_V2 => IBV_GID_TYPE_ROCE_V2,
                    other => {
                        log::debug!("{name} port {port_num} gid {gid_index}: skipping unknown gid type {other}");
                        continue;
                    },
                };

                let ndev_ifindex = fs::read_to_string(format!(
                    "/sys/class/infiniband/{name}/ports/{port_num}/gid_attrs/ndevs/{gid_index}"
                ))
                .ok()
                .and_then(|netdev| CString::new(netdev.trim_end()).ok())
                .map_or(0, |netdev| unsafe { libc::if_nametoindex(netdev.as_ptr()) });

                res.push(GidEntry(ibv_gid_entry {
                    gid: gid.into(),
                    gid_index,
                    port_num: port_num.into(),
                    gid_type,
                    ndev_ifindex,
                }));
            }
        }

        Ok(res)
    }

    /// Query all valid [`GidEntry`]s on the device, across all ports.
    pub fn query_gid_table(&self) -> Result<Vec<GidEntry>, QueryGidTableError> {
        let dev_attr = self.query_device()?;

        // the entries array must be able to hold every valid GID of every port
        let mut size = 0usize;
        for port_num in 1..=dev_attr.phys_port_cnt() {
            let port_attr = self.query_port(port_num).map_err(QueryGidTableErrorKind::QueryPort)?;
            size += port_attr.gid_tbl_len().max(0) as usize;
        }

        let mut entries = vec![GidEntry::default(); size];
        let valid_size = unsafe { ibv_query_gid_table(self.context, entries.as_mut_ptr() as _, entries.len(), 0) };

        if valid_size == -(libc::EOPNOTSUPP as isize) {
            return self.query_gid_table_fallback();
        }
        if valid_size < 0 {
            return Err(QueryGidTableErrorKind::Ibverbs(io::Error::from_raw_os_error(-valid_size as i32)).into());
        }

        entries.truncate(valid_size as usize);
        Ok(entries)
    }

    /// Identity of this context, stable for as long as the context is open.
    pub(crate) fn id(&self) -> usize {
        self.context as usize
    }
}

impl DeviceInfo for DeviceContext {
    fn name(&self) -> String {
        unsafe { device_name((*self.context).device) }
    }

    fn guid(&self) -> Guid {
        unsafe { Guid(ibv_get_device_guid((*self.context).device)) }
    }

    fn transport_type(&self) -> TransportType {
        unsafe { (*(*self.context).device).transport_type.into() }
    }
}
