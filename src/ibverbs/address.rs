use rdma_mummy_sys::{
    ibv_ah, ibv_ah_attr, ibv_create_ah, ibv_gid, ibv_gid_entry, ibv_global_route, IBV_GID_TYPE_IB,
    IBV_GID_TYPE_ROCE_V1, IBV_GID_TYPE_ROCE_V2,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::marker::PhantomData;
use std::net::{AddrParseError, Ipv4Addr, Ipv6Addr};
use std::ptr::NonNull;
use std::str::FromStr;
use std::{fmt, mem::MaybeUninit};

use super::protection_domain::ProtectionDomain;
use crate::harness::port::EnumeratePortGidsError;
use super::{private, AsRawResource, RawResource, Resource, ResourceKind};

#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Gid {
    pub raw: [u8; 16],
}

impl AsMut<ibv_gid> for Gid {
    fn as_mut(&mut self) -> &mut ibv_gid {
        unsafe { &mut *self.raw.as_mut_ptr().cast::<ibv_gid>() }
    }
}

impl From<ibv_gid> for Gid {
    fn from(gid: ibv_gid) -> Self {
        Self {
            raw: unsafe { gid.raw },
        }
    }
}

impl From<Gid> for ibv_gid {
    fn from(mut gid: Gid) -> Self {
        *gid.as_mut()
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.raw)
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Gid { raw: addr.octets() }
    }
}

impl From<Ipv4Addr> for Gid {
    fn from(addr: Ipv4Addr) -> Self {
        addr.to_ipv6_mapped().into()
    }
}

/// Parse either an IPv6 literal or a dotted IPv4 address, the latter becoming an IPv4-mapped GID.
impl FromStr for Gid {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Ipv4Addr>() {
            Ok(v4) => Ok(v4.into()),
            Err(_) => s.parse::<Ipv6Addr>().map(Gid::from),
        }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, &byte) in self.raw.iter().enumerate() {
            if i > 0 && i % 2 == 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Gid {
    pub fn is_zero(&self) -> bool {
        self.raw.iter().all(|&x| x == 0)
    }

    pub fn is_unicast_link_local(&self) -> bool {
        self.raw[0] == 0xfe && self.raw[1] & 0xc0 == 0x80
    }

    /// RoCE v2 GIDs derived from an IPv4 address are stored as `::ffff:a.b.c.d`.
    pub fn is_ipv4_mapped(&self) -> bool {
        self.raw[..10].iter().all(|&x| x == 0) && self.raw[10] == 0xff && self.raw[11] == 0xff
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum GidType {
    InfiniBand = IBV_GID_TYPE_IB,
    RoceV1 = IBV_GID_TYPE_ROCE_V1,
    RoceV2 = IBV_GID_TYPE_ROCE_V2,
}

impl From<u32> for GidType {
    fn from(gid_type: u32) -> Self {
        match gid_type {
            IBV_GID_TYPE_IB => GidType::InfiniBand,
            IBV_GID_TYPE_ROCE_V1 => GidType::RoceV1,
            IBV_GID_TYPE_ROCE_V2 => GidType::RoceV2,
            _ => panic!("Unknown Gid type: {gid_type}"),
        }
    }
}

#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct GidEntry(pub(crate) ibv_gid_entry);

impl Default for GidEntry {
    fn default() -> Self {
        GidEntry(ibv_gid_entry {
            gid: Gid::default().into(),
            gid_index: 0,
            port_num: 1,
            gid_type: 0,
            ndev_ifindex: 0,
        })
    }
}

impl fmt::Debug for GidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GidEntry")
            .field("gid", &self.gid().to_string())
            .field("gid_index", &self.gid_index())
            .field("port_num", &self.port_num())
            .field("gid_type", &self.0.gid_type)
            .field("ndev_ifindex", &self.netdev_index())
            .finish()
    }
}

impl GidEntry {
    #[inline]
    pub fn gid_index(&self) -> u32 {
        self.0.gid_index
    }

    #[inline]
    pub fn port_num(&self) -> u32 {
        self.0.port_num
    }

    #[inline]
    pub fn gid_type(&self) -> GidType {
        self.0.gid_type.into()
    }

    #[inline]
    pub fn netdev_index(&self) -> u32 {
        self.0.ndev_ifindex
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        unsafe { Gid { raw: self.0.gid.raw } }
    }
}

/// Error returned by [`VerbsAllocator::create_ah`] for creating an address handle.
///
/// [`VerbsAllocator::create_ah`]: crate::harness::allocator::VerbsAllocator::create_ah
#[derive(Debug, thiserror::Error)]
#[error("failed to create address handle")]
#[non_exhaustive]
pub struct CreateAddressHandleError(#[from] pub CreateAddressHandleErrorKind);

/// The enum type for [`CreateAddressHandleError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateAddressHandleErrorKind {
    #[error(transparent)]
    Ibverbs(#[from] io::Error),
    #[error(transparent)]
    LocalPortGid(#[from] EnumeratePortGidsError),
    #[error("no local port GID known for this context")]
    NoLocalPortGid,
}

pub struct AddressHandleAttribute {
    pub(crate) attr: ibv_ah_attr,
}

impl Default for AddressHandleAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressHandleAttribute {
    pub fn new() -> Self {
        AddressHandleAttribute {
            attr: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    pub fn setup_port(&mut self, port_num: u8) -> &mut Self {
        self.attr.port_num = port_num;
        self
    }

    pub fn setup_grh(
        &mut self, dest_gid: &Gid, flow_label: u32, src_gid_index: u8, hop_limit: u8, traffic_class: u8,
    ) -> &mut Self {
        self.attr.grh = ibv_global_route {
            dgid: (*dest_gid).into(),
            flow_label,
            sgid_index: src_gid_index,
            hop_limit,
            traffic_class,
        };
        self.attr.is_global = 1;
        self
    }

    pub fn is_global(&self) -> bool {
        self.attr.is_global != 0
    }

    pub fn port(&self) -> u8 {
        self.attr.port_num
    }

    pub fn dest_gid(&self) -> Gid {
        self.attr.grh.dgid.into()
    }

    pub fn src_gid_index(&self) -> u8 {
        self.attr.grh.sgid_index
    }

    pub fn hop_limit(&self) -> u8 {
        self.attr.grh.hop_limit
    }

    pub fn traffic_class(&self) -> u8 {
        self.attr.grh.traffic_class
    }
}

/// Routing information to reach a remote GID, needed by every UD send.
#[derive(Debug)]
pub struct AddressHandle<'a> {
    pub(crate) ah: NonNull<ibv_ah>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for AddressHandle<'_> {}
unsafe impl Sync for AddressHandle<'_> {}

impl AddressHandle<'_> {
    pub(crate) fn create(pd: &ProtectionDomain, attr: &mut AddressHandleAttribute) -> io::Result<Self> {
        let ah = unsafe { ibv_create_ah(pd.pd.as_ptr(), &mut attr.attr) };
        Ok(AddressHandle {
            ah: NonNull::new(ah).ok_or_else(io::Error::last_os_error)?,
            _alloc: PhantomData,
        })
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn ah(&self) -> NonNull<ibv_ah> {
        self.ah
    }
}

impl private::Sealed for AddressHandle<'_> {}

impl Resource for AddressHandle<'_> {
    const KIND: ResourceKind = ResourceKind::AddressHandle;
}

impl AsRawResource for AddressHandle<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::AddressHandle(self.ah)
    }
}
