pub mod address;
pub mod completion;
pub mod device;
pub mod device_context;
pub mod memory_region;
pub mod memory_window;
pub mod protection_domain;
pub mod queue_pair;
pub mod shared_receive_queue;

use std::fmt;
use std::io;
use std::ptr::NonNull;

use bitmask_enum::bitmask;
use rdma_mummy_sys::{
    ibv_access_flags, ibv_ah, ibv_comp_channel, ibv_cq, ibv_dealloc_mw, ibv_dealloc_pd, ibv_dereg_mr, ibv_destroy_ah,
    ibv_destroy_comp_channel, ibv_destroy_cq, ibv_destroy_qp, ibv_destroy_srq, ibv_mr, ibv_mw, ibv_pd, ibv_qp, ibv_srq,
};

#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum AccessFlags {
    LocalWrite = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as _,
    RemoteWrite = ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0 as _,
    RemoteRead = ibv_access_flags::IBV_ACCESS_REMOTE_READ.0 as _,
    RemoteAtomic = ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0 as _,
    MemoryWindowBind = ibv_access_flags::IBV_ACCESS_MW_BIND.0 as _,
    ZeroBased = ibv_access_flags::IBV_ACCESS_ZERO_BASED.0 as _,
    OnDemand = ibv_access_flags::IBV_ACCESS_ON_DEMAND.0 as _,
    RelaxedOrdering = ibv_access_flags::IBV_ACCESS_RELAXED_ORDERING.0 as _,
}

/// Translate the integer status returned by a verbs destroy / modify primitive.
///
/// Providers disagree on the convention: most return the errno directly, a few return `-1` and
/// leave the reason in `errno`.
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        ret if ret < 0 => Err(io::Error::last_os_error()),
        ret => Err(io::Error::from_raw_os_error(ret)),
    }
}

/// The kinds of destructible verbs objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ProtectionDomain,
    MemoryRegion,
    MemoryWindow,
    CompletionChannel,
    CompletionQueue,
    SharedReceiveQueue,
    QueuePair,
    AddressHandle,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::ProtectionDomain => "protection domain",
            ResourceKind::MemoryRegion => "memory region",
            ResourceKind::MemoryWindow => "memory window",
            ResourceKind::CompletionChannel => "completion channel",
            ResourceKind::CompletionQueue => "completion queue",
            ResourceKind::SharedReceiveQueue => "shared receive queue",
            ResourceKind::QueuePair => "queue pair",
            ResourceKind::AddressHandle => "address handle",
        })
    }
}

mod private {
    pub trait Sealed {}
}

/// A verbs object handle that must be destroyed explicitly.
pub trait Resource: private::Sealed {
    const KIND: ResourceKind;
}

/// The native pointer behind a handle, kept by the allocator to tear down leftovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawResource {
    ProtectionDomain(NonNull<ibv_pd>),
    MemoryRegion(NonNull<ibv_mr>),
    MemoryWindow(NonNull<ibv_mw>),
    CompletionChannel(NonNull<ibv_comp_channel>),
    CompletionQueue(NonNull<ibv_cq>),
    SharedReceiveQueue(NonNull<ibv_srq>),
    QueuePair(NonNull<ibv_qp>),
    AddressHandle(NonNull<ibv_ah>),
}

unsafe impl Send for RawResource {}

impl RawResource {
    pub(crate) fn kind(&self) -> ResourceKind {
        match self {
            RawResource::ProtectionDomain(_) => ResourceKind::ProtectionDomain,
            RawResource::MemoryRegion(_) => ResourceKind::MemoryRegion,
            RawResource::MemoryWindow(_) => ResourceKind::MemoryWindow,
            RawResource::CompletionChannel(_) => ResourceKind::CompletionChannel,
            RawResource::CompletionQueue(_) => ResourceKind::CompletionQueue,
            RawResource::SharedReceiveQueue(_) => ResourceKind::SharedReceiveQueue,
            RawResource::QueuePair(_) => ResourceKind::QueuePair,
            RawResource::AddressHandle(_) => ResourceKind::AddressHandle,
        }
    }

    /// # Safety
    ///
    /// The pointer must be live and must not be used again once this returns `Ok`.
    pub(crate) unsafe fn destroy(self) -> io::Result<()> {
        from_c_ret(match self {
            RawResource::ProtectionDomain(pd) => ibv_dealloc_pd(pd.as_ptr()),
            RawResource::MemoryRegion(mr) => ibv_dereg_mr(mr.as_ptr()),
            RawResource::MemoryWindow(mw) => ibv_dealloc_mw(mw.as_ptr()),
            RawResource::CompletionChannel(channel) => ibv_destroy_comp_channel(channel.as_ptr()),
            RawResource::CompletionQueue(cq) => ibv_destroy_cq(cq.as_ptr()),
            RawResource::SharedReceiveQueue(srq) => ibv_destroy_srq(srq.as_ptr()),
            RawResource::QueuePair(qp) => ibv_destroy_qp(qp.as_ptr()),
            RawResource::AddressHandle(ah) => ibv_destroy_ah(ah.as_ptr()),
        })
    }
}

pub(crate) trait AsRawResource: Resource {
    fn as_raw_resource(&self) -> RawResource;
}

/// Error returned when the native layer refuses to destroy an object, typically because another
/// object still references it. The handle is handed back and stays valid.
#[derive(thiserror::Error)]
#[error("failed to destroy {}", H::KIND)]
pub struct DestroyResourceError<H: Resource> {
    handle: H,
    #[source]
    source: io::Error,
}

impl<H: Resource> DestroyResourceError<H> {
    pub(crate) fn new(handle: H, source: io::Error) -> Self {
        DestroyResourceError { handle, source }
    }

    /// The non-zero status reported by the native layer.
    pub fn status(&self) -> i32 {
        self.source.raw_os_error().unwrap_or(-1)
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn into_inner(self) -> H {
        self.handle
    }

    pub fn into_parts(self) -> (H, io::Error) {
        (self.handle, self.source)
    }
}

impl<H: Resource> fmt::Debug for DestroyResourceError<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyResourceError")
            .field("kind", &H::KIND)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_c_ret() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(from_c_ret(libc::EBUSY).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        assert!(from_c_ret(-1).is_err());
    }

    #[test]
    fn test_access_flags_compose() {
        let flags = AccessFlags::LocalWrite | AccessFlags::RemoteRead;
        assert!(flags.contains(AccessFlags::LocalWrite));
        assert!(!flags.contains(AccessFlags::RemoteAtomic));
    }

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(ResourceKind::ProtectionDomain.to_string(), "protection domain");
        assert_eq!(ResourceKind::AddressHandle.to_string(), "address handle");
    }

    struct Channel;

    impl private::Sealed for Channel {}

    impl Resource for Channel {
        const KIND: ResourceKind = ResourceKind::CompletionChannel;
    }

    #[test]
    fn test_destroy_error_hands_back_the_handle() {
        use std::error::Error;

        let err = DestroyResourceError::new(Channel, io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err.status(), libc::EBUSY);
        assert_eq!(err.to_string(), format!("failed to destroy {}", ResourceKind::CompletionChannel));
        let source = err.source().and_then(|source| source.downcast_ref::<io::Error>());
        assert_eq!(source.and_then(io::Error::raw_os_error), Some(libc::EBUSY));
        assert!(format!("{err:?}").contains("CompletionChannel"));

        let (Channel, source) = err.into_parts();
        assert_eq!(source.raw_os_error(), Some(libc::EBUSY));
    }

    #[test]
    fn test_raw_resource_kind() {
        let qp = RawResource::QueuePair(NonNull::dangling());
        assert_eq!(qp.kind(), ResourceKind::QueuePair);
        assert_ne!(qp, RawResource::CompletionQueue(NonNull::dangling()));
    }
}
