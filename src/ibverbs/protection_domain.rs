//! A protection domain is used to associate [`QueuePair`]s with [`MemoryRegion`]s, as a means for
//! enabling and controlling network adapter access to Host System memory.
//!
//! [`QueuePair`]: crate::ibverbs::queue_pair::QueuePair
//! [`MemoryRegion`]: crate::ibverbs::memory_region::MemoryRegion
use rdma_mummy_sys::{ibv_alloc_pd, ibv_pd};
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::device_context::DeviceContext;
use super::{private, AsRawResource, RawResource, Resource, ResourceKind};

/// Error returned by [`VerbsAllocator::alloc_pd`] for allocating a new RDMA PD.
///
/// [`VerbsAllocator::alloc_pd`]: crate::harness::allocator::VerbsAllocator::alloc_pd
#[derive(Debug, thiserror::Error)]
#[error("failed to allocate protection domain")]
#[non_exhaustive]
pub struct AllocateProtectionDomainError(#[from] pub AllocateProtectionDomainErrorKind);

/// The enum type for [`AllocateProtectionDomainError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum AllocateProtectionDomainErrorKind {
    Ibverbs(#[from] io::Error),
}

/// A protection domain that could be used to creating RDMA QP and RDMA MR on it to associate them
/// together.
#[derive(Debug)]
pub struct ProtectionDomain<'a> {
    pub(crate) pd: NonNull<ibv_pd>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for ProtectionDomain<'_> {}
unsafe impl Sync for ProtectionDomain<'_> {}

impl ProtectionDomain<'_> {
    pub(crate) fn alloc(ctx: &DeviceContext) -> Result<Self, AllocateProtectionDomainError> {
        let pd = unsafe { ibv_alloc_pd(ctx.context) };
        match NonNull::new(pd) {
            Some(pd) => Ok(ProtectionDomain {
                pd,
                _alloc: PhantomData,
            }),
            None => Err(AllocateProtectionDomainErrorKind::Ibverbs(io::Error::last_os_error()).into()),
        }
    }

    pub fn handle(&self) -> u32 {
        unsafe { self.pd.as_ref().handle }
    }

    /// Identity of the device context this PD was allocated on.
    pub(crate) fn context_id(&self) -> usize {
        unsafe { self.pd.as_ref().context as usize }
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn pd(&self) -> NonNull<ibv_pd> {
        self.pd
    }
}

impl private::Sealed for ProtectionDomain<'_> {}

impl Resource for ProtectionDomain<'_> {
    const KIND: ResourceKind = ResourceKind::ProtectionDomain;
}

impl AsRawResource for ProtectionDomain<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::ProtectionDomain(self.pd)
    }
}
