//! Users need to register memory they allocated as memory region for accessing it later.
use rdma_mummy_sys::{ibv_mr, ibv_reg_mr};
use std::marker::PhantomData;
use std::{io, ptr::NonNull};

use super::protection_domain::ProtectionDomain;
use super::{private, AccessFlags, AsRawResource, RawResource, Resource, ResourceKind};

/// Error returned by [`VerbsAllocator::reg_mr`] for registering a new RDMA MR.
///
/// [`VerbsAllocator::reg_mr`]: crate::harness::allocator::VerbsAllocator::reg_mr
#[derive(Debug, thiserror::Error)]
#[error("failed to register memory region")]
#[non_exhaustive]
pub struct RegisterMemoryRegionError(#[from] pub RegisterMemoryRegionErrorKind);

/// The enum type for [`RegisterMemoryRegionError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum RegisterMemoryRegionErrorKind {
    Ibverbs(#[from] io::Error),
}

/// A registered memory region abstraction that wraps an RDMA memory region.
#[derive(Debug)]
pub struct MemoryRegion<'a> {
    mr: NonNull<ibv_mr>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for MemoryRegion<'_> {}
unsafe impl Sync for MemoryRegion<'_> {}

impl MemoryRegion<'_> {
    /// Returns the RDMA local key.
    pub fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref().lkey }
    }

    /// Returns the RDMA remote key.
    pub fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref().rkey }
    }

    /// Returns the length of the registered region.
    pub fn region_len(&self) -> usize {
        unsafe { self.mr.as_ref().length }
    }

    /// Returns the starting address of the registered region.
    pub fn get_ptr(&self) -> usize {
        unsafe { self.mr.as_ref().addr as _ }
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn mr(&self) -> NonNull<ibv_mr> {
        self.mr
    }

    /// # Safety
    ///
    /// `ptr` must be valid for `len` bytes for as long as the region stays registered.
    pub(crate) unsafe fn register(
        pd: &ProtectionDomain, ptr: usize, len: usize, access: AccessFlags,
    ) -> Result<Self, RegisterMemoryRegionError> {
        let mr = ibv_reg_mr(pd.pd.as_ptr(), ptr as _, len, access.into());

        match NonNull::new(mr) {
            Some(mr) => Ok(MemoryRegion {
                mr,
                _alloc: PhantomData,
            }),
            None => Err(RegisterMemoryRegionErrorKind::Ibverbs(io::Error::last_os_error()).into()),
        }
    }
}

impl private::Sealed for MemoryRegion<'_> {}

impl Resource for MemoryRegion<'_> {
    const KIND: ResourceKind = ResourceKind::MemoryRegion;
}

impl AsRawResource for MemoryRegion<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::MemoryRegion(self.mr)
    }
}
