//! Memory windows grant remote access to a part of an already registered memory region and can be
//! rebound without re-registering.
use rdma_mummy_sys::{ibv_alloc_mw, ibv_mw, ibv_mw_type};
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::protection_domain::ProtectionDomain;
use super::{private, AsRawResource, RawResource, Resource, ResourceKind};

/// Error returned by [`VerbsAllocator::alloc_mw`] for allocating a memory window.
///
/// [`VerbsAllocator::alloc_mw`]: crate::harness::allocator::VerbsAllocator::alloc_mw
#[derive(Debug, thiserror::Error)]
#[error("failed to allocate {mw_type:?} memory window")]
#[non_exhaustive]
pub struct AllocateMemoryWindowError {
    pub mw_type: MemoryWindowType,
    #[source]
    pub source: io::Error,
}

/// The type of a memory window is fixed when it is allocated.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryWindowType {
    /// Bound with a bind verb, the binding is tied to the PD.
    Type1 = ibv_mw_type::IBV_MW_TYPE_1,
    /// Bound through a work request, the binding is tied to a QP.
    Type2 = ibv_mw_type::IBV_MW_TYPE_2,
}

impl From<u32> for MemoryWindowType {
    fn from(mw_type: u32) -> Self {
        match mw_type {
            ibv_mw_type::IBV_MW_TYPE_1 => MemoryWindowType::Type1,
            ibv_mw_type::IBV_MW_TYPE_2 => MemoryWindowType::Type2,
            _ => panic!("Unknown memory window type: {mw_type}"),
        }
    }
}

#[derive(Debug)]
pub struct MemoryWindow<'a> {
    mw: NonNull<ibv_mw>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for MemoryWindow<'_> {}
unsafe impl Sync for MemoryWindow<'_> {}

impl MemoryWindow<'_> {
    pub(crate) fn alloc(pd: &ProtectionDomain, mw_type: MemoryWindowType) -> Result<Self, AllocateMemoryWindowError> {
        let mw = unsafe { ibv_alloc_mw(pd.pd.as_ptr(), mw_type as _) };
        match NonNull::new(mw) {
            Some(mw) => Ok(MemoryWindow {
                mw,
                _alloc: PhantomData,
            }),
            None => Err(AllocateMemoryWindowError {
                mw_type,
                source: io::Error::last_os_error(),
            }),
        }
    }

    pub fn mw_type(&self) -> MemoryWindowType {
        unsafe { self.mw.as_ref().type_.into() }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { self.mw.as_ref().rkey }
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn mw(&self) -> NonNull<ibv_mw> {
        self.mw
    }
}

impl private::Sealed for MemoryWindow<'_> {}

impl Resource for MemoryWindow<'_> {
    const KIND: ResourceKind = ResourceKind::MemoryWindow;
}

impl AsRawResource for MemoryWindow<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::MemoryWindow(self.mw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_window_type_conversion() {
        assert_eq!(MemoryWindowType::from(ibv_mw_type::IBV_MW_TYPE_1), MemoryWindowType::Type1);
        assert_eq!(MemoryWindowType::from(MemoryWindowType::Type2 as u32), MemoryWindowType::Type2);
    }
}
