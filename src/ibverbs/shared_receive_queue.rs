//! A shared receive queue lets several QPs of one PD consume receive buffers from a common pool.
use rdma_mummy_sys::{ibv_create_srq, ibv_post_srq_recv, ibv_recv_wr, ibv_sge, ibv_srq, ibv_srq_attr, ibv_srq_init_attr};
use std::io;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use super::protection_domain::ProtectionDomain;
use super::queue_pair::PostRecvError;
use super::{private, AsRawResource, RawResource, Resource, ResourceKind};

#[derive(Debug, thiserror::Error)]
#[error("failed to create shared receive queue (max_wr={max_wr})")]
#[non_exhaustive]
pub struct CreateSharedReceiveQueueError {
    pub max_wr: u32,
    #[source]
    pub source: io::Error,
}

/// Creation attributes of a [`SharedReceiveQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedReceiveQueueInitAttribute {
    pub max_wr: u32,
    pub max_sge: u32,
    /// Armed limit, `0` leaves the limit event disarmed.
    pub srq_limit: u32,
}

impl SharedReceiveQueueInitAttribute {
    pub fn new(max_wr: u32) -> Self {
        SharedReceiveQueueInitAttribute {
            max_wr,
            max_sge: 1,
            srq_limit: 0,
        }
    }

    pub fn setup_max_sge(&mut self, max_sge: u32) -> &mut Self {
        self.max_sge = max_sge;
        self
    }

    pub fn setup_srq_limit(&mut self, srq_limit: u32) -> &mut Self {
        self.srq_limit = srq_limit;
        self
    }
}

#[derive(Debug)]
pub struct SharedReceiveQueue<'a> {
    pub(crate) srq: NonNull<ibv_srq>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for SharedReceiveQueue<'_> {}
unsafe impl Sync for SharedReceiveQueue<'_> {}

impl SharedReceiveQueue<'_> {
    pub(crate) fn create(
        pd: &ProtectionDomain, attr: &SharedReceiveQueueInitAttribute,
    ) -> Result<Self, CreateSharedReceiveQueueError> {
        let mut init_attr = ibv_srq_init_attr {
            srq_context: ptr::null_mut(),
            attr: ibv_srq_attr {
                max_wr: attr.max_wr,
                max_sge: attr.max_sge,
                srq_limit: attr.srq_limit,
            },
        };
        let srq = unsafe { ibv_create_srq(pd.pd.as_ptr(), &mut init_attr) };
        match NonNull::new(srq) {
            Some(srq) => Ok(SharedReceiveQueue {
                srq,
                _alloc: PhantomData,
            }),
            None => Err(CreateSharedReceiveQueueError {
                max_wr: attr.max_wr,
                source: io::Error::last_os_error(),
            }),
        }
    }

    /// Post one receive buffer to the shared pool.
    ///
    /// # Safety
    ///
    /// `addr..addr + length` must lie inside a memory region registered with `lkey` and stay valid
    /// until the matching completion is polled.
    pub unsafe fn post_recv(&self, wr_id: u64, lkey: u32, addr: u64, length: u32) -> Result<(), PostRecvError> {
        let mut sge = ibv_sge { addr, length, lkey };
        let mut wr = ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad_wr: *mut ibv_recv_wr = ptr::null_mut();

        match ibv_post_srq_recv(self.srq.as_ptr(), &mut wr, &mut bad_wr) {
            0 => Ok(()),
            err => Err(PostRecvError::Ibverbs(io::Error::from_raw_os_error(err))),
        }
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn srq(&self) -> NonNull<ibv_srq> {
        self.srq
    }
}

impl private::Sealed for SharedReceiveQueue<'_> {}

impl Resource for SharedReceiveQueue<'_> {
    const KIND: ResourceKind = ResourceKind::SharedReceiveQueue;
}

impl AsRawResource for SharedReceiveQueue<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::SharedReceiveQueue(self.srq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srq_init_attr_defaults() {
        let mut attr = SharedReceiveQueueInitAttribute::new(200);
        assert_eq!(attr.max_sge, 1);
        assert_eq!(attr.srq_limit, 0);

        attr.setup_max_sge(4).setup_srq_limit(16);
        assert_eq!(attr, SharedReceiveQueueInitAttribute {
            max_wr: 200,
            max_sge: 4,
            srq_limit: 16,
        });
    }
}
