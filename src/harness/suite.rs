//! [`VerbsHelperSuite`] is the one object a test case holds: it owns a [`VerbsAllocator`] and a
//! [`ConnectionBackend`] and forwards every call to one of them unchanged.
use std::sync::Arc;

use crate::harness::allocator::{AcquireDeviceError, VerbsAllocator};
use crate::harness::backend::ConnectionBackend;
use crate::harness::config::HarnessConfig;
use crate::harness::memory::{AllocateBufferError, MemoryBlock, MemorySpan};
use crate::harness::port::{EnumeratePortGidsError, PortGid};
use crate::ibverbs::address::{AddressHandle, CreateAddressHandleError, Gid};
use crate::ibverbs::completion::{
    CompletionChannel, CompletionQueue, CreateCompletionChannelError, CreateCompletionQueueError,
};
use crate::ibverbs::device_context::DeviceContext;
use crate::ibverbs::memory_region::{MemoryRegion, RegisterMemoryRegionError};
use crate::ibverbs::memory_window::{AllocateMemoryWindowError, MemoryWindow, MemoryWindowType};
use crate::ibverbs::protection_domain::{AllocateProtectionDomainError, ProtectionDomain};
use crate::ibverbs::queue_pair::{
    CreateQueuePairError, ModifyQueuePairError, QueuePair, QueuePairAttribute, QueuePairAttributeMask,
    QueuePairInitAttribute, QueuePairType,
};
use crate::ibverbs::shared_receive_queue::{
    CreateSharedReceiveQueueError, SharedReceiveQueue, SharedReceiveQueueInitAttribute,
};
use crate::ibverbs::{AccessFlags, DestroyResourceError};

#[derive(Debug)]
pub struct VerbsHelperSuite {
    allocator: VerbsAllocator,
    backend: ConnectionBackend,
}

impl Default for VerbsHelperSuite {
    fn default() -> Self {
        Self::new()
    }
}

impl VerbsHelperSuite {
    /// A suite with the default configuration.
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    /// # Panics
    ///
    /// Panics if either collaborator rejects `config`: a harness that cannot be built is an
    /// unusable environment, not a test outcome.
    pub fn with_config(config: HarnessConfig) -> Self {
        let backend = match ConnectionBackend::new(&config.connection) {
            Ok(backend) => backend,
            Err(err) => panic!("failed to construct connection backend: {err}"),
        };
        let allocator = match VerbsAllocator::new(config) {
            Ok(allocator) => allocator,
            Err(err) => panic!("failed to construct verbs allocator: {err}"),
        };
        VerbsHelperSuite { allocator, backend }
    }

    /// A suite configured from the environment, see [`HarnessConfig::from_env`].
    ///
    /// # Panics
    ///
    /// Panics if the configuration cannot be loaded.
    pub fn from_env() -> Self {
        match HarnessConfig::from_env() {
            Ok(config) => Self::with_config(config),
            Err(err) => panic!("failed to load harness config: {err}"),
        }
    }

    pub fn allocator(&self) -> &VerbsAllocator {
        &self.allocator
    }

    pub fn backend(&self) -> &ConnectionBackend {
        &self.backend
    }

    pub fn config(&self) -> &HarnessConfig {
        self.allocator.config()
    }

    // Connection backend.

    pub fn set_up_rc_qp(
        &self, qp: &mut QueuePair, local: &PortGid, remote_gid: Gid, remote_qpn: u32,
    ) -> Result<(), ModifyQueuePairError> {
        self.backend.set_up_rc_qp(qp, local, remote_gid, remote_qpn)
    }

    pub fn set_up_self_connected_rc_qp(&self, qp: &mut QueuePair, local: &PortGid) -> Result<(), ModifyQueuePairError> {
        self.backend.set_up_self_connected_rc_qp(qp, local)
    }

    pub fn set_up_loopback_rc_qps(
        &self, qp1: &mut QueuePair, qp2: &mut QueuePair, local: &PortGid,
    ) -> Result<(), ModifyQueuePairError> {
        self.backend.set_up_loopback_rc_qps(qp1, qp2, local)
    }

    pub fn set_up_ud_qp(&self, qp: &mut QueuePair, local: &PortGid, qkey: u32) -> Result<(), ModifyQueuePairError> {
        self.backend.set_up_ud_qp(qp, local, qkey)
    }

    pub fn set_qp_init(&self, qp: &mut QueuePair, port: u8) -> Result<(), ModifyQueuePairError> {
        self.backend.set_qp_init(qp, port)
    }

    pub fn set_qp_rtr(
        &self, qp: &mut QueuePair, local: &PortGid, remote_gid: Gid, remote_qpn: u32,
    ) -> Result<(), ModifyQueuePairError> {
        self.backend.set_qp_rtr(qp, local, remote_gid, remote_qpn)
    }

    pub fn set_qp_rts(&self, qp: &mut QueuePair) -> Result<(), ModifyQueuePairError> {
        self.backend.set_qp_rts(qp)
    }

    pub fn set_qp_rts_with(
        &self, qp: &mut QueuePair, attr: QueuePairAttribute, mask: QueuePairAttributeMask,
    ) -> Result<(), ModifyQueuePairError> {
        self.backend.set_qp_rts_with(qp, attr, mask)
    }

    pub fn set_qp_error(&self, qp: &mut QueuePair) -> Result<(), ModifyQueuePairError> {
        self.backend.set_qp_error(qp)
    }

    // Resource allocator.

    pub fn alloc_buffer(&self, pages: usize, requires_shared_memory: bool) -> Result<MemoryBlock, AllocateBufferError> {
        self.allocator.alloc_buffer(pages, requires_shared_memory)
    }

    pub fn alloc_aligned_buffer(&self, pages: usize, alignment: usize) -> Result<MemoryBlock, AllocateBufferError> {
        self.allocator.alloc_aligned_buffer(pages, alignment)
    }

    pub fn alloc_buffer_by_bytes(&self, bytes: usize, alignment: usize) -> Result<MemoryBlock, AllocateBufferError> {
        self.allocator.alloc_buffer_by_bytes(bytes, alignment)
    }

    pub fn open_device(&self, suppress_ipv6_gid: bool) -> Result<Arc<DeviceContext>, AcquireDeviceError> {
        self.allocator.open_device(suppress_ipv6_gid)
    }

    pub fn get_local_port_gid(&self, ctx: &DeviceContext) -> Result<PortGid, EnumeratePortGidsError> {
        self.allocator.get_local_port_gid(ctx)
    }

    pub fn create_ah(&self, pd: &ProtectionDomain, remote_gid: Gid) -> Result<AddressHandle<'_>, CreateAddressHandleError> {
        self.allocator.create_ah(pd, remote_gid)
    }

    pub fn destroy_ah<'a>(&'a self, ah: AddressHandle<'a>) -> Result<(), DestroyResourceError<AddressHandle<'a>>> {
        self.allocator.destroy_ah(ah)
    }

    pub fn alloc_pd(&self, ctx: &Arc<DeviceContext>) -> Result<ProtectionDomain<'_>, AllocateProtectionDomainError> {
        self.allocator.alloc_pd(ctx)
    }

    pub fn dealloc_pd<'a>(&'a self, pd: ProtectionDomain<'a>) -> Result<(), DestroyResourceError<ProtectionDomain<'a>>> {
        self.allocator.dealloc_pd(pd)
    }

    pub fn reg_mr<'m>(
        &self, pd: &ProtectionDomain, memory: impl Into<MemorySpan<'m>>, access: AccessFlags,
    ) -> Result<MemoryRegion<'_>, RegisterMemoryRegionError> {
        self.allocator.reg_mr(pd, memory, access)
    }

    pub fn dereg_mr<'a>(&'a self, mr: MemoryRegion<'a>) -> Result<(), DestroyResourceError<MemoryRegion<'a>>> {
        self.allocator.dereg_mr(mr)
    }

    pub fn alloc_mw(
        &self, pd: &ProtectionDomain, mw_type: MemoryWindowType,
    ) -> Result<MemoryWindow<'_>, AllocateMemoryWindowError> {
        self.allocator.alloc_mw(pd, mw_type)
    }

    pub fn dealloc_mw<'a>(&'a self, mw: MemoryWindow<'a>) -> Result<(), DestroyResourceError<MemoryWindow<'a>>> {
        self.allocator.dealloc_mw(mw)
    }

    pub fn create_channel(
        &self, ctx: &Arc<DeviceContext>,
    ) -> Result<CompletionChannel<'_>, CreateCompletionChannelError> {
        self.allocator.create_channel(ctx)
    }

    pub fn destroy_channel<'a>(
        &'a self, channel: CompletionChannel<'a>,
    ) -> Result<(), DestroyResourceError<CompletionChannel<'a>>> {
        self.allocator.destroy_channel(channel)
    }

    pub fn create_cq(
        &self, ctx: &Arc<DeviceContext>, max_wr: u32, channel: Option<&CompletionChannel>,
    ) -> Result<CompletionQueue<'_>, CreateCompletionQueueError> {
        self.allocator.create_cq(ctx, max_wr, channel)
    }

    pub fn create_default_cq(&self, ctx: &Arc<DeviceContext>) -> Result<CompletionQueue<'_>, CreateCompletionQueueError> {
        self.allocator.create_default_cq(ctx)
    }

    pub fn destroy_cq<'a>(&'a self, cq: CompletionQueue<'a>) -> Result<(), DestroyResourceError<CompletionQueue<'a>>> {
        self.allocator.destroy_cq(cq)
    }

    pub fn create_srq(
        &self, pd: &ProtectionDomain, max_wr: u32,
    ) -> Result<SharedReceiveQueue<'_>, CreateSharedReceiveQueueError> {
        self.allocator.create_srq(pd, max_wr)
    }

    pub fn create_srq_with(
        &self, pd: &ProtectionDomain, attr: &SharedReceiveQueueInitAttribute,
    ) -> Result<SharedReceiveQueue<'_>, CreateSharedReceiveQueueError> {
        self.allocator.create_srq_with(pd, attr)
    }

    pub fn destroy_srq<'a>(
        &'a self, srq: SharedReceiveQueue<'a>,
    ) -> Result<(), DestroyResourceError<SharedReceiveQueue<'a>>> {
        self.allocator.destroy_srq(srq)
    }

    pub fn create_qp(&self, pd: &ProtectionDomain, cq: &CompletionQueue) -> Result<QueuePair<'_>, CreateQueuePairError> {
        self.allocator.create_qp(pd, cq)
    }

    pub fn create_qp_with_srq(
        &self, pd: &ProtectionDomain, cq: &CompletionQueue, srq: &SharedReceiveQueue,
    ) -> Result<QueuePair<'_>, CreateQueuePairError> {
        self.allocator.create_qp_with_srq(pd, cq, srq)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_qp_full(
        &self, pd: &ProtectionDomain, send_cq: &CompletionQueue, recv_cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>, max_send_wr: u32, max_recv_wr: u32, qp_type: QueuePairType, sig_all: bool,
    ) -> Result<QueuePair<'_>, CreateQueuePairError> {
        self.allocator
            .create_qp_full(pd, send_cq, recv_cq, srq, max_send_wr, max_recv_wr, qp_type, sig_all)
    }

    pub fn create_qp_with(
        &self, pd: &ProtectionDomain, init_attr: &QueuePairInitAttribute,
    ) -> Result<QueuePair<'_>, CreateQueuePairError> {
        self.allocator.create_qp_with(pd, init_attr)
    }

    pub fn destroy_qp<'a>(&'a self, qp: QueuePair<'a>) -> Result<(), DestroyResourceError<QueuePair<'a>>> {
        self.allocator.destroy_qp(qp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_suite() {
        let suite = VerbsHelperSuite::default();
        assert_eq!(suite.config(), &HarnessConfig::default());
        assert_eq!(suite.backend().config(), &suite.config().connection);
        assert_eq!(suite.allocator().live_resources(), 0);

        let block = suite.alloc_buffer(1, false).unwrap();
        assert!(!block.is_shared());
    }

    #[test]
    #[should_panic(expected = "failed to construct connection backend")]
    fn test_invalid_connection_config_is_fatal() {
        let mut config = HarnessConfig::default();
        config.connection.psn = u32::MAX;
        VerbsHelperSuite::with_config(config);
    }

    #[test]
    #[should_panic(expected = "failed to construct verbs allocator")]
    fn test_invalid_queue_config_is_fatal() {
        let mut config = HarnessConfig::default();
        config.queue.cq_depth = 0;
        VerbsHelperSuite::with_config(config);
    }
}
