//! The resource allocator owns every create and destroy call the harness makes.
//!
//! Handles it returns borrow the allocator, so none of them can outlive it. Each created object is
//! recorded in a per-allocator arena; destroying a handle explicitly removes the record, and
//! whatever is left when the allocator is dropped is torn down in reverse creation order.
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::harness::config::{ConfigError, HarnessConfig};
use crate::harness::memory::{pages_to_bytes, page_size, AllocateBufferError, MemoryBlock, MemorySpan};
use crate::harness::port::{enumerate_port_gids, EnumeratePortGidsError, EnumeratePortGidsErrorKind, PortGid};
use crate::ibverbs::address::{
    AddressHandle, AddressHandleAttribute, CreateAddressHandleError, CreateAddressHandleErrorKind, Gid,
};
use crate::ibverbs::completion::{
    CompletionChannel, CompletionQueue, CreateCompletionChannelError, CreateCompletionQueueError,
};
use crate::ibverbs::device::{Device, DeviceInfo, DeviceList, GetDeviceListError, OpenDeviceError};
use crate::ibverbs::device_context::DeviceContext;
use crate::ibverbs::memory_region::{MemoryRegion, RegisterMemoryRegionError};
use crate::ibverbs::memory_window::{AllocateMemoryWindowError, MemoryWindow, MemoryWindowType};
use crate::ibverbs::protection_domain::{AllocateProtectionDomainError, ProtectionDomain};
use crate::ibverbs::queue_pair::{CreateQueuePairError, QueuePair, QueuePairInitAttribute, QueuePairType};
use crate::ibverbs::shared_receive_queue::{
    CreateSharedReceiveQueueError, SharedReceiveQueue, SharedReceiveQueueInitAttribute,
};
use crate::ibverbs::{AccessFlags, AsRawResource, DestroyResourceError, RawResource};

/// Error returned by [`VerbsAllocator::open_device`].
#[derive(Debug, thiserror::Error)]
#[error("failed to acquire an RDMA device")]
#[non_exhaustive]
pub struct AcquireDeviceError(#[from] pub AcquireDeviceErrorKind);

/// The enum type for [`AcquireDeviceError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AcquireDeviceErrorKind {
    #[error(transparent)]
    GetDeviceList(#[from] GetDeviceListError),
    #[error("device {name} not found")]
    DeviceNotFound { name: String },
    #[error(transparent)]
    OpenDevice(#[from] OpenDeviceError),
    #[error("device {name} has no usable port")]
    NoUsablePort {
        name: String,
        #[source]
        source: EnumeratePortGidsError,
    },
    #[error("no usable RDMA device found")]
    NoUsableDevice,
}

#[derive(Debug, Default)]
struct Arena {
    // creation order, so teardown can walk it backwards
    resources: Vec<RawResource>,
    contexts: Vec<Arc<DeviceContext>>,
    port_gids: HashMap<usize, Vec<PortGid>>,
}

impl Arena {
    fn retain_context(&mut self, ctx: &Arc<DeviceContext>) {
        if !self.contexts.iter().any(|retained| retained.id() == ctx.id()) {
            self.contexts.push(Arc::clone(ctx));
        }
    }
}

/// Creates and destroys verbs objects and test buffers for one fixture.
pub struct VerbsAllocator {
    config: HarnessConfig,
    arena: Mutex<Arena>,
}

impl VerbsAllocator {
    pub fn new(config: HarnessConfig) -> Result<Self, ConfigError> {
        config.queue.validate()?;
        Ok(VerbsAllocator {
            config,
            arena: Mutex::new(Arena::default()),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track<H: AsRawResource>(&self, handle: H) -> H {
        let raw = handle.as_raw_resource();
        log::debug!("created {} {raw:?}", H::KIND);
        self.arena().resources.push(raw);
        handle
    }

    fn destroy<H: AsRawResource>(&self, handle: H) -> Result<(), DestroyResourceError<H>> {
        let raw = handle.as_raw_resource();
        match unsafe { raw.destroy() } {
            Ok(()) => {
                log::debug!("destroyed {} {raw:?}", H::KIND);
                let mut arena = self.arena();
                if let Some(pos) = arena.resources.iter().rposition(|tracked| *tracked == raw) {
                    arena.resources.remove(pos);
                }
                Ok(())
            },
            Err(source) => {
                log::debug!("destroying {} {raw:?} rejected: {source}", H::KIND);
                Err(DestroyResourceError::new(handle, source))
            },
        }
    }

    /// Number of objects created by this allocator and not yet destroyed.
    pub fn live_resources(&self) -> usize {
        self.arena().resources.len()
    }

    /// Allocate `pages` zeroed pages. A shared block is backed by a memfd mapping that another
    /// process can map as well.
    pub fn alloc_buffer(&self, pages: usize, requires_shared_memory: bool) -> Result<MemoryBlock, AllocateBufferError> {
        let len = pages_to_bytes(pages)?;
        if requires_shared_memory {
            MemoryBlock::shared(len)
        } else {
            MemoryBlock::heap(len, page_size())
        }
    }

    pub fn alloc_aligned_buffer(&self, pages: usize, alignment: usize) -> Result<MemoryBlock, AllocateBufferError> {
        MemoryBlock::heap(pages_to_bytes(pages)?, alignment)
    }

    pub fn alloc_buffer_by_bytes(&self, bytes: usize, alignment: usize) -> Result<MemoryBlock, AllocateBufferError> {
        MemoryBlock::heap(bytes, alignment)
    }

    /// Open the configured device, or else the first device with an active port and a usable GID.
    ///
    /// With `suppress_ipv6_gid` set, only IPv4-mapped RoCE v2 GIDs count as usable. The GIDs found
    /// here back [`VerbsAllocator::get_local_port_gid`] and [`VerbsAllocator::create_ah`]. The
    /// allocator keeps a reference to the context until it is dropped.
    pub fn open_device(&self, suppress_ipv6_gid: bool) -> Result<Arc<DeviceContext>, AcquireDeviceError> {
        let devices = DeviceList::new().map_err(AcquireDeviceErrorKind::GetDeviceList)?;

        let (ctx, port_gids) = match &self.config.device_name {
            Some(name) => {
                let device = devices
                    .find_by_name(name)
                    .ok_or_else(|| AcquireDeviceErrorKind::DeviceNotFound { name: name.clone() })?;
                open_usable(&device, suppress_ipv6_gid)?
            },
            None => devices
                .iter()
                .find_map(|device| match open_usable(&device, suppress_ipv6_gid) {
                    Ok(opened) => Some(opened),
                    Err(err) => {
                        log::debug!("skipping device {}: {err}", device.name());
                        None
                    },
                })
                .ok_or(AcquireDeviceErrorKind::NoUsableDevice)?,
        };

        log::info!(
            "opened {} ({}) with local port {} gid {} (index {})",
            ctx.name(),
            ctx.guid(),
            port_gids[0].port,
            port_gids[0].gid,
            port_gids[0].gid_index
        );
        let mut arena = self.arena();
        arena.retain_context(&ctx);
        arena.port_gids.insert(ctx.id(), port_gids);
        Ok(ctx)
    }

    /// The first active port / GID pair of `ctx`. Contexts not opened through
    /// [`VerbsAllocator::open_device`] are enumerated honouring [`HarnessConfig::ipv4_only`], and
    /// the result is cached once this allocator holds the context (any PD allocated on it).
    pub fn get_local_port_gid(&self, ctx: &DeviceContext) -> Result<PortGid, EnumeratePortGidsError> {
        self.first_port_gid(ctx)?
            .ok_or_else(|| EnumeratePortGidsErrorKind::NoUsableGid.into())
    }

    fn first_port_gid(&self, ctx: &DeviceContext) -> Result<Option<PortGid>, EnumeratePortGidsError> {
        let id = ctx.id();
        if let Some(gids) = self.arena().port_gids.get(&id) {
            return Ok(gids.first().copied());
        }

        let gids = enumerate_port_gids(ctx, self.config.ipv4_only)?;
        let first = gids.first().copied();
        let mut arena = self.arena();
        // the id of a context this allocator does not keep open may be reused by a later one
        if arena.contexts.iter().any(|retained| retained.id() == id) {
            arena.port_gids.entry(id).or_insert(gids);
        }
        Ok(first)
    }

    pub fn alloc_pd(&self, ctx: &Arc<DeviceContext>) -> Result<ProtectionDomain<'_>, AllocateProtectionDomainError> {
        let pd = ProtectionDomain::alloc(ctx)?;
        self.arena().retain_context(ctx);
        Ok(self.track(pd))
    }

    pub fn dealloc_pd<'a>(&'a self, pd: ProtectionDomain<'a>) -> Result<(), DestroyResourceError<ProtectionDomain<'a>>> {
        self.destroy(pd)
    }

    /// Register `memory` (a whole [`MemoryBlock`] or a [`MemoryBlock::subblock`]) with `pd`. The
    /// region must be deregistered before the block is released.
    pub fn reg_mr<'m>(
        &self, pd: &ProtectionDomain, memory: impl Into<MemorySpan<'m>>, access: AccessFlags,
    ) -> Result<MemoryRegion<'_>, RegisterMemoryRegionError> {
        let span = memory.into();
        let mr = unsafe { MemoryRegion::register(pd, span.as_ptr() as usize, span.len(), access)? };
        Ok(self.track(mr))
    }

    pub fn dereg_mr<'a>(&'a self, mr: MemoryRegion<'a>) -> Result<(), DestroyResourceError<MemoryRegion<'a>>> {
        self.destroy(mr)
    }

    pub fn alloc_mw(
        &self, pd: &ProtectionDomain, mw_type: MemoryWindowType,
    ) -> Result<MemoryWindow<'_>, AllocateMemoryWindowError> {
        let mw = MemoryWindow::alloc(pd, mw_type)?;
        Ok(self.track(mw))
    }

    pub fn dealloc_mw<'a>(&'a self, mw: MemoryWindow<'a>) -> Result<(), DestroyResourceError<MemoryWindow<'a>>> {
        self.destroy(mw)
    }

    pub fn create_channel(
        &self, ctx: &Arc<DeviceContext>,
    ) -> Result<CompletionChannel<'_>, CreateCompletionChannelError> {
        let channel = CompletionChannel::create(ctx)?;
        self.arena().retain_context(ctx);
        Ok(self.track(channel))
    }

    pub fn destroy_channel<'a>(
        &'a self, channel: CompletionChannel<'a>,
    ) -> Result<(), DestroyResourceError<CompletionChannel<'a>>> {
        self.destroy(channel)
    }

    /// Create a CQ holding at least `max_wr` entries, optionally notifying through `channel`.
    pub fn create_cq(
        &self, ctx: &Arc<DeviceContext>, max_wr: u32, channel: Option<&CompletionChannel>,
    ) -> Result<CompletionQueue<'_>, CreateCompletionQueueError> {
        let cq = CompletionQueue::create(ctx, max_wr, channel)?;
        self.arena().retain_context(ctx);
        Ok(self.track(cq))
    }

    /// Create a CQ of the configured default depth without a channel.
    pub fn create_default_cq(&self, ctx: &Arc<DeviceContext>) -> Result<CompletionQueue<'_>, CreateCompletionQueueError> {
        self.create_cq(ctx, self.config.queue.cq_depth, None)
    }

    pub fn destroy_cq<'a>(&'a self, cq: CompletionQueue<'a>) -> Result<(), DestroyResourceError<CompletionQueue<'a>>> {
        self.destroy(cq)
    }

    pub fn create_srq(
        &self, pd: &ProtectionDomain, max_wr: u32,
    ) -> Result<SharedReceiveQueue<'_>, CreateSharedReceiveQueueError> {
        let mut attr = SharedReceiveQueueInitAttribute::new(max_wr);
        attr.setup_max_sge(self.config.queue.max_recv_sge);
        self.create_srq_with(pd, &attr)
    }

    pub fn create_srq_with(
        &self, pd: &ProtectionDomain, attr: &SharedReceiveQueueInitAttribute,
    ) -> Result<SharedReceiveQueue<'_>, CreateSharedReceiveQueueError> {
        let srq = SharedReceiveQueue::create(pd, attr)?;
        Ok(self.track(srq))
    }

    pub fn destroy_srq<'a>(
        &'a self, srq: SharedReceiveQueue<'a>,
    ) -> Result<(), DestroyResourceError<SharedReceiveQueue<'a>>> {
        self.destroy(srq)
    }

    /// Create an RC QP using `cq` for both queues and the configured queue sizes.
    pub fn create_qp(&self, pd: &ProtectionDomain, cq: &CompletionQueue) -> Result<QueuePair<'_>, CreateQueuePairError> {
        self.create_qp_full(
            pd,
            cq,
            cq,
            None,
            self.config.queue.max_send_wr,
            self.config.queue.max_recv_wr,
            QueuePairType::ReliableConnection,
            false,
        )
    }

    pub fn create_qp_with_srq(
        &self, pd: &ProtectionDomain, cq: &CompletionQueue, srq: &SharedReceiveQueue,
    ) -> Result<QueuePair<'_>, CreateQueuePairError> {
        self.create_qp_full(
            pd,
            cq,
            cq,
            Some(srq),
            self.config.queue.max_send_wr,
            self.config.queue.max_recv_wr,
            QueuePairType::ReliableConnection,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_qp_full(
        &self, pd: &ProtectionDomain, send_cq: &CompletionQueue, recv_cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>, max_send_wr: u32, max_recv_wr: u32, qp_type: QueuePairType, sig_all: bool,
    ) -> Result<QueuePair<'_>, CreateQueuePairError> {
        let queue = &self.config.queue;
        let mut init_attr = QueuePairInitAttribute::new(qp_type);
        init_attr
            .setup_send_cq(send_cq)
            .setup_recv_cq(recv_cq)
            .setup_srq(srq)
            .setup_max_send_wr(max_send_wr)
            .setup_max_recv_wr(max_recv_wr)
            .setup_max_send_sge(queue.max_send_sge)
            .setup_max_recv_sge(queue.max_recv_sge)
            .setup_max_inline_data(queue.max_inline_data)
            .setup_sq_sig_all(sig_all);
        self.create_qp_with(pd, &init_attr)
    }

    pub fn create_qp_with(
        &self, pd: &ProtectionDomain, init_attr: &QueuePairInitAttribute,
    ) -> Result<QueuePair<'_>, CreateQueuePairError> {
        let qp = QueuePair::create(pd, init_attr)?;
        Ok(self.track(qp))
    }

    pub fn destroy_qp<'a>(&'a self, qp: QueuePair<'a>) -> Result<(), DestroyResourceError<QueuePair<'a>>> {
        self.destroy(qp)
    }

    /// Create an address handle routing to `remote_gid` from the local port GID of the context
    /// `pd` belongs to. Contexts not opened through [`VerbsAllocator::open_device`] are
    /// enumerated once, honouring [`HarnessConfig::ipv4_only`].
    pub fn create_ah(&self, pd: &ProtectionDomain, remote_gid: Gid) -> Result<AddressHandle<'_>, CreateAddressHandleError> {
        let ctx = self
            .arena()
            .contexts
            .iter()
            .find(|retained| retained.id() == pd.context_id())
            .cloned()
            .ok_or(CreateAddressHandleErrorKind::NoLocalPortGid)?;
        let local = self
            .first_port_gid(&ctx)
            .map_err(CreateAddressHandleErrorKind::LocalPortGid)?
            .ok_or(CreateAddressHandleErrorKind::NoLocalPortGid)?;

        let connection = &self.config.connection;
        let mut attr = AddressHandleAttribute::new();
        attr.setup_port(local.port).setup_grh(
            &remote_gid,
            0,
            local.gid_index,
            connection.hop_limit,
            connection.traffic_class,
        );
        let ah = AddressHandle::create(pd, &mut attr).map_err(CreateAddressHandleErrorKind::Ibverbs)?;
        Ok(self.track(ah))
    }

    pub fn destroy_ah<'a>(&'a self, ah: AddressHandle<'a>) -> Result<(), DestroyResourceError<AddressHandle<'a>>> {
        self.destroy(ah)
    }
}

fn open_usable(device: &Device, ipv4_only: bool) -> Result<(Arc<DeviceContext>, Vec<PortGid>), AcquireDeviceError> {
    let ctx = device.open().map_err(AcquireDeviceErrorKind::OpenDevice)?;
    let no_usable_port = |source: EnumeratePortGidsError| AcquireDeviceErrorKind::NoUsablePort {
        name: device.name(),
        source,
    };

    let port_gids = enumerate_port_gids(&ctx, ipv4_only).map_err(&no_usable_port)?;
    if port_gids.is_empty() {
        return Err(no_usable_port(EnumeratePortGidsErrorKind::NoUsableGid.into()).into());
    }
    Ok((ctx, port_gids))
}

impl Drop for VerbsAllocator {
    fn drop(&mut self) {
        let arena = self.arena.get_mut().unwrap_or_else(PoisonError::into_inner);
        let resources = mem::take(&mut arena.resources);
        if !resources.is_empty() {
            log::debug!("tearing down {} leftover verbs objects", resources.len());
        }

        for raw in resources.into_iter().rev() {
            if let Err(err) = unsafe { raw.destroy() } {
                log::warn!("failed to destroy leftover {} {raw:?}: {err}", raw.kind());
            }
        }
        // contexts close only after everything created on them is gone
        arena.port_gids.clear();
        arena.contexts.clear();
    }
}

impl std::fmt::Debug for VerbsAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena();
        f.debug_struct("VerbsAllocator")
            .field("live_resources", &arena.resources.len())
            .field("contexts", &arena.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::memory::MIN_ALIGNMENT;
    use rstest::rstest;

    fn allocator() -> VerbsAllocator {
        VerbsAllocator::new(HarnessConfig::default()).unwrap()
    }

    #[rstest]
    #[case(1, false)]
    #[case(3, false)]
    #[case(1, true)]
    #[case(4, true)]
    fn test_alloc_buffer(#[case] pages: usize, #[case] shared: bool) {
        let block = allocator().alloc_buffer(pages, shared).unwrap();
        assert_eq!(block.len(), pages * page_size());
        assert_eq!(block.pages(), pages);
        assert_eq!(block.is_shared(), shared);
        assert_eq!(block.addr() % page_size() as u64, 0);
    }

    #[test]
    fn test_zero_sized_buffers_rejected() {
        let allocator = allocator();
        assert!(allocator.alloc_buffer(0, false).is_err());
        assert!(allocator.alloc_buffer(0, true).is_err());
        assert!(allocator.alloc_aligned_buffer(0, 64).is_err());
        assert!(allocator.alloc_buffer_by_bytes(0, 64).is_err());
        assert!(allocator.alloc_buffer(usize::MAX, false).is_err());
    }

    #[rstest]
    #[case(MIN_ALIGNMENT)]
    #[case(64)]
    #[case(2 * 1024 * 1024)]
    fn test_aligned_buffers(#[case] alignment: usize) {
        let allocator = allocator();
        let block = allocator.alloc_aligned_buffer(2, alignment).unwrap();
        assert_eq!(block.addr() % alignment as u64, 0);
        assert_eq!(block.alignment(), alignment);

        let block = allocator.alloc_buffer_by_bytes(100, alignment).unwrap();
        assert_eq!(block.addr() % alignment as u64, 0);
        assert_eq!(block.len(), 100);
    }

    #[test]
    fn test_invalid_queue_config_rejected() {
        let mut config = HarnessConfig::default();
        config.queue.max_send_wr = 0;
        assert!(VerbsAllocator::new(config).is_err());
    }

    #[test]
    fn test_fresh_allocator_tracks_nothing() {
        let allocator = allocator();
        assert_eq!(allocator.live_resources(), 0);
        assert!(format!("{allocator:?}").contains("live_resources: 0"));
    }
}
