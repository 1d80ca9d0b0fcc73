use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};
use std::{fmt, io};

use bitmask_enum::bitmask;
use rdma_mummy_sys::{
    ibv_comp_channel, ibv_cq, ibv_create_comp_channel, ibv_create_cq, ibv_poll_cq, ibv_wc, ibv_wc_flags, ibv_wc_opcode,
    ibv_wc_status,
};

use super::device_context::DeviceContext;
use super::{private, AsRawResource, RawResource, Resource, ResourceKind};

#[derive(Debug, thiserror::Error)]
#[error("failed to create completion channel")]
#[non_exhaustive]
pub struct CreateCompletionChannelError(#[from] pub CreateCompletionChannelErrorKind);

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateCompletionChannelErrorKind {
    Ibverbs(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to create completion queue with {cqe} entries")]
#[non_exhaustive]
pub struct CreateCompletionQueueError {
    pub cqe: u32,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PollCompletionQueueError {
    /// The negative value `ibv_poll_cq` returned. Providers do not agree on an errno convention,
    /// so it is kept as is.
    #[error("poll completion queue failed with provider status {0}")]
    Provider(i32),
    #[error("no completion arrived within {0:?}")]
    Timeout(Duration),
}

/// Completion status; anything the harness does not name is kept as its raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCompletionStatus {
    Success,
    LocalLengthError,
    LocalQueuePairOperationError,
    LocalProtectionError,
    WorkRequestFlushedError,
    MemoryWindowBindError,
    BadResponseError,
    LocalAccessError,
    RemoteInvalidRequestError,
    RemoteAccessError,
    RemoteOperationError,
    RetryCounterExceededError,
    ResponderNotReadyRetryCounterExceededError,
    RemoteAbortedError,
    FatalError,
    ResponseTimeoutError,
    GeneralError,
    Other(u32),
}

impl From<u32> for WorkCompletionStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => WorkCompletionStatus::Success,
            ibv_wc_status::IBV_WC_LOC_LEN_ERR => WorkCompletionStatus::LocalLengthError,
            ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => WorkCompletionStatus::LocalQueuePairOperationError,
            ibv_wc_status::IBV_WC_LOC_PROT_ERR => WorkCompletionStatus::LocalProtectionError,
            ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WorkCompletionStatus::WorkRequestFlushedError,
            ibv_wc_status::IBV_WC_MW_BIND_ERR => WorkCompletionStatus::MemoryWindowBindError,
            ibv_wc_status::IBV_WC_BAD_RESP_ERR => WorkCompletionStatus::BadResponseError,
            ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => WorkCompletionStatus::LocalAccessError,
            ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WorkCompletionStatus::RemoteInvalidRequestError,
            ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WorkCompletionStatus::RemoteAccessError,
            ibv_wc_status::IBV_WC_REM_OP_ERR => WorkCompletionStatus::RemoteOperationError,
            ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WorkCompletionStatus::RetryCounterExceededError,
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WorkCompletionStatus::ResponderNotReadyRetryCounterExceededError,
            ibv_wc_status::IBV_WC_REM_ABORT_ERR => WorkCompletionStatus::RemoteAbortedError,
            ibv_wc_status::IBV_WC_FATAL_ERR => WorkCompletionStatus::FatalError,
            ibv_wc_status::IBV_WC_RESP_TIMEOUT_ERR => WorkCompletionStatus::ResponseTimeoutError,
            ibv_wc_status::IBV_WC_GENERAL_ERR => WorkCompletionStatus::GeneralError,
            other => WorkCompletionStatus::Other(other),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCompletionOperationType {
    Send = ibv_wc_opcode::IBV_WC_SEND,
    Write = ibv_wc_opcode::IBV_WC_RDMA_WRITE,
    Read = ibv_wc_opcode::IBV_WC_RDMA_READ,
    CompareAndSwap = ibv_wc_opcode::IBV_WC_COMP_SWAP,
    FetchAndAdd = ibv_wc_opcode::IBV_WC_FETCH_ADD,
    BindMemoryWindow = ibv_wc_opcode::IBV_WC_BIND_MW,
    LocalInvalidate = ibv_wc_opcode::IBV_WC_LOCAL_INV,
    Receive = ibv_wc_opcode::IBV_WC_RECV,
    ReceiveWithImmediate = ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM,
}

impl WorkCompletionOperationType {
    fn from_raw(opcode: u32) -> Option<Self> {
        Some(match opcode {
            ibv_wc_opcode::IBV_WC_SEND => WorkCompletionOperationType::Send,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => WorkCompletionOperationType::Write,
            ibv_wc_opcode::IBV_WC_RDMA_READ => WorkCompletionOperationType::Read,
            ibv_wc_opcode::IBV_WC_COMP_SWAP => WorkCompletionOperationType::CompareAndSwap,
            ibv_wc_opcode::IBV_WC_FETCH_ADD => WorkCompletionOperationType::FetchAndAdd,
            ibv_wc_opcode::IBV_WC_BIND_MW => WorkCompletionOperationType::BindMemoryWindow,
            ibv_wc_opcode::IBV_WC_LOCAL_INV => WorkCompletionOperationType::LocalInvalidate,
            ibv_wc_opcode::IBV_WC_RECV => WorkCompletionOperationType::Receive,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WorkCompletionOperationType::ReceiveWithImmediate,
            _ => return None,
        })
    }
}

#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum WorkCompletionFlags {
    Grh = ibv_wc_flags::IBV_WC_GRH.0 as _,
    WithImmediate = ibv_wc_flags::IBV_WC_WITH_IMM.0 as _,
    IpChecksumOk = ibv_wc_flags::IBV_WC_IP_CSUM_OK.0 as _,
    WithInvalidate = ibv_wc_flags::IBV_WC_WITH_INV.0 as _,
}

#[derive(Debug)]
pub struct CompletionChannel<'a> {
    pub(crate) channel: NonNull<ibv_comp_channel>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for CompletionChannel<'_> {}
unsafe impl Sync for CompletionChannel<'_> {}

impl CompletionChannel<'_> {
    pub(crate) fn create(dev_ctx: &DeviceContext) -> Result<Self, CreateCompletionChannelError> {
        let comp_channel = unsafe { ibv_create_comp_channel(dev_ctx.context) };
        match NonNull::new(comp_channel) {
            Some(channel) => Ok(CompletionChannel {
                channel,
                _alloc: PhantomData,
            }),
            None => Err(CreateCompletionChannelErrorKind::Ibverbs(io::Error::last_os_error()).into()),
        }
    }

    /// The file descriptor that becomes readable when a bound CQ generates an event.
    pub fn fd(&self) -> RawFd {
        unsafe { self.channel.as_ref().fd }
    }
}

impl private::Sealed for CompletionChannel<'_> {}

impl Resource for CompletionChannel<'_> {
    const KIND: ResourceKind = ResourceKind::CompletionChannel;
}

impl AsRawResource for CompletionChannel<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::CompletionChannel(self.channel)
    }
}

#[derive(Debug)]
pub struct CompletionQueue<'a> {
    pub(crate) cq: NonNull<ibv_cq>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for CompletionQueue<'_> {}
unsafe impl Sync for CompletionQueue<'_> {}

impl CompletionQueue<'_> {
    pub(crate) fn create(
        dev_ctx: &DeviceContext, cqe: u32, channel: Option<&CompletionChannel>,
    ) -> Result<Self, CreateCompletionQueueError> {
        let channel = channel.map_or(ptr::null_mut(), |channel| channel.channel.as_ptr());
        let cq = unsafe { ibv_create_cq(dev_ctx.context, cqe as _, ptr::null_mut(), channel, 0) };
        match NonNull::new(cq) {
            Some(cq) => Ok(CompletionQueue {
                cq,
                _alloc: PhantomData,
            }),
            None => Err(CreateCompletionQueueError {
                cqe,
                source: io::Error::last_os_error(),
            }),
        }
    }

    /// The number of entries the provider actually allocated, at least the requested depth.
    pub fn capacity(&self) -> u32 {
        unsafe { self.cq.as_ref().cqe.max(0) as u32 }
    }

    /// Poll at most `max_entries` completions without blocking.
    pub fn poll(&self, max_entries: usize) -> Result<Vec<WorkCompletion>, PollCompletionQueueError> {
        let mut wcs = Vec::<ibv_wc>::with_capacity(max_entries);
        let ret = unsafe { ibv_poll_cq(self.cq.as_ptr(), max_entries.min(i32::MAX as usize) as i32, wcs.as_mut_ptr()) };
        let polled = polled_entries(ret)?;
        unsafe { wcs.set_len(polled) };
        Ok(wcs.into_iter().map(|wc| WorkCompletion { wc }).collect())
    }

    /// Busy-poll until a single completion arrives or `timeout` elapses.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<WorkCompletion, PollCompletionQueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(wc) = self.poll(1)?.pop() {
                return Ok(wc);
            }
            if Instant::now() >= deadline {
                return Err(PollCompletionQueueError::Timeout(timeout));
            }
            std::hint::spin_loop();
        }
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn cq(&self) -> NonNull<ibv_cq> {
        self.cq
    }
}

impl private::Sealed for CompletionQueue<'_> {}

impl Resource for CompletionQueue<'_> {
    const KIND: ResourceKind = ResourceKind::CompletionQueue;
}

impl AsRawResource for CompletionQueue<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::CompletionQueue(self.cq)
    }
}

fn polled_entries(ret: i32) -> Result<usize, PollCompletionQueueError> {
    usize::try_from(ret).map_err(|_| PollCompletionQueueError::Provider(ret))
}

/// A completion copied out of the CQ.
#[derive(Clone, Copy)]
pub struct WorkCompletion {
    wc: ibv_wc,
}

impl WorkCompletion {
    pub fn wr_id(&self) -> u64 {
        self.wc.wr_id
    }

    pub fn status(&self) -> WorkCompletionStatus {
        self.wc.status.into()
    }

    pub fn is_success(&self) -> bool {
        self.wc.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// `None` when the opcode is meaningless, which is the case for error completions.
    pub fn opcode(&self) -> Option<WorkCompletionOperationType> {
        WorkCompletionOperationType::from_raw(self.wc.opcode)
    }

    pub fn vendor_err(&self) -> u32 {
        self.wc.vendor_err
    }

    pub fn byte_len(&self) -> u32 {
        self.wc.byte_len
    }

    pub fn qp_num(&self) -> u32 {
        self.wc.qp_num
    }

    pub fn src_qp(&self) -> u32 {
        self.wc.src_qp
    }

    pub fn wc_flags(&self) -> WorkCompletionFlags {
        WorkCompletionFlags::from(self.wc.wc_flags as u32)
    }

    /// Immediate data in host byte order, only present on completions flagged
    /// [`WorkCompletionFlags::WithImmediate`].
    pub fn imm_data(&self) -> Option<u32> {
        self.wc_flags()
            .contains(WorkCompletionFlags::WithImmediate)
            .then(|| u32::from_be(unsafe { self.wc.imm_data_invalidated_rkey_union.imm_data }))
    }
}

impl fmt::Debug for WorkCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("opcode", &self.opcode())
            .field("byte_len", &self.byte_len())
            .field("qp_num", &self.qp_num())
            .field("vendor_err", &self.vendor_err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::mem::MaybeUninit;

    #[test]
    fn test_poll_failure_keeps_provider_status() {
        assert_eq!(polled_entries(0).unwrap(), 0);
        assert_eq!(polled_entries(16).unwrap(), 16);
        for ret in [-1, -libc::EINVAL, -22_000] {
            let err = polled_entries(ret).unwrap_err();
            assert!(matches!(err, PollCompletionQueueError::Provider(status) if status == ret));
            assert!(err.to_string().contains(&ret.to_string()));
        }
    }

    fn completion(status: u32, opcode: u32) -> WorkCompletion {
        let mut wc: ibv_wc = unsafe { MaybeUninit::zeroed().assume_init() };
        wc.wr_id = 7;
        wc.status = status;
        wc.opcode = opcode;
        wc.byte_len = 64;
        WorkCompletion { wc }
    }

    proptest! {
        #[test]
        fn test_work_completion_status_conversion(status in 0u32..=64u32) {
            match WorkCompletionStatus::from(status) {
                WorkCompletionStatus::Other(raw) => prop_assert_eq!(raw, status),
                WorkCompletionStatus::Success => prop_assert_eq!(status, ibv_wc_status::IBV_WC_SUCCESS),
                _ => prop_assert_ne!(status, ibv_wc_status::IBV_WC_SUCCESS),
            }
        }

        #[test]
        fn test_work_completion_opcode_conversion(opcode in 0u32..=256u32) {
            if let Some(op) = WorkCompletionOperationType::from_raw(opcode) {
                prop_assert_eq!(op as u32, opcode);
            }
        }
    }

    #[test]
    fn test_successful_completion() {
        let wc = completion(ibv_wc_status::IBV_WC_SUCCESS, ibv_wc_opcode::IBV_WC_RECV);
        assert!(wc.is_success());
        assert_eq!(wc.wr_id(), 7);
        assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::Receive));
        assert_eq!(wc.byte_len(), 64);
        assert!(wc.wc_flags().is_none());
    }

    #[test]
    fn test_immediate_data_in_host_order() {
        let mut wc = completion(ibv_wc_status::IBV_WC_SUCCESS, ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM);
        wc.wc.imm_data_invalidated_rkey_union.imm_data = 0x1234_5678u32.to_be();
        assert_eq!(wc.imm_data(), None);

        wc.wc.wc_flags = ibv_wc_flags::IBV_WC_WITH_IMM.0 as _;
        assert_eq!(wc.imm_data(), Some(0x1234_5678));
        assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::ReceiveWithImmediate));
    }

    #[test]
    fn test_flushed_completion() {
        let wc = completion(ibv_wc_status::IBV_WC_WR_FLUSH_ERR, 0xff);
        assert!(!wc.is_success());
        assert_eq!(wc.status(), WorkCompletionStatus::WorkRequestFlushedError);
        assert_eq!(wc.opcode(), None);
    }
}
