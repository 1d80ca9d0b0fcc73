//! A [`QueuePair`] is a pair of send queue and recv queue, considered as the basic transport
//! interface for RDMA communication.
use bitmask_enum::bitmask;
use rdma_mummy_sys::{
    ibv_create_qp, ibv_modify_qp, ibv_post_recv, ibv_post_send, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask,
    ibv_qp_init_attr, ibv_qp_state, ibv_qp_type, ibv_query_qp, ibv_recv_wr, ibv_send_flags, ibv_send_wr, ibv_sge,
    ibv_wr_opcode,
};
use std::sync::LazyLock;
use std::{
    fmt, io,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::{null_mut, NonNull},
};

use super::{
    address::{AddressHandle, AddressHandleAttribute, Gid},
    completion::CompletionQueue,
    device_context::Mtu,
    private,
    protection_domain::ProtectionDomain,
    shared_receive_queue::SharedReceiveQueue,
    AccessFlags, AsRawResource, RawResource, Resource, ResourceKind,
};

/// Error returned by [`VerbsAllocator::create_qp_with`] for creating a new RDMA QP.
///
/// [`VerbsAllocator::create_qp_with`]: crate::harness::allocator::VerbsAllocator::create_qp_with
#[derive(Debug, thiserror::Error)]
#[error("failed to create {qp_type:?} queue pair")]
#[non_exhaustive]
pub struct CreateQueuePairError {
    pub qp_type: QueuePairType,
    #[source]
    pub source: io::Error,
}

/// Error returned by [`QueuePair::query`] for querying a RDMA QP's attributes.
#[derive(Debug, thiserror::Error)]
#[error("failed to query queue pair")]
#[non_exhaustive]
pub struct QueryQueuePairError(#[from] pub QueryQueuePairErrorKind);

/// The enum type for [`QueryQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum QueryQueuePairErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`QueuePair::modify`] for modifying a RDMA QP's attributes.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub struct ModifyQueuePairError(#[from] pub ModifyQueuePairErrorKind);

/// The enum type for [`ModifyQueuePairError`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModifyQueuePairErrorKind {
    #[error("modify queue pair failed")]
    Ibverbs(#[from] io::Error),
    #[error("invalid {qp_type:?} transition from {cur_state:?} to {next_state:?}")]
    InvalidTransition {
        qp_type: QueuePairType,
        cur_state: QueuePairState,
        next_state: QueuePairState,
        source: io::Error,
    },
    #[error("invalid {qp_type:?} transition from {cur_state:?} to {next_state:?}, possible invalid masks {invalid:?}, possible needed masks {needed:?}")]
    InvalidAttributeMask {
        qp_type: QueuePairType,
        cur_state: QueuePairState,
        next_state: QueuePairState,
        invalid: QueuePairAttributeMask,
        needed: QueuePairAttributeMask,
        source: io::Error,
    },
    #[error("resolve route timed out, source gid index: {sgid_index}, destination gid: {gid}")]
    ResolveRouteTimedout {
        sgid_index: u8,
        gid: Gid,
        source: io::Error,
    },
    #[error("network unreachable, source gid index: {sgid_index}, destination gid: {gid}")]
    NetworkUnreachable {
        sgid_index: u8,
        gid: Gid,
        source: io::Error,
    },
}

impl ModifyQueuePairError {
    /// The non-zero status the native layer answered with.
    pub fn status(&self) -> i32 {
        let source = match &self.0 {
            ModifyQueuePairErrorKind::Ibverbs(source)
            | ModifyQueuePairErrorKind::InvalidTransition { source, .. }
            | ModifyQueuePairErrorKind::InvalidAttributeMask { source, .. }
            | ModifyQueuePairErrorKind::ResolveRouteTimedout { source, .. }
            | ModifyQueuePairErrorKind::NetworkUnreachable { source, .. } => source,
        };
        source.raw_os_error().unwrap_or(-1)
    }
}

/// Error returned by [`PostSendGuard::post`] for posting Work Requests to QP's send queue.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostSendError {
    #[error("post send failed")]
    Ibverbs(#[from] io::Error),
    #[error("invalid value provided in work request")]
    InvalidWorkRequest(#[source] io::Error),
    #[error("invalid value provided in queue pair")]
    InvalidQueuePair(#[source] io::Error),
    #[error("send queue is full or not enough resources to complete this operation")]
    NotEnoughResources(#[source] io::Error),
}

/// Error returned by [`PostRecvGuard::post`] and [`SharedReceiveQueue::post_recv`] for posting
/// receive Work Requests.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostRecvError {
    #[error("post receive failed")]
    Ibverbs(#[from] io::Error),
    #[error("invalid value provided in work request")]
    InvalidWorkRequest(#[source] io::Error),
    #[error("invalid value provided in queue pair")]
    InvalidQueuePair(#[source] io::Error),
    #[error("receive queue is full or not enough resources to complete this operation")]
    NotEnoughResources(#[source] io::Error),
}

/// The transport service types the harness sets up.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueuePairType {
    /// A reliable connection between a single local QP and a single remote QP.
    ReliableConnection = ibv_qp_type::IBV_QPT_RC,
    /// Connectionless, each send names its destination through an [`AddressHandle`].
    UnreliableDatagram = ibv_qp_type::IBV_QPT_UD,
}

impl From<u32> for QueuePairType {
    fn from(qp_type: u32) -> Self {
        match qp_type {
            ibv_qp_type::IBV_QPT_RC => QueuePairType::ReliableConnection,
            ibv_qp_type::IBV_QPT_UD => QueuePairType::UnreliableDatagram,
            _ => panic!("Unsupported qp type: {qp_type}"),
        }
    }
}

/// QP's state, which controls the behavior of a QP. For detailed information, take
/// [qp state machine] for reference.
///
/// [qp state machine]: https://www.rdmamojo.com/2012/05/05/qp-state-machine/
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePairState {
    Reset = ibv_qp_state::IBV_QPS_RESET,
    Init = ibv_qp_state::IBV_QPS_INIT,
    ReadyToReceive = ibv_qp_state::IBV_QPS_RTR,
    ReadyToSend = ibv_qp_state::IBV_QPS_RTS,
    SendQueueDrain = ibv_qp_state::IBV_QPS_SQD,
    SendQueueError = ibv_qp_state::IBV_QPS_SQE,
    Error = ibv_qp_state::IBV_QPS_ERR,
    Unknown = ibv_qp_state::IBV_QPS_UNKNOWN,
}

impl From<u32> for QueuePairState {
    fn from(state: u32) -> Self {
        match state {
            ibv_qp_state::IBV_QPS_RESET => QueuePairState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QueuePairState::Init,
            ibv_qp_state::IBV_QPS_RTR => QueuePairState::ReadyToReceive,
            ibv_qp_state::IBV_QPS_RTS => QueuePairState::ReadyToSend,
            ibv_qp_state::IBV_QPS_SQD => QueuePairState::SendQueueDrain,
            ibv_qp_state::IBV_QPS_SQE => QueuePairState::SendQueueError,
            ibv_qp_state::IBV_QPS_ERR => QueuePairState::Error,
            _ => QueuePairState::Unknown,
        }
    }
}

impl QueuePairState {
    /// Whether the verbs state machine allows moving a `qp_type` QP from `self` to `next`.
    pub fn can_transition_to(self, next: QueuePairState, qp_type: QueuePairType) -> bool {
        state_table_entry(qp_type, self, next).is_some_and(|entry| entry.valid)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkRequestOperationType {
    Send = ibv_wr_opcode::IBV_WR_SEND,
    SendWithImmediate = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
    Write = ibv_wr_opcode::IBV_WR_RDMA_WRITE,
    WriteWithImmediate = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
    Read = ibv_wr_opcode::IBV_WR_RDMA_READ,
}

/// Flags of the Work Request properties.
#[bitmask(u32)]
#[bitmask_config(vec_debug)]
pub enum WorkRequestFlags {
    Fence = ibv_send_flags::IBV_SEND_FENCE.0,
    Signaled = ibv_send_flags::IBV_SEND_SIGNALED.0,
    Solicited = ibv_send_flags::IBV_SEND_SOLICITED.0,
    Inline = ibv_send_flags::IBV_SEND_INLINE.0,
    IpChecksum = ibv_send_flags::IBV_SEND_IP_CSUM.0,
}

// bindgen emits `ibv_qp_attr_mask` as a newtype, so the `.0` is needed here.
//
// https://github.com/rust-lang/rust-bindgen/issues/1966
//
/// Mask of the [`QueuePairAttribute`], used for specifying the fields to be modified or queried in
/// attributes of the [`QueuePair`].
#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum QueuePairAttributeMask {
    State = ibv_qp_attr_mask::IBV_QP_STATE.0 as _,
    CurrentState = ibv_qp_attr_mask::IBV_QP_CUR_STATE.0 as _,
    EnableSendQueueDrainedAsyncNotify = ibv_qp_attr_mask::IBV_QP_EN_SQD_ASYNC_NOTIFY.0 as _,
    AccessFlags = ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS.0 as _,
    PartitionKeyIndex = ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0 as _,
    Port = ibv_qp_attr_mask::IBV_QP_PORT.0 as _,
    QueueKey = ibv_qp_attr_mask::IBV_QP_QKEY.0 as _,
    AddressVector = ibv_qp_attr_mask::IBV_QP_AV.0 as _,
    PathMtu = ibv_qp_attr_mask::IBV_QP_PATH_MTU.0 as _,
    Timeout = ibv_qp_attr_mask::IBV_QP_TIMEOUT.0 as _,
    RetryCount = ibv_qp_attr_mask::IBV_QP_RETRY_CNT.0 as _,
    ResponderNotReadyRetryCount = ibv_qp_attr_mask::IBV_QP_RNR_RETRY.0 as _,
    ReceiveQueuePacketSequenceNumber = ibv_qp_attr_mask::IBV_QP_RQ_PSN.0 as _,
    MaxReadAtomic = ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC.0 as _,
    AlternatePath = ibv_qp_attr_mask::IBV_QP_ALT_PATH.0 as _,
    MinResponderNotReadyTimer = ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0 as _,
    SendQueuePacketSequenceNumber = ibv_qp_attr_mask::IBV_QP_SQ_PSN.0 as _,
    MaxDestinationReadAtomic = ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC.0 as _,
    PathMigrationState = ibv_qp_attr_mask::IBV_QP_PATH_MIG_STATE.0 as _,
    Capabilities = ibv_qp_attr_mask::IBV_QP_CAP.0 as _,
    DestinationQueuePairNumber = ibv_qp_attr_mask::IBV_QP_DEST_QPN.0 as _,
    RateLimit = ibv_qp_attr_mask::IBV_QP_RATE_LIMIT.0 as _,
}

// Required and optional masks of every legal transition, mirroring `qp_state_table` in the Linux
// kernel. Only consulted to explain an EINVAL, never to reject a request before the native layer
// sees it.
//
// Ref: https://elixir.bootlin.com/linux/v6.10.9/source/drivers/infiniband/core/verbs.c#L1385
#[derive(Debug, Copy, Clone)]
struct QueuePairStateTableEntry {
    valid: bool,
    required_mask: QueuePairAttributeMask,
    optional_mask: QueuePairAttributeMask,
}

const STATE_COUNT: usize = QueuePairState::Error as usize + 1;

type QueuePairStateTable = [[QueuePairStateTableEntry; STATE_COUNT]; STATE_COUNT];

static RC_QP_STATE_TABLE: LazyLock<QueuePairStateTable> =
    LazyLock::new(|| build_state_table(QueuePairType::ReliableConnection));

static UD_QP_STATE_TABLE: LazyLock<QueuePairStateTable> =
    LazyLock::new(|| build_state_table(QueuePairType::UnreliableDatagram));

fn build_state_table(qp_type: QueuePairType) -> QueuePairStateTable {
    use QueuePairAttributeMask as M;
    use QueuePairState::*;

    let entry = |required_mask, optional_mask| QueuePairStateTableEntry {
        valid: true,
        required_mask,
        optional_mask,
    };
    let rc = qp_type == QueuePairType::ReliableConnection;

    let mut table = [[QueuePairStateTableEntry {
        valid: false,
        required_mask: M::none(),
        optional_mask: M::none(),
    }; STATE_COUNT]; STATE_COUNT];

    // from any state to reset / error state only requires IBV_QP_STATE
    for row in table.iter_mut() {
        row[Reset as usize] = entry(M::State, M::none());
        row[Error as usize] = entry(M::State, M::none());
    }

    // the remaining RC-only masks are the connection attributes a datagram QP has no use for
    let (init_attrs, rts_optional) = if rc {
        (
            M::PartitionKeyIndex | M::Port | M::AccessFlags,
            M::CurrentState | M::AccessFlags | M::MinResponderNotReadyTimer | M::AlternatePath | M::PathMigrationState,
        )
    } else {
        (M::PartitionKeyIndex | M::Port | M::QueueKey, M::CurrentState | M::QueueKey)
    };

    table[Reset as usize][Init as usize] = entry(M::State | init_attrs, M::none());
    table[Init as usize][Init as usize] = entry(M::none(), init_attrs);

    table[Init as usize][ReadyToReceive as usize] = if rc {
        entry(
            M::State
                | M::AddressVector
                | M::PathMtu
                | M::DestinationQueuePairNumber
                | M::ReceiveQueuePacketSequenceNumber
                | M::MaxDestinationReadAtomic
                | M::MinResponderNotReadyTimer,
            M::PartitionKeyIndex | M::AccessFlags | M::AlternatePath,
        )
    } else {
        entry(M::State, M::PartitionKeyIndex | M::QueueKey)
    };

    table[ReadyToReceive as usize][ReadyToSend as usize] = if rc {
        entry(
            M::State
                | M::SendQueuePacketSequenceNumber
                | M::Timeout
                | M::RetryCount
                | M::ResponderNotReadyRetryCount
                | M::MaxReadAtomic,
            rts_optional,
        )
    } else {
        entry(M::State | M::SendQueuePacketSequenceNumber, rts_optional)
    };

    table[ReadyToSend as usize][ReadyToSend as usize] = entry(M::none(), rts_optional);
    table[ReadyToSend as usize][SendQueueDrain as usize] = entry(M::State, M::EnableSendQueueDrainedAsyncNotify);
    table[SendQueueDrain as usize][ReadyToSend as usize] = entry(M::State, rts_optional);

    table[SendQueueDrain as usize][SendQueueDrain as usize] = if rc {
        entry(
            M::none(),
            M::PartitionKeyIndex
                | M::Port
                | M::AccessFlags
                | M::AddressVector
                | M::MaxReadAtomic
                | M::MinResponderNotReadyTimer
                | M::AlternatePath
                | M::Timeout
                | M::RetryCount
                | M::ResponderNotReadyRetryCount
                | M::MaxDestinationReadAtomic
                | M::PathMigrationState,
        )
    } else {
        entry(M::none(), M::PartitionKeyIndex | M::QueueKey)
    };

    if !rc {
        table[SendQueueError as usize][ReadyToSend as usize] = entry(M::State, M::CurrentState | M::QueueKey);
    }

    table
}

fn state_table_entry(
    qp_type: QueuePairType, cur_state: QueuePairState, next_state: QueuePairState,
) -> Option<QueuePairStateTableEntry> {
    if cur_state == QueuePairState::Unknown || next_state == QueuePairState::Unknown {
        return None;
    }
    let table = match qp_type {
        QueuePairType::ReliableConnection => &*RC_QP_STATE_TABLE,
        QueuePairType::UnreliableDatagram => &*UD_QP_STATE_TABLE,
    };
    Some(table[cur_state as usize][next_state as usize])
}

#[inline]
fn get_needed_mask(cur_mask: QueuePairAttributeMask, required_mask: QueuePairAttributeMask) -> QueuePairAttributeMask {
    required_mask.and(required_mask.xor(cur_mask))
}

#[inline]
fn get_invalid_mask(
    cur_mask: QueuePairAttributeMask, required_mask: QueuePairAttributeMask, optional_mask: QueuePairAttributeMask,
) -> QueuePairAttributeMask {
    cur_mask.and(required_mask.or(optional_mask).not())
}

pub(crate) fn attr_mask_check(
    qp_type: QueuePairType, attr_mask: QueuePairAttributeMask, cur_state: QueuePairState,
    next_state: QueuePairState,
) -> Result<(), ModifyQueuePairError> {
    let entry = match state_table_entry(qp_type, cur_state, next_state) {
        Some(entry) if entry.valid => entry,
        _ => {
            return Err(ModifyQueuePairErrorKind::InvalidTransition {
                qp_type,
                cur_state,
                next_state,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            }
            .into())
        },
    };

    let invalid = get_invalid_mask(attr_mask, entry.required_mask, entry.optional_mask);
    let needed = get_needed_mask(attr_mask, entry.required_mask);
    if invalid.is_none() && needed.is_none() {
        Ok(())
    } else {
        Err(ModifyQueuePairErrorKind::InvalidAttributeMask {
            qp_type,
            cur_state,
            next_state,
            invalid,
            needed,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        }
        .into())
    }
}

/// The attribute set of one `ibv_modify_qp` / `ibv_query_qp` call, the mask grows with every
/// `setup_*` call.
pub struct QueuePairAttribute {
    attr: ibv_qp_attr,
    attr_mask: QueuePairAttributeMask,
}

impl Default for QueuePairAttribute {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueuePairAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePairAttribute")
            .field("state", &self.state())
            .field("attr_mask", &self.attr_mask)
            .finish_non_exhaustive()
    }
}

impl QueuePairAttribute {
    pub fn new() -> Self {
        QueuePairAttribute {
            attr: unsafe { MaybeUninit::zeroed().assume_init() },
            attr_mask: QueuePairAttributeMask::none(),
        }
    }

    /// Wrap a raw attribute set, for test cases that deliberately craft out-of-range values.
    pub fn from_raw(attr: &ibv_qp_attr, attr_mask: QueuePairAttributeMask) -> Self {
        QueuePairAttribute {
            attr: ibv_qp_attr { ..*attr },
            attr_mask,
        }
    }

    pub fn attr_mask(&self) -> QueuePairAttributeMask {
        self.attr_mask
    }

    /// Replace the mask wholesale, fields outside of it are ignored by the native layer.
    pub fn setup_attr_mask(&mut self, attr_mask: QueuePairAttributeMask) -> &mut Self {
        self.attr_mask = attr_mask;
        self
    }

    pub fn setup_state(&mut self, state: QueuePairState) -> &mut Self {
        self.attr.qp_state = state as _;
        self.attr_mask |= QueuePairAttributeMask::State;
        self
    }

    pub fn state(&self) -> QueuePairState {
        self.attr.qp_state.into()
    }

    pub fn setup_pkey_index(&mut self, pkey_index: u16) -> &mut Self {
        self.attr.pkey_index = pkey_index;
        self.attr_mask |= QueuePairAttributeMask::PartitionKeyIndex;
        self
    }

    pub fn pkey_index(&self) -> u16 {
        self.attr.pkey_index
    }

    /// Setup the physical port that the [`QueuePair`] is associated with, port numbers start at 1.
    pub fn setup_port(&mut self, port_num: u8) -> &mut Self {
        self.attr.port_num = port_num;
        self.attr_mask |= QueuePairAttributeMask::Port;
        self
    }

    pub fn port(&self) -> u8 {
        self.attr.port_num
    }

    /// Setup the Q_Key that incoming datagrams must carry, UD only.
    pub fn setup_qkey(&mut self, qkey: u32) -> &mut Self {
        self.attr.qkey = qkey;
        self.attr_mask |= QueuePairAttributeMask::QueueKey;
        self
    }

    pub fn qkey(&self) -> u32 {
        self.attr.qkey
    }

    /// Setup the remote operations that incoming packets may perform, RC only.
    pub fn setup_access_flags(&mut self, access_flags: AccessFlags) -> &mut Self {
        self.attr.qp_access_flags = access_flags.bits as _;
        self.attr_mask |= QueuePairAttributeMask::AccessFlags;
        self
    }

    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from(self.attr.qp_access_flags as i32)
    }

    pub fn setup_path_mtu(&mut self, path_mtu: Mtu) -> &mut Self {
        self.attr.path_mtu = path_mtu as _;
        self.attr_mask |= QueuePairAttributeMask::PathMtu;
        self
    }

    pub fn path_mtu(&self) -> Mtu {
        self.attr.path_mtu.into()
    }

    pub fn setup_dest_qp_num(&mut self, dest_qp_num: u32) -> &mut Self {
        self.attr.dest_qp_num = dest_qp_num;
        self.attr_mask |= QueuePairAttributeMask::DestinationQueuePairNumber;
        self
    }

    pub fn dest_qp_num(&self) -> u32 {
        self.attr.dest_qp_num
    }

    /// Packet sequence numbers are 24 bits wide; higher bits are ignored by the hardware.
    pub fn setup_rq_psn(&mut self, rq_psn: u32) -> &mut Self {
        self.attr.rq_psn = rq_psn;
        self.attr_mask |= QueuePairAttributeMask::ReceiveQueuePacketSequenceNumber;
        self
    }

    pub fn rq_psn(&self) -> u32 {
        self.attr.rq_psn
    }

    pub fn setup_sq_psn(&mut self, sq_psn: u32) -> &mut Self {
        self.attr.sq_psn = sq_psn;
        self.attr_mask |= QueuePairAttributeMask::SendQueuePacketSequenceNumber;
        self
    }

    pub fn sq_psn(&self) -> u32 {
        self.attr.sq_psn
    }

    /// Outstanding RDMA reads and atomics this QP may issue as initiator.
    pub fn setup_max_read_atomic(&mut self, max_read_atomic: u8) -> &mut Self {
        self.attr.max_rd_atomic = max_read_atomic;
        self.attr_mask |= QueuePairAttributeMask::MaxReadAtomic;
        self
    }

    pub fn max_read_atomic(&self) -> u8 {
        self.attr.max_rd_atomic
    }

    /// Outstanding RDMA reads and atomics this QP handles as responder.
    pub fn setup_max_dest_read_atomic(&mut self, max_dest_read_atomic: u8) -> &mut Self {
        self.attr.max_dest_rd_atomic = max_dest_read_atomic;
        self.attr_mask |= QueuePairAttributeMask::MaxDestinationReadAtomic;
        self
    }

    pub fn max_dest_read_atomic(&self) -> u8 {
        self.attr.max_dest_rd_atomic
    }

    pub fn setup_min_rnr_timer(&mut self, min_rnr_timer: u8) -> &mut Self {
        self.attr.min_rnr_timer = min_rnr_timer;
        self.attr_mask |= QueuePairAttributeMask::MinResponderNotReadyTimer;
        self
    }

    pub fn min_rnr_timer(&self) -> u8 {
        self.attr.min_rnr_timer
    }

    /// Local ACK timeout, `4.096 * 2^timeout` microseconds; `0` waits forever.
    pub fn setup_timeout(&mut self, timeout: u8) -> &mut Self {
        self.attr.timeout = timeout;
        self.attr_mask |= QueuePairAttributeMask::Timeout;
        self
    }

    pub fn timeout(&self) -> u8 {
        self.attr.timeout
    }

    pub fn setup_retry_cnt(&mut self, retry_cnt: u8) -> &mut Self {
        self.attr.retry_cnt = retry_cnt;
        self.attr_mask |= QueuePairAttributeMask::RetryCount;
        self
    }

    pub fn retry_cnt(&self) -> u8 {
        self.attr.retry_cnt
    }

    /// `7` retries forever.
    pub fn setup_rnr_retry(&mut self, rnr_retry: u8) -> &mut Self {
        self.attr.rnr_retry = rnr_retry;
        self.attr_mask |= QueuePairAttributeMask::ResponderNotReadyRetryCount;
        self
    }

    pub fn rnr_retry(&self) -> u8 {
        self.attr.rnr_retry
    }

    /// Setup the address vector of the primary path which describes the path information of the
    /// remote [`QueuePair`].
    pub fn setup_address_vector(&mut self, ah_attr: &AddressHandleAttribute) -> &mut Self {
        self.attr.ah_attr = ah_attr.attr;
        self.attr_mask |= QueuePairAttributeMask::AddressVector;
        self
    }

    pub fn address_vector(&self) -> AddressHandleAttribute {
        AddressHandleAttribute {
            attr: self.attr.ah_attr,
        }
    }
}

/// Describes the requested attributes of a newly created [`QueuePair`].
pub struct QueuePairInitAttribute {
    init_attr: ibv_qp_init_attr,
}

impl Default for QueuePairInitAttribute {
    fn default() -> Self {
        Self::new(QueuePairType::ReliableConnection)
    }
}

impl QueuePairInitAttribute {
    pub fn new(qp_type: QueuePairType) -> Self {
        let mut init_attr: ibv_qp_init_attr = unsafe { MaybeUninit::zeroed().assume_init() };
        init_attr.qp_type = qp_type as _;
        QueuePairInitAttribute { init_attr }
    }

    pub fn setup_qp_type(&mut self, qp_type: QueuePairType) -> &mut Self {
        self.init_attr.qp_type = qp_type as _;
        self
    }

    pub fn qp_type(&self) -> QueuePairType {
        self.init_attr.qp_type.into()
    }

    pub fn setup_send_cq(&mut self, send_cq: &CompletionQueue) -> &mut Self {
        self.init_attr.send_cq = send_cq.cq.as_ptr();
        self
    }

    pub fn setup_recv_cq(&mut self, recv_cq: &CompletionQueue) -> &mut Self {
        self.init_attr.recv_cq = recv_cq.cq.as_ptr();
        self
    }

    /// Attach a shared receive queue, the QP's own receive queue is then unused.
    pub fn setup_srq(&mut self, srq: Option<&SharedReceiveQueue>) -> &mut Self {
        self.init_attr.srq = srq.map_or(null_mut(), |srq| srq.srq.as_ptr());
        self
    }

    pub fn has_srq(&self) -> bool {
        !self.init_attr.srq.is_null()
    }

    pub fn setup_max_send_wr(&mut self, max_send_wr: u32) -> &mut Self {
        self.init_attr.cap.max_send_wr = max_send_wr;
        self
    }

    pub fn setup_max_recv_wr(&mut self, max_recv_wr: u32) -> &mut Self {
        self.init_attr.cap.max_recv_wr = max_recv_wr;
        self
    }

    pub fn setup_max_send_sge(&mut self, max_send_sge: u32) -> &mut Self {
        self.init_attr.cap.max_send_sge = max_send_sge;
        self
    }

    pub fn setup_max_recv_sge(&mut self, max_recv_sge: u32) -> &mut Self {
        self.init_attr.cap.max_recv_sge = max_recv_sge;
        self
    }

    pub fn setup_max_inline_data(&mut self, max_inline_data: u32) -> &mut Self {
        self.init_attr.cap.max_inline_data = max_inline_data;
        self
    }

    /// When set, every send work request generates a completion regardless of its flags.
    pub fn setup_sq_sig_all(&mut self, sq_sig_all: bool) -> &mut Self {
        self.init_attr.sq_sig_all = sq_sig_all as _;
        self
    }

    pub fn sq_sig_all(&self) -> bool {
        self.init_attr.sq_sig_all != 0
    }

    pub fn max_send_wr(&self) -> u32 {
        self.init_attr.cap.max_send_wr
    }

    pub fn max_recv_wr(&self) -> u32 {
        self.init_attr.cap.max_recv_wr
    }

    pub fn max_send_sge(&self) -> u32 {
        self.init_attr.cap.max_send_sge
    }

    pub fn max_recv_sge(&self) -> u32 {
        self.init_attr.cap.max_recv_sge
    }

    pub fn max_inline_data(&self) -> u32 {
        self.init_attr.cap.max_inline_data
    }
}

/// An RC or UD queue pair. It starts in [`QueuePairState::Reset`].
pub struct QueuePair<'a> {
    pub(crate) qp: NonNull<ibv_qp>,
    _alloc: PhantomData<&'a ()>,
}

unsafe impl Send for QueuePair<'_> {}
unsafe impl Sync for QueuePair<'_> {}

impl fmt::Debug for QueuePair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_number", &self.qp_number())
            .field("qp_type", &self.qp_type())
            .field("state", &self.state())
            .finish()
    }
}

impl QueuePair<'_> {
    pub(crate) fn create(
        pd: &ProtectionDomain, init_attr: &QueuePairInitAttribute,
    ) -> Result<Self, CreateQueuePairError> {
        let mut attr = ibv_qp_init_attr { ..init_attr.init_attr };
        let qp = unsafe { ibv_create_qp(pd.pd.as_ptr(), &mut attr) };
        match NonNull::new(qp) {
            Some(qp) => Ok(QueuePair {
                qp,
                _alloc: PhantomData,
            }),
            None => Err(CreateQueuePairError {
                qp_type: init_attr.qp_type(),
                source: io::Error::last_os_error(),
            }),
        }
    }

    /// # Safety
    ///
    /// The returned pointer is only valid until the handle is destroyed.
    pub unsafe fn qp(&self) -> NonNull<ibv_qp> {
        self.qp
    }

    pub fn qp_number(&self) -> u32 {
        unsafe { self.qp.as_ref().qp_num }
    }

    pub fn qp_type(&self) -> QueuePairType {
        unsafe { self.qp.as_ref().qp_type.into() }
    }

    /// The state as last recorded by the verbs library, use [`QueuePair::query`] to ask the device.
    pub fn state(&self) -> QueuePairState {
        unsafe { self.qp.as_ref().state.into() }
    }

    /// Modify the QP's attributes with a single `ibv_modify_qp` call.
    ///
    /// The request always reaches the native layer. When it answers `EINVAL`, the verbs state
    /// table is consulted to report which transition or which mask bits were at fault.
    pub fn modify(&mut self, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError> {
        // ibv_qp_attr does not impl Clone trait, so we use struct update syntax here
        let mut qp_attr = ibv_qp_attr { ..attr.attr };
        let ret = unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut qp_attr, attr.attr_mask.bits) };
        match ret {
            0 => Ok(()),
            libc::EINVAL => {
                let cur_state = self.state();
                let next_state = if attr.attr_mask.contains(QueuePairAttributeMask::State) {
                    attr.state()
                } else {
                    cur_state
                };
                attr_mask_check(self.qp_type(), attr.attr_mask, cur_state, next_state)?;
                Err(ModifyQueuePairErrorKind::Ibverbs(io::Error::from_raw_os_error(libc::EINVAL)).into())
            },
            libc::ETIMEDOUT => Err(ModifyQueuePairErrorKind::ResolveRouteTimedout {
                sgid_index: attr.attr.ah_attr.grh.sgid_index,
                gid: attr.attr.ah_attr.grh.dgid.into(),
                source: io::Error::from_raw_os_error(libc::ETIMEDOUT),
            }
            .into()),
            libc::ENETUNREACH => Err(ModifyQueuePairErrorKind::NetworkUnreachable {
                sgid_index: attr.attr.ah_attr.grh.sgid_index,
                gid: attr.attr.ah_attr.grh.dgid.into(),
                source: io::Error::from_raw_os_error(libc::ENETUNREACH),
            }
            .into()),
            ret if ret < 0 => Err(ModifyQueuePairErrorKind::Ibverbs(io::Error::last_os_error()).into()),
            err => Err(ModifyQueuePairErrorKind::Ibverbs(io::Error::from_raw_os_error(err)).into()),
        }
    }

    /// Query the QP's attributes. Specify the attributes to query by providing a mask.
    pub fn query(
        &self, mask: QueuePairAttributeMask,
    ) -> Result<(QueuePairAttribute, QueuePairInitAttribute), QueryQueuePairError> {
        let mut attr = QueuePairAttribute::new();
        let mut init_attr = QueuePairInitAttribute::default();
        attr.attr_mask = mask;

        let ret = unsafe { ibv_query_qp(self.qp.as_ptr(), &mut attr.attr, mask.bits(), &mut init_attr.init_attr) };
        match ret {
            0 => Ok((attr, init_attr)),
            err => Err(QueryQueuePairErrorKind::Ibverbs(io::Error::from_raw_os_error(err)).into()),
        }
    }

    /// Starts a post send operation, only one [`PostSendGuard`] can be held at a time.
    pub fn start_post_send(&mut self) -> PostSendGuard<'_> {
        PostSendGuard {
            qp: self.qp,
            wrs: Vec::new(),
            sges: Vec::new(),
            inline_buffers: Vec::new(),
            _phantom: PhantomData,
        }
    }

    /// Starts a post receive operation, only one [`PostRecvGuard`] can be held at a time.
    pub fn start_post_recv(&mut self) -> PostRecvGuard<'_> {
        PostRecvGuard {
            qp: self.qp,
            wrs: Vec::new(),
            sges: Vec::new(),
            _phantom: PhantomData,
        }
    }
}

impl private::Sealed for QueuePair<'_> {}

impl Resource for QueuePair<'_> {
    const KIND: ResourceKind = ResourceKind::QueuePair;
}

impl AsRawResource for QueuePair<'_> {
    fn as_raw_resource(&self) -> RawResource {
        RawResource::QueuePair(self.qp)
    }
}

/// Attach scatter/gather entries to the work request being built.
pub trait SetScatterGatherEntry {
    /// # Safety
    ///
    /// `addr..addr + length` must lie inside a memory region registered with `lkey` and stay valid
    /// until the work request completes.
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32);

    /// # Safety
    ///
    /// Same as [`SetScatterGatherEntry::setup_sge`], for every entry.
    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]);
}

// every work request owns a contiguous run of `sges`, linked up right before posting
struct PendingWorkRequest<W> {
    wr: W,
    sge_start: usize,
    sge_count: usize,
}

/// Builds a chain of send work requests and posts it with a single `ibv_post_send`.
pub struct PostSendGuard<'qp> {
    qp: NonNull<ibv_qp>,
    wrs: Vec<PendingWorkRequest<ibv_send_wr>>,
    sges: Vec<ibv_sge>,
    inline_buffers: Vec<Vec<u8>>,
    _phantom: PhantomData<&'qp ()>,
}

impl<'qp> PostSendGuard<'qp> {
    pub fn construct_wr(&mut self, wr_id: u64, wr_flags: WorkRequestFlags) -> WorkRequestHandle<'_, 'qp> {
        self.wrs.push(PendingWorkRequest {
            wr: ibv_send_wr {
                wr_id,
                next: null_mut(),
                sg_list: null_mut(),
                num_sge: 0,
                opcode: 0,
                send_flags: wr_flags.bits,
                ..unsafe { MaybeUninit::zeroed().assume_init() }
            },
            sge_start: self.sges.len(),
            sge_count: 0,
        });

        WorkRequestHandle { guard: self }
    }

    fn last_wr(&mut self) -> &mut ibv_send_wr {
        // a handle only exists after `construct_wr` pushed its request
        &mut self.wrs.last_mut().expect("work request handle without a work request").wr
    }

    fn push_sges(&mut self, sges: &[ibv_sge]) {
        self.sges.extend_from_slice(sges);
        if let Some(pending) = self.wrs.last_mut() {
            pending.sge_count += sges.len();
        }
    }

    /// Post all work requests built so far, in construction order.
    pub fn post(mut self) -> Result<(), PostSendError> {
        if self.wrs.is_empty() {
            return Ok(());
        }

        let sges = self.sges.as_mut_ptr();
        for pending in self.wrs.iter_mut() {
            pending.wr.num_sge = pending.sge_count as _;
            pending.wr.sg_list = if pending.sge_count > 0 {
                unsafe { sges.add(pending.sge_start) }
            } else {
                null_mut()
            };
        }
        for i in 1..self.wrs.len() {
            let next: *mut ibv_send_wr = &mut self.wrs[i].wr;
            self.wrs[i - 1].wr.next = next;
        }

        let mut bad_wr: *mut ibv_send_wr = null_mut();
        let ret = unsafe { ibv_post_send(self.qp.as_ptr(), &mut self.wrs[0].wr, &mut bad_wr) };
        match ret {
            0 => Ok(()),
            libc::EINVAL => Err(PostSendError::InvalidWorkRequest(io::Error::from_raw_os_error(libc::EINVAL))),
            libc::ENOMEM => Err(PostSendError::NotEnoughResources(io::Error::from_raw_os_error(libc::ENOMEM))),
            libc::EFAULT => Err(PostSendError::InvalidQueuePair(io::Error::from_raw_os_error(libc::EFAULT))),
            err => Err(PostSendError::Ibverbs(io::Error::from_raw_os_error(err))),
        }
    }
}

/// A handle that user would use to fill the concrete information of the RDMA Work Request.
pub struct WorkRequestHandle<'g, 'qp> {
    guard: &'g mut PostSendGuard<'qp>,
}

impl<'g, 'qp> WorkRequestHandle<'g, 'qp> {
    pub fn setup_send(self) -> LocalBufferHandle<'g, 'qp> {
        self.guard.last_wr().opcode = WorkRequestOperationType::Send as _;
        LocalBufferHandle { guard: self.guard }
    }

    pub fn setup_send_imm(self, imm_data: u32) -> LocalBufferHandle<'g, 'qp> {
        let wr = self.guard.last_wr();
        wr.opcode = WorkRequestOperationType::SendWithImmediate as _;
        wr.imm_data_invalidated_rkey_union.imm_data = imm_data.to_be();
        LocalBufferHandle { guard: self.guard }
    }

    /// Address a datagram, required before the opcode for every UD send.
    pub fn setup_ud_addr(self, ah: &AddressHandle, remote_qpn: u32, remote_qkey: u32) -> Self {
        let wr = self.guard.last_wr();
        unsafe {
            wr.wr.ud.ah = ah.ah().as_ptr();
            wr.wr.ud.remote_qpn = remote_qpn;
            wr.wr.ud.remote_qkey = remote_qkey;
        }
        self
    }

    pub fn setup_write(self, rkey: u32, remote_addr: u64) -> LocalBufferHandle<'g, 'qp> {
        let wr = self.guard.last_wr();
        wr.opcode = WorkRequestOperationType::Write as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        LocalBufferHandle { guard: self.guard }
    }

    pub fn setup_write_imm(self, rkey: u32, remote_addr: u64, imm_data: u32) -> LocalBufferHandle<'g, 'qp> {
        let wr = self.guard.last_wr();
        wr.opcode = WorkRequestOperationType::WriteWithImmediate as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        wr.imm_data_invalidated_rkey_union.imm_data = imm_data.to_be();
        LocalBufferHandle { guard: self.guard }
    }

    pub fn setup_read(self, rkey: u32, remote_addr: u64) -> LocalBufferHandle<'g, 'qp> {
        let wr = self.guard.last_wr();
        wr.opcode = WorkRequestOperationType::Read as _;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        LocalBufferHandle { guard: self.guard }
    }
}

/// The local side of a send work request: registered buffers or inline data.
pub struct LocalBufferHandle<'g, 'qp> {
    guard: &'g mut PostSendGuard<'qp>,
}

impl LocalBufferHandle<'_, '_> {
    /// Copy `buf` into the work request, the caller may reuse `buf` right away.
    pub fn setup_inline_data(self, buf: &[u8]) {
        self.guard.inline_buffers.push(buf.to_vec());
        let sge = self.guard.inline_buffers.last().map(|inline| ibv_sge {
            addr: inline.as_ptr() as u64,
            length: inline.len() as u32,
            lkey: 0,
        });
        self.guard.last_wr().send_flags |= WorkRequestFlags::Inline.bits;
        self.guard.push_sges(sge.as_slice());
    }
}

impl SetScatterGatherEntry for LocalBufferHandle<'_, '_> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        self.guard.push_sges(&[ibv_sge { addr, length, lkey }]);
    }

    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]) {
        self.guard.push_sges(sg_list);
    }
}

/// A [`PostRecvGuard`] that can be used to construct and post recv RDMA Work Requests.
pub struct PostRecvGuard<'qp> {
    qp: NonNull<ibv_qp>,
    wrs: Vec<PendingWorkRequest<ibv_recv_wr>>,
    sges: Vec<ibv_sge>,
    _phantom: PhantomData<&'qp ()>,
}

impl<'qp> PostRecvGuard<'qp> {
    pub fn construct_wr(&mut self, wr_id: u64) -> RecvWorkRequestHandle<'_, 'qp> {
        self.wrs.push(PendingWorkRequest {
            wr: ibv_recv_wr {
                wr_id,
                next: null_mut(),
                sg_list: null_mut(),
                num_sge: 0,
            },
            sge_start: self.sges.len(),
            sge_count: 0,
        });

        RecvWorkRequestHandle { guard: self }
    }

    pub fn post(mut self) -> Result<(), PostRecvError> {
        if self.wrs.is_empty() {
            return Ok(());
        }

        let sges = self.sges.as_mut_ptr();
        for pending in self.wrs.iter_mut() {
            pending.wr.num_sge = pending.sge_count as _;
            pending.wr.sg_list = if pending.sge_count > 0 {
                unsafe { sges.add(pending.sge_start) }
            } else {
                null_mut()
            };
        }
        for i in 1..self.wrs.len() {
            let next: *mut ibv_recv_wr = &mut self.wrs[i].wr;
            self.wrs[i - 1].wr.next = next;
        }

        let mut bad_wr: *mut ibv_recv_wr = null_mut();
        let ret = unsafe { ibv_post_recv(self.qp.as_ptr(), &mut self.wrs[0].wr, &mut bad_wr) };
        match ret {
            0 => Ok(()),
            libc::EINVAL => Err(PostRecvError::InvalidWorkRequest(io::Error::from_raw_os_error(libc::EINVAL))),
            libc::ENOMEM => Err(PostRecvError::NotEnoughResources(io::Error::from_raw_os_error(libc::ENOMEM))),
            libc::EFAULT => Err(PostRecvError::InvalidQueuePair(io::Error::from_raw_os_error(libc::EFAULT))),
            err => Err(PostRecvError::Ibverbs(io::Error::from_raw_os_error(err))),
        }
    }
}

/// A handle that user would use to fill the concrete information of the **recv** RDMA Work Request.
pub struct RecvWorkRequestHandle<'g, 'qp> {
    guard: &'g mut PostRecvGuard<'qp>,
}

impl SetScatterGatherEntry for RecvWorkRequestHandle<'_, '_> {
    unsafe fn setup_sge(self, lkey: u32, addr: u64, length: u32) {
        self.setup_sge_list(&[ibv_sge { addr, length, lkey }]);
    }

    unsafe fn setup_sge_list(self, sg_list: &[ibv_sge]) {
        self.guard.sges.extend_from_slice(sg_list);
        if let Some(pending) = self.guard.wrs.last_mut() {
            pending.sge_count += sg_list.len();
        }
    }
}
