//! Drives queue pairs through the verbs state machine and builds the standard connection
//! topologies on top of it.
//!
//! Every transition is a single `ibv_modify_qp` call. A rejected transition is returned as is and
//! never retried, and the composite recipes stop at the first failure without rolling back, so
//! callers can inspect the state the QP was left in.
use crate::harness::config::{ConfigError, ConnectionConfig};
use crate::harness::port::PortGid;
use crate::ibverbs::address::{AddressHandleAttribute, Gid};
use crate::ibverbs::queue_pair::{
    ModifyQueuePairError, QueuePair, QueuePairAttribute, QueuePairAttributeMask, QueuePairState, QueuePairType,
};
use crate::ibverbs::AccessFlags;

/// Access rights granted to the remote side of every RC QP the backend initializes.
pub const RC_ACCESS_FLAGS: AccessFlags = AccessFlags::LocalWrite
    .or(AccessFlags::RemoteRead)
    .or(AccessFlags::RemoteWrite)
    .or(AccessFlags::RemoteAtomic);

#[derive(Debug, Clone)]
pub struct ConnectionBackend {
    config: ConnectionConfig,
}

impl ConnectionBackend {
    pub fn new(config: &ConnectionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ConnectionBackend { config: *config })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// RESET to INIT attributes. RC QPs get [`RC_ACCESS_FLAGS`], UD QPs get `qkey`.
    pub fn init_attribute(&self, qp_type: QueuePairType, port: u8, qkey: u32) -> QueuePairAttribute {
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Init)
            .setup_pkey_index(self.config.pkey_index)
            .setup_port(port);
        match qp_type {
            QueuePairType::ReliableConnection => attr.setup_access_flags(RC_ACCESS_FLAGS),
            QueuePairType::UnreliableDatagram => attr.setup_qkey(qkey),
        };
        attr
    }

    /// INIT to RTR attributes. Only RC QPs are bound to a peer; for UD the state alone moves.
    pub fn rtr_attribute(
        &self, qp_type: QueuePairType, local: &PortGid, remote_gid: Gid, remote_qpn: u32,
    ) -> QueuePairAttribute {
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::ReadyToReceive);
        if qp_type == QueuePairType::UnreliableDatagram {
            return attr;
        }

        let mut ah_attr = AddressHandleAttribute::new();
        ah_attr.setup_port(local.port).setup_grh(
            &remote_gid,
            0,
            local.gid_index,
            self.config.hop_limit,
            self.config.traffic_class,
        );
        attr.setup_path_mtu(self.config.path_mtu)
            .setup_dest_qp_num(remote_qpn)
            .setup_rq_psn(self.config.psn)
            .setup_max_dest_read_atomic(self.config.max_dest_rd_atomic)
            .setup_min_rnr_timer(self.config.min_rnr_timer)
            .setup_address_vector(&ah_attr);
        attr
    }

    /// RTR to RTS attributes.
    pub fn rts_attribute(&self, qp_type: QueuePairType) -> QueuePairAttribute {
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::ReadyToSend)
            .setup_sq_psn(self.config.psn);
        if qp_type == QueuePairType::ReliableConnection {
            attr.setup_timeout(self.config.timeout)
                .setup_retry_cnt(self.config.retry_cnt)
                .setup_rnr_retry(self.config.rnr_retry)
                .setup_max_read_atomic(self.config.max_rd_atomic);
        }
        attr
    }

    fn transition(&self, qp: &mut QueuePair, attr: &QueuePairAttribute) -> Result<(), ModifyQueuePairError> {
        let (qpn, cur_state) = (qp.qp_number(), qp.state());
        match qp.modify(attr) {
            Ok(()) => {
                log::debug!("qp {qpn}: {cur_state:?} -> {:?}", attr.state());
                Ok(())
            },
            Err(err) => {
                log::debug!("qp {qpn}: {cur_state:?} -> {:?} rejected: {err}", attr.state());
                Err(err)
            },
        }
    }

    /// RESET to INIT on `port`. UD QPs use the configured default qkey.
    pub fn set_qp_init(&self, qp: &mut QueuePair, port: u8) -> Result<(), ModifyQueuePairError> {
        let attr = self.init_attribute(qp.qp_type(), port, self.config.default_qkey);
        self.transition(qp, &attr)
    }

    /// INIT to RTR, addressing the peer at `remote_gid` / `remote_qpn` from `local`.
    pub fn set_qp_rtr(
        &self, qp: &mut QueuePair, local: &PortGid, remote_gid: Gid, remote_qpn: u32,
    ) -> Result<(), ModifyQueuePairError> {
        let attr = self.rtr_attribute(qp.qp_type(), local, remote_gid, remote_qpn);
        self.transition(qp, &attr)
    }

    /// RTR to RTS with the configured retry, timeout and PSN values.
    pub fn set_qp_rts(&self, qp: &mut QueuePair) -> Result<(), ModifyQueuePairError> {
        let attr = self.rts_attribute(qp.qp_type());
        self.transition(qp, &attr)
    }

    /// RTR to RTS with caller-chosen values. Only the fields in `mask` are applied, plus the target
    /// state; nothing is checked before the native layer sees the request.
    pub fn set_qp_rts_with(
        &self, qp: &mut QueuePair, mut attr: QueuePairAttribute, mask: QueuePairAttributeMask,
    ) -> Result<(), ModifyQueuePairError> {
        attr.setup_attr_mask(mask).setup_state(QueuePairState::ReadyToSend);
        self.transition(qp, &attr)
    }

    /// Force the QP into ERROR from whatever state it is in.
    pub fn set_qp_error(&self, qp: &mut QueuePair) -> Result<(), ModifyQueuePairError> {
        let mut attr = QueuePairAttribute::new();
        attr.setup_state(QueuePairState::Error);
        self.transition(qp, &attr)
    }

    /// INIT, RTR and RTS in sequence towards `remote_gid` / `remote_qpn`, stopping at the first
    /// rejected step.
    pub fn set_up_rc_qp(
        &self, qp: &mut QueuePair, local: &PortGid, remote_gid: Gid, remote_qpn: u32,
    ) -> Result<(), ModifyQueuePairError> {
        self.set_qp_init(qp, local.port)?;
        self.set_qp_rtr(qp, local, remote_gid, remote_qpn)?;
        self.set_qp_rts(qp)
    }

    /// Connect `qp` to itself.
    pub fn set_up_self_connected_rc_qp(&self, qp: &mut QueuePair, local: &PortGid) -> Result<(), ModifyQueuePairError> {
        let qpn = qp.qp_number();
        self.set_up_rc_qp(qp, local, local.gid, qpn)
    }

    /// Connect two QPs on the same local port to each other. `qp1` is fully brought up before
    /// `qp2` is touched.
    pub fn set_up_loopback_rc_qps(
        &self, qp1: &mut QueuePair, qp2: &mut QueuePair, local: &PortGid,
    ) -> Result<(), ModifyQueuePairError> {
        let (qpn1, qpn2) = (qp1.qp_number(), qp2.qp_number());
        self.set_up_rc_qp(qp1, local, local.gid, qpn2)?;
        self.set_up_rc_qp(qp2, local, local.gid, qpn1)
    }

    /// Bring a UD QP to RTS with `qkey`. Peers are addressed per send through address handles.
    pub fn set_up_ud_qp(&self, qp: &mut QueuePair, local: &PortGid, qkey: u32) -> Result<(), ModifyQueuePairError> {
        let init = self.init_attribute(QueuePairType::UnreliableDatagram, local.port, qkey);
        self.transition(qp, &init)?;
        let rtr = self.rtr_attribute(QueuePairType::UnreliableDatagram, local, local.gid, 0);
        self.transition(qp, &rtr)?;
        self.set_qp_rts(qp)
    }
}
