use crate::{
    access::{flags_into_ibv_access, AccessFlag},
    address::{Address, SetupInformation},
    completion_queue::CompletionQueue,
    error_utilities::{check_int, check_ptr},
    ffi::{ibv_mtu, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_init_attr, ibv_qp_state,
        ibv_qp_type},
    protection_domain::ProtectionDomain,
    shared_receive_queue::SharedReceiveQueue,
};
use clippy_utilities::Cast;
use derive_builder::Builder;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    io, mem, ptr,
    ptr::NonNull,
    sync::Arc,
};

/// Maximum value of `send_wr`
pub(crate) static MAX_SEND_WR: u32 = 10;
/// Maximum value of `recv_wr`
pub(crate) static MAX_RECV_WR: u32 = 10;
/// Maximum value of `send_sge`
pub(crate) static MAX_SEND_SGE: u32 = 10;
/// Maximum value of `recv_sge`
pub(crate) static MAX_RECV_SGE: u32 = 10;
/// Default `pkey_index`
pub(crate) static DEFAULT_PKEY_INDEX: u16 = 0;

/// Default `flow_label`
pub(crate) static DEFAULT_FLOW_LABEL: u32 = 0;
/// Default `hop_limit`
pub(crate) static DEFAULT_HOP_LIMIT: u8 = 0xff;
/// Default `traffic_class`
pub(crate) static DEFAULT_TRAFFIC_CLASS: u8 = 0;

/// Default `service_level`
pub(crate) static DEFAULT_SERVICE_LEVEL: u8 = 0;
/// Default `src_path_bits`
pub(crate) static DEFAULT_SRC_PATH_BITS: u8 = 0;
/// Default `static_rate`
pub(crate) static DEFAULT_STATIC_RATE: u8 = 0;
/// Default `is_global`
pub(crate) static DEFAULT_IS_GLOBAL: u8 = 1;

/// Default `rq_psn`
pub(crate) static DEFAULT_RQ_PSN: u32 = 0;
/// Default `max_dest_rd_atomic`
pub(crate) static DEFAULT_MAX_DEST_RD_ATOMIC: u8 = 1;
/// Default `min_rnr_timer`
pub(crate) static DEFAULT_MIN_RNR_TIMER: u8 = 0x12;

/// Default `timeout`
pub(crate) static DEFAULT_TIMEOUT: u8 = 0x12;
/// Default `retry_cnt`
pub(crate) static DEFAULT_RETRY_CNT: u8 = 6;
/// Default `rnr_retry`
pub(crate) static DEFAULT_RNR_RETRY: u8 = 6;
/// Default `sq_psn`
pub(crate) static DEFAULT_SQ_PSN: u32 = 0;
/// Default `max_rd_atomic`
pub(crate) static DEFAULT_MAX_RD_ATOMIC: u8 = 1;

/// The path MTU (Maximum Transfer Unit) i.e. the maximum payload size of a packet that
/// can be transferred in the path. For UC and RC QPs, when needed, the RDMA device will
/// automatically fragment the messages to packet of this size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MTU {
    /// IBV_MTU_256 - 256 bytes
    MTU256,
    /// IBV_MTU_512 - 512 bytes
    MTU512,
    /// IBV_MTU_1024 - 1024 bytes
    MTU1024,
    /// IBV_MTU_2048 - 2048 bytes
    MTU2048,
    /// IBV_MTU_4096 - 4096 bytes
    MTU4096,
}

impl From<MTU> for u32 {
    #[inline]
    fn from(mtu: MTU) -> Self {
        match mtu {
            MTU::MTU256 => ibv_mtu::IBV_MTU_256,
            MTU::MTU512 => ibv_mtu::IBV_MTU_512,
            MTU::MTU1024 => ibv_mtu::IBV_MTU_1024,
            MTU::MTU2048 => ibv_mtu::IBV_MTU_2048,
            MTU::MTU4096 => ibv_mtu::IBV_MTU_4096,
        }
    }
}

impl TryFrom<u32> for MTU {
    type Error = io::Error;

    #[inline]
    fn try_from(mtu: u32) -> io::Result<Self> {
        match mtu {
            ibv_mtu::IBV_MTU_256 => Ok(Self::MTU256),
            ibv_mtu::IBV_MTU_512 => Ok(Self::MTU512),
            ibv_mtu::IBV_MTU_1024 => Ok(Self::MTU1024),
            ibv_mtu::IBV_MTU_2048 => Ok(Self::MTU2048),
            ibv_mtu::IBV_MTU_4096 => Ok(Self::MTU4096),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported MTU code {mtu}"),
            )),
        }
    }
}

/// Transport service type of a queue pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairType {
    /// Reliable connection, the only type this crate drives through the
    /// connection handshake
    ReliableConnected,
    /// Unreliable connection
    UnreliableConnected,
    /// Unreliable datagram
    UnreliableDatagram,
}

impl From<QueuePairType> for ibv_qp_type::Type {
    #[inline]
    fn from(qp_type: QueuePairType) -> Self {
        match qp_type {
            QueuePairType::ReliableConnected => ibv_qp_type::IBV_QPT_RC,
            QueuePairType::UnreliableConnected => ibv_qp_type::IBV_QPT_UC,
            QueuePairType::UnreliableDatagram => ibv_qp_type::IBV_QPT_UD,
        }
    }
}

/// Queue pair creation descriptor: queue depths, scatter/gather capabilities
/// and the transport service type
#[derive(Debug, Clone, Copy, Builder, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct QueuePairInitAttr {
    /// Maximum number of outstanding send requests in the send queue
    #[builder(default = "MAX_SEND_WR")]
    max_send_wr: u32,
    /// Maximum number of outstanding receive requests in the receive queue
    #[builder(default = "MAX_RECV_WR")]
    max_recv_wr: u32,
    /// Maximum number of scatter/gather elements (SGE) in a WR on the send queue
    #[builder(default = "MAX_SEND_SGE")]
    max_send_sge: u32,
    /// Maximum number of scatter/gather elements (SGE) in a WR on the receive queue
    #[builder(default = "MAX_RECV_SGE")]
    max_recv_sge: u32,
    /// Maximum payload carried inline in a send request
    #[builder(default = "0")]
    max_inline_data: u32,
    /// Transport service type
    #[builder(default = "QueuePairType::ReliableConnected")]
    qp_type: QueuePairType,
    /// Whether every send request generates a completion
    #[builder(default = "false")]
    sq_sig_all: bool,
}

impl From<QueuePairInitAttrBuilderError> for io::Error {
    #[inline]
    fn from(e: QueuePairInitAttrBuilderError) -> Self {
        Self::new(io::ErrorKind::Other, e.to_string())
    }
}

/// The state of qp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairState {
    /// IBV_QPS_RESET - Reset state, where a queue pair starts after creation
    Reset,
    /// IBV_QPS_INIT - Initialized state
    Init,
    /// IBV_QPS_RTR - Ready To Receive state
    ReadyToRecv,
    /// IBV_QPS_RTS - Ready To Send state
    ReadyToSend,
    /// IBV_QPS_ERR - Error state
    Err,
}

/// Queue pair wrapper.
///
/// One endpoint of a reliable connection. Created in the reset state; the
/// `modify_to_*` transitions drive it through the mandatory
/// init → ready-to-receive → ready-to-send sequence, consuming the local
/// [`Address`] and the peer's [`SetupInformation`]. Each transition issues
/// one blocking native call; the attribute struct and the mask naming the
/// attributes are always built together in the same body, so they cannot
/// drift apart.
pub struct QueuePair {
    /// Protection domain it belongs to
    pd: Arc<ProtectionDomain>,
    /// Internal `ibv_qp` pointer
    inner_qp: NonNull<ibv_qp>,
    /// Last state successfully applied through this wrapper
    cur_state: QueuePairState,
}

impl QueuePair {
    /// Get `ibv_qp` pointer
    pub(crate) fn as_ptr(&self) -> *mut ibv_qp {
        self.inner_qp.as_ptr()
    }

    /// Create a queue pair in `pd`, attached to the given completion queues
    /// and, optionally, a shared receive queue.
    ///
    /// On failure of `ibv_create_qp`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid pd, `send_cq`, `recv_cq`, srq or invalid value provided in `max_send_wr`, `max_recv_wr`, `max_send_sge`, `max_recv_sge` or in `max_inline_data`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    ///
    /// `ENOSYS`    QP with this Transport Service Type isn't supported by this RDMA device
    pub fn create(
        pd: &Arc<ProtectionDomain>,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>,
        attr: &QueuePairInitAttr,
    ) -> io::Result<Self> {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.qp_context = ptr::null_mut();
        init_attr.send_cq = send_cq.as_ptr();
        init_attr.recv_cq = recv_cq.as_ptr();
        init_attr.srq = srq.map_or(ptr::null_mut(), SharedReceiveQueue::as_ptr);
        init_attr.cap.max_send_wr = attr.max_send_wr();
        init_attr.cap.max_recv_wr = attr.max_recv_wr();
        init_attr.cap.max_send_sge = attr.max_send_sge();
        init_attr.cap.max_recv_sge = attr.max_recv_sge();
        init_attr.cap.max_inline_data = attr.max_inline_data();
        init_attr.qp_type = attr.qp_type().into();
        init_attr.sq_sig_all = attr.sq_sig_all().into();
        let inner_qp = check_ptr("ibv_create_qp", || {
            // SAFETY: ffi
            unsafe { pd.ctx.verbs().create_qp(pd.as_ptr(), &mut init_attr) }
        })?;
        Ok(Self {
            pd: Arc::<ProtectionDomain>::clone(pd),
            inner_qp,
            cur_state: QueuePairState::Reset,
        })
    }

    /// The number the adapter assigned to this queue pair
    #[must_use]
    pub fn qp_num(&self) -> u32 {
        // SAFETY: qp_num sits in the stable leading part of `ibv_qp`
        unsafe { self.inner_qp.as_ref().qp_num }
    }

    /// Last state successfully applied through this wrapper
    #[must_use]
    pub fn state(&self) -> QueuePairState {
        self.cur_state
    }

    /// Modify the queue pair state to init.
    ///
    /// Binds the pair to the local port and enables local write, remote
    /// write, remote read and remote atomic access, so both two-sided and
    /// one-sided operations work in either direction once connected.
    ///
    /// On failure of `ibv_modify_qp`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid value provided in attr or in `attr_mask`, e.g. a port the device does not have
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    pub fn modify_to_init(&mut self, self_addr: &Address) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = DEFAULT_PKEY_INDEX;
        attr.port_num = self_addr.port_num();
        let access = AccessFlag::LocalWrite
            | AccessFlag::RemoteWrite
            | AccessFlag::RemoteRead
            | AccessFlag::RemoteAtomic;
        attr.qp_access_flags = flags_into_ibv_access(access);
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify("ibv_modify_qp(init)", &mut attr, flags)?;
        self.cur_state = QueuePairState::Init;
        Ok(())
    }

    /// Modify the queue pair state to ready to receive.
    ///
    /// This is where the two independently resolved addresses are bound into
    /// one path: the path MTU and the destination queue pair number are the
    /// peer's, the address vector is built from the peer's LID and GID plus
    /// the local port and GID index. Must not be attempted before the peer's
    /// [`SetupInformation`] has actually arrived over the out-of-band
    /// channel.
    ///
    /// On failure of `ibv_modify_qp`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid value provided in attr or in `attr_mask`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    pub fn modify_to_rtr(
        &mut self,
        self_addr: &Address,
        peer: &SetupInformation,
    ) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = peer.mtu().into();
        attr.dest_qp_num = peer.qp_num();
        attr.rq_psn = DEFAULT_RQ_PSN;
        attr.max_dest_rd_atomic = DEFAULT_MAX_DEST_RD_ATOMIC;
        attr.min_rnr_timer = DEFAULT_MIN_RNR_TIMER;
        attr.ah_attr.dlid = peer.lid();
        attr.ah_attr.sl = DEFAULT_SERVICE_LEVEL;
        attr.ah_attr.src_path_bits = DEFAULT_SRC_PATH_BITS;
        attr.ah_attr.static_rate = DEFAULT_STATIC_RATE;
        attr.ah_attr.is_global = DEFAULT_IS_GLOBAL;
        attr.ah_attr.port_num = self_addr.port_num();
        attr.ah_attr.grh.dgid = peer.gid().into();
        attr.ah_attr.grh.flow_label = DEFAULT_FLOW_LABEL;
        attr.ah_attr.grh.sgid_index = self_addr.gid_index();
        attr.ah_attr.grh.hop_limit = DEFAULT_HOP_LIMIT;
        attr.ah_attr.grh.traffic_class = DEFAULT_TRAFFIC_CLASS;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify("ibv_modify_qp(rtr)", &mut attr, flags)?;
        self.cur_state = QueuePairState::ReadyToRecv;
        Ok(())
    }

    /// Modify the queue pair state to ready to send.
    ///
    /// Sets the local starting packet sequence number, the ack timeout and
    /// the retry budgets, enabling the pair to originate sends. The adapter
    /// rejects this transition unless the receive side was set up first.
    ///
    /// On failure of `ibv_modify_qp`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid value provided in attr or in `attr_mask`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    pub fn modify_to_rts(&mut self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = DEFAULT_TIMEOUT;
        attr.retry_cnt = DEFAULT_RETRY_CNT;
        attr.rnr_retry = DEFAULT_RNR_RETRY;
        attr.sq_psn = DEFAULT_SQ_PSN;
        attr.max_rd_atomic = DEFAULT_MAX_RD_ATOMIC;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        self.modify("ibv_modify_qp(rts)", &mut attr, flags)?;
        self.cur_state = QueuePairState::ReadyToSend;
        Ok(())
    }

    /// Force the queue pair to the error state, from any state.
    ///
    /// Outstanding work requests are flushed and complete with an error
    /// instead of being left in an undefined state; required before tearing
    /// down a pair whose handshake was aborted midway.
    pub fn modify_to_err(&mut self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_ERR;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE;
        self.modify("ibv_modify_qp(err)", &mut attr, flags)?;
        self.cur_state = QueuePairState::Err;
        Ok(())
    }

    /// Issue the native state-modify call with the attributes and the mask
    /// naming exactly them
    fn modify(
        &self,
        name: &str,
        attr: &mut ibv_qp_attr,
        flags: ibv_qp_attr_mask::Type,
    ) -> io::Result<()> {
        check_int(name, || {
            // SAFETY: ffi, and qp will not be modified by other threads
            unsafe { self.pd.ctx.verbs().modify_qp(self.as_ptr(), attr, flags.cast()) }
        })
    }
}

impl Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("inner_qp", &self.inner_qp)
            .field("qp_num", &self.qp_num())
            .field("cur_state", &self.cur_state)
            .finish()
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { self.pd.ctx.verbs().destroy_qp(self.as_ptr()) };
        assert_eq!(
            errno,
            0_i32,
            "ibv_destroy_qp failed: {}",
            io::Error::from_raw_os_error(errno)
        );
    }
}

/// SAFETY: owned handle, transitions require `&mut self`
unsafe impl Send for QueuePair {}

/// SAFETY: owned handle, transitions require `&mut self`
unsafe impl Sync for QueuePair {}
