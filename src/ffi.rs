//! Verbs ABI types and constants.
//!
//! Bindings for the subset of the `libibverbs` interface this crate drives.
//! The library is loaded at runtime (see [`crate::VerbsLibrary`]), so these
//! definitions stand in for the installed headers. Most structs only ever
//! cross the boundary as opaque pointers; the exceptions are the fields read
//! directly from library-owned memory (`ibv_qp::qp_num`, `ibv_mr::lkey` and
//! `ibv_mr::rkey`), which sit in the stable leading part of their structs.

#![allow(non_camel_case_types, non_upper_case_globals, missing_docs)]

use libc::{c_char, c_int, c_uint, c_void};

pub type __be64 = u64;

pub const IBV_SYSFS_NAME_MAX: usize = 64;
pub const IBV_SYSFS_PATH_MAX: usize = 256;

pub const IBV_LINK_LAYER_UNSPECIFIED: u8 = 0;
pub const IBV_LINK_LAYER_INFINIBAND: u8 = 1;
pub const IBV_LINK_LAYER_ETHERNET: u8 = 2;

pub mod ibv_node_type {
    pub type Type = libc::c_int;
    pub const IBV_NODE_UNKNOWN: Type = -1;
    pub const IBV_NODE_CA: Type = 1;
    pub const IBV_NODE_SWITCH: Type = 2;
    pub const IBV_NODE_ROUTER: Type = 3;
    pub const IBV_NODE_RNIC: Type = 4;
}

pub mod ibv_transport_type {
    pub type Type = libc::c_int;
    pub const IBV_TRANSPORT_UNKNOWN: Type = -1;
    pub const IBV_TRANSPORT_IB: Type = 0;
    pub const IBV_TRANSPORT_IWARP: Type = 1;
}

pub mod ibv_port_state {
    pub type Type = libc::c_uint;
    pub const IBV_PORT_NOP: Type = 0;
    pub const IBV_PORT_DOWN: Type = 1;
    pub const IBV_PORT_INIT: Type = 2;
    pub const IBV_PORT_ARMED: Type = 3;
    pub const IBV_PORT_ACTIVE: Type = 4;
    pub const IBV_PORT_ACTIVE_DEFER: Type = 5;
}

pub mod ibv_mtu {
    pub type Type = libc::c_uint;
    pub const IBV_MTU_256: Type = 1;
    pub const IBV_MTU_512: Type = 2;
    pub const IBV_MTU_1024: Type = 3;
    pub const IBV_MTU_2048: Type = 4;
    pub const IBV_MTU_4096: Type = 5;
}

pub mod ibv_qp_type {
    pub type Type = libc::c_uint;
    pub const IBV_QPT_RC: Type = 2;
    pub const IBV_QPT_UC: Type = 3;
    pub const IBV_QPT_UD: Type = 4;
}

pub mod ibv_qp_state {
    pub type Type = libc::c_uint;
    pub const IBV_QPS_RESET: Type = 0;
    pub const IBV_QPS_INIT: Type = 1;
    pub const IBV_QPS_RTR: Type = 2;
    pub const IBV_QPS_RTS: Type = 3;
    pub const IBV_QPS_SQD: Type = 4;
    pub const IBV_QPS_SQE: Type = 5;
    pub const IBV_QPS_ERR: Type = 6;
    pub const IBV_QPS_UNKNOWN: Type = 7;
}

pub mod ibv_access_flags {
    pub type Type = libc::c_uint;
    pub const IBV_ACCESS_LOCAL_WRITE: Type = 1;
    pub const IBV_ACCESS_REMOTE_WRITE: Type = 1 << 1;
    pub const IBV_ACCESS_REMOTE_READ: Type = 1 << 2;
    pub const IBV_ACCESS_REMOTE_ATOMIC: Type = 1 << 3;
    pub const IBV_ACCESS_MW_BIND: Type = 1 << 4;
    pub const IBV_ACCESS_ZERO_BASED: Type = 1 << 5;
}

pub mod ibv_qp_attr_mask {
    pub type Type = libc::c_uint;
    pub const IBV_QP_STATE: Type = 1;
    pub const IBV_QP_CUR_STATE: Type = 1 << 1;
    pub const IBV_QP_EN_SQD_ASYNC_NOTIFY: Type = 1 << 2;
    pub const IBV_QP_ACCESS_FLAGS: Type = 1 << 3;
    pub const IBV_QP_PKEY_INDEX: Type = 1 << 4;
    pub const IBV_QP_PORT: Type = 1 << 5;
    pub const IBV_QP_QKEY: Type = 1 << 6;
    pub const IBV_QP_AV: Type = 1 << 7;
    pub const IBV_QP_PATH_MTU: Type = 1 << 8;
    pub const IBV_QP_TIMEOUT: Type = 1 << 9;
    pub const IBV_QP_RETRY_CNT: Type = 1 << 10;
    pub const IBV_QP_RNR_RETRY: Type = 1 << 11;
    pub const IBV_QP_RQ_PSN: Type = 1 << 12;
    pub const IBV_QP_MAX_QP_RD_ATOMIC: Type = 1 << 13;
    pub const IBV_QP_ALT_PATH: Type = 1 << 14;
    pub const IBV_QP_MIN_RNR_TIMER: Type = 1 << 15;
    pub const IBV_QP_SQ_PSN: Type = 1 << 16;
    pub const IBV_QP_MAX_DEST_RD_ATOMIC: Type = 1 << 17;
    pub const IBV_QP_PATH_MIG_STATE: Type = 1 << 18;
    pub const IBV_QP_CAP: Type = 1 << 19;
    pub const IBV_QP_DEST_QPN: Type = 1 << 20;
}

#[repr(C)]
pub struct ibv_device {
    pub _ops: [*mut c_void; 2],
    pub node_type: ibv_node_type::Type,
    pub transport_type: ibv_transport_type::Type,
    pub name: [c_char; IBV_SYSFS_NAME_MAX],
    pub dev_name: [c_char; IBV_SYSFS_NAME_MAX],
    pub dev_path: [c_char; IBV_SYSFS_PATH_MAX],
    pub ibdev_path: [c_char; IBV_SYSFS_PATH_MAX],
}

/// Stable leading part of `struct ibv_context`; the remainder (operation
/// table, command fds, mutex) is only touched by the library itself.
#[repr(C)]
pub struct ibv_context {
    pub device: *mut ibv_device,
}

#[repr(C)]
pub struct ibv_pd {
    pub context: *mut ibv_context,
    pub handle: u32,
}

#[repr(C)]
pub struct ibv_cq {
    pub context: *mut ibv_context,
    pub channel: *mut c_void,
    pub cq_context: *mut c_void,
    pub handle: u32,
    pub cqe: c_int,
}

#[repr(C)]
pub struct ibv_srq {
    pub context: *mut ibv_context,
    pub srq_context: *mut c_void,
    pub pd: *mut ibv_pd,
    pub handle: u32,
}

#[repr(C)]
pub struct ibv_mr {
    pub context: *mut ibv_context,
    pub pd: *mut ibv_pd,
    pub addr: *mut c_void,
    pub length: usize,
    pub handle: u32,
    pub lkey: u32,
    pub rkey: u32,
}

#[repr(C)]
pub struct ibv_qp {
    pub context: *mut ibv_context,
    pub qp_context: *mut c_void,
    pub pd: *mut ibv_pd,
    pub send_cq: *mut ibv_cq,
    pub recv_cq: *mut ibv_cq,
    pub srq: *mut ibv_srq,
    pub handle: u32,
    pub qp_num: u32,
    pub state: ibv_qp_state::Type,
    pub qp_type: ibv_qp_type::Type,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_gid_global {
    pub subnet_prefix: __be64,
    pub interface_id: __be64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union ibv_gid {
    pub raw: [u8; 16],
    pub global: ibv_gid_global,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_port_attr {
    pub state: ibv_port_state::Type,
    pub max_mtu: ibv_mtu::Type,
    pub active_mtu: ibv_mtu::Type,
    pub gid_tbl_len: c_int,
    pub port_cap_flags: u32,
    pub max_msg_sz: u32,
    pub bad_pkey_cntr: u32,
    pub qkey_viol_cntr: u32,
    pub pkey_tbl_len: u16,
    pub lid: u16,
    pub sm_lid: u16,
    pub lmc: u8,
    pub max_vl_num: u8,
    pub sm_sl: u8,
    pub subnet_timeout: u8,
    pub init_type_reply: u8,
    pub active_width: u8,
    pub active_speed: u8,
    pub phys_state: u8,
    pub link_layer: u8,
    pub flags: u8,
    pub port_cap_flags2: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_qp_cap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_qp_init_attr {
    pub qp_context: *mut c_void,
    pub send_cq: *mut ibv_cq,
    pub recv_cq: *mut ibv_cq,
    pub srq: *mut ibv_srq,
    pub cap: ibv_qp_cap,
    pub qp_type: ibv_qp_type::Type,
    pub sq_sig_all: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_srq_attr {
    pub max_wr: u32,
    pub max_sge: u32,
    pub srq_limit: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_srq_init_attr {
    pub srq_context: *mut c_void,
    pub attr: ibv_srq_attr,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_global_route {
    pub dgid: ibv_gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_ah_attr {
    pub grh: ibv_global_route,
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub static_rate: u8,
    pub is_global: u8,
    pub port_num: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_qp_attr {
    pub qp_state: ibv_qp_state::Type,
    pub cur_qp_state: ibv_qp_state::Type,
    pub path_mtu: ibv_mtu::Type,
    pub path_mig_state: c_uint,
    pub qkey: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub qp_access_flags: c_uint,
    pub cap: ibv_qp_cap,
    pub ah_attr: ibv_ah_attr,
    pub alt_ah_attr: ibv_ah_attr,
    pub pkey_index: u16,
    pub alt_pkey_index: u16,
    pub en_sqd_async_notify: u8,
    pub sq_draining: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub port_num: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub alt_port_num: u8,
    pub alt_timeout: u8,
    pub rate_limit: u32,
}
