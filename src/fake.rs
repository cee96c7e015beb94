//! In-memory capability table driving the handle layer in tests.
//!
//! Simulates the scenarios a real fabric makes hard to reproduce on demand:
//! hosts with several adapters in mixed states, enumeration failures with
//! historical errno spellings, release failures, and an adapter-side state
//! machine that rejects out-of-order or mis-masked queue pair transitions.

use crate::ffi::{
    __be64, ibv_context, ibv_cq, ibv_device, ibv_gid, ibv_mr, ibv_mtu, ibv_pd, ibv_port_attr,
    ibv_port_state, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_init_attr, ibv_qp_state,
    ibv_srq, ibv_srq_init_attr, IBV_LINK_LAYER_INFINIBAND,
};
use crate::verbs::Verbs;
use errno::{set_errno, Errno};
use libc::{c_char, c_int, c_void};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::{mem, ptr};

/// Attribute mask every init transition must carry, exactly
const INIT_MASK: ibv_qp_attr_mask::Type = ibv_qp_attr_mask::IBV_QP_STATE
    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
    | ibv_qp_attr_mask::IBV_QP_PORT
    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

/// Attribute mask every ready-to-receive transition must carry, exactly
const RTR_MASK: ibv_qp_attr_mask::Type = ibv_qp_attr_mask::IBV_QP_STATE
    | ibv_qp_attr_mask::IBV_QP_AV
    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

/// Attribute mask every ready-to-send transition must carry, exactly
const RTS_MASK: ibv_qp_attr_mask::Type = ibv_qp_attr_mask::IBV_QP_STATE
    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

/// Description of one simulated adapter
pub(crate) struct FakeDeviceSpec {
    pub(crate) name: &'static str,
    pub(crate) guid: u64,
    pub(crate) port_num: u8,
    pub(crate) lid: u16,
    pub(crate) port_state: ibv_port_state::Type,
    pub(crate) link_layer: u8,
    pub(crate) active_mtu: ibv_mtu::Type,
    pub(crate) gids: Vec<[u8; 16]>,
    /// Fail `open_device` on this adapter with the given errno
    pub(crate) open_errno: Option<i32>,
}

impl Default for FakeDeviceSpec {
    fn default() -> Self {
        Self {
            name: "fake0",
            guid: 0x2641_8cff_fe02_1df9,
            port_num: 1,
            lid: 1,
            port_state: ibv_port_state::IBV_PORT_ACTIVE,
            link_layer: IBV_LINK_LAYER_INFINIBAND,
            active_mtu: ibv_mtu::IBV_MTU_1024,
            gids: vec![[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01]],
            open_errno: None,
        }
    }
}

struct FakeDevice {
    spec: FakeDeviceSpec,
    dev: Box<ibv_device>,
}

struct FakeQp {
    qp: Box<ibv_qp>,
    /// Index of the adapter the pair lives on
    device: usize,
    state: ibv_qp_state::Type,
}

#[derive(Default)]
struct FakeState {
    devices: Vec<FakeDevice>,
    /// Fail the next `get_device_list` with this errno (may be negative, to
    /// reproduce the inverted-ENOSYS spelling of old drivers)
    list_errno: Option<i32>,
    /// Fail every `destroy_qp` with this errno
    destroy_qp_errno: Option<i32>,
    lists: HashMap<usize, Box<[*mut ibv_device]>>,
    contexts: HashMap<usize, (Box<ibv_context>, usize)>,
    pds: HashMap<usize, (Box<ibv_pd>, usize)>,
    cqs: HashMap<usize, Box<ibv_cq>>,
    srqs: HashMap<usize, Box<ibv_srq>>,
    mrs: HashMap<usize, Box<ibv_mr>>,
    qps: HashMap<usize, FakeQp>,
    next_qp_num: u32,
    next_key: u32,
}

/// A [`Verbs`] table backed by plain memory
pub(crate) struct FakeVerbs {
    state: Mutex<FakeState>,
}

/// SAFETY: all state is behind the mutex; the raw pointers handed out point
/// into boxed storage owned by that same state
unsafe impl Send for FakeVerbs {}
/// SAFETY: same as above
unsafe impl Sync for FakeVerbs {}

impl FakeVerbs {
    pub(crate) fn new(specs: Vec<FakeDeviceSpec>) -> Arc<Self> {
        let devices = specs
            .into_iter()
            .map(|spec| {
                // SAFETY: POD FFI type
                let mut dev = Box::new(unsafe { mem::zeroed::<ibv_device>() });
                for (dst, src) in dev.name.iter_mut().zip(spec.name.bytes()) {
                    *dst = src as c_char;
                }
                FakeDevice { spec, dev }
            })
            .collect();
        Arc::new(Self {
            state: Mutex::new(FakeState {
                devices,
                next_qp_num: 0x11,
                next_key: 0x100,
                ..FakeState::default()
            }),
        })
    }

    /// One default active InfiniBand adapter
    pub(crate) fn single() -> Arc<Self> {
        Self::new(vec![FakeDeviceSpec::default()])
    }

    /// A table whose enumeration fails with `code` in errno
    pub(crate) fn fail_device_list(code: i32) -> Arc<Self> {
        let this = Self::new(Vec::new());
        this.state.lock().unwrap().list_errno = Some(code);
        this
    }

    /// Make every queue pair release report `code`
    pub(crate) fn set_destroy_qp_errno(&self, code: i32) {
        self.state.lock().unwrap().destroy_qp_errno = Some(code);
    }
}

impl Verbs for FakeVerbs {
    unsafe fn get_device_list(&self, num_devices: *mut c_int) -> *mut *mut ibv_device {
        let mut st = self.state.lock().unwrap();
        if let Some(code) = st.list_errno {
            set_errno(Errno(code));
            return ptr::null_mut();
        }
        let mut arr: Box<[*mut ibv_device]> = st
            .devices
            .iter_mut()
            .map(|d| &mut *d.dev as *mut ibv_device)
            .collect();
        let arr_ptr = arr.as_mut_ptr();
        *num_devices = st.devices.len() as c_int;
        st.lists.insert(arr_ptr as usize, arr);
        arr_ptr
    }

    unsafe fn free_device_list(&self, list: *mut *mut ibv_device) {
        let mut st = self.state.lock().unwrap();
        assert!(
            st.lists.remove(&(list as usize)).is_some(),
            "unknown or already freed device list"
        );
    }

    unsafe fn get_device_name(&self, device: *mut ibv_device) -> *const c_char {
        (*device).name.as_ptr()
    }

    unsafe fn get_device_guid(&self, device: *mut ibv_device) -> __be64 {
        let st = self.state.lock().unwrap();
        let dev = st
            .devices
            .iter()
            .find(|d| ptr::eq(&*d.dev, device))
            .expect("unknown device");
        dev.spec.guid.to_be()
    }

    unsafe fn open_device(&self, device: *mut ibv_device) -> *mut ibv_context {
        let mut st = self.state.lock().unwrap();
        let index = st
            .devices
            .iter()
            .position(|d| ptr::eq(&*d.dev, device))
            .expect("unknown device");
        if let Some(code) = st.devices[index].spec.open_errno {
            set_errno(Errno(code));
            return ptr::null_mut();
        }
        // SAFETY: POD FFI type
        let mut ctx = Box::new(mem::zeroed::<ibv_context>());
        ctx.device = device;
        let ctx_ptr = &mut *ctx as *mut ibv_context;
        st.contexts.insert(ctx_ptr as usize, (ctx, index));
        ctx_ptr
    }

    unsafe fn close_device(&self, context: *mut ibv_context) -> c_int {
        let mut st = self.state.lock().unwrap();
        match st.contexts.remove(&(context as usize)) {
            Some(_) => 0,
            None => libc::EINVAL,
        }
    }

    unsafe fn query_port(
        &self,
        context: *mut ibv_context,
        port_num: u8,
        port_attr: *mut ibv_port_attr,
    ) -> c_int {
        let st = self.state.lock().unwrap();
        let Some(&(_, index)) = st.contexts.get(&(context as usize)) else {
            return libc::EINVAL;
        };
        let spec = &st.devices[index].spec;
        if port_num != spec.port_num {
            return libc::EINVAL;
        }
        // SAFETY: POD FFI type
        let mut attr = mem::zeroed::<ibv_port_attr>();
        attr.state = spec.port_state;
        attr.max_mtu = ibv_mtu::IBV_MTU_4096;
        attr.active_mtu = spec.active_mtu;
        attr.gid_tbl_len = spec.gids.len() as c_int;
        attr.max_msg_sz = 1 << 30;
        attr.lid = spec.lid;
        attr.link_layer = spec.link_layer;
        *port_attr = attr;
        0
    }

    unsafe fn query_gid(
        &self,
        context: *mut ibv_context,
        port_num: u8,
        index: c_int,
        gid: *mut ibv_gid,
    ) -> c_int {
        let st = self.state.lock().unwrap();
        let Some(&(_, dev_index)) = st.contexts.get(&(context as usize)) else {
            return libc::EINVAL;
        };
        let spec = &st.devices[dev_index].spec;
        if port_num != spec.port_num {
            return libc::EINVAL;
        }
        match usize::try_from(index).ok().and_then(|i| spec.gids.get(i)) {
            Some(raw) => {
                (*gid).raw = *raw;
                0
            }
            None => libc::EINVAL,
        }
    }

    unsafe fn alloc_pd(&self, context: *mut ibv_context) -> *mut ibv_pd {
        let mut st = self.state.lock().unwrap();
        if !st.contexts.contains_key(&(context as usize)) {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        // SAFETY: POD FFI type
        let mut pd = Box::new(mem::zeroed::<ibv_pd>());
        pd.context = context;
        let pd_ptr = &mut *pd as *mut ibv_pd;
        st.pds.insert(pd_ptr as usize, (pd, context as usize));
        pd_ptr
    }

    unsafe fn dealloc_pd(&self, pd: *mut ibv_pd) -> c_int {
        let mut st = self.state.lock().unwrap();
        match st.pds.remove(&(pd as usize)) {
            Some(_) => 0,
            None => libc::EINVAL,
        }
    }

    unsafe fn create_cq(
        &self,
        context: *mut ibv_context,
        cqe: c_int,
        _cq_context: *mut c_void,
        _channel: *mut c_void,
        _comp_vector: c_int,
    ) -> *mut ibv_cq {
        let mut st = self.state.lock().unwrap();
        if !st.contexts.contains_key(&(context as usize)) || cqe <= 0 {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        // SAFETY: POD FFI type
        let mut cq = Box::new(mem::zeroed::<ibv_cq>());
        cq.context = context;
        cq.cqe = cqe;
        let cq_ptr = &mut *cq as *mut ibv_cq;
        st.cqs.insert(cq_ptr as usize, cq);
        cq_ptr
    }

    unsafe fn destroy_cq(&self, cq: *mut ibv_cq) -> c_int {
        let mut st = self.state.lock().unwrap();
        match st.cqs.remove(&(cq as usize)) {
            Some(_) => 0,
            None => libc::EINVAL,
        }
    }

    unsafe fn create_srq(
        &self,
        pd: *mut ibv_pd,
        _init_attr: *mut ibv_srq_init_attr,
    ) -> *mut ibv_srq {
        let mut st = self.state.lock().unwrap();
        if !st.pds.contains_key(&(pd as usize)) {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        // SAFETY: POD FFI type
        let mut srq = Box::new(mem::zeroed::<ibv_srq>());
        srq.pd = pd;
        let srq_ptr = &mut *srq as *mut ibv_srq;
        st.srqs.insert(srq_ptr as usize, srq);
        srq_ptr
    }

    unsafe fn destroy_srq(&self, srq: *mut ibv_srq) -> c_int {
        let mut st = self.state.lock().unwrap();
        match st.srqs.remove(&(srq as usize)) {
            Some(_) => 0,
            None => libc::EINVAL,
        }
    }

    unsafe fn reg_mr(
        &self,
        pd: *mut ibv_pd,
        addr: *mut c_void,
        length: usize,
        _access: c_int,
    ) -> *mut ibv_mr {
        let mut st = self.state.lock().unwrap();
        if !st.pds.contains_key(&(pd as usize)) || length == 0 {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        // SAFETY: POD FFI type
        let mut mr = Box::new(mem::zeroed::<ibv_mr>());
        mr.pd = pd;
        mr.addr = addr;
        mr.length = length;
        mr.lkey = st.next_key;
        mr.rkey = st.next_key.wrapping_add(1);
        st.next_key = st.next_key.wrapping_add(2);
        let mr_ptr = &mut *mr as *mut ibv_mr;
        st.mrs.insert(mr_ptr as usize, mr);
        mr_ptr
    }

    unsafe fn dereg_mr(&self, mr: *mut ibv_mr) -> c_int {
        let mut st = self.state.lock().unwrap();
        match st.mrs.remove(&(mr as usize)) {
            Some(_) => 0,
            None => libc::EINVAL,
        }
    }

    unsafe fn create_qp(&self, pd: *mut ibv_pd, init_attr: *mut ibv_qp_init_attr) -> *mut ibv_qp {
        let mut st = self.state.lock().unwrap();
        let Some(&(_, ctx_key)) = st.pds.get(&(pd as usize)) else {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        };
        let device = match st.contexts.get(&ctx_key) {
            Some(&(_, index)) => index,
            None => {
                set_errno(Errno(libc::EINVAL));
                return ptr::null_mut();
            }
        };
        if (*init_attr).send_cq.is_null() || (*init_attr).recv_cq.is_null() {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        // SAFETY: POD FFI type
        let mut qp = Box::new(mem::zeroed::<ibv_qp>());
        qp.pd = pd;
        qp.send_cq = (*init_attr).send_cq;
        qp.recv_cq = (*init_attr).recv_cq;
        qp.srq = (*init_attr).srq;
        qp.qp_num = st.next_qp_num;
        qp.state = ibv_qp_state::IBV_QPS_RESET;
        qp.qp_type = (*init_attr).qp_type;
        st.next_qp_num = st.next_qp_num.wrapping_add(1);
        let qp_ptr = &mut *qp as *mut ibv_qp;
        st.qps.insert(
            qp_ptr as usize,
            FakeQp {
                qp,
                device,
                state: ibv_qp_state::IBV_QPS_RESET,
            },
        );
        qp_ptr
    }

    unsafe fn destroy_qp(&self, qp: *mut ibv_qp) -> c_int {
        let mut st = self.state.lock().unwrap();
        if let Some(code) = st.destroy_qp_errno {
            return code;
        }
        match st.qps.remove(&(qp as usize)) {
            Some(_) => 0,
            None => libc::EINVAL,
        }
    }

    unsafe fn modify_qp(
        &self,
        qp: *mut ibv_qp,
        attr: *mut ibv_qp_attr,
        attr_mask: c_int,
    ) -> c_int {
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;
        let Some(fq) = st.qps.get_mut(&(qp as usize)) else {
            return libc::EINVAL;
        };
        let mask = attr_mask as ibv_qp_attr_mask::Type;
        if mask & ibv_qp_attr_mask::IBV_QP_STATE == 0 {
            return libc::EINVAL;
        }
        let target = (*attr).qp_state;
        let accepted = match target {
            ibv_qp_state::IBV_QPS_INIT => {
                fq.state == ibv_qp_state::IBV_QPS_RESET
                    && mask == INIT_MASK
                    && (*attr).port_num == st.devices[fq.device].spec.port_num
            }
            ibv_qp_state::IBV_QPS_RTR => fq.state == ibv_qp_state::IBV_QPS_INIT
                && mask == RTR_MASK
                && (*attr).path_mtu >= ibv_mtu::IBV_MTU_256
                && (*attr).path_mtu <= ibv_mtu::IBV_MTU_4096,
            ibv_qp_state::IBV_QPS_RTS => {
                fq.state == ibv_qp_state::IBV_QPS_RTR && mask == RTS_MASK
            }
            ibv_qp_state::IBV_QPS_ERR => mask == ibv_qp_attr_mask::IBV_QP_STATE,
            _ => false,
        };
        if !accepted {
            return libc::EINVAL;
        }
        fq.state = target;
        fq.qp.state = target;
        0
    }
}
