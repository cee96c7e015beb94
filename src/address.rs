use crate::context::Context;
use crate::gid::Gid;
use crate::queue_pair::{QueuePair, MTU};
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::io;

/// The resolved addressing and capability facts of one local device port.
///
/// Immutable once computed; everything a queue pair needs to initialize
/// itself and everything the peer needs to reach this endpoint comes out of
/// here.
#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Address {
    /// The local physical port the endpoint uses
    port_num: u8,
    /// Index of the chosen entry in the port's GID table
    gid_index: u8,
    /// The already-resolved LID of the device+port pair
    lid: u16,
    /// The already-resolved GID of the device+port+index combination
    gid: Gid,
    /// Active MTU of the port
    mtu: MTU,
    /// Ceiling for a single message, policy supplied by the caller
    max_msg_size: u32,
}

impl Address {
    /// Resolve the address of `port_num` on an open device.
    ///
    /// The LID and active MTU come from the port attributes, the GID from the
    /// port's GID table at `gid_index`. `max_msg_size` is taken as given;
    /// choosing it is the caller's policy. Either query failing fails the
    /// whole resolution, there is no partial result.
    pub fn query(
        ctx: &Context,
        port_num: u8,
        gid_index: u8,
        max_msg_size: u32,
    ) -> io::Result<Self> {
        let port_attr = ctx.query_port(port_num)?;
        let gid = ctx.query_gid(port_num, gid_index)?;
        let mtu = MTU::try_from(port_attr.active_mtu)?;
        Ok(Self {
            port_num,
            gid_index,
            lid: port_attr.lid,
            gid,
            mtu,
            max_msg_size,
        })
    }

    /// Combine this address with a created queue pair's number into the value
    /// the peer must receive before its ready-to-receive transition.
    ///
    /// Pure; no native call is made.
    #[must_use]
    pub fn setup_information(&self, qp: &QueuePair) -> SetupInformation {
        SetupInformation {
            lid: self.lid,
            gid: self.gid,
            qp_num: qp.qp_num(),
            mtu: self.mtu,
            max_msg_size: self.max_msg_size,
        }
    }
}

/// Queue pair information used to hand shake.
///
/// Exchanged by copy over an out-of-band channel of the caller's choosing
/// before either side may transition to ready-to-receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SetupInformation {
    /// LID of the originating endpoint
    lid: u16,
    /// GID of the originating endpoint
    gid: Gid,
    /// Queue pair number assigned by the originating adapter
    qp_num: u32,
    /// Active MTU reported by the originating port
    mtu: MTU,
    /// Message size ceiling of the originating endpoint
    max_msg_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceList;
    use crate::fake::{FakeDeviceSpec, FakeVerbs};
    use crate::ffi::ibv_mtu;
    use crate::queue_pair::QueuePairInitAttrBuilder;
    use crate::verbs::Verbs;
    use std::sync::Arc;

    #[test]
    fn query_reads_port_and_gid_table() {
        let gid = [
            0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x26, 0x41, 0x8c, 0xff, 0xfe, 0x02, 0x1d, 0xf9,
        ];
        let fake = FakeVerbs::new(vec![FakeDeviceSpec {
            lid: 42,
            active_mtu: ibv_mtu::IBV_MTU_2048,
            gids: vec![gid],
            ..FakeDeviceSpec::default()
        }]);
        let verbs: Arc<dyn Verbs> = fake;
        let list = DeviceList::available(&verbs, 1).unwrap();
        let ctx = Arc::new(Context::open(&verbs, &list[0]).unwrap());

        let addr = Address::query(&ctx, 1, 0, 65536).unwrap();
        assert_eq!(addr.port_num(), 1);
        assert_eq!(addr.gid_index(), 0);
        assert_eq!(addr.lid(), 42);
        assert_eq!(addr.gid(), Gid::from_raw(gid));
        assert_eq!(addr.mtu(), MTU::MTU2048);
        assert_eq!(addr.max_msg_size(), 65536);
    }

    #[test]
    fn query_fails_on_missing_gid_entry() {
        let fake = FakeVerbs::single();
        let verbs: Arc<dyn Verbs> = fake;
        let list = DeviceList::available(&verbs, 1).unwrap();
        let ctx = Arc::new(Context::open(&verbs, &list[0]).unwrap());

        // the default fake device has a single GID entry
        let err = Address::query(&ctx, 1, 5, 65536).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn query_fails_on_unknown_port() {
        let fake = FakeVerbs::single();
        let verbs: Arc<dyn Verbs> = fake;
        let list = DeviceList::available(&verbs, 1).unwrap();
        let ctx = Arc::new(Context::open(&verbs, &list[0]).unwrap());

        let err = Address::query(&ctx, 2, 0, 65536).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn setup_information_is_pure() {
        let fake = FakeVerbs::single();
        let verbs: Arc<dyn Verbs> = fake;
        let list = DeviceList::available(&verbs, 1).unwrap();
        let ctx = Arc::new(Context::open(&verbs, &list[0]).unwrap());
        let addr = Address::query(&ctx, 1, 0, 65536).unwrap();

        let pd = Arc::new(ctx.create_protection_domain().unwrap());
        let cq = ctx.create_completion_queue(16).unwrap();
        let attr = QueuePairInitAttrBuilder::default().build().unwrap();
        let qp = pd.create_queue_pair(&cq, &cq, None, &attr).unwrap();

        let first = addr.setup_information(&qp);
        let second = addr.setup_information(&qp);
        assert_eq!(first, second);
        assert_eq!(first.qp_num(), qp.qp_num());
        assert_eq!(first.lid(), addr.lid());
    }
}
