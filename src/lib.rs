//! Reliable-connected RDMA endpoint setup over InfiniBand/RoCE.
//!
//! Verbs-endpoint owns the part of an RDMA transport that has to be right
//! before a single byte can flow: picking a usable adapter, keeping the
//! kernel-backed verbs resources alive in the correct order, and driving a
//! queue pair through the connection handshake. At a high level, it provides
//! a few major components:
//!
//! * A [`Verbs`] capability table representing the loaded verbs interface,
//! injected into everything instead of linked, with a production
//! implementation ([`VerbsLibrary`]) that loads `libibverbs` at runtime.
//!
//! * Exclusive-ownership wrappers for each native resource: [`Context`],
//! [`ProtectionDomain`], [`CompletionQueue`], [`SharedReceiveQueue`],
//! [`MemoryRegion`] and [`QueuePair`]. Dropping a wrapper releases the
//! resource; a failed release is fatal rather than silently ignored.
//!
//! * Device discovery ([`DeviceList::available`]) that filters the host's
//! adapters down to those with an active InfiniBand or Ethernet port.
//!
//! * Address resolution ([`Address::query`]) and the connection state
//! machine (`QueuePair::modify_to_*`) that binds two independently resolved
//! addresses into one reliable connection after the peers have exchanged
//! their [`SetupInformation`] out of band.
//!
//! Posting and polling work requests, message framing and the out-of-band
//! exchange channel itself belong to the layers above.
//!
//! #### Example
//!
//! Establish one endpoint; `exchange` stands for whatever control-plane
//! channel the application uses to swap setup information with its peer.
//!
//! ```no_run
//! use std::io;
//! use std::sync::Arc;
//! use verbs_endpoint::{
//!     Address, Context, DeviceList, QueuePairInitAttrBuilder, SetupInformation, Verbs,
//!     VerbsLibrary, DEFAULT_PORT_NUM,
//! };
//!
//! # fn exchange(local: SetupInformation) -> SetupInformation { local }
//! fn main() -> io::Result<()> {
//!     let verbs: Arc<dyn Verbs> = VerbsLibrary::load()?;
//!     let devices = DeviceList::available(&verbs, DEFAULT_PORT_NUM)?;
//!     let device = devices.first().expect("no usable RDMA device");
//!     let ctx = Arc::new(Context::open(&verbs, device)?);
//!     let addr = Address::query(&ctx, DEFAULT_PORT_NUM, 0, 65536)?;
//!     let pd = Arc::new(ctx.create_protection_domain()?);
//!     let cq = ctx.create_completion_queue(1024)?;
//!     let attr = QueuePairInitAttrBuilder::default().build()?;
//!     let mut qp = pd.create_queue_pair(&cq, &cq, None, &attr)?;
//!
//!     let peer = exchange(addr.setup_information(&qp));
//!     qp.modify_to_init(&addr)?;
//!     qp.modify_to_rtr(&addr, &peer)?;
//!     qp.modify_to_rts()?;
//!     // the pair is connected; hand it to the data path
//!     Ok(())
//! }
//! ```
#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences
)]

/// Access permission flags
mod access;
/// Local address resolution and the exchanged setup information
mod address;
/// The completion queue that receives work completions
mod completion_queue;
/// The rdma device context
mod context;
/// Device discovery
mod device;
/// Error checking adapters around native calls
mod error_utilities;
/// In-memory capability table for tests
#[cfg(test)]
pub(crate) mod fake;
/// Verbs ABI types and constants
pub mod ffi;
/// Gid for device
mod gid;
/// Memory region registration
mod memory_region;
/// Protection Domain
mod protection_domain;
/// Queue Pair and the connection state machine
mod queue_pair;
/// Shared receive queue
mod shared_receive_queue;
/// The native verbs capability table and its dynamic loader
mod verbs;

pub use access::AccessFlag;
pub use address::{Address, SetupInformation};
pub use completion_queue::{CompletionQueue, DEFAULT_CQ_SIZE};
pub use context::Context;
pub use device::{Device, DeviceList, Guid};
pub use gid::Gid;
pub use memory_region::MemoryRegion;
pub use protection_domain::ProtectionDomain;
pub use queue_pair::{
    QueuePair, QueuePairInitAttr, QueuePairInitAttrBuilder, QueuePairInitAttrBuilderError,
    QueuePairState, QueuePairType, MTU,
};
pub use shared_receive_queue::SharedReceiveQueue;
pub use verbs::{Verbs, VerbsLibrary};

/// Port number callers conventionally pass when the adapter has a single port
pub const DEFAULT_PORT_NUM: u8 = 1;
