//! Client runtime for fabric-attached memory (FAM).
//!
//! A pool of byte-addressable memory lives in one or more memory servers
//! and is accessed remotely by many processing elements. Applications see
//! named regions containing named data items and read, write and atomically
//! mutate them without involving the owning server's CPU on the data path.
//!
//! ## Architecture
//!
//! 1. Control plane: the client information service (`cis`) owns region and
//!    data-item lifecycle. Two interchangeable backends: an in-process
//!    direct implementation and a network stub framed over TCP.
//! 2. The client resource manager (`crm`) tracks per-region registration
//!    state with a lock-free status/refcount word and a deferred-reclamation
//!    garbage queue.
//! 3. The allocator client (`allocator`) drives lifecycle against the CIS
//!    and lazily resolves descriptor keys/base addresses through the cached
//!    region memory map.
//! 4. The async engine (`engine`) services non-blocking puts, gets,
//!    cross-server copies, backups and restores through a producer/consumer
//!    queue with per-class completion accounting and quiet semantics.
//! 5. The data path (`fam`) layers blocking/non-blocking I/O, strided and
//!    indexed scatter/gather, and the fetching/non-fetching atomics on the
//!    transport.

pub mod allocator;
pub mod cis;
pub mod config;
pub mod crm;
pub mod descriptor;
pub mod error;
pub mod fam;
pub mod transport;

pub(crate) mod context;
pub(crate) mod engine;
pub(crate) mod memory;
pub(crate) mod memserver;
pub(crate) mod ops;
pub(crate) mod pe;

pub use cis::{BackupInfo, Cis, CisServer, DirectCis, ItemInfo, RegionInfo, RpcCis};
pub use config::{
    CisInterfaceType, ContextModel, FamConfig, FamModel, FamOptions, PeRuntimeKind,
    RpcFrameworkType, ThreadModel,
};
pub use descriptor::{
    DataItemDescriptor, DescStatus, GlobalDescriptor, InterleaveEnable, MemoryType,
    PermissionLevel, RedundancyLevel, RegionAttributes, RegionDescriptor,
};
pub use error::{FamError, FamErrorKind, FamResult};
pub use fam::{Fam, FamContext, FamWaitObject};
pub use transport::{AtomicArith, AtomicBitwise, AtomicCas, AtomicScalar};
