//! Fabric transport abstraction.
//!
//! The runtime only assumes an abstract fabric: bulk read/write against
//! `(key, base address)` pairs, persistence/invalidation barriers, an
//! ordering fence, and transport context identifiers. The in-tree provider
//! is the shared-memory one, where base addresses are process-local pointers
//! into registered pools and atomics execute on the CPU. A fabric-backed
//! provider (libfabric verbs) would slot in behind the same trait.

use crate::config::{FamConfig, FamModel};
use crate::error::{FamError, FamResult};
use std::sync::atomic::{fence, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Key value carried by a descriptor before registration info is fetched.
pub const FAM_KEY_UNINITIALIZED: u64 = u64::MAX;

/// Widest scalar the atomic surface supports (128-bit). Interleave sizes
/// below this could split an aligned atomic across two memory servers, so
/// configuration enforces it as a floor.
pub const MAX_ATOMIC_WIDTH: u64 = 16;

/// Access bits encoded in shared-memory fabric keys.
pub const FAM_KEY_READ: u64 = 1 << 0;
pub const FAM_KEY_WRITE: u64 = 1 << 1;

#[inline]
pub fn key_allows_read(key: u64) -> bool {
    key != FAM_KEY_UNINITIALIZED && (key & FAM_KEY_READ) == FAM_KEY_READ
}

#[inline]
pub fn key_allows_write(key: u64) -> bool {
    key != FAM_KEY_UNINITIALIZED && (key & FAM_KEY_WRITE) == FAM_KEY_WRITE
}

/// Provider contract for bulk data movement.
///
/// # Safety expectations
///
/// Addresses passed to `write`/`read` must point into registered extents and
/// the `[addr, addr + len)` range must stay inside them; callers enforce this
/// with the key and bounds checks that precede every data-path operation.
pub trait FabricProvider: Send + Sync {
    fn write(&self, src: &[u8], dst_addr: u64);
    fn read(&self, src_addr: u64, dst: &mut [u8]);
    /// Persistence barrier, issued after writes to persistent memory.
    fn persist(&self, addr: u64, len: u64);
    /// Invalidation barrier, issued before reads.
    fn invalidate(&self, addr: u64, len: u64);
    fn fence(&self);
}

/// Transport handle owned by the runtime; also hands out the context ids
/// that isolate a `fam_context`'s outstanding operations.
pub struct FabricTransport {
    inner: Arc<dyn FabricProvider>,
    next_context_id: AtomicU64,
}

impl FabricTransport {
    pub fn new(config: &FamConfig) -> FamResult<Self> {
        let inner: Arc<dyn FabricProvider> = match config.openfam_model {
            FamModel::SharedMemory => Arc::new(ShmProvider),
            FamModel::MemoryServer => {
                return Err(FamError::unimpl(
                    "no fabric provider for the memory_server model in this build",
                ))
            }
        };
        Ok(Self {
            inner,
            next_context_id: AtomicU64::new(1),
        })
    }

    pub fn write(&self, src: &[u8], dst_addr: u64) {
        self.inner.write(src, dst_addr);
    }

    pub fn read(&self, src_addr: u64, dst: &mut [u8]) {
        self.inner.read(src_addr, dst);
    }

    pub fn persist(&self, addr: u64, len: u64) {
        self.inner.persist(addr, len);
    }

    pub fn invalidate(&self, addr: u64, len: u64) {
        self.inner.invalidate(addr, len);
    }

    pub fn fence(&self) {
        self.inner.fence();
    }

    /// Context id 0 is the default context; every opened context gets a
    /// fresh non-zero id.
    pub fn open_context(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn close_context(&self, _context_id: u64) {}
}

/// Shared-memory provider: remote base addresses are process-local pointers.
struct ShmProvider;

impl FabricProvider for ShmProvider {
    fn write(&self, src: &[u8], dst_addr: u64) {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst_addr as *mut u8, src.len());
        }
    }

    fn read(&self, src_addr: u64, dst: &mut [u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(src_addr as *const u8, dst.as_mut_ptr(), dst.len());
        }
    }

    fn persist(&self, _addr: u64, _len: u64) {
        // Persistent-media flush would go here; a full fence keeps the
        // completion visible to other threads in the volatile case.
        fence(Ordering::SeqCst);
    }

    fn invalidate(&self, _addr: u64, _len: u64) {
        fence(Ordering::SeqCst);
    }

    fn fence(&self) {
        fence(Ordering::SeqCst);
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Scalar types the atomic surface supports for load/store/swap.
///
/// The `atomic_*` functions operate on fabric addresses; they are only
/// meaningful for the shared-memory provider and require `addr` to be
/// aligned to `SIZE` and inside a registered extent (the data path checks
/// both before dispatching).
pub trait AtomicScalar:
    Copy + PartialEq + std::fmt::Debug + Send + Sync + sealed::Sealed + 'static
{
    /// Width in bytes; also the required alignment.
    const SIZE: u64;
    #[doc(hidden)]
    unsafe fn atomic_load(addr: u64) -> Self;
    #[doc(hidden)]
    unsafe fn atomic_store(addr: u64, value: Self);
    #[doc(hidden)]
    unsafe fn atomic_swap(addr: u64, value: Self) -> Self;
}

/// Arithmetic RMW family (add/sub/min/max); all return the old value.
pub trait AtomicArith: AtomicScalar {
    #[doc(hidden)]
    unsafe fn atomic_add(addr: u64, value: Self) -> Self;
    #[doc(hidden)]
    unsafe fn atomic_sub(addr: u64, value: Self) -> Self;
    #[doc(hidden)]
    unsafe fn atomic_min(addr: u64, value: Self) -> Self;
    #[doc(hidden)]
    unsafe fn atomic_max(addr: u64, value: Self) -> Self;
}

/// Bitwise RMW family; unsigned 32/64-bit only.
pub trait AtomicBitwise: AtomicScalar {
    #[doc(hidden)]
    unsafe fn atomic_and(addr: u64, value: Self) -> Self;
    #[doc(hidden)]
    unsafe fn atomic_or(addr: u64, value: Self) -> Self;
    #[doc(hidden)]
    unsafe fn atomic_xor(addr: u64, value: Self) -> Self;
}

/// Compare-and-swap family; integer widths the fabric supports natively.
pub trait AtomicCas: AtomicScalar {
    #[doc(hidden)]
    unsafe fn atomic_compare_swap(addr: u64, expected: Self, desired: Self) -> Self;
}

macro_rules! atomic_int_impl {
    ($ty:ty, $atomic:ty) => {
        impl sealed::Sealed for $ty {}

        impl AtomicScalar for $ty {
            const SIZE: u64 = std::mem::size_of::<$ty>() as u64;

            unsafe fn atomic_load(addr: u64) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).load(Ordering::SeqCst)
            }

            unsafe fn atomic_store(addr: u64, value: Self) {
                <$atomic>::from_ptr(addr as *mut $ty).store(value, Ordering::SeqCst)
            }

            unsafe fn atomic_swap(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).swap(value, Ordering::SeqCst)
            }
        }

        impl AtomicArith for $ty {
            unsafe fn atomic_add(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_add(value, Ordering::SeqCst)
            }

            unsafe fn atomic_sub(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_sub(value, Ordering::SeqCst)
            }

            unsafe fn atomic_min(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_min(value, Ordering::SeqCst)
            }

            unsafe fn atomic_max(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_max(value, Ordering::SeqCst)
            }
        }

        impl AtomicCas for $ty {
            unsafe fn atomic_compare_swap(addr: u64, expected: Self, desired: Self) -> Self {
                match <$atomic>::from_ptr(addr as *mut $ty).compare_exchange(
                    expected,
                    desired,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(old) => old,
                    Err(old) => old,
                }
            }
        }
    };
}

atomic_int_impl!(i32, AtomicI32);
atomic_int_impl!(i64, AtomicI64);
atomic_int_impl!(u32, AtomicU32);
atomic_int_impl!(u64, AtomicU64);

macro_rules! atomic_bitwise_impl {
    ($ty:ty, $atomic:ty) => {
        impl AtomicBitwise for $ty {
            unsafe fn atomic_and(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_and(value, Ordering::SeqCst)
            }

            unsafe fn atomic_or(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_or(value, Ordering::SeqCst)
            }

            unsafe fn atomic_xor(addr: u64, value: Self) -> Self {
                <$atomic>::from_ptr(addr as *mut $ty).fetch_xor(value, Ordering::SeqCst)
            }
        }
    };
}

atomic_bitwise_impl!(u32, AtomicU32);
atomic_bitwise_impl!(u64, AtomicU64);

/// Fabrics have no native float RMW; loop with a bitwise CAS.
unsafe fn float_rmw<F, Op>(addr: u64, f: Op) -> F
where
    F: FloatBits,
    Op: Fn(F) -> F,
{
    loop {
        let cur = F::load_bits(addr);
        let old = F::from_bits_(cur);
        let new = f(old);
        if F::cas_bits(addr, cur, new.to_bits_()) {
            return old;
        }
    }
}

trait FloatBits: Copy {
    type Bits: Copy + PartialEq;
    unsafe fn load_bits(addr: u64) -> Self::Bits;
    unsafe fn cas_bits(addr: u64, cur: Self::Bits, new: Self::Bits) -> bool;
    fn from_bits_(bits: Self::Bits) -> Self;
    fn to_bits_(self) -> Self::Bits;
}

impl FloatBits for f32 {
    type Bits = u32;

    unsafe fn load_bits(addr: u64) -> u32 {
        AtomicU32::from_ptr(addr as *mut u32).load(Ordering::SeqCst)
    }

    unsafe fn cas_bits(addr: u64, cur: u32, new: u32) -> bool {
        AtomicU32::from_ptr(addr as *mut u32)
            .compare_exchange(cur, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn from_bits_(bits: u32) -> Self {
        f32::from_bits(bits)
    }

    fn to_bits_(self) -> u32 {
        self.to_bits()
    }
}

impl FloatBits for f64 {
    type Bits = u64;

    unsafe fn load_bits(addr: u64) -> u64 {
        AtomicU64::from_ptr(addr as *mut u64).load(Ordering::SeqCst)
    }

    unsafe fn cas_bits(addr: u64, cur: u64, new: u64) -> bool {
        AtomicU64::from_ptr(addr as *mut u64)
            .compare_exchange(cur, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn from_bits_(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn to_bits_(self) -> u64 {
        self.to_bits()
    }
}

macro_rules! atomic_float_impl {
    ($ty:ty, $bits:ty, $atomic:ty) => {
        impl sealed::Sealed for $ty {}

        impl AtomicScalar for $ty {
            const SIZE: u64 = std::mem::size_of::<$ty>() as u64;

            unsafe fn atomic_load(addr: u64) -> Self {
                <$ty>::from_bits(<$atomic>::from_ptr(addr as *mut $bits).load(Ordering::SeqCst))
            }

            unsafe fn atomic_store(addr: u64, value: Self) {
                <$atomic>::from_ptr(addr as *mut $bits).store(value.to_bits(), Ordering::SeqCst)
            }

            unsafe fn atomic_swap(addr: u64, value: Self) -> Self {
                <$ty>::from_bits(
                    <$atomic>::from_ptr(addr as *mut $bits).swap(value.to_bits(), Ordering::SeqCst),
                )
            }
        }

        impl AtomicArith for $ty {
            unsafe fn atomic_add(addr: u64, value: Self) -> Self {
                float_rmw::<$ty, _>(addr, |old| old + value)
            }

            unsafe fn atomic_sub(addr: u64, value: Self) -> Self {
                float_rmw::<$ty, _>(addr, |old| old - value)
            }

            unsafe fn atomic_min(addr: u64, value: Self) -> Self {
                float_rmw::<$ty, _>(addr, |old| old.min(value))
            }

            unsafe fn atomic_max(addr: u64, value: Self) -> Self {
                float_rmw::<$ty, _>(addr, |old| old.max(value))
            }
        }
    };
}

atomic_float_impl!(f32, u32, AtomicU32);
atomic_float_impl!(f64, u64, AtomicU64);
