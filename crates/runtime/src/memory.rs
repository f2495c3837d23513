//! Raw memory access.
//!
//! [`Unsafe`] hands out native allocations and reads or writes arbitrary
//! addresses. Every operation, including obtaining the instance through
//! [`Unsafe::get_unsafe`], is an unsafe-capability entry point.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::mem::{MaybeUninit, size_of};
use std::ptr;
use std::sync::atomic::{self, AtomicI32, AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::Runtime;
use crate::loader::UnitHandle;
use crate::unit::{CodeUnit, HookError};

pub const UNIT: &str = "memory.Unsafe";

/// Alignment of every allocation handed out.
const ALIGN: usize = 16;

#[cfg(not(unix))]
const FALLBACK_PAGE_SIZE: usize = 4096;

pub fn unit() -> CodeUnit {
    CodeUnit::new(UNIT).methods([
        "get_unsafe",
        "address_size",
        "page_size",
        "allocate_memory",
        "reallocate_memory",
        "free_memory",
        "set_memory",
        "copy_memory",
        "get",
        "put",
        "get_volatile",
        "put_volatile",
        "put_ordered",
        "get_address",
        "put_address",
        "compare_and_swap_int",
        "compare_and_swap_long",
        "get_and_add_int",
        "get_and_add_long",
        "get_and_set_int",
        "get_and_set_long",
        "array_base_offset",
        "array_index_scale",
        "allocate_instance",
        "load_fence",
        "store_fence",
        "full_fence",
        "park",
        "unpark",
    ])
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnsafeError {
    #[error("unsafe access refused")]
    Blocked {
        #[source]
        source: HookError,
    },

    #[error("cannot allocate {0} bytes")]
    OutOfMemory(usize),

    #[error("address {0:#x} was not allocated by this instance")]
    UnknownAddress(usize),

    #[error(transparent)]
    Load(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, UnsafeError>;

/// Low-level memory operations.
///
/// Addresses are plain `usize` values. Memory allocated here must be
/// freed here.
pub struct Unsafe {
    unit: UnitHandle,
    allocations: Mutex<HashMap<usize, Layout>>,
}

impl Unsafe {
    /// Obtain an instance through the public accessor.
    pub fn get_unsafe(runtime: &Runtime) -> Result<Self> {
        let unsafe_ = Self::the_unsafe(runtime)?;
        unsafe_.enter("get_unsafe")?;
        Ok(unsafe_)
    }

    /// Obtain an instance without going through the accessor, the way
    /// reflective callers do. Every operation on it is still checked.
    pub fn the_unsafe(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            unit: runtime.load(UNIT)?,
            allocations: Mutex::new(HashMap::new()),
        })
    }

    fn enter(&self, method: &str) -> Result<()> {
        self.unit
            .enter(method)
            .map_err(|source| UnsafeError::Blocked { source })
    }

    pub fn address_size(&self) -> Result<usize> {
        self.enter("address_size")?;
        Ok(size_of::<usize>())
    }

    pub fn page_size(&self) -> Result<usize> {
        self.enter("page_size")?;
        Ok(system_page_size())
    }

    /// Allocate `bytes` of uninitialized memory. Zero bytes yields address 0.
    pub fn allocate_memory(&self, bytes: usize) -> Result<usize> {
        self.enter("allocate_memory")?;
        self.allocate(bytes)
    }

    fn allocate(&self, bytes: usize) -> Result<usize> {
        if bytes == 0 {
            return Ok(0);
        }
        let layout = Layout::from_size_align(bytes, ALIGN).map_err(|_| UnsafeError::OutOfMemory(bytes))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(UnsafeError::OutOfMemory(bytes));
        }
        let address = ptr as usize;
        self.allocations().insert(address, layout);
        Ok(address)
    }

    /// Resize an allocation. Address 0 allocates; zero bytes frees.
    pub fn reallocate_memory(&self, address: usize, bytes: usize) -> Result<usize> {
        self.enter("reallocate_memory")?;
        if address == 0 {
            return self.allocate(bytes);
        }
        if bytes == 0 {
            self.free(address)?;
            return Ok(0);
        }
        let new_layout = Layout::from_size_align(bytes, ALIGN).map_err(|_| UnsafeError::OutOfMemory(bytes))?;
        let mut allocations = self.allocations();
        let layout = allocations
            .remove(&address)
            .ok_or(UnsafeError::UnknownAddress(address))?;
        // SAFETY: `address` came from `alloc` with `layout` and is still live,
        // and `new_layout` proves the new size is in range.
        let ptr = unsafe { alloc::realloc(address as *mut u8, layout, bytes) };
        if ptr.is_null() {
            allocations.insert(address, layout);
            return Err(UnsafeError::OutOfMemory(bytes));
        }
        allocations.insert(ptr as usize, new_layout);
        Ok(ptr as usize)
    }

    /// Free an allocation. Address 0 is ignored.
    pub fn free_memory(&self, address: usize) -> Result<()> {
        self.enter("free_memory")?;
        self.free(address)
    }

    fn free(&self, address: usize) -> Result<()> {
        if address == 0 {
            return Ok(());
        }
        let layout = self
            .allocations()
            .remove(&address)
            .ok_or(UnsafeError::UnknownAddress(address))?;
        // SAFETY: `address` came from `alloc` with `layout` and was removed
        // from the table, so it is freed once.
        unsafe { alloc::dealloc(address as *mut u8, layout) };
        Ok(())
    }

    fn allocations(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Layout>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fill `bytes` bytes at `address` with `value`.
    ///
    /// # Safety
    ///
    /// The range must be valid for writes.
    pub unsafe fn set_memory(&self, address: usize, bytes: usize, value: u8) -> Result<()> {
        self.enter("set_memory")?;
        unsafe { ptr::write_bytes(address as *mut u8, value, bytes) };
        Ok(())
    }

    /// Copy `bytes` bytes. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for the access.
    pub unsafe fn copy_memory(&self, src: usize, dst: usize, bytes: usize) -> Result<()> {
        self.enter("copy_memory")?;
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        Ok(())
    }

    /// # Safety
    ///
    /// `address` must be valid for reading a `T`, which may be unaligned.
    pub unsafe fn get<T: Copy>(&self, address: usize) -> Result<T> {
        self.enter("get")?;
        Ok(unsafe { ptr::read_unaligned(address as *const T) })
    }

    /// # Safety
    ///
    /// `address` must be valid for writing a `T`, which may be unaligned.
    pub unsafe fn put<T: Copy>(&self, address: usize, value: T) -> Result<()> {
        self.enter("put")?;
        unsafe { ptr::write_unaligned(address as *mut T, value) };
        Ok(())
    }

    /// # Safety
    ///
    /// `address` must be valid and aligned for reading a `T`.
    pub unsafe fn get_volatile<T: Copy>(&self, address: usize) -> Result<T> {
        self.enter("get_volatile")?;
        Ok(unsafe { ptr::read_volatile(address as *const T) })
    }

    /// # Safety
    ///
    /// `address` must be valid and aligned for writing a `T`.
    pub unsafe fn put_volatile<T: Copy>(&self, address: usize, value: T) -> Result<()> {
        self.enter("put_volatile")?;
        unsafe { ptr::write_volatile(address as *mut T, value) };
        Ok(())
    }

    /// Store with release ordering relative to earlier writes.
    ///
    /// # Safety
    ///
    /// `address` must be valid and aligned for writing a `T`.
    pub unsafe fn put_ordered<T: Copy>(&self, address: usize, value: T) -> Result<()> {
        self.enter("put_ordered")?;
        atomic::fence(Ordering::Release);
        unsafe { ptr::write_volatile(address as *mut T, value) };
        Ok(())
    }

    /// # Safety
    ///
    /// `address` must be valid for reading a `usize`.
    pub unsafe fn get_address(&self, address: usize) -> Result<usize> {
        self.enter("get_address")?;
        Ok(unsafe { ptr::read_unaligned(address as *const usize) })
    }

    /// # Safety
    ///
    /// `address` must be valid for writing a `usize`.
    pub unsafe fn put_address(&self, address: usize, value: usize) -> Result<()> {
        self.enter("put_address")?;
        unsafe { ptr::write_unaligned(address as *mut usize, value) };
        Ok(())
    }

    /// # Safety
    ///
    /// `address` must be valid and aligned for an `i32`, and only accessed
    /// atomically while other threads may use it.
    pub unsafe fn compare_and_swap_int(&self, address: usize, expected: i32, new: i32) -> Result<bool> {
        self.enter("compare_and_swap_int")?;
        let cell = unsafe { AtomicI32::from_ptr(address as *mut i32) };
        Ok(cell
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// # Safety
    ///
    /// As [`compare_and_swap_int`](Self::compare_and_swap_int), for `i64`.
    pub unsafe fn compare_and_swap_long(&self, address: usize, expected: i64, new: i64) -> Result<bool> {
        self.enter("compare_and_swap_long")?;
        let cell = unsafe { AtomicI64::from_ptr(address as *mut i64) };
        Ok(cell
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Returns the previous value.
    ///
    /// # Safety
    ///
    /// As [`compare_and_swap_int`](Self::compare_and_swap_int).
    pub unsafe fn get_and_add_int(&self, address: usize, delta: i32) -> Result<i32> {
        self.enter("get_and_add_int")?;
        Ok(unsafe { AtomicI32::from_ptr(address as *mut i32) }.fetch_add(delta, Ordering::SeqCst))
    }

    /// # Safety
    ///
    /// As [`compare_and_swap_long`](Self::compare_and_swap_long).
    pub unsafe fn get_and_add_long(&self, address: usize, delta: i64) -> Result<i64> {
        self.enter("get_and_add_long")?;
        Ok(unsafe { AtomicI64::from_ptr(address as *mut i64) }.fetch_add(delta, Ordering::SeqCst))
    }

    /// # Safety
    ///
    /// As [`compare_and_swap_int`](Self::compare_and_swap_int).
    pub unsafe fn get_and_set_int(&self, address: usize, value: i32) -> Result<i32> {
        self.enter("get_and_set_int")?;
        Ok(unsafe { AtomicI32::from_ptr(address as *mut i32) }.swap(value, Ordering::SeqCst))
    }

    /// # Safety
    ///
    /// As [`compare_and_swap_long`](Self::compare_and_swap_long).
    pub unsafe fn get_and_set_long(&self, address: usize, value: i64) -> Result<i64> {
        self.enter("get_and_set_long")?;
        Ok(unsafe { AtomicI64::from_ptr(address as *mut i64) }.swap(value, Ordering::SeqCst))
    }

    /// Offset of the first element of a `[T]`. Slices have no header.
    pub fn array_base_offset<T>(&self) -> Result<usize> {
        self.enter("array_base_offset")?;
        Ok(0)
    }

    /// Distance between consecutive elements of a `[T]`.
    pub fn array_index_scale<T>(&self) -> Result<usize> {
        self.enter("array_index_scale")?;
        Ok(size_of::<T>())
    }

    /// Create a `T` without running any constructor: all bytes zero.
    ///
    /// # Safety
    ///
    /// The all-zero bit pattern must be a valid `T`.
    pub unsafe fn allocate_instance<T>(&self) -> Result<Box<T>> {
        self.enter("allocate_instance")?;
        let zeroed: Box<MaybeUninit<T>> = Box::new_zeroed();
        Ok(unsafe { zeroed.assume_init() })
    }

    pub fn load_fence(&self) -> Result<()> {
        self.enter("load_fence")?;
        atomic::fence(Ordering::Acquire);
        Ok(())
    }

    pub fn store_fence(&self) -> Result<()> {
        self.enter("store_fence")?;
        atomic::fence(Ordering::Release);
        Ok(())
    }

    pub fn full_fence(&self) -> Result<()> {
        self.enter("full_fence")?;
        atomic::fence(Ordering::SeqCst);
        Ok(())
    }

    /// Park the current thread.
    ///
    /// With `absolute`, `time` is a deadline in milliseconds since the Unix
    /// epoch. Otherwise it is a timeout in nanoseconds, and 0 parks until
    /// unparked.
    pub fn park(&self, absolute: bool, time: u64) -> Result<()> {
        self.enter("park")?;
        if absolute {
            let deadline = UNIX_EPOCH + Duration::from_millis(time);
            if let Ok(wait) = deadline.duration_since(SystemTime::now()) {
                thread::park_timeout(wait);
            }
        } else if time == 0 {
            thread::park();
        } else {
            thread::park_timeout(Duration::from_nanos(time));
        }
        Ok(())
    }

    pub fn unpark(&self, thread: &Thread) -> Result<()> {
        self.enter("unpark")?;
        thread.unpark();
        Ok(())
    }
}

impl Drop for Unsafe {
    fn drop(&mut self) {
        let allocations = self.allocations.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (address, layout) in allocations.drain() {
            // SAFETY: every table entry is a live allocation owned by us.
            unsafe { alloc::dealloc(address as *mut u8, layout) };
        }
    }
}

impl fmt::Debug for Unsafe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsafe")
            .field("allocations", &self.allocations().len())
            .finish()
    }
}

#[cfg(unix)]
fn system_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

#[cfg(not(unix))]
fn system_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn instance() -> Unsafe {
        Unsafe::get_unsafe(&Runtime::new()).unwrap()
    }

    #[test]
    fn test_sizes() {
        let u = instance();
        assert_eq!(u.address_size().unwrap(), size_of::<usize>());
        assert!(u.page_size().unwrap().is_power_of_two());
        assert_eq!(u.array_base_offset::<u64>().unwrap(), 0);
        assert_eq!(u.array_index_scale::<u64>().unwrap(), 8);
    }

    #[test]
    fn test_allocate_write_read_free() {
        let u = instance();
        let addr = u.allocate_memory(64).unwrap();
        unsafe {
            u.set_memory(addr, 64, 0).unwrap();
            u.put::<u32>(addr + 1, 0xDEAD_BEEF).unwrap();
            assert_eq!(u.get::<u32>(addr + 1).unwrap(), 0xDEAD_BEEF);
            u.copy_memory(addr + 1, addr + 32, 4).unwrap();
            assert_eq!(u.get::<u32>(addr + 32).unwrap(), 0xDEAD_BEEF);
            u.put_address(addr + 40, addr).unwrap();
            assert_eq!(u.get_address(addr + 40).unwrap(), addr);
        }

        let bigger = u.reallocate_memory(addr, 4096).unwrap();
        assert_eq!(unsafe { u.get::<u32>(bigger + 32).unwrap() }, 0xDEAD_BEEF);
        u.free_memory(bigger).unwrap();
        assert!(matches!(u.free_memory(bigger), Err(UnsafeError::UnknownAddress(_))));
        assert_eq!(u.allocate_memory(0).unwrap(), 0);
        u.free_memory(0).unwrap();
    }

    #[test]
    fn test_atomics() {
        let u = instance();
        let addr = u.allocate_memory(16).unwrap();
        unsafe {
            u.put_volatile::<i32>(addr, 5).unwrap();
            assert!(u.compare_and_swap_int(addr, 5, 6).unwrap());
            assert!(!u.compare_and_swap_int(addr, 5, 7).unwrap());
            assert_eq!(u.get_and_add_int(addr, 4).unwrap(), 6);
            assert_eq!(u.get_and_set_int(addr, -1).unwrap(), 10);
            assert_eq!(u.get_volatile::<i32>(addr).unwrap(), -1);

            u.put_ordered::<i64>(addr + 8, 1).unwrap();
            assert!(u.compare_and_swap_long(addr + 8, 1, 2).unwrap());
            assert_eq!(u.get_and_add_long(addr + 8, 3).unwrap(), 2);
            assert_eq!(u.get_and_set_long(addr + 8, 0).unwrap(), 5);
        }
        u.full_fence().unwrap();
        u.load_fence().unwrap();
        u.store_fence().unwrap();
    }

    #[test]
    fn test_allocate_instance_is_zeroed() {
        #[derive(Debug, PartialEq)]
        struct Point {
            x: i64,
            y: i64,
        }
        let u = instance();
        let point: Box<Point> = unsafe { u.allocate_instance().unwrap() };
        assert_eq!(*point, Point { x: 0, y: 0 });
    }

    #[test]
    fn test_park_and_unpark() {
        let u = Arc::new(instance());
        u.park(false, 1_000).unwrap();
        u.park(true, 0).unwrap();

        let parker = {
            let u = Arc::clone(&u);
            thread::spawn(move || u.park(false, 0).unwrap())
        };
        while !parker.is_finished() {
            u.unpark(parker.thread()).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        parker.join().unwrap();
    }
}
