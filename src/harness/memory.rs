//! Buffers handed to test cases for memory registration.
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ffi::CStr;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::LazyLock;
use std::{fmt, mem, slice};

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    size if size > 0 => size as usize,
    _ => 4096,
});

/// The size of a virtual memory page on this host.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// The smallest alignment a caller may request.
pub const MIN_ALIGNMENT: usize = mem::size_of::<usize>();

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AllocateBufferError {
    #[error("buffer length must be non-zero")]
    ZeroLength,
    #[error("alignment {0} is not a power of two")]
    AlignmentNotPowerOfTwo(usize),
    #[error("alignment {alignment} is below the minimum of {minimum}")]
    AlignmentTooSmall { alignment: usize, minimum: usize },
    #[error("buffer of {len} bytes with alignment {alignment} is not representable")]
    TooLarge { len: usize, alignment: usize },
}

enum Backing {
    Heap(Layout),
    Shared(OwnedFd),
}

/// A zero-filled block of memory owned by the test case. The memory is released when the block is
/// dropped, any memory region still registered over it becomes dangling.
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
    backing: Backing,
}

unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

fn check_layout(len: usize, alignment: usize) -> Result<Layout, AllocateBufferError> {
    if len == 0 {
        return Err(AllocateBufferError::ZeroLength);
    }
    if !alignment.is_power_of_two() {
        return Err(AllocateBufferError::AlignmentNotPowerOfTwo(alignment));
    }
    if alignment < MIN_ALIGNMENT {
        return Err(AllocateBufferError::AlignmentTooSmall {
            alignment,
            minimum: MIN_ALIGNMENT,
        });
    }
    Layout::from_size_align(len, alignment).map_err(|_| AllocateBufferError::TooLarge { len, alignment })
}

pub(crate) fn pages_to_bytes(pages: usize) -> Result<usize, AllocateBufferError> {
    pages.checked_mul(page_size()).ok_or(AllocateBufferError::TooLarge {
        len: usize::MAX,
        alignment: page_size(),
    })
}

impl MemoryBlock {
    /// Allocate `len` bytes from the heap. Exhausting memory aborts the process.
    pub(crate) fn heap(len: usize, alignment: usize) -> Result<Self, AllocateBufferError> {
        let layout = check_layout(len, alignment)?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap_or_else(|| handle_alloc_error(layout));

        Ok(MemoryBlock {
            ptr,
            len,
            alignment,
            backing: Backing::Heap(layout),
        })
    }

    /// Map `len` bytes of a memfd, so the same pages can be mapped by another process. Failing to
    /// create or map the file aborts the process just like heap exhaustion does.
    pub(crate) fn shared(len: usize) -> Result<Self, AllocateBufferError> {
        let alignment = page_size();
        let layout = check_layout(len, alignment)?;

        const NAME: &CStr = c"verbs-harness-block";
        let fd = unsafe { libc::memfd_create(NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            log::error!("memfd_create failed: {}", std::io::Error::last_os_error());
            handle_alloc_error(layout);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            log::error!("ftruncate to {len} bytes failed: {}", std::io::Error::last_os_error());
            handle_alloc_error(layout);
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::error!("mmap of {len} shared bytes failed: {}", std::io::Error::last_os_error());
            handle_alloc_error(layout);
        }

        Ok(MemoryBlock {
            ptr: NonNull::new(addr.cast()).unwrap_or_else(|| handle_alloc_error(layout)),
            len,
            alignment,
            backing: Backing::Shared(fd),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The start address, as used in scatter/gather entries and remote addresses.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Blocks are never empty, zero-length requests are rejected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of pages the block spans, rounded up.
    pub fn pages(&self) -> usize {
        self.len.div_ceil(page_size())
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    /// The memfd backing a shared block.
    pub fn memfd(&self) -> Option<BorrowedFd<'_>> {
        match &self.backing {
            Backing::Shared(fd) => Some(fd.as_fd()),
            Backing::Heap(_) => None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The whole block as a [`MemorySpan`].
    pub fn span(&self) -> MemorySpan<'_> {
        MemorySpan {
            ptr: self.ptr,
            len: self.len,
            _block: PhantomData,
        }
    }

    /// A view of `len` bytes starting at `offset`, `None` when it does not fit inside the block.
    pub fn subblock(&self, offset: usize, len: usize) -> Option<MemorySpan<'_>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(MemorySpan {
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
            _block: PhantomData,
        })
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap(layout) => unsafe { dealloc(self.ptr.as_ptr(), *layout) },
            Backing::Shared(_) => {
                if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
                    log::warn!("munmap of {} shared bytes failed: {}", self.len, std::io::Error::last_os_error());
                }
            },
        }
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// A borrowed byte range inside a [`MemoryBlock`], the unit of memory registration.
#[derive(Debug, Clone, Copy)]
pub struct MemorySpan<'m> {
    ptr: NonNull<u8>,
    len: usize,
    _block: PhantomData<&'m MemoryBlock>,
}

impl MemorySpan<'_> {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'m> From<&'m MemoryBlock> for MemorySpan<'m> {
    fn from(block: &'m MemoryBlock) -> Self {
        block.span()
    }
}
