use core::alloc::GlobalAlloc;
use core::ptr::NonNull;

use alloc::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use num_integer::Integer;

use crate::k_assert;

//

pub(crate) fn align_up(x: usize, align: usize) -> usize
{
    Integer::div_ceil(&x, &align) * align
}

/// Fill byte of a fresh stack
pub const STACK_FILL: u8 = 0xbb;

/// Fill byte of the red zone below the stack
pub const REDZONE_FILL: u8 = 0xa5;

//

/// Allocator a task block comes from
pub type TaskHeap = dyn GlobalAlloc + Sync;

/// The global allocator, as a [`TaskHeap`]
pub struct Heap;

unsafe impl GlobalAlloc for Heap
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8
    {
        alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout)
    {
        dealloc(ptr, layout)
    }
}

//

/// Per-task memory block
///
/// One allocation holding, from low to high addresses:
///
/// ```text
/// +---------------+ <- base
/// | red zone      |
/// +---------------+ <- stack_bottom
/// | stack         |
/// +---------------+ <- stack_top (initial sp)
/// | FPU save area |    (optional)
/// +---------------+
/// ```
///
/// The kernel owns the block for the whole life of the task; it is released
/// by `join` or by the task manager once the task is a zombie, back to the
/// heap it came from.
pub struct TaskMem
{
    base: NonNull<u8>,
    layout: Layout,
    redzone: usize,
    stack_top: usize,
    fpu_len: usize,
    heap: &'static TaskHeap
}

// SAFETY: the block is plain bytes exclusively owned by this handle;
// shared references only read it.
unsafe impl Send for TaskMem {}
unsafe impl Sync for TaskMem {}

impl TaskMem
{
    /// Allocates a block from `heap`. Sizes are rounded up to `align`.
    /// Allocation failure is fatal.
    pub fn new(redzone: usize, stack_size: usize, fpu_len: usize, align: usize, heap: &'static TaskHeap) -> TaskMem
    {
        k_assert!(align.is_power_of_two(), "stack alignment {} not a power of two", align);

        let redzone = align_up(redzone, align);
        let stack_size = align_up(stack_size.max(align), align);
        let fpu_len = align_up(fpu_len, align);
        let total = redzone + stack_size + fpu_len;

        let layout = match Layout::from_size_align(total, align) {
            Ok(layout) => layout,
            Err(_) => crate::k_panic!("task block of {} bytes not representable", total)
        };

        // SAFETY: layout has a non-zero size
        let base = match NonNull::new(unsafe { heap.alloc(layout) }) {
            Some(base) => base,
            None => handle_alloc_error(layout)
        };

        let mut mem = TaskMem {
            base,
            layout,
            redzone,
            stack_top: redzone + stack_size,
            fpu_len,
            heap
        };

        let (rz, rest) = mem.bytes_mut().split_at_mut(redzone);
        rz.fill(REDZONE_FILL);
        rest.fill(STACK_FILL);

        mem
    }

    fn bytes_mut(&mut self) -> &mut [u8]
    {
        // SAFETY: base points to layout.size() bytes owned by self
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.layout.size()) }
    }

    fn bytes(&self) -> &[u8]
    {
        // SAFETY: see bytes_mut
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.layout.size()) }
    }

    pub fn stack_size(&self) -> usize
    {
        self.stack_top - self.redzone
    }

    /// Lowest usable stack address
    pub fn stack_bottom(&self) -> *mut u8
    {
        // SAFETY: redzone < layout.size()
        unsafe { self.base.as_ptr().add(self.redzone) }
    }

    /// Initial stack pointer; stacks grow down from here
    pub fn stack_top(&self) -> *mut u8
    {
        // SAFETY: stack_top <= layout.size()
        unsafe { self.base.as_ptr().add(self.stack_top) }
    }

    pub fn redzone(&self) -> &[u8]
    {
        &self.bytes()[..self.redzone]
    }

    pub fn redzone_intact(&self) -> bool
    {
        self.redzone().iter().all(|b| *b == REDZONE_FILL)
    }

    pub fn fpu_area_mut(&mut self) -> Option<&mut [u8]>
    {
        if self.fpu_len == 0 {
            return None;
        }

        let (start, end) = (self.stack_top, self.stack_top + self.fpu_len);
        Some(&mut self.bytes_mut()[start..end])
    }

    #[cfg(test)]
    fn total_size(&self) -> usize
    {
        self.layout.size()
    }
}

impl Drop for TaskMem
{
    fn drop(&mut self)
    {
        // SAFETY: allocated from this heap in new() with this layout
        unsafe { self.heap.dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(AtomicUsize);

    unsafe impl GlobalAlloc for Counted
    {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8
        {
            self.0.fetch_add(layout.size(), Ordering::SeqCst);
            Heap.alloc(layout)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout)
        {
            self.0.fetch_sub(layout.size(), Ordering::SeqCst);
            Heap.dealloc(ptr, layout)
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(250, 16), 256);
    }

    #[test]
    fn test_layout() {
        let mut mem = TaskMem::new(32, 250, 136, 8, &Heap);

        assert_eq!(mem.stack_size(), 256);
        assert_eq!(mem.redzone().len(), 32);
        assert_eq!(mem.total_size(), 32 + 256 + 136);
        assert_eq!(mem.stack_bottom() as usize % 8, 0);
        assert_eq!(mem.stack_top() as usize - mem.stack_bottom() as usize, 256);
        assert!(mem.redzone_intact());

        let top = mem.stack_top() as usize;
        let fpu = mem.fpu_area_mut().unwrap();
        assert_eq!(fpu.len(), 136);
        assert_eq!(fpu.as_ptr() as usize, top);
        assert!(fpu.iter().all(|b| *b == STACK_FILL));
    }

    #[test]
    fn test_no_fpu_area() {
        let mut mem = TaskMem::new(0, 64, 0, 8, &Heap);
        assert!(mem.fpu_area_mut().is_none());
        assert!(mem.redzone_intact());
    }

    #[test]
    fn test_block_returns_to_its_heap() {
        static HEAP: Counted = Counted(AtomicUsize::new(0));

        let mem = TaskMem::new(16, 100, 8, 8, &HEAP);
        assert_eq!(HEAP.0.load(Ordering::SeqCst), 16 + 104 + 8);

        drop(mem);
        assert_eq!(HEAP.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tiny_stack_rounded() {
        let mem = TaskMem::new(16, 0, 0, 8, &Heap);
        assert_eq!(mem.stack_size(), 8);
    }
}
