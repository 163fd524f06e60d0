//! Architecture collaborator interface
//!
//! The portable kernel needs three things from below: a monotonic
//! microsecond clock, a way to request and perform a context switch, and an
//! interrupt-priority mask (the *gate*). The gate is the only mutual
//! exclusion the kernel uses.

#[cfg(feature = "std")]
pub mod host;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m;

use crate::kernel::Kernel;
use crate::memory::{Heap, TaskHeap, TaskMem};
use crate::task::TaskId;

/// Interrupt-priority threshold. A level masks every source at or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IrqLevel(pub u8);

impl IrqLevel
{
    /// Nothing masked.
    pub const NONE: IrqLevel = IrqLevel(0);
    /// Masks the context switch trap.
    pub const SWITCH: IrqLevel = IrqLevel(1);
    /// Masks everything that touches scheduler state.
    pub const SCHED: IrqLevel = IrqLevel(2);
    /// Priority of the clock interrupt.
    pub const CLOCK: IrqLevel = IrqLevel(2);
}

/// Interrupt-priority masking primitive
pub trait InterruptGate
{
    /// Raises the mask to at least `level`; returns the previous level.
    /// Never lowers the mask.
    fn raise(&self, level: IrqLevel) -> IrqLevel;

    /// Puts back a level returned by `raise` or `lower`.
    fn restore(&self, prev: IrqLevel);

    /// Unmasks everything; returns the previous level. A pending switch
    /// trap is taken before this returns.
    fn lower(&self) -> IrqLevel;

    /// `false` in interrupt context and before the kernel runs.
    fn can_block(&self) -> bool;
}

/// Per-target support the kernel is generic over
pub trait Arch: InterruptGate + Sized + Send + Sync + 'static
{
    /// Saved execution context of a task that is not running.
    type Context: Copy + Send;

    /// What [`Kernel::run`] returns, if it returns at all.
    type Exit;

    const MIN_STACK_SIZE: usize;
    const STACK_ALIGN: usize;
    /// Size of the floating-point save area reserved for `FPU` tasks.
    const FPU_CTX_SIZE: usize;
    /// Size of the guard region below each stack.
    const REDZONE_SIZE: usize;

    fn now_us(&self) -> u64;

    /// Pends the switch trap. Never blocks; callable from any context.
    fn reschedule_request(&self);

    /// Context of the code that calls [`Kernel::run`], which becomes the idle task.
    fn boot_context(&self) -> Self::Context;

    /// Builds the first context of a task so that its first dispatch enters
    /// [`Kernel::task_main`] with `id`.
    fn init_context(&self, kernel: &'static Kernel<Self>, id: TaskId, mem: &mut TaskMem) -> Self::Context;

    /// Starts dispatching; the caller continues as the idle task.
    fn run(&self, kernel: &'static Kernel<Self>) -> Self::Exit;

    /// Switches away from a task that became a zombie, for good.
    /// Called with the gate raised. `returned`: the task body returned, so
    /// no frame of it is left on the stack.
    fn exit_current(&self, returned: bool) -> !;

    /// A zombie's context is reclaimed and will never be dispatched again.
    fn release_context(&self, _ctx: Self::Context)
    {
    }

    /// Heap for task memory; `dma` asks for DMA-capable memory.
    fn task_heap(_kernel: &'static Kernel<Self>, _dma: bool) -> &'static TaskHeap
    {
        &Heap
    }

    /// Grants or revokes FPU access for the running task. Set on every
    /// switch to whether the incoming task owns the FPU registers; a task
    /// without access that touches the FPU must enter [`Kernel::fpu_trap`].
    fn fpu_enable(&self, _on: bool)
    {
    }

    fn fpu_ctx_init(&self, area: &mut [u8])
    {
        area.fill(0);
    }

    /// Stores the FPU registers into a save area.
    fn fpu_save(&self, _area: &mut [u8])
    {
    }

    /// Loads the FPU registers from a save area.
    fn fpu_restore(&self, _area: &[u8])
    {
    }

    /// Arms the stack guard for the incoming task; `None` for the idle task.
    fn stack_guard(&self, _mem: Option<&TaskMem>)
    {
    }
}
