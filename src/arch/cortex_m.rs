//! Cortex-M port for ARMv7-M and ARMv8-M mainline
//!
//! The gate is BASEPRI, the switch trap is PendSV and the clock is SysTick.
//! A global allocator is required. On targets with an FPU, the FPU context is
//! switched lazily: a task touching the FPU without access takes a UsageFault
//! (NOCP), whose handler must call [`usage_fault`].
//!
//! ```no_run
//! // Build-only example
//!
//! #![no_main]
//! #![no_std]
//!
//! use cortex_m::Peripherals;
//! use cortex_m_rt::{entry, exception};
//!
//! use minisched_cortex_m::*;
//! use minisched_cortex_m::arch::cortex_m::{systick, usage_fault, CortexM};
//!
//! #[entry]
//! fn main() -> ! {
//!     let mut cmperi = Peripherals::take().unwrap();
//!
//!     let arch = CortexM::new(1_000);
//!     arch.configure_systick(&mut cmperi.SYST, 64_000_000);
//!
//!     let k = Kernel::new(arch, Config::default()).into_static();
//!     k.create(|k| loop { k.sleep_for(500_000); }, 512, "blink", TaskFlags::empty(), 1);
//!
//!     match k.run() {}
//! }
//!
//! #[exception]
//! fn SysTick() {
//!     systick();
//! }
//!
//! #[exception]
//! fn UsageFault() {
//!     usage_fault();
//! }
//! ```

#[cfg(not(minisched_basepri))]
compile_error!("the Cortex-M port needs BASEPRI (thumbv7m, thumbv7em or thumbv8m.main)");

use core::arch::{asm, global_asm};
use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m::register::{basepri, basepri_max};

use crate::arch::{Arch, InterruptGate, IrqLevel};
use crate::kernel::Kernel;
use crate::memory::{Heap, TaskHeap, TaskMem};
use crate::task::TaskId;
use crate::{k_assert, k_panic};

//

/*
Task stack at a switch, from the saved sp upward

0-9: [context preservation by SW at PendSV]
    R3(unused) R4  R5  R6  R7  R8  R9  R10  R11  LR(exc)
10-17: [Basic frame saved by HW at exception entry]
    R0      R1      R2      R3      R12     LR(R14) RetAddr xPSR

Automatic FP state preservation is off, so frames are always basic; the FPU
registers are moved by the UsageFault handler to and from the owners' save areas.
*/

const SW_FRAME: usize = 10;
const HW_FRAME: usize = 8;

// return to Thread mode, Process stack, Basic frame
const EXC_RETURN_THREAD_PSP: usize = 0xffff_fffd;
const XPSR_THUMB: usize = 0x0100_0000;

// upper 3 bits of an 8-bit priority field
const PRIO_PENDSV: u8 = 0xe0;
const PRIO_SYSTICK: u8 = 0xc0;

const FPCCR: *mut u32 = 0xe000_ef34 as *mut u32;
const FPCCR_ASPEN_LSPEN: u32 = 0b11 << 30;

const CFSR: *mut u32 = 0xe000_ed28 as *mut u32;
const CFSR_NOCP: u32 = 1 << 19;

const SHCSR_USGFAULTENA: u32 = 1 << 18;

static KERNEL: spin::Once<&'static Kernel<CortexM>> = spin::Once::new();

global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r3-r11, lr}}",
    "    bl minisched_switch",
    "    ldmia r0!, {{r3-r11, lr}}",
    "    msr psp, r0",
    "    bx lr",
);

#[no_mangle]
extern "C" fn minisched_switch(sp: usize) -> usize
{
    match KERNEL.get() {
        Some(k) => k.pick_next(CortexMContext(sp)).0,
        None => sp
    }
}

extern "C" fn task_start(kernel: &'static Kernel<CortexM>, raw_id: u32) -> !
{
    kernel.task_main(TaskId::from_raw(raw_id))
}

extern "C" fn idle_loop() -> !
{
    let k = match KERNEL.get() {
        Some(k) => *k,
        None => k_panic!("kernel not running")
    };

    k.arch().started.store(true, Ordering::SeqCst);
    k.arch().reschedule_request();

    loop {
        cortex_m::asm::wfi(); // sleep to wait interrupt
    }
}

/// SysTick body. Call it from the application's `SysTick` exception handler.
pub fn systick()
{
    if let Some(k) = KERNEL.get() {
        let k: &'static Kernel<CortexM> = *k;

        k.arch().tick();
        k.clock_irq();
    }
}

/// UsageFault body. Call it from the application's `UsageFault` exception handler.
/// An FPU access without access rights moves the FPU to the running task;
/// any other usage fault is fatal.
pub fn usage_fault()
{
    // SAFETY: fixed SCB register
    let cfsr = unsafe { CFSR.read_volatile() };

    match KERNEL.get() {
        Some(k) if cfsr & CFSR_NOCP != 0 => {
            // SAFETY: write-one-to-clear, only NOCP is cleared
            unsafe { CFSR.write_volatile(CFSR_NOCP) }
            k.fpu_trap();
        }
        _ => k_panic!("usage fault, CFSR {:#010x}", cfsr)
    }
}

//

fn level_to_basepri(level: IrqLevel) -> u8
{
    if level.0 == 0 {
        0
    }
    else {
        k_assert!(level.0 < 8);
        (8 - level.0) << 5
    }
}

fn basepri_to_level(bp: u8) -> IrqLevel
{
    if bp == 0 {
        IrqLevel::NONE
    }
    else {
        IrqLevel(8 - (bp >> 5))
    }
}

/// Saved context: the task's process stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CortexMContext(usize);

/// Cortex-M architecture
pub struct CortexM
{
    tick_us: u32,
    ticks_lo: AtomicU32,
    ticks_hi: AtomicU32,
    started: AtomicBool,
    idle_mem: spin::Once<TaskMem>,
    dma_heap: Option<&'static TaskHeap>
}

impl CortexM
{
    /// `tick_us`: SysTick period in microseconds.
    pub fn new(tick_us: u32) -> CortexM
    {
        k_assert!(tick_us > 0);

        CortexM {
            tick_us,
            ticks_lo: AtomicU32::new(0),
            ticks_hi: AtomicU32::new(0),
            started: AtomicBool::new(false),
            idle_mem: spin::Once::new(),
            dma_heap: None
        }
    }

    /// Heap of DMA-capable memory, for tasks created with
    /// [`TaskFlags::DMA_STACK`](crate::TaskFlags::DMA_STACK). Without one,
    /// every task block comes from the global allocator.
    pub fn with_dma_heap(mut self, heap: &'static TaskHeap) -> CortexM
    {
        self.dma_heap = Some(heap);
        self
    }

    /// Programs SysTick for one interrupt per tick off the core clock.
    pub fn configure_systick(&self, syst: &mut SYST, core_hz: u32)
    {
        let reload = (core_hz / 1_000_000) * self.tick_us - 1;
        k_assert!(reload <= 0x00ff_ffff, "tick of {}us does not fit SysTick", self.tick_us);

        syst.set_clock_source(SystClkSource::Core);
        syst.set_reload(reload);
        syst.clear_current();
        syst.enable_counter();
        syst.enable_interrupt();
    }

    // single writer: the SysTick handler
    fn tick(&self)
    {
        let lo = self.ticks_lo.load(Ordering::Relaxed).wrapping_add(1);
        self.ticks_lo.store(lo, Ordering::Release);
        if lo == 0 {
            let hi = self.ticks_hi.load(Ordering::Relaxed) + 1;
            self.ticks_hi.store(hi, Ordering::Release);
        }
    }

    fn ticks(&self) -> u64
    {
        loop {
            let hi = self.ticks_hi.load(Ordering::Acquire);
            let lo = self.ticks_lo.load(Ordering::Acquire);
            if hi == self.ticks_hi.load(Ordering::Acquire) {
                return ((hi as u64) << 32) | lo as u64;
            }
        }
    }
}

impl InterruptGate for CortexM
{
    fn raise(&self, level: IrqLevel) -> IrqLevel
    {
        let prev = basepri_to_level(basepri::read());
        basepri_max::write(level_to_basepri(level));
        prev
    }

    fn restore(&self, prev: IrqLevel)
    {
        // SAFETY: only ever restores a level taken by raise or lower
        unsafe { basepri::write(level_to_basepri(prev)) }
        cortex_m::asm::isb();
    }

    fn lower(&self) -> IrqLevel
    {
        let prev = basepri_to_level(basepri::read());
        // SAFETY: unmasking lets a pending PendSV switch away right here
        unsafe { basepri::write(0) }
        cortex_m::asm::isb();
        prev
    }

    fn can_block(&self) -> bool
    {
        self.started.load(Ordering::Relaxed) && SCB::vect_active() == VectActive::ThreadMode
    }
}

impl Arch for CortexM
{
    type Context = CortexMContext;
    type Exit = Infallible;

    const MIN_STACK_SIZE: usize = 256;
    const STACK_ALIGN: usize = 8;
    // S0-S31, FPSCR and a pad word
    const FPU_CTX_SIZE: usize = if cfg!(minisched_fpu) {34 * 4} else {0};
    const REDZONE_SIZE: usize = 32;

    fn now_us(&self) -> u64
    {
        self.ticks() * self.tick_us as u64
    }

    fn reschedule_request(&self)
    {
        if self.started.load(Ordering::Relaxed) {
            SCB::set_pendsv();
        }
    }

    fn boot_context(&self) -> CortexMContext
    {
        // filled in on the first switch away from idle
        CortexMContext(0)
    }

    fn init_context(&self, kernel: &'static Kernel<CortexM>, id: TaskId, mem: &mut TaskMem) -> CortexMContext
    {
        let top = mem.stack_top() as usize & !7;
        let sp = (top - (SW_FRAME + HW_FRAME) * 4) as *mut usize;

        k_assert!(sp as usize >= mem.stack_bottom() as usize, "stack of {} too small", id);

        // SAFETY: the frame lies within the task's stack, which nothing else uses yet
        unsafe {
            for i in 0..(SW_FRAME + HW_FRAME) {
                sp.add(i).write_volatile(0);
            }

            sp.add(9).write_volatile(EXC_RETURN_THREAD_PSP);

            // R0, R1: arguments of task_start
            sp.add(SW_FRAME).write_volatile(kernel as *const _ as usize);
            sp.add(SW_FRAME + 1).write_volatile(id.to_raw() as usize);

            // RetAddr
            sp.add(SW_FRAME + 6).write_volatile(task_start as usize & !1);

            // xPSR: set T-bit since Cortex-M has only Thumb instructions
            sp.add(SW_FRAME + 7).write_volatile(XPSR_THUMB);
        }

        CortexMContext(sp as usize)
    }

    fn run(&self, kernel: &'static Kernel<CortexM>) -> Infallible
    {
        KERNEL.call_once(|| kernel);

        let control = cortex_m::register::control::read();
        k_assert!(control.spsel().is_msp(), "CONTROL.SPSEL: must be SP_main");

        // SAFETY: system handler registers; nothing runs at these yet
        unsafe {
            (*SCB::PTR).shpr[10].write(PRIO_PENDSV);
            (*SCB::PTR).shpr[11].write(PRIO_SYSTICK);
            (*SCB::PTR).shcsr.modify(|r| r | SHCSR_USGFAULTENA);
        }

        if cfg!(minisched_fpu) {
            // SAFETY: FP context is saved by the kernel, never stacked by HW
            unsafe { FPCCR.write_volatile(FPCCR.read_volatile() & !FPCCR_ASPEN_LSPEN) }
            self.fpu_enable(false);
        }

        let mem = self.idle_mem.call_once(|| {
            TaskMem::new(Self::REDZONE_SIZE, Self::MIN_STACK_SIZE * 2, 0, Self::STACK_ALIGN, &Heap)
        });
        let top = mem.stack_top() as usize & !7;

        // SAFETY: moves thread mode onto the idle stack and never comes back
        unsafe {
            asm!(
                "msr psp, {top}",
                "mrs {tmp}, control",
                "orr {tmp}, {tmp}, #2",
                "msr control, {tmp}",
                "isb",
                "bl {idle}",
                top = in(reg) top,
                tmp = out(reg) _,
                idle = sym idle_loop,
                options(noreturn)
            )
        }
    }

    fn exit_current(&self, _returned: bool) -> !
    {
        loop {
            self.reschedule_request();
            self.lower();
        }
    }

    fn task_heap(kernel: &'static Kernel<Self>, dma: bool) -> &'static TaskHeap
    {
        match kernel.arch().dma_heap {
            Some(heap) if dma => heap,
            _ => &Heap
        }
    }

    fn fpu_enable(&self, on: bool)
    {
        if cfg!(minisched_fpu) {
            // CP10 and CP11 full access
            const CP10_CP11: u32 = 0b1111 << 20;

            // SAFETY: CPACR only gates the coprocessors
            unsafe {
                (*SCB::PTR).cpacr.modify(|r| if on {r | CP10_CP11} else {r & !CP10_CP11});
            }
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
        }
    }

    #[cfg(minisched_fpu)]
    fn fpu_save(&self, area: &mut [u8])
    {
        k_assert!(area.len() >= 33 * 4);

        // SAFETY: area holds S0-S31 and FPSCR; the trap enabled the FPU
        unsafe {
            asm!(
                "vstmia {p}, {{s0-s31}}",
                "vmrs {t}, fpscr",
                "str {t}, [{p}, #128]",
                p = in(reg) area.as_mut_ptr(),
                t = out(reg) _,
                options(nostack)
            );
        }
    }

    #[cfg(minisched_fpu)]
    fn fpu_restore(&self, area: &[u8])
    {
        k_assert!(area.len() >= 33 * 4);

        // SAFETY: see fpu_save
        unsafe {
            asm!(
                "vldmia {p}, {{s0-s31}}",
                "ldr {t}, [{p}, #128]",
                "vmsr fpscr, {t}",
                p = in(reg) area.as_ptr(),
                t = out(reg) _,
                // S16-S31 are the task's; kernel code never holds values there
                clobber_abi("C"),
                options(nostack)
            );
        }
    }

    fn stack_guard(&self, mem: Option<&TaskMem>)
    {
        if let Some(mem) = mem {
            k_assert!(mem.redzone_intact(), "stack overflow into red zone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basepri_levels() {
        assert_eq!(level_to_basepri(IrqLevel::NONE), 0);
        assert_eq!(level_to_basepri(IrqLevel::SWITCH), PRIO_PENDSV);
        assert_eq!(level_to_basepri(IrqLevel::CLOCK), PRIO_SYSTICK);
        assert_eq!(basepri_to_level(PRIO_SYSTICK), IrqLevel::SCHED);
        assert_eq!(basepri_to_level(0), IrqLevel::NONE);
    }
}
