//! Deterministic single-core simulation on a hosted OS
//!
//! Every task is backed by an OS thread, but exactly one context (a task, or
//! the thread that called [`Kernel::run`], acting as the idle task) executes
//! at any time: a baton names the running context and a context switch hands
//! it over. Time is simulated; it only moves while the idle task waits for an
//! interrupt, or while a task calls [`HostArch::busy`].
//!
//! ```
//! use minisched_cortex_m::*;
//!
//! let k = Kernel::new(HostArch::new(SimConfig::default()), Config::default()).into_static();
//!
//! k.create(|k| k.sleep_for(1_000), 256, "sleeper", TaskFlags::empty(), 1);
//!
//! let exit = k.run();
//! assert_eq!(exit.reason, HaltReason::AllTasksDone);
//! assert_eq!(exit.now_us, 1_000);
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::any::Any;
use std::boxed::Box;
use std::format;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::vec::Vec;

use crate::arch::{Arch, InterruptGate, IrqLevel};
use crate::kernel::Kernel;
use crate::memory::{align_up, Heap, TaskHeap, TaskMem};
use crate::task::TaskId;
use crate::{k_assert, k_panic};

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig
{
    /// `None`: tickless, the clock interrupt comes at the next deadline.
    /// `Some(n)`: periodic clock every `n` µs; timers fire on the first
    /// tick at or after their deadline.
    pub tick_us: Option<u64>,
    /// The simulation stops when the clock would pass this.
    pub time_limit_us: u64,
    pub start_us: u64
}

impl Default for SimConfig
{
    fn default() -> SimConfig
    {
        SimConfig {
            tick_us: None,
            time_limit_us: 60_000_000,
            start_us: 0
        }
    }
}

impl SimConfig
{
    pub fn with_tick(mut self, tick_us: u64) -> SimConfig
    {
        k_assert!(tick_us > 0);
        self.tick_us = Some(tick_us);
        self
    }

    pub fn with_time_limit(mut self, time_limit_us: u64) -> SimConfig
    {
        self.time_limit_us = time_limit_us;
        self
    }

    pub fn with_start(mut self, start_us: u64) -> SimConfig
    {
        self.start_us = start_us;
        self
    }
}

/// Why the simulation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason
{
    /// No task other than system tasks is left alive.
    AllTasksDone,
    /// Nothing is ready and no timer is armed: no task can ever run again.
    Idle,
    TimeLimit,
    /// A task called [`HostArch::shutdown`].
    Shutdown
}

/// Returned by [`Kernel::run`] on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimExit
{
    pub now_us: u64,
    pub reason: HaltReason
}

/// Saved context: the id of the thread backing the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostContext(usize);

const BOOT_CTX: usize = 0;

// S0-S31, FPSCR and a pad word
const FPU_REGS: usize = 34;

#[derive(Debug, Clone, Copy)]
enum Stop
{
    Halt(HaltReason),
    Panicked
}

struct Baton
{
    running: usize,
    stop: Option<Stop>,
    // zombies whose task was reclaimed
    released: Vec<usize>,
    // after a stop, contexts unwind one at a time
    retiring: Option<usize>
}

// payload of the unwinds that retire a context quietly
struct Retire;

/// DMA-capable memory of the simulation: the global heap, with the bytes in
/// use counted.
struct DmaHeap
{
    in_use: AtomicUsize
}

unsafe impl GlobalAlloc for DmaHeap
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8
    {
        let p = Heap.alloc(layout);
        if !p.is_null() {
            self.in_use.fetch_add(layout.size(), Ordering::SeqCst);
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout)
    {
        self.in_use.fetch_sub(layout.size(), Ordering::SeqCst);
        Heap.dealloc(ptr, layout)
    }
}

//

/// Host simulation architecture
pub struct HostArch
{
    sim: SimConfig,
    clock: AtomicU64,
    level: AtomicU8,
    switch_pending: AtomicBool,
    clock_pending: AtomicBool,
    irq_depth: AtomicU32,
    started: AtomicBool,
    fpu_on: AtomicBool,
    fpu_regs: StdMutex<[u32; FPU_REGS]>,
    dma: DmaHeap,
    next_ctx: AtomicUsize,
    baton: StdMutex<Baton>,
    turn: Condvar,
    panicked: StdMutex<Option<Box<dyn Any + Send>>>,
    threads: StdMutex<Vec<(usize, JoinHandle<()>)>>,
    kernel: spin::Once<&'static Kernel<HostArch>>
}

fn unpoison<'a, T>(r: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T>
{
    r.unwrap_or_else(PoisonError::into_inner)
}

impl HostArch
{
    pub fn new(sim: SimConfig) -> HostArch
    {
        HostArch {
            clock: AtomicU64::new(sim.start_us),
            sim,
            level: AtomicU8::new(IrqLevel::NONE.0),
            switch_pending: AtomicBool::new(false),
            clock_pending: AtomicBool::new(false),
            irq_depth: AtomicU32::new(0),
            started: AtomicBool::new(false),
            fpu_on: AtomicBool::new(false),
            fpu_regs: StdMutex::new([0; FPU_REGS]),
            dma: DmaHeap {
                in_use: AtomicUsize::new(0)
            },
            next_ctx: AtomicUsize::new(BOOT_CTX + 1),
            baton: StdMutex::new(Baton {
                running: BOOT_CTX,
                stop: None,
                released: Vec::new(),
                retiring: None
            }),
            turn: Condvar::new(),
            panicked: StdMutex::new(None),
            threads: StdMutex::new(Vec::new()),
            kernel: spin::Once::new()
        }
    }

    pub fn sim_config(&self) -> &SimConfig
    {
        &self.sim
    }

    /// Current mask level.
    pub fn level(&self) -> IrqLevel
    {
        IrqLevel(self.level.load(Ordering::SeqCst))
    }

    /// Whether the running task has FPU access.
    pub fn fpu_enabled(&self) -> bool
    {
        self.fpu_on.load(Ordering::SeqCst)
    }

    /// Bytes of DMA-capable memory in use by task blocks.
    pub fn dma_in_use(&self) -> usize
    {
        self.dma.in_use.load(Ordering::SeqCst)
    }

    /// Writes register `reg` (S0 to S31) of the simulated FPU. Like any FPU
    /// instruction it faults into [`Kernel::fpu_trap`] first unless the
    /// running task has FPU access.
    pub fn fpu_write(&self, reg: usize, v: f32)
    {
        k_assert!(reg < 32, "no FPU register S{}", reg);

        self.fpu_access();
        unpoison(self.fpu_regs.lock())[reg] = v.to_bits();
    }

    /// Reads register `reg` of the simulated FPU, see [`fpu_write`](HostArch::fpu_write).
    pub fn fpu_read(&self, reg: usize) -> f32
    {
        k_assert!(reg < 32, "no FPU register S{}", reg);

        self.fpu_access();
        f32::from_bits(unpoison(self.fpu_regs.lock())[reg])
    }

    fn fpu_access(&self)
    {
        if self.fpu_on.load(Ordering::SeqCst) {
            return;
        }

        // a fault: no switch is taken inside it
        self.irq_depth.fetch_add(1, Ordering::SeqCst);
        self.kernel().fpu_trap();
        self.irq_depth.fetch_sub(1, Ordering::SeqCst);

        self.service();
    }

    fn kernel(&self) -> &'static Kernel<HostArch>
    {
        match self.kernel.get() {
            Some(k) => *k,
            None => k_panic!("simulation not running")
        }
    }

    fn baton(&self) -> MutexGuard<'_, Baton>
    {
        unpoison(self.baton.lock())
    }

    fn running(&self) -> usize
    {
        self.baton().running
    }

    // ----- ----- Context switching ----- ----- //

    /// Parks the calling thread until context `me` is handed the baton.
    /// Retires if the simulation stops meanwhile.
    fn wait_turn(&self, mut baton: MutexGuard<'_, Baton>, me: usize)
    {
        while baton.running != me && baton.stop.is_none() {
            baton = unpoison(self.turn.wait(baton));
        }

        if baton.stop.is_some() {
            self.retire(baton, me);
        }
    }

    /// After a stop: waits until `run` calls on context `me`, then unwinds
    /// with `Retire`. The boot context unwinds at once.
    fn retire(&self, mut baton: MutexGuard<'_, Baton>, me: usize) -> !
    {
        while me != BOOT_CTX && baton.retiring != Some(me) {
            baton = unpoison(self.turn.wait(baton));
        }

        drop(baton);
        panic::resume_unwind(Box::new(Retire))
    }

    fn hand_over(&self, next: usize) -> MutexGuard<'_, Baton>
    {
        let mut baton = self.baton();
        baton.running = next;
        self.turn.notify_all();
        baton
    }

    fn switch_to(&self, me: usize, next: usize)
    {
        let baton = self.hand_over(next);
        self.wait_turn(baton, me);
    }

    fn stop(&self, stop: Stop)
    {
        // interrupts and switches end with the simulation
        self.started.store(false, Ordering::SeqCst);

        let mut baton = self.baton();
        if baton.stop.is_none() {
            baton.stop = Some(stop);
        }
        self.turn.notify_all();
    }

    /// The switch trap, like PendSV: taken when pending and the mask drops
    /// below `SWITCH` outside interrupt context.
    fn maybe_trap(&self)
    {
        while self.started.load(Ordering::SeqCst)
            && self.irq_depth.load(Ordering::SeqCst) == 0
            && self.level.load(Ordering::SeqCst) < IrqLevel::SWITCH.0
            && self.switch_pending.swap(false, Ordering::SeqCst)
        {
            let prev = self.level.swap(IrqLevel::SWITCH.0, Ordering::SeqCst);

            let me = self.running();
            let HostContext(next) = self.kernel().pick_next(HostContext(me));
            if next != me {
                self.switch_to(me, next);
            }

            self.level.store(prev, Ordering::SeqCst);
        }
    }

    /// Takes whatever interrupt became deliverable.
    fn service(&self)
    {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        if self.irq_depth.load(Ordering::SeqCst) == 0
            && self.level.load(Ordering::SeqCst) < IrqLevel::CLOCK.0
            && self.clock_pending.swap(false, Ordering::SeqCst)
        {
            self.irq_depth.fetch_add(1, Ordering::SeqCst);
            self.kernel().clock_irq();
            self.irq_depth.fetch_sub(1, Ordering::SeqCst);
        }

        self.maybe_trap();
    }

    fn clock_interrupt(&self)
    {
        self.clock_pending.store(true, Ordering::SeqCst);
        self.service();
    }

    // ----- ----- Clock ----- ----- //

    /// When the clock interrupt for `deadline` comes, seen from `now`.
    fn irq_time(&self, deadline: u64, now: u64) -> u64
    {
        let at = deadline.max(now);

        match self.sim.tick_us {
            Some(tick) => align_up(at as usize, tick as usize) as u64,
            None => at
        }
    }

    fn advance(&self, to: u64)
    {
        self.clock.fetch_max(to, Ordering::SeqCst);
    }

    /// Models the running task computing for `us` microseconds: the clock
    /// runs until it reaches now + `us` and clock interrupts due meanwhile
    /// are delivered, which may preempt the caller.
    pub fn busy(&self, us: u64)
    {
        k_assert!(self.can_block(), "busy outside task context");
        k_assert!(self.level() < IrqLevel::CLOCK, "busy with the clock masked");

        let kernel = self.kernel();
        let end = self.now_us().saturating_add(us);

        loop {
            let now = self.now_us();
            if now >= end {
                break;
            }

            let at = kernel.next_deadline()
                .map(|d| self.irq_time(d, now))
                .filter(|at| *at <= end);

            let to = at.unwrap_or(end);
            if to > self.sim.time_limit_us {
                self.advance(self.sim.time_limit_us);
                self.stop(Stop::Halt(HaltReason::TimeLimit));

                let me = self.running();
                self.retire(self.baton(), me);
            }

            self.advance(to);
            if at.is_some() {
                self.clock_interrupt();
            }
        }
    }

    /// Stops the simulation from a task; [`Kernel::run`] returns
    /// [`HaltReason::Shutdown`].
    pub fn shutdown(&self) -> !
    {
        log::info!("shutdown requested at {} us", self.now_us());

        self.stop(Stop::Halt(HaltReason::Shutdown));

        let me = self.running();
        self.retire(self.baton(), me)
    }

    // ----- ----- Contexts ----- ----- //

    fn task_thread(&self, me: usize, kernel: &'static Kernel<HostArch>, id: TaskId)
    {
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            self.wait_turn(self.baton(), me);

            // first dispatch returns from the trap unmasked
            self.level.store(IrqLevel::NONE.0, Ordering::SeqCst);
            self.service();

            kernel.task_main(id)
        }));

        if let Err(payload) = r {
            if !payload.is::<Retire>() {
                log::error!("task {} panicked", id);

                *unpoison(self.panicked.lock()) = Some(payload);
                self.stop(Stop::Panicked);
            }
        }
    }

    fn idle_step(&self, kernel: &'static Kernel<HostArch>) -> Option<HaltReason>
    {
        if kernel.live_tasks() == 0 {
            return Some(HaltReason::AllTasksDone);
        }

        if kernel.has_ready() {
            self.reschedule_request();
            return None;
        }

        let now = self.now_us();
        let at = match kernel.next_deadline() {
            Some(d) => self.irq_time(d, now),
            None => return Some(HaltReason::Idle)
        };

        if at > self.sim.time_limit_us {
            self.advance(self.sim.time_limit_us);
            return Some(HaltReason::TimeLimit);
        }

        // wait for interrupt
        self.advance(at);
        self.clock_interrupt();

        None
    }

    fn run_idle(&self, kernel: &'static Kernel<HostArch>) -> Stop
    {
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            loop {
                self.service();

                if let Some(reason) = self.idle_step(kernel) {
                    return reason;
                }
            }
        }));

        match r {
            Ok(reason) => {
                self.stop(Stop::Halt(reason));
                Stop::Halt(reason)
            }
            Err(payload) if payload.is::<Retire>() => {
                match self.baton().stop {
                    Some(stop) => stop,
                    None => k_panic!("idle context retired without a stop")
                }
            }
            Err(payload) => {
                *unpoison(self.panicked.lock()) = Some(payload);
                self.stop(Stop::Panicked);
                Stop::Panicked
            }
        }
    }
}

impl InterruptGate for HostArch
{
    fn raise(&self, level: IrqLevel) -> IrqLevel
    {
        IrqLevel(self.level.fetch_max(level.0, Ordering::SeqCst))
    }

    fn restore(&self, prev: IrqLevel)
    {
        self.level.store(prev.0, Ordering::SeqCst);
        self.service();
    }

    fn lower(&self) -> IrqLevel
    {
        let prev = self.level.swap(IrqLevel::NONE.0, Ordering::SeqCst);
        self.service();
        IrqLevel(prev)
    }

    fn can_block(&self) -> bool
    {
        self.started.load(Ordering::SeqCst) && self.irq_depth.load(Ordering::SeqCst) == 0
    }
}

impl Arch for HostArch
{
    type Context = HostContext;
    type Exit = SimExit;

    const MIN_STACK_SIZE: usize = 256;
    const STACK_ALIGN: usize = 8;
    const FPU_CTX_SIZE: usize = FPU_REGS * 4;
    const REDZONE_SIZE: usize = 32;

    fn now_us(&self) -> u64
    {
        self.clock.load(Ordering::SeqCst)
    }

    fn reschedule_request(&self)
    {
        self.switch_pending.store(true, Ordering::SeqCst);
        self.maybe_trap();
    }

    fn boot_context(&self) -> HostContext
    {
        HostContext(BOOT_CTX)
    }

    fn init_context(&self, kernel: &'static Kernel<Self>, id: TaskId, _mem: &mut TaskMem) -> HostContext
    {
        let me = self.next_ctx.fetch_add(1, Ordering::SeqCst);
        let arch = kernel.arch();

        let spawned = thread::Builder::new()
            .name(format!("task {}", id))
            .spawn(move || arch.task_thread(me, kernel, id));

        match spawned {
            Ok(handle) => unpoison(self.threads.lock()).push((me, handle)),
            Err(e) => k_panic!("cannot spawn thread for task {}: {}", id, e)
        }

        HostContext(me)
    }

    fn run(&self, kernel: &'static Kernel<Self>) -> SimExit
    {
        self.kernel.call_once(|| kernel);

        self.level.store(IrqLevel::NONE.0, Ordering::SeqCst);
        self.switch_pending.store(true, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);

        let stop = self.run_idle(kernel);

        // every parked context sees the stop and retires, in turn
        let threads = core::mem::take(&mut *unpoison(self.threads.lock()));
        for (ctx, t) in threads {
            {
                let mut baton = self.baton();
                baton.retiring = Some(ctx);
                self.turn.notify_all();
            }
            let _ = t.join();
        }

        match stop {
            Stop::Halt(reason) => {
                let now_us = self.now_us();
                log::info!("simulation halted at {} us: {:?}", now_us, reason);

                SimExit {
                    now_us,
                    reason
                }
            }
            Stop::Panicked => {
                match unpoison(self.panicked.lock()).take() {
                    Some(payload) => panic::resume_unwind(payload),
                    None => k_panic!("simulation panicked without a payload")
                }
            }
        }
    }

    fn exit_current(&self, returned: bool) -> !
    {
        self.level.store(IrqLevel::SWITCH.0, Ordering::SeqCst);
        self.switch_pending.store(false, Ordering::SeqCst);

        let me = self.running();
        let HostContext(next) = self.kernel().pick_next(HostContext(me));
        k_assert!(next != me, "exited task dispatched again");

        if !returned {
            // frames of the task body stay on this thread's stack, never
            // dropped, as on a target where the stack is just freed
            let mut threads = unpoison(self.threads.lock());
            threads.retain(|(ctx, _)| *ctx != me);
            drop(threads);

            drop(self.hand_over(next));
            loop {
                thread::park();
            }
        }

        // only kernel frames are left; unwind them once reclaimed
        let mut baton = self.hand_over(next);
        while !baton.released.contains(&me) && baton.stop.is_none() {
            baton = unpoison(self.turn.wait(baton));
        }

        if baton.released.contains(&me) {
            baton.released.retain(|ctx| *ctx != me);
            drop(baton);
            panic::resume_unwind(Box::new(Retire))
        }
        self.retire(baton, me)
    }

    fn release_context(&self, ctx: HostContext)
    {
        let HostContext(ctx) = ctx;

        let handle = {
            let mut threads = unpoison(self.threads.lock());
            match threads.iter().position(|(c, _)| *c == ctx) {
                Some(i) => threads.swap_remove(i).1,
                None => return
            }
        };

        {
            let mut baton = self.baton();
            baton.released.push(ctx);
            self.turn.notify_all();
        }
        let _ = handle.join();
    }

    fn task_heap(kernel: &'static Kernel<Self>, dma: bool) -> &'static TaskHeap
    {
        if dma {
            &kernel.arch().dma
        }
        else {
            &Heap
        }
    }

    fn fpu_enable(&self, on: bool)
    {
        self.fpu_on.store(on, Ordering::SeqCst);
    }

    fn fpu_save(&self, area: &mut [u8])
    {
        let regs = unpoison(self.fpu_regs.lock());

        for (chunk, reg) in area.chunks_exact_mut(4).zip(regs.iter()) {
            chunk.copy_from_slice(&reg.to_le_bytes());
        }
    }

    fn fpu_restore(&self, area: &[u8])
    {
        let mut regs = unpoison(self.fpu_regs.lock());

        for (reg, chunk) in regs.iter_mut().zip(area.chunks_exact(4)) {
            *reg = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    fn stack_guard(&self, mem: Option<&TaskMem>)
    {
        if let Some(mem) = mem {
            k_assert!(mem.redzone_intact(), "stack red zone overwritten");
        }
    }
}
