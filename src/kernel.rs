use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::arch::{Arch, IrqLevel};
use crate::condvar::CondVar;
use crate::config::Config;
use crate::list::{ListRef, NodeIdx, Nodes, Queue};
use crate::memory::TaskMem;
use crate::task::{TaskFlags, TaskId, TaskInfo, TaskName, TaskState, TASK_PRIOS};
use crate::timer::{TimerIdx, TimerQueue};
use crate::{k_assert, k_panic};
use crate::kpanic::KUnwrap;

// ready queue occupancy is a u32 bitmap
const _: () = assert!(TASK_PRIOS <= 32);

pub(crate) type WaitIdx = u16;

//

/// Scheduler state guarded by the interrupt gate
///
/// The inner lock is only ever taken with the gate raised, so it is never
/// contended; finding it held means the gate was bypassed.
pub(crate) struct GateCell<T>
{
    inner: spin::Mutex<T>
}

impl<T> GateCell<T>
{
    fn new(v: T) -> GateCell<T>
    {
        GateCell {
            inner: spin::Mutex::new(v)
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    {
        match self.inner.try_lock() {
            Some(mut guard) => f(&mut *guard),
            None => k_panic!("scheduler state re-entered")
        }
    }
}

//

#[derive(Debug, Clone, Copy)]
pub(crate) enum NodeOwner
{
    Task(u16),
    /// Stand-in queued on a wait list by `poll`.
    Proxy {
        task: u16,
        which: u8
    }
}

pub(crate) enum TimerAction<A: Arch>
{
    /// Timeout of the task's own sleep.
    Wake(u16),
    Call(fn(&'static Kernel<A>, usize), usize)
}

impl<A: Arch> Clone for TimerAction<A>
{
    fn clone(&self) -> Self
    {
        *self
    }
}

impl<A: Arch> Copy for TimerAction<A> {}

struct WaitList
{
    q: Queue,
    name: &'static str
}

type Entry<A> = Box<dyn FnOnce(&'static Kernel<A>) + Send>;

pub(crate) struct Tcb<A: Arch>
{
    name: TaskName,
    pub(crate) prio: u8,
    pub(crate) state: TaskState,
    flags: TaskFlags,
    ctx: A::Context,
    mem: Option<TaskMem>,
    entry: Option<Entry<A>>,
    node: NodeIdx,
    timer: TimerIdx,
    wchan: &'static str,
    pub(crate) poll_which: Option<u8>,
    switches: u64,
    switches_mark: u64,
    switches_last: u32,
    // clock at the last switch in
    slice_start: u64,
    cpu_us: u64,
    cpu_mark: u64,
    load: u32
}

struct Slot<A: Arch>
{
    gen: u16,
    tcb: Option<Tcb<A>>
}

pub(crate) struct Sched<A: Arch>
{
    slots: Vec<Slot<A>>,
    free_slots: Vec<u16>,
    nodes: Nodes<NodeOwner>,
    waits: Vec<WaitList>,
    free_waits: Vec<WaitIdx>,
    ready: [Queue; TASK_PRIOS],
    active: u32,
    pub(crate) current: u16,
    idle: u16,
    current_fpu: Option<u16>,
    timers: TimerQueue<TimerAction<A>>,
    zombies: usize,
    period_start: u64
}

impl<A: Arch> Sched<A>
{
    fn new() -> Sched<A>
    {
        Sched {
            slots: Vec::new(),
            free_slots: Vec::new(),
            nodes: Nodes::new(),
            waits: Vec::new(),
            free_waits: Vec::new(),
            ready: [Queue::new(); TASK_PRIOS],
            active: 0,
            current: 0,
            idle: 0,
            current_fpu: None,
            timers: TimerQueue::new(),
            zombies: 0,
            period_start: 0
        }
    }

    pub(crate) fn tcb(&self, t: u16) -> &Tcb<A>
    {
        self.slots[t as usize].tcb.as_ref().k_unwrap()
    }

    pub(crate) fn tcb_mut(&mut self, t: u16) -> &mut Tcb<A>
    {
        self.slots[t as usize].tcb.as_mut().k_unwrap()
    }

    fn lookup(&self, id: TaskId) -> Option<u16>
    {
        let slot = self.slots.get(id.idx as usize)?;

        if slot.gen == id.gen && slot.tcb.is_some() {
            Some(id.idx)
        }
        else {
            None
        }
    }

    fn id_of(&self, t: u16) -> TaskId
    {
        TaskId::new(t, self.slots[t as usize].gen)
    }

    fn reserve_slot(&mut self) -> TaskId
    {
        if let Some(idx) = self.free_slots.pop() {
            TaskId::new(idx, self.slots[idx as usize].gen)
        }
        else {
            k_assert!(self.slots.len() < u16::MAX as usize, "out of task slots");
            self.slots.push(Slot {
                gen: 0,
                tcb: None
            });
            TaskId::new((self.slots.len() - 1) as u16, 0)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn install(&mut self, id: TaskId, name: TaskName, prio: u8, flags: TaskFlags,
               ctx: A::Context, mem: Option<TaskMem>, entry: Option<Entry<A>>)
    {
        let node = self.nodes.alloc(prio, NodeOwner::Task(id.idx));
        let timer = self.timers.insert("task", TimerAction::Wake(id.idx));

        let slot = &mut self.slots[id.idx as usize];
        k_assert!(slot.gen == id.gen && slot.tcb.is_none(), "slot of {} not reserved", id);

        slot.tcb = Some(Tcb {
            name,
            prio,
            state: TaskState::Running,
            flags,
            ctx,
            mem,
            entry,
            node,
            timer,
            wchan: "",
            poll_which: None,
            switches: 0,
            switches_mark: 0,
            switches_last: 0,
            slice_start: 0,
            cpu_us: 0,
            cpu_mark: 0,
            load: 0
        });
    }

    /// Reclaims a zombie; returns its last context and its memory block.
    fn destroy(&mut self, t: u16) -> (A::Context, Option<TaskMem>)
    {
        let slot = &mut self.slots[t as usize];
        let tcb = slot.tcb.take().k_unwrap();

        k_assert!(tcb.state == TaskState::Zombie, "destroying live task {}", tcb.name);

        slot.gen = slot.gen.wrapping_add(1);
        self.free_slots.push(t);

        self.nodes.free(tcb.node);
        self.timers.remove(tcb.timer);

        (tcb.ctx, tcb.mem)
    }

    pub(crate) fn add_wait(&mut self, name: &'static str) -> WaitIdx
    {
        if let Some(w) = self.free_waits.pop() {
            self.waits[w as usize].name = name;
            return w;
        }

        k_assert!(self.waits.len() < WaitIdx::MAX as usize, "out of wait lists");

        self.waits.push(WaitList {
            q: Queue::new(),
            name
        });
        (self.waits.len() - 1) as WaitIdx
    }

    /// Frees a wait list for reuse.
    pub(crate) fn remove_wait(&mut self, w: WaitIdx)
    {
        let wl = &mut self.waits[w as usize];
        k_assert!(wl.q.is_empty(), "{} destroyed with tasks waiting", wl.name);

        wl.name = "";
        self.free_waits.push(w);
    }

    pub(crate) fn wait_is_empty(&self, w: WaitIdx) -> bool
    {
        self.waits[w as usize].q.is_empty()
    }

    // ----- ----- Ready queues ----- ----- //

    fn readyqueue_insert(&mut self, t: u16)
    {
        let tcb = self.tcb(t);
        let (prio, node) = (tcb.prio, tcb.node);

        self.ready[prio as usize].push_back(&mut self.nodes, node, ListRef::Ready(prio));
        self.active |= 1 << prio;
    }

    fn pick(&mut self) -> u16
    {
        if self.active == 0 {
            return self.idle;
        }

        let prio = (31 - self.active.leading_zeros()) as usize;
        let node = self.ready[prio].pop_front(&mut self.nodes).k_unwrap();

        if self.ready[prio].is_empty() {
            self.active &= !(1 << prio);
        }

        match self.nodes.get(node).owner {
            NodeOwner::Task(t) => t,
            NodeOwner::Proxy {..} => k_panic!("poll proxy on ready queue {}", prio)
        }
    }

    /// Marks a task runnable and queues it unless it is the current one.
    /// Returns whether it should preempt the current task.
    pub(crate) fn make_runnable(&mut self, t: u16) -> bool
    {
        let tcb = self.tcb_mut(t);
        tcb.state = TaskState::Running;
        tcb.wchan = "";
        let prio = tcb.prio;

        if t != self.current {
            self.readyqueue_insert(t);
        }

        prio >= self.tcb(self.current).prio
    }

    // ----- ----- Wait lists ----- ----- //

    /// Puts the current task to sleep, optionally on a wait list and/or
    /// with a timeout. The caller then blocks.
    pub(crate) fn sleep_current(&mut self, wait: Option<WaitIdx>, wchan: &'static str, deadline: Option<u64>)
    {
        let me = self.current;
        k_assert!(me != self.idle, "idle task cannot sleep");

        let tcb = self.tcb_mut(me);
        k_assert!(tcb.state == TaskState::Running, "task {} sleeps twice", tcb.name);

        tcb.state = TaskState::Sleeping;
        tcb.wchan = wchan;
        let (node, timer) = (tcb.node, tcb.timer);

        if let Some(w) = wait {
            self.waits[w as usize].q.insert_by_prio(&mut self.nodes, node, ListRef::Wait(w));
        }
        if let Some(deadline) = deadline {
            self.timers.arm(timer, deadline);
        }
    }

    /// After waking: `true` if the sleep's timeout fired.
    pub(crate) fn sleep_timed_out(&mut self, deadline: Option<u64>) -> bool
    {
        let timer = self.tcb(self.current).timer;

        deadline.is_some() && !self.timers.disarm(timer)
    }

    pub(crate) fn sleep_timer_armed(&self) -> bool
    {
        self.timers.is_armed(self.tcb(self.current).timer)
    }

    /// `None` if the node was a stale poll proxy.
    fn wake_node(&mut self, node: NodeIdx) -> Option<bool>
    {
        match self.nodes.get(node).owner {
            NodeOwner::Task(t) => {
                let tcb = self.tcb(t);
                k_assert!(tcb.state == TaskState::Sleeping, "waking task {} that is not sleeping", tcb.name);

                Some(self.make_runnable(t))
            }
            NodeOwner::Proxy {task, which} => {
                let tcb = self.tcb_mut(task);
                if tcb.state != TaskState::Sleeping {
                    return None;
                }
                tcb.poll_which = Some(which);

                Some(self.make_runnable(task))
            }
        }
    }

    /// Wakes the head of a wait list, or all of it.
    /// Returns whether a reschedule is due.
    pub(crate) fn wakeup(&mut self, w: WaitIdx, all: bool) -> bool
    {
        let mut resched = false;

        while let Some(node) = self.waits[w as usize].q.pop_front(&mut self.nodes) {
            if let Some(r) = self.wake_node(node) {
                resched |= r;
                if !all {
                    break;
                }
            }
        }

        resched
    }

    pub(crate) fn add_proxy(&mut self, task: u16, which: u8, w: WaitIdx) -> NodeIdx
    {
        let prio = self.tcb(task).prio;
        let node = self.nodes.alloc(prio, NodeOwner::Proxy {task, which});

        self.waits[w as usize].q.insert_by_prio(&mut self.nodes, node, ListRef::Wait(w));
        node
    }

    pub(crate) fn drop_proxy(&mut self, node: NodeIdx)
    {
        if let Some(ListRef::Wait(w)) = self.nodes.get(node).on() {
            self.waits[w as usize].q.remove(&mut self.nodes, node);
        }
        self.nodes.free(node);
    }

    /// Timer expiry of a sleeping task.
    fn timeout(&mut self, t: u16) -> bool
    {
        let tcb = self.tcb(t);
        if tcb.state != TaskState::Sleeping {
            return false;
        }

        let (node, name) = (tcb.node, tcb.name);
        match self.nodes.get(node).on() {
            Some(ListRef::Wait(w)) => {
                self.waits[w as usize].q.remove(&mut self.nodes, node);
            }
            Some(ListRef::Ready(p)) => k_panic!("sleeping task {} on ready queue {}", name, p),
            None => {}
        }

        self.make_runnable(t)
    }
}

//

/// Software timer handle, see [`Kernel::timer_create`]
#[derive(Debug)]
pub struct Timer
{
    idx: TimerIdx
}

/// The scheduler
///
/// Owns every task, wait list and timer. Create one per system, turn it into
/// a `&'static` with [`into_static`](Kernel::into_static), create tasks and
/// call [`run`](Kernel::run).
pub struct Kernel<A: Arch>
{
    pub(crate) arch: A,
    config: Config,
    pub(crate) sched: GateCell<Sched<A>>,
    current: AtomicU16,
    idle: u16,
    join_wait: WaitIdx,
    pub(crate) mgmt: CondVar
}

impl<A: Arch> Kernel<A>
{
    // ----- ----- Main context ----- ----- //

    pub fn new(arch: A, config: Config) -> Kernel<A>
    {
        let mut s = Sched::new();

        let id = s.reserve_slot();
        s.install(id, TaskName::new("idle"), 0, TaskFlags::SYSTEM, arch.boot_context(), None, None);
        s.idle = id.idx;
        s.current = id.idx;

        let join_wait = s.add_wait("join");
        let mgmt = CondVar::from_wait(s.add_wait("taskmgmt"), "taskmgmt");

        Kernel {
            arch,
            config,
            sched: GateCell::new(s),
            current: AtomicU16::new(id.idx),
            idle: id.idx,
            join_wait,
            mgmt
        }
    }

    pub fn into_static(self) -> &'static Kernel<A>
    {
        Box::leak(Box::new(self))
    }

    /// Starts dispatching. The calling context becomes the idle task.
    pub fn run(&'static self) -> A::Exit
    {
        if self.config.task_manager {
            self.create(crate::taskmgr::task_manager::<A>,
                        self.config.task_manager_stack,
                        "taskmgmt",
                        TaskFlags::SYSTEM,
                        self.config.task_manager_prio);
        }

        let now = self.arch.now_us();
        let count = self.locked(|s| {
            s.period_start = now;
            s.slots.len() - s.free_slots.len() - 1
        });
        log::info!("kernel running, {} tasks", count);

        self.arch.run(self)
    }

    pub fn arch(&self) -> &A
    {
        &self.arch
    }

    pub fn config(&self) -> &Config
    {
        &self.config
    }

    // ----- ----- Task lifecycle ----- ----- //

    /// Creates a task running `entry` at `prio` (higher is more urgent).
    /// * `stack_size` is rounded up to the architecture minimum.
    /// * The task is queued and a reschedule requested; it may not have run
    ///   when this returns.
    /// * Out of memory is fatal.
    pub fn create<F>(&'static self, entry: F, stack_size: usize, name: &str, flags: TaskFlags, prio: u8) -> TaskId
    where F: FnOnce(&'static Kernel<A>) + Send + 'static
    {
        k_assert!((prio as usize) < TASK_PRIOS, "task {}: priority {} out of range", name, prio);

        let fpu_len = if flags.contains(TaskFlags::FPU) {A::FPU_CTX_SIZE} else {0};
        let mut mem = TaskMem::new(A::REDZONE_SIZE,
                                   stack_size.max(A::MIN_STACK_SIZE),
                                   fpu_len,
                                   A::STACK_ALIGN,
                                   A::task_heap(self, flags.contains(TaskFlags::DMA_STACK)));

        if let Some(area) = mem.fpu_area_mut() {
            self.arch.fpu_ctx_init(area);
        }

        let id = self.locked(|s| s.reserve_slot());
        let ctx = self.arch.init_context(self, id, &mut mem);
        let name = TaskName::new(name);

        log::debug!("task {} {} created, prio {}, stack {}", id, name, prio, mem.stack_size());

        let prev = self.arch.raise(IrqLevel::SCHED);
        self.sched.with(|s| {
            s.install(id, name, prio, flags, ctx, Some(mem), Some(Box::new(entry)));
            s.readyqueue_insert(id.idx);
        });
        self.arch.reschedule_request();
        self.arch.restore(prev);

        id
    }

    /// Creates a detached, FPU-enabled shell-class task at priority 2.
    pub fn create_shell<F>(&'static self, entry: F, name: &str) -> TaskId
    where F: FnOnce(&'static Kernel<A>) + Send + 'static
    {
        let stack_size = if A::FPU_CTX_SIZE > 0 {1024} else {768};

        self.create(entry, stack_size, name, TaskFlags::DETACHED | TaskFlags::FPU, 2)
    }

    /// Entry of every task's first dispatch; runs the task body then exits.
    #[doc(hidden)]
    pub fn task_main(&'static self, id: TaskId) -> !
    {
        let entry = self.locked(|s| {
            let t = s.lookup(id).k_unwrap();
            s.tcb_mut(t).entry.take()
        });

        match entry {
            Some(entry) => entry(self),
            None => k_panic!("task {} entered twice", id)
        }

        self.exit_inner(true)
    }

    /// Ends the current task. Its memory is reclaimed by `join`, or by the
    /// task manager if it is detached.
    ///
    /// Values still live in the caller's frames are never dropped.
    pub fn exit(&self) -> !
    {
        self.exit_inner(false)
    }

    fn exit_inner(&self, returned: bool) -> !
    {
        self.assert_can_block();

        // never restored; the task is switched away for good
        self.arch.raise(IrqLevel::SCHED);

        self.sched.with(|s| {
            let me = s.current;

            if s.current_fpu == Some(me) {
                s.current_fpu = None;
                self.arch.fpu_enable(false);
            }

            let tcb = s.tcb_mut(me);
            tcb.state = TaskState::Zombie;
            tcb.wchan = "";
            let detached = tcb.flags.contains(TaskFlags::DETACHED);

            log::debug!("task {} {} exited", s.id_of(me), s.tcb(me).name);

            if detached {
                s.zombies += 1;
                s.wakeup(self.mgmt.wait_idx(), true);
            }
            else {
                s.wakeup(self.join_wait, true);
            }
        });

        self.arch.reschedule_request();
        self.arch.exit_current(returned)
    }

    /// Waits for a joinable task to exit and reclaims it.
    pub fn join(&self, id: TaskId)
    {
        self.assert_can_block();

        let prev = self.arch.raise(IrqLevel::SCHED);

        let (ctx, mem) = loop {
            let done = self.sched.with(|s| {
                let t = match s.lookup(id) {
                    Some(t) => t,
                    None => k_panic!("join of unknown task {}", id)
                };
                let tcb = s.tcb(t);
                k_assert!(!tcb.flags.contains(TaskFlags::DETACHED), "join of detached task {}", tcb.name);
                k_assert!(t != s.current, "task {} joins itself", tcb.name);

                if tcb.state == TaskState::Zombie {
                    Some(s.destroy(t))
                }
                else {
                    s.sleep_current(Some(self.join_wait), "join", None);
                    None
                }
            });

            match done {
                Some(reclaimed) => break reclaimed,
                None => self.block()
            }
        };

        self.arch.restore(prev);

        self.release(id, ctx, mem);
    }

    fn release(&self, id: TaskId, ctx: A::Context, mem: Option<TaskMem>)
    {
        if let Some(mem) = mem {
            k_assert!(mem.redzone_intact(), "task {} overflowed its stack", id);
        }
        self.arch.release_context(ctx);

        log::debug!("task {} reclaimed", id);
    }

    // ----- ----- Task context ----- ----- //

    /// Gives up the CPU to tasks of the same or higher priority.
    pub fn yield_now(&self)
    {
        self.assert_can_block();
        self.yield_raw();
    }

    fn yield_raw(&self)
    {
        self.arch.reschedule_request();
        let prev = self.arch.lower();
        self.arch.restore(prev);
    }

    /// Yields until the current task is no longer sleeping.
    /// Called with the gate raised.
    pub(crate) fn block(&self)
    {
        while self.sched.with(|s| s.tcb(s.current).state == TaskState::Sleeping) {
            self.yield_raw();
        }
    }

    pub fn sleep_for(&self, us: u64)
    {
        self.sleep_until(self.now_us().saturating_add(us));
    }

    /// Sleeps until the clock reaches `deadline`.
    pub fn sleep_until(&self, deadline: u64)
    {
        self.assert_can_block();

        if deadline <= self.now_us() {
            return;
        }

        let prev = self.arch.raise(IrqLevel::SCHED);
        self.sched.with(|s| s.sleep_current(None, "sleep", Some(deadline)));
        self.block();
        self.sched.with(|s| s.sleep_timed_out(Some(deadline)));
        self.arch.restore(prev);
    }

    pub(crate) fn assert_can_block(&self)
    {
        k_assert!(self.arch.can_block(), "blocking call from interrupt context");
        k_assert!(self.current_idx() != self.idle, "blocking call from idle context");
    }

    // ----- ----- Interrupt context ----- ----- //

    /// Context switch trap body. Saves the outgoing context, requeues the
    /// outgoing task if it is still running and returns the context of the
    /// highest priority ready task (or the idle task).
    pub fn pick_next(&self, saved: A::Context) -> A::Context
    {
        let prev = self.arch.raise(IrqLevel::SCHED);

        let now = self.arch.now_us();

        let ctx = self.sched.with(|s| {
            let from = s.current;
            let tcb = s.tcb_mut(from);
            tcb.ctx = saved;
            tcb.cpu_us += now.saturating_sub(tcb.slice_start);

            if from != s.idle && s.tcb(from).state == TaskState::Running {
                s.readyqueue_insert(from);
            }

            let to = s.pick();
            s.current = to;
            self.current.store(to, Ordering::Relaxed);

            self.arch.fpu_enable(s.current_fpu == Some(to));
            self.arch.stack_guard(s.tcb(to).mem.as_ref());

            let tcb = s.tcb_mut(to);
            tcb.slice_start = now;
            if to != from {
                tcb.switches += 1;
                log::trace!("switch {} -> {}", s.tcb(from).name, s.tcb(to).name);
            }

            s.tcb(to).ctx
        });

        self.arch.restore(prev);

        ctx
    }

    /// FPU-unavailable fault body. Moves the FPU registers to the running
    /// task: the previous owner's values go to its save area and the running
    /// task's are loaded from its own. Using the FPU from a task created
    /// without [`TaskFlags::FPU`] is fatal.
    pub fn fpu_trap(&self)
    {
        let prev = self.arch.raise(IrqLevel::SCHED);

        self.sched.with(|s| {
            let me = s.current;
            let tcb = s.tcb(me);
            k_assert!(tcb.flags.contains(TaskFlags::FPU), "task {} used the FPU without an FPU context", tcb.name);

            self.arch.fpu_enable(true);

            if s.current_fpu == Some(me) {
                return;
            }

            if let Some(owner) = s.current_fpu {
                if let Some(area) = s.tcb_mut(owner).mem.as_mut().and_then(|m| m.fpu_area_mut()) {
                    self.arch.fpu_save(area);
                }
            }
            if let Some(area) = s.tcb_mut(me).mem.as_mut().and_then(|m| m.fpu_area_mut()) {
                self.arch.fpu_restore(area);
            }

            s.current_fpu = Some(me);
            log::trace!("FPU to {}", s.tcb(me).name);
        });

        self.arch.restore(prev);
    }

    /// Clock interrupt body: fires every timer due at the current time, in
    /// deadline order.
    pub fn clock_irq(&'static self)
    {
        enum Due<A: Arch>
        {
            Woke(bool),
            Call(fn(&'static Kernel<A>, usize), usize)
        }

        let prev = self.arch.raise(IrqLevel::SCHED);
        let now = self.arch.now_us();
        let mut resched = false;

        loop {
            let due = self.sched.with(|s| -> Option<Due<A>> {
                let (idx, action, _) = s.timers.pop_expired(now)?;
                log::trace!("timer {} expired", s.timers.name(idx));

                Some(match action {
                    TimerAction::Wake(t) => Due::Woke(s.timeout(t)),
                    TimerAction::Call(f, arg) => Due::Call(f, arg)
                })
            });

            match due {
                None => break,
                Some(Due::Woke(r)) => resched |= r,
                Some(Due::Call(f, arg)) => f(self, arg)
            }
        }

        if resched {
            self.arch.reschedule_request();
        }

        self.arch.restore(prev);
    }

    // ----- ----- Timers ----- ----- //

    /// Creates a disarmed timer. `callback` runs in clock interrupt context
    /// with `arg` and must not block.
    pub fn timer_create(&self, name: &'static str, callback: fn(&'static Kernel<A>, usize), arg: usize) -> Timer
    {
        let idx = self.locked(|s| s.timers.insert(name, TimerAction::Call(callback, arg)));

        Timer {
            idx
        }
    }

    /// Arms, or re-arms, a timer for an absolute deadline in microseconds.
    pub fn timer_arm(&self, timer: &Timer, deadline: u64)
    {
        self.locked(|s| s.timers.arm(timer.idx, deadline));
    }

    /// Returns whether the timer was armed; `false` if it already fired.
    pub fn timer_disarm(&self, timer: &Timer) -> bool
    {
        self.locked(|s| s.timers.disarm(timer.idx))
    }

    pub fn timer_is_armed(&self, timer: &Timer) -> bool
    {
        self.locked(|s| s.timers.is_armed(timer.idx))
    }

    pub fn timer_set_arg(&self, timer: &Timer, callback: fn(&'static Kernel<A>, usize), arg: usize)
    {
        self.locked(|s| s.timers.set_payload(timer.idx, TimerAction::Call(callback, arg)));
    }

    pub fn timer_destroy(&self, timer: Timer)
    {
        self.locked(|s| s.timers.remove(timer.idx));
    }

    // ----- ----- Queries ----- ----- //

    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut Sched<A>) -> R) -> R
    {
        let prev = self.arch.raise(IrqLevel::SCHED);
        let r = self.sched.with(f);
        self.arch.restore(prev);
        r
    }

    pub(crate) fn current_idx(&self) -> u16
    {
        self.current.load(Ordering::Relaxed)
    }

    pub fn now_us(&self) -> u64
    {
        self.arch.now_us()
    }

    /// Handle of the running task; `None` in the idle context.
    pub fn current(&self) -> Option<TaskId>
    {
        self.locked(|s| {
            if s.current == s.idle {
                None
            }
            else {
                Some(s.id_of(s.current))
            }
        })
    }

    /// `None` once the task has been reclaimed.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState>
    {
        self.locked(|s| s.lookup(id).map(|t| s.tcb(t).state))
    }

    /// Snapshot of every task except the idle task.
    pub fn tasks(&self) -> Vec<TaskInfo>
    {
        self.locked(|s| {
            let mut list = Vec::new();

            for (t, slot) in s.slots.iter().enumerate() {
                let tcb = match &slot.tcb {
                    Some(tcb) if t as u16 != s.idle => tcb,
                    _ => continue
                };

                list.push(TaskInfo {
                    id: TaskId::new(t as u16, slot.gen),
                    name: tcb.name,
                    prio: tcb.prio,
                    state: tcb.state,
                    flags: tcb.flags,
                    stack_size: tcb.mem.as_ref().map_or(0, |m| m.stack_size()),
                    ctx_switches: tcb.switches,
                    ctx_switches_last_period: tcb.switches_last,
                    cpu_us: tcb.cpu_us,
                    load: tcb.load,
                    wchan: tcb.wchan
                });
            }

            list
        })
    }

    /// Number of tasks, other than system tasks, that have not exited.
    pub fn live_tasks(&self) -> usize
    {
        self.locked(|s| {
            s.slots.iter()
                .filter_map(|slot| slot.tcb.as_ref())
                .filter(|tcb| tcb.state != TaskState::Zombie && !tcb.flags.contains(TaskFlags::SYSTEM))
                .count()
        })
    }

    pub fn has_ready(&self) -> bool
    {
        self.locked(|s| s.active != 0)
    }

    /// Highest priority among tasks queued for the CPU, the running one aside.
    pub fn ready_prio(&self) -> Option<u8>
    {
        self.locked(|s| {
            if s.active == 0 {
                None
            }
            else {
                Some((31 - s.active.leading_zeros()) as u8)
            }
        })
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<u64>
    {
        self.locked(|s| s.timers.next_deadline())
    }

    /// Name of the wait list a sleeping task is queued on.
    pub fn wait_list_of(&self, id: TaskId) -> Option<&'static str>
    {
        self.locked(|s| {
            let t = s.lookup(id)?;
            match s.nodes.get(s.tcb(t).node).on() {
                Some(ListRef::Wait(w)) => Some(s.waits[w as usize].name),
                _ => None
            }
        })
    }

    pub(crate) fn add_waitable(&self, name: &'static str) -> WaitIdx
    {
        self.locked(|s| s.add_wait(name))
    }

    pub(crate) fn remove_waitable(&self, w: WaitIdx)
    {
        self.locked(|s| s.remove_wait(w));
    }

    // ----- ----- Task manager support ----- ----- //

    /// Reclaims every detached zombie.
    pub(crate) fn reap_detached(&self) -> usize
    {
        let reaped = self.locked(|s| {
            let mut reaped = Vec::new();

            if s.zombies == 0 {
                return reaped;
            }

            for t in 0..s.slots.len() as u16 {
                let zombie = match &s.slots[t as usize].tcb {
                    Some(tcb) => tcb.state == TaskState::Zombie && tcb.flags.contains(TaskFlags::DETACHED),
                    None => false
                };
                if zombie {
                    let id = s.id_of(t);
                    reaped.push((id, s.destroy(t)));
                }
            }

            s.zombies -= reaped.len();
            reaped
        });

        let n = reaped.len();
        for (id, (ctx, mem)) in reaped {
            self.release(id, ctx, mem);
        }
        n
    }

    /// Sleeps on the task manager's wait list unless there is work.
    /// Returns `true` on timeout.
    pub(crate) fn wait_for_zombies(&self, deadline: Option<u64>) -> bool
    {
        let prev = self.arch.raise(IrqLevel::SCHED);

        let sleeping = self.sched.with(|s| {
            if s.zombies == 0 {
                s.sleep_current(Some(self.mgmt.wait_idx()), "taskmgmt", deadline);
                true
            }
            else {
                false
            }
        });

        let timed_out = sleeping && {
            self.block();
            self.sched.with(|s| s.sleep_timed_out(deadline))
        };

        self.arch.restore(prev);

        timed_out
    }

    /// Closes an accounting period.
    pub(crate) fn account(&self)
    {
        let now = self.arch.now_us();

        self.locked(|s| {
            let period = now.saturating_sub(s.period_start);
            s.period_start = now;

            // the running slice so far counts toward this period
            let tcb = s.tcb_mut(s.current);
            tcb.cpu_us += now.saturating_sub(tcb.slice_start);
            tcb.slice_start = now;

            for tcb in s.slots.iter_mut().filter_map(|slot| slot.tcb.as_mut()) {
                tcb.switches_last = (tcb.switches - tcb.switches_mark) as u32;
                tcb.switches_mark = tcb.switches;

                let used = tcb.cpu_us - tcb.cpu_mark;
                tcb.load = if period > 0 {(used * 10_000 / period) as u32} else {0};
                tcb.cpu_mark = tcb.cpu_us;
            }
        });
    }
}
