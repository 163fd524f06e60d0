/*!
This crate for Rust provides a small preemptive priority scheduler for microcontrollers,
with timers, mutexes, condition variables and multi-object waits.

# Target

**Single-core** systems of

* Cortex-M3  (`thumbv7m-none-eabi`)
* Cortex-M4 / M7  (`thumbv7em-none-eabi`)
* Cortex-M4 / M7 with FPU  (`thumbv7em-none-eabihf`)
* Cortex-M33 / M35P  (`thumbv8m.main-none-eabi`)

plus a deterministic simulation on a hosted OS (feature `std`, on by default),
which runs every task on its own thread but one at a time, against a simulated clock.

# Features

* Task like that of a typical RTOS
  * Closures are created as tasks at any time, before or after the kernel runs.
  * A task is joinable, or detached and reclaimed by a background task manager.
* Priority-based dispatching
  * 32 priorities; a higher priority task preempts lower priority tasks.
  * Round-robin dispatching within the same priority tasks.
* Synchronization
  * `Mutex`: priority-ordered wait list, optional deadline.
  * `CondVar`: unlock, sleep and relock as one step; `signal` and `broadcast`.
  * `Kernel::poll`: waits on any of several condition variables and streams.
  * `MsgQueue`: bounded task-to-task message passing.
* Timers
  * Deadline-ordered software timers, driven by a periodic or tickless clock.
* Mutual exclusion is interrupt-priority masking only; nothing spins.

# Examples
## Hosted Simulation

```
use minisched_cortex_m::*;

let k = Kernel::new(HostArch::new(SimConfig::default()), Config::default()).into_static();
let q = std::sync::Arc::new(MsgQueue::<u32>::new(k, "numbers", 2));

let tx = q.clone();
k.create(move |k| for i in 0..4 { tx.send(k, i); }, 256, "producer", TaskFlags::empty(), 1);

let rx = q.clone();
let consumer = k.create(move |k| {
    let sum: u32 = (0..4).map(|_| rx.receive(k)).sum();
    assert_eq!(sum, 6);
}, 256, "consumer", TaskFlags::empty(), 2);

assert_eq!(k.run().reason, HaltReason::AllTasksDone);
assert_eq!(k.task_state(consumer), Some(TaskState::Zombie));
```

## Cortex-M

See [`arch::cortex_m`].
*/

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

#[doc(hidden)]
pub mod kpanic;

mod memory;
mod list;
mod timer;
mod task;
mod config;
pub mod arch;
mod kernel;
mod mutex;
mod condvar;
mod poll;
mod stream;
mod taskmgr;

pub use crate::arch::{Arch, InterruptGate, IrqLevel};
pub use crate::config::Config;
pub use crate::kernel::{Kernel, Timer};
pub use crate::memory::{Heap, TaskHeap, TaskMem, STACK_FILL, REDZONE_FILL};
pub use crate::task::{TaskId, TaskFlags, TaskState, TaskInfo, TaskName, TASK_PRIOS, TASK_NAME_LEN};
pub use crate::mutex::Mutex;
pub use crate::condvar::CondVar;
pub use crate::poll::PollCond;
pub use crate::stream::{Stream, PollDir, MsgQueue};

#[cfg(feature = "std")]
pub use crate::arch::host::{HostArch, HostContext, SimConfig, SimExit, HaltReason};
