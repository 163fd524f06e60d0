#![allow(dead_code)]

use std::sync::{Arc, Mutex as StdMutex};

use minisched_cortex_m::*;

pub type K = &'static Kernel<HostArch>;

/// Kernel on a tickless simulation, without the task manager.
pub fn kernel() -> K
{
    kernel_with(SimConfig::default())
}

pub fn kernel_with(sim: SimConfig) -> K
{
    Kernel::new(HostArch::new(sim), Config::default().with_task_manager(false)).into_static()
}

/// Event log shared by the tasks of one test
#[derive(Clone, Default)]
pub struct Log(Arc<StdMutex<Vec<String>>>);

impl Log
{
    pub fn push(&self, ev: impl Into<String>)
    {
        self.0.lock().unwrap().push(ev.into());
    }

    pub fn take(&self) -> Vec<String>
    {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}
