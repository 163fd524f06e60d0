use core::fmt;

use bitflags::bitflags;

/// Number of priority levels. `0` is the least urgent, `TASK_PRIOS - 1` the most.
pub const TASK_PRIOS: usize = 32;

/// Longest task name kept; longer names are truncated.
pub const TASK_NAME_LEN: usize = 15;

bitflags! {
    /// Task creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// Reserve a floating-point context area and let the task own the FPU.
        const FPU = 0x01;
        /// Allocate the stack from DMA-capable memory.
        const DMA_STACK = 0x02;
        /// Reclaimed by the task manager on exit instead of by `join`.
        const DETACHED = 0x04;
        /// Kernel service task; not counted as application work.
        const SYSTEM = 0x08;
    }
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState
{
    /// Executing, or in a ready queue waiting for the CPU.
    Running,
    /// Blocked on a wait list and/or a timer.
    Sleeping,
    /// Finished; resources not yet reclaimed.
    Zombie
}

impl TaskState
{
    pub(crate) fn letter(self) -> char
    {
        match self {
            TaskState::Running => 'R',
            TaskState::Sleeping => 'S',
            TaskState::Zombie => 'Z'
        }
    }
}

/// Task handle
///
/// A slot index plus a generation count, so a handle to a reclaimed task
/// is never mistaken for the task that reuses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId
{
    pub(crate) idx: u16,
    pub(crate) gen: u16
}

impl TaskId
{
    pub(crate) const fn new(idx: u16, gen: u16) -> TaskId
    {
        TaskId {
            idx,
            gen
        }
    }

    /// Packs the handle into a word, e.g. to pass it through a register.
    pub const fn to_raw(self) -> u32
    {
        ((self.gen as u32) << 16) | (self.idx as u32)
    }

    pub const fn from_raw(raw: u32) -> TaskId
    {
        TaskId {
            idx: raw as u16,
            gen: (raw >> 16) as u16
        }
    }
}

impl fmt::Display for TaskId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}.{}", self.idx, self.gen)
    }
}

/// Fixed-size task name, truncated on a character boundary
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskName
{
    buf: [u8; TASK_NAME_LEN],
    len: u8
}

impl TaskName
{
    pub fn new(name: &str) -> TaskName
    {
        let mut len = name.len().min(TASK_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }

        let mut buf = [0; TASK_NAME_LEN];
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);

        TaskName {
            buf,
            len: len as u8
        }
    }

    pub fn as_str(&self) -> &str
    {
        // only ever filled from a &str cut at a char boundary
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for TaskName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TaskName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one task, as listed by [`Kernel::tasks`](crate::Kernel::tasks)
#[derive(Debug, Clone)]
pub struct TaskInfo
{
    pub id: TaskId,
    pub name: TaskName,
    pub prio: u8,
    pub state: TaskState,
    pub flags: TaskFlags,
    pub stack_size: usize,
    /// Times the task was switched in, since creation.
    pub ctx_switches: u64,
    /// Times the task was switched in during the last accounting period.
    pub ctx_switches_last_period: u32,
    /// Time spent running since creation, in microseconds.
    pub cpu_us: u64,
    /// Share of the last accounting period spent running, in hundredths of a percent.
    pub load: u32,
    /// Name of the wait list or call the task sleeps in; empty unless sleeping.
    pub wchan: &'static str
}

impl fmt::Display for TaskInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, " {:<15} {:>6} {:>3} {}{}{} {:>7} {:>3}.{:02}% {}",
               self.name,
               self.stack_size,
               self.prio,
               self.state.letter(),
               if self.flags.contains(TaskFlags::FPU) {'F'} else {' '},
               if self.flags.contains(TaskFlags::DETACHED) {'d'} else {' '},
               self.ctx_switches_last_period,
               self.load / 100,
               self.load % 100,
               self.wchan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_name_truncation() {
        assert_eq!(TaskName::new("taskmgmt").as_str(), "taskmgmt");
        assert_eq!(TaskName::new("a-very-long-task-name").as_str(), "a-very-long-tas");
        // multi-byte character straddling the limit is dropped whole
        assert_eq!(TaskName::new("abcdefghijklmn\u{e9}").as_str(), "abcdefghijklmn");
    }

    #[test]
    fn test_raw_handle() {
        let id = TaskId::new(7, 3);
        assert_eq!(id.to_raw(), 0x0003_0007);
        assert_eq!(TaskId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn test_listing_line() {
        let info = TaskInfo {
            id: TaskId::new(3, 0),
            name: TaskName::new("sampler"),
            prio: 2,
            state: TaskState::Sleeping,
            flags: TaskFlags::FPU,
            stack_size: 512,
            ctx_switches: 40,
            ctx_switches_last_period: 12,
            cpu_us: 900,
            load: 2_507,
            wchan: "samples"
        };

        assert_eq!(info.to_string(), " sampler            512   2 SF       12  25.07% samples");
    }

    #[test]
    fn test_flags() {
        let f = TaskFlags::DETACHED | TaskFlags::FPU;
        assert!(f.contains(TaskFlags::FPU));
        assert!(!f.contains(TaskFlags::DMA_STACK));
    }
}
