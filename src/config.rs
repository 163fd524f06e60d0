/// Kernel tunables
///
/// ```
/// use minisched_cortex_m::Config;
///
/// let config = Config::default()
///     .with_task_manager_prio(4)
///     .with_accounting_period(None);
/// assert!(config.task_manager);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config
{
    /// Start the background task manager, which reclaims detached tasks.
    pub task_manager: bool,
    pub task_manager_prio: u8,
    pub task_manager_stack: usize,
    /// Period of the per-task context switch accounting; `None` disables it.
    pub accounting_period_us: Option<u64>
}

impl Default for Config
{
    fn default() -> Config
    {
        Config {
            task_manager: true,
            task_manager_prio: 3,
            task_manager_stack: 256,
            accounting_period_us: Some(1_000_000)
        }
    }
}

impl Config
{
    pub fn with_task_manager(mut self, enable: bool) -> Config
    {
        self.task_manager = enable;
        self
    }

    pub fn with_task_manager_prio(mut self, prio: u8) -> Config
    {
        self.task_manager_prio = prio;
        self
    }

    pub fn with_task_manager_stack(mut self, stack_size: usize) -> Config
    {
        self.task_manager_stack = stack_size;
        self
    }

    pub fn with_accounting_period(mut self, period_us: Option<u64>) -> Config
    {
        self.accounting_period_us = period_us;
        self
    }
}
