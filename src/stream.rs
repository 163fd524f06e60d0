use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::Arch;
use crate::condvar::CondVar;
use crate::kernel::Kernel;
use crate::mutex::Mutex;
use crate::k_assert;

//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDir
{
    Read,
    Write
}

/// Pollable byte or message stream
pub trait Stream
{
    /// `None` if an operation in `dir` would not block now; otherwise the
    /// condition signalled when that may have changed.
    ///
    /// Called with the interrupt gate raised; must not block.
    fn pending(&self, dir: PollDir) -> Option<&CondVar>;
}

//

/// Bounded message queue for task-to-task communication
///
/// `send` blocks while the queue is full and `receive` while it is empty.
/// The queue is a [`Stream`]: readable when it holds a message, writable
/// when it has room.
pub struct MsgQueue<M>
{
    lock: Mutex,
    readable: CondVar,
    writable: CondVar,
    buf: spin::Mutex<VecDeque<M>>,
    len: AtomicUsize,
    cap: usize
}

impl<M> MsgQueue<M>
{
    pub fn new<A: Arch>(k: &Kernel<A>, name: &'static str, cap: usize) -> MsgQueue<M>
    {
        k_assert!(cap > 0, "message queue {} without capacity", name);

        MsgQueue {
            lock: Mutex::new(k, name),
            readable: CondVar::new(k, name),
            writable: CondVar::new(k, name),
            buf: spin::Mutex::new(VecDeque::with_capacity(cap)),
            len: AtomicUsize::new(0),
            cap
        }
    }

    /// Gives the queue's wait lists back to the kernel. Queued messages are dropped.
    pub fn destroy<A: Arch>(self, k: &Kernel<A>)
    {
        self.lock.destroy(k);
        self.readable.destroy(k);
        self.writable.destroy(k);
    }

    pub fn capacity(&self) -> usize
    {
        self.cap
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize
    {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// Number of messages that can be sent without blocking.
    pub fn vacant(&self) -> usize
    {
        self.cap - self.len()
    }

    // buf is only touched with `lock` held
    fn push(&self, msg: M)
    {
        let mut buf = self.buf.lock();
        buf.push_back(msg);
        self.len.store(buf.len(), Ordering::Relaxed);
    }

    fn pop(&self) -> Option<M>
    {
        let mut buf = self.buf.lock();
        let msg = buf.pop_front();
        self.len.store(buf.len(), Ordering::Relaxed);
        msg
    }

    /// Sends a message, blocking while the queue is full.
    pub fn send<A: Arch>(&self, k: &Kernel<A>, msg: M)
    {
        self.lock.lock(k);

        while self.len() >= self.cap {
            self.writable.wait(k, &self.lock);
        }
        self.push(msg);

        self.readable.signal(k);
        self.lock.unlock(k);
    }

    /// Sends a message if there is room; gives it back otherwise.
    pub fn try_send<A: Arch>(&self, k: &Kernel<A>, msg: M) -> Result<(), M>
    {
        self.lock.lock(k);

        let r = if self.len() < self.cap {
            self.push(msg);
            self.readable.signal(k);
            Ok(())
        }
        else {
            Err(msg)
        };

        self.lock.unlock(k);
        r
    }

    /// Receives a message, blocking while the queue is empty.
    pub fn receive<A: Arch>(&self, k: &Kernel<A>) -> M
    {
        self.lock.lock(k);

        let msg = loop {
            if let Some(msg) = self.pop() {
                break msg;
            }
            self.readable.wait(k, &self.lock);
        };

        self.writable.signal(k);
        self.lock.unlock(k);
        msg
    }

    pub fn try_receive<A: Arch>(&self, k: &Kernel<A>) -> Option<M>
    {
        self.lock.lock(k);

        let msg = self.pop();
        if msg.is_some() {
            self.writable.signal(k);
        }

        self.lock.unlock(k);
        msg
    }
}

impl<M> Stream for MsgQueue<M>
{
    fn pending(&self, dir: PollDir) -> Option<&CondVar>
    {
        match dir {
            PollDir::Read if self.len() == 0 => Some(&self.readable),
            PollDir::Write if self.len() >= self.cap => Some(&self.writable),
            _ => None
        }
    }
}
