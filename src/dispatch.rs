use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, trace};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::Error;

/// Callback invoked when a registered descriptor has input pending. The
/// dispatcher hands itself back in so the callback can register and cancel
/// entries while it runs.
pub type IoCallback = Rc<dyn Fn(&mut Dispatcher, RawFd) -> Result<(), Error>>;

/// Callback invoked when a timer deadline expires. The entry is removed
/// before the callback runs, so the call consumes it; re-arming means
/// scheduling a fresh entry.
pub type TimerCallback = Box<dyn FnOnce(&mut Dispatcher) -> Result<(), Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct IoEntry {
    id: u64,
    fd: RawFd,
    cb: IoCallback,
    label: &'static str,
}

struct TimerEntry {
    id: u64,
    deadline: Instant,
    cb: TimerCallback,
    label: &'static str,
}

/// Single-threaded event dispatcher: an unordered set of readable
/// registrations plus a deadline-ordered list of timers, drained by
/// [`run`](Dispatcher::run). Callbacks run to completion one at a time; the
/// loop only suspends inside the readiness wait.
#[derive(Default)]
pub struct Dispatcher {
    ios: Vec<IoEntry>,
    timers: Vec<TimerEntry>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register `cb` to run whenever `fd` has input pending. Duplicate
    /// registrations of the same descriptor fire once each per readiness.
    pub fn register_readable(&mut self, fd: RawFd, cb: IoCallback, label: &'static str) -> IoHandle {
        let id = self.next_id();

        trace!("register readable: {label}[fd: {fd}]");
        self.ios.push(IoEntry { id, fd, cb, label });

        IoHandle(id)
    }

    /// Drop a readable registration. Unknown handles are ignored.
    pub fn unregister_readable(&mut self, handle: IoHandle) {
        if let Some(at) = self.ios.iter().position(|e| e.id == handle.0) {
            let entry = self.ios.remove(at);
            trace!("unregister readable: {}[fd: {}]", entry.label, entry.fd);
        }
    }

    /// Schedule `cb` to run once `deadline` has passed. Timers with equal
    /// deadlines fire in the order they were scheduled.
    pub fn schedule_timer(
        &mut self,
        deadline: Instant,
        cb: TimerCallback,
        label: &'static str,
    ) -> TimerHandle {
        let id = self.next_id();
        let at = self
            .timers
            .iter()
            .position(|e| deadline < e.deadline)
            .unwrap_or(self.timers.len());

        self.timers.insert(at, TimerEntry { id, deadline, cb, label });

        TimerHandle(id)
    }

    /// Cancel a pending timer. Unknown handles are ignored; a timer already
    /// popped for dispatch can no longer be cancelled.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        if let Some(at) = self.timers.iter().position(|e| e.id == handle.0) {
            let entry = self.timers.remove(at);
            trace!("cancel timer: {}", entry.label);
        }
    }

    /// One wait-and-dispatch cycle: wait until the head timer is due or a
    /// descriptor becomes readable, then run either that one timer callback
    /// or every ready readable callback. Returns `Ok(false)` once nothing is
    /// registered any more.
    pub fn step(&mut self) -> Result<bool, Error> {
        if self.ios.is_empty() && self.timers.is_empty() {
            return Ok(false);
        }

        let mut fds: Vec<PollFd> = self
            .ios
            .iter()
            .map(|e| PollFd::new(e.fd, PollFlags::POLLIN))
            .collect();

        let timeout = match self.timers.first() {
            Some(head) => {
                let left = head.deadline.saturating_duration_since(Instant::now());
                let ms: i32 = left.as_millis().try_into().unwrap_or(i32::MAX);

                // Round up so the wakeup never lands just short of the
                // deadline.
                if Duration::from_millis(ms as u64) < left {
                    ms.saturating_add(1)
                } else {
                    ms
                }
            }
            None => -1,
        };

        let ready = match poll(&mut fds, timeout) {
            Ok(n) => n,
            // An interrupted wait just restarts the cycle.
            Err(Errno::EINTR) => return Ok(true),
            Err(err) => {
                error!("poll failed: {err}");
                return Err(err.into());
            }
        };

        if ready == 0 {
            // Timeout: exactly one timer fires per wakeup. poll's millisecond
            // granularity can wake a hair early; leave the entry in place and
            // go around again in that case.
            let now = Instant::now();

            if self.timers.first().map_or(false, |e| e.deadline <= now) {
                let entry = self.timers.remove(0);
                trace!("timeout: {}", entry.label);
                (entry.cb)(self)?;
            }

            return Ok(true);
        }

        // Snapshot the ready entries before dispatching; callbacks are free
        // to mutate both registers while they run.
        let fired: Vec<(RawFd, IoCallback, &'static str)> = fds
            .iter()
            .zip(self.ios.iter())
            .filter(|(pfd, _)| {
                pfd.revents().map_or(false, |r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                })
            })
            .map(|(_, e)| (e.fd, Rc::clone(&e.cb), e.label))
            .collect();

        for (fd, cb, label) in fired {
            trace!("readable: {label}[fd: {fd}]");
            cb(self, fd)?;
        }

        Ok(true)
    }

    /// Dispatch until every registration is gone or a callback fails.
    pub fn run(&mut self) -> Result<(), Error> {
        while self.step()? {}

        Ok(())
    }
}

#[cfg(test)]
impl Dispatcher {
    pub(crate) fn io_count(&self) -> usize {
        self.ios.len()
    }

    pub(crate) fn timer_count(&self) -> usize {
        self.timers.len()
    }
}
