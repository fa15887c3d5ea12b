/*
 * Copyright (C) 2025 The Arbor Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Timed event queue and the epoll wrapper behind the slave's single
//! cooperative loop. Events are either due immediately (exits drained
//! from the reaper pipe, weak destroys) or scheduled (respawns, the
//! periodic log rotation). Timers fire at or after their deadline, never
//! before; delivery handlers recheck container state, which is how stale
//! timers cancel themselves.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::arbor::util::current_time_ms;
use crate::arbor::util::error::{ArborError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A reaped descendant, correlated to the container owning the pid.
    Exit { pid: i32, status: i32 },
    /// The memory cgroup's OOM eventfd became readable.
    Oom { fd: RawFd },
    /// Periodic stream rotation for running containers.
    RotateLogs,
    Respawn { name: String },
    DestroyWeak { name: String },
}

#[derive(Debug)]
struct TimedEvent {
    due_ms: u64,
    seq: u64,
    event: Event,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for TimedEvent {}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we pop the earliest
        other
            .due_ms
            .cmp(&self.due_ms)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct EventQueue {
    heap: Mutex<BinaryHeap<TimedEvent>>,
    seq: Mutex<u64>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delay_ms: u64, event: Event) {
        let seq = {
            let mut seq = self.seq.lock().expect("event seq lock poisoned");
            *seq += 1;
            *seq
        };
        let due_ms = current_time_ms().saturating_add(delay_ms);
        self.heap
            .lock()
            .expect("event heap lock poisoned")
            .push(TimedEvent { due_ms, seq, event });
    }

    /// Milliseconds until the next timer, None when the queue is empty.
    pub fn next_delay_ms(&self) -> Option<u64> {
        let heap = self.heap.lock().expect("event heap lock poisoned");
        heap.peek()
            .map(|head| head.due_ms.saturating_sub(current_time_ms()))
    }

    /// Pops every event whose deadline has passed, in deadline order with
    /// insertion order as the tie-break.
    pub fn take_due(&self) -> Vec<Event> {
        let now = current_time_ms();
        let mut heap = self.heap.lock().expect("event heap lock poisoned");
        let mut due = Vec::new();
        while matches!(heap.peek(), Some(head) if head.due_ms <= now) {
            due.push(heap.pop().expect("peeked entry is poppable").event);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("event heap lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an epoll-registered descriptor belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTag {
    /// OOM eventfd bound to one container.
    Oom { container: String },
    /// A fixed descriptor the loop owns (pipes, signalfd, listen socket).
    Fixed,
}

/// Thin epoll wrapper with a fd -> tag registry. The slave registers the
/// reaper pipe, the signal fd and one OOM eventfd per running container.
pub struct EpollLoop {
    epoll: Epoll,
    sources: Mutex<HashMap<RawFd, SourceTag>>,
}

impl EpollLoop {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| ArborError::from(errno).wrap("epoll_create"))?;
        Ok(Self {
            epoll,
            sources: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_source(&self, fd: RawFd, tag: SourceTag) -> Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        self.epoll
            .add(unsafe { BorrowedFd::borrow_raw(fd) }, event)
            .map_err(|errno| ArborError::from(errno).wrap(format!("epoll add fd {}", fd)))?;
        self.sources
            .lock()
            .expect("epoll sources lock poisoned")
            .insert(fd, tag);
        Ok(())
    }

    pub fn remove_source(&self, fd: RawFd) {
        let _ = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
        self.sources
            .lock()
            .expect("epoll sources lock poisoned")
            .remove(&fd);
    }

    /// Masks a source without unregistering it; used to silence an OOM fd
    /// after its first event so it cannot flood the loop.
    pub fn stop_input(&self, fd: RawFd) {
        let mut event = EpollEvent::new(EpollFlags::empty(), fd as u64);
        let _ = self
            .epoll
            .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut event);
    }

    pub fn source(&self, fd: RawFd) -> Option<SourceTag> {
        self.sources
            .lock()
            .expect("epoll sources lock poisoned")
            .get(&fd)
            .cloned()
    }

    /// Waits for readiness, returning the ready fds. The only suspension
    /// point of the slave.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<Vec<RawFd>> {
        let timeout = match timeout_ms {
            Some(ms) => EpollTimeout::try_from(Duration::from_millis(ms))
                .unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };
        let mut events = [EpollEvent::empty(); 32];
        let count = self
            .epoll
            .wait(&mut events, timeout)
            .map_err(|errno| ArborError::from(errno).wrap("epoll_wait"))?;
        Ok(events[..count].iter().map(|ev| ev.data() as RawFd).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn due_events_pop_in_deadline_order() {
        let queue = EventQueue::new();
        queue.add(0, Event::RotateLogs);
        queue.add(
            0,
            Event::Exit {
                pid: 100,
                status: 0,
            },
        );
        queue.add(60_000, Event::Respawn { name: "rr".into() });

        let due = queue.take_due();
        assert_eq!(
            due,
            vec![
                Event::RotateLogs,
                Event::Exit {
                    pid: 100,
                    status: 0
                }
            ]
        );
        // the respawn timer stays queued
        assert_eq!(queue.len(), 1);
        assert!(queue.next_delay_ms().unwrap() > 0);
    }

    #[test]
    fn same_deadline_preserves_insertion_order() {
        let queue = EventQueue::new();
        for pid in 0..16 {
            queue.add(0, Event::Exit { pid, status: 0 });
        }
        let pids: Vec<i32> = queue
            .take_due()
            .into_iter()
            .map(|event| match event {
                Event::Exit { pid, .. } => pid,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(pids, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn timers_never_fire_early() {
        let queue = EventQueue::new();
        queue.add(10_000, Event::DestroyWeak { name: "w".into() });
        assert!(queue.take_due().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn epoll_reports_readable_pipe() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let epoll = EpollLoop::new().unwrap();
        epoll
            .add_source(read_end.as_raw_fd(), SourceTag::Fixed)
            .unwrap();

        let mut write_file = std::fs::File::from(write_end);
        write_file.write_all(b"x").unwrap();

        let ready = epoll.wait(Some(1000)).unwrap();
        assert_eq!(ready, vec![read_end.as_raw_fd()]);
        assert_eq!(epoll.source(read_end.as_raw_fd()), Some(SourceTag::Fixed));

        epoll.remove_source(read_end.as_raw_fd());
        assert_eq!(epoll.source(read_end.as_raw_fd()), None);
    }

    #[test]
    fn stopped_input_stays_silent() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let epoll = EpollLoop::new().unwrap();
        epoll
            .add_source(
                read_end.as_raw_fd(),
                SourceTag::Oom {
                    container: "web".into(),
                },
            )
            .unwrap();
        epoll.stop_input(read_end.as_raw_fd());

        let mut write_file = std::fs::File::from(write_end);
        write_file.write_all(b"x").unwrap();

        let ready = epoll.wait(Some(50)).unwrap();
        assert!(ready.is_empty());
    }
}
