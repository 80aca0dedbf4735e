// src/os/epoll.rs

//! Thin `epoll` wrapper over raw `libc` calls, used to wait on the release
//! sources (terminal input, signalfd) with a timeout.

use anyhow::{Context, Result};
use bitflags::bitflags;
use log::{debug, trace, warn};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

const EPOLL_CREATE_CLOEXEC: libc::c_int = libc::O_CLOEXEC;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub flags: EpollFlags,
}

impl From<&libc::epoll_event> for Readiness {
    fn from(event: &libc::epoll_event) -> Self {
        // Copy out of the packed struct before use.
        let token = event.u64;
        let events = event.events;
        Readiness {
            token,
            flags: EpollFlags::from_bits_truncate(events),
        }
    }
}

const MAX_EVENTS_BUFFER_SIZE: usize = 8;

#[derive(Debug)]
pub struct EventMonitor {
    epoll_fd: RawFd,
    event_buffer: [libc::epoll_event; MAX_EVENTS_BUFFER_SIZE],
}

impl EventMonitor {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(EPOLL_CREATE_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error())
                .context("Failed to create epoll instance (epoll_create1)");
        }
        debug!("EventMonitor created with epoll_fd: {}", epoll_fd);
        Ok(Self {
            epoll_fd,
            event_buffer: [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS_BUFFER_SIZE],
        })
    }

    /// Watches `fd`; readiness is reported under `token`.
    pub fn add(&self, fd: BorrowedFd<'_>, token: u64, flags: EpollFlags) -> Result<()> {
        let raw = fd.as_raw_fd();
        let mut event = libc::epoll_event {
            events: flags.bits(),
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, raw, &mut event) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to add fd {} to epoll (token: {})", raw, token));
        }
        trace!(
            "Added fd {} to epoll_fd {} with token {} and flags {:?}",
            raw,
            self.epoll_fd,
            token,
            flags
        );
        Ok(())
    }

    /// Waits up to `timeout_ms` (-1 blocks indefinitely). An interrupted wait
    /// returns no events.
    pub fn events(&mut self, timeout_ms: i32) -> Result<Vec<Readiness>> {
        trace!(
            "EventMonitor: polling with timeout {}ms on epoll_fd {}",
            timeout_ms,
            self.epoll_fd
        );

        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                MAX_EVENTS_BUFFER_SIZE as libc::c_int,
                timeout_ms,
            )
        };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("EventMonitor: epoll_wait interrupted (EINTR)");
                return Ok(Vec::new());
            }
            return Err(err).context("epoll_wait failed in EventMonitor");
        }

        Ok(self.event_buffer[..num_events as usize]
            .iter()
            .map(Readiness::from)
            .collect())
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "Failed to close epoll_fd {} in EventMonitor::drop: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        } else {
            debug!("Closed epoll_fd {}", self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsFd;

    #[test_log::test]
    fn times_out_with_no_events() {
        let (reader, _writer) = pipe().unwrap();
        let mut monitor = EventMonitor::new().unwrap();
        monitor.add(reader.as_fd(), 7, EpollFlags::EPOLLIN).unwrap();
        assert!(monitor.events(10).unwrap().is_empty());
    }

    #[test_log::test]
    fn reports_readable_fd_under_its_token() {
        let (reader, writer) = pipe().unwrap();
        let mut monitor = EventMonitor::new().unwrap();
        monitor.add(reader.as_fd(), 7, EpollFlags::EPOLLIN).unwrap();
        write(&writer, b"q").unwrap();

        let events = monitor.events(1000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].flags.contains(EpollFlags::EPOLLIN));
    }

    #[test_log::test]
    fn closed_writer_reports_hang_up() {
        let (reader, writer) = pipe().unwrap();
        let mut monitor = EventMonitor::new().unwrap();
        monitor.add(reader.as_fd(), 3, EpollFlags::EPOLLIN).unwrap();
        drop(writer);

        let events = monitor.events(1000).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].flags.contains(EpollFlags::EPOLLHUP));
    }

    #[test_log::test]
    fn adding_twice_fails() {
        let (reader, _writer) = pipe().unwrap();
        let monitor = EventMonitor::new().unwrap();
        monitor.add(reader.as_fd(), 1, EpollFlags::EPOLLIN).unwrap();
        assert!(monitor.add(reader.as_fd(), 2, EpollFlags::EPOLLIN).is_err());
    }
}
