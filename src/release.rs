// src/release.rs

//! Release signals: what the pipeline blocks on while the display is showing
//! the committed buffer.

use std::fmt;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info, trace, warn};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::os::epoll::{EpollFlags, EventMonitor};

/// Why the wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Input arrived (or the input reached end of file).
    Input,
    /// A termination signal, by number.
    Signal(i32),
    Timeout,
    /// The release source went away.
    Cancelled,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseReason::Input => f.write_str("input"),
            ReleaseReason::Signal(signo) => match Signal::try_from(*signo) {
                Ok(signal) => write!(f, "signal {}", signal.as_str()),
                Err(_) => write!(f, "signal {signo}"),
            },
            ReleaseReason::Timeout => f.write_str("timeout"),
            ReleaseReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Blocks until the display should be torn down.
pub trait ReleaseSignal {
    fn wait(&mut self) -> Result<ReleaseReason>;
}

impl<F> ReleaseSignal for F
where
    F: FnMut() -> Result<ReleaseReason>,
{
    fn wait(&mut self) -> Result<ReleaseReason> {
        self()
    }
}

/// The signals that end a run instead of killing the process.
pub fn termination_signals() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask
}

/// Blocks the termination signals on the calling thread. Call before any other
/// thread exists so the mask is inherited; a signal arriving at any stage then
/// stays pending until a [`TerminalRelease`] reads it.
pub fn block_termination_signals() -> Result<()> {
    termination_signals()
        .thread_block()
        .context("Failed to block termination signals")
}

const INPUT_TOKEN: u64 = 1;
const SIGNAL_TOKEN: u64 = 2;

/// Waits on an input stream, termination signals and a timeout, whichever
/// fires first.
pub struct TerminalRelease<I> {
    monitor: EventMonitor,
    input: Option<I>,
    /// epoll refuses regular files and /dev/null; such input is always ready.
    input_unpollable: bool,
    signals: Option<SignalFd>,
    timeout: Option<Duration>,
}

impl<I: Read + AsFd> TerminalRelease<I> {
    pub fn new(input: Option<I>, watch_signals: bool, timeout: Option<Duration>) -> Result<Self> {
        let monitor = EventMonitor::new()?;
        let mut input_unpollable = false;
        if let Some(input) = &input {
            match monitor.add(input.as_fd(), INPUT_TOKEN, EpollFlags::EPOLLIN) {
                Ok(()) => {}
                Err(e) if is_unpollable(&e) => {
                    debug!("Release input cannot be polled; it will release immediately");
                    input_unpollable = true;
                }
                Err(e) => return Err(e),
            }
        }
        let signals = if watch_signals {
            let fd = SignalFd::with_flags(
                &termination_signals(),
                SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK,
            )
            .context("Failed to create signalfd")?;
            monitor.add(fd.as_fd(), SIGNAL_TOKEN, EpollFlags::EPOLLIN)?;
            Some(fd)
        } else {
            None
        };
        Ok(Self {
            monitor,
            input,
            input_unpollable,
            signals,
            timeout,
        })
    }

    /// A short human-readable hint for the user, e.g. "press Enter".
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.input.is_some() {
            parts.push("press Enter".to_string());
        }
        if self.signals.is_some() {
            parts.push("send SIGINT/SIGTERM".to_string());
        }
        if let Some(timeout) = self.timeout {
            parts.push(format!("wait {} ms", timeout.as_millis()));
        }
        parts.join(" or ")
    }

    fn drain_input(&mut self) -> Result<()> {
        if let Some(input) = self.input.as_mut() {
            let mut buf = [0u8; 256];
            let n = input.read(&mut buf).context("Failed to read release input")?;
            trace!("Read {} bytes of release input", n);
        }
        Ok(())
    }

    fn read_signal(&mut self) -> Result<Option<i32>> {
        let Some(signals) = self.signals.as_mut() else {
            return Ok(None);
        };
        let info = signals.read_signal().context("Failed to read signalfd")?;
        Ok(info.map(|info| info.ssi_signo as i32))
    }

    fn input_fd(&self) -> Option<BorrowedFd<'_>> {
        self.input.as_ref().map(AsFd::as_fd)
    }
}

impl<I: Read + AsFd> ReleaseSignal for TerminalRelease<I> {
    fn wait(&mut self) -> Result<ReleaseReason> {
        if self.input_fd().is_none() && self.signals.is_none() && self.timeout.is_none() {
            bail!("No release source configured");
        }
        if self.input_unpollable {
            self.drain_input()?;
            return Ok(ReleaseReason::Input);
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        info!("Waiting for release: {}", self.describe());

        loop {
            let timeout_ms = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(ReleaseReason::Timeout);
                    }
                    // Round up so the loop never spins on a sub-millisecond remainder.
                    i32::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(i32::MAX)
                }
                None => -1,
            };

            // An interrupted wait comes back empty; loop against the same deadline.
            for ready in self.monitor.events(timeout_ms)? {
                match ready.token {
                    SIGNAL_TOKEN => {
                        if let Some(signo) = self.read_signal()? {
                            return Ok(ReleaseReason::Signal(signo));
                        }
                    }
                    INPUT_TOKEN if ready.flags.contains(EpollFlags::EPOLLERR) => {
                        warn!("Release input reported an error; cancelling the wait");
                        return Ok(ReleaseReason::Cancelled);
                    }
                    INPUT_TOKEN => {
                        if ready.flags.contains(EpollFlags::EPOLLHUP) {
                            debug!("Release input hung up");
                        }
                        self.drain_input()?;
                        return Ok(ReleaseReason::Input);
                    }
                    other => debug!("Ignoring readiness for unknown token {}", other),
                }
            }
        }
    }
}

fn is_unpollable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<io::Error>()
        .and_then(io::Error::raw_os_error)
        == Some(libc::EPERM)
}

/// Releases when a message arrives or every sender is gone.
pub struct ChannelRelease {
    receiver: Receiver<()>,
    timeout: Option<Duration>,
}

impl ChannelRelease {
    pub fn new(receiver: Receiver<()>) -> Self {
        Self {
            receiver,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl ReleaseSignal for ChannelRelease {
    fn wait(&mut self) -> Result<ReleaseReason> {
        let received = match self.timeout {
            Some(timeout) => self.receiver.recv_timeout(timeout),
            None => self
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        Ok(match received {
            Ok(()) => ReleaseReason::Input,
            Err(RecvTimeoutError::Timeout) => ReleaseReason::Timeout,
            Err(RecvTimeoutError::Disconnected) => ReleaseReason::Cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::fs::File;
    use std::sync::mpsc;

    fn pipe_input() -> (File, std::os::fd::OwnedFd) {
        let (reader, writer) = pipe().unwrap();
        (File::from(reader), writer)
    }

    #[test_log::test]
    fn times_out_without_input() {
        let (reader, _writer) = pipe_input();
        let mut release =
            TerminalRelease::new(Some(reader), false, Some(Duration::from_millis(20))).unwrap();
        let started = Instant::now();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test_log::test]
    fn a_line_of_input_releases() {
        let (reader, writer) = pipe_input();
        write(&writer, b"\n").unwrap();
        let mut release = TerminalRelease::new(Some(reader), false, None).unwrap();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Input);
    }

    #[test_log::test]
    fn end_of_input_releases() {
        let (reader, writer) = pipe_input();
        drop(writer);
        let mut release =
            TerminalRelease::new(Some(reader), false, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Input);
    }

    #[test_log::test]
    fn unpollable_input_releases_at_once() {
        let null = File::open("/dev/null").unwrap();
        let mut release =
            TerminalRelease::new(Some(null), false, Some(Duration::from_secs(5))).unwrap();
        let started = Instant::now();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Input);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test_log::test]
    fn termination_signal_releases_through_the_signalfd() {
        block_termination_signals().unwrap();
        let mut release =
            TerminalRelease::<File>::new(None, true, Some(Duration::from_secs(2))).unwrap();
        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Signal(libc::SIGTERM));
    }

    #[test_log::test]
    fn input_error_cancels_the_wait() {
        // The write end of a pipe whose reader is gone polls as EPOLLERR.
        let (reader, writer) = pipe().unwrap();
        drop(reader);
        let mut release =
            TerminalRelease::new(Some(File::from(writer)), false, Some(Duration::from_secs(2)))
                .unwrap();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Cancelled);
    }

    #[test_log::test]
    fn nothing_to_wait_on_is_an_error() {
        let mut release = TerminalRelease::<File>::new(None, false, None).unwrap();
        assert!(release.wait().is_err());
    }

    #[test_log::test]
    fn describe_lists_every_source() {
        let (reader, _writer) = pipe_input();
        let release =
            TerminalRelease::new(Some(reader), false, Some(Duration::from_millis(1500))).unwrap();
        assert_eq!(release.describe(), "press Enter or wait 1500 ms");
    }

    #[test_log::test]
    fn channel_release_reports_message_and_disconnect() {
        let (tx, rx) = mpsc::channel();
        let mut release = ChannelRelease::new(rx);
        tx.send(()).unwrap();
        assert_eq!(release.wait().unwrap(), ReleaseReason::Input);
        drop(tx);
        assert_eq!(release.wait().unwrap(), ReleaseReason::Cancelled);
    }

    #[test_log::test]
    fn channel_release_can_time_out() {
        let (_tx, rx) = mpsc::channel();
        let mut release = ChannelRelease::new(rx).with_timeout(Duration::from_millis(5));
        assert_eq!(release.wait().unwrap(), ReleaseReason::Timeout);
    }

    #[test_log::test]
    fn closures_are_release_signals() {
        let mut calls = 0;
        let mut release = || -> Result<ReleaseReason> {
            calls += 1;
            Ok(ReleaseReason::Cancelled)
        };
        assert_eq!(ReleaseSignal::wait(&mut release).unwrap(), ReleaseReason::Cancelled);
        drop(release);
        assert_eq!(calls, 1);
    }

    #[test]
    fn reasons_display_signal_names() {
        assert_eq!(ReleaseReason::Signal(libc::SIGTERM).to_string(), "signal SIGTERM");
        assert_eq!(ReleaseReason::Timeout.to_string(), "timeout");
    }
}
