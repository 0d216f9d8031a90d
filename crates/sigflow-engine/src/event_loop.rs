//! Master thread event loop
//!
//! Sleeps in poll(2) on a self-pipe plus every file descriptor registered
//! by poll functions. User threads write to the pipe to wake the master
//! after committing a transaction or requesting shutdown.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sigflow_core::{EngineError, EngineResult};

use crate::master::Master;

/// Self-pipe for waking a thread blocked in poll(2)
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> EngineResult<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(EngineError::Io(io::Error::last_os_error()));
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in fds {
            // SAFETY: fd was just returned by pipe(2)
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(pipe)
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn wake(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a valid stack location; a full pipe already means "woken"
        unsafe {
            libc::write(self.write_fd, (&byte as *const u8).cast(), 1);
        }
    }

    /// Drain pending wakeups
    pub fn flush(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a stack buffer of the given length
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this pipe
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn timeout_arg(timeout_ms: Option<u64>) -> libc::c_int {
    match timeout_ms {
        Some(ms) => ms.min(libc::c_int::MAX as u64) as libc::c_int,
        None => -1,
    }
}

/// Body of the master thread; returns once `quit` is raised
pub(crate) fn run_master(mut master: Master, waker: Arc<WakePipe>, quit: Arc<AtomicBool>) {
    log::info!("Master thread started");
    let mut pollfds: Vec<libc::pollfd> = Vec::new();

    while !quit.load(Ordering::Acquire) {
        let mut timeout_ms = None;
        let mut need_dispatch = master.prepare(&mut timeout_ms);

        if !need_dispatch {
            pollfds.clear();
            pollfds.push(libc::pollfd {
                fd: waker.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            pollfds.extend(master.poll_fds().map(|pfd| libc::pollfd {
                fd: pfd.fd,
                events: pfd.events,
                revents: 0,
            }));

            // SAFETY: `pollfds` is a live, correctly sized array of pollfd
            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_arg(timeout_ms),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    log::error!("master poll failed: {}", err);
                }
            }
            waker.flush();

            for (pfd, polled) in master.poll_fds().zip(&pollfds[1..]) {
                pfd.revents = polled.revents;
            }
            if quit.load(Ordering::Acquire) {
                break;
            }
            need_dispatch = master.check(ret >= 0);
        }

        if need_dispatch {
            master.dispatch();
        }
    }

    drop(master);
    log::info!("Master thread exiting");
}
