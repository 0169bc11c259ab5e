//! SIGXCPU watchdog for processes running with fixed-priority scheduling.
//!
//! The kernel delivers SIGXCPU after a configured amount of process CPU
//! time. The handler compares accumulated CPU time against elapsed wall
//! time; at or above 70 % utilization it writes to a self-pipe and re-arms
//! the limit two seconds out. If the loop drains the pipe it gets to shut
//! down cleanly via `quit(1)`; if the second SIGXCPU arrives first, the
//! process is beyond saving and is terminated on the spot.

use std::{
    io,
    os::fd::RawFd,
    sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering},
};

use signal_hook::SigId;
use tracing::warn;

use crate::api::{Api, IoEvent, IoEvents};

/// Utilization threshold, percent.
const CPUTIME_PERCENT: i64 = 70;
/// CPU-time budget while healthy, seconds.
const CPUTIME_INTERVAL_SOFT: i64 = 10;
/// Grace budget after the soft limit tripped, seconds.
const CPUTIME_INTERVAL_HARD: i64 = 2;

const PHASE_IDLE: u8 = 0;
const PHASE_SOFT: u8 = 1;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);
static LAST_TIME: AtomicI64 = AtomicI64::new(0);
static PHASE: AtomicU8 = AtomicU8::new(PHASE_IDLE);

/// Schedules the next SIGXCPU `secs` of process CPU time from now.
fn reset_cpu_time(secs: i64) {
    unsafe {
        let mut ru: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut ru) < 0 {
            return;
        }
        let used = ru.ru_utime.tv_sec + ru.ru_stime.tv_sec;

        let mut rl: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_CPU, &mut rl) < 0 {
            return;
        }
        rl.rlim_cur = (used + secs) as libc::rlim_t;
        libc::setrlimit(libc::RLIMIT_CPU, &rl);
    }
}

// Runs in signal context: atomics, time(2), getrusage/setrlimit, write(2)
// and _exit(2) only.
fn on_sigxcpu() {
    let now = unsafe { libc::time(std::ptr::null_mut()) } as i64;

    match PHASE.load(Ordering::Relaxed) {
        PHASE_IDLE => {
            let elapsed = now - LAST_TIME.load(Ordering::Relaxed);
            if CPUTIME_INTERVAL_SOFT >= elapsed * CPUTIME_PERCENT / 100 {
                // Overloaded. Ask the loop to shut down and give it a short
                // grace period.
                let fd = PIPE_WR.load(Ordering::Relaxed);
                if fd >= 0 {
                    let b = [b'X'];
                    unsafe {
                        libc::write(fd, b.as_ptr().cast::<libc::c_void>(), 1);
                    }
                }
                PHASE.store(PHASE_SOFT, Ordering::Relaxed);
                reset_cpu_time(CPUTIME_INTERVAL_HARD);
            } else {
                reset_cpu_time(CPUTIME_INTERVAL_SOFT);
                LAST_TIME.store(now, Ordering::Relaxed);
            }
        }
        _ => {
            // The loop never drained the pipe within the grace period.
            unsafe { libc::_exit(1) };
        }
    }
}

/// Watchdog handle; dropping it uninstalls the handler, restores the
/// original CPU rlimit and closes the pipe.
pub struct CpuLimiter {
    io: IoEvent,
    pipe: [RawFd; 2],
    sig_id: Option<SigId>,
    saved_rlimit: Option<libc::rlimit>,
}

impl CpuLimiter {
    pub fn new(api: &Api) -> io::Result<Self> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "cpu limiter already installed in this process",
            ));
        }

        let mut pipe = [0; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            ACTIVE.store(false, Ordering::SeqCst);
            return Err(io::Error::last_os_error());
        }
        PIPE_WR.store(pipe[1], Ordering::SeqCst);
        LAST_TIME.store(unsafe { libc::time(std::ptr::null_mut()) } as i64, Ordering::SeqCst);
        PHASE.store(PHASE_IDLE, Ordering::SeqCst);

        let quit_api = Api::clone(api);
        let read_fd = pipe[0];
        let io = api.io_new(
            read_fd,
            IoEvents::INPUT,
            Box::new(move |_, _, _| {
                let mut b = [0u8; 1];
                unsafe {
                    libc::read(read_fd, b.as_mut_ptr().cast::<libc::c_void>(), 1);
                }
                warn!("soft CPU limit exhausted, shutting down");
                quit_api.quit(1);
            }),
        );

        let sig_id = match unsafe { signal_hook::low_level::register(libc::SIGXCPU, on_sigxcpu) } {
            Ok(id) => id,
            Err(e) => {
                io.free();
                PIPE_WR.store(-1, Ordering::SeqCst);
                unsafe {
                    libc::close(pipe[0]);
                    libc::close(pipe[1]);
                }
                ACTIVE.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let saved_rlimit = unsafe {
            let mut rl: libc::rlimit = std::mem::zeroed();
            (libc::getrlimit(libc::RLIMIT_CPU, &mut rl) == 0).then_some(rl)
        };

        reset_cpu_time(CPUTIME_INTERVAL_SOFT);

        Ok(Self { io, pipe, sig_id: Some(sig_id), saved_rlimit })
    }
}

impl Drop for CpuLimiter {
    fn drop(&mut self) {
        if let Some(id) = self.sig_id.take() {
            signal_hook::low_level::unregister(id);
        }
        if let Some(rl) = self.saved_rlimit {
            unsafe {
                libc::setrlimit(libc::RLIMIT_CPU, &rl);
            }
        }
        self.io.free();
        PIPE_WR.store(-1, Ordering::SeqCst);
        unsafe {
            libc::close(self.pipe[0]);
            libc::close(self.pipe[1]);
        }
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{Iterate, Mainloop};

    #[test]
    fn soft_trip_quits_the_loop() {
        let ml = Mainloop::new();
        let limiter = CpuLimiter::new(&ml.api()).unwrap();

        // Second instance is refused while the first is alive.
        assert!(CpuLimiter::new(&ml.api()).is_err());

        // Simulate the handler's soft path: poke the pipe directly.
        let fd = PIPE_WR.load(Ordering::SeqCst);
        let b = [b'X'];
        unsafe {
            libc::write(fd, b.as_ptr().cast::<libc::c_void>(), 1);
        }

        let mut quit = None;
        for _ in 0..10 {
            if let Iterate::Quit(r) = ml.iterate(true).unwrap() {
                quit = Some(r);
                break;
            }
        }
        assert_eq!(quit, Some(1));

        drop(limiter);
        let again = CpuLimiter::new(&ml.api()).unwrap();
        drop(again);
    }
}
