//! Child process supervision.
//!
//! The shell and the X bridge both fork long-running helpers (the
//! desktop-shell client, the X server) and need to know when they die.
//! SIGCHLD is translated to a byte on a self-pipe by `signal-hook`; a
//! calloop source drains the pipe, reaps every exited child with
//! `wait(NOHANG)` and runs the cleanup registered for its pid. Cleanups run
//! at most once, on the event loop, with full access to the compositor
//! state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction};
use rustix::pipe::{pipe_with, PipeFlags};
use rustix::process::{Pid, WaitOptions, WaitStatus};
use tracing::{debug, warn};

type Cleanup<D> = Box<dyn FnOnce(&mut D, WaitStatus)>;

/// Remove the `FD_CLOEXEC` flag so a fd survives `exec()` into a child.
///
/// Meant for `Command::pre_exec` closures, which only get a raw fd.
pub(crate) fn unset_cloexec(fd: std::os::unix::io::RawFd) -> io::Result<()> {
    let fd = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(fd) };
    rustix::io::fcntl_setfd(fd, rustix::io::FdFlags::empty())?;
    Ok(())
}

/// Registry of supervised child processes.
///
/// Obtained from [`ChildSupervisor::install`]; cheap to clone, all clones
/// share the same pid table.
pub struct ChildSupervisor<D> {
    cleanups: Rc<RefCell<HashMap<i32, Cleanup<D>>>>,
}

impl<D> Clone for ChildSupervisor<D> {
    fn clone(&self) -> Self {
        ChildSupervisor {
            cleanups: self.cleanups.clone(),
        }
    }
}

impl<D> std::fmt::Debug for ChildSupervisor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSupervisor")
            .field("watched", &self.cleanups.borrow().len())
            .finish()
    }
}

impl<D: 'static> ChildSupervisor<D> {
    /// Register the SIGCHLD handler and insert the reaping source into the
    /// event loop.
    ///
    /// Must be called once, before any supervised child is spawned.
    pub fn install(handle: &LoopHandle<'static, D>) -> io::Result<ChildSupervisor<D>> {
        let (read, write) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGCHLD, write)?;

        let supervisor = ChildSupervisor {
            cleanups: Rc::new(RefCell::new(HashMap::new())),
        };

        let cleanups = supervisor.cleanups.clone();
        handle
            .insert_source(
                Generic::new(read, Interest::READ, Mode::Level),
                move |_, pipe, data| {
                    let mut buf = [0u8; 64];
                    while matches!(rustix::io::read(&**pipe, &mut buf), Ok(n) if n > 0) {}

                    loop {
                        match rustix::process::wait(WaitOptions::NOHANG) {
                            Ok(Some((pid, status))) => {
                                let cleanup = cleanups.borrow_mut().remove(&pid.as_raw_nonzero().get());
                                match cleanup {
                                    Some(cleanup) => cleanup(data, status),
                                    None => {
                                        debug!(pid = pid.as_raw_nonzero().get(), "Reaped unwatched child")
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(rustix::io::Errno::CHILD) => break,
                            Err(err) => {
                                warn!(?err, "wait() failed while reaping children");
                                break;
                            }
                        }
                    }

                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        Ok(supervisor)
    }

    /// Run `cleanup` on the event loop once the child with `pid` exits.
    pub fn watch(&self, pid: Pid, cleanup: impl FnOnce(&mut D, WaitStatus) + 'static) {
        self.cleanups
            .borrow_mut()
            .insert(pid.as_raw_nonzero().get(), Box::new(cleanup));
    }

    /// Drop the cleanup registered for `pid`, if any.
    pub fn forget(&self, pid: Pid) {
        self.cleanups.borrow_mut().remove(&pid.as_raw_nonzero().get());
    }
}
