//! Display locks and listening sockets for the X server.
//!
//! Finding a free display number is a filesystem protocol shared with
//! every other X server on the machine: atomically create
//! `/tmp/.X{N}-lock` containing the owner's pid, then bind the abstract
//! and filesystem sockets under `/tmp/.X11-unix/`. The lock file format is
//! fixed at exactly 11 bytes, the pid as `%10d` plus a newline, and must
//! not change.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::OwnedFd;

use rustix::net::{self, AddressFamily, SocketAddrUnix, SocketFlags, SocketType};
use tracing::{debug, info, warn};

use super::XWaylandError;

fn lockfile_path(display: u32) -> String {
    format!("/tmp/.X{}-lock", display)
}

fn socket_path(display: u32) -> String {
    format!("/tmp/.X11-unix/X{}", display)
}

/// Find a free display slot, grab its lock file and bind its sockets.
///
/// Returns the lock guard plus the abstract and filesystem listening
/// sockets, in that order.
pub(crate) fn prepare_x11_sockets(
    max_displays: u32,
) -> Result<(X11Lock, [OwnedFd; 2]), XWaylandError> {
    for display in 0..max_displays {
        if let Ok(lock) = X11Lock::grab(display) {
            match open_x11_sockets_for_display(display) {
                Ok(sockets) => {
                    let display_num = display;
                    info!(display = display_num, "X server socket bound");
                    return Ok((lock, sockets));
                }
                Err(err) => {
                    // Somebody is squatting the socket without holding the
                    // lock file; move on to the next slot.
                    let display_num = display;
                    debug!(display = display_num, ?err, "Could not bind X11 sockets");
                }
            }
        }
    }
    Err(XWaylandError::NoFreeDisplay)
}

/// Guard owning a display number; removes the lock file and the
/// filesystem socket on drop.
#[derive(Debug)]
pub(crate) struct X11Lock {
    display: u32,
}

impl X11Lock {
    fn grab(display: u32) -> Result<X11Lock, ()> {
        let path = lockfile_path(display);
        let lockfile = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o444)
            .open(&path);

        match lockfile {
            Ok(mut file) => {
                // The pid written is the compositor's, not the X server's:
                // the lock belongs to whoever set the display up.
                let pid = rustix::process::getpid();
                let contents = format!("{:>10}\n", pid.as_raw_nonzero().get());
                debug_assert_eq!(contents.len(), 11);
                if file.write_all(contents.as_bytes()).is_err() {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    return Err(());
                }
                Ok(X11Lock { display })
            }
            Err(_) => {
                // The file exists; if it names a dead process the previous
                // server crashed without cleaning up and we can take over.
                let mut file = fs::File::open(&path).map_err(|_| ())?;
                let mut pid_bytes = [0u8; 11];
                file.read_exact(&mut pid_bytes).map_err(|_| ())?;
                drop(file);
                let pid = std::str::from_utf8(&pid_bytes)
                    .map_err(|_| ())?
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| ())?;

                let alive = rustix::process::Pid::from_raw(pid)
                    .map(|pid| rustix::process::test_kill_process(pid).is_ok())
                    .unwrap_or(false);
                if alive {
                    return Err(());
                }

                warn!(path = %path, pid, "Unlinking stale X11 lock file");
                let _ = fs::remove_file(&path);
                X11Lock::grab(display)
            }
        }
    }

    pub(crate) fn display(&self) -> u32 {
        self.display
    }
}

impl Drop for X11Lock {
    fn drop(&mut self) {
        let _ = fs::remove_file(socket_path(self.display));
        let _ = fs::remove_file(lockfile_path(self.display));
    }
}

/// Bind the two sockets an X server listens on: the abstract one first,
/// then the filesystem one.
fn open_x11_sockets_for_display(display: u32) -> rustix::io::Result<[OwnedFd; 2]> {
    let path = socket_path(display);
    let abstract_addr = SocketAddrUnix::new_abstract_name(path.as_bytes())?;
    let fs_addr = SocketAddrUnix::new(&path)?;

    let abstract_socket = open_socket(&abstract_addr)?;
    // A leftover socket without a live lock holder is ours to replace.
    let _ = fs::remove_file(&path);
    let fs_socket = open_socket(&fs_addr)?;

    Ok([abstract_socket, fs_socket])
}

fn open_socket(addr: &SocketAddrUnix) -> rustix::io::Result<OwnedFd> {
    let socket = net::socket_with(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::CLOEXEC,
        None,
    )?;
    net::bind_unix(&socket, addr)?;
    net::listen(&socket, 1)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfile_contents_are_exactly_eleven_bytes() {
        let pid = rustix::process::getpid();
        let contents = format!("{:>10}\n", pid.as_raw_nonzero().get());
        assert_eq!(contents.len(), 11);
        assert!(contents.ends_with('\n'));
        assert_eq!(contents.trim().parse::<i32>().unwrap(), pid.as_raw_nonzero().get());
    }

    #[test]
    fn lock_grab_writes_pid_and_drop_cleans_up() {
        // Use a display number far away from anything a real session
        // would occupy.
        let display = 31_u32;
        let path = lockfile_path(display);
        let _ = fs::remove_file(&path);

        let lock = match X11Lock::grab(display) {
            Ok(lock) => lock,
            // Another process genuinely owns the slot; nothing to verify.
            Err(()) => return,
        };
        let contents = fs::read(&path).unwrap();
        assert_eq!(contents.len(), 11);
        let text = std::str::from_utf8(&contents).unwrap();
        assert_eq!(
            text.trim().parse::<i32>().unwrap(),
            rustix::process::getpid().as_raw_nonzero().get()
        );

        // Grabbing the same display again must fail while we are alive.
        assert!(X11Lock::grab(display).is_err());

        drop(lock);
        assert!(!std::path::Path::new(&path).exists());
    }
}
