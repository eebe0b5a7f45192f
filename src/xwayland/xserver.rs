//! X server supervision.
//!
//! The bridge binds the display sockets itself so it knows what to put in
//! `DISPLAY`, then lazily forks the X server when the first X client
//! connects. The server gets its wayland connection through a socketpair
//! in `WAYLAND_SOCKET` and receives the two listening sockets over the
//! xserver protocol interface once it binds it; the pending client keeps
//! sitting in the listen backlog until then. While the server runs the
//! listening sources are disabled; they are re-armed when it exits. A
//! server that dies before ever binding the xserver interface is not
//! restarted.

use std::cell::RefCell;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use rustix::process::{Pid, WaitStatus};
use tracing::{debug, error, info, warn};

use super::x11_sockets::{prepare_x11_sockets, X11Lock};
use super::xwm::{self, X11Wm, XwmHandler};
use super::XWaylandError;
use crate::process::{unset_cloexec, ChildSupervisor};
use crate::surface::ClientId;

/// Compile-time default for the X server binary.
const XSERVER_PATH: &str = match option_env!("XSERVER_PATH") {
    Some(path) => path,
    None => "/usr/bin/X",
};

/// X bridge configuration.
#[derive(Debug, Clone)]
pub struct XWaylandConfig {
    /// Path of the X server binary.
    pub xserver_path: PathBuf,
    /// How many display slots to probe before giving up.
    pub max_displays: u32,
}

impl Default for XWaylandConfig {
    fn default() -> Self {
        XWaylandConfig {
            xserver_path: PathBuf::from(XSERVER_PATH),
            max_displays: 33,
        }
    }
}

/// Events on the xserver protocol interface, delivered to the launched X
/// server client by the host's wire runtime.
pub trait XServerEvents {
    /// Pass the server its WM connection.
    fn client(&self, fd: OwnedFd);
    /// Pass the server one of the sockets it should accept clients on.
    /// The bridge keeps ownership; the wire runtime duplicates the fd
    /// while marshalling.
    fn listen_socket(&self, fd: BorrowedFd<'_>);
}

struct Inner<D: XwmHandler + 'static> {
    handle: LoopHandle<'static, D>,
    supervisor: ChildSupervisor<D>,
    config: XWaylandConfig,
    display: u32,
    lock: Option<X11Lock>,
    abstract_fd: Option<Rc<OwnedFd>>,
    unix_fd: Option<Rc<OwnedFd>>,
    listen_tokens: Vec<RegistrationToken>,
    pid: Option<Pid>,
    client: Option<ClientId>,
    sink: Option<Rc<dyn XServerEvents>>,
    wm_tokens: Vec<RegistrationToken>,
    /// Set when the server crashed before binding; the bridge stays down.
    dead: bool,
}

/// Handle to the X bridge.
pub struct XWayland<D: XwmHandler + 'static> {
    inner: Rc<RefCell<Inner<D>>>,
}

impl<D: XwmHandler + 'static> Clone for XWayland<D> {
    fn clone(&self) -> Self {
        XWayland {
            inner: self.inner.clone(),
        }
    }
}

impl<D: XwmHandler + 'static> std::fmt::Debug for XWayland<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("XWayland")
            .field("display", &inner.display)
            .field("running", &inner.pid.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: XwmHandler + 'static> XWayland<D> {
    /// Claim a display, bind its sockets and start listening for the
    /// first X client.
    pub fn new(
        handle: LoopHandle<'static, D>,
        supervisor: ChildSupervisor<D>,
        config: XWaylandConfig,
    ) -> Result<XWayland<D>, XWaylandError> {
        let (lock, [abstract_fd, unix_fd]) = prepare_x11_sockets(config.max_displays)?;
        let display = lock.display();

        let inner = Rc::new(RefCell::new(Inner {
            handle: handle.clone(),
            supervisor,
            config,
            display,
            lock: Some(lock),
            abstract_fd: Some(Rc::new(abstract_fd)),
            unix_fd: Some(Rc::new(unix_fd)),
            listen_tokens: Vec::new(),
            pid: None,
            client: None,
            sink: None,
            wm_tokens: Vec::new(),
            dead: false,
        }));

        {
            let guard = inner.borrow();
            let fds = [
                guard.abstract_fd.clone().expect("just set"),
                guard.unix_fd.clone().expect("just set"),
            ];
            drop(guard);
            for fd in fds {
                let listen_inner = inner.clone();
                let token = handle
                    .insert_source(Generic::new(fd, Interest::READ, Mode::Level), move |_, _, data| {
                        launch(&listen_inner, data);
                        Ok(PostAction::Continue)
                    })
                    .map_err(Into::<calloop::Error>::into)?;
                inner.borrow_mut().listen_tokens.push(token);
            }
        }

        let display_num = display;
        info!(display = display_num, "X server listening");
        Ok(XWayland { inner })
    }

    /// The display number this bridge claimed.
    pub fn display(&self) -> u32 {
        self.inner.borrow().display
    }

    /// Tear the whole bridge down: sockets, lock files, WM sources.
    pub fn shutdown(&self) {
        shutdown(&self.inner);
    }
}

/// First connection on a listening socket: fork the X server.
fn launch<D: XwmHandler + 'static>(inner: &Rc<RefCell<Inner<D>>>, data: &mut D) {
    {
        let guard = inner.borrow();
        if guard.pid.is_some() || guard.dead {
            return;
        }
    }

    let (our_end, child_end) = match rustix::net::socketpair(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    ) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(?err, "socketpair for the X server failed");
            return;
        }
    };

    let (pid, display) = {
        let mut guard = inner.borrow_mut();
        let display = guard.display;

        let mut command = Command::new(&guard.config.xserver_path);
        command
            .arg(format!(":{}", display))
            .arg("-wayland")
            .arg("-rootless")
            .arg("-retro")
            .arg("-logfile")
            .arg(format!("/tmp/x-log-{}", display))
            .arg("-nolisten")
            .arg("all")
            .arg("-terminate");
        command.env("WAYLAND_SOCKET", child_end.as_raw_fd().to_string());

        let child_fd = child_end.as_raw_fd();
        unsafe {
            command.pre_exec(move || unset_cloexec(child_fd));
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(?err, path = ?guard.config.xserver_path, "Failed to spawn the X server");
                return;
            }
        };
        drop(child_end);

        let pid = Pid::from_child(&child);
        guard.pid = Some(pid);

        // Stop accepting; the server takes the listen sockets over.
        for token in &guard.listen_tokens {
            guard.handle.disable(token).ok();
        }

        (pid, display)
    };

    let display_num = display;
    info!(pid = pid.as_raw_nonzero().get(), display = display_num, "Forked X server");

    let client = data.create_client(our_end);
    inner.borrow_mut().client = Some(client);

    let exit_inner = inner.clone();
    let supervisor = inner.borrow().supervisor.clone();
    supervisor.watch(pid, move |data, status| {
        child_exited(&exit_inner, data, status);
    });
}

fn child_exited<D: XwmHandler + 'static>(
    inner: &Rc<RefCell<Inner<D>>>,
    data: &mut D,
    status: WaitStatus,
) {
    let had_wm = {
        let mut guard = inner.borrow_mut();
        guard.pid = None;
        guard.client = None;
        guard.sink = None;
        let had_wm = !guard.wm_tokens.is_empty();
        let tokens: Vec<_> = guard.wm_tokens.drain(..).collect();
        for token in tokens {
            guard.handle.remove(token);
        }
        had_wm
    };

    if had_wm {
        info!(?status, "X server exited, tearing down the WM");
        let transfer_token = data.xwm_state().and_then(X11Wm::take_transfer_token);
        if let Some(token) = transfer_token {
            inner.borrow().handle.remove(token);
        }
        data.xwm_destroyed();

        let guard = inner.borrow();
        for token in &guard.listen_tokens {
            guard.handle.enable(token).ok();
        }
    } else {
        // Crashing before the xserver interface was bound; trying again
        // would just crash-loop.
        error!(?status, "X server crashing too fast, shutting the bridge down");
        shutdown(inner);
    }
}

fn shutdown<D: XwmHandler + 'static>(inner: &Rc<RefCell<Inner<D>>>) {
    let mut guard = inner.borrow_mut();
    guard.dead = true;
    let listen_tokens: Vec<_> = guard.listen_tokens.drain(..).collect();
    for token in listen_tokens {
        guard.handle.remove(token);
    }
    let wm_tokens: Vec<_> = guard.wm_tokens.drain(..).collect();
    for token in wm_tokens {
        guard.handle.remove(token);
    }
    guard.abstract_fd = None;
    guard.unix_fd = None;
    guard.sink = None;
    // Unlinks the lock file and the socket path.
    guard.lock = None;
}

/// A client bound the xserver interface.
///
/// Only the server we launched is accepted; anything else is ignored.
/// Creates the window manager, hands the server its WM connection and the
/// listening sockets, and gives the finished [`X11Wm`] to the handler.
pub fn bind_xserver<D: XwmHandler + 'static>(
    data: &mut D,
    xwayland: &XWayland<D>,
    client: ClientId,
    sink: Rc<dyn XServerEvents>,
) -> Result<bool, super::XwmError> {
    {
        let guard = xwayland.inner.borrow();
        if guard.client != Some(client) {
            debug!(?client, "Ignoring xserver bind from a client we did not launch");
            return Ok(false);
        }
    }

    let (wm_our, wm_server) = rustix::net::socketpair(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )
    .map_err(super::XwmError::SocketPair)?;

    sink.client(wm_server);

    let (wm, x11_source, requests) = X11Wm::start(client, wm_our)?;

    let handle = xwayland.inner.borrow().handle.clone();
    let event_handle = handle.clone();
    let events_token = handle
        .insert_source(x11_source, move |event, _, data| {
            if let Err(err) = xwm::handle_event(data, &event_handle, event) {
                warn!(?err, "Failed to handle X11 event");
            }
        })
        .map_err(Into::<calloop::Error>::into)?;
    let requests_token = handle
        .insert_source(requests, move |event, _, data| {
            if let calloop::channel::Event::Msg(request) = event {
                xwm::selection::handle_selection_request(data, request);
            }
        })
        .map_err(Into::<calloop::Error>::into)?;

    {
        let mut guard = xwayland.inner.borrow_mut();
        guard.sink = Some(sink.clone());
        guard.wm_tokens.push(events_token);
        guard.wm_tokens.push(requests_token);
    }

    data.xwm_attached(wm);
    info!("X window manager attached");

    let guard = xwayland.inner.borrow();
    if let Some(fd) = &guard.abstract_fd {
        sink.listen_socket(fd.as_fd());
    }
    if let Some(fd) = &guard.unix_fd {
        sink.listen_socket(fd.as_fd());
    }

    Ok(true)
}
