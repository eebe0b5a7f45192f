//! The X11 bridge.
//!
//! Legacy X clients appear as native surfaces through three cooperating
//! pieces:
//!
//! - [`xserver`] claims a display number, listens on its sockets and forks
//!   a rootless X server on the first connection, restarting the listeners
//!   when it dies;
//! - [`xwm`] is the window manager for that server: it tracks X windows,
//!   forwards configure requests, pairs windows with native surfaces and
//!   hands input focus over with `WM_TAKE_FOCUS`;
//! - [`xwm::selection`] proxies the X CLIPBOARD selection to native
//!   clients, including INCR chunked transfers.

pub(crate) mod x11_sockets;
pub mod xserver;
pub mod xwm;

pub use xserver::{bind_xserver, XServerEvents, XWayland, XWaylandConfig};
pub use xwm::{handle_event, set_window_id, surface_activated, WmWindow, X11Wm, XwmHandler};

/// Errors bringing up or running the X server side of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum XWaylandError {
    #[error("every X display slot is taken")]
    NoFreeDisplay,
    #[error("could not create a socket pair for the X server")]
    SocketPair(#[source] rustix::io::Errno),
    #[error("could not spawn the X server")]
    Spawn(#[source] std::io::Error),
    #[error("event loop registration failed")]
    EventLoop(#[from] calloop::Error),
}

/// Errors attaching or driving the window manager.
#[derive(Debug, thiserror::Error)]
pub enum XwmError {
    #[error("could not create the WM socket pair")]
    SocketPair(#[source] rustix::io::Errno),
    #[error("could not wrap the WM connection")]
    Stream(#[source] std::io::Error),
    #[error(transparent)]
    Connect(#[from] x11rb::errors::ConnectError),
    #[error(transparent)]
    Connection(#[from] x11rb::errors::ConnectionError),
    #[error(transparent)]
    Reply(#[from] x11rb::errors::ReplyError),
    #[error(transparent)]
    ReplyOrId(#[from] x11rb::errors::ReplyOrIdError),
    #[error("event loop registration failed")]
    EventLoop(#[from] calloop::Error),
}
