//! The window manager for the bridged X server.
//!
//! The WM owns a dedicated X connection over a socketpair to the server,
//! selects substructure-redirect on the root and pumps X events from a
//! [`X11Source`]: windows are tracked in a map keyed by their xid, map
//! requests are granted, configure requests forwarded, and mapped windows
//! get their interesting properties fetched in one batched round-trip.
//! A small invisible window serves as our end of selection conversions.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;

use calloop::channel::{self, Channel};
use calloop::{LoopHandle, RegistrationToken};
use tracing::{debug, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::errors::{ConnectionError, ReplyOrIdError};
use x11rb::protocol::xfixes::{ConnectionExt as _, SelectionEventMask};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ClientMessageData, ClientMessageEvent,
    ConfigureWindowAux, ConnectionExt as _, CreateWindowAux, EventMask, InputFocus, Property,
    Window as X11Window, WindowClass, CLIENT_MESSAGE_EVENT,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::{DefaultStream, RustConnection};

use crate::seat::InputDevice;
use crate::selection::SelectionOfferEvents;
use crate::shell::ShellHandler;
use crate::surface::{ClientId, Surface, WeakSurface};
use crate::utils::x11rb::X11Source;

pub mod selection;

use self::selection::{SelectionProxy, SelectionRequest};
use super::XwmError;

// The atoms the WM interns, in one batched round-trip at startup.
x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        WM_PROTOCOLS,
        WM_TAKE_FOCUS,
        WM_DELETE_WINDOW,
        _NET_WM_NAME,
        _NET_WM_ICON,
        _NET_WM_STATE,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_USER_TIME,
        _NET_WM_ICON_NAME,
        _NET_WM_WINDOW_TYPE,
        CLIPBOARD,
        TARGETS,
        UTF8_STRING,
        _WL_SELECTION,
        INCR,
        TIMESTAMP,
        MULTIPLE,
        COMPOUND_TEXT,
        TEXT,
        STRING,
        TEXT_PLAIN_UTF8: b"text/plain;charset=utf-8",
        TEXT_PLAIN: b"text/plain",
        _SHORELINE_CLOSE_CONNECTION,
    }
}

/// Hooks the compositor host provides when the X bridge is in use.
pub trait XwmHandler: ShellHandler {
    /// The live window manager, if the X server is up and bound.
    fn xwm_state(&mut self) -> Option<&mut X11Wm>;
    /// Store the freshly attached window manager.
    fn xwm_attached(&mut self, wm: X11Wm);
    /// Drop the window manager after its X server died.
    fn xwm_destroyed(&mut self);
    /// The device X selections are installed on.
    fn default_device(&mut self) -> Option<InputDevice>;
    /// A fresh offer sink for an X-backed selection.
    fn selection_offer_sink(&mut self) -> Rc<dyn SelectionOfferEvents>;
}

/// The bridge's record of one X window.
#[derive(Debug, Default)]
pub struct WmWindow {
    pub xid: X11Window,
    /// The native surface backing the window, once the server paired them.
    pub surface: Option<WeakSurface>,
    pub class: Option<String>,
    pub name: Option<String>,
    /// xid of the window this one is transient for.
    pub transient_for: Option<X11Window>,
    pub protocols: Vec<Atom>,
    pub window_type: Option<Atom>,
}

/// The running window manager.
pub struct X11Wm {
    conn: Arc<RustConnection>,
    atoms: Atoms,
    /// The wayland client of the X server we launched.
    xclient: ClientId,
    windows: HashMap<X11Window, WmWindow>,
    pub(crate) selection: SelectionProxy,
}

impl fmt::Debug for X11Wm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X11Wm")
            .field("windows", &self.windows.len())
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

impl X11Wm {
    /// Become the window manager on `connection`.
    ///
    /// Returns the WM plus the two event sources driving it, for the
    /// caller to insert into the loop: the X event stream and the channel
    /// carrying native selection requests.
    pub(crate) fn start(
        xclient: ClientId,
        connection: OwnedFd,
    ) -> Result<(X11Wm, X11Source, Channel<SelectionRequest>), XwmError> {
        let (stream, _) =
            DefaultStream::from_unix_stream(UnixStream::from(connection)).map_err(XwmError::Stream)?;
        let conn = RustConnection::connect_to_stream(stream, 0)?;
        let atoms = Atoms::new(&conn)?.reply()?;
        let screen = conn.setup().roots[0].clone();

        // Become the WM by redirecting map and configure on the root.
        conn.change_window_attributes(
            screen.root,
            &ChangeWindowAttributesAux::default().event_mask(
                EventMask::STRUCTURE_NOTIFY
                    | EventMask::RESIZE_REDIRECT
                    | EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::SUBSTRUCTURE_REDIRECT
                    | EventMask::PROPERTY_CHANGE,
            ),
        )?;

        // A tiny window of ours, the local party of selection transfers.
        let selection_window = conn.generate_id()?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            selection_window,
            screen.root,
            0,
            0,
            10,
            10,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;

        let xfixes = conn.xfixes_query_version(5, 0)?.reply()?;
        debug!(
            major = xfixes.major_version,
            minor = xfixes.minor_version,
            "xfixes version"
        );
        conn.xfixes_select_selection_input(
            selection_window,
            atoms.CLIPBOARD,
            SelectionEventMask::SET_SELECTION_OWNER
                | SelectionEventMask::SELECTION_WINDOW_DESTROY
                | SelectionEventMask::SELECTION_CLIENT_CLOSE,
        )?;
        conn.flush()?;

        let conn = Arc::new(conn);
        let source = X11Source::new(
            Arc::clone(&conn),
            selection_window,
            atoms._SHORELINE_CLOSE_CONNECTION,
        );
        let (sender, requests) = channel::channel();

        debug!(selection_window, "Created WM");
        let wm = X11Wm {
            conn,
            atoms,
            xclient,
            windows: HashMap::new(),
            selection: SelectionProxy::new(selection_window, sender),
        };
        Ok((wm, source, requests))
    }

    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    /// The bridge's record for `xid`, if it is still alive.
    pub fn window(&self, xid: X11Window) -> Option<&WmWindow> {
        self.windows.get(&xid)
    }

    /// Hand the X input focus to the window backing `surface`, or drop X
    /// focus entirely if the surface is not X-backed.
    pub fn activate_surface(&mut self, surface: &Surface) -> Result<(), ConnectionError> {
        match surface.x_window().filter(|xid| self.windows.contains_key(xid)) {
            Some(xid) => self.send_take_focus(xid),
            None => {
                self.conn.set_input_focus(
                    InputFocus::POINTER_ROOT,
                    x11rb::NONE,
                    x11rb::CURRENT_TIME,
                )?;
                self.conn.flush()
            }
        }
    }

    fn send_take_focus(&self, xid: X11Window) -> Result<(), ConnectionError> {
        let message = ClientMessageEvent {
            response_type: CLIENT_MESSAGE_EVENT,
            format: 32,
            sequence: 0,
            window: xid,
            type_: self.atoms.WM_PROTOCOLS,
            data: ClientMessageData::from([self.atoms.WM_TAKE_FOCUS, x11rb::CURRENT_TIME, 0, 0, 0]),
        };
        self.conn
            .send_event(false, xid, EventMask::SUBSTRUCTURE_REDIRECT, message)?;
        self.conn
            .set_input_focus(InputFocus::POINTER_ROOT, xid, x11rb::CURRENT_TIME)?;
        self.conn.flush()
    }

    /// Fetch the properties the shell cares about for `xid` in one
    /// batch. Individual fetch failures (window already gone, garbage
    /// contents) leave the corresponding field untouched.
    fn fetch_window_properties(&mut self, xid: X11Window) -> Result<(), ConnectionError> {
        let conn = &self.conn;
        let class = conn.get_property(false, xid, AtomEnum::WM_CLASS, AtomEnum::ANY, 0, 2048)?;
        let transient =
            conn.get_property(false, xid, AtomEnum::WM_TRANSIENT_FOR, AtomEnum::ANY, 0, 2048)?;
        let protocols = conn.get_property(false, xid, self.atoms.WM_PROTOCOLS, AtomEnum::ANY, 0, 2048)?;
        let window_type =
            conn.get_property(false, xid, self.atoms._NET_WM_WINDOW_TYPE, AtomEnum::ANY, 0, 2048)?;
        let name = conn.get_property(false, xid, self.atoms._NET_WM_NAME, AtomEnum::ANY, 0, 2048)?;

        let class = class.reply().ok();
        let transient = transient.reply().ok();
        let protocols = protocols.reply().ok();
        let window_type = window_type.reply().ok();
        let name = name.reply().ok();

        let Some(window) = self.windows.get_mut(&xid) else {
            return Ok(());
        };

        if let Some(reply) = class {
            // WM_CLASS is two NUL-terminated strings: instance, class.
            let mut parts = reply.value.split(|&b| b == 0);
            let instance = parts.next();
            let class = parts.next().or(instance);
            window.class = class.map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        }
        if let Some(reply) = transient {
            window.transient_for = reply.value32().and_then(|mut iter| iter.next()).filter(|&w| w != 0);
        }
        if let Some(reply) = protocols {
            if let Some(values) = reply.value32() {
                window.protocols = values.collect();
            }
        }
        if let Some(reply) = window_type {
            window.window_type = reply.value32().and_then(|mut iter| iter.next());
        }
        if let Some(reply) = name {
            window.name = Some(String::from_utf8_lossy(&reply.value).into_owned());
        }

        Ok(())
    }

    pub(crate) fn take_transfer_token(&mut self) -> Option<RegistrationToken> {
        self.selection.transfer.take().map(|t| t.token)
    }
}

/// The X server paired `surface` with the window `xid`.
///
/// Only honored for the server we launched; unknown xids are logged and
/// dropped.
pub fn set_window_id<D: XwmHandler>(data: &mut D, client: ClientId, surface: &Surface, xid: u32) {
    let Some(wm) = data.xwm_state() else { return };
    if wm.xclient != client {
        return;
    }
    let Some(window) = wm.windows.get_mut(&xid) else {
        warn!(xid, "set_window_id for unknown window");
        return;
    };

    debug!(xid, "Paired X window with surface");
    window.surface = Some(surface.downgrade());
    surface.state_mut().x_window = Some(xid);
}

/// Forward a shell activation to the X side (WM_TAKE_FOCUS).
///
/// Hosts call this from their [`ShellHandler::surface_activated`] hook.
pub fn surface_activated<D: XwmHandler>(data: &mut D, surface: &Surface) {
    let Some(wm) = data.xwm_state() else { return };
    if let Err(err) = wm.activate_surface(surface) {
        warn!(?err, "Failed to forward activation to X");
    }
}

/// Drain one event from the WM's X connection.
pub fn handle_event<D: XwmHandler>(
    data: &mut D,
    handle: &LoopHandle<'static, D>,
    event: Event,
) -> Result<(), ReplyOrIdError> {
    match event {
        Event::CreateNotify(n) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            if n.window == wm.selection.window {
                return Ok(());
            }
            trace!(window = n.window, "CREATE_NOTIFY");
            wm.windows.insert(
                n.window,
                WmWindow {
                    xid: n.window,
                    ..Default::default()
                },
            );
        }
        Event::MapRequest(r) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            trace!(window = r.window, "MAP_REQUEST");
            wm.conn.change_window_attributes(
                r.window,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
            )?;
            wm.conn.map_window(r.window)?;
        }
        Event::MapNotify(n) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            if wm.windows.contains_key(&n.window) {
                wm.fetch_window_properties(n.window)?;
                if let Some(window) = wm.windows.get(&n.window) {
                    debug!(
                        window = n.window,
                        class = ?window.class,
                        name = ?window.name,
                        transient_for = ?window.transient_for,
                        "X window mapped"
                    );
                }
                wm.send_take_focus(n.window)?;
            }
        }
        Event::ConfigureRequest(r) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            trace!(
                window = r.window,
                x = r.x,
                y = r.y,
                w = r.width,
                h = r.height,
                "CONFIGURE_REQUEST"
            );
            wm.conn
                .configure_window(r.window, &ConfigureWindowAux::from_configure_request(&r))?;
        }
        Event::ConfigureNotify(n) => {
            trace!(window = n.window, "CONFIGURE_NOTIFY");
        }
        Event::UnmapNotify(n) => {
            trace!(window = n.window, "UNMAP_NOTIFY");
        }
        Event::DestroyNotify(n) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            if let Some(window) = wm.windows.remove(&n.window) {
                debug!(window = n.window, "X window destroyed");
                // Detach the pairing so a later activation of the surface
                // does not chase a dead xid.
                if let Some(surface) = window.surface.as_ref().and_then(WeakSurface::upgrade) {
                    surface.state_mut().x_window = None;
                }
            } else {
                debug!(window = n.window, "DESTROY_NOTIFY for unknown window");
            }
        }
        Event::PropertyNotify(n) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            let (selection_window, wl_selection, incr) = (
                wm.selection.window,
                wm.atoms._WL_SELECTION,
                wm.selection.incr,
            );
            if n.window == selection_window {
                if n.state == Property::NEW_VALUE && n.atom == wl_selection && incr {
                    selection::get_incr_chunk(data, handle)?;
                }
            } else {
                trace!(window = n.window, atom = n.atom, "Property changed");
            }
        }
        Event::SelectionNotify(n) => {
            selection::handle_selection_notify(data, handle, n)?;
        }
        Event::XfixesSelectionNotify(n) => {
            let Some(wm) = data.xwm_state() else { return Ok(()) };
            debug!(owner = n.owner, "CLIPBOARD owner changed");
            // Ask the new owner what it has; the answer arrives as a
            // SELECTION_NOTIFY with target TARGETS.
            wm.conn.convert_selection(
                wm.selection.window,
                wm.atoms.CLIPBOARD,
                wm.atoms.TARGETS,
                wm.atoms._WL_SELECTION,
                x11rb::CURRENT_TIME,
            )?;
        }
        _ => {}
    }

    if let Some(wm) = data.xwm_state() {
        wm.conn.flush()?;
    }
    Ok(())
}
