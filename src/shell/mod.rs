//! The shell policy engine.
//!
//! The compositor host forwards protocol requests and input here; the shell
//! decides how surfaces are stacked, placed, focused and locked, and talks
//! back through [`ShellHandler`]. Stacking is a front-to-back list of weak
//! surface handles: the background sits at the tail, the panel at the head
//! while unlocked, the lock surface ahead of the panel, and ordinary
//! surfaces directly below the panel.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use cursor_icon::CursorIcon;
use rand::Rng;
use rustix::process::Pid;
use tracing::{debug, info, warn};

use crate::output::Output;
use crate::process::{unset_cloexec, ChildSupervisor};
use crate::seat::InputDevice;
use crate::surface::{ClientId, MapType, Surface, WeakSurface};
use crate::utils::geometry::{Point, Rectangle, Size};

pub mod grabs;
pub mod lock;

pub use grabs::ResizeEdge;
pub use lock::{desktop_shell_unlock, lock, set_lock_surface, unlock};

/// Compile-time default for the helper binary location.
const LIBEXECDIR: &str = match option_env!("LIBEXECDIR") {
    Some(dir) => dir,
    None => "/usr/libexec",
};

/// Shell configuration.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Path of the desktop-shell helper binary.
    pub helper_path: PathBuf,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            helper_path: PathBuf::from(LIBEXECDIR).join("wayland-desktop-shell"),
        }
    }
}

/// Callbacks the compositor host provides to the shell.
///
/// The first group are compositor services, the second group carries
/// protocol events out to clients through the host's wire runtime.
pub trait ShellHandler: Sized {
    fn shell_state(&mut self) -> &mut ShellState;

    /// Turn a connected socket into a wire-runtime client.
    fn create_client(&mut self, fd: OwnedFd) -> ClientId;
    /// Surface under the device's pointer, with surface-local coordinates.
    fn pick_surface(&mut self, device: &InputDevice) -> Option<(Surface, Point)>;
    /// Recompute pointer foci after a stacking change.
    fn repick(&mut self);
    /// Wake the compositor from sleep.
    fn wake(&mut self);
    fn set_cursor(&mut self, device: &InputDevice, cursor: CursorIcon);
    fn first_output(&mut self) -> Option<Output>;
    fn input_devices(&mut self) -> Vec<InputDevice>;

    /// Geometry was applied to `surface` (repaint it).
    fn surface_configured(&mut self, surface: &Surface, geometry: Rectangle);
    /// Ask the owning client to resize (SHELL_CONFIGURE).
    fn send_configure(&mut self, surface: &Surface, time: u32, edges: ResizeEdge, size: Size);
    /// Tell the helper how large a panel/background surface should be.
    fn desktop_shell_configure(&mut self, surface: &Surface, size: Size);
    /// Ask the helper for a lock surface (edge-triggered).
    fn prepare_lock_surface(&mut self);
    /// A surface was raised and focused; the X bridge hooks this to issue
    /// WM_TAKE_FOCUS for X-backed surfaces.
    fn surface_activated(&mut self, _surface: &Surface) {}
    /// The keyboard focus of `device` moved (deliver enter/leave pairs).
    fn keyboard_focus_set(&mut self, _device: &InputDevice, _surface: Option<&Surface>, _time: u32) {
    }
}

#[derive(Debug, Default)]
pub(crate) struct HelperChild {
    pub(crate) pid: Option<Pid>,
    pub(crate) client: Option<ClientId>,
    /// Whether the helper currently holds the desktop_shell resource.
    pub(crate) bound: bool,
}

/// The shell's own state, owned by the compositor.
#[derive(Debug)]
pub struct ShellState {
    /// Front-to-back stacking order; the head is topmost.
    pub(crate) visible: Vec<WeakSurface>,
    /// Surfaces parked while the session is locked.
    pub(crate) hidden: Vec<WeakSurface>,
    pub(crate) panel: Option<WeakSurface>,
    pub(crate) background: Option<WeakSurface>,
    pub(crate) lock_surface: Option<WeakSurface>,
    pub(crate) locked: bool,
    pub(crate) prepare_event_sent: bool,
    pub(crate) child: HelperChild,
    config: ShellConfig,
}

impl ShellState {
    pub fn new(config: ShellConfig) -> ShellState {
        ShellState {
            visible: Vec::new(),
            hidden: Vec::new(),
            panel: None,
            background: None,
            lock_surface: None,
            locked: false,
            prepare_event_sent: false,
            child: HelperChild::default(),
            config,
        }
    }

    /// The visible stacking order, topmost first.
    pub fn visible_surfaces(&self) -> Vec<Surface> {
        self.visible.iter().filter_map(WeakSurface::upgrade).collect()
    }

    /// Surfaces hidden behind the session lock, in stacking order.
    pub fn hidden_surfaces(&self) -> Vec<Surface> {
        self.hidden.iter().filter_map(WeakSurface::upgrade).collect()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn panel(&self) -> Option<Surface> {
        self.panel.as_ref().and_then(WeakSurface::upgrade)
    }

    pub fn background(&self) -> Option<Surface> {
        self.background.as_ref().and_then(WeakSurface::upgrade)
    }

    pub fn lock_surface(&self) -> Option<Surface> {
        self.lock_surface.as_ref().and_then(WeakSurface::upgrade)
    }

    pub(crate) fn is_panel(&self, surface: &Surface) -> bool {
        self.panel.as_ref().map_or(false, |p| p.is(surface))
    }

    pub(crate) fn is_background(&self, surface: &Surface) -> bool {
        self.background.as_ref().map_or(false, |b| b.is(surface))
    }

    pub(crate) fn is_lock_surface(&self, surface: &Surface) -> bool {
        self.lock_surface.as_ref().map_or(false, |l| l.is(surface))
    }

    /// Index just below the panel in the visible list, the slot ordinary
    /// surfaces go to.
    fn below_panel(&self) -> usize {
        self.panel()
            .and_then(|panel| self.visible.iter().position(|w| w.is(&panel)))
            .map(|idx| idx + 1)
            .unwrap_or(0)
    }

    fn remove_from_lists(&mut self, surface: &Surface) {
        self.visible.retain(|w| !w.is(surface));
        self.hidden.retain(|w| !w.is(surface));
    }

    /// Drop list entries whose surface is gone.
    fn prune(&mut self) {
        self.visible.retain(|w| w.upgrade().is_some());
        self.hidden.retain(|w| w.upgrade().is_some());
    }
}

impl Default for ShellState {
    fn default() -> Self {
        ShellState::new(ShellConfig::default())
    }
}

/// Set `surface`'s geometry and notify the host.
pub(crate) fn apply_geometry<D: ShellHandler>(data: &mut D, surface: &Surface, rect: Rectangle) {
    surface.state_mut().geometry = rect;
    data.surface_configured(surface, rect);
}

/// First mapping of `surface` at the given size.
pub fn map<D: ShellHandler>(data: &mut D, surface: &Surface, width: i32, height: i32) {
    let (is_role, is_lock, locked) = {
        let shell = data.shell_state();
        shell.prune();

        let is_background = shell.is_background(surface);
        let is_panel = shell.is_panel(surface);
        let is_lock = shell.is_lock_surface(surface);
        let locked = shell.locked;

        if is_background {
            // Background always visible, at the bottom.
            shell.visible.push(surface.downgrade());
        } else if is_panel {
            // Panel always on top, hidden while locked.
            if locked {
                shell.hidden.insert(0, surface.downgrade());
            } else {
                shell.visible.insert(0, surface.downgrade());
            }
        } else if is_lock {
            // Lock surface always visible, on top of everything.
            shell.visible.insert(0, surface.downgrade());
        } else if locked {
            // The panel sits hidden too; keep ordinary surfaces below it.
            let pos = shell
                .panel()
                .and_then(|panel| shell.hidden.iter().position(|w| w.is(&panel)))
                .map(|idx| idx + 1)
                .unwrap_or(0);
            shell.hidden.insert(pos, surface.downgrade());
        } else {
            let pos = shell.below_panel();
            shell.visible.insert(pos, surface.downgrade());
        }
        (is_background || is_panel || is_lock, is_lock, locked)
    };

    if is_lock {
        data.repick();
        data.wake();
    }

    {
        let mut state = surface.state_mut();
        // Unplaced toplevels land somewhere random; role surfaces keep
        // the position the helper gave them.
        if !is_role && state.map_type == MapType::Toplevel && !state.positioned {
            let mut rng = rand::thread_rng();
            state.geometry.loc = Point::new(10 + rng.gen_range(0..400), 10 + rng.gen_range(0..400));
            state.positioned = true;
        }
        state.geometry.size = Size::new(width, height);
    }

    if !locked || is_lock {
        apply_geometry(data, surface, surface.geometry());
    }
}

/// Subsequent geometry update for an already mapped surface. Fullscreen
/// surfaces are re-centered on their output regardless of the requested
/// position.
pub fn configure<D: ShellHandler>(
    data: &mut D,
    surface: &Surface,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
) {
    let mut rect = Rectangle::new(x, y, width, height);

    let fullscreen_mode = {
        let state = surface.state();
        match state.map_type {
            MapType::Fullscreen => state.fullscreen_output.as_ref().map(|o| o.current_mode()),
            _ => None,
        }
    };
    if let Some(mode) = fullscreen_mode {
        rect.loc = Rectangle::centered_in(rect.size, mode.size);
    }

    surface.state_mut().positioned = true;
    apply_geometry(data, surface, rect);
}

/// Raise `surface` and give it keyboard focus on `device`.
pub fn activate<D: ShellHandler>(data: &mut D, surface: &Surface, device: &InputDevice, time: u32) {
    crate::seat::set_keyboard_focus(data, device, Some(surface), time);
    data.surface_activated(surface);

    {
        let shell = data.shell_state();
        shell.prune();
        shell.remove_from_lists(surface);
        if shell.is_background(surface) {
            shell.visible.push(surface.downgrade());
        } else {
            let pos = if shell.locked { 0 } else { shell.below_panel() };
            shell.visible.insert(pos, surface.downgrade());
        }
    }
    data.repick();
}

/// Make `surface` an ordinary toplevel, undoing fullscreen if needed.
pub fn set_toplevel(surface: &Surface) {
    let mut state = surface.state_mut();
    if state.map_type == MapType::Fullscreen {
        state.geometry.loc = state.saved_loc;
    }
    state.map_type = MapType::Toplevel;
    state.fullscreen_output = None;
}

/// Make `surface` transient for `parent` at the given parent-relative
/// offset.
pub fn set_transient(surface: &Surface, parent: &Surface, x: i32, y: i32, _flags: u32) {
    let parent_loc = parent.location();
    let parent_output = parent.output();

    let mut state = surface.state_mut();
    state.output = parent_output;
    state.geometry.loc = Point::new(parent_loc.x + x, parent_loc.y + y);
    state.positioned = true;
    state.map_type = MapType::Transient;
}

/// Make `surface` fullscreen, centered on the first output.
pub fn set_fullscreen<D: ShellHandler>(data: &mut D, surface: &Surface) {
    let Some(output) = data.first_output() else {
        warn!("No output to fullscreen on");
        return;
    };
    let mode = output.current_mode();

    let mut state = surface.state_mut();
    state.saved_loc = state.geometry.loc;
    state.geometry.loc = Rectangle::centered_in(state.geometry.size, mode.size);
    state.output = Some(output.clone());
    state.fullscreen_output = Some(output);
    state.positioned = true;
    state.map_type = MapType::Fullscreen;
}

/// The compositor destroyed `surface`; drop every reference the shell
/// holds and unwind grabs and foci that point at it.
pub fn surface_destroyed<D: ShellHandler>(data: &mut D, surface: &Surface, time: u32) {
    {
        let shell = data.shell_state();
        if shell.is_panel(surface) {
            debug!("Panel surface gone");
            shell.panel = None;
        }
        if shell.is_background(surface) {
            debug!("Background surface gone");
            shell.background = None;
        }
        if shell.is_lock_surface(surface) {
            debug!("Lock surface gone");
            shell.lock_surface = None;
        }
        shell.remove_from_lists(surface);
    }

    for device in data.input_devices() {
        if device.pointer_focus().as_ref() == Some(surface) {
            device.set_pointer_focus(None);
        }
        if device.keyboard_focus().as_ref() == Some(surface) {
            crate::seat::set_keyboard_focus(data, &device, None, time);
        }
        let grab = device.state().grab.clone();
        if let Some(grab) = grab {
            if grab.on_surface_destroyed(surface, time) {
                grabs::end_grab(data, &device, time);
            }
        }
    }

    data.repick();
}

/// Record the helper's background surface and answer with its intended
/// size.
pub fn set_background<D: ShellHandler>(data: &mut D, surface: &Surface) {
    data.shell_state().background = Some(surface.downgrade());
    if let Some(output) = data.first_output() {
        data.desktop_shell_configure(surface, output.current_mode().size);
    }
}

/// Record the helper's panel surface and answer with its intended size.
pub fn set_panel<D: ShellHandler>(data: &mut D, surface: &Surface) {
    data.shell_state().panel = Some(surface.downgrade());
    if let Some(output) = data.first_output() {
        data.desktop_shell_configure(surface, output.current_mode().size);
    }
}

/// Errors launching the desktop-shell helper.
#[derive(Debug, thiserror::Error)]
pub enum HelperLaunchError {
    #[error("could not create the helper socket pair")]
    SocketPair(#[source] rustix::io::Errno),
    #[error("could not spawn the desktop-shell helper")]
    Spawn(#[source] std::io::Error),
}

/// A client other than the launched helper tried to bind desktop_shell.
#[derive(Debug, thiserror::Error)]
#[error("permission to bind desktop_shell denied")]
pub struct PermissionDenied;

/// Fork the desktop-shell helper and register it with the supervisor.
///
/// If the helper later dies while the desktop is locked, the desktop is
/// forcibly resumed.
pub fn launch_desktop_shell<D: ShellHandler + 'static>(
    data: &mut D,
    supervisor: &ChildSupervisor<D>,
) -> Result<(), HelperLaunchError> {
    let (our_end, child_end) = rustix::net::socketpair(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )
    .map_err(HelperLaunchError::SocketPair)?;

    let helper_path = data.shell_state().config.helper_path.clone();
    let mut command = Command::new(&helper_path);
    command.env("WAYLAND_SOCKET", child_end.as_raw_fd().to_string());
    let child_fd = child_end.as_raw_fd();
    unsafe {
        command.pre_exec(move || unset_cloexec(child_fd));
    }

    let child = command.spawn().map_err(HelperLaunchError::Spawn)?;
    drop(child_end);

    let pid = Pid::from_child(&child);
    info!(?helper_path, pid = pid.as_raw_nonzero().get(), "Launched desktop-shell helper");

    let client = data.create_client(our_end);
    let shell = data.shell_state();
    shell.child.pid = Some(pid);
    shell.child.client = Some(client);

    supervisor.watch(pid, |data, status| {
        warn!(?status, "desktop-shell helper died");
        let shell = data.shell_state();
        shell.child.pid = None;
        // The wire runtime already destroyed the client and its resources.
        shell.child.client = None;
        shell.child.bound = false;
        shell.prepare_event_sent = false;
        if shell.locked {
            lock::resume_desktop(data);
        }
    });

    Ok(())
}

/// Gate the desktop_shell interface: only the launched helper may bind it.
///
/// On error the host must post a protocol error and destroy the resource.
pub fn bind_desktop_shell<D: ShellHandler>(
    data: &mut D,
    client: ClientId,
) -> Result<(), PermissionDenied> {
    let shell = data.shell_state();
    if shell.child.client == Some(client) {
        shell.child.bound = true;
        Ok(())
    } else {
        warn!(?client, "Refusing desktop_shell bind from stranger client");
        Err(PermissionDenied)
    }
}

/// The helper dropped its desktop_shell resource.
pub fn unbind_desktop_shell<D: ShellHandler>(data: &mut D) {
    let resume = {
        let shell = data.shell_state();
        shell.child.bound = false;
        shell.prepare_event_sent = false;
        shell.locked
    };
    if resume {
        lock::resume_desktop(data);
    }
}
