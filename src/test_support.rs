//! Recording host and sinks shared by the policy tests.

use std::cell::RefCell;
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use cursor_icon::CursorIcon;

use crate::output::{Mode, Output};
use crate::seat::InputDevice;
use crate::selection::{
    DragOfferEvents, DragSourceEvents, SelectionOfferEvents, SelectionSourceEvents,
};
use crate::shell::{self, ResizeEdge, ShellHandler, ShellState};
use crate::surface::{ClientId, Surface};
use crate::utils::geometry::{Point, Rectangle, Size};

/// Everything a [`TestState`] heard from the shell.
#[derive(Debug)]
pub(crate) enum HostEvent {
    Configured { surface: Surface, rect: Rectangle },
    SendConfigure { surface: Surface, time: u32, edges: ResizeEdge, size: Size },
    Cursor(CursorIcon),
    DesktopShellConfigure { surface: Surface, size: Size },
    PrepareLock,
    Activated(Surface),
    Repick,
    Wake,
}

/// A compositor host that records every callback.
#[derive(Debug)]
pub(crate) struct TestState {
    pub(crate) shell: ShellState,
    pub(crate) events: Vec<HostEvent>,
    pub(crate) devices: Vec<InputDevice>,
    pub(crate) outputs: Vec<Output>,
    /// Result of the next `pick_surface` calls.
    pub(crate) pick: Option<(Surface, Point)>,
    next_client: u32,
}

impl TestState {
    pub(crate) fn new() -> TestState {
        TestState {
            shell: ShellState::default(),
            events: Vec::new(),
            devices: Vec::new(),
            outputs: vec![Output::new(Mode {
                size: Size::new(1920, 1080),
            })],
            pick: None,
            next_client: 100,
        }
    }

    /// A surface owned by a fresh client, with the given geometry already
    /// applied.
    pub(crate) fn client_surface(&mut self, rect: Rectangle) -> Surface {
        self.next_client += 1;
        self.surface_for_client(ClientId(self.next_client), rect)
    }

    pub(crate) fn surface_for_client(&mut self, client: ClientId, rect: Rectangle) -> Surface {
        let surface = Surface::new(Some(client));
        surface.state_mut().geometry = rect;
        surface
    }

    /// A fresh client surface, made toplevel and mapped.
    pub(crate) fn mapped_surface(&mut self, width: i32, height: i32) -> Surface {
        let surface = self.client_surface(Rectangle::default());
        shell::set_toplevel(&surface);
        shell::map(self, &surface, width, height);
        surface
    }

    /// Panel and background surfaces, registered and mapped.
    pub(crate) fn desktop(&mut self, width: i32, height: i32) -> (Surface, Surface) {
        let panel = self.client_surface(Rectangle::new(0, 0, width, 24));
        let background = self.client_surface(Rectangle::new(0, 0, width, height));
        shell::set_panel(self, &panel);
        shell::set_background(self, &background);
        shell::map(self, &panel, width, 24);
        shell::map(self, &background, width, height);
        self.events.clear();
        (panel, background)
    }

    pub(crate) fn last_cursor(&self) -> Option<CursorIcon> {
        self.events.iter().rev().find_map(|e| match e {
            HostEvent::Cursor(cursor) => Some(*cursor),
            _ => None,
        })
    }
}

impl ShellHandler for TestState {
    fn shell_state(&mut self) -> &mut ShellState {
        &mut self.shell
    }

    fn create_client(&mut self, _fd: OwnedFd) -> ClientId {
        self.next_client += 1;
        ClientId(self.next_client)
    }

    fn pick_surface(&mut self, _device: &InputDevice) -> Option<(Surface, Point)> {
        self.pick.clone()
    }

    fn repick(&mut self) {
        self.events.push(HostEvent::Repick);
    }

    fn wake(&mut self) {
        self.events.push(HostEvent::Wake);
    }

    fn set_cursor(&mut self, _device: &InputDevice, cursor: CursorIcon) {
        self.events.push(HostEvent::Cursor(cursor));
    }

    fn first_output(&mut self) -> Option<Output> {
        self.outputs.first().cloned()
    }

    fn input_devices(&mut self) -> Vec<InputDevice> {
        self.devices.clone()
    }

    fn surface_configured(&mut self, surface: &Surface, geometry: Rectangle) {
        self.events.push(HostEvent::Configured {
            surface: surface.clone(),
            rect: geometry,
        });
    }

    fn send_configure(&mut self, surface: &Surface, time: u32, edges: ResizeEdge, size: Size) {
        self.events.push(HostEvent::SendConfigure {
            surface: surface.clone(),
            time,
            edges,
            size,
        });
    }

    fn desktop_shell_configure(&mut self, surface: &Surface, size: Size) {
        self.events.push(HostEvent::DesktopShellConfigure {
            surface: surface.clone(),
            size,
        });
    }

    fn prepare_lock_surface(&mut self) {
        self.events.push(HostEvent::PrepareLock);
    }

    fn surface_activated(&mut self, surface: &Surface) {
        self.events.push(HostEvent::Activated(surface.clone()));
    }
}

/// Events recorded by a [`RecordingSink`]. File descriptors are dropped on
/// receipt; only the fact of the transfer is kept.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransferEvent {
    Target { mime: Option<String> },
    Finish,
    Reject,
    Offer { to: ClientId, mime: String },
    PointerFocus { to: ClientId, time: u32, surface: Option<Surface> },
    Motion { to: ClientId, time: u32 },
    Dropped { to: ClientId },
    Send { mime: String },
    Cancelled,
    KeyboardFocus { to: ClientId, focused: bool },
}

/// One sink implementing every event trait, appending to a shared log.
#[derive(Debug)]
pub(crate) struct RecordingSink {
    events: RefCell<Vec<TransferEvent>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Rc<RecordingSink> {
        Rc::new(RecordingSink {
            events: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn drain(&self) -> Vec<TransferEvent> {
        self.events.take()
    }

    fn push(&self, event: TransferEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl DragSourceEvents for RecordingSink {
    fn target(&self, mime_type: Option<&str>) {
        self.push(TransferEvent::Target {
            mime: mime_type.map(str::to_owned),
        });
    }

    fn finish(&self, _fd: OwnedFd) {
        self.push(TransferEvent::Finish);
    }

    fn reject(&self) {
        self.push(TransferEvent::Reject);
    }
}

impl DragOfferEvents for RecordingSink {
    fn offer(&self, to: ClientId, mime_type: &str) {
        self.push(TransferEvent::Offer {
            to,
            mime: mime_type.to_owned(),
        });
    }

    fn pointer_focus(
        &self,
        to: ClientId,
        time: u32,
        surface: Option<&Surface>,
        _x: i32,
        _y: i32,
        _sx: i32,
        _sy: i32,
    ) {
        self.push(TransferEvent::PointerFocus {
            to,
            time,
            surface: surface.cloned(),
        });
    }

    fn motion(&self, to: ClientId, time: u32, _x: i32, _y: i32, _sx: i32, _sy: i32) {
        self.push(TransferEvent::Motion { to, time });
    }

    fn dropped(&self, to: ClientId) {
        self.push(TransferEvent::Dropped { to });
    }
}

impl SelectionSourceEvents for RecordingSink {
    fn send(&self, mime_type: &str, _fd: OwnedFd) {
        self.push(TransferEvent::Send {
            mime: mime_type.to_owned(),
        });
    }

    fn cancelled(&self) {
        self.push(TransferEvent::Cancelled);
    }
}

impl SelectionOfferEvents for RecordingSink {
    fn offer(&self, to: ClientId, mime_type: &str) {
        self.push(TransferEvent::Offer {
            to,
            mime: mime_type.to_owned(),
        });
    }

    fn keyboard_focus(&self, to: ClientId, device: Option<&InputDevice>) {
        self.push(TransferEvent::KeyboardFocus {
            to,
            focused: device.is_some(),
        });
    }
}
