//! Pointer grabs for interactive move, resize and drag.
//!
//! A grab exclusively routes one device's pointer events to a single
//! consumer until the last pressed button is released. The three kinds are
//! a tagged sum dispatched through [`Grab::handle_event`]; installing a
//! grab clears the device's pointer focus so ordinary surfaces stop seeing
//! motion.

use cursor_icon::CursorIcon;
use tracing::debug;

use crate::seat::{ButtonState, InputDevice};
use crate::selection::drag::{self, Drag};
use crate::shell::ShellHandler;
use crate::surface::{MapType, Surface};
use crate::utils::geometry::{Point, Rectangle, Size};

bitflags::bitflags! {
    /// Edges being dragged during an interactive resize.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResizeEdge: u32 {
        const TOP    = 0b0001;
        const BOTTOM = 0b0010;
        const LEFT   = 0b0100;
        const RIGHT  = 0b1000;

        const TOP_LEFT     = Self::TOP.bits() | Self::LEFT.bits();
        const TOP_RIGHT    = Self::TOP.bits() | Self::RIGHT.bits();
        const BOTTOM_LEFT  = Self::BOTTOM.bits() | Self::LEFT.bits();
        const BOTTOM_RIGHT = Self::BOTTOM.bits() | Self::RIGHT.bits();
    }
}

/// Cursor shown for a resize along `edges`, or `None` if the combination
/// is not one of the eight accepted masks.
fn resize_cursor(edges: ResizeEdge) -> Option<CursorIcon> {
    let cursor = if edges == ResizeEdge::TOP {
        CursorIcon::NResize
    } else if edges == ResizeEdge::BOTTOM {
        CursorIcon::SResize
    } else if edges == ResizeEdge::LEFT {
        CursorIcon::WResize
    } else if edges == ResizeEdge::RIGHT {
        CursorIcon::EResize
    } else if edges == ResizeEdge::TOP_LEFT {
        CursorIcon::NwResize
    } else if edges == ResizeEdge::TOP_RIGHT {
        CursorIcon::NeResize
    } else if edges == ResizeEdge::BOTTOM_LEFT {
        CursorIcon::SwResize
    } else if edges == ResizeEdge::BOTTOM_RIGHT {
        CursorIcon::SeResize
    } else {
        return None;
    };
    Some(cursor)
}

/// Errors of [`surface_resize`].
#[derive(Debug, thiserror::Error)]
pub enum ResizeGrabError {
    /// The edge mask is empty, out of range, or names opposing edges.
    #[error("invalid resize edge mask {0:#06b}")]
    InvalidEdges(u32),
}

#[derive(Debug, Clone)]
pub struct MoveGrab {
    surface: Surface,
    /// Offset from the grab point to the surface origin.
    delta: Point,
}

#[derive(Debug, Clone)]
pub struct ResizeGrab {
    surface: Surface,
    edges: ResizeEdge,
    /// Pointer position when the grab started.
    anchor: Point,
    /// Surface size when the grab started.
    initial: Size,
}

#[derive(Clone)]
pub struct DragGrab {
    pub(crate) drag: Drag,
}

impl std::fmt::Debug for DragGrab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DragGrab").finish_non_exhaustive()
    }
}

/// An active pointer grab.
#[derive(Debug, Clone)]
pub enum Grab {
    Move(MoveGrab),
    Resize(ResizeGrab),
    Drag(DragGrab),
}

/// One event routed to a grab.
#[derive(Debug, Clone, Copy)]
pub enum GrabEvent {
    Motion {
        time: u32,
        position: Point,
    },
    Button {
        time: u32,
        button: u32,
        state: ButtonState,
    },
    End {
        time: u32,
    },
}

impl Grab {
    pub(crate) fn handle_event<D: ShellHandler>(
        &self,
        data: &mut D,
        device: &InputDevice,
        event: &GrabEvent,
    ) {
        match (self, event) {
            (Grab::Move(grab), GrabEvent::Motion { position, .. }) => {
                let rect = Rectangle {
                    loc: Point::new(position.x + grab.delta.x, position.y + grab.delta.y),
                    size: grab.surface.size(),
                };
                crate::shell::apply_geometry(data, &grab.surface, rect);
            }
            (Grab::Resize(grab), GrabEvent::Motion { time, position }) => {
                let width = if grab.edges.contains(ResizeEdge::LEFT) {
                    grab.anchor.x - position.x + grab.initial.w
                } else if grab.edges.contains(ResizeEdge::RIGHT) {
                    position.x - grab.anchor.x + grab.initial.w
                } else {
                    grab.initial.w
                };
                let height = if grab.edges.contains(ResizeEdge::TOP) {
                    grab.anchor.y - position.y + grab.initial.h
                } else if grab.edges.contains(ResizeEdge::BOTTOM) {
                    position.y - grab.anchor.y + grab.initial.h
                } else {
                    grab.initial.h
                };
                // Only the client may actually resize; we ask.
                data.send_configure(&grab.surface, *time, grab.edges, Size::new(width, height));
            }
            (Grab::Drag(grab), GrabEvent::Motion { time, position }) => {
                drag::drag_grab_motion(data, device, &grab.drag, *time, *position);
            }
            (Grab::Drag(grab), GrabEvent::End { time }) => {
                drag::drag_grab_end(&grab.drag, *time);
            }
            // Move and resize ignore buttons; their end is the release
            // itself and needs no teardown beyond dropping the grab.
            (Grab::Move(_) | Grab::Resize(_), GrabEvent::Button { .. } | GrabEvent::End { .. }) => {}
            (Grab::Drag(_), GrabEvent::Button { .. }) => {}
        }
    }

    /// React to `surface` being destroyed mid-grab. Returns `true` when
    /// the grab itself must end.
    pub(crate) fn on_surface_destroyed(&self, surface: &Surface, time: u32) -> bool {
        match self {
            Grab::Move(grab) => grab.surface == *surface,
            Grab::Resize(grab) => grab.surface == *surface,
            Grab::Drag(grab) => {
                // The drag outlives its focus surface; only the focus is
                // retracted.
                drag::drag_focus_surface_destroyed(&grab.drag, surface, time);
                false
            }
        }
    }
}

/// Install `grab` on `device`, clearing pointer focus and setting the
/// cursor. Fails (returning `false`) if a grab is already active.
pub(crate) fn start_grab<D: ShellHandler>(
    data: &mut D,
    device: &InputDevice,
    grab: Grab,
    cursor: Option<CursorIcon>,
) -> bool {
    {
        let mut state = device.state_mut();
        if state.grab.is_some() {
            debug!("Refusing grab, device is already grabbed");
            return false;
        }
        state.grab = Some(grab);
        state.pointer_focus = None;
    }
    if let Some(cursor) = cursor {
        data.set_cursor(device, cursor);
    }
    true
}

/// End the active grab on `device`, if any, delivering the trailing end
/// event.
pub(crate) fn end_grab<D: ShellHandler>(data: &mut D, device: &InputDevice, time: u32) {
    let grab = device.state_mut().grab.take();
    if let Some(grab) = grab {
        grab.handle_event(data, device, &GrabEvent::End { time });
    }
}

/// Route a pointer motion event. Returns `true` when a grab consumed it.
pub fn pointer_motion<D: ShellHandler>(
    data: &mut D,
    device: &InputDevice,
    time: u32,
    x: i32,
    y: i32,
) -> bool {
    device.state_mut().pointer = Point::new(x, y);
    let grab = device.state().grab.clone();
    match grab {
        Some(grab) => {
            grab.handle_event(
                data,
                device,
                &GrabEvent::Motion {
                    time,
                    position: Point::new(x, y),
                },
            );
            true
        }
        None => false,
    }
}

/// Route a pointer button event. Releasing the last pressed button ends
/// the active grab. Returns `true` when a grab consumed the event.
pub fn pointer_button<D: ShellHandler>(
    data: &mut D,
    device: &InputDevice,
    time: u32,
    button: u32,
    state: ButtonState,
) -> bool {
    {
        let mut dev = device.state_mut();
        match state {
            ButtonState::Pressed => {
                if dev.pressed == 0 {
                    dev.grab_origin = dev.pointer;
                }
                dev.pressed += 1;
            }
            ButtonState::Released => dev.pressed = dev.pressed.saturating_sub(1),
        }
    }

    let grab = device.state().grab.clone();
    let Some(grab) = grab else { return false };

    grab.handle_event(data, device, &GrabEvent::Button { time, button, state });
    if state == ButtonState::Released && device.state().pressed == 0 {
        end_grab(data, device, time);
    }
    true
}

/// Start an interactive move of `surface` driven by `device`.
pub fn surface_move<D: ShellHandler>(
    data: &mut D,
    surface: &Surface,
    device: &InputDevice,
    _time: u32,
) {
    let origin = device.grab_origin();
    let loc = surface.location();
    let grab = Grab::Move(MoveGrab {
        surface: surface.clone(),
        delta: Point::new(loc.x - origin.x, loc.y - origin.y),
    });
    start_grab(data, device, grab, Some(CursorIcon::Grabbing));
}

/// Start an interactive resize of `surface` along `edges` (a raw protocol
/// edge mask).
pub fn surface_resize<D: ShellHandler>(
    data: &mut D,
    surface: &Surface,
    device: &InputDevice,
    _time: u32,
    edges: u32,
) -> Result<(), ResizeGrabError> {
    let edges = ResizeEdge::from_bits(edges).ok_or(ResizeGrabError::InvalidEdges(edges))?;
    let cursor = resize_cursor(edges).ok_or(ResizeGrabError::InvalidEdges(edges.bits()))?;

    let grab = Grab::Resize(ResizeGrab {
        surface: surface.clone(),
        edges,
        anchor: device.grab_origin(),
        initial: surface.size(),
    });
    start_grab(data, device, grab, Some(cursor));
    Ok(())
}

/// Returns `true` if the shell refuses interactive move/resize of
/// `surface` (panel, background, fullscreen).
fn binding_rejected<D: ShellHandler>(data: &mut D, surface: &Surface) -> bool {
    if surface.map_type() == MapType::Fullscreen {
        return true;
    }
    let shell = data.shell_state();
    shell.is_panel(surface) || shell.is_background(surface)
}

/// Pointer-binding handler for the move chord (conventionally SUPER+LEFT).
pub fn move_binding<D: ShellHandler>(data: &mut D, device: &InputDevice, time: u32) {
    let Some(surface) = device.pointer_focus() else { return };
    if binding_rejected(data, &surface) {
        return;
    }
    surface_move(data, &surface, device, time);
}

/// Pointer-binding handler for the resize chord (conventionally
/// SUPER+MIDDLE). The edge mask is derived from which third of the surface
/// the grab started in; a grab in the center third resolves to an empty
/// mask and is rejected like any other invalid mask.
pub fn resize_binding<D: ShellHandler>(data: &mut D, device: &InputDevice, time: u32) {
    let Some(surface) = device.pointer_focus() else { return };
    if binding_rejected(data, &surface) {
        return;
    }

    let origin = device.grab_origin();
    let geometry = surface.geometry();
    let x = origin.x - geometry.loc.x;
    let y = origin.y - geometry.loc.y;

    let mut edges = ResizeEdge::empty();
    if x < geometry.size.w / 3 {
        edges |= ResizeEdge::LEFT;
    } else if x >= 2 * geometry.size.w / 3 {
        edges |= ResizeEdge::RIGHT;
    }
    if y < geometry.size.h / 3 {
        edges |= ResizeEdge::TOP;
    } else if y >= 2 * geometry.size.h / 3 {
        edges |= ResizeEdge::BOTTOM;
    }

    let _ = surface_resize(data, &surface, device, time, edges.bits());
}
