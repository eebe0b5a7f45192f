//! Input-device handles.
//!
//! The host's input backend owns the devices and feeds pointer and button
//! events through [`shell::grabs`](crate::shell::grabs); the shell tracks
//! per-device policy state on them: the active grab, the keyboard focus and
//! the current selection. Exactly one grab and one selection may be active
//! per device at any time.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::selection::selection::Selection;
use crate::shell::grabs::Grab;
use crate::shell::ShellHandler;
use crate::surface::{Surface, WeakSurface};
use crate::utils::geometry::Point;

/// State of a button in a pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Released,
    Pressed,
}

pub(crate) struct DeviceInner {
    /// Current pointer location.
    pub(crate) pointer: Point,
    /// Pointer location at the moment the current implicit grab started.
    pub(crate) grab_origin: Point,
    /// Number of currently pressed buttons.
    pub(crate) pressed: u32,
    pub(crate) pointer_focus: Option<WeakSurface>,
    pub(crate) keyboard_focus: Option<WeakSurface>,
    pub(crate) grab: Option<Grab>,
    pub(crate) selection: Option<Selection>,
}

/// Handle to an input device (a seat's pointer/keyboard pair).
#[derive(Clone)]
pub struct InputDevice {
    inner: Rc<RefCell<DeviceInner>>,
}

impl InputDevice {
    pub fn new() -> InputDevice {
        InputDevice {
            inner: Rc::new(RefCell::new(DeviceInner {
                pointer: Point::default(),
                grab_origin: Point::default(),
                pressed: 0,
                pointer_focus: None,
                keyboard_focus: None,
                grab: None,
                selection: None,
            })),
        }
    }

    pub fn pointer_position(&self) -> Point {
        self.inner.borrow().pointer
    }

    /// Pointer position recorded when the current implicit grab began.
    pub fn grab_origin(&self) -> Point {
        self.inner.borrow().grab_origin
    }

    pub fn keyboard_focus(&self) -> Option<Surface> {
        self.inner.borrow().keyboard_focus.as_ref().and_then(WeakSurface::upgrade)
    }

    pub fn pointer_focus(&self) -> Option<Surface> {
        self.inner.borrow().pointer_focus.as_ref().and_then(WeakSurface::upgrade)
    }

    /// Record the surface under the pointer, as computed by the host's pick.
    pub fn set_pointer_focus(&self, surface: Option<&Surface>) {
        self.inner.borrow_mut().pointer_focus = surface.map(Surface::downgrade);
    }

    /// Whether a grab is currently routing this device's pointer events.
    pub fn has_grab(&self) -> bool {
        self.inner.borrow().grab.is_some()
    }

    pub(crate) fn state(&self) -> Ref<'_, DeviceInner> {
        self.inner.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, DeviceInner> {
        self.inner.borrow_mut()
    }
}

impl Default for InputDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for InputDevice {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for InputDevice {}

impl fmt::Debug for InputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("InputDevice")
            .field("pointer", &inner.pointer)
            .field("pressed", &inner.pressed)
            .field("grabbed", &inner.grab.is_some())
            .finish_non_exhaustive()
    }
}

/// Move the keyboard focus of `device` to `surface`.
///
/// The device's active selection follows the focus: the newly focused
/// client is offered the selection contents, the previous one loses it.
pub fn set_keyboard_focus<D: ShellHandler>(
    data: &mut D,
    device: &InputDevice,
    surface: Option<&Surface>,
    time: u32,
) {
    device.state_mut().keyboard_focus = surface.map(Surface::downgrade);
    data.keyboard_focus_set(device, surface, time);

    let selection = device.state().selection.clone();
    if let Some(selection) = selection {
        crate::selection::selection::set_selection_focus(&selection, surface, time);
    }
}
