//! Drag-and-drop offers.
//!
//! A client creates a [`Drag`], advertises MIME types, then activates it on
//! an input device, which installs a drag grab. While the grab lives, the
//! shell tracks which surface (and thus which client) faces the offer and
//! re-advertises the types on every client handover. The receiving side
//! accepts a type and eventually asks for the data on a pipe fd, which is
//! forwarded to the source as a FINISH event.

use std::cell::RefCell;
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use tracing::debug;

use crate::seat::InputDevice;
use crate::selection::{DragOfferEvents, DragSourceEvents};
use crate::shell::grabs::{self, DragGrab, Grab};
use crate::shell::ShellHandler;
use crate::surface::{ClientId, Surface, WeakSurface};
use crate::utils::geometry::Point;

struct DragInner {
    source_events: Rc<dyn DragSourceEvents>,
    offer_events: Rc<dyn DragOfferEvents>,
    mime_types: Vec<String>,
    source_surface: Option<WeakSurface>,
    focus: Option<WeakSurface>,
    pointer_focus_time: u32,
    target: Option<ClientId>,
    chosen_mime: Option<String>,
    device: Option<InputDevice>,
}

/// A drag object created by a client.
#[derive(Clone)]
pub struct Drag {
    inner: Rc<RefCell<DragInner>>,
}

impl PartialEq for Drag {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Drag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Drag")
            .field("mime_types", &inner.mime_types)
            .field("target", &inner.target)
            .finish_non_exhaustive()
    }
}

impl Drag {
    pub fn new(source_events: Rc<dyn DragSourceEvents>, offer_events: Rc<dyn DragOfferEvents>) -> Drag {
        Drag {
            inner: Rc::new(RefCell::new(DragInner {
                source_events,
                offer_events,
                mime_types: Vec::new(),
                source_surface: None,
                focus: None,
                pointer_focus_time: 0,
                target: None,
                chosen_mime: None,
                device: None,
            })),
        }
    }

    /// Advertise one more MIME type. Only valid before activation.
    pub fn offer(&self, mime_type: &str) {
        self.inner.borrow_mut().mime_types.push(mime_type.to_owned());
    }

    fn focus_client(&self) -> Option<ClientId> {
        self.inner
            .borrow()
            .focus
            .as_ref()
            .and_then(WeakSurface::upgrade)
            .and_then(|s| s.client())
    }
}

/// Start the drag: install the grab on `device` and run the initial pick.
///
/// Silently does nothing if the device is already grabbed.
pub fn activate<D: ShellHandler>(
    data: &mut D,
    drag: &Drag,
    source_surface: &Surface,
    device: &InputDevice,
    time: u32,
) {
    let grab = Grab::Drag(DragGrab { drag: drag.clone() });
    if !grabs::start_grab(data, device, grab, None) {
        return;
    }

    {
        let mut inner = drag.inner.borrow_mut();
        inner.source_surface = Some(source_surface.downgrade());
        inner.device = Some(device.clone());
    }

    let picked = pick(data, device);
    let pointer = device.pointer_position();
    set_drag_focus(drag, picked, time, pointer);
}

/// The receiver's answer to the offer. Requests carrying a time from
/// before the current focus are stale and discarded.
pub fn accept(drag: &Drag, client: ClientId, time: u32, mime_type: Option<&str>) {
    let (source_events, chosen) = {
        let mut inner = drag.inner.borrow_mut();
        if time < inner.pointer_focus_time {
            // The client answered a pointer_focus or motion event from a
            // surface the pointer has already left; the source will simply
            // never see a matching target event.
            debug!(time, focus_time = inner.pointer_focus_time, "Discarding stale drag accept");
            return;
        }

        inner.target = Some(client);
        inner.chosen_mime = mime_type.and_then(|wanted| {
            inner.mime_types.iter().find(|m| m.as_str() == wanted).cloned()
        });
        (inner.source_events.clone(), inner.chosen_mime.clone())
    };

    source_events.target(chosen.as_deref());
}

/// The receiver wants the data: forward the pipe to the source.
pub fn receive(drag: &Drag, fd: OwnedFd) {
    let source_events = drag.inner.borrow().source_events.clone();
    // Ownership of the fd moves to the sink; the wire runtime closes our
    // copy after marshalling it.
    source_events.finish(fd);
}

/// The receiver rejected the drag.
pub fn reject(drag: &Drag) {
    let source_events = drag.inner.borrow().source_events.clone();
    source_events.reject();
}

/// The drag resource was destroyed; end its grab if it is still running.
pub fn destroyed<D: ShellHandler>(data: &mut D, drag: &Drag, time: u32) {
    let device = drag.inner.borrow_mut().device.take();
    let Some(device) = device else { return };

    let ours = matches!(
        device.state().grab,
        Some(Grab::Drag(ref grab)) if grab.drag == *drag
    );
    if ours {
        grabs::end_grab(data, &device, time);
    }
}

fn pick<D: ShellHandler>(data: &mut D, device: &InputDevice) -> Option<(Surface, Point)> {
    // A surface without a client cannot face an offer; treat it like
    // hovering nothing.
    data.pick_surface(device).filter(|(s, _)| s.client().is_some())
}

/// Move the drag focus, emitting the handover events on client boundaries.
fn set_drag_focus(drag: &Drag, new_focus: Option<(Surface, Point)>, time: u32, pointer: Point) {
    let (offer_events, mime_types, old_focus) = {
        let inner = drag.inner.borrow();
        let old = inner.focus.as_ref().and_then(WeakSurface::upgrade);
        (inner.offer_events.clone(), inner.mime_types.clone(), old)
    };

    if old_focus.as_ref() == new_focus.as_ref().map(|(s, _)| s) {
        return;
    }

    let old_client = old_focus.as_ref().and_then(Surface::client);
    let new_client = new_focus.as_ref().and_then(|(s, _)| s.client());

    if let Some(old_client) = old_client {
        if new_client != Some(old_client) {
            offer_events.pointer_focus(old_client, time, None, 0, 0, 0, 0);
        }
    }

    if let Some((surface, local)) = &new_focus {
        let client = new_client.expect("picked surfaces always have a client");
        if old_client != Some(client) {
            for mime_type in &mime_types {
                offer_events.offer(client, mime_type);
            }
        }
        offer_events.pointer_focus(
            client,
            time,
            Some(surface),
            pointer.x,
            pointer.y,
            local.x,
            local.y,
        );
    }

    let mut inner = drag.inner.borrow_mut();
    inner.focus = new_focus.map(|(s, _)| s.downgrade());
    inner.pointer_focus_time = time;
    inner.target = None;
    inner.chosen_mime = None;
}

pub(crate) fn drag_grab_motion<D: ShellHandler>(
    data: &mut D,
    device: &InputDevice,
    drag: &Drag,
    time: u32,
    position: Point,
) {
    let picked = pick(data, device);
    let previous_client = drag.focus_client();

    set_drag_focus(drag, picked.clone(), time, position);

    if let Some((surface, local)) = picked {
        let client = surface.client().expect("picked surfaces always have a client");
        // Focus and offer events precede the first motion for a new
        // focus; motion is only reported while staying with one client.
        if previous_client == Some(client) {
            let offer_events = drag.inner.borrow().offer_events.clone();
            offer_events.motion(client, time, position.x, position.y, local.x, local.y);
        }
    }
}

pub(crate) fn drag_grab_end(drag: &Drag, time: u32) {
    let (target, offer_events) = {
        let mut inner = drag.inner.borrow_mut();
        inner.device = None;
        (inner.target, inner.offer_events.clone())
    };

    if let Some(target) = target {
        offer_events.dropped(target);
    }

    set_drag_focus(drag, None, time, Point::default());
}

/// The focused surface died mid-drag; retract focus without ending the
/// drag.
pub(crate) fn drag_focus_surface_destroyed(drag: &Drag, surface: &Surface, time: u32) {
    let is_focus = {
        let inner = drag.inner.borrow();
        inner.focus.as_ref().map_or(false, |w| w.is(surface))
    };
    if is_focus {
        set_drag_focus(drag, None, time, Point::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seat::ButtonState;
    use crate::test_support::{RecordingSink, TestState, TransferEvent};
    use crate::utils::geometry::Rectangle;

    fn drag_between_two_clients() -> (TestState, Drag, Surface, Surface, InputDevice, Rc<RecordingSink>) {
        let mut state = TestState::new();
        let c1_surface = state.surface_for_client(ClientId(1), Rectangle::new(0, 0, 200, 200));
        let c2_surface = state.surface_for_client(ClientId(2), Rectangle::new(200, 0, 200, 200));
        let device = InputDevice::new();

        let sink = RecordingSink::new();
        let drag = Drag::new(sink.clone(), sink.clone());
        drag.offer("text/uri-list");
        drag.offer("text/plain");

        (state, drag, c1_surface, c2_surface, device, sink)
    }

    #[test]
    fn focus_handover_between_clients() {
        let (mut state, drag, c1_surface, c2_surface, device, sink) = drag_between_two_clients();

        // Pointer over C1's surface at activation time.
        grabs::pointer_motion(&mut state, &device, 99, 50, 50);
        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);

        assert_eq!(
            sink.drain(),
            vec![
                TransferEvent::Offer { to: ClientId(1), mime: "text/uri-list".into() },
                TransferEvent::Offer { to: ClientId(1), mime: "text/plain".into() },
                TransferEvent::PointerFocus {
                    to: ClientId(1),
                    time: 100,
                    surface: Some(c1_surface.clone()),
                },
            ]
        );

        // Crossing into C2's surface.
        state.pick = Some((c2_surface.clone(), Point::new(10, 60)));
        grabs::pointer_motion(&mut state, &device, 110, 210, 60);

        assert_eq!(
            sink.drain(),
            vec![
                TransferEvent::PointerFocus { to: ClientId(1), time: 110, surface: None },
                TransferEvent::Offer { to: ClientId(2), mime: "text/uri-list".into() },
                TransferEvent::Offer { to: ClientId(2), mime: "text/plain".into() },
                TransferEvent::PointerFocus {
                    to: ClientId(2),
                    time: 110,
                    surface: Some(c2_surface.clone()),
                },
            ]
        );

        // Motion without a handover reports plain motion.
        grabs::pointer_motion(&mut state, &device, 115, 215, 65);
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::Motion { to: ClientId(2), time: 115 }]
        );
    }

    #[test]
    fn stale_accept_is_discarded() {
        let (mut state, drag, c1_surface, c2_surface, device, sink) = drag_between_two_clients();

        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);
        state.pick = Some((c2_surface.clone(), Point::new(10, 60)));
        grabs::pointer_motion(&mut state, &device, 110, 210, 60);
        sink.drain();

        // C1 answers an event from before it lost the focus.
        accept(&drag, ClientId(1), 100, Some("text/plain"));
        assert!(sink.drain().is_empty());

        // A current accept does reach the source.
        accept(&drag, ClientId(2), 110, Some("text/plain"));
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::Target { mime: Some("text/plain".into()) }]
        );
    }

    #[test]
    fn accept_with_unknown_mime_reports_none() {
        let (mut state, drag, c1_surface, _c2, device, sink) = drag_between_two_clients();
        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);
        sink.drain();

        accept(&drag, ClientId(1), 100, Some("image/png"));
        assert_eq!(sink.drain(), vec![TransferEvent::Target { mime: None }]);
    }

    #[test]
    fn drop_goes_to_accepting_target_on_release() {
        let (mut state, drag, c1_surface, _c2, device, sink) = drag_between_two_clients();
        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);
        accept(&drag, ClientId(1), 100, Some("text/plain"));
        sink.drain();

        grabs::pointer_button(&mut state, &device, 120, 0x110, ButtonState::Released);

        assert_eq!(
            sink.drain(),
            vec![
                TransferEvent::Dropped { to: ClientId(1) },
                TransferEvent::PointerFocus { to: ClientId(1), time: 120, surface: None },
            ]
        );
        assert!(!device.has_grab());
    }

    #[test]
    fn release_without_target_only_retracts_focus() {
        let (mut state, drag, c1_surface, _c2, device, sink) = drag_between_two_clients();
        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);
        sink.drain();

        grabs::pointer_button(&mut state, &device, 120, 0x110, ButtonState::Released);
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::PointerFocus { to: ClientId(1), time: 120, surface: None }]
        );
    }

    #[test]
    fn receive_forwards_the_pipe_to_the_source() {
        let (_state, drag, _c1, _c2, _device, sink) = drag_between_two_clients();
        let (_read, write) = rustix::pipe::pipe().unwrap();
        receive(&drag, write);
        assert!(matches!(sink.drain().as_slice(), [TransferEvent::Finish]));
    }

    #[test]
    fn pick_of_nothing_retracts_focus_without_motion() {
        let (mut state, drag, c1_surface, _c2, device, sink) = drag_between_two_clients();
        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);
        sink.drain();

        state.pick = None;
        grabs::pointer_motion(&mut state, &device, 130, 500, 500);
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::PointerFocus { to: ClientId(1), time: 130, surface: None }]
        );
    }

    #[test]
    fn destroying_the_drag_ends_the_grab() {
        let (mut state, drag, c1_surface, _c2, device, sink) = drag_between_two_clients();
        grabs::pointer_button(&mut state, &device, 99, 0x110, ButtonState::Pressed);
        state.pick = Some((c1_surface.clone(), Point::new(50, 50)));
        activate(&mut state, &drag, &c1_surface, &device, 100);
        sink.drain();

        destroyed(&mut state, &drag, 140);
        assert!(!device.has_grab());
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::PointerFocus { to: ClientId(1), time: 140, surface: None }]
        );
    }
}
