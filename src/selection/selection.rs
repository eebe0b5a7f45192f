//! Keyboard selections (the clipboard).
//!
//! Each input device carries at most one active selection. The offer
//! follows the device's keyboard focus: whenever the focus moves to a
//! surface of another client, that client is told the advertised MIME
//! types and gains the offer, while the previous client loses it.
//! Activating a new selection cancels the old source first.

use std::cell::RefCell;
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use crate::seat::InputDevice;
use crate::selection::{SelectionOfferEvents, SelectionSourceEvents};
use crate::surface::{Surface, WeakSurface};

struct SelectionInner {
    source_events: Rc<dyn SelectionSourceEvents>,
    offer_events: Rc<dyn SelectionOfferEvents>,
    mime_types: Vec<String>,
    device: Option<InputDevice>,
    focus: Option<WeakSurface>,
}

/// A selection object created by a client (or by the X bridge on behalf
/// of an X clipboard owner).
#[derive(Clone)]
pub struct Selection {
    inner: Rc<RefCell<SelectionInner>>,
}

impl PartialEq for Selection {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Selection")
            .field("mime_types", &inner.mime_types)
            .finish_non_exhaustive()
    }
}

impl Selection {
    pub fn new(
        source_events: Rc<dyn SelectionSourceEvents>,
        offer_events: Rc<dyn SelectionOfferEvents>,
    ) -> Selection {
        Selection {
            inner: Rc::new(RefCell::new(SelectionInner {
                source_events,
                offer_events,
                mime_types: Vec::new(),
                device: None,
                focus: None,
            })),
        }
    }

    /// Advertise one more MIME type. Offer events replay these in
    /// registration order.
    pub fn offer(&self, mime_type: &str) {
        self.inner.borrow_mut().mime_types.push(mime_type.to_owned());
    }

    /// The MIME types advertised so far, in registration order.
    pub fn mime_types(&self) -> Vec<String> {
        self.inner.borrow().mime_types.clone()
    }
}

/// Make `selection` the device's current selection, cancelling any
/// previous one, and offer it to the currently focused client.
pub fn activate(selection: &Selection, device: &InputDevice, time: u32) {
    let previous = {
        let mut dev = device.state_mut();
        dev.selection.replace(selection.clone())
    };
    if let Some(previous) = previous {
        if previous != *selection {
            // The cancel must land before the new selection's first offer.
            let source_events = previous.inner.borrow().source_events.clone();
            source_events.cancelled();
            previous.inner.borrow_mut().device = None;
        }
    }

    selection.inner.borrow_mut().device = Some(device.clone());

    let focus = device.keyboard_focus();
    set_selection_focus(selection, focus.as_ref(), time);
}

/// Redirect the selection offer to the client owning `surface`.
///
/// Called on every keyboard-focus change of the owning device.
pub fn set_selection_focus(selection: &Selection, surface: Option<&Surface>, _time: u32) {
    let (offer_events, mime_types, old_focus, device) = {
        let inner = selection.inner.borrow();
        (
            inner.offer_events.clone(),
            inner.mime_types.clone(),
            inner.focus.as_ref().and_then(WeakSurface::upgrade),
            inner.device.clone(),
        )
    };

    // Surfaces without a client cannot hold the offer.
    let new_focus = surface.filter(|s| s.client().is_some());

    if old_focus.as_ref() == new_focus {
        return;
    }

    if let Some(old_client) = old_focus.as_ref().and_then(Surface::client) {
        offer_events.keyboard_focus(old_client, None);
    }

    if let Some(surface) = new_focus {
        let client = surface.client().expect("checked above");
        for mime_type in &mime_types {
            offer_events.offer(client, mime_type);
        }
        offer_events.keyboard_focus(client, device.as_ref());
    }

    selection.inner.borrow_mut().focus = new_focus.map(Surface::downgrade);
}

/// A focused client asks for the selection contents.
pub fn receive(selection: &Selection, mime_type: &str, fd: OwnedFd) {
    let source_events = selection.inner.borrow().source_events.clone();
    // fd ownership moves into the sink; the wire runtime closes our copy
    // once marshalled.
    source_events.send(mime_type, fd);
}

/// The selection resource was destroyed; release the device slot and
/// retract the offer.
pub fn destroyed(selection: &Selection, time: u32) {
    let device = selection.inner.borrow_mut().device.take();
    if let Some(device) = device {
        let mut dev = device.state_mut();
        if dev.selection.as_ref() == Some(selection) {
            dev.selection = None;
        }
        drop(dev);
        set_selection_focus(selection, None, time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, TestState, TransferEvent};
    use crate::surface::ClientId;
    use crate::utils::geometry::Rectangle;

    #[test]
    fn activation_offers_to_focused_client_in_order() {
        let mut state = TestState::new();
        let surface = state.surface_for_client(ClientId(3), Rectangle::new(0, 0, 100, 100));
        let device = InputDevice::new();
        crate::seat::set_keyboard_focus(&mut state, &device, Some(&surface), 1);

        let sink = RecordingSink::new();
        let selection = Selection::new(sink.clone(), sink.clone());
        selection.offer("text/plain;charset=utf-8");
        selection.offer("text/plain");

        activate(&selection, &device, 2);

        assert_eq!(
            sink.drain(),
            vec![
                TransferEvent::Offer { to: ClientId(3), mime: "text/plain;charset=utf-8".into() },
                TransferEvent::Offer { to: ClientId(3), mime: "text/plain".into() },
                TransferEvent::KeyboardFocus { to: ClientId(3), focused: true },
            ]
        );
    }

    #[test]
    fn new_selection_cancels_the_previous_one_first() {
        let mut state = TestState::new();
        let surface = state.surface_for_client(ClientId(3), Rectangle::new(0, 0, 100, 100));
        let device = InputDevice::new();
        crate::seat::set_keyboard_focus(&mut state, &device, Some(&surface), 1);

        // Both selections share one recording sink so the relative order
        // of their events is observable.
        let sink = RecordingSink::new();
        let first = Selection::new(sink.clone(), sink.clone());
        first.offer("text/plain");
        activate(&first, &device, 2);
        sink.drain();

        let second = Selection::new(sink.clone(), sink.clone());
        second.offer("text/html");
        activate(&second, &device, 3);

        assert_eq!(
            sink.drain(),
            vec![
                TransferEvent::Cancelled,
                TransferEvent::Offer { to: ClientId(3), mime: "text/html".into() },
                TransferEvent::KeyboardFocus { to: ClientId(3), focused: true },
            ]
        );
    }

    #[test]
    fn focus_change_retracts_and_reoffers() {
        let mut state = TestState::new();
        let first = state.surface_for_client(ClientId(1), Rectangle::new(0, 0, 100, 100));
        let second = state.surface_for_client(ClientId(2), Rectangle::new(0, 0, 100, 100));
        let device = InputDevice::new();
        crate::seat::set_keyboard_focus(&mut state, &device, Some(&first), 1);

        let sink = RecordingSink::new();
        let selection = Selection::new(sink.clone(), sink.clone());
        selection.offer("text/plain");
        activate(&selection, &device, 2);
        sink.drain();

        crate::seat::set_keyboard_focus(&mut state, &device, Some(&second), 3);
        assert_eq!(
            sink.drain(),
            vec![
                TransferEvent::KeyboardFocus { to: ClientId(1), focused: false },
                TransferEvent::Offer { to: ClientId(2), mime: "text/plain".into() },
                TransferEvent::KeyboardFocus { to: ClientId(2), focused: true },
            ]
        );

        // Focus moving within the same surface changes nothing.
        crate::seat::set_keyboard_focus(&mut state, &device, Some(&second), 4);
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn receive_posts_send_to_the_source() {
        let mut state = TestState::new();
        let surface = state.surface_for_client(ClientId(1), Rectangle::new(0, 0, 100, 100));
        let device = InputDevice::new();
        crate::seat::set_keyboard_focus(&mut state, &device, Some(&surface), 1);

        let sink = RecordingSink::new();
        let selection = Selection::new(sink.clone(), sink.clone());
        selection.offer("text/plain");
        activate(&selection, &device, 2);
        sink.drain();

        let (_read, write) = rustix::pipe::pipe().unwrap();
        receive(&selection, "text/plain", write);
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::Send { mime: "text/plain".into() }]
        );
    }

    #[test]
    fn destroy_clears_the_device_slot_and_retracts() {
        let mut state = TestState::new();
        let surface = state.surface_for_client(ClientId(1), Rectangle::new(0, 0, 100, 100));
        let device = InputDevice::new();
        crate::seat::set_keyboard_focus(&mut state, &device, Some(&surface), 1);

        let sink = RecordingSink::new();
        let selection = Selection::new(sink.clone(), sink.clone());
        selection.offer("text/plain");
        activate(&selection, &device, 2);
        sink.drain();

        destroyed(&selection, 3);
        assert!(device.state().selection.is_none());
        assert_eq!(
            sink.drain(),
            vec![TransferEvent::KeyboardFocus { to: ClientId(1), focused: false }]
        );
    }
}
