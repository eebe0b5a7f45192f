//! Session lock.
//!
//! Locking parks every client surface except the background on a hidden
//! list and clears all foci, leaving at most the background and, later,
//! the helper's lock surface visible. Unlocking asks the helper to prepare
//! a lock surface first (edge-triggered, at most one request in flight);
//! the desktop resumes when the helper confirms, or immediately if the
//! helper is gone.

use tracing::error;

use crate::shell::{apply_geometry, ShellHandler};
use crate::surface::{Surface, WeakSurface};

/// Lock the session, initiated by the host (or inactivity).
pub fn lock<D: ShellHandler>(data: &mut D) {
    {
        let shell = data.shell_state();
        if shell.locked {
            return;
        }
        shell.locked = true;

        if !shell.hidden.is_empty() {
            // Programmer error; keep going, resume_desktop() will still
            // unwind whatever ends up on the list.
            error!("Hidden surface list is not empty at lock entry");
        }

        shell.prune();

        // Move all surfaces to the hidden list, except the background (and
        // clientless sprites, which never take input). This way nothing
        // else can show or receive input events while we are locked.
        let background = shell.background.clone();
        let mut still_visible = Vec::new();
        for weak in shell.visible.drain(..) {
            let Some(surface) = weak.upgrade() else { continue };
            let keep = surface.client().is_none()
                || background.as_ref().map_or(false, |b| b.is(&surface));
            if keep {
                still_visible.push(weak);
            } else {
                surface.state_mut().output = None;
                shell.hidden.push(weak);
            }
        }
        shell.visible = still_visible;
    }

    data.repick();
    for device in data.input_devices() {
        crate::seat::set_keyboard_focus(data, &device, None, 0);
    }
}

/// Unlock the session, initiated by the host.
pub fn unlock<D: ShellHandler>(data: &mut D) {
    {
        let shell = data.shell_state();
        if !shell.locked || shell.lock_surface.is_some() {
            data.wake();
            return;
        }

        // If the helper has gone away, unlock immediately.
        if !shell.child.bound {
            return resume_desktop(data);
        }

        if shell.prepare_event_sent {
            return;
        }
        shell.prepare_event_sent = true;
    }
    data.prepare_lock_surface();
}

/// The helper's answer to PREPARE_LOCK_SURFACE.
pub fn set_lock_surface<D: ShellHandler>(data: &mut D, surface: &Surface) {
    let shell = data.shell_state();
    shell.prepare_event_sent = false;

    if !shell.locked {
        return;
    }

    shell.lock_surface = Some(surface.downgrade());
}

/// The helper's unlock request.
pub fn desktop_shell_unlock<D: ShellHandler>(data: &mut D) {
    let shell = data.shell_state();
    shell.prepare_event_sent = false;

    if shell.locked {
        resume_desktop(data);
    }
}

/// Bring every hidden surface back, above the background and in its old
/// order, and wake the compositor.
pub(crate) fn resume_desktop<D: ShellHandler>(data: &mut D) {
    let hidden: Vec<Surface> = data.shell_state().hidden_surfaces();
    for surface in &hidden {
        let rect = surface.geometry();
        apply_geometry(data, surface, rect);
    }

    {
        let shell = data.shell_state();
        let insert_at = shell
            .background()
            .and_then(|bg| shell.visible.iter().position(|w| w.is(&bg)))
            .unwrap_or(shell.visible.len());
        let resumed: Vec<WeakSurface> = shell.hidden.drain(..).collect();
        shell.visible.splice(insert_at..insert_at, resumed);
        shell.locked = false;
    }

    data.repick();
    data.wake();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seat::InputDevice;
    use crate::shell::{self, ShellHandler};
    use crate::test_support::{HostEvent, TestState};
    use crate::utils::geometry::Rectangle;

    fn locked_desktop() -> (TestState, Surface, Surface, Surface, Surface, InputDevice) {
        let mut state = TestState::new();
        let (panel, background) = state.desktop(1920, 1080);
        let a = state.mapped_surface(300, 200);
        let b = state.mapped_surface(400, 300);
        let device = InputDevice::new();
        state.devices.push(device.clone());
        shell::activate(&mut state, &a, &device, 1);
        state.shell_state().child.bound = true;
        (state, panel, background, a, b, device)
    }

    #[test]
    fn lock_hides_everything_but_the_background() {
        let (mut state, panel, background, a, b, device) = locked_desktop();

        lock(&mut state);

        let shell = state.shell_state();
        assert!(shell.is_locked());
        assert_eq!(shell.visible_surfaces(), vec![background.clone()]);
        // Panel first (it was topmost), then the stacking order below it.
        assert_eq!(shell.hidden_surfaces(), vec![panel, a.clone(), b]);
        for surface in [&a] {
            assert!(surface.output().is_none());
        }
        assert_eq!(device.keyboard_focus(), None);

        // Locking twice is a no-op.
        lock(&mut state);
        assert_eq!(state.shell_state().hidden_surfaces().len(), 3);
    }

    #[test]
    fn unlock_roundtrip_restores_order_and_geometry() {
        let (mut state, panel, background, a, b, _device) = locked_desktop();
        let a_geometry = a.geometry();
        let b_geometry = b.geometry();

        lock(&mut state);

        // Host asks to unlock: exactly one prepare event, even when asked
        // twice.
        unlock(&mut state);
        unlock(&mut state);
        let prepares = state
            .events
            .iter()
            .filter(|e| matches!(e, HostEvent::PrepareLock))
            .count();
        assert_eq!(prepares, 1);

        // Helper maps a lock surface, then confirms the unlock.
        let lock_surface = state.client_surface(Rectangle::new(0, 0, 1920, 1080));
        set_lock_surface(&mut state, &lock_surface);
        shell::map(&mut state, &lock_surface, 1920, 1080);
        assert_eq!(
            state.shell_state().visible_surfaces(),
            vec![lock_surface.clone(), background.clone()]
        );

        state.events.clear();
        desktop_shell_unlock(&mut state);

        let shell = state.shell_state();
        assert!(!shell.is_locked());
        assert!(shell.hidden_surfaces().is_empty());
        assert_eq!(
            shell.visible_surfaces(),
            vec![lock_surface, panel, a.clone(), b.clone(), background]
        );

        // A and B were re-configured at their prior geometry.
        for (surface, geometry) in [(&a, a_geometry), (&b, b_geometry)] {
            assert!(state.events.iter().any(|e| matches!(
                e,
                HostEvent::Configured { surface: s, rect } if s == surface && *rect == geometry
            )));
        }
        assert!(state.events.iter().any(|e| matches!(e, HostEvent::Wake)));
    }

    #[test]
    fn unlock_without_lock_just_wakes() {
        let mut state = TestState::new();
        unlock(&mut state);
        assert!(matches!(state.events.as_slice(), [HostEvent::Wake]));
    }

    #[test]
    fn unlock_force_resumes_when_helper_is_gone() {
        let (mut state, _panel, _background, _a, _b, _device) = locked_desktop();
        lock(&mut state);
        state.shell_state().child.bound = false;

        unlock(&mut state);
        let shell = state.shell_state();
        assert!(!shell.is_locked());
        assert!(shell.hidden_surfaces().is_empty());
        assert!(!state.events.iter().any(|e| matches!(e, HostEvent::PrepareLock)));
    }

    #[test]
    fn set_lock_surface_after_resume_is_ignored() {
        let (mut state, ..) = locked_desktop();
        lock(&mut state);
        unlock(&mut state);
        desktop_shell_unlock(&mut state);

        let surface = state.client_surface(Rectangle::default());
        set_lock_surface(&mut state, &surface);
        assert!(state.shell_state().lock_surface().is_none());
        // The prepare trigger re-arms for the next cycle.
        assert!(!state.shell_state().prepare_event_sent);
    }

    #[test]
    fn destroyed_lock_surface_restarts_the_cycle() {
        let (mut state, ..) = locked_desktop();
        lock(&mut state);
        unlock(&mut state);

        let lock_surface = state.client_surface(Rectangle::default());
        set_lock_surface(&mut state, &lock_surface);
        shell::surface_destroyed(&mut state, &lock_surface, 5);
        drop(lock_surface);

        state.events.clear();
        unlock(&mut state);
        assert!(state.events.iter().any(|e| matches!(e, HostEvent::PrepareLock)));
    }

    #[test]
    fn helper_unbind_while_locked_force_resumes() {
        let (mut state, ..) = locked_desktop();
        lock(&mut state);
        shell::unbind_desktop_shell(&mut state);
        assert!(!state.shell_state().is_locked());
        assert!(!state.shell_state().prepare_event_sent);
    }

    #[test]
    fn every_mapped_surface_sits_in_exactly_one_list() {
        let (mut state, ..) = locked_desktop();
        let check = |state: &mut TestState| {
            let shell = state.shell_state();
            let visible = shell.visible_surfaces();
            let hidden = shell.hidden_surfaces();
            for surface in &visible {
                assert!(!hidden.contains(surface));
            }
        };

        check(&mut state);
        lock(&mut state);
        check(&mut state);
        state.shell_state().child.bound = false;
        unlock(&mut state);
        check(&mut state);
    }

    #[test]
    fn clientless_sprites_stay_visible_while_locked() {
        let (mut state, ..) = locked_desktop();
        let sprite = Surface::new(None);
        state.shell_state().visible.insert(0, sprite.downgrade());

        lock(&mut state);
        assert!(state.shell_state().visible_surfaces().contains(&sprite));
        assert!(!state.shell_state().hidden_surfaces().contains(&sprite));
    }
}
