//! Shoreline is a library for building the desktop-shell side of a wayland
//! compositor.
//!
//! The compositor host owns surfaces, outputs and input devices and runs a
//! single-threaded [`calloop`] event loop; shoreline supplies the policy:
//!
//! - [`shell`] decides stacking, placement, focus, interactive move/resize
//!   and the session lock, and supervises the desktop-shell helper client;
//! - [`selection`] routes drag-and-drop offers and keyboard selections
//!   between clients;
//! - [`xwayland`] lets legacy X11 clients appear as native surfaces by
//!   launching a rootless X server, acting as its window manager and
//!   proxying the X clipboard.
//!
//! The host plugs in by implementing [`shell::ShellHandler`] (and
//! [`xwayland::XwmHandler`] when the X bridge is used) and forwarding
//! protocol requests to the free functions of the matching module. Events
//! going the other way, towards client resources, are modeled as small
//! sink traits in [`selection`] and [`xwayland`], to be implemented by the
//! host's wire runtime.

#![warn(missing_debug_implementations)]

pub mod output;
pub mod process;
pub mod seat;
pub mod selection;
pub mod shell;
pub mod surface;
pub mod utils;
pub mod xwayland;

#[cfg(test)]
pub(crate) mod test_support;
