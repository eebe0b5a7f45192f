//! Output handles.
//!
//! Outputs are enumerated by the compositor backend; the shell only needs
//! their current mode, to center fullscreen surfaces and to answer the
//! desktop-shell helper's configure events.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::utils::geometry::Size;

/// A display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub size: Size,
}

#[derive(Debug)]
struct OutputInner {
    current_mode: Mode,
}

/// Handle to a physical output.
#[derive(Clone)]
pub struct Output {
    inner: Rc<RefCell<OutputInner>>,
}

impl Output {
    pub fn new(current_mode: Mode) -> Output {
        Output {
            inner: Rc::new(RefCell::new(OutputInner { current_mode })),
        }
    }

    pub fn current_mode(&self) -> Mode {
        self.inner.borrow().current_mode
    }

    /// Record a mode switch performed by the backend.
    pub fn set_current_mode(&self, mode: Mode) {
        self.inner.borrow_mut().current_mode = mode;
    }
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Output {}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("current_mode", &self.inner.borrow().current_mode)
            .finish()
    }
}
