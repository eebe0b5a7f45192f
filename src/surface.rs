//! Surface handles.
//!
//! Surfaces are created and owned by the compositor; the shell only
//! annotates them with policy state (stacking, map type, saved geometry)
//! and keeps weak references. A destroyed surface is signalled through
//! [`surface_destroyed`](crate::shell::surface_destroyed), after which
//! every weak handle held by the shell goes dead.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::output::Output;
use crate::utils::geometry::{Point, Rectangle, Size};

/// Identity of the client owning a resource.
///
/// Assigned by the host's wire runtime; the shell only ever compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// How a surface asked to be mapped.
///
/// Surfaces start out `Unmapped` and only take one of the other states
/// through an explicit shell request; role surfaces (panel, background,
/// lock surface) never leave `Unmapped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapType {
    #[default]
    Unmapped,
    Toplevel,
    Transient,
    Fullscreen,
}

#[derive(Debug)]
pub(crate) struct SurfaceInner {
    pub(crate) client: Option<ClientId>,
    pub(crate) geometry: Rectangle,
    /// Pre-fullscreen location; meaningful only while `map_type` is
    /// `Fullscreen`.
    pub(crate) saved_loc: Point,
    pub(crate) map_type: MapType,
    pub(crate) output: Option<Output>,
    pub(crate) fullscreen_output: Option<Output>,
    /// X11 window backing this surface, if the X bridge bound one.
    pub(crate) x_window: Option<u32>,
    /// Whether some request already assigned a position, suppressing the
    /// random placement on map.
    pub(crate) positioned: bool,
}

/// Handle to a surface known to the shell.
#[derive(Clone)]
pub struct Surface {
    inner: Rc<RefCell<SurfaceInner>>,
}

impl Surface {
    /// Create a surface record for a client surface.
    ///
    /// Surfaces without a client (input sprites and the like) pass `None`
    /// and are ignored by the lock machinery.
    pub fn new(client: Option<ClientId>) -> Surface {
        Surface {
            inner: Rc::new(RefCell::new(SurfaceInner {
                client,
                geometry: Rectangle::default(),
                saved_loc: Point::default(),
                map_type: MapType::default(),
                output: None,
                fullscreen_output: None,
                x_window: None,
                positioned: false,
            })),
        }
    }

    pub fn client(&self) -> Option<ClientId> {
        self.inner.borrow().client
    }

    pub fn geometry(&self) -> Rectangle {
        self.inner.borrow().geometry
    }

    pub fn location(&self) -> Point {
        self.inner.borrow().geometry.loc
    }

    pub fn size(&self) -> Size {
        self.inner.borrow().geometry.size
    }

    pub fn map_type(&self) -> MapType {
        self.inner.borrow().map_type
    }

    pub fn output(&self) -> Option<Output> {
        self.inner.borrow().output.clone()
    }

    /// The X11 window bound to this surface by the X bridge, if any.
    pub fn x_window(&self) -> Option<u32> {
        self.inner.borrow().x_window
    }

    /// Whether both surfaces belong to the same client.
    ///
    /// Surfaces without a client never compare equal to anything.
    pub fn same_client_as(&self, other: &Surface) -> bool {
        match (self.client(), other.client()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn downgrade(&self) -> WeakSurface {
        WeakSurface {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn state(&self) -> Ref<'_, SurfaceInner> {
        self.inner.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, SurfaceInner> {
        self.inner.borrow_mut()
    }
}

impl PartialEq for Surface {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Surface {}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Surface")
            .field("client", &inner.client)
            .field("geometry", &inner.geometry)
            .field("map_type", &inner.map_type)
            .finish_non_exhaustive()
    }
}

/// Non-owning surface reference; upgrade fails once the compositor dropped
/// the surface.
#[derive(Debug, Clone, Default)]
pub struct WeakSurface {
    inner: Weak<RefCell<SurfaceInner>>,
}

impl WeakSurface {
    pub fn upgrade(&self) -> Option<Surface> {
        self.inner.upgrade().map(|inner| Surface { inner })
    }

    pub(crate) fn is(&self, surface: &Surface) -> bool {
        self.upgrade().map_or(false, |s| s == *surface)
    }
}
