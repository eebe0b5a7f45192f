//! X CLIPBOARD to native selection proxy.
//!
//! When something on the X side takes the CLIPBOARD selection, the WM asks
//! it for TARGETS, translates the atoms it understands into MIME types and
//! installs the result as a native selection whose source is the WM
//! itself. A native client's receive request then travels back over a
//! channel into the WM, which converts the selection into the
//! `_WL_SELECTION` property on its selection window and streams the
//! payload to the client's pipe. Large payloads arrive as INCR chunks,
//! each one requested by deleting the property after it has been fully
//! written out.

use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use calloop::channel::Sender;
use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use rustix::io::Errno;
use tracing::{debug, trace, warn};
use x11rb::connection::Connection as _;
use x11rb::errors::ReplyOrIdError;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConnectionExt as _, SelectionNotifyEvent, Window as X11Window,
};

use super::XwmHandler;
use crate::selection::selection::{self as native_selection, Selection};
use crate::selection::SelectionSourceEvents;

/// The one MIME type the bridge translates today.
pub(crate) const TEXT_MIME: &str = "text/plain;charset=utf-8";

/// A native client's request, carried from the selection source into the
/// WM's event loop.
#[derive(Debug)]
pub enum SelectionRequest {
    Receive { mime_type: String, fd: OwnedFd },
}

/// Native selection source backed by the X clipboard owner.
#[derive(Debug)]
pub(crate) struct XSelectionSource {
    sender: Sender<SelectionRequest>,
}

impl SelectionSourceEvents for XSelectionSource {
    fn send(&self, mime_type: &str, fd: OwnedFd) {
        // Ignore send errors: the WM (and its channel) died with the X
        // server, the transfer is moot.
        let _ = self.sender.send(SelectionRequest::Receive {
            mime_type: mime_type.to_owned(),
            fd,
        });
    }

    fn cancelled(&self) {}
}

/// Per-WM selection state.
#[derive(Debug)]
pub(crate) struct SelectionProxy {
    /// Our tiny window, target of ConvertSelection.
    pub(crate) window: X11Window,
    /// Whether the current conversion runs in INCR mode.
    pub(crate) incr: bool,
    /// The pipe the native client waits on, while a conversion runs.
    pub(crate) fd: Option<Rc<OwnedFd>>,
    pub(crate) transfer: Option<IncomingTransfer>,
    pub(crate) sender: Sender<SelectionRequest>,
}

impl SelectionProxy {
    pub(crate) fn new(window: X11Window, sender: Sender<SelectionRequest>) -> SelectionProxy {
        SelectionProxy {
            window,
            incr: false,
            fd: None,
            transfer: None,
            sender,
        }
    }

    fn reset(&mut self) {
        self.incr = false;
        self.fd = None;
        self.transfer = None;
    }
}

/// One property payload on its way to the target fd.
#[derive(Debug)]
pub(crate) struct IncomingTransfer {
    buffer: TransferBuffer,
    pub(crate) token: RegistrationToken,
}

/// A chunk and the write offset into it.
#[derive(Debug)]
struct TransferBuffer {
    data: Vec<u8>,
    written: usize,
}

impl TransferBuffer {
    fn new(data: Vec<u8>) -> TransferBuffer {
        TransferBuffer { data, written: 0 }
    }

    /// Push more bytes into `fd`; `Ok(true)` once everything is out.
    fn write_some(&mut self, fd: impl rustix::fd::AsFd) -> Result<bool, Errno> {
        while self.written < self.data.len() {
            let len = rustix::io::write(&fd, &self.data[self.written..])?;
            self.written += len;
            if len == 0 {
                break;
            }
        }
        Ok(self.written == self.data.len())
    }
}

/// A native client asked the X-backed selection for data.
pub(crate) fn handle_selection_request<D: XwmHandler>(data: &mut D, request: SelectionRequest) {
    let Some(wm) = data.xwm_state() else { return };
    match request {
        SelectionRequest::Receive { mime_type, fd } => {
            if mime_type != TEXT_MIME {
                debug!(mime_type = %mime_type, "Ignoring selection receive for unsupported type");
                // Dropping the fd closes it; the client sees EOF.
                return;
            }

            // Ask for the utf8 payload; the answer arrives as a
            // SELECTION_NOTIFY with the UTF8_STRING target.
            let convert = wm
                .conn
                .convert_selection(
                    wm.selection.window,
                    wm.atoms.CLIPBOARD,
                    wm.atoms.UTF8_STRING,
                    wm.atoms._WL_SELECTION,
                    x11rb::CURRENT_TIME,
                )
                .map(drop)
                .and_then(|_| wm.conn.flush());
            if let Err(err) = convert {
                warn!(?err, "ConvertSelection failed");
                return;
            }

            if let Err(err) =
                rustix::fs::fcntl_setfl(&fd, rustix::fs::OFlags::WRONLY | rustix::fs::OFlags::NONBLOCK)
            {
                warn!(?err, "Could not make the selection target fd non-blocking");
                return;
            }
            wm.selection.fd = Some(Rc::new(fd));
        }
    }
}

/// A conversion we requested completed (or failed).
pub(crate) fn handle_selection_notify<D: XwmHandler>(
    data: &mut D,
    handle: &LoopHandle<'static, D>,
    event: SelectionNotifyEvent,
) -> Result<(), ReplyOrIdError> {
    let targets = {
        let Some(wm) = data.xwm_state() else { return Ok(()) };
        wm.atoms.TARGETS
    };

    if event.property == x11rb::NONE {
        debug!("Selection conversion failed");
        if let Some(wm) = data.xwm_state() {
            wm.selection.reset();
        }
    } else if event.target == targets {
        get_selection_targets(data)?;
    } else {
        get_selection_data(data, handle)?;
    }
    Ok(())
}

/// Read the TARGETS reply and rebuild the native selection from it.
fn get_selection_targets<D: XwmHandler>(data: &mut D) -> Result<(), ReplyOrIdError> {
    let (mime_types, sender) = {
        let Some(wm) = data.xwm_state() else { return Ok(()) };
        let reply = wm
            .conn
            .get_property(
                true,
                wm.selection.window,
                wm.atoms._WL_SELECTION,
                AtomEnum::ANY,
                0,
                4096,
            )?
            .reply()?;
        if reply.type_ != Atom::from(AtomEnum::ATOM) {
            debug!(type_ = reply.type_, "TARGETS reply is not an atom list");
            return Ok(());
        }

        let mut mime_types = Vec::new();
        if let Some(values) = reply.value32() {
            for atom in values {
                if atom == wm.atoms.UTF8_STRING {
                    mime_types.push(TEXT_MIME.to_owned());
                }
            }
        }
        (mime_types, wm.selection.sender.clone())
    };

    let Some(device) = data.default_device() else {
        debug!("No input device to install the X selection on");
        return Ok(());
    };
    let offer_sink = data.selection_offer_sink();

    let selection = Selection::new(Rc::new(XSelectionSource { sender }), offer_sink);
    for mime_type in &mime_types {
        selection.offer(mime_type);
    }
    debug!(?mime_types, "Installing the X clipboard as the native selection");
    native_selection::activate(&selection, &device, 0);
    Ok(())
}

/// Read the converted payload and start streaming it, or switch to INCR
/// mode when the owner says so.
fn get_selection_data<D: XwmHandler>(
    data: &mut D,
    handle: &LoopHandle<'static, D>,
) -> Result<(), ReplyOrIdError> {
    let payload = {
        let Some(wm) = data.xwm_state() else { return Ok(()) };
        if wm.selection.fd.is_none() {
            debug!("Selection data arrived without a pending receive");
            return Ok(());
        }
        // Deleting the property while reading it signals the INCR owner
        // to start sending chunks.
        let reply = wm
            .conn
            .get_property(
                true,
                wm.selection.window,
                wm.atoms._WL_SELECTION,
                AtomEnum::ANY,
                0,
                0x1fffffff,
            )?
            .reply()?;
        if reply.type_ == wm.atoms.INCR {
            debug!("Selection transfer turns incremental");
            wm.selection.incr = true;
            None
        } else {
            wm.selection.incr = false;
            Some(reply.value)
        }
    };

    if let Some(bytes) = payload {
        start_transfer(data, handle, bytes);
    }
    Ok(())
}

/// One INCR chunk landed in `_WL_SELECTION`; a zero-length chunk ends the
/// transfer.
pub(crate) fn get_incr_chunk<D: XwmHandler>(
    data: &mut D,
    handle: &LoopHandle<'static, D>,
) -> Result<(), ReplyOrIdError> {
    let chunk = {
        let Some(wm) = data.xwm_state() else { return Ok(()) };
        let reply = wm
            .conn
            .get_property(
                false,
                wm.selection.window,
                wm.atoms._WL_SELECTION,
                AtomEnum::ANY,
                0,
                0x1fffffff,
            )?
            .reply()?;
        if reply.value.is_empty() {
            debug!("Incr selection transfer complete");
            wm.selection.reset();
            None
        } else {
            trace!(len = reply.value.len(), "Read incr chunk");
            Some(reply.value)
        }
    };

    if let Some(bytes) = chunk {
        start_transfer(data, handle, bytes);
    }
    Ok(())
}

/// Stream `bytes` to the pending target fd, paced by writability.
fn start_transfer<D: XwmHandler>(data: &mut D, handle: &LoopHandle<'static, D>, bytes: Vec<u8>) {
    let fd = {
        let Some(wm) = data.xwm_state() else { return };
        if wm.selection.transfer.is_some() {
            warn!("Dropping selection chunk, a transfer is still in flight");
            return;
        }
        match wm.selection.fd.clone() {
            Some(fd) => fd,
            None => {
                warn!("Selection chunk without a target fd");
                return;
            }
        }
    };

    let source = Generic::new(fd, Interest::WRITE, Mode::Level);
    let token = handle.insert_source(source, |_, fd, data| Ok(write_chunk(data, &**fd)));
    match token {
        Ok(token) => {
            if let Some(wm) = data.xwm_state() {
                wm.selection.transfer = Some(IncomingTransfer {
                    buffer: TransferBuffer::new(bytes),
                    token,
                });
            } else {
                handle.remove(token);
            }
        }
        Err(err) => {
            warn!(?err, "Failed to register the selection writer");
            if let Some(wm) = data.xwm_state() {
                wm.selection.reset();
            }
        }
    }
}

fn write_chunk<D: XwmHandler>(data: &mut D, fd: &OwnedFd) -> PostAction {
    let Some(wm) = data.xwm_state() else { return PostAction::Remove };
    let Some(transfer) = wm.selection.transfer.as_mut() else { return PostAction::Remove };

    let outcome = transfer.buffer.write_some(fd);
    match outcome {
        Ok(true) => {
            trace!(len = transfer.buffer.data.len(), "Wrote selection chunk");
            wm.selection.transfer = None;
            if wm.selection.incr {
                // Delete the chunk property only now that it is fully
                // written: this is what paces the owner.
                let deleted = wm
                    .conn
                    .delete_property(wm.selection.window, wm.atoms._WL_SELECTION)
                    .map(drop)
                    .and_then(|_| wm.conn.flush());
                if let Err(err) = deleted {
                    warn!(?err, "Failed to request the next incr chunk");
                    wm.selection.reset();
                }
            } else {
                debug!("Selection transfer complete");
                wm.selection.fd = None;
            }
            PostAction::Remove
        }
        Ok(false) | Err(Errno::AGAIN) => PostAction::Continue,
        Err(err) => {
            warn!(?err, "Write error to the selection target fd");
            wm.selection.reset();
            PostAction::Remove
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn chunk_concatenation_reaches_the_fd_intact() {
        // Emulate an INCR transfer: several property payloads streamed
        // through transfer buffers must concatenate on the reading side.
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::fs::fcntl_setfl(&write_end, rustix::fs::OFlags::NONBLOCK).unwrap();

        let chunks: Vec<Vec<u8>> = vec![
            b"hello ".to_vec(),
            b"incremental ".to_vec(),
            b"world".to_vec(),
        ];

        let mut received = Vec::new();
        let mut drain = |received: &mut Vec<u8>| {
            let mut file = std::fs::File::from(read_end.try_clone().unwrap());
            let mut buf = vec![0u8; 65536];
            let len = file.read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..len]);
        };

        for chunk in &chunks {
            let mut buffer = TransferBuffer::new(chunk.clone());
            loop {
                match buffer.write_some(&write_end) {
                    Ok(true) => break,
                    Ok(false) => drain(&mut received),
                    Err(Errno::AGAIN) => drain(&mut received),
                    Err(err) => panic!("write failed: {err}"),
                }
            }
        }
        drop(write_end);
        let mut file = std::fs::File::from(read_end);
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        received.extend_from_slice(&rest);

        assert_eq!(received, chunks.concat());
    }

    #[test]
    fn large_buffer_makes_partial_progress_without_losing_bytes() {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        rustix::fs::fcntl_setfl(&write_end, rustix::fs::OFlags::NONBLOCK).unwrap();

        // Larger than any pipe buffer, so the first pass must stop short.
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let mut buffer = TransferBuffer::new(payload.clone());

        assert!(matches!(buffer.write_some(&write_end), Err(Errno::AGAIN)));
        assert!(buffer.written > 0);

        let mut received = Vec::new();
        loop {
            {
                let mut file = std::fs::File::from(read_end.try_clone().unwrap());
                let mut buf = vec![0u8; 65536];
                let len = file.read(&mut buf).unwrap();
                received.extend_from_slice(&buf[..len]);
            }
            match buffer.write_some(&write_end) {
                Ok(true) => break,
                Ok(false) | Err(Errno::AGAIN) => {}
                Err(err) => panic!("write failed: {err}"),
            }
        }
        drop(write_end);
        let mut file = std::fs::File::from(read_end);
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        received.extend_from_slice(&rest);

        assert_eq!(received, payload);
    }
}
