//! An x11rb connection as a calloop event source.
//!
//! Sending an X11 request, or waiting for a reply, can itself read events
//! from the underlying socket and stash them inside the `RustConnection`;
//! readability of the socket is therefore not enough to guarantee we see
//! every event. A dedicated thread blocking in `wait_for_event()` and
//! forwarding into a calloop channel is the only reliable integration.

use std::sync::Arc;
use std::thread::JoinHandle;

use calloop::channel::{sync_channel, Channel, ChannelError, Event as ChannelEvent, SyncSender};
use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{error, warn};
use x11rb::connection::Connection as _;
use x11rb::protocol::xproto::{
    Atom, ClientMessageEvent, ConnectionExt as _, EventMask, Window, CLIENT_MESSAGE_EVENT,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

#[derive(Debug)]
pub struct X11Source {
    connection: Arc<RustConnection>,
    channel: Option<Channel<Event>>,
    event_thread: Option<JoinHandle<()>>,
    /// Window and message type used to wake the reader thread for exit.
    close_window: Window,
    close_type: Atom,
}

impl X11Source {
    /// Spawn the reader thread for `connection`.
    ///
    /// `close_window`/`close_type` name a window created by us; dropping
    /// the source sends a `ClientMessageEvent` there so the reader thread
    /// wakes up, notices the closed channel and exits.
    pub fn new(connection: Arc<RustConnection>, close_window: Window, close_type: Atom) -> X11Source {
        let (sender, channel) = sync_channel(5);
        let conn = Arc::clone(&connection);
        let event_thread = Some(std::thread::spawn(move || {
            run_event_thread(conn, sender);
        }));

        X11Source {
            connection,
            channel: Some(channel),
            event_thread,
            close_window,
            close_type,
        }
    }
}

impl Drop for X11Source {
    fn drop(&mut self) {
        // Closing the channel alone is not enough, the reader sits in
        // wait_for_event(); poke it with a message to ourselves.
        self.channel.take();

        let event = ClientMessageEvent {
            response_type: CLIENT_MESSAGE_EVENT,
            format: 8,
            sequence: 0,
            window: self.close_window,
            type_: self.close_type,
            data: [0; 20].into(),
        };
        let _ = self
            .connection
            .send_event(false, self.close_window, EventMask::NO_EVENT, event);
        let _ = self.connection.flush();

        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
    }
}

impl EventSource for X11Source {
    type Event = Event;
    type Metadata = ();
    type Ret = ();
    type Error = ChannelError;

    fn process_events<C>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: C,
    ) -> Result<PostAction, Self::Error>
    where
        C: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        match &mut self.channel {
            Some(channel) => channel.process_events(readiness, token, |event, meta| match event {
                ChannelEvent::Closed => warn!("X11 event thread exited"),
                ChannelEvent::Msg(event) => callback(event, meta),
            }),
            None => Ok(PostAction::Remove),
        }
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.register(poll, factory)?;
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.reregister(poll, factory)?;
        }
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.unregister(poll)?;
        }
        Ok(())
    }
}

fn run_event_thread(connection: Arc<RustConnection>, sender: SyncSender<Event>) {
    loop {
        let event = match connection.wait_for_event() {
            Ok(event) => event,
            Err(err) => {
                // Connection errors are most likely permanent; stop reading.
                error!(?err, "X11 event thread exiting due to connection error");
                break;
            }
        };
        if sender.send(event).is_err() {
            // The receiving end was dropped; the WM is shutting down.
            break;
        }
    }
}
