//! Channel: the tie between one file descriptor and its event loop.
//!
//! A channel records which events its descriptor is interested in, which
//! events the last poll returned, and the callbacks to run for each class of
//! readiness. Exactly one channel exists per descriptor in a given loop; it
//! lives in the loop's fd map and never leaves the loop thread.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::trace;

use crate::event_loop::EventLoop;

/// No interest.
pub const EVENT_NONE: u8 = 0;
/// Read interest (includes priority and peer half-close).
pub const EVENT_READ: u8 = 0b01;
/// Write interest.
pub const EVENT_WRITE: u8 = 0b10;

/// Readiness reported by one poll for one channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct Readiness {
    /// Data (or an incoming connection) can be read.
    pub readable: bool,
    /// The socket accepts writes.
    pub writable: bool,
    /// The descriptor is in an error state.
    pub error: bool,
    /// The peer closed its write half (or the descriptor hung up).
    pub read_closed: bool,
    /// Out-of-band data is pending.
    pub priority: bool,
}

/// Registration state of a channel relative to the poller.
///
/// A channel with zero interest is deregistered from the OS but kept in the
/// fd map as `Deleted` so it can be re-armed without a fresh insertion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PollState {
    /// Never handed to the poller.
    #[default]
    New,
    /// Registered with the OS primitive.
    Added,
    /// In the fd map but deregistered from the OS primitive.
    Deleted,
}

/// Callback attached to one readiness class. Runs on the loop thread only.
pub type EventCallback = Box<dyn FnMut()>;

/// Shared handle to a channel on its loop thread.
pub type ChannelRef = Rc<RefCell<Channel>>;

/// Per-descriptor interest and dispatch record.
pub struct Channel {
    fd: RawFd,
    events: u8,
    revents: Readiness,
    state: PollState,
    handling: bool,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    /// Creates an unregistered channel for `fd`.
    pub fn new(fd: RawFd) -> ChannelRef {
        Rc::new(RefCell::new(Channel {
            fd,
            events: EVENT_NONE,
            revents: Readiness::default(),
            state: PollState::New,
            handling: false,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }))
    }

    /// The descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Currently interested events.
    pub fn events(&self) -> u8 {
        self.events
    }

    /// Readiness stamped by the last poll.
    pub fn revents(&self) -> Readiness {
        self.revents
    }

    pub(crate) fn set_revents(&mut self, r: Readiness) {
        self.revents = r;
    }

    /// Registration state relative to the poller.
    pub fn state(&self) -> PollState {
        self.state
    }

    pub(crate) fn set_state(&mut self, s: PollState) {
        self.state = s;
    }

    /// True when read interest is armed.
    pub fn is_reading(&self) -> bool {
        self.events & EVENT_READ != 0
    }

    /// True when write interest is armed.
    pub fn is_writing(&self) -> bool {
        self.events & EVENT_WRITE != 0
    }

    /// True when no interest is armed.
    pub fn is_none_event(&self) -> bool {
        self.events == EVENT_NONE
    }

    /// Installs the read callback.
    pub fn set_read_callback(&mut self, cb: EventCallback) {
        self.read_cb = Some(cb);
    }

    /// Installs the write callback.
    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    /// Installs the close callback.
    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }

    /// Installs the error callback.
    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    /// Arms read interest and reconciles with the poller.
    pub fn enable_reading(ch: &ChannelRef, lp: &EventLoop) {
        ch.borrow_mut().events |= EVENT_READ;
        lp.update_channel(ch);
    }

    /// Disarms read interest and reconciles with the poller.
    pub fn disable_reading(ch: &ChannelRef, lp: &EventLoop) {
        ch.borrow_mut().events &= !EVENT_READ;
        lp.update_channel(ch);
    }

    /// Arms write interest and reconciles with the poller.
    pub fn enable_writing(ch: &ChannelRef, lp: &EventLoop) {
        ch.borrow_mut().events |= EVENT_WRITE;
        lp.update_channel(ch);
    }

    /// Disarms write interest and reconciles with the poller.
    pub fn disable_writing(ch: &ChannelRef, lp: &EventLoop) {
        ch.borrow_mut().events &= !EVENT_WRITE;
        lp.update_channel(ch);
    }

    /// Disarms all interest and reconciles with the poller.
    pub fn disable_all(ch: &ChannelRef, lp: &EventLoop) {
        ch.borrow_mut().events = EVENT_NONE;
        lp.update_channel(ch);
    }

    /// Dispatches the readiness stamped by the last poll.
    ///
    /// Order: close (hang-up without pending input), read, write, error.
    /// Every slot is optional. Callbacks may mutate interest or remove the
    /// channel; the slot is taken out for the duration of the call so the
    /// channel stays borrowable from inside it.
    pub fn handle_event(ch: &ChannelRef) {
        let r = {
            let mut c = ch.borrow_mut();
            c.handling = true;
            c.revents
        };
        trace!("channel fd={} dispatch {:?}", ch.borrow().fd, r);
        if r.read_closed && !r.readable {
            Self::run_slot(ch, Self::close_slot);
        }
        if r.readable || r.priority || r.read_closed {
            Self::run_slot(ch, Self::read_slot);
        }
        if r.writable {
            Self::run_slot(ch, Self::write_slot);
        }
        if r.error {
            Self::run_slot(ch, Self::error_slot);
        }
        ch.borrow_mut().handling = false;
    }

    fn read_slot(c: &mut Channel) -> &mut Option<EventCallback> {
        &mut c.read_cb
    }

    fn write_slot(c: &mut Channel) -> &mut Option<EventCallback> {
        &mut c.write_cb
    }

    fn close_slot(c: &mut Channel) -> &mut Option<EventCallback> {
        &mut c.close_cb
    }

    fn error_slot(c: &mut Channel) -> &mut Option<EventCallback> {
        &mut c.error_cb
    }

    fn run_slot(ch: &ChannelRef, slot: fn(&mut Channel) -> &mut Option<EventCallback>) {
        let taken = slot(&mut ch.borrow_mut()).take();
        if let Some(mut cb) = taken {
            cb();
            // Put the callback back unless the handler installed a new one.
            let mut c = ch.borrow_mut();
            let s = slot(&mut c);
            if s.is_none() {
                *s = Some(cb);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.handling, "channel dropped while dispatching");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events)
            .field("state", &self.state)
            .field("handling", &self.handling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_bits() {
        let ch = Channel::new(1);
        {
            let mut c = ch.borrow_mut();
            assert!(c.is_none_event());
            c.events |= EVENT_READ;
            assert!(c.is_reading());
            assert!(!c.is_writing());
            c.events |= EVENT_WRITE;
            assert!(c.is_writing());
            c.events &= !EVENT_READ;
            assert!(!c.is_reading());
        }
    }

    #[test]
    fn test_dispatch_order_and_optional_slots() {
        let ch = Channel::new(2);
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let mut c = ch.borrow_mut();
            let o = Rc::clone(&order);
            c.set_read_callback(Box::new(move || o.borrow_mut().push("read")));
            let o = Rc::clone(&order);
            c.set_write_callback(Box::new(move || o.borrow_mut().push("write")));
            let o = Rc::clone(&order);
            c.set_error_callback(Box::new(move || o.borrow_mut().push("error")));
            // No close callback installed: the slot is optional.
            c.set_revents(Readiness {
                readable: true,
                writable: true,
                error: true,
                read_closed: true,
                priority: false,
            });
        }
        Channel::handle_event(&ch);
        assert_eq!(*order.borrow(), vec!["read", "write", "error"]);
        assert!(!ch.borrow().handling);
    }

    #[test]
    fn test_close_dispatch_on_hangup_without_input() {
        let ch = Channel::new(3);
        let closed = Rc::new(RefCell::new(false));
        {
            let mut c = ch.borrow_mut();
            let flag = Rc::clone(&closed);
            c.set_close_callback(Box::new(move || *flag.borrow_mut() = true));
            c.set_revents(Readiness { read_closed: true, ..Default::default() });
        }
        Channel::handle_event(&ch);
        assert!(*closed.borrow());
    }

    #[test]
    fn test_callback_may_touch_its_own_channel() {
        let ch = Channel::new(4);
        {
            let mut c = ch.borrow_mut();
            let me = Rc::downgrade(&ch);
            c.set_read_callback(Box::new(move || {
                // Re-borrowing the channel from inside its own dispatch must
                // not panic.
                if let Some(ch) = me.upgrade() {
                    ch.borrow_mut().events |= EVENT_WRITE;
                }
            }));
            c.set_revents(Readiness { readable: true, ..Default::default() });
        }
        Channel::handle_event(&ch);
        assert!(ch.borrow().is_writing());
    }
}
