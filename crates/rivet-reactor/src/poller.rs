//! Poller: wrapper around the OS readiness primitive.
//!
//! Keeps the fd-to-channel map and reconciles each channel's interest with
//! the kernel. Registration is tri-state (see [`PollState`]): a channel with
//! zero interest is deregistered but kept in the map as `Deleted`, so the
//! loop can re-arm it without a fresh insertion.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{error, trace};

use crate::channel::{ChannelRef, PollState, Readiness, EVENT_READ, EVENT_WRITE};

/// Token reserved for the loop's cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const INITIAL_EVENT_CAPACITY: usize = 64;

fn interest_of(events: u8) -> Option<Interest> {
    match (events & EVENT_READ != 0, events & EVENT_WRITE != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            priority: event.is_priority(),
        }
    }
}

/// Readiness poller plus the fd-to-channel map for one loop.
pub struct Poller {
    poll: Poll,
    events: Events,
    event_capacity: usize,
    channels: HashMap<RawFd, ChannelRef>,
}

impl Poller {
    /// Creates the OS readiness primitive.
    pub fn new() -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
            event_capacity: INITIAL_EVENT_CAPACITY,
            channels: HashMap::new(),
        })
    }

    /// Registry used to attach the loop's waker.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Blocks up to `timeout` and collects the channels with ready events,
    /// stamping each one's returned readiness before pushing it.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<ChannelRef>) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            if event.token() == WAKER_TOKEN {
                trace!("woken up");
                continue;
            }
            let fd = event.token().0 as RawFd;
            if let Some(ch) = self.channels.get(&fd) {
                ch.borrow_mut().set_revents(Readiness::from_event(event));
                active.push(Rc::clone(ch));
            } else {
                trace!("spurious event for fd={}", fd);
            }
        }
        // The event vector doubles whenever one poll fills it.
        if count == self.event_capacity {
            self.event_capacity *= 2;
            self.events = Events::with_capacity(self.event_capacity);
        }
        Ok(())
    }

    /// Reconciles a channel's interest with the kernel.
    pub fn update_channel(&mut self, ch: &ChannelRef) {
        let (fd, events, state) = {
            let c = ch.borrow();
            (c.fd(), c.events(), c.state())
        };
        trace!("poller update fd={} events={:#04b} state={:?}", fd, events, state);
        match state {
            PollState::New | PollState::Deleted => {
                if state == PollState::New {
                    debug_assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, Rc::clone(ch));
                } else {
                    debug_assert!(self.channels.contains_key(&fd));
                }
                if let Some(interest) = interest_of(events) {
                    if let Err(e) = self.poll.registry().register(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        interest,
                    ) {
                        error!("register fd={} failed: {}", fd, e);
                        return;
                    }
                    ch.borrow_mut().set_state(PollState::Added);
                }
            }
            PollState::Added => match interest_of(events) {
                Some(interest) => {
                    if let Err(e) = self.poll.registry().reregister(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        interest,
                    ) {
                        error!("reregister fd={} failed: {}", fd, e);
                    }
                }
                None => {
                    if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        error!("deregister fd={} failed: {}", fd, e);
                    }
                    ch.borrow_mut().set_state(PollState::Deleted);
                }
            },
        }
    }

    /// Drops a channel from the map, deregistering it first if still armed.
    ///
    /// The channel must have zero interest at this point.
    pub fn remove_channel(&mut self, ch: &ChannelRef) {
        let (fd, state) = {
            let c = ch.borrow();
            assert!(c.is_none_event(), "channel removed while still armed");
            (c.fd(), c.state())
        };
        debug_assert!(self.channels.contains_key(&fd));
        self.channels.remove(&fd);
        if state == PollState::Added {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                error!("deregister fd={} failed: {}", fd, e);
            }
        }
        ch.borrow_mut().set_state(PollState::New);
    }

    /// True when the map holds a channel for `fd`.
    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Fetches the channel registered for `fd`.
    pub fn channel(&self, fd: RawFd) -> Option<ChannelRef> {
        self.channels.get(&fd).map(Rc::clone)
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("channels", &self.channels.len())
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}
