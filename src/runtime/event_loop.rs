//! The connection multiplexer.
//!
//! One poll instance owns every listening socket and every client
//! session. Each iteration waits up to a second for readiness events,
//! drains accepts, advances the affected sessions, and sweeps idle
//! deadlines. The loop exits at the top of the iteration after the
//! shutdown flag flips; open sessions are deregistered and dropped,
//! which closes their descriptors.

use crate::net::{bind_listener, Endpoint};
use crate::runtime::session::Session;
use crate::vhost::ServerMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Listener tokens live above this base; session tokens are slab keys.
const LISTENER_BASE: usize = usize::MAX - 4096;
/// Upper bound on concurrent sessions.
const MAX_SESSIONS: usize = 10_000;
/// Poll timeout, which also paces the deadline sweep.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct EventLoop {
    poll: Poll,
    map: ServerMap,
    listeners: Vec<(Endpoint, TcpListener)>,
    sessions: Slab<Session>,
}

impl EventLoop {
    /// Bind every configured endpoint and register the listeners.
    ///
    /// Individual bind failures are logged and skipped; it is only
    /// fatal when no endpoint at all could be bound.
    pub fn new(map: ServerMap) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listeners = Vec::new();

        for endpoint in map.endpoints() {
            match bind_listener(endpoint) {
                Ok(mut listener) => {
                    let token = Token(LISTENER_BASE + listeners.len());
                    poll.registry()
                        .register(&mut listener, token, Interest::READABLE)?;
                    info!(addr = %endpoint, "listening");
                    listeners.push((endpoint, listener));
                }
                Err(err) => {
                    error!(addr = %endpoint, error = %err, "bind failed, skipping endpoint");
                }
            }
        }

        if listeners.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no endpoint could be bound",
            ));
        }

        Ok(Self {
            poll,
            map,
            listeners,
            sessions: Slab::with_capacity(1024),
        })
    }

    /// Run until `running` is cleared by the signal handler.
    pub fn run(&mut self, running: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        while running.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                // A signal landing mid-wait counts as zero events.
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            for event in events.iter() {
                let token = event.token().0;
                if token >= LISTENER_BASE {
                    self.accept_all(token - LISTENER_BASE);
                } else {
                    self.advance_session(token, event.is_readable(), event.is_writable());
                }
            }

            self.sweep_deadlines(Instant::now());
        }

        info!(open_sessions = self.sessions.len(), "shutting down");
        let registry = self.poll.registry();
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            let _ = registry.deregister(session.stream_mut());
        }
        Ok(())
    }

    /// Accept until the listen queue is drained.
    fn accept_all(&mut self, idx: usize) {
        let endpoint = self.listeners[idx].0;
        loop {
            match self.listeners[idx].1.accept() {
                Ok((stream, peer)) => {
                    if self.sessions.len() >= MAX_SESSIONS {
                        warn!(peer = %peer, "session limit reached, dropping connection");
                        continue;
                    }
                    let entry = self.sessions.vacant_entry();
                    let token = Token(entry.key());
                    let mut session = Session::new(stream, peer, endpoint);
                    match self
                        .poll
                        .registry()
                        .register(session.stream_mut(), token, Interest::READABLE)
                    {
                        Ok(()) => {
                            debug!(peer = %peer, addr = %endpoint, id = token.0, "accepted");
                            entry.insert(session);
                        }
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "register failed, dropping");
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(addr = %endpoint, error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Advance one session for a readiness event, then bring its poll
    /// registration in line with its new state.
    fn advance_session(&mut self, key: usize, readable: bool, writable: bool) {
        // Events may arrive for sessions swept in this same iteration.
        if !self.sessions.contains(key) {
            return;
        }

        if readable {
            self.sessions[key].on_readable(&self.map);
        }
        if writable && self.sessions.contains(key) {
            self.sessions[key].on_writable(&self.map);
        }

        let session = &mut self.sessions[key];
        match session.desired_interest() {
            None => self.close_session(key),
            Some(interest) => {
                if interest != session.registered_interest {
                    let result = self
                        .poll
                        .registry()
                        .reregister(session.stream_mut(), Token(key), interest);
                    match result {
                        Ok(()) => session.registered_interest = interest,
                        Err(err) => {
                            // An indeterminate registration is not
                            // recoverable; drop the session.
                            warn!(id = key, error = %err, "reregister failed");
                            self.close_session(key);
                        }
                    }
                }
            }
        }
    }

    /// Close sessions whose idle deadline has passed.
    fn sweep_deadlines(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .sessions
            .iter_mut()
            .filter_map(|(key, session)| session.expire(&self.map, now).then_some(key))
            .collect();
        for key in expired {
            self.close_session(key);
        }
    }

    fn close_session(&mut self, key: usize) {
        if let Some(mut session) = self.sessions.try_remove(key) {
            let _ = self.poll.registry().deregister(session.stream_mut());
            debug!(peer = %session.peer(), id = key, "session closed");
        }
    }
}
