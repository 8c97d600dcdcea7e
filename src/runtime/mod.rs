//! Single-threaded cooperative runtime.
//!
//! Everything happens on one thread: a poll instance multiplexes the
//! listening sockets and every client session, and the only blocking
//! call anywhere is the poll wait itself. Sessions suspend by leaving
//! their remaining work in their rings until the next readiness event.

pub mod event_loop;
pub mod ring;
pub mod session;

use crate::vhost::ServerMap;
use std::io;
use std::sync::atomic::AtomicBool;

/// Bind the configured endpoints and run the event loop until the
/// shutdown flag clears.
pub fn run(map: ServerMap, running: &AtomicBool) -> io::Result<()> {
    let mut event_loop = event_loop::EventLoop::new(map)?;
    event_loop.run(running)
}
