//! Session discovery — broadcasts enumeration requests and walks the
//! session directory as replies arrive.
//!
//! Replies are not handled here. The node's receive loop decodes them and
//! inserts them into the shared [`SessionDirectory`]; the broadcaster only
//! sends requests, waits, prunes, and visits.
//!
//! The visitor is always called with the directory lock released, so it may
//! call back into the directory or the broadcaster's owner.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use playnet_core::wire::{self, CommandId, DiscoveryQuery, VERSION};

use crate::directory::{Clock, SessionCacheEntry, SessionDirectory, DEFAULT_MAX_AGE};
use crate::error::{PlayError, PlayResult};
use crate::transport::Transport;

/// What the visitor is shown.
#[derive(Debug, Clone, Copy)]
pub enum EnumEvent<'a> {
    /// A cached session matching the query.
    Session(&'a SessionCacheEntry),
    /// End of one enumeration cycle.
    TimedOut,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drives enumeration for one session directory. At most one asynchronous
/// loop runs at a time.
pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    directory: Arc<SessionDirectory>,
    clock: Clock,
    max_age: u32,
    running: Mutex<Option<Running>>,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn Transport>, directory: Arc<SessionDirectory>, clock: Clock) -> Self {
        Self {
            transport,
            directory,
            clock,
            max_age: DEFAULT_MAX_AGE,
            running: Mutex::new(None),
        }
    }

    /// Override how many ticks a cached session survives without a refresh.
    pub fn with_max_age(mut self, max_age: u32) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Send one request, wait `timeout`, then visit every matching session.
    pub async fn broadcast_and_wait<F>(
        &self,
        query: &DiscoveryQuery,
        timeout: Duration,
        mut visitor: F,
    ) -> PlayResult<()>
    where
        F: FnMut(EnumEvent<'_>) -> ControlFlow<()>,
    {
        let cycle = Cycle {
            transport: Arc::clone(&self.transport),
            directory: Arc::clone(&self.directory),
            clock: self.clock,
            max_age: self.max_age,
            query: query.clone(),
        };
        cycle.send_request()?;
        tokio::time::sleep(timeout).await;
        cycle.prune();
        cycle.visit_sessions(&mut visitor);
        Ok(())
    }

    /// Run enumeration cycles in the background until the visitor breaks on
    /// [`EnumEvent::TimedOut`] or [`stop_async`](Self::stop_async) is called.
    pub fn start_async<F>(&self, query: DiscoveryQuery, timeout: Duration, visitor: F) -> PlayResult<()>
    where
        F: FnMut(EnumEvent<'_>) -> ControlFlow<()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(PlayError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let cycle = Cycle {
            transport: Arc::clone(&self.transport),
            directory: Arc::clone(&self.directory),
            clock: self.clock,
            max_age: self.max_age,
            query,
        };
        let handle = tokio::spawn(enumeration_loop(cycle, timeout, stop_rx, visitor));

        tracing::info!(timeout_ms = timeout.as_millis() as u64, "async enumeration started");
        *running = Some(Running {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the background loop. Returns once the loop has exited; no
    /// visitor call happens after this resolves.
    pub async fn stop_async(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.handle.await {
            tracing::warn!(error = %e, "enumeration task ended abnormally");
        }
        tracing::info!("async enumeration stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

/// Dropping a running broadcaster signals its loop but cannot wait for it:
/// a visitor call already under way still completes. Use
/// [`Broadcaster::stop_async`] when the caller must know the loop is gone.
impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.stop.send(true);
            if !running.handle.is_finished() {
                tracing::debug!("broadcaster dropped while enumerating; loop exits at its next wakeup");
            }
        }
    }
}

// ── Enumeration cycle ────────────────────────────────────────────────────────

struct Cycle {
    transport: Arc<dyn Transport>,
    directory: Arc<SessionDirectory>,
    clock: Clock,
    max_age: u32,
    query: DiscoveryQuery,
}

impl Cycle {
    fn send_request(&self) -> PlayResult<()> {
        let datagram = wire::encode(CommandId::EnumSessionsRequest, VERSION, &self.query.encode());
        self.transport.broadcast(&datagram)?;
        tracing::trace!(application = %self.query.application_id, "enumeration request sent");
        Ok(())
    }

    fn prune(&self) {
        self.directory.prune(self.clock.now(), self.max_age);
    }

    /// Visit matching sessions from a snapshot. A `Break` ends this pass.
    fn visit_sessions<F>(&self, visitor: &mut F)
    where
        F: FnMut(EnumEvent<'_>) -> ControlFlow<()>,
    {
        let snapshot = self.directory.enumerate();
        for entry in snapshot.iter().filter(|e| {
            e.descriptor
                .application_id
                .matches_application(&self.query.application_id)
        }) {
            if visitor(EnumEvent::Session(entry)).is_break() {
                break;
            }
        }
    }
}

async fn enumeration_loop<F>(
    cycle: Cycle,
    timeout: Duration,
    mut stop: watch::Receiver<bool>,
    mut visitor: F,
) where
    F: FnMut(EnumEvent<'_>) -> ControlFlow<()>,
{
    let mut cycles = 0u64;
    loop {
        if *stop.borrow() {
            break;
        }
        if let Err(e) = cycle.send_request() {
            tracing::warn!(error = %e, "enumeration request failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        cycle.prune();
        cycle.visit_sessions(&mut visitor);
        cycles += 1;
        if *stop.borrow() {
            break;
        }
        if visitor(EnumEvent::TimedOut).is_break() {
            tracing::debug!(cycles, "visitor ended enumeration");
            break;
        }
    }
    tracing::debug!(cycles, "enumeration loop exited");
}
