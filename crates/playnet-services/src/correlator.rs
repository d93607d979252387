//! Reply correlation — matches inbound commands to the request waiting for
//! them.
//!
//! A caller registers the set of commands it will accept with
//! [`ReplyCorrelator::expect`] before sending its request, then awaits
//! [`PendingReply::wait`]. The inbound path hands every command it does not
//! handle itself to [`ReplyCorrelator::deliver`]. Registrations are kept in
//! order, so when two callers wait for the same command the earlier one is
//! served first.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use playnet_core::CommandId;

use crate::error::{PlayError, PlayResult};

/// A reply handed to a waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub command: CommandId,
    pub payload: Bytes,
}

struct Registration {
    token: u64,
    expected: Vec<CommandId>,
    tx: oneshot::Sender<PlayResult<Reply>>,
}

#[derive(Default)]
struct Waiting {
    next_token: u64,
    entries: Vec<Registration>,
}

/// Shared table of outstanding requests. Cheap to clone.
#[derive(Clone, Default)]
pub struct ReplyCorrelator {
    waiting: Arc<Mutex<Waiting>>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in any of `expected`. The returned handle times out
    /// `timeout` from now.
    pub fn expect(&self, expected: &[CommandId], timeout: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.waiting.lock();
        let token = waiting.next_token;
        waiting.next_token += 1;
        waiting.entries.push(Registration {
            token,
            expected: expected.to_vec(),
            tx,
        });
        drop(waiting);

        tracing::trace!(token, ?expected, "awaiting reply");

        PendingReply {
            token,
            deadline: Instant::now() + timeout,
            rx,
            waiting: Arc::clone(&self.waiting),
        }
    }

    /// Hand an inbound command to the oldest registration expecting it.
    ///
    /// Returns `false` if nobody was waiting for `command`.
    pub fn deliver(&self, command: CommandId, payload: &[u8]) -> bool {
        loop {
            let claimed = {
                let mut waiting = self.waiting.lock();
                let found = waiting
                    .entries
                    .iter()
                    .position(|r| r.expected.contains(&command));
                match found {
                    Some(i) => waiting.entries.remove(i),
                    None => return false,
                }
            };

            let token = claimed.token;
            let reply = Reply {
                command,
                payload: Bytes::copy_from_slice(payload),
            };
            if claimed.tx.send(Ok(reply)).is_ok() {
                tracing::trace!(token, ?command, "reply delivered");
                return true;
            }
            // Receiver went away without unregistering; try the next one.
        }
    }

    /// Withdraw a registration. Its waiter resolves with `Cancelled`.
    pub fn cancel(&self, pending: &PendingReply) {
        let removed = {
            let mut waiting = self.waiting.lock();
            let found = waiting.entries.iter().position(|r| r.token == pending.token);
            found.map(|i| waiting.entries.remove(i))
        };
        if let Some(reg) = removed {
            let _ = reg.tx.send(Err(PlayError::Cancelled));
        }
    }

    /// Cancel every outstanding registration.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.waiting.lock().entries.drain(..).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelling pending replies");
        }
        for reg in drained {
            let _ = reg.tx.send(Err(PlayError::Cancelled));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiting.lock().entries.len()
    }
}

/// One outstanding request. Dropping it withdraws the registration.
pub struct PendingReply {
    token: u64,
    deadline: Instant,
    rx: oneshot::Receiver<PlayResult<Reply>>,
    waiting: Arc<Mutex<Waiting>>,
}

impl PendingReply {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, the deadline, or cancellation.
    pub async fn wait(mut self) -> PlayResult<Reply> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PlayError::Cancelled),
            Err(_) => {
                self.unregister();
                // A reply may have been claimed between the deadline firing
                // and the registration being removed.
                match self.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::debug!(token = self.token, "reply timed out");
                        Err(PlayError::Timeout)
                    }
                }
            }
        }
    }

    fn unregister(&self) {
        let mut waiting = self.waiting.lock();
        waiting.entries.retain(|r| r.token != self.token);
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIVE_SECONDS: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn deliver_resolves_matching_waiter() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);

        assert!(correlator.deliver(CommandId::NewPlayerIdReply, &[9, 0, 0, 0]));
        let reply = pending.wait().await.unwrap();
        assert_eq!(reply.command, CommandId::NewPlayerIdReply);
        assert_eq!(&reply.payload[..], &[9, 0, 0, 0]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_command_is_not_claimed() {
        let correlator = ReplyCorrelator::new();
        let _pending = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);
        assert!(!correlator.deliver(CommandId::GetNameTableReply, &[]));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn earliest_registration_claims_first() {
        let correlator = ReplyCorrelator::new();
        let first = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);
        let second = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);

        assert!(correlator.deliver(CommandId::NewPlayerIdReply, &[1, 0, 0, 0]));
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.deliver(CommandId::NewPlayerIdReply, &[2, 0, 0, 0]));

        assert_eq!(&first.wait().await.unwrap().payload[..], &[1, 0, 0, 0]);
        assert_eq!(&second.wait().await.unwrap().payload[..], &[2, 0, 0, 0]);
    }

    #[tokio::test]
    async fn any_of_several_commands_resolves() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.expect(
            &[CommandId::GetNameTableReply, CommandId::ForwardAddPlayerNack],
            FIVE_SECONDS,
        );
        assert!(correlator.deliver(CommandId::ForwardAddPlayerNack, &[0, 0, 0, 0]));
        assert_eq!(
            pending.wait().await.unwrap().command,
            CommandId::ForwardAddPlayerNack
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_and_unregisters() {
        let correlator = ReplyCorrelator::new();
        let started = Instant::now();
        let pending = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, PlayError::Timeout));
        assert!(started.elapsed() >= FIVE_SECONDS);
        assert_eq!(correlator.pending_count(), 0);

        // A late reply finds nobody waiting.
        assert!(!correlator.deliver(CommandId::NewPlayerIdReply, &[3, 0, 0, 0]));
    }

    #[tokio::test]
    async fn cancel_wakes_waiter() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);
        correlator.cancel(&pending);
        assert_eq!(correlator.pending_count(), 0);
        assert!(matches!(pending.wait().await, Err(PlayError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_all_wakes_everyone() {
        let correlator = ReplyCorrelator::new();
        let a = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);
        let b = correlator.expect(&[CommandId::GetNameTableReply], FIVE_SECONDS);
        correlator.cancel_all();
        assert!(matches!(a.wait().await, Err(PlayError::Cancelled)));
        assert!(matches!(b.wait().await, Err(PlayError::Cancelled)));
    }

    #[tokio::test]
    async fn dropped_handle_unregisters() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.deliver(CommandId::NewPlayerIdReply, &[0; 4]));
    }

    #[tokio::test]
    async fn waiter_on_another_task_is_woken() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.expect(&[CommandId::NewPlayerIdReply], FIVE_SECONDS);
        let waiter = tokio::spawn(pending.wait());

        tokio::task::yield_now().await;
        assert!(correlator.deliver(CommandId::NewPlayerIdReply, &[4, 0, 0, 0]));
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(&reply.payload[..], &[4, 0, 0, 0]);
    }
}
