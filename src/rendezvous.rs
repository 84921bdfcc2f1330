//! Handshake rendezvous: correlates the main gateway's "voice state" and
//! "voice server" events into one pair per server.
//!
//! Submitters are fire-and-forget; the waiter polls both maps until the
//! pair is complete or the deadline passes. Nothing carries over between
//! calls — a timed-out wait drops whichever half had arrived.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{HandshakePair, UserApi, VoiceServerSnapshot, VoiceStateSnapshot};
use crate::common::{Result, ServerId, UserId, VoiceError};

/// Wall-clock budget for one wait, measured from call entry.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct HandshakeRendezvous {
    user_api: Arc<dyn UserApi>,
    own_user: OnceCell<UserId>,
    pending: DashSet<ServerId>,
    states: DashMap<ServerId, VoiceStateSnapshot>,
    servers: DashMap<ServerId, VoiceServerSnapshot>,
}

impl HandshakeRendezvous {
    pub fn new(user_api: Arc<dyn UserApi>) -> Self {
        Self {
            user_api,
            own_user: OnceCell::new(),
            pending: DashSet::new(),
            states: DashMap::new(),
            servers: DashMap::new(),
        }
    }

    /// Waits for both halves of the handshake for `server_id`.
    ///
    /// Errors: [`VoiceError::AlreadyPending`] if a wait is in flight for
    /// the same server, [`VoiceError::Timeout`] after `timeout`,
    /// [`VoiceError::Cancelled`] if `cancel` fires first.
    pub async fn wait_for(
        &self,
        server_id: ServerId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HandshakePair> {
        if !self.pending.insert(server_id) {
            return Err(VoiceError::AlreadyPending(server_id));
        }

        let result = tokio::select! {
            r = self.poll_pair(server_id, timeout) => r,
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
        };

        // Whatever happened, this request is over: no partial state may
        // leak into the next wait.
        self.pending.remove(&server_id);
        if result.is_err() {
            self.states.remove(&server_id);
            self.servers.remove(&server_id);
        }
        result
    }

    async fn poll_pair(&self, server_id: ServerId, timeout: Duration) -> Result<HandshakePair> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.states.contains_key(&server_id) && self.servers.contains_key(&server_id) {
                // Single waiter per id, so the removes cannot race another
                // taker; submitters only ever insert.
                let state = self.states.remove(&server_id);
                let server = self.servers.remove(&server_id);
                if let (Some((_, state)), Some((_, server))) = (state, server) {
                    return Ok(HandshakePair { state, server });
                }
                return Err(VoiceError::ProtocolViolation(
                    "handshake half vanished mid-pairing".into(),
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VoiceError::Timeout("voice handshake"));
            }
            tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + POLL_INTERVAL))
                .await;
        }
    }

    /// Feeds a voice-state event in. No-op unless a wait is pending for its
    /// server and the snapshot belongs to the bot itself.
    pub async fn submit_state(&self, snapshot: VoiceStateSnapshot) {
        if !self.pending.contains(&snapshot.server_id) {
            return;
        }
        let own = match self.own_user().await {
            Ok(id) => id,
            Err(e) => {
                warn!("could not resolve own user id, dropping voice state: {}", e);
                return;
            }
        };
        if snapshot.user_id != own {
            debug!(
                "ignoring foreign voice state for server {} (user {})",
                snapshot.server_id, snapshot.user_id
            );
            return;
        }
        self.states.insert(snapshot.server_id, snapshot);
    }

    /// Feeds a voice-server event in. No-op unless a wait is pending.
    pub fn submit_server(&self, snapshot: VoiceServerSnapshot) {
        if !self.pending.contains(&snapshot.server_id) {
            return;
        }
        self.servers.insert(snapshot.server_id, snapshot);
    }

    async fn own_user(&self) -> Result<UserId> {
        self.own_user
            .get_or_try_init(|| self.user_api.get_current_user())
            .await
            .map(|id| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BOT: UserId = 777;

    struct FixedUser {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UserApi for FixedUser {
        async fn get_current_user(&self) -> Result<UserId> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BOT)
        }
    }

    fn rendezvous() -> (Arc<HandshakeRendezvous>, Arc<FixedUser>) {
        let user = Arc::new(FixedUser {
            calls: AtomicUsize::new(0),
        });
        (
            Arc::new(HandshakeRendezvous::new(user.clone())),
            user,
        )
    }

    fn state(server_id: ServerId, user_id: UserId) -> VoiceStateSnapshot {
        VoiceStateSnapshot {
            server_id,
            user_id,
            session_id: "abc".into(),
        }
    }

    fn server(server_id: ServerId) -> VoiceServerSnapshot {
        VoiceServerSnapshot {
            server_id,
            endpoint: Some("v.example".into()),
            token: "tkn".into(),
        }
    }

    #[tokio::test]
    async fn pairs_state_and_server() {
        let (rv, _) = rendezvous();
        let cancel = CancellationToken::new();

        let waiter = {
            let rv = rv.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rv.wait_for(100, DEFAULT_TIMEOUT, &cancel).await })
        };

        tokio::task::yield_now().await;
        rv.submit_state(state(100, BOT)).await;
        rv.submit_server(server(100));

        let pair = waiter.await.unwrap().unwrap();
        assert_eq!(pair.state.session_id, "abc");
        assert_eq!(pair.server.token, "tkn");
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_user_never_completes_a_pair() {
        let (rv, _) = rendezvous();
        let cancel = CancellationToken::new();

        let waiter = {
            let rv = rv.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rv.wait_for(100, Duration::from_secs(5), &cancel).await })
        };

        tokio::task::yield_now().await;
        rv.submit_state(state(100, 999)).await;
        rv.submit_server(server(100));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, VoiceError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_drops_partial_state() {
        let (rv, _) = rendezvous();
        let cancel = CancellationToken::new();

        let waiter = {
            let rv = rv.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rv.wait_for(100, Duration::from_secs(5), &cancel).await })
        };
        tokio::task::yield_now().await;
        rv.submit_server(server(100));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, VoiceError::Timeout(_)));
        assert!(rv.servers.is_empty());
        assert!(rv.pending.is_empty());
    }

    #[tokio::test]
    async fn second_wait_for_same_server_is_rejected() {
        let (rv, _) = rendezvous();
        let cancel = CancellationToken::new();

        let first = {
            let rv = rv.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rv.wait_for(100, DEFAULT_TIMEOUT, &cancel).await })
        };
        tokio::task::yield_now().await;

        let err = rv.wait_for(100, DEFAULT_TIMEOUT, &cancel).await.unwrap_err();
        assert!(matches!(err, VoiceError::AlreadyPending(100)));

        rv.submit_state(state(100, BOT)).await;
        rv.submit_server(server(100));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn submissions_without_pending_wait_are_dropped() {
        let (rv, _) = rendezvous();
        rv.submit_state(state(100, BOT)).await;
        rv.submit_server(server(100));
        assert!(rv.states.is_empty());
        assert!(rv.servers.is_empty());
    }

    #[tokio::test]
    async fn own_user_is_fetched_once() {
        let (rv, user) = rendezvous();
        let cancel = CancellationToken::new();

        for id in [1u64, 2] {
            let waiter = {
                let rv = rv.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { rv.wait_for(id, DEFAULT_TIMEOUT, &cancel).await })
            };
            tokio::task::yield_now().await;
            rv.submit_state(state(id, BOT)).await;
            rv.submit_server(server(id));
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(user.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_wins_over_timeout() {
        let (rv, _) = rendezvous();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = rv.wait_for(5, DEFAULT_TIMEOUT, &cancel).await.unwrap_err();
        assert!(matches!(err, VoiceError::Cancelled));
    }
}
