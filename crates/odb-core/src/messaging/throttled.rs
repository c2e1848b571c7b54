use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{DestinationId, GroupId, MessageRef, UserId},
    messaging::{
        port::ChatPort,
        types::{ChatAction, Destination, IncomingMessage, MemberHandle, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls per destination.
    pub per_destination_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(20),     // ~50/sec
            per_destination_min_interval: Duration::from_millis(250), // ~4/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// ChatPort decorator that spaces outbound calls.
///
/// Chunked replies and moderation notices arrive in bursts; spacing them keeps us under the
/// transport's flood limits most of the time. Reads (`resolve_member`, `list_destinations`)
/// only take the global slot.
pub struct ThrottledMessenger {
    inner: Arc<dyn ChatPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_destination: Mutex<HashMap<DestinationId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn ChatPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_destination: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for(&self, destination: DestinationId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_destination.lock().await;
        map.entry(destination)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_destination_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_destination(&self, destination: DestinationId) {
        let global_wait = { self.global.lock().await.reserve() };
        let dest_wait = {
            let lim = self.limiter_for(destination).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(dest_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl ChatPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_text(&self, destination: DestinationId, text: &str) -> Result<MessageRef> {
        self.throttle_destination(destination).await;
        self.inner.send_text(destination, text).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.throttle_destination(msg.destination).await;
        self.inner.delete_message(msg).await
    }

    async fn send_chat_action(&self, destination: DestinationId, action: ChatAction) -> Result<()> {
        self.throttle_destination(destination).await;
        self.inner.send_chat_action(destination, action).await
    }

    async fn resolve_member(&self, group: GroupId, user: UserId) -> Result<Option<MemberHandle>> {
        self.throttle_global().await;
        self.inner.resolve_member(group, user).await
    }

    async fn kick_member(&self, member: MemberHandle, reason: &str) -> Result<()> {
        self.throttle_global().await;
        self.inner.kick_member(member, reason).await
    }

    async fn ban_user(&self, group: GroupId, user: UserId, reason: &str) -> Result<()> {
        self.throttle_global().await;
        self.inner.ban_user(group, user, reason).await
    }

    async fn list_destinations(&self, group: GroupId) -> Result<Vec<Destination>> {
        self.throttle_global().await;
        self.inner.list_destinations(group).await
    }

    async fn process_commands(&self, msg: &IncomingMessage) -> Result<()> {
        // Local hook; nothing goes over the wire until the hook itself sends.
        self.inner.process_commands(msg).await
    }
}
