//! Per-event orchestration: loop prevention, scope filter, rate gate, enforcement, and the
//! mention → fetch → inference → chunked reply path.

use std::{sync::Arc, time::Instant};

use crate::{
    config::Config,
    domain::GroupId,
    errors::Error,
    log_channel::LogChannelResolver,
    messaging::{
        port::ChatPort,
        types::{Author, ChatAction, Group, IncomingMessage},
    },
    model::{
        client::{ContentFetcher, InferenceClient},
        types::{InferenceRequest, Readiness},
    },
    moderation::{Sanction, SlidingWindowLimiter, ViolationReport, ViolationTracker},
    utils::{
        first_url, local_timestamp, split_chunks, strip_mentions, truncate_text, AuditEvent,
        AuditLogger,
    },
};

const KICK_REASON: &str = "Spam / flooding (automatic kick)";
const BAN_REASON: &str = "Spam / flooding (automatic ban)";
const EMPTY_PROMPT_HINT: &str = "Mention me with a question, or with a URL to summarize.";

/// What happened to one inbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Authored by ourselves or another automated account.
    IgnoredBot,
    /// Outside the configured destination.
    OutOfScope,
    /// Denied by the rate limiter; `report` is `None` outside groups.
    RateLimited {
        deleted: bool,
        report: Option<ViolationReport>,
        sanction: SanctionOutcome,
    },
    /// Allowed; `reply_chunks` is the number of chunks delivered (0 when not addressed).
    Allowed { reply_chunks: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SanctionOutcome {
    NotNeeded,
    Applied(Sanction),
    MemberNotFound,
    /// The transport cannot kick or ban.
    Unsupported,
    Failed(String),
}

/// Result of one dormant-state sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub windows_removed: usize,
    pub violations_removed: usize,
    pub windows_tracked: usize,
    pub violations_tracked: usize,
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    port: Arc<dyn ChatPort>,
    inference: Arc<dyn InferenceClient>,
    fetcher: Arc<dyn ContentFetcher>,
    limiter: SlidingWindowLimiter,
    violations: ViolationTracker,
    log_channels: LogChannelResolver,
    audit: Option<AuditLogger>,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        port: Arc<dyn ChatPort>,
        inference: Arc<dyn InferenceClient>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(cfg.posts_per_window, cfg.window),
            violations: ViolationTracker::new(cfg.violation_window, cfg.kick_after, cfg.ban_after),
            log_channels: LogChannelResolver::new(cfg.log_channel_marker.clone()),
            audit: None,
            cfg,
            port,
            inference,
            fetcher,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Make sure the inference service is up, then announce ourselves in every known group.
    pub async fn startup(&self, groups: &[Group]) -> Readiness {
        let readiness = self.inference.ensure_ready(self.cfg.ready_timeout).await;
        match readiness {
            Readiness::AlreadyRunning => tracing::info!("✅ ollama serve already running"),
            Readiness::Started { after_secs } => {
                tracing::info!("✅ ollama ready ({after_secs}s)")
            }
            Readiness::Unresponsive => {
                tracing::warn!("⚠️ ollama not responding, continuing…")
            }
        }

        for g in groups {
            self.log_channels
                .send_log(
                    self.port.as_ref(),
                    Some(g.id),
                    &format!("🔔 Bot is online (model={})", self.cfg.ollama.model),
                )
                .await;
        }
        readiness
    }

    pub async fn on_group_join(&self, group: &Group) {
        self.log_channels
            .send_log(
                self.port.as_ref(),
                Some(group.id),
                &format!("👋 Joined group: {}", group.name),
            )
            .await;
    }

    /// Drop per-user state that no longer influences any decision.
    pub fn sweep(&self, now: Instant) -> SweepStats {
        SweepStats {
            windows_removed: self.limiter.sweep(now),
            violations_removed: self.violations.sweep(now),
            windows_tracked: self.limiter.tracked_users(),
            violations_tracked: self.violations.tracked_users(),
        }
    }

    pub async fn handle(&self, msg: IncomingMessage) -> Outcome {
        if msg.author.id == self.cfg.bot_user_id || msg.author.is_bot {
            return Outcome::IgnoredBot;
        }

        if let Some(target) = self.cfg.target_destination {
            if msg.destination != target {
                return Outcome::OutOfScope;
            }
        }

        if !self.limiter.allow(msg.author.id, Instant::now()) {
            return self.enforce(&msg).await;
        }

        let mut reply_chunks = 0;
        if self.is_addressed(&msg.text) {
            reply_chunks = self.reply(&msg).await;
        }

        if let Err(e) = self.port.process_commands(&msg).await {
            tracing::warn!(error = %e, "command hook failed");
        }

        Outcome::Allowed { reply_chunks }
    }

    fn is_addressed(&self, text: &str) -> bool {
        self.cfg
            .bot_mentions
            .iter()
            .any(|m| !m.is_empty() && text.contains(m.as_str()))
    }

    // ============== Enforcement ==============

    async fn enforce(&self, msg: &IncomingMessage) -> Outcome {
        let group = msg.group.as_ref().map(|g| g.id);
        let deleted = if self.port.capabilities().supports_delete {
            self.try_delete(msg, group).await
        } else {
            tracing::info!(author = %msg.author, "transport cannot delete; message left in place");
            false
        };

        // Sanctions only exist inside groups.
        let Some(g) = &msg.group else {
            return Outcome::RateLimited {
                deleted,
                report: None,
                sanction: SanctionOutcome::NotNeeded,
            };
        };

        let report = self
            .violations
            .record_and_classify(msg.author.id, Instant::now());
        self.audit(AuditEvent::violation(
            msg.author.id,
            &msg.author.name,
            g.id.0,
            report.count,
        ));

        let notice = format!(
            "🔧 Anti-Spam Log\nGroup: {}\nUser: {}\nAction: Message deleted (violation count: {})\nRemaining: {} until kick / {} until ban\nTime: {}",
            g.name,
            msg.author,
            report.count,
            report.remaining_to_kick,
            report.remaining_to_ban,
            local_timestamp()
        );
        self.log(Some(g.id), &notice).await;

        let sanction = self.apply_sanction(g.id, &msg.author, &report).await;

        Outcome::RateLimited {
            deleted,
            report: Some(report),
            sanction,
        }
    }

    async fn try_delete(&self, msg: &IncomingMessage, group: Option<GroupId>) -> bool {
        let ts = local_timestamp();
        match self.port.delete_message(msg.message_ref()).await {
            Ok(()) => {
                tracing::info!(
                    "[{ts}] Deleted => {} | Content: {}",
                    msg.author,
                    truncate_text(&msg.text, 100)
                );
                self.audit(AuditEvent::deleted(
                    msg.author.id,
                    &msg.author.name,
                    group.map(|g| g.0),
                    &msg.text,
                ));
                self.log(
                    group,
                    &format!(
                        "🧹 Deleted message from {}\nContent: `{}`\nTime: {ts}",
                        msg.author,
                        truncate_text(&msg.text, 120)
                    ),
                )
                .await;
                true
            }
            Err(Error::PermissionDenied(e)) => {
                tracing::warn!("[{ts}] Delete failed (perm) => {}: {e}", msg.author);
                self.log(
                    group,
                    &format!("❗ Delete failed (permission) for {}", msg.author),
                )
                .await;
                false
            }
            Err(e) => {
                tracing::warn!("[{ts}] Delete failed (HTTP) => {e}");
                self.log(group, &format!("❗ Delete failed (HTTP) => {e}"))
                    .await;
                false
            }
        }
    }

    async fn apply_sanction(
        &self,
        group: GroupId,
        author: &Author,
        report: &ViolationReport,
    ) -> SanctionOutcome {
        let result = match report.action {
            Sanction::None => return SanctionOutcome::NotNeeded,
            _ if !self.port.capabilities().supports_sanctions => Ok(SanctionOutcome::Unsupported),
            Sanction::Ban => self
                .port
                .ban_user(group, author.id, BAN_REASON)
                .await
                .map(|()| SanctionOutcome::Applied(Sanction::Ban)),
            Sanction::Kick => match self.port.resolve_member(group, author.id).await {
                Ok(Some(member)) => self
                    .port
                    .kick_member(member, KICK_REASON)
                    .await
                    .map(|()| SanctionOutcome::Applied(Sanction::Kick)),
                Ok(None) | Err(Error::NotFound(_)) => Ok(SanctionOutcome::MemberNotFound),
                Err(e) => Err(e),
            },
        };

        let outcome = match result {
            Ok(o) => o,
            Err(Error::PermissionDenied(_)) => {
                SanctionOutcome::Failed(format!("❗ Sanction failed (missing permission): {author}"))
            }
            Err(e) => SanctionOutcome::Failed(format!("❗ Sanction failed (HTTP): {e}")),
        };

        let (notice, action) = match &outcome {
            SanctionOutcome::Applied(Sanction::Ban) => {
                (format!("🚫 BANNED: {author}  Reason: {BAN_REASON}"), "ban")
            }
            SanctionOutcome::Applied(_) => {
                (format!("👢 KICKED: {author}  Reason: {KICK_REASON}"), "kick")
            }
            SanctionOutcome::MemberNotFound => (
                format!("⚠️ Kick skipped (member not found): {author}"),
                "kick_skipped",
            ),
            SanctionOutcome::Unsupported => (
                format!("⚠️ Sanction skipped (transport cannot kick or ban): {author}"),
                "unsupported",
            ),
            SanctionOutcome::Failed(msg) => (msg.clone(), "failed"),
            SanctionOutcome::NotNeeded => return outcome,
        };

        let error = match &outcome {
            SanctionOutcome::Failed(msg) => Some(msg.as_str()),
            _ => None,
        };
        self.audit(AuditEvent::sanction(
            author.id,
            &author.name,
            Some(group.0),
            report.count,
            action,
            error,
        ));
        self.log(Some(group), &notice).await;
        outcome
    }

    // ============== Inference ==============

    async fn reply(&self, msg: &IncomingMessage) -> usize {
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let typing_task = if self.port.capabilities().supports_chat_actions {
            let port = self.port.clone();
            let dest = msg.destination;
            Some(tokio::spawn(async move {
                let mut tick = tokio::time::interval(std::time::Duration::from_secs(8));
                loop {
                    tokio::select! {
                      _ = tick.tick() => {
                        let _ = port.send_chat_action(dest, ChatAction::Typing).await;
                      }
                      _ = &mut stop_rx => break,
                    }
                }
            }))
        } else {
            None
        };

        let prompt = self.build_prompt(&msg.text).await;
        let response = match prompt {
            Some(p) => {
                let response = self
                    .inference
                    .invoke(InferenceRequest::new(p.clone(), self.cfg.inference_timeout))
                    .await;
                self.audit(AuditEvent::inference(
                    msg.author.id,
                    &msg.author.name,
                    &p,
                    &response,
                ));
                response
            }
            None => EMPTY_PROMPT_HINT.to_string(),
        };

        let _ = stop_tx.send(());
        if let Some(t) = typing_task {
            let _ = t.await;
        }

        self.send_chunked(msg, &response).await
    }

    async fn build_prompt(&self, text: &str) -> Option<String> {
        if let Some(url) = first_url(text) {
            let page = self.fetcher.fetch_text(url).await;
            return Some(format!(
                "Summarize the following content:\nURL:{url}\n\n{page}"
            ));
        }

        let stripped = strip_mentions(text, &self.cfg.bot_mentions);
        if stripped.is_empty() {
            None
        } else {
            Some(stripped)
        }
    }

    /// Send chunks in order; stop at the first failure so the reader never sees a gap.
    async fn send_chunked(&self, msg: &IncomingMessage, text: &str) -> usize {
        let limit = self
            .cfg
            .message_chunk_size
            .min(self.port.capabilities().max_message_len.max(1));
        let mut sent = 0;
        for chunk in split_chunks(text, limit) {
            if let Err(e) = self.port.send_text(msg.destination, &chunk).await {
                tracing::warn!(
                    destination = msg.destination.0,
                    error = %e,
                    "reply chunk {} failed; dropping the rest",
                    sent + 1
                );
                break;
            }
            sent += 1;
        }
        sent
    }

    // ============== Helpers ==============

    async fn log(&self, group: Option<GroupId>, text: &str) {
        self.log_channels
            .send_log(self.port.as_ref(), group, text)
            .await;
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.write(event) {
                tracing::warn!(error = %e, "audit write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{DestinationId, MessageId, MessageRef, UserId},
        messaging::types::{Destination, MemberHandle, MessagingCapabilities},
        Result,
    };
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    const BOT: u64 = 42;
    const GENERAL: DestinationId = DestinationId(100);
    const BOT_LOGS: DestinationId = DestinationId(101);

    #[derive(Default)]
    struct FakePort {
        sends: Mutex<Vec<(DestinationId, String)>>,
        deletes: Mutex<Vec<MessageRef>>,
        kicks: Mutex<Vec<MemberHandle>>,
        bans: Mutex<Vec<UserId>>,
        commands: AtomicUsize,
        member_missing: AtomicBool,
        deny_delete: AtomicBool,
        deny_sanctions: AtomicBool,
        no_delete: AtomicBool,
        no_sanctions: AtomicBool,
        max_len: AtomicUsize,
    }

    impl FakePort {
        fn sent_to(&self, dest: DestinationId) -> Vec<String> {
            self.sends
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| *d == dest)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChatPort for FakePort {
        fn capabilities(&self) -> MessagingCapabilities {
            let max_len = self.max_len.load(Ordering::SeqCst);
            MessagingCapabilities {
                supports_delete: !self.no_delete.load(Ordering::SeqCst),
                supports_sanctions: !self.no_sanctions.load(Ordering::SeqCst),
                supports_chat_actions: false,
                max_message_len: if max_len == 0 { 2000 } else { max_len },
            }
        }

        async fn send_text(&self, destination: DestinationId, text: &str) -> Result<MessageRef> {
            let mut sends = self.sends.lock().unwrap();
            sends.push((destination, text.to_string()));
            Ok(MessageRef {
                destination,
                message_id: MessageId(sends.len() as u64),
            })
        }

        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            if self.deny_delete.load(Ordering::SeqCst) {
                return Err(Error::PermissionDenied("manage messages".to_string()));
            }
            self.deletes.lock().unwrap().push(msg);
            Ok(())
        }

        async fn send_chat_action(&self, _d: DestinationId, _a: ChatAction) -> Result<()> {
            Ok(())
        }

        async fn resolve_member(&self, group: GroupId, user: UserId) -> Result<Option<MemberHandle>> {
            if self.member_missing.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(MemberHandle { group, user }))
        }

        async fn kick_member(&self, member: MemberHandle, _reason: &str) -> Result<()> {
            if self.deny_sanctions.load(Ordering::SeqCst) {
                return Err(Error::PermissionDenied("kick members".to_string()));
            }
            self.kicks.lock().unwrap().push(member);
            Ok(())
        }

        async fn ban_user(&self, _group: GroupId, user: UserId, _reason: &str) -> Result<()> {
            if self.deny_sanctions.load(Ordering::SeqCst) {
                return Err(Error::PermissionDenied("ban members".to_string()));
            }
            self.bans.lock().unwrap().push(user);
            Ok(())
        }

        async fn list_destinations(&self, _group: GroupId) -> Result<Vec<Destination>> {
            Ok(vec![
                Destination {
                    id: GENERAL,
                    name: "general".to_string(),
                },
                Destination {
                    id: BOT_LOGS,
                    name: "bot-logs".to_string(),
                },
            ])
        }

        async fn process_commands(&self, _msg: &IncomingMessage) -> Result<()> {
            self.commands.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeInference {
        prompts: Mutex<Vec<String>>,
        response: String,
    }

    #[async_trait]
    impl InferenceClient for FakeInference {
        async fn ensure_ready(&self, _timeout: Duration) -> Readiness {
            Readiness::AlreadyRunning
        }

        async fn invoke(&self, req: InferenceRequest) -> String {
            self.prompts.lock().unwrap().push(req.prompt);
            self.response.clone()
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContentFetcher for FakeFetcher {
        async fn fetch_text(&self, url: &str) -> String {
            self.urls.lock().unwrap().push(url.to_string());
            "page body text".to_string()
        }
    }

    struct Harness {
        port: Arc<FakePort>,
        inference: Arc<FakeInference>,
        fetcher: Arc<FakeFetcher>,
        dispatcher: Dispatcher,
    }

    fn harness(extra: &[(&str, &str)], response: &str) -> Harness {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("ODB_BOT_USER_ID".to_string(), BOT.to_string());
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        let cfg = Arc::new(Config::from_lookup(|k| vars.get(k).cloned()).unwrap());

        let port = Arc::new(FakePort::default());
        let inference = Arc::new(FakeInference {
            prompts: Mutex::new(Vec::new()),
            response: response.to_string(),
        });
        let fetcher = Arc::new(FakeFetcher::default());
        let dispatcher = Dispatcher::new(cfg, port.clone(), inference.clone(), fetcher.clone());
        Harness {
            port,
            inference,
            fetcher,
            dispatcher,
        }
    }

    fn message(id: u64, author: u64, text: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: MessageId(id),
            author: Author {
                id: UserId(author),
                name: format!("user{author}"),
                is_bot: false,
            },
            group: Some(Group {
                id: GroupId(1),
                name: "test guild".to_string(),
            }),
            destination: GENERAL,
            text: text.to_string(),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn ignores_own_and_bot_messages() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1")], "x");
        for i in 0..5 {
            let out = h.dispatcher.handle(message(i, BOT, "<@42> hi")).await;
            assert_eq!(out, Outcome::IgnoredBot);
        }
        let mut other_bot = message(10, 7, "hi");
        other_bot.author.is_bot = true;
        assert_eq!(h.dispatcher.handle(other_bot).await, Outcome::IgnoredBot);

        assert!(h.port.sends.lock().unwrap().is_empty());
        assert_eq!(h.port.commands.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn out_of_scope_messages_skip_rate_accounting() {
        let h = harness(
            &[("ODB_POSTS_PER_WINDOW", "1"), ("ODB_TARGET_DESTINATION_ID", "555")],
            "x",
        );
        for i in 0..3 {
            assert_eq!(h.dispatcher.handle(message(i, 7, "hi")).await, Outcome::OutOfScope);
        }

        let mut in_scope = message(9, 7, "hi");
        in_scope.destination = DestinationId(555);
        assert_eq!(
            h.dispatcher.handle(in_scope).await,
            Outcome::Allowed { reply_chunks: 0 }
        );
    }

    #[tokio::test]
    async fn flooding_escalates_delete_kick_ban() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1")], "x");
        assert_eq!(
            h.dispatcher.handle(message(0, 7, "first")).await,
            Outcome::Allowed { reply_chunks: 0 }
        );

        let mut sanctions = Vec::new();
        for i in 1..=6 {
            match h.dispatcher.handle(message(i, 7, "spam")).await {
                Outcome::RateLimited {
                    deleted,
                    report: Some(report),
                    sanction,
                } => {
                    assert!(deleted);
                    assert_eq!(report.count, i as usize);
                    sanctions.push(sanction);
                }
                other => panic!("expected rate limit, got {other:?}"),
            }
        }

        assert_eq!(
            sanctions,
            vec![
                SanctionOutcome::NotNeeded,
                SanctionOutcome::NotNeeded,
                SanctionOutcome::Applied(Sanction::Kick),
                SanctionOutcome::Applied(Sanction::Kick),
                SanctionOutcome::Applied(Sanction::Kick),
                SanctionOutcome::Applied(Sanction::Ban),
            ]
        );
        assert_eq!(h.port.deletes.lock().unwrap().len(), 6);
        assert_eq!(h.port.kicks.lock().unwrap().len(), 3);
        assert_eq!(h.port.bans.lock().unwrap().clone(), vec![UserId(7)]);
        // Denied events never reach the command hook.
        assert_eq!(h.port.commands.load(Ordering::SeqCst), 1);

        let logs = h.port.sent_to(BOT_LOGS);
        assert!(logs.iter().any(|l| l.starts_with("🧹 Deleted message from user7")));
        assert!(logs
            .iter()
            .any(|l| l.contains("Remaining: 2 until kick / 5 until ban")));
        assert!(logs.iter().any(|l| l.starts_with("👢 KICKED: user7")));
        assert!(logs.iter().any(|l| l.starts_with("🚫 BANNED: user7")));
        assert!(h.port.sent_to(GENERAL).is_empty());
    }

    #[tokio::test]
    async fn kick_without_member_reports_not_found() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1"), ("ODB_KICK_AFTER", "1")], "x");
        h.port.member_missing.store(true, Ordering::SeqCst);

        h.dispatcher.handle(message(0, 7, "a")).await;
        let out = h.dispatcher.handle(message(1, 7, "b")).await;
        assert!(matches!(
            out,
            Outcome::RateLimited {
                sanction: SanctionOutcome::MemberNotFound,
                ..
            }
        ));
        assert!(h.port.kicks.lock().unwrap().is_empty());
        assert!(h
            .port
            .sent_to(BOT_LOGS)
            .iter()
            .any(|l| l.starts_with("⚠️ Kick skipped (member not found)")));
    }

    #[tokio::test]
    async fn transport_failures_are_logged_not_fatal() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1"), ("ODB_KICK_AFTER", "1")], "x");
        h.port.deny_delete.store(true, Ordering::SeqCst);
        h.port.deny_sanctions.store(true, Ordering::SeqCst);

        h.dispatcher.handle(message(0, 7, "a")).await;
        let out = h.dispatcher.handle(message(1, 7, "b")).await;
        match out {
            Outcome::RateLimited {
                deleted,
                report: Some(report),
                sanction: SanctionOutcome::Failed(msg),
            } => {
                assert!(!deleted);
                // The violation still counts when the delete itself failed.
                assert_eq!(report.count, 1);
                assert!(msg.contains("missing permission"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let logs = h.port.sent_to(BOT_LOGS);
        assert!(logs.iter().any(|l| l.starts_with("❗ Delete failed (permission)")));
    }

    #[tokio::test]
    async fn direct_messages_are_rate_limited_without_sanctions() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1")], "x");
        let mut dm = message(0, 7, "a");
        dm.group = None;
        h.dispatcher.handle(dm.clone()).await;
        let out = h.dispatcher.handle(dm).await;
        assert_eq!(
            out,
            Outcome::RateLimited {
                deleted: true,
                report: None,
                sanction: SanctionOutcome::NotNeeded,
            }
        );
    }

    #[tokio::test]
    async fn mention_with_url_summarizes_fetched_page() {
        let h = harness(&[], "summary");
        let out = h
            .dispatcher
            .handle(message(0, 7, "<@42> what is this https://example.com/a b"))
            .await;
        assert_eq!(out, Outcome::Allowed { reply_chunks: 1 });

        assert_eq!(
            h.fetcher.urls.lock().unwrap().clone(),
            vec!["https://example.com/a"]
        );
        let prompts = h.inference.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("URL:https://example.com/a"));
        assert!(prompts[0].ends_with("page body text"));
        assert_eq!(h.port.sent_to(GENERAL), vec!["summary"]);
        assert_eq!(h.port.commands.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mention_without_url_sends_stripped_text() {
        let h = harness(&[], "answer");
        h.dispatcher
            .handle(message(0, 7, "<@!42>  why is the sky blue?"))
            .await;
        assert_eq!(
            h.inference.prompts.lock().unwrap().clone(),
            vec!["why is the sky blue?"]
        );
        assert!(h.fetcher.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bare_mention_gets_a_hint_without_inference() {
        let h = harness(&[], "answer");
        let out = h.dispatcher.handle(message(0, 7, "<@42>")).await;
        assert_eq!(out, Outcome::Allowed { reply_chunks: 1 });
        assert!(h.inference.prompts.lock().unwrap().is_empty());
        assert_eq!(h.port.sent_to(GENERAL), vec![EMPTY_PROMPT_HINT]);
    }

    #[tokio::test]
    async fn long_replies_are_chunked_in_order() {
        let long: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let h = harness(&[], &long);
        let out = h.dispatcher.handle(message(0, 7, "<@42> essay")).await;
        assert_eq!(out, Outcome::Allowed { reply_chunks: 3 });

        let sent = h.port.sent_to(GENERAL);
        assert_eq!(
            sent.iter().map(|s| s.chars().count()).collect::<Vec<_>>(),
            vec![1900, 1900, 1200]
        );
        assert_eq!(sent.concat(), long);
    }

    #[tokio::test]
    async fn unaddressed_messages_only_reach_the_command_hook() {
        let h = harness(&[], "answer");
        let out = h.dispatcher.handle(message(0, 7, "just chatting")).await;
        assert_eq!(out, Outcome::Allowed { reply_chunks: 0 });
        assert!(h.inference.prompts.lock().unwrap().is_empty());
        assert_eq!(h.port.commands.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_announces_in_each_group() {
        let h = harness(&[], "x");
        let readiness = h
            .dispatcher
            .startup(&[Group {
                id: GroupId(1),
                name: "g".to_string(),
            }])
            .await;
        assert_eq!(readiness, Readiness::AlreadyRunning);
        let logs = h.port.sent_to(BOT_LOGS);
        assert_eq!(logs, vec!["🔔 Bot is online (model=qwen2.5:0.5b-instruct)"]);
    }

    #[tokio::test]
    async fn moderation_events_reach_the_audit_log() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let path = std::path::PathBuf::from(format!(
            "/tmp/odb-dispatch-audit-{}-{ts}.log",
            std::process::id()
        ));

        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1"), ("ODB_KICK_AFTER", "1")], "x");
        let dispatcher = h.dispatcher.with_audit(AuditLogger::new(path.clone(), true));
        dispatcher.handle(message(0, 7, "a")).await;
        dispatcher.handle(message(1, 7, "b")).await;

        let raw = std::fs::read_to_string(&path).unwrap();
        let events: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let kinds: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();
        assert_eq!(kinds, vec!["delete", "violation", "sanction"]);
        assert_eq!(events[2]["action"], "kick");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn transport_without_moderation_rights_is_left_alone() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1"), ("ODB_KICK_AFTER", "1")], "x");
        h.port.no_delete.store(true, Ordering::SeqCst);
        h.port.no_sanctions.store(true, Ordering::SeqCst);

        h.dispatcher.handle(message(0, 7, "a")).await;
        let out = h.dispatcher.handle(message(1, 7, "b")).await;
        match out {
            Outcome::RateLimited {
                deleted,
                report: Some(report),
                sanction,
            } => {
                assert!(!deleted);
                assert_eq!(report.count, 1);
                assert_eq!(sanction, SanctionOutcome::Unsupported);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(h.port.deletes.lock().unwrap().is_empty());
        assert!(h.port.kicks.lock().unwrap().is_empty());
        assert!(h
            .port
            .sent_to(BOT_LOGS)
            .iter()
            .any(|l| l.starts_with("⚠️ Sanction skipped")));
    }

    #[tokio::test]
    async fn chunks_never_exceed_the_transport_limit() {
        let h = harness(&[], &"y".repeat(2500));
        h.port.max_len.store(1000, Ordering::SeqCst);

        let out = h.dispatcher.handle(message(0, 7, "<@42> long please")).await;
        assert_eq!(out, Outcome::Allowed { reply_chunks: 3 });
        assert_eq!(
            h.port
                .sent_to(GENERAL)
                .iter()
                .map(|s| s.chars().count())
                .collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
    }

    #[tokio::test]
    async fn sweep_only_forgets_dormant_users() {
        let h = harness(&[("ODB_POSTS_PER_WINDOW", "1")], "x");
        h.dispatcher.handle(message(0, 7, "a")).await;

        let stats = h.dispatcher.sweep(Instant::now());
        assert_eq!(
            stats,
            SweepStats {
                windows_removed: 0,
                violations_removed: 0,
                windows_tracked: 1,
                violations_tracked: 0,
            }
        );

        // The user is still inside the window, so the sweep must not have reset them.
        let out = h.dispatcher.handle(message(1, 7, "b")).await;
        assert!(matches!(out, Outcome::RateLimited { .. }));

        let stats = h
            .dispatcher
            .sweep(Instant::now() + Duration::from_secs(3600));
        assert_eq!(
            stats,
            SweepStats {
                windows_removed: 1,
                violations_removed: 1,
                windows_tracked: 0,
                violations_tracked: 0,
            }
        );
    }

    #[tokio::test]
    async fn group_join_is_announced_in_the_log_destination() {
        let h = harness(&[], "x");
        h.dispatcher
            .on_group_join(&Group {
                id: GroupId(1),
                name: "new friends".to_string(),
            })
            .await;
        assert_eq!(
            h.port.sent_to(BOT_LOGS),
            vec!["👋 Joined group: new friends"]
        );
        assert!(h.port.sent_to(GENERAL).is_empty());
    }
}
