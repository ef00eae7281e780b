//! Authenticated, rate-limited messaging over the shared log.
//!
//! Sending validates, throttles, signs and appends. Delivery is pull-based:
//! each agent tails the log from its own cursor and keeps only messages
//! whose signature verifies.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::agent;
use crate::context::CoordinationContext;
use crate::error::{Result, TetherError};
use crate::message::{self, LockAction, Message, MessageType, Payload, Recipient};
use crate::rate_limit::RateLimiter;
use crate::registry::{AgentRegistry, AgentStatus};
use crate::store::acks::{AckStore, PendingAck};
use crate::store::atomic;
use crate::store::message_log::{LogCursor, MessageLog};

pub struct MessagingService {
    ctx: Arc<CoordinationContext>,
    log: MessageLog,
    limiter: RateLimiter,
    acks: AckStore,
    registry: Option<Arc<AgentRegistry>>,
}

impl MessagingService {
    pub fn new(ctx: Arc<CoordinationContext>) -> Result<Self> {
        let log = MessageLog::from_context(&ctx)?;
        let limiter = RateLimiter::from_config(&ctx.config().rate_limiting);
        let acks = AckStore::open(ctx.acks_dir())?;
        Ok(Self {
            ctx,
            log,
            limiter,
            acks,
            registry: None,
        })
    }

    /// Require senders and direct recipients to be known agents.
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    // -- validation ---------------------------------------------------------

    fn check_sender(&self, sender_id: &str) -> Result<()> {
        if agent::validate_agent_id(sender_id).is_err() {
            return Err(TetherError::InvalidSender(sender_id.into()));
        }
        if let Some(registry) = &self.registry {
            let known = registry
                .get(sender_id)?
                .is_some_and(|a| a.status == AgentStatus::Active);
            if !known {
                return Err(TetherError::InvalidSender(sender_id.into()));
            }
        }
        Ok(())
    }

    fn check_recipient(&self, recipient: &Recipient) -> Result<()> {
        let Recipient::Agent(id) = recipient else {
            return Ok(());
        };
        agent::validate_agent_id(id)?;
        if let Some(registry) = &self.registry
            && registry.get(id)?.is_none()
        {
            return Err(TetherError::AgentNotFound(id.clone()));
        }
        Ok(())
    }

    fn check_content(&self, kind: MessageType, content: &str) -> Result<()> {
        let max = self.ctx.config().messaging.max_content_len;
        if content.trim().is_empty() {
            return Err(TetherError::InvalidContent("content is empty".into()));
        }
        if content.len() > max {
            return Err(TetherError::InvalidContent(format!(
                "content is {} bytes, limit is {max}",
                content.len()
            )));
        }
        if let Some(c) = content
            .chars()
            .find(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(TetherError::InvalidContent(format!(
                "control character U+{:04X} not allowed",
                c as u32
            )));
        }
        Payload::decode(kind, content)?;
        Ok(())
    }

    // -- sending ------------------------------------------------------------

    /// Validate, throttle, sign and append one message.
    pub fn send(
        &self,
        sender_id: &str,
        recipient: &Recipient,
        kind: MessageType,
        content: &str,
    ) -> Result<Message> {
        self.send_inner(sender_id, recipient, kind, content, false)
    }

    pub fn send_payload(
        &self,
        sender_id: &str,
        recipient: &Recipient,
        payload: &Payload,
    ) -> Result<Message> {
        self.send(sender_id, recipient, payload.kind(), &payload.encode()?)
    }

    /// Send and record a pending acknowledgement that expires after
    /// `messaging.ack_timeout`.
    pub fn send_with_ack(
        &self,
        sender_id: &str,
        recipient: &Recipient,
        kind: MessageType,
        content: &str,
    ) -> Result<(Message, PendingAck)> {
        let message = self.send_inner(sender_id, recipient, kind, content, true)?;
        let timeout = chrono::Duration::from_std(self.ctx.config().ack_timeout())
            .map_err(|e| TetherError::Config(e.to_string()))?;
        let pending = PendingAck {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            recipient: message.recipient.clone(),
            created_at: message.timestamp,
            expires_at: message.timestamp + timeout,
        };
        self.acks.register(&pending)?;
        Ok((message, pending))
    }

    /// Broadcast a lock state change.
    pub fn notify_lock(
        &self,
        sender_id: &str,
        resource: &str,
        action: LockAction,
    ) -> Result<Message> {
        self.send_payload(
            sender_id,
            &Recipient::Broadcast,
            &Payload::LockNotice {
                resource: resource.into(),
                action,
            },
        )
    }

    fn send_inner(
        &self,
        sender_id: &str,
        recipient: &Recipient,
        kind: MessageType,
        content: &str,
        ack_requested: bool,
    ) -> Result<Message> {
        self.check_sender(sender_id)?;
        self.check_recipient(recipient)?;
        self.check_content(kind, content)?;

        let now = Utc::now();
        if !self.limiter.allow(sender_id, now) {
            return Err(TetherError::RateLimited {
                sender: sender_id.into(),
                retry_after: self.limiter.retry_after(sender_id, now),
            });
        }

        let mut message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            recipient: recipient.clone(),
            kind,
            content: content.into(),
            timestamp: message::normalize_timestamp(now),
            signature: String::new(),
            ack_requested,
        };
        message.signature = message::sign(self.ctx.secret(), &message);
        self.log.append(&message)?;
        tracing::debug!(id = %message.id, sender = sender_id, recipient = %recipient, kind = %kind, "message sent");
        Ok(message)
    }

    // -- verification -------------------------------------------------------

    pub fn verify(&self, message: &Message) -> bool {
        message::verify(self.ctx.secret(), message)
    }

    /// `verify` as a `Result`, for callers that must refuse forged input.
    pub fn authenticate(&self, message: &Message) -> Result<()> {
        if self.verify(message) {
            Ok(())
        } else {
            Err(TetherError::AuthenticationFailure(message.id.clone()))
        }
    }

    /// Find a retained message by id.
    pub fn find_message(&self, message_id: &str) -> Result<Message> {
        self.log
            .read_all()?
            .into_iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| TetherError::Validation(format!("no message with id '{message_id}'")))
    }

    // -- delivery -----------------------------------------------------------

    /// Verified messages for `agent_id` appended after `cursor`: direct
    /// messages and other agents' broadcasts. Forged entries are dropped.
    pub fn inbox(&self, agent_id: &str, cursor: &LogCursor) -> Result<(Vec<Message>, LogCursor)> {
        let (messages, next) = self.log.read_from(cursor)?;
        let inbox = messages
            .into_iter()
            .filter(|m| m.recipient.includes(agent_id))
            .filter(|m| !(m.recipient == Recipient::Broadcast && m.sender_id == agent_id))
            .filter(|m| {
                let ok = self.verify(m);
                if !ok {
                    tracing::warn!(id = %m.id, sender = %m.sender_id, "dropping message with invalid signature");
                }
                ok
            })
            .collect();
        Ok((inbox, next))
    }

    fn cursor_path(&self, agent_id: &str) -> Result<PathBuf> {
        agent::validate_agent_id(agent_id)?;
        Ok(self.ctx.state_dir().join("cursors").join(format!("{agent_id}.json")))
    }

    /// The agent's saved read position (start of history if none).
    pub fn saved_cursor(&self, agent_id: &str) -> Result<LogCursor> {
        let path = self.cursor_path(agent_id)?;
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(cursor) => Ok(cursor),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "resetting corrupt inbox cursor");
                    Ok(LogCursor::default())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LogCursor::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_cursor(&self, agent_id: &str, cursor: &LogCursor) -> Result<()> {
        let path = self.cursor_path(agent_id)?;
        if let Some(parent) = path.parent() {
            atomic::ensure_private_dir(parent)?;
        }
        atomic::replace(&path, &serde_json::to_vec(cursor)?)
    }

    /// New mail since the agent last read, advancing its saved cursor.
    pub fn read_new(&self, agent_id: &str) -> Result<Vec<Message>> {
        let cursor = self.saved_cursor(agent_id)?;
        let (messages, next) = self.inbox(agent_id, &cursor)?;
        if next != cursor {
            self.save_cursor(agent_id, &next)?;
        }
        Ok(messages)
    }

    // -- acknowledgements ---------------------------------------------------

    /// Acknowledge `message_id` on behalf of `agent_id`: send an `ack`
    /// back to the original sender and clear the pending entry.
    pub fn acknowledge(&self, agent_id: &str, message_id: &str) -> Result<Message> {
        let pending = self.acks.get(message_id)?.ok_or_else(|| {
            TetherError::Validation(format!("no pending acknowledgement for '{message_id}'"))
        })?;
        if !pending.recipient.includes(agent_id) || pending.sender_id == agent_id {
            return Err(TetherError::Validation(format!(
                "'{agent_id}' is not a recipient of '{message_id}'"
            )));
        }
        let ack = self.send_payload(
            agent_id,
            &Recipient::Agent(pending.sender_id.clone()),
            &Payload::Ack {
                message_id: message_id.into(),
            },
        )?;
        self.acks.remove(message_id)?;
        Ok(ack)
    }

    /// Outstanding acknowledgements, optionally only those `sender_id` awaits.
    pub fn pending_acks(&self, sender_id: Option<&str>) -> Result<Vec<PendingAck>> {
        Ok(self
            .acks
            .list()?
            .into_iter()
            .filter(|p| sender_id.is_none_or(|s| p.sender_id == s))
            .collect())
    }

    pub fn expire_acks(&self, now: DateTime<Utc>) -> Result<Vec<PendingAck>> {
        self.acks.expire(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::mux::MemoryMultiplexer;
    use crate::secret::SharedSecret;
    use tempfile::tempdir;

    fn context(config: CoordinationConfig) -> (tempfile::TempDir, Arc<CoordinationContext>) {
        let dir = tempdir().unwrap();
        let ctx = CoordinationContext::with_secret(
            dir.path(),
            config,
            SharedSecret::from_bytes(vec![9; 32]).unwrap(),
        )
        .unwrap();
        (dir, ctx)
    }

    fn service() -> (tempfile::TempDir, MessagingService) {
        let (dir, ctx) = context(CoordinationConfig::default());
        (dir, MessagingService::new(ctx).unwrap())
    }

    fn to(id: &str) -> Recipient {
        Recipient::Agent(id.into())
    }

    #[test]
    fn sent_message_is_signed_and_stored() {
        let (_dir, svc) = service();
        let msg = svc.send("agent-a", &to("agent-b"), MessageType::Text, "hi").unwrap();
        assert!(svc.verify(&msg));
        let stored = svc.log().read_all().unwrap();
        assert_eq!(stored, vec![msg]);
    }

    #[test]
    fn malformed_sender_is_rejected() {
        let (_dir, svc) = service();
        for sender in ["Agent", "", "root", "x"] {
            let err = svc.send(sender, &to("agent-b"), MessageType::Text, "hi").unwrap_err();
            assert!(matches!(err, TetherError::InvalidSender(_)), "{sender}: {err:?}");
        }
    }

    #[test]
    fn content_rules() {
        let (_dir, svc) = service();
        let send = |c: &str| svc.send("agent-a", &to("agent-b"), MessageType::Text, c);
        assert!(send("line one\nline two\tok\r\n").is_ok());
        assert!(matches!(send("   "), Err(TetherError::InvalidContent(_))));
        assert!(matches!(send("bell\u{7}"), Err(TetherError::InvalidContent(_))));
        assert!(matches!(send("esc\u{1b}[2J"), Err(TetherError::InvalidContent(_))));
        let big = "x".repeat(4097);
        assert!(matches!(send(&big), Err(TetherError::InvalidContent(_))));
    }

    #[test]
    fn structured_kinds_must_match_schema() {
        let (_dir, svc) = service();
        let err = svc
            .send("agent-a", &Recipient::Broadcast, MessageType::LockNotice, "free text")
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidContent(_)));
        let notice = svc.notify_lock("agent-a", "src/lib.rs", LockAction::Acquired).unwrap();
        assert_eq!(
            notice.payload().unwrap(),
            Payload::LockNotice {
                resource: "src/lib.rs".into(),
                action: LockAction::Acquired
            }
        );
    }

    #[test]
    fn rate_limit_reports_retry_after() {
        let mut config = CoordinationConfig::default();
        config.rate_limiting.messages_per_minute = 2;
        let (_dir, ctx) = context(config);
        let svc = MessagingService::new(ctx).unwrap();
        for _ in 0..2 {
            svc.send("agent-a", &to("agent-b"), MessageType::Text, "ping").unwrap();
        }
        match svc.send("agent-a", &to("agent-b"), MessageType::Text, "ping") {
            Err(TetherError::RateLimited { retry_after, .. }) => {
                assert!(retry_after.as_secs() <= 60 && retry_after.as_secs() >= 59);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // Other senders are unaffected.
        svc.send("agent-b", &to("agent-a"), MessageType::Text, "pong").unwrap();
    }

    #[test]
    fn inbox_filters_and_drops_forgeries() {
        let (_dir, svc) = service();
        svc.send("agent-a", &to("agent-b"), MessageType::Text, "direct").unwrap();
        svc.send("agent-a", &to("agent-c"), MessageType::Text, "not for b").unwrap();
        svc.send("agent-b", &Recipient::Broadcast, MessageType::Status, "own broadcast").unwrap();
        svc.send("agent-c", &Recipient::Broadcast, MessageType::Status, "all hands").unwrap();

        let mut forged = svc
            .send("agent-a", &to("agent-b"), MessageType::Text, "original")
            .unwrap();
        forged.id = uuid::Uuid::new_v4().to_string();
        forged.content = "rm -rf /".into();
        svc.log().append(&forged).unwrap();

        let (mail, cursor) = svc.inbox("agent-b", &LogCursor::default()).unwrap();
        let contents: Vec<_> = mail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["direct", "all hands", "original"]);

        let (again, _) = svc.inbox("agent-b", &cursor).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn read_new_advances_saved_cursor() {
        let (_dir, svc) = service();
        svc.send("agent-a", &to("agent-b"), MessageType::Text, "one").unwrap();
        assert_eq!(svc.read_new("agent-b").unwrap().len(), 1);
        assert!(svc.read_new("agent-b").unwrap().is_empty());
        svc.send("agent-a", &to("agent-b"), MessageType::Text, "two").unwrap();
        let fresh = svc.read_new("agent-b").unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].content, "two");
    }

    #[test]
    fn ack_round_trip_clears_pending() {
        let (_dir, svc) = service();
        let (msg, pending) = svc
            .send_with_ack("agent-a", &to("agent-b"), MessageType::Question, "ready?")
            .unwrap();
        assert!(msg.ack_requested);
        assert!(pending.expires_at > msg.timestamp);
        assert_eq!(svc.pending_acks(Some("agent-a")).unwrap().len(), 1);
        assert!(svc.pending_acks(Some("agent-c")).unwrap().is_empty());

        let err = svc.acknowledge("agent-c", &msg.id).unwrap_err();
        assert!(matches!(err, TetherError::Validation(_)));

        let ack = svc.acknowledge("agent-b", &msg.id).unwrap();
        assert_eq!(ack.kind, MessageType::Ack);
        assert_eq!(ack.recipient, to("agent-a"));
        assert_eq!(
            ack.payload().unwrap(),
            Payload::Ack {
                message_id: msg.id.clone()
            }
        );
        assert!(svc.pending_acks(None).unwrap().is_empty());
    }

    #[test]
    fn expire_acks_drops_overdue() {
        let (_dir, svc) = service();
        svc.send_with_ack("agent-a", &to("agent-b"), MessageType::Text, "x").unwrap();
        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(svc.expire_acks(later).unwrap().len(), 1);
        assert!(svc.pending_acks(None).unwrap().is_empty());
    }

    #[test]
    fn registry_gates_sender_and_recipient() {
        let (_dir, ctx) = context(CoordinationConfig::default());
        let mux = Arc::new(MemoryMultiplexer::new());
        let registry = Arc::new(AgentRegistry::new(ctx.clone(), mux));
        registry.register("agent-a", "%1").unwrap();
        let svc = MessagingService::new(ctx).unwrap().with_registry(registry.clone());

        let err = svc.send("agent-z", &to("agent-a"), MessageType::Text, "hi").unwrap_err();
        assert!(matches!(err, TetherError::InvalidSender(_)));
        let err = svc.send("agent-a", &to("agent-b"), MessageType::Text, "hi").unwrap_err();
        assert!(matches!(err, TetherError::AgentNotFound(_)));

        registry.register("agent-b", "%2").unwrap();
        svc.send("agent-a", &to("agent-b"), MessageType::Text, "hi").unwrap();
        svc.send("agent-a", &Recipient::Broadcast, MessageType::Text, "all").unwrap();
    }
}
