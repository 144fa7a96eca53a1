//! Command Router: maps one inbound text message to exactly one action.
//!
//! `/start`, `/stop` and `/status` act on the sender's stored key. Any other text is
//! taken as the sender's API key, but only while that sender is awaiting one.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditEvent, AuditLogger},
    config::Config,
    domain::{ApiKey, ChatId, ControlAction},
    errors::Error,
    formatting::split_text_chunks,
    keys::parse_api_key,
    messaging::{port::MessagingPort, types::IncomingText},
    pending::PendingRegistrations,
    ports::{ControlApi, KeyStore},
    security::{is_authorized, RateDecision, RateLimiter},
    status::format_status,
};

pub const KEY_PROMPT: &str = "Enter your API key:";
pub const KEY_SAVED: &str = "API key saved. Use /start, /stop or /status.";
pub const CONTROL_FAILED: &str = "Control service request failed, try again later.";
pub const STATUS_UNREADABLE: &str = "Control service returned an unreadable status.";
pub const UNAUTHORIZED: &str = "Unauthorized. Contact the bot owner for access.";

/// Audit label for non-command text, which may be an API key.
const REDACTED: &str = "<redacted>";

/// Recognized bot commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
}

impl Command {
    /// Parse `/cmd`, `/cmd@botname` or `/cmd args`. Unknown commands yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.trim().split_whitespace().next()?;
        let name = first.strip_prefix('/')?.split('@').next()?.to_lowercase();
        match name.as_str() {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "status" => Some(Command::Status),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Status => "status",
        }
    }
}

/// Why a message could not be carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Store,
    Control,
    MalformedStatus,
    InvalidKey,
    Messaging,
}

impl From<&Error> for FailureKind {
    fn from(e: &Error) -> Self {
        match e {
            Error::Store(_) => FailureKind::Store,
            Error::MalformedResponse(_) | Error::Json(_) => FailureKind::MalformedStatus,
            Error::InvalidKey(_) => FailureKind::InvalidKey,
            Error::Messaging(_) => FailureKind::Messaging,
            _ => FailureKind::Control,
        }
    }
}

/// What the router did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Key prompt sent; sender is now awaiting a key.
    Prompted,
    /// `/start` from an unregistered sender that was already prompted.
    AlreadyPending,
    Registered,
    Started,
    Stopped,
    StatusSent,
    /// `/stop` or `/status` from a sender with no stored key.
    NotRegistered,
    Ignored,
    RateLimited,
    Unauthorized,
    Failed(FailureKind),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Prompted => "prompted",
            Outcome::AlreadyPending => "already_pending",
            Outcome::Registered => "registered",
            Outcome::Started => "started",
            Outcome::Stopped => "stopped",
            Outcome::StatusSent => "status_sent",
            Outcome::NotRegistered => "not_registered",
            Outcome::Ignored => "ignored",
            Outcome::RateLimited => "rate_limited",
            Outcome::Unauthorized => "unauthorized",
            Outcome::Failed(FailureKind::Store) => "failed_store",
            Outcome::Failed(FailureKind::Control) => "failed_control",
            Outcome::Failed(FailureKind::MalformedStatus) => "failed_malformed_status",
            Outcome::Failed(FailureKind::InvalidKey) => "failed_invalid_key",
            Outcome::Failed(FailureKind::Messaging) => "failed_messaging",
        }
    }
}

/// Router tunables, usually derived from [`Config`].
#[derive(Clone, Debug)]
pub struct RouterOptions {
    pub allowed_users: Vec<i64>,
    pub pending_key_ttl: Duration,
    pub message_limit: usize,
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub audit: Option<AuditLogger>,
}

impl RouterOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            allowed_users: cfg.telegram_allowed_users.clone(),
            pending_key_ttl: cfg.pending_key_ttl,
            message_limit: cfg.telegram_safe_limit,
            rate_limit_enabled: cfg.rate_limit_enabled,
            rate_limit_requests: cfg.rate_limit_requests,
            rate_limit_window: cfg.rate_limit_window,
            audit: Some(AuditLogger::new(
                cfg.audit_log_path.clone(),
                cfg.audit_log_json,
            )),
        }
    }
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            allowed_users: Vec::new(),
            pending_key_ttl: Duration::from_secs(300),
            message_limit: 4000,
            rate_limit_enabled: false,
            rate_limit_requests: 20,
            rate_limit_window: Duration::from_secs(60),
            audit: None,
        }
    }
}

pub struct CommandRouter {
    store: Arc<dyn KeyStore>,
    control: Arc<dyn ControlApi>,
    messenger: Arc<dyn MessagingPort>,
    pending: PendingRegistrations,
    rate_limiter: Mutex<RateLimiter>,
    allowed_users: Vec<i64>,
    message_limit: usize,
    audit: Option<AuditLogger>,
}

impl CommandRouter {
    pub fn new(
        store: Arc<dyn KeyStore>,
        control: Arc<dyn ControlApi>,
        messenger: Arc<dyn MessagingPort>,
        opts: RouterOptions,
    ) -> Self {
        let max_len = messenger.capabilities().max_message_len;
        Self {
            store,
            control,
            messenger,
            pending: PendingRegistrations::new(opts.pending_key_ttl),
            rate_limiter: Mutex::new(RateLimiter::new(
                opts.rate_limit_enabled,
                opts.rate_limit_requests,
                opts.rate_limit_window,
            )),
            allowed_users: opts.allowed_users,
            message_limit: opts.message_limit.clamp(1, max_len.max(1)),
            audit: opts.audit,
        }
    }

    pub fn pending(&self) -> &PendingRegistrations {
        &self.pending
    }

    /// Drop expired pending registrations and rate-limit buckets that have refilled.
    /// Returns `(pending, buckets)` removed.
    pub async fn sweep(&self, now: Instant) -> (usize, usize) {
        let pending = self.pending.purge_expired(now).await;
        let buckets = self.rate_limiter.lock().await.purge_idle(now);
        (pending, buckets)
    }

    /// Handle one inbound message. Never fails: every failure is classified in the
    /// returned [`Outcome`].
    pub async fn handle(&self, msg: &IncomingText) -> Outcome {
        self.handle_at(msg, Instant::now()).await
    }

    pub async fn handle_at(&self, msg: &IncomingText, now: Instant) -> Outcome {
        let command = Command::parse(&msg.text);
        let label = command.map(Command::as_str).unwrap_or(REDACTED);

        let outcome = self.dispatch(msg, command, now).await;
        debug!(
            user_id = msg.user_id.0,
            command = label,
            outcome = outcome.as_str(),
            "message handled"
        );
        self.audit(AuditEvent::command(
            msg.user_id.0,
            msg.username_or_unknown(),
            label,
            outcome.as_str(),
        ));
        outcome
    }

    async fn dispatch(&self, msg: &IncomingText, command: Option<Command>, now: Instant) -> Outcome {
        // Plain chatter from a sender that is not registering never touches the store.
        if command.is_none() && !self.pending.is_pending(msg.user_id, now).await {
            return Outcome::Ignored;
        }

        if !is_authorized(msg.user_id, &self.allowed_users) {
            warn!(user_id = msg.user_id.0, "unauthorized sender");
            let _ = self.reply(msg, UNAUTHORIZED).await;
            return Outcome::Unauthorized;
        }

        let decision = self.rate_limiter.lock().await.check_at(msg.user_id, now);
        if let RateDecision::Limited { retry_after } = decision {
            let secs = retry_after.as_secs_f64();
            self.audit(AuditEvent::rate_limit(
                msg.user_id.0,
                msg.username_or_unknown(),
                secs,
            ));
            let _ = self
                .reply(
                    msg,
                    &format!("Too many requests. Try again in {:.0}s.", secs.ceil()),
                )
                .await;
            return Outcome::RateLimited;
        }

        match command {
            Some(Command::Start) => self.start(msg, now).await,
            Some(Command::Stop) => self.stop(msg).await,
            Some(Command::Status) => self.status(msg).await,
            None => self.register(msg).await,
        }
    }

    async fn start(&self, msg: &IncomingText, now: Instant) -> Outcome {
        let key = match self.lookup(msg, "start").await {
            Ok(k) => k,
            Err(outcome) => return outcome,
        };

        if let Some(key) = key {
            return self
                .trigger(msg, &key, ControlAction::Start, Outcome::Started)
                .await;
        }

        if !self.pending.begin(msg.user_id, now).await {
            return Outcome::AlreadyPending;
        }

        match self.reply(msg, KEY_PROMPT).await {
            Ok(()) => {
                info!(user_id = msg.user_id.0, "awaiting api key");
                Outcome::Prompted
            }
            Err(_) => {
                // The sender never saw the prompt; don't capture their next message.
                self.pending.complete(msg.user_id).await;
                Outcome::Failed(FailureKind::Messaging)
            }
        }
    }

    async fn stop(&self, msg: &IncomingText) -> Outcome {
        match self.lookup(msg, "stop").await {
            Ok(Some(key)) => {
                self.trigger(msg, &key, ControlAction::Stop, Outcome::Stopped)
                    .await
            }
            Ok(None) => Outcome::NotRegistered,
            Err(outcome) => outcome,
        }
    }

    async fn status(&self, msg: &IncomingText) -> Outcome {
        let key = match self.lookup(msg, "status").await {
            Ok(Some(key)) => key,
            Ok(None) => return Outcome::NotRegistered,
            Err(outcome) => return outcome,
        };

        let record = match self.control.status(&key).await {
            Ok(v) => v,
            Err(e) => {
                let kind = FailureKind::from(&e);
                warn!(user_id = msg.user_id.0, error = %e, "status request failed");
                self.audit_error(msg, "status", &e);
                let text = if kind == FailureKind::MalformedStatus {
                    STATUS_UNREADABLE
                } else {
                    CONTROL_FAILED
                };
                let _ = self.reply(msg, text).await;
                return Outcome::Failed(kind);
            }
        };

        let text = format_status(&record);
        for chunk in split_text_chunks(&text, self.message_limit) {
            if self.reply(msg, &chunk).await.is_err() {
                return Outcome::Failed(FailureKind::Messaging);
            }
        }
        Outcome::StatusSent
    }

    async fn register(&self, msg: &IncomingText) -> Outcome {
        let key = match parse_api_key(&msg.text) {
            Ok(k) => k,
            Err(e) => {
                // Sender stays pending so they can send a corrected key.
                let _ = self
                    .reply(msg, &format!("That doesn't look like an API key: {}", reason(&e)))
                    .await;
                return Outcome::Failed(FailureKind::InvalidKey);
            }
        };

        if let Err(e) = self.store.upsert_key(msg.user_id, &key).await {
            error!(user_id = msg.user_id.0, error = %e, "failed to store api key");
            self.audit_error(msg, REDACTED, &e);
            return Outcome::Failed(FailureKind::Store);
        }

        self.pending.complete(msg.user_id).await;
        info!(user_id = msg.user_id.0, "api key registered");
        let _ = self.reply(msg, KEY_SAVED).await;
        Outcome::Registered
    }

    async fn lookup(
        &self,
        msg: &IncomingText,
        command: &str,
    ) -> std::result::Result<Option<ApiKey>, Outcome> {
        self.store.find_key(msg.user_id).await.map_err(|e| {
            error!(user_id = msg.user_id.0, error = %e, "key lookup failed");
            self.audit_error(msg, command, &e);
            Outcome::Failed(FailureKind::Store)
        })
    }

    async fn trigger(
        &self,
        msg: &IncomingText,
        key: &ApiKey,
        action: ControlAction,
        ok: Outcome,
    ) -> Outcome {
        match self.control.trigger(key, action).await {
            Ok(()) => {
                info!(user_id = msg.user_id.0, action = action.as_path(), "control action sent");
                ok
            }
            Err(e) => {
                warn!(
                    user_id = msg.user_id.0,
                    action = action.as_path(),
                    error = %e,
                    "control action failed"
                );
                self.audit_error(msg, action.as_path(), &e);
                let _ = self.reply(msg, CONTROL_FAILED).await;
                Outcome::Failed(FailureKind::from(&e))
            }
        }
    }

    /// Replies go to the sender's private chat.
    async fn reply(&self, msg: &IncomingText, text: &str) -> crate::Result<()> {
        let chat_id = ChatId(msg.user_id.0);
        self.messenger.send_text(chat_id, text).await.map_err(|e| {
            warn!(user_id = msg.user_id.0, error = %e, "failed to send reply");
            e
        })
    }

    fn audit(&self, event: AuditEvent) {
        let Some(audit) = &self.audit else {
            return;
        };
        if let Err(e) = audit.write(event) {
            warn!(path = %audit.path().display(), error = %e, "audit write failed");
        }
    }

    fn audit_error(&self, msg: &IncomingText, command: &str, e: &Error) {
        self.audit(AuditEvent::error(
            msg.user_id.0,
            msg.username_or_unknown(),
            command,
            &e.to_string(),
        ));
    }
}

fn reason(e: &Error) -> String {
    match e {
        Error::InvalidKey(r) => r.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        domain::UserId,
        keys::action_url,
        messaging::types::MessagingCapabilities,
        status::StatusRecord,
        Result,
    };

    const BASE: &str = "http://control.test";

    #[derive(Default)]
    struct FakeStore {
        keys: StdMutex<HashMap<i64, String>>,
        ops: AtomicUsize,
        fail: bool,
    }

    impl FakeStore {
        fn with(user: i64, key: &str) -> Self {
            let s = Self::default();
            s.keys.lock().unwrap().insert(user, key.to_string());
            s
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn key(&self, user: i64) -> Option<String> {
            self.keys.lock().unwrap().get(&user).cloned()
        }
    }

    #[async_trait]
    impl KeyStore for FakeStore {
        async fn find_key(&self, user_id: UserId) -> Result<Option<ApiKey>> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Store("connection refused".to_string()));
            }
            Ok(self.key(user_id.0).map(ApiKey::new))
        }

        async fn upsert_key(&self, user_id: UserId, api_key: &ApiKey) -> Result<()> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Store("connection refused".to_string()));
            }
            self.keys
                .lock()
                .unwrap()
                .insert(user_id.0, api_key.as_str().to_string());
            Ok(())
        }
    }

    enum StatusReply {
        Body(StatusRecord),
        Malformed,
        Down,
    }

    struct FakeControl {
        calls: StdMutex<Vec<(&'static str, String)>>,
        status: StatusReply,
        down: bool,
    }

    impl FakeControl {
        fn ok() -> Self {
            Self::with_body(r#"{"a": 1, "b": 2}"#)
        }

        fn with_body(json: &str) -> Self {
            Self::with_status(StatusReply::Body(StatusRecord::from_json(json).unwrap()))
        }

        fn with_status(status: StatusReply) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                status,
                down: false,
            }
        }

        fn down() -> Self {
            Self {
                down: true,
                ..Self::with_status(StatusReply::Down)
            }
        }

        fn calls(&self) -> Vec<(&'static str, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlApi for FakeControl {
        async fn trigger(&self, api_key: &ApiKey, action: ControlAction) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(("POST", action_url(BASE, api_key, action)));
            if self.down {
                return Err(Error::Control("connection refused".to_string()));
            }
            Ok(())
        }

        async fn status(&self, api_key: &ApiKey) -> Result<StatusRecord> {
            self.calls
                .lock()
                .unwrap()
                .push(("GET", action_url(BASE, api_key, ControlAction::Data)));
            match &self.status {
                StatusReply::Body(v) => Ok(v.clone()),
                StatusReply::Malformed => {
                    Err(Error::MalformedResponse("expected value".to_string()))
                }
                StatusReply::Down => Err(Error::Control("503 Service Unavailable".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        sent: StdMutex<Vec<(i64, String)>>,
        attempts: AtomicUsize,
        down: AtomicBool,
    }

    impl FakeMessenger {
        fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                max_message_len: 4096,
            }
        }

        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::Messaging("Forbidden: bot was blocked by the user".to_string()));
            }
            self.sent.lock().unwrap().push((chat_id.0, text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<FakeStore>,
        control: Arc<FakeControl>,
        messenger: Arc<FakeMessenger>,
        router: CommandRouter,
    }

    fn harness(store: FakeStore, control: FakeControl, opts: RouterOptions) -> Harness {
        let store = Arc::new(store);
        let control = Arc::new(control);
        let messenger = Arc::new(FakeMessenger::default());
        let router = CommandRouter::new(store.clone(), control.clone(), messenger.clone(), opts);
        Harness {
            store,
            control,
            messenger,
            router,
        }
    }

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        std::env::temp_dir().join(format!("{prefix}-{pid}-{ts}.log"))
    }

    fn text(user: i64, text: &str) -> IncomingText {
        IncomingText {
            chat_id: ChatId(user),
            user_id: UserId(user),
            username: Some(format!("user{user}")),
            text: text.to_string(),
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("  /stop  "), Some(Command::Stop));
        assert_eq!(Command::parse("/status@cw_bot"), Some(Command::Status));
        assert_eq!(Command::parse("/START"), Some(Command::Start));
        assert_eq!(Command::parse("/start deep-link"), Some(Command::Start));
        assert_eq!(Command::parse("/help"), None);
        assert_eq!(Command::parse("start"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[tokio::test]
    async fn start_without_binding_prompts_once() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());

        assert_eq!(h.router.handle(&text(1, "/start")).await, Outcome::Prompted);
        assert!(h.router.pending().is_pending(UserId(1), Instant::now()).await);
        assert_eq!(
            h.router.handle(&text(1, "/start")).await,
            Outcome::AlreadyPending
        );

        assert!(h.control.calls().is_empty());
        assert_eq!(h.messenger.sent(), vec![(1, KEY_PROMPT.to_string())]);
    }

    #[tokio::test]
    async fn pending_sender_registers_key() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());

        h.router.handle(&text(1, "/start")).await;
        assert_eq!(h.router.handle(&text(1, "K")).await, Outcome::Registered);

        assert_eq!(h.store.key(1).as_deref(), Some("K"));
        assert!(!h.router.pending().is_pending(UserId(1), Instant::now()).await);
        assert!(h.control.calls().is_empty());

        // Flag cleared: further chatter is ignored.
        assert_eq!(h.router.handle(&text(1, "hello")).await, Outcome::Ignored);
        assert_eq!(h.store.key(1).as_deref(), Some("K"));
    }

    #[tokio::test]
    async fn re_registration_replaces_key() {
        let h = harness(
            FakeStore::with(1, "OLD"),
            FakeControl::ok(),
            RouterOptions::default(),
        );

        // Bound senders go straight to the control service on /start.
        assert_eq!(h.router.handle(&text(1, "/start")).await, Outcome::Started);
        h.router.pending().begin(UserId(1), Instant::now()).await;
        assert_eq!(h.router.handle(&text(1, "NEW")).await, Outcome::Registered);
        assert_eq!(h.store.key(1).as_deref(), Some("NEW"));
    }

    #[tokio::test]
    async fn start_with_binding_posts_start_without_reply() {
        let h = harness(FakeStore::with(1, "K"), FakeControl::ok(), RouterOptions::default());

        assert_eq!(h.router.handle(&text(1, "/start")).await, Outcome::Started);
        assert_eq!(
            h.control.calls(),
            vec![("POST", format!("{BASE}/api/key/K/action/start"))]
        );
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn stop_with_binding_posts_stop() {
        let h = harness(FakeStore::with(1, "K"), FakeControl::ok(), RouterOptions::default());

        assert_eq!(h.router.handle(&text(1, "/stop")).await, Outcome::Stopped);
        assert_eq!(
            h.control.calls(),
            vec![("POST", format!("{BASE}/api/key/K/action/stop"))]
        );
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn stop_and_status_without_binding_do_nothing() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());

        assert_eq!(h.router.handle(&text(1, "/stop")).await, Outcome::NotRegistered);
        assert_eq!(
            h.router.handle(&text(1, "/status")).await,
            Outcome::NotRegistered
        );
        assert!(h.control.calls().is_empty());
        assert!(h.messenger.sent().is_empty());
        assert!(!h.router.pending().is_pending(UserId(1), Instant::now()).await);
    }

    #[tokio::test]
    async fn status_sends_reformatted_record_each_time() {
        let h = harness(FakeStore::with(1, "K"), FakeControl::ok(), RouterOptions::default());

        assert_eq!(h.router.handle(&text(1, "/status")).await, Outcome::StatusSent);
        assert_eq!(h.router.handle(&text(1, "/status")).await, Outcome::StatusSent);

        let expected = "{'a': 1\n 'b': 2}".to_string();
        assert_eq!(
            h.messenger.sent(),
            vec![(1, expected.clone()), (1, expected)]
        );
        let get = ("GET", format!("{BASE}/api/key/K/action/data"));
        assert_eq!(h.control.calls(), vec![get.clone(), get]);
    }

    #[tokio::test]
    async fn long_status_is_split() {
        let long = "x".repeat(30);
        let h = harness(
            FakeStore::with(1, "K"),
            FakeControl::with_body(&format!(r#"{{"a": "{long}", "b": "{long}"}}"#)),
            RouterOptions {
                message_limit: 40,
                ..RouterOptions::default()
            },
        );

        assert_eq!(h.router.handle(&text(1, "/status")).await, Outcome::StatusSent);
        let sent = h.messenger.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, t)| t.len() <= 40));
        let joined: String = sent.into_iter().map(|(_, t)| t).collect();
        assert_eq!(joined, format!("{{'a': '{long}'\n 'b': '{long}'}}"));
    }

    #[tokio::test]
    async fn unknown_command_without_pending_is_ignored() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());

        assert_eq!(h.router.handle(&text(1, "/help")).await, Outcome::Ignored);
        assert_eq!(h.router.handle(&text(1, "hello")).await, Outcome::Ignored);
        assert_eq!(h.store.ops.load(Ordering::SeqCst), 0);
        assert!(h.control.calls().is_empty());
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn other_senders_text_is_not_captured() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());

        h.router.handle(&text(1, "/start")).await;
        assert_eq!(h.router.handle(&text(2, "B-KEY")).await, Outcome::Ignored);
        assert_eq!(h.store.key(2), None);
        assert_eq!(h.store.key(1), None);

        assert_eq!(h.router.handle(&text(1, "A-KEY")).await, Outcome::Registered);
        assert_eq!(h.store.key(1).as_deref(), Some("A-KEY"));
    }

    #[tokio::test]
    async fn invalid_key_keeps_sender_pending() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());

        h.router.handle(&text(1, "/start")).await;
        assert_eq!(
            h.router.handle(&text(1, "/help")).await,
            Outcome::Failed(FailureKind::InvalidKey)
        );
        assert!(h.router.pending().is_pending(UserId(1), Instant::now()).await);
        assert_eq!(h.store.key(1), None);
        assert_eq!(h.messenger.sent().len(), 2);

        assert_eq!(h.router.handle(&text(1, "good-key")).await, Outcome::Registered);
    }

    #[tokio::test]
    async fn pending_expires() {
        let h = harness(
            FakeStore::default(),
            FakeControl::ok(),
            RouterOptions {
                pending_key_ttl: Duration::from_secs(10),
                ..RouterOptions::default()
            },
        );
        let t0 = Instant::now();
        assert_eq!(h.router.handle_at(&text(1, "/start"), t0).await, Outcome::Prompted);
        assert_eq!(
            h.router
                .handle_at(&text(1, "K"), t0 + Duration::from_secs(11))
                .await,
            Outcome::Ignored
        );
        assert_eq!(h.store.key(1), None);
    }

    #[tokio::test]
    async fn store_failure_is_silent() {
        let h = harness(FakeStore::failing(), FakeControl::ok(), RouterOptions::default());

        assert_eq!(
            h.router.handle(&text(1, "/start")).await,
            Outcome::Failed(FailureKind::Store)
        );
        assert!(h.messenger.sent().is_empty());
        assert!(h.control.calls().is_empty());
        assert!(!h.router.pending().is_pending(UserId(1), Instant::now()).await);
    }

    #[tokio::test]
    async fn control_failure_is_acknowledged() {
        let h = harness(FakeStore::with(1, "K"), FakeControl::down(), RouterOptions::default());

        assert_eq!(
            h.router.handle(&text(1, "/stop")).await,
            Outcome::Failed(FailureKind::Control)
        );
        assert_eq!(h.messenger.sent(), vec![(1, CONTROL_FAILED.to_string())]);

        assert_eq!(
            h.router.handle(&text(1, "/status")).await,
            Outcome::Failed(FailureKind::Control)
        );
        assert_eq!(h.messenger.sent().len(), 2);
    }

    #[tokio::test]
    async fn malformed_status_is_reported() {
        let h = harness(
            FakeStore::with(1, "K"),
            FakeControl::with_status(StatusReply::Malformed),
            RouterOptions::default(),
        );

        assert_eq!(
            h.router.handle(&text(1, "/status")).await,
            Outcome::Failed(FailureKind::MalformedStatus)
        );
        assert_eq!(h.messenger.sent(), vec![(1, STATUS_UNREADABLE.to_string())]);
    }

    #[tokio::test]
    async fn unauthorized_sender_is_rejected() {
        let h = harness(
            FakeStore::with(2, "K"),
            FakeControl::ok(),
            RouterOptions {
                allowed_users: vec![1],
                ..RouterOptions::default()
            },
        );

        assert_eq!(h.router.handle(&text(2, "/start")).await, Outcome::Unauthorized);
        assert_eq!(h.store.ops.load(Ordering::SeqCst), 0);
        assert!(h.control.calls().is_empty());
        assert_eq!(h.messenger.sent(), vec![(2, UNAUTHORIZED.to_string())]);
    }

    #[tokio::test]
    async fn rate_limit_blocks_before_control_call() {
        let h = harness(
            FakeStore::with(1, "K"),
            FakeControl::ok(),
            RouterOptions {
                rate_limit_enabled: true,
                rate_limit_requests: 1,
                rate_limit_window: Duration::from_secs(60),
                ..RouterOptions::default()
            },
        );
        let now = Instant::now();

        assert_eq!(h.router.handle_at(&text(1, "/stop"), now).await, Outcome::Stopped);
        assert_eq!(
            h.router.handle_at(&text(1, "/stop"), now).await,
            Outcome::RateLimited
        );
        assert_eq!(h.control.calls().len(), 1);
        assert_eq!(h.messenger.sent().len(), 1);
    }

    #[tokio::test]
    async fn undelivered_prompt_leaves_sender_unregistered() {
        let h = harness(FakeStore::default(), FakeControl::ok(), RouterOptions::default());
        h.messenger.set_down(true);

        assert_eq!(
            h.router.handle(&text(1, "/start")).await,
            Outcome::Failed(FailureKind::Messaging)
        );
        assert!(!h.router.pending().is_pending(UserId(1), Instant::now()).await);

        // The next text is chatter, not a key.
        assert_eq!(h.router.handle(&text(1, "K")).await, Outcome::Ignored);
        assert_eq!(h.store.key(1), None);

        // Once delivery works again the sender is prompted afresh.
        h.messenger.set_down(false);
        assert_eq!(h.router.handle(&text(1, "/start")).await, Outcome::Prompted);
        assert_eq!(h.messenger.sent(), vec![(1, KEY_PROMPT.to_string())]);
    }

    #[tokio::test]
    async fn undelivered_status_is_a_messaging_failure() {
        let h = harness(
            FakeStore::with(1, "K"),
            FakeControl::with_body(&format!(r#"{{"a": "{0}", "b": "{0}"}}"#, "x".repeat(30))),
            RouterOptions {
                message_limit: 40,
                ..RouterOptions::default()
            },
        );
        h.messenger.set_down(true);

        assert_eq!(
            h.router.handle(&text(1, "/status")).await,
            Outcome::Failed(FailureKind::Messaging)
        );
        assert_eq!(h.control.calls().len(), 1);
        // Stops at the first undelivered chunk.
        assert_eq!(h.messenger.attempts.load(Ordering::SeqCst), 1);
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn audit_log_records_every_message_without_keys() {
        let path = tmp_file("crb-router-audit");
        let h = harness(
            FakeStore::default(),
            FakeControl::ok(),
            RouterOptions {
                audit: Some(AuditLogger::new(path.clone(), true)),
                ..RouterOptions::default()
            },
        );

        h.router.handle(&text(1, "/start")).await;
        h.router.handle(&text(2, "chatter")).await;
        h.router.handle(&text(1, "SECRET-KEY-123")).await;
        h.router.handle(&text(1, "/status")).await;

        let written = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(!written.contains("SECRET-KEY-123"));
        assert!(!written.contains("chatter"));

        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let rows: Vec<(i64, &str, &str)> = lines
            .iter()
            .map(|v| {
                (
                    v["user_id"].as_i64().unwrap(),
                    v["command"].as_str().unwrap(),
                    v["outcome"].as_str().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            rows,
            vec![
                (1, "start", "prompted"),
                (2, "<redacted>", "ignored"),
                (1, "<redacted>", "registered"),
                (1, "status", "status_sent"),
            ]
        );
        assert!(lines.iter().all(|v| v["event"] == "command"));
        assert_eq!(lines[1]["username"], "user2");
    }

    #[tokio::test]
    async fn failed_registration_audit_hides_key() {
        let path = tmp_file("crb-router-audit-fail");
        let store = FakeStore::failing();
        let h = harness(
            store,
            FakeControl::ok(),
            RouterOptions {
                audit: Some(AuditLogger::new(path.clone(), false)),
                ..RouterOptions::default()
            },
        );
        h.router.pending().begin(UserId(1), Instant::now()).await;

        assert_eq!(
            h.router.handle(&text(1, "SECRET-KEY-123")).await,
            Outcome::Failed(FailureKind::Store)
        );

        let written = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(!written.contains("SECRET-KEY-123"));
        assert!(written.contains("event: error"));
        assert!(written.contains("command: <redacted>"));
        assert!(written.contains("outcome: failed_store"));
    }

    #[tokio::test]
    async fn sweep_drops_expired_state() {
        let h = harness(
            FakeStore::with(2, "K"),
            FakeControl::ok(),
            RouterOptions {
                pending_key_ttl: Duration::from_secs(10),
                rate_limit_enabled: true,
                rate_limit_requests: 5,
                rate_limit_window: Duration::from_secs(60),
                ..RouterOptions::default()
            },
        );
        let t0 = Instant::now();
        h.router.handle_at(&text(1, "/start"), t0).await;
        h.router.handle_at(&text(2, "/stop"), t0).await;

        assert_eq!(h.router.sweep(t0).await, (0, 0));
        assert_eq!(h.router.sweep(t0 + Duration::from_secs(120)).await, (1, 2));
    }
}
