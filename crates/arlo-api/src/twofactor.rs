// Second-factor code sources
//
// When the credential exchange asks for a second factor, the service
// sends a one-time code out of band (email or SMS). A `TwoFactorSource`
// is polled for that code until it yields one or the total bound expires.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use regex::Regex;
use tracing::debug;

use crate::error::Error;

/// How the service delivers the one-time code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TwoFactorKind {
    #[default]
    Email,
    Sms,
}

impl TwoFactorKind {
    /// Factor type string the service uses.
    pub fn factor_type(self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }
}

/// Polling bounds for a second-factor challenge.
#[derive(Debug, Clone)]
pub struct TwoFactorSettings {
    pub kind: TwoFactorKind,
    /// Pause between polls of the source.
    pub retry_interval: Duration,
    /// Upper bound for the whole challenge.
    pub total_timeout: Duration,
}

impl Default for TwoFactorSettings {
    fn default() -> Self {
        Self {
            kind: TwoFactorKind::Email,
            retry_interval: Duration::from_secs(5),
            total_timeout: Duration::from_secs(120),
        }
    }
}

/// Somewhere a one-time code can be read from.
pub trait TwoFactorSource: Send + Sync {
    /// Check once for a code delivered after `since`.
    ///
    /// `Ok(None)` means "not yet"; the caller waits `retry_interval` and
    /// asks again.
    fn poll_code(&self, since: DateTime<Utc>) -> BoxFuture<'_, Result<Option<String>, Error>>;
}

/// Poll `source` until it yields a code or `settings.total_timeout` expires.
pub async fn obtain_code(
    source: &dyn TwoFactorSource,
    settings: &TwoFactorSettings,
    since: DateTime<Utc>,
) -> Result<String, Error> {
    let poll = async {
        loop {
            if let Some(code) = source.poll_code(since).await? {
                return Ok::<_, Error>(code);
            }
            debug!(
                retry_secs = settings.retry_interval.as_secs_f64(),
                "no two-factor code yet"
            );
            tokio::time::sleep(settings.retry_interval).await;
        }
    };

    tokio::time::timeout(settings.total_timeout, poll)
        .await
        .map_err(|_| Error::TwoFactorTimeout {
            waited_secs: settings.total_timeout.as_secs(),
        })?
}

// ── Console ─────────────────────────────────────────────────────────

/// Ask the operator to type the code on the terminal.
#[derive(Debug, Clone, Default)]
pub struct ConsoleTwoFactor;

impl TwoFactorSource for ConsoleTwoFactor {
    fn poll_code(&self, _since: DateTime<Utc>) -> BoxFuture<'_, Result<Option<String>, Error>> {
        Box::pin(async {
            let answer = tokio::task::spawn_blocking(|| {
                dialoguer::Input::<String>::new()
                    .with_prompt("Two-factor code")
                    .interact_text()
            })
            .await
            .map_err(|e| Error::TwoFactorUnavailable(format!("prompt task failed: {e}")))?
            .map_err(|e| Error::TwoFactorUnavailable(format!("prompt closed: {e}")))?;

            let code = answer.trim().to_owned();
            Ok((!code.is_empty()).then_some(code))
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// A message fetched from the operator's mailbox.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Read access to a mailbox the service delivers codes to.
///
/// The mail transport (IMAP, a provider API, a test fixture) is supplied
/// by the embedding application.
pub trait Mailbox: Send + Sync {
    fn fetch_since(&self, since: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<MailMessage>, Error>>;
}

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\b(\d{6})\b").unwrap()
});

/// Extract a six-digit code from a message body.
pub fn extract_code(body: &str) -> Option<String> {
    CODE_PATTERN
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Poll a [`Mailbox`] for the newest message carrying a code.
pub struct MailboxTwoFactor<M> {
    mailbox: M,
}

impl<M: Mailbox> MailboxTwoFactor<M> {
    pub fn new(mailbox: M) -> Self {
        Self { mailbox }
    }
}

impl<M: Mailbox> TwoFactorSource for MailboxTwoFactor<M> {
    fn poll_code(&self, since: DateTime<Utc>) -> BoxFuture<'_, Result<Option<String>, Error>> {
        Box::pin(async move {
            let mut messages = self.mailbox.fetch_since(since).await?;
            messages.retain(|m| m.received_at >= since);
            messages.sort_by_key(|m| std::cmp::Reverse(m.received_at));
            Ok(messages.iter().find_map(|m| extract_code(&m.body)))
        })
    }
}
