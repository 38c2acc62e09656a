//! Notification dispatch contract. The engine only spawns and awaits
//! delivery through this trait (spec §4.4, §6); the actual channel
//! bodies (webhook, email, push) are out of scope for the core.

use anyhow::Result;
use futures::{FutureExt, future::BoxFuture};
use tracing::info;

use crate::model::RuleViolation;

pub trait Notifier: Send + Sync {
    fn notify(&self, channel_id: i64, violation: &RuleViolation) -> BoxFuture<'_, Result<()>>;
}

/// Default notifier: logs instead of delivering anywhere. Real channel
/// bodies are an external collaborator per spec §1/§6.
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn notify(&self, channel_id: i64, violation: &RuleViolation) -> BoxFuture<'_, Result<()>> {
        let violation = violation.clone();
        async move {
            info!(
                channel_id,
                user = %violation.user,
                severity = ?violation.severity,
                confidence = violation.confidence,
                "{}",
                violation.message
            );
            Ok(())
        }
        .boxed()
    }
}
