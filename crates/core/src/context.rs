//! Per-operation identity and request scoping.

use crate::role::DbRole;
use crate::{Error, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Source name recorded when a call arrives without an operation context.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Identity, role and correlation ids for one logical storage operation.
///
/// Built once per operation and enriched with the `with_*` methods before
/// first use. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationContext {
    pub operation_id: Uuid,
    pub job_id: Option<Uuid>,
    pub role: DbRole,
    pub source: String,
    pub actor: String,
    pub start_time: OffsetDateTime,
    pub metadata: BTreeMap<String, String>,
}

impl OperationContext {
    /// Create a context for `role`, attributed to the component `source`.
    pub fn new(role: DbRole, source: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            job_id: None,
            role,
            source: source.into(),
            actor: String::new(),
            start_time: OffsetDateTime::now_utc(),
            metadata: BTreeMap::new(),
        }
    }

    /// Least-privileged context used when a caller supplied none.
    pub fn fallback() -> Self {
        Self::new(DbRole::ReadOnly, UNKNOWN_SOURCE)
    }

    /// Context attached to `ctx`, or [`OperationContext::fallback`].
    pub fn from_request(ctx: &RequestContext) -> Cow<'_, OperationContext> {
        match ctx.operation() {
            Some(op) => Cow::Borrowed(op),
            None => Cow::Owned(Self::fallback()),
        }
    }

    pub fn with_operation_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = operation_id;
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parse `role` and build a context, rejecting unknown role names.
    pub fn parse(role: &str, source: impl Into<String>) -> Result<Self> {
        Ok(Self::new(role.parse()?, source))
    }

    /// Time elapsed since the context was created.
    pub fn elapsed(&self) -> Duration {
        let elapsed = OffsetDateTime::now_utc() - self.start_time;
        elapsed.try_into().unwrap_or(Duration::ZERO)
    }

    /// Single-line SQL comment for tagging statements issued on behalf of
    /// this operation. Carries no security function.
    pub fn query_comment(&self) -> String {
        let job = self
            .job_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "/* op={} job={} role={} src={} actor={} */",
            self.operation_id,
            job,
            self.role,
            comment_safe(&self.source),
            comment_safe(&self.actor),
        )
    }
}

fn is_comment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':')
}

/// Keep free-form values from closing the comment or breaking the line.
fn comment_safe(value: &str) -> Cow<'_, str> {
    if value.is_empty() {
        Cow::Borrowed("-")
    } else if value.chars().all(is_comment_char) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(
            value
                .chars()
                .map(|c| if is_comment_char(c) { c } else { '_' })
                .collect(),
        )
    }
}

/// Cancellable, deadline-aware scope for a single request.
///
/// Storage calls take a `RequestContext` and race their work against it with
/// [`RequestContext::run`]. Cancelling drops the in-flight future, so any
/// open transaction is released through its normal drop path.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    operation: Option<Arc<OperationContext>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with no operation attached, no deadline and a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context carrying `op`.
    pub fn for_operation(op: OperationContext) -> Self {
        Self::new().with_operation(op)
    }

    pub fn with_operation(mut self, op: OperationContext) -> Self {
        self.operation = Some(Arc::new(op));
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context whose cancellation follows this one.
    pub fn child(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn operation(&self) -> Option<&OperationContext> {
        self.operation.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
