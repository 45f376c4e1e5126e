//! Testing utilities for stackweave workspace
//!
//! Shared fixtures and instrumented resource creators.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use stackweave_core::model::attr;
use stackweave_core::{
    ConfigValue, CreateError, CreateRequest, CreatedResource, DeploymentContext, Grant,
    ResourceCreator, ResourceDeclaration, ResourceId, ResourceKind, Simulator, TargetRef,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn context() -> DeploymentContext {
    DeploymentContext::new("test")
        .with_region("us-east-1")
        .with_account("123456789012")
}

/// Network N, cluster C on N, registry R, bucket B, topic T and function F
/// reading `T.arn` and `B.name`
pub fn scenario_a() -> Vec<ResourceDeclaration> {
    vec![
        ResourceDeclaration::new("N", ResourceKind::Network),
        ResourceDeclaration::new("C", ResourceKind::ComputeCluster).depends_on("N"),
        ResourceDeclaration::new("R", ResourceKind::ContainerRegistry),
        ResourceDeclaration::new("B", ResourceKind::ObjectStore),
        ResourceDeclaration::new("T", ResourceKind::Topic),
        function("F")
            .with("topic_arn", ConfigValue::reference("T", attr::ARN))
            .with("bucket_name", ConfigValue::reference("B", attr::NAME)),
    ]
}

/// Function declaration with a handler interface
pub fn function(id: &str) -> ResourceDeclaration {
    ResourceDeclaration::new(id, ResourceKind::Function).function(
        stackweave_core::FunctionInterface::new(
            "python3.9",
            "index.handler",
            format!("lambda/{id}"),
        ),
    )
}

/// Read-only grant on declared resources
pub fn read_grant(targets: &[&str]) -> Grant {
    Grant::new(
        ["s3:GetObject"],
        targets.iter().map(|t| TargetRef::resource(*t)),
    )
}

/// Simulator that rejects the configured ids
#[derive(Debug, Default)]
pub struct FailingCreator {
    inner: Simulator,
    fail: HashSet<ResourceId>,
    attempts: Mutex<Vec<ResourceId>>,
}

impl FailingCreator {
    pub fn failing<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceId>,
    {
        Self {
            inner: Simulator::new(),
            fail: ids.into_iter().map(Into::into).collect(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Every id a creation was attempted for
    pub fn attempts(&self) -> Vec<ResourceId> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl ResourceCreator for FailingCreator {
    async fn create(&self, request: CreateRequest<'_>) -> Result<CreatedResource, CreateError> {
        self.attempts.lock().push(request.id.clone());
        if self.fail.contains(request.id) {
            return Err(CreateError::Unavailable(format!(
                "simulated outage creating {}",
                request.id
            )));
        }
        self.inner.create(request).await
    }
}

/// Simulator that records how many creations overlap
#[derive(Debug)]
pub struct ConcurrencyGauge {
    inner: Simulator,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Simulator::new(),
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Highest number of creations in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceCreator for ConcurrencyGauge {
    async fn create(&self, request: CreateRequest<'_>) -> Result<CreatedResource, CreateError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.create(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
