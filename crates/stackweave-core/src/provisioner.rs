//! Topological Provisioner
//!
//! Walks a validated [`DependencyGraph`] and creates every declaration
//! through a [`ResourceCreator`]:
//! 1. resolve the declaration's config against the provisioned set
//! 2. create the resource
//! 3. publish its attributes
//!
//! A failure halts the run. Everything published before it is returned in the
//! failure's checkpoint; nothing is rolled back.

use crate::context::DeploymentContext;
use crate::creator::{CreateRequest, ResourceCreator};
use crate::error::{ProvisionCause, ProvisionFailure};
use crate::graph::DependencyGraph;
use crate::model::{attr, ResourceDeclaration, ResourceId};
use crate::resolver::resolve;
use crate::state::{Checkpoint, ProvisionedResource, ProvisionedSet};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Provisioning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOptions {
    /// Upper bound on concurrent creations within one wave; `1` walks the
    /// provisioning order sequentially
    pub max_parallel: usize,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self { max_parallel: 1 }
    }
}

impl ProvisionOptions {
    #[inline]
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

/// Result of a successful run
#[derive(Debug)]
pub struct ProvisionReport {
    pub provisioned: ProvisionedSet,
    /// Ids created by this run, in publish order
    pub created: Vec<ResourceId>,
    /// Ids taken from the input checkpoint
    pub skipped: Vec<ResourceId>,
    pub elapsed_ms: u64,
}

impl ProvisionReport {
    /// Snapshot for persisting between runs
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.provisioned.snapshot()
    }
}

/// Creates a graph's resources in dependency order
pub struct Provisioner {
    creator: Arc<dyn ResourceCreator>,
    context: DeploymentContext,
    options: ProvisionOptions,
}

impl Provisioner {
    #[must_use]
    pub fn new(creator: Arc<dyn ResourceCreator>, context: DeploymentContext) -> Self {
        Self {
            creator,
            context,
            options: ProvisionOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ProvisionOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn context(&self) -> &DeploymentContext {
        &self.context
    }

    /// Provision every declaration of `graph` not already in `checkpoint`
    ///
    /// # Errors
    /// `ProvisionFailure` naming the first resource that failed, with a
    /// checkpoint of everything published so far.
    pub async fn provision(
        &self,
        graph: &DependencyGraph,
        checkpoint: Checkpoint,
    ) -> Result<ProvisionReport, ProvisionFailure> {
        let start = Instant::now();
        let provisioned = ProvisionedSet::new();
        let skipped = Self::seed(graph, &checkpoint, &provisioned)?;
        let mut created = Vec::new();

        tracing::info!(
            "Provisioning {} resources ({} from checkpoint, max_parallel={})",
            graph.len(),
            skipped.len(),
            self.options.max_parallel
        );

        if self.options.max_parallel <= 1 {
            for decl in graph.provisioning_order() {
                if provisioned.contains(decl.id.as_str()) {
                    continue;
                }
                let resource = self
                    .create_one(decl, &provisioned)
                    .await
                    .map_err(|cause| Self::failure(decl, cause, &provisioned))?;
                Self::publish(decl, resource, &provisioned)?;
                created.push(decl.id.clone());
            }
        } else {
            for wave in graph.waves() {
                self.provision_wave(&wave, &provisioned, &mut created)
                    .await?;
            }
        }

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            "Provisioning complete: {} created, {} skipped in {}ms",
            created.len(),
            skipped.len(),
            elapsed_ms
        );

        Ok(ProvisionReport {
            provisioned,
            created,
            skipped,
            elapsed_ms,
        })
    }

    /// Publish checkpoint entries that match a declaration
    fn seed(
        graph: &DependencyGraph,
        checkpoint: &Checkpoint,
        provisioned: &ProvisionedSet,
    ) -> Result<Vec<ResourceId>, ProvisionFailure> {
        let mut skipped = Vec::new();
        for decl in graph.provisioning_order() {
            let Some(resource) = checkpoint.get(decl.id.as_str()) else {
                continue;
            };
            if resource.kind() != decl.kind {
                let cause = ProvisionCause::KindMismatch {
                    expected: decl.kind,
                    found: resource.kind(),
                };
                return Err(Self::failure(decl, cause, provisioned));
            }
            tracing::warn!("{} already provisioned in checkpoint, skipping", decl.id);
            Self::publish(decl, resource.clone(), provisioned)?;
            skipped.push(decl.id.clone());
        }

        for id in checkpoint.ids().filter(|id| !graph.contains(id.as_str())) {
            tracing::warn!("Checkpoint entry {} is not declared, ignoring", id);
        }
        Ok(skipped)
    }

    /// Create the pending members of one wave concurrently
    ///
    /// Once a member fails no further member is started; members already
    /// running finish and are published before the failure is returned.
    async fn provision_wave(
        &self,
        wave: &[&ResourceDeclaration],
        provisioned: &ProvisionedSet,
        created: &mut Vec<ResourceId>,
    ) -> Result<(), ProvisionFailure> {
        let pending: Vec<&ResourceDeclaration> = wave
            .iter()
            .copied()
            .filter(|decl| !provisioned.contains(decl.id.as_str()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let halted = AtomicBool::new(false);
        let outcomes: Vec<Option<Result<ProvisionedResource, ProvisionCause>>> =
            stream::iter(pending.iter().map(|decl| {
                let halted = &halted;
                async move {
                    if halted.load(Ordering::Acquire) {
                        return None;
                    }
                    let outcome = self.create_one(decl, provisioned).await;
                    if outcome.is_err() {
                        halted.store(true, Ordering::Release);
                    }
                    Some(outcome)
                }
            }))
            .buffered(self.options.max_parallel)
            .collect()
            .await;

        let mut first_failure = None;
        for (decl, outcome) in pending.iter().zip(outcomes) {
            match outcome {
                Some(Ok(resource)) => {
                    Self::publish(decl, resource, provisioned)?;
                    created.push(decl.id.clone());
                }
                Some(Err(cause)) => {
                    if first_failure.is_none() {
                        first_failure = Some((*decl, cause));
                    }
                }
                None => tracing::debug!("{} not started after failure in its wave", decl.id),
            }
        }

        match first_failure {
            Some((decl, cause)) => Err(Self::failure(decl, cause, provisioned)),
            None => Ok(()),
        }
    }

    async fn create_one(
        &self,
        decl: &ResourceDeclaration,
        provisioned: &ProvisionedSet,
    ) -> Result<ProvisionedResource, ProvisionCause> {
        let config = resolve(&decl.config, provisioned, &self.context)?;
        let request = CreateRequest {
            id: &decl.id,
            kind: decl.kind,
            config: &config,
            function: decl.function.as_ref(),
            context: &self.context,
        };
        let created = self.creator.create(request).await?;

        let mut attributes = created.attributes;
        attributes.insert(attr::ID.to_string(), created.identifier);
        if let Some(arn) = created.arn {
            attributes.insert(attr::ARN.to_string(), arn);
        }
        Ok(ProvisionedResource::new(decl.id.clone(), decl.kind, attributes))
    }

    fn publish(
        decl: &ResourceDeclaration,
        resource: ProvisionedResource,
        provisioned: &ProvisionedSet,
    ) -> Result<(), ProvisionFailure> {
        let published = provisioned
            .publish(resource)
            .map_err(|_| Self::failure(decl, ProvisionCause::AlreadyPublished, provisioned))?;
        tracing::info!(
            "Provisioned {} ({}) as {}",
            decl.id,
            decl.kind,
            published.attribute(attr::ID).unwrap_or_default()
        );
        Ok(())
    }

    fn failure(
        decl: &ResourceDeclaration,
        cause: ProvisionCause,
        provisioned: &ProvisionedSet,
    ) -> ProvisionFailure {
        tracing::error!("Provisioning {} failed: {}", decl.id, cause);
        ProvisionFailure {
            resource: decl.id.clone(),
            cause,
            checkpoint: provisioned.snapshot(),
        }
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("context", &self.context)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
