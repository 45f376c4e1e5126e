//! Output Exporter

use crate::context::DeploymentContext;
use crate::error::OutputError;
use crate::model::ConfigValue;
use crate::resolver::{render_scalar, ReferenceResolver};
use crate::state::ProvisionedSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Named result to export once provisioning has finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub value: ConfigValue,
    #[serde(default)]
    pub description: String,
}

impl OutputSpec {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        value: impl Into<ConfigValue>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: description.into(),
        }
    }
}

/// Materialized output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedOutput {
    pub name: String,
    pub value: String,
    pub description: String,
}

/// Resolves outputs against the final provisioned set
#[derive(Debug, Clone, Copy)]
pub struct OutputExporter<'a> {
    context: &'a DeploymentContext,
}

impl<'a> OutputExporter<'a> {
    #[must_use]
    pub fn new(context: &'a DeploymentContext) -> Self {
        Self { context }
    }

    /// `{name -> value}`; non-string values are rendered as JSON text
    ///
    /// # Errors
    /// `DuplicateOutput`, or `Resolve` naming the output that failed.
    pub fn export(
        &self,
        outputs: &[OutputSpec],
        provisioned: &ProvisionedSet,
    ) -> Result<BTreeMap<String, String>, OutputError> {
        Ok(self
            .describe(outputs, provisioned)?
            .into_iter()
            .map(|o| (o.name, o.value))
            .collect())
    }

    /// Outputs with their descriptions, in declaration order
    ///
    /// # Errors
    /// Same as [`export`](Self::export).
    pub fn describe(
        &self,
        outputs: &[OutputSpec],
        provisioned: &ProvisionedSet,
    ) -> Result<Vec<ExportedOutput>, OutputError> {
        let mut seen = HashSet::with_capacity(outputs.len());
        if let Some(dup) = outputs.iter().find(|o| !seen.insert(o.name.as_str())) {
            return Err(OutputError::DuplicateOutput(dup.name.clone()));
        }

        let resolver = ReferenceResolver::new(provisioned, self.context);
        outputs
            .iter()
            .map(|output| {
                let value = resolver
                    .resolve_value(&output.value)
                    .map_err(|source| OutputError::Resolve {
                        output: output.name.clone(),
                        source,
                    })?;
                Ok(ExportedOutput {
                    name: output.name.clone(),
                    value: render_scalar(&value),
                    description: output.description.clone(),
                })
            })
            .collect()
    }
}
