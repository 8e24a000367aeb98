//! Named actions and published workflow definitions.
//!
//! Definitions only carry action names. The executor resolves them here at
//! run time, so an instance replayed after a restart finds the same code
//! without anything non-serializable in its stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::AggregateId;

use crate::context::WorkflowContext;
use crate::definition::WorkflowDefinition;
use crate::error::{Result, SagaError, StepError};
use crate::instance::WorkflowInstance;
use crate::signal::{SagaSignal, SignalKind};

/// What an action sees of the instance it runs for.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub instance_id: AggregateId,
    pub step_index: usize,
    pub step_name: &'a str,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub context: &'a WorkflowContext,
}

/// Result of a successful step invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        context: WorkflowContext,
        note: Option<String>,
    },
    /// The step is waiting for one of `awaiting`; the instance suspends.
    Pending {
        context: WorkflowContext,
        awaiting: Vec<SignalKind>,
    },
}

impl StepOutcome {
    pub fn completed(context: impl Into<WorkflowContext>) -> Self {
        StepOutcome::Completed {
            context: context.into(),
            note: None,
        }
    }

    pub fn completed_with_note(context: impl Into<WorkflowContext>, note: impl Into<String>) -> Self {
        StepOutcome::Completed {
            context: context.into(),
            note: Some(note.into()),
        }
    }

    pub fn pending(context: impl Into<WorkflowContext>, awaiting: &[SignalKind]) -> Self {
        StepOutcome::Pending {
            context: context.into(),
            awaiting: awaiting.to_vec(),
        }
    }
}

#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, input: StepInput<'_>) -> std::result::Result<StepOutcome, StepError>;

    /// Handles a signal the pending step declared interest in.
    async fn on_signal(
        &self,
        input: StepInput<'_>,
        signal: &SagaSignal,
    ) -> std::result::Result<StepOutcome, StepError> {
        Err(StepError::permanent(
            "UNEXPECTED_SIGNAL",
            format!("{} does not accept {}", input.step_name, signal.kind()),
        ))
    }
}

/// Semantically reverses a completed step. Returns a short description of
/// what was undone.
#[async_trait]
pub trait CompensationAction: Send + Sync {
    async fn compensate(&self, input: StepInput<'_>) -> std::result::Result<String, StepError>;
}

/// Runs once an instance reaches COMPLETED or COMPENSATED. Failures are
/// logged and never change the instance status.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(&self, instance: &WorkflowInstance) -> std::result::Result<(), StepError>;
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    steps: HashMap<String, Arc<dyn StepAction>>,
    compensations: HashMap<String, Arc<dyn CompensationAction>>,
    finalizers: HashMap<String, Arc<dyn Finalizer>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_step(
        &mut self,
        name: impl Into<String>,
        action: impl StepAction + 'static,
    ) -> &mut Self {
        self.steps.insert(name.into(), Arc::new(action));
        self
    }

    pub fn register_compensation(
        &mut self,
        name: impl Into<String>,
        action: impl CompensationAction + 'static,
    ) -> &mut Self {
        self.compensations.insert(name.into(), Arc::new(action));
        self
    }

    pub fn register_finalizer(
        &mut self,
        name: impl Into<String>,
        finalizer: impl Finalizer + 'static,
    ) -> &mut Self {
        self.finalizers.insert(name.into(), Arc::new(finalizer));
        self
    }

    pub fn step(&self, name: &str) -> Option<Arc<dyn StepAction>> {
        self.steps.get(name).cloned()
    }

    pub fn compensation(&self, name: &str) -> Option<Arc<dyn CompensationAction>> {
        self.compensations.get(name).cloned()
    }

    pub fn finalizer(&self, name: &str) -> Option<Arc<dyn Finalizer>> {
        self.finalizers.get(name).cloned()
    }

    /// Checks that every name `definition` refers to is registered.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        for step in &definition.steps {
            if !self.steps.contains_key(&step.action) {
                return Err(SagaError::UnknownAction(step.action.clone()));
            }
            if let Some(compensation) = &step.compensation
                && !self.compensations.contains_key(compensation)
            {
                return Err(SagaError::UnknownAction(compensation.clone()));
            }
        }
        for finalizer in [&definition.on_completed, &definition.on_compensated]
            .into_iter()
            .flatten()
        {
            if !self.finalizers.contains_key(finalizer) {
                return Err(SagaError::UnknownAction(finalizer.clone()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("compensations", &self.compensations.keys().collect::<Vec<_>>())
            .field("finalizers", &self.finalizers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Published definitions by id and version.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: Arc<RwLock<HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an immutable definition. An `(id, version)` can be
    /// published once.
    pub fn publish(
        &self,
        definition: WorkflowDefinition,
        actions: &ActionRegistry,
    ) -> Result<Arc<WorkflowDefinition>> {
        actions.validate(&definition)?;

        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let versions = definitions.entry(definition.id.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Err(SagaError::DuplicateDefinition {
                id: definition.id,
                version: definition.version,
            });
        }

        tracing::info!(
            definition_id = %definition.id,
            version = definition.version,
            steps = definition.steps.len(),
            "workflow definition published"
        );
        let definition = Arc::new(definition);
        versions.insert(definition.version, definition.clone());
        Ok(definition)
    }

    /// Highest published version of `id`.
    pub fn latest(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| SagaError::DefinitionNotFound {
                id: id.to_string(),
                version: None,
            })
    }

    pub fn get(&self, id: &str, version: u32) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| SagaError::DefinitionNotFound {
                id: id.to_string(),
                version: Some(version),
            })
    }
}
