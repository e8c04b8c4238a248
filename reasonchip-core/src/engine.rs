//! Engine: owns the loaded pipeline and chip tables and exposes
//! `load`/`validate`/`run` over them.

use crate::error::ReasonChipError;
use crate::pipeline::{Pipeline, PipelineCollection, PipelineLoader, Task, TaskKind};
use crate::processor::Processor;
use crate::registry::{Chip, ChipRegistry};
use crate::value::Value;
use std::sync::Arc;

/// Where the Engine looks up a pipeline by name. The default is just the
/// in-memory [`PipelineCollection`] a loader built; a broker-backed
/// deployment can swap in a resolver that fetches a pipeline definition
/// from a remote catalog on first use, without the Processor or the rest
/// of the Engine needing to change.
pub trait PipelineResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Pipeline>;
    fn names(&self) -> Vec<String>;
}

impl PipelineResolver for PipelineCollection {
    fn resolve(&self, name: &str) -> Option<Pipeline> {
        self.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.names().map(str::to_string).collect()
    }
}

pub struct Engine {
    pipelines: Arc<PipelineCollection>,
    chips: Arc<ChipRegistry>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            pipelines: Arc::new(PipelineCollection::new()),
            chips: Arc::new(ChipRegistry::new()),
        }
    }

    /// Load every pipeline `loader` produces into the Engine's table.
    /// Safe to call more than once; later loads overlay earlier ones by
    /// pipeline name. Must not be called once a `run` against this Engine
    /// is in flight — a running `Processor` holds its own clone of the
    /// `Arc` these tables live behind.
    pub fn load(&mut self, loader: &dyn PipelineLoader) -> Result<(), ReasonChipError> {
        let loaded = loader.load()?;
        Arc::get_mut(&mut self.pipelines)
            .expect("Engine::load called while a run is in flight")
            .extend(loaded);
        Ok(())
    }

    pub fn register_chip(&mut self, name: impl Into<String>, chip: Arc<dyn Chip>) -> Result<(), ReasonChipError> {
        Arc::get_mut(&mut self.chips)
            .expect("Engine::register_chip called while a run is in flight")
            .register(name, chip)
    }

    pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.names()
    }

    /// Static checks that don't require running anything: every task has
    /// exactly one kind, every `dispatch` target exists, every `chip`
    /// resolves in the registry (the `wait_for` builtin is exempt — it
    /// isn't registry-backed).
    pub fn validate(&self) -> Result<(), ReasonChipError> {
        for name in self.pipelines.names() {
            let pipeline = self.pipelines.get(name).expect("name came from names()");
            Self::validate_tasks(name, &pipeline.tasks, &self.pipelines, &self.chips)?;
        }
        Ok(())
    }

    fn validate_tasks(
        pipeline_name: &str,
        tasks: &[Task],
        pipelines: &PipelineCollection,
        chips: &ChipRegistry,
    ) -> Result<(), ReasonChipError> {
        for task in tasks {
            match task.kind()? {
                TaskKind::Tasks(sub) => Self::validate_tasks(pipeline_name, sub, pipelines, chips)?,
                TaskKind::Branch(target) | TaskKind::Dispatch(target) => {
                    if pipelines.get(target).is_none() {
                        return Err(ReasonChipError::UnknownPipeline(pipeline_name.to_string(), target.to_string()));
                    }
                }
                TaskKind::Chip(name) => {
                    if name != "wait_for" && !chips.contains_resolvable(name) {
                        return Err(ReasonChipError::UnknownChip(pipeline_name.to_string(), name.to_string()));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run the named pipeline to completion, returning its final value
    /// whether it got there via falling off the end, `return`, or
    /// `terminate`.
    pub async fn run(&self, name: &str, args: Value) -> Result<Value, ReasonChipError> {
        let mut processor = Processor::new(Arc::clone(&self.pipelines), Arc::clone(&self.chips));
        Ok(processor.run_pipeline(name, args).await?.into_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    fn insert(engine: &mut Engine, name: &str, yaml: &str) {
        let pipeline: Pipeline = serde_yaml::from_str(yaml).unwrap();
        let mut coll = PipelineCollection::new();
        coll.insert(name.to_string(), pipeline);
        Arc::get_mut(&mut engine.pipelines).unwrap().extend(coll);
    }

    #[test]
    fn validate_catches_unknown_dispatch_target() {
        let mut engine = Engine::new();
        insert(
            &mut engine,
            "main",
            r#"
tasks:
  - dispatch: "ghost"
"#,
        );
        let err = engine.validate().unwrap_err();
        assert!(matches!(err, ReasonChipError::UnknownPipeline(_, _)));
    }

    #[test]
    fn validate_catches_unknown_chip() {
        let mut engine = Engine::new();
        insert(
            &mut engine,
            "main",
            r#"
tasks:
  - chip: "ghost.op"
"#,
        );
        let err = engine.validate().unwrap_err();
        assert!(matches!(err, ReasonChipError::UnknownChip(_, _)));
    }

    #[tokio::test]
    async fn run_resolves_and_executes() {
        let mut engine = Engine::new();
        insert(
            &mut engine,
            "main",
            r#"
tasks:
  - return: "hello"
"#,
        );
        assert_eq!(engine.run("main", Value::mapping()).await.unwrap(), Value::Str("hello".to_string()));
    }
}
