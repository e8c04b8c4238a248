//! The Processor: walks a pipeline's task list against a mutable variable
//! context, dispatching each task by kind.
//!
//! Order per task: evaluate `when`, materialize any task-local `variables`
//! scope, expand `loop` (if present, running the task body once per item),
//! dispatch by kind, then bind the result (`store_result_as` /
//! `append_result_into` / `key_result_into`). `return` and `terminate`
//! unwind as a [`Signal`] rather than an `Err` — they are control flow, not
//! failure.

use crate::async_handle::{AsyncHandleId, AsyncHandleTable};
use crate::context::VariableContext;
use crate::error::{ReasonChipError, Site};
use crate::expr::{evaluate_predicate, interpolate};
use crate::flow::FlowQueue;
use crate::pipeline::{Pipeline, PipelineCollection, Task, TaskKind};
use crate::registry::ChipRegistry;
use crate::value::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Non-error control flow raised by a `return` or `terminate` task.
/// `Return` unwinds to the nearest pipeline boundary (the pipeline itself,
/// or the dispatching caller); `Terminate` unwinds all the way to the
/// top-level run.
#[derive(Debug, Clone)]
pub enum Signal {
    Return(Value),
    Terminate(Value),
}

/// The outcome of running one pipeline to completion.
#[derive(Debug, Clone)]
pub enum PipelineResult {
    /// Ran to completion, or hit a `return`: the pipeline's value.
    Value(Value),
    /// Hit a `terminate`: propagates past this pipeline's boundary.
    Terminated(Value),
}

impl PipelineResult {
    pub fn into_value(self) -> Value {
        match self {
            PipelineResult::Value(v) | PipelineResult::Terminated(v) => v,
        }
    }
}

pub struct Processor {
    pipelines: Arc<PipelineCollection>,
    chips: Arc<ChipRegistry>,
    async_handles: AsyncHandleTable,
}

impl Processor {
    /// `pipelines`/`chips` are shared via `Arc` rather than borrowed so a
    /// `run_async` dispatch or sub-pipeline can build its own independent
    /// `Processor` — with its own async-handle table — over the same
    /// read-only tables and move it into a spawned task.
    pub fn new(pipelines: Arc<PipelineCollection>, chips: Arc<ChipRegistry>) -> Self {
        Self {
            pipelines,
            chips,
            async_handles: AsyncHandleTable::new(),
        }
    }

    pub async fn wait_for(&mut self, handle: AsyncHandleId) -> Result<Value, ReasonChipError> {
        self.async_handles.wait_for(handle).await
    }

    pub fn outstanding_async_handles(&self) -> usize {
        self.async_handles.outstanding_count()
    }

    /// Run the named pipeline with `args` (a mapping) bound over its
    /// declared `params` defaults.
    pub async fn run_pipeline(&mut self, name: &str, args: Value) -> Result<PipelineResult, ReasonChipError> {
        let pipeline: Pipeline = self
            .pipelines
            .get(name)
            .ok_or_else(|| ReasonChipError::UnknownPipeline("<top-level>".to_string(), name.to_string()))?
            .clone();

        let args_map = args.as_mapping().cloned().unwrap_or_default();
        let mut root = BTreeMap::new();
        for (pname, spec) in &pipeline.params {
            let value = if let Some(v) = args_map.get(pname) {
                v.clone()
            } else if let Some(default) = spec.as_mapping().and_then(|m| m.get("default")) {
                default.clone()
            } else {
                Value::Null
            };
            root.insert(pname.clone(), value);
        }

        let mut ctx = VariableContext::from_mapping(root);
        let mut queue = FlowQueue::from_vec(pipeline.tasks.clone());
        match self.run_queue(&mut queue, &mut ctx).await? {
            None => Ok(PipelineResult::Value(Value::Null)),
            Some(Signal::Return(v)) => Ok(PipelineResult::Value(v)),
            Some(Signal::Terminate(v)) => Ok(PipelineResult::Terminated(v)),
        }
    }

    async fn run_queue(&mut self, queue: &mut FlowQueue<Task>, ctx: &mut VariableContext) -> Result<Option<Signal>, ReasonChipError> {
        while let Some(task) = queue.take_front() {
            if let Some(signal) = self.execute_task(&task, queue, ctx).await? {
                return Ok(Some(signal));
            }
        }
        Ok(None)
    }

    async fn execute_task(
        &mut self,
        task: &Task,
        queue: &mut FlowQueue<Task>,
        ctx: &mut VariableContext,
    ) -> Result<Option<Signal>, ReasonChipError> {
        let label = task.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
        let span = tracing::trace_span!("task", name = %label);
        let _enter = span.enter();

        let mut read = ctx.child();
        if let Some(vars) = &task.variables {
            for (k, v) in vars {
                let iv = interpolate(v, &read)?;
                read.set(k, iv)?;
            }
        }

        if let Some(when) = &task.when {
            if !evaluate_predicate(when, &read)?.is_truthy() {
                tracing::warn!(name = %label, when = %when, "task skipped: `when` evaluated false");
                return Ok(None);
            }
        }

        if task.run_async
            && task.store_result_as.is_none()
            && task.append_result_into.is_none()
            && task.key_result_into.is_none()
        {
            return Err(ReasonChipError::AsyncRequiresSink {
                site: Site::new("<pipeline>", label.clone()),
            });
        }

        if let Some(level) = &task.log {
            match level.as_str() {
                "trace" => tracing::trace!(name = %label, "task log"),
                "debug" => tracing::debug!(name = %label, "task log"),
                _ => tracing::info!(name = %label, "task log"),
            }
        }

        let result = self.execute_task_body(task, queue, ctx, &read).await;
        if let Err(e) = &result {
            tracing::error!(name = %label, error = %e, "task unwound with an error");
        }
        result
    }

    async fn execute_task_body(
        &mut self,
        task: &Task,
        queue: &mut FlowQueue<Task>,
        ctx: &mut VariableContext,
        read: &VariableContext,
    ) -> Result<Option<Signal>, ReasonChipError> {
        if let Some(loop_expr) = &task.loop_expr {
            let items = interpolate(loop_expr, read)?;
            let entries = loop_entries(&items, task)?;
            let n = entries.len();
            let mut collected = Vec::with_capacity(n);
            for (i, (key, item)) in entries.into_iter().enumerate() {
                let mut iter_read = read.child();
                match key {
                    Some(key) => {
                        iter_read.set("item", Value::Mapping(BTreeMap::from([("key".to_string(), Value::Str(key)), ("value".to_string(), item)])))?;
                    }
                    None => iter_read.set("item", item)?,
                }
                iter_read.set("loop", loop_metadata(i, n))?;
                let (signal, value) = self.execute_kind(task, queue, ctx, &iter_read).await?;
                if signal.is_some() {
                    return Ok(signal);
                }
                collected.push(value);
            }
            return self.finish_task(task, ctx, read, Value::Sequence(collected));
        }

        let (signal, value) = self.execute_kind(task, queue, ctx, read).await?;
        if signal.is_some() {
            return Ok(signal);
        }
        self.finish_task(task, ctx, read, value)
    }

    /// Binds the task's result (`store_result_as` / `append_result_into` /
    /// `key_result_into`), then — if `return_result` is set — raises an
    /// immediate `Signal::Return` carrying that same value, with `_` as the
    /// variable name a caller reading the unwound context would see.
    fn finish_task(&self, task: &Task, ctx: &mut VariableContext, read: &VariableContext, value: Value) -> Result<Option<Signal>, ReasonChipError> {
        self.bind_result(task, ctx, read, value.clone())?;
        if task.return_result {
            ctx.set("_", value.clone())?;
            return Ok(Some(Signal::Return(value)));
        }
        Ok(None)
    }

    /// Boxed to break the mutual-recursion cycle
    /// `execute_kind -> run_queue/run_pipeline -> execute_task -> execute_kind`.
    fn execute_kind<'p>(
        &'p mut self,
        task: &'p Task,
        queue: &'p mut FlowQueue<Task>,
        ctx: &'p mut VariableContext,
        read: &'p VariableContext,
    ) -> Pin<Box<dyn Future<Output = Result<(Option<Signal>, Value), ReasonChipError>> + Send + 'p>> {
        Box::pin(async move {
            match task.kind()? {
                TaskKind::Tasks(sub) => {
                    if task.run_async {
                        let owned_tasks = sub.to_vec();
                        let pipelines = Arc::clone(&self.pipelines);
                        let chips = Arc::clone(&self.chips);
                        let mut owned_ctx = ctx.child();
                        let handle = self.async_handles.spawn(async move {
                            let mut sub_proc = Processor::new(pipelines, chips);
                            let mut q = FlowQueue::from_vec(owned_tasks);
                            sub_proc.run_queue(&mut q, &mut owned_ctx).await?;
                            Ok(Value::Null)
                        });
                        Ok((None, Value::Str(handle.as_str())))
                    } else {
                        let mut q = FlowQueue::from_vec(sub.to_vec());
                        let signal = self.run_queue(&mut q, ctx).await?;
                        Ok((signal, Value::Null))
                    }
                }
                TaskKind::Branch(name) => {
                    let pipeline = self.pipelines.get(name).cloned().ok_or_else(|| ReasonChipError::UnknownPipeline("<pipeline>".to_string(), name.to_string()))?;
                    queue.clear();
                    queue.push_front_many(pipeline.tasks);
                    Ok((None, Value::Null))
                }
                TaskKind::Dispatch(name) => {
                    let params = build_params(task, read)?;
                    if task.run_async {
                        let owned_name = name.to_string();
                        let pipelines = Arc::clone(&self.pipelines);
                        let chips = Arc::clone(&self.chips);
                        let handle = self.async_handles.spawn(async move {
                            let mut sub_proc = Processor::new(pipelines, chips);
                            Ok(sub_proc.run_pipeline(&owned_name, params).await?.into_value())
                        });
                        Ok((None, Value::Str(handle.as_str())))
                    } else {
                        match self.run_pipeline(name, params).await? {
                            PipelineResult::Value(v) => Ok((None, v)),
                            PipelineResult::Terminated(v) => Ok((Some(Signal::Terminate(v)), Value::Null)),
                        }
                    }
                }
                TaskKind::Chip(name) => self.execute_chip(task, name, read).await,
                TaskKind::Code(src) => {
                    if task.run_async {
                        let owned_src = src.to_string();
                        let owned_read = read.clone();
                        let handle = self.async_handles.spawn(async move { evaluate_predicate(&owned_src, &owned_read) });
                        Ok((None, Value::Str(handle.as_str())))
                    } else {
                        let value = evaluate_predicate(src, read)?;
                        Ok((None, value))
                    }
                }
                TaskKind::Assert(expr) => {
                    if evaluate_predicate(expr, read)?.is_truthy() {
                        Ok((None, Value::Bool(true)))
                    } else {
                        Err(ReasonChipError::AssertionFailed {
                            site: Site::new("<pipeline>", task.name.clone().unwrap_or_default()),
                            expr: expr.to_string(),
                        })
                    }
                }
                TaskKind::Return(v) => Ok((Some(Signal::Return(interpolate(v, read)?)), Value::Null)),
                TaskKind::Declare(vars) => {
                    for (k, v) in vars {
                        let iv = interpolate(v, read)?;
                        ctx.set(k, iv)?;
                    }
                    Ok((None, Value::Null))
                }
                TaskKind::Comment(_) => Ok((None, Value::Null)),
                TaskKind::Terminate(v) => Ok((Some(Signal::Terminate(interpolate(v, read)?)), Value::Null)),
            }
        })
    }

    async fn execute_chip(&mut self, task: &Task, name: &str, read: &VariableContext) -> Result<(Option<Signal>, Value), ReasonChipError> {
        let input = build_params(task, read)?;

        // `wait_for` is the one builtin chip: it reaches into this
        // Processor's own async handle table, so it can't be a plain
        // registry entry the way ordinary chips are.
        if name == "wait_for" {
            let mapping = input.as_mapping();
            let handle_str = mapping
                .and_then(|m| m.get("handle"))
                .and_then(Value::as_str)
                .ok_or_else(|| ReasonChipError::ChipInvalidInput {
                    site: Site::default(),
                    chip: name.to_string(),
                    detail: "`wait_for` requires a `handle` field".to_string(),
                })?;
            let handle: AsyncHandleId = handle_str.parse().map_err(|_| ReasonChipError::ChipInvalidInput {
                site: Site::default(),
                chip: name.to_string(),
                detail: format!("`{handle_str}` is not a valid async handle"),
            })?;
            let deadline_ms = mapping.and_then(|m| m.get("deadline_ms")).and_then(|v| match v {
                Value::Int(n) if *n >= 0 => Some(*n as u64),
                _ => None,
            });

            let wait = self.async_handles.wait_for(handle);
            let outcome = match deadline_ms {
                Some(ms) => match tokio::time::timeout(std::time::Duration::from_millis(ms), wait).await {
                    Ok(result) => Some(result?),
                    Err(_) => None,
                },
                None => Some(wait.await?),
            };

            let response = match outcome {
                Some(value) => BTreeMap::from([
                    ("status".to_string(), Value::Str("ok".to_string())),
                    ("result".to_string(), value),
                ]),
                None => BTreeMap::from([
                    ("status".to_string(), Value::Str("timeout".to_string())),
                    ("result".to_string(), Value::Null),
                ]),
            };
            return Ok((None, Value::Mapping(response)));
        }

        let chip = self.chips.lookup(name).ok_or_else(|| ReasonChipError::ChipMissingAtCallTime {
            site: Site::default(),
            chip: name.to_string(),
        })?;

        if task.run_async {
            let owned_name = name.to_string();
            let chip = chip.clone();
            let handle = self.async_handles.spawn(async move { chip.call(&owned_name, input).await });
            Ok((None, Value::Str(handle.as_str())))
        } else {
            let result = chip.call(name, input).await?;
            Ok((None, result))
        }
    }

    fn bind_result(&self, task: &Task, ctx: &mut VariableContext, read: &VariableContext, value: Value) -> Result<(), ReasonChipError> {
        if let Some(path) = &task.store_result_as {
            ctx.set(path, value.clone())?;
        }
        if let Some(path) = &task.append_result_into {
            ctx.append(path, value.clone())?;
        }
        if let Some(kri) = &task.key_result_into {
            let key = interpolate(&Value::Str(kri.key.clone()), read)?.stringify();
            let mut mapping = ctx.get(&kri.path).cloned().unwrap_or_else(Value::mapping);
            let m = mapping.as_mapping_mut().ok_or_else(|| ReasonChipError::TypeMismatch {
                site: Site::default(),
                detail: format!("`{}` is not a mapping", kri.path),
            })?;
            m.insert(key, value);
            ctx.set(&kri.path, mapping)?;
        }
        Ok(())
    }
}

/// Normalizes a `loop:` expression's value into an ordered list of entries.
/// A sequence entry carries no key; a mapping entry carries its key,
/// iterated in the mapping's own (sorted) order.
fn loop_entries(items: &Value, task: &Task) -> Result<Vec<(Option<String>, Value)>, ReasonChipError> {
    match items {
        Value::Sequence(seq) => Ok(seq.iter().map(|v| (None, v.clone())).collect()),
        Value::Mapping(map) => Ok(map.iter().map(|(k, v)| (Some(k.clone()), v.clone())).collect()),
        _ => Err(ReasonChipError::TypeMismatch {
            site: Site::new("<pipeline>", task.name.clone().unwrap_or_default()),
            detail: "`loop` must evaluate to a sequence or mapping".to_string(),
        }),
    }
}

fn build_params(task: &Task, read: &VariableContext) -> Result<Value, ReasonChipError> {
    let mut m = BTreeMap::new();
    if let Some(params) = &task.params {
        for (k, v) in params {
            m.insert(k.clone(), interpolate(v, read)?);
        }
    }
    Ok(Value::Mapping(m))
}

fn loop_metadata(i: usize, n: usize) -> Value {
    let mut m = BTreeMap::new();
    m.insert("index".to_string(), Value::Int(i as i64 + 1));
    m.insert("index0".to_string(), Value::Int(i as i64));
    m.insert("first".to_string(), Value::Bool(i == 0));
    m.insert("last".to_string(), Value::Bool(i + 1 == n));
    m.insert("even".to_string(), Value::Bool(i % 2 == 0));
    m.insert("odd".to_string(), Value::Bool(i % 2 != 0));
    m.insert("revindex".to_string(), Value::Int((n - i) as i64));
    m.insert("revindex0".to_string(), Value::Int((n - i - 1) as i64));
    Value::Mapping(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::registry::ChipRegistry;
    use async_trait::async_trait;

    fn pipelines_from(yaml_by_name: &[(&str, &str)]) -> PipelineCollection {
        let mut coll = PipelineCollection::new();
        for (name, yaml) in yaml_by_name {
            let pipeline: Pipeline = serde_yaml::from_str(yaml).unwrap();
            coll.insert(name.to_string(), pipeline);
        }
        coll
    }

    fn processor(coll: PipelineCollection, chips: ChipRegistry) -> Processor {
        Processor::new(Arc::new(coll), Arc::new(chips))
    }

    #[tokio::test]
    async fn assert_and_declare_persist_across_tasks() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - declare:
      x: 5
  - assert: "x == 5"
  - return: "{{ x * 2 }}"
"#,
        )]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        assert_eq!(result.into_value(), Value::Int(10));
    }

    #[tokio::test]
    async fn when_false_skips_task() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - declare:
      ran: false
  - when: "false"
    declare:
      ran: true
  - return: "{{ ran }}"
"#,
        )]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        assert_eq!(result.into_value(), Value::Bool(false));
    }

    #[tokio::test]
    async fn loop_collects_results_with_loop_metadata() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - name: "square"
    loop: "[1, 2, 3]"
    code: "item * 10 + loop.index"
    store_result_as: "out"
  - return: "{{ out }}"
"#,
        )]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        assert_eq!(
            result.into_value(),
            Value::Sequence(vec![Value::Int(11), Value::Int(22), Value::Int(33)])
        );
    }

    #[tokio::test]
    async fn branch_clears_the_enclosing_flow_and_never_returns_to_it() {
        let coll = pipelines_from(&[
            (
                "chosen",
                r#"
tasks:
  - declare:
      chosen: "branched"
"#,
            ),
            (
                "main",
                r#"
tasks:
  - declare:
      chosen: "original"
  - branch: "chosen"
  - declare:
      chosen: "overwritten after branch"
  - return: "{{ chosen }}"
"#,
            ),
        ]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        // The branch pipeline's own tasks never reach the trailing `return`,
        // since the branch replaced the enclosing flow entirely rather than
        // returning control to it.
        assert_eq!(result.into_value(), Value::Null);
    }

    #[tokio::test]
    async fn branch_to_unknown_pipeline_errors() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - branch: "ghost"
"#,
        )]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let err = proc.run_pipeline("main", Value::mapping()).await.unwrap_err();
        assert!(matches!(err, ReasonChipError::UnknownPipeline(_, _)));
    }

    #[tokio::test]
    async fn return_result_short_circuits_with_underscore_bound() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - code: "41 + 1"
    return_result: true
  - declare:
      unreachable: true
"#,
        )]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        assert_eq!(result.into_value(), Value::Int(42));
    }

    #[tokio::test]
    async fn loop_over_mapping_binds_key_and_value() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - name: "render"
    loop: "{a: 1, b: 2}"
    code: "item.value * 10"
    store_result_as: "out"
  - return: "{{ out }}"
"#,
        )]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        // Mapping entries iterate in key order (`a` then `b`).
        assert_eq!(result.into_value(), Value::Sequence(vec![Value::Int(10), Value::Int(20)]));
    }

    #[tokio::test]
    async fn terminate_unwinds_past_dispatch() {
        let coll = pipelines_from(&[
            (
                "inner",
                r#"
tasks:
  - terminate: "stopped early"
"#,
            ),
            (
                "main",
                r#"
tasks:
  - dispatch: "inner"
  - declare:
      unreachable: true
"#,
            ),
        ]);
        let chips = ChipRegistry::new();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        assert!(matches!(result, PipelineResult::Terminated(Value::Str(ref s)) if s == "stopped early"));
    }

    struct DoubleChip;

    #[async_trait]
    impl crate::registry::Chip for DoubleChip {
        async fn call(&self, _chip_name: &str, input: Value) -> Result<Value, ReasonChipError> {
            let n = input.as_mapping().and_then(|m| m.get("n")).cloned().unwrap_or(Value::Int(0));
            match n {
                Value::Int(n) => Ok(Value::Int(n * 2)),
                other => Ok(other),
            }
        }
    }

    #[tokio::test]
    async fn run_async_chip_resolved_via_wait_for() {
        let coll = pipelines_from(&[(
            "main",
            r#"
tasks:
  - name: "kick off"
    chip: "math.double"
    run_async: true
    params:
      n: 21
    store_result_as: "handle"
  - chip: "wait_for"
    params:
      handle: "{{ handle }}"
    store_result_as: "result"
  - return: "{{ result.result }}"
"#,
        )]);
        let mut chips = ChipRegistry::new();
        chips.register("math.double", Arc::new(DoubleChip)).unwrap();
        let mut proc = processor(coll, chips);
        let result = proc.run_pipeline("main", Value::mapping()).await.unwrap();
        assert_eq!(result.into_value(), Value::Int(42));
    }
}
