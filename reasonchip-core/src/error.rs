//! Error taxonomy for the pipeline interpreter.
//!
//! Flow-control signals (Return, Terminate) are deliberately *not* part of
//! this enum — they unwind through [`crate::processor::Signal`] and never
//! escape the Processor as an `Err`.

use thiserror::Error;

/// Where an error occurred: pipeline name and task name (or index), so a
/// chained cause can always be traced back to the task that raised it.
#[derive(Debug, Clone, Default)]
pub struct Site {
    pub pipeline: Option<String>,
    pub task: Option<String>,
}

impl Site {
    pub fn new(pipeline: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            pipeline: Some(pipeline.into()),
            task: Some(task.into()),
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.pipeline, &self.task) {
            (Some(p), Some(t)) => write!(f, "{p}::{t}"),
            (Some(p), None) => write!(f, "{p}"),
            _ => write!(f, "<unknown>"),
        }
    }
}

/// One error raised while evaluating an expression or interpolating a
/// template.
#[derive(Debug, Error)]
#[error("evaluation error in `{expr}`: {cause}")]
pub struct EvaluationError {
    pub expr: String,
    pub cause: String,
}

impl EvaluationError {
    pub fn new(expr: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            cause: cause.into(),
        }
    }
}

/// The unified error kind taxonomy. Each variant carries the [`Site`] it
/// occurred at plus a chain to the underlying cause.
#[derive(Debug, Error)]
pub enum ReasonChipError {
    // ── Parse / validation ──────────────────────────────────────────
    #[error("malformed pipeline YAML at {path}: {cause}")]
    MalformedYaml { path: String, cause: String },

    #[error("task node has {count} kind keys (expected exactly one): {keys:?}")]
    AmbiguousTaskKind { count: usize, keys: Vec<String> },

    #[error("unknown task kind `{kind}`")]
    UnknownTaskKind { kind: String },

    #[error("forbidden field combination on task `{task}`: {detail}")]
    ForbiddenFieldCombination { task: String, detail: String },

    #[error("missing required field `{field}` on task `{task}`")]
    MissingField { task: String, field: String },

    #[error("pipeline `{0}` references unknown pipeline `{1}`")]
    UnknownPipeline(String, String),

    #[error("pipeline `{0}` references unknown chip `{1}`")]
    UnknownChip(String, String),

    #[error("schema mismatch for chip `{chip}` {which}: {detail}")]
    SchemaMismatch {
        chip: String,
        which: &'static str,
        detail: String,
    },

    #[error("chip `{0}` is already registered")]
    ChipCollision(String),

    // ── Expression ───────────────────────────────────────────────────
    #[error("{site}: {source}")]
    Expression {
        site: Site,
        #[source]
        source: EvaluationError,
    },

    #[error("{site}: forbidden name `{name}` referenced in expression")]
    ForbiddenName { site: Site, name: String },

    #[error("interpolation recursion limit ({limit}) exceeded in `{value}`")]
    RecursionLimitExceeded { limit: usize, value: String },

    // ── Processor runtime ─────────────────────────────────────────────
    #[error("{site}: unknown variable `{path}`")]
    UnknownVariable { site: Site, path: String },

    #[error("{site}: assertion failed: `{expr}`")]
    AssertionFailed { site: Site, expr: String },

    #[error("{site}: type mismatch: {detail}")]
    TypeMismatch { site: Site, detail: String },

    #[error("{site}: chip `{chip}` input invalid: {detail}")]
    ChipInvalidInput {
        site: Site,
        chip: String,
        detail: String,
    },

    #[error("{site}: no chip registered for `{chip}` at call time")]
    ChipMissingAtCallTime { site: Site, chip: String },

    #[error("{site}: run_async is set but no result sink is declared")]
    AsyncRequiresSink { site: Site },

    #[error("{site}: no async handle `{handle}`")]
    UnknownAsyncHandle { site: Site, handle: String },

    #[error("{site}: async task panicked: {detail}")]
    AsyncTaskPanicked { site: Site, detail: String },

    // ── Transport / protocol ──────────────────────────────────────────
    #[error("transport connection refused: {0}")]
    ConnectionRefused(String),

    #[error("transport disconnected mid-stream: {0}")]
    Disconnected(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("unexpected packet type `{0}` in current state")]
    UnexpectedPacket(String),

    #[error("worker oversubscribed: running count already at capacity")]
    CapacityOversubscribed,

    #[error("orphan cookie `{0}`: no route or session found")]
    OrphanCookie(String),

    #[error("broker connection lost")]
    BrokerLost,

    #[error("worker connection lost")]
    WorkerLost,

    #[error("remote run ended with {rc}: {detail}")]
    RemoteRunFailed { rc: String, detail: String },
}

pub type Result<T> = std::result::Result<T, ReasonChipError>;
