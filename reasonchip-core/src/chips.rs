//! Helpers for building [`Chip`](crate::registry::Chip) implementations.
//!
//! The one builtin chip, `wait_for`, is handled directly by the Processor
//! (it needs access to the Processor's own async handle table) rather than
//! living here — see `processor::Processor::execute_chip`.

use crate::error::ReasonChipError;
use crate::registry::Chip;
use crate::value::Value;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxedCallFn = Arc<dyn Fn(String, Value) -> Pin<Box<dyn Future<Output = Result<Value, ReasonChipError>> + Send>> + Send + Sync>;

/// Adapts an `async fn(chip_name, input) -> Result<Value>` closure into a
/// [`Chip`], so a handful of in-process chips can be registered without
/// writing out a struct and `impl Chip` for each one.
#[derive(Clone)]
pub struct FnChip {
    f: BoxedCallFn,
}

impl FnChip {
    pub fn new<F, Fut>(f: F) -> Arc<dyn Chip>
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ReasonChipError>> + Send + 'static,
    {
        Arc::new(Self {
            f: Arc::new(move |name, input| Box::pin(f(name, input))),
        })
    }
}

#[async_trait]
impl Chip for FnChip {
    async fn call(&self, chip_name: &str, input: Value) -> Result<Value, ReasonChipError> {
        (self.f)(chip_name.to_string(), input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChipRegistry;

    #[tokio::test]
    async fn fn_chip_is_callable_through_the_registry() {
        let mut registry = ChipRegistry::new();
        registry
            .register("math.increment", FnChip::new(|_name, input| async move {
                match input.as_mapping().and_then(|m| m.get("n")) {
                    Some(Value::Int(n)) => Ok(Value::Int(n + 1)),
                    _ => Ok(Value::Null),
                }
            }))
            .unwrap();

        let chip = registry.lookup("math.increment").unwrap();
        let mut m = std::collections::BTreeMap::new();
        m.insert("n".to_string(), Value::Int(41));
        let result = chip.call("math.increment", Value::Mapping(m)).await.unwrap();
        assert_eq!(result, Value::Int(42));
    }
}
