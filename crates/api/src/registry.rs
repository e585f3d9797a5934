use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use trove_core::ApiError;

use crate::context::MethodContext;
use crate::result::MethodResult;

/// Method parameters: a JSON object mutated in place as steps normalize it.
pub type Params = Value;

/// The future returned by a pipeline step.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ApiError>> + Send + 'a>>;

/// One step of a method pipeline.
///
/// Steps run strictly in order; each observes every mutation its
/// predecessors made to the context, the params, and the result. Returning
/// an error aborts the chain and surfaces the error unchanged.
pub type Step = Arc<
    dyn for<'a> Fn(&'a mut MethodContext, &'a mut Params, &'a mut MethodResult) -> StepFuture<'a>
        + Send
        + Sync,
>;

/// Wrap a step function into the registry's step type.
pub fn step<F>(f: F) -> Step
where
    F: for<'a> Fn(&'a mut MethodContext, &'a mut Params, &'a mut MethodResult) -> StepFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// The method registry: `method id → ordered step chain`.
///
/// Built once at boot; duplicate registration is a programming error and
/// panics immediately.
#[derive(Default)]
pub struct Api {
    methods: HashMap<&'static str, Vec<Step>>,
}

impl Api {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method as its ordered chain of steps.
    ///
    /// # Panics
    ///
    /// Panics when `id` is already registered (fatal at boot).
    pub fn register(&mut self, id: &'static str, steps: Vec<Step>) {
        assert!(
            self.methods.insert(id, steps).is_none(),
            "method \"{id}\" registered twice"
        );
    }

    /// Whether a method id is known.
    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.methods.contains_key(id)
    }

    /// Dispatch a call: run the method's steps in order and collect the
    /// final result.
    #[instrument(skip(self, context, params), fields(user = %context.username))]
    pub async fn call(
        &self,
        id: &str,
        context: &mut MethodContext,
        mut params: Params,
    ) -> Result<MethodResult, ApiError> {
        let Some(steps) = self.methods.get(id) else {
            return Err(ApiError::invalid_request_structure(format!(
                "Unknown method \"{id}\""
            )));
        };
        let mut result = MethodResult::new();
        for (i, run) in steps.iter().enumerate() {
            if let Err(e) = run.as_ref()(context, &mut params, &mut result).await {
                debug!(method = id, step = i, error = %e, "method step failed");
                return Err(e);
            }
        }
        Ok(result)
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
