//! Mapping function names stored on job records to executable code.
//!
//! A job only stores the *name* of what it runs. Before a job is performed the
//! name is handed to a [`FunctionResolver`], which returns a [`JobFunction`]
//! or nothing at all. [`FunctionRegistry`] is the resolver most applications
//! use: functions are registered up front under the same dotted names callers
//! pass to [`Call::new`](crate::Call::new).
//!
//! ```rust
//! use deferwork::function::{BoxError, FunctionRegistry, FunctionResolver, Invocation};
//! use serde_json::json;
//!
//! let registry = FunctionRegistry::new().with_function("math.add", |inv: Invocation| async move {
//!     let a: i64 = inv.argument(0, "a")?;
//!     let b: i64 = inv.argument(1, "b")?;
//!     Ok::<_, BoxError>(json!(a + b))
//! });
//!
//! assert!(registry.resolve("math.add").is_some());
//! assert!(registry.resolve("math.sub").is_none());
//! ```

use crate::job::JobId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::BTreeMap, collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

/// Error type returned by job functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a job function produces.
pub type FunctionResult = std::result::Result<Value, BoxError>;

/// A registered, type-erased job function.
pub type JobFunction = Arc<
    dyn Fn(Invocation) -> Pin<Box<dyn Future<Output = FunctionResult> + Send>> + Send + Sync,
>;

/// Concrete arguments a job function is called with.
///
/// Every pending reference has already been replaced by the referenced job's
/// result when a function sees its invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub job_id: JobId,
    pub instance: Option<Value>,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl Invocation {
    /// Bind a parameter by keyword, falling back to its position.
    pub fn argument<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
    ) -> std::result::Result<T, BoxError> {
        let value = self
            .kwargs
            .get(name)
            .or_else(|| self.args.get(position))
            .ok_or_else(|| format!("missing required argument '{}'", name))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Like [`Invocation::argument`], but returns `default` when the
    /// parameter was not passed at all.
    pub fn argument_or<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
        default: T,
    ) -> std::result::Result<T, BoxError> {
        match self.kwargs.get(name).or_else(|| self.args.get(position)) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(default),
        }
    }

    /// Deserialize the bound instance of a method call.
    pub fn instance<T: DeserializeOwned>(&self) -> std::result::Result<T, BoxError> {
        let value = self
            .instance
            .as_ref()
            .ok_or("method called without an instance")?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Resolves function names to executable functions.
pub trait FunctionResolver: Send + Sync {
    /// Look up `name`; `None` when nothing is registered under it.
    fn resolve(&self, name: &str) -> Option<JobFunction>;
}

/// A name-to-function table.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, JobFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        let function: JobFunction = Arc::new(move |invocation| Box::pin(function(invocation)));
        self.functions.insert(name.into(), function);
        self
    }

    /// Builder form of [`FunctionRegistry::register`].
    pub fn with_function<F, Fut>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionResolver for FunctionRegistry {
    fn resolve(&self, name: &str) -> Option<JobFunction> {
        self.functions.get(name).cloned()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
