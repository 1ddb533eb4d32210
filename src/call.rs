//! Call specifications: what a job runs and with which arguments.
//!
//! A call specification names a registered function, optionally carries the
//! instance a method is bound to, and lists positional and keyword arguments.
//! It is stored on the job record as an opaque blob (the `data` field) and only
//! decoded when one of the job's lazy accessors is used.
//!
//! Arguments are a closed, tagged shape: concrete JSON values, references to
//! another job's future result, and the two container forms that may hold
//! either. Future references are found by an explicit depth-first walk over
//! that shape and are replaced by the referenced job's result when the job
//! is performed.
//!
//! ```rust
//! use deferwork::call::{Argument, CallSpec, FutureResult};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//! use uuid::Uuid;
//!
//! let parent = FutureResult::new(Uuid::new_v4());
//! let spec = CallSpec::new(
//!     "reports.render",
//!     None,
//!     vec![Argument::from(json!(3)), Argument::from(parent)],
//!     BTreeMap::new(),
//! );
//!
//! let bytes = spec.encode().unwrap();
//! assert_eq!(CallSpec::decode(&bytes).unwrap(), spec);
//! ```

use crate::{DeferworkError, Result, dependency::Dependency, job::JobId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

/// Default bound on the number of argument nodes visited while scanning.
pub const DEFAULT_MAX_ARGUMENT_NODES: usize = 10_000;

/// Containers may not nest deeper than this.
pub const MAX_ARGUMENT_DEPTH: usize = 32;

/// Placeholder for the eventual result of another job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FutureResult {
    pub job_id: JobId,
}

impl FutureResult {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

impl fmt::Display for FutureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FutureResult({})", self.job_id)
    }
}

/// A single job argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    /// A plain value, passed through untouched.
    Concrete(Value),
    /// Replaced with the referenced job's result at execution time.
    Pending(FutureResult),
    /// An ordered sequence that may contain pending results.
    Sequence(Vec<Argument>),
    /// A string-keyed mapping that may contain pending results.
    Mapping(BTreeMap<String, Argument>),
}

impl Argument {
    /// Substitute every pending reference using `results`.
    ///
    /// Returns the first reference that has no entry in `results`.
    pub fn resolve(
        &self,
        results: &HashMap<JobId, Value>,
    ) -> std::result::Result<Value, FutureResult> {
        match self {
            Argument::Concrete(value) => Ok(value.clone()),
            Argument::Pending(future) => results.get(&future.job_id).cloned().ok_or(*future),
            Argument::Sequence(items) => items
                .iter()
                .map(|item| item.resolve(results))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Argument::Mapping(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(results)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// Whether this argument, including everything nested in it, is free of
    /// pending references.
    pub fn is_concrete(&self) -> bool {
        match self {
            Argument::Concrete(_) => true,
            Argument::Pending(_) => false,
            Argument::Sequence(items) => items.iter().all(Argument::is_concrete),
            Argument::Mapping(entries) => entries.values().all(Argument::is_concrete),
        }
    }

    fn render(&self) -> String {
        match self {
            Argument::Concrete(value) => value.to_string(),
            Argument::Pending(future) => future.to_string(),
            Argument::Sequence(items) => {
                let rendered: Vec<String> = items.iter().map(Argument::render).collect();
                format!("[{}]", rendered.join(", "))
            }
            Argument::Mapping(entries) => {
                let rendered: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| format!("{}: {}", Value::from(key.as_str()), value.render()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Concrete(value)
    }
}

impl From<FutureResult> for Argument {
    fn from(future: FutureResult) -> Self {
        Argument::Pending(future)
    }
}

impl From<Vec<Argument>> for Argument {
    fn from(items: Vec<Argument>) -> Self {
        Argument::Sequence(items)
    }
}

impl From<BTreeMap<String, Argument>> for Argument {
    fn from(entries: BTreeMap<String, Argument>) -> Self {
        Argument::Mapping(entries)
    }
}

/// Collect the job ids of every pending reference, in first-seen order.
///
/// The walk is depth-first and left to right, visiting mapping values in key
/// order. It stops with [`DeferworkError::InvalidArguments`] once more than
/// `max_nodes` nodes have been visited or containers nest deeper than
/// [`MAX_ARGUMENT_DEPTH`].
pub fn scan_future_results<'a, I>(arguments: I, max_nodes: usize) -> Result<Vec<JobId>>
where
    I: IntoIterator<Item = &'a Argument>,
{
    let mut stack: Vec<(&Argument, usize)> = arguments.into_iter().map(|arg| (arg, 0)).collect();
    stack.reverse();

    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut visited = 0usize;

    while let Some((argument, depth)) = stack.pop() {
        visited += 1;
        if visited > max_nodes {
            return Err(DeferworkError::InvalidArguments {
                message: format!("more than {} argument nodes", max_nodes),
            });
        }
        if depth > MAX_ARGUMENT_DEPTH {
            return Err(DeferworkError::InvalidArguments {
                message: format!("containers nested deeper than {}", MAX_ARGUMENT_DEPTH),
            });
        }

        match argument {
            Argument::Concrete(_) => {}
            Argument::Pending(future) => {
                if seen.insert(future.job_id) {
                    ids.push(future.job_id);
                }
            }
            Argument::Sequence(items) => {
                stack.extend(items.iter().rev().map(|item| (item, depth + 1)));
            }
            Argument::Mapping(entries) => {
                stack.extend(entries.values().rev().map(|value| (value, depth + 1)));
            }
        }
    }

    Ok(ids)
}

/// The function a job runs, plus the instance it is bound to for methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callable {
    pub name: String,
    pub instance: Option<Value>,
}

impl Callable {
    /// A free function registered under `name`.
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
        }
    }

    /// A method registered under `name`, bound to `instance` when invoked.
    pub fn method(name: impl Into<String>, instance: Value) -> Self {
        Self {
            name: name.into(),
            instance: Some(instance),
        }
    }
}

impl From<&str> for Callable {
    fn from(name: &str) -> Self {
        Callable::function(name)
    }
}

impl From<String> for Callable {
    fn from(name: String) -> Self {
        Callable::function(name)
    }
}

type WireCallSpec = (String, Option<Value>, Vec<Argument>, BTreeMap<String, Argument>);

/// Decoded form of a job's `data` field.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSpec {
    pub func_name: String,
    pub instance: Option<Value>,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
}

impl CallSpec {
    pub fn new(
        func_name: impl Into<String>,
        instance: Option<Value>,
        args: Vec<Argument>,
        kwargs: BTreeMap<String, Argument>,
    ) -> Self {
        Self {
            func_name: func_name.into(),
            instance,
            args,
            kwargs,
        }
    }

    /// Serialize as a JSON 4-tuple `[name, instance, args, kwargs]`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire: (&str, &Option<Value>, &Vec<Argument>, &BTreeMap<String, Argument>) =
            (&self.func_name, &self.instance, &self.args, &self.kwargs);
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parse bytes produced by [`CallSpec::encode`].
    ///
    /// The function name is not resolved here.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (func_name, instance, args, kwargs): WireCallSpec = serde_json::from_slice(bytes)
            .map_err(|e| DeferworkError::UnreadableCallSpec {
                message: e.to_string(),
            })?;
        Ok(Self {
            func_name,
            instance,
            args,
            kwargs,
        })
    }

    /// Render `name(arg1, arg2, key=value)`, keyword arguments in key order.
    pub fn call_string(&self) -> String {
        let mut parts: Vec<String> = self.args.iter().map(Argument::render).collect();
        parts.extend(
            self.kwargs
                .iter()
                .map(|(key, value)| format!("{}={}", key, value.render())),
        );
        format!("{}({})", self.func_name, parts.join(", "))
    }

    /// Job ids referenced by pending arguments, positional before keyword.
    pub fn future_results(&self, max_nodes: usize) -> Result<Vec<JobId>> {
        scan_future_results(self.args.iter().chain(self.kwargs.values()), max_nodes)
    }
}

/// Everything needed to enqueue one job.
///
/// ```rust
/// use deferwork::Call;
/// use serde_json::json;
///
/// let call = Call::new("fixtures.some_calculation")
///     .arg(json!(3))
///     .arg(json!(4))
///     .kwarg("z", json!(2))
///     .result_ttl(60);
/// assert_eq!(call.args.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Call {
    pub callable: Callable,
    pub args: Vec<Argument>,
    pub kwargs: BTreeMap<String, Argument>,
    pub depends_on: Vec<Dependency>,
    pub ttl: Option<i64>,
    pub result_ttl: Option<i64>,
    pub description: Option<String>,
    pub meta: serde_json::Map<String, Value>,
}

impl Call {
    pub fn new(callable: impl Into<Callable>) -> Self {
        Self {
            callable: callable.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            depends_on: Vec::new(),
            ttl: None,
            result_ttl: None,
            description: None,
            meta: serde_json::Map::new(),
        }
    }

    pub fn arg(mut self, argument: impl Into<Argument>) -> Self {
        self.args.push(argument.into());
        self
    }

    pub fn args<I, A>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Argument>,
    {
        self.args.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, argument: impl Into<Argument>) -> Self {
        self.kwargs.insert(name.into(), argument.into());
        self
    }

    /// Add an explicit parent; may be repeated.
    pub fn depends_on(mut self, dependency: impl Into<Dependency>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn depends_on_all<I, D>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        self.depends_on
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn ttl(mut self, seconds: i64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn result_ttl(mut self, seconds: i64) -> Self {
        self.result_ttl = Some(seconds);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub(crate) fn call_spec(&self) -> CallSpec {
        CallSpec::new(
            self.callable.name.clone(),
            self.callable.instance.clone(),
            self.args.clone(),
            self.kwargs.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn pending(id: JobId) -> Argument {
        Argument::Pending(FutureResult::new(id))
    }

    #[test]
    fn test_round_trip_preserves_every_part() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("z".to_string(), Argument::from(json!(2)));
        kwargs.insert("parent".to_string(), pending(Uuid::new_v4()));

        let spec = CallSpec::new(
            "fixtures.Number.div",
            Some(json!({"value": 2})),
            vec![
                Argument::from(json!(4)),
                Argument::Sequence(vec![Argument::from(json!("a")), pending(Uuid::new_v4())]),
            ],
            kwargs,
        );

        let decoded = CallSpec::decode(&spec.encode().unwrap()).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn test_wire_format_is_a_four_tuple() {
        let spec = CallSpec::new("foo", None, Vec::new(), BTreeMap::new());
        let bytes = spec.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!(["foo", null, [], {}]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = CallSpec::decode(b"this is no call spec").unwrap_err();
        assert!(matches!(err, DeferworkError::UnreadableCallSpec { .. }));

        let err = CallSpec::decode(br#"["foo", null]"#).unwrap_err();
        assert!(matches!(err, DeferworkError::UnreadableCallSpec { .. }));
    }

    #[test]
    fn test_call_string_sorts_keyword_arguments() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("snowman".to_string(), Argument::from(json!("☃")));
        kwargs.insert("null".to_string(), Argument::from(Value::Null));

        let spec = CallSpec::new(
            "myfunc",
            None,
            vec![Argument::from(json!(12)), Argument::from(json!("☃"))],
            kwargs,
        );

        assert_eq!(
            spec.call_string(),
            r#"myfunc(12, "☃", null=null, snowman="☃")"#
        );
    }

    #[test]
    fn test_call_string_renders_pending_and_containers() {
        let id = Uuid::new_v4();
        let mut nested = BTreeMap::new();
        nested.insert("k".to_string(), pending(id));

        let spec = CallSpec::new(
            "n_back_sum",
            None,
            vec![Argument::Sequence(vec![
                Argument::from(json!(1)),
                Argument::Mapping(nested),
            ])],
            BTreeMap::new(),
        );

        assert_eq!(
            spec.call_string(),
            format!(r#"n_back_sum([1, {{"k": FutureResult({})}}])"#, id)
        );
    }

    #[test]
    fn test_scan_finds_nested_references_in_first_seen_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let mut mapping = BTreeMap::new();
        mapping.insert("x".to_string(), pending(c));
        mapping.insert("y".to_string(), pending(a));

        let args = vec![
            Argument::from(json!("plain")),
            Argument::Sequence(vec![pending(b), Argument::Sequence(vec![pending(a)])]),
            Argument::Mapping(mapping),
        ];

        let ids = scan_future_results(args.iter(), DEFAULT_MAX_ARGUMENT_NODES).unwrap();
        assert_eq!(ids, vec![b, a, c]);
    }

    #[test]
    fn test_scan_enforces_node_limit() {
        let args: Vec<Argument> = (0..20).map(|i| Argument::from(json!(i))).collect();
        let err = scan_future_results(args.iter(), 10).unwrap_err();
        assert!(matches!(err, DeferworkError::InvalidArguments { .. }));
    }

    #[test]
    fn test_scan_enforces_depth_limit() {
        let mut argument = Argument::from(json!(0));
        for _ in 0..=MAX_ARGUMENT_DEPTH {
            argument = Argument::Sequence(vec![argument]);
        }
        let err = scan_future_results([&argument], DEFAULT_MAX_ARGUMENT_NODES).unwrap_err();
        assert!(matches!(err, DeferworkError::InvalidArguments { .. }));
    }

    #[test]
    fn test_resolve_substitutes_inside_containers() {
        let id = Uuid::new_v4();
        let mut results = HashMap::new();
        results.insert(id, json!(8));

        let mut mapping = BTreeMap::new();
        mapping.insert("total".to_string(), pending(id));
        let argument = Argument::Sequence(vec![pending(id), Argument::Mapping(mapping)]);

        assert_eq!(argument.resolve(&results).unwrap(), json!([8, {"total": 8}]));
    }

    #[test]
    fn test_resolve_reports_missing_reference() {
        let id = Uuid::new_v4();
        let argument = Argument::Sequence(vec![pending(id)]);
        let missing = argument.resolve(&HashMap::new()).unwrap_err();
        assert_eq!(missing.job_id, id);
        assert!(!argument.is_concrete());
    }

    #[test]
    fn test_call_builder_collects_everything() {
        let parent = Uuid::new_v4();
        let call = Call::new(Callable::method("fixtures.Number.div", json!({"value": 2})))
            .arg(json!(4))
            .kwarg("scale", json!(10))
            .depends_on(parent)
            .ttl(30)
            .result_ttl(-1)
            .description("divide")
            .meta("owner", json!("reports"));

        assert_eq!(call.callable.instance, Some(json!({"value": 2})));
        assert_eq!(call.depends_on, vec![Dependency::from(parent)]);
        assert_eq!(call.ttl, Some(30));
        assert_eq!(call.result_ttl, Some(-1));
        assert_eq!(call.description.as_deref(), Some("divide"));
        assert_eq!(call.meta.get("owner"), Some(&json!("reports")));
        assert_eq!(call.call_spec().call_string(), "fixtures.Number.div(4, scale=10)");
    }
}
