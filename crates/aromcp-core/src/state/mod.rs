//! The reactive state engine: three tiers (`inputs`, `state` split into
//! `this`/`global` partitions, and `computed`), validated writes, a
//! flattened read view, and dependency-directed recomputation.

mod path;
mod schema;
mod store;

pub use path::{is_writable, parse_scope_path, ScopeRoot};
pub use schema::{topological_order, ComputedFieldSchema, InputFieldSchema, InputType, OnErrorPolicy, StateSchema};
pub use store::{DependencyInfo, StateSnapshot, StateStore, UpdateOp, UpdateOperation};
