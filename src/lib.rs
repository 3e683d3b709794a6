//! Compiles structured calls queries (field selection, boolean filter
//! expressions, the fixed-shape calls filter, ordering and pagination) into
//! parameterized ClickHouse SQL over the merged calls table.

pub mod ast;
pub mod conditions;
pub mod config;
pub mod costs;
pub mod error;
pub mod fields;
pub mod format;
pub mod params;
pub mod sql_compiler;

pub use ast::{CallsFilter, CallsQueryRequest, CastTo, Operand, Query, SortBy};
pub use config::{CompilerConfig, ConfigError};
pub use error::{CompileError, CompileResult, Error};
pub use params::{BoundParam, ChType, ParamBuilder};
pub use sql_compiler::{CallsQuery, CompiledQuery, PlanDecision, SqlCompiler};
