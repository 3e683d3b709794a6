//! Whitelisted columns of the merged calls table and how each one is
//! referenced, aggregated, cast and ordered.

use std::fmt::Write;

use sea_query::{Alias, Expr, Func, Iden, Order, SimpleExpr};

use crate::ast::CastTo;
use crate::error::{CompileError, CompileResult};
use crate::params::{ChType, ParamBuilder};

/// Column identifier wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnName(pub &'static str);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn Write) {
        write!(s, "{}", self.0).unwrap();
    }
}

/// ClickHouse functions emitted by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChFunc {
    ToInt64OrNull,
    ToFloat64OrNull,
    ToUInt8OrNull,
    ToString,
    JsonValue,
    JsonType,
    Position,
    PositionCaseInsensitive,
    HasAny,
}

impl Iden for ChFunc {
    fn unquoted(&self, s: &mut dyn Write) {
        let name = match self {
            ChFunc::ToInt64OrNull => "toInt64OrNull",
            ChFunc::ToFloat64OrNull => "toFloat64OrNull",
            ChFunc::ToUInt8OrNull => "toUInt8OrNull",
            ChFunc::ToString => "toString",
            ChFunc::JsonValue => "JSON_VALUE",
            ChFunc::JsonType => "JSONType",
            ChFunc::Position => "position",
            ChFunc::PositionCaseInsensitive => "positionCaseInsensitive",
            ChFunc::HasAny => "hasAny",
        };
        write!(s, "{}", name).unwrap();
    }
}

/// Aggregation applied to a column when grouping the merged rows of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    Any,
    ArrayConcatAgg,
    /// Last-write-wins merge of an aggregate state column.
    ArgMaxMerge,
}

impl Iden for AggFn {
    fn unquoted(&self, s: &mut dyn Write) {
        let name = match self {
            AggFn::Any => "any",
            AggFn::ArrayConcatAgg => "array_concat_agg",
            AggFn::ArgMaxMerge => "argMaxMerge",
        };
        write!(s, "{}", name).unwrap();
    }
}

/// Physical column of the merged calls table.
#[derive(Debug, PartialEq, Eq)]
pub struct CallsColumn {
    pub name: &'static str,
    pub agg: Option<AggFn>,
    /// Free-form JSON payload; heavy and addressable by JSON path.
    pub dynamic: bool,
}

const fn plain(name: &'static str) -> CallsColumn {
    CallsColumn { name, agg: None, dynamic: false }
}

const fn agg(name: &'static str, agg: AggFn) -> CallsColumn {
    CallsColumn { name, agg: Some(agg), dynamic: false }
}

const fn dynamic(name: &'static str) -> CallsColumn {
    CallsColumn { name, agg: Some(AggFn::Any), dynamic: true }
}

/// Every column a query may reference.
pub static CALLS_COLUMNS: [CallsColumn; 18] = [
    plain("project_id"),
    plain("id"),
    agg("trace_id", AggFn::Any),
    agg("parent_id", AggFn::Any),
    agg("op_name", AggFn::Any),
    agg("started_at", AggFn::Any),
    dynamic("attributes_dump"),
    dynamic("inputs_dump"),
    agg("input_refs", AggFn::ArrayConcatAgg),
    agg("ended_at", AggFn::Any),
    dynamic("output_dump"),
    agg("output_refs", AggFn::ArrayConcatAgg),
    dynamic("summary_dump"),
    agg("exception", AggFn::Any),
    agg("wb_user_id", AggFn::Any),
    agg("wb_run_id", AggFn::Any),
    agg("deleted_at", AggFn::Any),
    agg("display_name", AggFn::ArgMaxMerge),
];

fn lookup(name: &str) -> Option<&'static CallsColumn> {
    CALLS_COLUMNS.iter().find(|c| c.name == name)
}

/// Where a field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source<'a> {
    /// The raw merged table, where rows of one call are folded with the
    /// column's aggregation.
    Merged(&'a str),
    /// A CTE whose columns were already aggregated; any remaining grouping
    /// reads them back with `any`.
    Materialized(&'a str),
}

impl<'a> Source<'a> {
    pub fn table(&self) -> &'a str {
        match *self {
            Source::Merged(t) | Source::Materialized(t) => t,
        }
    }
}

/// A resolved reference to a whitelisted column, optionally narrowed to a
/// JSON sub-path for dynamic columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallsField {
    column: &'static CallsColumn,
    path: Vec<String>,
}

impl CallsField {
    /// Resolves a logical field name.
    ///
    /// `inputs.user.name` resolves to `inputs_dump` with path
    /// `["user", "name"]`; `inputs` alone resolves to `inputs_dump`.
    pub fn resolve(name: &str) -> CompileResult<Self> {
        if let Some(column) = lookup(name) {
            return Ok(Self { column, path: Vec::new() });
        }

        let mut parts = name.split('.');
        let root = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(CompileError::UnknownField(name.to_string()));
        }

        match lookup(&format!("{}_dump", root)) {
            Some(column) if column.dynamic => Ok(Self { column, path }),
            _ => Err(CompileError::UnknownField(name.to_string())),
        }
    }

    pub fn column(&self) -> &'static CallsColumn {
        self.column
    }

    pub fn name(&self) -> &'static str {
        self.column.name
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn is_heavy(&self) -> bool {
        self.column.dynamic
    }

    pub fn is_dynamic(&self) -> bool {
        self.column.dynamic
    }

    /// Column reference with its aggregation, before any JSON extraction.
    fn aggregated(&self, source: Source<'_>) -> SimpleExpr {
        let col: SimpleExpr =
            Expr::col((Alias::new(source.table()), ColumnName(self.column.name))).into();
        let agg = match (source, self.column.agg) {
            (_, None) => return col,
            (Source::Merged(_), Some(agg)) => agg,
            (Source::Materialized(_), Some(_)) => AggFn::Any,
        };
        Func::cust(agg).arg(col).into()
    }

    /// Expression for this field, cast to `cast` when given.
    pub fn as_sql(
        &self,
        pb: &mut ParamBuilder,
        source: Source<'_>,
        cast: Option<CastTo>,
    ) -> SimpleExpr {
        let base = self.aggregated(source);
        if !self.column.dynamic {
            return clickhouse_cast(base, cast);
        }

        if cast == Some(CastTo::Exists) {
            // JSON null, a missing key and a NULL column all count as absent.
            let parts: Vec<SimpleExpr> = self
                .path
                .iter()
                .map(|part| pb.slot_expr(part.as_str(), ChType::String))
                .collect();
            let json_type = Func::cust(ChFunc::JsonType).args(std::iter::once(base).chain(parts));
            return Expr::expr(json_type.clone())
                .eq(Expr::cust("'Null'"))
                .or(Expr::expr(json_type).is_null())
                .not();
        }

        let path = if self.path.is_empty() {
            Expr::cust("'$'")
        } else {
            pb.slot_expr(quote_json_path(&self.path), ChType::String)
        };
        clickhouse_cast(Func::cust(ChFunc::JsonValue).arg(base).arg(path).into(), cast)
    }

    /// Expression and alias for the SELECT list.
    pub fn as_select_sql(
        &self,
        pb: &mut ParamBuilder,
        source: Source<'_>,
    ) -> CompileResult<(SimpleExpr, ColumnName)> {
        if !self.path.is_empty() {
            return Err(CompileError::DynamicFieldSelection(format!(
                "{}.{}",
                self.column.name,
                self.path.join(".")
            )));
        }
        let expr = if self.column.dynamic {
            self.aggregated(source)
        } else {
            self.as_sql(pb, source, None)
        };
        Ok((expr, ColumnName(self.column.name)))
    }
}

/// Applies a ClickHouse conversion to `expr`.
pub fn clickhouse_cast(expr: SimpleExpr, cast: Option<CastTo>) -> SimpleExpr {
    let func = match cast {
        None => return expr,
        Some(CastTo::Exists) => return Expr::expr(expr).is_null().not(),
        Some(CastTo::Int) => ChFunc::ToInt64OrNull,
        Some(CastTo::Double) => ChFunc::ToFloat64OrNull,
        Some(CastTo::Bool) => ChFunc::ToUInt8OrNull,
        Some(CastTo::String) => ChFunc::ToString,
    };
    Func::cust(func).arg(expr).into()
}

/// Builds a JSONPath such as `$."user"."name"` or `$."items"[0]`.
pub fn quote_json_path(parts: &[String]) -> String {
    let mut path = String::from("$");
    for part in parts {
        if part.parse::<u64>().is_ok() {
            path.push('[');
            path.push_str(part);
            path.push(']');
        } else {
            path.push_str(".\"");
            path.push_str(&part.replace('\\', "\\\\").replace('"', "\\\""));
            path.push('"');
        }
    }
    path
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn parse(direction: &str) -> CompileResult<Self> {
        match direction.to_ascii_uppercase().as_str() {
            "ASC" => Ok(OrderDirection::Asc),
            "DESC" => Ok(OrderDirection::Desc),
            _ => Err(CompileError::InvalidSortDirection(direction.to_string())),
        }
    }
}

impl From<OrderDirection> for Order {
    fn from(direction: OrderDirection) -> Self {
        match direction {
            OrderDirection::Asc => Order::Asc,
            OrderDirection::Desc => Order::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderField {
    pub field: CallsField,
    pub direction: OrderDirection,
}

impl OrderField {
    pub fn new(name: &str, direction: &str) -> CompileResult<Self> {
        let direction = OrderDirection::parse(direction)?;
        Ok(Self {
            field: CallsField::resolve(name)?,
            direction,
        })
    }

    pub fn is_heavy(&self) -> bool {
        self.field.is_heavy()
    }

    /// ORDER BY keys. Raw JSON text does not sort meaningfully, so dynamic
    /// fields order by existence first, then numerically, then as strings.
    pub fn as_sql(&self, pb: &mut ParamBuilder, source: Source<'_>) -> Vec<(SimpleExpr, Order)> {
        if !self.field.is_dynamic() {
            return vec![(self.field.as_sql(pb, source, None), self.direction.into())];
        }
        vec![
            (self.field.as_sql(pb, source, Some(CastTo::Exists)), Order::Desc),
            (self.field.as_sql(pb, source, Some(CastTo::Double)), self.direction.into()),
            (self.field.as_sql(pb, source, Some(CastTo::String)), self.direction.into()),
        ]
    }
}
