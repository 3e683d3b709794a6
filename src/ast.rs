//! Request model: the boolean operand tree, the fixed-shape calls filter and
//! the full calls query request.
//!
//! The JSON form follows the mongo-style operators used by the trace server:
//!
//! ```text
//! {"$and": [{"$eq": [{"$getField": "op_name"}, {"$literal": "x"}]},
//!           {"$gt": [{"$convert": {"input": {"$getField": "inputs.n"}, "to": "int"}},
//!                    {"$literal": 3}]}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix marking an op name as "any version of this op".
pub const WILDCARD_VERSION_SUFFIX: &str = ":*";

/// A node in the boolean query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    #[serde(rename = "$literal")]
    Literal(Value),
    #[serde(rename = "$getField")]
    GetField(String),
    #[serde(rename = "$convert")]
    Convert(ConvertSpec),
    #[serde(rename = "$and")]
    And(Vec<Operand>),
    #[serde(rename = "$or")]
    Or(Vec<Operand>),
    #[serde(rename = "$not")]
    Not(Box<(Operand,)>),
    #[serde(rename = "$eq")]
    Eq(Box<(Operand, Operand)>),
    #[serde(rename = "$gt")]
    Gt(Box<(Operand, Operand)>),
    #[serde(rename = "$gte")]
    Gte(Box<(Operand, Operand)>),
    #[serde(rename = "$contains")]
    Contains(ContainsSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertSpec {
    pub input: Box<Operand>,
    pub to: CastTo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainsSpec {
    pub input: Box<Operand>,
    pub substr: Box<Operand>,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// Scalar targets for `$convert` and for order-by tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastTo {
    Int,
    Double,
    Bool,
    String,
    Exists,
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    pub fn null() -> Self {
        Operand::Literal(Value::Null)
    }

    pub fn field(name: impl Into<String>) -> Self {
        Operand::GetField(name.into())
    }

    pub fn eq(lhs: Operand, rhs: Operand) -> Self {
        Operand::Eq(Box::new((lhs, rhs)))
    }

    pub fn gt(lhs: Operand, rhs: Operand) -> Self {
        Operand::Gt(Box::new((lhs, rhs)))
    }

    pub fn gte(lhs: Operand, rhs: Operand) -> Self {
        Operand::Gte(Box::new((lhs, rhs)))
    }

    pub fn not(inner: Operand) -> Self {
        Operand::Not(Box::new((inner,)))
    }

    pub fn contains(input: Operand, substr: Operand, case_insensitive: bool) -> Self {
        Operand::Contains(ContainsSpec {
            input: Box::new(input),
            substr: Box::new(substr),
            case_insensitive,
        })
    }

    pub fn convert(input: Operand, to: CastTo) -> Self {
        Operand::Convert(ConvertSpec {
            input: Box::new(input),
            to,
        })
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(self, Operand::Literal(Value::Null))
    }
}

/// Wrapper matching the `{"$expr": ...}` request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "$expr")]
    pub expr: Operand,
}

/// Fixed-shape convenience filter over light columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsFilter {
    pub op_names: Vec<String>,
    pub input_refs: Vec<String>,
    pub output_refs: Vec<String>,
    pub parent_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub call_ids: Vec<String>,
    pub trace_roots_only: Option<bool>,
    pub wb_user_ids: Vec<String>,
    pub wb_run_ids: Vec<String>,
}

impl CallsFilter {
    /// True when at least one field would contribute a condition.
    pub fn is_useful(&self) -> bool {
        !self.op_names.is_empty()
            || !self.input_refs.is_empty()
            || !self.output_refs.is_empty()
            || !self.parent_ids.is_empty()
            || !self.trace_ids.is_empty()
            || !self.call_ids.is_empty()
            || self.trace_roots_only == Some(true)
            || !self.wb_user_ids.is_empty()
            || !self.wb_run_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub direction: String,
}

/// A complete calls query as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallsQueryRequest {
    pub project_id: String,
    #[serde(default)]
    pub filter: Option<CallsFilter>,
    #[serde(default)]
    pub query: Option<Query>,
    #[serde(default)]
    pub sort_by: Vec<SortBy>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    /// Columns to select; every whitelisted column when absent.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub include_costs: bool,
}

impl CallsQueryRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            filter: None,
            query: None,
            sort_by: Vec::new(),
            limit: None,
            offset: None,
            columns: None,
            include_costs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operand_from_json() {
        let raw = json!({
            "$and": [
                {"$eq": [{"$getField": "op_name"}, {"$literal": "x"}]},
                {"$not": [{"$gte": [{"$getField": "started_at"}, {"$literal": 5}]}]},
                {"$contains": {"input": {"$getField": "inputs.a"}, "substr": {"$literal": "q"}}}
            ]
        });
        let operand: Operand = serde_json::from_value(raw).unwrap();

        let expected = Operand::And(vec![
            Operand::eq(Operand::field("op_name"), Operand::literal("x")),
            Operand::not(Operand::gte(Operand::field("started_at"), Operand::literal(5))),
            Operand::contains(Operand::field("inputs.a"), Operand::literal("q"), false),
        ]);
        assert_eq!(operand, expected);
    }

    #[test]
    fn test_convert_target() {
        let raw = json!({"$convert": {"input": {"$getField": "output.score"}, "to": "double"}});
        let operand: Operand = serde_json::from_value(raw).unwrap();
        assert_eq!(
            operand,
            Operand::convert(Operand::field("output.score"), CastTo::Double)
        );
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let raw = json!({"$lt": [{"$getField": "op_name"}, {"$literal": 1}]});
        assert!(serde_json::from_value::<Operand>(raw).is_err());
    }

    #[test]
    fn test_filter_usefulness() {
        assert!(!CallsFilter::default().is_useful());

        let roots_off = CallsFilter {
            trace_roots_only: Some(false),
            ..Default::default()
        };
        assert!(!roots_off.is_useful());

        let ops = CallsFilter {
            op_names: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(ops.is_useful());
    }

    #[test]
    fn test_request_defaults() {
        let req: CallsQueryRequest =
            serde_json::from_value(json!({"project_id": "entity/project"})).unwrap();
        assert_eq!(req, CallsQueryRequest::new("entity/project"));
    }
}
