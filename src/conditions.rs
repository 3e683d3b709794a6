//! Lowers the boolean operand tree and the fixed-shape calls filter into
//! sea-query expressions.

use sea_query::{BinOper, Expr, Func, SimpleExpr};

use crate::ast::{CallsFilter, Operand, WILDCARD_VERSION_SUFFIX};
use crate::error::{CompileError, CompileResult};
use crate::fields::{clickhouse_cast, CallsField, ChFunc, Source};
use crate::params::{ChType, ParamBuilder};

/// One ANDed term of a query's HAVING clause.
///
/// The fields an operand touches are resolved when the condition is built,
/// so unknown fields are rejected before any SQL is generated and heaviness
/// is known without rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    operand: Operand,
    fields: Vec<CallsField>,
}

impl Condition {
    pub fn new(operand: Operand) -> CompileResult<Self> {
        let mut fields = Vec::new();
        collect_fields(&operand, &mut fields)?;
        Ok(Self { operand, fields })
    }

    /// Fields referenced anywhere in the operand.
    pub fn fields(&self) -> &[CallsField] {
        &self.fields
    }

    pub fn is_heavy(&self) -> bool {
        self.fields.iter().any(CallsField::is_heavy)
    }

    pub fn as_sql(&self, pb: &mut ParamBuilder, source: Source<'_>) -> CompileResult<SimpleExpr> {
        compile_operand(&self.operand, pb, source)
    }
}

fn collect_fields(operand: &Operand, fields: &mut Vec<CallsField>) -> CompileResult<()> {
    match operand {
        Operand::Literal(value) => {
            ChType::of_value(value)?;
        }
        Operand::GetField(name) => {
            let field = CallsField::resolve(name)?;
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        Operand::Convert(spec) => collect_fields(&spec.input, fields)?,
        Operand::And(ops) | Operand::Or(ops) => {
            if ops.is_empty() {
                return Err(CompileError::EmptyBooleanOperation(boolean_name(operand)));
            }
            for op in ops {
                collect_fields(op, fields)?;
            }
        }
        Operand::Not(inner) => collect_fields(&inner.0, fields)?,
        Operand::Eq(pair) | Operand::Gt(pair) | Operand::Gte(pair) => {
            collect_fields(&pair.0, fields)?;
            collect_fields(&pair.1, fields)?;
        }
        Operand::Contains(spec) => {
            collect_fields(&spec.input, fields)?;
            collect_fields(&spec.substr, fields)?;
        }
    }
    Ok(())
}

fn boolean_name(operand: &Operand) -> &'static str {
    match operand {
        Operand::Or(_) => "OR",
        _ => "AND",
    }
}

/// Compiles an operand into an expression, registering every literal with
/// `pb`.
pub fn compile_operand(
    operand: &Operand,
    pb: &mut ParamBuilder,
    source: Source<'_>,
) -> CompileResult<SimpleExpr> {
    let expr = match operand {
        Operand::Literal(value) => Expr::cust(pb.add_literal(value)?),
        Operand::GetField(name) => CallsField::resolve(name)?.as_sql(pb, source, None),
        Operand::Convert(spec) => {
            clickhouse_cast(compile_operand(&spec.input, pb, source)?, Some(spec.to))
        }
        Operand::And(ops) => combine(ops, boolean_name(operand), pb, source, SimpleExpr::and)?,
        Operand::Or(ops) => combine(ops, boolean_name(operand), pb, source, SimpleExpr::or)?,
        Operand::Not(inner) => compile_operand(&inner.0, pb, source)?.not(),
        Operand::Eq(pair) => {
            let lhs = compile_operand(&pair.0, pb, source)?;
            if pair.1.is_null_literal() {
                Expr::expr(lhs).is_null()
            } else {
                Expr::expr(lhs).eq(compile_operand(&pair.1, pb, source)?)
            }
        }
        Operand::Gt(pair) => {
            let lhs = compile_operand(&pair.0, pb, source)?;
            Expr::expr(lhs).gt(compile_operand(&pair.1, pb, source)?)
        }
        Operand::Gte(pair) => {
            let lhs = compile_operand(&pair.0, pb, source)?;
            Expr::expr(lhs).gte(compile_operand(&pair.1, pb, source)?)
        }
        Operand::Contains(spec) => {
            let func = if spec.case_insensitive {
                ChFunc::PositionCaseInsensitive
            } else {
                ChFunc::Position
            };
            let input = compile_operand(&spec.input, pb, source)?;
            let substr = compile_operand(&spec.substr, pb, source)?;
            Expr::expr(Func::cust(func).arg(input).arg(substr)).gt(0)
        }
    };
    Ok(expr)
}

/// Joins compiled operands; a single operand collapses to itself.
fn combine(
    ops: &[Operand],
    name: &'static str,
    pb: &mut ParamBuilder,
    source: Source<'_>,
    join: fn(SimpleExpr, SimpleExpr) -> SimpleExpr,
) -> CompileResult<SimpleExpr> {
    let compiled = ops
        .iter()
        .map(|op| compile_operand(op, pb, source))
        .collect::<CompileResult<Vec<_>>>()?;
    compiled
        .into_iter()
        .reduce(join)
        .ok_or(CompileError::EmptyBooleanOperation(name))
}

/// Compiles the fixed-shape filter into conditions to be ANDed together.
/// An unset field contributes nothing.
pub fn filter_conditions(
    filter: &CallsFilter,
    pb: &mut ParamBuilder,
    source: Source<'_>,
) -> CompileResult<Vec<SimpleExpr>> {
    let mut conditions = Vec::new();

    if !filter.op_names.is_empty() {
        let (wildcarded, exact): (Vec<&String>, Vec<&String>) = filter
            .op_names
            .iter()
            .partition(|name| name.ends_with(WILDCARD_VERSION_SUFFIX));

        let op_name = CallsField::resolve("op_name")?;
        let mut or_conditions = Vec::new();
        if !exact.is_empty() {
            let names: Vec<String> = exact.into_iter().cloned().collect();
            let slot = pb.slot_expr(names, ChType::ArrayString);
            or_conditions.push(Expr::expr(op_name.as_sql(pb, source, None)).binary(BinOper::In, slot));
        }
        for name in wildcarded {
            let prefix = &name[..name.len() - WILDCARD_VERSION_SUFFIX.len()];
            let slot = pb.slot_expr(format!("{}:%", escape_like(prefix)), ChType::String);
            or_conditions.push(Expr::expr(op_name.as_sql(pb, source, None)).binary(BinOper::Like, slot));
        }
        if let Some(cond) = or_conditions.into_iter().reduce(SimpleExpr::or) {
            conditions.push(cond);
        }
    }

    for (column, refs) in [("input_refs", &filter.input_refs), ("output_refs", &filter.output_refs)] {
        if refs.is_empty() {
            continue;
        }
        let col = CallsField::resolve(column)?.as_sql(pb, source, None);
        let slot = pb.slot_expr(refs.clone(), ChType::ArrayString);
        conditions.push(Func::cust(ChFunc::HasAny).arg(col).arg(slot).into());
    }

    let id_lists = [
        ("parent_id", &filter.parent_ids),
        ("trace_id", &filter.trace_ids),
        ("id", &filter.call_ids),
    ];
    for (column, ids) in id_lists {
        if !ids.is_empty() {
            conditions.push(in_list(column, ids, pb, source)?);
        }
    }

    if filter.trace_roots_only == Some(true) {
        let parent = CallsField::resolve("parent_id")?.as_sql(pb, source, None);
        conditions.push(Expr::expr(parent).is_null());
    }

    for (column, ids) in [("wb_user_id", &filter.wb_user_ids), ("wb_run_id", &filter.wb_run_ids)] {
        if !ids.is_empty() {
            conditions.push(in_list(column, ids, pb, source)?);
        }
    }

    Ok(conditions)
}

fn in_list(
    column: &str,
    values: &[String],
    pb: &mut ParamBuilder,
    source: Source<'_>,
) -> CompileResult<SimpleExpr> {
    let col = CallsField::resolve(column)?.as_sql(pb, source, None);
    let slot = Expr::cust(pb.add_string_array(values));
    Ok(Expr::expr(col).binary(BinOper::In, slot))
}

/// Escapes LIKE metacharacters so an op name prefix matches literally.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CastTo;
    use proptest::prelude::*;
    use sea_query::{Alias, Asterisk, PostgresQueryBuilder, Query};
    use serde_json::json;

    const SOURCE: Source<'static> = Source::Merged("calls_merged");

    fn render(exprs: Vec<SimpleExpr>) -> String {
        let mut select = Query::select();
        select.column(Asterisk).from(Alias::new("calls_merged"));
        for expr in exprs {
            select.and_having(expr);
        }
        select.to_string(PostgresQueryBuilder)
    }

    fn compile(operand: Operand) -> (String, ParamBuilder) {
        let mut pb = ParamBuilder::default();
        let condition = Condition::new(operand).unwrap();
        let expr = condition.as_sql(&mut pb, SOURCE).unwrap();
        (render(vec![expr]), pb)
    }

    /// Parenthesis balance outside of quoted identifiers, strings and
    /// placeholders.
    fn balanced(sql: &str) -> bool {
        let mut depth = 0i64;
        let mut closer = None;
        for c in sql.chars() {
            if let Some(end) = closer {
                if c == end {
                    closer = None;
                }
                continue;
            }
            match c {
                '\'' => closer = Some('\''),
                '"' => closer = Some('"'),
                '{' => closer = Some('}'),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return false;
                    }
                }
                _ => {}
            }
        }
        depth == 0 && closer.is_none()
    }

    #[test]
    fn test_eq_null_is_null() {
        let (sql, pb) = compile(Operand::eq(Operand::field("ended_at"), Operand::null()));
        assert!(sql.contains(r#"any("calls_merged"."ended_at") IS NULL"#), "{sql}");
        assert!(!sql.contains("= NULL"));
        assert!(pb.is_empty());
    }

    #[test]
    fn test_eq_literal_is_parameterized() {
        let (sql, pb) = compile(Operand::eq(Operand::field("op_name"), Operand::literal("x")));
        assert!(sql.contains(r#"any("calls_merged"."op_name") = ({pb_0:String})"#), "{sql}");
        assert!(!sql.contains("'x'"));
        assert_eq!(pb.into_params()["pb_0"].value, json!("x"));
    }

    #[test]
    fn test_single_child_collapses() {
        let inner = Operand::gt(Operand::field("started_at"), Operand::literal(1));
        let (nested, _) = compile(Operand::And(vec![Operand::Or(vec![inner.clone()])]));
        let (plain, _) = compile(inner);
        assert_eq!(nested, plain);
    }

    #[test]
    fn test_empty_boolean_rejected() {
        assert_eq!(
            Condition::new(Operand::And(vec![])),
            Err(CompileError::EmptyBooleanOperation("AND"))
        );
        let nested = Operand::not(Operand::Or(vec![]));
        assert_eq!(
            Condition::new(nested),
            Err(CompileError::EmptyBooleanOperation("OR"))
        );
    }

    #[test]
    fn test_unknown_field_rejected_at_construction() {
        let operand = Operand::eq(Operand::field("secret"), Operand::literal(1));
        assert_eq!(
            Condition::new(operand),
            Err(CompileError::UnknownField("secret".to_string()))
        );
    }

    #[test]
    fn test_structured_literal_rejected_at_construction() {
        let operand = Operand::eq(Operand::field("op_name"), Operand::literal(json!([1, 2])));
        assert!(matches!(
            Condition::new(operand),
            Err(CompileError::UnsupportedOperand(_))
        ));
    }

    #[test]
    fn test_ordering_against_null_binds_nullable_slot() {
        let (sql, pb) = compile(Operand::gt(Operand::field("started_at"), Operand::null()));
        assert!(
            sql.contains(r#"any("calls_merged"."started_at") > ({pb_0:Nullable(String)})"#),
            "{sql}"
        );
        assert_eq!(pb.into_params()["pb_0"].ch_type, ChType::NullableString);

        let (sql, _) = compile(Operand::gte(Operand::field("ended_at"), Operand::null()));
        assert!(sql.contains(">= ({pb_0:Nullable(String)})"), "{sql}");
        assert!(!sql.contains("IS NULL"), "{sql}");
    }

    #[test]
    fn test_heaviness() {
        let light = Condition::new(Operand::eq(Operand::field("op_name"), Operand::literal("x"))).unwrap();
        assert!(!light.is_heavy());

        let heavy = Condition::new(Operand::Or(vec![
            Operand::eq(Operand::field("op_name"), Operand::literal("x")),
            Operand::eq(Operand::field("inputs.a"), Operand::literal("y")),
        ]))
        .unwrap();
        assert!(heavy.is_heavy());
        assert_eq!(heavy.fields().len(), 2);
    }

    #[test]
    fn test_contains_case_insensitive() {
        let (sql, _) = compile(Operand::contains(
            Operand::field("display_name"),
            Operand::literal("Bob"),
            true,
        ));
        assert!(sql.contains("positionCaseInsensitive("), "{sql}");
        assert!(sql.contains("> 0"), "{sql}");

        let (sql, _) = compile(Operand::contains(
            Operand::field("display_name"),
            Operand::literal("Bob"),
            false,
        ));
        assert!(sql.contains("position("), "{sql}");
        assert!(!sql.contains("positionCaseInsensitive"));
    }

    #[test]
    fn test_convert_casts_before_compare() {
        let (sql, pb) = compile(Operand::gte(
            Operand::convert(Operand::field("output.score"), CastTo::Double),
            Operand::literal(0.5),
        ));
        assert!(sql.contains("toFloat64OrNull(JSON_VALUE("), "{sql}");
        assert!(sql.contains(">= ({pb_1:Float64})"), "{sql}");
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn test_op_name_filter_exact_and_wildcard() {
        let filter = CallsFilter {
            op_names: vec!["exact:v0".to_string(), "myop:*".to_string()],
            ..Default::default()
        };
        let mut pb = ParamBuilder::default();
        let conditions = filter_conditions(&filter, &mut pb, SOURCE).unwrap();
        assert_eq!(conditions.len(), 1);

        let sql = render(conditions);
        assert!(sql.contains(" IN "), "{sql}");
        assert!(sql.contains("{pb_0:Array(String)}"), "{sql}");
        assert!(sql.contains("LIKE ({pb_1:String})"), "{sql}");
        assert!(sql.contains(" OR "), "{sql}");

        let params = pb.into_params();
        assert_eq!(params["pb_0"].value, json!(["exact:v0"]));
        assert_eq!(params["pb_1"].value, json!("myop:%"));
    }

    #[test]
    fn test_wildcard_prefix_escaped() {
        let filter = CallsFilter {
            op_names: vec!["my_op:*".to_string()],
            ..Default::default()
        };
        let mut pb = ParamBuilder::default();
        filter_conditions(&filter, &mut pb, SOURCE).unwrap();
        assert_eq!(pb.into_params()["pb_0"].value, json!("my\\_op:%"));
    }

    #[test]
    fn test_filter_fields() {
        let filter = CallsFilter {
            input_refs: vec!["ref:a".to_string()],
            parent_ids: vec!["p".to_string()],
            call_ids: vec!["c".to_string()],
            trace_roots_only: Some(true),
            wb_user_ids: vec!["u".to_string()],
            wb_run_ids: vec!["r".to_string()],
            ..Default::default()
        };
        let mut pb = ParamBuilder::default();
        let conditions = filter_conditions(&filter, &mut pb, SOURCE).unwrap();
        assert_eq!(conditions.len(), 6);

        let sql = render(conditions);
        assert!(sql.contains(r#"hasAny(array_concat_agg("calls_merged"."input_refs"), {pb_0:Array(String)})"#), "{sql}");
        assert!(sql.contains(r#"any("calls_merged"."parent_id") IS NULL"#), "{sql}");
        assert!(sql.contains(r#"any("calls_merged"."wb_user_id") IN"#), "{sql}");
        assert!(sql.contains("{pb_3:Array(String)}"), "{sql}");
        assert!(sql.contains(r#"any("calls_merged"."wb_run_id") IN"#), "{sql}");
        assert!(sql.contains("{pb_4:Array(String)}"), "{sql}");
        assert!(balanced(&sql), "{sql}");
    }

    #[test]
    fn test_empty_filter_contributes_nothing() {
        let mut pb = ParamBuilder::default();
        let conditions = filter_conditions(&CallsFilter::default(), &mut pb, SOURCE).unwrap();
        assert!(conditions.is_empty());
        assert!(pb.is_empty());
    }

    fn arb_operand() -> impl Strategy<Value = Operand> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(|n| Operand::literal(n)),
            "[a-z()' ]{0,8}".prop_map(|s| Operand::literal(s)),
            Just(Operand::null()),
            prop::sample::select(vec!["op_name", "started_at", "inputs.a.b", "output", "summary.usage"])
                .prop_map(|name| Operand::field(name)),
        ];
        leaf.prop_recursive(4, 48, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(Operand::And),
                prop::collection::vec(inner.clone(), 1..4).prop_map(Operand::Or),
                inner.clone().prop_map(Operand::not),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| Operand::eq(a, b)),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| Operand::gte(a, b)),
                (inner.clone(), inner.clone(), any::<bool>())
                    .prop_map(|(a, b, ci)| Operand::contains(a, b, ci)),
                (
                    inner,
                    prop::sample::select(vec![
                        CastTo::Int,
                        CastTo::Double,
                        CastTo::Bool,
                        CastTo::String,
                        CastTo::Exists,
                    ])
                )
                    .prop_map(|(a, to)| Operand::convert(a, to)),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_compiled_conditions_balanced(operand in arb_operand()) {
            let (sql, _) = compile(operand);
            prop_assert!(balanced(&sql), "{}", sql);
        }

        #[test]
        fn prop_literals_never_inlined(text in "[a-z]{6,12}") {
            let (sql, _) = compile(Operand::eq(Operand::field("op_name"), Operand::literal(text.clone())));
            prop_assert!(!sql.contains(&text));
        }
    }
}
