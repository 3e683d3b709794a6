//! LLM cost enrichment.
//!
//! Reads the per-model token usage out of each call's summary, prices it
//! against the most specific price row in effect when the call started, and
//! splices the result into the summary as a `"costs"` object:
//!
//! ```text
//! all_calls          -- the calls query
//! llm_usage          -- one row per (call, model)
//! ranked_prices      -- candidate prices, ranked
//! top_ranked_prices  -- rank = 1
//! usage_with_costs   -- tokens x price
//! SELECT ... FROM all_calls LEFT JOIN usage_with_costs
//! ```

use sea_query::{
    Alias, CommonTableExpression, Expr, Func, JoinType, Order, OrderedStatement, OverStatement,
    Query, SelectStatement, SimpleExpr, WindowStatement,
};

use crate::error::CompileResult;
use crate::fields::{CallsField, ColumnName, OrderField, Source};
use crate::params::{ChType, ParamBuilder};
use crate::sql_compiler::cte;

pub const ALL_CALLS: &str = "all_calls";
pub const LLM_USAGE: &str = "llm_usage";
pub const RANKED_PRICES: &str = "ranked_prices";
pub const TOP_RANKED_PRICES: &str = "top_ranked_prices";
pub const USAGE_WITH_COSTS: &str = "usage_with_costs";

const SUMMARY: &str = "summary_dump";

/// Keys of each per-model cost entry, and whether the value is a string.
const COST_ENTRY: [(&str, bool); 12] = [
    ("prompt_tokens", false),
    ("prompt_tokens_cost", false),
    ("completion_tokens_cost", false),
    ("completion_tokens", false),
    ("prompt_token_cost", false),
    ("completion_token_cost", false),
    ("total_tokens", false),
    ("requests", false),
    ("effective_date", true),
    ("provider_id", true),
    ("pricing_level", true),
    ("pricing_level_id", true),
];

fn func(name: &str, args: impl IntoIterator<Item = SimpleExpr>) -> SimpleExpr {
    Func::cust(Alias::new(name)).args(args).into()
}

fn col(name: &'static str) -> SimpleExpr {
    Expr::col(ColumnName(name)).into()
}

fn qcol(table: &str, name: &'static str) -> SimpleExpr {
    Expr::col((Alias::new(table), ColumnName(name))).into()
}

/// `JSONExtractInt` on the usage entry of the current model.
fn usage_int(key: &str) -> SimpleExpr {
    func("JSONExtractInt", [usage_entry(), Expr::val(key).into()])
}

fn usage_entry() -> SimpleExpr {
    func("tupleElement", [col("kv"), Expr::val(2).into()])
}

/// Token count stored under `key`, or under `fallback` for providers
/// reporting input/output tokens.
fn usage_tokens(key: &str, fallback: &str) -> SimpleExpr {
    func(
        "if",
        [
            func("JSONHas", [usage_entry(), Expr::val(key).into()]),
            usage_int(key),
            usage_int(fallback),
        ],
    )
}

/// Stages of the pipeline for one render.
#[derive(Debug, Clone, Copy)]
pub struct CostPipeline<'a> {
    project_id: &'a str,
    price_table: &'a str,
    output_fields: &'a [CallsField],
    order_fields: &'a [OrderField],
}

impl<'a> CostPipeline<'a> {
    pub fn new(
        project_id: &'a str,
        price_table: &'a str,
        output_fields: &'a [CallsField],
        order_fields: &'a [OrderField],
    ) -> Self {
        Self {
            project_id,
            price_table,
            output_fields,
            order_fields,
        }
    }

    /// The four stages following `all_calls`, in dependency order.
    pub fn ctes(&self, pb: &mut ParamBuilder) -> Vec<CommonTableExpression> {
        vec![
            cte(LLM_USAGE, self.llm_usage()),
            cte(RANKED_PRICES, self.ranked_prices(pb)),
            cte(TOP_RANKED_PRICES, self.top_ranked_prices()),
            cte(USAGE_WITH_COSTS, self.usage_with_costs()),
        ]
    }

    fn llm_usage(&self) -> SelectStatement {
        let usage_raw = func(
            "ifNull",
            [
                func("JSONExtractRaw", [col(SUMMARY), Expr::val("usage").into()]),
                Expr::val("{}").into(),
            ],
        );
        let pairs = func("JSONExtractKeysAndValuesRaw", [col("usage_raw")]);

        Query::select()
            .column(ColumnName("id"))
            .column(ColumnName("started_at"))
            .expr_as(usage_raw, ColumnName("usage_raw"))
            .expr_as(func("arrayJoin", [pairs]), ColumnName("kv"))
            .expr_as(
                func("tupleElement", [col("kv"), Expr::val(1).into()]),
                ColumnName("llm_id"),
            )
            .expr_as(usage_int("requests"), ColumnName("requests"))
            .expr_as(usage_tokens("prompt_tokens", "input_tokens"), ColumnName("prompt_tokens"))
            .expr_as(
                usage_tokens("completion_tokens", "output_tokens"),
                ColumnName("completion_tokens"),
            )
            .expr_as(usage_int("total_tokens"), ColumnName("total_tokens"))
            .from(Alias::new(ALL_CALLS))
            .and_where(Expr::expr(func("JSONLength", [col("usage_raw")])).gt(0))
            .to_owned()
    }

    /// Prices in effect at call start, best first: this project's own price,
    /// then the default price, then anything else, newest first within each.
    fn ranked_prices(&self, pb: &mut ParamBuilder) -> SelectStatement {
        let (lu, ltp) = ("lu", "ltp");
        let project = pb.slot_expr(self.project_id, ChType::String);

        let level = || Expr::col((Alias::new(ltp), ColumnName("pricing_level")));
        let level_id = || Expr::col((Alias::new(ltp), ColumnName("pricing_level_id")));
        let priority = Expr::case(level().eq("project").and(level_id().eq(project)), Expr::val(1))
            .case(level().eq("default").and(level_id().eq("default")), Expr::val(2))
            .finally(Expr::val(3));

        let window = WindowStatement::partition_by((Alias::new(lu), ColumnName("id")))
            .add_partition_by(qcol(lu, "llm_id"))
            .order_by_expr(priority.into(), Order::Asc)
            .order_by((Alias::new(ltp), ColumnName("effective_date")), Order::Desc)
            .to_owned();

        let mut select = Query::select();
        for name in ["id", "llm_id", "started_at", "requests"] {
            select.column((Alias::new(lu), ColumnName(name)));
        }
        for name in [
            "input_token_cost",
            "output_token_cost",
            "effective_date",
            "pricing_level",
            "pricing_level_id",
            "provider_id",
        ] {
            select.column((Alias::new(ltp), ColumnName(name)));
        }
        select
            .expr_window_as(Expr::cust("ROW_NUMBER()"), window, ColumnName("rank"))
            .from_as(Alias::new(LLM_USAGE), Alias::new(lu))
            .join_as(
                JoinType::LeftJoin,
                Alias::new(self.price_table),
                Alias::new(ltp),
                Expr::col((Alias::new(lu), ColumnName("llm_id")))
                    .equals((Alias::new(ltp), ColumnName("llm_id"))),
            )
            .and_where(
                Expr::col((Alias::new(ltp), ColumnName("effective_date")))
                    .lte(qcol(lu, "started_at")),
            )
            .to_owned()
    }

    fn top_ranked_prices(&self) -> SelectStatement {
        Query::select()
            .columns([
                ColumnName("id"),
                ColumnName("llm_id"),
                ColumnName("input_token_cost"),
                ColumnName("output_token_cost"),
                ColumnName("effective_date"),
                ColumnName("pricing_level"),
                ColumnName("pricing_level_id"),
                ColumnName("provider_id"),
            ])
            .from(Alias::new(RANKED_PRICES))
            .and_where(Expr::col(ColumnName("rank")).eq(1))
            .to_owned()
    }

    fn usage_with_costs(&self) -> SelectStatement {
        let (lu, trp) = ("lu", "trp");
        let mut select = Query::select();
        for name in ["id", "llm_id", "requests", "prompt_tokens", "completion_tokens", "total_tokens"] {
            select.column((Alias::new(lu), ColumnName(name)));
        }
        for name in ["effective_date", "pricing_level", "pricing_level_id", "provider_id"] {
            select.column((Alias::new(trp), ColumnName(name)));
        }
        select
            .expr_as(qcol(trp, "input_token_cost"), ColumnName("prompt_token_cost"))
            .expr_as(qcol(trp, "output_token_cost"), ColumnName("completion_token_cost"))
            .expr_as(
                Expr::expr(qcol(lu, "prompt_tokens")).mul(qcol(trp, "input_token_cost")),
                ColumnName("prompt_tokens_cost"),
            )
            .expr_as(
                Expr::expr(qcol(lu, "completion_tokens")).mul(qcol(trp, "output_token_cost")),
                ColumnName("completion_tokens_cost"),
            )
            .from_as(Alias::new(LLM_USAGE), Alias::new(lu))
            .join_as(
                JoinType::LeftJoin,
                Alias::new(TOP_RANKED_PRICES),
                Alias::new(trp),
                Expr::col((Alias::new(lu), ColumnName("id")))
                    .equals((Alias::new(trp), ColumnName("id")))
                    .and(
                        Expr::col((Alias::new(lu), ColumnName("llm_id")))
                            .equals((Alias::new(trp), ColumnName("llm_id"))),
                    ),
            )
            .to_owned()
    }

    /// Selected fields read back from `all_calls`, with `summary_dump`
    /// replaced by the spliced summary. Calls without usage are kept.
    pub fn final_select(&self, pb: &mut ParamBuilder) -> CompileResult<SelectStatement> {
        let source = Source::Materialized(ALL_CALLS);
        let mut select = Query::select();
        let mut has_summary = false;

        for field in self.output_fields {
            if field.name() == SUMMARY && field.path().is_empty() {
                if !has_summary {
                    select.expr_as(summary_with_costs(), ColumnName(SUMMARY));
                    has_summary = true;
                }
                continue;
            }
            let (expr, alias) = field.as_select_sql(pb, source)?;
            select.expr_as(expr, alias);
        }
        if !has_summary {
            select.expr_as(summary_with_costs(), ColumnName(SUMMARY));
        }

        select
            .from(Alias::new(ALL_CALLS))
            .join(
                JoinType::LeftJoin,
                Alias::new(USAGE_WITH_COSTS),
                Expr::col((Alias::new(ALL_CALLS), ColumnName("id")))
                    .equals((Alias::new(USAGE_WITH_COSTS), ColumnName("id"))),
            )
            .group_by_columns([
                (Alias::new(ALL_CALLS), ColumnName("project_id")),
                (Alias::new(ALL_CALLS), ColumnName("id")),
            ]);

        for order in self.order_fields {
            for (expr, direction) in order.as_sql(pb, source) {
                select.order_by_expr(expr, direction);
            }
        }

        Ok(select)
    }
}

/// `{"<model>":{...},...}` built from the joined `usage_with_costs` rows.
fn costs_object() -> String {
    let uwc = format!("\"{}\"", USAGE_WITH_COSTS);
    let mut parts = vec![format!("toJSONString({uwc}.\"llm_id\")"), "':{'".to_string()];
    for (i, (key, is_string)) in COST_ENTRY.iter().enumerate() {
        let sep = if i == 0 { "" } else { "," };
        parts.push(format!("'{sep}\"{key}\":'"));
        let value = format!("toString({uwc}.\"{key}\")");
        if *is_string {
            parts.push(format!("toJSONString({value})"));
        } else {
            parts.push(value);
        }
    }
    parts.push("'}'".to_string());

    format!(
        "concat('{{', arrayStringConcat(groupUniqArrayIf(concat({}), ifNull({uwc}.\"llm_id\", '') != ''), ','), '}}')",
        parts.join(", ")
    )
}

/// Inserts `"costs"` before the summary's closing brace. A missing or empty
/// summary becomes `{"costs":...}`.
fn summary_with_costs() -> SimpleExpr {
    let summary = format!(
        "ifNull(nullIf(any(\"{ALL_CALLS}\".\"{SUMMARY}\"), ''), '{{}}')"
    );
    Expr::cust(format!(
        "concat(left({summary}, length({summary}) - 1), if(length({summary}) > 2, ',', ''), '\"costs\":', {}, '}}')",
        costs_object()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_compiler::SqlCompiler;
    use sea_query::PostgresQueryBuilder;

    fn costs_sql(columns: &[&str], order: Option<(&str, &str)>) -> (String, crate::CompiledQuery) {
        let mut query = SqlCompiler::new().calls_query("entity/project");
        for column in columns {
            query.add_field(column).unwrap();
        }
        if let Some((field, direction)) = order {
            query.add_order(field, direction).unwrap();
        }
        query.set_limit(100).unwrap();
        query.include_costs(true);
        let compiled = query.render().unwrap();
        (compiled.sql.clone(), compiled)
    }

    #[test]
    fn test_stages_in_order() {
        let (sql, _) = costs_sql(&["id", "display_name"], None);
        let positions: Vec<usize> = [ALL_CALLS, LLM_USAGE, RANKED_PRICES, TOP_RANKED_PRICES, USAGE_WITH_COSTS]
            .iter()
            .map(|name| sql.find(&format!("\"{}\" AS (", name)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{sql}");
        assert!(sql.contains(r#"LEFT JOIN "usage_with_costs""#), "{sql}");
    }

    #[test]
    fn test_usage_forced_into_all_calls() {
        let (sql, _) = costs_sql(&["id"], None);
        let all_calls = sql.split(r#""llm_usage" AS ("#).next().unwrap();
        assert!(all_calls.contains(r#"AS "summary_dump""#), "{all_calls}");
        assert!(all_calls.contains(r#"AS "started_at""#), "{all_calls}");
        assert!(all_calls.contains("LIMIT 100"), "{all_calls}");
    }

    #[test]
    fn test_final_select_reads_materialized_fields() {
        let (sql, _) = costs_sql(&["id", "display_name", "summary"], Some(("started_at", "desc")));
        let (_, final_select) = sql.rsplit_once(") SELECT ").unwrap();
        assert!(!final_select.contains("argMaxMerge"), "{final_select}");
        assert!(final_select.contains(r#"any("all_calls"."display_name") AS "display_name""#), "{final_select}");
        assert!(final_select.contains(r#"'"costs":'"#), "{final_select}");
        assert_eq!(final_select.matches(r#"AS "summary_dump""#).count(), 1, "{final_select}");
        assert!(final_select.contains(r#"ORDER BY any("all_calls"."started_at") DESC"#), "{final_select}");
        assert!(!final_select.contains("LIMIT"), "{final_select}");
    }

    #[test]
    fn test_project_price_parameterized() {
        let (sql, compiled) = costs_sql(&["id"], None);
        let slots: Vec<&String> = compiled
            .params
            .iter()
            .filter(|(_, p)| p.value == "entity/project")
            .map(|(name, _)| name)
            .collect();
        assert_eq!(slots.len(), 2);
        let ranked = sql.split(r#""ranked_prices" AS ("#).nth(1).unwrap();
        let ranked = ranked.split(r#""top_ranked_prices" AS ("#).next().unwrap();
        assert!(ranked.contains("ROW_NUMBER()"), "{ranked}");
        assert!(ranked.contains(r#"PARTITION BY "lu"."id", "lu"."llm_id""#), "{ranked}");
        assert!(slots.iter().any(|name| ranked.contains(&format!("{{{}:String}}", name))), "{ranked}");
        assert!(!sql.contains("'entity/project'"));
    }

    #[test]
    fn test_token_key_fallbacks() {
        let sql = CostPipeline::new("p", "llm_token_prices", &[], &[])
            .llm_usage()
            .to_string(PostgresQueryBuilder);
        assert!(sql.contains("JSONHas(tupleElement(\"kv\", 2), 'prompt_tokens')"), "{sql}");
        assert!(sql.contains("'input_tokens'"), "{sql}");
        assert!(sql.contains("'output_tokens'"), "{sql}");
        assert!(sql.contains(r#"WHERE JSONLength("usage_raw") > 0"#), "{sql}");
    }

    #[test]
    fn test_costs_object_shape() {
        let object = costs_object();
        for (key, _) in COST_ENTRY {
            assert!(object.contains(&format!("\"{key}\":")), "{key}");
        }
        assert!(object.starts_with("concat('{', arrayStringConcat(groupUniqArrayIf("));
    }
}
