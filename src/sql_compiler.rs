//! SQL compiler that plans and renders calls queries using sea-query.
//!
//! Every query starts from the base shape:
//!
//! ```text
//! SELECT {SELECT_FIELDS}
//! FROM calls_merged
//! WHERE project_id = {PROJECT_ID}
//! AND id IN {ID_MASK}                     -- optional
//! GROUP BY project_id, id
//! HAVING {CONDITIONS}                     -- optional
//! ORDER BY {ORDER_FIELDS}                 -- optional
//! LIMIT {LIMIT} OFFSET {OFFSET}           -- optional
//! ```
//!
//! Heavy fields (the free-form `*_dump` JSON columns) dominate the cost of a
//! query. When a query touches one and part of it can be answered from light
//! columns alone, the light part runs first as `filtered_calls` and the heavy
//! columns are only loaded for the ids it returns:
//!
//! ```text
//! WITH filtered_calls AS (
//!     SELECT id FROM calls_merged WHERE project_id = {PROJECT_ID}
//!     GROUP BY project_id, id
//!     HAVING {LIGHT_CONDITIONS}
//!     ORDER BY ... LIMIT ... OFFSET ...   -- only if the order is light
//! )
//! SELECT {SELECT_FIELDS} FROM calls_merged
//! WHERE project_id = {PROJECT_ID} AND id IN (SELECT id FROM filtered_calls)
//! GROUP BY project_id, id
//! HAVING {HEAVY_CONDITIONS}
//! ORDER BY ...                            -- always re-applied
//! LIMIT ... OFFSET ...                    -- unless pushed down
//! ```

use std::collections::BTreeMap;

use sea_query::{
    Alias, BinOper, CommonTableExpression, Expr, PostgresQueryBuilder, Query, SelectStatement,
    WithClause,
};
use serde::Serialize;
use tracing::debug;

use crate::ast::{CallsFilter, CallsQueryRequest, Operand};
use crate::conditions::{filter_conditions, Condition};
use crate::config::CompilerConfig;
use crate::costs::{CostPipeline, ALL_CALLS};
use crate::error::{CompileError, CompileResult};
use crate::fields::{CallsField, ColumnName, OrderField, Source, CALLS_COLUMNS};
use crate::format::format_sql;
use crate::params::{BoundParam, ChType, ParamBuilder};

/// Name of the light pre-filter sub-query.
pub const FILTERED_CALLS: &str = "filtered_calls";

/// SQL text plus the values bound to its placeholders.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: BTreeMap<String, BoundParam>,
}

impl CompiledQuery {
    /// Re-indented SQL for display.
    pub fn pretty_sql(&self) -> String {
        format_sql(&self.sql)
    }
}

/// Heaviness and pushdown classification of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanDecision {
    pub has_heavy_fields: bool,
    pub pushdown_possible: bool,
    /// Ordering, limit and offset can be evaluated in `filtered_calls`.
    pub light_order_filter: bool,
}

impl PlanDecision {
    pub fn should_optimize(&self) -> bool {
        self.has_heavy_fields && self.pushdown_possible
    }
}

/// SQL Compiler that turns calls query requests into SQL
#[derive(Debug, Clone, Default)]
pub struct SqlCompiler {
    config: CompilerConfig,
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Starts an empty plan for `project_id`.
    pub fn calls_query(&self, project_id: impl Into<String>) -> CallsQuery {
        CallsQuery::new(self.config.clone(), project_id)
    }

    /// Builds and renders the plan described by `request`.
    pub fn compile(&self, request: &CallsQueryRequest) -> CompileResult<CompiledQuery> {
        let mut query = self.calls_query(&request.project_id);

        match &request.columns {
            Some(columns) => {
                for column in columns {
                    query.add_field(column)?;
                }
            }
            None => {
                for column in CALLS_COLUMNS.iter() {
                    query.add_field(column.name)?;
                }
            }
        }
        if let Some(filter) = &request.filter {
            query.set_filter(filter.clone());
        }
        if let Some(q) = &request.query {
            query.add_condition(q.expr.clone())?;
        }
        for sort in &request.sort_by {
            query.add_order(&sort.field, &sort.direction)?;
        }
        if let Some(limit) = request.limit {
            query.set_limit(limit)?;
        }
        if let Some(offset) = request.offset {
            query.set_offset(offset)?;
        }
        query.include_costs(request.include_costs);

        query.render()
    }
}

/// A calls query under construction. Consumed by [`CallsQuery::render`].
#[derive(Debug, Clone)]
pub struct CallsQuery {
    config: CompilerConfig,
    project_id: String,
    select_fields: Vec<CallsField>,
    conditions: Vec<Condition>,
    filter: Option<CallsFilter>,
    order_fields: Vec<OrderField>,
    limit: Option<u64>,
    offset: Option<u64>,
    include_costs: bool,
}

impl CallsQuery {
    pub fn new(config: CompilerConfig, project_id: impl Into<String>) -> Self {
        Self {
            config,
            project_id: project_id.into(),
            select_fields: Vec::new(),
            conditions: Vec::new(),
            filter: None,
            order_fields: Vec::new(),
            limit: None,
            offset: None,
            include_costs: false,
        }
    }

    /// Plan for the same project and tables with nothing selected.
    fn empty_like(&self) -> Self {
        Self::new(self.config.clone(), self.project_id.clone())
    }

    pub fn add_field(&mut self, name: &str) -> CompileResult<&mut Self> {
        self.select_fields.push(CallsField::resolve(name)?);
        Ok(self)
    }

    /// Adds a condition. A top-level AND is split into separate conditions
    /// so each term is classified on its own.
    pub fn add_condition(&mut self, operand: Operand) -> CompileResult<&mut Self> {
        match operand {
            Operand::And(ops) => {
                if ops.is_empty() {
                    return Err(CompileError::EmptyBooleanOperation("AND"));
                }
                for op in ops {
                    self.add_condition(op)?;
                }
            }
            other => self.conditions.push(Condition::new(other)?),
        }
        Ok(self)
    }

    /// Sets the fixed-shape filter; a filter with nothing set is ignored.
    pub fn set_filter(&mut self, filter: CallsFilter) -> &mut Self {
        if filter.is_useful() {
            self.filter = Some(filter);
        }
        self
    }

    pub fn add_order(&mut self, field: &str, direction: &str) -> CompileResult<&mut Self> {
        self.order_fields.push(OrderField::new(field, direction)?);
        Ok(self)
    }

    pub fn set_limit(&mut self, limit: i64) -> CompileResult<&mut Self> {
        if limit < 0 {
            return Err(CompileError::NegativeLimit(limit));
        }
        if self.limit.is_some() {
            return Err(CompileError::LimitAlreadySet);
        }
        self.limit = Some(limit as u64);
        Ok(self)
    }

    pub fn set_offset(&mut self, offset: i64) -> CompileResult<&mut Self> {
        if offset < 0 {
            return Err(CompileError::NegativeOffset(offset));
        }
        if self.offset.is_some() {
            return Err(CompileError::OffsetAlreadySet);
        }
        self.offset = Some(offset as u64);
        Ok(self)
    }

    /// Attaches per-model LLM costs to each call's `summary_dump`.
    pub fn include_costs(&mut self, include: bool) -> &mut Self {
        self.include_costs = include;
        self
    }

    pub fn decision(&self) -> PlanDecision {
        let has_heavy_select = self.select_fields.iter().any(CallsField::is_heavy);
        let has_heavy_filter = self.conditions.iter().any(Condition::is_heavy);
        let has_heavy_order = self.order_fields.iter().any(OrderField::is_heavy);

        let has_light_filter = self.filter.as_ref().is_some_and(CallsFilter::is_useful);
        let has_light_query = self.conditions.iter().any(|c| !c.is_heavy());
        let light_order_filter = !self.order_fields.is_empty()
            && self.limit.is_some_and(|limit| limit > 0)
            && !has_heavy_filter
            && !has_heavy_order;

        PlanDecision {
            has_heavy_fields: has_heavy_select || has_heavy_filter || has_heavy_order,
            pushdown_possible: has_light_filter || has_light_query || light_order_filter,
            light_order_filter,
        }
    }

    /// Renders the plan. The soft-delete predicate is always applied.
    pub fn render(mut self) -> CompileResult<CompiledQuery> {
        if self.select_fields.is_empty() {
            return Err(CompileError::MissingSelectFields);
        }

        let output_fields = self.select_fields.clone();
        if self.include_costs {
            self.add_cost_inputs()?;
        }

        let decision = self.decision();
        debug!(
            project_id = %self.project_id,
            has_heavy_fields = decision.has_heavy_fields,
            pushdown_possible = decision.pushdown_possible,
            light_order_filter = decision.light_order_filter,
            include_costs = self.include_costs,
            "planning calls query"
        );

        // Added after classification: on its own it is no reason to push down.
        self.add_condition(Operand::eq(Operand::field("deleted_at"), Operand::null()))?;

        let config = self.config.clone();
        let project_id = self.project_id.clone();
        let order_fields = self.order_fields.clone();
        let include_costs = self.include_costs;

        let mut pb = ParamBuilder::new(config.param_prefix.as_str());
        let (mut ctes, calls_select) = self.calls_stage(decision, &mut pb)?;

        let select = if include_costs {
            ctes.push(cte(ALL_CALLS, calls_select));
            let pipeline =
                CostPipeline::new(&project_id, &config.price_table, &output_fields, &order_fields);
            ctes.extend(pipeline.ctes(&mut pb));
            pipeline.final_select(&mut pb)?
        } else {
            calls_select
        };

        let sql = if ctes.is_empty() {
            select.to_string(PostgresQueryBuilder)
        } else {
            let mut with = WithClause::new();
            for cte in ctes {
                with.cte(cte);
            }
            select.with(with).to_string(PostgresQueryBuilder)
        };
        let sql = if config.pretty_sql { format_sql(&sql) } else { sql };

        Ok(CompiledQuery {
            sql,
            params: pb.into_params(),
        })
    }

    /// The cost pipeline reads usage and start time from the calls stage,
    /// and re-sorts on the columns behind every order field.
    fn add_cost_inputs(&mut self) -> CompileResult<()> {
        let mut needed = vec!["id", "project_id", "started_at", "summary_dump"];
        needed.extend(self.order_fields.iter().map(|o| o.field.name()));
        for name in needed {
            if !self.select_fields.iter().any(|f| f.name() == name && f.path().is_empty()) {
                self.add_field(name)?;
            }
        }
        Ok(())
    }

    /// Per-call rows: a single pass, or `filtered_calls` plus the outer
    /// query when pushdown pays off.
    fn calls_stage(
        self,
        decision: PlanDecision,
        pb: &mut ParamBuilder,
    ) -> CompileResult<(Vec<CommonTableExpression>, SelectStatement)> {
        if !decision.should_optimize() {
            return Ok((Vec::new(), self.base_select(pb, None)?));
        }

        let (filter_query, outer_query) = self.split(decision.light_order_filter)?;
        let filtered = filter_query.base_select(pb, None)?;
        let outer = outer_query.base_select(pb, Some(FILTERED_CALLS))?;
        Ok((vec![cte(FILTERED_CALLS, filtered)], outer))
    }

    /// Splits into the light id-only filter plan and the heavy outer plan.
    fn split(self, push_order: bool) -> CompileResult<(CallsQuery, CallsQuery)> {
        let mut filter_query = self.empty_like();
        let mut outer_query = self.empty_like();

        filter_query.add_field("id")?;
        outer_query.select_fields = self.select_fields;

        let (heavy, light): (Vec<Condition>, Vec<Condition>) =
            self.conditions.into_iter().partition(Condition::is_heavy);
        filter_query.conditions = light;
        outer_query.conditions = heavy;

        filter_query.filter = self.filter;

        // The outer query must still sort: `IN filtered_calls` keeps no order.
        outer_query.order_fields = self.order_fields.clone();
        if push_order {
            filter_query.order_fields = self.order_fields;
            filter_query.limit = self.limit;
            filter_query.offset = self.offset;
        } else {
            outer_query.limit = self.limit;
            outer_query.offset = self.offset;
        }

        Ok((filter_query, outer_query))
    }

    fn base_select(
        &self,
        pb: &mut ParamBuilder,
        id_subquery: Option<&str>,
    ) -> CompileResult<SelectStatement> {
        let table = self.config.calls_table.as_str();
        let source = Source::Merged(table);
        let mut select = Query::select();

        for field in &self.select_fields {
            let (expr, alias) = field.as_select_sql(pb, source)?;
            select.expr_as(expr, alias);
        }
        select.from(Alias::new(table));

        let project = pb.slot_expr(self.project_id.as_str(), ChType::String);
        select.and_where(Expr::col(ColumnName("project_id")).eq(project));

        if let Some(filter) = &self.filter {
            if !filter.call_ids.is_empty() {
                let ids = Expr::cust(pb.add_string_array(&filter.call_ids));
                select.and_where(Expr::col(ColumnName("id")).binary(BinOper::In, ids));
            }
        }
        if let Some(name) = id_subquery {
            let ids = Query::select()
                .column(ColumnName("id"))
                .from(Alias::new(name))
                .to_owned();
            select.and_where(Expr::col(ColumnName("id")).in_subquery(ids));
        }

        select.group_by_columns([ColumnName("project_id"), ColumnName("id")]);

        for condition in &self.conditions {
            select.and_having(condition.as_sql(pb, source)?);
        }
        if let Some(filter) = &self.filter {
            for condition in filter_conditions(filter, pb, source)? {
                select.and_having(condition);
            }
        }

        for order in &self.order_fields {
            for (expr, direction) in order.as_sql(pb, source) {
                select.order_by_expr(expr, direction);
            }
        }
        if let Some(limit) = self.limit {
            select.limit(limit);
        }
        if let Some(offset) = self.offset {
            select.offset(offset);
        }

        Ok(select)
    }
}

pub(crate) fn cte(name: &str, query: SelectStatement) -> CommonTableExpression {
    CommonTableExpression::new()
        .query(query)
        .table_name(Alias::new(name))
        .to_owned()
}
