//! Structural validation of generated SQL on a parsed syntax tree. Three
//! checks: PostgreSQL-dialect syntax, read-only shape, and a fixed table
//! whitelist. String tricks, comments and case variation cannot bypass any
//! of them because every check walks AST nodes, never text.

use sqlparser::ast::{
    Cte, DataType, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    Join, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;

pub const WHITELISTED_TABLES: &[&str] = &[
    "floats",
    "profiles",
    "measurements",
    "datasets",
    "float_positions",
    "ocean_regions",
    "mv_float_latest_position",
    "mv_dataset_stats",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    SyntaxError,
    ReadOnlyViolation,
    UnauthorizedTable,
    MultipleStatements,
}

impl ValidationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorKind::SyntaxError => "syntax_error",
            ValidationErrorKind::ReadOnlyViolation => "read_only_violation",
            ValidationErrorKind::UnauthorizedTable => "unauthorized_table",
            ValidationErrorKind::MultipleStatements => "multiple_statements",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub error: Option<String>,
    pub error_kind: Option<ValidationErrorKind>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn ok(warnings: Vec<String>) -> Self {
        Self {
            valid: true,
            error: None,
            error_kind: None,
            warnings,
        }
    }

    fn fail(kind: ValidationErrorKind, error: String, warnings: Vec<String>) -> Self {
        Self {
            valid: false,
            error: Some(error),
            error_kind: Some(kind),
            warnings,
        }
    }
}

pub fn validate(sql: &str) -> ValidationReport {
    let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(err) => {
            return ValidationReport::fail(
                ValidationErrorKind::SyntaxError,
                format!("SQL does not parse: {err}"),
                Vec::new(),
            )
        }
    };

    if statements.is_empty() {
        return ValidationReport::fail(
            ValidationErrorKind::SyntaxError,
            "empty statement".to_string(),
            Vec::new(),
        );
    }
    if statements.len() > 1 {
        return ValidationReport::fail(
            ValidationErrorKind::MultipleStatements,
            "exactly one statement is allowed".to_string(),
            Vec::new(),
        );
    }

    let query = match &statements[0] {
        Statement::Query(query) => query,
        other => {
            return ValidationReport::fail(
                ValidationErrorKind::ReadOnlyViolation,
                format!(
                    "only SELECT statements are allowed; found {}",
                    statement_label(other)
                ),
                Vec::new(),
            )
        }
    };

    if !body_is_select(&query.body) {
        return ValidationReport::fail(
            ValidationErrorKind::ReadOnlyViolation,
            "the statement must be a SELECT query".to_string(),
            Vec::new(),
        );
    }

    let mut walker = Walker::default();
    match walker.query(query) {
        Ok(()) => ValidationReport::ok(walker.warnings),
        Err(violation) => match violation {
            Violation::ReadOnly(message) => ValidationReport::fail(
                ValidationErrorKind::ReadOnlyViolation,
                message,
                walker.warnings,
            ),
            Violation::UnauthorizedTable(table) => ValidationReport::fail(
                ValidationErrorKind::UnauthorizedTable,
                format!("table '{table}' is not queryable"),
                walker.warnings,
            ),
        },
    }
}

/// True when the query's top-level body resolves to a SELECT (possibly a set
/// operation or parenthesized query over SELECTs), judged on the tree.
fn body_is_select(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(_) => true,
        SetExpr::Query(query) => body_is_select(&query.body),
        SetExpr::SetOperation { left, right, .. } => body_is_select(left) && body_is_select(right),
        _ => false,
    }
}

fn statement_label(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::CreateView { .. } => "CREATE VIEW",
        Statement::CreateIndex { .. } => "CREATE INDEX",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        _ => "a non-SELECT statement",
    }
}

enum Violation {
    ReadOnly(String),
    UnauthorizedTable(String),
}

type WalkResult = Result<(), Violation>;

/// Recursive AST walk collecting table references (CTE bases, joins, derived
/// tables, expression subqueries) and cast-hygiene warnings. CTE names become
/// legal relation targets once defined.
#[derive(Default)]
struct Walker {
    cte_names: HashSet<String>,
    warnings: Vec<String>,
}

impl Walker {
    fn query(&mut self, query: &Query) -> WalkResult {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                if with.recursive {
                    self.cte_names.insert(cte.alias.name.value.to_lowercase());
                }
                self.cte(cte)?;
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.set_expr(&query.body)?;
        if let Some(order_by) = &query.order_by {
            for item in &order_by.exprs {
                self.expr(&item.expr)?;
            }
        }
        if let Some(limit) = &query.limit {
            self.expr(limit)?;
        }
        if let Some(offset) = &query.offset {
            self.expr(&offset.value)?;
        }
        Ok(())
    }

    fn cte(&mut self, cte: &Cte) -> WalkResult {
        self.query(&cte.query)
    }

    fn set_expr(&mut self, body: &SetExpr) -> WalkResult {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left)?;
                self.set_expr(right)
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.expr(expr)?;
                    }
                }
                Ok(())
            }
            SetExpr::Insert(_) | SetExpr::Update(_) => Err(Violation::ReadOnly(
                "data-modifying statements are not allowed inside queries".to_string(),
            )),
            SetExpr::Table(table) => {
                if let Some(name) = &table.table_name {
                    self.check_table_name_str(name)?;
                }
                Ok(())
            }
        }
    }

    fn select(&mut self, select: &Select) -> WalkResult {
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.expr(expr)?,
                SelectItem::ExprWithAlias { expr, .. } => self.expr(expr)?,
                SelectItem::QualifiedWildcard(_, _) | SelectItem::Wildcard(_) => {}
            }
        }
        for table in &select.from {
            self.table_with_joins(table)?;
        }
        if let Some(selection) = &select.selection {
            self.expr(selection)?;
        }
        match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => {
                for expr in exprs {
                    self.expr(expr)?;
                }
            }
            GroupByExpr::All(_) => {}
        }
        if let Some(having) = &select.having {
            self.expr(having)?;
        }
        for expr in &select.sort_by {
            self.expr(expr)?;
        }
        Ok(())
    }

    fn table_with_joins(&mut self, table: &TableWithJoins) -> WalkResult {
        self.table_factor(&table.relation)?;
        for join in &table.joins {
            self.join(join)?;
        }
        Ok(())
    }

    fn join(&mut self, join: &Join) -> WalkResult {
        self.table_factor(&join.relation)?;
        let constraint = match &join.join_operator {
            JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint)
            | JoinOperator::LeftSemi(constraint)
            | JoinOperator::RightSemi(constraint)
            | JoinOperator::LeftAnti(constraint)
            | JoinOperator::RightAnti(constraint) => Some(constraint),
            _ => None,
        };
        if let Some(JoinConstraint::On(expr)) = constraint {
            self.expr(expr)?;
        }
        Ok(())
    }

    fn table_factor(&mut self, factor: &TableFactor) -> WalkResult {
        match factor {
            TableFactor::Table { name, .. } => self.check_table_name(name),
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins),
            TableFactor::UNNEST { array_exprs, .. } => {
                for expr in array_exprs {
                    self.expr(expr)?;
                }
                Ok(())
            }
            other => Err(Violation::ReadOnly(format!(
                "unsupported table expression: {other}"
            ))),
        }
    }

    fn check_table_name(&mut self, name: &ObjectName) -> WalkResult {
        let table = name
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_default();
        self.check_table_name_str(&table)
    }

    fn check_table_name_str(&mut self, table: &str) -> WalkResult {
        let table = table.to_lowercase();
        if self.cte_names.contains(&table) || WHITELISTED_TABLES.contains(&table.as_str()) {
            Ok(())
        } else {
            Err(Violation::UnauthorizedTable(table))
        }
    }

    fn expr(&mut self, expr: &Expr) -> WalkResult {
        match expr {
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => self.expr(expr),
            Expr::Cast {
                expr, data_type, ..
            } => {
                self.check_cast(data_type);
                self.expr(expr)
            }
            Expr::Function(function) => self.function(function),
            Expr::Subquery(query) => self.query(query),
            Expr::Exists { subquery, .. } => self.query(subquery),
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr)?;
                self.query(subquery)
            }
            Expr::InList { expr, list, .. } => {
                self.expr(expr)?;
                for item in list {
                    self.expr(item)?;
                }
                Ok(())
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.expr(expr)?;
                self.expr(low)?;
                self.expr(high)
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.expr(operand)?;
                }
                for condition in conditions {
                    self.expr(condition)?;
                }
                for result in results {
                    self.expr(result)?;
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result)?;
                }
                Ok(())
            }
            Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotFalse(expr)
            | Expr::IsUnknown(expr)
            | Expr::IsNotUnknown(expr) => self.expr(expr),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.expr(expr)?;
                self.expr(pattern)
            }
            Expr::AnyOp { left, right, .. } | Expr::AllOp { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Tuple(exprs) => {
                for expr in exprs {
                    self.expr(expr)?;
                }
                Ok(())
            }
            Expr::Extract { expr, .. } => self.expr(expr),
            Expr::Collate { expr, .. } => self.expr(expr),
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                self.expr(expr)?;
                if let Some(from) = substring_from {
                    self.expr(from)?;
                }
                if let Some(length) = substring_for {
                    self.expr(length)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn function(&mut self, function: &Function) -> WalkResult {
        self.function_arguments(&function.parameters)?;
        self.function_arguments(&function.args)?;
        if let Some(filter) = &function.filter {
            self.expr(filter)?;
        }
        Ok(())
    }

    fn function_arguments(&mut self, arguments: &FunctionArguments) -> WalkResult {
        match arguments {
            FunctionArguments::None => Ok(()),
            FunctionArguments::Subquery(query) => self.query(query),
            FunctionArguments::List(list) => {
                for arg in &list.args {
                    let arg_expr = match arg {
                        FunctionArg::Named { arg, .. } => arg,
                        FunctionArg::Unnamed(arg) => arg,
                    };
                    if let FunctionArgExpr::Expr(expr) = arg_expr {
                        self.expr(expr)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// `::geometry` is planar math; ocean-scale distances need the spherical
    /// geography cast. Correctable, so a warning rather than a failure.
    fn check_cast(&mut self, data_type: &DataType) {
        if let DataType::Custom(name, _) = data_type {
            if let Some(ident) = name.0.last() {
                if ident.value.eq_ignore_ascii_case("geometry") {
                    self.warnings.push(
                        "cast to ::geometry detected; use the spherical ::geography cast for \
                         distance calculations"
                            .to_string(),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(sql: &str) -> Option<ValidationErrorKind> {
        validate(sql).error_kind
    }

    #[test]
    fn plain_select_passes() {
        let report = validate("SELECT platform_number FROM floats WHERE float_type = 'BGC'");
        assert!(report.valid, "{:?}", report.error);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn delete_is_rejected_regardless_of_case_or_comments() {
        assert_eq!(
            kind("DELETE FROM floats"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
        assert_eq!(
            kind("dElEtE /* sneaky */ FROM floats"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
        assert_eq!(
            kind("DROP TABLE measurements"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
        assert_eq!(
            kind("TRUNCATE profiles"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
    }

    #[test]
    fn data_modifying_cte_is_rejected() {
        let report = validate(
            "WITH moved AS (DELETE FROM floats RETURNING id) SELECT count(*) FROM moved",
        );
        assert!(!report.valid);
        // Parsers differ on whether this fails at parse or walk; either way it
        // must not validate.
        assert!(report.error_kind.is_some());
    }

    #[test]
    fn unauthorized_table_is_named() {
        let report = validate("SELECT * FROM pg_tables");
        assert_eq!(
            report.error_kind,
            Some(ValidationErrorKind::UnauthorizedTable)
        );
        assert!(report.error.unwrap().contains("pg_tables"));
    }

    #[test]
    fn unauthorized_table_in_subquery_is_caught() {
        let report = validate(
            "SELECT * FROM profiles WHERE float_id IN (SELECT id FROM secret_floats)",
        );
        assert_eq!(
            report.error_kind,
            Some(ValidationErrorKind::UnauthorizedTable)
        );
        assert!(report.error.unwrap().contains("secret_floats"));
    }

    #[test]
    fn joins_and_ctes_over_whitelisted_tables_pass() {
        let report = validate(
            "WITH recent AS (
                SELECT p.id, p.float_id FROM profiles p WHERE p.timestamp > '2023-01-01'
            )
            SELECT f.platform_number, count(m.id)
            FROM recent r
            JOIN floats f ON f.id = r.float_id
            JOIN measurements m ON m.profile_id = r.id
            GROUP BY f.platform_number",
        );
        assert!(report.valid, "{:?}", report.error);
    }

    #[test]
    fn materialized_views_are_whitelisted() {
        assert!(validate("SELECT * FROM mv_dataset_stats").valid);
        assert!(validate("SELECT * FROM mv_float_latest_position").valid);
    }

    #[test]
    fn geometry_cast_warns_but_passes() {
        let report = validate(
            "SELECT * FROM profiles WHERE ST_DWithin(geom::geometry, \
             ST_MakePoint(80.7, 7.9)::geometry, 100000)",
        );
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].contains("::geography"));
    }

    #[test]
    fn geography_cast_is_clean() {
        let report = validate(
            "SELECT * FROM profiles WHERE ST_DWithin(geom, \
             ST_SetSRID(ST_MakePoint(80.7, 7.9), 4326)::geography, 100000)",
        );
        assert!(report.valid, "{:?}", report.error);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn multiple_statements_are_rejected() {
        assert_eq!(
            kind("SELECT 1; SELECT 2"),
            Some(ValidationErrorKind::MultipleStatements)
        );
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        assert_eq!(
            kind("SELEKT * FORM floats"),
            Some(ValidationErrorKind::SyntaxError)
        );
    }

    #[test]
    fn bare_values_is_not_a_select() {
        assert_eq!(
            kind("VALUES (1, 2)"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
    }

    #[test]
    fn update_inside_insert_like_text_is_rejected() {
        assert_eq!(
            kind("UPDATE floats SET float_type = 'deep'"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
        assert_eq!(
            kind("INSERT INTO floats (platform_number) VALUES ('x')"),
            Some(ValidationErrorKind::ReadOnlyViolation)
        );
    }

    #[test]
    fn set_returning_whitelist_table_function_is_rejected() {
        // generate_series in FROM is a table function carrying the Table
        // factor shape; it is not in the whitelist.
        let report = validate("SELECT * FROM generate_series(1, 1000000)");
        assert_eq!(
            report.error_kind,
            Some(ValidationErrorKind::UnauthorizedTable)
        );
    }
}
