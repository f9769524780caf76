use anyhow::{anyhow, Result};
use serde::Serialize;
use sqlparser::ast::{
    Expr, FromTable, ObjectName, Query, SetExpr, Statement, TableFactor, TableObject,
    TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;

pub mod ai;
pub mod config;
pub mod handlers;
pub mod server;

/// Placeholder schema for table names without an explicit qualifier.
pub const DEFAULT_SCHEMA: &str = "<default>";

/// A qualified table name, `schema.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Build a `TableRef` from a display string. Tolerates a `"Table: "`
    /// label prefix some table extractors embed in their string form; a
    /// bare name lands in the placeholder schema.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let raw = raw.strip_prefix("Table: ").unwrap_or(raw);
        match raw.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new(DEFAULT_SCHEMA, raw),
        }
    }

    // Case-folded form; unquoted SQL identifiers compare case-insensitively.
    fn key(&self) -> String {
        format!("{}.{}", self.schema.to_lowercase(), self.name.to_lowercase())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Verb classification of a single `;`-delimited statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Create,
    Insert,
    Select,
    Other,
}

/// Split raw SQL on `;` into trimmed, non-empty candidate statements.
pub fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Classify a statement by case-insensitive prefix match on its first
/// keyword. Malformed SQL is never an error here; anything that does not
/// start with CREATE/INSERT/SELECT is `Other`.
pub fn classify_statement(stmt: &str) -> StatementKind {
    let upper = stmt.trim_start().to_uppercase();
    if upper.starts_with("CREATE") {
        StatementKind::Create
    } else if upper.starts_with("INSERT") {
        StatementKind::Insert
    } else if upper.starts_with("SELECT") {
        StatementKind::Select
    } else {
        StatementKind::Other
    }
}

/// Extract the names of all tables/views created in the script.
///
/// Only statements containing `CREATE TABLE` or `CREATE VIEW` contribute.
/// The candidate is the third whitespace token of the upper-cased statement
/// with any trailing `(...)` stripped, so `CREATE TABLE foo(id INT)` yields
/// `foo`. Names are folded to lowercase; a candidate that already carries a
/// schema qualifier keeps it, otherwise it is qualified with the
/// placeholder schema.
pub fn collect_create_tables(sql: &str) -> BTreeSet<TableRef> {
    let mut tables = BTreeSet::new();
    for stmt in split_statements(sql) {
        if classify_statement(stmt) != StatementKind::Create {
            continue;
        }
        let upper = stmt.to_uppercase();
        if !upper.contains("CREATE TABLE") && !upper.contains("CREATE VIEW") {
            continue;
        }
        let parts: Vec<&str> = upper.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let candidate = parts[2].split('(').next().unwrap_or_default();
        if candidate.is_empty() {
            continue;
        }
        tables.insert(TableRef::parse(&candidate.to_lowercase()));
    }
    tables
}

/// Tables a script reads from and writes to, as reported by the SQL parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTables {
    pub sources: BTreeSet<TableRef>,
    pub targets: BTreeSet<TableRef>,
}

/// Parse a multi-statement script and collect every table referenced as a
/// read source or write target. CTE names are script-local and excluded.
pub fn extract_tables(sql: &str) -> Result<ParsedTables> {
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, sql).map_err(|e| anyhow!(e.to_string()))?;
    let mut acc = ParsedTables::default();
    for stmt in &statements {
        collect_statement(stmt, &mut acc);
    }
    Ok(acc)
}

fn collect_statement(stmt: &Statement, acc: &mut ParsedTables) {
    let mut ctes: Vec<String> = Vec::new();
    match stmt {
        Statement::Query(query) => collect_query(query, &mut ctes, acc),
        Statement::Insert(ins) => {
            if let TableObject::TableName(name) = &ins.table {
                if let Some(t) = table_ref_from_object_name(name) {
                    acc.targets.insert(t);
                }
            }
            if let Some(source) = &ins.source {
                collect_query(source, &mut ctes, acc);
            }
        }
        Statement::CreateTable(ct) => {
            if let Some(t) = table_ref_from_object_name(&ct.name) {
                acc.targets.insert(t);
            }
            if let Some(query) = &ct.query {
                collect_query(query, &mut ctes, acc);
            }
        }
        Statement::CreateView { name, query, .. } => {
            if let Some(t) = table_ref_from_object_name(name) {
                acc.targets.insert(t);
            }
            collect_query(query, &mut ctes, acc);
        }
        Statement::Update {
            table, selection, ..
        } => {
            if let TableFactor::Table { name, .. } = &table.relation {
                if let Some(t) = table_ref_from_object_name(name) {
                    acc.targets.insert(t);
                }
            }
            for join in &table.joins {
                collect_table_factor(&join.relation, &mut ctes, acc);
            }
            if let Some(expr) = selection {
                collect_expr(expr, &mut ctes, acc);
            }
        }
        Statement::Delete(del) => {
            for name in &del.tables {
                if let Some(t) = table_ref_from_object_name(name) {
                    acc.targets.insert(t);
                }
            }
            let from = match &del.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            for twj in from {
                if let TableFactor::Table { name, .. } = &twj.relation {
                    if let Some(t) = table_ref_from_object_name(name) {
                        acc.targets.insert(t);
                    }
                }
            }
            if let Some(using) = &del.using {
                for twj in using {
                    collect_table_with_joins(twj, &mut ctes, acc);
                }
            }
            if let Some(expr) = &del.selection {
                collect_expr(expr, &mut ctes, acc);
            }
        }
        _ => {}
    }
}

fn collect_query(query: &Query, ctes: &mut Vec<String>, acc: &mut ParsedTables) {
    let scope_len = ctes.len();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, ctes, acc);
            ctes.push(cte.alias.name.value.to_lowercase());
        }
    }
    collect_set_expr(&query.body, ctes, acc);
    ctes.truncate(scope_len);
}

fn collect_set_expr(body: &SetExpr, ctes: &mut Vec<String>, acc: &mut ParsedTables) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                collect_table_with_joins(twj, ctes, acc);
            }
            if let Some(expr) = &select.selection {
                collect_expr(expr, ctes, acc);
            }
            if let Some(expr) = &select.having {
                collect_expr(expr, ctes, acc);
            }
        }
        SetExpr::Query(inner) => collect_query(inner, ctes, acc),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, ctes, acc);
            collect_set_expr(right, ctes, acc);
        }
        _ => {}
    }
}

fn collect_table_with_joins(twj: &TableWithJoins, ctes: &mut Vec<String>, acc: &mut ParsedTables) {
    collect_table_factor(&twj.relation, ctes, acc);
    for join in &twj.joins {
        collect_table_factor(&join.relation, ctes, acc);
    }
}

fn collect_table_factor(factor: &TableFactor, ctes: &mut Vec<String>, acc: &mut ParsedTables) {
    match factor {
        TableFactor::Table { name, .. } => {
            let parts: Vec<String> = name
                .0
                .iter()
                .filter_map(|p| p.as_ident().map(|i| i.value.clone()))
                .collect();
            // single-part names may refer to a CTE in scope
            if parts.len() == 1 && ctes.contains(&parts[0].to_lowercase()) {
                return;
            }
            if let Some(t) = table_ref_from_parts(&parts) {
                acc.sources.insert(t);
            }
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, ctes, acc),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, ctes, acc),
        _ => {}
    }
}

fn collect_expr(expr: &Expr, ctes: &mut Vec<String>, acc: &mut ParsedTables) {
    match expr {
        Expr::Subquery(q) => collect_query(q, ctes, acc),
        Expr::InSubquery { subquery, .. } => collect_set_expr(subquery, ctes, acc),
        Expr::Exists { subquery, .. } => collect_query(subquery, ctes, acc),
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, ctes, acc);
            collect_expr(right, ctes, acc);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => collect_expr(expr, ctes, acc),
        _ => {}
    }
}

fn table_ref_from_object_name(name: &ObjectName) -> Option<TableRef> {
    let parts: Vec<String> = name
        .0
        .iter()
        .filter_map(|p| p.as_ident().map(|i| i.value.clone()))
        .collect();
    table_ref_from_parts(&parts)
}

fn table_ref_from_parts(parts: &[String]) -> Option<TableRef> {
    match parts {
        [] => None,
        [name] => Some(TableRef::new(DEFAULT_SCHEMA, name)),
        [.., schema, name] => Some(TableRef::new(schema.clone(), name.clone())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub group: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphLink {
    pub source: String,
    pub target: String,
}

/// Classification of every table referenced by a script, plus the
/// node/link graph used by the visualization front end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LineageResult {
    pub sources: Vec<String>,
    pub targets: Vec<String>,
    pub intermediates: Vec<String>,
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

/// Cross-reference the CREATE-statement table set against the parser's
/// source/target sets.
///
/// Refined classification: parser sources not created in the script are
/// sources, every created table is a target, and created tables that are
/// also read become intermediates. If the refined sources and targets are
/// both empty the parser's raw sets are returned unchanged instead, so a
/// failed heuristic never silently yields an empty result.
pub fn resolve_lineage(create_tables: &BTreeSet<TableRef>, parsed: &ParsedTables) -> LineageResult {
    let create_keys: BTreeSet<String> = create_tables.iter().map(TableRef::key).collect();
    let parsed_source_keys: BTreeSet<String> = parsed.sources.iter().map(TableRef::key).collect();

    let sources: BTreeSet<String> = parsed
        .sources
        .iter()
        .filter(|t| !create_keys.contains(&t.key()))
        .map(ToString::to_string)
        .collect();
    let targets: BTreeSet<String> = create_tables.iter().map(ToString::to_string).collect();
    let intermediates: BTreeSet<String> = create_tables
        .iter()
        .filter(|t| parsed_source_keys.contains(&t.key()))
        .map(ToString::to_string)
        .collect();

    let (sources, targets, intermediates) = if sources.is_empty() && targets.is_empty() {
        tracing::debug!("refined classification empty, falling back to parser table sets");
        (
            parsed.sources.iter().map(ToString::to_string).collect(),
            parsed.targets.iter().map(ToString::to_string).collect(),
            BTreeSet::new(),
        )
    } else {
        (sources, targets, intermediates)
    };

    let (nodes, links) = build_graph(&sources, &targets, &intermediates);

    LineageResult {
        sources: sources.into_iter().collect(),
        targets: targets.into_iter().collect(),
        intermediates: intermediates.into_iter().collect(),
        nodes,
        links,
    }
}

fn build_graph(
    sources: &BTreeSet<String>,
    targets: &BTreeSet<String>,
    intermediates: &BTreeSet<String>,
) -> (Vec<GraphNode>, Vec<GraphLink>) {
    let mut all: BTreeSet<&String> = sources.iter().collect();
    all.extend(targets.iter());
    all.extend(intermediates.iter());

    // group priority: source, then target, then intermediate-or-other
    let nodes = all
        .iter()
        .map(|id| GraphNode {
            id: (*id).clone(),
            group: if sources.contains(*id) {
                1
            } else if targets.contains(*id) {
                2
            } else {
                3
            },
        })
        .collect();

    let mut links = Vec::new();
    if !intermediates.is_empty() {
        for s in sources {
            for i in intermediates {
                links.push(GraphLink {
                    source: s.clone(),
                    target: i.clone(),
                });
            }
        }
        for i in intermediates {
            for t in targets {
                links.push(GraphLink {
                    source: i.clone(),
                    target: t.clone(),
                });
            }
        }
    } else {
        for s in sources {
            for t in targets {
                links.push(GraphLink {
                    source: s.clone(),
                    target: t.clone(),
                });
            }
        }
    }
    (nodes, links)
}

/// Analyze a SQL script: classify referenced tables into sources, targets
/// and intermediates and derive the data-flow graph.
///
/// Never fails. A script the parser cannot process degrades to the
/// statement classifier's CREATE-table set alone, and an empty refined
/// classification falls back to the parser's raw table sets.
pub fn analyze(sql: &str) -> LineageResult {
    let create_tables = collect_create_tables(sql);
    let parsed = match extract_tables(sql) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("SQL parse failed, classifying from statements only: {e}");
            ParsedTables::default()
        }
    };
    resolve_lineage(&create_tables, &parsed)
}
