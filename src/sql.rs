use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStaff {
        id: Ulid,
        name: Option<String>,
    },
    InsertSubject {
        id: Ulid,
        name: Option<String>,
    },
    InsertBooking(NewBooking),
    UpdateBooking {
        id: Ulid,
        changes: BookingChanges,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertReference {
        booking_id: Ulid,
        ref_id: Ulid,
    },
    DeleteReference {
        booking_id: Ulid,
        ref_id: Ulid,
    },
    SelectResources {
        kind: ResourceKind,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookingsByResource {
        resource_id: Ulid,
        status: Option<BookingStatus>,
    },
    SelectBookingsInRange {
        start: Ms,
        end: Ms,
    },
    /// Across all resources; `None` lists every booking.
    SelectBookingsByStatus {
        status: Option<BookingStatus>,
    },
    SelectAvailability {
        staff_id: Ulid,
        subject_id: Ulid,
        start: Ms,
        end: Ms,
        duration: Option<Ms>,
    },
}

/// Column order assumed when an INSERT names no columns.
const BOOKING_COLUMNS: &[&str] = &["staff_id", "subject_id", "start", "end", "kind", "notes"];
const RESOURCE_COLUMNS: &[&str] = &["id", "name"];
const REFERENCE_COLUMNS: &[&str] = &["booking_id", "ref_id"];

fn resource_kind_of(table: &str) -> Option<ResourceKind> {
    match table {
        "staff" => Some(ResourceKind::Staff),
        "subjects" | "cases" => Some(ResourceKind::Subject),
        _ => None,
    }
}

/// Parse a single statement. Anything after the first statement is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_batch(sql)?.into_iter().next().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement of a simple query.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    if let Some(kind) = resource_kind_of(&table) {
        let row = named_row(&columns, RESOURCE_COLUMNS, &rows[0])?;
        let id = parse_ulid_expr(row.require("id")?)?;
        let name = row.get("name").map(parse_string_or_null).transpose()?.flatten();
        return Ok(match kind {
            ResourceKind::Staff => Command::InsertStaff { id, name },
            ResourceKind::Subject => Command::InsertSubject { id, name },
        });
    }

    match table.as_str() {
        "bookings" => {
            let row = named_row(&columns, BOOKING_COLUMNS, &rows[0])?;
            if row.get("id").is_some() {
                return Err(SqlError::Unsupported("booking ids are assigned by the server".into()));
            }
            Ok(Command::InsertBooking(NewBooking {
                staff_id: row.get("staff_id").map(parse_ulid_or_null).transpose()?.flatten(),
                subject_id: row.get("subject_id").map(parse_ulid_or_null).transpose()?.flatten(),
                start: row.get("start").map(parse_i64_or_null).transpose()?.flatten(),
                end: row.get("end").map(parse_i64_or_null).transpose()?.flatten(),
                kind: row.get("kind").map(parse_kind).transpose()?,
                notes: row.get("notes").map(parse_string_or_null).transpose()?.flatten(),
            }))
        }
        "booking_refs" => {
            let row = named_row(&columns, REFERENCE_COLUMNS, &rows[0])?;
            Ok(Command::InsertReference {
                booking_id: parse_ulid_expr(row.require("booking_id")?)?,
                ref_id: parse_ulid_expr(row.require("ref_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut changes = BookingChanges::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "staff_id" => changes.staff_id = Some(parse_ulid_expr(value)?),
            "subject_id" => changes.subject_id = Some(parse_ulid_expr(value)?),
            "start" => changes.start = Some(parse_i64_expr(value)?),
            "end" => changes.end = Some(parse_i64_expr(value)?),
            "status" => changes.status = Some(parse_status(value)?),
            "kind" => changes.kind = Some(parse_kind(value)?),
            "notes" => changes.notes = parse_string_or_null(value)?,
            "id" => return Err(SqlError::Unsupported("booking id is immutable".into())),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    Ok(Command::UpdateBooking {
        id: extract_where_id(selection)?,
        changes,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        "booking_refs" => {
            let filters = Filters::collect(delete.selection.as_ref())?;
            Ok(Command::DeleteReference {
                booking_id: parse_ulid_expr(filters.eq("booking_id").ok_or(SqlError::MissingFilter("booking_id"))?)?,
                ref_id: parse_ulid_expr(filters.eq("ref_id").ok_or(SqlError::MissingFilter("ref_id"))?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    if let Some(kind) = resource_kind_of(&table) {
        return Ok(Command::SelectResources { kind });
    }

    match table.as_str() {
        "bookings" => {
            if let Some(id) = filters.eq("id") {
                return Ok(Command::SelectBooking { id: parse_ulid_expr(id)? });
            }
            if let Some(resource_id) = filters.eq("resource_id") {
                return Ok(Command::SelectBookingsByResource {
                    resource_id: parse_ulid_expr(resource_id)?,
                    status: filters.eq("status").map(parse_status).transpose()?,
                });
            }
            match (filters.lower_bound("start"), filters.upper_bound("end")) {
                (Some(start), Some(end)) => Ok(Command::SelectBookingsInRange {
                    start: parse_i64_expr(start)?,
                    end: parse_i64_expr(end)?,
                }),
                (None, None) => Ok(Command::SelectBookingsByStatus {
                    status: filters.eq("status").map(parse_status).transpose()?,
                }),
                _ => Err(SqlError::MissingFilter("start and end")),
            }
        }
        "availability" => Ok(Command::SelectAvailability {
            staff_id: parse_ulid_expr(filters.eq("staff_id").ok_or(SqlError::MissingFilter("staff_id"))?)?,
            subject_id: parse_ulid_expr(filters.eq("subject_id").ok_or(SqlError::MissingFilter("subject_id"))?)?,
            start: parse_i64_expr(filters.lower_bound("start").ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_i64_expr(filters.upper_bound("end").ok_or(SqlError::MissingFilter("end"))?)?,
            duration: filters.eq("duration").map(parse_i64_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `column op value` terms of a WHERE clause made only of ANDs.
struct Filters<'a> {
    terms: Vec<(String, &'a ast::BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters { terms: Vec::new() };
        if let Some(expr) = selection {
            filters.walk(expr)?;
        }
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.walk(left)?;
                self.walk(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.terms.push((column, op, &**right));
                Ok(())
            }
            Expr::Nested(inner) => self.walk(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(&self, column: &str, ops: &[ast::BinaryOperator]) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && ops.contains(op))
            .map(|(_, _, v)| *v)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &[ast::BinaryOperator::Eq])
    }

    fn lower_bound(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &[ast::BinaryOperator::GtEq, ast::BinaryOperator::Gt])
    }

    fn upper_bound(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &[ast::BinaryOperator::LtEq, ast::BinaryOperator::Lt])
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = Filters::collect(selection.as_ref())?;
    parse_ulid_expr(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)
}

// ── INSERT rows ───────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct NamedRow<'a> {
    values: Vec<(&'a str, &'a Expr)>,
}

impl<'a> NamedRow<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, v)| *v)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn named_row<'a>(
    columns: &'a [String],
    defaults: &'static [&'static str],
    row: &'a [Expr],
) -> Result<NamedRow<'a>, SqlError> {
    let names: Vec<&'a str> = if columns.is_empty() {
        defaults.to_vec()
    } else {
        columns.iter().map(String::as_str).collect()
    };
    if row.len() != names.len() && !(columns.is_empty() && row.len() < names.len()) {
        return Err(SqlError::WrongArity(names.len(), row.len()));
    }
    if let Some(unknown) = names.iter().find(|n| !defaults.contains(n) && **n != "id") {
        return Err(SqlError::UnknownColumn(unknown.to_string()));
    }
    Ok(NamedRow {
        values: names.into_iter().zip(row.iter()).collect(),
    })
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64_expr(expr).map(Some)
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string_expr(expr)?;
    BookingStatus::parse(&s).ok_or(SqlError::BadEnum("status", s))
}

fn parse_kind(expr: &Expr) -> Result<BookingKind, SqlError> {
    let s = parse_string_expr(expr)?;
    BookingKind::parse(&s).ok_or(SqlError::BadEnum("kind", s))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {0}: {1}")]
    BadEnum(&'static str, String),
}
