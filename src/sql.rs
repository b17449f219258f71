use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSubject {
        id: Ulid,
        name: Option<String>,
    },
    UpdateSubject {
        id: Ulid,
        name: Option<String>,
    },
    DeleteSubject {
        id: Ulid,
    },
    /// Wholesale upsert of one limit set. Units absent from the statement
    /// (omitted column or NULL) are absent from the set.
    ReplaceLimits {
        subject_id: Ulid,
        kind: LimitKind,
        limits: LimitSet,
    },
    ClearLimits {
        subject_id: Ulid,
        kind: LimitKind,
    },
    InsertBooking {
        id: Ulid,
        subject_id: Ulid,
        start: Ms,
        end: Ms,
        label: Option<String>,
    },
    BatchInsertBookings {
        // (id, subject_id, start, end, label)
        bookings: Vec<(Ulid, Ulid, Ms, Ms, Option<String>)>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectSubjects,
    SelectLimits {
        subject_id: Ulid,
        kind: LimitKind,
    },
    SelectBookings {
        subject_id: Ulid,
    },
    SelectUsage {
        subject_id: Ulid,
        ts: Ms,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn limit_kind_for_table(table: &str) -> Option<LimitKind> {
    match table {
        "booking_limits" => Some(LimitKind::Bookings),
        "duration_limits" => Some(LimitKind::Minutes),
        _ => None,
    }
}

fn unit_for_column(name: &str) -> Option<LimitUnit> {
    match name {
        "per_day" => Some(LimitUnit::Day),
        "per_week" => Some(LimitUnit::Week),
        "per_month" => Some(LimitUnit::Month),
        "per_year" => Some(LimitUnit::Year),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    if let Some(kind) = limit_kind_for_table(&table) {
        let values = extract_insert_values(insert)?;
        let (subject_id, limits) = parse_limit_row(&insert.columns, &values)?;
        return Ok(Command::ReplaceLimits { subject_id, kind, limits });
    }

    match table.as_str() {
        "subjects" => {
            let values = extract_insert_values(insert)?;
            if values.is_empty() {
                return Err(SqlError::WrongArity("subjects", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            Ok(Command::InsertSubject { id, name })
        }
        "bookings" => {
            let all_rows = extract_all_insert_rows(insert)?;
            if all_rows.len() == 1 {
                let values = &all_rows[0];
                let (id, subject_id, start, end, label) = parse_booking_row(values)?;
                Ok(Command::InsertBooking { id, subject_id, start, end, label })
            } else {
                let mut bookings = Vec::with_capacity(all_rows.len());
                for (i, row) in all_rows.iter().enumerate() {
                    let parsed = parse_booking_row(row)
                        .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                    bookings.push(parsed);
                }
                Ok(Command::BatchInsertBookings { bookings })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One booking row: (id, subject_id, start, "end"[, label]).
fn parse_booking_row(
    values: &[Expr],
) -> Result<(Ulid, Ulid, Ms, Ms, Option<String>), SqlError> {
    if values.len() < 4 {
        return Err(SqlError::WrongArity("bookings", 4, values.len()));
    }
    let id = parse_ulid(&values[0])?;
    let subject_id = parse_ulid(&values[1])?;
    let start = parse_i64(&values[2])?;
    let end = parse_i64(&values[3])?;
    if start >= end {
        return Err(SqlError::Parse(format!(
            "booking start must be before end: {start} >= {end}"
        )));
    }
    let label = if values.len() >= 5 {
        parse_string_or_null(&values[4])?
    } else {
        None
    };
    Ok((id, subject_id, start, end, label))
}

/// A limit row builds a LimitSet. With a column list, values map by column
/// name and units may be omitted; without one, the positional layout is
/// (subject_id, per_day, per_week, per_month, per_year) with NULL or a
/// missing trailing value meaning "no cap for that unit".
fn parse_limit_row(
    columns: &[ast::Ident],
    values: &[Expr],
) -> Result<(Ulid, LimitSet), SqlError> {
    let mut subject_id = None;
    let mut limits = LimitSet::default();

    if columns.is_empty() {
        if values.is_empty() {
            return Err(SqlError::WrongArity("limits", 1, 0));
        }
        subject_id = Some(parse_ulid(&values[0])?);
        for (i, unit) in ASCENDING_UNITS.iter().enumerate() {
            if let Some(expr) = values.get(i + 1)
                && let Some(cap) = parse_u32_or_null(expr)?
            {
                limits.set(*unit, cap);
            }
        }
    } else {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity("limits", columns.len(), values.len()));
        }
        for (col, expr) in columns.iter().zip(values) {
            let name = col.value.to_lowercase();
            if name == "subject_id" {
                subject_id = Some(parse_ulid(expr)?);
            } else if let Some(unit) = unit_for_column(&name) {
                if let Some(cap) = parse_u32_or_null(expr)? {
                    limits.set(unit, cap);
                }
            } else {
                return Err(SqlError::UnknownColumn(name));
            }
        }
    }

    Ok((subject_id.ok_or(SqlError::MissingFilter("subject_id"))?, limits))
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "subjects" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut name = None;
    for assignment in assignments {
        let col = assignment_column_name(assignment)
            .ok_or_else(|| SqlError::Parse("unsupported assignment target".into()))?;
        if col == "name" {
            name = parse_string_or_null(&assignment.value)?;
        } else {
            return Err(SqlError::UnknownColumn(col));
        }
    }

    let id = extract_where_ulid(selection, "id")?;
    Ok(Command::UpdateSubject { id, name })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    if let Some(kind) = limit_kind_for_table(&table) {
        let subject_id = extract_where_ulid(&delete.selection, "subject_id")?;
        return Ok(Command::ClearLimits { subject_id, kind });
    }

    match table.as_str() {
        "subjects" => Ok(Command::DeleteSubject {
            id: extract_where_ulid(&delete.selection, "id")?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_ulid(&delete.selection, "id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    if let Some(kind) = limit_kind_for_table(&table) {
        let subject_id = extract_where_ulid(&select.selection, "subject_id")?;
        return Ok(Command::SelectLimits { subject_id, kind });
    }

    match table.as_str() {
        "subjects" => Ok(Command::SelectSubjects),
        "bookings" => Ok(Command::SelectBookings {
            subject_id: extract_where_ulid(&select.selection, "subject_id")?,
        }),
        "usage" => {
            let (mut subject_id, mut ts) = (None, None);
            if let Some(selection) = &select.selection {
                extract_usage_filters(selection, &mut subject_id, &mut ts)?;
            }
            Ok(Command::SelectUsage {
                subject_id: subject_id.ok_or(SqlError::MissingFilter("subject_id"))?,
                ts: ts.ok_or(SqlError::MissingFilter("ts"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_usage_filters(
    expr: &Expr,
    subject_id: &mut Option<Ulid>,
    ts: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_usage_filters(left, subject_id, ts)?;
                extract_usage_filters(right, subject_id, ts)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("subject_id") {
                    *subject_id = Some(parse_ulid_expr(right)?);
                } else if col.as_deref() == Some("ts") {
                    *ts = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
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
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column_name(assignment: &Assignment) -> Option<String> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_ulid(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some(column) {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter(column))
            }
        }
        _ => Err(SqlError::MissingFilter(column)),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_u32(expr)?))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
