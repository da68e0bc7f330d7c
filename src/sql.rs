use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::PaymentOutcome;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        professional_id: Ulid,
        start: Ms,
        end: Ms,
        duration_minutes: i64,
        after: Option<Ms>,
        notice_days: Option<u32>,
        max_results: Option<usize>,
    },
    InsertHold {
        professional_id: Ulid,
        customer_id: String,
        start: Ms,
        end: Ms,
        service_ids: Vec<String>,
        payment_reference: String,
    },
    InsertPaymentEvent {
        payment_reference: String,
        outcome: PaymentOutcome,
    },
    /// Operator compare-and-swap: `(appointment_id, expected_state, next_state)`.
    InsertTransition {
        id: Ulid,
        expected: AppointmentState,
        next: AppointmentState,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectEscalations,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Professional(Ulid),
    PaymentReference(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "holds" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("holds", 6, values.len()));
            }
            Ok(Command::InsertHold {
                professional_id: parse_ulid_expr(&values[0])?,
                customer_id: parse_string_expr(&values[1])?,
                start: parse_i64_expr(&values[2])?,
                end: parse_i64_expr(&values[3])?,
                service_ids: parse_list_expr(&values[4])?,
                payment_reference: parse_string_expr(&values[5])?,
            })
        }
        "payment_events" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("payment_events", 2, values.len()));
            }
            let outcome = parse_string_expr(&values[1])?;
            Ok(Command::InsertPaymentEvent {
                payment_reference: parse_string_expr(&values[0])?,
                outcome: PaymentOutcome::parse(&outcome)
                    .ok_or_else(|| SqlError::Parse(format!("bad payment outcome: {outcome}")))?,
            })
        }
        "transitions" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("transitions", 3, values.len()));
            }
            Ok(Command::InsertTransition {
                id: parse_ulid_expr(&values[0])?,
                expected: parse_state_expr(&values[1])?,
                next: parse_state_expr(&values[2])?,
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

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            professional_id: filters.professional_id.ok_or(SqlError::MissingFilter("professional_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            duration_minutes: filters.duration.ok_or(SqlError::MissingFilter("duration"))?,
            after: filters.after,
            notice_days: filters.notice_days,
            max_results: filters.max_results,
        }),
        "appointments" => {
            let filter = if let Some(id) = filters.id {
                AppointmentFilter::Id(id)
            } else if let Some(pid) = filters.professional_id {
                AppointmentFilter::Professional(pid)
            } else if let Some(reference) = filters.payment_reference {
                AppointmentFilter::PaymentReference(reference)
            } else {
                return Err(SqlError::MissingFilter("id, professional_id or payment_reference"));
            };
            Ok(Command::SelectAppointments { filter })
        }
        "escalations" => Ok(Command::SelectEscalations),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    professional_id: Option<Ulid>,
    payment_reference: Option<String>,
    start: Option<Ms>,
    end: Option<Ms>,
    duration: Option<i64>,
    after: Option<Ms>,
    notice_days: Option<u32>,
    max_results: Option<usize>,
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Ok(());
    };
    let col = expr_column_name(left);
    match (op, col.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)?;
        }
        (ast::BinaryOperator::Eq, Some("id")) => filters.id = Some(parse_ulid_expr(right)?),
        (ast::BinaryOperator::Eq, Some("professional_id")) => {
            filters.professional_id = Some(parse_ulid_expr(right)?)
        }
        (ast::BinaryOperator::Eq, Some("payment_reference")) => {
            filters.payment_reference = Some(parse_string_expr(right)?)
        }
        (ast::BinaryOperator::Eq, Some("duration")) => filters.duration = Some(parse_i64_expr(right)?),
        (ast::BinaryOperator::Eq, Some("after")) => filters.after = Some(parse_i64_expr(right)?),
        (ast::BinaryOperator::Eq, Some("notice_days")) => {
            filters.notice_days = Some(parse_non_negative(right)?)
        }
        (ast::BinaryOperator::Eq, Some("max_results")) => {
            filters.max_results = Some(parse_non_negative(right)?)
        }
        (ast::BinaryOperator::GtEq, Some("start")) => filters.start = Some(parse_i64_expr(right)?),
        (ast::BinaryOperator::LtEq, Some("end")) => filters.end = Some(parse_i64_expr(right)?),
        _ => {}
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// `'a, b'` → `["a", "b"]`
fn parse_list_expr(expr: &Expr) -> Result<Vec<String>, SqlError> {
    Ok(parse_string_expr(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_state_expr(expr: &Expr) -> Result<AppointmentState, SqlError> {
    let s = parse_string_expr(expr)?;
    AppointmentState::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown state: {s}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
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

fn parse_non_negative<T: TryFrom<i64>>(expr: &Expr) -> Result<T, SqlError> {
    let v = parse_i64_expr(expr)?;
    T::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
