use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SlotQuery;
use crate::model::*;

/// Column order for `INSERT INTO reservations` without a column list.
const RESERVATION_COLUMNS: [&str; 8] = [
    "pool_id",
    "kind",
    "subtype",
    "unit_number",
    "date",
    "start",
    "end",
    "notes",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability {
        slot: SlotQuery,
    },
    SelectAvailableUnits {
        slot: SlotQuery,
    },
    InsertReservation {
        slot: SlotQuery,
        unit_number: u32,
        notes: Option<String>,
    },
    CancelReservation {
        id: Ulid,
    },
    InsertStatusChange {
        id: Ulid,
        status: ReservationStatus,
    },
    InsertPaymentUpdate {
        id: Ulid,
        payment_status: PaymentStatus,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectPoolReservations {
        pool_id: Ulid,
        date: NaiveDate,
    },
    SelectMyReservations,
    Listen {
        channel: String,
    },
    /// `None` is `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen {
            channel: channel.to_string(),
        });
    }
    if let Some(channel) = strip_keyword(trimmed, "UNLISTEN ") {
        let channel = (channel != "*").then(|| channel.to_string());
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The channel argument of a LISTEN-style statement, if `sql` is one.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let channel = sql[keyword.len()..].trim().trim_end_matches(';').trim();
    (!channel.is_empty()).then_some(channel)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "reservations" => {
            let row = named_row(insert, &values, &RESERVATION_COLUMNS)?;
            let slot = slot_from(&row)?;
            let unit_number = parse_u32(required(&row, "unit_number")?)?;
            let notes = match row.get("notes") {
                Some(expr) => parse_text_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                slot,
                unit_number,
                notes,
            })
        }
        "status_changes" => {
            let row = named_row(insert, &values, &["reservation_id", "status"])?;
            Ok(Command::InsertStatusChange {
                id: parse_ulid(required(&row, "reservation_id")?)?,
                status: parse_enum(required(&row, "status")?)?,
            })
        }
        "payment_updates" => {
            let row = named_row(insert, &values, &["reservation_id", "payment_status"])?;
            Ok(Command::InsertPaymentUpdate {
                id: parse_ulid(required(&row, "reservation_id")?)?,
                payment_status: parse_enum(required(&row, "payment_status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = where_filters(delete.selection.as_ref())?;
    Ok(Command::CancelReservation {
        id: parse_ulid(required_filter(&filters, "id")?)?,
    })
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            slot: slot_from_filters(&filters)?,
        }),
        "available_units" => Ok(Command::SelectAvailableUnits {
            slot: slot_from_filters(&filters)?,
        }),
        "reservations" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectReservation { id: parse_ulid(id)? });
            }
            match filters.get("pool_id") {
                Some(pool_id) => Ok(Command::SelectPoolReservations {
                    pool_id: parse_ulid(pool_id)?,
                    date: parse_date(required_filter(&filters, "date")?)?,
                }),
                None => Ok(Command::SelectMyReservations),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn slot_from_filters(filters: &HashMap<String, Expr>) -> Result<SlotQuery, SqlError> {
    let row: HashMap<String, &Expr> = filters.iter().map(|(k, v)| (k.clone(), v)).collect();
    slot_from(&row).map_err(|e| match e {
        SqlError::MissingColumn(col) => SqlError::MissingFilter(col),
        other => other,
    })
}

/// The `(pool_id, kind, subtype, date, start, end)` part shared by the
/// availability reads and the reservation insert.
fn slot_from(row: &HashMap<String, &Expr>) -> Result<SlotQuery, SqlError> {
    let kind = parse_text(required(row, "kind")?)?;
    let subtype = match row.get("subtype") {
        Some(expr) => parse_text_or_null(expr)?,
        None => None,
    };
    let unit = UnitKind::from_parts(&kind, subtype.as_deref())
        .map_err(|e| SqlError::InvalidValue(e.to_string()))?;
    Ok(SlotQuery {
        pool_id: parse_ulid(required(row, "pool_id")?)?,
        unit,
        date: parse_date(required(row, "date")?)?,
        start: parse_enum(required(row, "start")?)?,
        end: parse_enum(required(row, "end")?)?,
    })
}

/// Collect `col = value` terms joined by AND. Anything else is rejected
/// rather than silently ignored.
fn where_filters(selection: Option<&Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_filters(expr: &Expr, filters: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, filters)?;
            collect_eq_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.insert(col, right.as_ref().clone());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, filters),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// Pair INSERT values with their columns, falling back to `default_columns`
/// when the statement names none.
fn named_row<'a>(
    insert: &ast::Insert,
    values: &'a [Expr],
    default_columns: &[&str],
) -> Result<HashMap<String, &'a Expr>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    Ok(columns.into_iter().zip(values.iter()).collect())
}

fn required<'a>(row: &HashMap<String, &'a Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(col).copied().ok_or(SqlError::MissingColumn(col))
}

fn required_filter<'a>(
    filters: &'a HashMap<String, Expr>,
    col: &'static str,
) -> Result<&'a Expr, SqlError> {
    filters.get(col).ok_or(SqlError::MissingFilter(col))
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// The single VALUES row of an INSERT.
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

/// A string or number literal as text; `None` for NULL.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::InvalidValue(format!("{s:?} is not a unit number")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::InvalidValue(format!("{s:?} is not a YYYY-MM-DD date")))
}

/// Anything with a `FromStr` that names its own field on failure: times,
/// statuses, payment statuses.
fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = ValueError>,
{
    parse_text(expr)?
        .parse()
        .map_err(|e: ValueError| SqlError::InvalidValue(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
