use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

/// Parsed command from SQL input.
///
/// Capacity and status travel as raw text; the engine owns their validation.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        id: Ulid,
        start_time: NaiveTime,
        end_time: NaiveTime,
        capacity: Option<String>,
        note: Option<String>,
    },
    GenerateSlots,
    ToggleSlot {
        slot_id: Ulid,
    },
    UpdateCapacity {
        slot_id: Ulid,
        capacity: String,
        view_date: Option<NaiveDate>,
    },
    DeleteSlot {
        id: Ulid,
        view_date: Option<NaiveDate>,
    },
    InsertBooking {
        id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        package_id: Ulid,
        vehicle_type: String,
        custom_vehicle_type: Option<String>,
        address: Option<String>,
        contact_number: Option<String>,
    },
    SetBookingStatus {
        booking_id: Ulid,
        status: String,
    },
    ArchiveBooking {
        booking_id: Ulid,
    },
    SelectSlots {
        date: Option<NaiveDate>,
    },
    SelectOpenSlots {
        date: NaiveDate,
    },
    SelectBookings {
        archived: bool,
    },
    SelectBookingStats,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    // Generation takes no input; accept DEFAULT VALUES or any row.
    if table == "slot_generation" {
        return Ok(Command::GenerateSlots);
    }
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };
    let optional = |i: usize| values.get(i).map(parse_text_or_null).transpose().map(Option::flatten);

    match table.as_str() {
        "slots" => {
            arity(3)?;
            Ok(Command::InsertSlot {
                id: parse_ulid_expr(&values[0])?,
                start_time: parse_time_expr(&values[1])?,
                end_time: parse_time_expr(&values[2])?,
                capacity: optional(3)?,
                note: optional(4)?,
            })
        }
        "slot_toggles" => {
            arity(1)?;
            Ok(Command::ToggleSlot {
                slot_id: parse_ulid_expr(&values[0])?,
            })
        }
        "slot_capacity" => {
            arity(2)?;
            Ok(Command::UpdateCapacity {
                slot_id: parse_ulid_expr(&values[0])?,
                capacity: parse_text_expr(&values[1])?,
                view_date: values.get(2).map(parse_date_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            arity(5)?;
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(&values[0])?,
                slot_id: parse_ulid_expr(&values[1])?,
                date: parse_date_expr(&values[2])?,
                package_id: parse_ulid_expr(&values[3])?,
                vehicle_type: parse_text_expr(&values[4])?,
                custom_vehicle_type: optional(5)?,
                address: optional(6)?,
                contact_number: optional(7)?,
            })
        }
        "booking_status" => {
            arity(2)?;
            Ok(Command::SetBookingStatus {
                booking_id: parse_ulid_expr(&values[0])?,
                status: parse_text_expr(&values[1])?,
            })
        }
        "booking_archive" => {
            arity(1)?;
            Ok(Command::ArchiveBooking {
                booking_id: parse_ulid_expr(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "slots" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = collect_filters(delete.selection.as_ref())?;
    let id = filters.get("id").ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::DeleteSlot {
        id: parse_ulid_expr(id)?,
        view_date: filters.get("view_date").map(parse_date_expr).transpose()?,
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
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            date: filters.get("date").map(parse_date_expr).transpose()?,
        }),
        "open_slots" => {
            let date = filters.get("date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectOpenSlots {
                date: parse_date_expr(date)?,
            })
        }
        "bookings" => Ok(Command::SelectBookings {
            archived: filters.get("archived").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "booking_stats" => Ok(Command::SelectBookingStats),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms of an AND chain, keyed by lowercase column name.
struct Filters<'a>(Vec<(String, &'a Expr)>);

impl<'a> Filters<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }
}

fn collect_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_terms(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_eq_terms<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_terms(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_terms(left, out)?;
                collect_eq_terms(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "slots" => "slots",
        "slot_toggles" => "slot_toggles",
        "slot_capacity" => "slot_capacity",
        "bookings" => "bookings",
        "booking_status" => "booking_status",
        "booking_archive" => "booking_archive",
        _ => "table",
    }
}

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

/// String or numeric literal as text. `NULL` is rejected.
fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected text, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(format!("-{}", parse_text_expr(expr)?)),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text_expr(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_date_expr(expr).map(Some),
    }
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text_expr(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
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
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
