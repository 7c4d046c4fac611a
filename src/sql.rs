use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const BOOKING_COLUMNS: [&str; 5] = [
    "guest_name",
    "guest_email",
    "property_id",
    "start_date",
    "end_date",
];
const BLOCK_COLUMNS: [&str; 4] = ["property_id", "start_date", "end_date", "reason"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking(BookingRequest),
    UpdateBooking { id: Ulid, request: BookingRequest },
    CancelBooking { id: Ulid },
    RebookBooking { id: Ulid, request: BookingRequest },
    DeleteBooking { id: Ulid },
    SelectBooking { id: Ulid },
    SelectBookingsByGuest { guest_name: String },
    SelectBookingsByProperty { property_id: PropertyId },
    InsertBlock(BlockRequest),
    UpdateBlock { id: Ulid, request: BlockRequest },
    DeleteBlock { id: Ulid },
    SelectBlock { id: Ulid },
    SelectBlocks { property_id: PropertyId },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

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
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    match table.as_str() {
        "bookings" => {
            let fields = Fields::from_row("bookings", &BOOKING_COLUMNS, &columns, values)?;
            Ok(Command::InsertBooking(booking_request(&fields)?))
        }
        "blocks" => {
            let fields = Fields::from_row("blocks", &BLOCK_COLUMNS, &columns, values)?;
            Ok(Command::InsertBlock(block_request(&fields)?))
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
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "bookings" => {
            let mut allowed = BOOKING_COLUMNS.to_vec();
            allowed.push("status");
            let mut fields = Fields::from_assignments(&allowed, assignments)?;
            match fields.take("status") {
                None => Ok(Command::UpdateBooking {
                    id,
                    request: booking_request(&fields)?,
                }),
                Some(status) => match parse_text(status)?.to_lowercase().as_str() {
                    "canceled" | "cancelled" => {
                        if !fields.is_empty() {
                            return Err(SqlError::Unsupported(
                                "cancel does not take other fields".into(),
                            ));
                        }
                        Ok(Command::CancelBooking { id })
                    }
                    "active" => Ok(Command::RebookBooking {
                        id,
                        request: booking_request(&fields)?,
                    }),
                    "deleted" => Err(SqlError::Unsupported(
                        "use DELETE to delete a booking".into(),
                    )),
                    other => Err(SqlError::Invalid("status", format!("unknown status {other}"))),
                },
            }
        }
        "blocks" => {
            let fields = Fields::from_assignments(&BLOCK_COLUMNS, assignments)?;
            // Fields are replaced wholesale, so `reason` must be explicit.
            if !fields.contains("reason") {
                return Err(SqlError::MissingColumn("reason"));
            }
            Ok(Command::UpdateBlock {
                id,
                request: block_request(&fields)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "blocks" => Ok(Command::DeleteBlock { id }),
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

    let (column, value) = select
        .selection
        .as_ref()
        .and_then(equality_filter)
        .ok_or(SqlError::MissingFilter("a single column = value"))?;

    match (table.as_str(), column.as_str()) {
        ("bookings", "id") => Ok(Command::SelectBooking {
            id: parse_ulid(value)?,
        }),
        ("bookings", "guest_name") => Ok(Command::SelectBookingsByGuest {
            guest_name: parse_text(value)?,
        }),
        ("bookings", "property_id") => Ok(Command::SelectBookingsByProperty {
            property_id: parse_text(value)?,
        }),
        ("blocks", "id") => Ok(Command::SelectBlock {
            id: parse_ulid(value)?,
        }),
        ("blocks", "property_id") => Ok(Command::SelectBlocks {
            property_id: parse_text(value)?,
        }),
        ("bookings", _) | ("blocks", _) => Err(SqlError::UnsupportedFilter(column)),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Field collection ──────────────────────────────────────────

/// Column → value expressions of one INSERT row or UPDATE SET list.
struct Fields<'a> {
    values: HashMap<&'static str, &'a Expr>,
}

impl<'a> Fields<'a> {
    /// Without a column list, values are positional in `known` order.
    fn from_row(
        table: &'static str,
        known: &[&'static str],
        columns: &[String],
        row: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let mut values = HashMap::new();
        if columns.is_empty() {
            if row.len() > known.len() {
                return Err(SqlError::WrongArity(table, known.len(), row.len()));
            }
            for (col, expr) in known.iter().zip(row) {
                values.insert(*col, expr);
            }
        } else {
            if columns.len() != row.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            for (name, expr) in columns.iter().zip(row) {
                let col = resolve_column(known, name)?;
                if values.insert(col, expr).is_some() {
                    return Err(SqlError::DuplicateColumn(name.clone()));
                }
            }
        }
        Ok(Self { values })
    }

    fn from_assignments(
        known: &[&'static str],
        assignments: &'a [ast::Assignment],
    ) -> Result<Self, SqlError> {
        let mut values = HashMap::new();
        for a in assignments {
            let name = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name)
                    .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
                AssignmentTarget::Tuple(_) => {
                    return Err(SqlError::Unsupported("tuple assignment".into()));
                }
            };
            let col = resolve_column(known, &name)?;
            if values.insert(col, &a.value).is_some() {
                return Err(SqlError::DuplicateColumn(name));
            }
        }
        Ok(Self { values })
    }

    fn take(&mut self, col: &str) -> Option<&'a Expr> {
        self.values.remove(col)
    }

    fn contains(&self, col: &str) -> bool {
        self.values.contains_key(col)
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.values.get(col).copied().ok_or(SqlError::MissingColumn(col))
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        let s = parse_text(self.required(col)?)?;
        if s.trim().is_empty() {
            return Err(SqlError::Invalid(col, "must not be blank".into()));
        }
        Ok(s)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.required(col)?)
            .map_err(|e| SqlError::Invalid(col, e))
    }
}

fn resolve_column(known: &[&'static str], name: &str) -> Result<&'static str, SqlError> {
    known
        .iter()
        .find(|k| **k == name)
        .copied()
        .ok_or_else(|| SqlError::UnknownColumn(name.to_string()))
}

fn booking_request(fields: &Fields<'_>) -> Result<BookingRequest, SqlError> {
    let guest_email = fields.text("guest_email")?;
    validate_email(&guest_email)?;
    Ok(BookingRequest {
        guest_name: fields.text("guest_name")?,
        guest_email,
        property_id: fields.text("property_id")?,
        range: DateRange::new(fields.date("start_date")?, fields.date("end_date")?),
    })
}

fn block_request(fields: &Fields<'_>) -> Result<BlockRequest, SqlError> {
    let reason = match fields.values.get("reason") {
        Some(expr) => parse_text_or_null(expr)?,
        None => None,
    };
    Ok(BlockRequest {
        property_id: fields.text("property_id")?,
        range: DateRange::new(fields.date("start_date")?, fields.date("end_date")?),
        reason,
    })
}

/// One `@`, with something on both sides.
fn validate_email(email: &str) -> Result<(), SqlError> {
    let mut parts = email.split('@');
    let valid = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty()
    );
    if !valid {
        return Err(SqlError::Invalid("guest_email", format!("not an email address: {email}")));
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `column = value` as a (lowercased column, value) pair.
fn equality_filter(expr: &Expr) -> Option<(String, &Expr)> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => expr_column_name(left).map(|col| (col, right.as_ref())),
        Expr::Nested(inner) => equality_filter(inner),
        _ => None,
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref().and_then(equality_filter) {
        Some((col, value)) if col == "id" => parse_ulid(value),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// The literal behind an expression, looking through `::type` casts.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, String> {
    let s = parse_text(expr).map_err(|e| e.to_string())?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("bad date {s}: {e}"))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    DuplicateColumn(String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
    Invalid(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::DuplicateColumn(c) => write!(f, "column given twice: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "cannot filter on column: {col}"),
            SqlError::Invalid(col, msg) => write!(f, "invalid {col}: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
