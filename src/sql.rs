use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// INSERTs use named columns because most session fields are optional.
/// `UPDATE <table> SET <flag> = NOT <flag> WHERE id = ...` is the toggle
/// form for availability and completion flags.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertInstructor {
        id: Ulid,
        name: String,
        age: u32,
        available: bool,
    },
    UpdateInstructor {
        id: Ulid,
        changes: InstructorChanges,
    },
    DeleteInstructor {
        id: Ulid,
    },
    ToggleInstructorAvailability {
        id: Ulid,
    },
    InsertSlot {
        id: Ulid,
        instructor_id: Ulid,
        pattern: String,
        start: NaiveTime,
        end: NaiveTime,
        available: bool,
    },
    UpdateSlot {
        id: Ulid,
        changes: SlotChanges,
    },
    DeleteSlot {
        id: Ulid,
    },
    ToggleSlotAvailability {
        id: Ulid,
    },
    InsertSession {
        id: Ulid,
        student_id: Ulid,
        kind: SessionKind,
        name: String,
        instructor_id: Option<Ulid>,
        slot_id: Option<Ulid>,
        date: Option<NaiveDate>,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        description: Option<String>,
        level: Option<String>,
    },
    UpdateSession {
        id: Ulid,
        changes: SessionChanges,
    },
    DeleteSession {
        id: Ulid,
    },
    ToggleSessionCompleted {
        id: Ulid,
    },
    SelectInstructors,
    SelectSlots {
        instructor_id: Option<Ulid>,
    },
    SelectSessions,
    SelectStats,
    SelectAvailability {
        slot_id: Ulid,
        date: NaiveDate,
    },
    SelectAvailableInstructors {
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    Listen {
        channel: String,
    },
    /// `None` means `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.len() >= 8 && trimmed[..8].eq_ignore_ascii_case("UNLISTEN") {
        let rest = trimmed[8..].trim().trim_matches(';').trim();
        let channel = match rest {
            "" | "*" => None,
            name => Some(name.to_string()),
        };
        return Ok(Command::Unlisten { channel });
    }
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = named_insert_values(insert)?;

    match table.as_str() {
        "instructors" => Ok(Command::InsertInstructor {
            id: parse_ulid_expr(require(&values, "id")?)?,
            name: parse_string_expr(require(&values, "name")?)?,
            age: parse_u32_expr(require(&values, "age")?)?,
            available: match find(&values, "available") {
                Some(e) => parse_bool_expr(e)?,
                None => true,
            },
        }),
        "slots" => Ok(Command::InsertSlot {
            id: parse_ulid_expr(require(&values, "id")?)?,
            instructor_id: parse_ulid_expr(require(&values, "instructor_id")?)?,
            pattern: parse_string_expr(require(&values, "pattern")?)?,
            start: parse_time_expr(require(&values, "start")?)?,
            end: parse_time_expr(require(&values, "end")?)?,
            available: match find(&values, "available") {
                Some(e) => parse_bool_expr(e)?,
                None => true,
            },
        }),
        "sessions" => Ok(Command::InsertSession {
            id: parse_ulid_expr(require(&values, "id")?)?,
            student_id: parse_ulid_expr(require(&values, "student_id")?)?,
            kind: parse_kind_expr(require(&values, "kind")?)?,
            name: parse_string_expr(require(&values, "name")?)?,
            instructor_id: opt_null(&values, "instructor_id", parse_ulid_expr)?,
            slot_id: opt_null(&values, "slot_id", parse_ulid_expr)?,
            date: opt_null(&values, "date", parse_date_expr)?,
            start: opt_null(&values, "start", parse_time_expr)?,
            end: opt_null(&values, "end", parse_time_expr)?,
            description: opt_null(&values, "description", parse_string_expr)?,
            level: opt_null(&values, "level", parse_string_expr)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    // The toggle form: a single `col = NOT col` assignment.
    if let [assignment] = assignments
        && let Expr::UnaryOp {
            op: ast::UnaryOperator::Not,
            expr,
        } = &assignment.value
    {
        let target = assignment_column(assignment)?;
        if expr_column_name(expr).as_deref() != Some(target.as_str()) {
            return Err(SqlError::Unsupported(
                "NOT must negate the assigned column".into(),
            ));
        }
        return match (table.as_str(), target.as_str()) {
            ("instructors", "available") => Ok(Command::ToggleInstructorAvailability { id }),
            ("slots", "available") => Ok(Command::ToggleSlotAvailability { id }),
            ("sessions", "completed") => Ok(Command::ToggleSessionCompleted { id }),
            _ => Err(SqlError::Unsupported(format!(
                "cannot toggle {table}.{target}"
            ))),
        };
    }

    match table.as_str() {
        "instructors" => {
            let mut changes = InstructorChanges::default();
            for a in assignments {
                let col = assignment_column(a)?;
                match col.as_str() {
                    "name" => changes.name = Some(parse_string_expr(&a.value)?),
                    "age" => changes.age = Some(parse_u32_expr(&a.value)?),
                    other => return Err(SqlError::UnknownColumn(format!("instructors.{other}"))),
                }
            }
            Ok(Command::UpdateInstructor { id, changes })
        }
        "slots" => {
            let mut changes = SlotChanges::default();
            for a in assignments {
                let col = assignment_column(a)?;
                match col.as_str() {
                    "pattern" => changes.pattern = Some(parse_string_expr(&a.value)?),
                    "start" => changes.start = Some(parse_time_expr(&a.value)?),
                    "end" => changes.end = Some(parse_time_expr(&a.value)?),
                    "available" => changes.available = Some(parse_bool_expr(&a.value)?),
                    other => return Err(SqlError::UnknownColumn(format!("slots.{other}"))),
                }
            }
            Ok(Command::UpdateSlot { id, changes })
        }
        "sessions" => {
            let mut changes = SessionChanges::default();
            for a in assignments {
                let col = assignment_column(a)?;
                match col.as_str() {
                    "student_id" => changes.student_id = Some(parse_ulid_expr(&a.value)?),
                    "kind" => changes.kind = Some(parse_kind_expr(&a.value)?),
                    "name" => changes.name = Some(parse_string_expr(&a.value)?),
                    "instructor_id" => {
                        changes.instructor_id = Some(nullable(&a.value, parse_ulid_expr)?)
                    }
                    "slot_id" => changes.slot_id = Some(nullable(&a.value, parse_ulid_expr)?),
                    "date" => changes.date = Some(nullable(&a.value, parse_date_expr)?),
                    "start" => changes.start = Some(nullable(&a.value, parse_time_expr)?),
                    "end" => changes.end = Some(nullable(&a.value, parse_time_expr)?),
                    "description" => {
                        changes.description = Some(nullable(&a.value, parse_string_expr)?)
                    }
                    "level" => changes.level = Some(nullable(&a.value, parse_string_expr)?),
                    other => return Err(SqlError::UnknownColumn(format!("sessions.{other}"))),
                }
            }
            Ok(Command::UpdateSession { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "instructors" => Ok(Command::DeleteInstructor { id }),
        "slots" => Ok(Command::DeleteSlot { id }),
        "sessions" => Ok(Command::DeleteSession { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters);
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "instructors" => Ok(Command::SelectInstructors),
        "slots" => Ok(Command::SelectSlots {
            instructor_id: match filter("instructor_id") {
                Some(e) => Some(parse_ulid_expr(e)?),
                None => None,
            },
        }),
        "sessions" => Ok(Command::SelectSessions),
        "stats" => Ok(Command::SelectStats),
        "availability" => Ok(Command::SelectAvailability {
            slot_id: parse_ulid_expr(
                filter("slot_id").ok_or(SqlError::MissingFilter("slot_id"))?,
            )?,
            date: parse_date_expr(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "available_instructors" => Ok(Command::SelectAvailableInstructors {
            date: parse_date_expr(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
            start: parse_time_expr(filter("start").ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_time_expr(filter("end").ok_or(SqlError::MissingFilter("end"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
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

/// Zip INSERT column names with the first VALUES row.
fn named_insert_values(insert: &ast::Insert) -> Result<Vec<(String, Expr)>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT requires column names".into()));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => values
            .rows
            .first()
            .ok_or(SqlError::Parse("empty VALUES".into()))?,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if row.len() != insert.columns.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            insert.columns.len(),
            row.len()
        )));
    }
    Ok(insert
        .columns
        .iter()
        .zip(row.iter())
        .map(|(c, e)| (c.value.to_lowercase(), e.clone()))
        .collect())
}

fn find<'a>(values: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
    values.iter().find(|(c, _)| c == col).map(|(_, e)| e)
}

fn require<'a>(values: &'a [(String, Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    find(values, col).ok_or(SqlError::MissingColumn(col))
}

/// Absent column or NULL value both mean "not set".
fn opt_null<T>(
    values: &[(String, Expr)],
    col: &str,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match find(values, col) {
        Some(e) => nullable(e, parse),
        None => Ok(None),
    }
}

fn nullable<T>(
    expr: &Expr,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    if matches!(extract_value(expr), Some(Value::Null)) {
        Ok(None)
    } else {
        parse(expr).map(Some)
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_kind_expr(expr: &Expr) -> Result<SessionKind, SqlError> {
    let s = parse_string_expr(expr)?;
    s.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
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
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_instructor() {
        let sql = format!("INSERT INTO instructors (id, name, age) VALUES ('{ID}', 'Ana', 30)");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertInstructor {
                id,
                name,
                age,
                available,
            } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(name, "Ana");
                assert_eq!(age, 30);
                assert!(available, "defaults to available");
            }
            _ => panic!("expected InsertInstructor, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_instructor_unavailable() {
        let sql = format!(
            "INSERT INTO instructors (id, name, age, available) VALUES ('{ID}', 'Ana', 30, false)"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(
            cmd,
            Command::InsertInstructor {
                available: false,
                ..
            }
        ));
    }

    #[test]
    fn parse_insert_instructor_missing_column() {
        let sql = format!("INSERT INTO instructors (id, name) VALUES ('{ID}', 'Ana')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("age"))
        ));
    }

    #[test]
    fn parse_insert_slot() {
        let sql = format!(
            "INSERT INTO slots (id, instructor_id, pattern, start, \"end\") VALUES ('{ID}', '{ID}', 'Mon-Fri', '08:00', '12:00')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertSlot {
                pattern,
                start,
                end,
                available,
                ..
            } => {
                assert_eq!(pattern, "Mon-Fri");
                assert_eq!(start, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
                assert_eq!(end, NaiveTime::from_hms_opt(12, 0, 0).unwrap());
                assert!(available);
            }
            _ => panic!("expected InsertSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_session_minimal() {
        let sql = format!(
            "INSERT INTO sessions (id, student_id, kind, name) VALUES ('{ID}', '{ID}', 'simple', 'musculação')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertSession {
                kind,
                name,
                instructor_id,
                date,
                ..
            } => {
                assert_eq!(kind, SessionKind::Simple);
                assert_eq!(name, "musculação");
                assert_eq!(instructor_id, None);
                assert_eq!(date, None);
            }
            _ => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_session_full() {
        let sql = format!(
            "INSERT INTO sessions (id, student_id, kind, name, instructor_id, slot_id, date, start, \"end\", level) \
             VALUES ('{ID}', '{ID}', 'personalized', 'treino A', '{ID}', NULL, '2025-06-04', '09:00', '10:00', 'iniciante')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertSession {
                kind,
                instructor_id,
                slot_id,
                date,
                start,
                end,
                level,
                ..
            } => {
                assert_eq!(kind, SessionKind::Personalized);
                assert!(instructor_id.is_some());
                assert_eq!(slot_id, None, "explicit NULL");
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 4));
                assert_eq!(start, NaiveTime::from_hms_opt(9, 0, 0));
                assert_eq!(end, NaiveTime::from_hms_opt(10, 0, 0));
                assert_eq!(level.as_deref(), Some("iniciante"));
            }
            _ => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_toggle_forms() {
        let sql = format!("UPDATE instructors SET available = NOT available WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::ToggleInstructorAvailability { .. }
        ));

        let sql = format!("UPDATE slots SET available = NOT available WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::ToggleSlotAvailability { .. }
        ));

        let sql = format!("UPDATE sessions SET completed = NOT completed WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::ToggleSessionCompleted { .. }
        ));
    }

    #[test]
    fn parse_toggle_wrong_column_rejected() {
        let sql = format!("UPDATE sessions SET completed = NOT name WHERE id = '{ID}'");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_update_slot() {
        let sql = format!("UPDATE slots SET pattern = 'Mon/Wed/Fri', start = '09:00' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateSlot { changes, .. } => {
                assert_eq!(changes.pattern.as_deref(), Some("Mon/Wed/Fri"));
                assert_eq!(changes.start, NaiveTime::from_hms_opt(9, 0, 0));
                assert_eq!(changes.end, None);
                assert_eq!(changes.available, None);
            }
            _ => panic!("expected UpdateSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_session_null_clears() {
        let sql = format!("UPDATE sessions SET slot_id = NULL, description = 'x' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateSession { changes, .. } => {
                assert_eq!(changes.slot_id, Some(None));
                assert_eq!(changes.description, Some(Some("x".into())));
                assert_eq!(changes.date, None, "untouched");
            }
            _ => panic!("expected UpdateSession, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_unknown_column() {
        let sql = format!("UPDATE instructors SET salary = 10 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_deletes() {
        for (table, expected) in [
            ("instructors", "DeleteInstructor"),
            ("slots", "DeleteSlot"),
            ("sessions", "DeleteSession"),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{ID}'");
            let cmd = parse_sql(&sql).unwrap();
            let ok = matches!(
                (&cmd, expected),
                (Command::DeleteInstructor { .. }, "DeleteInstructor")
                    | (Command::DeleteSlot { .. }, "DeleteSlot")
                    | (Command::DeleteSession { .. }, "DeleteSession")
            );
            assert!(ok, "table {table} parsed to {cmd:?}");
        }
    }

    #[test]
    fn parse_selects() {
        assert!(matches!(
            parse_sql("SELECT * FROM instructors").unwrap(),
            Command::SelectInstructors
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM sessions").unwrap(),
            Command::SelectSessions
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM stats").unwrap(),
            Command::SelectStats
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM slots").unwrap(),
            Command::SelectSlots {
                instructor_id: None
            }
        ));
    }

    #[test]
    fn parse_select_slots_filtered() {
        let sql = format!("SELECT * FROM slots WHERE instructor_id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots {
                instructor_id: Some(iid),
            } => assert_eq!(iid.to_string(), ID),
            cmd => panic!("expected filtered SelectSlots, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE slot_id = '{ID}' AND date = '2025-06-04'");
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability { slot_id, date } => {
                assert_eq!(slot_id.to_string(), ID);
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 4).unwrap());
            }
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_missing_date() {
        let sql = format!("SELECT * FROM availability WHERE slot_id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_select_available_instructors() {
        let sql = "SELECT * FROM available_instructors WHERE date = '2025-06-04' AND start = '09:00' AND \"end\" = '10:00'";
        match parse_sql(sql).unwrap() {
            Command::SelectAvailableInstructors { date, start, end } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 4).unwrap());
                assert_eq!(start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
                assert_eq!(end, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
            }
            cmd => panic!("expected SelectAvailableInstructors, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_listen() {
        let sql = format!("LISTEN instructor_{ID}");
        match parse_sql(&sql).unwrap() {
            Command::Listen { channel } => assert_eq!(channel, format!("instructor_{ID}")),
            cmd => panic!("expected Listen, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unlisten() {
        let sql = format!("UNLISTEN instructor_{ID}");
        match parse_sql(&sql).unwrap() {
            Command::Unlisten { channel } => {
                assert_eq!(channel, Some(format!("instructor_{ID}")));
            }
            cmd => panic!("expected Unlisten, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql("UNLISTEN *").unwrap(),
            Command::Unlisten { channel: None }
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
