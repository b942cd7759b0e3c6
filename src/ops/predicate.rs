//! Row-level kernels: predicate evaluation, projection and ordering.

use std::cmp::Ordering;

use crate::plan::{CmpOp, Predicate, SortKey};
use crate::types::{Row, Value};

/// Evaluates `pred` against `row`. Comparisons involving null never match.
pub fn eval_predicate(pred: &Predicate, row: &Row) -> bool {
    match pred {
        Predicate::Compare { column, op, value } => match row.get(column) {
            None | Some(Value::Null) => false,
            Some(_) if value.is_null() => false,
            Some(actual) => compare(actual, value, *op),
        },
        Predicate::IsNull { column } => row.get(column).map_or(true, Value::is_null),
        Predicate::And { children } => children.iter().all(|c| eval_predicate(c, row)),
        Predicate::Or { children } => children.iter().any(|c| eval_predicate(c, row)),
        Predicate::Not { child } => !eval_predicate(child, row),
    }
}

fn compare(actual: &Value, literal: &Value, op: CmpOp) -> bool {
    let ord = match (actual.as_f64(), literal.as_f64()) {
        // Int and Float literals compare numerically.
        (Some(a), Some(b)) => a.total_cmp(&b),
        _ => actual.cmp(literal),
    };
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    }
}

/// Keeps only `columns`; missing columns become null.
pub fn project(row: &Row, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Stable sort by `keys`, major key first.
pub fn sort_rows(rows: &mut [Row], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        for key in keys {
            let left = a.get(&key.column).unwrap_or(&Value::Null);
            let right = b.get(&key.column).unwrap_or(&Value::Null);
            let ord = if key.descending {
                right.cmp(left)
            } else {
                left.cmp(right)
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
