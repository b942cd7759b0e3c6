//! Partial aggregate states and grouped aggregation tables.
//!
//! Every state's `merge` is associative and commutative, so partials from
//! partitions may be combined in any order. Integer sums are accumulated
//! in 128 bits and only narrowed at `finalize`, so their result does not
//! depend on merge order. Float sums are subject to ordinary rounding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::{AggFunc, AggregateExpr};
use crate::types::{key_of, Row, Value};

/// Partial state of one aggregate function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agg", rename_all = "snake_case")]
pub enum AggState {
    /// `count(*)`
    CountAll {
        /// Rows seen.
        rows: u64,
    },
    /// `count(col)`
    Count {
        /// Non-null values seen.
        values: u64,
    },
    /// `sum(col)`
    Sum {
        /// Exact accumulator of integer inputs.
        #[serde(with = "wide_int")]
        int: i128,
        /// Accumulator of float inputs.
        float: f64,
        /// Whether any float input was seen.
        floating: bool,
        /// Whether any numeric input was seen.
        seen: bool,
    },
    /// `min(col)`
    Min {
        /// Smallest value so far.
        value: Option<Value>,
    },
    /// `max(col)`
    Max {
        /// Largest value so far.
        value: Option<Value>,
    },
    /// `avg(col)`, kept as a weighted sum so partials merge exactly.
    Avg {
        /// Sum of numeric inputs.
        sum: f64,
        /// Number of numeric inputs.
        count: u64,
    },
}

impl AggState {
    /// Initial state for `func`.
    pub fn new(func: AggFunc) -> Self {
        match func {
            AggFunc::CountAll => AggState::CountAll { rows: 0 },
            AggFunc::Count => AggState::Count { values: 0 },
            AggFunc::Sum => AggState::Sum {
                int: 0,
                float: 0.0,
                floating: false,
                seen: false,
            },
            AggFunc::Min => AggState::Min { value: None },
            AggFunc::Max => AggState::Max { value: None },
            AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
        }
    }

    /// Folds one input value (the row's column, or `None` if absent).
    pub fn update(&mut self, input: Option<&Value>) {
        let input = input.filter(|v| !v.is_null());
        match self {
            AggState::CountAll { rows } => *rows += 1,
            AggState::Count { values } => {
                if input.is_some() {
                    *values += 1;
                }
            }
            AggState::Sum {
                int,
                float,
                floating,
                seen,
            } => match input {
                Some(Value::Int(v)) => {
                    *seen = true;
                    *int = int.saturating_add(i128::from(*v));
                }
                Some(Value::Float(v)) => {
                    *seen = true;
                    *floating = true;
                    *float += v;
                }
                _ => {}
            },
            AggState::Min { value } => {
                if let Some(v) = input {
                    if value.as_ref().map_or(true, |cur| v < cur) {
                        *value = Some(v.clone());
                    }
                }
            }
            AggState::Max { value } => {
                if let Some(v) = input {
                    if value.as_ref().map_or(true, |cur| v > cur) {
                        *value = Some(v.clone());
                    }
                }
            }
            AggState::Avg { sum, count } => {
                if let Some(v) = input.and_then(Value::as_f64) {
                    *sum += v;
                    *count += 1;
                }
            }
        }
    }

    /// Combines another partial of the same function into this one.
    pub fn merge(&mut self, other: &AggState) {
        match (self, other) {
            (AggState::CountAll { rows }, AggState::CountAll { rows: o }) => *rows += o,
            (AggState::Count { values }, AggState::Count { values: o }) => *values += o,
            (
                AggState::Sum {
                    int,
                    float,
                    floating,
                    seen,
                },
                AggState::Sum {
                    int: o_int,
                    float: o_float,
                    floating: o_floating,
                    seen: o_seen,
                },
            ) => {
                *seen |= *o_seen;
                *floating |= *o_floating;
                *int = int.saturating_add(*o_int);
                *float += o_float;
            }
            (AggState::Min { value }, AggState::Min { value: Some(o) }) => {
                if value.as_ref().map_or(true, |cur| o < cur) {
                    *value = Some(o.clone());
                }
            }
            (AggState::Max { value }, AggState::Max { value: Some(o) }) => {
                if value.as_ref().map_or(true, |cur| o > cur) {
                    *value = Some(o.clone());
                }
            }
            (AggState::Avg { sum, count }, AggState::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            // Empty min/max partials and mismatched functions contribute nothing.
            _ => {}
        }
    }

    /// Produces the final aggregate value.
    pub fn finalize(&self) -> Value {
        match self {
            AggState::CountAll { rows } => Value::Int(*rows as i64),
            AggState::Count { values } => Value::Int(*values as i64),
            AggState::Sum {
                int,
                float,
                floating,
                seen,
            } => match (*seen, *floating) {
                (false, _) => Value::Null,
                (true, true) => Value::Float(*float + *int as f64),
                (true, false) => match i64::try_from(*int) {
                    Ok(exact) => Value::Int(exact),
                    Err(_) => Value::Float(*int as f64),
                },
            },
            AggState::Min { value } | AggState::Max { value } => {
                value.clone().unwrap_or(Value::Null)
            }
            AggState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float(*sum / *count as f64)
                }
            }
        }
    }
}

/// Writes the 128-bit sum accumulator as a decimal string, which survives
/// the buffered decoding of tagged snapshot enums.
mod wide_int {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Serialized form of one group inside a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    /// Group key values, in `group_by` order.
    pub key: Vec<Value>,
    /// One state per aggregate expression.
    pub states: Vec<AggState>,
}

/// Per-group aggregate states for one aggregation operator.
#[derive(Clone, Debug)]
pub struct GroupTable {
    group_by: Vec<String>,
    aggregates: Vec<AggregateExpr>,
    groups: BTreeMap<Vec<Value>, Vec<AggState>>,
}

impl GroupTable {
    /// Creates an empty table.
    pub fn new(group_by: Vec<String>, aggregates: Vec<AggregateExpr>) -> Self {
        Self {
            group_by,
            aggregates,
            groups: BTreeMap::new(),
        }
    }

    /// Grouping columns.
    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    /// Number of groups currently held.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group has been created yet.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Folds one input row into its group.
    pub fn accumulate(&mut self, row: &Row) {
        let key = key_of(row, &self.group_by);
        let aggregates = &self.aggregates;
        let states = self
            .groups
            .entry(key)
            .or_insert_with(|| aggregates.iter().map(|a| AggState::new(a.func)).collect());
        for (state, expr) in states.iter_mut().zip(aggregates) {
            state.update(expr.column.as_ref().and_then(|c| row.get(c)));
        }
    }

    /// Merges the partial groups of `other` into this table.
    pub fn merge(&mut self, other: GroupTable) {
        for (key, states) in other.groups {
            match self.groups.get_mut(&key) {
                Some(existing) => {
                    for (mine, theirs) in existing.iter_mut().zip(&states) {
                        mine.merge(theirs);
                    }
                }
                None => {
                    self.groups.insert(key, states);
                }
            }
        }
    }

    /// Finalizes every group into an output row.
    ///
    /// A global aggregate (no grouping columns) over empty input still
    /// yields one row of initial values.
    pub fn into_rows(self) -> Vec<Row> {
        let mut groups = self.groups;
        if groups.is_empty() && self.group_by.is_empty() {
            groups.insert(
                Vec::new(),
                self.aggregates.iter().map(|a| AggState::new(a.func)).collect(),
            );
        }
        groups
            .into_iter()
            .map(|(key, states)| {
                let mut row: Row = self.group_by.iter().cloned().zip(key).collect();
                for (expr, state) in self.aggregates.iter().zip(&states) {
                    row.insert(expr.alias.clone(), state.finalize());
                }
                row
            })
            .collect()
    }

    /// Captures all groups for a checkpoint.
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.groups
            .iter()
            .map(|(key, states)| GroupSnapshot {
                key: key.clone(),
                states: states.clone(),
            })
            .collect()
    }

    /// Replaces the table contents with checkpointed groups.
    pub fn restore(&mut self, groups: Vec<GroupSnapshot>) {
        self.groups = groups.into_iter().map(|g| (g.key, g.states)).collect();
    }

    /// Drops all groups.
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Returns a fresh table with the same shape.
    pub fn empty_like(&self) -> GroupTable {
        GroupTable::new(self.group_by.clone(), self.aggregates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::row;
    use proptest::prelude::*;

    fn exprs() -> Vec<AggregateExpr> {
        vec![
            AggregateExpr::count_all("n"),
            AggregateExpr::new(AggFunc::Sum, "v", "total"),
            AggregateExpr::new(AggFunc::Min, "v", "lo"),
            AggregateExpr::new(AggFunc::Max, "v", "hi"),
            AggregateExpr::new(AggFunc::Avg, "v", "mean"),
        ]
    }

    #[test]
    fn grouped_aggregation_finalizes_each_group() {
        let mut table = GroupTable::new(vec!["g".into()], exprs());
        for (g, v) in [("a", 1i64), ("b", 10), ("a", 3)] {
            table.accumulate(&row([("g", Value::from(g)), ("v", Value::from(v))]));
        }
        let rows = table.into_rows();
        assert_eq!(rows.len(), 2);
        let a = &rows[0];
        assert_eq!(a["g"], Value::from("a"));
        assert_eq!(a["n"], Value::Int(2));
        assert_eq!(a["total"], Value::Int(4));
        assert_eq!(a["lo"], Value::Int(1));
        assert_eq!(a["hi"], Value::Int(3));
        assert_eq!(a["mean"], Value::Float(2.0));
    }

    #[test]
    fn global_aggregate_over_empty_input_yields_one_row() {
        let rows = GroupTable::new(Vec::new(), exprs()).into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], Value::Int(0));
        assert_eq!(rows[0]["total"], Value::Null);
        assert_eq!(rows[0]["mean"], Value::Null);
    }

    #[test]
    fn merged_partials_equal_single_pass() {
        let input: Vec<Row> = (0..20i64)
            .map(|i| row([("g", Value::Int(i % 3)), ("v", Value::Int(i))]))
            .collect();
        let mut whole = GroupTable::new(vec!["g".into()], exprs());
        input.iter().for_each(|r| whole.accumulate(r));

        let mut left = whole.empty_like();
        let mut right = whole.empty_like();
        for (i, r) in input.iter().enumerate() {
            if i % 2 == 0 {
                left.accumulate(r);
            } else {
                right.accumulate(r);
            }
        }
        right.merge(left);
        assert_eq!(right.into_rows(), whole.into_rows());
    }

    #[test]
    fn sum_beyond_i64_finalizes_as_float() {
        let mut state = AggState::new(AggFunc::Sum);
        state.update(Some(&Value::Int(i64::MAX)));
        state.update(Some(&Value::Int(1)));
        assert_eq!(state.finalize(), Value::Float(i64::MAX as f64 + 1.0));
    }

    #[test]
    fn transient_overflow_inside_a_partial_stays_exact() {
        let mut state = AggState::new(AggFunc::Sum);
        for v in [i64::MAX, 1, -1] {
            state.update(Some(&Value::Int(v)));
        }
        assert_eq!(state.finalize(), Value::Int(i64::MAX));
    }

    #[test]
    fn sum_state_survives_a_snapshot_round_trip() -> serde_json::Result<()> {
        let mut state = AggState::new(AggFunc::Sum);
        state.update(Some(&Value::Int(i64::MAX)));
        state.update(Some(&Value::Int(i64::MAX)));
        let body = crate::fault::SnapshotBody::Aggregate {
            position: 2,
            groups: vec![GroupSnapshot {
                key: Vec::new(),
                states: vec![state],
            }],
        };
        let decoded: crate::fault::SnapshotBody = serde_json::from_str(&serde_json::to_string(&body)?)?;
        assert_eq!(decoded, body);
        Ok(())
    }

    fn sum_of(values: &[i64]) -> AggState {
        let mut state = AggState::new(AggFunc::Sum);
        values.iter().for_each(|v| state.update(Some(&Value::Int(*v))));
        state
    }

    proptest! {
        #[test]
        fn integer_sum_is_independent_of_merge_order(
            parts in proptest::collection::vec(
                proptest::collection::vec(
                    prop_oneof![Just(i64::MAX), Just(1i64), Just(-1i64), Just(i64::MIN), -1_000i64..1_000],
                    0..4,
                ),
                1..6,
            ),
            rotate in 0usize..6,
        ) {
            let partials: Vec<AggState> = parts.iter().map(|p| sum_of(p)).collect();
            let fold = |order: &[AggState]| {
                let mut acc = AggState::new(AggFunc::Sum);
                order.iter().for_each(|p| acc.merge(p));
                acc.finalize()
            };
            let forward = fold(&partials[..]);
            let mut reversed = partials.clone();
            reversed.reverse();
            let mut rotated = partials.clone();
            let by = rotate % rotated.len();
            rotated.rotate_left(by);
            let single = sum_of(&parts.concat()).finalize();

            prop_assert_eq!(&fold(&reversed[..]), &forward);
            prop_assert_eq!(&fold(&rotated[..]), &forward);
            prop_assert_eq!(&single, &forward);
        }
    }

    #[test]
    fn snapshot_restore_preserves_groups() {
        let mut table = GroupTable::new(vec!["g".into()], exprs());
        table.accumulate(&row([("g", 1i64), ("v", 5i64)]));
        let snap = table.snapshot();
        let mut restored = table.empty_like();
        restored.restore(snap);
        assert_eq!(restored.into_rows(), table.into_rows());
    }
}
