#![forbid(unsafe_code)]

//! Optimized, index-annotated plan trees handed to the execution core.
//!
//! Plans are produced by the external optimizer and are read-only here. Each
//! node carries its operator, the access path the optimizer chose (for index
//! scans) and a cardinality estimate.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::types::{OperatorId, Value};

mod source;

pub use source::{MemTable, ScanSource, SourceRegistry};

/// Seed for plan fingerprints; bump when the fingerprint encoding changes.
const FINGERPRINT_SEED: u64 = 0x6c61_6b65_666c_0001;

/// Submitted plan: an operator tree plus the live-source marker.
#[derive(Clone, Debug)]
pub struct Plan {
    /// The root node of the plan tree.
    pub root: PlanNode,
    /// Whether the plan reads from an unbounded, continuous source.
    pub unbounded: bool,
}

impl Plan {
    /// Creates a plan; the unbounded marker is derived from the tree.
    pub fn new(root: PlanNode) -> Self {
        let unbounded = root.iter().any(|n| n.op.is_stream());
        Self { root, unbounded }
    }

    /// Stable identity for logically equivalent plans.
    ///
    /// Operator ids and cardinality estimates are not part of the identity.
    pub fn fingerprint(&self) -> u64 {
        let mut state = Xxh64::new(FINGERPRINT_SEED);
        self.root.hash_into(&mut state);
        state.digest()
    }

    /// Sum of the leaf cardinality estimates, falling back to the root estimate.
    pub fn estimated_input_rows(&self) -> u64 {
        let leaves: u64 = self
            .root
            .iter()
            .filter(|n| n.inputs.is_empty())
            .filter_map(|n| n.estimated_rows)
            .fold(0, u64::saturating_add);
        if leaves > 0 {
            leaves
        } else {
            self.root.estimated_rows.unwrap_or(0)
        }
    }

    /// Whether any operator is a join or an aggregation.
    pub fn has_join_or_aggregate(&self) -> bool {
        self.root
            .iter()
            .any(|n| matches!(n.op, PlanOp::HashJoin { .. } | PlanOp::Aggregate { .. }))
    }
}

/// Node within the plan tree.
#[derive(Clone, Debug)]
pub struct PlanNode {
    /// Operator identifier, unique within the plan.
    pub id: OperatorId,
    /// The operator at this node.
    pub op: PlanOp,
    /// Child nodes that provide input to this operator.
    pub inputs: Vec<PlanNode>,
    /// Index access path chosen by the optimizer, if any.
    pub access_path: Option<AccessPath>,
    /// Optimizer cardinality estimate for this node's output.
    pub estimated_rows: Option<u64>,
}

impl PlanNode {
    /// Creates a new node with no inputs.
    pub fn new(id: impl Into<OperatorId>, op: PlanOp) -> Self {
        Self {
            id: id.into(),
            op,
            inputs: Vec::new(),
            access_path: None,
            estimated_rows: None,
        }
    }

    /// Creates a new node with the given inputs.
    pub fn with_inputs(id: impl Into<OperatorId>, op: PlanOp, inputs: Vec<PlanNode>) -> Self {
        Self {
            inputs,
            ..Self::new(id, op)
        }
    }

    /// Attaches a cardinality estimate.
    pub fn estimated(mut self, rows: u64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }

    /// Attaches an index access path.
    pub fn access(mut self, path: AccessPath) -> Self {
        self.access_path = Some(path);
        self
    }

    /// Pre-order iterator over this node and all descendants.
    pub fn iter(&self) -> impl Iterator<Item = &PlanNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.inputs.iter().rev());
            Some(node)
        })
    }

    /// Whether this node reads storage directly.
    pub fn is_leaf_scan(&self) -> bool {
        matches!(self.op, PlanOp::Scan { .. } | PlanOp::IndexScan { .. })
    }

    fn hash_into(&self, state: &mut Xxh64) {
        // Serialization of plan data types is infallible: no maps with
        // non-string keys and no custom serializers.
        if let Ok(encoded) = serde_json::to_vec(&self.op) {
            state.update(&encoded);
        }
        if let Some(path) = &self.access_path {
            if let Ok(encoded) = serde_json::to_vec(path) {
                state.update(&encoded);
            }
        }
        state.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            input.hash_into(state);
        }
    }
}

/// Operators understood by the execution core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanOp {
    /// Full scan of a registered table.
    Scan {
        /// Registered table name.
        table: String,
    },
    /// Index-driven scan using the node's access path.
    IndexScan {
        /// Registered table name.
        table: String,
    },
    /// Keeps rows matching the predicate.
    Filter {
        /// Predicate to evaluate.
        predicate: Predicate,
    },
    /// Keeps only the listed columns.
    Project {
        /// Output columns.
        columns: Vec<String>,
    },
    /// Equi-join of the first input (left) with the second input (right).
    HashJoin {
        /// Join column on the left input.
        left_key: String,
        /// Join column on the right input.
        right_key: String,
    },
    /// Grouped aggregation.
    Aggregate {
        /// Grouping columns.
        group_by: Vec<String>,
        /// Aggregate expressions.
        aggregates: Vec<AggregateExpr>,
    },
    /// Order-preserving stage; the only operator that defines output order.
    Sort {
        /// Sort keys, major first.
        keys: Vec<SortKey>,
    },
    /// Truncates the input to `count` rows.
    Limit {
        /// Maximum number of rows.
        count: usize,
    },
    /// Unbounded event source registered in the stream registry.
    StreamSource {
        /// Stream identifier.
        stream: String,
    },
    /// Windowed aggregation over an event stream.
    WindowAggregate {
        /// Window length in milliseconds of event time.
        window_ms: u64,
        /// Slide in milliseconds; equal to `window_ms` for tumbling windows.
        slide_ms: u64,
        /// Grouping columns.
        group_by: Vec<String>,
        /// Aggregate expressions.
        aggregates: Vec<AggregateExpr>,
    },
    /// Windowed hash join of two event streams.
    StreamJoin {
        /// Join column on the left stream.
        left_key: String,
        /// Join column on the right stream.
        right_key: String,
        /// Co-occurrence window in milliseconds.
        window_ms: u64,
    },
}

impl PlanOp {
    /// Whether this operator only makes sense over unbounded input.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            PlanOp::StreamSource { .. } | PlanOp::WindowAggregate { .. } | PlanOp::StreamJoin { .. }
        )
    }

    /// Short operator name used in logs and progress phases.
    pub fn name(&self) -> &'static str {
        match self {
            PlanOp::Scan { .. } => "scan",
            PlanOp::IndexScan { .. } => "index_scan",
            PlanOp::Filter { .. } => "filter",
            PlanOp::Project { .. } => "project",
            PlanOp::HashJoin { .. } => "hash_join",
            PlanOp::Aggregate { .. } => "aggregate",
            PlanOp::Sort { .. } => "sort",
            PlanOp::Limit { .. } => "limit",
            PlanOp::StreamSource { .. } => "stream_source",
            PlanOp::WindowAggregate { .. } => "window_aggregate",
            PlanOp::StreamJoin { .. } => "stream_join",
        }
    }
}

/// Index access path selected by the optimizer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessPath {
    /// Index name.
    pub index: String,
    /// Storage engine family owning the index.
    pub kind: IndexKind,
    /// Predicate the index answers; storage applies it during the scan.
    pub predicate: Option<Predicate>,
}

/// Storage engine families backing index access paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Ordered B-tree index.
    BTree,
    /// Vector similarity index.
    Vector,
    /// Time-series index.
    TimeSeries,
    /// Spatial index.
    Spatial,
}

/// Comparison operators for predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Boolean row predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pred", rename_all = "snake_case")]
pub enum Predicate {
    /// Compares a column with a literal; nulls never match.
    Compare {
        /// Column name.
        column: String,
        /// Comparison operator.
        op: CmpOp,
        /// Literal operand.
        value: Value,
    },
    /// Column is null or missing.
    IsNull {
        /// Column name.
        column: String,
    },
    /// All children hold.
    And {
        /// Conjuncts.
        children: Vec<Predicate>,
    },
    /// Any child holds.
    Or {
        /// Disjuncts.
        children: Vec<Predicate>,
    },
    /// Negation.
    Not {
        /// Negated predicate.
        child: Box<Predicate>,
    },
}

impl Predicate {
    /// Shorthand for a comparison predicate.
    pub fn compare(column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// Aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    /// Number of rows in the group.
    CountAll,
    /// Number of non-null values.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
    /// Mean of numeric values.
    Avg,
}

/// One aggregate output column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    /// Function to apply.
    pub func: AggFunc,
    /// Input column; ignored by [`AggFunc::CountAll`].
    pub column: Option<String>,
    /// Output column name.
    pub alias: String,
}

impl AggregateExpr {
    /// Creates an aggregate over `column`.
    pub fn new(func: AggFunc, column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            func,
            column: Some(column.into()),
            alias: alias.into(),
        }
    }

    /// Creates a `count(*)` aggregate.
    pub fn count_all(alias: impl Into<String>) -> Self {
        Self {
            func: AggFunc::CountAll,
            column: None,
            alias: alias.into(),
        }
    }
}

/// Sort key for the order-preserving stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Column name.
    pub column: String,
    /// Descending order when true.
    pub descending: bool,
}

impl SortKey {
    /// Ascending key.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Descending key.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}
