//! Local in-process DAG preparation and execution.
//!
//! The executor compiles a DAG into a topologically ordered plan,
//! deduplicating structurally equal producers so each is prepared exactly
//! once, then drives one preparation pass: root columns are materialized
//! from the data reader, each prepared node is applied column-wise, and
//! each preparable node's preparer consumes the stream and finishes into
//! its pair of prepared transformers. Downstream nodes see the
//! *for-preparation-data* outputs during the pass; the returned
//! [`PreparedDag`] scores new data through the *for-new-data* outputs.

use super::{Dag, NodeKey, NodeKind, ProducerHandle};
use crate::concurrency::Concurrency;
use crate::data::RowReader;
use crate::error::{PrepareError, Result};
use crate::termination::TerminationFlag;
use crate::transform::{
    ExecutionCache, PreparedTransformer, PreparerContext, PreparerMode, PreparerResult,
    SubDagExecutor,
};
use crate::values::{Row, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Drives preparation of DAGs on the calling thread, with inner
/// meta-transformer work fanned out up to its concurrency level.
#[derive(Clone)]
pub struct LocalExecutor {
    concurrency: Concurrency,
    termination: TerminationFlag,
}

impl LocalExecutor {
    pub fn new(concurrency: Concurrency) -> Self {
        Self {
            concurrency,
            termination: TerminationFlag::running_true(),
        }
    }

    /// Copy sharing the given cancellation flag.
    pub fn with_termination(mut self, termination: TerminationFlag) -> Self {
        self.termination = termination;
        self
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Prepares the DAG against the data. `data` must yield one value per
    /// declared placeholder, in root order.
    pub fn prepare(&self, dag: &Dag, data: &RowReader) -> Result<PreparedDag> {
        let plan = Plan::compile(dag);
        log::debug!(
            "preparing DAG: {} nodes, {} outputs",
            plan.nodes.len(),
            plan.outputs.len()
        );

        let root_count = dag.placeholders().len();
        let mut root_columns: Vec<Vec<Value>> = vec![Vec::new(); root_count];
        let mut example_count = 0usize;
        for row in data.iter() {
            if !self.termination.running() {
                return Err(PrepareError::Cancelled);
            }
            if row.len() != root_count {
                return Err(PrepareError::validation(format!(
                    "row has {} values, DAG declares {} roots",
                    row.len(),
                    root_count
                )));
            }
            for (column, value) in root_columns.iter_mut().zip(row) {
                column.push(value);
            }
            example_count += 1;
        }

        let mut columns: Vec<Vec<Value>> = Vec::with_capacity(plan.nodes.len());
        let mut prepared: Vec<Option<PreparerResult>> = Vec::new();
        prepared.resize_with(plan.nodes.len(), || None);
        let mut view_values: Vec<Option<Value>> = vec![None; plan.nodes.len()];

        for idx in 0..plan.nodes.len() {
            if !self.termination.running() {
                return Err(PrepareError::Cancelled);
            }
            let node = &plan.nodes[idx];
            let column = match node.handle.kind() {
                NodeKind::Placeholder(p) => {
                    let slot = plan.root_slots[&p.id()];
                    std::mem::take(&mut root_columns[slot])
                }
                NodeKind::Constant(value) => vec![value.clone(); example_count],
                NodeKind::ExampleIndex => (0..example_count as i64).map(Value::Int).collect(),
                NodeKind::ArrayElement { index } => columns[node.inputs[0]]
                    .iter()
                    .map(|value| element_of(value, *index))
                    .collect(),
                NodeKind::VariadicList => (0..example_count)
                    .map(|r| {
                        Value::list(
                            node.inputs
                                .iter()
                                .map(|&i| columns[i][r].clone())
                                .collect(),
                        )
                    })
                    .collect(),
                NodeKind::View(view) => {
                    let result = prepared[node.inputs[0]].as_ref().ok_or_else(|| {
                        PrepareError::configuration(
                            node.handle.name(),
                            "view target was not prepared",
                        )
                    })?;
                    let value = view.extract(result);
                    view_values[idx] = Some(value.clone());
                    vec![value; example_count]
                }
                NodeKind::Prepared(transformer) => {
                    apply_column(transformer.as_ref(), &node.inputs, &columns, example_count)
                }
                NodeKind::Preparable(transformer) => {
                    log::debug!(
                        "preparing {} on {} examples",
                        node.handle.name(),
                        example_count
                    );
                    let context = PreparerContext::new(
                        example_count as u64,
                        self.concurrency,
                        self.termination.clone(),
                        Arc::new(self.clone()),
                    );
                    let mut preparer = transformer.preparer(&context)?;
                    let mode = preparer.mode();
                    let mut row = Vec::with_capacity(node.inputs.len());
                    for r in 0..example_count {
                        if !self.termination.running() {
                            return Err(PrepareError::Cancelled);
                        }
                        row.clear();
                        row.extend(node.inputs.iter().map(|&i| columns[i][r].clone()));
                        preparer.process(&row)?;
                    }
                    let reader = match mode {
                        PreparerMode::Batch => Some(input_reader(
                            &node.inputs,
                            &columns,
                            example_count,
                        )),
                        PreparerMode::Stream => None,
                    };
                    let result = preparer.finish(reader.as_ref())?;
                    let column = apply_column(
                        result.for_preparation_data.as_ref(),
                        &node.inputs,
                        &columns,
                        example_count,
                    );
                    prepared[idx] = Some(result);
                    column
                }
            };
            columns.push(column);
        }

        let preparation_outputs = plan
            .outputs
            .iter()
            .map(|&o| columns[o].clone())
            .collect();

        Ok(PreparedDag {
            plan,
            root_count,
            prepared,
            view_values,
            preparation_outputs,
        })
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(Concurrency::available_cores())
    }
}

impl SubDagExecutor for LocalExecutor {
    fn prepare_sub_dag(&self, dag: &Dag, data: &RowReader) -> Result<PreparedDag> {
        self.prepare(dag, data)
    }

    fn parallelism(&self) -> Concurrency {
        self.concurrency
    }
}

fn element_of(value: &Value, index: usize) -> Value {
    value
        .as_list()
        .and_then(|items| items.get(index).cloned())
        .unwrap_or(Value::Absent)
}

fn apply_column(
    transformer: &dyn PreparedTransformer,
    input_ids: &[usize],
    columns: &[Vec<Value>],
    example_count: usize,
) -> Vec<Value> {
    let cache = transformer.create_cache();
    let cache_ref: Option<&dyn ExecutionCache> = cache.as_deref();
    let mut out = Vec::with_capacity(example_count);
    let mut row = Vec::with_capacity(input_ids.len());
    for r in 0..example_count {
        row.clear();
        row.extend(input_ids.iter().map(|&i| columns[i][r].clone()));
        out.push(transformer.apply(cache_ref, &row));
    }
    if let Some(cache) = cache {
        cache.close();
    }
    out
}

fn input_reader(input_ids: &[usize], columns: &[Vec<Value>], example_count: usize) -> RowReader {
    let rows: Vec<Row> = (0..example_count)
        .map(|r| input_ids.iter().map(|&i| columns[i][r].clone()).collect())
        .collect();
    RowReader::from_rows(rows)
}

struct PlanNode {
    handle: ProducerHandle,
    inputs: Vec<usize>,
}

/// Topologically ordered, structurally deduplicated node list.
struct Plan {
    nodes: Vec<PlanNode>,
    outputs: Vec<usize>,
    index: HashMap<NodeKey, usize>,
    root_slots: HashMap<u64, usize>,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Plan {{ nodes: {}, outputs: {} }}", self.nodes.len(), self.outputs.len())
    }
}

impl Plan {
    fn compile(dag: &Dag) -> Plan {
        let mut plan = Plan {
            nodes: Vec::new(),
            outputs: Vec::new(),
            index: HashMap::new(),
            root_slots: HashMap::new(),
        };
        for (slot, root) in dag.placeholders().iter().enumerate() {
            if let NodeKind::Placeholder(p) = root.kind() {
                plan.root_slots.insert(p.id(), slot);
            }
            plan.add(root);
        }
        let output_ids: Vec<usize> = dag.outputs().iter().map(|o| plan.add(o)).collect();
        plan.outputs = output_ids;
        plan
    }

    fn add(&mut self, handle: &ProducerHandle) -> usize {
        if let Some(&existing) = self.index.get(&NodeKey(Arc::clone(handle))) {
            return existing;
        }
        let inputs: Vec<usize> = handle.inputs().iter().map(|i| self.add(i)).collect();
        let id = self.nodes.len();
        self.nodes.push(PlanNode {
            handle: Arc::clone(handle),
            inputs,
        });
        self.index.insert(NodeKey(Arc::clone(handle)), id);
        id
    }
}

/// The result of preparing a DAG: an immutable executable graph.
#[derive(Debug)]
pub struct PreparedDag {
    plan: Plan,
    root_count: usize,
    prepared: Vec<Option<PreparerResult>>,
    view_values: Vec<Option<Value>>,
    preparation_outputs: Vec<Vec<Value>>,
}

impl PreparedDag {
    /// The preparation result of a preparable node, if the producer is
    /// part of this DAG.
    pub fn prepared_for(&self, handle: &ProducerHandle) -> Option<&PreparerResult> {
        let id = *self.plan.index.get(&NodeKey(Arc::clone(handle)))?;
        self.prepared[id].as_ref()
    }

    /// Output columns computed over the preparation data itself, through
    /// the for-preparation-data variants.
    pub fn preparation_outputs(&self) -> &[Vec<Value>] {
        &self.preparation_outputs
    }

    /// Applies the finalized DAG to one new-data row.
    pub fn apply(&self, row: &[Value]) -> Result<Vec<Value>> {
        let rows = vec![row.to_vec()];
        let mut results = self.apply_batch(&rows)?;
        Ok(results.remove(0))
    }

    /// Applies the finalized DAG to a batch of new-data rows; the example
    /// index root counts within the batch.
    pub fn apply_batch(&self, rows: &[Row]) -> Result<Vec<Vec<Value>>> {
        let count = rows.len();
        for row in rows {
            if row.len() != self.root_count {
                return Err(PrepareError::validation(format!(
                    "row has {} values, DAG declares {} roots",
                    row.len(),
                    self.root_count
                )));
            }
        }

        let mut columns: Vec<Vec<Value>> = Vec::with_capacity(self.plan.nodes.len());
        for (idx, node) in self.plan.nodes.iter().enumerate() {
            let column = match node.handle.kind() {
                NodeKind::Placeholder(p) => {
                    let slot = self.plan.root_slots[&p.id()];
                    rows.iter().map(|row| row[slot].clone()).collect()
                }
                NodeKind::Constant(value) => vec![value.clone(); count],
                NodeKind::ExampleIndex => (0..count as i64).map(Value::Int).collect(),
                NodeKind::ArrayElement { index } => columns[node.inputs[0]]
                    .iter()
                    .map(|value| element_of(value, *index))
                    .collect(),
                NodeKind::VariadicList => (0..count)
                    .map(|r| {
                        Value::list(
                            node.inputs
                                .iter()
                                .map(|&i| columns[i][r].clone())
                                .collect(),
                        )
                    })
                    .collect(),
                NodeKind::View(_) => {
                    let value = self.view_values[idx].clone().unwrap_or(Value::Absent);
                    vec![value; count]
                }
                NodeKind::Prepared(transformer) => {
                    apply_column(transformer.as_ref(), &node.inputs, &columns, count)
                }
                NodeKind::Preparable(_) => {
                    let result = self.prepared[idx].as_ref().ok_or_else(|| {
                        PrepareError::configuration(node.handle.name(), "node was not prepared")
                    })?;
                    apply_column(
                        result.for_new_data.as_ref(),
                        &node.inputs,
                        &columns,
                        count,
                    )
                }
            };
            columns.push(column);
        }

        Ok((0..count)
            .map(|r| {
                self.plan
                    .outputs
                    .iter()
                    .map(|&o| columns[o][r].clone())
                    .collect()
            })
            .collect())
    }

    /// Reduces one output to its constant value. Fails with a reduction
    /// error if the output depends on per-row inputs.
    pub fn output_constant(&self, output: usize) -> Result<Value> {
        self.try_constant(self.plan.outputs[output])
    }

    /// Reduces every output to a constant, in output order.
    pub fn output_constants(&self) -> Result<Vec<Value>> {
        (0..self.plan.outputs.len())
            .map(|o| self.output_constant(o))
            .collect()
    }

    fn try_constant(&self, id: usize) -> Result<Value> {
        let node = &self.plan.nodes[id];
        match node.handle.kind() {
            NodeKind::Constant(value) => Ok(value.clone()),
            NodeKind::View(_) => Ok(self.view_values[id].clone().unwrap_or(Value::Absent)),
            NodeKind::VariadicList => Ok(Value::list(
                node.inputs
                    .iter()
                    .map(|&i| self.try_constant(i))
                    .collect::<Result<Vec<_>>>()?,
            )),
            NodeKind::ArrayElement { index } => {
                Ok(element_of(&self.try_constant(node.inputs[0])?, *index))
            }
            NodeKind::Prepared(transformer) if transformer.has_constant_result() => {
                let absent_row = vec![Value::Absent; node.inputs.len()];
                Ok(transformer.apply(None, &absent_row))
            }
            NodeKind::Preparable(_) => {
                let result = self.prepared[id].as_ref().ok_or_else(|| {
                    PrepareError::configuration(node.handle.name(), "node was not prepared")
                })?;
                if result.for_new_data.has_constant_result() {
                    let absent_row = vec![Value::Absent; node.inputs.len()];
                    Ok(result.for_new_data.apply(None, &absent_row))
                } else {
                    Err(PrepareError::reduction(node.handle.name()))
                }
            }
            _ => Err(PrepareError::reduction(node.handle.name())),
        }
    }
}
