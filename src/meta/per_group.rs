//! Per-group specialized training.
//!
//! Maintains one sub-preparer per group token (input position 0). Each
//! group's sub-model trains only on that group's rows; inference looks the
//! group up and dispatches, falling back to the configured unknown-group
//! policy. Group keys compare and hash structurally, and the table keeps
//! insertion order so `UseAny` is deterministic: it picks the first group
//! observed during preparation.

use crate::dag::{ProducerHandle, ProducerNode};
use crate::data::RowReader;
use crate::error::{PrepareError, Result};
use crate::transform::{
    ExecutionCache, ModelHandle, PreparableTransformer, PreparedTransformer, Preparer,
    PreparerContext, PreparerMode, PreparerResult,
};
use crate::values::Value;
use indexmap::IndexMap;
use std::any::Any;
use std::sync::Arc;

/// Group key to prepared sub-transformer, in first-observed order.
pub type GroupTable = IndexMap<Value, Arc<dyn PreparedTransformer>>;

/// What inference does for a group never seen during preparation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownGroupPolicy {
    /// Yield the absent sentinel.
    #[default]
    ReturnAbsent,
    /// Use the first group's sub-transformer, in insertion order.
    UseAny,
}

/// Per-group training wrapper around a preparable transformer.
pub struct PreparedByGroup {
    wrapped: Arc<dyn PreparableTransformer>,
    policy: UnknownGroupPolicy,
    name: String,
}

impl PreparedByGroup {
    pub fn new(wrapped: Arc<dyn PreparableTransformer>) -> Self {
        let name = format!("prepared-by-group({})", wrapped.name());
        Self {
            wrapped,
            policy: UnknownGroupPolicy::default(),
            name,
        }
    }

    /// Copy with the unknown-group policy replaced.
    pub fn with_unknown_group_policy(mut self, policy: UnknownGroupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// DAG node with the group input at position 0 followed by the
    /// wrapped transformer's inputs.
    pub fn node(
        self,
        group_input: ProducerHandle,
        wrapped_inputs: Vec<ProducerHandle>,
    ) -> ProducerHandle {
        let mut inputs = vec![group_input];
        inputs.extend(wrapped_inputs);
        ProducerNode::preparable(Arc::new(self), inputs)
    }

    /// View of a prepared-by-group node exposing its trained group table
    /// as one constant map value: group key to sub-transformer handle.
    pub fn table_view(node: &ProducerHandle) -> Result<ProducerHandle> {
        ProducerNode::view("group-table", Arc::clone(node), |result| {
            match prepared_by_groups(result.for_new_data.as_ref()) {
                Some(prepared) => Value::map(prepared.table.iter().map(|(group, model)| {
                    (
                        group.clone(),
                        ModelHandle::into_value("group-model", Arc::clone(model)),
                    )
                })),
                None => Value::Absent,
            }
        })
    }

    /// Node producing, per input row, the complete map from group key to
    /// that group's sub-transformer's output on the row's non-group
    /// inputs.
    pub fn result_map_node(node: &ProducerHandle) -> Result<ProducerHandle> {
        let table = Self::table_view(node)?;
        let mut inputs = vec![table];
        inputs.extend(node.inputs().iter().skip(1).cloned());
        Ok(ProducerNode::prepared(
            Arc::new(AllGroupsApply {
                name: format!("{}/all-groups", node.name()),
            }),
            inputs,
        ))
    }
}

fn prepared_by_groups(transformer: &dyn PreparedTransformer) -> Option<&PreparedByGroups> {
    transformer
        .as_any()
        .and_then(|any| any.downcast_ref::<PreparedByGroups>())
}

impl PreparableTransformer for PreparedByGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.wrapped.arity().map(|a| a + 1)
    }

    fn is_idempotent(&self) -> bool {
        self.wrapped.is_idempotent()
    }

    fn preparer(&self, context: &PreparerContext) -> Result<Box<dyn Preparer>> {
        Ok(Box::new(PerGroupPreparer {
            name: self.name.clone(),
            wrapped: Arc::clone(&self.wrapped),
            sub_preparers: IndexMap::new(),
            policy: self.policy,
            context: context.clone(),
        }))
    }
}

struct PerGroupPreparer {
    name: String,
    wrapped: Arc<dyn PreparableTransformer>,
    sub_preparers: IndexMap<Value, Box<dyn Preparer>>,
    policy: UnknownGroupPolicy,
    context: PreparerContext,
}

impl Preparer for PerGroupPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Batch
    }

    fn process(&mut self, row: &[Value]) -> Result<()> {
        let (group, data_row) = match row.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        let preparer = match self.sub_preparers.entry(group.clone()) {
            indexmap::map::Entry::Occupied(entry) => entry.into_mut(),
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(self.wrapped.preparer(&self.context)?)
            }
        };
        preparer.process(data_row)
    }

    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult> {
        let reader = reader.ok_or_else(|| {
            PrepareError::configuration(&self.name, "batch preparer finished without a reader")
        })?;
        log::debug!("{}: finishing {} groups", self.name, self.sub_preparers.len());

        let mut for_preparation = GroupTable::new();
        let mut for_new = GroupTable::new();
        for (group, preparer) in self.sub_preparers {
            let key = group.clone();
            let group_rows = reader
                .filter(move |row| row.first() == Some(&key))
                .map(|mut row| {
                    row.remove(0);
                    row
                });
            let child_reader = match preparer.mode() {
                PreparerMode::Batch => Some(&group_rows),
                PreparerMode::Stream => None,
            };
            let result = preparer
                .finish(child_reader)
                .map_err(PrepareError::from_inner)?;
            for_preparation.insert(group.clone(), result.for_preparation_data);
            for_new.insert(group, result.for_new_data);
        }

        Ok(PreparerResult::new(
            Arc::new(PreparedByGroups {
                name: self.name.clone(),
                table: Arc::new(for_preparation),
                policy: self.policy,
            }),
            Arc::new(PreparedByGroups {
                name: self.name,
                table: Arc::new(for_new),
                policy: self.policy,
            }),
        ))
    }
}

/// The trained group dispatcher.
pub struct PreparedByGroups {
    name: String,
    table: Arc<GroupTable>,
    policy: UnknownGroupPolicy,
}

impl PreparedByGroups {
    pub fn table(&self) -> &Arc<GroupTable> {
        &self.table
    }
}

impl PreparedTransformer for PreparedByGroups {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        let (group, data_row) = match row.split_first() {
            Some(split) => split,
            None => return Value::Absent,
        };
        match self.table.get(group) {
            Some(model) => model.apply(None, data_row),
            None => match self.policy {
                UnknownGroupPolicy::ReturnAbsent => Value::Absent,
                UnknownGroupPolicy::UseAny => self
                    .table
                    .first()
                    .map(|(_, model)| model.apply(None, data_row))
                    .unwrap_or(Value::Absent),
            },
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
}

/// Applies every sub-transformer in a group-table value to the shared
/// non-group inputs, yielding group key to result.
struct AllGroupsApply {
    name: String,
}

impl PreparedTransformer for AllGroupsApply {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        let (table, data_row) = match row.split_first() {
            Some(split) => split,
            None => return Value::Absent,
        };
        match table {
            Value::Map(entries) => Value::map(entries.iter().filter_map(|(group, handle)| {
                ModelHandle::from_value(handle)
                    .map(|model| (group.clone(), model.apply(None, data_row)))
            })),
            _ => Value::Absent,
        }
    }
}
