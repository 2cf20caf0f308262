//! Value-level graph reduction.
//!
//! Two rewrites, applied bottom-up with structural memoization:
//!
//! 1. **Absent short-circuit**: a prepared node advertising
//!    [`absent_input_short_circuit`] whose reduced input list contains a
//!    constant absent value is replaced by a constant of its fallback.
//! 2. **Constant folding**: a prepared node whose reduced inputs are all
//!    constants, or which advertises a constant result, is applied once
//!    and replaced by the resulting constant. List/element primitives fold
//!    the same way.
//!
//! Preparable nodes, placeholders, and the example index never fold.
//!
//! [`absent_input_short_circuit`]: crate::transform::PreparedTransformer::absent_input_short_circuit

use super::{NodeKey, NodeKind, ProducerHandle, ProducerNode};
use crate::error::Result;
use crate::values::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) fn reduce_handle(
    handle: &ProducerHandle,
    memo: &mut HashMap<NodeKey, ProducerHandle>,
) -> Result<ProducerHandle> {
    if let Some(done) = memo.get(&NodeKey(Arc::clone(handle))) {
        return Ok(Arc::clone(done));
    }

    let inputs = handle
        .inputs()
        .iter()
        .map(|i| reduce_handle(i, memo))
        .collect::<Result<Vec<_>>>()?;

    let reduced = rewrite(handle, inputs)?;
    memo.insert(NodeKey(Arc::clone(handle)), Arc::clone(&reduced));
    Ok(reduced)
}

fn rewrite(handle: &ProducerHandle, inputs: Vec<ProducerHandle>) -> Result<ProducerHandle> {
    match handle.kind() {
        NodeKind::Prepared(t) => {
            if let Some(fallback) = t.absent_input_short_circuit() {
                let absent_input = inputs
                    .iter()
                    .any(|i| matches!(i.kind(), NodeKind::Constant(v) if v.is_absent()));
                if absent_input {
                    return Ok(ProducerNode::constant(fallback));
                }
            }
            if let Some(values) = constant_row(&inputs) {
                return Ok(ProducerNode::constant(t.apply(None, &values)));
            }
            if t.has_constant_result() {
                let absent_row = vec![Value::Absent; inputs.len()];
                return Ok(ProducerNode::constant(t.apply(None, &absent_row)));
            }
            keep(handle, inputs)
        }
        NodeKind::VariadicList => match constant_row(&inputs) {
            Some(values) => Ok(ProducerNode::constant(Value::list(values))),
            None => keep(handle, inputs),
        },
        NodeKind::ArrayElement { index } => match inputs[0].kind() {
            NodeKind::Constant(value) => {
                let element = value
                    .as_list()
                    .and_then(|items| items.get(*index).cloned())
                    .unwrap_or(Value::Absent);
                Ok(ProducerNode::constant(element))
            }
            _ => keep(handle, inputs),
        },
        _ => keep(handle, inputs),
    }
}

fn keep(handle: &ProducerHandle, inputs: Vec<ProducerHandle>) -> Result<ProducerHandle> {
    let unchanged = handle
        .inputs()
        .iter()
        .zip(&inputs)
        .all(|(a, b)| Arc::ptr_eq(a, b));
    if unchanged {
        Ok(Arc::clone(handle))
    } else {
        handle.with_inputs(inputs)
    }
}

fn constant_row(inputs: &[ProducerHandle]) -> Option<Vec<Value>> {
    inputs
        .iter()
        .map(|i| match i.kind() {
            NodeKind::Constant(v) => Some(v.clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::transform::FnPrepared;

    fn reduce_one(handle: &ProducerHandle) -> ProducerHandle {
        reduce_handle(handle, &mut HashMap::new()).unwrap()
    }

    #[test]
    fn test_folds_all_constant_inputs() {
        let sum = ProducerNode::prepared(
            Arc::new(FnPrepared::new("add", |row: &[Value]| {
                Value::Int(row.iter().filter_map(Value::as_int).sum())
            })),
            vec![
                ProducerNode::constant(Value::Int(2)),
                ProducerNode::constant(Value::Int(3)),
            ],
        );
        let reduced = reduce_one(&sum);
        assert!(matches!(reduced.kind(), NodeKind::Constant(v) if *v == Value::Int(5)));
    }

    #[test]
    fn test_folds_constant_result_with_live_inputs() {
        let label = ProducerNode::prepared(
            Arc::new(
                FnPrepared::new("fixed-label", |_: &[Value]| Value::str("winner"))
                    .with_constant_result(),
            ),
            vec![ProducerNode::placeholder("x")],
        );
        let reduced = reduce_one(&label);
        assert!(matches!(reduced.kind(), NodeKind::Constant(v) if *v == Value::str("winner")));
    }

    #[test]
    fn test_keeps_live_nodes() {
        let x = ProducerNode::placeholder("x");
        let double = ProducerNode::prepared(
            Arc::new(FnPrepared::new("double", |row: &[Value]| {
                Value::Int(row[0].as_int().unwrap_or(0) * 2)
            })),
            vec![Arc::clone(&x)],
        );
        let reduced = reduce_one(&double);
        assert!(Arc::ptr_eq(&reduced, &double));
    }

    #[test]
    fn test_list_and_element_fold_together() {
        let list = ProducerNode::variadic_list(vec![
            ProducerNode::constant(Value::Int(7)),
            ProducerNode::constant(Value::str("b")),
        ]);
        let element = ProducerNode::array_element(list, 1);
        let reduced = reduce_one(&element);
        assert!(matches!(reduced.kind(), NodeKind::Constant(v) if *v == Value::str("b")));
    }

    #[test]
    fn test_out_of_range_element_folds_to_absent() {
        let list = ProducerNode::constant(Value::list(vec![Value::Int(1)]));
        let element = ProducerNode::array_element(list, 4);
        let reduced = reduce_one(&element);
        assert!(matches!(reduced.kind(), NodeKind::Constant(v) if v.is_absent()));
    }

    #[test]
    fn test_dag_reduced_rewrites_outputs() {
        let x = ProducerNode::placeholder("x");
        let folded = ProducerNode::prepared(
            Arc::new(FnPrepared::new("negate", |row: &[Value]| {
                Value::Int(-row[0].as_int().unwrap_or(0))
            })),
            vec![ProducerNode::constant(Value::Int(4))],
        );
        let dag = Dag::new(vec![Arc::clone(&x)], vec![folded]).unwrap();
        let reduced = dag.reduced().unwrap();
        assert!(
            matches!(reduced.outputs()[0].kind(), NodeKind::Constant(v) if *v == Value::Int(-4))
        );
    }
}
