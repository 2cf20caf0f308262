//! Graph reduction through statically absent inputs.

mod common;

use dagprep::dag::executor::LocalExecutor;
use dagprep::dag::{Dag, NodeKind, ProducerNode};
use dagprep::data::RowReader;
use dagprep::meta::NullFilteredPrepared;
use dagprep::transform::FnPrepared;
use dagprep::values::Value;
use std::sync::Arc;

fn sum_of_pair() -> Arc<dyn dagprep::transform::PreparedTransformer> {
    Arc::new(FnPrepared::new("pair-sum", |row: &[Value]| {
        Value::Int(row.iter().filter_map(Value::as_int).sum())
    }))
}

#[test]
fn test_absent_constant_input_reduces_to_constant_absent() {
    let x = ProducerNode::placeholder("x");
    let filtered = ProducerNode::prepared(
        Arc::new(NullFilteredPrepared::new(sum_of_pair())),
        vec![Arc::clone(&x), ProducerNode::constant(Value::Absent)],
    );
    let dag = Dag::new(vec![x], vec![filtered]).unwrap();

    // One input is statically absent, so the whole node folds away.
    let reduced = dag.reduced().unwrap();
    assert!(
        matches!(reduced.outputs()[0].kind(), NodeKind::Constant(v) if v.is_absent()),
        "expected a constant-absent producer"
    );

    let prepared = LocalExecutor::default()
        .prepare(&reduced, &RowReader::from_rows(vec![vec![Value::Int(0)]]))
        .unwrap();
    assert_eq!(prepared.apply(&[Value::Int(42)]).unwrap()[0], Value::Absent);
}

#[test]
fn test_custom_fallback_survives_reduction() {
    let x = ProducerNode::placeholder("x");
    let filtered = ProducerNode::prepared(
        Arc::new(NullFilteredPrepared::with_fallback(
            sum_of_pair(),
            Value::Int(0),
        )),
        vec![Arc::clone(&x), ProducerNode::constant(Value::Absent)],
    );
    let dag = Dag::new(vec![x], vec![filtered]).unwrap();
    let reduced = dag.reduced().unwrap();
    assert!(
        matches!(reduced.outputs()[0].kind(), NodeKind::Constant(v) if *v == Value::Int(0))
    );
}

#[test]
fn test_live_inputs_do_not_reduce() {
    let x = ProducerNode::placeholder("x");
    let y = ProducerNode::placeholder("y");
    let filtered = ProducerNode::prepared(
        Arc::new(NullFilteredPrepared::new(sum_of_pair())),
        vec![Arc::clone(&x), Arc::clone(&y)],
    );
    let dag = Dag::new(vec![x, y], vec![filtered]).unwrap();
    let reduced = dag.reduced().unwrap();
    assert!(matches!(
        reduced.outputs()[0].kind(),
        NodeKind::Prepared(_)
    ));

    // The wrapper still filters per row at execution time.
    let prepared = LocalExecutor::default()
        .prepare(
            &reduced,
            &RowReader::from_rows(vec![vec![Value::Int(1), Value::Int(2)]]),
        )
        .unwrap();
    assert_eq!(
        prepared.apply(&[Value::Int(40), Value::Int(2)]).unwrap()[0],
        Value::Int(42)
    );
    assert_eq!(
        prepared.apply(&[Value::Int(40), Value::Absent]).unwrap()[0],
        Value::Absent
    );
}
