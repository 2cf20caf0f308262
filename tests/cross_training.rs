//! K-fold cross-training end to end.

mod common;

use common::{BatchRowCount, TrainedIndicator};
use dagprep::meta::fold_assignment;
use dagprep::dag::executor::LocalExecutor;
use dagprep::dag::{Dag, ProducerNode};
use dagprep::data::RowReader;
use dagprep::meta::CrossTrained;
use dagprep::values::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn value_rows(range: std::ops::Range<i64>) -> Vec<Vec<Value>> {
    range.map(|v| vec![Value::Int(v)]).collect()
}

#[test]
fn test_every_row_trains_nine_folds_plus_retrain() {
    let indicator = TrainedIndicator::new();
    let processed = Arc::clone(&indicator.processed);

    let v = ProducerNode::placeholder("v");
    let cross = CrossTrained::new(Arc::new(indicator))
        .with_fold_count(10)
        .unwrap()
        .node(vec![Arc::clone(&v)], None);
    let dag = Dag::new(vec![v], vec![cross]).unwrap();

    let prepared = LocalExecutor::default()
        .prepare(&dag, &RowReader::from_rows(value_rows(0..100)))
        .unwrap();

    // Each of the 100 values reaches 9 fold preparers plus the retrain
    // preparer.
    assert_eq!(processed.load(Ordering::Relaxed), 100 * 10);

    // For-preparation-data: every training row dispatches to the fold
    // model that excluded it, which never saw the value.
    assert!(prepared.preparation_outputs()[0]
        .iter()
        .all(|out| *out == Value::Int(0)));

    // For-new-data: the retrained model saw every value.
    for probe in [0i64, 17, 42, 99] {
        assert_eq!(
            prepared.apply(&[Value::Int(probe)]).unwrap()[0],
            Value::Int(1)
        );
    }
}

#[test]
fn test_unseen_value_is_unknown_to_the_retrained_model() {
    let v = ProducerNode::placeholder("v");
    let cross = CrossTrained::new(Arc::new(TrainedIndicator::new()))
        .with_fold_count(10)
        .unwrap()
        .node(vec![Arc::clone(&v)], None);
    let dag = Dag::new(vec![v], vec![cross]).unwrap();

    let prepared = LocalExecutor::default()
        .prepare(&dag, &RowReader::from_rows(value_rows(0..100)))
        .unwrap();
    assert_eq!(
        prepared.apply(&[Value::Int(1000)]).unwrap()[0],
        Value::Int(0)
    );
}

#[test]
fn test_two_folds_on_a_single_row() {
    // One row, k = 2: one fold is empty and its preparer must still finish
    // into a valid prepared transformer.
    let v = ProducerNode::placeholder("v");
    let cross = CrossTrained::new(Arc::new(TrainedIndicator::new()))
        .with_fold_count(2)
        .unwrap()
        .node(vec![Arc::clone(&v)], None);
    let dag = Dag::new(vec![v], vec![cross]).unwrap();

    let prepared = LocalExecutor::default()
        .prepare(&dag, &RowReader::from_rows(value_rows(7..8)))
        .unwrap();

    // The single training row is scored by the model that excluded it.
    assert_eq!(prepared.preparation_outputs()[0], vec![Value::Int(0)]);
    // The retrained model saw it.
    assert_eq!(prepared.apply(&[Value::Int(7)]).unwrap()[0], Value::Int(1));
}

#[test]
fn test_without_retrain_new_data_uses_the_dispatcher() {
    let v = ProducerNode::placeholder("v");
    let group = ProducerNode::placeholder("group");
    let cross = CrossTrained::new(Arc::new(TrainedIndicator::new()))
        .with_fold_count(5)
        .unwrap()
        .with_retrain_for_new_data(false)
        .node(vec![Arc::clone(&v)], Some(Arc::clone(&group)));
    let dag = Dag::new(vec![v, group], vec![cross]).unwrap();

    let rows: Vec<Vec<Value>> = (0..50)
        .map(|i| vec![Value::Int(i), Value::str(format!("g{}", i))])
        .collect();
    let prepared = LocalExecutor::default()
        .prepare(&dag, &RowReader::from_rows(rows))
        .unwrap();

    // New data flows through the same fold dispatch: a row with a group
    // seen in training is routed to the model that excluded it.
    assert_eq!(
        prepared
            .apply(&[Value::Int(3), Value::str("g3")])
            .unwrap()[0],
        Value::Int(0)
    );
}

#[test]
fn test_repeated_preparation_is_deterministic() {
    let prepare_once = || {
        let v = ProducerNode::placeholder("v");
        let cross = CrossTrained::new(Arc::new(TrainedIndicator::new()))
            .with_fold_count(4)
            .unwrap()
            .with_seed(99)
            .node(vec![Arc::clone(&v)], None);
        let dag = Dag::new(vec![v], vec![cross]).unwrap();
        LocalExecutor::default()
            .prepare(&dag, &RowReader::from_rows(value_rows(0..40)))
            .unwrap()
    };

    let first = prepare_once();
    let second = prepare_once();
    assert_eq!(first.preparation_outputs(), second.preparation_outputs());
    for probe in [-3i64, 0, 12, 39, 40] {
        assert_eq!(
            first.apply(&[Value::Int(probe)]).unwrap(),
            second.apply(&[Value::Int(probe)]).unwrap()
        );
    }
}

#[test]
fn test_batch_children_see_lazily_filtered_readers() {
    let v = ProducerNode::placeholder("v");
    let cross = CrossTrained::new(Arc::new(BatchRowCount))
        .with_fold_count(5)
        .unwrap()
        .node(vec![Arc::clone(&v)], None);
    let dag = Dag::new(vec![v], vec![cross]).unwrap();

    let prepared = LocalExecutor::default()
        .prepare(&dag, &RowReader::from_rows(value_rows(0..50)))
        .unwrap();

    // The retrain model's reader spans every row.
    assert_eq!(prepared.apply(&[Value::Int(0)]).unwrap()[0], Value::Int(50));

    // Fold model f trains on the rows whose fold is not f; groups default
    // to the example index 0..49.
    let mut fold_sizes = [0i64; 5];
    for i in 0..50 {
        fold_sizes[fold_assignment(&Value::Int(i), 5, 0)] += 1;
    }
    let outputs = &prepared.preparation_outputs()[0];
    for (i, out) in outputs.iter().enumerate() {
        let fold = fold_assignment(&Value::Int(i as i64), 5, 0);
        assert_eq!(*out, Value::Int(50 - fold_sizes[fold]), "row {}", i);
    }
}

#[test]
fn test_same_group_rows_share_a_fold() {
    // Two rows sharing a group value can never train the fold model that
    // scores them, so both dispatch to 0 even though their values differ.
    let v = ProducerNode::placeholder("v");
    let group = ProducerNode::placeholder("group");
    let cross = CrossTrained::new(Arc::new(TrainedIndicator::new()))
        .with_fold_count(3)
        .unwrap()
        .node(vec![Arc::clone(&v)], Some(Arc::clone(&group)));
    let dag = Dag::new(vec![v, group], vec![cross]).unwrap();

    let mut rows: Vec<Vec<Value>> = (0..30)
        .map(|i| vec![Value::Int(i), Value::str(format!("g{}", i % 10))])
        .collect();
    rows.push(vec![Value::Int(5), Value::str("g5")]);
    let prepared = LocalExecutor::default()
        .prepare(&dag, &RowReader::from_rows(rows))
        .unwrap();
    assert!(prepared.preparation_outputs()[0]
        .iter()
        .all(|out| *out == Value::Int(0)));
}
