//! Immutable producer DAGs.
//!
//! A producer is any node yielding a per-row value: roots (placeholder,
//! constant, example-index generator), sub-DAG primitives (array-element
//! accessor, variadic list), transformer nodes (prepared or preparable),
//! and transformer views. Nodes are immutable and held behind
//! [`ProducerHandle`]s; configuration methods return new nodes, and cycles
//! are unconstructible because a node's inputs must exist before the node.
//!
//! Structural equality and hashing recurse over the graph so an executor
//! can deduplicate equal producers and prepare them once.

pub mod executor;
pub mod reduce;

use crate::error::{PrepareError, Result};
use crate::transform::{PreparableTransformer, PreparedTransformer, PreparerResult};
use crate::values::{stable_hash, Value};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared reference to an immutable producer node.
pub type ProducerHandle = Arc<ProducerNode>;

static NEXT_PLACEHOLDER_ID: AtomicU64 = AtomicU64::new(0);

/// A named root that receives one value per example row from the executor.
/// Each placeholder has its own identity; two placeholders with the same
/// name are still distinct inputs.
#[derive(Clone)]
pub struct Placeholder {
    name: Arc<str>,
    id: u64,
}

impl Placeholder {
    fn fresh(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            id: NEXT_PLACEHOLDER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Extraction of a value from another node's preparation result. The
/// produced value is constant for the whole execution; this is how
/// prepared models escape their node as ordinary values (best-prepared-
/// model and group-table views).
pub struct TransformerView {
    name: Arc<str>,
    extract: Arc<dyn Fn(&PreparerResult) -> Value + Send + Sync>,
}

impl TransformerView {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extract(&self, result: &PreparerResult) -> Value {
        (self.extract)(result)
    }
}

/// What a producer node is, minus its input wiring.
pub enum NodeKind {
    Placeholder(Placeholder),
    Constant(Value),
    /// Root generating the 0-based example index within the execution.
    ExampleIndex,
    /// Pulls one positional element out of a list-valued input.
    ArrayElement { index: usize },
    /// Packs its N inputs into one list value.
    VariadicList,
    Prepared(Arc<dyn PreparedTransformer>),
    Preparable(Arc<dyn PreparableTransformer>),
    View(TransformerView),
}

/// A producer: node kind plus the ordered parent producers.
pub struct ProducerNode {
    kind: NodeKind,
    inputs: Vec<ProducerHandle>,
    hash: OnceCell<u64>,
}

impl ProducerNode {
    fn build(kind: NodeKind, inputs: Vec<ProducerHandle>) -> ProducerHandle {
        Arc::new(Self {
            kind,
            inputs,
            hash: OnceCell::new(),
        })
    }

    pub fn placeholder(name: impl Into<Arc<str>>) -> ProducerHandle {
        Self::build(NodeKind::Placeholder(Placeholder::fresh(name)), Vec::new())
    }

    pub fn constant(value: Value) -> ProducerHandle {
        Self::build(NodeKind::Constant(value), Vec::new())
    }

    pub fn example_index() -> ProducerHandle {
        Self::build(NodeKind::ExampleIndex, Vec::new())
    }

    pub fn array_element(input: ProducerHandle, index: usize) -> ProducerHandle {
        Self::build(NodeKind::ArrayElement { index }, vec![input])
    }

    pub fn variadic_list(inputs: Vec<ProducerHandle>) -> ProducerHandle {
        Self::build(NodeKind::VariadicList, inputs)
    }

    pub fn prepared(
        transformer: Arc<dyn PreparedTransformer>,
        inputs: Vec<ProducerHandle>,
    ) -> ProducerHandle {
        Self::build(NodeKind::Prepared(transformer), inputs)
    }

    pub fn preparable(
        transformer: Arc<dyn PreparableTransformer>,
        inputs: Vec<ProducerHandle>,
    ) -> ProducerHandle {
        Self::build(NodeKind::Preparable(transformer), inputs)
    }

    /// A view over a preparable node's preparation result.
    ///
    /// The view's name identifies the extraction: two views with equal
    /// names over structurally equal targets are themselves equal.
    pub fn view(
        name: impl Into<Arc<str>>,
        target: ProducerHandle,
        extract: impl Fn(&PreparerResult) -> Value + Send + Sync + 'static,
    ) -> Result<ProducerHandle> {
        let name = name.into();
        if !matches!(target.kind(), NodeKind::Preparable(_)) {
            return Err(PrepareError::configuration(
                name.as_ref(),
                format!("view target {} is not a preparable transformer", target.name()),
            ));
        }
        Ok(Self::build(
            NodeKind::View(TransformerView {
                name,
                extract: Arc::new(extract),
            }),
            vec![target],
        ))
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The ordered parent producers ("input list").
    pub fn inputs(&self) -> &[ProducerHandle] {
        &self.inputs
    }

    pub fn arity(&self) -> usize {
        self.inputs.len()
    }

    /// Copy of this node with the parent positions replaced. The new input
    /// list must have the same length; transformer semantics are untouched
    /// and the original node is never mutated.
    pub fn with_inputs(&self, inputs: Vec<ProducerHandle>) -> Result<ProducerHandle> {
        if inputs.len() != self.inputs.len() {
            return Err(PrepareError::validation(format!(
                "{} takes {} inputs, got {}",
                self.name(),
                self.inputs.len(),
                inputs.len()
            )));
        }
        let kind = match &self.kind {
            NodeKind::Placeholder(p) => NodeKind::Placeholder(p.clone()),
            NodeKind::Constant(v) => NodeKind::Constant(v.clone()),
            NodeKind::ExampleIndex => NodeKind::ExampleIndex,
            NodeKind::ArrayElement { index } => NodeKind::ArrayElement { index: *index },
            NodeKind::VariadicList => NodeKind::VariadicList,
            NodeKind::Prepared(t) => NodeKind::Prepared(Arc::clone(t)),
            NodeKind::Preparable(t) => NodeKind::Preparable(Arc::clone(t)),
            NodeKind::View(v) => NodeKind::View(TransformerView {
                name: Arc::clone(&v.name),
                extract: Arc::clone(&v.extract),
            }),
        };
        Ok(Self::build(kind, inputs))
    }

    /// Display name for logs and errors.
    pub fn name(&self) -> String {
        match &self.kind {
            NodeKind::Placeholder(p) => format!("placeholder({})", p.name()),
            NodeKind::Constant(v) => format!("constant({})", v),
            NodeKind::ExampleIndex => "example-index".to_string(),
            NodeKind::ArrayElement { index } => format!("array-element[{}]", index),
            NodeKind::VariadicList => "variadic-list".to_string(),
            NodeKind::Prepared(t) => t.name().to_string(),
            NodeKind::Preparable(t) => t.name().to_string(),
            NodeKind::View(v) => format!("view({})", v.name()),
        }
    }

    /// Whether the per-row output is independent of the inputs.
    pub fn has_constant_result(&self) -> bool {
        match &self.kind {
            NodeKind::Constant(_) | NodeKind::View(_) => true,
            NodeKind::Prepared(t) => t.has_constant_result(),
            NodeKind::Preparable(t) => t.has_constant_result(),
            _ => false,
        }
    }

    /// Stable structural hash over the node and its transitive inputs.
    pub fn structural_hash(&self) -> u64 {
        *self.hash.get_or_init(|| {
            let mut h: u64 = match &self.kind {
                NodeKind::Placeholder(p) => 0x11_u64.wrapping_mul(31).wrapping_add(p.id),
                NodeKind::Constant(v) => 0x22_u64.wrapping_mul(31).wrapping_add(stable_hash(v)),
                NodeKind::ExampleIndex => 0x33,
                NodeKind::ArrayElement { index } => {
                    0x44_u64.wrapping_mul(31).wrapping_add(*index as u64)
                }
                NodeKind::VariadicList => 0x55,
                NodeKind::Prepared(t) => {
                    0x66_u64.wrapping_mul(31).wrapping_add(Arc::as_ptr(t) as *const () as u64)
                }
                NodeKind::Preparable(t) => {
                    0x77_u64.wrapping_mul(31).wrapping_add(Arc::as_ptr(t) as *const () as u64)
                }
                NodeKind::View(v) => 0x88_u64
                    .wrapping_mul(31)
                    .wrapping_add(stable_hash(&Value::str(v.name.as_ref()))),
            };
            for input in &self.inputs {
                h = h
                    .wrapping_mul(0x100_0000_01b3)
                    .wrapping_add(input.structural_hash());
            }
            h
        })
    }

    /// Structural equality: same kind, same payload, structurally equal
    /// inputs. Transformer payloads compare by instance identity.
    pub fn structural_eq(&self, other: &ProducerNode) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.structural_hash() != other.structural_hash() {
            return false;
        }
        let kinds_match = match (&self.kind, &other.kind) {
            (NodeKind::Placeholder(a), NodeKind::Placeholder(b)) => a.id == b.id,
            (NodeKind::Constant(a), NodeKind::Constant(b)) => a == b,
            (NodeKind::ExampleIndex, NodeKind::ExampleIndex) => true,
            (NodeKind::ArrayElement { index: a }, NodeKind::ArrayElement { index: b }) => a == b,
            (NodeKind::VariadicList, NodeKind::VariadicList) => true,
            (NodeKind::Prepared(a), NodeKind::Prepared(b)) => Arc::ptr_eq(a, b),
            (NodeKind::Preparable(a), NodeKind::Preparable(b)) => Arc::ptr_eq(a, b),
            (NodeKind::View(a), NodeKind::View(b)) => a.name == b.name,
            _ => false,
        };
        kinds_match
            && self.inputs.len() == other.inputs.len()
            && self
                .inputs
                .iter()
                .zip(&other.inputs)
                .all(|(a, b)| a.structural_eq(b))
    }
}

impl fmt::Debug for ProducerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name(), self.inputs.len())
    }
}

/// Hash/Eq adapter so handles can key a map by structure.
#[derive(Clone)]
pub struct NodeKey(pub ProducerHandle);

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.structural_eq(&other.0)
    }
}

impl Eq for NodeKey {}

impl std::hash::Hash for NodeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.structural_hash());
    }
}

/// A validated DAG: declared placeholder roots plus output producers.
#[derive(Debug)]
pub struct Dag {
    placeholders: Vec<ProducerHandle>,
    outputs: Vec<ProducerHandle>,
}

impl Dag {
    /// Validates and assembles a DAG.
    ///
    /// Every placeholder reachable from the outputs must appear in
    /// `placeholders`, every declared root must actually be a placeholder,
    /// and every transformer node's input count must match its declared
    /// arity. Failures carry the offending producer's display name.
    pub fn new(placeholders: Vec<ProducerHandle>, outputs: Vec<ProducerHandle>) -> Result<Dag> {
        let mut declared = std::collections::HashSet::new();
        for root in &placeholders {
            match root.kind() {
                NodeKind::Placeholder(p) => {
                    if !declared.insert(p.id()) {
                        return Err(PrepareError::validation(format!(
                            "duplicate root {}",
                            root.name()
                        )));
                    }
                }
                _ => {
                    return Err(PrepareError::validation(format!(
                        "root {} is not a placeholder",
                        root.name()
                    )))
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        let mut stack: Vec<ProducerHandle> = outputs.clone();
        while let Some(node) = stack.pop() {
            if !seen.insert(NodeKey(Arc::clone(&node))) {
                continue;
            }
            Self::validate_node(&node, &declared)?;
            stack.extend(node.inputs().iter().cloned());
        }

        Ok(Dag {
            placeholders,
            outputs,
        })
    }

    fn validate_node(
        node: &ProducerHandle,
        declared: &std::collections::HashSet<u64>,
    ) -> Result<()> {
        let expected = match node.kind() {
            NodeKind::Placeholder(p) => {
                if !declared.contains(&p.id()) {
                    return Err(PrepareError::validation(format!(
                        "unresolved input {}: not among the DAG roots",
                        node.name()
                    )));
                }
                Some(0)
            }
            NodeKind::Constant(_) | NodeKind::ExampleIndex => Some(0),
            NodeKind::ArrayElement { .. } | NodeKind::View(_) => Some(1),
            NodeKind::VariadicList => None,
            NodeKind::Prepared(t) => t.arity(),
            NodeKind::Preparable(t) => t.arity(),
        };
        if let Some(expected) = expected {
            if node.inputs().len() != expected {
                return Err(PrepareError::validation(format!(
                    "{} takes {} inputs, got {}",
                    node.name(),
                    expected,
                    node.inputs().len()
                )));
            }
        }
        Ok(())
    }

    pub fn placeholders(&self) -> &[ProducerHandle] {
        &self.placeholders
    }

    pub fn outputs(&self) -> &[ProducerHandle] {
        &self.outputs
    }

    /// The DAG with value-level reduction applied to its outputs:
    /// constant-result folding and absent-input short-circuiting.
    pub fn reduced(&self) -> Result<Dag> {
        let mut memo = std::collections::HashMap::new();
        let outputs = self
            .outputs
            .iter()
            .map(|o| reduce::reduce_handle(o, &mut memo))
            .collect::<Result<Vec<_>>>()?;
        Ok(Dag {
            placeholders: self.placeholders.clone(),
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::FnPrepared;

    fn add_node(a: ProducerHandle, b: ProducerHandle) -> ProducerHandle {
        ProducerNode::prepared(
            Arc::new(
                FnPrepared::new("add", |row: &[Value]| {
                    Value::Int(row.iter().filter_map(Value::as_int).sum())
                })
                .with_arity(2),
            ),
            vec![a, b],
        )
    }

    #[test]
    fn test_placeholders_are_distinct() {
        let a = ProducerNode::placeholder("x");
        let b = ProducerNode::placeholder("x");
        assert!(!a.structural_eq(&b));
        assert!(a.structural_eq(&a));
    }

    #[test]
    fn test_structural_equality_recurses() {
        let x = ProducerNode::placeholder("x");
        let c = ProducerNode::constant(Value::Int(1));
        let sum1 = add_node(Arc::clone(&x), Arc::clone(&c));
        let sum2 = add_node(Arc::clone(&x), Arc::clone(&c));
        // Same transformer instance? No: each add_node allocates its own.
        assert!(!sum1.structural_eq(&sum2));

        let shared: Arc<dyn crate::transform::PreparedTransformer> = Arc::new(
            FnPrepared::new("add", |row: &[Value]| {
                Value::Int(row.iter().filter_map(Value::as_int).sum())
            })
            .with_arity(2),
        );
        let sum3 = ProducerNode::prepared(Arc::clone(&shared), vec![Arc::clone(&x), Arc::clone(&c)]);
        let sum4 = ProducerNode::prepared(shared, vec![x, c]);
        assert!(sum3.structural_eq(&sum4));
        assert_eq!(sum3.structural_hash(), sum4.structural_hash());
    }

    #[test]
    fn test_with_inputs_is_copy_on_write() {
        let x = ProducerNode::placeholder("x");
        let y = ProducerNode::placeholder("y");
        let c = ProducerNode::constant(Value::Int(1));
        let sum = add_node(Arc::clone(&x), c);
        let rewired = sum
            .with_inputs(vec![Arc::clone(&x), Arc::clone(&y)])
            .unwrap();
        assert!(rewired.inputs()[1].structural_eq(&y));
        // Original untouched.
        assert!(matches!(sum.inputs()[1].kind(), NodeKind::Constant(_)));
        assert!(sum.with_inputs(vec![x]).is_err());
    }

    #[test]
    fn test_validation_rejects_undeclared_placeholder() {
        let x = ProducerNode::placeholder("x");
        let y = ProducerNode::placeholder("y");
        let sum = add_node(Arc::clone(&x), Arc::clone(&y));
        let err = Dag::new(vec![x], vec![sum]).unwrap_err();
        assert!(err.to_string().contains("unresolved input"));
    }

    #[test]
    fn test_validation_rejects_arity_mismatch() {
        let x = ProducerNode::placeholder("x");
        let bad = ProducerNode::prepared(
            Arc::new(FnPrepared::new("pair", |r: &[Value]| r[0].clone()).with_arity(2)),
            vec![Arc::clone(&x)],
        );
        let err = Dag::new(vec![x], vec![bad]).unwrap_err();
        assert!(err.to_string().contains("takes 2 inputs"));
    }

    #[test]
    fn test_validation_rejects_non_placeholder_root() {
        let c = ProducerNode::constant(Value::Int(1));
        let err = Dag::new(vec![c.clone()], vec![c]).unwrap_err();
        assert!(err.to_string().contains("not a placeholder"));
    }

    #[test]
    fn test_view_requires_preparable_target() {
        let c = ProducerNode::constant(Value::Int(1));
        let err = ProducerNode::view("best-model", c, |_| Value::Absent).unwrap_err();
        assert!(matches!(err, PrepareError::Configuration { .. }));
    }
}
