//! Cross-validated best-model selection.
//!
//! Runs every candidate preparable through k-fold cross-training inside an
//! internal sub-DAG, scores each with an evaluator instance wired to the
//! candidate's cross-trained output, picks the candidate with the maximal
//! evaluation, then retrains it on all data. The selector's own input
//! list is the deduplicated union of the group input, the evaluator's
//! external inputs, and every candidate's inputs, in that order; index
//! arrays keep the bijection between that flat list and each embedded
//! transformer's positional inputs.

use crate::dag::{Dag, NodeKind, ProducerHandle, ProducerNode};
use crate::data::RowReader;
use crate::error::{PrepareError, Result};
use crate::meta::cross_trained::CrossTrained;
use crate::transform::{
    ExecutionCache, ModelHandle, PreparableTransformer, PreparedTransformer, Preparer,
    PreparerContext, PreparerMode, PreparerResult,
};
use crate::values::Value;
use serde::Serialize;
use std::sync::Arc;

/// What downstream preparers see while the outer DAG is still training.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PreparationDataInferenceMode {
    /// Preparation data is scored by the final model, which has seen every
    /// row ("cheating"; cheap and often fine for downstream nodes).
    #[default]
    Cheat,
    /// Preparation data is scored by the winning candidate's
    /// fold-dispatched cross-trained variant, so no row is scored by a
    /// model that trained on it.
    CrossInference,
}

/// Factory producing one evaluator instance per candidate: given a
/// producer of predicted labels, yields a preparable node whose finalized
/// output is the evaluation (any totally ordered value, larger is better).
pub type EvaluatorFactory = dyn Fn(ProducerHandle) -> Result<ProducerHandle> + Send + Sync;

const NAME: &str = "best-model";

/// Builder for the best-model selector node.
pub struct BestModel {
    candidates: Vec<ProducerHandle>,
    evaluator: Option<Arc<EvaluatorFactory>>,
    evaluator_external_inputs: Vec<ProducerHandle>,
    group_input: Option<ProducerHandle>,
    split_count: usize,
    seed: u64,
    inference_mode: PreparationDataInferenceMode,
}

impl std::fmt::Debug for BestModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BestModel")
            .field("candidates", &self.candidates.len())
            .field("has_evaluator", &self.evaluator.is_some())
            .field("evaluator_external_inputs", &self.evaluator_external_inputs.len())
            .field("group_input", &self.group_input.is_some())
            .field("split_count", &self.split_count)
            .field("seed", &self.seed)
            .field("inference_mode", &self.inference_mode)
            .finish()
    }
}

impl Default for BestModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BestModel {
    pub const DEFAULT_SPLIT_COUNT: usize = 5;

    pub fn new() -> Self {
        Self {
            candidates: Vec::new(),
            evaluator: None,
            evaluator_external_inputs: Vec::new(),
            group_input: None,
            split_count: Self::DEFAULT_SPLIT_COUNT,
            seed: 0,
            inference_mode: PreparationDataInferenceMode::default(),
        }
    }

    /// Copy with one more candidate. The node must be a preparable
    /// transformer with its inputs fully wired.
    pub fn with_candidate(mut self, candidate: ProducerHandle) -> Result<Self> {
        if !matches!(candidate.kind(), NodeKind::Preparable(_)) {
            return Err(PrepareError::configuration(
                NAME,
                format!("candidate {} is not a preparable transformer", candidate.name()),
            ));
        }
        self.candidates.push(candidate);
        Ok(self)
    }

    /// Copy with the evaluator factory. The factory is probed immediately:
    /// the preparable it yields must advertise a constant result, or this
    /// setter fails.
    pub fn with_evaluator(
        mut self,
        factory: impl Fn(ProducerHandle) -> Result<ProducerHandle> + Send + Sync + 'static,
    ) -> Result<Self> {
        let probe = ProducerNode::placeholder("predicted-label");
        let instance = factory(Arc::clone(&probe))?;
        match instance.kind() {
            NodeKind::Preparable(t) if t.has_constant_result() => {}
            NodeKind::Preparable(_) => {
                return Err(PrepareError::configuration(
                    NAME,
                    format!(
                        "evaluator {} does not advertise a constant result",
                        instance.name()
                    ),
                ));
            }
            _ => {
                return Err(PrepareError::configuration(
                    NAME,
                    format!("evaluator {} is not a preparable transformer", instance.name()),
                ));
            }
        }
        self.evaluator_external_inputs = instance
            .inputs()
            .iter()
            .filter(|input| !input.structural_eq(&probe))
            .cloned()
            .collect();
        self.evaluator = Some(Arc::new(factory));
        Ok(self)
    }

    /// Copy with the grouping input; defaults to the per-row example
    /// index.
    pub fn with_group_input(mut self, group: ProducerHandle) -> Self {
        self.group_input = Some(group);
        self
    }

    /// Copy with the evaluation fold count; must be at least 2.
    pub fn with_split_count(mut self, split_count: usize) -> Result<Self> {
        if split_count < 2 {
            return Err(PrepareError::argument(
                "split_count",
                format!("must be at least 2, got {}", split_count),
            ));
        }
        self.split_count = split_count;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_preparation_data_inference_mode(
        mut self,
        mode: PreparationDataInferenceMode,
    ) -> Self {
        self.inference_mode = mode;
        self
    }

    /// Assembles the selector node: flat deduplicated input union with the
    /// group first, then evaluator externals, then candidate inputs.
    pub fn node(self) -> Result<ProducerHandle> {
        if self.candidates.is_empty() {
            return Err(PrepareError::configuration(
                NAME,
                "no candidate transformers configured",
            ));
        }
        let evaluator = self.evaluator.clone().ok_or_else(|| {
            PrepareError::validation("best-model selector has no evaluator set")
        })?;

        let group = self
            .group_input
            .clone()
            .unwrap_or_else(ProducerNode::example_index);

        let mut flat: Vec<ProducerHandle> = Vec::new();
        let group_slot = slot_of(&mut flat, &group);
        for input in &self.evaluator_external_inputs {
            slot_of(&mut flat, input);
        }

        let mut candidates = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            let transformer = match candidate.kind() {
                NodeKind::Preparable(t) => Arc::clone(t),
                _ => {
                    return Err(PrepareError::configuration(
                        NAME,
                        format!("candidate {} is not preparable", candidate.name()),
                    ))
                }
            };
            let slots = candidate
                .inputs()
                .iter()
                .map(|input| slot_of(&mut flat, input))
                .collect();
            candidates.push(Candidate {
                name: candidate.name(),
                transformer,
                slots,
            });
        }

        let shared = Arc::new(Shared {
            flat: flat.clone(),
            group_slot,
            candidates,
            evaluator,
            split_count: self.split_count,
            seed: self.seed,
            inference_mode: self.inference_mode,
        });
        Ok(ProducerNode::preparable(
            Arc::new(BestModelTransformer { shared }),
            flat,
        ))
    }

    /// View of a best-model node exposing the winning prepared transformer
    /// as a stand-alone constant value in the outer DAG.
    pub fn best_model_view(node: &ProducerHandle) -> Result<ProducerHandle> {
        ProducerNode::view("best-prepared-model", Arc::clone(node), |result| {
            ModelHandle::into_value("best-prepared-model", Arc::clone(&result.for_new_data))
        })
    }
}

fn slot_of(flat: &mut Vec<ProducerHandle>, producer: &ProducerHandle) -> usize {
    match flat.iter().position(|f| f.structural_eq(producer)) {
        Some(found) => found,
        None => {
            flat.push(Arc::clone(producer));
            flat.len() - 1
        }
    }
}

struct Candidate {
    name: String,
    transformer: Arc<dyn PreparableTransformer>,
    slots: Vec<usize>,
}

struct Shared {
    flat: Vec<ProducerHandle>,
    group_slot: usize,
    candidates: Vec<Candidate>,
    evaluator: Arc<EvaluatorFactory>,
    split_count: usize,
    seed: u64,
    inference_mode: PreparationDataInferenceMode,
}

struct BestModelTransformer {
    shared: Arc<Shared>,
}

impl PreparableTransformer for BestModelTransformer {
    fn name(&self) -> &str {
        NAME
    }

    fn arity(&self) -> Option<usize> {
        Some(self.shared.flat.len())
    }

    fn preparer(&self, context: &PreparerContext) -> Result<Box<dyn Preparer>> {
        if self.shared.candidates.is_empty() {
            return Err(PrepareError::configuration(
                NAME,
                "no candidate transformers configured",
            ));
        }
        Ok(Box::new(BestModelPreparer {
            shared: Arc::clone(&self.shared),
            context: context.clone(),
        }))
    }
}

struct BestModelPreparer {
    shared: Arc<Shared>,
    context: PreparerContext,
}

#[derive(Serialize)]
struct CandidateStats {
    candidate: usize,
    name: String,
    evaluation: String,
}

impl Preparer for BestModelPreparer {
    fn mode(&self) -> PreparerMode {
        PreparerMode::Batch
    }

    fn process(&mut self, _row: &[Value]) -> Result<()> {
        // Batch mode: everything happens against the reader at finish.
        Ok(())
    }

    fn finish(self: Box<Self>, reader: Option<&RowReader>) -> Result<PreparerResult> {
        let reader = reader.ok_or_else(|| {
            PrepareError::configuration(NAME, "batch preparer finished without a reader")
        })?;
        let shared = &self.shared;
        let example_count = reader.count();

        // Internal sub-DAG: one array-valued placeholder delivers a row of
        // all selector inputs; element accessors pull out each position.
        let array_input = ProducerNode::placeholder("selector-inputs");
        let accessors: Vec<ProducerHandle> = (0..shared.flat.len())
            .map(|i| ProducerNode::array_element(Arc::clone(&array_input), i))
            .collect();

        let mut evaluation_nodes = Vec::with_capacity(shared.candidates.len());
        let mut model_views = Vec::with_capacity(shared.candidates.len());
        for (index, candidate) in shared.candidates.iter().enumerate() {
            let candidate_inputs: Vec<ProducerHandle> = candidate
                .slots
                .iter()
                .map(|&slot| Arc::clone(&accessors[slot]))
                .collect();
            let cross_trained = CrossTrained::new(Arc::clone(&candidate.transformer))
                .with_fold_count(shared.split_count)?
                .with_seed(shared.seed)
                .with_retrain_for_new_data(false)
                .node(
                    candidate_inputs,
                    Some(Arc::clone(&accessors[shared.group_slot])),
                );

            let instance = (shared.evaluator)(Arc::clone(&cross_trained))?;
            let rewired = instance
                .inputs()
                .iter()
                .map(|input| {
                    if Arc::ptr_eq(input, &cross_trained) {
                        return Ok(Arc::clone(&cross_trained));
                    }
                    match shared.flat.iter().position(|f| f.structural_eq(input)) {
                        Some(slot) => Ok(Arc::clone(&accessors[slot])),
                        None => Err(PrepareError::configuration(
                            NAME,
                            format!(
                                "evaluator input {} is not among the selector inputs",
                                input.name()
                            ),
                        )),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            evaluation_nodes.push(instance.with_inputs(rewired)?);
            model_views.push(ProducerNode::view(
                format!("cross-trained-model[{}]", index),
                cross_trained,
                |result| {
                    ModelHandle::into_value("cross-trained-model", Arc::clone(&result.for_new_data))
                },
            )?);
        }

        let evaluations_output = ProducerNode::variadic_list(evaluation_nodes);
        let models_output = ProducerNode::variadic_list(model_views);
        let sub_dag = Dag::new(vec![array_input], vec![evaluations_output, models_output])?;
        let sub_data = reader.map(|row| vec![Value::list(row)]);

        log::debug!(
            "{}: cross-validating {} candidates over {} examples",
            NAME,
            shared.candidates.len(),
            example_count
        );
        let prepared_sub = self
            .context
            .executor()
            .prepare_sub_dag(&sub_dag, &sub_data)?;

        // The evaluator contract makes both output lists constant.
        let evaluations = prepared_sub.output_constant(0)?;
        let evaluations = evaluations
            .as_list()
            .ok_or_else(|| PrepareError::reduction("best-model evaluations"))?;
        let models = prepared_sub.output_constant(1)?;
        let models = models
            .as_list()
            .ok_or_else(|| PrepareError::reduction("best-model candidate models"))?;

        let stats: Vec<CandidateStats> = shared
            .candidates
            .iter()
            .zip(evaluations)
            .enumerate()
            .map(|(candidate, (c, evaluation))| CandidateStats {
                candidate,
                name: c.name.clone(),
                evaluation: evaluation.to_string(),
            })
            .collect();
        log::info!(
            "candidate evaluations: {}",
            serde_json::to_string(&stats).unwrap_or_default()
        );

        // Largest evaluation wins; ties break to the lowest index.
        let mut best = 0;
        for (index, evaluation) in evaluations.iter().enumerate().skip(1) {
            if evaluation > &evaluations[best] {
                best = index;
            }
        }
        let winner = &shared.candidates[best];
        log::info!(
            "best candidate was {} ({}) with evaluation {}",
            best,
            winner.name,
            evaluations[best]
        );

        // Retrain the winner on all data, no cross-training.
        let winner_reader = reader.project(&winner.slots);
        let mut winner_preparer = winner
            .transformer
            .preparer(&self.context.scaled(example_count, 0))?;
        let winner_mode = winner_preparer.mode();
        for row in winner_reader.iter() {
            if !self.context.termination().running() {
                return Err(PrepareError::Cancelled);
            }
            winner_preparer.process(&row)?;
        }
        let retrain_reader = match winner_mode {
            PreparerMode::Batch => Some(&winner_reader),
            PreparerMode::Stream => None,
        };
        let retrained = winner_preparer
            .finish(retrain_reader)
            .map_err(PrepareError::from_inner)?;

        let for_new_data: Arc<dyn PreparedTransformer> = Arc::new(InputsProjected {
            name: format!("{}({})", NAME, winner.name),
            inner: retrained.for_new_data,
            slots: winner.slots.clone(),
        });
        let for_preparation_data = match shared.inference_mode {
            PreparationDataInferenceMode::Cheat => Arc::clone(&for_new_data),
            PreparationDataInferenceMode::CrossInference => {
                let dispatcher = ModelHandle::from_value(&models[best]).ok_or_else(|| {
                    PrepareError::reduction("best-model cross-trained dispatcher")
                })?;
                let mut slots = winner.slots.clone();
                slots.push(shared.group_slot);
                Arc::new(InputsProjected {
                    name: format!("{}({})/cross-inference", NAME, winner.name),
                    inner: dispatcher,
                    slots,
                }) as Arc<dyn PreparedTransformer>
            }
        };
        Ok(PreparerResult::new(for_preparation_data, for_new_data))
    }
}

/// Adapts a model trained over a candidate's own input list to the
/// selector's flat input list through the recorded index bijection.
struct InputsProjected {
    name: String,
    inner: Arc<dyn PreparedTransformer>,
    slots: Vec<usize>,
}

impl PreparedTransformer for InputsProjected {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, cache: Option<&dyn ExecutionCache>, row: &[Value]) -> Value {
        let projected: Vec<Value> = self.slots.iter().map(|&s| row[s].clone()).collect();
        self.inner.apply(cache, &projected)
    }

    fn create_cache(&self) -> Option<Arc<dyn ExecutionCache>> {
        self.inner.create_cache()
    }
}
