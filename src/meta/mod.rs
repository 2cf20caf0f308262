//! Meta-transformers: wrappers that orchestrate the preparation of other
//! transformers.

pub mod best_model;
pub mod cross_trained;
pub mod null_filtered;
pub mod per_group;

pub use best_model::{BestModel, EvaluatorFactory, PreparationDataInferenceMode};
pub use cross_trained::{fold_assignment, CrossTrained};
pub use null_filtered::{NullFiltered, NullFilteredPrepared};
pub use per_group::{GroupTable, PreparedByGroup, PreparedByGroups, UnknownGroupPolicy};
