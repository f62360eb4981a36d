pub mod augmentation;
pub mod dataset;
pub mod inference;
pub mod metrics;
pub mod ml_model;
pub mod scheduler;
pub mod synthesis;
pub mod training;

pub use augmentation::{AugmentParams, Augmenter};
pub use dataset::{build_dataset, DatasetSplits, IdCardBatch, IdCardBatcher, Label, Sample};
pub use inference::{InferenceEngine, Verification};
pub use metrics::BinaryMetrics;
pub use ml_model::{
    load_and_preprocess_image, preprocess_image, IdCardClassifier, ModelConfig, CHANNELS,
    CLASS_NAMES, DECISION_THRESHOLD, IMAGE_SIZE,
};
pub use synthesis::{NegativeStrategy, NegativeSynthesizer};
pub use training::{run_training, train, TrainingReport};
