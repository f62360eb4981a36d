pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType, ModelSettings, PathSettings, SynthesisSettings, TrainingSettings};
pub use model_metadata::ModelMetadata;
pub use model_storage::{
    export_web, load_bundle, load_metadata, load_native, model_from_bytes, model_to_bytes, print_metadata_info,
    save_bundle, save_metadata, save_native, ModelBundle,
};
