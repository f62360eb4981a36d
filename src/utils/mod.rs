pub mod error;
pub mod logging;

pub use error::VerificationError;
pub use logging::init_logging;
