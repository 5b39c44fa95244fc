pub mod config;
pub mod error;
pub mod request;
pub mod result;

pub use config::RabbitConfig;
pub use error::DispatchError;
pub use request::{EngineType, OcrRequest};
pub use result::{OcrResult, OcrStatus};
