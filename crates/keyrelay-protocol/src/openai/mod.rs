pub mod error;
pub mod models;

pub use error::{ErrorBody, ErrorResponse};
pub use models::{ListModelsResponse, ListObjectType, Model, ModelObjectType};
