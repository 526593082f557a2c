pub mod models;

pub use models::{OpenRouterModel, OpenRouterModelsResponse};
