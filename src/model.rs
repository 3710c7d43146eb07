pub mod error;
pub mod model;

pub use error::*;
pub use model::*;
