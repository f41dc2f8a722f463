pub mod entities;
pub mod repositories;
pub mod sqlx_impls;
pub mod value_objects;

pub use entities::*;
pub use repositories::*;
pub use taskq_errors::{QueueError, QueueResult};
pub use value_objects::*;
