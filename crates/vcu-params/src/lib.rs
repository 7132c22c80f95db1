pub mod error;
pub mod schema;
pub mod storage;
pub mod store;
pub mod value;

pub use error::ParamError;
pub use schema::{Param, ParamSpec, MAX_KEY_LEN};
pub use storage::{FileStorage, MemoryStorage, ParamStorage};
pub use store::{ParamChange, ParamStore, ParamWarning, SubscriptionId};
pub use value::{BoundKind, Bounds, ParamKind, ParamValue};
