use thiserror::Error;

use crate::schema::Param;
use crate::value::{BoundKind, ParamKind};

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter {0} is not defined")]
    Undefined(Param),

    #[error("parameter {0} is already defined")]
    AlreadyDefined(Param),

    #[error("parameter {param} expects {expected:?}, got {got:?}")]
    TypeMismatch { param: Param, expected: ParamKind, got: ParamKind },

    #[error("parameter {0} rejects non-finite values")]
    NotFinite(Param),

    #[error("{kind} value triggered for {param}={value}")]
    OutOfBounds { param: Param, kind: BoundKind, value: f64 },

    #[error("persist {param}: {source}")]
    Storage {
        param: Param,
        #[source]
        source: std::io::Error,
    },
}
