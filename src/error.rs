//! Crate-level error type

use crate::backend::BackendError;
use crate::dispatch::DispatchError;
use crate::loader::LoadError;
use crate::resources::MeshError;
use crate::stats::StatsError;
use crate::streams::StreamError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TilerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("{what} capacity of {requested} exceeds the limit of {limit}")]
    Capacity {
        what: &'static str,
        requested: u64,
        limit: u64,
    },
    #[error(transparent)]
    Stats(#[from] StatsError),
}

pub type TilerResult<T> = Result<T, TilerError>;
