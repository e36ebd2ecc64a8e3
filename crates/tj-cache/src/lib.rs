#![forbid(unsafe_code)]

mod argument_spec;
mod executor_cache;

pub use argument_spec::{
    ArgumentInfo, ArgumentSpec, CompleteArgumentInfo, CompleteArgumentSpec, TensorInfo,
};
pub use executor_cache::{CacheLookup, CacheStats, ExecutorCache};
