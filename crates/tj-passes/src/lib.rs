#![forbid(unsafe_code)]

//! Graph-to-graph passes run by the executor between specialization and
//! interpretation.

pub mod autodiff_subgraphs;
pub mod constant_pooling;
pub mod dead_code;
pub mod lower_grad_of;
pub mod requires_grad;
pub mod shape_analysis;

pub use autodiff_subgraphs::{SubgraphError, create_autodiff_subgraphs};
pub use constant_pooling::constant_pooling;
pub use dead_code::{eliminate_dead_code, eliminate_dead_code_in_block};
pub use lower_grad_of::lower_grad_of;
pub use requires_grad::propagate_requires_grad;
pub use shape_analysis::{ShapeError, propagate_input_shapes};
