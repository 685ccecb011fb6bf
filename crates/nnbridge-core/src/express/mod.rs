//! Dataflow expression layer: immediate-mode variables, elementwise and
//! reduction operators, and modules that run a model over variables.

mod module;
mod ops;
mod var;

pub use module::{Module, ModuleConfig};
pub use ops::{arg_max, arg_min, batch_mat_mul, binary, cast, mat_mul, reduce, unary, BinaryOp, CastTarget, ReduceOp, UnaryOp};
pub use var::{Var, VarData};
