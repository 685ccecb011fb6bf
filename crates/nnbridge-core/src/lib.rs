//! nnbridge reference runtime
//!
//! A small in-process inference runtime that the C boundary drives:
//! interpreters load JSON models, sessions resolve execution plans and run
//! elementwise `f32` operators, and the expression, image-processing and
//! generation layers sit beside them.
//!
//! # Example
//!
//! ```rust
//! use nnbridge_core::{Interpreter, ScheduleConfig};
//!
//! let model = br#"{
//!     "inputs": [{"name": "input", "shape": [1, 2]}],
//!     "ops": [{"name": "relu", "type": "ReLU", "inputs": ["input"], "outputs": ["output"]}],
//!     "outputs": ["output"]
//! }"#;
//! let mut interpreter = Interpreter::from_buffer(model).unwrap();
//! let (_, session) = interpreter.create_session(&ScheduleConfig::default()).unwrap();
//! let mut session = session.lock();
//! session.resize().unwrap();
//! session.run().unwrap();
//! assert_eq!(session.output(Some("output")).unwrap().read().shape(), &[1, 2]);
//! ```

pub mod config;
pub mod cv;
pub mod error;
pub mod express;
pub mod interpreter;
pub mod llm;
pub mod model;
pub mod runtime;
pub mod session;
pub mod tensor;
pub mod types;

pub use config::{BackendConfig, PathMode, ScheduleConfig, SubPath};
pub use error::{Result, RuntimeError};
pub use interpreter::{Interpreter, SessionId, SharedSession};
pub use llm::{GenerationConfig, GenerationContext, GenerationEngine};
pub use model::{Model, OpKind};
pub use runtime::RuntimeManager;
pub use session::{OpInfo, RunObserver, Session, SessionInfo, SessionState};
pub use tensor::{Placement, SharedTensor, Tensor, TensorId};
pub use types::{DimensionType, ForwardType, HandleDataType, TypeCode, TypeTag};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
