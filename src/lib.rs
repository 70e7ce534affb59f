pub mod attribute;
pub mod error;
pub mod layout;
pub mod lens;
pub mod linalg;
pub mod logger;
pub mod loss;
pub mod measure;
pub mod optimizer;
pub mod parameter;
pub mod problem;
pub mod relationships;
pub mod scene;
pub mod solve;
pub mod topology;

pub use attribute::{Attribute, AttributeStore, Frame, ObjectType, PlugId, TimeEvalMode};
pub use error::{CamSolveError, CamSolveResult};
pub use layout::RegularizationTerm;
pub use logger::{init_logger, init_logger_with_level};
pub use loss::RobustLossType;
pub use optimizer::{AutoDiffType, OptimizationStatus, SolverType};
pub use scene::{Scene, SceneGraphMode};
pub use solve::{
    CancellationFlag, FrameSolveMode, PrintStats, SolveMonitor, SolveRequest, SolveResult,
    SolverOptions, solve,
};
