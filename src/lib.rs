pub mod admittance;
pub mod case;
pub mod config;
pub mod equations;
pub mod error;
pub mod export;
pub mod jacobian;
pub mod linalg;
pub mod loadflow;
pub mod parse;
pub mod server;

pub use case::{Bus, BusType, Line, Network};
pub use config::SolverConfig;
pub use error::{PowerFlowError, Result};
pub use loadflow::{
    FastDecoupled, GaussSeidel, Method, NewtonRaphson, PowerFlowSolution, PowerFlowSolver,
    run_load_flow,
};
