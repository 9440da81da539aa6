pub mod error;
pub mod grant;
pub mod graph;
pub mod income;
pub mod position;
pub mod scenario;
pub mod solver;
pub mod taxes;
pub mod types;

pub use error::ModelError;
pub use grant::{Grant, GrantSpec, SaleOutcome, VestingRow, VestingTable, month_diff, parse_date};
pub use graph::{ComputationGraph, Value};
pub use income::{SaleSimulation, commit_sales, simulate_sales};
pub use position::{Position, summation_name};
pub use scenario::{ScenarioConfig, build_graph};
pub use solver::{SolveConfig, SolveResult, SolveRound, solve_for};
pub use taxes::{TaxTable, amt_crossover, amt_exemption, apply_tax_table};
pub use types::{PerVehicle, SaleOrder, Shares, Vehicle};
