//! Domain models for fort-gym.
//!
//! - `Run` / `RunSpec`: a single execution and its creation input
//! - `Action` / `ValidatedAction`: the closed action vocabulary
//! - `FortGymError`: umbrella error for facade operations

pub mod action;
pub mod error;
pub mod run;

pub use action::{
    Action, ActionType, BuildParams, Buildable, Coord, Designation, InspectParams,
    KeystrokeParams, OrderItem, OrderParams, ValidatedAction, WaitParams,
};
pub use error::{FortGymError, Result};
pub use run::{Run, RunSpec};
