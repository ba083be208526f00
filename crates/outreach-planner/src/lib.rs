//! Outreach planner crate - decides whom to contact about what, reads the
//! reply, and moves each (contact, goal) attempt through its lifecycle.
//!
//! Selection, classification, resolution, and transitions are pure functions
//! over snapshots. The dispatcher, reply handler, and sweep scheduler wrap
//! them with conditional writes so concurrent workers never double-send or
//! double-advance.

pub mod classifier;
pub mod dispatcher;
pub mod eligibility;
pub mod error;
pub mod guard;
pub mod history;
pub mod registry;
pub mod rehearsal;
pub mod reply;
pub mod resolver;
pub mod scheduler;
pub mod selector;
pub mod state;

pub use classifier::{Classification, LayeredClassifier, PatternClassifier, ResponseClassifier};
pub use dispatcher::{render_template, DeliveryHandle, DispatchOutcome, Dispatcher, Transport};
pub use eligibility::{check_eligibility, eligible_goals, is_eligible, Ineligible};
pub use error::{
    ClassifierError, DispatchError, PlannerError, RegistryError, RehearsalError, TransitionError,
    TransportError,
};
pub use guard::DoNotContactGuard;
pub use history::{Applied, Effects, Handled, HistoryService};
pub use registry::GoalRegistry;
pub use rehearsal::{Rehearsal, RehearsalReport, RehearsalStep, StopReason};
pub use reply::{ReplyHandler, ReplyResult};
pub use resolver::{resolve, Resolution, ResolutionInput};
pub use scheduler::{SweepScheduler, SweepSummary};
pub use selector::{
    select_base_goal, ArbiterChoice, GoalArbiter, GoalSelection, GoalSelector, BASE_GOAL_KEYS,
};
pub use state::{ContactState, StateReader};
