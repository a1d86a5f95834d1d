//! Run status polling.
//!
//! `policy` holds the pure decisions, `session` one `(run_id, mode)` polling task and its
//! state machine, `controller` mode selection and session lifetime. Presentation layers only
//! talk to the controller.

mod controller;
pub(crate) mod policy;
pub(crate) mod session;

pub(crate) use controller::{run_poller, PollCommand, PollerDeps, PollerEvent};
pub(crate) use policy::{Notice, PollPolicy};
pub(crate) use session::SettleReason;
