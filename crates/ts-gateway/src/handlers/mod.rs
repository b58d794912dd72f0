//! LSP request handlers.
//!
//! This module wires handler submodules together.

mod diagnostics;
mod features;
mod initialize;
mod position;
mod sync;
mod translate;

pub use diagnostics::spawn_notification_pump;
pub use features::{code_action, hover, navigation, references};
pub use initialize::initialize;
pub use sync::{did_change, did_close, did_open};
