//! # Renter Components
//!
//! The renter (also called gamer in the protocol) submits tasks and receives
//! results asynchronously. See [`renter::RenterClient`] for the submit/await
//! contract and the ordered stream assembler.

pub mod renter;

// Re-export for convenience
pub use renter::{RenterClient, SubmitOptions, TaskHandle, TaskOutcome};
