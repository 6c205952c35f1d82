//! Scenario tests for the Canopy RoleRequest controller
//!
//! Tests are organized by the story they tell:
//!
//! - `approval_flow`: a requester consents, an approver signs off, and the
//!   role ends up bound
//! - `expiry`: requests disappear once their lifetime is over
//! - `tenancy`: requests only live in namespaces their tenant may use

mod approval_flow;
mod expiry;
mod helpers;
mod tenancy;
