#![forbid(unsafe_code)]

//! Rowflux public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub mod prelude {
    pub use rowflux_diff as diff;
    pub use rowflux_runtime as runtime;

    pub use rowflux_diff::{Difference, Identify};
    pub use rowflux_runtime::{
        InstantRefresher, RowRefresher, RowSurface, Ticket, UpdateOutcome, UpdateScheduler,
        UpdaterConfig,
    };
}
