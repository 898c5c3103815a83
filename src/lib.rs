#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! See the crate-level `README.md` above for an overview. This crate is a
//! thin facade over the coordination crates that make up the simulator;
//! most callers depend on `manager` directly and only need this crate when
//! they want every piece under a single dependency.

/// The simulated wall-clock-driven clock.
pub use clock;
/// Validated runtime configuration.
pub use config;
/// The Banker's-algorithm safety check and victim selection.
pub use detector;
/// The manager loop and its shared coordination state.
pub use manager;
/// The bounded process table.
pub use proctable;
/// The resource table, wait queues, and allocation accounting.
pub use restable;
/// The bounded request/notification channel between workers and the manager.
pub use transport;
/// Worker behaviors and the supervisor that spawns and reaps them.
pub use worker;
