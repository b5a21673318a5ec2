//! Stateright Model Checking
//!
//! Exhaustive state-space exploration of the directory's concurrency
//! protocol, complementing the seeded simulation in `dst`.
//!
//! ```text
//!     ┌──────────────────────────────────────┐
//!     │   Stateright  │   DST Tests  │ Unit │
//!     │  (Exhaustive) │ (Simulation) │      │
//!     └──────────────────────────────────────┘
//! ```
//!
//! ## Available Models
//!
//! - `directory`: get-or-create under the directory lock creates once
//!
//! ## Running Model Checks
//!
//! ```bash
//! cargo test -p tsdb-node stateright -- --nocapture
//! ```

pub mod directory;

pub use directory::{CreatorAction, CreatorPhase, DirectoryState, GetOrCreateModel};
