//! is-kernel
//!
//! Image-serving core of a crystallography beamline pipeline: turns
//! authenticated rendering requests into decoded, contrast-adjusted
//! JPEG tiles and 1-D line profiles from detector output files on
//! disk.
//!
//! # Architecture
//!
//! ```text
//! shared queue -> Dispatcher -> (auth cache hit | decrypt assertion -> spawn Supervisor)
//!              -> private queue -> Worker -> (Hdf5Reader | TiffRenderer) -> response sink
//! ```
//!
//! - `config`: two-stage configuration (`*ConfigFile` -> `Config`).
//! - `queue`: shared/private queue client trait, real (redis) and in-memory implementations.
//! - `auth`: decryption + signature verification of auth assertions, process table.
//! - `request`: wire-level request descriptor.
//! - `metadata`: HDF5 property-table extraction (Component A).
//! - `hdf5_reader`: frame discovery and per-frame reads (Component B).
//! - `render`: TIFF read, JPEG render, profile render (Component C).
//! - `worker`: per-job dispatch loop (Component D).
//! - `supervisor`: per-user worker pool lifecycle (Component E).
//! - `dispatcher`: shared-queue loop, auth, routing (Component F).
//! - `process_identity`: OS-identity switch used when spawning a supervisor.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod hdf5_reader;
pub mod metadata;
pub mod process_identity;
pub mod queue;
pub mod render;
pub mod request;
pub mod supervisor;
pub mod ui;
pub mod worker;

pub use config::Config;
pub use request::{JobType, RequestDescriptor};
