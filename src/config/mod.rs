//! Configuration management module
//!
//! Settings are read from the environment under the `MATRX_` prefix, with
//! an optional `.env` file loaded first for local development.

mod settings;

pub use settings::*;
