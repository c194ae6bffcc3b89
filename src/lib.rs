//! TesoroTrack: batched, resumable sync of collectible catalog data from
//! external providers into a priced catalog.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod driver;
pub mod jobs;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod sources;
pub mod store;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::AppConfig;
pub use jobs::{JobContext, JobError};
