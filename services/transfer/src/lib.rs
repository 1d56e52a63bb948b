//! Bagframes Transfer - the object-store side of the bagframes routine
//!
//! Downloads bag recordings from a source bucket, runs the frame extractor on
//! them and replaces the contents of a destination bucket with the produced
//! image tree.
//!
//! # Example
//!
//! ```rust,no_run
//! use bagframes_transfer::{Config, Routine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let routine = Routine::from_config(config).await?;
//!     let report = routine.run().await?;
//!     println!("{} files stored", report.uploads.succeeded());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod object_store;
pub mod routine;
pub mod transfer;

// Re-export main types
pub use config::{Config, ConfigValidationError, LoggingConfig, StoreConfig};
pub use object_store::{ObjectEntry, ObjectStore, S3ObjectStore};
pub use routine::{Routine, RoutineReport};
pub use transfer::{BagDownloader, TransferOutcome, TransferReport, TreePublisher};
