//! # Ferrisflash
//!
//! Async SSH firmware upgrades for residential gateways.
//!
//! Ferrisflash logs into a gateway over SSH, records what it can about the
//! device, serves a firmware image to it, triggers the flash and follows the
//! device through its reboot, then logs back in with the post-upgrade
//! credentials to verify the new version and restore the configuration.
//!
//! ## Features
//!
//! - Async SSH sessions via russh
//! - Drivers for ADTRAN 834v5/834v6 and Comtrend VR-3071/VR-3071v2
//! - One-way credential hand-off once the flash is acknowledged
//! - Bounded reconnect poll while the device reboots
//! - Built-in HTTP and TFTP image hosting
//! - Structured, serializable run results
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrisflash::{
//!     FirmwareImage, ImageHostConfig, LocalImageHost, Orchestrator, SshConnector, SshOptions,
//!     TargetBuilder,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ferrisflash::Error> {
//!     let target = TargetBuilder::new("192.168.1.1")
//!         .model("comtrend-vr3071")
//!         .initial_credentials("root", "admin")
//!         .upgraded_credentials("root", "n3w-passw0rd")
//!         .build()?;
//!
//!     let host = LocalImageHost::new(ImageHostConfig {
//!         advertise: "192.168.1.100".parse().unwrap(),
//!         ..Default::default()
//!     });
//!     let orchestrator = Orchestrator::new(SshConnector::new(SshOptions::default()), host);
//!
//!     let result = orchestrator
//!         .run(&target, &FirmwareImage::new("vr3071.bin"))
//!         .await;
//!     println!("{}: {}", result.host, result.final_state);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod device;
pub mod error;
pub mod image;
pub mod session;
pub mod transport;
pub mod upgrade;

// Re-export main types for convenience
pub use device::{DeviceRegistry, DeviceUpgrader, Model, ModelDriver};
pub use error::{Error, ErrorKind, Result};
pub use image::{FirmwareImage, ImageHost, ImageHostConfig, LocalImageHost, TransferMethod};
pub use session::{CredentialPhase, SshConnector};
pub use tokio_util::sync::CancellationToken;
pub use transport::{Credentials, SshOptions};
pub use upgrade::{
    DeviceTarget, Orchestrator, RetryPolicy, TargetBuilder, UpgradeOptions, UpgradeResult,
    UpgradeState,
};
