//! Builder for upgrade targets.

use crate::device::{DeviceRegistry, DriverFactory, Model, ModelDriver};
use crate::error::{Result, UpgradeError};
use crate::transport::Credentials;

/// A device to upgrade.
///
/// Immutable once a run starts. Built with [`TargetBuilder`].
#[derive(Debug)]
pub struct DeviceTarget {
    /// Address the device answers on before the upgrade.
    pub host: String,

    /// Model, resolved through the device registry.
    pub model: Model,

    /// Factory credentials, valid until the flash.
    pub initial_credentials: Credentials,

    /// Credentials valid once the new firmware runs.
    pub upgraded_credentials: Credentials,

    /// Address to reconnect to after the upgrade, overriding the driver's.
    pub post_upgrade_host: Option<String>,

    factory: DriverFactory,
}

impl DeviceTarget {
    /// Build a fresh driver for this target's model.
    pub fn driver(&self) -> ModelDriver {
        (self.factory)()
    }

    /// Host to reconnect to after flashing.
    ///
    /// An explicit `post_upgrade_host` wins over the driver's, which wins
    /// over the original host.
    pub fn reconnect_host<'a>(&'a self, driver_default: Option<&'a str>) -> &'a str {
        self.post_upgrade_host
            .as_deref()
            .or(driver_default)
            .unwrap_or(&self.host)
    }
}

/// Builder for constructing upgrade targets.
///
/// # Example
///
/// ```rust,no_run
/// use ferrisflash::TargetBuilder;
///
/// # fn example() -> Result<(), ferrisflash::Error> {
/// let target = TargetBuilder::new("192.168.1.1")
///     .model("adtran-834v6")
///     .initial_credentials("admin", "password")
///     .upgraded_credentials("admin", "n3w-passw0rd")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct TargetBuilder {
    host: String,
    model: Option<String>,
    initial: Option<Credentials>,
    upgraded: Option<Credentials>,
    post_upgrade_host: Option<String>,
}

impl TargetBuilder {
    /// Create a new target builder for the specified host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the model identifier (e.g., "adtran-834v6", "VR-3071").
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the factory credentials.
    pub fn initial_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.initial = Some(Credentials::new(username, password));
        self
    }

    /// Set the post-upgrade credentials.
    pub fn upgraded_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.upgraded = Some(Credentials::new(username, password));
        self
    }

    /// Reconnect to `host` after the upgrade instead of the model default.
    pub fn post_upgrade_host(mut self, host: impl Into<String>) -> Self {
        self.post_upgrade_host = Some(host.into());
        self
    }

    /// Build the target.
    ///
    /// Fails with `UnknownModel` if no driver is registered for the model.
    pub fn build(self) -> Result<DeviceTarget> {
        let invalid = |reason: &str| UpgradeError::InvalidTarget {
            reason: reason.to_string(),
        };

        if self.host.trim().is_empty() {
            return Err(invalid("host is required").into());
        }
        let identifier = self.model.ok_or_else(|| invalid("model is required"))?;
        let registry = DeviceRegistry::global();
        let model = registry.model(&identifier)?;
        let factory = registry.resolve(&identifier)?;

        let initial_credentials = self
            .initial
            .ok_or_else(|| invalid("initial credentials are required"))?;
        let upgraded_credentials = self
            .upgraded
            .ok_or_else(|| invalid("upgraded credentials are required"))?;

        Ok(DeviceTarget {
            host: self.host,
            model,
            initial_credentials,
            upgraded_credentials,
            post_upgrade_host: self.post_upgrade_host,
            factory,
        })
    }
}
