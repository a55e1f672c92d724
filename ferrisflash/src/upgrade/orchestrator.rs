//! Drives one device through an upgrade run.

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::builder::DeviceTarget;
use super::config::UpgradeOptions;
use super::result::UpgradeResult;
use super::state::{UpgradeRun, UpgradeState};
use crate::device::{ConfigBackup, DeviceUpgrader, Verification, VersionCheck};
use crate::error::{ChannelError, DeviceError, Error, ErrorKind, Result, UpgradeError};
use crate::image::{FirmwareImage, ImageHost};
use crate::session::{ConnectRequest, Connector, CredentialPhase, Shell, wait_for_reconnect};

/// Sequences a driver's steps into one upgrade run.
///
/// The orchestrator owns the session for the whole run. It opens it with
/// the initial credentials, drops it once the flash is acknowledged, and
/// only ever reopens it with the upgraded credentials after that. Steps
/// run strictly in order and retries are bounded by [`UpgradeOptions`].
///
/// # Example
///
/// ```rust,no_run
/// use ferrisflash::{FirmwareImage, LocalImageHost, Orchestrator, SshConnector, TargetBuilder};
///
/// # async fn example() -> Result<(), ferrisflash::Error> {
/// let target = TargetBuilder::new("192.168.1.1")
///     .model("adtran-834v6")
///     .initial_credentials("admin", "password")
///     .upgraded_credentials("admin", "n3w-passw0rd")
///     .build()?;
///
/// let orchestrator = Orchestrator::new(SshConnector::default(), LocalImageHost::default());
/// let result = orchestrator.run(&target, &FirmwareImage::new("834v6.bin")).await;
/// println!("{} ({:?})", result.final_state, result.error_kind);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Orchestrator<C, H> {
    connector: C,
    image_host: H,
    options: UpgradeOptions,
}

impl<C: Connector, H: ImageHost> Orchestrator<C, H> {
    /// Create an orchestrator with default options.
    pub fn new(connector: C, image_host: H) -> Self {
        Self {
            connector,
            image_host,
            options: UpgradeOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: UpgradeOptions) -> Self {
        self.options = options;
        self
    }

    /// Options in effect.
    pub fn options(&self) -> &UpgradeOptions {
        &self.options
    }

    /// Connector used to reach devices.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Upgrade `target` with `image`.
    pub async fn run(&self, target: &DeviceTarget, image: &FirmwareImage) -> UpgradeResult {
        self.run_with_cancel(target, image, &CancellationToken::new())
            .await
    }

    /// Upgrade `target` with `image`, stopping early if `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        target: &DeviceTarget,
        image: &FirmwareImage,
        cancel: &CancellationToken,
    ) -> UpgradeResult {
        let driver = target.driver();
        self.run_driver(&driver, target, image, cancel).await
    }

    /// Upgrade `target` with an explicit driver.
    pub async fn run_driver<D: DeviceUpgrader>(
        &self,
        driver: &D,
        target: &DeviceTarget,
        image: &FirmwareImage,
        cancel: &CancellationToken,
    ) -> UpgradeResult {
        let mut run = UpgradeRun::new(target, image.path.clone());
        let mut session: Option<C::Session> = None;

        info!(
            "{}: upgrading {} with {}",
            target.host,
            driver.model(),
            image.path.display()
        );

        let outcome = tokio::select! {
            outcome = self.drive(driver, &mut run, &mut session, image, cancel) => outcome,
            _ = cancel.cancelled() => Err(UpgradeError::Cancelled.into()),
        };

        if let Some(mut shell) = session.take() {
            if let Err(e) = shell.close().await {
                debug!("{}: close after run: {}", target.host, e);
            }
        }

        match outcome {
            Ok(()) => {
                info!("{}: upgrade succeeded", target.host);
                UpgradeResult::from_run(run, None)
            }
            Err(error) => {
                let state = run.state();
                if let Err(e) = run.advance(UpgradeState::Failed) {
                    debug!("{}: {}", target.host, e);
                }
                warn!("{}: upgrade failed in {}: {}", target.host, state, error);
                UpgradeResult::from_run(run, Some(&error))
            }
        }
    }

    async fn drive<D: DeviceUpgrader>(
        &self,
        driver: &D,
        run: &mut UpgradeRun<'_>,
        session: &mut Option<C::Session>,
        image: &FirmwareImage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let options = &self.options;
        let image = image.validate().await?;

        enter(run, UpgradeState::ConnectingInitial, cancel)?;
        self.ensure_session(driver, run, session).await?;

        enter(run, UpgradeState::GatheringInfo, cancel)?;
        let shell = self.ensure_session(driver, run, session).await?;
        match driver.gather_info(shell, options.command_timeout).await {
            Ok(info) => {
                run.version_before = info.firmware_version.clone();
                run.device_info = Some(info);
            }
            Err(e) => {
                run.warn(format!("device info unavailable: {}", e));
                discard_if_broken(session, &e).await;
            }
        }

        enter(run, UpgradeState::BackingUp, cancel)?;
        let shell = self.ensure_session(driver, run, session).await?;
        match driver.backup_config(shell, options.command_timeout).await {
            Ok(backup) => {
                info!("{}: captured {} bytes of configuration", run.target().host, backup.len());
                run.backup = Some(backup);
            }
            Err(e) if e.kind() == ErrorKind::BackupUnsupported => {
                run.warn(format!("backup skipped: {}", e));
            }
            Err(e) => {
                run.warn(format!("backup failed: {}", e));
                discard_if_broken(session, &e).await;
            }
        }

        enter(run, UpgradeState::Uploading, cancel)?;
        let staged = self
            .image_host
            .publish(&image, driver.transfer_method())
            .await?;
        loop {
            run.attempts.upload += 1;
            let attempt = run.attempts.upload;
            let shell = self.ensure_session(driver, run, session).await?;
            match driver
                .upload_image(shell, &staged, options.transfer_timeout)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < options.retry.upload_attempts => {
                    warn!(
                        "{}: upload attempt {}/{} failed: {}",
                        run.target().host,
                        attempt,
                        options.retry.upload_attempts,
                        e
                    );
                    discard_if_broken(session, &e).await;
                    tokio::time::sleep(options.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }

        enter(run, UpgradeState::Flashing, cancel)?;
        let shell = self.ensure_session(driver, run, session).await?;
        driver
            .trigger_flash(shell, options.command_timeout)
            .await?;
        run.handoff()?;
        drop(staged);

        enter(run, UpgradeState::AwaitingReboot, cancel)?;
        if let Some(mut shell) = session.take() {
            if let Err(e) = shell.close().await {
                debug!("{}: closing pre-flash session: {}", run.target().host, e);
            }
        }
        let profile = driver.reboot_profile();
        let settle = options.settle_for(&profile);
        debug!("{}: letting the device settle for {:?}", run.target().host, settle);
        tokio::time::sleep(settle).await;

        enter(run, UpgradeState::ReconnectingUpgraded, cancel)?;
        let request = ConnectRequest {
            host: run.target().reconnect_host(driver.post_upgrade_host()),
            credentials: run.credentials(CredentialPhase::Upgraded)?,
            phase: CredentialPhase::Upgraded,
            prompt: driver.prompt(),
            timeout: options.connect_timeout,
        };
        match wait_for_reconnect(&self.connector, &request, &options.reconnect_policy(&profile)).await {
            Ok(shell) => *session = Some(shell),
            Err(Error::Upgrade(UpgradeError::ReconnectTimeout {
                waited,
                attempts,
                last_error,
            })) => {
                run.attempts.reconnect = attempts;
                if let Some(last_error) = last_error {
                    run.warn(format!("last reconnect error: {}", last_error));
                }
                return Err(UpgradeError::UpgradeTimedOut { waited, attempts }.into());
            }
            Err(e) => return Err(e),
        }

        enter(run, UpgradeState::Verifying, cancel)?;
        self.verify(driver, run, session).await?;

        if let Some(backup) = run.backup.clone() {
            enter(run, UpgradeState::Restoring, cancel)?;
            self.restore(driver, run, session, &backup).await;
        }

        enter(run, UpgradeState::Succeeded, cancel)
    }

    /// Read the version back and apply the version check.
    async fn verify<D: DeviceUpgrader>(
        &self,
        driver: &D,
        run: &mut UpgradeRun<'_>,
        session: &mut Option<C::Session>,
    ) -> Result<()> {
        let shell = self.ensure_session(driver, run, session).await?;
        let check = VersionCheck {
            previous: run.version_before.as_deref(),
            expected: self.options.expected_version.as_deref(),
        };
        match driver
            .verify_upgrade(shell, &check, self.options.command_timeout)
            .await
        {
            Ok(Verification { version, upgraded }) => {
                run.version_after = Some(version.clone());
                if !upgraded {
                    return Err(UpgradeError::VerificationFailed { version }.into());
                }
                info!(
                    "{}: firmware {} -> {}",
                    run.target().host,
                    run.version_before.as_deref().unwrap_or("unknown"),
                    version
                );
                Ok(())
            }
            Err(Error::Device(DeviceError::VerificationUnsupported)) => {
                run.warn("verification inconclusive: model cannot report its firmware version");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Put the backup back. Never fails the run; problems become warnings
    /// and leave the backup in the result.
    async fn restore<D: DeviceUpgrader>(
        &self,
        driver: &D,
        run: &mut UpgradeRun<'_>,
        session: &mut Option<C::Session>,
        backup: &ConfigBackup,
    ) {
        let retry = &self.options.retry;
        loop {
            run.attempts.restore += 1;
            let attempt = run.attempts.restore;
            let outcome = match self.ensure_session(driver, run, session).await {
                Ok(shell) => {
                    driver
                        .restore_config(shell, backup, self.options.command_timeout)
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    info!("{}: configuration restored", run.target().host);
                    run.backup_restored = true;
                    return;
                }
                Err(e) if e.is_transient() && attempt < retry.restore_attempts => {
                    warn!(
                        "{}: restore attempt {}/{} failed: {}",
                        run.target().host,
                        attempt,
                        retry.restore_attempts,
                        e
                    );
                    discard_if_broken(session, &e).await;
                    tokio::time::sleep(retry.backoff).await;
                }
                Err(e) => {
                    run.warn(format!(
                        "configuration restore failed after {} attempt(s): {}",
                        attempt, e
                    ));
                    return;
                }
            }
        }
    }

    /// The live session for the run's current phase, reconnecting if the
    /// previous one was dropped.
    async fn ensure_session<'s, D: DeviceUpgrader>(
        &self,
        driver: &D,
        run: &mut UpgradeRun<'_>,
        session: &'s mut Option<C::Session>,
    ) -> Result<&'s mut C::Session> {
        let phase = run.phase();
        let usable = session
            .as_ref()
            .is_some_and(|shell| shell.is_open() && shell.phase() == phase);

        if !usable {
            if let Some(mut stale) = session.take() {
                if let Err(e) = stale.close().await {
                    debug!("{}: closing stale session: {}", run.target().host, e);
                }
            }
            *session = Some(self.connect(driver, run).await?);
        }

        session.as_mut().ok_or_else(|| ChannelError::Closed.into())
    }

    /// Open a session with the active credentials, retrying transient
    /// failures. Rejected credentials are never retried.
    async fn connect<D: DeviceUpgrader>(
        &self,
        driver: &D,
        run: &mut UpgradeRun<'_>,
    ) -> Result<C::Session> {
        let phase = run.phase();
        let target = run.target();
        let host = match phase {
            CredentialPhase::Initial => target.host.as_str(),
            CredentialPhase::Upgraded => target.reconnect_host(driver.post_upgrade_host()),
        };
        let request = ConnectRequest {
            host,
            credentials: run.credentials(phase)?,
            phase,
            prompt: driver.prompt(),
            timeout: self.options.connect_timeout,
        };
        let retry = &self.options.retry;

        let mut attempt = 0;
        loop {
            attempt += 1;
            run.attempts.connect += 1;
            match self.connector.connect(&request).await {
                Ok(shell) => {
                    debug!("{}: connected ({:?} credentials)", host, phase);
                    return Ok(shell);
                }
                Err(e) if e.is_transient() && attempt < retry.connect_attempts => {
                    warn!(
                        "{}: connect attempt {}/{} failed: {}",
                        host, attempt, retry.connect_attempts, e
                    );
                    tokio::time::sleep(retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Cooperative cancellation point before every transition.
fn enter(run: &mut UpgradeRun<'_>, next: UpgradeState, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(UpgradeError::Cancelled.into());
    }
    run.advance(next)
}

/// Drop a session whose stream can no longer be trusted.
async fn discard_if_broken<S: Shell>(session: &mut Option<S>, error: &Error) {
    if !matches!(error.kind(), ErrorKind::Connection | ErrorKind::Timeout) {
        return;
    }
    if let Some(mut shell) = session.take() {
        if let Err(e) = shell.close().await {
            debug!("closing broken session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::device::vendors::adtran::tests::{SHOW_VERSION_NEW, SHOW_VERSION_OLD};
    use crate::image::{StagedImage, TransferMethod, ValidatedImage};
    use crate::session::script::{Event, ScriptedConnector, ScriptedShell};
    use crate::upgrade::TargetBuilder;

    /// Hands out an address without serving anything; scripted devices
    /// never fetch.
    struct StaticHost;

    impl ImageHost for StaticHost {
        async fn publish(
            &self,
            image: &ValidatedImage,
            method: TransferMethod,
        ) -> Result<StagedImage> {
            let port = match method {
                TransferMethod::Http => 8000,
                TransferMethod::Tftp => 69,
            };
            Ok(StagedImage::external(
                method,
                SocketAddr::from(([192, 168, 1, 100], port)),
                image,
            ))
        }
    }

    fn firmware(name: &str) -> FirmwareImage {
        let dir = std::env::temp_dir().join(format!("ferrisflash-run-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"firmware image").unwrap();
        FirmwareImage::new(path)
    }

    fn target(model: &str) -> DeviceTarget {
        TargetBuilder::new("192.168.1.1")
            .model(model)
            .initial_credentials("admin", "factory")
            .upgraded_credentials("admin", "n3w")
            .build()
            .unwrap()
    }

    fn orchestrator(connector: ScriptedConnector) -> Orchestrator<ScriptedConnector, StaticHost> {
        Orchestrator::new(connector, StaticHost)
    }

    fn adtran_v6_initial() -> ScriptedShell {
        ScriptedShell::new("834-6> ")
            .on("show version", SHOW_VERSION_OLD)
            .on("show wifi config", "wireless.i5g.ssid='ADTRAN-5G'")
            .on("show mfg", "MFG_SERIAL=LBADTN2203AB123")
            .on_raw("upgrade", "Upgrade firmware from URL? (y/n) ")
            .on_raw(
                "y",
                "Downloading image...\r\n100%\r\nDownload complete\r\nProceed with upgrade? (y/n) ",
            )
            .on_raw("y", "Writing image to flash, device will reboot...\r\n")
    }

    fn comtrend_v2_initial() -> ScriptedShell {
        ScriptedShell::new("> ")
            .on("swversion show", "Software version: 2.0.4-ct")
            .on("tftp", "Image flashed successfully")
            .on_hangup("restoredefault", "Restoring default settings and rebooting...\r\n")
    }

    fn comtrend_v2_upgraded() -> ScriptedShell {
        ScriptedShell::new("> ").on("swversion show", "Software version: 2.1.0-ct")
    }

    fn phase_of(event: &Event) -> CredentialPhase {
        match event {
            Event::Connect { phase, .. } | Event::Send { phase, .. } | Event::Close { phase } => {
                *phase
            }
        }
    }

    /// Initial-phase events all precede the first upgraded-phase event.
    fn assert_single_handoff(events: &[Event]) {
        let first_upgraded = events
            .iter()
            .position(|e| phase_of(e) == CredentialPhase::Upgraded)
            .unwrap_or(events.len());
        assert!(events[..first_upgraded]
            .iter()
            .all(|e| phase_of(e) == CredentialPhase::Initial));
        assert!(events[first_upgraded..]
            .iter()
            .all(|e| phase_of(e) == CredentialPhase::Upgraded));
    }

    fn connect_hosts(events: &[Event]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Connect { host, .. } => Some(host.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_adtran_v6_upgrade_succeeds() {
        let connector = ScriptedConnector::new()
            .shell(adtran_v6_initial())
            .refused()
            .refused()
            .shell(ScriptedShell::new("834-6> ").on("show version", SHOW_VERSION_NEW));
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v6");

        let result = orchestrator.run(&target, &firmware("834v6.bin")).await;

        assert_eq!(result.final_state, UpgradeState::Succeeded);
        assert_eq!(result.error_kind, None);
        assert!(!result.backup_restored);
        assert!(result.flash_started());
        assert_eq!(result.version_before.as_deref(), Some("22.3.1.2"));
        assert_eq!(result.version_after.as_deref(), Some("23.1.0.4"));
        assert!(result.warnings.iter().any(|w| w.contains("backup skipped")));
        assert_eq!(
            result.device_info.as_ref().and_then(|i| i.wifi_ssid.as_deref()),
            Some("ADTRAN-5G")
        );

        let events = orchestrator.connector().events();
        assert_eq!(
            connect_hosts(&events),
            vec!["192.168.1.1", "172.16.192.1", "172.16.192.1", "172.16.192.1"]
        );
        assert_eq!(
            orchestrator.connector().sent(CredentialPhase::Upgraded),
            vec!["show version"]
        );
        assert_single_handoff(&events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adtran_reboot_after_upgrade_successful() {
        let initial = ScriptedShell::new("834-6> ")
            .buffered()
            .on("show version", SHOW_VERSION_OLD)
            .on_raw("upgrade", "Are you sure you want to upgrade the firmware? (y/n) ")
            .on_raw("y", "Proceed with firmware download? (y/n) ")
            .on_hangup(
                "y",
                "Downloading firmware...\r\n100%\r\nUpgrade successful. Rebooting...\r\n",
            );
        let connector = ScriptedConnector::new()
            .shell(initial)
            .shell(ScriptedShell::new("834-6> ").on("show version", SHOW_VERSION_NEW));
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v6");

        let result = orchestrator.run(&target, &firmware("834v6-reboot.bin")).await;

        assert_eq!(result.final_state, UpgradeState::Succeeded);
        assert_eq!(result.attempts.upload, 1);
        assert!(result.flash_started());
        assert_eq!(result.version_after.as_deref(), Some("23.1.0.4"));
        let events = orchestrator.connector().events();
        assert_eq!(connect_hosts(&events), vec!["192.168.1.1", "172.16.192.1"]);
        assert_single_handoff(&events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adtran_upload_retried_after_failed_download() {
        let initial = ScriptedShell::new("834-6> ")
            .buffered()
            .on("show version", SHOW_VERSION_OLD)
            .on("upgrade", "Downloading image...\r\nError: connection reset")
            .on_raw("upgrade", "Upgrade firmware from URL? (y/n) ")
            .on_raw(
                "y",
                "Downloading image...\r\n100%\r\nDownload complete\r\nProceed with upgrade? (y/n) ",
            )
            .on_raw("y", "Writing image to flash, device will reboot...\r\n");
        let connector = ScriptedConnector::new()
            .shell(initial)
            .shell(ScriptedShell::new("834-6> ").on("show version", SHOW_VERSION_NEW));
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v6");

        let result = orchestrator.run(&target, &firmware("834v6-retry.bin")).await;

        assert_eq!(result.final_state, UpgradeState::Succeeded);
        assert_eq!(result.attempts.upload, 2);
        assert_eq!(result.attempts.connect, 1);
        let sent = orchestrator.connector().sent(CredentialPhase::Initial);
        assert_eq!(
            sent.iter().filter(|input| input.starts_with("upgrade")).count(),
            2
        );
        assert_eq!(sent.last().map(String::as_str), Some("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_never_returns() {
        let connector = ScriptedConnector::new().shell(adtran_v6_initial());
        let orchestrator = orchestrator(connector)
            .with_options(UpgradeOptions::default().reboot_wait(Duration::from_secs(300)));
        let target = target("adtran-834v6");

        let result = orchestrator.run(&target, &firmware("834v6-lost.bin")).await;

        assert_eq!(result.final_state, UpgradeState::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::UpgradeTimedOut));
        assert_eq!(result.failed_in, Some(UpgradeState::ReconnectingUpgraded));
        assert!(result.flash_started());
        assert_eq!(result.attempts.reconnect, 20);
        assert!(result.warnings.iter().any(|w| w.contains("connection refused")));
        assert_single_handoff(&orchestrator.connector().events());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let connector = ScriptedConnector::new().auth_failure().shell(comtrend_v2_initial());
        let orchestrator = orchestrator(connector);
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2-auth.img")).await;

        assert_eq!(result.final_state, UpgradeState::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Auth));
        assert_eq!(result.failed_in, Some(UpgradeState::ConnectingInitial));
        assert_eq!(result.attempts.connect, 1);
        assert_eq!(orchestrator.connector().connect_attempts(), 1);
        assert!(!result.flash_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_backup_is_a_warning() {
        let connector = ScriptedConnector::new()
            .shell(comtrend_v2_initial())
            .shell(comtrend_v2_upgraded());
        let orchestrator = orchestrator(connector);
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2.img")).await;

        assert!(result.is_success());
        assert!(!result.backup_restored);
        assert!(result.unrestored_backup.is_none());
        assert!(result.history.contains(&UpgradeState::Uploading));
        assert!(!result.history.contains(&UpgradeState::Restoring));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("not supported on Comtrend VR-3071v2")));
        assert_single_handoff(&orchestrator.connector().events());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retried_on_transfer_error() {
        let initial = ScriptedShell::new("> ")
            .buffered()
            .on("swversion show", "Software version: 2.0.4-ct")
            .on("tftp", "tftp: timeout waiting for 192.168.1.100")
            .on("tftp", "tftp: timeout waiting for 192.168.1.100")
            .on("tftp", "Image flashed successfully")
            .on_hangup("restoredefault", "Restoring default settings and rebooting...\r\n");
        let connector = ScriptedConnector::new()
            .shell(initial)
            .shell(comtrend_v2_upgraded());
        let orchestrator = orchestrator(connector);
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2-retry.img")).await;

        assert_eq!(result.final_state, UpgradeState::Succeeded);
        assert_eq!(result.attempts.upload, 3);
        assert_eq!(result.attempts.connect, 1);
        let uploads = orchestrator
            .connector()
            .sent(CredentialPhase::Initial)
            .into_iter()
            .filter(|input| input.starts_with("tftp"))
            .count();
        assert_eq!(uploads, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_gives_up_after_retry_budget() {
        let initial = ScriptedShell::new("> ")
            .on("swversion show", "Software version: 2.0.4-ct")
            .on("tftp", "tftp: timeout waiting for 192.168.1.100");
        let connector = ScriptedConnector::new().shell(initial);
        let orchestrator = orchestrator(connector);
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2-budget.img")).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Transfer));
        assert_eq!(result.failed_in, Some(UpgradeState::Uploading));
        assert_eq!(result.attempts.upload, 3);
        assert!(!result.flash_started());
        assert!(orchestrator
            .connector()
            .sent(CredentialPhase::Initial)
            .iter()
            .all(|input| input != "restoredefault"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_retries_transient_failures() {
        let connector = ScriptedConnector::new()
            .refused()
            .hang()
            .shell(comtrend_v2_initial())
            .shell(comtrend_v2_upgraded());
        let orchestrator = orchestrator(connector);
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2-connect.img")).await;

        assert!(result.is_success());
        assert_eq!(result.attempts.connect, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_device_fails_after_retries() {
        let orchestrator = orchestrator(ScriptedConnector::new());
        let target = target("comtrend-vr3071");

        let result = orchestrator.run(&target, &firmware("vr3071-down.bin")).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Connection));
        assert_eq!(result.failed_in, Some(UpgradeState::ConnectingInitial));
        assert_eq!(orchestrator.connector().connect_attempts(), 3);
    }

    const CONFIG: &str = "!\nhostname 834-5\n!\ninterface eth0\n ip address 192.168.1.1 255.255.255.0";

    fn adtran_v5_initial() -> ScriptedShell {
        ScriptedShell::new("834-5# ")
            .on("show version", SHOW_VERSION_OLD)
            .on("show config", CONFIG)
            .on_raw(
                "upgrade firmware",
                "Downloading image...\r\nDownload complete\r\nProceed with upgrade? (y/n) ",
            )
            .on_raw("y", "Upgrading firmware...\r\n")
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_restored_after_upgrade() {
        let connector = ScriptedConnector::new()
            .shell(adtran_v5_initial())
            .shell(ScriptedShell::new("834-5# ").on("show version", SHOW_VERSION_NEW));
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v5");

        let result = orchestrator.run(&target, &firmware("834v5.bin")).await;

        assert!(result.is_success(), "{:?}", result.error);
        assert!(result.backup_restored);
        assert!(result.unrestored_backup.is_none());
        assert_eq!(result.history.last(), Some(&UpgradeState::Succeeded));
        assert!(result.history.contains(&UpgradeState::Restoring));

        let upgraded = orchestrator.connector().sent(CredentialPhase::Upgraded);
        assert_eq!(upgraded.first().map(String::as_str), Some("show version"));
        assert_eq!(upgraded.last().map(String::as_str), Some("write memory"));
        assert!(upgraded.iter().any(|line| line == "hostname 834-5"));
        assert_single_handoff(&orchestrator.connector().events());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_failure_keeps_success() {
        let connector = ScriptedConnector::new().shell(adtran_v5_initial()).shell(
            ScriptedShell::new("834-5# ")
                .on("show version", SHOW_VERSION_NEW)
                .on("hostname", "% Invalid input detected"),
        );
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v5");

        let result = orchestrator.run(&target, &firmware("834v5-restore.bin")).await;

        assert_eq!(result.final_state, UpgradeState::Succeeded);
        assert!(!result.backup_restored);
        assert_eq!(result.attempts.restore, 1);
        assert!(result
            .unrestored_backup
            .as_ref()
            .is_some_and(|backup| backup.as_text().contains("hostname 834-5")));
        assert!(result.warnings.iter().any(|w| w.contains("restore failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_version_fails_verification() {
        let connector = ScriptedConnector::new()
            .shell(adtran_v6_initial())
            .shell(ScriptedShell::new("834-6> ").on("show version", SHOW_VERSION_OLD));
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v6");

        let result = orchestrator.run(&target, &firmware("834v6-same.bin")).await;

        assert_eq!(result.error_kind, Some(ErrorKind::VerificationFailed));
        assert_eq!(result.failed_in, Some(UpgradeState::Verifying));
        assert!(result.flash_started());
        assert_eq!(result.version_after.as_deref(), Some("22.3.1.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_version_must_match() {
        let connector = ScriptedConnector::new()
            .shell(comtrend_v2_initial())
            .shell(comtrend_v2_upgraded());
        let orchestrator = orchestrator(connector)
            .with_options(UpgradeOptions::default().expected_version("2.2.0-ct"));
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2-expected.img")).await;

        assert_eq!(result.error_kind, Some(ErrorKind::VerificationFailed));
        assert_eq!(result.version_after.as_deref(), Some("2.1.0-ct"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_image_touches_no_device() {
        let orchestrator = orchestrator(ScriptedConnector::new().shell(comtrend_v2_initial()));
        let target = target("comtrend-vr3071v2");
        let missing = FirmwareImage::new(PathBuf::from("/nonexistent/ferrisflash/fw.img"));

        let result = orchestrator.run(&target, &missing).await;

        assert_eq!(result.error_kind, Some(ErrorKind::InvalidImage));
        assert_eq!(result.failed_in, Some(UpgradeState::Init));
        assert_eq!(orchestrator.connector().connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let orchestrator = orchestrator(ScriptedConnector::new().shell(comtrend_v2_initial()));
        let target = target("comtrend-vr3071v2");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .run_with_cancel(&target, &firmware("vr3071v2-cancel.img"), &cancel)
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(orchestrator.connector().connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_awaiting_reboot() {
        let connector = ScriptedConnector::new()
            .shell(adtran_v6_initial())
            .shell(ScriptedShell::new("834-6> ").on("show version", SHOW_VERSION_NEW));
        let orchestrator = orchestrator(connector);
        let target = target("adtran-834v6");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let result = orchestrator
            .run_with_cancel(&target, &firmware("834v6-cancel.bin"), &cancel)
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(result.failed_in, Some(UpgradeState::AwaitingReboot));
        assert!(result.flash_started());
        assert!(orchestrator
            .connector()
            .events()
            .iter()
            .all(|e| phase_of(e) == CredentialPhase::Initial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_serializes() {
        let connector = ScriptedConnector::new()
            .shell(comtrend_v2_initial())
            .shell(comtrend_v2_upgraded());
        let orchestrator = orchestrator(connector);
        let target = target("comtrend-vr3071v2");

        let result = orchestrator.run(&target, &firmware("vr3071v2-json.img")).await;
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["final_state"], "SUCCEEDED");
        assert_eq!(json["error_kind"], serde_json::Value::Null);
        assert_eq!(json["model"], "comtrend-vr3071v2");
        assert_eq!(json["flash_started"], true);
        assert!(json.get("unrestored_backup").is_none());
    }
}
