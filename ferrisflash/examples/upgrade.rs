//! Upgrade one gateway and print the run result as JSON.
//!
//! # Prerequisites
//!
//! - The gateway reachable over SSH from this machine
//! - This machine reachable from the gateway's LAN on the advertised address
//!   (HTTP port 8000 for ADTRAN, TFTP port 69 for Comtrend)
//!
//! # Usage
//!
//! ```bash
//! INITIAL_PASSWORD=admin UPGRADED_PASSWORD=n3w \
//!   cargo run --example upgrade -- --host 192.168.1.1 --model vr3071 \
//!     --image ./VR-3071_fw.bin --advertise 192.168.1.100
//! ```
//!
//! Passwords are read from the environment so they stay out of shell history.

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ferrisflash::{
    CancellationToken, FirmwareImage, ImageHostConfig, LocalImageHost, Orchestrator,
    SshConnector, SshOptions, TargetBuilder, UpgradeOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let initial_password = env::var("INITIAL_PASSWORD").unwrap_or_else(|_| "admin".to_string());
    let upgraded_password = env::var("UPGRADED_PASSWORD")?;

    let mut builder = TargetBuilder::new(&args.host)
        .model(&args.model)
        .initial_credentials(&args.initial_user, initial_password)
        .upgraded_credentials(&args.upgraded_user, upgraded_password);
    if let Some(host) = &args.post_upgrade_host {
        builder = builder.post_upgrade_host(host);
    }
    let target = builder.build()?;

    let mut image = FirmwareImage::new(&args.image);
    if let Some(sha256) = &args.sha256 {
        image = image.with_sha256(sha256);
    }

    let image_host = LocalImageHost::new(ImageHostConfig {
        advertise: args.advertise,
        ..Default::default()
    });
    let mut options = UpgradeOptions::default();
    if let Some(wait) = args.reboot_wait {
        options = options.reboot_wait(Duration::from_secs(wait));
    }
    if let Some(version) = &args.expected_version {
        options = options.expected_version(version);
    }

    let orchestrator =
        Orchestrator::new(SshConnector::new(SshOptions::default()), image_host).with_options(options);

    // Ctrl-C stops the run at the next step boundary
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping...");
            on_interrupt.cancel();
        }
    });

    println!("Upgrading {} ({}) with {}...", target.host, target.model, args.image.display());
    let result = orchestrator.run_with_cancel(&target, &image, &cancel).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(backup) = &result.unrestored_backup {
        eprintln!(
            "Configuration was not restored; {} bytes of backup follow:\n{}",
            backup.len(),
            backup.as_text()
        );
    }

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    host: String,
    model: String,
    image: PathBuf,
    advertise: IpAddr,
    initial_user: String,
    upgraded_user: String,
    post_upgrade_host: Option<String>,
    sha256: Option<String>,
    expected_version: Option<String>,
    reboot_wait: Option<u64>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut host = "192.168.1.1".to_string();
        let mut model = None;
        let mut image = None;
        let mut advertise = ImageHostConfig::default().advertise;
        let mut initial_user = "admin".to_string();
        let mut upgraded_user = "admin".to_string();
        let mut post_upgrade_host = None;
        let mut sha256 = None;
        let mut expected_version = None;
        let mut reboot_wait = None;

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--host" | "-h" => host = value.unwrap_or(host),
                "--model" | "-m" => model = value,
                "--image" | "-i" => image = value.map(PathBuf::from),
                "--advertise" | "-a" => {
                    advertise = value.and_then(|v| v.parse().ok()).unwrap_or(advertise)
                }
                "--initial-user" => initial_user = value.unwrap_or(initial_user),
                "--upgraded-user" => upgraded_user = value.unwrap_or(upgraded_user),
                "--post-upgrade-host" => post_upgrade_host = value,
                "--sha256" => sha256 = value,
                "--expect-version" => expected_version = value,
                "--reboot-wait" => reboot_wait = value.and_then(|v| v.parse().ok()),
                "--help" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        let (Some(model), Some(image)) = (model, image) else {
            Self::print_help();
            std::process::exit(2);
        };

        Self {
            host,
            model,
            image,
            advertise,
            initial_user,
            upgraded_user,
            post_upgrade_host,
            sha256,
            expected_version,
            reboot_wait,
        }
    }

    fn print_help() {
        println!(
            r#"ferrisflash upgrade example

USAGE:
    cargo run --example upgrade -- --model <MODEL> --image <PATH> [OPTIONS]

OPTIONS:
    -h, --host <HOST>             Gateway address [default: 192.168.1.1]
    -m, --model <MODEL>           adtran-834v5, adtran-834v6, comtrend-vr3071, comtrend-vr3071v2
    -i, --image <PATH>            Firmware image
    -a, --advertise <IP>          Address the gateway fetches the image from [default: 192.168.1.100]
    --initial-user <USER>         Factory username [default: admin]
    --upgraded-user <USER>        Post-upgrade username [default: admin]
    --post-upgrade-host <HOST>    Address to reconnect to after flashing
    --sha256 <HEX>                Expected image digest
    --expect-version <VERSION>    Version the image carries
    --reboot-wait <SECS>          Override how long to wait for the reboot
    --help                        Print this help message

ENVIRONMENT:
    INITIAL_PASSWORD              Factory password [default: admin]
    UPGRADED_PASSWORD             Post-upgrade password (required)
"#
        );
    }
}
