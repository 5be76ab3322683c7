use std::process::ExitCode;

use anyhow::Error;
use clap::Parser;
use log::{error, info};
use nbc_api::config::Config;
use nbc_api::error::ReportError;
use nbc_api::primitives::bytes::FormatSize;

use nbc::cancellation::CancellationToken;
use nbc::cli::{Cli, Commands};
use nbc::progress::{JsonProgressReporter, ProgressReporter, TextProgressReporter};
use nbc::{installer, updater, NBC_VERSION};

fn setup_logging(cli: &Cli) -> Result<(), Error> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(cli.verbosity)
        .init();
    Ok(())
}

fn reporter(json: bool) -> Box<dyn ProgressReporter> {
    if json {
        Box::new(JsonProgressReporter)
    } else {
        Box::new(TextProgressReporter)
    }
}

fn install_config(
    image: Option<String>,
    local_image: Option<std::path::PathBuf>,
    device: Option<std::path::PathBuf>,
    loopback: Option<std::path::PathBuf>,
    loopback_size_bytes: Option<u64>,
    filesystem: nbc::cli::CliFilesystemType,
    kernel_args: Vec<String>,
    encrypt: bool,
    passphrase: Option<String>,
    tpm2: bool,
    root_password: Option<String>,
    dry_run: bool,
    force: bool,
    json: bool,
) -> Config {
    Config {
        target_device: device,
        loopback_image_path: loopback,
        loopback_image_size_bytes: loopback_size_bytes,
        image_reference: image,
        local_image_path: local_image,
        root_filesystem: filesystem.into(),
        encrypt,
        encryption_passphrase: passphrase,
        tpm2_auto_unlock: tpm2,
        extra_kernel_args: kernel_args,
        root_password,
        dry_run,
        force,
        json_output: json,
        skip_pull: false,
    }
}

fn run(cli: &Cli) -> Result<(), nbc_api::error::NbcError> {
    let token = CancellationToken::new();
    if let Err(e) = token.install_signal_handler() {
        log::warn!("Failed to install Ctrl-C handler: {e:#}");
    }

    match &cli.command {
        Commands::Install {
            image,
            local_image,
            device,
            loopback,
            loopback_size_bytes,
            filesystem,
            kernel_args,
            encrypt,
            passphrase,
            tpm2,
            root_password,
            dry_run,
            force,
        } => {
            let config = install_config(
                image.clone(),
                local_image.clone(),
                device.clone(),
                loopback.clone(),
                *loopback_size_bytes,
                *filesystem,
                kernel_args.clone(),
                *encrypt,
                passphrase.clone(),
                *tpm2,
                root_password.clone(),
                *dry_run,
                *force,
                cli.json,
            );
            config.validate()?;
            installer::run_install(&config, reporter(cli.json).as_ref(), &token)
        }
        Commands::Update {
            image,
            local_image,
            force,
            skip_pull,
            dry_run,
        } => {
            let config = Config {
                target_device: None,
                loopback_image_path: None,
                loopback_image_size_bytes: None,
                image_reference: image.clone(),
                local_image_path: local_image.clone(),
                root_filesystem: nbc_api::config::FilesystemType::Ext4,
                encrypt: false,
                encryption_passphrase: None,
                tpm2_auto_unlock: false,
                extra_kernel_args: Vec::new(),
                root_password: None,
                dry_run: *dry_run,
                force: *force,
                json_output: cli.json,
                skip_pull: *skip_pull,
            };
            updater::run_update(&config, reporter(cli.json).as_ref(), &token)
        }
        Commands::List => {
            let disks = osutils::block_devices::list_disks()
                .structured(nbc_api::error::InternalError::Internal(
                    "failed to enumerate block devices",
                ))?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!(disks
                        .iter()
                        .map(|d| serde_json::json!({
                            "device": d.device,
                            "size_bytes": d.size_bytes,
                            "model": d.model,
                            "removable": d.removable,
                            "partitions": d.partitions,
                        }))
                        .collect::<Vec<_>>())
                );
            } else {
                for disk in &disks {
                    println!(
                        "{}\t{}\t{}{}",
                        disk.device.display(),
                        FormatSize(disk.size_bytes),
                        disk.model.as_deref().unwrap_or("unknown model"),
                        if disk.removable { "\t(removable)" } else { "" },
                    );
                }
            }
            Ok(())
        }
        Commands::Status => {
            let system_config = updater::read_system_config().structured(
                nbc_api::error::InternalError::Internal(
                    "failed to read the persisted system configuration",
                ),
            )?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&system_config).unwrap());
            } else {
                println!("Device:        {}", system_config.device.display());
                println!("Disk ID:       {}", system_config.disk_id);
                println!("Active slot:   {:?}", system_config.active_slot);
                println!("Image:         {}", system_config.image.reference);
                println!("Digest:        {}", system_config.image.digest);
                println!("Encrypted:     {}", system_config.encrypted());
                println!("Installed:     {}", system_config.install_date);
            }
            Ok(())
        }
        Commands::Validate {
            image,
            local_image,
            device,
            loopback,
            loopback_size_bytes,
            encrypt,
            passphrase,
        } => {
            let config = Config {
                target_device: device.clone(),
                loopback_image_path: loopback.clone(),
                loopback_image_size_bytes: *loopback_size_bytes,
                image_reference: image.clone(),
                local_image_path: local_image.clone(),
                root_filesystem: nbc_api::config::FilesystemType::Ext4,
                encrypt: *encrypt,
                encryption_passphrase: passphrase.clone(),
                tpm2_auto_unlock: false,
                extra_kernel_args: Vec::new(),
                root_password: None,
                dry_run: true,
                force: false,
                json_output: cli.json,
                skip_pull: false,
            };
            config.validate()?;
            println!("configuration is valid");
            Ok(())
        }
        Commands::Version => {
            println!("nbc {NBC_VERSION}");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("Failed to initialize logging: {e:?}");
        return ExitCode::from(1);
    }

    match run(&cli) {
        Ok(()) => {
            info!("nbc command completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("nbc command failed: {e:?}");
            ExitCode::from(1)
        }
    }
}
