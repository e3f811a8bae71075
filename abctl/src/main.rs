// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Administrative CLI for A/B root filesystem and bootloader management

use std::path::PathBuf;

use abupdate::{
    disk::builder,
    partition::{cache_lsblk, cached_block_devices},
    Bootloader, Configuration, Partition, SystemMounter,
};
use clap::{Parser, Subcommand};
use color_eyre::{
    eyre::{eyre, Context},
    Section,
};
use pretty_env_logger::formatted_builder;
use serde::Serialize;

/// Manage the A/B root filesystem slots and their bootloader
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Override base path for all boot management operations
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Read block devices from the table saved by `cache-lsblk`
    #[arg(long, global = true)]
    cached: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report the running rootfs as successfully booted
    Booted,

    /// Slot and boot variable information
    Status {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Try the other rootfs on next boot
    Toggle,

    /// Copy the running rootfs boot files to the other slot
    SyncBootFiles,

    /// Install staged hardware assets and try the other rootfs on next boot
    UpdateBootloader,

    /// List all boot variables
    Vars,

    /// Print a single boot variable
    GetVar { name: String },

    /// Set a boot variable
    SetVar { name: String, value: String },

    /// Remove a boot variable, printing its prior value
    ClearVar { name: String },

    /// Save lsblk(8) output for later `--cached` runs
    #[command(hide = true)]
    CacheLsblk,
}

#[derive(Debug, Serialize)]
struct Status<'a> {
    bootloader: &'static str,
    current: &'a str,
    other: Option<&'a str>,
    next: Option<String>,
    mode: String,
    next_boot_is_other: bool,
}

fn inspect_root(config: Configuration, cached: bool) -> color_eyre::Result<Partition> {
    let probe = if cached {
        cached_block_devices(&config)
            .wrap_err("Unable to read the cached block device table")
            .with_suggestion(|| "Run `abctl cache-lsblk` first")?
    } else {
        builder::new()
            .build()
            .wrap_err("Unable to probe block devices")
            .with_note(|| "lsblk is required to locate the root filesystem slots")?
    };

    let root = config.root.display().to_string();
    let partition = Partition::new(config, &probe, Box::new(SystemMounter))
        .wrap_err(format!("Unable to find the root filesystem slots for `{root}`"))
        .with_note(|| "Root filesystems must be labelled system-a and system-b")?;

    log::info!("Using rootfs: {}", partition.root_partition().device.display());
    match partition.other_root_partition() {
        Some(other) => log::info!("Other rootfs: {}", other.device.display()),
        None => log::info!("Single rootfs system"),
    }

    Ok(partition)
}

fn bootloader(partition: &Partition) -> color_eyre::Result<Bootloader> {
    partition
        .bootloader()
        .wrap_err("Unable to detect the bootloader")
        .with_warning(|| "Only u-boot and grub installations are supported")
}

fn status(partition: &Partition, json: bool) -> color_eyre::Result<()> {
    let loader = bootloader(partition)?;
    let status = Status {
        bootloader: loader.name(),
        current: loader.get_rootfs_name(),
        other: loader.get_other_rootfs_name(),
        next: loader.get_next_boot_rootfs_name()?,
        mode: loader.common().vars().mode()?.to_string(),
        next_boot_is_other: partition.next_boot_is_other(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("bootloader: {}", status.bootloader);
        println!("current rootfs: {}", status.current);
        println!("other rootfs: {}", status.other.unwrap_or("none"));
        println!("next boot rootfs: {}", status.next.as_deref().unwrap_or("unset"));
        println!("boot mode: {}", status.mode);
        println!("next boot is other: {}", status.next_boot_is_other);
    }

    Ok(())
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let res = Cli::parse();
    let config = Configuration::with_root(res.path.unwrap_or("/".into()));

    log::trace!("Using configuration: {config:?}");
    log::debug!("Inspecting root: {}", config.root.display());

    if let Commands::CacheLsblk = res.command {
        let path = cache_lsblk(&config, &builder::new()).wrap_err("Unable to cache block devices")?;
        log::debug!("Block device table saved to {}", path.display());
        return Ok(());
    }

    let partition = inspect_root(config, res.cached)?;

    match res.command {
        Commands::Booted => partition.mark_boot_successful()?,
        Commands::Status { json } => status(&partition, json)?,
        Commands::Toggle => bootloader(&partition)?
            .toggle_rootfs()
            .with_note(|| "Toggling requires both root filesystem slots")?,
        Commands::SyncBootFiles => partition.sync_bootloader_files()?,
        Commands::UpdateBootloader => partition.update_bootloader()?,
        Commands::Vars => {
            for line in bootloader(&partition)?.get_all_boot_vars()? {
                println!("{line}");
            }
        }
        Commands::GetVar { name } => match bootloader(&partition)?.get_boot_var(&name)? {
            Some(value) => println!("{value}"),
            None => return Err(eyre!("Boot variable `{name}` is not set")),
        },
        Commands::SetVar { name, value } => bootloader(&partition)?.set_boot_var(&name, &value)?,
        Commands::ClearVar { name } => {
            if let Some(value) = bootloader(&partition)?.clear_boot_var(&name)? {
                println!("{value}");
            }
        }
        Commands::CacheLsblk => unreachable!("handled before inspecting the root"),
    }

    Ok(())
}
