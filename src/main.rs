#![allow(dead_code)]

mod bitmap;
mod block_device;
mod ext2;
mod partition;
mod util;

use anyhow::{bail, Result};
use clap::{App, Arg, ArgMatches};
use log::info;

use crate::ext2::{Ext2Fs, FormatOptions, VOLUME_NAME_LEN};
use crate::partition::Partition;

fn main() {
    let matches = App::new("ext2m-rs")
        .about("Formats a partition or image file as ext2, or verifies an existing ext2 filesystem")
        .arg(
            Arg::with_name("PARTITION")
                .help("Path to the partition or image file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("force")
                .long("force")
                .short("f")
                .help("Format even if the partition already holds a valid filesystem"),
        )
        .arg(
            Arg::with_name("label")
                .long("label")
                .short("L")
                .takes_value(true)
                .value_name("NAME")
                .help("Volume name of a newly formatted filesystem (at most 16 bytes)"),
        )
        .arg(Arg::with_name("verbose").long("verbose").short("v").help("Print debug output"))
        .get_matches();

    env_logger::Builder::new()
        .filter_level(if matches.is_present("verbose") {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .parse_default_env()
        .init();

    if let Err(reason) = run(&matches) {
        eprintln!("Error: {:#}", reason);
        std::process::exit(1);
    }
}

fn format_options(matches: &ArgMatches) -> Result<FormatOptions> {
    let volume_name = matches.value_of("label").unwrap_or_default().as_bytes().to_vec();
    if volume_name.len() > VOLUME_NAME_LEN {
        bail!("Volume name must be at most {} bytes long", VOLUME_NAME_LEN);
    }
    Ok(FormatOptions { volume_name, force: matches.is_present("force") })
}

fn run(matches: &ArgMatches) -> Result<()> {
    let options = format_options(matches)?;
    // required argument
    let partition_path = matches.value_of("PARTITION").unwrap_or_default();
    let partition = Partition::open(partition_path)?;
    info!("Opened {} ({} bytes)", partition_path, partition.len());

    let mut fs = Ext2Fs::open(partition, &options)?;
    println!("{}", fs.geometry());
    println!(
        "free blocks:         {} of {}",
        fs.superblock().s_free_blocks_count,
        fs.superblock().s_blocks_count
    );
    println!(
        "free inodes:         {} of {}",
        fs.superblock().s_free_inodes_count,
        fs.superblock().s_inodes_count
    );
    fs.sync()
}
