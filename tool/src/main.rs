use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pretty_hex::pretty_hex;
use util::SECTOR_SIZE;

use crate::workbench::{Workbench, DD0};

pub mod diskcopy;
pub mod transfer;
pub mod workbench;

#[derive(Parser, Debug)]
#[command(author, about = "Diskette image tools over the floppy driver", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a file on a diskette image in the transfer format
    Write {
        /// Path to the 720K diskette image (created blank if missing)
        image: PathBuf,
        /// The file to store
        file: PathBuf,
    },
    /// Extract the file stored on a diskette image
    Read {
        /// Path to the 720K diskette image
        image: PathBuf,
        /// Where to put the contents (defaults to the stored name)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Copy a diskette image sector by sector through the driver
    Diskcopy {
        source: PathBuf,
        target: PathBuf,
    },
    /// Hex-dump one sector of a diskette image
    Dump {
        image: PathBuf,
        /// Byte offset of the sector, must be 512-aligned
        #[arg(short, long, default_value_t = 0)]
        offset: u64,
    },
}

fn dump(image: &std::path::Path, offset: u64) -> Result<()> {
    let bytes = std::fs::read(image)?;
    let mut bench = Workbench::new(Some(&bytes), None);
    let sector = bench.read(DD0, offset, SECTOR_SIZE as u32)?;
    println!("{}", pretty_hex(&sector));
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.command {
        Command::Write { image, file } => transfer::write(image, file),
        Command::Read { image, out } => transfer::read(image, out.as_deref()),
        Command::Diskcopy { source, target } => diskcopy::run(source, target),
        Command::Dump { image, offset } => dump(image, *offset),
    }
}
