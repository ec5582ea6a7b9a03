//! Copy a diskette image sector by sector through the driver, letting
//! the track cache and deferred flush do the heavy lifting, and report
//! the digests of both sides of the copy.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use util::{NR_SECTORS, SECTOR_SIZE};

use crate::workbench::{Workbench, DD0, DD1, DISK_BYTES};

/// One track's worth of bytes per request keeps every copy step inside a
/// single capture.
const TRACK_BYTES: usize = NR_SECTORS * SECTOR_SIZE;

pub fn run(source: &Path, target: &Path) -> Result<()> {
    let src_image = fs::read(source)
        .with_context(|| format!("reading {}", source.display()))?;

    let mut bench = Workbench::new(Some(&src_image), Some(&vec![0u8; DISK_BYTES]));

    for offset in (0..DISK_BYTES).step_by(TRACK_BYTES) {
        let data = bench.read(DD0, offset as u64, TRACK_BYTES as u32)?;
        bench.write(DD1, offset as u64, &data)?;
    }

    let out = bench.export(1)?;
    fs::write(target, &out)
        .with_context(|| format!("writing {}", target.display()))?;

    // The source digest is taken over the padded image so a short input
    // compares equal to its own copy.
    let mut padded = src_image;
    padded.resize(DISK_BYTES, 0);
    println!("source md5: {:x}", md5::compute(&padded));
    println!("target md5: {:x}", md5::compute(&out));
    println!("Disk copied.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("amfloppytool-copy-{tag}-{}", std::process::id()));
        p
    }

    #[test]
    fn copy_preserves_every_sector() {
        let image: Vec<u8> = (0..DISK_BYTES).map(|i| (i / SECTOR_SIZE) as u8).collect();
        let source = temp_path("src");
        let target = temp_path("dst");
        fs::write(&source, &image).unwrap();

        run(&source, &target).unwrap();

        let copied = fs::read(&target).unwrap();
        assert_eq!(copied, image);
        assert_eq!(md5::compute(&copied), md5::compute(&image));

        fs::remove_file(&source).unwrap();
        fs::remove_file(&target).unwrap();
    }
}
