//! Store a single file on a diskette in the bare transfer format:
//! block 0 carries the big-endian size and a NUL-terminated name, the
//! blocks from 1 up carry the contents back to back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use util::SECTOR_SIZE;

use crate::workbench::{Workbench, DD0, DISK_BYTES};

/// Block 0 layout: a 4-byte size, then the name.
const NAME_OFFSET: usize = 4;
const NAME_MAX: usize = 27;

pub fn write(image_path: &Path, file_path: &Path) -> Result<()> {
    let data = fs::read(file_path)
        .with_context(|| format!("reading {}", file_path.display()))?;
    ensure!(
        data.len() <= DISK_BYTES - SECTOR_SIZE,
        "{} does not fit on a diskette",
        file_path.display()
    );
    let name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("file name is not printable")?;
    ensure!(name.len() <= NAME_MAX, "file name longer than {NAME_MAX} bytes");

    // A missing image starts out as a blank diskette.
    let image = match fs::read(image_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![0u8; DISK_BYTES],
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", image_path.display()))
        }
    };
    let mut bench = Workbench::new(Some(&image), None);

    println!("writing: {name}");
    for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
        let mut block = [0u8; SECTOR_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        bench.write(DD0, ((i + 1) * SECTOR_SIZE) as u64, &block)?;
    }

    let mut block0 = [0u8; SECTOR_SIZE];
    BigEndian::write_u32(&mut block0[..NAME_OFFSET], data.len() as u32);
    block0[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
    bench.write(DD0, 0, &block0)?;

    let out = bench.export(0)?;
    fs::write(image_path, out)
        .with_context(|| format!("updating {}", image_path.display()))?;
    println!("(size = {})", data.len());
    Ok(())
}

pub fn read(image_path: &Path, out: Option<&Path>) -> Result<()> {
    let image = fs::read(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?;
    let mut bench = Workbench::new(Some(&image), None);

    let block0 = bench.read(DD0, 0, SECTOR_SIZE as u32)?;
    let size = BigEndian::read_u32(&block0[..NAME_OFFSET]) as usize;
    ensure!(
        size <= DISK_BYTES - SECTOR_SIZE,
        "diskette does not carry a transfer file"
    );
    let name_bytes: Vec<u8> = block0[NAME_OFFSET..]
        .iter()
        .copied()
        .take_while(|&b| b != 0)
        .collect();
    let name = String::from_utf8(name_bytes).context("stored name is not UTF-8")?;
    ensure!(!name.is_empty(), "diskette does not carry a transfer file");

    println!("reading file: {name} (size={size})");
    let mut data = Vec::with_capacity(size);
    let mut block = 1;
    while data.len() < size {
        let chunk = bench.read(DD0, (block * SECTOR_SIZE) as u64, SECTOR_SIZE as u32)?;
        let wanted = (size - data.len()).min(SECTOR_SIZE);
        data.extend_from_slice(&chunk[..wanted]);
        block += 1;
    }

    let out_path: PathBuf = out.map_or_else(|| PathBuf::from(&name), Path::to_path_buf);
    fs::write(&out_path, &data)
        .with_context(|| format!("writing {}", out_path.display()))?;
    println!("ok.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // Stored names are capped at NAME_MAX bytes, so keep these short.
    fn temp_path(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("amft-{tag}-{}", std::process::id()));
        p
    }

    fn blank_image_file(tag: &str) -> PathBuf {
        let p = temp_path(&format!("img-{tag}"));
        fs::write(&p, vec![0u8; DISK_BYTES]).unwrap();
        p
    }

    #[rstest]
    #[case::empty(0)]
    #[case::partial_block(100)]
    #[case::exact_block(512)]
    #[case::several_blocks(5000)]
    fn round_trip(#[case] size: usize) {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
        let image = blank_image_file(&format!("rt{size}"));
        let input = temp_path(&format!("in{size}.bin"));
        let output = temp_path(&format!("out{size}.bin"));
        fs::write(&input, &payload).unwrap();

        write(&image, &input).unwrap();
        read(&image, Some(&output)).unwrap();

        assert_eq!(fs::read(&output).unwrap(), payload);

        fs::remove_file(&image).unwrap();
        fs::remove_file(&input).unwrap();
        fs::remove_file(&output).unwrap();
    }

    #[test]
    fn reading_a_blank_diskette_is_refused() {
        let image = blank_image_file("blank");
        let err = read(&image, Some(&temp_path("none"))).unwrap_err();
        assert!(err.to_string().contains("transfer file"));
        fs::remove_file(&image).unwrap();
    }
}
