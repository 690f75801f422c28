//! Filesystem helpers for staging fetched packages

use std::io::Read;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::Result;

/// Unpack a tar archive, gzip-compressed or not, into `dest`
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<()> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    std::fs::create_dir_all(dest)?;
    if is_gzip(data) {
        unpack(Archive::new(GzDecoder::new(std::io::Cursor::new(data))), dest)
    } else {
        unpack(Archive::new(std::io::Cursor::new(data)), dest)
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

/// Copy the tree under `src` into `dest`, skipping `.git`
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<()> {
    let link = std::fs::read_link(src)?;
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> Result<()> {
    std::fs::copy(src, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_plain_and_gzip() {
        let data = archive(&[("Kptfile", "kind: Kptfile\n"), ("app/cm.yaml", "kind: ConfigMap\n")]);

        let temp = TempDir::new().unwrap();
        extract_archive(&data, &temp.path().join("plain")).unwrap();
        assert!(temp.path().join("plain/app/cm.yaml").is_file());

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &data).unwrap();
        let gz = encoder.finish().unwrap();
        extract_archive(&gz, &temp.path().join("gz")).unwrap();
        assert_eq!(
            std::fs::read_to_string(temp.path().join("gz/Kptfile")).unwrap(),
            "kind: Kptfile\n"
        );
    }

    #[test]
    fn test_copy_dir_skips_git() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join(".git")).unwrap();
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(src.join("sub/a.yaml"), "a: 1\n").unwrap();

        let dest = temp.path().join("dest");
        copy_dir(&src, &dest).unwrap();
        assert!(dest.join("sub/a.yaml").is_file());
        assert!(!dest.join(".git").exists());
    }
}
