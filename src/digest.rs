use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Digest over a set of files rooted at `base`.
///
/// Each file contributes its path relative to `base` followed by its content,
/// in the order given, so the same file set always yields the same digest.
pub fn digest_files<P: AsRef<Path>>(base: &Path, files: &[P]) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let file = file.as_ref();
        let relative = file.strip_prefix(base).unwrap_or(file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        feed_file(&mut hasher, file)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn feed_file(hasher: &mut Sha256, path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn digest_files_depends_on_names_and_content() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a.json");
        let b = temp.path().join("b.json");
        std::fs::write(&a, b"[]").unwrap();
        std::fs::write(&b, b"[]").unwrap();

        let only_a = digest_files(temp.path(), &[&a]).unwrap();
        let only_b = digest_files(temp.path(), &[&b]).unwrap();
        assert_ne!(only_a, only_b);

        std::fs::write(&a, b"[{}]").unwrap();
        assert_ne!(digest_files(temp.path(), &[&a]).unwrap(), only_a);
    }
}
