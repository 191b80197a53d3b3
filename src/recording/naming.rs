//! Output file naming: one folder per day, numbered files per cartridge.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use super::RecordingError;

const CARTRIDGE_PLACEHOLDER: &str = "{cartridge_number}";
const INDEX_PLACEHOLDER: &str = "{i}";

/// `<base>/<YYYY-MM-DD>`, created if missing.
pub fn dated_folder(base: &Path, date: NaiveDate) -> Result<PathBuf, RecordingError> {
    let folder = base.join(date.format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&folder)?;
    Ok(folder)
}

/// Expands `template` with the cartridge number and the first index `i`
/// (from 0) whose file does not exist yet in `folder`.
///
/// The template must contain `{i}`, otherwise every recording would map to
/// the same file.
pub fn next_free_path(folder: &Path, template: &str, cartridge_number: &str) -> Result<PathBuf, RecordingError> {
    if !template.contains(INDEX_PLACEHOLDER) {
        return Err(RecordingError::InvalidTemplate(format!(
            "{template:?} has no {INDEX_PLACEHOLDER} placeholder"
        )));
    }
    let base = template.replace(CARTRIDGE_PLACEHOLDER, cartridge_number);
    let mut i = 0u32;
    loop {
        let candidate = folder.join(base.replace(INDEX_PLACEHOLDER, &i.to_string()));
        if !candidate.exists() {
            return Ok(candidate);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dated_folder_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let folder = dated_folder(dir.path(), date).unwrap();
        assert!(folder.ends_with("2024-03-07"));
        assert!(folder.is_dir());
    }

    #[test]
    fn test_index_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let template = "cartridge_{cartridge_number}_{i}.fsrec";
        let first = next_free_path(dir.path(), template, "42").unwrap();
        assert!(first.ends_with("cartridge_42_0.fsrec"));

        std::fs::write(&first, b"").unwrap();
        std::fs::write(dir.path().join("cartridge_42_1.fsrec"), b"").unwrap();
        let next = next_free_path(dir.path(), template, "42").unwrap();
        assert!(next.ends_with("cartridge_42_2.fsrec"));
    }

    #[test]
    fn test_template_without_index_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            next_free_path(dir.path(), "movie.fsrec", "1"),
            Err(RecordingError::InvalidTemplate(_))
        ));
    }
}
