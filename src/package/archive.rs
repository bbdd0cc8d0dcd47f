// Copyright 2025 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Component, Path, PathBuf};

use crate::errors::Error;

/// Extracts a gzip-compressed tarball into `dest`, stripping the
/// archive's single top-level directory (registry tarballs wrap their
/// contents in `package/`, github archives in `<repo>-<commit>/`).
///
/// File permissions are carried over from the archive. Entries that
/// would escape `dest` are skipped.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), Error> {
    let file = std::fs::File::open(archive)
        .map_err(|err| Error::filesystem(format!("failed to open {}", archive.display()), err))?;

    let gz = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);
    tar.set_preserve_permissions(true);

    let extraction_error = |reason: String| Error::Extraction {
        archive: archive.display().to_string(),
        reason,
    };

    std::fs::create_dir_all(dest)
        .map_err(|err| Error::filesystem(format!("failed to create {}", dest.display()), err))?;

    let entries = tar
        .entries()
        .map_err(|err| extraction_error(format!("corrupted archive: {err}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|err| extraction_error(format!("corrupted entry: {err}")))?;

        let path = entry
            .path()
            .map_err(|err| extraction_error(format!("entry has invalid path: {err}")))?
            .into_owned();

        let Some(stripped) = strip_first_component(&path) else {
            // The top-level directory itself.
            continue;
        };

        let target = dest.join(&stripped);

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::filesystem(format!("failed to create {}", parent.display()), err)
            })?;
        }

        entry
            .unpack(&target)
            .map_err(|err| extraction_error(format!("failed to unpack {}: {err}", stripped.display())))?;
    }

    Ok(())
}

/// Drops the first path component; normal components only, so absolute
/// or parent-escaping entries are rejected.
fn strip_first_component(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;

    let rest: PathBuf = components.as_path().into();
    if rest.as_os_str().is_empty() {
        return None;
    }

    let sane = rest
        .components()
        .all(|component| matches!(component, Component::Normal(_)));

    sane.then_some(rest)
}

/// Builds a `.tgz` with a `package/` top-level directory, the way the
/// registry serves them. Test fixture shared across the crate.
#[cfg(test)]
pub(crate) fn fixture_tarball(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write as _;

    let mut archive = tar::Builder::new(Vec::new());

    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive
            .append_data(&mut header, format!("package/{name}"), contents.as_bytes())
            .unwrap();
    }

    let tar = archive.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}
