//! Fetch-once cache for the CIFAR-10 binary archive.

use std::{
    fs::{self, File},
    path::Path,
    time::Duration,
};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::info;

use super::{cifar::CifarSplit, Result, CIFAR_DIR};
use crate::TrainingError;

pub const CIFAR_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
pub const CIFAR_ARCHIVE: &str = "cifar-10-binary.tar.gz";

/// How the batches ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetSource {
    Cached,
    Unpacked,
    Downloaded,
}

/// True when every train and test batch exists under `data_dir`.
pub fn cifar_batches_present(data_dir: &Path) -> bool {
    let root = data_dir.join(CIFAR_DIR);
    [CifarSplit::Train, CifarSplit::Test]
        .into_iter()
        .flat_map(CifarSplit::files)
        .all(|file| root.join(file).is_file())
}

pub fn ensure_cifar10(data_dir: &Path) -> Result<DatasetSource> {
    ensure_cifar10_from(data_dir, CIFAR_URL)
}

/// Makes the batches available under `data_dir`, unpacking an archive left
/// in `data_dir` or fetching it from `url` first.
pub fn ensure_cifar10_from(data_dir: &Path, url: &str) -> Result<DatasetSource> {
    if cifar_batches_present(data_dir) {
        return Ok(DatasetSource::Cached);
    }
    fs::create_dir_all(data_dir).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to create data directory {}: {err}",
            data_dir.display()
        ))
    })?;

    let archive = data_dir.join(CIFAR_ARCHIVE);
    let source = if archive.is_file() {
        DatasetSource::Unpacked
    } else {
        info!(url, dest = %archive.display(), "downloading CIFAR-10");
        fetch_archive(url, &archive)?;
        DatasetSource::Downloaded
    };
    unpack_archive(&archive, data_dir)?;
    info!(dir = %data_dir.join(CIFAR_DIR).display(), "CIFAR-10 batches ready");
    Ok(source)
}

fn fetch_archive(url: &str, dest: &Path) -> Result<()> {
    let failed = |err: String| {
        TrainingError::initialization(format!("failed to download {url}: {err}"))
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(None::<Duration>)
        .build()
        .map_err(|err| failed(err.to_string()))?;
    let mut response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|err| failed(err.to_string()))?;

    let staging = dest.with_extension("gz.part");
    let written = File::create(&staging)
        .map_err(|err| failed(err.to_string()))
        .and_then(|mut file| {
            response
                .copy_to(&mut file)
                .map_err(|err| failed(err.to_string()))
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    fs::rename(&staging, dest).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to move {} into place: {err}",
            dest.display()
        ))
    })
}

/// Extracts a `.tar.gz` archive into `data_dir` and checks the batches landed.
pub fn unpack_archive(archive: &Path, data_dir: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|err| {
        TrainingError::initialization(format!("failed to open {}: {err}", archive.display()))
    })?;
    Archive::new(GzDecoder::new(file))
        .unpack(data_dir)
        .map_err(|err| {
            TrainingError::initialization(format!(
                "failed to extract {}: {err}",
                archive.display()
            ))
        })?;
    if !cifar_batches_present(data_dir) {
        return Err(TrainingError::initialization(format!(
            "{} did not contain the CIFAR-10 binary batches under {}",
            archive.display(),
            CIFAR_DIR
        )));
    }
    Ok(())
}
