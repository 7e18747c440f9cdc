use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    metrics::{BatchProgress, EpochSummary, Phase},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub log_every_n_batches: usize,
    pub tensorboard_dir: Option<PathBuf>,
}

impl LoggingSettings {
    pub fn from_config(
        enable_stdout: bool,
        log_every_n_batches: usize,
        tensorboard_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            enable_stdout,
            log_every_n_batches: log_every_n_batches.max(1),
            tensorboard_dir,
        }
    }
}

/// Metric sink for batch progress lines and per-epoch scalars.
pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let events = match settings.tensorboard_dir.as_deref() {
            Some(dir) => Some(EventFile::create(dir)?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    /// Whether batch `batch_index` (0-based) of `num_batches` gets a line.
    /// The last batch is always reported.
    pub fn should_log_batch(&self, batch_index: usize, num_batches: usize) -> bool {
        let ordinal = batch_index + 1;
        ordinal == num_batches || ordinal % self.settings.log_every_n_batches == 0
    }

    pub fn log_batch(&mut self, progress: &BatchProgress, num_batches: usize) {
        if self.settings.enable_stdout && self.should_log_batch(progress.batch_index, num_batches)
        {
            println!("{progress}");
        }
    }

    pub fn log_epoch_start(&mut self, epoch: usize, lr: f64) -> Result<(), TrainingError> {
        if self.settings.enable_stdout {
            println!("\nEpoch: {epoch} (lr={lr:.5e})");
        }
        match self.events.as_mut() {
            Some(events) => events.write_scalars(epoch, &[("learning_rate", lr)]),
            None => Ok(()),
        }
    }

    pub fn log_epoch(&mut self, summary: &EpochSummary) -> Result<(), TrainingError> {
        if self.settings.enable_stdout {
            println!(
                "{} epoch={} loss={:.4} acc={:.3}% ({}/{}) images/s={:.1}",
                summary.phase,
                summary.epoch,
                summary.average_loss,
                summary.accuracy,
                summary.correct,
                summary.total,
                summary.images_per_sec()
            );
        }
        let Some(events) = self.events.as_mut() else {
            return Ok(());
        };
        let (loss, accuracy) = match summary.phase {
            Phase::Train => ("train/loss", "train/accuracy"),
            Phase::Test => ("test/loss", "test/accuracy"),
        };
        events.write_scalars(
            summary.epoch,
            &[(loss, summary.average_loss), (accuracy, summary.accuracy)],
        )
    }

    pub fn tensorboard_path(&self) -> Option<&Path> {
        self.events.as_ref().map(|events| events.path.as_path())
    }
}

/// Append-only TensorBoard event file; every record is flushed on write.
struct EventFile {
    path: PathBuf,
    file: File,
}

impl EventFile {
    fn create(dir: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let path = dir.join(format!("events.out.tfevents.{}.{host}", unix_now() as u64));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut events = Self { path, file };
        events.append(&Event {
            wall_time: unix_now(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(events)
    }

    fn write_scalars(&mut self, epoch: usize, scalars: &[(&str, f64)]) -> Result<(), TrainingError> {
        let value = scalars
            .iter()
            .map(|(tag, value)| ScalarValue {
                tag: tag.to_string(),
                simple_value: Some(*value as f32),
            })
            .collect();
        self.append(&Event {
            wall_time: unix_now(),
            step: epoch as i64,
            file_version: None,
            summary: Some(Summary { value }),
        })
    }

    fn append(&mut self, event: &Event) -> Result<(), TrainingError> {
        let record = frame_record(&event.encode_to_vec());
        self.file
            .write_all(&record)
            .and_then(|_| self.file.flush())
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to write tensorboard event to {}: {err}",
                    self.path.display()
                ))
            })
    }
}

/// TFRecord framing: length, masked CRC of the length, payload, masked CRC
/// of the payload. All little endian.
fn frame_record(payload: &[u8]) -> BytesMut {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<ScalarValue>,
}

#[derive(Clone, PartialEq, Message)]
struct ScalarValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn quiet(every: usize, dir: Option<PathBuf>) -> Logger {
        Logger::new(LoggingSettings::from_config(false, every, dir)).unwrap()
    }

    fn read_events(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut offset = 0;
        let mut events = Vec::new();
        while offset < bytes.len() {
            let len_bytes = &bytes[offset..offset + 8];
            let len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(len_bytes));
            let payload = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(payload));
            events.push(Event::decode(payload).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn batch_cadence_always_includes_last_batch() {
        let logger = quiet(3, None);
        let logged: Vec<usize> = (0..7).filter(|&k| logger.should_log_batch(k, 7)).collect();
        assert_eq!(logged, vec![2, 5, 6]);

        let every = quiet(0, None);
        assert!((0..4).all(|k| every.should_log_batch(k, 4)));
    }

    #[test]
    fn event_file_holds_version_then_epoch_scalars() {
        let dir = tempdir().unwrap();
        let mut logger = quiet(1, Some(dir.path().join("tb")));
        logger.log_epoch_start(2, 0.1).unwrap();
        logger
            .log_epoch(&EpochSummary {
                phase: Phase::Test,
                epoch: 2,
                average_loss: 1.5,
                accuracy: 40.0,
                correct: 4,
                total: 10,
                batches: 1,
                wall_time: Duration::from_millis(5),
            })
            .unwrap();

        let events = read_events(logger.tensorboard_path().unwrap());
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].file_version.as_deref(), Some("brain.Event:2"));

        let tags: Vec<(i64, String)> = events[1..]
            .iter()
            .flat_map(|event| {
                let step = event.step;
                event
                    .summary
                    .iter()
                    .flat_map(move |summary| summary.value.iter().map(move |v| (step, v.tag.clone())))
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                (2, "learning_rate".to_string()),
                (2, "test/loss".to_string()),
                (2, "test/accuracy".to_string()),
            ]
        );
        assert_eq!(events[2].summary.as_ref().unwrap().value[1].simple_value, Some(40.0));
    }
}
