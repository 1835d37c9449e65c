use crate::error::{Result, TriggerError};
use crate::types::AcceptedEvent;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const TIME_TAG: &str = "time.bin";
pub const DATA_TAG: &str = "data.bin";
pub const LOG_TAG: &str = "log.txt";

/// Best-effort, append-only sink for accepted events.
pub trait Recorder: Send {
    fn append(&mut self, tag: &str, bytes: &[u8]) -> Result<()>;

    /// Bytes stored under a tag so far. A tag never written is empty.
    fn len(&self, tag: &str) -> Result<u64>;

    /// Cut a tag back to `len` bytes.
    fn truncate(&mut self, tag: &str, len: u64) -> Result<()>;

    /// Truncate a tag to empty.
    fn clear(&mut self, tag: &str) -> Result<()> {
        self.truncate(tag, 0)
    }
}

/// Files under `<location>/R<run>/R<run>_A<host>_<tag>`.
#[derive(Debug, Clone)]
pub struct FileRecorder {
    dir: PathBuf,
    prefix: String,
}

impl FileRecorder {
    /// Create the run directory and start every tag empty.
    pub fn create<P: AsRef<Path>>(location: P, run_id: u32, host: u32) -> Result<Self> {
        let run = format!("R{:06}", run_id);
        let dir = location.as_ref().join(&run);
        std::fs::create_dir_all(&dir).map_err(|e| {
            TriggerError::RecorderWrite(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let mut recorder = Self {
            dir,
            prefix: format!("{}_A{:04}_", run, host),
        };
        for tag in [DATA_TAG, TIME_TAG, LOG_TAG] {
            recorder.clear(tag)?;
        }

        log::info!("Recording to {}/{}*", recorder.dir.display(), recorder.prefix);
        Ok(recorder)
    }

    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, tag))
    }
}

impl Recorder for FileRecorder {
    fn append(&mut self, tag: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(tag);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TriggerError::RecorderWrite(format!("{}: {}", path.display(), e)))?;
        file.write_all(bytes)
            .map_err(|e| TriggerError::RecorderWrite(format!("{}: {}", path.display(), e)))
    }

    fn len(&self, tag: &str) -> Result<u64> {
        let path = self.path_for(tag);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(TriggerError::RecorderWrite(format!("{}: {}", path.display(), e))),
        }
    }

    fn truncate(&mut self, tag: &str, len: u64) -> Result<()> {
        let path = self.path_for(tag);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(len == 0)
            .open(&path)
            .and_then(|file| file.set_len(len))
            .map_err(|e| TriggerError::RecorderWrite(format!("{}: {}", path.display(), e)))
    }
}

/// Keeps every tag in memory; clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    tags: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, tag: &str) -> Vec<u8> {
        self.tags
            .lock()
            .map(|tags| tags.get(tag).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Recorder for MemoryRecorder {
    fn append(&mut self, tag: &str, bytes: &[u8]) -> Result<()> {
        let mut tags = self
            .tags
            .lock()
            .map_err(|_| TriggerError::RecorderWrite("recorder store poisoned".into()))?;
        tags.entry(tag.to_string()).or_default().extend_from_slice(bytes);
        Ok(())
    }

    fn len(&self, tag: &str) -> Result<u64> {
        let tags = self
            .tags
            .lock()
            .map_err(|_| TriggerError::RecorderWrite("recorder store poisoned".into()))?;
        Ok(tags.get(tag).map_or(0, |bytes| bytes.len() as u64))
    }

    fn truncate(&mut self, tag: &str, len: u64) -> Result<()> {
        let mut tags = self
            .tags
            .lock()
            .map_err(|_| TriggerError::RecorderWrite("recorder store poisoned".into()))?;
        tags.entry(tag.to_string()).or_default().truncate(len as usize);
        Ok(())
    }
}

/// Four little-endian i32 per event, see [`AcceptedEvent::time_record`].
pub fn encode_time_records(events: &[AcceptedEvent], sub_window: usize) -> Vec<u8> {
    events
        .iter()
        .flat_map(|e| e.time_record(sub_window))
        .flat_map(i32::to_le_bytes)
        .collect()
}

/// Append to a data tag and its index tag as one unit: data first, index after.
///
/// If either append fails both tags are cut back to their previous length,
/// so index record `i` keeps pairing with data entry `i`.
pub fn append_paired(
    recorder: &mut dyn Recorder,
    (data_tag, data): (&str, &[u8]),
    (index_tag, index): (&str, &[u8]),
) -> Result<()> {
    let data_len = recorder.len(data_tag)?;
    let index_len = recorder.len(index_tag)?;
    let written = recorder
        .append(data_tag, data)
        .and_then(|()| recorder.append(index_tag, index));

    if let Err(e) = written {
        for (tag, len) in [(data_tag, data_len), (index_tag, index_len)] {
            if let Err(undo) = recorder.truncate(tag, len) {
                log::error!("Cannot roll {} back to {} bytes: {}", tag, len, undo);
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Append one round's accepted events: waveforms to `data.bin`, then their
/// time records to `time.bin`.
pub fn record_events(
    recorder: &mut dyn Recorder,
    events: &[AcceptedEvent],
    sub_window: usize,
) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let waveforms: Vec<u8> = events.iter().flat_map(|e| e.waveform.iter().copied()).collect();
    let times = encode_time_records(events, sub_window);
    append_paired(recorder, (DATA_TAG, waveforms.as_slice()), (TIME_TAG, times.as_slice()))
}

/// Decode a `time.bin` stream back into records.
pub fn decode_time_records(bytes: &[u8]) -> Vec<[i32; 4]> {
    bytes
        .chunks_exact(16)
        .map(|record| {
            let mut fields = [0i32; 4];
            for (field, raw) in fields.iter_mut().zip(record.chunks_exact(4)) {
                *field = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            fields
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(offset: u64, fill: u8) -> AcceptedEvent {
        AcceptedEvent {
            wall_time: Utc.timestamp_opt(1_262_304_000, 0).unwrap(),
            epoch: 12,
            buffer_offset: offset,
            waveform: vec![fill; 4],
        }
    }

    #[test]
    fn test_file_layout_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = FileRecorder::create(dir.path(), 42, 183).unwrap();
        let data = dir.path().join("R000042").join("R000042_A0183_data.bin");
        assert_eq!(recorder.path_for(DATA_TAG), data);
        assert!(data.exists());

        recorder.append(DATA_TAG, &[1, 2]).unwrap();
        recorder.append(DATA_TAG, &[3]).unwrap();
        assert_eq!(std::fs::read(&data).unwrap(), vec![1, 2, 3]);

        // A new run with the same id starts empty
        let _again = FileRecorder::create(dir.path(), 42, 183).unwrap();
        assert!(std::fs::read(&data).unwrap().is_empty());
    }

    #[test]
    fn test_record_events_encoding() {
        let mut recorder = MemoryRecorder::new();
        let events = vec![event(1024 + 5, 7), event(3, 9)];
        let mut sink = recorder.clone();
        record_events(&mut sink, &events, 1024).unwrap();

        let times = decode_time_records(&recorder.contents(TIME_TAG));
        assert_eq!(times, vec![[1_262_304_000, 12, 1, 5], [1_262_304_000, 12, 0, 3]]);
        assert_eq!(recorder.contents(DATA_TAG), vec![7, 7, 7, 7, 9, 9, 9, 9]);

        recorder.clear(DATA_TAG).unwrap();
        assert!(recorder.contents(DATA_TAG).is_empty());
    }

    /// Fails every append to one tag while `failing` is set.
    struct FailingRecorder {
        inner: MemoryRecorder,
        tag: &'static str,
        failing: bool,
    }

    impl Recorder for FailingRecorder {
        fn append(&mut self, tag: &str, bytes: &[u8]) -> Result<()> {
            if self.failing && tag == self.tag {
                return Err(TriggerError::RecorderWrite(format!("{}: disk full", tag)));
            }
            self.inner.append(tag, bytes)
        }

        fn len(&self, tag: &str) -> Result<u64> {
            self.inner.len(tag)
        }

        fn truncate(&mut self, tag: &str, len: u64) -> Result<()> {
            self.inner.truncate(tag, len)
        }
    }

    #[test]
    fn test_failed_waveform_write_leaves_no_time_records() {
        let store = MemoryRecorder::new();
        let mut recorder = FailingRecorder {
            inner: store.clone(),
            tag: DATA_TAG,
            failing: true,
        };

        let result = record_events(&mut recorder, &[event(5, 7)], 1024);
        assert!(matches!(result, Err(TriggerError::RecorderWrite(_))));
        assert!(store.contents(TIME_TAG).is_empty());
        assert!(store.contents(DATA_TAG).is_empty());
    }

    #[test]
    fn test_failed_time_write_rolls_back_waveforms() {
        let store = MemoryRecorder::new();
        let mut recorder = FailingRecorder {
            inner: store.clone(),
            tag: TIME_TAG,
            failing: false,
        };
        record_events(&mut recorder, &[event(5, 7)], 1024).unwrap();

        recorder.failing = true;
        assert!(record_events(&mut recorder, &[event(6, 8), event(9, 9)], 1024).is_err());
        assert_eq!(store.contents(DATA_TAG), vec![7, 7, 7, 7]);
        assert_eq!(decode_time_records(&store.contents(TIME_TAG)).len(), 1);

        // The next round lines up with the surviving one
        recorder.failing = false;
        record_events(&mut recorder, &[event(3, 1)], 1024).unwrap();
        assert_eq!(store.contents(DATA_TAG), vec![7, 7, 7, 7, 1, 1, 1, 1]);
        assert_eq!(decode_time_records(&store.contents(TIME_TAG))[1], [1_262_304_000, 12, 0, 3]);
    }

    #[test]
    fn test_file_truncate_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = FileRecorder::create(dir.path(), 3, 101).unwrap();
        recorder.append(DATA_TAG, &[1, 2, 3, 4]).unwrap();
        assert_eq!(recorder.len(DATA_TAG).unwrap(), 4);
        recorder.truncate(DATA_TAG, 2).unwrap();
        assert_eq!(std::fs::read(recorder.path_for(DATA_TAG)).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_no_events_writes_nothing() {
        let recorder = MemoryRecorder::new();
        let mut sink = recorder.clone();
        record_events(&mut sink, &[], 1024).unwrap();
        assert!(recorder.contents(TIME_TAG).is_empty());
    }

    #[test]
    fn test_unwritable_location_is_recorder_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot hold the run directory
        assert!(matches!(
            FileRecorder::create(file.path(), 1, 101),
            Err(TriggerError::RecorderWrite(_))
        ));
    }
}
