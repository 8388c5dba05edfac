//! Acquisition session bookkeeping.
//!
//! A `START` command becomes an immutable [`SessionConfig`]: the validated output
//! folder and the pairing of channels to output files. While running, the readout
//! supervisor holds an [`AcquisitionSession`] around it with the start and stop
//! times that end up in the folder's attribute log.

use crate::config::OutputSettings;
use crate::error::{AppResult, DaqError};
use crate::hardware::{DeviceConfig, CHANNEL_COUNT};
use chrono::{DateTime, Local, NaiveDate};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Timestamp format used in the attribute log.
pub const ATTR_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Parse a channel list literal such as `[0, 1, 5]` or `0,1,5`.
///
/// Brackets are optional but must be balanced, whitespace is ignored and one
/// trailing comma is accepted. Range checking happens in
/// [`generate_file_names`].
///
/// # Errors
///
/// Returns [`DaqError::InvalidChannelList`] if the literal is empty or contains
/// anything but integers.
pub fn parse_channel_list(literal: &str) -> AppResult<Vec<i64>> {
    let invalid = || DaqError::InvalidChannelList(literal.to_string());
    let trimmed = literal.trim();
    let inner = match (trimmed.strip_prefix('['), trimmed.strip_suffix(']')) {
        (Some(rest), Some(_)) => rest.strip_suffix(']').ok_or_else(invalid)?,
        (None, None) => trimmed,
        _ => return Err(invalid()),
    };

    let mut items: Vec<&str> = inner.split(',').map(str::trim).collect();
    if items.len() > 1 && items.last() == Some(&"") {
        items.pop();
    }
    if items.iter().any(|s| s.is_empty()) {
        return Err(invalid());
    }
    items
        .into_iter()
        .map(|s| s.parse::<i64>().map_err(|_| invalid()))
        .collect()
}

/// Output file naming, `<head><channel:02><ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    /// Filename prefix
    pub head: String,
    /// Extension including the dot
    pub ext: String,
}

impl Default for FileNaming {
    fn default() -> Self {
        Self::from(&OutputSettings::default())
    }
}

impl From<&OutputSettings> for FileNaming {
    fn from(settings: &OutputSettings) -> Self {
        Self {
            head: settings.file_head.clone(),
            ext: settings.file_ext.clone(),
        }
    }
}

impl FileNaming {
    /// File name of `channel`.
    pub fn file_name(&self, channel: u8) -> String {
        format!("{}{:02}{}", self.head, channel, self.ext)
    }
}

/// One channel and the file its data is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFile {
    /// Device channel
    pub channel: u8,
    /// Output file path
    pub path: PathBuf,
}

/// Build the output files for `channels` under `root`.
///
/// Channels are deduplicated and sorted. The directory is created only after every
/// check has passed, so a rejected request leaves the filesystem untouched.
///
/// # Errors
///
/// - [`DaqError::ChannelOutOfRange`] for a channel outside 0..=15
/// - [`DaqError::OutputFileExists`] if a target file exists and is not empty
/// - [`DaqError::Resource`] if the directory cannot be created
pub fn generate_file_names(
    root: &Path,
    channels: &[i64],
    naming: &FileNaming,
) -> AppResult<Vec<ChannelFile>> {
    let mut unique = BTreeSet::new();
    for &channel in channels {
        match u8::try_from(channel) {
            Ok(ch) if ch < CHANNEL_COUNT => {
                unique.insert(ch);
            }
            _ => return Err(DaqError::ChannelOutOfRange(channel)),
        }
    }

    let files: Vec<ChannelFile> = unique
        .into_iter()
        .map(|channel| ChannelFile {
            channel,
            path: root.join(naming.file_name(channel)),
        })
        .collect();

    for file in &files {
        if let Ok(meta) = fs::metadata(&file.path) {
            if meta.len() != 0 {
                return Err(DaqError::OutputFileExists(file.path.clone()));
            }
        }
    }

    fs::create_dir_all(root).map_err(|e| DaqError::resource(root, e))?;
    Ok(files)
}

/// Validated parameters of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    folder: PathBuf,
    files: Vec<ChannelFile>,
}

impl SessionConfig {
    /// Validate a `START` request and prepare its output folder.
    ///
    /// # Errors
    ///
    /// See [`parse_channel_list`] and [`generate_file_names`].
    pub fn prepare(folder: impl Into<PathBuf>, channels: &str, naming: &FileNaming) -> AppResult<Self> {
        let folder = folder.into();
        let channels = parse_channel_list(channels)?;
        let files = generate_file_names(&folder, &channels, naming)?;
        Ok(Self { folder, files })
    }

    /// Output folder.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Channel to file pairing, sorted by channel.
    pub fn files(&self) -> &[ChannelFile] {
        &self.files
    }

    /// Active channels in ascending order.
    pub fn channels(&self) -> Vec<u8> {
        self.files.iter().map(|f| f.channel).collect()
    }
}

/// A running or finished acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionSession {
    config: SessionConfig,
    started_at: DateTime<Local>,
    stopped_at: Option<DateTime<Local>>,
}

impl AcquisitionSession {
    /// Begin a session now.
    pub fn begin(config: SessionConfig) -> Self {
        Self {
            config,
            started_at: Local::now(),
            stopped_at: None,
        }
    }

    /// Mark the session stopped now and return the stop time.
    pub fn finish(&mut self) -> DateTime<Local> {
        *self.stopped_at.get_or_insert_with(Local::now)
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start time.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Stop time, once stopped.
    pub fn stopped_at(&self) -> Option<DateTime<Local>> {
        self.stopped_at
    }
}

/// `key=timestamp` lines appended to the run's attribute file.
#[derive(Debug, Clone)]
pub struct AttributeLog {
    path: PathBuf,
}

impl AttributeLog {
    /// Attribute log `file_name` inside `folder`.
    pub fn new(folder: &Path, file_name: &str) -> Self {
        Self {
            path: folder.join(file_name),
        }
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `start=<time>`.
    pub fn record_start(&self, at: DateTime<Local>) -> AppResult<()> {
        self.append("start", at)
    }

    /// Append `end=<time>`.
    pub fn record_end(&self, at: DateTime<Local>) -> AppResult<()> {
        self.append("end", at)
    }

    fn append(&self, key: &str, at: DateTime<Local>) -> AppResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DaqError::resource(&self.path, e))?;
        writeln!(file, "{key}={}", at.format(ATTR_TIME_FORMAT))
            .map_err(|e| DaqError::resource(&self.path, e))
    }
}

/// Write `config` as indented JSON to `folder/file_name`, replacing any previous
/// snapshot.
pub fn write_config_snapshot(folder: &Path, file_name: &str, config: &DeviceConfig) -> AppResult<PathBuf> {
    let path = folder.join(file_name);
    fs::write(&path, config.to_pretty_json()?).map_err(|e| DaqError::resource(&path, e))?;
    Ok(path)
}

/// First `<base>/<YYYYMMDD>_run<N>` with `N >= 1` that is not an existing
/// directory.
pub fn next_run_folder(base: &Path, date: NaiveDate) -> PathBuf {
    let stamp = date.format("%Y%m%d");
    (1u32..)
        .map(|n| base.join(format!("{stamp}_run{n}")))
        .find(|p| !p.is_dir())
        .unwrap_or_else(|| base.join(format!("{stamp}_run0")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_channel_list_forms() {
        assert_eq!(parse_channel_list("[0, 1, 5]").unwrap(), vec![0, 1, 5]);
        assert_eq!(parse_channel_list("0,1,5").unwrap(), vec![0, 1, 5]);
        assert_eq!(parse_channel_list(" [ 3 ] ").unwrap(), vec![3]);
        assert_eq!(parse_channel_list("[1, 2,]").unwrap(), vec![1, 2]);
        assert_eq!(parse_channel_list("[-1, 20]").unwrap(), vec![-1, 20]);
    }

    #[test]
    fn test_parse_channel_list_rejects() {
        for bad in ["", "[]", "[0, a]", "[0, 1", "0, 1]", "0,,1", "[[0]]", "1.5"] {
            assert!(
                matches!(parse_channel_list(bad), Err(DaqError::InvalidChannelList(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_file_names_sorted_and_deduplicated() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("run");
        let files = generate_file_names(&root, &[3, 1, 1, 7], &FileNaming::default()).unwrap();

        let names: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            names,
            vec![root.join("ch01.dat"), root.join("ch03.dat"), root.join("ch07.dat")]
        );
        assert_eq!(files.iter().map(|f| f.channel).collect::<Vec<_>>(), vec![1, 3, 7]);
        assert!(root.is_dir());
    }

    #[test]
    fn test_out_of_range_channel_creates_nothing() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("run");
        for bad in [16, -1] {
            let err = generate_file_names(&root, &[0, bad], &FileNaming::default()).unwrap_err();
            assert!(matches!(err, DaqError::ChannelOutOfRange(c) if c == bad));
        }
        assert!(!root.exists());
    }

    #[test]
    fn test_existing_non_empty_file_rejected() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("ch01.dat"), b"data").unwrap();
        fs::write(root.join("ch00.dat"), b"").unwrap();

        let err = generate_file_names(&root, &[0, 1, 2], &FileNaming::default()).unwrap_err();
        assert!(matches!(err, DaqError::OutputFileExists(p) if p == root.join("ch01.dat")));
        assert!(!root.join("ch02.dat").exists());

        // An empty leftover is fine
        assert!(generate_file_names(&root, &[0], &FileNaming::default()).is_ok());
    }

    #[test]
    fn test_custom_naming() {
        let naming = FileNaming {
            head: "det".into(),
            ext: ".bin".into(),
        };
        assert_eq!(naming.file_name(4), "det04.bin");
    }

    #[test]
    fn test_session_config_prepare() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("a");
        let config = SessionConfig::prepare(&folder, "[2, 0]", &FileNaming::default()).unwrap();
        assert_eq!(config.channels(), vec![0, 2]);
        assert_eq!(config.folder(), folder.as_path());

        assert!(matches!(
            SessionConfig::prepare(&folder, "zero", &FileNaming::default()),
            Err(DaqError::InvalidChannelList(_))
        ));
    }

    #[test]
    fn test_attribute_log_lines() {
        let dir = tempdir().unwrap();
        let log = AttributeLog::new(dir.path(), "attr.txt");
        let at = Local::now();
        log.record_start(at).unwrap();
        log.record_end(at).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("start="));
        assert!(lines[1].starts_with("end="));
        let stamp = lines[0].trim_start_matches("start=");
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, ATTR_TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_next_run_folder_skips_existing() {
        let dir = tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(next_run_folder(dir.path(), date), dir.path().join("20240309_run1"));

        fs::create_dir(dir.path().join("20240309_run1")).unwrap();
        fs::create_dir(dir.path().join("20240309_run2")).unwrap();
        assert_eq!(next_run_folder(dir.path(), date), dir.path().join("20240309_run3"));
    }

    #[test]
    fn test_session_finish_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = SessionConfig::prepare(dir.path(), "0", &FileNaming::default()).unwrap();
        let mut session = AcquisitionSession::begin(config);
        let first = session.finish();
        assert_eq!(session.finish(), first);
        assert!(session.stopped_at().unwrap() >= session.started_at());
    }
}
