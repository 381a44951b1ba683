//! Default metric log sink: size-capped files with numbered backups.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::aggregator::MetricLogWriter;
use crate::metric_item::MetricItem;

const METRIC_LOG_FILE_NAME: &str = "flowgate-metrics.log";

/// Appends metric item lines to `<dir>/flowgate-metrics.log`, rolling to
/// `flowgate-metrics.log.1`, `.2`, ... when the file exceeds `max_size`,
/// keeping at most `max_files` files in total.
pub struct RollingFileWriter {
    path: PathBuf,
    max_size: u64,
    max_files: u32,
    file: BufWriter<File>,
    written: u64,
}

impl RollingFileWriter {
    pub fn new(dir: &Path, max_size: u64, max_files: u32) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(METRIC_LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_size,
            max_files,
            file: BufWriter::new(file),
            written,
        })
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        for idx in (1..self.max_files).rev() {
            let from = backup_path(&self.path, idx);
            if !from.exists() {
                continue;
            }
            if idx + 1 >= self.max_files {
                fs::remove_file(&from)?;
            } else {
                fs::rename(&from, backup_path(&self.path, idx + 1))?;
            }
        }
        if self.max_files > 1 {
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        } else {
            fs::remove_file(&self.path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.file = BufWriter::new(file);
        self.written = 0;
        Ok(())
    }
}

impl MetricLogWriter for RollingFileWriter {
    fn write(&mut self, _timestamp: u64, items: &[MetricItem]) -> io::Result<()> {
        for item in items {
            let line = item.to_line();
            self.file.write_all(line.as_bytes())?;
            self.file.write_all(b"\n")?;
            self.written += line.len() as u64 + 1;
        }
        self.file.flush()?;
        if self.written > self.max_size {
            self.roll()?;
        }
        Ok(())
    }
}

fn backup_path(base: &Path, idx: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", base.display(), idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceType;

    fn item(timestamp: u64, resource: &str) -> MetricItem {
        MetricItem {
            timestamp,
            resource: resource.into(),
            classification: ResourceType::Common,
            pass_qps: 1,
            block_qps: 0,
            complete_qps: 1,
            error_qps: 0,
            avg_rt: 3,
            concurrency: 0,
        }
    }

    #[test]
    fn writes_one_line_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RollingFileWriter::new(dir.path(), 1024 * 1024, 2).unwrap();
        writer
            .write(1000, &[item(1000, "a"), item(1000, "b")])
            .unwrap();
        writer.write(2000, &[item(2000, "a")]).unwrap();

        let contents = fs::read_to_string(dir.path().join(METRIC_LOG_FILE_NAME)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "1000|a|0|1|0|1|0|3|0");
        assert!(lines[1].starts_with("1000|b|"));
        assert!(lines[2].starts_with("2000|a|"));
    }

    #[test]
    fn rolls_when_the_size_cap_is_hit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RollingFileWriter::new(dir.path(), 64, 3).unwrap();
        for ts in 0..10u64 {
            writer.write(ts, &[item(ts * 1000, "roll-me")]).unwrap();
        }

        let base = dir.path().join(METRIC_LOG_FILE_NAME);
        assert!(backup_path(&base, 1).exists());
        // The live file was reopened small after the last roll.
        assert!(fs::metadata(&base).unwrap().len() <= 64 + 32);
    }

    #[test]
    fn retains_at_most_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RollingFileWriter::new(dir.path(), 16, 2).unwrap();
        for ts in 0..20u64 {
            writer.write(ts, &[item(ts * 1000, "churn")]).unwrap();
        }

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert!(count <= 2, "kept {count} files");
        let base = dir.path().join(METRIC_LOG_FILE_NAME);
        assert!(!backup_path(&base, 2).exists());
    }
}
