//! Block device traffic from `/proc/diskstats`
//!
//! `prepare` stores a snapshot of the per-device counters, `contribute` takes
//! a second one and publishes per-second rates between the two.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{Mementos, ScalarProbe, ScalarResults};
use crate::data::ScalarDataPoint;
use crate::error::{Error, Result};

const DISKSTATS_PATH: &str = "/proc/diskstats";
const SYS_BLOCK_PATH: &str = "/sys/block";
const MEMENTO_KEY: &str = "disk:";
const DEFAULT_BLOCK_SIZE: u64 = 512;

/// Counters of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCounters {
    pub sectors_read: u64,
    pub sectors_written: u64,
    pub ios_in_progress: u64,
}

/// All devices at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStatsSnapshot {
    pub timestamp_millis: i64,
    pub devices: BTreeMap<String, DeviceCounters>,
}

/// Parse the content of `/proc/diskstats`
pub fn parse_diskstats(content: &str, timestamp_millis: i64) -> Result<DiskStatsSnapshot> {
    let mut devices = BTreeMap::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 12 {
            return Err(Error::Parse(format!("short diskstats line: {:?}", line)));
        }

        let number = |idx: usize| -> Result<u64> {
            fields[idx]
                .parse()
                .map_err(|_| Error::Parse(format!("invalid diskstats field {:?}", fields[idx])))
        };

        devices.insert(
            fields[2].to_string(),
            DeviceCounters {
                sectors_read: number(5)?,
                sectors_written: number(9)?,
                ios_in_progress: number(11)?,
            },
        );
    }

    Ok(DiskStatsSnapshot {
        timestamp_millis,
        devices,
    })
}

/// Publish rates between two snapshots. `block_size` resolves the physical
/// block size of a device.
pub fn contribute_traffic(
    prev: &DiskStatsSnapshot,
    current: &DiskStatsSnapshot,
    results: &mut ScalarResults,
    timestamp_millis: i64,
    block_size: impl Fn(&str) -> u64,
) {
    let diff_millis = current.timestamp_millis - prev.timestamp_millis;
    if diff_millis <= 0 {
        return;
    }
    let diff_millis = diff_millis as u64;

    for (dev, counters) in &current.devices {
        // devices may appear or vanish between snapshots
        let Some(before) = prev.devices.get(dev) else {
            continue;
        };
        // unused devices, e.g. RAM disks
        if counters.sectors_read == 0 && counters.sectors_written == 0 {
            continue;
        }

        let read_raw = counters.sectors_read.saturating_sub(before.sectors_read);
        let written_raw = counters.sectors_written.saturating_sub(before.sectors_written);
        let block = block_size(dev);

        let mut add = |suffix: &str, value: u64, digits: u8| {
            let key = format!("disk:{}:{}", dev, suffix);
            let point = ScalarDataPoint::new(timestamp_millis, key.clone(), value as i64, digits);
            results.insert(key, point);
        };

        add("read-sectors", read_raw * 10 * 1000 / diff_millis, 1);
        add("written-sectors", written_raw * 10 * 1000 / diff_millis, 1);
        add(
            "read-mbytes",
            read_raw * block * 100 * 1000 / diff_millis / 1024 / 1024,
            2,
        );
        add(
            "written-mbytes",
            written_raw * block * 100 * 1000 / diff_millis / 1024 / 1024,
            2,
        );
        add("ios-in-progress", counters.ios_in_progress, 0);
    }
}

/// Publishes `disk:<dev>:read-sectors`, `written-sectors`, `read-mbytes`,
/// `written-mbytes` and `ios-in-progress` per device
#[derive(Debug, Clone)]
pub struct DiskStatsProbe {
    diskstats_path: PathBuf,
    sys_block_path: PathBuf,
}

impl Default for DiskStatsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskStatsProbe {
    pub fn new() -> Self {
        Self {
            diskstats_path: PathBuf::from(DISKSTATS_PATH),
            sys_block_path: PathBuf::from(SYS_BLOCK_PATH),
        }
    }

    pub fn with_paths(diskstats: impl Into<PathBuf>, sys_block: impl Into<PathBuf>) -> Self {
        Self {
            diskstats_path: diskstats.into(),
            sys_block_path: sys_block.into(),
        }
    }

    fn snapshot(&self) -> Result<DiskStatsSnapshot> {
        let content = fs::read_to_string(&self.diskstats_path)?;
        parse_diskstats(&content, Utc::now().timestamp_millis())
    }

    /// Partitions inherit the block size of their disk (`sda1` → `sda`)
    fn physical_block_size(&self, dev: &str) -> u64 {
        let mut name = dev;
        while !name.is_empty() {
            let path = self
                .sys_block_path
                .join(name)
                .join("queue")
                .join("physical_block_size");
            if let Some(size) = read_block_size(&path) {
                return size;
            }
            let mut chars = name.chars();
            chars.next_back();
            name = chars.as_str();
        }
        DEFAULT_BLOCK_SIZE
    }
}

fn read_block_size(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl ScalarProbe for DiskStatsProbe {
    fn name(&self) -> &str {
        "diskstats"
    }

    fn prepare(&self, mementos: &mut Mementos) -> Result<()> {
        mementos.insert(MEMENTO_KEY.to_string(), Box::new(self.snapshot()?));
        Ok(())
    }

    fn contribute(
        &self,
        results: &mut ScalarResults,
        timestamp_millis: i64,
        mementos: &Mementos,
    ) -> Result<()> {
        let Some(prev) = mementos
            .get(MEMENTO_KEY)
            .and_then(|m| m.downcast_ref::<DiskStatsSnapshot>())
        else {
            return Ok(());
        };
        let current = self.snapshot()?;
        contribute_traffic(prev, &current, results, timestamp_millis, |dev| {
            self.physical_block_size(dev)
        });
        Ok(())
    }
}
