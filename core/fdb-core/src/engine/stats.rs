//! Operation counters and timings of an [`Fdb`](super::Fdb) handle.

use std::fmt;
use std::time::Duration;

/// 아카이브/플러시/조회 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdbStats {
    /// 아카이브된 필드 수
    pub archive_count: u64,
    pub archive_bytes: u64,
    pub archive_time: Duration,

    pub flush_count: u64,
    pub flush_time: Duration,

    /// 조회 요청 수
    pub retrieve_count: u64,
    /// 조회로 찾은 필드 수
    pub retrieve_fields: u64,
    pub retrieve_failures: u64,
    pub retrieve_time: Duration,
}

impl FdbStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_archive(&mut self, bytes: u64, elapsed: Duration) {
        self.archive_count += 1;
        self.archive_bytes += bytes;
        self.archive_time += elapsed;
    }

    pub fn record_flush(&mut self, elapsed: Duration) {
        self.flush_count += 1;
        self.flush_time += elapsed;
    }

    pub fn record_retrieve(&mut self, fields: u64, failures: u64, elapsed: Duration) {
        self.retrieve_count += 1;
        self.retrieve_fields += fields;
        self.retrieve_failures += failures;
        self.retrieve_time += elapsed;
    }

    /// Mean archive time per field.
    pub fn archive_mean(&self) -> Option<Duration> {
        mean(self.archive_time, self.archive_count)
    }

    pub fn retrieve_mean(&self) -> Option<Duration> {
        mean(self.retrieve_time, self.retrieve_count)
    }

    /// One line per operation, each prefixed with `prefix`.
    pub fn report(&self, prefix: &str) -> String {
        format!(
            "{prefix}archive : {} fields, {} bytes, {:?}\n\
             {prefix}flush   : {} calls, {:?}\n\
             {prefix}retrieve: {} requests, {} fields, {} failures, {:?}\n",
            self.archive_count,
            self.archive_bytes,
            self.archive_time,
            self.flush_count,
            self.flush_time,
            self.retrieve_count,
            self.retrieve_fields,
            self.retrieve_failures,
            self.retrieve_time,
        )
    }
}

fn mean(total: Duration, count: u64) -> Option<Duration> {
    let count = u32::try_from(count).ok().filter(|c| *c > 0)?;
    Some(total / count)
}

impl fmt::Display for FdbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report(""))
    }
}
