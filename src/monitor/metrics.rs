use once_cell::sync::Lazy;
use regex::Regex;

static BYTES_READ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:HDFS: Number of bytes read|HDFS_BYTES_READ|HDFS Read:)[=:\s]*(\d+)").unwrap()
});
static BYTES_WRITTEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:HDFS: Number of bytes written|HDFS_BYTES_WRITTEN|HDFS Write:)[=:\s]*(\d+)")
        .unwrap()
});
static INPUT_RECORDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Map input records|MAP_INPUT_RECORDS)[=:\s]*(\d+)").unwrap());
static CPU_MS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:CPU time spent \(ms\)|CPU_MILLISECONDS)[=:\s]*(\d+)").unwrap()
});
// Hive prints "Total MapReduce CPU Time Spent: 1 minutes 3 seconds 240 msec"
static HIVE_CPU_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Total MapReduce CPU Time Spent:\s*(?:(\d+) days? )?(?:(\d+) hours? )?(?:(\d+) minutes? )?(?:(\d+) seconds? )?(\d+) msec",
    )
    .unwrap()
});

/// Figures recovered from a finished job's backend output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionMetrics {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub input_records: u64,
    /// Seconds.
    pub cpu_time: f64,
}

impl CompletionMetrics {
    /// Best-effort extraction. Counters that do not appear are zero.
    ///
    /// Counters printed more than once (one block per MapReduce stage) are
    /// summed.
    pub fn extract(text: &str) -> Self {
        let cpu_ms = match sum_of(&CPU_MS_RE, text) {
            0 => hive_cpu_ms(text),
            ms => ms,
        };
        Self {
            bytes_read: sum_of(&BYTES_READ_RE, text),
            bytes_written: sum_of(&BYTES_WRITTEN_RE, text),
            input_records: sum_of(&INPUT_RECORDS_RE, text),
            cpu_time: cpu_ms as f64 / 1000.0,
        }
    }
}

fn sum_of(re: &Regex, text: &str) -> u64 {
    re.captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .sum()
}

fn hive_cpu_ms(text: &str) -> u64 {
    let Some(caps) = HIVE_CPU_RE.captures(text) else {
        return 0;
    };
    let part = |i: usize| -> u64 {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    ((part(1) * 24 + part(2)) * 60 + part(3)) * 60_000 + part(4) * 1000 + part(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2_STATUS: &str = "\
Job: job_1398156245171_0007
Job File: hdfs://nn:9000/user/hadoop/.staging/job_1398156245171_0007/job.xml
Job state: SUCCEEDED
Counters: 49
\tFile System Counters
\t\tHDFS: Number of bytes read=1048576
\t\tHDFS: Number of bytes written=2048
\tMap-Reduce Framework
\t\tMap input records=1200
\t\tCPU time spent (ms)=4560
";

    const V1_STATUS: &str = "\
Counters: 29
\tFileSystemCounters
\t\tHDFS_BYTES_READ=500
\t\tHDFS_BYTES_WRITTEN=70
\tMap-Reduce Framework
\t\tMap input records=9
\t\tCPU time spent (ms)=1500
";

    const HIVE_LOG: &str = "\
Total MapReduce jobs = 2
Job 0: Map: 1  Reduce: 1   Cumulative CPU: 2.1 sec   HDFS Read: 300 HDFS Write: 20 SUCCESS
Job 1: Map: 1  Reduce: 1   Cumulative CPU: 1.1 sec   HDFS Read: 100 HDFS Write: 5 SUCCESS
Total MapReduce CPU Time Spent: 1 minutes 3 seconds 240 msec
OK
";

    #[test]
    fn hadoop_v2_counters() {
        let m = CompletionMetrics::extract(V2_STATUS);
        assert_eq!(m.bytes_read, 1_048_576);
        assert_eq!(m.bytes_written, 2048);
        assert_eq!(m.input_records, 1200);
        assert!((m.cpu_time - 4.56).abs() < 1e-9);
    }

    #[test]
    fn hadoop_v1_counters() {
        let m = CompletionMetrics::extract(V1_STATUS);
        assert_eq!(m.bytes_read, 500);
        assert_eq!(m.bytes_written, 70);
        assert_eq!(m.input_records, 9);
        assert!((m.cpu_time - 1.5).abs() < 1e-9);
    }

    #[test]
    fn hive_log_sums_stages() {
        let m = CompletionMetrics::extract(HIVE_LOG);
        assert_eq!(m.bytes_read, 400);
        assert_eq!(m.bytes_written, 25);
        assert_eq!(m.input_records, 0);
        assert!((m.cpu_time - 63.24).abs() < 1e-9);
    }

    #[test]
    fn unparseable_text_is_zero() {
        assert_eq!(CompletionMetrics::extract("Could not find job"), CompletionMetrics::default());
    }
}
