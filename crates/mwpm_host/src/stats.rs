//! Latency statistics for decode runs.

use std::time::Duration;

const BUCKET_NUM: usize = 20;

/// Running min/max/mean plus a fixed-width histogram.
pub struct LatencyStats {
    pub min: Duration,
    pub max: Duration,
    pub sum: Duration,
    pub count: u64,
    bucket_width: Duration,
    /// The last bucket also collects everything above the range.
    pub buckets: [u64; BUCKET_NUM],
}

impl LatencyStats {
    pub fn new(bucket_width: Duration) -> Self {
        Self {
            min: Duration::MAX,
            max: Duration::ZERO,
            sum: Duration::ZERO,
            count: 0,
            bucket_width: bucket_width.max(Duration::from_nanos(1)),
            buckets: [0; BUCKET_NUM],
        }
    }

    pub fn update(&mut self, latency: Duration) {
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
        self.sum += latency;
        self.count += 1;

        let idx = (latency.as_nanos() / self.bucket_width.as_nanos()).min(BUCKET_NUM as u128 - 1);
        self.buckets[idx as usize] += 1;
    }

    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.sum / self.count as u32
        }
    }

    pub fn print_report(&self, title: &str) {
        println!("\n{}", title);
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }
        println!("Min:   {:?}", self.min);
        println!("Avg:   {:?}", self.avg());
        println!("Max:   {:?}", self.max);

        println!("Distribution ({:?} buckets):", self.bucket_width);
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let lower = self.bucket_width * i as u32;
                let upper = if i == BUCKET_NUM - 1 {
                    "inf".to_string()
                } else {
                    format!("{:?}", self.bucket_width * (i as u32 + 1))
                };
                println!("[{:?} - {}]: {}", lower, upper, count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_extremes_and_buckets() {
        let mut s = LatencyStats::new(Duration::from_micros(10));
        assert_eq!(s.avg(), Duration::ZERO);
        s.update(Duration::from_micros(5));
        s.update(Duration::from_micros(15));
        s.update(Duration::from_secs(1));
        assert_eq!(s.count, 3);
        assert_eq!(s.min, Duration::from_micros(5));
        assert_eq!(s.max, Duration::from_secs(1));
        assert_eq!(s.buckets[0], 1);
        assert_eq!(s.buckets[1], 1);
        assert_eq!(s.buckets[BUCKET_NUM - 1], 1);
        assert_eq!(s.avg(), (Duration::from_micros(20) + Duration::from_secs(1)) / 3);
    }
}
