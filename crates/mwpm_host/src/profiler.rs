//! JSON-lines decode profile.
//!
//! One record per shot, followed by one summary line. Times are seconds.

use anyhow::{Context, Result};
use mwpm_core::Weight;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize)]
pub struct ShotRecord {
    pub shot: usize,
    pub defect_num: usize,
    pub decoding_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<Weight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub shot_num: usize,
    pub max_decoding_time: f64,
    pub average_decoding_time: f64,
    /// `None` when no shot had a defect.
    pub average_decoding_time_per_defect: Option<f64>,
}

pub struct Profiler<W: Write> {
    out: W,
    shot_num: usize,
    defect_total: usize,
    max: Duration,
    sum: Duration,
}

impl Profiler<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create profile {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> Profiler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            shot_num: 0,
            defect_total: 0,
            max: Duration::ZERO,
            sum: Duration::ZERO,
        }
    }

    pub fn record(
        &mut self,
        shot: usize,
        defect_num: usize,
        elapsed: Duration,
        outcome: std::result::Result<Weight, String>,
    ) -> Result<()> {
        self.shot_num += 1;
        self.defect_total += defect_num;
        self.max = self.max.max(elapsed);
        self.sum += elapsed;

        let (weight, error) = match outcome {
            Ok(w) => (Some(w), None),
            Err(e) => (None, Some(e)),
        };
        let record = ShotRecord {
            shot,
            defect_num,
            decoding_time: elapsed.as_secs_f64(),
            weight,
            error,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        writeln!(self.out)?;
        Ok(())
    }

    pub fn summary(&self) -> ProfileSummary {
        if self.shot_num == 0 {
            return ProfileSummary::default();
        }
        let total = self.sum.as_secs_f64();
        ProfileSummary {
            shot_num: self.shot_num,
            max_decoding_time: self.max.as_secs_f64(),
            average_decoding_time: total / self.shot_num as f64,
            average_decoding_time_per_defect: (self.defect_total > 0)
                .then(|| total / self.defect_total as f64),
        }
    }

    /// Writes the summary line and flushes.
    pub fn finish(mut self) -> Result<ProfileSummary> {
        let summary = self.summary();
        serde_json::to_writer(&mut self.out, &summary)?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_records_then_summary() {
        let mut out = Vec::new();
        let mut profiler = Profiler::new(&mut out);
        profiler.record(0, 2, Duration::from_millis(2), Ok(7)).unwrap();
        profiler
            .record(1, 0, Duration::from_millis(4), Err("aborted".into()))
            .unwrap();
        let summary = profiler.finish().unwrap();
        assert_eq!(summary.shot_num, 2);
        assert!((summary.max_decoding_time - 0.004).abs() < 1e-12);
        assert!((summary.average_decoding_time - 0.003).abs() < 1e-12);
        assert!((summary.average_decoding_time_per_defect.unwrap() - 0.003).abs() < 1e-12);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["weight"], 7);
        assert!(lines[0].get("error").is_none());
        assert_eq!(lines[1]["error"], "aborted");
        assert!(lines[2].get("average_decoding_time_per_defect").is_some());
    }

    #[test]
    fn empty_profile_has_no_per_defect_time() {
        let profiler = Profiler::new(Vec::new());
        assert_eq!(profiler.summary().average_decoding_time_per_defect, None);
    }
}
