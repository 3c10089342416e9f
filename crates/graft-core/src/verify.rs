//! Golden-output verification.
//!
//! After a conversion the reloaded model is run on one fixed image pair and
//! its outputs are compared against literal values recorded from a
//! known-good run. The fixtures are exactly that — recorded constants, never
//! derived. Any mismatch means the conversion is incorrect and must not be
//! published.

use crate::error::{GraftError, Result};
use crate::model::{KeypointMatchingOutput, NO_MATCH};

/// Recorded reference outputs for one converted model.
#[derive(Debug, Clone)]
pub struct GoldenOutputs {
    /// Fixture name used in failure reports.
    pub name: &'static str,
    /// Expected shape of both `matches` and `matching_scores`.
    pub expected_shape: Vec<usize>,
    /// Start of the inspected slice along the last axis of `[0, 0]`.
    pub slice_start: usize,
    /// Expected match indices over the inspected slice.
    pub expected_matches: Vec<i64>,
    /// Expected matching scores over the inspected slice.
    pub expected_scores: Vec<f32>,
    /// Expected count of non-sentinel entries in `matches[0][0]`.
    pub expected_match_count: usize,
    /// Absolute tolerance for score comparison.
    pub atol: f32,
    /// Relative tolerance for score comparison.
    pub rtol: f32,
}

impl GoldenOutputs {
    /// Fixture for the converted EfficientLoFTR model.
    pub fn efficientloftr() -> Self {
        Self {
            name: "efficientloftr",
            expected_shape: vec![1, 2, 383],
            slice_start: 20,
            expected_matches: vec![20, 21, 22, 23, 24, 25, 26, 27, 28, 29],
            expected_scores: vec![
                0.3340, 0.7391, 0.2851, 0.2058, 0.2835, 0.92265, 0.3522, 0.2954, 0.3348, 0.6370,
            ],
            expected_match_count: 383,
            atol: 5e-3,
            rtol: 5e-3,
        }
    }

    /// Fixture for the converted LightGlue model.
    pub fn lightglue() -> Self {
        Self {
            name: "lightglue",
            expected_shape: vec![1, 2, 866],
            slice_start: 20,
            expected_matches: vec![-1, -1, -1, -1, -1, -1, -1, -1, 540, -1],
            expected_scores: vec![
                0.0, 0.0, 0.0167, 0.0304, 0.0328, 0.0, 0.0, 0.0095, 0.2964, 0.0352,
            ],
            expected_match_count: 127,
            atol: 1e-4,
            rtol: 0.0,
        }
    }

    /// Check a forward-pass output against this fixture.
    ///
    /// Asserts, in order: exact shape equality of both output tensors,
    /// exact equality of the inspected match-index slice, near-equality of
    /// the inspected score slice, and the exact non-sentinel match count.
    /// The first failing assertion aborts with a report naming the first
    /// diverging index.
    pub fn check(&self, output: &KeypointMatchingOutput) -> Result<()> {
        if output.matches.dims() != self.expected_shape.as_slice() {
            return Err(self.fail(format!(
                "matches shape {:?} != expected {:?}",
                output.matches.dims(),
                self.expected_shape
            )));
        }
        if output.matching_scores.dims() != self.expected_shape.as_slice() {
            return Err(self.fail(format!(
                "matching_scores shape {:?} != expected {:?}",
                output.matching_scores.dims(),
                self.expected_shape
            )));
        }

        let len = self.expected_matches.len();
        let matches: Vec<i64> = output
            .matches
            .narrow(0, 0, 1)?
            .narrow(1, 0, 1)?
            .narrow(2, self.slice_start, len)?
            .flatten_all()?
            .to_vec1()?;
        for (i, (got, want)) in matches.iter().zip(&self.expected_matches).enumerate() {
            if got != want {
                return Err(self.fail(format!(
                    "match index diverges at slice offset {i}: expected {want}, got {got}"
                )));
            }
        }

        let scores: Vec<f32> = output
            .matching_scores
            .narrow(0, 0, 1)?
            .narrow(1, 0, 1)?
            .narrow(2, self.slice_start, len)?
            .flatten_all()?
            .to_vec1()?;
        for (i, (got, want)) in scores.iter().zip(&self.expected_scores).enumerate() {
            let bound = self.atol + self.rtol * want.abs();
            if (got - want).abs() > bound {
                return Err(self.fail(format!(
                    "matching score diverges at slice offset {i}: expected {want}, got {got} \
                     (tolerance {bound})"
                )));
            }
        }

        let valid = count_valid_matches(output)?;
        if valid != self.expected_match_count {
            return Err(self.fail(format!(
                "valid match count {valid} != expected {}",
                self.expected_match_count
            )));
        }

        Ok(())
    }

    fn fail(&self, detail: String) -> GraftError {
        GraftError::Verification(format!("[{}] {detail}", self.name))
    }
}

/// Count non-sentinel entries in `matches[0][0]`.
pub fn count_valid_matches(output: &KeypointMatchingOutput) -> Result<usize> {
    let row = output
        .matches
        .narrow(0, 0, 1)?
        .narrow(1, 0, 1)?
        .flatten_all()?;
    let values: Vec<i64> = row.to_vec1()?;
    Ok(values.iter().filter(|&&v| v != NO_MATCH).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    /// Build an output whose `[0, 0]` row carries the given values; the
    /// second row mirrors the first.
    fn synthetic_output(matches_row: Vec<i64>, scores_row: Vec<f32>) -> KeypointMatchingOutput {
        let device = Device::Cpu;
        let n = matches_row.len();
        let matches = Tensor::from_vec(
            matches_row.iter().chain(matches_row.iter()).copied().collect::<Vec<i64>>(),
            (1, 2, n),
            &device,
        )
        .unwrap();
        let scores = Tensor::from_vec(
            scores_row.iter().chain(scores_row.iter()).copied().collect::<Vec<f32>>(),
            (1, 2, n),
            &device,
        )
        .unwrap();
        let keypoints = Tensor::zeros((1, 2, n, 2), candle_core::DType::F32, &device).unwrap();
        KeypointMatchingOutput {
            keypoints,
            matches,
            matching_scores: scores,
            hidden_states: None,
            attentions: None,
        }
    }

    fn passing_efficientloftr_output() -> KeypointMatchingOutput {
        let golden = GoldenOutputs::efficientloftr();
        let n = golden.expected_shape[2];
        // Matched pairs are index-aligned, so the match row is 0..n.
        let matches: Vec<i64> = (0..n as i64).collect();
        let mut scores = vec![0.5f32; n];
        scores[20..30].copy_from_slice(&golden.expected_scores);
        synthetic_output(matches, scores)
    }

    #[test]
    fn efficientloftr_fixture_accepts_recorded_outputs() {
        let golden = GoldenOutputs::efficientloftr();
        golden.check(&passing_efficientloftr_output()).unwrap();
    }

    #[test]
    fn lightglue_fixture_accepts_recorded_outputs() {
        let golden = GoldenOutputs::lightglue();
        let n = golden.expected_shape[2];
        let mut matches = vec![NO_MATCH; n];
        let mut scores = vec![0.0f32; n];
        matches[20..30].copy_from_slice(&golden.expected_matches);
        scores[20..30].copy_from_slice(&golden.expected_scores);
        // 126 more valid entries outside the inspected slice for a total
        // of 127 (index 28 holds the one inside the slice).
        for i in 100..226 {
            matches[i] = i as i64;
        }
        let output = synthetic_output(matches, scores);

        assert_eq!(count_valid_matches(&output).unwrap(), 127);
        golden.check(&output).unwrap();
    }

    #[test]
    fn shape_mismatch_fails() {
        let golden = GoldenOutputs::efficientloftr();
        let output = synthetic_output(vec![0; 10], vec![0.0; 10]);
        let err = golden.check(&output).unwrap_err();
        assert!(err.to_string().contains("shape"));
    }

    #[test]
    fn score_out_of_tolerance_fails() {
        let golden = GoldenOutputs::efficientloftr();
        let mut output = passing_efficientloftr_output();
        let n = golden.expected_shape[2];
        let mut scores = vec![0.5f32; n];
        scores[20..30].copy_from_slice(&golden.expected_scores);
        scores[25] += 0.1; // well past 5e-3
        output.matching_scores =
            Tensor::from_vec(
                scores.iter().chain(scores.iter()).copied().collect::<Vec<f32>>(),
                (1, 2, n),
                &Device::Cpu,
            )
            .unwrap();

        let err = golden.check(&output).unwrap_err();
        assert!(err.to_string().contains("matching score diverges"));
    }

    #[test]
    fn wrong_match_index_fails() {
        let golden = GoldenOutputs::efficientloftr();
        let n = golden.expected_shape[2];
        let mut matches: Vec<i64> = (0..n as i64).collect();
        matches[22] = 99;
        let mut scores = vec![0.5f32; n];
        scores[20..30].copy_from_slice(&golden.expected_scores);
        let output = synthetic_output(matches, scores);

        let err = golden.check(&output).unwrap_err();
        assert!(err.to_string().contains("match index diverges"));
    }

    #[test]
    fn match_count_mismatch_fails() {
        let golden = GoldenOutputs::lightglue();
        let n = golden.expected_shape[2];
        let mut matches = vec![NO_MATCH; n];
        let mut scores = vec![0.0f32; n];
        matches[20..30].copy_from_slice(&golden.expected_matches);
        scores[20..30].copy_from_slice(&golden.expected_scores);
        // Only the single in-slice match: count is 1, not 127.
        let output = synthetic_output(matches, scores);

        let err = golden.check(&output).unwrap_err();
        assert!(err.to_string().contains("valid match count"));
    }

    #[test]
    fn tolerances_are_honored() {
        let golden = GoldenOutputs::efficientloftr();
        let n = golden.expected_shape[2];
        let matches: Vec<i64> = (0..n as i64).collect();
        let mut scores = vec![0.5f32; n];
        scores[20..30].copy_from_slice(&golden.expected_scores);
        // Nudge one value by less than atol.
        scores[21] += 2e-3;
        let output = synthetic_output(matches, scores);

        golden.check(&output).unwrap();
    }
}
