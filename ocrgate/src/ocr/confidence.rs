use super::types::Detection;

/// Placeholder overall score for hosted vision models, which return text but
/// no confidence signal. An estimate, not a measurement.
pub const VISION_ESTIMATED_CONFIDENCE: f32 = 85.0;

/// Native scale of a backend's per-unit score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreScale {
    /// 0.0 - 1.0
    Unit,
    /// 0 - 100
    Percent,
}

/// Convert a native score to 0-100. Negative or non-finite scores mean "no
/// score" (tesseract reports -1 for non-word rows).
pub fn normalize_score(raw: f32, scale: ScoreScale) -> Option<f32> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let value = match scale {
        ScoreScale::Unit => raw * 100.0,
        ScoreScale::Percent => raw,
    };
    Some(value.clamp(0.0, 100.0))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedConfidence {
    pub overall: f32,
    /// Detections at or above the threshold, in their original order.
    pub retained: Vec<Detection>,
    pub estimated: bool,
}

/// Overall score for a set of detections:
/// no detections gives 0; detections without any score give the backend's
/// estimate (or 0 if it has none); otherwise the mean of the scores.
pub fn overall_confidence(detections: &[Detection], estimate: Option<f32>) -> (f32, bool) {
    if detections.is_empty() {
        return (0.0, false);
    }

    let scores: Vec<f32> = detections.iter().filter_map(|d| d.confidence).collect();
    if scores.is_empty() {
        return match estimate {
            Some(value) => (value.clamp(0.0, 100.0), true),
            None => (0.0, false),
        };
    }

    let mean = scores.iter().sum::<f32>() / scores.len() as f32;
    (mean, false)
}

/// Compute the overall score, then drop detections below `min_confidence`.
/// Filtering never feeds back into the score. Unscored detections are kept.
pub fn aggregate(
    detections: Vec<Detection>,
    min_confidence: f32,
    estimate: Option<f32>,
) -> AggregatedConfidence {
    let (overall, estimated) = overall_confidence(&detections, estimate);

    let retained = detections
        .into_iter()
        .filter(|d| d.confidence.map_or(true, |c| c >= min_confidence))
        .collect();

    AggregatedConfidence {
        overall,
        retained,
        estimated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(text: &str, confidence: f32) -> Detection {
        Detection::new(text, 0).with_confidence(confidence)
    }

    #[test]
    fn test_empty_is_zero() {
        let result = aggregate(Vec::new(), 0.0, Some(VISION_ESTIMATED_CONFIDENCE));
        assert_eq!(result.overall, 0.0);
        assert!(!result.estimated);
        assert!(result.retained.is_empty());
    }

    #[test]
    fn test_unscored_detections_use_estimate() {
        let detections = vec![Detection::new("hello", 0), Detection::new("world", 0)];
        let result = aggregate(detections, 50.0, Some(VISION_ESTIMATED_CONFIDENCE));
        assert_eq!(result.overall, VISION_ESTIMATED_CONFIDENCE);
        assert!(result.estimated);
        assert_eq!(result.retained.len(), 2);
    }

    #[test]
    fn test_unscored_without_estimate_is_zero() {
        let (overall, estimated) = overall_confidence(&[Detection::new("x", 0)], None);
        assert_eq!(overall, 0.0);
        assert!(!estimated);
    }

    #[test]
    fn test_mean_of_scores() {
        let detections = vec![scored("a", 90.0), scored("b", 70.0), scored("c", 80.0)];
        let result = aggregate(detections, 0.0, None);
        assert!((result.overall - 80.0).abs() < 1e-4);
        assert_eq!(result.retained.len(), 3);
    }

    #[test]
    fn test_filtering_does_not_change_mean() {
        let lists: Vec<Vec<f32>> = vec![
            vec![10.0, 95.0],
            vec![49.9, 50.0, 50.1],
            vec![0.0, 100.0, 30.0, 70.0],
            vec![12.5],
        ];

        for scores in lists {
            let detections: Vec<Detection> = scores.iter().map(|s| scored("t", *s)).collect();
            let expected = scores.iter().sum::<f32>() / scores.len() as f32;

            for threshold in [0.0, 50.0, 99.0, 100.0] {
                let result = aggregate(detections.clone(), threshold, None);
                assert!((result.overall - expected).abs() < 1e-4);
                assert!(result
                    .retained
                    .iter()
                    .all(|d| d.confidence.unwrap() >= threshold));
            }
        }
    }

    #[test]
    fn test_filter_keeps_order_and_unscored() {
        let detections = vec![
            scored("low", 20.0),
            Detection::new("unscored", 0),
            scored("high", 90.0),
        ];
        let result = aggregate(detections, 60.0, None);
        let texts: Vec<&str> = result.retained.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["unscored", "high"]);
        assert!((result.overall - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_normalize_score_scales() {
        assert_eq!(normalize_score(0.5, ScoreScale::Unit), Some(50.0));
        assert_eq!(normalize_score(87.0, ScoreScale::Percent), Some(87.0));
        assert_eq!(normalize_score(-1.0, ScoreScale::Percent), None);
        assert_eq!(normalize_score(f32::NAN, ScoreScale::Unit), None);
        assert_eq!(normalize_score(1.2, ScoreScale::Unit), Some(100.0));
    }
}
