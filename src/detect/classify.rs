//! Object classification with temporal smoothing.
//!
//! Single-frame predictions are noisy, so the engine-side wrapper keeps a
//! bounded window of recent prediction sets and reports the label with the
//! highest summed confidence across the window. When nothing in the window
//! clears the backend's own confidence bar, the verdict is "unknown".

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::detect::backend::{Classification, Classifier};
use crate::frame::Frame;

/// Verdict when the window holds no confident prediction.
pub const UNCLASSIFIED_LABEL: &str = "unknown";

/// Smoothing wrapper around a [`Classifier`] backend.
pub struct ObjectClassifier {
    backend: Arc<Mutex<dyn Classifier>>,
    window: VecDeque<Vec<Classification>>,
    window_size: usize,
}

impl ObjectClassifier {
    pub fn new(backend: Arc<Mutex<dyn Classifier>>, window_size: usize) -> Self {
        Self {
            backend,
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Classify one frame and fold the result into the smoothing window.
    /// Backend failures contribute an empty prediction set and are logged,
    /// never propagated.
    pub fn classify(&mut self, frame: &Frame) -> String {
        let predictions = self
            .backend
            .lock()
            .map_err(|_| anyhow!("classifier lock poisoned"))
            .and_then(|mut backend| {
                backend.classify(frame.data(), frame.width(), frame.height())
            })
            .unwrap_or_else(|e| {
                log::warn!("classification failed: {}", e);
                Vec::new()
            });

        while self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(predictions);

        self.smoothed_label()
    }

    /// The label with the highest summed confidence across the window.
    fn smoothed_label(&self) -> String {
        let mut totals: HashMap<&str, f32> = HashMap::new();
        for predictions in &self.window {
            for p in predictions {
                *totals.entry(p.label.as_str()).or_insert(0.0) += p.confidence;
            }
        }

        totals
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, total)| *total > 0.0)
            .map(|(label, _)| label.to_string())
            .unwrap_or_else(|| UNCLASSIFIED_LABEL.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::solid_frame;
    use anyhow::Result;

    /// Replays a fixed sequence of prediction sets.
    struct ScriptedClassifier {
        script: VecDeque<Vec<Classification>>,
    }

    impl Classifier for ScriptedClassifier {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn classify(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<Classification>> {
            Ok(self.script.pop_front().unwrap_or_default())
        }
    }

    fn scripted(script: Vec<Vec<(&str, f32)>>) -> ObjectClassifier {
        let script = script
            .into_iter()
            .map(|set| {
                set.into_iter()
                    .map(|(label, confidence)| Classification {
                        label: label.to_string(),
                        confidence,
                    })
                    .collect()
            })
            .collect();
        ObjectClassifier::new(
            Arc::new(Mutex::new(ScriptedClassifier { script })),
            3,
        )
    }

    #[test]
    fn empty_window_reports_unknown() {
        let mut classifier = scripted(vec![vec![]]);
        assert_eq!(classifier.classify(&solid_frame(8, 8, [0, 0, 0])), UNCLASSIFIED_LABEL);
    }

    #[test]
    fn summed_confidence_over_the_window_wins() {
        // "cat" appears twice at 0.4 (total 0.8); "dog" once at 0.7.
        let mut classifier = scripted(vec![
            vec![("cat", 0.4)],
            vec![("dog", 0.7)],
            vec![("cat", 0.4)],
        ]);
        let frame = solid_frame(8, 8, [0, 0, 0]);
        classifier.classify(&frame);
        classifier.classify(&frame);
        assert_eq!(classifier.classify(&frame), "cat");
    }

    #[test]
    fn window_is_bounded_and_forgets_old_predictions() {
        // Window of 3: the early "dog" burst falls out once three newer
        // prediction sets arrive.
        let mut classifier = scripted(vec![
            vec![("dog", 0.9)],
            vec![("cat", 0.5)],
            vec![("cat", 0.5)],
            vec![("cat", 0.5)],
        ]);
        let frame = solid_frame(8, 8, [0, 0, 0]);
        assert_eq!(classifier.classify(&frame), "dog");
        classifier.classify(&frame);
        classifier.classify(&frame);
        assert_eq!(classifier.classify(&frame), "cat");
    }
}
