//! Prediction rendering.
//!
use std::cmp::Ordering;

use tokio::sync::watch;

use crate::nn::Prediction;

/// Renders ranked predictions into the shared output surface.
///
/// Every `render` call fully replaces the previous output; subscribers of
/// the watch channel only ever observe complete line lists.
pub struct PredictionRenderer {
    tx: watch::Sender<Vec<String>>,
}

impl PredictionRenderer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Sort descending by probability and publish one line per prediction.
    ///
    /// The sort is stable, so ties keep the order the model emitted.
    pub fn render(&self, predictions: &[Prediction]) -> Vec<String> {
        let mut ranked: Vec<&Prediction> = predictions.iter().collect();
        ranked.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(Ordering::Equal)
        });

        let lines: Vec<String> = ranked.into_iter().map(format_line).collect();
        self.tx.send_replace(lines.clone());
        lines
    }

    /// Snapshot of the currently rendered output.
    pub fn current(&self) -> Vec<String> {
        self.tx.borrow().clone()
    }

    /// Receiver observing every published replacement.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tx.subscribe()
    }
}

/// One output line, confidence as a percentage with one decimal place.
pub fn format_line(prediction: &Prediction) -> String {
    format!(
        "{}: {:.1}%",
        prediction.label,
        prediction.probability * 100.0
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn prediction(label: &str, probability: f32) -> Prediction {
        Prediction {
            label: label.to_owned(),
            probability,
        }
    }

    #[test]
    fn renders_descending_with_one_decimal_place() {
        let renderer = PredictionRenderer::new();
        let lines = renderer.render(&[
            prediction("A", 0.2),
            prediction("B", 0.9),
            prediction("C", 0.5),
        ]);
        assert_eq!(lines, vec!["B: 90.0%", "C: 50.0%", "A: 20.0%"]);
    }

    #[test]
    fn ties_keep_their_original_order() {
        let renderer = PredictionRenderer::new();
        let lines = renderer.render(&[
            prediction("x", 0.5),
            prediction("y", 0.5),
            prediction("z", 0.7),
        ]);
        assert_eq!(lines, vec!["z: 70.0%", "x: 50.0%", "y: 50.0%"]);
    }

    #[test]
    fn output_is_fully_replaced() {
        let renderer = PredictionRenderer::new();
        renderer.render(&[prediction("old", 0.4)]);
        renderer.render(&[prediction("new", 0.6)]);
        assert_eq!(renderer.current(), vec!["new: 60.0%"]);
    }

    #[test]
    fn empty_input_clears_the_output() {
        let renderer = PredictionRenderer::new();
        renderer.render(&[prediction("old", 0.4)]);
        renderer.render(&[]);
        assert!(renderer.current().is_empty());
    }

    #[test]
    fn subscribers_observe_replacements() {
        let renderer = PredictionRenderer::new();
        let mut rx = renderer.subscribe();
        renderer.render(&[prediction("a", 1.0)]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), vec!["a: 100.0%"]);
    }
}
