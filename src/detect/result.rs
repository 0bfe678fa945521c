use serde::{Deserialize, Serialize};

/// A weapon-like detection with its box as `[x1, y1, x2, y2]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreatDetection {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
}

impl ThreatDetection {
    /// Map a detection made on a frame downscaled by `factor` back to source
    /// resolution, and render the confidence into the label.
    pub fn to_source(&self, factor: f32) -> Self {
        let factor = if factor > 0.0 { factor } else { 1.0 };
        Self {
            label: format!("{} {:.2}", self.label.to_uppercase(), self.confidence),
            confidence: self.confidence,
            bbox: self.bbox.map(|v| (v as f32 / factor) as i32),
        }
    }
}

/// Fixed-size numeric representation of a face.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature(pub Vec<f32>);

impl Signature {
    /// Euclidean distance. Signatures of different length never match.
    pub fn distance(&self, other: &Signature) -> f32 {
        if self.0.len() != other.0.len() {
            return f32::INFINITY;
        }
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_rescales_to_source_and_labels_confidence() {
        let raw = ThreatDetection {
            label: "knife".into(),
            confidence: 0.873,
            bbox: [10, 20, 110, 220],
        };
        let scaled = raw.to_source(0.5);
        assert_eq!(scaled.bbox, [20, 40, 220, 440]);
        assert_eq!(scaled.label, "KNIFE 0.87");
    }

    #[test]
    fn signature_distance() {
        let a = Signature(vec![0.0, 3.0]);
        let b = Signature(vec![4.0, 0.0]);
        assert_eq!(a.distance(&b), 5.0);
        assert!(a.distance(&Signature(vec![1.0])).is_infinite());
    }
}
