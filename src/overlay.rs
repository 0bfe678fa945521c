//! Detection boxes drawn onto frames for display and recording.

use crate::detect::ThreatDetection;
use crate::frame::{FaceRect, Frame, Rgb};
use crate::profiles::{AccessLevel, DetectionResult};

pub const GREEN: Rgb = [0, 255, 0];
pub const YELLOW: Rgb = [255, 255, 0];
pub const RED: Rgb = [255, 0, 0];

const FACE_THICKNESS: u32 = 2;
const THREAT_THICKNESS: u32 = 3;

pub fn face_color(result: &DetectionResult) -> Rgb {
    match result.profile().access_level() {
        AccessLevel::Full => GREEN,
        AccessLevel::Partial => YELLOW,
        AccessLevel::Denied | AccessLevel::Other => RED,
    }
}

pub fn draw_overlays(frame: &mut Frame, faces: &[DetectionResult], threats: &[ThreatDetection]) {
    for result in faces {
        frame.draw_box(result.rect(), face_color(result), FACE_THICKNESS);
    }
    for threat in threats {
        let [x1, y1, x2, y2] = threat.bbox;
        let rect = FaceRect::new(x1, y1, x2 - x1, y2 - y1);
        frame.draw_box(&rect, RED, THREAT_THICKNESS);
    }
}
