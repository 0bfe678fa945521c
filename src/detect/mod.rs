mod backend;
mod backends;
mod result;

pub use backend::{FaceDetector, FaceEncoder, ThreatDetector};
pub use backends::{
    build_local_backends, LocalBackends, PatchEncoder, SkinRegionDetector, StubFaceDetector,
    StubThreatDetector,
};
#[cfg(feature = "backend-tract")]
pub use backends::{TractFaceDetector, TractThreatDetector};
pub use result::{Signature, ThreatDetection};
