//! Remote collaborators: the cloud face-detection capability, the handle
//! bundle the loop and monitor share, and the reachability probe.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RemoteSettings;
use crate::frame::{FaceRect, Frame};
use crate::storage::{BlobStore, FsBlobStore, SqliteTableStore, TableStore};

const DETECT_PATH: &str = "face/v1.0/detect?returnFaceId=false";
const SUBSCRIPTION_HEADER: &str = "Ocp-Apim-Subscription-Key";
const UPLOAD_JPEG_QUALITY: u8 = 90;

/// Remote face detection. Implementations must bound every call by a
/// timeout; a timeout is reported as an error.
pub trait RemoteFaceService: Send + Sync {
    fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceRect>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectedFace {
    face_rectangle: FaceRectangle,
}

#[derive(Debug, Deserialize)]
struct FaceRectangle {
    left: i32,
    top: i32,
    width: i32,
    height: i32,
}

/// Face detection over HTTP: the frame is posted as JPEG, the response is a
/// JSON list of `{faceRectangle: {left, top, width, height}}`.
pub struct HttpFaceClient {
    agent: ureq::Agent,
    url: String,
    key: String,
}

impl HttpFaceClient {
    pub fn new(endpoint: &str, key: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: format!("{}/{}", endpoint.trim_end_matches('/'), DETECT_PATH),
            key: key.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn parse_detect_response(body: &str) -> Result<Vec<FaceRect>> {
    let faces: Vec<DetectedFace> =
        serde_json::from_str(body).context("invalid face detection response")?;
    Ok(faces
        .into_iter()
        .map(|f| {
            let r = f.face_rectangle;
            FaceRect::new(r.left, r.top, r.width, r.height)
        })
        .collect())
}

impl RemoteFaceService for HttpFaceClient {
    fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceRect>> {
        let jpeg = frame.encode_jpeg(UPLOAD_JPEG_QUALITY)?;
        let response = self
            .agent
            .post(&self.url)
            .set(SUBSCRIPTION_HEADER, &self.key)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(&jpeg)
            .map_err(|e| anyhow!("face detection request failed: {}", e))?;
        let body = response
            .into_string()
            .context("failed to read face detection response")?;
        parse_detect_response(&body)
    }
}

/// Remote references swapped in and out as a unit under the shared lock.
#[derive(Clone)]
pub struct RemoteHandles {
    pub faces: Arc<dyn RemoteFaceService>,
    pub blobs: Arc<dyn BlobStore>,
    pub tables: Arc<dyn TableStore>,
}

/// Establishes a fresh set of remote handles.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self) -> Result<RemoteHandles>;
}

/// Builds handles from configuration: an HTTP face client, a filesystem blob
/// store rooted at the storage share, and the SQLite incident table.
pub struct StorageConnector {
    settings: RemoteSettings,
}

impl StorageConnector {
    pub fn new(settings: RemoteSettings) -> Self {
        Self { settings }
    }
}

impl RemoteConnector for StorageConnector {
    fn connect(&self) -> Result<RemoteHandles> {
        let endpoint = self
            .settings
            .face_endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("remote face endpoint is not configured"))?;
        let key = self
            .settings
            .face_key
            .as_deref()
            .ok_or_else(|| anyhow!("remote face key is not configured"))?;

        let blobs = FsBlobStore::new(&self.settings.storage_root);
        blobs
            .ping(self.settings.capability_timeout)
            .context("storage check failed")?;
        let tables = SqliteTableStore::open(&self.settings.table_db_path)
            .context("failed to open incident table")?;
        let faces = HttpFaceClient::new(endpoint, key, self.settings.capability_timeout);

        Ok(RemoteHandles {
            faces: Arc::new(faces),
            blobs: Arc::new(blobs),
            tables: Arc::new(tables),
        })
    }
}

/// Network reachability check.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self, timeout: Duration) -> bool;
}

/// Reachable when a TCP connection to `addr` opens within the timeout.
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self { addr: addr.into() }
    }
}

impl Reachability for TcpProbe {
    fn is_reachable(&self, timeout: Duration) -> bool {
        let addrs = match self.addr.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                log::debug!("probe: cannot resolve {}: {}", self.addr, err);
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, timeout).is_ok() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn parses_face_rectangles() -> Result<()> {
        let body = r#"[
            {"faceRectangle": {"top": 40, "left": 10, "width": 80, "height": 90}},
            {"faceRectangle": {"top": 0, "left": 200, "width": 50, "height": 50}, "faceId": "x"}
        ]"#;
        let rects = parse_detect_response(body)?;
        assert_eq!(rects, vec![FaceRect::new(10, 40, 80, 90), FaceRect::new(200, 0, 50, 50)]);
        assert!(parse_detect_response("[]")?.is_empty());
        assert!(parse_detect_response("{\"error\": {}}").is_err());
        Ok(())
    }

    #[test]
    fn client_url_joins_endpoint() {
        let client = HttpFaceClient::new("https://faces.example/", "k", Duration::from_secs(1));
        assert_eq!(
            client.url(),
            "https://faces.example/face/v1.0/detect?returnFaceId=false"
        );
    }

    #[test]
    fn tcp_probe_detects_listener() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        assert!(TcpProbe::new(addr.to_string()).is_reachable(Duration::from_millis(500)));

        drop(listener);
        assert!(!TcpProbe::new("not a socket address").is_reachable(Duration::from_millis(50)));
        Ok(())
    }

    #[test]
    fn connector_requires_endpoint() {
        let settings = RemoteSettings {
            face_endpoint: None,
            face_key: Some("k".into()),
            storage_root: std::env::temp_dir(),
            table_db_path: ":memory:".into(),
            profile_container: "profiles".into(),
            image_container: "images".into(),
            incident_container: "incidents".into(),
            incident_table: "Incidents".into(),
            capability_timeout: Duration::from_secs(1),
        };
        let err = StorageConnector::new(settings).connect().err().unwrap();
        assert!(err.to_string().contains("endpoint"));
    }
}
