//! Descriptor oracle seam.
//!
//! The face-embedding network is an external collaborator. The core only
//! needs one call from it: give me the descriptor of the face in this
//! image, or tell me there is none.

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::types::Descriptor;
use async_trait::async_trait;
use image::DynamicImage;
use serde::Deserialize;
use std::io::Cursor;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Descriptor of the largest face in an image, plus how many faces were seen.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub descriptor: Descriptor,
    pub face_count: usize,
}

#[async_trait]
pub trait DescriptorOracle: Send + Sync {
    /// `Ok(None)` means no detectable face.
    async fn extract(&self, image: &DynamicImage) -> Result<Option<Extraction>, OracleError>;
}

/// Placeholder used when no oracle is configured; every call faults.
pub struct UnconfiguredOracle;

#[async_trait]
impl DescriptorOracle for UnconfiguredOracle {
    async fn extract(&self, _image: &DynamicImage) -> Result<Option<Extraction>, OracleError> {
        Err(OracleError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct OracleResponse {
    faces: Vec<FaceRecord>,
}

#[derive(Debug, Deserialize)]
struct FaceRecord {
    descriptor: Vec<f32>,
    /// Face box area in pixels; used to pick the dominant face.
    #[serde(default)]
    area: f32,
}

/// Oracle backed by an external program.
///
/// The program receives the image as PNG on stdin and must print
/// `{"faces": [{"descriptor": [...], "area": 1234.0}, ...]}` on stdout.
/// An empty `faces` array means no face was detected.
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Build from configuration; `None` when no command is configured.
    pub fn from_config(config: &OracleConfig) -> Option<Self> {
        let program = config.command.as_ref()?;
        Some(Self::new(
            program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    async fn run(&self, png: Vec<u8>) -> Result<Vec<u8>, OracleError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OracleError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OracleError::Unavailable("oracle stdin not captured".into()))?;

        let writer = async move {
            let result = stdin.write_all(&png).await;
            drop(stdin);
            result
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());

        let output = output.map_err(|source| OracleError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(OracleError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if let Err(e) = written {
            // The program answered without consuming the whole image.
            tracing::debug!(program = %self.program, error = %e, "oracle closed stdin early");
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl DescriptorOracle for CommandOracle {
    async fn extract(&self, image: &DynamicImage) -> Result<Option<Extraction>, OracleError> {
        let png = encode_png(image)?;
        let stdout = tokio::time::timeout(self.timeout, self.run(png))
            .await
            .map_err(|_| OracleError::Timeout(self.timeout))??;
        parse_response(&stdout)
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, OracleError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Pick the largest face; equal areas resolve to the earliest entry.
fn parse_response(stdout: &[u8]) -> Result<Option<Extraction>, OracleError> {
    let response: OracleResponse =
        serde_json::from_slice(stdout).map_err(|e| OracleError::Malformed(e.to_string()))?;

    let face_count = response.faces.len();
    let mut largest: Option<FaceRecord> = None;
    for face in response.faces {
        if face.descriptor.is_empty() {
            return Err(OracleError::Malformed("empty descriptor".into()));
        }
        if largest.as_ref().map_or(true, |best| face.area > best.area) {
            largest = Some(face);
        }
    }

    Ok(largest.map(|face| Extraction {
        descriptor: Descriptor::new(face.descriptor),
        face_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn probe() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([128])))
    }

    #[test]
    fn test_parse_no_faces() {
        assert_eq!(parse_response(br#"{"faces": []}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_picks_largest_face() {
        let json = br#"{"faces": [
            {"descriptor": [0.1, 0.2], "area": 100.0},
            {"descriptor": [0.3, 0.4], "area": 900.0},
            {"descriptor": [0.5, 0.6], "area": 900.0}
        ]}"#;
        let extraction = parse_response(json).unwrap().unwrap();
        assert_eq!(extraction.face_count, 3);
        assert_eq!(extraction.descriptor.values, vec![0.3, 0.4]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_response(b"segfault"), Err(OracleError::Malformed(_))));
        assert!(matches!(
            parse_response(br#"{"faces": [{"descriptor": []}]}"#),
            Err(OracleError::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_png_signature() {
        let png = encode_png(&probe()).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_from_config_requires_command() {
        assert!(CommandOracle::from_config(&OracleConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_command_oracle_reads_stdout() {
        let oracle = CommandOracle::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"faces": [{"descriptor": [1.0, 0.0], "area": 10}]}'"#.into(),
            ],
            Duration::from_secs(5),
        );
        let extraction = oracle.extract(&probe()).await.unwrap().unwrap();
        assert_eq!(extraction.face_count, 1);
        assert_eq!(extraction.descriptor.values, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_command_oracle_failure_is_reported() {
        let oracle = CommandOracle::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; echo 'model missing' >&2; exit 3".into()],
            Duration::from_secs(5),
        );
        match oracle.extract(&probe()).await {
            Err(OracleError::Failed { stderr, .. }) => assert_eq!(stderr, "model missing"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_command_oracle_missing_program() {
        let oracle = CommandOracle::new("/nonexistent/face-oracle", vec![], Duration::from_secs(1));
        assert!(matches!(
            oracle.extract(&probe()).await,
            Err(OracleError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_command_oracle_timeout() {
        let oracle = CommandOracle::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );
        assert!(matches!(
            oracle.extract(&probe()).await,
            Err(OracleError::Timeout(_))
        ));
    }
}
