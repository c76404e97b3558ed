//! Deterministic mock image processor.
//!
//! Stands in for a real codec in tests and development wiring: it writes a
//! small placeholder JPEG, reports dimensions as if the source were a
//! 4000x3000 frame fitted inside the requested box, and rejects extensions
//! outside its supported set the way a real decoder rejects formats it
//! cannot parse.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::{
    DerivativeOutcome, DerivativeOutput, DerivativeSpec, ImageProcessor, MediaError, Result,
};

/// Pretend source dimensions used for fit-inside math.
const SOURCE_W: u32 = 4000;
const SOURCE_H: u32 = 3000;

pub struct MockProcessor {
    supported: HashSet<String>,
    processed: AtomicU64,
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self::new(["jpg", "jpeg", "png"])
    }
}

impl MockProcessor {
    pub fn new<I, S>(supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported: supported.into_iter().map(|s| s.into()).collect(),
            processed: AtomicU64::new(0),
        }
    }

    /// Number of successful process calls, for assertions in tests.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn is_supported(&self, source: &Path) -> bool {
        source
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.supported.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Fit 4000x3000 inside `max_dim`, never enlarging.
    fn fitted(max_dim: u32) -> (u32, u32) {
        if max_dim >= SOURCE_W {
            return (SOURCE_W, SOURCE_H);
        }
        let w = max_dim;
        let h = ((max_dim as u64 * SOURCE_H as u64) / SOURCE_W as u64) as u32;
        (w, h.max(1))
    }

    fn placeholder_jpeg(spec: &DerivativeSpec, width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]); // SOI + APP0
        bytes.extend_from_slice(b"LUMEN");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.push(spec.clamped_quality());
        bytes.extend_from_slice(&[0xFF, 0xD9]); // EOI
        bytes
    }
}

#[async_trait]
impl ImageProcessor for MockProcessor {
    async fn process(
        &self,
        source: &Path,
        specs: &[DerivativeSpec],
    ) -> Result<Vec<DerivativeOutcome>> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(MediaError::NotFound(source.to_path_buf()));
        }

        let supported = self.is_supported(source);
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            if !supported {
                outcomes.push(DerivativeOutcome {
                    kind: spec.kind,
                    result: Err(MediaError::Unsupported(
                        source.to_string_lossy().into_owned(),
                    )),
                });
                continue;
            }
            let (width, height) = Self::fitted(spec.max_dim);
            let bytes = Self::placeholder_jpeg(spec, width, height);
            if let Some(parent) = spec.output_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&spec.output_path, &bytes).await?;
            outcomes.push(DerivativeOutcome {
                kind: spec.kind,
                result: Ok(DerivativeOutput {
                    kind: spec.kind,
                    width,
                    height,
                    size_bytes: bytes.len() as u64,
                    format: "jpeg",
                }),
            });
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(outcomes)
    }
}
