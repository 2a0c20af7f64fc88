//! Cloud-init codec and edit pipeline.
//!
//! Node cloud-init travels as base64 text with optionally gzip-compressed
//! UTF-8 inside. Decoding detects both layers; encoding always produces the
//! canonical gzip + base64 form expected by the boot process.

use std::io::{Read, Write};
use std::sync::LazyLock;

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use tracing::debug;

use crate::error::BvrError;

/// Quoted Kubernetes version strings, e.g. `'v1.32.1'`.
static QUOTED_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'v\d\.\d{2}\.\d{1,2}'").expect("valid regex"));

/// OKE node package references, e.g. `oci-oke-node-all-1.32.1*`.
static NODE_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(oci-oke-node-all-)\d\.\d{2}\.\d{1,2}(\D)").expect("valid regex"));

/// Kubernetes package repository paths, e.g. `/kubernetes-1.32/`.
static PACKAGE_REPO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\Wkubernetes-)\d\.\d{2}(\W)").expect("valid regex"));

/// A pure text transform applied to decoded cloud-init.
///
/// Steps form a closed enumeration rather than arbitrary callables; they are
/// applied in the order supplied by the caller.
#[derive(Debug, Clone)]
pub enum EditStep {
    /// Rewrite the Kubernetes version references written by the OCI OKE
    /// Terraform modules to the given version (e.g. `v1.33.1`).
    VersionSubstitution { version: String },

    /// Replace every occurrence of a literal substring.
    ReplaceSubstring { from: String, to: String },
}

impl EditStep {
    /// Apply this step to decoded cloud-init text.
    pub fn apply(&self, input: &str) -> String {
        match self {
            EditStep::VersionSubstitution { version } => {
                let bare = version.trim_start_matches('v');
                let minor = bare.split('.').take(2).collect::<Vec<_>>().join(".");

                let out = QUOTED_VERSION.replace_all(input, format!("'{}'", version).as_str());
                let out = NODE_PACKAGE.replace_all(&out, format!("${{1}}{}${{2}}", bare).as_str());
                PACKAGE_REPO
                    .replace_all(&out, format!("${{1}}{}${{2}}", minor).as_str())
                    .into_owned()
            }
            EditStep::ReplaceSubstring { from, to } => input.replace(from, to),
        }
    }
}

/// Apply all steps in order to the given plaintext.
pub fn apply_steps(input: &str, steps: &[EditStep]) -> String {
    steps
        .iter()
        .fold(input.to_string(), |text, step| step.apply(&text))
}

/// Whether the blob survives a base64 decode/re-encode round trip.
///
/// Anything that does not round-trip byte-identically is treated as
/// already-plaintext.
pub fn is_base64_encoded(blob: &str) -> bool {
    match STANDARD.decode(blob) {
        Ok(decoded) => STANDARD.encode(decoded) == blob,
        Err(_) => false,
    }
}

/// Decode a cloud-init blob into plaintext.
///
/// Handles both layers: base64 (detected via [`is_base64_encoded`]) and gzip
/// (malformed gzip means "not compressed" and the raw decoded bytes are used).
/// Non-UTF-8 content after decompression is a fatal error.
pub fn decode(blob: &str) -> Result<String> {
    if !is_base64_encoded(blob) {
        debug!("Cloud-init is not base64 encoded, using as-is");
        return Ok(blob.to_string());
    }

    let decoded = STANDARD
        .decode(blob)
        .map_err(|e| BvrError::CloudInit(format!("invalid base64: {}", e)))?;

    let mut plaintext_bytes = Vec::new();
    let bytes = match GzDecoder::new(decoded.as_slice()).read_to_end(&mut plaintext_bytes) {
        Ok(_) => plaintext_bytes,
        Err(_) => {
            debug!("Cloud-init is not gzip compressed");
            decoded
        }
    };

    String::from_utf8(bytes)
        .map_err(|_| BvrError::CloudInit("decoded cloud-init is not valid UTF-8".to_string()).into())
}

/// Encode plaintext into the canonical gzip + base64 form.
pub fn encode(text: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}
