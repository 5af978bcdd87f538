//! Binary-to-text binlog decoding.
//!
//! The actual decoding is an external collaborator (the stock MySQL binlog
//! text decoder); the server pipes raw bytes through it and parses its
//! stdout. `Passthrough` is for inputs that are already text.

use std::path::PathBuf;
use std::process::Stdio;

use oxherd_errors::{OxherdError, OxherdResult};
use tokio::io::{AsyncRead, DuplexStream};
use tokio::process::Command;
use tracing::warn;

/// How raw binlog bytes become parseable text.
#[derive(Clone, Debug, Default)]
pub enum TextDecoder {
    /// The input is already text (fixtures, pre-decoded feeds).
    #[default]
    Passthrough,
    /// Pipe through an external decoder binary (stdin -> stdout).
    Command(PathBuf),
}

impl TextDecoder {
    /// Wire the decoder between the raw byte stream and the parser.
    pub fn attach(
        &self,
        raw: DuplexStream,
    ) -> OxherdResult<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            TextDecoder::Passthrough => Ok(Box::new(raw)),
            TextDecoder::Command(path) => {
                let mut child = Command::new(path)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .spawn()
                    .map_err(|e| {
                        OxherdError::Io(format!("cannot spawn decoder {}: {e}", path.display()))
                    })?;
                let mut stdin = child.stdin.take().ok_or_else(|| {
                    OxherdError::Io("decoder child has no stdin".to_owned())
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    OxherdError::Io("decoder child has no stdout".to_owned())
                })?;
                let mut raw = raw;
                tokio::spawn(async move {
                    if let Err(e) = tokio::io::copy(&mut raw, &mut stdin).await {
                        warn!(%e, "feeding binlog decoder failed");
                    }
                    drop(stdin);
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            warn!(%status, "binlog decoder exited with failure");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(%e, "waiting for binlog decoder failed"),
                    }
                });
                Ok(Box::new(stdout))
            }
        }
    }
}
