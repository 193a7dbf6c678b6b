//! Shared primary descriptor
//!
//! A small text file, `host port`, naming the current primary. Every node reads it
//! at startup and every node that becomes primary rewrites it.

use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Location of the shared descriptor file
#[derive(Debug, Clone)]
pub struct PrimaryDescriptor {
    path: PathBuf,
}

impl PrimaryDescriptor {
    /// Descriptor stored at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Primary address as `host:port`, or `None` if the file is absent or unparsable
    pub fn read(&self) -> Option<String> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No primary descriptor");
                return None;
            }
        };
        let addr = parse(&text);
        if addr.is_none() {
            debug!(path = %self.path.display(), "Primary descriptor is unparsable");
        }
        addr
    }

    /// Point the descriptor at `host port`, replacing it atomically
    pub fn write(&self, host: &str, port: u16) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, format!("{} {}\n", host, port))?;
        fs::rename(&tmp, &self.path)?;

        info!(path = %self.path.display(), host, port, "Primary descriptor updated");
        Ok(())
    }
}

fn parse(text: &str) -> Option<String> {
    let mut fields = text.split_whitespace();
    let host = fields.next()?;
    let port: u16 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(format!("{}:{}", host, port))
}
