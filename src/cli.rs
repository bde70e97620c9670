//! Parsing of the `--template` and `--exec` flag values and the render
//! target they describe.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Splits a `--template` value of the form `source:target`.
///
/// # Errors
///
/// Will return `Err` if the value does not contain exactly one `:`.
pub fn parse_template_flag(flag: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = flag.split(':').collect();
    match *parts.as_slice() {
        [source, target] => Ok((source, target)),
        _ => Err(Error::TemplateFlagFormat),
    }
}

/// The template source text plus the open render target.
pub struct TemplateArg {
    pub source: String,
    pub target: Target,
}

impl TemplateArg {
    /// Reads the source template eagerly and opens the target.
    ///
    /// # Errors
    ///
    /// Will return `Err` on a malformed flag, a missing source file, or a
    /// pre-existing target file.
    pub fn from_flag(flag: &str) -> Result<Self> {
        let (source_path, target_path) = parse_template_flag(flag)?;
        let source_path = Path::new(source_path);
        if !source_path.exists() {
            return Err(Error::SourceMissing(source_path.to_owned()));
        }
        let source = std::fs::read_to_string(source_path)?;
        let target = Target::create(target_path)?;
        Ok(Self { source, target })
    }
}

/// Where rendered output goes. A file target is created fresh at startup and
/// removed again when the target is dropped.
#[derive(Debug)]
pub enum Target {
    Stdout,
    File { file: File, path: PathBuf },
}

impl Target {
    /// Opens the render target. `-` selects stdout.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the target file already exists or cannot be
    /// created.
    pub fn create(path: &str) -> Result<Self> {
        if path == "-" {
            return Ok(Self::Stdout);
        }
        let path = PathBuf::from(path);
        if path.exists() {
            return Err(Error::TargetExists(path));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self::File { file, path })
    }

    /// Replaces the target contents: truncate, rewind, write in full.
    ///
    /// # Errors
    ///
    /// Will return `Err` on any IO failure against the target.
    pub fn replace(&mut self, contents: &str) -> Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(contents.as_bytes())?;
                stdout.flush()?;
            }
            Self::File { file, .. } => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(contents.as_bytes())?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if let Self::File { path, .. } = self {
            debug!(path = %path.display(), "removing render target");
            let _ = std::fs::remove_file(path);
        }
    }
}

/// The command to supervise, split from the `--exec` flag value.
#[derive(Debug, Clone)]
pub struct ExecArg {
    pub command: String,
    pub args: Vec<String>,
}

impl ExecArg {
    /// Whitespace-splits an `--exec` value into command and arguments.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the value holds no tokens at all.
    pub fn parse(flag: &str) -> Result<Self> {
        let mut tokens = flag.split_whitespace();
        let command = tokens.next().ok_or(Error::EmptyExec)?.to_owned();
        let args = tokens.map(str::to_owned).collect();
        Ok(Self { command, args })
    }
}
