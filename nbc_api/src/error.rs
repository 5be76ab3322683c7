use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Serialize};
use strum_macros::IntoStaticStr;

/// A prerequisite was not met before any disk mutation was attempted: a missing tool, a missing
/// or too-small device, a device with mounted partitions, or a TPM2 requirement that cannot be
/// satisfied. Always recoverable by user action; nothing has been written yet.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PreconditionError {
    #[error("Required external tool '{tool}' was not found on PATH")]
    MissingTool { tool: &'static str },
    #[error("Device '{device}' does not exist")]
    MissingDevice { device: String },
    #[error("Device '{device}' is smaller than the required minimum of {min_bytes} bytes")]
    DeviceTooSmall { device: String, min_bytes: u64 },
    #[error("Device '{device}' has one or more mounted partitions")]
    DeviceMounted { device: String },
    #[error("TPM2 auto-unlock was requested but no TPM2 device is present")]
    TpmUnavailable,
    #[error("Another nbc installer or updater is already running on this host")]
    AlreadyLocked,
}

/// A network or stream read failed in a way that is not retried internally. The caller may retry
/// the whole operation.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum TransientIoError {
    #[error("Failed to resolve image reference '{reference}'")]
    ResolveImageReference { reference: String },
    #[error("Failed to fetch manifest digest for '{reference}'")]
    FetchDigest { reference: String },
    #[error("Failed to read layer {index} of image '{reference}'")]
    ReadLayer { reference: String, index: usize },
}

/// Extraction or configuration produced a root filesystem that cannot be trusted to boot. Fatal
/// for the slot being built; the other slot, if any, is untouched.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrityError {
    #[error("Extraction verification failed: '{path}' {reason}")]
    ExtractionVerification { path: String, reason: String },
    #[error("No kernel found under /usr/lib/modules in the target root")]
    MissingKernel,
    #[error("Layer {index} failed to apply: {reason}")]
    LayerApplication { index: usize, reason: String },
}

/// The on-disk state cannot be trusted to be consistent and is not recoverable without wiping
/// the device.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptionError {
    #[error("Partition table on '{device}' could not be re-read after partitioning")]
    PartitionTableUnreadable { device: String },
    #[error("LUKS2 device '{device}' failed to open after format")]
    LuksOpenAfterFormat { device: String },
}

/// The operation was cancelled by an external signal.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CancellationError {
    #[error("Operation cancelled before step '{step}'")]
    CancelledBeforeStep { step: &'static str },
    #[error("Operation cancelled while extracting layer {index}")]
    CancelledDuringExtraction { index: usize },
}

/// User-supplied configuration is self-contradictory and was rejected before any mutation.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum MisconfigurationError {
    #[error("Both an image reference and a local image path were provided")]
    ImageRefAndLocalImage,
    #[error("Both a target device and a loopback image path were provided")]
    DeviceAndLoopback,
    #[error("Neither a target device nor a loopback image path were provided")]
    NoTarget,
    #[error("Unsupported root filesystem type '{filesystem}'")]
    UnsupportedFilesystem { filesystem: String },
    #[error("Loopback image size {requested_bytes} is below the minimum of {min_bytes} bytes")]
    LoopbackTooSmall {
        requested_bytes: u64,
        min_bytes: u64,
    },
    #[error("No image reference was provided")]
    NoImageReference,
    #[error("Encryption was requested but no passphrase was provided")]
    EncryptionRequiresPassphrase,
}

/// Subprocess invocation failed (bucketed under Internal per the error-kind taxonomy, but kept as
/// its own enum so the tool name and stderr excerpt are structured).
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SubprocessError {
    #[error("Command '{tool}' failed: {stderr_excerpt}")]
    CommandFailed {
        tool: String,
        stderr_excerpt: String,
    },
    #[error("Failed to spawn command '{tool}'")]
    Spawn { tool: String },
}

/// An uncategorized error occurred or a bug was encountered.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
}

/// Each variant of `ErrorKind` corresponds to a category named in the error taxonomy. The
/// categories are intended to be user-meaningful: they tell the operator whether retrying,
/// fixing input, or re-wiping the disk is the right next step.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    TransientIo(#[from] TransientIoError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
    #[error(transparent)]
    Cancellation(#[from] CancellationError),
    #[error(transparent)]
    Misconfiguration(#[from] MisconfigurationError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct NbcErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

/// The crate-wide structured error type. Carries a category (`ErrorKind`), an optional
/// `anyhow`-style cause chain, and a stack of human-readable context messages each tagged with
/// the call site that attached them.
pub struct NbcError(Box<NbcErrorInner>);

impl NbcError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        NbcError(Box::new(NbcErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: NbcError) -> Self {
        self.0.context.push((format!(
            "While handling the error, an additional error was caught during cleanup: \n\n{secondary:?}\n\nThe earlier error:"
        ).into(), Location::caller()));
        self
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured `NbcError` tagged with `kind`.
    fn structured(self, kind: K) -> Result<T, NbcError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, NbcError> {
        match self {
            Some(t) => Ok(t),
            None => Err(NbcError(Box::new(NbcErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, NbcError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(NbcError(Box::new(NbcErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait NbcResultExt<T> {
    /// Attach a context message to the error without changing its category.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, NbcError>;

    /// Drop the structured category, keeping only the message chain.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}

impl<T> NbcResultExt<T> for Result<T, NbcError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, NbcError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl std::fmt::Display for NbcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.kind)
    }
}

impl std::error::Error for NbcError {}

impl Serialize for NbcError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("nbc-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Precondition(ref e) => state.serialize_field("error", e)?,
            ErrorKind::TransientIo(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Integrity(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Corruption(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Cancellation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Misconfiguration(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for NbcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = NbcError(Box::new(NbcErrorInner {
            kind: ErrorKind::Precondition(PreconditionError::MissingDevice {
                device: "/dev/sdx".into(),
            }),
            location: Location::caller(),
            source: Some(
                std::fs::read("/non-existant-file")
                    .context("failed to read file")
                    .unwrap_err(),
            ),
            context: Vec::new(),
        }));
        let value = serde_json::to_value(e).unwrap();
        assert_eq!(value["category"], "precondition");
        assert_eq!(value["message"], "Device '/dev/sdx' does not exist");
        assert!(value["location"].as_str().unwrap().contains("error.rs:"));
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_message_context() {
        let error = Err::<(), _>(anyhow::anyhow!("boom"))
            .structured(PreconditionError::TpmUnavailable)
            .message("enrolling TPM2 for root1")
            .unwrap_err();
        assert!(format!("{:?}", error).contains("enrolling TPM2 for root1"));
    }
}
