use std::error::Error;
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkError {
    AnchorOverflow {
        capacity: usize,
    },
    AnchorUnderflow,
    NotOwner {
        thread: String,
    },
    CorruptAnchor {
        index: usize,
        reason: &'static str,
    },
    InvalidStatusTransition {
        from: &'static str,
        to: &'static str,
    },
    MemoryMapping(String),
    InvalidLayout {
        reason: String,
    },
    UninitializedContinuation,
    Snapshot(String),
    Io(String),
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkError::AnchorOverflow { capacity } => {
                write!(f, "Frame anchor arena is full ({} anchors)", capacity)
            }
            WalkError::AnchorUnderflow => write!(f, "Popped a frame anchor from an empty chain"),
            WalkError::NotOwner { thread } => {
                write!(
                    f,
                    "Frame anchors of thread {} can only be changed by that thread",
                    thread
                )
            }
            WalkError::CorruptAnchor { index, reason } => {
                write!(f, "Frame anchor #{} is corrupt: {}", index, reason)
            }
            WalkError::InvalidStatusTransition { from, to } => {
                write!(f, "Invalid thread status transition {} -> {}", from, to)
            }
            WalkError::MemoryMapping(msg) => write!(f, "Memory mapping error: {}", msg),
            WalkError::InvalidLayout { reason } => write!(f, "Invalid stack layout: {}", reason),
            WalkError::UninitializedContinuation => {
                write!(f, "Continuation has no frames to walk")
            }
            WalkError::Snapshot(msg) => write!(f, "Snapshot error: {}", msg),
            WalkError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl Error for WalkError {}

impl From<std::io::Error> for WalkError {
    fn from(err: std::io::Error) -> Self {
        WalkError::Io(err.to_string())
    }
}

impl From<mmap_rs::Error> for WalkError {
    fn from(err: mmap_rs::Error) -> Self {
        WalkError::MemoryMapping(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for WalkError {
    fn from(err: bincode::error::EncodeError) -> Self {
        WalkError::Snapshot(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for WalkError {
    fn from(err: bincode::error::DecodeError) -> Self {
        WalkError::Snapshot(err.to_string())
    }
}

/// Report an unrecoverable runtime condition and abort the process.
///
/// Does not allocate: the message is written piecewise to the locked stderr
/// handle, so this is usable from the walk path and from fault handlers.
pub fn fatal_error(message: &str, sp: usize, ip: usize) -> ! {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "[FATAL] {}", message);
    let _ = writeln!(out, "[FATAL]   sp={:#x} ip={:#x}", sp, ip);
    let _ = out.flush();
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_details() {
        let err = WalkError::AnchorOverflow { capacity: 64 };
        assert_eq!(err.to_string(), "Frame anchor arena is full (64 anchors)");

        let err = WalkError::CorruptAnchor {
            index: 3,
            reason: "bad magic",
        };
        assert!(err.to_string().contains("#3"));
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.bin");
        let err: WalkError = io.into();
        assert!(matches!(err, WalkError::Io(ref msg) if msg.contains("missing.bin")));
    }
}
