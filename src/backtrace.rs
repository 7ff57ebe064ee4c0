//! Collecting walks into frame lists.
//!
//! `FrameBuffer` is the visitor to use when the frames are needed after the
//! walk: it records into storage reserved up front, so the walk itself never
//! allocates. `WalkReport` turns a filled buffer into something printable or
//! JSON, outside of the walk.

use std::fmt;

use nanoserde::SerJson;

use crate::code_info::FrameKind;
use crate::visitor::{FrameRef, StackFrameVisitor, Uninterruptible, UnknownFrame, WalkOutcome};
use crate::walker::PhysicalFrame;

/// One visited logical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub sp: usize,
    pub ip: usize,
    pub kind: FrameKind,
    pub total_frame_size: usize,
    pub pending_lazy_deopt: bool,
    /// Set for virtual frames of a deoptimized frame: method, bci, depth.
    pub virtual_frame: Option<(u32, i32, usize)>,
}

impl FrameRecord {
    fn from_frame(frame: FrameRef<'_>) -> Self {
        let physical = frame.physical();
        let virtual_frame = match frame {
            FrameRef::Virtual { frame, depth, .. } => {
                Some((frame.frame_info.method_id, frame.frame_info.bci, depth))
            }
            FrameRef::Compiled(_) => None,
        };
        FrameRecord {
            sp: physical.sp(),
            ip: physical.ip(),
            kind: physical.kind(),
            total_frame_size: physical.total_frame_size(),
            pending_lazy_deopt: physical.has_pending_lazy_deopt(),
            virtual_frame,
        }
    }
}

#[derive(Debug)]
pub struct FrameBuffer {
    records: Vec<FrameRecord>,
    limit: usize,
    truncated: bool,
    unknown: Option<UnknownFrame>,
}

impl FrameBuffer {
    /// A buffer holding at most `capacity` frames. When full, it stops the
    /// walk and marks itself truncated.
    pub fn with_capacity(capacity: usize) -> Self {
        FrameBuffer {
            records: Vec::with_capacity(capacity),
            limit: capacity,
            truncated: false,
            unknown: None,
        }
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn unknown_frame(&self) -> Option<UnknownFrame> {
        self.unknown
    }

    /// Forget recorded frames, keeping the reserved storage.
    pub fn clear(&mut self) {
        self.records.clear();
        self.truncated = false;
        self.unknown = None;
    }

    pub fn report(&self, outcome: WalkOutcome) -> WalkReport {
        WalkReport {
            outcome: match outcome {
                WalkOutcome::Completed => "completed",
                WalkOutcome::StoppedByVisitor => "stopped",
                WalkOutcome::StructuralFailure(_) => "unknown-frame",
            }
            .to_string(),
            truncated: self.truncated,
            frames: self.records.iter().map(ReportFrame::from).collect(),
            unknown_frame: self.unknown.map(|frame| ReportUnknownFrame {
                sp: hex(frame.sp),
                ip: hex(frame.ip),
            }),
        }
    }
}

impl StackFrameVisitor for FrameBuffer {
    fn visit_frame(&mut self, frame: FrameRef<'_>, _scope: &Uninterruptible) -> bool {
        if self.records.len() >= self.limit {
            self.truncated = true;
            return false;
        }
        self.records.push(FrameRecord::from_frame(frame));
        true
    }

    fn visit_unknown_frame(&mut self, frame: &PhysicalFrame<'_>, _scope: &Uninterruptible) {
        self.unknown = Some(UnknownFrame {
            sp: frame.sp(),
            ip: frame.ip(),
        });
    }
}

fn hex(value: usize) -> String {
    format!("{:#x}", value)
}

#[derive(Debug, Clone, PartialEq, SerJson)]
pub struct ReportFrame {
    pub sp: String,
    pub ip: String,
    pub kind: String,
    pub size: usize,
    pub lazy_deopt: bool,
    pub method_id: Option<u32>,
    pub bci: Option<i32>,
    pub virtual_depth: Option<usize>,
}

impl From<&FrameRecord> for ReportFrame {
    fn from(record: &FrameRecord) -> Self {
        ReportFrame {
            sp: hex(record.sp),
            ip: hex(record.ip),
            kind: record.kind.to_string(),
            size: record.total_frame_size,
            lazy_deopt: record.pending_lazy_deopt,
            method_id: record.virtual_frame.map(|(method_id, _, _)| method_id),
            bci: record.virtual_frame.map(|(_, bci, _)| bci),
            virtual_depth: record.virtual_frame.map(|(_, _, depth)| depth),
        }
    }
}

#[derive(Debug, Clone, PartialEq, SerJson)]
pub struct ReportUnknownFrame {
    pub sp: String,
    pub ip: String,
}

/// A finished walk, ready to print.
#[derive(Debug, Clone, PartialEq, SerJson)]
pub struct WalkReport {
    pub outcome: String,
    pub truncated: bool,
    pub frames: Vec<ReportFrame>,
    pub unknown_frame: Option<ReportUnknownFrame>,
}

impl WalkReport {
    pub fn to_json(&self) -> String {
        self.serialize_json()
    }
}

impl fmt::Display for WalkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, frame) in self.frames.iter().enumerate() {
            write!(
                f,
                "#{:<3} sp={} ip={} {:<8} size={}",
                index, frame.sp, frame.ip, frame.kind, frame.size
            )?;
            if let (Some(method_id), Some(bci), Some(depth)) =
                (frame.method_id, frame.bci, frame.virtual_depth)
            {
                write!(f, " virtual[{}] method={} bci={}", depth, method_id, bci)?;
            }
            if frame.lazy_deopt {
                write!(f, " (lazy deopt pending)")?;
            }
            writeln!(f)?;
        }
        if let Some(unknown) = &self.unknown_frame {
            writeln!(f, "unknown frame at sp={} ip={}", unknown.sp, unknown.ip)?;
        }
        write!(f, "{} frame(s), {}", self.frames.len(), self.outcome)?;
        if self.truncated {
            write!(f, " (truncated)")?;
        }
        Ok(())
    }
}
