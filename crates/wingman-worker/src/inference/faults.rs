//! Fault signatures recognised in engine and service output.
//!
//! Each rule pairs a signature with a category and the action the supervisor
//! takes. Rules are checked in order; the first match wins.

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultCategory {
    OutOfMemory,
    InferenceStartFailed,
    GpuCommandBuffer,
    MissingLibrary,
    IllegalInstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultAction {
    /// Mark the job failed and kill the process. No restart.
    FlagLoadFailure,
    /// Kill, run the reset executable, then restart the same job.
    ForcedReset,
    /// The executable cannot run on this machine at all.
    ReportFatal,
}

pub enum Signature {
    Contains(&'static str),
    /// Every fragment must appear in the line.
    AllOf(&'static [&'static str]),
    Pattern(Regex),
}

impl Signature {
    fn matches(&self, line: &str) -> bool {
        match self {
            Signature::Contains(needle) => line.contains(needle),
            Signature::AllOf(needles) => needles.iter().all(|n| line.contains(n)),
            Signature::Pattern(re) => re.is_match(line),
        }
    }
}

pub struct FaultRule {
    pub category: FaultCategory,
    pub action: FaultAction,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultMatch {
    pub category: FaultCategory,
    pub action: FaultAction,
    pub line: String,
}

fn rule(category: FaultCategory, action: FaultAction, signature: Signature) -> FaultRule {
    FaultRule {
        category,
        action,
        signature,
    }
}

fn fatal_rules() -> Vec<FaultRule> {
    use FaultAction::ReportFatal;
    use FaultCategory::{IllegalInstruction, MissingLibrary};
    vec![
        rule(MissingLibrary, ReportFatal, Signature::Contains("error while loading shared libraries")),
        rule(MissingLibrary, ReportFatal, Signature::Contains("Library not loaded")),
        rule(MissingLibrary, ReportFatal, Signature::AllOf(&[".dll", "was not found"])),
        rule(IllegalInstruction, ReportFatal, Signature::Contains("Illegal instruction")),
        rule(IllegalInstruction, ReportFatal, Signature::Contains("illegal hardware instruction")),
        rule(IllegalInstruction, ReportFatal, Signature::Contains("STATUS_ILLEGAL_INSTRUCTION")),
    ]
}

lazy_static::lazy_static! {
    /// Rules applied to inference engine output.
    pub static ref INFERENCE_FAULTS: Vec<FaultRule> = {
        use FaultAction::{FlagLoadFailure, ForcedReset};
        use FaultCategory::{GpuCommandBuffer, InferenceStartFailed, OutOfMemory};
        let mut rules = vec![
            rule(
                GpuCommandBuffer,
                ForcedReset,
                Signature::Pattern(
                    Regex::new(r"command buffer (\d+) failed with status (\d+)").unwrap(),
                ),
            ),
            rule(OutOfMemory, FlagLoadFailure, Signature::Contains("out of memory")),
            rule(OutOfMemory, FlagLoadFailure, Signature::Contains("failed to allocate")),
            rule(OutOfMemory, FlagLoadFailure, Signature::Contains("ErrorOutOfDeviceMemory")),
            rule(InferenceStartFailed, FlagLoadFailure, Signature::Contains("return code 1024")),
            rule(InferenceStartFailed, FlagLoadFailure, Signature::Contains("exited with code 1024")),
        ];
        rules.extend(fatal_rules());
        rules
    };

    /// Rules applied to the orchestration service's output by the launcher.
    pub static ref SERVICE_FAULTS: Vec<FaultRule> = fatal_rules();
}

/// First rule in `rules` matching `line`.
pub fn detect_fault(line: &str, rules: &[FaultRule]) -> Option<FaultMatch> {
    rules
        .iter()
        .find(|rule| rule.signature.matches(line))
        .map(|rule| FaultMatch {
            category: rule.category,
            action: rule.action,
            line: line.trim().to_string(),
        })
}
