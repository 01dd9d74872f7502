//! Heuristic research-phase detection from subprocess output.
//!
//! Progress annotation only: the exit code alone decides success or failure.

use serde::Serialize;

/// A research phase recognised in subprocess output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Phase {
    pub number: u8,
    pub name: &'static str,
}

struct PhaseSignature {
    phase: Phase,
    patterns: &'static [&'static str],
}

const fn signature(number: u8, name: &'static str, patterns: &'static [&'static str]) -> PhaseSignature {
    PhaseSignature {
        phase: Phase { number, name },
        patterns,
    }
}

/// Ordered table; the first phase with a matching pattern wins.
const PHASE_SIGNATURES: &[PhaseSignature] = &[
    signature(
        1,
        "Company Discovery",
        &["company discovery", "company overview", "websearch", "fetching https://"],
    ),
    signature(2, "Market Position", &["market position", "competitor", "g2.com", "capterra"]),
    signature(
        3,
        "Technographic Analysis",
        &["technographic", "stackshare", "builtwith", "tech stack"],
    ),
    signature(4, "Financial Intelligence", &["financial", "funding", "crunchbase", "revenue"]),
    signature(5, "Pain Point Analysis", &["pain point", "challenges", "glassdoor"]),
    signature(
        6,
        "Contact Discovery",
        &["contact discovery", "decision maker", "linkedin", "leadership"],
    ),
    signature(
        7,
        "POC Recommendations",
        &["poc recommendation", "recommending", "scoring relevance"],
    ),
    signature(
        8,
        "Output Generation",
        &["output generation", "creating", "writing to", "prospects/", "pdf"],
    ),
];

/// Match a chunk of output against the phase table (case-insensitive).
pub fn detect_phase(text: &str) -> Option<Phase> {
    let lower = text.to_lowercase();
    PHASE_SIGNATURES
        .iter()
        .find(|sig| sig.patterns.iter().any(|p| lower.contains(p)))
        .map(|sig| sig.phase)
}
