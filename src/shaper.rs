//! Request shaping: complexity classification and context-size analysis.
//!
//! Both are pure functions of the request JSON, so the same request always
//! gets the same class, deadline, and delivery decision.

use crate::config::{Config, ContextMode};
use crate::types::{Classification, Complexity, ContextAnalysis, Request};

struct Signal {
    name: &'static str,
    weight: u32,
    needles: &'static [&'static str],
}

const KEYWORD_SIGNALS: &[Signal] = &[
    Signal {
        name: "spawning",
        weight: 4,
        needles: &["spawn", "coordinate", "delegate", "parallel", "multi-agent"],
    },
    Signal {
        name: "research",
        weight: 3,
        needles: &["research", "analyze", "investigate", "explore", "search"],
    },
    Signal {
        name: "implementation",
        weight: 3,
        needles: &["implement", "create", "build", "develop", "code"],
    },
    Signal {
        name: "multi-step",
        weight: 2,
        needles: &["then", "after", "next", "finally", "step", "phase"],
    },
    Signal {
        name: "file-ops",
        weight: 2,
        needles: &["read", "write", "create", "modify", "edit", "save", "delete"],
    },
    Signal {
        name: "testing",
        weight: 2,
        needles: &["test", "verify", "validate", "check", "run tests"],
    },
];

const MANY_REQUIREMENTS_THRESHOLD: usize = 3;
const LARGE_CONTEXT_CHARS: usize = 1000;

fn serialized_context_chars(req: &Request) -> usize {
    serde_json::to_string(&req.task.context)
        .map(|s| s.chars().count())
        .unwrap_or(0)
}

/// Sum the weighted signals for a request. Each signal counts once no matter
/// how many of its needles match.
pub fn complexity_score(req: &Request) -> u32 {
    let objective = req.task.objective.to_lowercase();
    let mut score = 0;

    for signal in KEYWORD_SIGNALS {
        if signal.needles.iter().any(|n| objective.contains(n)) {
            score += signal.weight;
        }
    }
    if req.task.requirements.len() > MANY_REQUIREMENTS_THRESHOLD {
        score += 2;
    }
    if serialized_context_chars(req) > LARGE_CONTEXT_CHARS {
        score += 1;
    }
    score
}

/// Names of the keyword signals that matched; used as memory-topic hints in
/// the side-context file.
pub fn matched_signals(req: &Request) -> Vec<&'static str> {
    let objective = req.task.objective.to_lowercase();
    KEYWORD_SIGNALS
        .iter()
        .filter(|s| s.needles.iter().any(|n| objective.contains(n)))
        .map(|s| s.name)
        .collect()
}

/// Map the score to a class and deadline budget. Ties go to the lower class.
pub fn classify(req: &Request, cfg: &Config) -> Classification {
    let score = complexity_score(req);
    let (class, multiplier) = if score >= 6 {
        (Complexity::Complex, 3)
    } else if score >= 3 {
        (Complexity::Moderate, 2)
    } else {
        (Complexity::Simple, 1)
    };

    let initial = cfg.initial_timeout * multiplier;
    Classification {
        class,
        score,
        initial_deadline: initial.min(cfg.max_timeout),
        max_deadline: cfg.max_timeout,
    }
}

/// Character accounting over the request; `exceeds_inline` is what the lazy
/// decision keys on.
pub fn analyze_context(req: &Request, cfg: &Config) -> ContextAnalysis {
    let context_chars = serialized_context_chars(req);
    ContextAnalysis {
        objective_chars: req.task.objective.chars().count(),
        context_chars,
        requirement_chars: req.task.requirements.iter().map(|r| r.chars().count()).sum(),
        exceeds_inline: context_chars > cfg.max_inline_context_chars,
    }
}

/// Whether this request gets the side-file treatment.
pub fn use_lazy_context(analysis: &ContextAnalysis, cfg: &Config) -> bool {
    cfg.context_mode == ContextMode::Lazy && analysis.exceeds_inline
}
