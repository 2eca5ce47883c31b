//! Prompt construction and the lazy-context spill.
//!
//! In lazy mode an oversized request is written in full to
//! `context/{requestId}.json` and the prompt carries only a pointer plus the
//! essential requirements; otherwise everything is inlined. Either way the
//! prompt tells the child how to enqueue sub-requests, which is the entire
//! tree-of-agents mechanism.

use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::config::Config;
use crate::shaper;
use crate::spool::SpoolDirs;
use crate::types::{ContextAnalysis, Request};

#[derive(Debug)]
pub struct PromptPlan {
    pub prompt: String,
    pub used_lazy: bool,
    /// Side-context file, present only in lazy mode.
    pub context_file: Option<PathBuf>,
}

/// Build the prompt, spilling the side-context file first when the lazy
/// decision applies. A failed spill degrades to an inline prompt.
pub async fn build(
    req: &Request,
    analysis: &ContextAnalysis,
    cfg: &Config,
    dirs: &SpoolDirs,
    request_id: &str,
) -> PromptPlan {
    if shaper::use_lazy_context(analysis, cfg) {
        let path = dirs.context_path(request_id);
        match write_context_file(req, request_id, dirs, &path).await {
            Ok(()) => {
                return PromptPlan {
                    prompt: lazy_prompt(req, cfg, dirs, request_id, &path),
                    used_lazy: true,
                    context_file: Some(path),
                };
            }
            Err(e) => {
                warn!(request_id, error = %e, "context spill failed, inlining instead");
            }
        }
    }
    PromptPlan {
        prompt: inline_prompt(req, dirs, request_id),
        used_lazy: false,
        context_file: None,
    }
}

async fn write_context_file(
    req: &Request,
    request_id: &str,
    dirs: &SpoolDirs,
    path: &PathBuf,
) -> std::io::Result<()> {
    let parent_result_path = req
        .parent_request_id
        .as_deref()
        .map(|p| dirs.result_path(p).display().to_string());
    let mut topics: Vec<String> = shaper::matched_signals(req)
        .into_iter()
        .map(String::from)
        .collect();
    topics.push(req.role().to_string());

    let doc = json!({
        "request": req,
        "metadata": {
            "requestId": request_id,
            "parentResultPath": parent_result_path,
            "memoryTopics": topics,
            "writtenAt": Utc::now().to_rfc3339(),
        },
    });
    let body = serde_json::to_string_pretty(&doc).unwrap_or_default();
    tokio::fs::write(path, body).await
}

fn header(req: &Request, request_id: &str) -> String {
    format!(
        "You are a swarm agent (id {request_id}, role {}).\n\n## Objective\n{}\n",
        req.role(),
        req.task.objective,
    )
}

fn coordination_block(dirs: &SpoolDirs, request_id: &str) -> String {
    format!(
        "\n## Coordination\n\
         You may spawn sub-agents by writing a JSON file into {requests}. Use the shape\n\
         {{\"agentRole\": \"...\", \"parentRequestId\": \"{request_id}\", \"task\": {{\"objective\": \"...\", \"requirements\": [], \"context\": {{}}}}}}.\n\
         Sub-agent results appear as {results}/<requestId>.json.\n\
         Work autonomously and print progress as you go; your stdout is recorded.\n",
        requests = dirs.requests.display(),
        results = dirs.results.display(),
    )
}

fn lazy_prompt(
    req: &Request,
    cfg: &Config,
    dirs: &SpoolDirs,
    request_id: &str,
    context_file: &PathBuf,
) -> String {
    let mut prompt = header(req, request_id);

    let essential: Vec<&String> = req
        .task
        .requirements
        .iter()
        .take(cfg.max_essential_requirements)
        .collect();
    if !essential.is_empty() {
        prompt.push_str("\n## Requirements\n");
        for r in &essential {
            prompt.push_str(&format!("- {r}\n"));
        }
        let omitted = req.task.requirements.len() - essential.len();
        if omitted > 0 {
            prompt.push_str(&format!("({omitted} more in the context file)\n"));
        }
    }

    prompt.push_str(&format!(
        "\n## Context\n\
         The full request, context, and remaining requirements are stored at:\n\
         {}\n\
         ($SWARM_CONTEXT_FILE points to the same file.) Read it before you begin.\n",
        context_file.display(),
    ));
    prompt.push_str(&coordination_block(dirs, request_id));
    prompt
}

fn inline_prompt(req: &Request, dirs: &SpoolDirs, request_id: &str) -> String {
    let mut prompt = header(req, request_id);

    if !req.task.requirements.is_empty() {
        prompt.push_str("\n## Requirements\n");
        for r in &req.task.requirements {
            prompt.push_str(&format!("- {r}\n"));
        }
    }

    if !req.task.context.is_empty() {
        let pretty = serde_json::to_string_pretty(&req.task.context).unwrap_or_default();
        prompt.push_str(&format!("\n## Context\n{pretty}\n"));
    }

    prompt.push_str(&coordination_block(dirs, request_id));
    prompt
}
