//! Prompt templates for the three agent kinds, plus parsers for their
//! structured output.
//!
//! Templates carry `$KEY` placeholders and are rendered through
//! [`render_template`]. The architecture agent is instructed to emit a JSON
//! issue list; reviewers emit a `<verdict>...</verdict>` tag followed by
//! free-text feedback.

use anyhow::{Context, Result, bail};

use crate::agent::template::{render_template, unresolved_placeholders};
use crate::models::{ApprovalStatus, IssueSpec, ReviewVerdict};

const ARCHITECTURE_TEMPLATE: &str = r#"# Architecture Planning

You are planning the implementation of feature `$FEATURE_NAME`.

## Feature Description

$FEATURE_DESCRIPTION

## Your Task

Decompose the feature into a sequence of small, independently reviewable
issues. For each issue give a title, a description concrete enough for
another engineer to implement without further context, a step number for
ordering, and the numbers of issues it depends on.

Output ONLY a JSON array, one object per issue:

```json
[
  {"number": 1, "title": "...", "description": "...", "step_number": 1, "dependencies": []}
]
```

Dependencies must reference issue numbers in this list and must not form a
cycle."#;

const SOLVER_TEMPLATE: &str = r#"# Solve Issue #$ISSUE_NUMBER: $ISSUE_TITLE

You are agent $AGENT_ID working on feature `$FEATURE_NAME`
(attempt $ATTEMPT_NUMBER of $MAX_ATTEMPTS).

Your working directory is an isolated git worktree at `$WORKTREE_PATH`,
branched from `$BASE_BRANCH`. Make all changes inside it; do not commit,
the orchestrator commits for you.

## Issue Description

$ISSUE_DESCRIPTION
$REVIEW_FEEDBACK
## Rules

1. Implement exactly this issue; do not start work that belongs to other issues.
2. Keep the tree building and the tests passing.
3. Describe what you changed and why in your final output."#;

const REVIEWER_TEMPLATE: &str = r#"# Review Issue #$ISSUE_NUMBER: $ISSUE_TITLE

You are the `$REVIEWER_PROFILE` reviewer for feature `$FEATURE_NAME`,
reviewing solve attempt $ATTEMPT_NUMBER. The working directory
`$WORKTREE_PATH` contains the committed changes for this issue.

## Issue Description

$ISSUE_DESCRIPTION

## Your Task

Review the changes against the issue description from the `$REVIEWER_PROFILE`
perspective. Then output exactly one verdict tag, followed by your feedback:

<verdict>approved</verdict>    - the changes are correct and complete
<verdict>needs_changes</verdict> - fixable problems; list them
<verdict>rejected</verdict>    - the approach is wrong and must be redone

Feedback after the tag is passed verbatim to the solver on the next attempt,
so be specific and actionable."#;

/// Render the architecture-planning prompt.
pub fn architecture_prompt(feature_name: &str, description: &str) -> String {
    render_template(
        ARCHITECTURE_TEMPLATE,
        &[
            ("FEATURE_NAME".to_string(), feature_name.to_string()),
            ("FEATURE_DESCRIPTION".to_string(), description.to_string()),
        ],
    )
}

/// Variables for one solver invocation.
pub struct SolverVars<'a> {
    pub issue_number: u32,
    pub issue_title: &'a str,
    pub issue_description: &'a str,
    pub feature_name: &'a str,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub agent_id: &'a str,
    pub worktree_path: &'a str,
    pub base_branch: &'a str,
    /// Profile-labeled feedback from the previous attempt, empty on the first.
    pub review_feedback: &'a str,
}

/// Render the solver prompt. Every placeholder must resolve.
pub fn solver_prompt(vars: &SolverVars<'_>) -> Result<String> {
    let feedback_section = if vars.review_feedback.is_empty() {
        String::new()
    } else {
        format!(
            "\n## Reviewer Feedback From the Previous Attempt\n\n{}\n",
            vars.review_feedback
        )
    };

    let rendered = render_template(
        SOLVER_TEMPLATE,
        &[
            ("ISSUE_NUMBER".to_string(), vars.issue_number.to_string()),
            ("ISSUE_TITLE".to_string(), vars.issue_title.to_string()),
            (
                "ISSUE_DESCRIPTION".to_string(),
                vars.issue_description.to_string(),
            ),
            ("FEATURE_NAME".to_string(), vars.feature_name.to_string()),
            (
                "ATTEMPT_NUMBER".to_string(),
                vars.attempt_number.to_string(),
            ),
            ("MAX_ATTEMPTS".to_string(), vars.max_attempts.to_string()),
            ("AGENT_ID".to_string(), vars.agent_id.to_string()),
            ("WORKTREE_PATH".to_string(), vars.worktree_path.to_string()),
            ("BASE_BRANCH".to_string(), vars.base_branch.to_string()),
            ("REVIEW_FEEDBACK".to_string(), feedback_section),
        ],
    );
    ensure_resolved(&rendered)?;
    Ok(rendered)
}

/// Render the reviewer prompt for one profile.
pub fn reviewer_prompt(
    profile: &str,
    issue_number: u32,
    issue_title: &str,
    issue_description: &str,
    feature_name: &str,
    attempt_number: u32,
    worktree_path: &str,
) -> Result<String> {
    let rendered = render_template(
        REVIEWER_TEMPLATE,
        &[
            ("REVIEWER_PROFILE".to_string(), profile.to_string()),
            ("ISSUE_NUMBER".to_string(), issue_number.to_string()),
            ("ISSUE_TITLE".to_string(), issue_title.to_string()),
            (
                "ISSUE_DESCRIPTION".to_string(),
                issue_description.to_string(),
            ),
            ("FEATURE_NAME".to_string(), feature_name.to_string()),
            ("ATTEMPT_NUMBER".to_string(), attempt_number.to_string()),
            ("WORKTREE_PATH".to_string(), worktree_path.to_string()),
        ],
    );
    ensure_resolved(&rendered)?;
    Ok(rendered)
}

/// Unresolved `$KEY` tokens in a rendered prompt are a caller bug, not
/// something to ship to an agent.
fn ensure_resolved(rendered: &str) -> Result<()> {
    let leftover = unresolved_placeholders(rendered);
    if !leftover.is_empty() {
        bail!("prompt has unresolved placeholders: {:?}", leftover);
    }
    Ok(())
}

/// Extract the planned issue list from architecture-agent output.
///
/// Accepts a fenced ```json block or the first bare JSON array in the text.
pub fn parse_issue_list(output: &str) -> Result<Vec<IssueSpec>> {
    let body = if let Some(start) = output.find("```json") {
        let rest = &output[start + 7..];
        let end = rest.find("```").context("unterminated ```json fence")?;
        &rest[..end]
    } else {
        let start = output
            .find('[')
            .context("no JSON array found in architecture output")?;
        let end = output
            .rfind(']')
            .context("no JSON array found in architecture output")?;
        if end < start {
            bail!("no JSON array found in architecture output");
        }
        &output[start..=end]
    };

    let issues: Vec<IssueSpec> =
        serde_json::from_str(body.trim()).context("architecture output is not a valid issue list")?;
    if issues.is_empty() {
        bail!("architecture agent produced an empty issue list");
    }
    Ok(issues)
}

/// Parse a reviewer's output into a verdict.
///
/// A missing or unrecognized tag is treated as `needs_changes` with the full
/// output as feedback; a reviewer that cannot state a verdict has not
/// approved anything.
pub fn parse_review_verdict(
    profile: &str,
    attempt_number: u32,
    output: &str,
) -> ReviewVerdict {
    let approval = extract_tag(output, "verdict")
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Some(ApprovalStatus::Approved),
            "rejected" | "reject" => Some(ApprovalStatus::Rejected),
            "needs_changes" | "needs-changes" => Some(ApprovalStatus::NeedsChanges),
            _ => None,
        })
        .unwrap_or(ApprovalStatus::NeedsChanges);

    let feedback = match output.find("</verdict>") {
        Some(end) => output[end + "</verdict>".len()..].trim().to_string(),
        None => output.trim().to_string(),
    };

    ReviewVerdict {
        reviewer_profile: profile.to_string(),
        attempt_number,
        approval,
        feedback,
    }
}

/// Content of the first `<tag>...</tag>` pair, if present.
fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solver_vars() -> SolverVars<'static> {
        SolverVars {
            issue_number: 2,
            issue_title: "Add session store",
            issue_description: "Persist sessions in sqlite",
            feature_name: "auth-flow",
            attempt_number: 1,
            max_attempts: 3,
            agent_id: "f0f0f0f0",
            worktree_path: "/tmp/wt/issue-2",
            base_branch: "main",
            review_feedback: "",
        }
    }

    #[test]
    fn solver_prompt_resolves_all_placeholders() {
        let prompt = solver_prompt(&solver_vars()).unwrap();
        assert!(prompt.contains("Issue #2"));
        assert!(prompt.contains("attempt 1 of 3"));
        assert!(prompt.contains("/tmp/wt/issue-2"));
        assert!(unresolved_placeholders(&prompt).is_empty());
    }

    #[test]
    fn solver_prompt_omits_feedback_section_on_first_attempt() {
        let prompt = solver_prompt(&solver_vars()).unwrap();
        assert!(!prompt.contains("Reviewer Feedback"));
    }

    #[test]
    fn solver_prompt_includes_feedback_on_retry() {
        let mut vars = solver_vars();
        vars.attempt_number = 2;
        vars.review_feedback = "[security] token is logged in plaintext";
        let prompt = solver_prompt(&vars).unwrap();
        assert!(prompt.contains("Reviewer Feedback"));
        assert!(prompt.contains("token is logged in plaintext"));
    }

    #[test]
    fn reviewer_prompt_carries_profile() {
        let prompt = reviewer_prompt(
            "security",
            3,
            "Add login",
            "desc",
            "auth-flow",
            2,
            "/tmp/wt/issue-3",
        )
        .unwrap();
        assert!(prompt.contains("`security` reviewer"));
        assert!(prompt.contains("attempt 2"));
        assert!(unresolved_placeholders(&prompt).is_empty());
    }

    #[test]
    fn parse_issue_list_from_fenced_block() {
        let output = r#"Here is the plan.

```json
[
  {"number": 1, "title": "Bootstrap", "step_number": 1, "dependencies": []},
  {"number": 2, "title": "Core", "step_number": 2, "dependencies": [1]}
]
```

Good luck."#;
        let issues = parse_issue_list(output).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[1].dependencies, vec![1]);
    }

    #[test]
    fn parse_issue_list_from_bare_array() {
        let output = r#"Plan: [{"number": 1, "title": "Only one"}]"#;
        let issues = parse_issue_list(output).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Only one");
    }

    #[test]
    fn parse_issue_list_rejects_prose() {
        assert!(parse_issue_list("I could not produce a plan, sorry.").is_err());
    }

    #[test]
    fn parse_issue_list_rejects_empty_array() {
        assert!(parse_issue_list("[]").is_err());
    }

    #[test]
    fn verdict_approved_with_feedback() {
        let verdict =
            parse_review_verdict("security", 1, "<verdict>approved</verdict>\nClean change.");
        assert_eq!(verdict.approval, ApprovalStatus::Approved);
        assert_eq!(verdict.feedback, "Clean change.");
        assert_eq!(verdict.reviewer_profile, "security");
    }

    #[test]
    fn verdict_rejected_is_parsed() {
        let verdict = parse_review_verdict("style", 2, "<verdict>rejected</verdict> wrong layer");
        assert_eq!(verdict.approval, ApprovalStatus::Rejected);
        assert_eq!(verdict.attempt_number, 2);
    }

    #[test]
    fn missing_verdict_tag_defaults_to_needs_changes() {
        let verdict = parse_review_verdict("general", 1, "I am unsure about this change.");
        assert_eq!(verdict.approval, ApprovalStatus::NeedsChanges);
        assert_eq!(verdict.feedback, "I am unsure about this change.");
    }

    #[test]
    fn unknown_verdict_value_defaults_to_needs_changes() {
        let verdict = parse_review_verdict("general", 1, "<verdict>maybe</verdict> hmm");
        assert_eq!(verdict.approval, ApprovalStatus::NeedsChanges);
    }
}
