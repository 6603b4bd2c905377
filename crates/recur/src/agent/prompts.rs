/// System prompt for autonomous agent runs.
pub const AGENT_SYSTEM_PROMPT: &str = "\
You are an autonomous agent that solves tasks by observing, thinking, and acting.

Available actions:
- **execute_code**: Run code in a sandboxed interpreter to compute, analyze, or process data
- **read_variable / write_variable**: Read and write persistent session variables across code executions
- **context_query**: Search documentation for relevant context (when available)
- **sub_complete**: Delegate a sub-problem to a fresh LLM call
- **batch_complete**: Run multiple sub-problems in parallel
- **FINAL(answer)**: Terminate and return your answer as text
- **FINAL_VAR(variable_name)**: Terminate and return the value of a session variable

Strategy:
1. Break the problem into steps
2. Use tools to gather information and compute results
3. Store intermediate results in session variables
4. Call FINAL or FINAL_VAR when you have the answer

Important:
- Always call FINAL or FINAL_VAR when done - do not just output text
- If you're running low on iterations, call FINAL with your best answer
- Be efficient with tool calls - plan before acting
";

/// How many previous-action summaries are replayed into each prompt.
pub const ACTION_WINDOW: usize = 5;

/// Build the prompt for one agent iteration. `iteration` is zero-based;
/// the mandatory termination notice appears only on the final permitted
/// iteration.
pub fn build_iteration_prompt(
    task: &str,
    iteration: u32,
    max_iterations: u32,
    previous_actions: &[String],
    remaining_budget: Option<u64>,
) -> String {
    let mut parts = vec![format!("Task: {task}")];

    parts.push(format!("\nIteration: {}/{max_iterations}", iteration + 1));

    if let Some(remaining) = remaining_budget {
        parts.push(format!("Remaining token budget: {remaining}"));
    }

    if !previous_actions.is_empty() {
        parts.push("\nPrevious actions:".into());
        let start = previous_actions.len().saturating_sub(ACTION_WINDOW);
        for (i, action) in previous_actions[start..].iter().enumerate() {
            parts.push(format!("  {}. {action}", i + 1));
        }
    }

    if iteration + 1 >= max_iterations {
        parts.push(
            "\nWARNING: THIS IS YOUR FINAL ITERATION. You MUST call FINAL or FINAL_VAR now \
             with your best answer."
                .into(),
        );
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_contains_task_and_iteration() {
        let prompt = build_iteration_prompt("count to ten", 0, 5, &[], Some(1000));
        assert!(prompt.contains("Task: count to ten"));
        assert!(prompt.contains("Iteration: 1/5"));
        assert!(prompt.contains("Remaining token budget: 1000"));
    }

    #[test]
    fn no_warning_before_final_iteration() {
        let prompt = build_iteration_prompt("t", 3, 5, &[], None);
        assert!(!prompt.contains("FINAL ITERATION"));
    }

    #[test]
    fn warning_on_final_iteration() {
        let prompt = build_iteration_prompt("t", 4, 5, &[], None);
        assert!(prompt.contains("THIS IS YOUR FINAL ITERATION"));
    }

    #[test]
    fn only_last_five_actions_replayed() {
        let actions: Vec<String> = (1..=8).map(|i| format!("action {i}")).collect();
        let prompt = build_iteration_prompt("t", 6, 10, &actions, None);
        assert!(!prompt.contains("action 3"));
        assert!(prompt.contains("action 4"));
        assert!(prompt.contains("action 8"));
    }

    #[test]
    fn empty_actions_section_omitted() {
        let prompt = build_iteration_prompt("t", 0, 5, &[], None);
        assert!(!prompt.contains("Previous actions"));
    }
}
