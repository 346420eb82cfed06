//! Judge prompt construction

/// Default evaluation prompt sent to local and remote judges.
///
/// Placeholders `{problem}`, `{previous_steps}`, and `{current_step}` are
/// substituted per step. The `\boxed{...}` instruction matches what
/// [`crate::score::ScoreExtractor`] parses first.
pub const DEFAULT_JUDGE_PROMPT: &str = "Please evaluate the quality of the following reasoning step in solving the problem.

[Problem]
{problem}

[Previous steps]
{previous_steps}

[Current step being evaluated]
{current_step}

Please rate this step on a scale from 0 to 1, where:
- 0: Completely incorrect or harmful to the solution
- 1: Perfectly correct and helpful for solving the problem

Consider:
- Mathematical accuracy
- Logical consistency with previous steps
- Progress towards the solution

Please provide your evaluation and place your final score in \\boxed{} format. For example: \\boxed{0.87543}";

/// A judge prompt with per-step placeholder substitution.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_JUDGE_PROMPT)
    }
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Use `custom` when configured, the default prompt otherwise.
    pub fn from_config(custom: Option<&str>) -> Self {
        match custom {
            Some(template) => Self::new(template),
            None => Self::default(),
        }
    }

    pub fn render(&self, problem: &str, previous_steps: &str, current_step: &str) -> String {
        self.template
            .replace("{problem}", problem)
            .replace("{previous_steps}", previous_steps)
            .replace("{current_step}", current_step)
    }
}
