//! System prompt assembly.
//!
//! The system prompt is a concatenation of knowledge-base sections in a
//! fixed order, followed by the session context and the output-format
//! contract. Modification mode swaps the design guidance for a focused
//! edit instruction.

use semver::Version;

use crate::rules::RuleSet;

/// The declared output format: code goes in `<CODE>` tags.
pub const OUTPUT_FORMAT_SPEC: &str = r#"# Output format

Return the complete CadQuery script inside <CODE> tags and nothing else:

<CODE>
import cadquery as cq
...
result = ...
</CODE>

The script must assign the final solid to a variable named `result`."#;

/// Base instruction for generation mode.
const GENERATION_PREAMBLE: &str = r#"You are an expert CadQuery engineer. You turn a design plan into a complete,
runnable CadQuery script. The script must be self-contained, import cadquery,
use explicit numeric dimensions, and assign the final solid to `result`."#;

/// Base instruction for modification mode.
const MODIFICATION_PREAMBLE: &str = r#"You are an expert CadQuery engineer editing an existing script. Apply the
requested change with the smallest possible edit. Preserve the script's
structure, variable names and style. Do not rewrite working geometry."#;

/// Which prompt variant to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Full generation guided by a plan.
    Generation,
    /// Focused edit of existing code; planning guidance is dropped.
    Modification,
}

/// An assembled prompt.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    /// The system prompt text.
    pub system: String,
    /// The output-format contract appended to the system prompt.
    pub output_format: &'static str,
}

/// Assembles system prompts from the rule set and session context.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    library_version: Version,
}

impl PromptBuilder {
    /// Creates a builder for the installed CadQuery version.
    pub fn new(library_version: Version) -> Self {
        Self { library_version }
    }

    /// The version used for cookbook filtering.
    pub fn library_version(&self) -> &Version {
        &self.library_version
    }

    /// Builds the system prompt.
    ///
    /// `session_context` is the rendered session-memory section, if the
    /// conversation has history.
    pub fn build_system(
        &self,
        rules: &RuleSet,
        session_context: Option<&str>,
        mode: PromptMode,
    ) -> BuiltPrompt {
        let mut sections: Vec<String> = Vec::new();

        match mode {
            PromptMode::Generation => sections.push(GENERATION_PREAMBLE.to_string()),
            PromptMode::Modification => sections.push(MODIFICATION_PREAMBLE.to_string()),
        }

        push_section(&mut sections, "Rules", &rules.base_rules);
        push_section(&mut sections, "Manufacturing constraints", &rules.manufacturing);
        push_section(&mut sections, "Dimension guidance", &rules.dimension_guidance);
        push_section(&mut sections, "Failure prevention", &rules.failure_prevention);

        if mode == PromptMode::Generation {
            let recipes = rules.cookbook_for_version(&self.library_version);
            if !recipes.is_empty() {
                let mut cookbook = String::new();
                for recipe in recipes {
                    cookbook.push_str(&format!("## {}\n\n```python\n{}\n```\n\n", recipe.title, recipe.code.trim()));
                }
                push_section(&mut sections, "Cookbook recipes", cookbook.trim());
            }
        }

        push_section(&mut sections, "Anti-patterns", &rules.anti_patterns);
        push_section(&mut sections, "API reference", &rules.api_reference);

        if mode == PromptMode::Generation {
            push_section(&mut sections, "Design patterns", &rules.design_patterns);
            push_section(
                &mut sections,
                "Operation interactions",
                &rules.operation_interactions,
            );
            push_section(&mut sections, "Examples", &rules.few_shot_examples);
        }

        if let Some(context) = session_context {
            if !context.is_empty() {
                sections.push(format!(
                    "# Session context\n\n{}\n\nDo not repeat failed approaches from this session.",
                    context
                ));
            }
        }

        sections.push(OUTPUT_FORMAT_SPEC.to_string());

        BuiltPrompt {
            system: sections.join("\n\n"),
            output_format: OUTPUT_FORMAT_SPEC,
        }
    }

    /// User prompt for plan-guided generation.
    pub fn generation_user_prompt(&self, request_text: &str, plan_text: &str) -> String {
        format!(
            "Request:\n{}\n\nDesign plan to implement:\n{}\n\nWrite the complete script.",
            request_text, plan_text
        )
    }

    /// User prompt for modification mode.
    pub fn modification_user_prompt(&self, request_text: &str, existing_code: &str) -> String {
        format!(
            "Edit this code to satisfy the request. Preserve its structure.\n\n\
             Request:\n{}\n\nCurrent code:\n```python\n{}\n```",
            request_text, existing_code
        )
    }

    /// User prompt for one iterative build step.
    pub fn step_user_prompt(&self, step_description: &str, working_code: &str) -> String {
        if working_code.is_empty() {
            format!(
                "Start a new script and implement this first build step:\n{}\n\n\
                 Return the complete script.",
                step_description
            )
        } else {
            format!(
                "Extend this working script with the next build step. Do not change\n\
                 the existing geometry.\n\nWorking script:\n```python\n{}\n```\n\n\
                 Next step:\n{}\n\nReturn the complete extended script.",
                working_code, step_description
            )
        }
    }
}

fn push_section(sections: &mut Vec<String>, label: &str, body: &str) {
    if !body.is_empty() {
        sections.push(format!("# {}\n\n{}", label, body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::CookbookRecipe;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(Version::new(2, 4, 0))
    }

    fn full_rules() -> RuleSet {
        RuleSet {
            base_rules: "Name the result.".into(),
            manufacturing: "Walls over 0.8 mm.".into(),
            dimension_guidance: "Millimetres everywhere.".into(),
            failure_prevention: "Fillet last.".into(),
            cookbook: vec![
                CookbookRecipe {
                    title: "Plain bracket".into(),
                    code: "import cadquery as cq".into(),
                    operations: vec![],
                    min_library_version: None,
                },
                CookbookRecipe {
                    title: "Future recipe".into(),
                    code: "new_api()".into(),
                    operations: vec![],
                    min_library_version: Some("9.0.0".into()),
                },
            ],
            anti_patterns: "No magic numbers.".into(),
            api_reference: "Workplane.box".into(),
            design_patterns: "Base then features.".into(),
            operation_interactions: "Shell dislikes fillets.".into(),
            few_shot_examples: "Example one.".into(),
            ..RuleSet::default()
        }
    }

    #[test]
    fn test_generation_prompt_section_order() {
        let prompt = builder().build_system(&full_rules(), None, PromptMode::Generation);
        let system = &prompt.system;

        // Every section present, in order.
        let order = [
            "Name the result.",
            "Walls over 0.8 mm.",
            "Millimetres everywhere.",
            "Fillet last.",
            "Plain bracket",
            "No magic numbers.",
            "Workplane.box",
            "Base then features.",
            "Shell dislikes fillets.",
            "Example one.",
            "<CODE>",
        ];
        let mut cursor = 0;
        for needle in order {
            let at = system[cursor..]
                .find(needle)
                .unwrap_or_else(|| panic!("'{}' missing or out of order", needle));
            cursor += at;
        }
    }

    #[test]
    fn test_cookbook_filtered_by_version() {
        let prompt = builder().build_system(&full_rules(), None, PromptMode::Generation);
        assert!(prompt.system.contains("Plain bracket"));
        assert!(!prompt.system.contains("Future recipe"));
    }

    #[test]
    fn test_modification_mode_drops_design_guidance() {
        let prompt = builder().build_system(&full_rules(), None, PromptMode::Modification);

        assert!(prompt.system.contains("smallest possible edit"));
        assert!(prompt.system.contains("Workplane.box"));
        // Planning/design material is not included.
        assert!(!prompt.system.contains("Plain bracket"));
        assert!(!prompt.system.contains("Base then features."));
        assert!(!prompt.system.contains("Example one."));
        // Output contract always present.
        assert!(prompt.system.contains("<CODE>"));
    }

    #[test]
    fn test_session_context_with_directive() {
        let prompt = builder().build_system(
            &full_rules(),
            Some("Previous attempts in this session:\n1. bracket (failure: topology)"),
            PromptMode::Generation,
        );

        assert!(prompt.system.contains("Previous attempts in this session"));
        assert!(prompt
            .system
            .contains("Do not repeat failed approaches from this session."));
    }

    #[test]
    fn test_empty_sections_omitted() {
        let prompt = builder().build_system(&RuleSet::default(), None, PromptMode::Generation);
        assert!(!prompt.system.contains("# Manufacturing constraints"));
        assert!(prompt.system.contains("<CODE>"));
    }

    #[test]
    fn test_step_user_prompt_variants() {
        let b = builder();
        let first = b.step_user_prompt("Create the base box", "");
        assert!(first.contains("first build step"));

        let later = b.step_user_prompt("Drill the hole", "import cadquery as cq");
        assert!(later.contains("Working script"));
        assert!(later.contains("Drill the hole"));
    }
}
