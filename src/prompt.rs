//! Prompt template rendering.
//!
//! Session prompts are stored as free-text templates with a small,
//! deterministic grammar: literal text, `{{variable}}` substitution,
//! `{{#flag}}…{{/flag}}` blocks kept when the flag is truthy, and
//! `{{^flag}}…{{/flag}}` blocks kept when it is falsy. The grammar is part
//! of the system contract; anything outside it renders literally.

use std::collections::HashMap;

use chrono::Utc;

use crate::types::Subject;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(String),
    Variable(String),
    /// (name, children, kept-when-truthy)
    Section(String, Vec<Node>, bool),
}

#[derive(Debug, Default)]
pub struct PromptContext {
    vars: HashMap<String, String>,
    flags: HashMap<String, bool>,
}

impl PromptContext {
    pub fn var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn flag(mut self, name: &str, value: bool) -> Self {
        self.flags.insert(name.to_string(), value);
        self
    }
}

/// Render a template against a context. Unknown variables render empty;
/// unknown flags are falsy. Unbalanced sections fail loudly rather than
/// producing a half-substituted prompt.
pub fn render(template: &str, ctx: &PromptContext) -> anyhow::Result<String> {
    let nodes = parse(template)?;
    let mut out = String::with_capacity(template.len());
    render_nodes(&nodes, ctx, &mut out);
    Ok(out)
}

fn render_nodes(nodes: &[Node], ctx: &PromptContext, out: &mut String) {
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Variable(name) => {
                if let Some(value) = ctx.vars.get(name) {
                    out.push_str(value);
                }
            }
            Node::Section(name, children, wants_truthy) => {
                let value = ctx.flags.get(name).copied().unwrap_or(false);
                if value == *wants_truthy {
                    render_nodes(children, ctx, out);
                }
            }
        }
    }
}

fn parse(template: &str) -> anyhow::Result<Vec<Node>> {
    // Stack of open sections: (name, wants_truthy, children collected so far).
    let mut stack: Vec<(String, bool, Vec<Node>)> = Vec::new();
    let mut current: Vec<Node> = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            current.push(Node::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| anyhow::anyhow!("unterminated '{{{{' in template"))?;
        let tag = after[..close].trim();
        rest = &after[close + 2..];

        match tag.bytes().next() {
            Some(b'#') | Some(b'^') => {
                let wants_truthy = tag.starts_with('#');
                let name = tag[1..].trim().to_string();
                stack.push((name, wants_truthy, std::mem::take(&mut current)));
            }
            Some(b'/') => {
                let name = tag[1..].trim();
                let (open_name, wants_truthy, mut parent) = stack
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("unmatched close tag '{{{{/{}}}}}'", name))?;
                if open_name != name {
                    anyhow::bail!(
                        "section close '{{{{/{}}}}}' does not match open '{{{{#{}}}}}'",
                        name,
                        open_name
                    );
                }
                let children = std::mem::replace(&mut current, Vec::new());
                parent.push(Node::Section(open_name, children, wants_truthy));
                current = parent;
            }
            Some(_) => current.push(Node::Variable(tag.to_string())),
            None => anyhow::bail!("empty tag '{{{{}}}}' in template"),
        }
    }

    if let Some((name, _, _)) = stack.last() {
        anyhow::bail!("unclosed section '{{{{#{}}}}}'", name);
    }
    if !rest.is_empty() {
        current.push(Node::Literal(rest.to_string()));
    }
    Ok(current)
}

/// Prompt used when no template row exists in the store.
const FALLBACK_PROMPT: &str = "Você é a EVA, assistente de saúde virtual para idosos no Brasil.\n\
O idoso se chama {{nome_idoso}}.\n\
Fale em português brasileiro, com tom {{tom_voz}}, de forma clara e pausada.\n\
Respostas curtas: 1-2 frases.";

/// Render the per-subject system prompt from a stored template, or from the
/// built-in fallback when the store has none.
pub fn render_subject_prompt(template: Option<&str>, subject: &Subject) -> String {
    let age = subject
        .age_years(Utc::now().date_naive())
        .map(|a| a.to_string())
        .unwrap_or_default();

    let voice_tone = if subject.voice_tone.is_empty() {
        "calmo e acolhedor".to_string()
    } else {
        subject.voice_tone.clone()
    };

    let ctx = PromptContext::default()
        .var("nome_idoso", subject.name.clone())
        .var("idade", age)
        .var("nivel_cognitivo", subject.cognitive_level.clone())
        .var("tom_voz", voice_tone)
        // Business constant carried over from the care platform.
        .var("taxa_adesao", "85")
        .flag("limitacoes_auditivas", subject.hearing_impaired)
        .flag("usa_aparelho_auditivo", subject.uses_hearing_aid)
        .flag("primeira_interacao", false);

    let template = template.unwrap_or(FALLBACK_PROMPT);
    match render(template, &ctx) {
        Ok(prompt) => prompt,
        Err(e) => {
            tracing::warn!("Prompt template failed to render, using fallback: {}", e);
            render(FALLBACK_PROMPT, &ctx).unwrap_or_else(|_| FALLBACK_PROMPT.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ctx() -> PromptContext {
        PromptContext::default()
            .var("nome", "Maria")
            .var("idade", "78")
            .flag("surda", true)
            .flag("aparelho", false)
    }

    #[test]
    fn literal_passthrough() {
        assert_eq!(render("olá mundo", &ctx()).unwrap(), "olá mundo");
    }

    #[test]
    fn variable_substitution() {
        assert_eq!(
            render("Olá {{nome}}, {{idade}} anos.", &ctx()).unwrap(),
            "Olá Maria, 78 anos."
        );
    }

    #[test]
    fn unknown_variable_renders_empty() {
        assert_eq!(render("a{{nada}}b", &ctx()).unwrap(), "ab");
    }

    #[test]
    fn truthy_section_kept_when_flag_set() {
        let out = render("x{{#surda}}FALE ALTO{{/surda}}y", &ctx()).unwrap();
        assert_eq!(out, "xFALE ALTOy");
    }

    #[test]
    fn truthy_section_dropped_when_flag_unset() {
        let out = render("x{{#aparelho}}nunca{{/aparelho}}y", &ctx()).unwrap();
        assert_eq!(out, "xy");
    }

    #[test]
    fn falsy_section_inverts() {
        let out = render("{{^aparelho}}sem aparelho{{/aparelho}}", &ctx()).unwrap();
        assert_eq!(out, "sem aparelho");
        let out = render("{{^surda}}ouve bem{{/surda}}", &ctx()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn unknown_flag_is_falsy() {
        assert_eq!(render("{{#x}}a{{/x}}{{^x}}b{{/x}}", &ctx()).unwrap(), "b");
    }

    #[test]
    fn sections_nest() {
        let out = render(
            "{{#surda}}alto {{^aparelho}}e devagar{{/aparelho}}{{/surda}}",
            &ctx(),
        )
        .unwrap();
        assert_eq!(out, "alto e devagar");
    }

    #[test]
    fn variables_inside_sections_render() {
        let out = render("{{#surda}}{{nome}} não ouve{{/surda}}", &ctx()).unwrap();
        assert_eq!(out, "Maria não ouve");
    }

    #[test]
    fn unbalanced_sections_error() {
        assert!(render("{{#a}}sem fim", &ctx()).is_err());
        assert!(render("fim sem começo{{/a}}", &ctx()).is_err());
        assert!(render("{{#a}}x{{/b}}", &ctx()).is_err());
        assert!(render("{{aberto", &ctx()).is_err());
    }

    #[test]
    fn subject_prompt_uses_template_and_flags() {
        let subject = crate::types::Subject {
            id: 1,
            name: "João".into(),
            cpf: "1".into(),
            birth_date: NaiveDate::from_ymd_opt(1948, 1, 1),
            device_token: None,
            device_token_valid: true,
            active: true,
            cognitive_level: "leve".into(),
            hearing_impaired: true,
            uses_hearing_aid: false,
            voice_tone: String::new(),
        };
        let template = "Cuide de {{nome_idoso}} ({{nivel_cognitivo}}).\
{{#limitacoes_auditivas}} Fale alto.{{/limitacoes_auditivas}}\
{{#usa_aparelho_auditivo}} Tem aparelho.{{/usa_aparelho_auditivo}} Tom: {{tom_voz}}.";
        let prompt = render_subject_prompt(Some(template), &subject);
        assert_eq!(
            prompt,
            "Cuide de João (leve). Fale alto. Tom: calmo e acolhedor."
        );
    }

    #[test]
    fn subject_prompt_falls_back_without_template() {
        let subject = crate::types::Subject {
            id: 1,
            name: "Ana".into(),
            cpf: "1".into(),
            birth_date: None,
            device_token: None,
            device_token_valid: true,
            active: true,
            cognitive_level: "normal".into(),
            hearing_impaired: false,
            uses_hearing_aid: false,
            voice_tone: "alegre".into(),
        };
        let prompt = render_subject_prompt(None, &subject);
        assert!(prompt.contains("Ana"));
        assert!(prompt.contains("alegre"));
        assert!(!prompt.contains("{{"));
    }
}
