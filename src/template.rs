//! # Prompt templates
//!
//! The generative fallback and the paraphrase stage each render a
//! [`PromptTemplate`]: a system prompt and a user prompt with `{placeholder}`
//! slots. Templates are small YAML documents stored per-user under the
//! configuration directory:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! ```yaml
//! system_prompt: |
//!   Ты — бот техподдержки. Используй ТОЛЬКО эту базу знаний:
//!   {knowledge}
//! user_prompt: "Запрос: {question}"
//! ```
//!
//! Placeholders: `{knowledge}`, `{question}`, `{answer}`, `{protected}`.
//! Unknown placeholders are left as they are.

use std::{
    error::Error,
    fs,
    path::Path,
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex is valid"));

/// A system/user prompt pair.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptTemplate {
    pub system_prompt: String,
    pub user_prompt: String,
}

impl PromptTemplate {
    /// Substitute `{name}` placeholders in both prompts.
    ///
    /// Substitution is a single pass: placeholders inside substituted values
    /// are copied through literally.
    pub fn render(&self, values: &[(&str, &str)]) -> (String, String) {
        let fill = |text: &str| {
            PLACEHOLDER
                .replace_all(text, |caps: &Captures| {
                    values
                        .iter()
                        .find(|(name, _)| *name == &caps[1])
                        .map(|(_, value)| value.to_string())
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned()
        };
        (fill(&self.system_prompt), fill(&self.user_prompt))
    }

    /// Strict "use only this knowledge base, abstain if unsure" prompt.
    pub fn fallback_default() -> Self {
        Self {
            system_prompt: "Ты — бот техподдержки. Используй ТОЛЬКО эту базу знаний:\n\
                {knowledge}\n\
                Если не нашёл — скажи: \"Не нашёл точного решения. Опиши подробнее или обратись к модератору.\"\n\
                Отвечай кратко, по-русски, шаг за шагом."
                .to_string(),
            user_prompt: "Запрос: {question}".to_string(),
        }
    }

    /// Reword an answer without changing its facts.
    pub fn paraphrase_default() -> Self {
        Self {
            system_prompt: "Ты — редактор ответов техподдержки. Перефразируй ответ \
                понятнее и дружелюбнее. Не добавляй новых фактов, шагов и устройств. \
                Сохрани все числа, коды и названия без изменений. \
                Обязательно сохрани термины: {protected}."
                .to_string(),
            user_prompt: "Вопрос пользователя: {question}\nИсходный ответ: {answer}".to_string(),
        }
    }
}

/// Load a template by name from the user's config directory.
///
/// Resolves `<config_dir>/templates/<name>.yaml`.
pub fn load_template(name: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    let dir = crate::config_dir()?.join("templates");
    load_template_from(&dir, name)
}

/// Load `<dir>/<name>.yaml`.
pub fn load_template_from(dir: &Path, name: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    let path = dir.join(format!("{name}.yaml"));
    info!("Loading template: {}", path.display());

    let content = fs::read_to_string(path)?;
    let template: PromptTemplate = serde_yaml::from_str(&content)?;
    Ok(template)
}

/// [`load_template`], falling back to `default` when the file is missing or invalid.
pub fn load_or_default(name: &str, default: PromptTemplate) -> PromptTemplate {
    match load_template(name) {
        Ok(template) => template,
        Err(err) => {
            warn!("template {name} unavailable ({err}); using built-in default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_render_fills_placeholders() {
        let template = PromptTemplate::fallback_default();
        let (system, user) = template.render(&[
            ("knowledge", "Проблема: a\nРешение: b"),
            ("question", "касса не включается"),
        ]);
        assert!(system.contains("Проблема: a\nРешение: b"));
        assert!(!system.contains("{knowledge}"));
        assert_eq!(user, "Запрос: касса не включается");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let template = PromptTemplate {
            system_prompt: "{a} {b}".into(),
            user_prompt: "{a}".into(),
        };
        let (system, user) = template.render(&[("a", "1")]);
        assert_eq!(system, "1 {b}");
        assert_eq!(user, "1");
    }

    #[test]
    fn test_render_does_not_expand_placeholders_in_values() {
        let template = PromptTemplate::paraphrase_default();
        let (system, user) = template.render(&[
            ("question", "что значит {answer}?"),
            ("answer", "Введите {protected} в поле"),
            ("protected", "касс"),
        ]);
        assert!(system.contains("Обязательно сохрани термины: касс."));
        assert_eq!(
            user,
            "Вопрос пользователя: что значит {answer}?\nИсходный ответ: Введите {protected} в поле"
        );
    }

    #[test]
    fn test_load_template_valid_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("fallback.yaml"),
            "system_prompt: \"Base: {knowledge}\"\nuser_prompt: \"Q: {question}\"\n",
        )
        .unwrap();

        let template = load_template_from(dir.path(), "fallback").unwrap();
        assert_eq!(template.system_prompt, "Base: {knowledge}");
        assert_eq!(template.user_prompt, "Q: {question}");
    }

    #[test]
    fn test_load_template_invalid_file() {
        let dir = tempdir().unwrap();
        assert!(load_template_from(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_load_template_invalid_format() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.yaml"), "invalid: template: format").unwrap();
        assert!(load_template_from(dir.path(), "broken").is_err());
    }

    #[test]
    fn test_defaults_serialize() {
        let yaml = serde_yaml::to_string(&PromptTemplate::paraphrase_default()).unwrap();
        let parsed: PromptTemplate = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, PromptTemplate::paraphrase_default());
    }
}
