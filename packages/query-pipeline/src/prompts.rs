//! Prompt templates for classification, integration, and answer synthesis.
//!
//! Templates use `{placeholder}` substitution. Per-intent answer templates
//! live in [`PromptTemplates`], which may deliberately omit intents; the
//! generation stage treats a missing template as a configuration failure.

use std::collections::HashMap;

use crate::types::generation::GenerationInput;
use crate::types::intent::{Intent, IntentRegistry};

/// System prompt header for intent classification.
const CLASSIFY_HEADER: &str = r#"你是北京大学体育智能助手的意图分类器。根据用户输入，从下列意图中选择最合适的一个。

可选意图："#;

const CLASSIFY_FOOTER: &str = r#"
如果都不合适，意图为 "unrecognized"。

只输出 JSON，不要输出其他内容：
{"intent": "意图标识", "confidence": 0.0到1.0之间的数字, "entities": {"实体名": "实体值"}}"#;

/// Build the classifier system prompt from the registry.
pub fn classification_system_prompt(registry: &IntentRegistry) -> String {
    let mut prompt = String::from(CLASSIFY_HEADER);
    for def in registry.entries() {
        prompt.push_str(&format!(
            "\n- {} ({}): {}",
            def.intent.as_str(),
            def.name,
            def.description
        ));
        if !def.examples.is_empty() {
            prompt.push_str(&format!("\n  示例：{}", def.examples.join("；")));
        }
    }
    prompt.push_str(CLASSIFY_FOOTER);
    prompt
}

/// Prompt merging knowledge, API and web material into one payload.
pub const INTEGRATION_PROMPT: &str = r#"请整合以下检索到的资料，回答用户问题所需的信息。

用户问题：{query}
意图：{intent}

知识库资料：
{kb_data}

外部接口数据：
{api_data}

网络搜索结果：
{web_data}

以知识库资料为准；知识库没有相关内容时才使用网络搜索结果。不要编造信息。

只输出 JSON：
{"content": "整合后的信息", "key_points": ["要点"], "confidence": 0.0到1.0}"#;

/// Prompt rewriting a user question into a web search query.
pub const SEARCH_REWRITE_PROMPT: &str = r#"把下面的问题改写成适合搜索引擎的简洁查询，加上"北京大学"等必要的限定词。只输出查询语句本身。

问题：{query}"#;

/// System instruction for answer synthesis.
pub const ANSWER_SYSTEM_PROMPT: &str = "你是北京大学体育部的智能助手，回答准确、简洁、友好。只根据提供的资料回答，资料不足时如实说明。";

const ANSWER_FORMAT: &str = r#"
只输出 JSON：
{"answer": "给用户的回答", "media": [{"type": "image", "url": "图片地址", "caption": "说明"}], "sources": ["来源"], "related_queries": ["用户可能追问的问题"]}"#;

/// Prompt regenerating an answer from user suggestions.
pub const REVISION_PROMPT: &str = r#"用户对之前的回答提出了修改意见，请据此改进回答。

用户问题：{query}

原回答：
{previous_answer}

用户意见：
{suggestions}

参考资料：
{context}
"#;

/// Substitute `{key}` placeholders.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

fn pretty(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Per-intent answer templates.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    templates: HashMap<Intent, String>,
}

impl PromptTemplates {
    /// An empty set: every intent is unconfigured.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn with_template(mut self, intent: Intent, template: impl Into<String>) -> Self {
        self.templates.insert(intent, template.into());
        self
    }

    pub fn without(mut self, intent: Intent) -> Self {
        self.templates.remove(&intent);
        self
    }

    pub fn get(&self, intent: Intent) -> Option<&str> {
        self.templates.get(&intent).map(String::as_str)
    }

    /// Render the answer prompt for an input, if a template exists.
    pub fn render_answer(&self, input: &GenerationInput) -> Option<String> {
        let template = self.get(input.intent)?;
        let mut prompt = render(
            template,
            &[
                ("query", input.query.as_str()),
                ("intent", input.intent.as_str()),
                ("entities", pretty(&input.entities).as_str()),
                ("context", pretty(&input.retrieved).as_str()),
                ("sources", input.sources.join("、").as_str()),
                ("enrichments", pretty(&input.enrichments).as_str()),
            ],
        );
        if input.is_web_fallback {
            prompt.push_str("\n注意：以上资料来自网络搜索，请提醒用户核实。");
        }
        prompt.push_str(ANSWER_FORMAT);
        Some(prompt)
    }

    /// Render the revision prompt for a previous answer.
    pub fn render_revision(
        &self,
        input: &GenerationInput,
        previous_answer: &str,
        suggestions: &str,
    ) -> String {
        let mut prompt = render(
            REVISION_PROMPT,
            &[
                ("query", input.query.as_str()),
                ("previous_answer", previous_answer),
                ("suggestions", suggestions),
                ("context", pretty(&input.retrieved).as_str()),
            ],
        );
        prompt.push_str(ANSWER_FORMAT);
        prompt
    }
}

impl Default for PromptTemplates {
    fn default() -> Self {
        const COMMON: &str = "\n用户问题：{query}\n识别到的信息：{entities}\n参考资料：\n{context}\n资料来源：{sources}\n";
        Self::empty()
            .with_template(
                Intent::FacilityQuery,
                format!("用户在询问体育场馆信息（开放时间、位置、预约方式）。给出具体时间和预约步骤，如有场馆图片请附上。{COMMON}"),
            )
            .with_template(
                Intent::EventQuery,
                format!("用户在询问体育赛事或活动。说明时间、地点、报名方式或结果。{COMMON}"),
            )
            .with_template(
                Intent::CourseInfo,
                format!("用户在询问体育课程。说明上课时间、地点、任课老师和选课方式。{COMMON}"),
            )
            .with_template(
                Intent::PhysicalTest,
                format!("用户在询问体质测试。说明项目、评分标准和训练建议。相关指标：{{enrichments}}{COMMON}"),
            )
            .with_template(
                Intent::Feedback,
                format!("用户在提交反馈。先致谢，再说明反馈处理渠道和联系方式。反馈类型：{{enrichments}}{COMMON}"),
            )
            .with_template(
                Intent::HealthAdvice,
                format!("用户在寻求运动健康建议。给出循序渐进、安全可行的建议。用户目标：{{enrichments}}{COMMON}"),
            )
            .with_template(
                Intent::ExtraExercise,
                format!("用户在询问课外锻炼（85km、PKU Runner、乐动力）。说明要求、规则或软件问题的解决办法。{COMMON}"),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::intent::IntentResult;
    use crate::types::retrieval::{RetrievalResult, RetrievalStatus};

    #[test]
    fn test_classification_prompt_lists_registry() {
        let prompt = classification_system_prompt(&IntentRegistry::default());
        for intent in Intent::REGISTERED {
            assert!(prompt.contains(intent.as_str()), "missing {intent}");
        }
        assert!(prompt.contains("unrecognized"));
    }

    #[test]
    fn test_render_substitutes() {
        let out = render("Q: {query} / {query}", &[("query", "体测")]);
        assert_eq!(out, "Q: 体测 / 体测");
    }

    #[test]
    fn test_default_templates_cover_registry() {
        let templates = PromptTemplates::default();
        for intent in Intent::REGISTERED {
            assert!(templates.get(intent).is_some(), "missing template for {intent}");
        }
        assert!(templates.get(Intent::Unrecognized).is_none());
    }

    #[test]
    fn test_render_answer_includes_query_and_enrichments() {
        let intent = IntentResult::new("s", Intent::Feedback, 0.9);
        let retrieval = RetrievalResult::with_status("s", RetrievalStatus::Success, "");
        let input = GenerationInput::from_stages(&intent, "前台态度差，我要投诉", &retrieval);
        let prompt = PromptTemplates::default().render_answer(&input).unwrap();
        assert!(prompt.contains("前台态度差，我要投诉"));
        assert!(prompt.contains("complaint"));
        assert!(!prompt.contains("{query}"));
    }

    #[test]
    fn test_missing_template_renders_none() {
        let intent = IntentResult::new("s", Intent::CourseInfo, 0.9);
        let input = GenerationInput::without_retrieval(&intent, "游泳课在哪上");
        let templates = PromptTemplates::default().without(Intent::CourseInfo);
        assert!(templates.render_answer(&input).is_none());
    }
}
